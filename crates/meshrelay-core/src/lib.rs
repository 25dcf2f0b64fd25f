//! # meshrelay-core
//!
//! Shared library for the meshrelay chat relay.
//! Contains the self-describing wire codec, the mesh event wire format,
//! domain types for peers/channels/sessions, and configuration.
//!
//! This crate is used by the `meshrelayd` daemon binary.

pub mod bencode;
pub mod config;
pub mod types;
pub mod wire;
