//! Client for the overlay's local admin service.
//!
//! Speaks the self-describing codec over a datagram socket connected to
//! `127.0.0.1:<admin_port>`, paginating a routing-table dump and surfacing
//! each discovered address. This module builds request bytes and
//! interprets reply bytes; the daemon's event loop owns the actual socket
//! so that receiving an admin reply can be multiplexed with everything
//! else in one `select!`.

use meshrelay_core::bencode::{self, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Outcome of processing one admin-service reply datagram.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdminReplyOutcome {
    /// Mesh addresses found in this page's routing table, in reply order.
    /// Non-string or missing `ip` fields within an entry are skipped; they
    /// don't abort the rest of the page.
    pub discovered: Vec<String>,
    /// Whether the caller should immediately request the next page.
    pub fetch_more: bool,
}

pub struct AdminClient {
    page: i64,
}

impl AdminClient {
    pub fn new() -> Self {
        Self { page: 0 }
    }

    pub fn current_page(&self) -> i64 {
        self.page
    }

    /// Builds the bencode-encoded `NodeStore_dumpTable` request for the
    /// current page.
    pub fn build_request(&self) -> Vec<u8> {
        let mut args = BTreeMap::new();
        args.insert(b"page".to_vec(), Value::Integer(self.page));
        let mut request = BTreeMap::new();
        request.insert(b"args".to_vec(), Value::Dictionary(args));
        request.insert(b"q".to_vec(), Value::string("NodeStore_dumpTable"));
        bencode::encode(&Value::Dictionary(request))
    }

    /// Decodes and interprets one reply datagram. A decode failure or a
    /// reply missing `routingTable` is logged and treated as an empty,
    /// non-continuing page — the pagination state is left untouched so the
    /// next fetch cycle starts over cleanly.
    pub fn handle_reply(&mut self, bytes: &[u8]) -> AdminReplyOutcome {
        let value = match bencode::decode(bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "dropping malformed admin reply");
                return AdminReplyOutcome::default();
            }
        };

        let mut discovered = Vec::new();
        if let Some(table) = value.get("routingTable").and_then(Value::as_list) {
            for entry in table {
                match entry.get("ip").and_then(Value::as_str) {
                    Some(ip) => discovered.push(ip.to_string()),
                    None => debug!("routing table entry missing a string 'ip' field"),
                }
            }
        } else {
            warn!("admin reply missing 'routingTable'");
        }

        let more = value.get("more").and_then(Value::as_integer) == Some(1);
        if more {
            self.page += 1;
        } else {
            self.page = 0;
        }

        AdminReplyOutcome {
            discovered,
            fetch_more: more,
        }
    }
}

impl Default for AdminClient {
    fn default() -> Self {
        Self::new()
    }
}
