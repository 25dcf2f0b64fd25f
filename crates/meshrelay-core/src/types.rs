//! Domain types for the mesh chat relay.
//!
//! All core identifiers are defined here as **newtypes** — thin wrappers
//! around primitive types that give them distinct identities in the type
//! system. This prevents accidentally passing a raw, uncanonicalized
//! address string where a canonical [`Address`] is expected, which would
//! compile fine if both were plain `String`s.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv6Addr, SocketAddr};
use std::time::Instant;

// ---------------------------------------------------------------------------
// Address — a canonical mesh (overlay) address
// ---------------------------------------------------------------------------

/// A canonical textual mesh address.
///
/// Canonicalization is performed exactly once, by parsing the input as an
/// IPv6 address (the overlay's address family) and re-emitting it in
/// `Ipv6Addr`'s canonical textual form. This is the sole key used for peer
/// lookup: two addresses are equal iff their canonical forms are
/// byte-equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(String);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("'{0}' is not a valid mesh address")]
    Malformed(String),
}

impl Address {
    /// Parses and canonicalizes a textual mesh address.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let addr: Ipv6Addr = raw
            .trim()
            .parse()
            .map_err(|_| AddressError::Malformed(raw.to_string()))?;
        Ok(Self(addr.to_string()))
    }

    /// Returns the canonical address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds the peer's mesh socket address by pairing this address with
    /// the fixed mesh UDP port.
    pub fn socket_address(&self, mesh_port: u16) -> SocketAddr {
        let addr: Ipv6Addr = self.0.parse().expect("Address always holds a valid IPv6 form");
        SocketAddr::new(addr.into(), mesh_port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PeerStatus — liveness state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Unknown,
    Contacted,
    Active,
    Inactive,
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// A remote node on the mesh, keyed in the registry by its canonical
/// [`Address`].
#[derive(Debug, Clone)]
pub struct Peer {
    pub address: Address,
    pub socket_address: SocketAddr,
    pub status: PeerStatus,
    /// Monotonic time of the most recent well-formed inbound datagram.
    pub last_message_at: Option<Instant>,
    /// Monotonic time of the most recent greeting we sent.
    pub last_greeted_at: Option<Instant>,
    /// Short display name, learned from greetings.
    pub nick: Option<String>,
    /// True iff this peer's canonical address equals our own. Self peers
    /// are never greeted, serviced, or counted as active.
    pub is_self: bool,
    /// Channels this peer is believed to have joined, as last announced
    /// via a greeting or JOIN event. Used only to re-key on NICK; the
    /// chat-facing channel membership lives in `ChatServer`'s own tables.
    pub channels: Vec<String>,
}

impl Peer {
    pub fn new(address: Address, mesh_port: u16, is_self: bool) -> Self {
        let socket_address = address.socket_address(mesh_port);
        Self {
            address,
            socket_address,
            status: PeerStatus::Unknown,
            last_message_at: None,
            last_greeted_at: None,
            nick: None,
            is_self,
            channels: Vec::new(),
        }
    }

    /// Display name for this peer, falling back to its address when no
    /// nick has been learned yet.
    pub fn display_nick(&self) -> &str {
        self.nick.as_deref().unwrap_or_else(|| self.address.as_str())
    }
}

// ---------------------------------------------------------------------------
// ChannelName — validated channel identifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelName(String);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ChannelNameError {
    #[error("channel name cannot be empty")]
    Empty,
    #[error("channel name must start with one of '#', '+', '&', '!'")]
    MissingPrefix,
    #[error("channel name cannot exceed {max} bytes (got {got})")]
    TooLong { max: usize, got: usize },
}

impl ChannelName {
    pub const MAX_LENGTH: usize = 50;

    pub fn new(name: impl Into<String>) -> Result<Self, ChannelNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ChannelNameError::Empty);
        }
        if !matches!(name.as_bytes()[0], b'#' | b'+' | b'&' | b'!') {
            return Err(ChannelNameError::MissingPrefix);
        }
        if name.len() > Self::MAX_LENGTH {
            return Err(ChannelNameError::TooLong {
                max: Self::MAX_LENGTH,
                got: name.len(),
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// User — a channel member view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub nick: String,
    pub host: String,
    pub is_self: bool,
}

impl User {
    pub fn new(nick: impl Into<String>, host: impl Into<String>, is_self: bool) -> Self {
        Self {
            nick: nick.into(),
            host: host.into(),
            is_self,
        }
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A channel table entry. Once created it is never garbage-collected,
/// matching the observed behavior of the original relay.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: ChannelName,
    pub topic: Option<String>,
    members: BTreeMap<String, User>,
    /// Whether the local client considers itself joined to this channel.
    pub joined: bool,
}

impl Channel {
    pub fn new(name: ChannelName) -> Self {
        Self {
            name,
            topic: None,
            members: BTreeMap::new(),
            joined: false,
        }
    }

    /// Adds `user`, keyed by nick. Idempotent: adding a user already
    /// present by nick is a no-op and returns `false` ("not added").
    pub fn add_member(&mut self, user: User) -> bool {
        if self.members.contains_key(&user.nick) {
            return false;
        }
        self.members.insert(user.nick.clone(), user);
        true
    }

    /// Removes the member with the given nick. Returns `false`
    /// ("not removed") if no such member was present.
    pub fn remove_member(&mut self, nick: &str) -> bool {
        self.members.remove(nick).is_some()
    }

    /// Renames a member in place, preserving membership under the new key.
    /// No-op if the old nick is not a member.
    pub fn rekey_member(&mut self, old_nick: &str, new_nick: &str) {
        if let Some(mut user) = self.members.remove(old_nick) {
            user.nick = new_nick.to_string();
            self.members.insert(new_nick.to_string(), user);
        }
    }

    pub fn members(&self) -> impl Iterator<Item = &User> {
        self.members.values()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn has_member(&self, nick: &str) -> bool {
        self.members.contains_key(nick)
    }
}

// ---------------------------------------------------------------------------
// Session — per local client connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Initializing,
    Initialized,
}

/// The maximum accumulated bytes a session's line-reassembly buffer may
/// hold before it is considered overflowed.
pub const SESSION_BUFFER_CAP: usize = 512;

/// Per-connection state. Outbound identity (nick, realname) is node-global
/// and lives on the daemon/config, not here; a `Session` only tracks
/// connection-local bookkeeping.
#[derive(Debug, Clone)]
pub struct Session {
    pub mode: SessionMode,
    pub input_buffer: Vec<u8>,
    /// Loopback peer address of the connected client, for display only.
    pub peer_address: String,
    pub nick_seen: bool,
    pub user_seen: bool,
}

impl Session {
    pub fn new(peer_address: impl Into<String>) -> Self {
        Self {
            mode: SessionMode::Initializing,
            input_buffer: Vec::new(),
            peer_address: peer_address.into(),
            nick_seen: false,
            user_seen: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.mode == SessionMode::Initialized
    }

    /// Call after observing both NICK and USER; transitions to
    /// `Initialized` and reports whether this call was the one that
    /// crossed the threshold (i.e. whether the welcome sequence should
    /// fire now).
    pub fn mark_ready_if_complete(&mut self) -> bool {
        if self.mode == SessionMode::Initializing && self.nick_seen && self.user_seen {
            self.mode = SessionMode::Initialized;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_canonicalizes_equivalent_forms() {
        let a = Address::parse("fc00:0:0:0:0:0:0:1").unwrap();
        let b = Address::parse("fc00::1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "fc00::1");
    }

    #[test]
    fn address_rejects_garbage() {
        assert!(Address::parse("not-an-address").is_err());
    }

    #[test]
    fn address_socket_address_uses_mesh_port() {
        let addr = Address::parse("fc00::2").unwrap();
        let sock = addr.socket_address(14627);
        assert_eq!(sock.port(), 14627);
    }

    #[test]
    fn channel_name_requires_prefix() {
        assert!(ChannelName::new("#general").is_ok());
        assert!(ChannelName::new("+general").is_ok());
        assert!(ChannelName::new("general").is_err());
        assert!(ChannelName::new("").is_err());
    }

    #[test]
    fn channel_add_member_idempotent() {
        let mut channel = Channel::new(ChannelName::new("#x").unwrap());
        let user = User::new("bob", "fc00::2", false);
        assert!(channel.add_member(user.clone()));
        assert!(!channel.add_member(user));
        assert_eq!(channel.member_count(), 1);
    }

    #[test]
    fn channel_remove_member_reports_absence() {
        let mut channel = Channel::new(ChannelName::new("#x").unwrap());
        assert!(!channel.remove_member("nobody"));
        channel.add_member(User::new("bob", "fc00::2", false));
        assert!(channel.remove_member("bob"));
        assert!(!channel.remove_member("bob"));
    }

    #[test]
    fn channel_rekey_member_preserves_membership() {
        let mut channel = Channel::new(ChannelName::new("#x").unwrap());
        channel.add_member(User::new("bob", "fc00::2", false));
        channel.rekey_member("bob", "bobby");
        assert!(!channel.has_member("bob"));
        assert!(channel.has_member("bobby"));
    }

    #[test]
    fn session_welcome_fires_once_both_seen() {
        let mut session = Session::new("fc00::1");
        session.nick_seen = true;
        assert!(!session.mark_ready_if_complete());
        session.user_seen = true;
        assert!(session.mark_ready_if_complete());
        assert!(session.is_initialized());
        // Calling again after already initialized must not re-fire.
        assert!(!session.mark_ready_if_complete());
    }

    #[test]
    fn peer_display_nick_falls_back_to_address() {
        let peer = Peer::new(Address::parse("fc00::3").unwrap(), 14627, false);
        assert_eq!(peer.display_nick(), "fc00::3");
    }
}
