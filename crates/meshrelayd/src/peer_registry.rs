//! Peer registry and liveness state machine.
//!
//! Owns every known peer, keyed by canonical mesh [`Address`]. This module
//! is deliberately free of any socket or task handling: it decides *what*
//! should happen (send a greeting, deliver an event to the chat front end)
//! and returns that decision as a [`PeerAction`] for the daemon's event
//! loop to carry out. Keeping the state machine pure makes it directly
//! testable with a synthetic clock instead of real sockets and sleeps.

use meshrelay_core::types::{Address, AddressError, Peer, PeerStatus};
use meshrelay_core::wire::{WireError, WireEvent};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const PING_INTERVAL: Duration = Duration::from_secs(20);
pub const TIMEOUT: Duration = Duration::from_secs(60);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(900);

/// An event PeerRegistry wants delivered to the chat front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliverEvent {
    Join {
        channel: String,
        peer_nick: String,
        peer_host: String,
    },
    Part {
        channel: String,
        peer_nick: String,
        reason: String,
    },
    Quit {
        peer_nick: String,
        peer_host: String,
        reason: String,
    },
    Msg {
        channel: String,
        peer_nick: String,
        text: String,
    },
    Notice {
        channel: String,
        peer_nick: String,
        text: String,
    },
    Nick {
        old: String,
        new: String,
    },
}

/// A side effect the daemon's event loop must carry out. PeerRegistry
/// never touches a socket directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    /// Send a greeting (tag + our nick + our joined channels) to this peer.
    /// The registry doesn't know the chat front end's joined-channel list,
    /// so it asks the daemon to build and send the payload.
    Greet { to: SocketAddr },
    /// Hand an already-decoded mesh event up to the chat front end.
    Deliver(DeliverEvent),
}

pub struct PeerRegistry {
    mesh_port: u16,
    my_address: Option<Address>,
    peers: HashMap<Address, Peer>,
}

impl PeerRegistry {
    pub fn new(mesh_port: u16, my_address: Option<Address>) -> Self {
        Self {
            mesh_port,
            my_address,
            peers: HashMap::new(),
        }
    }

    pub fn peer(&self, address: &Address) -> Option<&Peer> {
        self.peers.get(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn is_self(&self, address: &Address) -> bool {
        self.my_address.as_ref() == Some(address)
    }

    fn get_or_insert(&mut self, address: Address) -> &mut Peer {
        let is_self = self.is_self(&address);
        self.peers
            .entry(address.clone())
            .or_insert_with(|| Peer::new(address, self.mesh_port, is_self))
    }

    /// Registers a mesh address discovered via the admin service. Returns
    /// `true` if this created a new peer record. Idempotent: calling this
    /// repeatedly for the same address never resets an existing peer's
    /// status (property S3 in the testable-properties list).
    pub fn on_discovered_address(&mut self, raw: &str) -> bool {
        let address = match Address::parse(raw) {
            Ok(addr) => addr,
            Err(AddressError::Malformed(bad)) => {
                warn!(address = %bad, "discarding malformed discovered address");
                return false;
            }
        };
        if self.peers.contains_key(&address) {
            return false;
        }
        self.get_or_insert(address);
        true
    }

    /// Runs one liveness-service tick across every non-self peer, per the
    /// state table: UNKNOWN peers are greeted; ACTIVE peers are re-greeted
    /// past `PING_INTERVAL` or timed out past `TIMEOUT`; INACTIVE peers are
    /// retried past `RETRY_INTERVAL`.
    pub fn service_tick(&mut self, now: Instant) -> Vec<PeerAction> {
        let mut actions = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.is_self {
                continue;
            }
            match peer.status {
                PeerStatus::Unknown => {
                    peer.status = PeerStatus::Contacted;
                    peer.last_greeted_at = Some(now);
                    peer.last_message_at = Some(now);
                    actions.push(PeerAction::Greet {
                        to: peer.socket_address,
                    });
                }
                PeerStatus::Active => {
                    let timed_out = peer
                        .last_message_at
                        .map(|t| now.duration_since(t) > TIMEOUT)
                        .unwrap_or(true);
                    if timed_out {
                        peer.status = PeerStatus::Inactive;
                        actions.push(PeerAction::Deliver(DeliverEvent::Quit {
                            peer_nick: peer.display_nick().to_string(),
                            peer_host: peer.address.to_string(),
                            reason: "Timed out".to_string(),
                        }));
                        continue;
                    }
                    let stale_greeting = peer
                        .last_greeted_at
                        .map(|t| now.duration_since(t) > PING_INTERVAL)
                        .unwrap_or(true);
                    if stale_greeting {
                        peer.last_greeted_at = Some(now);
                        actions.push(PeerAction::Greet {
                            to: peer.socket_address,
                        });
                    }
                }
                PeerStatus::Inactive => {
                    let retry_due = peer
                        .last_greeted_at
                        .map(|t| now.duration_since(t) > RETRY_INTERVAL)
                        .unwrap_or(true);
                    if retry_due {
                        peer.status = PeerStatus::Contacted;
                        peer.last_greeted_at = Some(now);
                        actions.push(PeerAction::Greet {
                            to: peer.socket_address,
                        });
                    }
                }
                PeerStatus::Contacted => {
                    // Waiting for an inbound datagram; nothing to do until
                    // one arrives or the caller re-greets via ACTIVE logic
                    // once it does.
                }
            }
        }
        actions
    }

    /// Processes one inbound mesh datagram from `from`. Returns the
    /// resulting actions (a reply greeting and/or a delivery to the chat
    /// front end). Malformed or unrecognized datagrams are dropped and
    /// yield no actions.
    pub fn handle_datagram(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) -> Vec<PeerAction> {
        let address = match Address::parse(&from.ip().to_string()) {
            Ok(addr) => addr,
            Err(_) => {
                warn!(from = %from, "datagram from unparseable address");
                return Vec::new();
            }
        };
        if self.is_self(&address) {
            return Vec::new();
        }

        let event = match WireEvent::decode(bytes).or_else(|err| {
            if matches!(err, WireError::Truncated) {
                WireEvent::decode_greeting_lenient(bytes).ok_or(err)
            } else {
                Err(err)
            }
        }) {
            Ok(event) => event,
            Err(err) => {
                trace!(from = %from, error = %err, "dropping unparseable mesh datagram");
                return Vec::new();
            }
        };

        let newly_inserted = !self.peers.contains_key(&address);
        let peer = self.get_or_insert(address.clone());
        if peer.is_self {
            return Vec::new();
        }
        peer.last_message_at = Some(now);
        peer.status = PeerStatus::Active;
        if newly_inserted {
            debug!(peer = %address, "registered peer from inbound datagram");
        }

        let mut actions = Vec::new();
        match event {
            WireEvent::Greeting { nick, channels } => {
                // Open question resolved: the greeting-provided nick is
                // authoritative. A later JOIN's nick field must not
                // override it.
                peer.nick = Some(nick.clone());
                peer.channels = channels.clone();
                for channel in channels {
                    actions.push(PeerAction::Deliver(DeliverEvent::Join {
                        channel,
                        peer_nick: nick.clone(),
                        peer_host: address.to_string(),
                    }));
                }
                let stale_greeting = peer
                    .last_greeted_at
                    .map(|t| now.duration_since(t) > PING_INTERVAL)
                    .unwrap_or(true);
                if stale_greeting {
                    peer.last_greeted_at = Some(now);
                    actions.push(PeerAction::Greet {
                        to: peer.socket_address,
                    });
                }
            }
            WireEvent::Msg { channel, text } => {
                actions.push(PeerAction::Deliver(DeliverEvent::Msg {
                    channel,
                    peer_nick: peer.display_nick().to_string(),
                    text,
                }));
            }
            WireEvent::Notice { channel, text } => {
                actions.push(PeerAction::Deliver(DeliverEvent::Notice {
                    channel,
                    peer_nick: peer.display_nick().to_string(),
                    text,
                }));
            }
            WireEvent::Join { channel, nick } => {
                // Greeting-provided nick wins; a differing JOIN nick is
                // used only for display if we have no nick on record yet.
                let display_nick = peer.nick.clone().unwrap_or(nick);
                if !peer.channels.iter().any(|c| c == &channel) {
                    peer.channels.push(channel.clone());
                }
                actions.push(PeerAction::Deliver(DeliverEvent::Join {
                    channel,
                    peer_nick: display_nick,
                    peer_host: address.to_string(),
                }));
            }
            WireEvent::Part { channel, reason } => {
                peer.channels.retain(|c| c != &channel);
                actions.push(PeerAction::Deliver(DeliverEvent::Part {
                    channel,
                    peer_nick: peer.display_nick().to_string(),
                    reason,
                }));
            }
            WireEvent::Nick { new_nick } => {
                let old_nick = peer.display_nick().to_string();
                peer.nick = Some(new_nick.clone());
                actions.push(PeerAction::Deliver(DeliverEvent::Nick {
                    old: old_nick,
                    new: new_nick,
                }));
            }
        }

        actions
    }

    /// Addresses of every peer currently ACTIVE — the audience for
    /// `broadcast_all`/`broadcast_channel` (the latter is, by design,
    /// identical to the former; see the design notes on per-channel
    /// restriction being a non-required future optimization).
    pub fn active_peer_addresses(&self) -> Vec<SocketAddr> {
        self.peers
            .values()
            .filter(|p| !p.is_self && p.status == PeerStatus::Active)
            .map(|p| p.socket_address)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: &str) -> Address {
        Address::parse(a).unwrap()
    }

    #[test]
    fn discovery_is_idempotent() {
        let mut reg = PeerRegistry::new(14627, None);
        assert!(reg.on_discovered_address("fc00::1"));
        assert!(!reg.on_discovered_address("fc00::1"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn discovery_skips_malformed() {
        let mut reg = PeerRegistry::new(14627, None);
        assert!(!reg.on_discovered_address("not-an-address"));
        assert!(reg.is_empty());
    }

    #[test]
    fn unknown_peer_is_greeted_on_first_tick() {
        let mut reg = PeerRegistry::new(14627, None);
        reg.on_discovered_address("fc00::1");
        let now = Instant::now();
        let actions = reg.service_tick(now);
        assert_eq!(
            actions,
            vec![PeerAction::Greet {
                to: addr("fc00::1").socket_address(14627)
            }]
        );
        assert_eq!(reg.peer(&addr("fc00::1")).unwrap().status, PeerStatus::Contacted);
    }

    #[test]
    fn discovery_does_not_reset_existing_status() {
        let mut reg = PeerRegistry::new(14627, None);
        reg.on_discovered_address("fc00::1");
        reg.service_tick(Instant::now());
        assert_eq!(reg.peer(&addr("fc00::1")).unwrap().status, PeerStatus::Contacted);
        reg.on_discovered_address("fc00::1");
        assert_eq!(reg.peer(&addr("fc00::1")).unwrap().status, PeerStatus::Contacted);
    }

    #[test]
    fn greeting_received_marks_active_and_delivers_joins() {
        let mut reg = PeerRegistry::new(14627, None);
        let from: SocketAddr = "[fc00::2]:14627".parse().unwrap();
        let payload = WireEvent::Greeting {
            nick: "bob".into(),
            channels: vec!["#x".into()],
        }
        .encode();
        let actions = reg.handle_datagram(from, &payload, Instant::now());
        assert!(actions.contains(&PeerAction::Deliver(DeliverEvent::Join {
            channel: "#x".into(),
            peer_nick: "bob".into(),
            peer_host: "fc00::2".into(),
        })));
        assert_eq!(reg.peer(&addr("fc00::2")).unwrap().status, PeerStatus::Active);
    }

    #[test]
    fn join_does_not_override_greeting_nick() {
        let mut reg = PeerRegistry::new(14627, None);
        let from: SocketAddr = "[fc00::2]:14627".parse().unwrap();
        let greeting = WireEvent::Greeting {
            nick: "bob".into(),
            channels: vec![],
        }
        .encode();
        reg.handle_datagram(from, &greeting, Instant::now());

        let join = WireEvent::Join {
            channel: "#y".into(),
            nick: "impostor".into(),
        }
        .encode();
        let actions = reg.handle_datagram(from, &join, Instant::now());
        assert!(actions.contains(&PeerAction::Deliver(DeliverEvent::Join {
            channel: "#y".into(),
            peer_nick: "bob".into(),
            peer_host: "fc00::2".into(),
        })));
        assert_eq!(reg.peer(&addr("fc00::2")).unwrap().nick.as_deref(), Some("bob"));
    }

    #[test]
    fn timeout_marks_inactive_and_synthesizes_quit() {
        let mut reg = PeerRegistry::new(14627, None);
        let from: SocketAddr = "[fc00::2]:14627".parse().unwrap();
        let greeting = WireEvent::Greeting {
            nick: "bob".into(),
            channels: vec![],
        }
        .encode();
        let t0 = Instant::now();
        reg.handle_datagram(from, &greeting, t0);
        assert_eq!(reg.peer(&addr("fc00::2")).unwrap().status, PeerStatus::Active);

        let later = t0 + TIMEOUT + Duration::from_secs(1);
        let actions = reg.service_tick(later);
        assert!(actions.contains(&PeerAction::Deliver(DeliverEvent::Quit {
            peer_nick: "bob".into(),
            peer_host: "fc00::2".into(),
            reason: "Timed out".into(),
        })));
        assert_eq!(reg.peer(&addr("fc00::2")).unwrap().status, PeerStatus::Inactive);
    }

    #[test]
    fn self_address_is_never_greeted() {
        let mut reg = PeerRegistry::new(14627, Some(addr("fc00::1")));
        reg.on_discovered_address("fc00::1");
        let actions = reg.service_tick(Instant::now());
        assert!(actions.is_empty());
    }

    #[test]
    fn active_peer_addresses_only_includes_active() {
        let mut reg = PeerRegistry::new(14627, None);
        let from: SocketAddr = "[fc00::2]:14627".parse().unwrap();
        reg.on_discovered_address("fc00::3"); // stays UNKNOWN until serviced
        let greeting = WireEvent::Greeting {
            nick: "bob".into(),
            channels: vec![],
        }
        .encode();
        reg.handle_datagram(from, &greeting, Instant::now());
        assert_eq!(reg.active_peer_addresses(), vec![from]);
    }

    #[test]
    fn unknown_tag_datagram_is_dropped() {
        let mut reg = PeerRegistry::new(14627, None);
        let from: SocketAddr = "[fc00::2]:14627".parse().unwrap();
        let actions = reg.handle_datagram(from, &[9, 1, 2], Instant::now());
        assert!(actions.is_empty());
        assert!(reg.is_empty());
    }
}
