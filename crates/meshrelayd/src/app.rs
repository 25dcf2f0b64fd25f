//! Central daemon application — coordinates all subsystems.
//!
//! `Daemon` is the heart of the daemon. It owns the peer registry, the
//! chat front end, the admin-service client, and the three sockets (chat
//! TCP listener, mesh UDP socket, admin UDP socket), and runs the single
//! event loop that ties them together:
//!
//! - **Chat sessions**: lines from local IRC-protocol clients
//! - **Mesh datagrams**: events from other overlay peers
//! - **Admin replies**: routing-table pages from the local overlay daemon
//! - **Timers**: liveness service ticks and periodic peer discovery
//!
//! # Event Loop Architecture
//!
//! The main loop uses `tokio::select!` to multiplex over all event sources.
//! `PeerRegistry` and `ChatServer` are both pure state machines that return
//! intents (`PeerAction`, `ChatOutcome`) rather than acting on sockets or
//! calling each other directly; this loop is the only place those intents
//! are interpreted and carried out, which keeps every mutation on a single
//! task even though session I/O is spread across spawned tasks for
//! backpressure.
//!
//! ```text
//! loop {
//!     select! {
//!         chat_event => handle_line / add_session / remove_session, then
//!                       relay any ChatOutcome to the mesh
//!         mesh_datagram => peer_registry.handle_datagram, then apply
//!                          each PeerAction (greet or deliver to chat)
//!         admin_reply => admin_client.handle_reply, register discoveries
//!         service_tick => peer_registry.service_tick, apply actions
//!         fetch_tick => send the next admin dumpTable request
//!     }
//! }
//! ```

use crate::admin_client::AdminClient;
use crate::chat_server::{ChatOutcome, ChatServer};
use crate::peer_registry::{DeliverEvent, PeerAction, PeerRegistry};
use meshrelay_core::types::Address;
use meshrelay_core::wire::{WireEvent, PACKET_LEN};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// How often `PeerRegistry::service_tick` is invoked. Distinct from (and
/// much shorter than) the per-peer `PING_INTERVAL`/`TIMEOUT`/
/// `RETRY_INTERVAL` thresholds it checks against.
pub const SERVICE_INTERVAL: Duration = Duration::from_secs(60);

/// How often a fresh admin `NodeStore_dumpTable` fetch cycle is started
/// (a page-0 request). Further pages within one cycle are requested as
/// soon as the previous page's reply reports `more`.
pub const PEER_FETCH_INTERVAL: Duration = Duration::from_secs(600);

/// One local chat client connection's worth of events, forwarded from its
/// reader task to the daemon's main loop.
#[derive(Debug)]
pub enum ChatEvent {
    Connected {
        id: u64,
        peer_addr: String,
        outbound: mpsc::Sender<Vec<u8>>,
    },
    Line {
        id: u64,
        line: String,
    },
    Disconnected {
        id: u64,
    },
}

pub struct Daemon {
    nick: String,
    host: String,
    peer_registry: PeerRegistry,
    chat_server: ChatServer,
    admin_client: AdminClient,
}

impl Daemon {
    pub fn new(nick: String, my_address: Address, mesh_port: u16) -> Self {
        let host = my_address.as_str().to_string();
        Self {
            nick,
            host,
            peer_registry: PeerRegistry::new(mesh_port, Some(my_address)),
            chat_server: ChatServer::new(),
            admin_client: AdminClient::new(),
        }
    }

    /// Runs the main event loop. Blocks until `shutdown_rx` fires.
    pub async fn run(
        &mut self,
        mut chat_rx: mpsc::Receiver<ChatEvent>,
        mesh_socket: UdpSocket,
        admin_socket: UdpSocket,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut service_interval = tokio::time::interval(SERVICE_INTERVAL);
        let mut fetch_interval = tokio::time::interval(PEER_FETCH_INTERVAL);
        let mut mesh_buf = vec![0u8; PACKET_LEN];
        let mut admin_buf = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                Some(event) = chat_rx.recv() => {
                    self.handle_chat_event(event, &mesh_socket).await;
                }

                Ok((len, from)) = mesh_socket.recv_from(&mut mesh_buf) => {
                    self.handle_mesh_datagram(from, &mesh_buf[..len], &mesh_socket).await;
                }

                Ok((len, _from)) = admin_socket.recv_from(&mut admin_buf) => {
                    self.handle_admin_reply(&admin_buf[..len], &admin_socket).await;
                }

                _ = service_interval.tick() => {
                    self.run_service_tick(&mesh_socket).await;
                }

                _ = fetch_interval.tick() => {
                    self.admin_client = AdminClient::new();
                    self.send_admin_request(&admin_socket).await;
                }

                _ = shutdown_rx.recv() => {
                    debug!("shutdown signal received, stopping daemon");
                    break;
                }
            }
        }
    }

    async fn handle_chat_event(&mut self, event: ChatEvent, mesh_socket: &UdpSocket) {
        match event {
            ChatEvent::Connected { id, peer_addr, outbound } => {
                self.chat_server.add_session(id, peer_addr, outbound);
            }
            ChatEvent::Line { id, line } => {
                let mut nick = self.nick.clone();
                let outcomes = self.chat_server.handle_line(id, &line, &mut nick, &self.host);
                self.nick = nick;
                for outcome in outcomes {
                    self.relay_outcome(outcome, mesh_socket).await;
                }
            }
            ChatEvent::Disconnected { id } => {
                let outcomes = self.chat_server.handle_disconnect(id, &self.nick, &self.host);
                for outcome in outcomes {
                    self.relay_outcome(outcome, mesh_socket).await;
                }
            }
        }
    }

    /// Translates a local command outcome into a mesh broadcast, if the
    /// wire protocol has a corresponding event. `LocalQuit` has no wire
    /// counterpart — the protocol carries no explicit leave/quit tag, so a
    /// local disconnect is only ever observed by peers via a liveness
    /// timeout.
    async fn relay_outcome(&self, outcome: ChatOutcome, mesh_socket: &UdpSocket) {
        let event = match outcome {
            ChatOutcome::LocalJoin { channel } => Some(WireEvent::Join {
                channel,
                nick: self.nick.clone(),
            }),
            ChatOutcome::LocalPart { channel, reason } => Some(WireEvent::Part { channel, reason }),
            ChatOutcome::LocalMsg { channel, text } => Some(WireEvent::Msg { channel, text }),
            ChatOutcome::LocalNotice { channel, text } => Some(WireEvent::Notice { channel, text }),
            ChatOutcome::LocalNickChange { new, .. } => Some(WireEvent::Nick { new_nick: new }),
            ChatOutcome::LocalQuit { .. } => None,
        };
        if let Some(event) = event {
            self.broadcast_to_mesh(&event, mesh_socket).await;
        }
    }

    async fn broadcast_to_mesh(&self, event: &WireEvent, mesh_socket: &UdpSocket) {
        let payload = event.encode();
        for addr in self.peer_registry.active_peer_addresses() {
            if let Err(err) = mesh_socket.send_to(&payload, addr).await {
                warn!(peer = %addr, error = %err, "failed to send mesh datagram");
            }
        }
    }

    async fn handle_mesh_datagram(&mut self, from: SocketAddr, bytes: &[u8], mesh_socket: &UdpSocket) {
        let actions = self.peer_registry.handle_datagram(from, bytes, Instant::now());
        for action in actions {
            self.apply_peer_action(action, mesh_socket).await;
        }
    }

    async fn run_service_tick(&mut self, mesh_socket: &UdpSocket) {
        let actions = self.peer_registry.service_tick(Instant::now());
        for action in actions {
            self.apply_peer_action(action, mesh_socket).await;
        }
    }

    async fn apply_peer_action(&mut self, action: PeerAction, mesh_socket: &UdpSocket) {
        match action {
            PeerAction::Greet { to } => {
                let greeting = WireEvent::Greeting {
                    nick: self.nick.clone(),
                    channels: self.chat_server.get_joined_channels(),
                };
                let payload = greeting.encode();
                if let Err(err) = mesh_socket.send_to(&payload, to).await {
                    warn!(peer = %to, error = %err, "failed to send greeting");
                }
            }
            PeerAction::Deliver(event) => self.deliver_to_chat(event),
        }
    }

    fn deliver_to_chat(&mut self, event: DeliverEvent) {
        match event {
            DeliverEvent::Join { channel, peer_nick, peer_host } => {
                self.chat_server.deliver_join(&channel, &peer_nick, &peer_host);
            }
            DeliverEvent::Part { channel, peer_nick, reason } => {
                self.chat_server.deliver_part(&channel, &peer_nick, &reason);
            }
            DeliverEvent::Quit { peer_nick, peer_host, reason } => {
                self.chat_server.deliver_quit(&peer_nick, &peer_host, &reason);
            }
            DeliverEvent::Msg { channel, peer_nick, text } => {
                self.chat_server.deliver_msg(&channel, &peer_nick, &text);
            }
            DeliverEvent::Notice { channel, peer_nick, text } => {
                self.chat_server.deliver_notice(&channel, &peer_nick, &text);
            }
            DeliverEvent::Nick { old, new } => {
                self.chat_server.deliver_nick(&old, &new);
            }
        }
    }

    async fn handle_admin_reply(&mut self, bytes: &[u8], admin_socket: &UdpSocket) {
        let outcome = self.admin_client.handle_reply(bytes);
        for raw in outcome.discovered {
            if self.peer_registry.on_discovered_address(&raw) {
                trace!(address = %raw, "discovered mesh peer");
            }
        }
        if outcome.fetch_more {
            self.send_admin_request(admin_socket).await;
        }
    }

    async fn send_admin_request(&self, admin_socket: &UdpSocket) {
        let request = self.admin_client.build_request();
        if let Err(err) = admin_socket.send(&request).await {
            warn!(error = %err, "failed to send admin request");
        }
    }
}
