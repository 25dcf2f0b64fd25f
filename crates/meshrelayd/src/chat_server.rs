//! Line-oriented chat front end.
//!
//! Terminates local IRC-protocol client connections, maintains the
//! channel/user/session tables, and renders server-to-client replies. Like
//! [`crate::peer_registry`], this module returns intents ([`ChatOutcome`])
//! for events that must reach the mesh rather than reaching into
//! `PeerRegistry` directly — the daemon's event loop is the only place
//! that wires the two together, which keeps both sides unit-testable
//! without a running socket.

use meshrelay_core::types::{Channel, ChannelName, Session, User, SESSION_BUFFER_CAP};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// A line-framing failure: the session's input buffer grew past the cap
/// without finding a terminator. The caller must close the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineOverflow;

/// Accumulates `incoming` into `buffer` and extracts every complete line
/// (CRLF or bare LF terminated). Safe to call with one byte at a time or
/// with the whole read in one call — the result is identical either way.
pub fn extract_lines(buffer: &mut Vec<u8>, incoming: &[u8]) -> Result<Vec<String>, LineOverflow> {
    buffer.extend_from_slice(incoming);
    let mut lines = Vec::new();
    loop {
        let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let mut line_bytes: Vec<u8> = buffer.drain(..=newline_pos).collect();
        line_bytes.pop(); // drop '\n'
        if line_bytes.last() == Some(&b'\r') {
            line_bytes.pop();
        }
        lines.push(String::from_utf8_lossy(&line_bytes).into_owned());
    }
    if buffer.len() > SESSION_BUFFER_CAP {
        buffer.clear();
        return Err(LineOverflow);
    }
    Ok(lines)
}

/// A local command outcome that must be relayed to the mesh via
/// `PeerRegistry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    LocalJoin { channel: String },
    LocalPart { channel: String, reason: String },
    LocalMsg { channel: String, text: String },
    LocalNotice { channel: String, text: String },
    LocalNickChange { old: String, new: String },
    LocalQuit { reason: String },
}

struct SessionEntry {
    session: Session,
    outbound: mpsc::Sender<Vec<u8>>,
}

pub struct ChatServer {
    channels: HashMap<String, Channel>,
    sessions: HashMap<u64, SessionEntry>,
}

impl ChatServer {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn add_session(&mut self, id: u64, peer_address: String, outbound: mpsc::Sender<Vec<u8>>) {
        self.sessions.insert(
            id,
            SessionEntry {
                session: Session::new(peer_address),
                outbound,
            },
        );
    }

    pub fn remove_session(&mut self, id: u64) {
        self.sessions.remove(&id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The sole entry point for creating channel records; they are never
    /// garbage-collected once created.
    fn get_or_create_channel(&mut self, name: &str) -> &mut Channel {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(ChannelName::new(name).unwrap_or_else(|_| {
                // A mesh-originated channel name may violate the local
                // prefix convention; treat it as the generic '#' family so
                // it still has a renderable name.
                ChannelName::new(format!("#{name}")).expect("prefixed fallback is always valid")
            })))
    }

    pub fn get_joined_channels(&self) -> Vec<String> {
        self.channels
            .values()
            .filter(|c| c.joined)
            .map(|c| c.name.as_str().to_string())
            .collect()
    }

    fn send_line(&mut self, id: u64, line: &str) {
        let Some(entry) = self.sessions.get(&id) else {
            return;
        };
        let mut bytes = line.as_bytes().to_vec();
        let cap = SESSION_BUFFER_CAP - 2;
        if bytes.len() > cap {
            bytes.truncate(cap);
        }
        bytes.extend_from_slice(b"\r\n");
        // Bounded queue: a session that can't keep up has its datagram
        // dropped by hitting Full, at which point we drop the session
        // itself rather than let it buffer unboundedly.
        if entry.outbound.try_send(bytes).is_err() {
            debug!(session = id, "outbound queue full or closed, dropping session");
            self.sessions.remove(&id);
        }
    }

    fn broadcast_line(&mut self, line: &str) {
        let ids: Vec<u64> = self.sessions.keys().copied().collect();
        for id in ids {
            self.send_line(id, line);
        }
    }

    /// Handles one parsed client line. `nick` is the node-global nick
    /// (mutated in place by NICK); `host` is the node's own mesh address,
    /// used as both the server prefix and the local client's own prefix.
    pub fn handle_line(
        &mut self,
        id: u64,
        line: &str,
        nick: &mut String,
        host: &str,
    ) -> Vec<ChatOutcome> {
        let line = line.trim_end();
        if line.is_empty() {
            return Vec::new();
        }
        let (command, rest) = match line.split_once(' ') {
            Some((c, r)) => (c, r),
            None => (line, ""),
        };
        let command = command.to_ascii_uppercase();

        match command.as_str() {
            "NICK" => self.handle_nick(id, rest.trim(), nick, host),
            "USER" => self.handle_user(id, nick, host),
            "CAP" => {
                self.send_line(id, &format!(":{host} CAP * LS :"));
                Vec::new()
            }
            "JOIN" => self.handle_join(id, rest.trim(), nick, host),
            "PART" => self.handle_part(id, rest.trim(), nick, host),
            "TOPIC" => self.handle_topic(id, rest.trim(), nick, host),
            "PRIVMSG" => self.handle_privmsg(id, rest, nick, host, false),
            "NOTICE" => self.handle_privmsg(id, rest, nick, host, true),
            "PING" => {
                self.send_line(id, &format!("PONG {rest}"));
                Vec::new()
            }
            "WHO" => self.handle_who(id, rest.trim(), nick, host),
            "WHOIS" => {
                let target = rest.trim();
                self.send_line(
                    id,
                    &numeric_line(host, 318, nick, &format!("{target} :End of /WHOIS list.")),
                );
                Vec::new()
            }
            "LIST" => self.handle_list(id, nick, host),
            "MODE" => Vec::new(),
            "QUIT" => self.handle_quit(id, rest, nick, host),
            _ => Vec::new(),
        }
    }

    fn handle_nick(&mut self, id: u64, new_nick: &str, nick: &mut String, host: &str) -> Vec<ChatOutcome> {
        if new_nick.is_empty() {
            return Vec::new();
        }
        let old_nick = nick.clone();
        let was_initialized = self
            .sessions
            .get(&id)
            .map(|e| e.session.is_initialized())
            .unwrap_or(false);

        if was_initialized {
            *nick = new_nick.to_string();
            let line = format!(":{old_nick}@{host} NICK :{new_nick}");
            self.broadcast_line(&line);
            vec![ChatOutcome::LocalNickChange {
                old: old_nick,
                new: new_nick.to_string(),
            }]
        } else {
            *nick = new_nick.to_string();
            if let Some(entry) = self.sessions.get_mut(&id) {
                entry.session.nick_seen = true;
            }
            self.maybe_welcome(id, nick, host);
            Vec::new()
        }
    }

    fn handle_user(&mut self, id: u64, nick: &mut String, host: &str) -> Vec<ChatOutcome> {
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.session.user_seen = true;
        }
        self.maybe_welcome(id, nick, host);
        Vec::new()
    }

    fn maybe_welcome(&mut self, id: u64, nick: &str, host: &str) {
        let ready = self
            .sessions
            .get_mut(&id)
            .map(|e| e.session.mark_ready_if_complete())
            .unwrap_or(false);
        if !ready {
            return;
        }
        self.send_line(id, &numeric_line(host, 1, nick, &format!(":Welcome to the mesh, {nick}")));
        self.send_line(id, &numeric_line(host, 2, nick, &format!(":Your host is {host}")));
        self.send_line(id, &numeric_line(host, 3, nick, ":This server was started just now"));
        self.send_line(
            id,
            &numeric_line(host, 4, nick, &format!("{host} meshrelay-0.1 o o")),
        );
        self.send_line(id, &numeric_line(host, 375, nick, &format!(":- {host} Message of the day -")));
        self.send_line(id, &numeric_line(host, 372, nick, ":- Welcome to meshrelay"));
        self.send_line(id, &numeric_line(host, 376, nick, ":End of /MOTD command."));

        let joined: Vec<String> = self.get_joined_channels();
        for channel in joined {
            self.send_line(id, &format!(":{nick}!~{nick}@{host} JOIN :{channel}"));
            self.send_names(id, &channel, nick, host);
        }
    }

    fn send_names(&mut self, id: u64, channel: &str, nick: &str, host: &str) {
        let names = self
            .channels
            .get(channel)
            .map(|c| {
                c.members()
                    .map(|u| u.nick.clone())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        self.send_line(id, &numeric_line(host, 353, nick, &format!("= {channel} :{names}")));
        self.send_line(
            id,
            &numeric_line(host, 366, nick, &format!("{channel} :End of /NAMES list.")),
        );
    }

    fn handle_join(&mut self, id: u64, channels: &str, nick: &str, host: &str) -> Vec<ChatOutcome> {
        let mut outcomes = Vec::new();
        for raw in channels.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let channel = self.get_or_create_channel(raw);
            let name = channel.name.as_str().to_string();
            channel.joined = true;
            channel.add_member(User::new(nick, host, true));

            self.broadcast_line(&format!(":{nick}!~{nick}@{host} JOIN :{name}"));
            self.send_names(id, &name, nick, host);
            outcomes.push(ChatOutcome::LocalJoin { channel: name });
        }
        outcomes
    }

    fn handle_part(&mut self, _id: u64, rest: &str, nick: &str, host: &str) -> Vec<ChatOutcome> {
        let (channel, reason) = split_target_and_message(rest);
        let reason = reason.unwrap_or_else(|| "Leaving".to_string());
        if let Some(chan) = self.channels.get_mut(channel) {
            chan.joined = false;
            chan.remove_member(nick);
        }
        self.broadcast_line(&format!(":{nick}!~{nick}@{host} PART {channel} :{reason}"));
        vec![ChatOutcome::LocalPart {
            channel: channel.to_string(),
            reason,
        }]
    }

    fn handle_topic(&mut self, _id: u64, rest: &str, nick: &str, host: &str) -> Vec<ChatOutcome> {
        let (channel, topic) = split_target_and_message(rest);
        if let Some(topic) = topic {
            let chan = self.get_or_create_channel(channel);
            chan.topic = Some(topic.clone());
            self.broadcast_line(&format!(":{nick}!~{nick}@{host} TOPIC {channel} :{topic}"));
        }
        Vec::new()
    }

    fn handle_privmsg(
        &mut self,
        _id: u64,
        rest: &str,
        nick: &str,
        host: &str,
        is_notice: bool,
    ) -> Vec<ChatOutcome> {
        let (target, text) = split_target_and_message(rest);
        let Some(text) = text else {
            return Vec::new();
        };
        let is_channel = target.starts_with(['#', '+', '&', '!']);
        if is_channel {
            let joined = self.channels.get(target).map(|c| c.joined).unwrap_or(false);
            if !joined {
                return Vec::new();
            }
        }
        let verb = if is_notice { "NOTICE" } else { "PRIVMSG" };
        self.broadcast_line(&format!(":{nick}!~{nick}@{host} {verb} {target} :{text}"));
        if !is_channel {
            return Vec::new();
        }
        if is_notice {
            vec![ChatOutcome::LocalNotice {
                channel: target.to_string(),
                text,
            }]
        } else {
            vec![ChatOutcome::LocalMsg {
                channel: target.to_string(),
                text,
            }]
        }
    }

    fn handle_who(&mut self, id: u64, channel: &str, nick: &str, host: &str) -> Vec<ChatOutcome> {
        if let Some(chan) = self.channels.get(channel) {
            let members: Vec<User> = chan.members().cloned().collect();
            for member in members {
                let line = numeric_line(
                    host,
                    352,
                    nick,
                    &format!(
                        "{channel} {user} {member_host} {host} {member_nick} H :0 {member_nick}",
                        user = member.nick,
                        member_host = member.host,
                        member_nick = member.nick,
                    ),
                );
                self.send_line(id, &line);
            }
        }
        self.send_line(id, &numeric_line(host, 315, nick, &format!("{channel} :End of /WHO list.")));
        Vec::new()
    }

    fn handle_list(&mut self, id: u64, nick: &str, host: &str) -> Vec<ChatOutcome> {
        self.send_line(id, &numeric_line(host, 321, nick, "Channel :Users Name"));
        let channels: Vec<(String, usize, String)> = self
            .channels
            .values()
            .map(|c| {
                (
                    c.name.as_str().to_string(),
                    c.member_count(),
                    c.topic.clone().unwrap_or_default(),
                )
            })
            .collect();
        for (name, count, topic) in channels {
            self.send_line(id, &numeric_line(host, 322, nick, &format!("{name} {count} :{topic}")));
        }
        self.send_line(id, &numeric_line(host, 323, nick, ":End of /LIST"));
        Vec::new()
    }

    /// Synthesizes a QUIT for a session whose TCP connection dropped
    /// without sending one explicitly.
    pub fn handle_disconnect(&mut self, id: u64, nick: &str, host: &str) -> Vec<ChatOutcome> {
        self.handle_quit(id, ":Connection closed", nick, host)
    }

    fn handle_quit(&mut self, id: u64, rest: &str, nick: &str, host: &str) -> Vec<ChatOutcome> {
        let reason = rest.trim_start_matches(':').trim().to_string();
        let reason = if reason.is_empty() {
            "Quit".to_string()
        } else {
            reason
        };
        for chan in self.channels.values_mut() {
            chan.remove_member(nick);
        }
        self.broadcast_line(&format!(":{nick}!~{nick}@{host} QUIT :{reason}"));
        self.sessions.remove(&id);
        vec![ChatOutcome::LocalQuit { reason }]
    }

    // -- inbound event surface: callbacks from PeerRegistry -----------------

    pub fn deliver_join(&mut self, channel: &str, peer_nick: &str, peer_host: &str) {
        let chan = self.get_or_create_channel(channel);
        let added = chan.add_member(User::new(peer_nick, peer_host, false));
        if added {
            self.broadcast_line(&format!(":{peer_nick}@{peer_host} JOIN :{channel}"));
        }
    }

    pub fn deliver_part(&mut self, channel: &str, peer_nick: &str, reason: &str) {
        if let Some(chan) = self.channels.get_mut(channel) {
            chan.remove_member(peer_nick);
        }
        self.broadcast_line(&format!(":{peer_nick} PART {channel} :{reason}"));
    }

    pub fn deliver_quit(&mut self, peer_nick: &str, peer_host: &str, reason: &str) {
        for chan in self.channels.values_mut() {
            chan.remove_member(peer_nick);
        }
        self.broadcast_line(&format!(":{peer_nick}@{peer_host} QUIT :{reason}"));
    }

    pub fn deliver_msg(&mut self, channel: &str, peer_nick: &str, text: &str) {
        self.broadcast_line(&format!(":{peer_nick} PRIVMSG {channel} :{text}"));
    }

    pub fn deliver_notice(&mut self, channel: &str, peer_nick: &str, text: &str) {
        self.broadcast_line(&format!(":{peer_nick} NOTICE {channel} :{text}"));
    }

    pub fn deliver_nick(&mut self, old: &str, new: &str) {
        for chan in self.channels.values_mut() {
            chan.rekey_member(old, new);
        }
        self.broadcast_line(&format!(":{old} NICK :{new}"));
    }
}

impl Default for ChatServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats a numeric server reply line. A free function (not a method) so
/// it can be called as an argument to `send_line` without tripping the
/// borrow checker over two overlapping borrows of `self`.
fn numeric_line(host: &str, code: u16, nick: &str, rest: &str) -> String {
    format!(":{host} {code:03} {nick} {rest}")
}

/// Splits `JOIN`/`PRIVMSG`-style `<target> :<trailing message>` syntax.
/// Returns `(target, None)` if there is no `:`-prefixed trailing part.
fn split_target_and_message(rest: &str) -> (&str, Option<String>) {
    match rest.split_once(" :") {
        Some((target, msg)) => (target.trim(), Some(msg.to_string())),
        None => {
            let rest = rest.trim();
            if let Some(msg) = rest.strip_prefix(':') {
                ("", Some(msg.to_string()))
            } else {
                (rest, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(server: &mut ChatServer, id: u64) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(64);
        server.add_session(id, "127.0.0.1:9000".to_string(), tx);
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(String::from_utf8_lossy(&bytes).into_owned());
        }
        out
    }

    #[test]
    fn line_framing_byte_by_byte_matches_atomic() {
        let mut atomic_buf = Vec::new();
        let atomic = extract_lines(&mut atomic_buf, b"NICK alice\r\n").unwrap();

        let mut incremental_buf = Vec::new();
        let mut incremental = Vec::new();
        for &b in b"NICK alice\r\n" {
            incremental.extend(extract_lines(&mut incremental_buf, &[b]).unwrap());
        }
        assert_eq!(atomic, incremental);
        assert_eq!(atomic, vec!["NICK alice".to_string()]);
    }

    #[test]
    fn line_framing_accepts_bare_lf() {
        let mut buf = Vec::new();
        let lines = extract_lines(&mut buf, b"PING tok\n").unwrap();
        assert_eq!(lines, vec!["PING tok".to_string()]);
    }

    #[test]
    fn line_overflow_without_terminator_closes() {
        let mut buf = Vec::new();
        let long = vec![b'x'; SESSION_BUFFER_CAP + 1];
        assert_eq!(extract_lines(&mut buf, &long), Err(LineOverflow));
        assert!(buf.is_empty());
    }

    #[test]
    fn welcome_sequence_scenario_s3() {
        let mut server = ChatServer::new();
        let mut rx = make_session(&mut server, 1);
        let mut nick = String::new();

        server.handle_line(1, "NICK alice", &mut nick, "fc00::1");
        server.handle_line(1, "USER alice 0 * :Alice", &mut nick, "fc00::1");

        let lines = drain(&mut rx);
        let codes: Vec<&str> = lines
            .iter()
            .map(|l| l.split_whitespace().nth(1).unwrap_or(""))
            .collect();
        assert_eq!(codes, vec!["001", "002", "003", "004", "375", "372", "376"]);
        assert!(lines.iter().all(|l| !l.contains("JOIN")));
    }

    #[test]
    fn join_marks_channel_and_emits_outcome() {
        let mut server = ChatServer::new();
        let mut rx = make_session(&mut server, 1);
        let mut nick = "a".to_string();
        server.handle_line(1, "USER a 0 * :A", &mut nick, "fc00::1");
        let outcomes = server.handle_line(1, "JOIN #x", &mut nick, "fc00::1");
        assert_eq!(outcomes, vec![ChatOutcome::LocalJoin { channel: "#x".into() }]);
        assert!(server.get_joined_channels().contains(&"#x".to_string()));
        drain(&mut rx);
    }

    #[test]
    fn privmsg_dropped_when_not_joined() {
        let mut server = ChatServer::new();
        make_session(&mut server, 1);
        let mut nick = "a".to_string();
        let outcomes = server.handle_line(1, "PRIVMSG #x :hi", &mut nick, "fc00::1");
        assert!(outcomes.is_empty());
    }

    #[test]
    fn deliver_msg_renders_privmsg_scenario_s5() {
        let mut server = ChatServer::new();
        let mut rx = make_session(&mut server, 1);
        server.deliver_msg("#x", "bob", "hi");
        let lines = drain(&mut rx);
        assert_eq!(lines, vec![":bob PRIVMSG #x :hi\r\n".to_string()]);
    }

    #[test]
    fn deliver_quit_scenario_s6() {
        let mut server = ChatServer::new();
        let mut rx = make_session(&mut server, 1);
        server.deliver_quit("bob", "fc00::2", "Timed out");
        let lines = drain(&mut rx);
        assert_eq!(lines, vec![":bob@fc00::2 QUIT :Timed out\r\n".to_string()]);
    }

    #[test]
    fn deliver_join_idempotent_does_not_double_announce() {
        let mut server = ChatServer::new();
        let mut rx = make_session(&mut server, 1);
        server.deliver_join("#x", "bob", "fc00::2");
        server.deliver_join("#x", "bob", "fc00::2");
        let lines = drain(&mut rx);
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn who_then_end_of_who() {
        let mut server = ChatServer::new();
        let mut rx = make_session(&mut server, 1);
        let mut nick = "a".to_string();
        server.handle_line(1, "USER a 0 * :A", &mut nick, "fc00::1");
        server.handle_line(1, "JOIN #x", &mut nick, "fc00::1");
        drain(&mut rx);
        server.handle_line(1, "WHO #x", &mut nick, "fc00::1");
        let lines = drain(&mut rx);
        assert!(lines.iter().any(|l| l.contains(" 352 ")));
        assert!(lines.last().unwrap().contains(" 315 "));
    }

    #[test]
    fn list_triplet() {
        let mut server = ChatServer::new();
        let mut rx = make_session(&mut server, 1);
        let mut nick = "a".to_string();
        server.handle_line(1, "USER a 0 * :A", &mut nick, "fc00::1");
        server.handle_line(1, "JOIN #x", &mut nick, "fc00::1");
        drain(&mut rx);
        server.handle_line(1, "LIST", &mut nick, "fc00::1");
        let lines = drain(&mut rx);
        assert!(lines[0].contains(" 321 "));
        assert!(lines[1].contains(" 322 "));
        assert!(lines.last().unwrap().contains(" 323 "));
    }

    #[test]
    fn local_quit_broadcasts_to_other_sessions_and_removes_session() {
        let mut server = ChatServer::new();
        let mut nick_a = "a".to_string();
        server.handle_line(1, "USER a 0 * :A", &mut nick_a, "fc00::1");
        server.handle_line(1, "JOIN #x", &mut nick_a, "fc00::1");
        let mut rx2 = make_session(&mut server, 2);
        let mut nick_b = "a".to_string();
        server.handle_line(2, "USER a 0 * :A", &mut nick_b, "fc00::1");
        drain(&mut rx2);

        let outcomes = server.handle_line(1, "QUIT :bye", &mut nick_a, "fc00::1");
        assert_eq!(outcomes, vec![ChatOutcome::LocalQuit { reason: "bye".into() }]);
        let lines = drain(&mut rx2);
        assert!(lines.iter().any(|l| l.contains("QUIT :bye")));
        assert_eq!(server.session_count(), 1);
    }

    #[test]
    fn disconnect_synthesizes_quit_with_fixed_reason() {
        let mut server = ChatServer::new();
        make_session(&mut server, 1);
        let outcomes = server.handle_disconnect(1, "a", "fc00::1");
        assert_eq!(
            outcomes,
            vec![ChatOutcome::LocalQuit { reason: "Connection closed".into() }]
        );
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn nick_change_before_registration_does_not_broadcast() {
        let mut server = ChatServer::new();
        let mut rx = make_session(&mut server, 1);
        let mut nick = String::new();
        let outcomes = server.handle_line(1, "NICK alice", &mut nick, "fc00::1");
        assert!(outcomes.is_empty());
        assert!(drain(&mut rx).is_empty());
    }
}
