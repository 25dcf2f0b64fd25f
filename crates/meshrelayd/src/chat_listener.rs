//! TCP listener for local IRC-protocol chat clients.
//!
//! Accepts loopback connections and, for each one, spawns a task that reads
//! raw bytes, reassembles them into lines via
//! [`crate::chat_server::extract_lines`], and forwards each complete line to
//! the daemon's main loop as a [`ChatEvent`]. A second half of the same task
//! owns the socket's write side and drains a per-session `mpsc` channel that
//! `ChatServer::send_line` pushes onto — this is how the single-threaded
//! `Daemon::run` loop gets backpressure without blocking on a slow client.

use crate::app::ChatEvent;
use crate::chat_server::{extract_lines, LineOverflow};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Bound on a session's outbound queue. A client that can't keep up has its
/// connection dropped rather than buffering without limit.
const OUTBOUND_QUEUE_CAP: usize = 64;

#[derive(Debug, Error)]
pub enum ChatListenerError {
    #[error("failed to bind chat TCP listener: {0}")]
    Bind(std::io::Error),
}

pub struct ChatListener {
    listener: TcpListener,
    next_id: AtomicU64,
}

impl ChatListener {
    pub async fn bind(addr: &str) -> Result<Self, ChatListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(ChatListenerError::Bind)?;
        debug!(addr, "chat TCP listener bound");
        Ok(Self {
            listener,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Runs the accept loop. Each connection is handled in its own task;
    /// events are forwarded through `chat_tx` to the daemon's main loop.
    pub async fn accept_loop(self, chat_tx: mpsc::Sender<ChatEvent>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    debug!(session = id, peer = %peer_addr, "accepted chat connection");
                    let tx = chat_tx.clone();
                    tokio::spawn(async move {
                        handle_session(id, peer_addr.to_string(), stream, tx).await;
                    });
                }
                Err(err) => {
                    error!(error = %err, "failed to accept chat connection");
                    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_session(id: u64, peer_addr: String, stream: TcpStream, chat_tx: mpsc::Sender<ChatEvent>) {
    let (mut reader, mut writer) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE_CAP);

    if chat_tx
        .send(ChatEvent::Connected {
            id,
            peer_addr,
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let mut read_buf = [0u8; 4096];
    let mut line_buf = Vec::new();

    loop {
        tokio::select! {
            read_result = reader.read(&mut read_buf) => {
                match read_result {
                    Ok(0) => {
                        debug!(session = id, "chat client disconnected");
                        break;
                    }
                    Ok(n) => {
                        match extract_lines(&mut line_buf, &read_buf[..n]) {
                            Ok(lines) => {
                                for line in lines {
                                    if chat_tx.send(ChatEvent::Line { id, line }).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(LineOverflow) => {
                                debug!(session = id, "chat session line buffer overflowed, closing");
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        debug!(session = id, error = %err, "chat session read error");
                        break;
                    }
                }
            }

            Some(bytes) = outbound_rx.recv() => {
                if let Err(err) = writer.write_all(&bytes).await {
                    debug!(session = id, error = %err, "chat session write error");
                    break;
                }
            }
        }
    }

    let _ = chat_tx.send(ChatEvent::Disconnected { id }).await;
}
