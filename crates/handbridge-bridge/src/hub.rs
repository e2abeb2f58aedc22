//! [`SessionHub`] – WebSocket server for tracking clients and observers.
//!
//! Each accepted connection gets its own task holding both socket halves:
//! inbound text frames are parsed per message (malformed payloads are
//! dropped silently, the connection stays up) and forwarded into the
//! bridge actor's command queue; outbound [`ServerMessage`]s arrive on a
//! bounded per-session queue the actor fills.  A session owns nothing but
//! its own socket and queue, so closing one never touches shared state.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use handbridge_types::proto::{ClientMessage, ServerMessage};
use handbridge_types::BridgeError;

use crate::bridge::{BridgeCommand, SESSION_QUEUE_DEPTH};

/// Accepts observer/operator connections and bridges them to the actor.
pub struct SessionHub {
    listener: TcpListener,
    commands: mpsc::Sender<BridgeCommand>,
}

impl SessionHub {
    /// Bind the listen socket.  Binding is the only fallible step; the
    /// accept loop itself never gives up.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Connection`] when the address cannot be bound.
    pub async fn bind(
        addr: &str,
        commands: mpsc::Sender<BridgeCommand>,
    ) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Connection(format!("bind {addr}: {e}")))?;
        Ok(Self { listener, commands })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept connections forever, one task per session.
    pub async fn run(self) {
        if let Some(addr) = self.local_addr() {
            info!(%addr, "session hub listening");
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let commands = self.commands.clone();
                    tokio::spawn(async move {
                        handle_session(stream, peer, commands).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

async fn handle_session(
    stream: TcpStream,
    peer: SocketAddr,
    commands: mpsc::Sender<BridgeCommand>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };

    let id = Uuid::new_v4();
    info!(session = %id, %peer, "client connected");

    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(SESSION_QUEUE_DEPTH);
    if commands
        .send(BridgeCommand::Attach { id, tx: out_tx })
        .await
        .is_err()
    {
        // Actor already gone: the process is shutting down.
        return;
    }

    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            out = out_rx.recv() => {
                let Some(msg) = out else { break };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(session = %id, error = %e, "outbound serialization failed");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(msg) => {
                                if commands.send(BridgeCommand::Client { id, msg }).await.is_err() {
                                    break;
                                }
                            }
                            // Per-message drop: garbage never costs the
                            // connection.
                            Err(e) => debug!(session = %id, error = %e, "malformed message dropped"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(session = %id, error = %e, "socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(session = %id, %peer, "client disconnected");
    let _ = commands.send(BridgeCommand::Detach { id }).await;
}
