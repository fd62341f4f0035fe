//! TCP server for the chat daemon.
//!
//! The server:
//! - Listens on a TCP socket for client connections
//! - Runs the identify handshake on each new socket
//! - Hands identified sockets to the [`Hub`]
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   ChatServer    │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept() + identify
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │       Hub       │────▶│    Registry     │
//! │ reader / writer │     │ UserId -> Conn  │
//! └───────┬─────────┘     └─────────────────┘
//!         │ frames
//!         ▼
//! ┌─────────────────┐
//! │   Dispatcher    │
//! └─────────────────┘
//! ```
//!
//! Authentication happens upstream: the listener trusts the user id in the
//! identify frame and must only be reachable from the authenticating proxy.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept and handshake errors are logged and the server keeps running

mod handshake;

pub use handshake::HandshakeError;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kuchat_protocol::{Connected, Envelope, EventKind, FrameCodec, ProtocolVersion};

use crate::config::ServerConfig;
use crate::hub::Hub;

/// TCP front end of the chat daemon.
pub struct ChatServer {
    listener: TcpListener,
    hub: Hub,
    handshake_timeout: Duration,
    cancel_token: CancellationToken,
}

impl ChatServer {
    /// Binds the listener.
    ///
    /// Binding happens here rather than in [`ChatServer::run`] so callers
    /// can learn the address (useful with port 0) before serving.
    pub async fn bind(
        config: &ServerConfig,
        hub: Hub,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let addr = config.listen_addr().map_err(|e| ServerError::Bind {
            addr: config.listen.clone(),
            error: e.to_string(),
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: config.listen.clone(),
                error: e.to_string(),
            })?;

        Ok(Self {
            listener,
            hub,
            handshake_timeout: config.handshake_timeout(),
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Io)
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Accepts connections until the cancellation token is triggered, then
    /// closes every registered connection.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Chat server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.handle_connection(stream, peer),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            // Continue accepting other connections
                        }
                    }
                }
            }
        }

        let closed = self.hub.registry().close_all();
        info!(closed, "Server cleanup complete");
        Ok(())
    }

    /// Runs the handshake for a new socket on its own task.
    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let hub = self.hub.clone();
        let limit = self.handshake_timeout;
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let codec = FrameCodec::with_max_frame_len(hub.settings().max_frame_len);
            let mut framed = Framed::new(stream, codec);

            let identify = match handshake::identify(&mut framed, limit).await {
                Ok(identify) => identify,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Handshake failed");
                    handshake::reject(&mut framed, &e, limit).await;
                    return;
                }
            };

            // Shutdown began while this client was identifying
            if cancel_token.is_cancelled() {
                return;
            }

            let user_id = identify.user_id;
            let greeting = Envelope::new(
                EventKind::Connected,
                Connected {
                    user_id: user_id.clone(),
                    protocol_version: ProtocolVersion::CURRENT,
                },
            )
            .to_bytes()
            .map_err(|e| debug!(error = %e, "Failed to encode greeting"))
            .ok();

            let conn = match hub.attach(user_id.clone(), framed, greeting) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(peer = %peer, user_id = %user_id, error = %e, "Connection refused");
                    return;
                }
            };

            // run() cancels before close_all(), so a registration that
            // close_all() missed always sees the token here
            if cancel_token.is_cancelled() {
                conn.close();
                debug!(connection_id = %conn.id(), "Closed connection attached during shutdown");
                return;
            }

            info!(
                peer = %peer,
                user_id = %user_id,
                connection_id = %conn.id(),
                "Client connected"
            );
        });
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
