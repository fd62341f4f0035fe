//! Attaching authenticated sockets to the routing core.

use std::sync::Arc;

use bytes::Bytes;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

use kuchat_core::UserId;
use kuchat_protocol::FrameCodec;

use crate::config::ConnectionConfig;
use crate::connection::{self, Connection};
use crate::dispatch::Dispatcher;
use crate::registry::{Registry, RegistryError};

/// Everything a connection needs once its user is known: the registry it
/// lives in, the handler table, and per-connection limits.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Hub {
    registry: Registry,
    dispatcher: Arc<Dispatcher>,
    settings: ConnectionConfig,
}

impl Hub {
    pub fn new(registry: Registry, dispatcher: Dispatcher, settings: ConnectionConfig) -> Self {
        Self {
            registry,
            dispatcher: Arc::new(dispatcher),
            settings,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn settings(&self) -> &ConnectionConfig {
        &self.settings
    }

    /// Attaches a socket whose user has already been authenticated.
    ///
    /// Registers the new connection (closing any previous one of the same
    /// user) and spawns its reader and writer. Must be called from within a
    /// tokio runtime.
    pub fn accept<S>(&self, user_id: UserId, stream: S) -> Result<Arc<Connection>, RegistryError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let codec = FrameCodec::with_max_frame_len(self.settings.max_frame_len);
        self.accept_framed(user_id, Framed::new(stream, codec))
    }

    /// Like [`Hub::accept`], for a stream that has already been read from.
    ///
    /// Bytes buffered inside `framed` are kept, so frames that arrived right
    /// behind a handshake are not lost.
    pub fn accept_framed<S>(
        &self,
        user_id: UserId,
        framed: Framed<S, FrameCodec>,
    ) -> Result<Arc<Connection>, RegistryError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.attach(user_id, framed, None)
    }

    /// Registers and spawns the connection, queueing `greeting` first so it
    /// precedes anything the connection's own frames produce.
    pub(crate) fn attach<S>(
        &self,
        user_id: UserId,
        framed: Framed<S, FrameCodec>,
        greeting: Option<Bytes>,
    ) -> Result<Arc<Connection>, RegistryError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (conn, outbound) = Connection::with_max_payload(
            user_id,
            self.settings.queue_capacity,
            self.settings.overflow,
            self.settings.max_frame_len,
        );

        self.registry.register(Arc::clone(&conn))?;

        if let Some(greeting) = greeting {
            if let Err(e) = conn.try_send(greeting) {
                debug!(connection_id = %conn.id(), error = %e, "Could not queue greeting");
            }
        }

        tokio::spawn(connection::serve(
            Arc::clone(&conn),
            outbound,
            framed,
            Arc::clone(&self.dispatcher),
            self.registry.clone(),
            self.settings.clone(),
        ));

        Ok(conn)
    }
}
