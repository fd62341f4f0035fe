//! Routing of inbound frames to handlers by kind.
//!
//! The handler table is built once, before the server starts accepting, and
//! is read-only afterwards. Each connection's reader awaits one dispatch at
//! a time, which keeps side effects of a single connection in arrival order
//! while different connections dispatch concurrently.
//!
//! Nothing a handler does can take the reader down: errors and panics are
//! caught here, logged, and answered with an `Error` event to the sender.

mod handlers;
mod request;

pub use handlers::{default_dispatcher, FriendRequestHandler, PingHandler};
pub use request::Request;

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, warn};

use kuchat_core::UserId;
use kuchat_protocol::{Envelope, ErrorNotice, EventKind, MalformedPayload};

use crate::connection::{Connection, SendError};

/// Processes requests of one kind.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request<'_>) -> Result<(), HandlerError>;
}

/// Setup-time table of `kind -> handler` bindings.
#[derive(Default)]
pub struct DispatcherBuilder {
    handlers: HashMap<u32, Arc<dyn Handler>>,
}

impl DispatcherBuilder {
    /// Binds `handler` to `kind`.
    ///
    /// Binding the same kind twice is a configuration error.
    pub fn register<H: Handler>(
        &mut self,
        kind: u32,
        handler: H,
    ) -> Result<&mut Self, DispatchError> {
        match self.handlers.entry(kind) {
            Entry::Occupied(_) => Err(DispatchError::DuplicateRegistration { kind }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(handler));
                Ok(self)
            }
        }
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            handlers: self.handlers,
        }
    }
}

/// Routes each request to the handler bound to its kind.
pub struct Dispatcher {
    handlers: HashMap<u32, Arc<dyn Handler>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Kinds with a bound handler, sorted.
    pub fn kinds(&self) -> Vec<u32> {
        let mut kinds: Vec<u32> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn handles(&self, kind: u32) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Runs the handler for `request` to completion.
    ///
    /// Every failure is isolated to this request: it is logged, reported to
    /// the originating connection, and returned. The connection stays open.
    pub async fn dispatch(&self, request: Request<'_>) -> Result<(), DispatchError> {
        let kind = request.kind();
        let conn = request.connection();

        let Some(handler) = self.handlers.get(&kind) else {
            let err = DispatchError::UnknownKind { kind };
            warn!(
                user_id = %conn.user_id(),
                connection_id = %conn.id(),
                kind,
                "No handler for frame kind"
            );
            report(conn, kind, &err);
            return Err(err);
        };

        let outcome = AssertUnwindSafe(handler.handle(request))
            .catch_unwind()
            .await;

        let err = match outcome {
            Ok(Ok(())) => {
                debug!(connection_id = %conn.id(), kind, "Request handled");
                return Ok(());
            }
            Ok(Err(source)) => {
                warn!(
                    user_id = %conn.user_id(),
                    connection_id = %conn.id(),
                    kind,
                    error = %source,
                    "Handler failed"
                );
                DispatchError::Handler { kind, source }
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    user_id = %conn.user_id(),
                    connection_id = %conn.id(),
                    kind,
                    panic = %message,
                    "Handler panicked"
                );
                DispatchError::Panicked { kind, message }
            }
        };

        report(conn, kind, &err);
        Err(err)
    }
}

/// Best-effort `Error` event back to the sender.
fn report(conn: &Connection, kind: u32, err: &DispatchError) {
    let message = match err {
        // Panic details stay in the server log
        DispatchError::Panicked { .. } => "internal error".to_string(),
        other => other.to_string(),
    };

    let notice = Envelope::new(EventKind::Error, ErrorNotice::new(Some(kind), message));
    let delivered = notice
        .to_bytes()
        .map_err(|e| e.to_string())
        .and_then(|bytes| conn.try_send(bytes).map_err(|e| e.to_string()));

    if let Err(reason) = delivered {
        debug!(connection_id = %conn.id(), error = %reason, "Could not report dispatch error");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Errors produced while routing a request.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler is bound to the frame's kind. Recoverable.
    #[error("No handler registered for kind {kind}")]
    UnknownKind { kind: u32 },

    /// Two handlers were bound to one kind at setup.
    #[error("A handler is already registered for kind {kind}")]
    DuplicateRegistration { kind: u32 },

    #[error("Handler for kind {kind} failed: {source}")]
    Handler { kind: u32, source: HandlerError },

    #[error("Handler for kind {kind} panicked: {message}")]
    Panicked { kind: u32, message: String },
}

/// Errors a handler may return.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Malformed(#[from] MalformedPayload),

    #[error("Recipient {0} is offline")]
    RecipientOffline(UserId),

    #[error("Delivery failed: {0}")]
    Send(#[from] SendError),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Rejected(String),
}

impl HandlerError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}
