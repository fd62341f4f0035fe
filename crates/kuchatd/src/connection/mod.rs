//! One user's live socket.
//!
//! A [`Connection`] is the shared handle the rest of the system holds. It
//! never touches the socket itself: [`Connection::send`] only enqueues, and
//! the dedicated writer task spawned by the hub performs one raw write at a
//! time in enqueue order. The reader task decodes frames and hands them to
//! the dispatcher one at a time.
//!
//! ```text
//!   send() ──▶ bounded mpsc ──▶ writer task ──▶ socket
//!                                                  │
//!   dispatcher ◀── reader task ◀───────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Closed or full queues surface as [`SendError`], never as panics

mod io;

pub(crate) use io::serve;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use kuchat_core::UserId;
use kuchat_protocol::DEFAULT_MAX_FRAME_LEN;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one physical connection.
///
/// Two logins of the same user get different ids, which is what lets the
/// registry tell a stale disconnect apart from the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What [`Connection::send`] does when the outbound queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail immediately with [`SendError::QueueFull`]
    #[default]
    Reject,

    /// Wait for room up to `timeout_ms`, then fail with [`SendError::Timeout`]
    Block { timeout_ms: u64 },
}

/// Shared handle to a live connection.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<Bytes>,
    capacity: usize,
    overflow: OverflowPolicy,
    max_payload: usize,
    cancel: CancellationToken,
    alive: AtomicBool,
    connected_at: DateTime<Utc>,
    last_active: Mutex<DateTime<Utc>>,
}

impl Connection {
    /// Creates a connection handle and the receiving end of its outbound
    /// queue.
    ///
    /// The hub wires the receiver to a writer task; tests and embedders may
    /// drain it directly.
    pub fn new(
        user_id: UserId,
        capacity: usize,
        overflow: OverflowPolicy,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        Self::with_max_payload(user_id, capacity, overflow, DEFAULT_MAX_FRAME_LEN)
    }

    /// Like [`Connection::new`], refusing payloads longer than `max_payload`.
    ///
    /// The limit must match what the writer's codec will encode, otherwise
    /// an accepted payload would fail at write time and drop the socket.
    pub fn with_max_payload(
        user_id: UserId,
        capacity: usize,
        overflow: OverflowPolicy,
        max_payload: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let now = Utc::now();

        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            user_id,
            outbound: tx,
            capacity,
            overflow,
            max_payload,
            cancel: CancellationToken::new(),
            alive: AtomicBool::new(true),
            connected_at: now,
            last_active: Mutex::new(now),
        });

        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Largest payload `send` accepts, in bytes.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn check_len(&self, payload: &Bytes) -> Result<(), SendError> {
        if payload.len() > self.max_payload {
            return Err(SendError::TooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }
        Ok(())
    }

    /// Enqueues a payload without ever waiting, whatever the overflow policy.
    pub fn try_send(&self, payload: impl Into<Bytes>) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }

        let payload = payload.into();
        self.check_len(&payload)?;

        self.outbound
            .try_send(payload)
            .map_err(|e| match e {
                TrySendError::Full(_) => SendError::QueueFull {
                    capacity: self.capacity,
                },
                TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Enqueues a payload for delivery, applying the overflow policy.
    ///
    /// Payloads from one connection are written in the order they were
    /// enqueued. A failed send does not close the connection.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), SendError> {
        let wait = match self.overflow {
            OverflowPolicy::Reject => return self.try_send(payload),
            OverflowPolicy::Block { timeout_ms } => Duration::from_millis(timeout_ms),
        };

        if !self.is_alive() {
            return Err(SendError::Closed);
        }

        let payload = payload.into();
        self.check_len(&payload)?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(SendError::Closed),
            sent = timeout(wait, self.outbound.send(payload)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(SendError::Closed),
                Err(_) => Err(SendError::Timeout { waited: wait }),
            },
        }
    }

    /// Marks the connection dead and stops its reader and writer.
    ///
    /// Idempotent and callable from any task. Returns `true` only for the
    /// call that actually closed it.
    pub fn close(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        if was_alive {
            self.cancel.cancel();
            debug!(
                user_id = %self.user_id,
                connection_id = %self.id,
                "Connection closing"
            );
        }
        was_alive
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Time of the last inbound frame (or of the connect, if none yet).
    pub fn last_active(&self) -> DateTime<Utc> {
        *self.last_active.lock()
    }

    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_active())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Number of payloads waiting for the writer.
    pub fn queued(&self) -> usize {
        self.capacity.saturating_sub(self.outbound.capacity())
    }

    pub(crate) fn touch(&self) {
        *self.last_active.lock() = Utc::now();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("alive", &self.is_alive())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Errors returned by [`Connection::send`] and [`Connection::try_send`].
///
/// Callers pushing to another user should treat `Closed` as "recipient
/// offline" rather than as a system failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Outbound queue full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    #[error("Send timed out after {waited:?}")]
    Timeout { waited: Duration },

    #[error("Payload of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("Connection closed")]
    Closed,
}
