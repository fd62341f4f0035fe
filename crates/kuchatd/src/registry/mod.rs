//! Directory of online users.
//!
//! The registry maps each [`UserId`] to its single live [`Connection`]. It is
//! a cheap-to-clone handle around shared state guarded by a read/write lock:
//! lookups take the read side, register/unregister take the write side. No
//! I/O ever happens while the lock is held.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ register   ┌──────────────────────────────┐
//! │     Hub      │───────────▶│          Registry            │
//! │ (per accept) │ unregister │ RwLock<HashMap<UserId, Conn>> │
//! └──────────────┘            └──────────────┬───────────────┘
//!                                            │ get / broadcast
//!        handlers, HTTP actions ◀────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - A full registry is reported as [`RegistryError::Full`]

mod events;

pub use events::{BroadcastReport, PresenceEvent, RegistryError};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kuchat_core::UserId;
use kuchat_protocol::{Envelope, EventKind, Replaced};

use crate::config::RegistryConfig;
use crate::connection::Connection;

/// Presence event channel capacity
const EVENT_BUFFER: usize = 100;

/// Reason given to a connection displaced by a newer login
const REPLACED_REASON: &str = "signed in from another connection";

/// Handle to the online-user directory.
///
/// Clones share the same state. Its lifetime is that of the server, but
/// each instance is independent so tests can build their own.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    connections: RwLock<HashMap<UserId, Arc<Connection>>>,
    events: broadcast::Sender<PresenceEvent>,
    max_connections: usize,
}

impl Registry {
    pub fn new(max_connections: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                connections: RwLock::new(HashMap::new()),
                events,
                max_connections,
            }),
        }
    }

    pub fn with_config(config: &RegistryConfig) -> Self {
        Self::new(config.max_connections)
    }

    /// Makes `connection` the one returned for its user.
    ///
    /// A previous live connection of the same user is told it was replaced,
    /// closed, and returned. A previous connection that is already closed
    /// is simply superseded. Replacing never fails; adding a new user fails
    /// once `max_connections` users are online.
    pub fn register(
        &self,
        connection: Arc<Connection>,
    ) -> Result<Option<Arc<Connection>>, RegistryError> {
        let user_id = connection.user_id().clone();

        let previous = {
            let mut connections = self.inner.connections.write();
            // Closed entries still winding down do not count
            if !connections.contains_key(&user_id)
                && connections.len() >= self.inner.max_connections
                && connections.values().filter(|c| c.is_alive()).count()
                    >= self.inner.max_connections
            {
                return Err(RegistryError::Full {
                    max: self.inner.max_connections,
                });
            }
            connections.insert(user_id.clone(), Arc::clone(&connection))
        };

        match &previous {
            Some(old) if old.id() != connection.id() && !old.is_alive() => {
                // Its own unregister will find the new entry and skip, so the
                // offline transition is published here
                info!(
                    user_id = %user_id,
                    previous = %old.id(),
                    current = %connection.id(),
                    "Took over from closed connection"
                );
                self.publish(PresenceEvent::Offline {
                    user_id: user_id.clone(),
                    connection_id: old.id(),
                });
                self.publish(PresenceEvent::Online {
                    user_id,
                    connection_id: connection.id(),
                });
            }
            Some(old) if old.id() != connection.id() => {
                displace(old);
                info!(
                    user_id = %user_id,
                    previous = %old.id(),
                    current = %connection.id(),
                    "Replaced existing connection"
                );
                self.publish(PresenceEvent::Replaced {
                    user_id,
                    previous: old.id(),
                    current: connection.id(),
                });
            }
            Some(_) => {
                debug!(user_id = %user_id, "Connection registered twice, ignoring");
            }
            None => {
                info!(user_id = %user_id, connection_id = %connection.id(), "User online");
                self.publish(PresenceEvent::Online {
                    user_id,
                    connection_id: connection.id(),
                });
            }
        }

        Ok(previous)
    }

    /// Returns the user's live connection, or `None` if they are offline.
    pub fn get(&self, user_id: &UserId) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .read()
            .get(user_id)
            .filter(|conn| conn.is_alive())
            .cloned()
    }

    /// Removes the mapping if it still points at `connection`.
    ///
    /// A stale disconnect never evicts a newer login of the same user.
    /// Returns whether anything was removed.
    pub fn unregister(&self, user_id: &UserId, connection: &Connection) -> bool {
        let removed = {
            let mut connections = self.inner.connections.write();
            match connections.get(user_id) {
                Some(current) if current.id() == connection.id() => {
                    connections.remove(user_id).is_some()
                }
                _ => false,
            }
        };

        if removed {
            info!(user_id = %user_id, connection_id = %connection.id(), "User offline");
            self.publish(PresenceEvent::Offline {
                user_id: user_id.clone(),
                connection_id: connection.id(),
            });
        } else {
            debug!(
                user_id = %user_id,
                connection_id = %connection.id(),
                "Skipping unregister of superseded connection"
            );
        }

        removed
    }

    /// Queues `payload` on every registered connection matching `predicate`.
    ///
    /// Works on a snapshot taken under the read lock and never waits on a
    /// full queue; per-connection failures are collected, not fatal.
    pub fn broadcast<F>(&self, payload: impl Into<Bytes>, predicate: F) -> BroadcastReport
    where
        F: Fn(&Connection) -> bool,
    {
        let payload = payload.into();
        let mut report = BroadcastReport::default();

        for conn in self.snapshot() {
            if !predicate(&conn) {
                continue;
            }
            match conn.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(user_id = %conn.user_id(), error = %e, "Broadcast skipped connection");
                    report.failed.push((conn.user_id().clone(), e));
                }
            }
        }

        report
    }

    /// Closes every connection idle for at least `max_idle`.
    ///
    /// The connections unregister themselves as their tasks wind down.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let mut reaped = 0;
        for conn in self.snapshot() {
            let idle = conn.idle_for();
            if idle >= max_idle && conn.close() {
                info!(
                    user_id = %conn.user_id(),
                    connection_id = %conn.id(),
                    idle_secs = idle.as_secs(),
                    "Closed idle connection"
                );
                reaped += 1;
            }
        }
        reaped
    }

    /// Closes every registered connection. Used on shutdown.
    pub fn close_all(&self) -> usize {
        self.snapshot().iter().filter(|conn| conn.close()).count()
    }

    /// Online users, sorted.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.inner.connections.read().keys().cloned().collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.read().is_empty()
    }

    /// Subscribes to presence changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.inner.events.subscribe()
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.connections.read().values().cloned().collect()
    }

    fn publish(&self, event: PresenceEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

/// Tells a displaced connection why, then closes it.
fn displace(old: &Connection) {
    match Envelope::new(
        EventKind::Replaced,
        Replaced {
            reason: REPLACED_REASON.to_string(),
        },
    )
    .to_bytes()
    {
        Ok(notice) => {
            if let Err(e) = old.try_send(notice) {
                debug!(connection_id = %old.id(), error = %e, "Could not notify displaced connection");
            }
        }
        Err(e) => debug!(error = %e, "Failed to encode replacement notice"),
    }
    old.close();
}

/// Spawns a background task that closes idle connections periodically.
///
/// Stops when `cancel_token` fires.
pub fn spawn_idle_reaper(
    registry: Registry,
    every: Duration,
    max_idle: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Idle reaper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let reaped = registry.reap_idle(max_idle);
                    if reaped > 0 {
                        debug!(reaped, "Idle reaper pass complete");
                    }
                }
            }
        }
    })
}
