//! Registry errors and presence events.

use thiserror::Error;

use kuchat_core::UserId;

use crate::connection::{ConnectionId, SendError};

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry has reached its maximum number of online users.
    #[error("registry is full (max: {max} connections)")]
    Full {
        /// Maximum number of connections allowed
        max: usize,
    },
}

/// Presence changes published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// A user with no live connection came online.
    Online {
        user_id: UserId,
        connection_id: ConnectionId,
    },

    /// A newer connection displaced the user's previous one.
    Replaced {
        user_id: UserId,
        previous: ConnectionId,
        current: ConnectionId,
    },

    /// The user's current connection was unregistered.
    Offline {
        user_id: UserId,
        connection_id: ConnectionId,
    },
}

impl PresenceEvent {
    pub fn user_id(&self) -> &UserId {
        match self {
            PresenceEvent::Online { user_id, .. }
            | PresenceEvent::Replaced { user_id, .. }
            | PresenceEvent::Offline { user_id, .. } => user_id,
        }
    }
}

/// Outcome of [`Registry::broadcast`](super::Registry::broadcast).
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Connections the payload was queued on
    pub delivered: usize,

    /// Connections that refused the payload, with the reason
    pub failed: Vec<(UserId, SendError)>,
}
