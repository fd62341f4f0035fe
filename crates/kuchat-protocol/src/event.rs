//! Outbound event envelope.
//!
//! Everything the server pushes to a client is a JSON object of the form
//! `{"id": <event id>, "data": {...}}`. The rest of the application builds
//! its own envelopes the same way before calling `Connection::send`.

use bytes::Bytes;
use kuchat_core::UserId;
use serde::{Deserialize, Serialize};

use crate::version::ProtocolVersion;

/// Event ids understood by chat clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Error,
    Connected,
    FriendRequest,
    Replaced,
    Pong,
}

impl EventKind {
    /// Returns the numeric id carried in the envelope.
    pub const fn id(self) -> u32 {
        match self {
            EventKind::Error => 0,
            EventKind::Connected => 1,
            EventKind::FriendRequest => 2,
            EventKind::Replaced => 3,
            EventKind::Pong => 4,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(EventKind::Error),
            1 => Some(EventKind::Connected),
            2 => Some(EventKind::FriendRequest),
            3 => Some(EventKind::Replaced),
            4 => Some(EventKind::Pong),
            _ => None,
        }
    }
}

/// `{ id, data }` wrapper for pushed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u32,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(kind: EventKind, data: T) -> Self {
        Self {
            id: kind.id(),
            data,
        }
    }

    /// Builds an envelope with an application-defined id.
    pub fn with_id(id: u32, data: T) -> Self {
        Self { id, data }
    }

    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_id(self.id)
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope into the bytes handed to `Connection::send`.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Body of `EventKind::Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// Kind of the inbound frame that failed, when there was one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<u32>,
    pub message: String,
}

impl ErrorNotice {
    pub fn new(kind: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Body of `EventKind::Connected`, sent after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    pub user_id: UserId,
    pub protocol_version: ProtocolVersion,
}

/// Body of `EventKind::Replaced`, sent to a connection displaced by a newer
/// login of the same user right before it is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replaced {
    pub reason: String,
}

/// Body of `EventKind::Pong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub seq: u64,
}

/// Body of `EventKind::FriendRequest`, pushed to the request's target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequestNotice {
    /// The requesting user
    pub user: UserId,
    pub remark: String,
}
