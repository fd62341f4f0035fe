//! Inbound message kinds and the payload shapes that go with them.

use kuchat_core::UserId;
use serde::{Deserialize, Serialize};

use crate::version::ProtocolVersion;

/// Numeric kinds of client-to-server frames.
pub mod kind {
    /// First frame on a raw connection; carries the authenticated user id
    pub const IDENTIFY: u32 = 0;

    /// Keep-alive; answered with a `Pong` event
    pub const PING: u32 = 1;

    /// Ask another user to become a friend
    pub const FRIEND_REQUEST: u32 = 2;
}

/// Handshake payload (`kind::IDENTIFY`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    /// User id assigned by the upstream authenticator
    pub user_id: UserId,

    #[serde(default)]
    pub protocol_version: ProtocolVersion,
}

impl Identify {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }
}

/// Keep-alive payload (`kind::PING`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Sequence number echoed back in the pong
    pub seq: u64,
}

/// Friend request payload (`kind::FRIEND_REQUEST`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequest {
    pub target_id: UserId,

    #[serde(default)]
    pub remark: String,
}
