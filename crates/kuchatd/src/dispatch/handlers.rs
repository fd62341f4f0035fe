//! Handlers installed by the daemon.

use async_trait::async_trait;
use tracing::debug;

use kuchat_protocol::{
    kind, Envelope, EventKind, FriendRequest, FriendRequestNotice, Ping, Pong,
};

use super::{DispatchError, Dispatcher, Handler, HandlerError, Request};
use crate::registry::Registry;

/// Answers `PING` with a `Pong` carrying the same sequence number.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, request: Request<'_>) -> Result<(), HandlerError> {
        let ping: Ping = request.parse()?;
        request.reply(EventKind::Pong, Pong { seq: ping.seq }).await
    }
}

/// Relays `FRIEND_REQUEST` to the target user if they are online.
pub struct FriendRequestHandler {
    registry: Registry,
}

impl FriendRequestHandler {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Handler for FriendRequestHandler {
    async fn handle(&self, request: Request<'_>) -> Result<(), HandlerError> {
        let friend_request: FriendRequest = request.parse()?;

        let target = self
            .registry
            .get(&friend_request.target_id)
            .ok_or_else(|| HandlerError::RecipientOffline(friend_request.target_id.clone()))?;

        let notice = Envelope::new(
            EventKind::FriendRequest,
            FriendRequestNotice {
                user: request.user_id().clone(),
                remark: friend_request.remark,
            },
        )
        .to_bytes()?;

        target.send(notice).await?;

        debug!(
            from = %request.user_id(),
            to = %target.user_id(),
            "Friend request delivered"
        );
        Ok(())
    }
}

/// Builds the dispatcher with every built-in handler registered.
pub fn default_dispatcher(registry: &Registry) -> Result<Dispatcher, DispatchError> {
    let mut builder = Dispatcher::builder();
    builder
        .register(kind::PING, PingHandler)?
        .register(
            kind::FRIEND_REQUEST,
            FriendRequestHandler::new(registry.clone()),
        )?;
    Ok(builder.build())
}
