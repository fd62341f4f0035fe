//! A decoded inbound frame bound to the connection it arrived on.

use serde::de::DeserializeOwned;
use serde::Serialize;

use kuchat_core::UserId;
use kuchat_protocol::{Envelope, EventKind, Frame, MalformedPayload};

use super::HandlerError;
use crate::connection::Connection;

/// One inbound message, handed by value to exactly one handler.
///
/// The connection is borrowed for the duration of the handler call only,
/// so a request cannot be kept around after its handler returns. Handlers
/// that need to reach a connection later must look it up again through
/// the registry.
#[derive(Debug)]
pub struct Request<'a> {
    frame: Frame,
    connection: &'a Connection,
}

impl<'a> Request<'a> {
    pub fn new(frame: Frame, connection: &'a Connection) -> Self {
        Self { frame, connection }
    }

    pub fn kind(&self) -> u32 {
        self.frame.kind()
    }

    /// Raw payload bytes, untouched by any decode attempt.
    pub fn payload(&self) -> &[u8] {
        self.frame.payload()
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// The connection the frame arrived on.
    pub fn connection(&self) -> &'a Connection {
        self.connection
    }

    /// The sender of the frame.
    pub fn user_id(&self) -> &'a UserId {
        self.connection.user_id()
    }

    /// Decodes the payload into the shape this kind expects.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, MalformedPayload> {
        self.frame.parse()
    }

    /// Sends an event envelope back to the originating connection.
    pub async fn reply<T: Serialize>(&self, kind: EventKind, data: T) -> Result<(), HandlerError> {
        let bytes = Envelope::new(kind, data).to_bytes()?;
        self.connection.send(bytes).await?;
        Ok(())
    }
}
