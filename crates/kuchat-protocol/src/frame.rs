//! Inbound frame: a numeric kind plus an opaque payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Width of the kind field at the start of every inbound message body.
pub const KIND_LEN: usize = 4;

/// One discrete inbound message unit.
///
/// The body of a transport message is `[kind: u32 big-endian][payload]`.
/// No assumption about the payload's structure is made at this layer;
/// handlers decode it with [`Frame::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: u32,
    payload: Bytes,
}

impl Frame {
    /// Creates a frame from a kind and raw payload bytes.
    pub fn new(kind: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Creates a frame whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(kind: u32, value: &T) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(kind, payload))
    }

    /// Splits a message body into its kind field and the opaque remainder.
    pub fn decode(mut body: Bytes) -> Result<Self, FrameError> {
        if body.len() < KIND_LEN {
            return Err(FrameError::Truncated { len: body.len() });
        }
        let kind = body.get_u32();
        Ok(Self {
            kind,
            payload: body,
        })
    }

    /// Appends the message body (`kind` followed by payload) to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(KIND_LEN + self.payload.len());
        dst.put_u32(self.kind);
        dst.extend_from_slice(&self.payload);
    }

    /// Returns the encoded message body.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(KIND_LEN + self.payload.len());
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn kind(&self) -> u32 {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decodes the JSON payload into `T`.
    ///
    /// The frame is left untouched on failure, so callers may retry with a
    /// different shape or log the raw bytes.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, MalformedPayload> {
        serde_json::from_slice(&self.payload).map_err(|e| MalformedPayload {
            kind: self.kind,
            len: self.payload.len(),
            reason: e.to_string(),
        })
    }
}

/// Errors splitting a message body into a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Frame body too short: {len} bytes (kind field needs {KIND_LEN})")]
    Truncated { len: usize },
}

/// A payload did not match the shape the handler expected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed payload for kind {kind} ({len} bytes): {reason}")]
pub struct MalformedPayload {
    pub kind: u32,
    pub len: usize,
    pub reason: String,
}
