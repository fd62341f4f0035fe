//! Length-delimited transport codec.
//!
//! Every message on the byte stream carries a 4-byte big-endian length
//! prefix. Inbound bodies decode into [`Frame`]s; outbound payloads are
//! written as-is so the receiving client sees exactly the bytes handed to
//! `Connection::send`.

use std::io;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::frame::{Frame, FrameError};

/// Maximum message size (1 MB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 1_048_576;

/// Codec for the server side of a connection.
///
/// Decodes `Frame`s and encodes raw outbound payloads (`Bytes`). `Frame`
/// can also be encoded, which is what clients and tests use to talk to the
/// server.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max)
                .new_codec(),
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.inner.max_frame_length()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match self.inner.decode(src)? {
            Some(body) => Ok(Some(Frame::decode(body.freeze())?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.inner.encode(payload, dst)?;
        Ok(())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.inner.encode(frame.to_bytes(), dst)?;
        Ok(())
    }
}

/// Errors from the transport codec. Both variants end the stream.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Socket failure, or a length prefix above the configured maximum
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol violation: {0}")]
    Frame(#[from] FrameError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn length_prefixed(body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn test_decode_waits_for_full_message() {
        let mut codec = FrameCodec::new();
        let full = length_prefixed(&[0, 0, 0, 1, b'{', b'}']);

        let mut partial = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut whole = full.clone();
        let frame = codec.decode(&mut whole).unwrap().unwrap();
        assert_eq!(frame.kind(), 1);
        assert_eq!(frame.payload().as_ref(), b"{}");
        assert!(whole.is_empty());
    }

    #[test]
    fn test_decode_two_messages_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = length_prefixed(&[0, 0, 0, 1, b'a']);
        buf.extend_from_slice(&length_prefixed(&[0, 0, 0, 2, b'b']));

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((first.kind(), second.kind()), (1, 2));
    }

    #[test]
    fn test_decode_rejects_short_body() {
        let mut codec = FrameCodec::new();
        let mut buf = length_prefixed(&[0, 1]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Frame(FrameError::Truncated { len: 2 })));
    }

    #[test]
    fn test_decode_rejects_oversized_message() {
        let mut codec = FrameCodec::with_max_frame_len(8);
        let mut buf = length_prefixed(&[0u8; 16]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Io(_))));
    }

    #[test]
    fn test_encode_payload_is_verbatim() {
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec
            .encode(Bytes::from_static(br#"{"id":4}"#), &mut dst)
            .unwrap();
        assert_eq!(&dst[..4], &8u32.to_be_bytes());
        assert_eq!(&dst[4..], br#"{"id":4}"#);
    }

    #[test]
    fn test_encode_frame_round_trips_through_decoder() {
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(Frame::new(9, &b"abc"[..]), &mut dst).unwrap();

        let frame = codec.decode(&mut dst).unwrap().unwrap();
        assert_eq!(frame, Frame::new(9, &b"abc"[..]));
    }
}
