//! Identify handshake on raw TCP connections.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use kuchat_protocol::{
    kind, CodecError, Envelope, ErrorNotice, EventKind, FrameCodec, Identify, MalformedPayload,
    ProtocolVersion,
};

/// Reads the first frame and validates it as `IDENTIFY`.
pub(crate) async fn identify<S>(
    framed: &mut Framed<S, FrameCodec>,
    limit: Duration,
) -> Result<Identify, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = match timeout(limit, framed.next()).await {
        Err(_) => return Err(HandshakeError::Timeout(limit)),
        Ok(None) => return Err(HandshakeError::Disconnected),
        Ok(Some(Err(e))) => return Err(HandshakeError::Codec(e)),
        Ok(Some(Ok(frame))) => frame,
    };

    if frame.kind() != kind::IDENTIFY {
        return Err(HandshakeError::UnexpectedKind { kind: frame.kind() });
    }

    let identify: Identify = frame.parse()?;

    if !identify
        .protocol_version
        .is_compatible_with(&ProtocolVersion::CURRENT)
    {
        return Err(HandshakeError::VersionMismatch {
            client: identify.protocol_version,
            server: ProtocolVersion::CURRENT,
        });
    }

    Ok(identify)
}

/// Tells the peer why the handshake failed, if it can still hear it.
pub(crate) async fn reject<S>(
    framed: &mut Framed<S, FrameCodec>,
    error: &HandshakeError,
    limit: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if matches!(
        error,
        HandshakeError::Disconnected | HandshakeError::Codec(_)
    ) {
        return;
    }

    let notice = Envelope::new(
        EventKind::Error,
        ErrorNotice::new(Some(kind::IDENTIFY), error.to_string()),
    );

    match notice.to_bytes() {
        Ok(bytes) => {
            if !matches!(timeout(limit, framed.send(bytes)).await, Ok(Ok(()))) {
                debug!("Could not deliver handshake rejection");
            }
        }
        Err(e) => debug!(error = %e, "Failed to encode handshake rejection"),
    }
}

/// Reasons a raw connection is dropped before registration.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Identify frame not received within {0:?}")]
    Timeout(Duration),

    #[error("Peer disconnected before identifying")]
    Disconnected,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Expected identify frame first, got kind {kind}")]
    UnexpectedKind { kind: u32 },

    #[error(transparent)]
    Malformed(#[from] MalformedPayload),

    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },
}
