//! Reader and writer tasks of an attached connection.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use kuchat_protocol::{CodecError, FrameCodec};

use super::Connection;
use crate::config::ConnectionConfig;
use crate::dispatch::{Dispatcher, Request};
use crate::registry::Registry;

type FrameSink<S> = SplitSink<Framed<S, FrameCodec>, Bytes>;
type FrameStream<S> = SplitStream<Framed<S, FrameCodec>>;

/// Drives one registered connection until it closes, then unregisters it.
///
/// The writer runs on its own task; the reader runs here. Whichever side
/// fails first closes the connection, which stops the other. This function
/// is the only place that unregisters, so it happens exactly once.
pub(crate) async fn serve<S>(
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<Bytes>,
    framed: Framed<S, FrameCodec>,
    dispatcher: Arc<Dispatcher>,
    registry: Registry,
    settings: ConnectionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = framed.split::<Bytes>();

    let writer = tokio::spawn(write_loop(Arc::clone(&conn), outbound, sink, settings));

    read_loop(&conn, stream, &dispatcher).await;
    conn.close();

    if let Err(e) = writer.await {
        error!(
            user_id = %conn.user_id(),
            connection_id = %conn.id(),
            error = %e,
            "Writer task failed"
        );
    }

    registry.unregister(conn.user_id(), &conn);

    info!(
        user_id = %conn.user_id(),
        connection_id = %conn.id(),
        "Client disconnected"
    );
}

/// Reads frames and dispatches them strictly one after another.
async fn read_loop<S>(conn: &Connection, mut stream: FrameStream<S>, dispatcher: &Dispatcher)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let next = tokio::select! {
            _ = conn.closed() => {
                debug!(connection_id = %conn.id(), "Reader stopping, connection closed");
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                conn.touch();
                debug!(
                    user_id = %conn.user_id(),
                    connection_id = %conn.id(),
                    kind = frame.kind(),
                    len = frame.payload().len(),
                    "Received frame"
                );

                // Failures are logged and answered inside dispatch. A close
                // abandons the in-flight handler so cleanup is never held up.
                tokio::select! {
                    _ = conn.closed() => {
                        debug!(
                            connection_id = %conn.id(),
                            "Connection closed during dispatch, abandoning handler"
                        );
                        return;
                    }
                    _ = dispatcher.dispatch(Request::new(frame, conn)) => {}
                }
            }
            Some(Err(e)) => {
                warn!(
                    user_id = %conn.user_id(),
                    connection_id = %conn.id(),
                    error = %e,
                    "Read failed, closing connection"
                );
                return;
            }
            None => {
                debug!(connection_id = %conn.id(), "Peer closed the connection");
                return;
            }
        }
    }
}

/// Performs every raw write for the connection, one payload at a time.
async fn write_loop<S>(
    conn: Arc<Connection>,
    mut outbound: mpsc::Receiver<Bytes>,
    mut sink: FrameSink<S>,
    settings: ConnectionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let write_timeout = settings.write_timeout();
    let mut healthy = true;

    loop {
        let payload = tokio::select! {
            biased;
            _ = conn.closed() => break,
            next = outbound.recv() => match next {
                Some(payload) => payload,
                None => break,
            },
        };

        let failure = match timeout(write_timeout, sink.send(payload)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("write timed out after {write_timeout:?}")),
        };

        if let Some(reason) = failure {
            warn!(
                user_id = %conn.user_id(),
                connection_id = %conn.id(),
                error = %reason,
                "Write failed, closing connection"
            );
            healthy = false;
            conn.close();
            break;
        }
    }

    // Refuse new payloads; anything already queued is flushed below or dropped
    outbound.close();

    if healthy {
        drain(&conn, &mut outbound, &mut sink, &settings).await;
    }

    if let Ok(Err(e)) = timeout(write_timeout, sink.close()).await {
        debug!(connection_id = %conn.id(), error = %e, "Socket shutdown failed");
    }
}

/// Flushes payloads queued before the close, bounded by `close_drain`.
async fn drain<S>(
    conn: &Connection,
    outbound: &mut mpsc::Receiver<Bytes>,
    sink: &mut FrameSink<S>,
    settings: &ConnectionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let flushed = timeout(settings.close_drain(), async {
        let mut count = 0usize;
        while let Some(payload) = outbound.recv().await {
            sink.send(payload).await?;
            count += 1;
        }
        Ok::<usize, CodecError>(count)
    })
    .await;

    match flushed {
        Ok(Ok(0)) => {}
        Ok(Ok(count)) => {
            debug!(connection_id = %conn.id(), count, "Flushed queued payloads on close");
        }
        Ok(Err(e)) => {
            debug!(connection_id = %conn.id(), error = %e, "Flush on close failed");
        }
        Err(_) => {
            debug!(
                connection_id = %conn.id(),
                "Close drain deadline reached, discarding queued payloads"
            );
        }
    }
}
