//! The framed transport boundary.
//!
//! The enclave speaks length-one-JSON-object frames over a local trusted
//! stream socket: either newline-delimited or 4-byte length-prefixed,
//! selected by configuration. Each connection is served by its own task;
//! responses are written in request order. A malformed frame is answered
//! with an error envelope, never by closing the connection.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::dispatch::Dispatcher;
use crate::proto::Response;

/// Upper bound on a single request frame.
const MAX_FRAME_BYTES: usize = 1 << 20;

/// How request and response frames are delimited on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Framing {
    /// One JSON object per `\n`-terminated line.
    Newline,
    /// Each JSON object preceded by a big-endian u32 length.
    LengthPrefixed,
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Framing::Newline => "newline",
            Framing::LengthPrefixed => "length-prefixed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Lines(#[from] LinesCodecError),
    #[error("response encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Accepts connections until `shutdown` fires, then drains in-flight
/// connection tasks.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    framing: Framing,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "connection accepted");
                        let dispatcher = dispatcher.clone();
                        let shutdown = shutdown.clone();
                        tracker.spawn(async move {
                            if let Err(error) =
                                handle_connection(stream, dispatcher, framing, shutdown).await
                            {
                                tracing::warn!(%peer, %error, "connection closed with error");
                            }
                        });
                    }
                    Err(error) => tracing::warn!(%error, "accept failed"),
                }
            }
        }
    }
    tracker.close();
    tracker.wait().await;
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    framing: Framing,
    shutdown: CancellationToken,
) -> Result<(), ConnectionError> {
    match framing {
        Framing::Newline => serve_newline(stream, dispatcher, shutdown).await,
        Framing::LengthPrefixed => serve_length_prefixed(stream, dispatcher, shutdown).await,
    }
}

async fn serve_newline(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> Result<(), ConnectionError> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = framed.next() => {
                let Some(frame) = frame else { return Ok(()) };
                let response = dispatcher.dispatch_frame(&frame?).await;
                framed.send(serde_json::to_string(&response)?).await?;
            }
        }
    }
}

async fn serve_length_prefixed(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> Result<(), ConnectionError> {
    let mut framed = Framed::new(
        stream,
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec(),
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = framed.next() => {
                let Some(frame) = frame else { return Ok(()) };
                let frame = frame?;
                let response = match std::str::from_utf8(&frame) {
                    Ok(request) => dispatcher.dispatch_frame(request).await,
                    Err(_) => Response::failure("invalid command: frame is not utf-8"),
                };
                framed.send(Bytes::from(serde_json::to_vec(&response)?)).await?;
            }
        }
    }
}
