//! Concurrent execution engine for a single command.
//!
//! One call moves through Writing → Draining → Decoding. During Draining
//! three futures run concurrently and are all joined before control returns:
//! the primary reader (the channel's single response frame) and one drain per
//! native stream (child stdout, child stderr). The native streams are
//! unrelated to the channel, so the only way to stop their drains at the
//! right moment is a completion signal raised when the primary reader
//! finishes — success or failure.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use crate::bridge::protocol::{HostRequest, ResponseMap};
use crate::bridge::transport::Channel;

const DRAIN_CHUNK: usize = 8192;

/// Everything one command produced.
#[derive(Debug)]
pub(crate) struct CommandOutcome {
    /// Decoded response body, or `None` for a zero-length response frame.
    pub response: Option<ResponseMap>,
    pub native_stdout: Vec<u8>,
    pub native_stderr: Vec<u8>,
}

/// Write the EXECUTE request and drain all three streams until the channel
/// answers. Errors from the write or the primary reader surface here; the
/// native-stream drains never fail the call.
pub(crate) async fn run_command<O, E>(
    channel: &mut Channel,
    stdout: &mut O,
    stderr: &mut E,
    payload: String,
) -> io::Result<CommandOutcome>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    channel.send(HostRequest::Execute(payload)).await?;

    let (done_tx, done_rx) = watch::channel(false);
    let primary = async {
        let result = channel.read_response().await;
        // Raised on success AND failure: the drains must never outlive the
        // primary reader, and must never stop before it.
        let _ = done_tx.send(true);
        result
    };

    let (frame, native_stdout, native_stderr) = tokio::join!(
        primary,
        drain_stream(stdout, done_rx.clone()),
        drain_stream(stderr, done_rx),
    );

    let response = match frame? {
        Some(bytes) => {
            tracing::trace!(frame_len = bytes.len(), "Decoding response body");
            Some(ResponseMap::decode(bytes)?)
        }
        None => {
            tracing::debug!("Host sent a null response body");
            None
        }
    };

    Ok(CommandOutcome {
        response,
        native_stdout,
        native_stderr,
    })
}

/// Drain one native stream until EOF or the done signal.
///
/// After the signal, exactly one more zero-timeout read attempt captures any
/// final bytes already in flight; that closes the race between the primary
/// reader finishing and residual native output still being buffered.
pub(crate) async fn drain_stream<R>(stream: &mut R, mut done: watch::Receiver<bool>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut buf = [0u8; DRAIN_CHUNK];
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(e) => {
                    tracing::debug!(error = %e, "Native stream read failed, stopping drain");
                    break;
                }
            },
            _ = done.changed() => {
                if let Ok(Ok(n)) = tokio::time::timeout(Duration::ZERO, stream.read(&mut buf)).await
                    && n > 0
                {
                    collected.extend_from_slice(&buf[..n]);
                }
                break;
            }
        }
    }
    collected
}
