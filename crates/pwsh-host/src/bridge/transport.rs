//! Channel transport between the manager and the host process.
//!
//! Platform-specific addressing:
//! - Unix domain socket at `<tmpdir>/<token>` (macOS, Linux, BSD)
//! - Named pipe `\\.\pipe\<token>` on Windows
//!
//! The host process binds the endpoint while it boots; the manager side here
//! is purely a client, polling for connectability until a budget elapses.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;

use super::codec::HostCodec;
use super::protocol::HostRequest;

/// Interval between connect attempts while waiting for the host to bind.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[cfg(unix)]
type ChannelStream = tokio::net::UnixStream;
#[cfg(windows)]
type ChannelStream = tokio::net::windows::named_pipe::NamedPipeClient;

#[cfg(unix)]
async fn connect_stream(path: &Path) -> io::Result<ChannelStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(windows)]
async fn connect_stream(path: &Path) -> io::Result<ChannelStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(path)
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("channel at {path} never became connectable within {budget:?}")]
    Timeout {
        path: PathBuf,
        budget: Duration,
        #[source]
        source: io::Error,
    },
}

/// Address of one host instance's channel.
///
/// The token is the opaque identifier handed to the child process on its
/// command line; the path is the full platform address derived from it.
#[derive(Debug, Clone)]
pub struct Endpoint {
    token: String,
    path: PathBuf,
}

impl Endpoint {
    /// Generate a fresh unique endpoint.
    pub fn random() -> Self {
        let token = format!("pwsh-host-{}", uuid::Uuid::new_v4());
        Self::from_token(token)
    }

    pub fn from_token(token: String) -> Self {
        #[cfg(unix)]
        let path = std::env::temp_dir().join(&token);
        #[cfg(windows)]
        let path = PathBuf::from(format!(r"\\.\pipe\{token}"));
        Self { token, path }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One bidirectional byte stream to the host process, framed by [`HostCodec`].
#[derive(Debug)]
pub struct Channel {
    framed: Framed<ChannelStream, HostCodec>,
    path: PathBuf,
    open: bool,
}

impl Channel {
    /// Connect to `endpoint`, polling every 200 ms until `budget` elapses.
    ///
    /// On timeout the half-started child process is still running; the caller
    /// owns killing it and closing its streams before surfacing the error.
    pub async fn connect(endpoint: &Endpoint, budget: Duration) -> Result<Self, ConnectError> {
        let deadline = Instant::now() + budget;
        tracing::debug!(path = %endpoint.path().display(), ?budget, "Connecting to host channel");
        loop {
            match connect_stream(endpoint.path()).await {
                Ok(stream) => {
                    tracing::debug!(path = %endpoint.path().display(), "Channel connected");
                    return Ok(Self {
                        framed: Framed::new(stream, HostCodec::new()),
                        path: endpoint.path().to_path_buf(),
                        open: true,
                    });
                }
                Err(e) if Instant::now() + CONNECT_POLL_INTERVAL >= deadline => {
                    tracing::warn!(
                        path = %endpoint.path().display(),
                        error = %e,
                        "Channel connect budget exhausted"
                    );
                    return Err(ConnectError::Timeout {
                        path: endpoint.path().to_path_buf(),
                        budget,
                        source: e,
                    });
                }
                Err(e) => {
                    tracing::trace!(error = %e, "Channel not connectable yet, retrying");
                    tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Write one request through the codec. `Framed::send` performs the full
    /// write and flush; a short or failed write surfaces as the underlying
    /// broken-pipe class error and is not retried here.
    pub async fn send(&mut self, request: HostRequest) -> io::Result<()> {
        self.framed.send(request).await
    }

    /// Read the single response frame for the in-flight command.
    ///
    /// A zero-length frame is the null marker and yields `None`. End of
    /// stream before a frame arrives means the host went away mid-command.
    pub async fn read_response(&mut self) -> io::Result<Option<Bytes>> {
        match self.framed.next().await {
            Some(Ok(frame)) if frame.is_empty() => Ok(None),
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel closed before a response frame arrived",
            )),
        }
    }

    /// Liveness introspection: the handle is open and the endpoint still
    /// stats. Check failures report invalid, they never propagate.
    pub fn is_valid(&self) -> bool {
        if !self.open {
            return false;
        }
        #[cfg(unix)]
        {
            std::fs::metadata(&self.path).is_ok()
        }
        #[cfg(windows)]
        {
            // The pipe namespace is not meaningfully stat-able; the open flag
            // is the whole check here.
            true
        }
    }

    /// Best-effort shutdown. The channel reports invalid afterwards.
    pub async fn close(&mut self) {
        self.open = false;
        if let Err(e) = self.framed.get_mut().shutdown().await {
            tracing::debug!(path = %self.path.display(), error = %e, "Channel shutdown failed");
        }
    }
}
