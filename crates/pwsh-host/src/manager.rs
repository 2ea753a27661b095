//! Manager facade: the public `execute` / `exit` / `is_alive` surface.
//!
//! One `Manager` owns one host process, one channel, and the two captured
//! native streams. Transport failures never raise past this layer — they
//! poison the instance and come back as a `{exitcode: -1, ...}` result so the
//! registry can hand out a replacement on the next lookup. Only instance
//! construction raises, since there is no partially-valid instance to return.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::Mutex;

use crate::bridge::protocol::HostRequest;
use crate::bridge::transport::{Channel, ConnectError, Endpoint};
use crate::exec::{self, CommandOutcome};
use crate::spawn::{self, HostSpawner, LaunchSpec, PwshSpawner, SpawnError};

/// Host-side default when the caller passes no timeout.
const DEFAULT_TIMEOUT_MS: u32 = 300_000;
/// Poll granularity floor of the host's own timeout loop.
const MIN_TIMEOUT_MS: u32 = 50;
/// Default budget for the channel to become connectable.
const DEFAULT_PIPE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `exit()` waits for the host before killing it.
const EXIT_GRACE: Duration = Duration::from_secs(2);

// Bad file descriptor has no dedicated io::ErrorKind.
const EBADF: i32 = 9;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    ConnectTimeout(#[from] ConnectError),
    /// I/O failure outside the transport error set: a programming-error
    /// signal, deliberately not folded into a `-1` result.
    #[error("unexpected i/o failure: {0}")]
    Io(#[from] io::Error),
}

/// Launch configuration. Also the pooling identity: two configs with the same
/// executable, argument list, and debug flag share one instance through the
/// registry.
#[derive(Clone)]
pub struct HostConfig {
    executable: PathBuf,
    args: Vec<String>,
    bootstrap: PathBuf,
    debug: bool,
    pipe_timeout: Duration,
    spawner: Arc<dyn HostSpawner>,
}

impl HostConfig {
    pub fn new(executable: impl Into<PathBuf>, bootstrap: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            bootstrap: bootstrap.into(),
            debug: false,
            pipe_timeout: DEFAULT_PIPE_TIMEOUT,
            spawner: Arc::new(PwshSpawner),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Adds verbose host emission; part of the pooling signature.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Governs the channel-connect wait only, not command execution.
    pub fn with_pipe_timeout(mut self, timeout: Duration) -> Self {
        self.pipe_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn HostSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Deterministic pooling key: executable + argument list + debug flag.
    pub fn signature(&self) -> String {
        format!(
            "{} {} debug:{}",
            self.executable.display(),
            self.args.join(" "),
            self.debug
        )
    }

    fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            executable: self.executable.clone(),
            args: self.args.clone(),
            bootstrap: self.bootstrap.clone(),
            debug: self.debug,
        }
    }
}

/// One command to run on the host.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    /// Milliseconds; `0` means the 300 000 ms default, anything below 50 is
    /// raised to 50.
    pub timeout_ms: u32,
    pub working_dir: Option<String>,
    /// `NAME=VALUE` pairs, applied in order.
    pub environment: Vec<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout_ms: 0,
            working_dir: None,
            environment: Vec::new(),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_environment(mut self, environment: Vec<String>) -> Self {
        self.environment = environment;
        self
    }
}

/// What one command produced, merged across the channel and the native
/// streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `-1` iff the transport classified the attempt as a terminal failure.
    pub exitcode: i32,
    /// Structured output reported over the channel.
    pub stdout: Option<String>,
    /// Native stderr lines, with any channel-reported error string appended.
    pub stderr: Vec<String>,
    /// Raw native stdout, separate from the structured `stdout`.
    pub native_stdout: Option<String>,
    /// Host-reported catastrophic failure, distinct from a nonzero exit.
    pub errormessage: Option<String>,
}

impl ExecutionResult {
    /// The `-1` shape: diagnostics in `stderr`, channel-native output absent.
    fn transport_failure(error: &dyn std::error::Error) -> Self {
        let mut stderr = vec![error.to_string()];
        let mut source = error.source();
        while let Some(cause) = source {
            stderr.push(cause.to_string());
            source = cause.source();
        }
        Self {
            exitcode: -1,
            stdout: None,
            stderr,
            native_stdout: None,
            errormessage: None,
        }
    }

    fn from_outcome(outcome: CommandOutcome) -> Self {
        let native_stdout = if outcome.native_stdout.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&outcome.native_stdout).into_owned())
        };
        let mut stderr: Vec<String> = String::from_utf8_lossy(&outcome.native_stderr)
            .lines()
            .map(str::to_string)
            .collect();

        let (exitcode, stdout, errormessage) = match outcome.response {
            Some(map) => (
                map.exitcode(),
                map.get("stdout").map(str::to_string),
                map.get("errormessage")
                    .filter(|m| !m.is_empty())
                    .map(str::to_string),
            ),
            None => (0, None, None),
        };

        // Fold the channel-reported error in after whatever the native
        // stream already produced.
        if let Some(message) = &errormessage {
            stderr.push(message.clone());
        }

        Self {
            exitcode,
            stdout,
            stderr,
            native_stdout,
            errormessage,
        }
    }
}

struct ManagerInner {
    child: Child,
    channel: Channel,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    usable: bool,
}

/// A live host instance.
pub struct Manager {
    signature: String,
    pid: Option<u32>,
    inner: Mutex<ManagerInner>,
}

impl Manager {
    /// Spawn the host and connect its channel.
    ///
    /// On connect timeout the half-started process is killed and reaped and
    /// its streams dropped before the error surfaces — construction never
    /// leaves a process behind.
    pub async fn connect(config: HostConfig) -> Result<Self, ManagerError> {
        let endpoint = Endpoint::random();
        let spec = config.launch_spec();
        let mut child = config.spawner.spawn(&spec, &endpoint)?;
        let pid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if stdout.is_none() || stderr.is_none() {
            spawn::kill_and_reap(&mut child).await;
            return Err(SpawnError::Other("host streams not captured".to_string()).into());
        }

        let channel = match Channel::connect(&endpoint, config.pipe_timeout).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(error = %e, pid, "Channel never connected, cleaning up host");
                drop(stdout);
                drop(stderr);
                spawn::kill_and_reap(&mut child).await;
                return Err(e.into());
            }
        };

        tracing::info!(pid, signature = %config.signature(), "Host instance ready");
        Ok(Self {
            signature: config.signature(),
            pid,
            inner: Mutex::new(ManagerInner {
                child,
                channel,
                stdout,
                stderr,
                usable: true,
            }),
        })
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Run one command and reassemble its result.
    ///
    /// Transport and protocol failures come back as `Ok` with `exitcode: -1`
    /// and the instance marked unusable; unexpected error kinds propagate.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ManagerError> {
        let mut inner = self.inner.lock().await;
        if !inner.usable {
            tracing::warn!(pid = self.pid, "Execute on an unusable instance");
            return Ok(ExecutionResult::transport_failure(&io::Error::new(
                io::ErrorKind::NotConnected,
                "host instance is no longer usable",
            )));
        }

        let payload = wrap_command(&request);
        tracing::debug!(pid = self.pid, payload_len = payload.len(), "Executing command");

        let inner = &mut *inner;
        let (Some(stdout), Some(stderr)) = (inner.stdout.as_mut(), inner.stderr.as_mut()) else {
            inner.usable = false;
            return Ok(ExecutionResult::transport_failure(&io::Error::new(
                io::ErrorKind::NotConnected,
                "host streams already closed",
            )));
        };

        match exec::run_command(&mut inner.channel, stdout, stderr, payload).await {
            Ok(outcome) => {
                let result = ExecutionResult::from_outcome(outcome);
                tracing::debug!(pid = self.pid, exitcode = result.exitcode, "Command finished");
                Ok(result)
            }
            Err(e) if is_transport_error(&e) => {
                tracing::warn!(pid = self.pid, error = %e, "Transport failure, poisoning instance");
                inner.usable = false;
                Ok(ExecutionResult::transport_failure(&e))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ask the host to exit and tear the instance down. Best-effort
    /// throughout: teardown failures are logged, never returned.
    pub async fn exit(&self) {
        let mut inner = self.inner.lock().await;
        // First, so no further execute is attempted against a closing
        // instance.
        inner.usable = false;

        if inner.channel.is_valid() {
            if let Err(e) = inner.channel.send(HostRequest::Exit).await {
                tracing::debug!(pid = self.pid, error = %e, "EXIT request failed");
            }
        }
        inner.channel.close().await;
        inner.stdout.take();
        inner.stderr.take();

        match tokio::time::timeout(EXIT_GRACE, inner.child.wait()).await {
            Ok(Ok(status)) => tracing::info!(pid = self.pid, %status, "Host exited"),
            Ok(Err(e)) => tracing::debug!(pid = self.pid, error = %e, "Host wait failed"),
            Err(_) => {
                tracing::warn!(pid = self.pid, "Host ignored EXIT within grace period, killing");
                spawn::kill_and_reap(&mut inner.child).await;
            }
        }
    }

    /// Health check: OS process alive, not poisoned, channel and both native
    /// handles valid. Never raises.
    pub async fn is_alive(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.usable
            && spawn::process_alive(&mut inner.child)
            && inner.channel.is_valid()
            && inner.stdout.is_some()
            && inner.stderr.is_some()
    }
}

/// Transport error classification: the narrow set of conditions that mean
/// the channel is no longer trustworthy. `InvalidData` covers protocol decode
/// failures, which poison the instance the same way.
fn is_transport_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::InvalidData
    ) || error.raw_os_error() == Some(EBADF)
}

fn normalize_timeout_ms(requested: u32) -> u32 {
    if requested == 0 {
        DEFAULT_TIMEOUT_MS
    } else {
        requested.max(MIN_TIMEOUT_MS)
    }
}

fn escape_single_quotes(text: &str) -> String {
    text.replace('\'', "''")
}

/// Render the overrides as a host-native hashtable literal.
fn render_environment(environment: &[String]) -> String {
    let entries: Vec<String> = environment
        .iter()
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair.as_str(), ""));
            format!(
                "'{}' = '{}'",
                escape_single_quotes(name),
                escape_single_quotes(value)
            )
        })
        .collect();
    format!("@{{{}}}", entries.join("; "))
}

/// Wrap the caller's code in the host-native invocation carrying the
/// execution parameters. The code rides in a literal here-string; the host
/// enforces `TimeoutMilliseconds` itself — the manager has no mid-flight
/// cancellation.
fn wrap_command(request: &ExecutionRequest) -> String {
    let timeout_ms = normalize_timeout_ms(request.timeout_ms);
    let working_dir = request
        .working_dir
        .as_deref()
        .unwrap_or("")
        .replace('"', "`\"");
    format!(
        "$params = @{{\n  Code = @'\n{code}\n'@\n  TimeoutMilliseconds = {timeout_ms}\n  WorkingDirectory = \"{working_dir}\"\n  ExecEnvironmentVariables = {environment}\n}}\nInvoke-PowerShellUserCode @params",
        code = request.code,
        environment = render_environment(&request.environment),
    )
}
