//! Host process bootstrap.
//!
//! The executable path, base argument list, and bootstrap script are opaque
//! inputs; this module only assembles the launch and supervises OS-level
//! liveness. The host takes no stdin, so it is closed at spawn; stdout and
//! stderr are captured for the execution engine's native-output drains.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::bridge::transport::Endpoint;

/// Everything needed to launch one host process, minus the endpoint.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub bootstrap: PathBuf,
    pub debug: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn host process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different host spawn strategies.
///
/// The default spawner launches the real interpreter host; tests substitute a
/// spawner that starts a scripted protocol server next to a placeholder child.
pub trait HostSpawner: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec, endpoint: &Endpoint) -> Result<Child, SpawnError>;
}

/// Default spawner: `exe args... -File <bootstrap> <token> [-EmitDebugOutput]`.
pub struct PwshSpawner;

impl HostSpawner for PwshSpawner {
    fn spawn(&self, spec: &LaunchSpec, endpoint: &Endpoint) -> Result<Child, SpawnError> {
        let mut command = Command::new(&spec.executable);
        command
            .args(&spec.args)
            .arg("-File")
            .arg(&spec.bootstrap)
            .arg(endpoint.token());
        if spec.debug {
            command.arg("-EmitDebugOutput");
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            executable = %spec.executable.display(),
            token = endpoint.token(),
            debug = spec.debug,
            "Spawning host process"
        );
        let child = command.spawn()?;
        tracing::info!(pid = child.id(), "Host process spawned");
        Ok(child)
    }
}

/// OS-level liveness. Not a substitute for channel liveness: a process can be
/// running with a dead channel and vice versa for a short window.
pub fn process_alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// Kill and reap, swallowing errors. Used on unhappy paths where leaving an
/// orphaned process behind is the one unacceptable outcome.
pub async fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Kill signal failed (process likely already gone)");
    }
    match child.wait().await {
        Ok(status) => tracing::debug!(%status, "Host process reaped"),
        Err(e) => tracing::debug!(error = %e, "Failed to reap host process"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            executable: PathBuf::from("/bin/sleep"),
            args: vec!["30".to_string()],
            bootstrap: PathBuf::from("/opt/host/bootstrap.ps1"),
            debug: false,
        }
    }

    #[tokio::test]
    async fn spawned_process_is_alive_then_reaped() {
        let endpoint = Endpoint::random();
        let mut child = PwshSpawner.spawn(&spec(), &endpoint).unwrap();

        assert!(process_alive(&mut child));

        kill_and_reap(&mut child).await;
        assert!(!process_alive(&mut child));
    }

    #[tokio::test]
    async fn spawn_missing_executable_errors() {
        let bad = LaunchSpec {
            executable: PathBuf::from("/nonexistent/host-binary"),
            ..spec()
        };
        let endpoint = Endpoint::random();

        assert!(matches!(
            PwshSpawner.spawn(&bad, &endpoint),
            Err(SpawnError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn captured_streams_are_piped() {
        let endpoint = Endpoint::random();
        let mut child = PwshSpawner.spawn(&spec(), &endpoint).unwrap();

        assert!(child.stdout.is_some());
        assert!(child.stderr.is_some());
        assert!(child.stdin.is_none(), "host takes no stdin");

        kill_and_reap(&mut child).await;
    }
}
