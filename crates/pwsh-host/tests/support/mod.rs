//! In-process fake host for integration tests.
//!
//! `ScriptedSpawner` plugs into the manager through the `HostSpawner` seam:
//! it launches a placeholder child process (so OS-level liveness is real) and
//! binds the endpoint's socket itself, answering the wire protocol according
//! to a per-test script.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pwsh_host::bridge::transport::Endpoint;
use pwsh_host::{HostSpawner, LaunchSpec, SpawnError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::watch;

/// What the fake host does with one EXECUTE payload.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Respond with a key/value map frame.
    Map(Vec<(String, Option<String>)>),
    /// Respond with the zero-length null marker.
    NullBody,
    /// Drop the connection without answering.
    HangUp,
}

pub fn map(entries: &[(&str, Option<&str>)]) -> Reply {
    Reply::Map(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect(),
    )
}

pub type Script = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

/// Observable state shared between a test and its fake host.
#[derive(Default)]
pub struct HostState {
    pub payloads: Mutex<Vec<String>>,
    pub exit_received: AtomicBool,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl HostState {
    /// Make the current fake host drop its connection, simulating the host
    /// side of the channel dying mid-session.
    pub fn hang_up(&self) {
        if let Some(stop) = self.stop.lock().unwrap().as_ref() {
            let _ = stop.send(true);
        }
    }

    pub fn last_payload(&self) -> Option<String> {
        self.payloads.lock().unwrap().last().cloned()
    }
}

pub struct ScriptedSpawner {
    script: Script,
    child_command: Vec<String>,
    pub state: Arc<HostState>,
}

impl ScriptedSpawner {
    pub fn new(script: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            child_command: vec!["/bin/sleep".to_string(), "300".to_string()],
            state: Arc::new(HostState::default()),
        }
    }

    /// Replace the placeholder child, e.g. with a shell line that emits
    /// native output before parking.
    pub fn with_child(mut self, command: Vec<String>) -> Self {
        self.child_command = command;
        self
    }
}

/// Spawner that launches the placeholder child but never binds the endpoint,
/// so the channel connect can only time out.
pub struct UnboundSpawner {
    pub spawned_pid: Arc<Mutex<Option<u32>>>,
}

impl UnboundSpawner {
    pub fn new() -> Self {
        Self {
            spawned_pid: Arc::new(Mutex::new(None)),
        }
    }
}

impl HostSpawner for UnboundSpawner {
    fn spawn(&self, _spec: &LaunchSpec, _endpoint: &Endpoint) -> Result<Child, SpawnError> {
        let child = Command::new("/bin/sleep")
            .arg("300")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SpawnError::Spawn)?;
        *self.spawned_pid.lock().unwrap() = child.id();
        Ok(child)
    }
}

impl HostSpawner for ScriptedSpawner {
    fn spawn(&self, _spec: &LaunchSpec, endpoint: &Endpoint) -> Result<Child, SpawnError> {
        let listener = std::os::unix::net::UnixListener::bind(endpoint.path())
            .map_err(SpawnError::Spawn)?;
        listener.set_nonblocking(true).map_err(SpawnError::Spawn)?;
        let listener = UnixListener::from_std(listener).map_err(SpawnError::Spawn)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.state.stop.lock().unwrap() = Some(stop_tx);

        let script = Arc::clone(&self.script);
        let state = Arc::clone(&self.state);
        tokio::spawn(serve(listener, script, state, stop_rx));

        let child = Command::new(&self.child_command[0])
            .args(&self.child_command[1..])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SpawnError::Spawn)?;
        Ok(child)
    }
}

async fn serve(
    listener: UnixListener,
    script: Script,
    state: Arc<HostState>,
    mut stop: watch::Receiver<bool>,
) {
    let mut stream = match listener.accept().await {
        Ok((stream, _)) => stream,
        Err(_) => return,
    };

    loop {
        let mut opcode = [0u8; 1];
        tokio::select! {
            read = stream.read_exact(&mut opcode) => {
                if read.is_err() {
                    return;
                }
            }
            _ = stop.changed() => return,
        }

        match opcode[0] {
            0x00 => {
                state.exit_received.store(true, Ordering::SeqCst);
                return;
            }
            0x01 => {
                let payload = match read_frame(&mut stream).await {
                    Ok(payload) => payload,
                    Err(_) => return,
                };
                state.payloads.lock().unwrap().push(payload.clone());

                match script(&payload) {
                    Reply::Map(entries) => {
                        if write_map(&mut stream, &entries).await.is_err() {
                            return;
                        }
                    }
                    Reply::NullBody => {
                        if stream.write_all(&0u32.to_le_bytes()).await.is_err() {
                            return;
                        }
                    }
                    Reply::HangUp => return,
                }
            }
            other => panic!("fake host received unknown opcode {other:#04x}"),
        }
    }
}

async fn read_frame(stream: &mut UnixStream) -> std::io::Result<String> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
    stream.read_exact(&mut payload).await?;
    Ok(String::from_utf8(payload).expect("execute payload is UTF-8"))
}

async fn write_map(
    stream: &mut UnixStream,
    entries: &[(String, Option<String>)],
) -> std::io::Result<()> {
    let mut body = Vec::new();
    for (key, value) in entries {
        push_frame(&mut body, key);
        match value {
            Some(v) => push_frame(&mut body, v),
            None => body.extend_from_slice(&0u32.to_le_bytes()),
        }
    }
    stream.write_all(&(body.len() as u32).to_le_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}

fn push_frame(dst: &mut Vec<u8>, payload: &str) {
    dst.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    dst.extend_from_slice(payload.as_bytes());
}
