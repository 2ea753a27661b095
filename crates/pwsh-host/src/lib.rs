//! pwsh-host: manager for a long-lived, out-of-process interpreter host.
//!
//! Many short invocations reuse one warm host process instead of paying
//! process startup per call. Commands and results travel over a local framed
//! byte channel (named pipe on Windows, Unix domain socket elsewhere); the
//! host's native stdout/stderr are drained concurrently alongside each
//! command.
//!
//! Entry points: [`Registry::instance`] for pooled access keyed by launch
//! configuration, or [`Manager::connect`] for a directly owned instance.

pub mod bridge;
mod exec;
pub mod registry;
pub mod spawn;

mod manager;

pub use bridge::transport::ConnectError;
pub use manager::{ExecutionRequest, ExecutionResult, HostConfig, Manager, ManagerError};
pub use registry::Registry;
pub use spawn::{HostSpawner, LaunchSpec, PwshSpawner, SpawnError};
