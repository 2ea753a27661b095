//! Instance registry: one live host per launch signature.
//!
//! An explicit, constructible object rather than module-level state, so tests
//! and embedders can run isolated registries. One lock guards the whole
//! check-then-act sequence in `instance()` — two callers racing on the same
//! signature can never spawn duplicate host processes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::manager::{HostConfig, Manager, ManagerError};

#[derive(Default)]
pub struct Registry {
    instances: Mutex<HashMap<String, Arc<Manager>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up (or create) the live instance for this configuration.
    ///
    /// A cached instance that fails its liveness check is torn down
    /// best-effort and replaced; the caller always receives a healthy
    /// instance or a construction error.
    pub async fn instance(&self, config: &HostConfig) -> Result<Arc<Manager>, ManagerError> {
        let key = config.signature();
        let mut instances = self.instances.lock().await;

        if let Some(existing) = instances.remove(&key) {
            if existing.is_alive().await {
                tracing::debug!(signature = %key, "Reusing pooled host instance");
                instances.insert(key, Arc::clone(&existing));
                return Ok(existing);
            }
            tracing::info!(signature = %key, "Pooled instance is dead, replacing");
            // Teardown of the dead instance is best-effort; exit() never
            // returns an error.
            existing.exit().await;
        }

        let manager = Arc::new(Manager::connect(config.clone()).await?);
        instances.insert(key, Arc::clone(&manager));
        Ok(manager)
    }

    /// Number of pooled instances, dead or alive.
    pub async fn len(&self) -> usize {
        self.instances.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.lock().await.is_empty()
    }

    /// Process-wide shutdown: ask every pooled host to exit.
    pub async fn shutdown(&self) {
        let mut instances = self.instances.lock().await;
        for (signature, manager) in instances.drain() {
            tracing::info!(%signature, "Shutting down pooled host instance");
            manager.exit().await;
        }
    }
}
