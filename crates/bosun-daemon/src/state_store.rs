use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use bosun_core::PowerState;

/// Node-local record of each instance's last observed power state. The
/// daemon reads it back on boot to decide which instances to revive or
/// re-attach to.
pub struct StateStore {
    path: PathBuf,
    states: RwLock<HashMap<Uuid, PowerState>>,
    /// Serializes writers so concurrent transitions cannot interleave the
    /// temp-file dance below.
    write_lock: Mutex<()>,
}

impl StateStore {
    /// Loads the states file, treating a missing or corrupt file as empty;
    /// losing the cache only costs a slower boot.
    pub async fn load(path: PathBuf) -> Self {
        let states = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, path = %path.display(), "discarding unreadable states file");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            states: RwLock::new(states),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn get(&self, uuid: Uuid) -> Option<PowerState> {
        self.states.read().await.get(&uuid).copied()
    }

    /// Records a transition and flushes it to disk before returning.
    pub async fn set(&self, uuid: Uuid, state: PowerState) -> anyhow::Result<()> {
        self.states.write().await.insert(uuid, state);
        self.persist().await
    }

    pub async fn remove(&self, uuid: Uuid) -> anyhow::Result<()> {
        self.states.write().await.remove(&uuid);
        self.persist().await
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;

        let snapshot = self.states.read().await.clone();
        let data = serde_json::to_vec_pretty(&snapshot).context("serialize states")?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("persist {}", self.path.display()))?;
        Ok(())
    }
}
