use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{RwLock, Semaphore};
use uuid::Uuid;

use bosun_core::{PowerAction, PowerState};

use crate::instance::{Instance, InstanceContext};

/// Reconciliation pool size. Booting more instances than this concurrently
/// mostly thrashes the container engine.
const RECONCILE_CONCURRENCY: usize = 4;

/// What boot reconciliation should do with one instance given its cached
/// and actual state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcileAction {
    /// The process should be running but is not: issue a best-effort start.
    Start,
    /// The process is running: mark it and re-attach the console stream.
    Reattach,
    /// Nothing to revive: record the instance as offline.
    MarkOffline,
}

fn reconcile_action(cached: Option<PowerState>, actually_running: bool) -> ReconcileAction {
    if actually_running {
        return ReconcileAction::Reattach;
    }
    match cached {
        Some(PowerState::Running) | Some(PowerState::Starting) => ReconcileAction::Start,
        _ => ReconcileAction::MarkOffline,
    }
}

/// Owns every instance this node manages. Constructed at boot, handed to
/// the router, torn down last on shutdown.
pub struct InstanceManager {
    instances: RwLock<HashMap<Uuid, Arc<Instance>>>,
    docker: Arc<bollard::Docker>,
    ctx: InstanceContext,
}

impl InstanceManager {
    pub fn new(docker: Arc<bollard::Docker>, ctx: InstanceContext) -> Arc<Self> {
        Arc::new(Self {
            instances: RwLock::new(HashMap::new()),
            docker,
            ctx,
        })
    }

    pub async fn get(&self, uuid: Uuid) -> Option<Arc<Instance>> {
        self.instances.read().await.get(&uuid).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Instance>> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn add(&self, instance: Arc<Instance>) {
        let uuid = instance.id().await;
        self.instances.write().await.insert(uuid, instance);
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Fetches the authoritative instance list and builds the in-memory
    /// collection, bounded by the host's core count. A broken configuration
    /// is logged and skipped; it never aborts boot.
    pub async fn boot(self: &Arc<Self>) -> anyhow::Result<()> {
        tracing::info!("fetching list of instances from the control plane");
        let configs = self
            .ctx
            .remote
            .list_servers()
            .await
            .context("fetch instance list")?;

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        tracing::info!(total = configs.len(), workers, "creating instance objects");

        let started = std::time::Instant::now();
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::new();

        for config in configs {
            let permit = semaphore.clone().acquire_owned().await.expect("pool open");
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let uuid = config.uuid();
                match Instance::from_configuration(config, manager.docker.clone(), manager.ctx.clone())
                    .await
                {
                    Ok(instance) => manager.add(instance).await,
                    Err(e) => {
                        tracing::error!(instance = ?uuid, error = %e, "failed to load instance, skipping");
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        tracing::info!(
            duration = ?started.elapsed(),
            total = self.len().await,
            "finished processing instance configurations",
        );
        Ok(())
    }

    /// Matches cached power states against the actual runtime and revives
    /// or re-attaches instances, four at a time. Makes a daemon restart
    /// invisible both to the control plane and to running containers.
    pub async fn reconcile(self: &Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(RECONCILE_CONCURRENCY));
        let mut handles = Vec::new();

        for instance in self.all().await {
            let permit = semaphore.clone().acquire_owned().await.expect("pool open");
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                reconcile_instance(instance).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Removes an instance from this node: suspend, abort any install, tear
    /// down the event fabric, destroy the runtime, then clean the volume up
    /// in the background.
    pub async fn delete(&self, uuid: Uuid) -> anyhow::Result<()> {
        let Some(instance) = self.get(uuid).await else {
            return Ok(());
        };

        // Nobody gets to boot it while the teardown runs.
        instance.set_suspended(true).await;

        if instance.is_installing() {
            instance.abort_installation().await;
        }

        instance.websockets().cancel_all().await;
        instance.throttler().stop_timer().await;
        instance.events().destroy().await;

        instance
            .environment()
            .destroy()
            .await
            .context("destroy instance environment")?;
        // Dropping the environment bus ends the instance's listener task.
        instance.environment().events().destroy().await;

        // Volume removal can take minutes for large instances and failure
        // is recoverable by hand, so it happens off the request path.
        let path = instance.filesystem().path().to_path_buf();
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove instance volume");
                }
            }
        });

        let record = self
            .ctx
            .config
            .system
            .instances_path()
            .join(format!("{uuid}.json"));
        let _ = tokio::fs::remove_file(record).await;
        let _ = self.ctx.states.remove(uuid).await;

        self.instances.write().await.remove(&uuid);
        tracing::info!(instance = %uuid, "instance was removed from this node");
        Ok(())
    }

    /// Drains every instance's background machinery before the daemon
    /// exits. Running containers are left alone on purpose.
    pub async fn shutdown(&self) {
        for instance in self.all().await {
            instance.websockets().cancel_all().await;
            instance.throttler().stop_timer().await;
            instance.environment().disable_resource_polling().await;
        }
    }
}

async fn reconcile_instance(instance: Arc<Instance>) {
    let uuid = instance.id().await;
    tracing::info!(instance = %uuid, "restoring instance to previous state");

    instance.set_restoring(true);

    let cached = instance.context().states.get(uuid).await;
    // A missing container is simply not running; failing boot over it would
    // force a full image re-pull before the daemon even comes up.
    let actually_running = match instance.environment().is_running().await {
        Ok(running) => running,
        Err(crate::environment::EnvironmentError::NotFound) => false,
        Err(e) => {
            tracing::error!(instance = %uuid, error = %e, "error checking instance environment status");
            false
        }
    };

    match reconcile_action(cached, actually_running) {
        ReconcileAction::Start => {
            tracing::info!(instance = %uuid, "instance was previously running, starting it back up");
            instance.set_restoring(false);
            if let Err(e) = instance.handle_power_action(PowerAction::Start, None).await {
                tracing::warn!(instance = %uuid, error = %e, "failed to return instance to running state");
            }
            return;
        }
        ReconcileAction::Reattach => {
            tracing::info!(instance = %uuid, "detected instance is running, re-attaching");
            instance.environment().set_state(PowerState::Running).await;
            // The container may exit between the check above and this
            // attach; the restoring flag keeps that from reading as a
            // crash, and the exit watcher still flips it offline.
            if let Err(e) = instance.environment().attach().await {
                tracing::warn!(instance = %uuid, error = %e, "failed to re-attach to running instance");
                instance.environment().set_state(PowerState::Offline).await;
            } else {
                instance.environment().enable_resource_polling().await;
            }
        }
        ReconcileAction::MarkOffline => {
            instance.environment().set_state(PowerState::Offline).await;
        }
    }

    // Give the state events a moment to drain before crash handling is
    // re-armed.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    instance.set_restoring(false);
}
