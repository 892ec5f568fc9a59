use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};

use bosun_core::{PowerAction, PowerState};

use crate::environment::EnvironmentError;

use super::Instance;

/// How long a restart waits for the process to die before escalating to a
/// kill.
const RESTART_STOP_GRACE_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum PowerError {
    /// The serializer could not be acquired within the caller's deadline.
    /// Nothing about the instance changed.
    #[error("failed to acquire the power lock within the deadline")]
    DeadlineExceeded,

    /// A mutating action was attempted while another holds the slot.
    #[error("another power action is currently being processed")]
    Conflict,

    #[error("cannot start or restart a suspended instance")]
    Suspended,

    #[error("not enough disk space is available to start the instance")]
    NotEnoughDiskSpace,

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Serializes mutating power actions for one instance. Observations never
/// touch the permit.
pub struct PowerCoordinator {
    semaphore: Arc<Semaphore>,
    last_action: Mutex<Option<PowerAction>>,
}

impl PowerCoordinator {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            last_action: Mutex::new(None),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl Instance {
    /// True while a mutating power action holds the per-instance slot.
    pub fn executing_power_action(&self) -> bool {
        self.power.is_busy()
    }

    /// The most recent action a caller asked for. The crash handler uses
    /// this to tell a requested stop apart from a process dying on its own.
    pub async fn last_power_action(&self) -> Option<PowerAction> {
        *self.power.last_action.lock().await
    }

    async fn record_power_action(&self, action: PowerAction) {
        *self.power.last_action.lock().await = Some(action);
    }

    /// Runs a power action under the instance's exclusive slot.
    ///
    /// With `wait_seconds` set the acquisition gives up after that long and
    /// fails with [`PowerError::DeadlineExceeded`] without touching any
    /// state; `None` waits until the current holder is done.
    pub async fn handle_power_action(
        self: &Arc<Self>,
        action: PowerAction,
        wait_seconds: Option<u64>,
    ) -> Result<(), PowerError> {
        if matches!(action, PowerAction::Start | PowerAction::Restart)
            && self.is_suspended().await
        {
            return Err(PowerError::Suspended);
        }

        let semaphore = self.power.semaphore.clone();
        let _permit = match wait_seconds {
            Some(seconds) => {
                tokio::time::timeout(Duration::from_secs(seconds), semaphore.acquire_owned())
                    .await
                    .map_err(|_| PowerError::DeadlineExceeded)?
            }
            None => semaphore.acquire_owned().await,
        }
        .expect("power semaphore is never closed");

        let instance_id = self.id().await;
        tracing::debug!(
            instance = %instance_id,
            action = %action,
            "acquired exclusive lock for power action",
        );

        match action {
            PowerAction::Start => {
                self.record_power_action(PowerAction::Start).await;
                self.power_start().await
            }
            PowerAction::Stop => {
                self.record_power_action(PowerAction::Stop).await;
                self.power_stop().await
            }
            PowerAction::Kill => {
                self.record_power_action(PowerAction::Kill).await;
                self.power_kill().await
            }
            PowerAction::Restart => {
                // The stop half of a restart is user-initiated; record it as
                // such so the crash handler ignores the resulting offline
                // transition, then hand the start half its own marker.
                self.record_power_action(PowerAction::Stop).await;
                if self.environment.state().await != PowerState::Offline {
                    self.power_stop().await?;
                    self.environment
                        .wait_for_stop(RESTART_STOP_GRACE_SECS, true)
                        .await?;
                }

                self.record_power_action(PowerAction::Start).await;
                self.power_start().await
            }
        }
    }

    /// Boots the instance. A no-op when the process is already past
    /// offline; the concurrent caller that lost the race simply observes
    /// the state the winner produced.
    async fn power_start(self: &Arc<Self>) -> Result<(), PowerError> {
        if self.environment.state().await != PowerState::Offline {
            return Ok(());
        }

        if self.is_suspended().await {
            return Err(PowerError::Suspended);
        }

        // Refresh the configuration first so a stale image or limits never
        // boot. Without a configured control plane the local record is
        // already authoritative.
        if self.context().remote.enabled() {
            self.sync().await.map_err(PowerError::Other)?;
        }

        if !self.fs.has_space_available(false).await {
            return Err(PowerError::NotEnoughDiskSpace);
        }
        self.fs.ensure_data_directory().await.map_err(|e| {
            PowerError::Other(anyhow::Error::new(e).context("create instance volume"))
        })?;

        self.environment.start().await?;

        // Without readiness markers there is nothing to wait for; the
        // process counts as up the moment the runtime reports it started.
        if self.proc_config.read().await.startup.done.is_empty() {
            self.environment.set_state(PowerState::Running).await;
        }

        Ok(())
    }

    async fn power_stop(self: &Arc<Self>) -> Result<(), PowerError> {
        if self.environment.state().await == PowerState::Offline {
            return Ok(());
        }

        self.environment.set_state(PowerState::Stopping).await;
        self.environment.stop().await?;
        Ok(())
    }

    async fn power_kill(self: &Arc<Self>) -> Result<(), PowerError> {
        if self.environment.state().await == PowerState::Offline {
            return Ok(());
        }

        self.environment.set_state(PowerState::Stopping).await;
        self.environment.terminate("SIGKILL").await?;
        Ok(())
    }
}
