use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::environment::{EnvironmentError, InstallProcess, Mount};

use super::{INSTALL_COMPLETED_EVENT, INSTALL_OUTPUT_EVENT, INSTALL_STARTED_EVENT, Instance};
use super::power::PowerError;

/// The exclusive install slot for one instance, plus the cancellation
/// handle for whatever run currently holds it.
pub struct InstallerDetails {
    semaphore: Arc<Semaphore>,
    token: Mutex<Option<CancellationToken>>,
}

impl InstallerDetails {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            token: Mutex::new(None),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl Instance {
    pub fn is_installing(&self) -> bool {
        self.installer.is_busy()
    }

    /// Trips the cancellation handle of a running install. The install task
    /// observes it at its next I/O boundary and releases the slot.
    pub async fn abort_installation(&self) {
        if let Some(token) = self.installer.token.lock().await.take() {
            tracing::info!(instance = %self.id().await, "aborting running installation");
            token.cancel();
        }
    }

    /// Runs the instance's installation process to completion. Holds the
    /// exclusive install slot for the duration; a concurrent caller waits
    /// its turn.
    pub async fn install(self: &Arc<Self>) -> anyhow::Result<()> {
        let uuid = self.id().await;
        let _permit = self
            .installer
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("install semaphore is never closed");

        let token = CancellationToken::new();
        *self.installer.token.lock().await = Some(token.clone());

        self.events
            .publish(INSTALL_STARTED_EVENT, serde_json::json!({}))
            .await;

        let result = self.run_installation(uuid, token).await;
        *self.installer.token.lock().await = None;

        let successful = match &result {
            Ok(successful) => *successful,
            Err(_) => false,
        };

        if successful {
            self.crash.reset().await;
        }

        self.events
            .publish(
                INSTALL_COMPLETED_EVENT,
                serde_json::json!({ "successful": successful }),
            )
            .await;

        if self.ctx.remote.enabled() {
            if let Err(e) = self.ctx.remote.set_install_status(uuid, successful).await {
                tracing::warn!(instance = %uuid, error = %e, "failed to report install status");
            }
        }

        result.map(|_| ())
    }

    /// Install with the precondition that no power action is in flight.
    pub async fn reinstall(self: &Arc<Self>) -> Result<(), PowerError> {
        if self.executing_power_action() {
            return Err(PowerError::Conflict);
        }

        if self.ctx.remote.enabled() {
            self.sync().await.map_err(PowerError::Other)?;
        }
        self.install().await.map_err(PowerError::Other)
    }

    async fn run_installation(
        self: &Arc<Self>,
        uuid: uuid::Uuid,
        token: CancellationToken,
    ) -> anyhow::Result<bool> {
        let Some(installation) = self.installation.read().await.clone() else {
            tracing::info!(instance = %uuid, "no installation script configured, skipping");
            return Ok(true);
        };

        self.fs
            .ensure_data_directory()
            .await
            .context("create instance volume")?;

        // The script is staged in a throwaway directory mounted read-only
        // into the install container.
        let script_dir = std::env::temp_dir().join(format!("bosun-install-{uuid}"));
        tokio::fs::create_dir_all(&script_dir)
            .await
            .context("create install script directory")?;
        let script_path = script_dir.join("install.sh");
        tokio::fs::write(&script_path, installation.script.replace("\r\n", "\n"))
            .await
            .context("write install script")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
                .await
                .context("mark install script executable")?;
        }

        let process = InstallProcess {
            image: installation.container_image.clone(),
            entrypoint: installation.entrypoint.clone(),
            args: vec!["/mnt/install/install.sh".to_string()],
            mounts: vec![
                Mount {
                    source: script_dir.clone(),
                    target: "/mnt/install".to_string(),
                    read_only: true,
                },
                Mount {
                    source: self.fs.path().to_path_buf(),
                    target: "/mnt/server".to_string(),
                    read_only: false,
                },
            ],
            environment_variables: self.environment_variables().await,
        };

        let (tx, rx) = mpsc::channel::<String>(64);
        let forwarder = tokio::spawn(forward_install_output(
            self.clone(),
            rx,
            self.ctx.config.system.install_log_path().join(format!("{uuid}.log")),
        ));

        tracing::info!(instance = %uuid, image = %process.image, "running installation process");
        let result = self.environment.install(process, tx, token).await;

        // The sender side is gone once install returns, so the forwarder
        // drains whatever is left and exits.
        let _ = forwarder.await;
        let _ = tokio::fs::remove_dir_all(&script_dir).await;

        match result {
            Ok(code) => {
                tracing::info!(instance = %uuid, exit_code = code, "installation process finished");
                Ok(code == 0)
            }
            Err(EnvironmentError::Cancelled) => {
                tracing::warn!(instance = %uuid, "installation process was aborted");
                Ok(false)
            }
            Err(e) => Err(anyhow::Error::new(e).context("run installation container")),
        }
    }
}

/// Publishes install output lines to subscribers and mirrors them into the
/// per-instance install log.
async fn forward_install_output(
    instance: Arc<Instance>,
    mut rx: mpsc::Receiver<String>,
    log_path: PathBuf,
) {
    let mut log = match open_install_log(&log_path).await {
        Ok(f) => Some(f),
        Err(e) => {
            tracing::warn!(path = %log_path.display(), error = %e, "failed to open install log");
            None
        }
    };

    while let Some(line) = rx.recv().await {
        if let Some(f) = log.as_mut() {
            let _ = f.write_all(format!("{line}\n").as_bytes()).await;
        }
        instance
            .events
            .publish_line(INSTALL_OUTPUT_EVENT, line)
            .await;
    }

    if let Some(mut f) = log {
        let _ = f.flush().await;
    }
}

async fn open_install_log(path: &PathBuf) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
