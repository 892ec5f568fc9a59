use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bosun_core::PowerState;

use crate::events::EventBus;

pub mod docker;
#[cfg(test)]
pub mod mock;

// Topics the environment publishes on its own bus. The owning instance
// subscribes and translates these into its public event stream.
pub const STATE_CHANGE_EVENT: &str = "state change";
pub const CONSOLE_OUTPUT_EVENT: &str = "console output";
pub const STATS_EVENT: &str = "statistics";

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("container does not exist")]
    NotFound,

    #[error("no stream is attached to this environment")]
    NotAttached,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("container engine error: {0}")]
    Engine(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Exit information for a terminated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    pub exit_code: i64,
    pub oom_killed: bool,
}

/// How a graceful stop is delivered to the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StopConfiguration {
    /// Send a signal (e.g. `SIGTERM`) to the container.
    Signal { value: String },
    /// Write a command to the process console.
    Command { value: String },
    /// Ask the engine to stop the container and wait.
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Build limits assigned by the control plane. Memory values are MiB, the
/// CPU limit is a percentage where one full core is 100.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub memory_limit: i64,
    #[serde(default)]
    pub swap: i64,
    #[serde(default)]
    pub io_weight: u16,
    #[serde(default)]
    pub cpu_limit: i64,
    #[serde(default)]
    pub disk_space: i64,
    #[serde(default)]
    pub oom_disabled: bool,
}

impl Limits {
    pub fn memory_bytes(&self) -> i64 {
        self.memory_limit * 1024 * 1024
    }

    /// Docker's memory_swap is memory plus swap; -1 means unlimited swap.
    pub fn memory_swap_bytes(&self) -> i64 {
        if self.swap < 0 {
            return -1;
        }
        (self.memory_limit + self.swap) * 1024 * 1024
    }

    pub fn cpu_quota(&self) -> Option<(i64, i64)> {
        if self.cpu_limit <= 0 {
            return None;
        }
        // Quota is expressed against a fixed 100ms period.
        Some((self.cpu_limit * 1000, 100_000))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Allocation {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Allocations {
    #[serde(default)]
    pub default_mapping: Allocation,
    /// ip -> ports published on that address.
    #[serde(default)]
    pub mappings: HashMap<String, Vec<u16>>,
}

/// Everything the runtime needs to build the instance container. Assembled
/// by the instance from its synced configuration; no engine types appear
/// here.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentConfiguration {
    pub mounts: Vec<Mount>,
    pub allocations: Allocations,
    pub limits: Limits,
    pub environment_variables: Vec<String>,
    /// The parsed startup command handed to the container.
    pub invocation: String,
}

/// One installation run: a throwaway container executing the install script
/// with the instance volume mounted.
#[derive(Debug, Clone)]
pub struct InstallProcess {
    pub image: String,
    pub entrypoint: String,
    pub args: Vec<String>,
    pub mounts: Vec<Mount>,
    pub environment_variables: Vec<String>,
}

/// Abstract process runtime for one instance. The concrete implementation
/// in this crate drives a container engine, but nothing above this trait is
/// allowed to know that.
#[async_trait]
pub trait ProcessEnvironment: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// The environment's private event bus; see the topic constants above.
    fn events(&self) -> Arc<EventBus>;

    async fn state(&self) -> PowerState;
    async fn set_state(&self, state: PowerState);

    /// True while a bidirectional stream to the process is open.
    async fn is_attached(&self) -> bool;

    async fn exists(&self) -> Result<bool, EnvironmentError>;
    async fn is_running(&self) -> Result<bool, EnvironmentError>;

    /// Exit code and OOM flag after termination. A runtime that no longer
    /// knows the container reports exit code 1, not killed.
    async fn exit_state(&self) -> Result<ExitState, EnvironmentError>;

    /// Creates the runtime resources for the instance if they are missing.
    async fn create(&self) -> Result<(), EnvironmentError>;

    /// Opens the console stream. Output is line-split onto the bus; an
    /// already-terminated process results in an immediate offline
    /// transition rather than an error.
    async fn attach(&self) -> Result<(), EnvironmentError>;

    async fn start(&self) -> Result<(), EnvironmentError>;

    /// Performs the configured graceful stop.
    async fn stop(&self) -> Result<(), EnvironmentError>;

    /// Blocks until the process is gone, up to `seconds`. With `terminate`
    /// set the process is killed when the deadline passes instead of
    /// returning an error.
    async fn wait_for_stop(&self, seconds: u64, terminate: bool) -> Result<(), EnvironmentError>;

    /// Forcibly ends the process with the given signal.
    async fn terminate(&self, signal: &str) -> Result<(), EnvironmentError>;

    /// Tears down all runtime resources, killing the process if needed.
    async fn destroy(&self) -> Result<(), EnvironmentError>;

    /// Writes one command to the attached console stream.
    async fn send_command(&self, command: &str) -> Result<(), EnvironmentError>;

    /// Returns up to `lines` of the most recent process output.
    async fn read_log(&self, lines: i64) -> Result<Vec<String>, EnvironmentError>;

    async fn set_image(&self, image: &str);
    async fn set_stop_configuration(&self, configuration: Option<StopConfiguration>);
    async fn update_configuration(&self, configuration: EnvironmentConfiguration);

    async fn enable_resource_polling(&self);
    async fn disable_resource_polling(&self);

    /// Runs an installation process to completion, forwarding output lines
    /// to `output`. Returns the process exit code; cancellation through
    /// `token` aborts the run and surfaces [`EnvironmentError::Cancelled`].
    async fn install(
        &self,
        process: InstallProcess,
        output: mpsc::Sender<String>,
        token: CancellationToken,
    ) -> Result<i64, EnvironmentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_configuration_parses_panel_payloads() {
        let cfg: StopConfiguration =
            serde_json::from_str(r#"{"type":"command","value":"stop"}"#).unwrap();
        assert_eq!(
            cfg,
            StopConfiguration::Command {
                value: "stop".to_string()
            }
        );

        let cfg: StopConfiguration =
            serde_json::from_str(r#"{"type":"signal","value":"SIGTERM"}"#).unwrap();
        assert_eq!(
            cfg,
            StopConfiguration::Signal {
                value: "SIGTERM".to_string()
            }
        );

        let cfg: StopConfiguration = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(cfg, StopConfiguration::Stop);
    }

    #[test]
    fn limits_convert_to_engine_units() {
        let limits = Limits {
            memory_limit: 2048,
            swap: 512,
            cpu_limit: 150,
            ..Default::default()
        };
        assert_eq!(limits.memory_bytes(), 2048 * 1024 * 1024);
        assert_eq!(limits.memory_swap_bytes(), 2560 * 1024 * 1024);
        assert_eq!(limits.cpu_quota(), Some((150_000, 100_000)));

        let unlimited = Limits {
            swap: -1,
            ..Default::default()
        };
        assert_eq!(unlimited.memory_swap_bytes(), -1);
        assert_eq!(unlimited.cpu_quota(), None);
    }
}
