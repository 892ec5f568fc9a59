use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOCATION: &str = "/etc/bosun/config.yml";

fn default_root_directory() -> PathBuf {
    PathBuf::from("/var/lib/bosun")
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("/var/log/bosun")
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("/var/lib/bosun/volumes")
}

fn default_archive_directory() -> PathBuf {
    PathBuf::from("/var/lib/bosun/archives")
}

fn default_backup_directory() -> PathBuf {
    PathBuf::from("/var/lib/bosun/backups")
}

fn default_username() -> String {
    "bosun".to_string()
}

fn default_disk_check_interval() -> u64 {
    150
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    std::fs::read_to_string("/etc/timezone")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "UTC".to_string())
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SystemUser {
    pub uid: u32,
    pub gid: u32,
}

/// Basic system settings: where instance data lives and how the daemon
/// should treat the disk and crashed processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfiguration {
    /// Root directory where all daemon data is stored.
    #[serde(default = "default_root_directory")]
    pub root_directory: PathBuf,

    /// Directory for the daemon log and per-instance install logs.
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,

    /// Directory holding one sandboxed volume per instance.
    #[serde(default = "default_data_directory")]
    pub data: PathBuf,

    /// Directory where transfer archives are written.
    #[serde(default = "default_archive_directory")]
    pub archive_directory: PathBuf,

    /// Directory where local backups are written.
    #[serde(default = "default_backup_directory")]
    pub backup_directory: PathBuf,

    /// The system user that owns all instance files and runs the containers.
    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default)]
    pub user: SystemUser,

    /// Timezone passed into every container. Detected from the host when
    /// not set explicitly.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Seconds before a cached disk usage value is considered stale and a
    /// re-walk of the volume is scheduled. Setting this too low causes
    /// serious I/O pressure on hosts with many large instances.
    #[serde(default = "default_disk_check_interval")]
    pub disk_check_interval: u64,

    /// Treat a clean exit (code 0) that the daemon did not ask for as a
    /// crash.
    #[serde(default = "default_true")]
    pub detect_clean_exit_as_crash: bool,

    /// Re-check file ownership of each instance volume while booting. Can
    /// slow boot down considerably for large instances.
    #[serde(default = "default_true")]
    pub check_permissions_on_boot: bool,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("system configuration defaults are total")
    }
}

impl SystemConfiguration {
    /// Location of the JSON file tracking last-known instance power states.
    pub fn states_path(&self) -> PathBuf {
        self.root_directory.join("states.json")
    }

    /// Directory holding the persisted per-instance configuration records.
    pub fn instances_path(&self) -> PathBuf {
        self.root_directory.join("instances")
    }

    pub fn install_log_path(&self) -> PathBuf {
        self.log_directory.join("install")
    }

    /// Ensures the daemon directory tree exists. If the data directory is a
    /// symlink it is resolved to its final destination first, otherwise every
    /// later jail prefix check would fail against the unresolved path.
    pub fn configure_directories(&mut self) -> anyhow::Result<()> {
        tracing::debug!(path = %self.root_directory.display(), "ensuring root data directory exists");
        std::fs::create_dir_all(&self.root_directory).context("create root directory")?;

        match std::fs::canonicalize(&self.data) {
            Ok(resolved) => {
                if resolved != self.data {
                    self.data = resolved;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("resolve data directory"),
        }

        for dir in [
            &self.data,
            &self.archive_directory,
            &self.backup_directory,
            &self.instances_path(),
            &self.install_log_path(),
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }

        Ok(())
    }
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

/// Settings for the HTTP surface the control plane talks to. The router
/// itself lives outside this crate; these values are handed to it at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfiguration {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Bearer token the control plane must present.
    #[serde(default)]
    pub token: String,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("api configuration defaults are total")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfiguration {
    /// Base URL of the control plane, e.g. `https://panel.example.com`.
    #[serde(default)]
    pub base_url: String,
    /// Token used to authenticate this node against the control plane.
    #[serde(default)]
    pub token: String,
}

impl Default for RemoteConfiguration {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
        }
    }
}

fn default_docker_network() -> String {
    "bosun0".to_string()
}

fn default_network_interface() -> String {
    "172.18.0.1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfiguration {
    /// Name of the docker network containers are attached to.
    #[serde(default = "default_docker_network")]
    pub network_name: String,
    /// Gateway address for the network above.
    #[serde(default = "default_network_interface")]
    pub network_interface: String,
    /// Timezone path mounted read-only into containers when present.
    #[serde(default)]
    pub timezone_path: Option<String>,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("docker configuration defaults are total")
    }
}

fn default_throttle_lines() -> u64 {
    2000
}

fn default_line_reset_interval() -> u64 {
    100
}

fn default_decay_interval() -> u64 {
    10_000
}

fn default_decay_count() -> u64 {
    1
}

fn default_max_violations() -> u64 {
    5
}

/// Tunables for the per-instance console output throttler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConsoleThrottles {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lines an instance may emit within one window before throttling.
    #[serde(default = "default_throttle_lines")]
    pub lines: u64,
    /// Window length in milliseconds.
    #[serde(default = "default_line_reset_interval")]
    pub line_reset_interval: u64,
    /// Period of the background decay ticker in milliseconds.
    #[serde(default = "default_decay_interval")]
    pub decay_interval: u64,
    /// Violations forgiven on each decay.
    #[serde(default = "default_decay_count")]
    pub decay_count: u64,
    /// Violation count at which the instance process is killed.
    #[serde(default = "default_max_violations")]
    pub maximum_trigger_count: u64,
}

impl Default for ConsoleThrottles {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("throttle defaults are total")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub api: ApiConfiguration,

    #[serde(default)]
    pub remote: RemoteConfiguration,

    #[serde(default)]
    pub system: SystemConfiguration,

    #[serde(default)]
    pub docker: DockerConfiguration,

    #[serde(default)]
    pub throttles: ConsoleThrottles,

    #[serde(skip)]
    path: PathBuf,
}

impl Configuration {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("stat configuration file {}", path.display()))?;
        if meta.is_dir() {
            anyhow::bail!("cannot use directory as configuration file path");
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read configuration file {}", path.display()))?;
        let mut cfg: Configuration =
            serde_yaml::from_str(&raw).context("parse configuration file")?;
        cfg.path = path.to_path_buf();
        Ok(cfg)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the configuration back to its source file. Used after boot
    /// mutates derived values such as the resolved data directory.
    pub fn write_to_disk(&self) -> anyhow::Result<()> {
        let data = serde_yaml::to_string(self).context("serialize configuration")?;
        let tmp = self.path.with_extension("yml.tmp");
        std::fs::write(&tmp, data).context("write configuration temp file")?;
        std::fs::rename(&tmp, &self.path).context("persist configuration")?;
        Ok(())
    }
}
