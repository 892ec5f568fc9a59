use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use bosun_core::{PowerState, ResourceUsage};

use crate::config::Configuration;
use crate::environment::{
    self, Allocations, EnvironmentConfiguration, Mount, ProcessEnvironment,
};
use crate::events::EventBus;
use crate::filesystem::Filesystem;
use crate::remote::RemoteClient;
use crate::state_store::StateStore;
use crate::throttle::{ConsoleThrottler, ThrottleAction};
use crate::websocket::WebsocketBag;

pub mod configuration;
pub mod crash;
pub mod install;
pub mod power;

use self::configuration::{
    InstallationConfiguration, InstanceConfiguration, ProcessConfiguration,
    ServerConfigurationResponse,
};

// Topics published on the instance's public event bus. These names are part
// of the websocket wire contract.
pub const DAEMON_MESSAGE_EVENT: &str = "daemon message";
pub const INSTALL_OUTPUT_EVENT: &str = "install output";
pub const INSTALL_STARTED_EVENT: &str = "install started";
pub const INSTALL_COMPLETED_EVENT: &str = "install completed";
pub const CONSOLE_OUTPUT_EVENT: &str = "console output";
pub const STATUS_EVENT: &str = "status";
pub const STATS_EVENT: &str = "stats";
pub const BACKUP_COMPLETED_EVENT: &str = "backup completed";

pub const ALL_TOPICS: &[&str] = &[
    DAEMON_MESSAGE_EVENT,
    INSTALL_OUTPUT_EVENT,
    INSTALL_STARTED_EVENT,
    INSTALL_COMPLETED_EVENT,
    CONSOLE_OUTPUT_EVENT,
    STATUS_EVENT,
    STATS_EVENT,
    BACKUP_COMPLETED_EVENT,
];

/// Daemon-wide collaborators an instance needs. Cheap to clone; everything
/// inside is shared.
#[derive(Clone)]
pub struct InstanceContext {
    pub config: Arc<Configuration>,
    pub remote: Arc<RemoteClient>,
    pub states: Arc<StateStore>,
}

/// One managed game server: its declarative configuration, sandboxed
/// filesystem, process environment and the event fabric tying them
/// together.
pub struct Instance {
    config: RwLock<InstanceConfiguration>,
    proc_config: RwLock<ProcessConfiguration>,
    installation: RwLock<Option<InstallationConfiguration>>,
    crash_patterns: RwLock<Option<regex::RegexSet>>,
    resources: Mutex<ResourceUsage>,

    fs: Arc<Filesystem>,
    environment: Arc<dyn ProcessEnvironment>,
    events: Arc<EventBus>,
    throttler: Arc<ConsoleThrottler>,
    websockets: WebsocketBag,

    pub(crate) power: power::PowerCoordinator,
    pub(crate) installer: install::InstallerDetails,
    pub(crate) crash: crash::CrashDetection,

    ctx: InstanceContext,

    /// Set while boot reconciliation is adjusting this instance so that an
    /// observed offline transition is not mistaken for a crash.
    restoring: AtomicBool,
}

impl Instance {
    /// Builds an instance around an existing environment. Used directly by
    /// tests; production code goes through [`Instance::from_configuration`].
    pub async fn new(
        config: InstanceConfiguration,
        environment: Arc<dyn ProcessEnvironment>,
        fs: Arc<Filesystem>,
        ctx: InstanceContext,
    ) -> Arc<Self> {
        let throttler = Arc::new(ConsoleThrottler::new(ctx.config.throttles));

        let instance = Arc::new(Self {
            config: RwLock::new(config),
            proc_config: RwLock::new(ProcessConfiguration::default()),
            installation: RwLock::new(None),
            crash_patterns: RwLock::new(None),
            resources: Mutex::new(ResourceUsage::default()),
            fs,
            environment,
            events: Arc::new(EventBus::new()),
            throttler: throttler.clone(),
            websockets: WebsocketBag::new(),
            power: power::PowerCoordinator::new(),
            installer: install::InstallerDetails::new(),
            crash: crash::CrashDetection::new(),
            ctx,
            restoring: AtomicBool::new(false),
        });

        instance.clone().start_event_listeners();
        throttler.start_timer().await;
        instance
    }

    /// Creates an instance from a control-plane configuration response,
    /// wiring up a container environment for it.
    pub async fn from_configuration(
        response: ServerConfigurationResponse,
        docker: Arc<bollard::Docker>,
        ctx: InstanceContext,
    ) -> anyhow::Result<Arc<Self>> {
        let uuid = response
            .uuid()
            .context("instance configuration is missing a uuid")?;

        let mut config = InstanceConfiguration {
            uuid,
            ..Default::default()
        };
        config
            .merge(&response.settings)
            .context("apply initial instance settings")?;

        let system = &ctx.config.system;
        let fs = Arc::new(Filesystem::new(
            system.data.join(uuid.to_string()),
            config.disk_limit_bytes(),
            system.disk_check_interval,
            crate::filesystem::DiskOwner {
                uid: system.user.uid,
                gid: system.user.gid,
            },
        ));

        let environment = Arc::new(environment::docker::DockerEnvironment::new(
            uuid.to_string(),
            config.container.image.clone(),
            ctx.config.docker.network_name.clone(),
            docker,
        ));

        let instance = Self::new(config, environment, fs.clone(), ctx).await;
        instance
            .sync_with_configuration(response)
            .await
            .context("apply instance configuration")?;

        // Prime the disk usage cache in the background when the volume
        // already exists; first writes would otherwise race a cold counter.
        // Ownership is re-checked at the same time when configured, since
        // external tooling may have touched the files while the daemon was
        // down.
        if tokio::fs::metadata(fs.path()).await.is_ok() {
            let check_permissions = instance.ctx.config.system.check_permissions_on_boot;
            tokio::spawn(async move {
                let _ = fs.disk_usage(false).await;
                if check_permissions {
                    if let Err(e) = fs.chown("/").await {
                        tracing::warn!(path = %fs.path().display(), error = %e, "failed to normalize volume ownership");
                    }
                }
            });
        }

        Ok(instance)
    }

    pub async fn id(&self) -> Uuid {
        self.config.read().await.uuid
    }

    pub fn filesystem(&self) -> &Arc<Filesystem> {
        &self.fs
    }

    pub fn environment(&self) -> &Arc<dyn ProcessEnvironment> {
        &self.environment
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn websockets(&self) -> &WebsocketBag {
        &self.websockets
    }

    pub fn throttler(&self) -> &Arc<ConsoleThrottler> {
        &self.throttler
    }

    pub(crate) fn context(&self) -> &InstanceContext {
        &self.ctx
    }

    pub async fn configuration(&self) -> InstanceConfiguration {
        self.config.read().await.clone()
    }

    pub async fn process_configuration(&self) -> ProcessConfiguration {
        self.proc_config.read().await.clone()
    }

    pub async fn is_suspended(&self) -> bool {
        self.config.read().await.suspended
    }

    pub async fn set_suspended(&self, suspended: bool) {
        self.config.write().await.suspended = suspended;
    }

    pub async fn state(&self) -> PowerState {
        self.environment.state().await
    }

    pub(crate) fn set_restoring(&self, restoring: bool) {
        self.restoring.store(restoring, Ordering::SeqCst);
    }

    pub(crate) fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::SeqCst)
    }

    /// Latest cached resource sample, with live state and disk usage mixed
    /// in.
    pub async fn proc(&self) -> ResourceUsage {
        let mut usage = self.resources.lock().await.clone();
        usage.disk_bytes = self.fs.disk_used().max(0) as u64;
        usage
    }

    pub async fn read_logfile(&self, lines: i64) -> Result<Vec<String>, environment::EnvironmentError> {
        self.environment.read_log(lines).await
    }

    pub async fn send_command(&self, command: &str) -> Result<(), environment::EnvironmentError> {
        self.environment.send_command(command).await
    }

    /// Subscribes to every public topic at once; one handle per websocket
    /// session.
    pub async fn subscribe_events(&self) -> crate::events::Subscription {
        self.events.subscribe(ALL_TOPICS).await
    }

    pub async fn publish_daemon_message(&self, message: impl Into<String>) {
        self.events
            .publish(DAEMON_MESSAGE_EVENT, serde_json::json!(message.into()))
            .await;
    }

    /// Pulls the authoritative configuration from the control plane and
    /// applies it. A 404 bubbles up as `RemoteError::ServerDoesNotExist` so
    /// the caller can delete the local instance.
    pub async fn sync(&self) -> anyhow::Result<()> {
        let uuid = self.id().await;
        let response = self.ctx.remote.get_server_configuration(uuid).await?;
        self.sync_with_configuration(response).await
    }

    /// Applies a configuration response: updates the in-memory settings,
    /// persists the record, pushes the disk quota into the filesystem and
    /// the image/stop settings into the environment.
    pub async fn sync_with_configuration(
        &self,
        response: ServerConfigurationResponse,
    ) -> anyhow::Result<()> {
        {
            let mut config = self.config.write().await;
            config
                .merge(&response.settings)
                .context("merge instance settings")?;
        }

        *self.proc_config.write().await = response.process_configuration.clone();
        *self.installation.write().await = response.installation;

        let patterns = &response.process_configuration.crash_detection;
        *self.crash_patterns.write().await = if patterns.is_empty() {
            None
        } else {
            match regex::RegexSet::new(patterns) {
                Ok(set) => Some(set),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring invalid crash detection patterns");
                    None
                }
            }
        };

        let config = self.config.read().await.clone();
        self.fs.set_disk_limit(config.disk_limit_bytes());

        self.environment.set_image(&config.container.image).await;
        self.environment
            .set_stop_configuration(response.process_configuration.stop)
            .await;
        self.environment
            .update_configuration(self.build_environment_configuration().await)
            .await;

        self.persist_configuration().await
    }

    /// Environment variables handed to the container. User variables never
    /// override the built-in set.
    pub async fn environment_variables(&self) -> Vec<String> {
        let config = self.config.read().await;
        let system = &self.ctx.config.system;

        let mut out = vec![
            format!("TZ={}", system.timezone),
            format!("STARTUP={}", config.invocation),
            format!("SERVER_MEMORY={}", config.build.memory_limit),
            format!("SERVER_IP={}", config.allocations.default_mapping.ip),
            format!("SERVER_PORT={}", config.allocations.default_mapping.port),
        ];

        'vars: for (key, value) in &config.environment {
            let key = key.to_uppercase();
            for existing in &out {
                if existing.starts_with(&format!("{key}=")) {
                    continue 'vars;
                }
            }
            out.push(format!("{key}={}", stringify_env_value(value)));
        }

        out
    }

    async fn build_environment_configuration(&self) -> EnvironmentConfiguration {
        let environment_variables = self.environment_variables().await;
        let config = self.config.read().await;

        let mut allocations: Allocations = config.allocations.clone();
        let default = allocations.default_mapping.clone();
        if !default.ip.is_empty() {
            let ports = allocations.mappings.entry(default.ip.clone()).or_default();
            if !ports.contains(&default.port) {
                ports.push(default.port);
            }
        }

        EnvironmentConfiguration {
            mounts: vec![Mount {
                source: self.fs.path().to_path_buf(),
                target: "/home/container".to_string(),
                read_only: false,
            }],
            allocations,
            limits: config.build,
            environment_variables,
            invocation: config.invocation.clone(),
        }
    }

    /// Writes the current configuration record for this instance under the
    /// daemon root so it survives restarts of the control plane.
    async fn persist_configuration(&self) -> anyhow::Result<()> {
        let config = self.config.read().await.clone();
        let dir = self.ctx.config.system.instances_path();
        tokio::fs::create_dir_all(&dir)
            .await
            .context("create instances directory")?;

        let path = dir.join(format!("{}.json", config.uuid));
        let tmp = dir.join(format!("{}.json.tmp", config.uuid));
        let data = serde_json::to_vec_pretty(&config).context("serialize instance record")?;
        tokio::fs::write(&tmp, data).await.context("write instance record")?;
        tokio::fs::rename(&tmp, &path)
            .await
            .context("persist instance record")?;
        Ok(())
    }

    /// Subscribes to the environment's private bus and translates its
    /// events into the instance's public stream, feeding the throttler,
    /// readiness detection and the crash handler along the way.
    fn start_event_listeners(self: Arc<Self>) {
        let bus = self.environment.events();
        tokio::spawn(async move {
            let mut sub = bus
                .subscribe(&[
                    environment::STATE_CHANGE_EVENT,
                    environment::CONSOLE_OUTPUT_EVENT,
                    environment::STATS_EVENT,
                ])
                .await;

            while let Some(event) = sub.rx.recv().await {
                match event.topic.as_str() {
                    environment::CONSOLE_OUTPUT_EVENT => self.on_console_output(event.data).await,
                    environment::STATE_CHANGE_EVENT => self.on_state_change(event.data).await,
                    environment::STATS_EVENT => self.on_stats(event.data).await,
                    _ => {}
                }
            }
        });
    }

    async fn on_console_output(self: &Arc<Self>, data: serde_json::Value) {
        let Some(line) = data.as_str() else { return };

        match self.throttler.observe_line().await {
            ThrottleAction::Allow => {}
            ThrottleAction::Warn => {
                self.publish_daemon_message(
                    "Your server is outputting console data too quickly, throttling...",
                )
                .await;
                return;
            }
            ThrottleAction::Drop => return,
            ThrottleAction::Kill => {
                self.publish_daemon_message(
                    "Your server is sending too much data too quickly! Killing the server process.",
                )
                .await;

                let instance = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = instance
                        .handle_power_action(bosun_core::PowerAction::Kill, Some(30))
                        .await
                    {
                        tracing::error!(error = %e, "failed to kill instance flooding the console");
                    }
                });
                return;
            }
        }

        let state = self.environment.state().await;
        if state == PowerState::Starting {
            let proc = self.proc_config.read().await;
            if proc.startup.done.iter().any(|marker| line.contains(marker)) {
                drop(proc);
                self.environment.set_state(PowerState::Running).await;
            }
        } else if state == PowerState::Running {
            let patterns = self.crash_patterns.read().await;
            if patterns
                .as_ref()
                .map(|set| set.is_match(line))
                .unwrap_or(false)
            {
                drop(patterns);
                self.publish_daemon_message(
                    "Detected a crash expression in the console output, stopping the process.",
                )
                .await;

                let environment = self.environment.clone();
                tokio::spawn(async move {
                    let _ = environment.terminate("SIGKILL").await;
                });
            }
        }

        self.events.publish_line(CONSOLE_OUTPUT_EVENT, line).await;
    }

    async fn on_state_change(self: &Arc<Self>, data: serde_json::Value) {
        let state = match data.as_str().map(serde_json::Value::from) {
            Some(v) => match serde_json::from_value::<PowerState>(v) {
                Ok(s) => s,
                Err(_) => return,
            },
            None => return,
        };

        let uuid = self.id().await;
        if let Err(e) = self.ctx.states.set(uuid, state).await {
            tracing::warn!(instance = %uuid, error = %e, "failed to persist state transition");
        }

        self.events
            .publish(STATUS_EVENT, serde_json::json!(state.as_str()))
            .await;

        if state == PowerState::Offline {
            crash::handle_crash(self).await;
        }
    }

    async fn on_stats(&self, data: serde_json::Value) {
        let Ok(sample) = serde_json::from_value::<ResourceUsage>(data) else {
            return;
        };

        let merged = {
            let mut resources = self.resources.lock().await;
            *resources = sample;
            resources.disk_bytes = self.fs.disk_used().max(0) as u64;
            resources.clone()
        };

        if let Ok(value) = serde_json::to_value(&merged) {
            self.events.publish(STATS_EVENT, value).await;
        }
    }
}

fn stringify_env_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
