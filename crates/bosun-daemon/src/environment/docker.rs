use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use bosun_core::{NetworkUsage, PowerState, ResourceUsage};

use crate::events::EventBus;

use super::{
    CONSOLE_OUTPUT_EVENT, EnvironmentConfiguration, EnvironmentError, ExitState, InstallProcess,
    ProcessEnvironment, STATE_CHANGE_EVENT, STATS_EVENT, StopConfiguration,
};

fn map_engine_error(e: bollard::errors::Error) -> EnvironmentError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => EnvironmentError::NotFound,
        other => EnvironmentError::Engine(other.to_string()),
    }
}

#[derive(Debug, Clone, Default)]
struct Metadata {
    image: String,
    stop: Option<StopConfiguration>,
}

/// State shared with the background tasks an attach spawns.
struct Shared {
    state: Mutex<PowerState>,
    bus: Arc<EventBus>,
}

impl Shared {
    async fn set_state(&self, next: PowerState) {
        {
            let mut state = self.state.lock().await;
            if *state == next {
                return;
            }
            *state = next;
        }
        self.bus
            .publish(STATE_CHANGE_EVENT, serde_json::json!(next.as_str()))
            .await;
    }
}

/// Accumulates raw console bytes and emits complete lines.
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn feed(&mut self, bytes: &[u8], mut on_line: impl FnMut(String)) {
        self.buf.extend_from_slice(bytes);
        while let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=idx).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            on_line(String::from_utf8_lossy(&line).to_string());
        }
    }
}

type AttachInput = Pin<Box<dyn tokio::io::AsyncWrite + Send>>;

/// Container-engine backed [`ProcessEnvironment`]. The container carries the
/// instance uuid as its name, so every engine call can address it directly.
pub struct DockerEnvironment {
    id: String,
    client: Arc<Docker>,
    network: String,

    meta: RwLock<Metadata>,
    configuration: RwLock<EnvironmentConfiguration>,
    shared: Arc<Shared>,

    stream: Arc<Mutex<Option<AttachInput>>>,
    /// Bumped on every attach so a stale exit watcher from a previous run
    /// cannot flip the state of the next one.
    attach_generation: Arc<AtomicU64>,
    polling: Mutex<Option<CancellationToken>>,
}

impl DockerEnvironment {
    pub fn new(id: impl Into<String>, image: impl Into<String>, network: impl Into<String>, client: Arc<Docker>) -> Self {
        Self {
            id: id.into(),
            client,
            network: network.into(),
            meta: RwLock::new(Metadata {
                image: image.into(),
                stop: None,
            }),
            configuration: RwLock::new(EnvironmentConfiguration::default()),
            shared: Arc::new(Shared {
                state: Mutex::new(PowerState::Offline),
                bus: Arc::new(EventBus::new()),
            }),
            stream: Arc::new(Mutex::new(None)),
            attach_generation: Arc::new(AtomicU64::new(0)),
            polling: Mutex::new(None),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EnvironmentError> {
        if self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(container = %self.id, image, "pulling container image");
        let mut pull = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(map_engine_error)?;
        }
        Ok(())
    }

    fn container_config(&self, cfg: &EnvironmentConfiguration, meta: &Metadata) -> Config<String> {
        let mut exposed: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for (ip, ports) in &cfg.allocations.mappings {
            for port in ports {
                for proto in ["tcp", "udp"] {
                    let key = format!("{port}/{proto}");
                    exposed.insert(key.clone(), HashMap::new());
                    bindings.entry(key).or_insert_with(|| Some(Vec::new()))
                        .get_or_insert_with(Vec::new)
                        .push(PortBinding {
                            host_ip: Some(ip.clone()),
                            host_port: Some(port.to_string()),
                        });
                }
            }
        }

        let binds = cfg
            .mounts
            .iter()
            .map(|m| {
                format!(
                    "{}:{}:{}",
                    m.source.display(),
                    m.target,
                    if m.read_only { "ro" } else { "rw" }
                )
            })
            .collect();

        let limits = &cfg.limits;
        let (cpu_quota, cpu_period) = match limits.cpu_quota() {
            Some((quota, period)) => (Some(quota), Some(period)),
            None => (None, None),
        };

        let host_config = HostConfig {
            binds: Some(binds),
            memory: Some(limits.memory_bytes()),
            memory_swap: Some(limits.memory_swap_bytes()),
            cpu_quota,
            cpu_period,
            blkio_weight: Some(limits.io_weight),
            oom_kill_disable: Some(limits.oom_disabled),
            port_bindings: Some(bindings),
            network_mode: Some(self.network.clone()),
            ..Default::default()
        };

        Config {
            hostname: Some(self.id.clone()),
            image: Some(meta.image.clone()),
            env: Some(cfg.environment_variables.clone()),
            cmd: Some(
                cfg.invocation
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            ),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            tty: Some(true),
            exposed_ports: Some(exposed),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ProcessEnvironment for DockerEnvironment {
    fn type_name(&self) -> &'static str {
        "docker"
    }

    fn events(&self) -> Arc<EventBus> {
        self.shared.bus.clone()
    }

    async fn state(&self) -> PowerState {
        *self.shared.state.lock().await
    }

    async fn set_state(&self, state: PowerState) {
        self.shared.set_state(state).await;
    }

    async fn is_attached(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    async fn exists(&self) -> Result<bool, EnvironmentError> {
        match self.client.inspect_container(&self.id, None).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_engine_error(e)),
        }
    }

    async fn is_running(&self) -> Result<bool, EnvironmentError> {
        let inspect = self
            .client
            .inspect_container(&self.id, None)
            .await
            .map_err(map_engine_error)?;
        Ok(inspect
            .state
            .and_then(|s| s.running)
            .unwrap_or(false))
    }

    async fn exit_state(&self) -> Result<ExitState, EnvironmentError> {
        match self.client.inspect_container(&self.id, None).await {
            Ok(inspect) => {
                let state = inspect.state.unwrap_or_default();
                Ok(ExitState {
                    exit_code: state.exit_code.unwrap_or(0),
                    oom_killed: state.oom_killed.unwrap_or(false),
                })
            }
            // A container the engine no longer knows about counts as a plain
            // failed exit; the caller decides whether that is a crash.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ExitState {
                exit_code: 1,
                oom_killed: false,
            }),
            Err(e) => Err(map_engine_error(e)),
        }
    }

    async fn create(&self) -> Result<(), EnvironmentError> {
        if self.exists().await? {
            return Ok(());
        }

        let meta = self.meta.read().await.clone();
        self.ensure_image(&meta.image).await?;

        let cfg = self.configuration.read().await.clone();
        let config = self.container_config(&cfg, &meta);

        self.client
            .create_container(
                Some(CreateContainerOptions {
                    name: self.id.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(map_engine_error)?;
        Ok(())
    }

    async fn attach(&self) -> Result<(), EnvironmentError> {
        if self.is_attached().await {
            return Ok(());
        }

        let results = self
            .client
            .attach_container(
                &self.id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_engine_error)?;

        *self.stream.lock().await = Some(results.input);
        let generation = self.attach_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let shared = self.shared.clone();
        let mut output = results.output;
        tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            while let Some(chunk) = output.next().await {
                let message = match chunk {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => message,
                    Ok(_) => continue,
                    Err(_) => break,
                };

                let mut batch = Vec::new();
                lines.feed(&message, |line| batch.push(line));
                for line in batch {
                    shared.bus.publish_line(CONSOLE_OUTPUT_EVENT, line).await;
                }
            }
        });

        // Exit watcher: when the engine reports the process gone this
        // environment goes offline, regardless of how it got there.
        let shared = self.shared.clone();
        let stream = self.stream.clone();
        let generations = self.attach_generation.clone();
        let client = self.client.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let mut wait = client.wait_container(&id, None::<WaitContainerOptions<String>>);
            let _ = wait.next().await;

            if generations.load(Ordering::SeqCst) != generation {
                return;
            }
            *stream.lock().await = None;
            shared.set_state(PowerState::Offline).await;
        });

        Ok(())
    }

    async fn start(&self) -> Result<(), EnvironmentError> {
        // Re-use a container that is already running; just make sure the
        // console stream is open again.
        if matches!(self.is_running().await, Ok(true)) {
            self.attach().await?;
            self.shared.set_state(PowerState::Running).await;
            return Ok(());
        }

        self.shared.set_state(PowerState::Starting).await;

        let result: Result<(), EnvironmentError> = async {
            self.create().await?;
            self.attach().await?;
            self.client
                .start_container(&self.id, None::<StartContainerOptions<String>>)
                .await
                .map_err(map_engine_error)?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.shared.set_state(PowerState::Offline).await;
            return Err(e);
        }

        self.enable_resource_polling().await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), EnvironmentError> {
        let stop = self.meta.read().await.stop.clone();
        match stop {
            Some(StopConfiguration::Command { value }) => self.send_command(&value).await,
            Some(StopConfiguration::Signal { value }) => {
                self.client
                    .kill_container(&self.id, Some(KillContainerOptions { signal: value }))
                    .await
                    .map_err(map_engine_error)
            }
            Some(StopConfiguration::Stop) | None => {
                match self
                    .client
                    .stop_container(&self.id, Some(StopContainerOptions { t: 30 }))
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 404,
                        ..
                    }) => {
                        self.shared.set_state(PowerState::Offline).await;
                        Ok(())
                    }
                    Err(e) => Err(map_engine_error(e)),
                }
            }
        }
    }

    async fn wait_for_stop(&self, seconds: u64, terminate: bool) -> Result<(), EnvironmentError> {
        let mut wait = self
            .client
            .wait_container(&self.id, None::<WaitContainerOptions<String>>);

        match tokio::time::timeout(Duration::from_secs(seconds), wait.next()).await {
            // Any response, including "no such container", means the process
            // is gone.
            Ok(_) => Ok(()),
            Err(_) if terminate => self.terminate("SIGKILL").await,
            Err(_) => Err(EnvironmentError::Engine(format!(
                "container did not stop within {seconds}s"
            ))),
        }
    }

    async fn terminate(&self, signal: &str) -> Result<(), EnvironmentError> {
        match self.is_running().await {
            Ok(true) => {
                self.client
                    .kill_container(
                        &self.id,
                        Some(KillContainerOptions {
                            signal: signal.to_string(),
                        }),
                    )
                    .await
                    .map_err(map_engine_error)?;
            }
            Ok(false) | Err(EnvironmentError::NotFound) => {}
            Err(e) => return Err(e),
        }

        self.shared.set_state(PowerState::Offline).await;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), EnvironmentError> {
        self.disable_resource_polling().await;

        match self
            .client
            .remove_container(
                &self.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(map_engine_error(e)),
        }

        *self.stream.lock().await = None;
        self.shared.set_state(PowerState::Offline).await;
        Ok(())
    }

    async fn send_command(&self, command: &str) -> Result<(), EnvironmentError> {
        let mut stream = self.stream.lock().await;
        let Some(input) = stream.as_mut() else {
            return Err(EnvironmentError::NotAttached);
        };

        input.write_all(format!("{command}\n").as_bytes()).await?;
        input.flush().await?;
        Ok(())
    }

    async fn read_log(&self, lines: i64) -> Result<Vec<String>, EnvironmentError> {
        let mut logs = self.client.logs(
            &self.id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: lines.to_string(),
                ..Default::default()
            }),
        );

        let mut out = Vec::new();
        let mut buffer = LineBuffer::new();
        while let Some(chunk) = logs.next().await {
            let chunk = chunk.map_err(map_engine_error)?;
            buffer.feed(&chunk.into_bytes(), |line| out.push(line));
        }
        Ok(out)
    }

    async fn set_image(&self, image: &str) {
        self.meta.write().await.image = image.to_string();
    }

    async fn set_stop_configuration(&self, configuration: Option<StopConfiguration>) {
        self.meta.write().await.stop = configuration;
    }

    async fn update_configuration(&self, configuration: EnvironmentConfiguration) {
        *self.configuration.write().await = configuration;
    }

    async fn enable_resource_polling(&self) {
        let mut polling = self.polling.lock().await;
        if polling.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *polling = Some(token.clone());

        let client = self.client.clone();
        let id = self.id.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut stats = client.stats(
                &id,
                Some(StatsOptions {
                    stream: true,
                    one_shot: false,
                }),
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    sample = stats.next() => {
                        let Some(Ok(sample)) = sample else { return };
                        let usage = resource_usage_from_stats(&sample);
                        if let Ok(value) = serde_json::to_value(&usage) {
                            shared.bus.publish(STATS_EVENT, value).await;
                        }
                    }
                }
            }
        });
    }

    async fn disable_resource_polling(&self) {
        if let Some(token) = self.polling.lock().await.take() {
            token.cancel();
        }
    }

    async fn install(
        &self,
        process: InstallProcess,
        output: mpsc::Sender<String>,
        token: CancellationToken,
    ) -> Result<i64, EnvironmentError> {
        self.ensure_image(&process.image).await?;

        let name = format!("{}_installer", self.id);
        // A previous half-finished run may have left its container behind.
        let _ = self
            .client
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        let binds = process
            .mounts
            .iter()
            .map(|m| {
                format!(
                    "{}:{}:{}",
                    m.source.display(),
                    m.target,
                    if m.read_only { "ro" } else { "rw" }
                )
            })
            .collect();

        self.client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                Config {
                    image: Some(process.image.clone()),
                    env: Some(process.environment_variables.clone()),
                    entrypoint: Some(vec![process.entrypoint.clone()]),
                    cmd: Some(process.args.clone()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    host_config: Some(HostConfig {
                        binds: Some(binds),
                        network_mode: Some(self.network.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_engine_error)?;

        let cleanup = |client: Arc<Docker>, name: String| async move {
            let _ = client
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
        };

        if let Err(e) = self
            .client
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            cleanup(self.client.clone(), name.clone()).await;
            return Err(map_engine_error(e));
        }

        let mut logs = self.client.logs(
            &name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            }),
        );

        let mut buffer = LineBuffer::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    cleanup(self.client.clone(), name.clone()).await;
                    return Err(EnvironmentError::Cancelled);
                }
                chunk = logs.next() => {
                    match chunk {
                        Some(Ok(chunk)) => {
                            let mut batch = Vec::new();
                            buffer.feed(&chunk.into_bytes(), |line| batch.push(line));
                            for line in batch {
                                let _ = output.send(line).await;
                            }
                        }
                        Some(Err(_)) | None => break,
                    }
                }
            }
        }

        let mut wait = self
            .client
            .wait_container(&name, None::<WaitContainerOptions<String>>);
        let exit_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            _ => 0,
        };

        cleanup(self.client.clone(), name.clone()).await;
        Ok(exit_code)
    }
}

fn resource_usage_from_stats(stats: &Stats) -> ResourceUsage {
    let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
        - stats.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
        - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;

    let cpu_absolute = if cpu_delta > 0.0 && system_delta > 0.0 {
        let cores = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
        ((cpu_delta / system_delta) * cores * 100.0 * 100.0).round() / 100.0
    } else {
        0.0
    };

    let mut network = NetworkUsage::default();
    if let Some(networks) = &stats.networks {
        for net in networks.values() {
            network.rx_bytes += net.rx_bytes;
            network.tx_bytes += net.tx_bytes;
        }
    }

    ResourceUsage {
        memory_bytes: stats.memory_stats.usage.unwrap_or(0),
        memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
        cpu_absolute,
        network,
        disk_bytes: 0,
    }
}
