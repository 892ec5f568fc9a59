use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use bosun_core::{PowerState, ResourceUsage};

use crate::events::EventBus;

use super::{
    CONSOLE_OUTPUT_EVENT, EnvironmentConfiguration, EnvironmentError, ExitState, InstallProcess,
    ProcessEnvironment, STATE_CHANGE_EVENT, STATS_EVENT, StopConfiguration,
};

/// In-memory [`ProcessEnvironment`] for exercising instance behavior
/// without a container engine.
pub struct MockEnvironment {
    bus: Arc<EventBus>,
    state: Mutex<PowerState>,
    running: Mutex<bool>,
    exit: Mutex<ExitState>,
    image: Mutex<String>,
    stop_config: Mutex<Option<StopConfiguration>>,
    configuration: Mutex<EnvironmentConfiguration>,
    commands: Mutex<Vec<String>>,

    start_delay: Duration,
    install_exit_code: Mutex<i64>,
    install_lines: Mutex<Vec<String>>,

    start_calls: AtomicU64,
    stop_calls: AtomicU64,
    kill_calls: AtomicU64,
    install_calls: AtomicU64,
}

impl MockEnvironment {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(EventBus::new()),
            state: Mutex::new(PowerState::Offline),
            running: Mutex::new(false),
            exit: Mutex::new(ExitState {
                exit_code: 0,
                oom_killed: false,
            }),
            image: Mutex::new(String::new()),
            stop_config: Mutex::new(None),
            configuration: Mutex::new(EnvironmentConfiguration::default()),
            commands: Mutex::new(Vec::new()),
            start_delay: Duration::ZERO,
            install_exit_code: Mutex::new(0),
            install_lines: Mutex::new(Vec::new()),
            start_calls: AtomicU64::new(0),
            stop_calls: AtomicU64::new(0),
            kill_calls: AtomicU64::new(0),
            install_calls: AtomicU64::new(0),
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn start_calls(&self) -> u64 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u64 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> u64 {
        self.kill_calls.load(Ordering::SeqCst)
    }

    pub fn install_calls(&self) -> u64 {
        self.install_calls.load(Ordering::SeqCst)
    }

    pub async fn sent_commands(&self) -> Vec<String> {
        self.commands.lock().await.clone()
    }

    pub async fn current_image(&self) -> String {
        self.image.lock().await.clone()
    }

    pub async fn current_stop_configuration(&self) -> Option<StopConfiguration> {
        self.stop_config.lock().await.clone()
    }

    pub async fn set_exit_state(&self, exit: ExitState) {
        *self.exit.lock().await = exit;
    }

    pub async fn set_install_output(&self, lines: Vec<String>, exit_code: i64) {
        *self.install_lines.lock().await = lines;
        *self.install_exit_code.lock().await = exit_code;
    }

    /// Simulates the process writing a console line.
    pub async fn emit_console_line(&self, line: &str) {
        self.bus.publish_line(CONSOLE_OUTPUT_EVENT, line).await;
    }

    /// Simulates a stats sample arriving from the runtime.
    pub async fn emit_stats(&self, usage: &ResourceUsage) {
        self.bus
            .publish(STATS_EVENT, serde_json::to_value(usage).unwrap())
            .await;
    }
}

#[async_trait]
impl ProcessEnvironment for MockEnvironment {
    fn type_name(&self) -> &'static str {
        "mock"
    }

    fn events(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    async fn state(&self) -> PowerState {
        *self.state.lock().await
    }

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

    async fn is_attached(&self) -> bool {
        *self.running.lock().await
    }

    async fn exists(&self) -> Result<bool, EnvironmentError> {
        Ok(true)
    }

    async fn is_running(&self) -> Result<bool, EnvironmentError> {
        Ok(*self.running.lock().await)
    }

    async fn exit_state(&self) -> Result<ExitState, EnvironmentError> {
        Ok(*self.exit.lock().await)
    }

    async fn create(&self) -> Result<(), EnvironmentError> {
        Ok(())
    }

    async fn attach(&self) -> Result<(), EnvironmentError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), EnvironmentError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.set_state(PowerState::Starting).await;
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        *self.running.lock().await = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), EnvironmentError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        *self.running.lock().await = false;
        self.set_state(PowerState::Offline).await;
        Ok(())
    }

    async fn wait_for_stop(&self, _seconds: u64, _terminate: bool) -> Result<(), EnvironmentError> {
        Ok(())
    }

    async fn terminate(&self, _signal: &str) -> Result<(), EnvironmentError> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        *self.running.lock().await = false;
        self.set_state(PowerState::Offline).await;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), EnvironmentError> {
        *self.running.lock().await = false;
        self.set_state(PowerState::Offline).await;
        Ok(())
    }

    async fn send_command(&self, command: &str) -> Result<(), EnvironmentError> {
        if !*self.running.lock().await {
            return Err(EnvironmentError::NotAttached);
        }
        self.commands.lock().await.push(command.to_string());
        Ok(())
    }

    async fn read_log(&self, _lines: i64) -> Result<Vec<String>, EnvironmentError> {
        Ok(Vec::new())
    }

    async fn set_image(&self, image: &str) {
        *self.image.lock().await = image.to_string();
    }

    async fn set_stop_configuration(&self, configuration: Option<StopConfiguration>) {
        *self.stop_config.lock().await = configuration;
    }

    async fn update_configuration(&self, configuration: EnvironmentConfiguration) {
        *self.configuration.lock().await = configuration;
    }

    async fn enable_resource_polling(&self) {}

    async fn disable_resource_polling(&self) {}

    async fn install(
        &self,
        _process: InstallProcess,
        output: mpsc::Sender<String>,
        token: CancellationToken,
    ) -> Result<i64, EnvironmentError> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);

        for line in self.install_lines.lock().await.iter() {
            if token.is_cancelled() {
                return Err(EnvironmentError::Cancelled);
            }
            let _ = output.send(line.clone()).await;
        }

        if token.is_cancelled() {
            return Err(EnvironmentError::Cancelled);
        }
        Ok(*self.install_exit_code.lock().await)
    }
}
