use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use bosun_core::PowerAction;

use super::Instance;

/// Minimum spacing between automatic restarts of the same instance.
const CRASH_BACKOFF: Duration = Duration::from_secs(60);

pub struct CrashDetection {
    pub(crate) last_crash: Mutex<Option<Instant>>,
}

impl CrashDetection {
    pub fn new() -> Self {
        Self {
            last_crash: Mutex::new(None),
        }
    }

    /// Forgets crash history, e.g. after a successful reinstall.
    pub async fn reset(&self) {
        *self.last_crash.lock().await = None;
    }
}

/// Consulted on every transition to offline. Emits the crash notice and
/// schedules a single auto-restart unless the stop was asked for, crash
/// detection is off, or the previous crash was too recent.
pub(crate) async fn handle_crash(instance: &Arc<Instance>) {
    // Boot reconciliation adjusts states while re-attaching; none of that is
    // a crash.
    if instance.is_restoring() {
        return;
    }

    if matches!(
        instance.last_power_action().await,
        Some(PowerAction::Stop) | Some(PowerAction::Kill)
    ) {
        return;
    }

    let config = instance.configuration().await;
    if !config.crash_detection_enabled {
        tracing::debug!(
            instance = %config.uuid,
            "instance exited but crash detection is disabled for it",
        );
        return;
    }

    let exit = match instance.environment().exit_state().await {
        Ok(exit) => exit,
        Err(e) => {
            tracing::warn!(instance = %config.uuid, error = %e, "failed to read exit state after stop");
            return;
        }
    };

    let clean_exit = exit.exit_code == 0 && !exit.oom_killed;
    if clean_exit && !instance.context().config.system.detect_clean_exit_as_crash {
        tracing::debug!(instance = %config.uuid, "instance stopped cleanly, not treating as crash");
        return;
    }

    instance
        .publish_daemon_message("---------- Detected server process in a crashed state! ----------")
        .await;
    instance
        .publish_daemon_message(format!("Exit code: {}", exit.exit_code))
        .await;
    instance
        .publish_daemon_message(format!("Out of memory: {}", exit.oom_killed))
        .await;

    {
        let mut last = instance.crash.last_crash.lock().await;
        if let Some(previous) = *last {
            if previous.elapsed() < CRASH_BACKOFF {
                instance
                    .publish_daemon_message(
                        "Aborting automatic restart, last crash occurred less than 60 seconds ago.",
                    )
                    .await;
                return;
            }
        }
        *last = Some(Instant::now());
    }

    tracing::info!(instance = %config.uuid, "restarting crashed instance");
    if let Err(e) = instance
        .handle_power_action(PowerAction::Start, None)
        .await
    {
        tracing::error!(instance = %config.uuid, error = %e, "failed to restart crashed instance");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::mock::MockEnvironment;
    use crate::environment::{ExitState, ProcessEnvironment};
    use crate::instance::test_support::instance_fixture;
    use crate::instance::DAEMON_MESSAGE_EVENT;
    use bosun_core::PowerState;

    async fn collect_messages(
        rx: &mut crate::events::Subscription,
        n: usize,
    ) -> Vec<String> {
        let mut out = Vec::new();
        for _ in 0..n {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.rx.recv())
                .await
                .expect("timed out waiting for daemon message")
                .expect("bus closed");
            out.push(event.data.as_str().unwrap_or_default().to_string());
        }
        out
    }

    #[tokio::test]
    async fn oom_kill_triggers_one_crash_restart_then_backs_off() {
        let env = Arc::new(MockEnvironment::new());
        let (instance, _dir) = instance_fixture(env.clone()).await;
        let mut messages = instance.events().subscribe(&[DAEMON_MESSAGE_EVENT]).await;

        env.set_exit_state(ExitState {
            exit_code: 137,
            oom_killed: true,
        })
        .await;

        // The container dies on its own.
        env.set_state(PowerState::Running).await;
        env.set_state(PowerState::Offline).await;

        let first = collect_messages(&mut messages, 3).await;
        assert!(first[0].contains("crashed state"));
        assert_eq!(first[1], "Exit code: 137");
        assert_eq!(first[2], "Out of memory: true");

        // The crash handler restarted it once.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if env.start_calls() == 1 && env.state().await == PowerState::Running {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // A second OOM right away reports the crash but gives up on the
        // restart.
        env.set_state(PowerState::Offline).await;
        let second = collect_messages(&mut messages, 4).await;
        assert!(second[3].contains("Aborting automatic restart"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(env.start_calls(), 1);
    }

    #[tokio::test]
    async fn requested_stop_is_never_a_crash() {
        let env = Arc::new(MockEnvironment::new());
        let (instance, _dir) = instance_fixture(env.clone()).await;
        let mut messages = instance.events().subscribe(&[DAEMON_MESSAGE_EVENT]).await;

        env.set_exit_state(ExitState {
            exit_code: 0,
            oom_killed: false,
        })
        .await;

        instance
            .handle_power_action(PowerAction::Start, None)
            .await
            .unwrap();
        instance
            .handle_power_action(PowerAction::Stop, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(messages.rx.try_recv().is_err());
        assert_eq!(env.start_calls(), 1);
    }

    #[tokio::test]
    async fn disabled_crash_detection_skips_the_handler() {
        let env = Arc::new(MockEnvironment::new());
        let (instance, _dir) = instance_fixture(env.clone()).await;
        {
            let mut cfg = instance.config.write().await;
            cfg.crash_detection_enabled = false;
        }
        let mut messages = instance.events().subscribe(&[DAEMON_MESSAGE_EVENT]).await;

        env.set_exit_state(ExitState {
            exit_code: 1,
            oom_killed: false,
        })
        .await;
        env.set_state(PowerState::Running).await;
        env.set_state(PowerState::Offline).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(messages.rx.try_recv().is_err());
        assert_eq!(env.start_calls(), 0);
    }

    #[tokio::test]
    async fn restoring_flag_suppresses_spurious_crashes() {
        let env = Arc::new(MockEnvironment::new());
        let (instance, _dir) = instance_fixture(env.clone()).await;
        instance.set_restoring(true);

        env.set_exit_state(ExitState {
            exit_code: 1,
            oom_killed: false,
        })
        .await;
        env.set_state(PowerState::Running).await;
        env.set_state(PowerState::Offline).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(env.start_calls(), 0);
    }
}
