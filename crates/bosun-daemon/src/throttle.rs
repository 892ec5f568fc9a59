use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ConsoleThrottles;

/// What the caller should do with a console line it just ran through the
/// throttler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAction {
    /// Forward the line to subscribers.
    Allow,
    /// Drop the line and warn the instance owner; a new violation was
    /// recorded.
    Warn,
    /// Drop the line silently; the window is already over its limit.
    Drop,
    /// Drop the line and kill the instance; the violation cap was reached.
    Kill,
}

/// Windowed line-rate limiter for one instance's console output. The
/// throttler only decides; publishing warnings and requesting the kill is
/// the caller's job so the core stays trivially testable.
pub struct ConsoleThrottler {
    config: ConsoleThrottles,
    count: AtomicU64,
    violations: AtomicU64,
    window_start: Mutex<Instant>,
    ticker: Mutex<Option<CancellationToken>>,
}

impl ConsoleThrottler {
    pub fn new(config: ConsoleThrottles) -> Self {
        Self {
            config,
            count: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
            ticker: Mutex::new(None),
        }
    }

    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::SeqCst)
    }

    fn decay(&self) {
        let mut current = self.violations.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(self.config.decay_count);
            match self.violations.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Runs one console line through the limiter.
    pub async fn observe_line(&self) -> ThrottleAction {
        if !self.config.enabled {
            return ThrottleAction::Allow;
        }

        let now = Instant::now();
        {
            let mut start = self.window_start.lock().await;
            if now.duration_since(*start)
                >= Duration::from_millis(self.config.line_reset_interval)
            {
                *start = now;
                self.count.store(0, Ordering::SeqCst);
                self.decay();
            }
        }

        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if count <= self.config.lines {
            return ThrottleAction::Allow;
        }

        // Every line over the window limit is dropped and counts against the
        // instance until the decay ticker or a window rollover forgives it.
        let violations = self.violations.fetch_add(1, Ordering::SeqCst) + 1;
        if violations == self.config.maximum_trigger_count {
            return ThrottleAction::Kill;
        }
        if violations > self.config.maximum_trigger_count {
            // The kill has already been requested; swallow the backlog.
            return ThrottleAction::Drop;
        }

        ThrottleAction::Warn
    }

    /// Starts the background ticker that forgives violations over time even
    /// when the instance emits nothing at all.
    pub async fn start_timer(self: &std::sync::Arc<Self>) {
        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *ticker = Some(token.clone());

        let throttler = self.clone();
        let interval = Duration::from_millis(self.config.decay_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => throttler.decay(),
                }
            }
        });
    }

    pub async fn stop_timer(&self) {
        if let Some(token) = self.ticker.lock().await.take() {
            token.cancel();
        }
    }
}
