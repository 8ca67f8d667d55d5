//! Idle stream detection.
//!
//! [`ActivityTracker`] records when each stream last delivered a message and
//! [`IdleTimeoutMonitor`] sweeps it on a fixed tick, reporting streams that
//! stayed silent for longer than the configured window.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::config::IDLE_CHECK_INTERVAL;
use super::types::StreamKey;

/// Last delivery time per stream key
#[derive(Debug, Default)]
pub struct ActivityTracker {
    last_activity: Mutex<HashMap<StreamKey, Instant>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StreamKey, Instant>> {
        self.last_activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn touch(&self, key: &StreamKey) {
        self.touch_at(key, Instant::now());
    }

    pub fn touch_at(&self, key: &StreamKey, at: Instant) {
        self.lock().insert(key.clone(), at);
    }

    pub fn forget(&self, key: &StreamKey) {
        self.lock().remove(key);
    }

    pub fn last_activity(&self, key: &StreamKey) -> Option<Instant> {
        self.lock().get(key).copied()
    }

    /// Keys whose last activity is more than `timeout` before `now`
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<StreamKey> {
        self.lock()
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) > timeout)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Background sweep over an [`ActivityTracker`]
///
/// Runs every [`IDLE_CHECK_INTERVAL`] until stopped or dropped. Expired keys
/// are forgotten before `on_expired` runs, so each silence is reported once.
#[derive(Debug)]
pub struct IdleTimeoutMonitor {
    cancel: CancellationToken,
}

impl IdleTimeoutMonitor {
    pub fn spawn<T, F>(runtime: &Handle, tracker: T, timeout: Duration, on_expired: F) -> Self
    where
        T: AsRef<ActivityTracker> + Send + 'static,
        F: Fn(StreamKey) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::debug!("Idle monitor started with a {:?} window", timeout);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let tracker = tracker.as_ref();
                for key in tracker.expired(Instant::now(), timeout) {
                    tracker.forget(&key);
                    log::debug!("Stream {} idle for more than {:?}", key, timeout);
                    on_expired(key);
                }
            }

            log::debug!("Idle monitor stopped");
        });

        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for IdleTimeoutMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
