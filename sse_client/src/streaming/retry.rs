//! Per-key reconnect bookkeeping.
//!
//! A key with no counter is `Connected`. Every transport error increments the
//! counter; once it exceeds `retries` the key gives up.

use std::collections::HashMap;
use std::time::Duration;

use super::config::RetryConfig;
use super::types::StreamKey;

/// Retry position of a subscribed key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Connected,
    Retrying { attempt: u32 },
}

/// Outcome of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect after `delay`; `attempt` counts from 1
    Reconnect { attempt: u32, delay: Duration },
    /// The retry budget is spent; the counter has been cleared
    GiveUp { attempts: u32 },
}

#[derive(Debug)]
pub struct RetryController {
    config: RetryConfig,
    attempts: HashMap<StreamKey, u32>,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Count an error for `key` and decide what happens next
    pub fn record_failure(&mut self, key: &StreamKey) -> RetryDecision {
        let attempt = {
            let counter = self.attempts.entry(key.clone()).or_insert(0);
            *counter = counter.saturating_add(1);
            *counter
        };

        if attempt > self.config.retries {
            self.attempts.remove(key);
            RetryDecision::GiveUp { attempts: attempt }
        } else {
            RetryDecision::Reconnect {
                attempt,
                delay: self.config.interval,
            }
        }
    }

    /// A connection for `key` opened
    pub fn record_open(&mut self, key: &StreamKey) {
        if self.config.reset_on_open && self.attempts.remove(key).is_some() {
            log::debug!("Stream {} recovered, retry counter cleared", key);
        }
    }

    /// Forget everything about `key`
    pub fn clear(&mut self, key: &StreamKey) {
        self.attempts.remove(key);
    }

    pub fn state(&self, key: &StreamKey) -> RetryState {
        match self.attempts.get(key) {
            Some(&attempt) => RetryState::Retrying { attempt },
            None => RetryState::Connected,
        }
    }
}
