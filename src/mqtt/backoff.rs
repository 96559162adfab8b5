//! Reconnect backoff
//!
//! `delay = min(initial * multiplier^attempt, max) * (1 +- jitter)`

use super::config::ReconnectConfig;
use std::time::Duration;

/// Per-broker backoff state. Reset on every successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Consecutive failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delay before the next attempt; counts the failure that caused it
    pub fn next_delay(&mut self) -> Duration {
        let delay = delay_for(self.attempts, &self.config);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }
}

pub fn delay_for(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = attempt.min(1024) as i32;
    let base = config.initial_delay().as_secs_f64() * config.multiplier.powi(exponent);
    let capped = base.min(config.max_delay().as_secs_f64());

    let spread = if config.jitter > 0.0 {
        (rand::random::<f64>() * 2.0 - 1.0) * config.jitter
    } else {
        0.0
    };

    Duration::from_secs_f64((capped * (1.0 + spread)).max(0.0))
}
