//! Exponential backoff between attempts to re-establish a physical transport
//!
//! Sessions never reconnect by themselves: when a transport dies, the agent
//! (or a server's peer link) dials a fresh one and builds a new session on it.

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the delay
    pub max_backoff: Duration,
    /// Growth factor applied after every failed attempt
    pub multiplier: f64,
    /// Give up after this many consecutive attempts (None = never)
    pub max_attempts: Option<usize>,
}

impl ReconnectConfig {
    pub fn from_secs(initial: u64, max: u64) -> Self {
        Self {
            initial_backoff: Duration::from_secs(initial),
            max_backoff: Duration::from_secs(max),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Gave up after {0} reconnection attempts")]
    MaxAttemptsReached(usize),
}

/// Tracks consecutive failures and sleeps for the current backoff
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep before the next attempt, then grow the backoff
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached(max_attempts));
            }
        }

        debug!(
            attempt = self.attempt,
            backoff_ms = self.current_backoff.as_millis() as u64,
            "Waiting before reconnecting"
        );
        sleep(self.current_backoff).await;

        let grown = self.current_backoff.mul_f64(self.config.multiplier);
        self.current_backoff = grown.min(self.config.max_backoff);

        Ok(())
    }

    /// Forget past failures (call once a transport is up again)
    pub fn reset(&mut self) {
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_until_cap() {
        let mut manager = ReconnectManager::new(fast_config());

        let expected = [20, 40, 80, 100, 100];
        for (i, ms) in expected.iter().enumerate() {
            manager.wait().await.unwrap();
            assert_eq!(manager.attempt(), i + 1);
            assert_eq!(manager.current_backoff(), Duration::from_millis(*ms));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_initial_backoff() {
        let mut manager = ReconnectManager::new(fast_config());
        manager.wait().await.unwrap();
        manager.wait().await.unwrap();

        manager.reset();

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let mut manager = ReconnectManager::new(fast_config().with_max_attempts(Some(2)));

        assert!(manager.wait().await.is_ok());
        assert!(manager.wait().await.is_ok());
        assert!(matches!(
            manager.wait().await,
            Err(ReconnectError::MaxAttemptsReached(2))
        ));
    }
}
