//! Session configuration

use std::time::Duration;
use thiserror::Error;

/// Read deadline re-armed by every liveness event
pub const DEFAULT_PING_WAIT: Duration = Duration::from_secs(60);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(60);
/// Inbound high-water mark per logical connection
pub const DEFAULT_MAX_BUFFER: usize = 2 * 1024 * 1024;
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 32 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid session config: {0}")]
pub struct ConfigError(String);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Longest time without any frame, ping or pong before the transport
    /// is declared dead
    pub ping_wait: Duration,

    /// How often this side sends pings (None = never)
    pub ping_interval: Option<Duration>,

    /// How long a dial waits for the remote side to accept
    pub dial_timeout: Duration,

    /// Deadline applied to every write on a logical connection
    /// (None = writes wait for the transport)
    pub write_timeout: Option<Duration>,

    /// Buffered inbound bytes above which the sender is paused; it is
    /// resumed once the buffer drains to half of this
    pub max_buffer: usize,

    /// Largest payload of a single Data frame; bigger writes are split
    pub max_frame_payload: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_wait: DEFAULT_PING_WAIT,
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            write_timeout: None,
            max_buffer: DEFAULT_MAX_BUFFER,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
        }
    }
}

impl SessionConfig {
    pub fn with_ping_wait(mut self, ping_wait: Duration) -> Self {
        self.ping_wait = ping_wait;
        self
    }

    pub fn with_ping_interval(mut self, ping_interval: Option<Duration>) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Option<Duration>) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    pub fn with_max_frame_payload(mut self, max_frame_payload: usize) -> Self {
        self.max_frame_payload = max_frame_payload;
        self
    }

    /// Buffered byte count at which a paused sender is resumed
    pub fn resume_threshold(&self) -> usize {
        self.max_buffer / 2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_wait.is_zero() {
            return Err(ConfigError("ping_wait must be positive".to_string()));
        }
        if let Some(interval) = self.ping_interval {
            if interval.is_zero() || interval >= self.ping_wait {
                return Err(ConfigError(format!(
                    "ping_interval {:?} must be positive and shorter than ping_wait {:?}",
                    interval, self.ping_wait
                )));
            }
        }
        if self.dial_timeout.is_zero() {
            return Err(ConfigError("dial_timeout must be positive".to_string()));
        }
        if self.write_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError("write_timeout must be positive".to_string()));
        }
        if self.max_buffer == 0 {
            return Err(ConfigError("max_buffer must be positive".to_string()));
        }
        if self.max_frame_payload == 0 || self.max_frame_payload > dialback_proto::MAX_PAYLOAD_SIZE {
            return Err(ConfigError(format!(
                "max_frame_payload must be between 1 and {}",
                dialback_proto::MAX_PAYLOAD_SIZE
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert_eq!(config.ping_wait, Duration::from_secs(60));
        assert_eq!(config.ping_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.resume_threshold(), 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ping_interval_must_be_shorter_than_wait() {
        let config = SessionConfig::default()
            .with_ping_wait(Duration::from_secs(10))
            .with_ping_interval(Some(Duration::from_secs(10)));
        assert!(config.validate().is_err());

        let config = config.with_ping_interval(None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_payload_bounds() {
        assert!(SessionConfig::default()
            .with_max_frame_payload(0)
            .validate()
            .is_err());
        assert!(SessionConfig::default()
            .with_max_frame_payload(dialback_proto::MAX_PAYLOAD_SIZE + 1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_zero_write_timeout_rejected() {
        let config = SessionConfig::default().with_write_timeout(Some(Duration::ZERO));
        assert!(config.validate().is_err());
    }
}
