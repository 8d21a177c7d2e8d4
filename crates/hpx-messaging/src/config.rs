//! Messaging provider configuration.

use std::time::Duration;

/// Configuration for a [`MessagingProvider`](crate::MessagingProvider).
#[derive(Clone, Debug)]
pub struct MessagingConfig {
    // Request handling
    /// Default deadline for request-response operations.
    pub timeout: Duration,
    /// Maximum number of outstanding requests.
    pub max_pending_requests: usize,
    /// Interval for sweeping waiters whose deadline passed unobserved.
    pub pending_cleanup_interval: Duration,

    // Channels
    /// Capacity of the outbound command queue.
    pub command_channel_capacity: usize,
    /// Capacity of each subscription stream.
    pub subscriber_channel_capacity: usize,
    /// Capacity of the authentication event broadcast.
    pub auth_event_capacity: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_pending_requests: 1000,
            pending_cleanup_interval: Duration::from_secs(5),
            command_channel_capacity: 64,
            subscriber_channel_capacity: 256,
            auth_event_capacity: 16,
        }
    }
}

impl MessagingConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum outstanding requests.
    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    /// Set the stale waiter sweep interval.
    #[must_use]
    pub fn pending_cleanup_interval(mut self, interval: Duration) -> Self {
        self.pending_cleanup_interval = interval;
        self
    }

    /// Set the outbound command queue capacity.
    #[must_use]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    /// Set the per-subscription stream capacity.
    #[must_use]
    pub fn subscriber_channel_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_channel_capacity = capacity;
        self
    }

    /// Set the authentication event broadcast capacity.
    #[must_use]
    pub fn auth_event_capacity(mut self, capacity: usize) -> Self {
        self.auth_event_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout.is_zero() {
            return Err("Timeout must be > 0".to_string());
        }
        if self.max_pending_requests == 0 {
            return Err("Max pending requests must be > 0".to_string());
        }
        if self.pending_cleanup_interval.is_zero() {
            return Err("Pending cleanup interval must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        if self.subscriber_channel_capacity == 0 {
            return Err("Subscriber channel capacity must be > 0".to_string());
        }
        if self.auth_event_capacity == 0 {
            return Err("Auth event capacity must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MessagingConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_pending_requests, 1000);
        assert_eq!(config.pending_cleanup_interval, Duration::from_secs(5));
        assert_eq!(config.command_channel_capacity, 64);
        assert_eq!(config.subscriber_channel_capacity, 256);
        assert_eq!(config.auth_event_capacity, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = MessagingConfig::new()
            .timeout(Duration::from_secs(5))
            .max_pending_requests(10)
            .pending_cleanup_interval(Duration::from_millis(100));

        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_pending_requests, 10);
        assert_eq!(config.pending_cleanup_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_validation_zero_timeout() {
        let config = MessagingConfig::new().timeout(Duration::ZERO);
        assert_eq!(config.validate().unwrap_err(), "Timeout must be > 0");
    }

    #[test]
    fn test_validation_zero_command_channel_capacity() {
        let config = MessagingConfig::new().command_channel_capacity(0);
        assert_eq!(
            config.validate().unwrap_err(),
            "Command channel capacity must be > 0"
        );
    }

    #[test]
    fn test_auth_event_capacity() {
        let config = MessagingConfig::new().auth_event_capacity(4);
        assert_eq!(config.auth_event_capacity, 4);
        assert!(config.validate().is_ok());

        let config = MessagingConfig::new().auth_event_capacity(0);
        assert_eq!(
            config.validate().unwrap_err(),
            "Auth event capacity must be > 0"
        );
    }
}
