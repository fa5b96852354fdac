//! Channel and multiplexer configuration.
//!
//! Transport settings live in [`TransportConfig`](super::transport::TransportConfig);
//! this module covers the connection layer.

use super::connection::MIN_CHANNEL_PACKET_SIZE;
use skiff_platform::{SkiffError, SkiffResult};
use std::time::Duration;

/// Per-channel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelConfig {
    /// Local window announced to the peer and restored by WINDOW_ADJUST.
    pub window_maximum: u32,
    /// Low watermark: an adjust is sent once remaining credit drops below it.
    pub window_minimum: u32,
    /// Largest data payload the peer may send in one message.
    pub max_packet_size: u32,
    /// Receive cache capacity in bytes (per stream).
    pub cache_capacity: usize,
    /// Force-close the channel after this much inactivity.
    pub idle_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            window_maximum: 2 * 1024 * 1024,
            window_minimum: 128 * 1024,
            max_packet_size: 32768,
            cache_capacity: 2 * 1024 * 1024,
            idle_timeout: None,
        }
    }
}

impl ChannelConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the window maximum and minimum.
    pub fn with_window(mut self, maximum: u32, minimum: u32) -> Self {
        self.window_maximum = maximum;
        self.window_minimum = minimum;
        self
    }

    /// Sets the maximum packet size.
    pub fn with_max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Sets the receive cache capacity.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SkiffResult<()> {
        if self.max_packet_size < MIN_CHANNEL_PACKET_SIZE {
            return Err(SkiffError::Config(format!(
                "max_packet_size must be at least {}",
                MIN_CHANNEL_PACKET_SIZE
            )));
        }
        if self.window_maximum < MIN_CHANNEL_PACKET_SIZE {
            return Err(SkiffError::Config(format!(
                "window_maximum must be at least {}",
                MIN_CHANNEL_PACKET_SIZE
            )));
        }
        if self.window_minimum > self.window_maximum {
            return Err(SkiffError::Config(
                "window_minimum must not exceed window_maximum".to_string(),
            ));
        }
        if self.cache_capacity < self.window_maximum as usize {
            return Err(SkiffError::Config(
                "cache_capacity must hold a full window".to_string(),
            ));
        }
        if matches!(self.idle_timeout, Some(t) if t.is_zero()) {
            return Err(SkiffError::Config(
                "idle_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connection-layer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MultiplexerConfig {
    /// Size of the local channel-id pool.
    pub max_channels: u32,
    /// How long to wait for OPEN_CONFIRMATION / OPEN_FAILURE.
    pub open_timeout: Duration,
    /// How long to wait for the reactor to confirm a write.
    pub write_timeout: Duration,
    /// How long a sender waits for window credit.
    pub window_timeout: Duration,
    /// Retry interval for bounded waits.
    pub poll_interval: Duration,
    /// How long to wait for a global request reply.
    pub global_request_timeout: Duration,
    /// Keep-alive probe interval (`None` disables keep-alive).
    pub keepalive_interval: Option<Duration>,
    /// How long a keep-alive probe may stay unanswered.
    pub keepalive_timeout: Duration,
    /// How often idle channels are swept.
    pub idle_sweep_interval: Duration,
    /// How long a graceful close waits for the peer's CLOSE.
    pub close_timeout: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            max_channels: 1024,
            open_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            window_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            global_request_timeout: Duration::from_secs(30),
            keepalive_interval: None,
            keepalive_timeout: Duration::from_secs(15),
            idle_sweep_interval: Duration::from_secs(5),
            close_timeout: Duration::from_secs(10),
        }
    }
}

impl MultiplexerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the channel-id pool size.
    pub fn with_max_channels(mut self, max: u32) -> Self {
        self.max_channels = max;
        self
    }

    /// Sets the open timeout.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Sets the write-confirmation timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the window-credit timeout.
    pub fn with_window_timeout(mut self, timeout: Duration) -> Self {
        self.window_timeout = timeout;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the global request timeout.
    pub fn with_global_request_timeout(mut self, timeout: Duration) -> Self {
        self.global_request_timeout = timeout;
        self
    }

    /// Enables keep-alive probes.
    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self.keepalive_timeout = timeout;
        self
    }

    /// Sets the idle sweep interval.
    pub fn with_idle_sweep_interval(mut self, interval: Duration) -> Self {
        self.idle_sweep_interval = interval;
        self
    }

    /// Sets the graceful close timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SkiffResult<()> {
        if self.max_channels == 0 {
            return Err(SkiffError::Config(
                "max_channels must be non-zero".to_string(),
            ));
        }
        let durations = [
            ("open_timeout", self.open_timeout),
            ("write_timeout", self.write_timeout),
            ("window_timeout", self.window_timeout),
            ("poll_interval", self.poll_interval),
            ("global_request_timeout", self.global_request_timeout),
            ("keepalive_timeout", self.keepalive_timeout),
            ("idle_sweep_interval", self.idle_sweep_interval),
            ("close_timeout", self.close_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(SkiffError::Config(format!("{} must be non-zero", name)));
            }
        }
        if matches!(self.keepalive_interval, Some(t) if t.is_zero()) {
            return Err(SkiffError::Config(
                "keepalive_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
