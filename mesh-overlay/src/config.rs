//! Per-connection tuning knobs.
//!
//! Every [`crate::connection::ReliableConnection`] is built from a
//! [`ConnectionConfig`], so tests can shrink the window (e.g. to 2) to
//! exercise epoch rollover and index wraparound quickly.

use std::time::Duration;

/// Default number of slots in a send or receive window.
pub const DEFAULT_WINDOW_SIZE: usize = 10;
/// Default largest sequence index before the generator wraps to 0.
pub const DEFAULT_MAX_MESSAGE_INDEX: u64 = 10_000;
/// Default delay between retransmissions of an unacknowledged message.
pub const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_secs(10);

/// Adjustable protocol parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Slots per window; also the number of timers that can be outstanding.
    pub window_size: usize,
    /// Largest index the uid generator emits before wrapping to 0.
    pub max_message_index: u64,
    /// Fixed retransmission period (no back-off).
    pub retransmit_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_message_index: DEFAULT_MAX_MESSAGE_INDEX,
            retransmit_interval: DEFAULT_RETRANSMIT_INTERVAL,
        }
    }
}

impl ConnectionConfig {
    /// Set the number of slots per window.
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    /// Set the largest index before the sequence wraps to 0.
    pub fn with_max_message_index(mut self, max_message_index: u64) -> Self {
        self.max_message_index = max_message_index;
        self
    }

    /// Set the fixed retransmission period.
    pub fn with_retransmit_interval(mut self, interval: Duration) -> Self {
        self.retransmit_interval = interval;
        self
    }

    /// Number of distinct indices the generator cycles through.
    pub fn sequence_space(&self) -> u64 {
        self.max_message_index.saturating_add(1)
    }

    /// Reject settings the windows cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.window_size as u64 > self.sequence_space() {
            return Err(ConfigError::WindowExceedsSequenceSpace {
                window_size: self.window_size,
                sequence_space: self.sequence_space(),
            });
        }
        if self.retransmit_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("window size must be at least 1")]
    ZeroWindow,
    #[error("window size {window_size} exceeds the sequence space of {sequence_space} indices")]
    WindowExceedsSequenceSpace {
        window_size: usize,
        sequence_space: u64,
    },
    #[error("retransmit interval must be non-zero")]
    ZeroInterval,
}
