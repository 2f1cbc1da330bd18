//! Engine timing and retry policy.

use std::time::Duration;

/// Delay after sending a command before the first look for its response.
pub const RESPONSE_FLOOR: Duration = Duration::from_millis(10);

/// Window for the SYNC answer before the attempt is retried.
pub const SYNC_WINDOW: Duration = Duration::from_secs(1);

/// Ceiling for INFO, ERASE, WRITE and SEAL responses.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Time the target needs after a reset before it answers SYNC.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// SYNC attempts before the session fails.
pub const MAX_SYNC_ATTEMPTS: u32 = 10;

/// Value used to pad a WRITE beyond the end of the image.
pub const PAD_BYTE: u8 = 0xFF;

/// Largest write granularity the engine buffers.
pub const MAX_WRITE_CHUNK: u32 = 64 * 1024;

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Delay after a command before its response is polled.
    pub response_floor: Duration,
    /// SYNC answer window, measured from the SYNC command.
    pub sync_window: Duration,
    /// Ceiling for every other response.
    pub command_timeout: Duration,
    /// Wait at the start of each SYNC attempt.
    pub settle_delay: Duration,
    /// SYNC attempts before giving up.
    pub max_sync_attempts: u32,
    /// Padding for the tail of the last WRITE.
    pub pad_byte: u8,
    /// Stop after SYNC and wait for an explicit start signal.
    pub require_start_signal: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_floor: RESPONSE_FLOOR,
            sync_window: SYNC_WINDOW,
            command_timeout: COMMAND_TIMEOUT,
            settle_delay: SETTLE_DELAY,
            max_sync_attempts: MAX_SYNC_ATTEMPTS,
            pad_byte: PAD_BYTE,
            require_start_signal: false,
        }
    }
}

impl EngineConfig {
    /// Set the response floor.
    #[must_use]
    pub fn with_response_floor(mut self, floor: Duration) -> Self {
        self.response_floor = floor;
        self
    }

    /// Set the SYNC window.
    #[must_use]
    pub fn with_sync_window(mut self, window: Duration) -> Self {
        self.sync_window = window;
        self
    }

    /// Set the command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the settle delay.
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the SYNC attempt budget (at least one attempt is always made).
    #[must_use]
    pub fn with_max_sync_attempts(mut self, attempts: u32) -> Self {
        self.max_sync_attempts = attempts.max(1);
        self
    }

    /// Set the padding byte.
    #[must_use]
    pub fn with_pad_byte(mut self, pad: u8) -> Self {
        self.pad_byte = pad;
        self
    }

    /// Require a start signal after SYNC.
    #[must_use]
    pub fn with_start_signal(mut self, required: bool) -> Self {
        self.require_start_signal = required;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.response_floor, Duration::from_millis(10));
        assert_eq!(config.sync_window, Duration::from_secs(1));
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.max_sync_attempts, 10);
        assert_eq!(config.pad_byte, 0xFF);
        assert!(!config.require_start_signal);
    }

    #[test]
    fn test_sync_attempts_never_zero() {
        let config = EngineConfig::default().with_max_sync_attempts(0);
        assert_eq!(config.max_sync_attempts, 1);
    }
}
