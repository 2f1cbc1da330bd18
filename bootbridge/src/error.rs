//! Error types for bootbridge.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::frame::Word;

/// Result type for bootbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bootbridge operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, staged image).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The staged image does not exist in the store.
    #[error("Staged image not found: {}", .0.display())]
    ImageNotFound(PathBuf),

    /// The staged image cannot be addressed with 32-bit words.
    #[error("Staged image too large: {0} bytes")]
    ImageTooLarge(u64),

    /// No response within the allowed window.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unexpected or garbled response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The target answered with a non-OK status.
    #[error("{command} rejected by target at {address:#010x} (status {status})")]
    TargetRejected {
        /// Mnemonic of the rejected command.
        command: &'static str,
        /// Flash address the command targeted.
        address: u32,
        /// Status word returned by the target.
        status: Word,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A session is already running.
    #[error("A flash session is already in progress")]
    Busy,

    /// The session ended with an error notification.
    #[error("Flash failed: {0}")]
    Failed(String),

    /// The embedding application asked to stop.
    #[error("Operation interrupted")]
    Interrupted,
}
