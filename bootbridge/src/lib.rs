//! # bootbridge
//!
//! A library for reprogramming a microcontroller through its serial
//! bootloader.
//!
//! A host sits between clients and a target whose bootloader speaks a
//! small word-oriented protocol (SYNC, INFO, ERASE, WRITE, SEAL, GO). This
//! crate provides:
//!
//! - Framing and CRC32 for the bootloader protocol
//! - A non-blocking, poll-driven engine that erases, writes, seals and
//!   starts a staged firmware image
//! - Text notifications for connected clients (`log:`, `error:`,
//!   `success:`, `EVENT:`)
//! - Boot-select and reset control over the port's modem lines
//! - A transparent serial bridge to the target between sessions
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use bootbridge::{DirStore, Engine, EngineConfig, LogSink};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let port = bootbridge::NativePort::open_simple("/dev/ttyACM0", 921_600)?;
//!         let store = DirStore::new("/srv/firmware");
//!         let mut engine = Engine::new(port, store, LogSink, EngineConfig::default());
//!
//!         engine.begin(None)?;
//!         engine.run(Duration::from_millis(1))?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod control;
pub mod engine;
pub mod error;
pub mod notify;
pub mod port;
pub mod protocol;
pub mod storage;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by [`Engine::run`].
///
/// The checker should return `true` when the current session should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    control::{BootControl, ClientCommand, Line, LineBootControl, NoBootControl},
    engine::{Engine, EngineConfig, Poll, State},
    error::{Error, Result},
    notify::{Event, LogSink, Notification, NotificationSink, Phase},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{Command, Opcode, Response, TargetFlashGeometry, Word},
    storage::{DirStore, ImageStore, MemoryStore, STAGED_IMAGE, StagedImage},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_toggle() {
        test_set_interrupted(true);
        assert!(is_interrupted_requested());

        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }
}
