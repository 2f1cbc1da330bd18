//! Client notifications.
//!
//! Every transition the engine makes is reported to connected clients as a
//! short text message. The first token selects how clients treat it:
//!
//! | Prefix     | Meaning                              |
//! |------------|--------------------------------------|
//! | `log:`     | progress and informational messages  |
//! | `error:`   | a failure, the session is over       |
//! | `success:` | an operation finished                |
//! | `EVENT:`   | machine-readable state change        |

use std::fmt;

/// Machine-readable state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// The target was reset into its bootloader.
    BootloaderMode,
    /// The target answered SYNC.
    TargetSynced,
    /// A staged image was fully received.
    UploadComplete,
    /// The image was written, sealed and started.
    FlashComplete,
}

impl Event {
    /// Wire name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BootloaderMode => "RP2040_BOOTLOADER_MODE",
            Self::TargetSynced => "RP2040_SYNCED",
            Self::UploadComplete => "UPLOAD_COMPLETE",
            Self::FlashComplete => "FLASH_COMPLETE",
        }
    }
}

/// Flash phase a progress percentage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Erasing the target range.
    Erase,
    /// Programming the image.
    Write,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Erase => "Erasing",
            Self::Write => "Writing",
        })
    }
}

/// A message for clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Informational message.
    Log(String),
    /// Percentage progress of a phase.
    Progress(Phase, u8),
    /// Failure message.
    Error(String),
    /// Completion message.
    Success(String),
    /// State change.
    Event(Event),
}

impl Notification {
    /// Informational message.
    pub fn log(msg: impl Into<String>) -> Self {
        Self::Log(msg.into())
    }

    /// Failure message.
    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error(msg.into())
    }

    /// Completion message.
    pub fn success(msg: impl Into<String>) -> Self {
        Self::Success(msg.into())
    }

    /// Whether this reports a failure.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log(msg) => write!(f, "log:{msg}"),
            Self::Progress(phase, pct) => write!(f, "log:{phase}: {pct}%"),
            Self::Error(msg) => write!(f, "error:{msg}"),
            Self::Success(msg) => write!(f, "success:{msg}"),
            Self::Event(event) => write!(f, "EVENT:{}", event.as_str()),
        }
    }
}

/// Destination for client notifications.
pub trait NotificationSink {
    /// Deliver one notification.
    fn notify(&mut self, notification: &Notification);
}

impl<N: NotificationSink + ?Sized> NotificationSink for &mut N {
    fn notify(&mut self, notification: &Notification) {
        (**self).notify(notification);
    }
}

impl<N: NotificationSink + ?Sized> NotificationSink for Box<N> {
    fn notify(&mut self, notification: &Notification) {
        (**self).notify(notification);
    }
}

/// Collects the rendered wire text of every notification.
impl NotificationSink for Vec<String> {
    fn notify(&mut self, notification: &Notification) {
        self.push(notification.to_string());
    }
}

/// Forwards notifications to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&mut self, notification: &Notification) {
        match notification {
            Notification::Error(msg) => log::error!("{msg}"),
            Notification::Success(msg) => log::info!("{msg}"),
            Notification::Log(msg) => log::info!("{msg}"),
            Notification::Progress(..) => log::debug!("{notification}"),
            Notification::Event(event) => log::debug!("event {}", event.as_str()),
        }
    }
}

/// Adapts a closure into a sink.
pub struct FnSink<F>(pub F);

impl<F: FnMut(&Notification)> NotificationSink for FnSink<F> {
    fn notify(&mut self, notification: &Notification) {
        (self.0)(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_prefixes() {
        assert_eq!(Notification::log("Syncing").to_string(), "log:Syncing");
        assert_eq!(Notification::error("boom").to_string(), "error:boom");
        assert_eq!(Notification::success("done").to_string(), "success:done");
        assert_eq!(
            Notification::Event(Event::FlashComplete).to_string(),
            "EVENT:FLASH_COMPLETE"
        );
        assert_eq!(
            Notification::Progress(Phase::Erase, 42).to_string(),
            "log:Erasing: 42%"
        );
    }

    fn deliver<N: NotificationSink>(mut sink: N, notification: &Notification) {
        sink.notify(notification);
    }

    #[test]
    fn test_vec_sink_records_text_through_reference() {
        let mut sink: Vec<String> = Vec::new();
        deliver(&mut sink, &Notification::Event(Event::TargetSynced));
        assert_eq!(sink, vec!["EVENT:RP2040_SYNCED".to_string()]);
    }

    #[test]
    fn test_fn_sink() {
        let mut errors = 0;
        let mut sink = FnSink(|n: &Notification| {
            if n.is_error() {
                errors += 1;
            }
        });
        sink.notify(&Notification::error("x"));
        sink.notify(&Notification::log("y"));
        drop(sink);
        assert_eq!(errors, 1);
    }
}
