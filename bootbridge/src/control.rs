//! Client commands and target boot-line control.
//!
//! Clients drive the bridge with short text commands. Entering the target's
//! bootloader needs two hardware lines, boot-select and reset, which a USB
//! serial adapter usually exposes as DTR and RTS.

use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::port::Port;

/// Length of the reset pulse.
pub const RESET_PULSE: Duration = Duration::from_millis(100);

/// Text command sent by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientCommand {
    /// Reset the target into its bootloader and sync with it.
    PrepareFlash,
    /// Flash the staged image on a synced target.
    StartFlash,
    /// Reset the target into its application.
    RebootTarget,
}

impl ClientCommand {
    /// Wire text of the command, as deployed web and BLE clients send it.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrepareFlash => "CMD:PREPARE_FLASH",
            Self::StartFlash => "CMD:START_FLASH",
            Self::RebootTarget => "CMD:REBOOT_RP2040",
        }
    }
}

impl FromStr for ClientCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "CMD:PREPARE_FLASH" => Ok(Self::PrepareFlash),
            "CMD:START_FLASH" => Ok(Self::StartFlash),
            "CMD:REBOOT_RP2040" | "CMD:REBOOT_TARGET" => Ok(Self::RebootTarget),
            other => Err(Error::Protocol(format!("Unknown command: {other}"))),
        }
    }
}

impl fmt::Display for ClientCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives the target's boot-select and reset lines.
pub trait BootControl: Send {
    /// Hold boot-select and pulse reset so the target starts its bootloader.
    fn enter_bootloader(&mut self, port: &mut dyn Port) -> Result<()>;

    /// Let go of boot-select once the bootloader answered.
    fn release_boot_select(&mut self, port: &mut dyn Port) -> Result<()>;

    /// Pulse reset with boot-select released.
    fn reset(&mut self, port: &mut dyn Port) -> Result<()>;
}

/// For targets whose lines are not wired to the port.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBootControl;

impl BootControl for NoBootControl {
    fn enter_bootloader(&mut self, _port: &mut dyn Port) -> Result<()> {
        Ok(())
    }

    fn release_boot_select(&mut self, _port: &mut dyn Port) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self, _port: &mut dyn Port) -> Result<()> {
        Ok(())
    }
}

/// Modem control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Line {
    /// Data Terminal Ready.
    Dtr,
    /// Request To Send.
    Rts,
}

impl Line {
    fn set(self, port: &mut dyn Port, asserted: bool) -> Result<()> {
        match self {
            Self::Dtr => port.set_dtr(asserted),
            Self::Rts => port.set_rts(asserted),
        }
    }
}

impl FromStr for Line {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dtr" => Ok(Self::Dtr),
            "rts" => Ok(Self::Rts),
            other => Err(Error::Config(format!("Unknown control line: {other}"))),
        }
    }
}

/// Boot control over two modem lines. Asserting a line drives the target
/// pin low, the usual wiring for auto-reset circuits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineBootControl {
    /// Line wired to the boot-select pin.
    pub boot_select: Line,
    /// Line wired to the reset pin.
    pub reset: Line,
    /// How long reset is held.
    pub pulse: Duration,
}

impl Default for LineBootControl {
    fn default() -> Self {
        Self {
            boot_select: Line::Dtr,
            reset: Line::Rts,
            pulse: RESET_PULSE,
        }
    }
}

impl LineBootControl {
    /// Control with the given line assignment.
    pub fn new(boot_select: Line, reset: Line) -> Result<Self> {
        if boot_select == reset {
            return Err(Error::Config(
                "Boot-select and reset must use different lines".into(),
            ));
        }
        Ok(Self {
            boot_select,
            reset,
            pulse: RESET_PULSE,
        })
    }

    fn pulse_reset(&self, port: &mut dyn Port) -> Result<()> {
        self.reset.set(port, true)?;
        thread::sleep(self.pulse);
        self.reset.set(port, false)
    }
}

impl BootControl for LineBootControl {
    fn enter_bootloader(&mut self, port: &mut dyn Port) -> Result<()> {
        debug!("Entering bootloader via {:?}/{:?}", self.boot_select, self.reset);
        self.boot_select.set(port, true)?;
        self.pulse_reset(port)
    }

    fn release_boot_select(&mut self, port: &mut dyn Port) -> Result<()> {
        self.boot_select.set(port, false)
    }

    fn reset(&mut self, port: &mut dyn Port) -> Result<()> {
        self.boot_select.set(port, false)?;
        self.pulse_reset(port)
    }
}
