//! Non-blocking reprogramming engine.
//!
//! [`Engine`] owns the serial port, the image store and the notification
//! sink. Every call to [`Engine::poll`] does one bounded unit of work: it
//! looks at what the [`Machine`] needs, checks the port or reads the image
//! without waiting, and carries out the resulting effects. The embedding
//! loop can service other tasks between polls.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use bootbridge::engine::{Engine, EngineConfig};
//! use bootbridge::notify::LogSink;
//! use bootbridge::port::{NativePort, SerialConfig};
//! use bootbridge::storage::DirStore;
//!
//! fn main() -> bootbridge::Result<()> {
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 921_600))?;
//!     let store = DirStore::new("/var/lib/bootbridge");
//!     let mut engine = Engine::new(port, store, LogSink, EngineConfig::default());
//!
//!     engine.begin(None)?;
//!     engine.run(Duration::from_millis(1))
//! }
//! ```

pub mod clock;
pub mod config;
pub mod machine;

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::control::{BootControl, ClientCommand, NoBootControl};
use crate::error::{Error, Result};
use crate::notify::{Event as ClientEvent, Notification, NotificationSink};
use crate::port::Port;
use crate::protocol::crc::crc32_reader;
use crate::protocol::frame::{Command, Opcode};
use crate::storage::{ImageStore, STAGED_IMAGE, StagedImage};

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use machine::{Demand, Effect, Event, FlashSession, Machine, State};

/// Largest block moved per read while bridging.
const BRIDGE_CHUNK: usize = 256;

/// Outcome of one [`Engine::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// No session is running.
    Idle,
    /// Waiting on a timer or the target.
    Pending,
    /// The engine moved to a new state.
    Advanced(State),
}

/// Drives one target through a reprogram session.
pub struct Engine<P, S, N, C = SystemClock>
where
    S: ImageStore,
{
    port: P,
    store: S,
    sink: N,
    clock: C,
    control: Box<dyn BootControl>,
    machine: Machine,
    image: Option<S::Image>,
    image_path: PathBuf,
    last_error: Option<String>,
    scratch: Vec<u8>,
}

impl<P, S, N> Engine<P, S, N, SystemClock>
where
    P: Port,
    S: ImageStore,
    N: NotificationSink,
{
    /// Engine on the wall clock.
    pub fn new(port: P, store: S, sink: N, config: EngineConfig) -> Self {
        Self::with_clock(port, store, sink, config, SystemClock)
    }
}

impl<P, S, N, C> Engine<P, S, N, C>
where
    P: Port,
    S: ImageStore,
    N: NotificationSink,
    C: Clock,
{
    /// Engine on a custom clock.
    pub fn with_clock(port: P, store: S, sink: N, config: EngineConfig, clock: C) -> Self {
        Self {
            port,
            store,
            sink,
            clock,
            control: Box::new(NoBootControl),
            machine: Machine::new(config),
            image: None,
            image_path: PathBuf::from(STAGED_IMAGE),
            last_error: None,
            scratch: Vec::new(),
        }
    }

    /// Read the image from `path` instead of [`STAGED_IMAGE`].
    #[must_use]
    pub fn with_image_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_path = path.into();
        self
    }

    /// Use `control` for the boot-select and reset lines.
    #[must_use]
    pub fn with_boot_control(mut self, control: impl BootControl + 'static) -> Self {
        self.control = Box::new(control);
        self
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.machine.state()
    }

    /// Current session, if any.
    pub fn session(&self) -> Option<&FlashSession> {
        self.machine.session()
    }

    /// Whether a session is being driven.
    pub fn is_active(&self) -> bool {
        self.machine.is_active()
    }

    /// Whether the target is synced and waits for [`Engine::start_flash`].
    pub fn awaiting_start(&self) -> bool {
        self.machine.awaiting_start()
    }

    /// Path the image is read from.
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    /// Last error reported to the sink.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Mutable access to the port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// The notification sink.
    pub fn sink(&self) -> &N {
        &self.sink
    }

    /// Mutable access to the image store.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Take the engine apart.
    pub fn into_parts(self) -> (P, S, N) {
        (self.port, self.store, self.sink)
    }

    /// Replace the staged image with everything read from `data`.
    ///
    /// Refused while a session is reading the image.
    pub fn stage_image(&mut self, data: &mut dyn Read) -> Result<u64> {
        if self.is_active() || self.awaiting_start() {
            return Err(Error::Busy);
        }
        let size = self.store.stage(&self.image_path, data)?;
        info!("Staged {size} bytes at {}", self.image_path.display());
        self.sink
            .notify(&Notification::Event(ClientEvent::UploadComplete));
        Ok(size)
    }

    /// Pass bytes between the target and a client while no session owns
    /// the port.
    ///
    /// `input` is written to the target as is and everything the target has
    /// sent is copied to `output`. Returns the number of bytes forwarded to
    /// `output`. Refused with [`Error::Busy`] while a session runs or waits
    /// for its start signal; the target's bytes stay on the port for the
    /// session.
    pub fn bridge(&mut self, input: &[u8], output: &mut dyn Write) -> Result<usize> {
        if self.is_active() || self.awaiting_start() {
            return Err(Error::Busy);
        }
        if !input.is_empty() {
            trace!("bridge: {} bytes to target", input.len());
            self.port.write_all_bytes(input)?;
        }

        let mut buf = [0u8; BRIDGE_CHUNK];
        let mut forwarded = 0;
        loop {
            let pending = self.port.bytes_available()?;
            if pending == 0 {
                break;
            }
            let n = pending.min(buf.len());
            self.port.read_exact(&mut buf[..n])?;
            output.write_all(&buf[..n])?;
            forwarded += n;
        }
        if forwarded > 0 {
            output.flush()?;
            trace!("bridge: {forwarded} bytes from target");
        }
        Ok(forwarded)
    }

    /// Start a session on the configured image path.
    ///
    /// `expected_size`, when given, must match the staged image.
    pub fn begin(&mut self, expected_size: Option<u32>) -> Result<()> {
        let effects = self.machine.begin(self.clock.now(), expected_size)?;
        self.start_session(effects);
        Ok(())
    }

    /// Start a session on the image at `path`.
    pub fn begin_session(&mut self, path: impl Into<PathBuf>, expected_size: Option<u32>) -> Result<()> {
        if self.is_active() {
            return Err(Error::Busy);
        }
        self.image_path = path.into();
        self.begin(expected_size)
    }

    /// Reset the target into its bootloader and sync with it. The session
    /// then waits for [`Engine::start_flash`].
    pub fn prepare(&mut self) -> Result<()> {
        if self.is_active() {
            return Err(Error::Busy);
        }
        self.control.enter_bootloader(&mut self.port)?;
        let effects = self.machine.begin_gated(self.clock.now(), None)?;
        self.start_session(effects);
        self.sink
            .notify(&Notification::Event(ClientEvent::BootloaderMode));
        Ok(())
    }

    /// Flash the staged image on a target synced by [`Engine::prepare`].
    pub fn start_flash(&mut self) {
        let effects = self.machine.start(self.clock.now());
        self.execute(effects);
    }

    /// Reset the target into its application, dropping a waiting session.
    pub fn reboot_target(&mut self) -> Result<()> {
        let effects = self.machine.release()?;
        self.execute(effects);
        self.control.reset(&mut self.port)?;
        info!("Target rebooted");
        self.sink.notify(&Notification::success("Target rebooted"));
        Ok(())
    }

    /// Dispatch a parsed client command. Failures go to the sink.
    pub fn handle_command(&mut self, command: ClientCommand) {
        debug!("Client command {command}");
        let result = match command {
            ClientCommand::PrepareFlash => self.prepare(),
            ClientCommand::StartFlash => {
                self.start_flash();
                Ok(())
            },
            ClientCommand::RebootTarget => self.reboot_target(),
        };
        if let Err(e) = result {
            self.report_error(e.to_string());
        }
    }

    /// Parse and dispatch one line of client text.
    pub fn handle_text(&mut self, text: &str) -> Option<ClientCommand> {
        match text.parse::<ClientCommand>() {
            Ok(command) => {
                self.handle_command(command);
                Some(command)
            },
            Err(_) => {
                self.report_error(format!("Unknown command: {}", text.trim()));
                None
            },
        }
    }

    /// Do one bounded unit of work.
    pub fn poll(&mut self) -> Poll {
        let now = self.clock.now();
        let before = self.machine.state();

        let effects = match self.machine.demand(now) {
            Demand::Idle => return Poll::Idle,
            Demand::Wait => return Poll::Pending,
            Demand::OpenImage => match self.store.open(&self.image_path) {
                Ok(image) => {
                    let size = image.size();
                    self.image = Some(image);
                    self.machine.handle(now, Event::ImageOpened { size })
                },
                Err(e) => {
                    let reason = e.to_string();
                    self.machine.handle(now, Event::ImageUnavailable(&reason))
                },
            },
            Demand::Response(op) => self.read_response(op),
            Demand::Chunk { offset, max_len } => self.read_chunk(offset, max_len),
            Demand::Checksum => self.checksum(),
            Demand::Step => self.machine.handle(now, Event::Step),
        };
        self.execute(effects);

        let after = self.machine.state();
        if after == before {
            Poll::Pending
        } else {
            Poll::Advanced(after)
        }
    }

    /// Poll until the session is over or waits for a start signal, sleeping
    /// `tick` whenever there is nothing to do.
    ///
    /// Returns [`Error::Failed`] when the session reported an error.
    pub fn run(&mut self, tick: Duration) -> Result<()> {
        self.last_error = None;
        loop {
            if crate::is_interrupted_requested() {
                let effects = self.machine.abort("Interrupted");
                self.execute(effects);
                self.poll();
                return Err(Error::Interrupted);
            }
            match self.poll() {
                Poll::Idle => break,
                Poll::Pending => thread::sleep(tick),
                Poll::Advanced(state) => trace!("-> {state}"),
            }
        }
        match self.last_error.take() {
            Some(message) => Err(Error::Failed(message)),
            None => Ok(()),
        }
    }

    fn start_session(&mut self, effects: Vec<Effect>) {
        self.last_error = None;
        info!("Starting session on {}", self.image_path.display());
        self.execute(effects);
    }

    fn report_error(&mut self, message: String) {
        warn!("{message}");
        self.sink.notify(&Notification::Error(message.clone()));
        self.last_error = Some(message);
    }

    fn read_response(&mut self, op: Opcode) -> Vec<Effect> {
        let now = self.clock.now();
        let Some(len) = op.response_len() else {
            return self.machine.handle(now, Event::Step);
        };
        let available = match self.port.bytes_available() {
            Ok(n) => n,
            Err(e) => return self.machine.abort(&format!("Serial read failed: {e}")),
        };
        if available < len {
            return self.machine.handle(now, Event::Silence);
        }

        self.scratch.resize(len, 0);
        if let Err(e) = self.port.read_exact(&mut self.scratch) {
            return self.machine.abort(&format!("Serial read failed: {e}"));
        }
        trace!("<- {op} {:02x?}", self.scratch);
        self.machine.handle(now, Event::Response(&self.scratch))
    }

    fn read_chunk(&mut self, offset: u64, max_len: u32) -> Vec<Effect> {
        let now = self.clock.now();
        let Some(image) = self.image.as_mut() else {
            return self
                .machine
                .handle(now, Event::ReadFailed("Staged image is not open"));
        };

        self.scratch.clear();
        let read = image
            .seek(SeekFrom::Start(offset))
            .and_then(|_| image.take(u64::from(max_len)).read_to_end(&mut self.scratch));
        match read {
            Ok(_) => self.machine.handle(now, Event::Chunk(&self.scratch)),
            Err(e) => {
                let reason = format!("Read error on staged image at offset {offset}: {e}");
                self.machine.handle(now, Event::ReadFailed(&reason))
            },
        }
    }

    fn checksum(&mut self) -> Vec<Effect> {
        let now = self.clock.now();
        let Some(image) = self.image.as_mut() else {
            return self
                .machine
                .handle(now, Event::ReadFailed("Staged image is not open"));
        };
        match crc32_reader(image) {
            Ok(crc) => self.machine.handle(now, Event::Checksum(crc)),
            Err(e) => {
                let reason = format!("Checksum of staged image failed: {e}");
                self.machine.handle(now, Event::ReadFailed(&reason))
            },
        }
    }

    fn send(&mut self, command: &Command) -> Result<()> {
        self.port.discard_input()?;
        trace!("-> {command}");
        self.port.write_all_bytes(&command.build())
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(command) => {
                    if let Err(e) = self.send(&command) {
                        let message = format!("Failed to send {}: {e}", command.opcode());
                        let followup = self.machine.abort(&message);
                        if followup.is_empty() {
                            warn!("{message}");
                        }
                        self.execute(followup);
                    }
                },
                Effect::Notify(notification) => {
                    if let Notification::Error(message) = &notification {
                        self.last_error = Some(message.clone());
                    }
                    self.sink.notify(&notification);
                },
                Effect::ReleaseBootSelect => {
                    if let Err(e) = self.control.release_boot_select(&mut self.port) {
                        warn!("Failed to release boot select: {e}");
                    }
                },
                Effect::CloseImage => {
                    if self.image.take().is_some() {
                        debug!("Closed {}", self.image_path.display());
                    }
                },
            }
        }
    }
}
