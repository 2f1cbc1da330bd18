//! Reprogramming state machine.
//!
//! [`Machine`] performs no I/O. The driver asks what the current state needs
//! ([`Machine::demand`]), gathers that observation from the port or the
//! staged image, and hands it back as an [`Event`]. The machine answers with
//! the [`Effect`]s to carry out: frames to send, notifications to emit, the
//! image to close.
//!
//! ```text
//!  Idle -> Init -> WaitSync -> InfoRequest -> WaitInfo
//!            ^        |                          |
//!            +--retry-+                          v
//!                          WaitErase <-> EraseLoop
//!                                            |
//!                                            v
//!                          WaitWrite <-> WriteLoop
//!                                            |
//!                                            v
//!              Done <- WaitSeal <- SealFlash <- CrcCompute
//!                |
//!                v
//!              Idle                 (any failure: Error -> Idle)
//! ```

use std::fmt;
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::engine::config::{EngineConfig, MAX_WRITE_CHUNK};
use crate::error::Error;
use crate::notify::{Event as ClientEvent, Notification, Phase};
use crate::protocol::frame::{
    Command, Opcode, RSP_OK, RSP_SYNC, Response, TargetFlashGeometry, WRITE_ALIGN, Word,
    align_write_len,
};

/// Engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No session is running.
    Idle,
    /// Opening the image and sending SYNC.
    Init,
    /// Waiting for the SYNC answer.
    WaitSync,
    /// Sending INFO.
    InfoRequest,
    /// Waiting for the INFO answer.
    WaitInfo,
    /// Issuing the next ERASE.
    EraseLoop,
    /// Waiting for an ERASE answer.
    WaitErase,
    /// Issuing the next WRITE.
    WriteLoop,
    /// Waiting for a WRITE answer.
    WaitWrite,
    /// Checksumming the staged image.
    CrcCompute,
    /// Sending SEAL.
    SealFlash,
    /// Waiting for the SEAL answer.
    WaitSeal,
    /// Reporting completion and starting the application.
    Done,
    /// Cleaning up after a failure.
    Error,
}

impl State {
    /// Command whose response this state waits for.
    pub fn awaited(self) -> Option<Opcode> {
        match self {
            Self::WaitSync => Some(Opcode::Sync),
            Self::WaitInfo => Some(Opcode::Info),
            Self::WaitErase => Some(Opcode::Erase),
            Self::WaitWrite => Some(Opcode::Write),
            Self::WaitSeal => Some(Opcode::Seal),
            _ => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The single in-progress reprogram operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashSession {
    /// Size the client declared for the image, checked against the store.
    pub expected_size: Option<u32>,
    /// Size of the staged image.
    pub image_size: u32,
    /// Next image offset to write.
    pub file_cursor: u64,
    /// Next flash address to erase.
    pub erase_cursor: u64,
    /// Address of the WRITE awaiting its answer.
    pub last_write_addr: u32,
    /// Entry time of the current state.
    pub state_entered: Instant,
    /// Time the last command was sent.
    pub command_sent: Instant,
    /// Last reported percentage of the current phase.
    pub last_progress: u8,
    /// SYNC attempts made so far.
    pub sync_attempts: u32,
    /// Stop after SYNC until a start signal arrives.
    pub gated: bool,
    /// SYNC succeeded and the session waits for a start signal.
    pub synced: bool,
    /// Geometry learned from INFO.
    pub geometry: Option<TargetFlashGeometry>,
    /// Checksum of the staged image.
    pub crc: u32,
}

impl FlashSession {
    fn new(now: Instant, expected_size: Option<u32>, gated: bool) -> Self {
        Self {
            expected_size,
            gated,
            image_size: 0,
            file_cursor: 0,
            erase_cursor: 0,
            last_write_addr: 0,
            state_entered: now,
            command_sent: now,
            last_progress: 0,
            sync_attempts: 0,
            synced: false,
            geometry: None,
            crc: 0,
        }
    }
}

/// What the driver must observe before the next transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    /// Nothing to do.
    Idle,
    /// A timer is pending; poll again later.
    Wait,
    /// Open the staged image.
    OpenImage,
    /// Check whether the answer to this command has fully arrived.
    Response(Opcode),
    /// Read up to `max_len` image bytes at `offset`.
    Chunk {
        /// Image offset.
        offset: u64,
        /// Read limit.
        max_len: u32,
    },
    /// Checksum the whole staged image.
    Checksum,
    /// No input needed.
    Step,
}

/// Observation fed into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// Advance without input.
    Step,
    /// The staged image is open.
    ImageOpened {
        /// Size reported by the store.
        size: u64,
    },
    /// The staged image could not be opened.
    ImageUnavailable(&'a str),
    /// A complete response.
    Response(&'a [u8]),
    /// The response has not fully arrived.
    Silence,
    /// Image bytes at the requested offset; empty means nothing was read.
    Chunk(&'a [u8]),
    /// Reading the image failed.
    ReadFailed(&'a str),
    /// Checksum of the whole image.
    Checksum(u32),
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Discard stale input, then send the frame.
    Send(Command),
    /// Emit a client notification.
    Notify(Notification),
    /// Let go of the target's boot-select line.
    ReleaseBootSelect,
    /// Close the staged image.
    CloseImage,
}

/// State machine plus the session it drives.
#[derive(Debug, Clone)]
pub struct Machine {
    config: EngineConfig,
    state: State,
    session: Option<FlashSession>,
}

impl Machine {
    /// Idle machine.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: State::Idle,
            session: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Current session, if any.
    pub fn session(&self) -> Option<&FlashSession> {
        self.session.as_ref()
    }

    /// Configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a session is being driven.
    pub fn is_active(&self) -> bool {
        self.state != State::Idle
    }

    /// Whether the target is synced and the session waits for a start signal.
    pub fn awaiting_start(&self) -> bool {
        self.state == State::Idle && self.session.as_ref().is_some_and(|s| s.synced)
    }

    /// Start a fresh session at [`State::Init`].
    ///
    /// The session stops after SYNC when the configuration requires a start
    /// signal.
    pub fn begin(&mut self, now: Instant, expected_size: Option<u32>) -> Result<Vec<Effect>, Error> {
        let gated = self.config.require_start_signal;
        self.open_session(now, expected_size, gated)
    }

    /// Start a session that always stops after SYNC.
    pub fn begin_gated(
        &mut self,
        now: Instant,
        expected_size: Option<u32>,
    ) -> Result<Vec<Effect>, Error> {
        self.open_session(now, expected_size, true)
    }

    /// Drop a session that is waiting for its start signal.
    pub fn release(&mut self) -> Result<Vec<Effect>, Error> {
        if self.is_active() {
            return Err(Error::Busy);
        }
        Ok(match self.session.take() {
            Some(_) => vec![Effect::CloseImage],
            None => Vec::new(),
        })
    }

    fn open_session(
        &mut self,
        now: Instant,
        expected_size: Option<u32>,
        gated: bool,
    ) -> Result<Vec<Effect>, Error> {
        let effects = self.release()?;
        self.session = Some(FlashSession::new(now, expected_size, gated));
        self.enter(State::Init, now);
        Ok(effects)
    }

    /// Continue a synced session past the start gate.
    pub fn start(&mut self, now: Instant) -> Vec<Effect> {
        if !self.awaiting_start() {
            return vec![Effect::Notify(Notification::error(
                "Target is not in bootloader mode",
            ))];
        }
        if let Some(session) = self.session.as_mut() {
            session.synced = false;
        }
        self.enter(State::InfoRequest, now);
        vec![Effect::Notify(Notification::log("Starting flash"))]
    }

    /// Fail the session from outside the transition table (transport faults).
    pub fn abort(&mut self, message: &str) -> Vec<Effect> {
        if !self.is_active() {
            return Vec::new();
        }
        self.fail(message.to_string())
    }

    /// Observation the current state needs.
    pub fn demand(&self, now: Instant) -> Demand {
        let Some(session) = self.session.as_ref() else {
            return Demand::Idle;
        };
        match self.state {
            State::Idle => Demand::Idle,
            State::Init => {
                if now.saturating_duration_since(session.state_entered) < self.config.settle_delay {
                    Demand::Wait
                } else {
                    Demand::OpenImage
                }
            },
            State::WriteLoop => match session.geometry {
                Some(g) if session.file_cursor < u64::from(session.image_size) => Demand::Chunk {
                    offset: session.file_cursor,
                    max_len: g.write_granularity,
                },
                _ => Demand::Step,
            },
            State::CrcCompute => Demand::Checksum,
            state => match state.awaited() {
                Some(op) => {
                    if now.saturating_duration_since(session.command_sent)
                        < self.config.response_floor
                    {
                        Demand::Wait
                    } else {
                        Demand::Response(op)
                    }
                },
                None => Demand::Step,
            },
        }
    }

    /// Pure form of [`Machine::handle`]: `(state, event) -> (state, effects)`.
    pub fn transition(mut self, now: Instant, event: Event<'_>) -> (Self, Vec<Effect>) {
        let effects = self.handle(now, event);
        (self, effects)
    }

    /// Apply one observation and return the resulting effects.
    ///
    /// At most one state transition happens per call.
    pub fn handle(&mut self, now: Instant, event: Event<'_>) -> Vec<Effect> {
        let before = self.state;
        let effects = match (self.state, event) {
            (State::Idle, _) => Vec::new(),
            (State::Init, Event::ImageOpened { size }) => self.on_image_opened(now, size),
            (State::Init, Event::ImageUnavailable(reason)) => self.fail(reason.to_string()),
            (State::WaitSync, Event::Response(bytes)) => self.on_sync(now, bytes),
            (State::InfoRequest, Event::Step) => {
                let mut effects = vec![Effect::Notify(Notification::log("Reading flash info..."))];
                effects.push(self.send(now, Command::info(), State::WaitInfo));
                effects
            },
            (State::WaitInfo, Event::Response(bytes)) => self.on_info(now, bytes),
            (State::EraseLoop, Event::Step) => self.erase_next(now),
            (State::WaitErase, Event::Response(bytes)) => self.on_erase(now, bytes),
            (State::WriteLoop, Event::Step) => {
                self.enter(State::CrcCompute, now);
                vec![Effect::Notify(Notification::log("Write complete"))]
            },
            (State::WriteLoop, Event::Chunk(data)) => self.write_chunk(now, data),
            (State::WriteLoop | State::CrcCompute, Event::ReadFailed(reason)) => {
                self.fail(reason.to_string())
            },
            (State::WaitWrite, Event::Response(bytes)) => self.on_write(now, bytes),
            (State::CrcCompute, Event::Checksum(crc)) => {
                if let Some(session) = self.session.as_mut() {
                    session.crc = crc;
                }
                self.enter(State::SealFlash, now);
                vec![Effect::Notify(Notification::log(format!("Image CRC32: {crc:#010x}")))]
            },
            (State::SealFlash, Event::Step) => self.seal(now),
            (State::WaitSeal, Event::Response(bytes)) => self.on_seal(now, bytes),
            (state, Event::Silence) => self.on_silence(now, state),
            (State::Done, Event::Step) => self.finish(),
            (State::Error, Event::Step) => {
                self.state = State::Idle;
                self.session = None;
                vec![Effect::CloseImage]
            },
            (state, event) => {
                debug!("Ignoring {event:?} in {state}");
                Vec::new()
            },
        };
        if self.state != before {
            debug!("{before} -> {}", self.state);
        }
        effects
    }

    fn enter(&mut self, state: State, now: Instant) {
        self.state = state;
        if let Some(session) = self.session.as_mut() {
            session.state_entered = now;
        }
    }

    fn send(&mut self, now: Instant, command: Command, next: State) -> Effect {
        if let Some(session) = self.session.as_mut() {
            session.command_sent = now;
        }
        self.enter(next, now);
        Effect::Send(command)
    }

    fn fail(&mut self, message: String) -> Vec<Effect> {
        error!("{message}");
        self.state = State::Error;
        vec![Effect::Notify(Notification::Error(message))]
    }

    fn geometry(&self) -> Option<TargetFlashGeometry> {
        self.session.as_ref().and_then(|s| s.geometry)
    }

    fn report(&mut self, phase: Phase, done: u64) -> Option<Effect> {
        let session = self.session.as_mut()?;
        if session.image_size == 0 {
            return None;
        }
        let pct = (done.saturating_mul(100) / u64::from(session.image_size)).min(100);
        let pct = u8::try_from(pct).unwrap_or(100);
        if pct <= session.last_progress {
            return None;
        }
        session.last_progress = pct;
        Some(Effect::Notify(Notification::Progress(phase, pct)))
    }

    fn on_image_opened(&mut self, now: Instant, size: u64) -> Vec<Effect> {
        let Ok(size) = u32::try_from(size) else {
            return self.fail(Error::ImageTooLarge(size).to_string());
        };
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if let Some(expected) = session.expected_size.filter(|&e| e != size) {
            return self.fail(format!(
                "Staged image is {size} bytes, expected {expected}"
            ));
        }
        session.image_size = size;
        session.file_cursor = 0;
        session.sync_attempts += 1;
        let attempt = session.sync_attempts;

        info!("Syncing with target bootloader (attempt {attempt})");
        vec![
            Effect::Notify(Notification::log("Syncing with target bootloader...")),
            self.send(now, Command::sync(), State::WaitSync),
        ]
    }

    fn on_sync(&mut self, now: Instant, bytes: &[u8]) -> Vec<Effect> {
        let word = Word::from_le_slice(bytes).unwrap_or(Word(0));
        if word != RSP_SYNC {
            return self.retry_sync(now, &format!("Unexpected SYNC response {word}"));
        }

        let mut effects = vec![
            Effect::Notify(Notification::log("Target synced")),
            Effect::ReleaseBootSelect,
            Effect::Notify(Notification::Event(ClientEvent::TargetSynced)),
        ];
        let gated = self.session.as_ref().is_some_and(|s| s.gated);
        if gated {
            if let Some(session) = self.session.as_mut() {
                session.synced = true;
            }
            self.enter(State::Idle, now);
            effects.push(Effect::Notify(Notification::log("Waiting for start signal")));
        } else {
            self.enter(State::InfoRequest, now);
        }
        effects
    }

    fn retry_sync(&mut self, now: Instant, reason: &str) -> Vec<Effect> {
        let attempts = self.session.as_ref().map_or(0, |s| s.sync_attempts);
        if attempts >= self.config.max_sync_attempts {
            return self.fail(format!(
                "{reason}; target did not sync after {attempts} attempts"
            ));
        }
        warn!("{reason}, retrying SYNC ({attempts}/{})", self.config.max_sync_attempts);
        self.enter(State::Init, now);
        vec![
            Effect::Notify(Notification::log(format!("{reason}, retrying"))),
            Effect::CloseImage,
        ]
    }

    fn on_info(&mut self, now: Instant, bytes: &[u8]) -> Vec<Effect> {
        let Some(Response::Info(status, geometry)) = Response::decode(Opcode::Info, bytes) else {
            return self.fail(Error::Protocol("Malformed INFO response".into()).to_string());
        };
        if status != RSP_OK {
            return self.fail(format!("INFO rejected by target (status {status})"));
        }
        let image_size = self.session.as_ref().map_or(0, |s| s.image_size);
        if let Err(reason) = check_geometry(&geometry, image_size) {
            return self.fail(reason);
        }

        info!(
            "Flash info: start {:#010x}, size {:#x}, erase {:#x}, write {:#x}",
            geometry.base, geometry.size, geometry.erase_granularity, geometry.write_granularity
        );
        if let Some(session) = self.session.as_mut() {
            session.geometry = Some(geometry);
            session.erase_cursor = u64::from(geometry.base);
            session.last_progress = 0;
        }
        self.enter(State::EraseLoop, now);
        vec![Effect::Notify(Notification::log(format!(
            "Flash info: start {:#010x}, size {:#x}, erase {:#x}, write {:#x}",
            geometry.base, geometry.size, geometry.erase_granularity, geometry.write_granularity
        )))]
    }

    fn erase_next(&mut self, now: Instant) -> Vec<Effect> {
        let Some(g) = self.geometry() else {
            return self.fail("Flash geometry unknown".into());
        };
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let end = u64::from(g.base) + u64::from(session.image_size);
        if session.erase_cursor < end {
            // erase_cursor < end <= u32::MAX
            let addr = u32::try_from(session.erase_cursor).unwrap_or(u32::MAX);
            return vec![self.send(
                now,
                Command::erase(addr, g.erase_granularity),
                State::WaitErase,
            )];
        }

        session.file_cursor = 0;
        session.last_progress = 0;
        self.enter(State::WriteLoop, now);
        vec![Effect::Notify(Notification::log("Erase complete"))]
    }

    fn on_erase(&mut self, now: Instant, bytes: &[u8]) -> Vec<Effect> {
        let status = Word::from_le_slice(bytes).unwrap_or(Word(0));
        let Some(g) = self.geometry() else {
            return self.fail("Flash geometry unknown".into());
        };
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let addr = u32::try_from(session.erase_cursor).unwrap_or(u32::MAX);
        if status != RSP_OK {
            return self.fail(
                Error::TargetRejected {
                    command: Opcode::Erase.mnemonic(),
                    address: addr,
                    status,
                }
                .to_string(),
            );
        }

        session.erase_cursor += u64::from(g.erase_granularity);
        let erased = session.erase_cursor - u64::from(g.base);
        self.enter(State::EraseLoop, now);
        self.report(Phase::Erase, erased).into_iter().collect()
    }

    fn write_chunk(&mut self, now: Instant, data: &[u8]) -> Vec<Effect> {
        let pad = self.config.pad_byte;
        let Some(g) = self.geometry() else {
            return self.fail("Flash geometry unknown".into());
        };
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if data.is_empty() {
            let offset = session.file_cursor;
            return self.fail(format!("Read error on staged image at offset {offset}"));
        }

        let max = usize::try_from(g.write_granularity).unwrap_or(usize::MAX);
        let data = &data[..data.len().min(max)];
        // Bounded by write_granularity, which fits in u32
        let read = u32::try_from(data.len()).unwrap_or(g.write_granularity);
        let len = align_write_len(read);
        let mut block = data.to_vec();
        block.resize(len as usize, pad);

        let offset = u32::try_from(session.file_cursor).unwrap_or(u32::MAX);
        let addr = g.base.wrapping_add(offset);
        session.last_write_addr = addr;
        session.file_cursor += u64::from(len);
        debug!("WRITE {len:#x} bytes at {addr:#010x}");
        vec![self.send(now, Command::write(addr, block), State::WaitWrite)]
    }

    fn on_write(&mut self, now: Instant, bytes: &[u8]) -> Vec<Effect> {
        let Some(rsp) = Response::decode(Opcode::Write, bytes) else {
            return self.fail(Error::Protocol("Malformed WRITE response".into()).to_string());
        };
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        let (addr, cursor) = (session.last_write_addr, session.file_cursor);
        if rsp.status() != RSP_OK {
            return self.fail(
                Error::TargetRejected {
                    command: Opcode::Write.mnemonic(),
                    address: addr,
                    status: rsp.status(),
                }
                .to_string(),
            );
        }

        self.enter(State::WriteLoop, now);
        self.report(Phase::Write, cursor).into_iter().collect()
    }

    fn seal(&mut self, now: Instant) -> Vec<Effect> {
        let Some(g) = self.geometry() else {
            return self.fail("Flash geometry unknown".into());
        };
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        let command = Command::seal(g.base, session.image_size, session.crc);
        vec![
            Effect::Notify(Notification::log("Sealing image...")),
            self.send(now, command, State::WaitSeal),
        ]
    }

    fn on_seal(&mut self, now: Instant, bytes: &[u8]) -> Vec<Effect> {
        let status = Word::from_le_slice(bytes).unwrap_or(Word(0));
        let base = self.geometry().map_or(0, |g| g.base);
        if status != RSP_OK {
            return self.fail(
                Error::TargetRejected {
                    command: Opcode::Seal.mnemonic(),
                    address: base,
                    status,
                }
                .to_string(),
            );
        }
        self.enter(State::Done, now);
        vec![Effect::Notify(Notification::log("Seal OK"))]
    }

    fn on_silence(&mut self, now: Instant, state: State) -> Vec<Effect> {
        let Some(op) = state.awaited() else {
            return Vec::new();
        };
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        let waited = now.saturating_duration_since(session.command_sent);

        if op == Opcode::Sync {
            if waited > self.config.sync_window {
                return self.retry_sync(now, "Timeout waiting for SYNC response");
            }
            return Vec::new();
        }
        if waited <= self.config.command_timeout {
            return Vec::new();
        }

        let message = match op {
            Opcode::Erase => format!(
                "Timeout waiting for ERASE response at {:#010x}",
                session.erase_cursor
            ),
            Opcode::Write => format!(
                "Timeout waiting for WRITE response at {:#010x}",
                session.last_write_addr
            ),
            op => format!("Timeout waiting for {op} response"),
        };
        self.fail(Error::Timeout(message).to_string())
    }

    fn finish(&mut self) -> Vec<Effect> {
        let base = self.geometry().map_or(0, |g| g.base);
        self.state = State::Idle;
        self.session = None;
        info!("Flash complete, starting application at {base:#010x}");
        vec![
            Effect::Notify(Notification::success(
                "Flash complete, target is starting the new firmware",
            )),
            Effect::Notify(Notification::Event(ClientEvent::FlashComplete)),
            Effect::CloseImage,
            Effect::Send(Command::go(base)),
        ]
    }
}

/// Reject geometry the erase and write loops cannot work with.
fn check_geometry(g: &TargetFlashGeometry, image_size: u32) -> Result<(), String> {
    if g.erase_granularity == 0 {
        return Err("Target reported zero erase granularity".into());
    }
    if g.write_granularity == 0
        || g.write_granularity % WRITE_ALIGN != 0
        || g.write_granularity > MAX_WRITE_CHUNK
    {
        return Err(format!(
            "Unsupported write granularity {:#x}",
            g.write_granularity
        ));
    }
    if image_size > g.size {
        return Err(format!(
            "Image of {image_size} bytes does not fit in flash region of {} bytes",
            g.size
        ));
    }
    if g.base.checked_add(image_size).is_none() {
        return Err(format!(
            "Image of {image_size} bytes overflows the address space at {:#010x}",
            g.base
        ));
    }
    Ok(())
}
