//! Serial monitor command implementation.
//!
//! A transparent bridge between the terminal and the target's UART: target
//! output goes to stdout unchanged, stdin goes to the target. Input is read
//! on a background thread so the bridge keeps polling while the user types.

use std::fs::{File, OpenOptions};
use std::io::{self, Read as _, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use bootbridge::{Engine, LogSink, MemoryStore};
use console::style;
use log::debug;

use super::flash::open_port;
use crate::config::Config;
use crate::{Cli, was_interrupted};

/// Sleep between bridge steps that moved nothing.
const IDLE_TICK: Duration = Duration::from_millis(5);

/// Target output goes to the terminal and, when set, to a log file.
struct Tee<'a> {
    out: io::StdoutLock<'a>,
    log: Option<File>,
}

impl Write for Tee<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write_all(buf)?;
        if let Some(log) = self.log.as_mut() {
            log.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()?;
        if let Some(log) = self.log.as_mut() {
            log.flush()?;
        }
        Ok(())
    }
}

/// Forward stdin in chunks until EOF.
fn spawn_stdin_reader() -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => {
                    debug!("stdin closed: {e}");
                    break;
                },
            }
        }
    });
    rx
}

/// Everything typed since the last step.
fn pending_input(rx: &Receiver<Vec<u8>>, open: &mut bool) -> Vec<u8> {
    let mut input = Vec::new();
    while *open {
        match rx.try_recv() {
            Ok(chunk) => input.extend_from_slice(&chunk),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => *open = false,
        }
    }
    input
}

/// Monitor command implementation.
pub(crate) fn cmd_monitor(cli: &Cli, config: &Config, log_file: Option<&Path>) -> Result<()> {
    let port = open_port(cli, config)?;

    let log = log_file
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))
        })
        .transpose()?;
    if let (Some(path), false) = (log_file, cli.quiet) {
        eprintln!("{} Logging to {}", style("📝").cyan(), path.display());
    }

    let mut engine = Engine::new(port, MemoryStore::new(), LogSink, config.engine_config());
    if !cli.quiet {
        eprintln!("{}", style("Press Ctrl-C to exit").dim());
    }

    let rx = spawn_stdin_reader();
    let mut stdin_open = true;
    let stdout = io::stdout();
    let mut out = Tee {
        out: stdout.lock(),
        log,
    };

    while !was_interrupted() {
        let input = pending_input(&rx, &mut stdin_open);
        let forwarded = engine.bridge(&input, &mut out)?;
        if forwarded == 0 && input.is_empty() {
            thread::sleep(IDLE_TICK);
        }
    }

    out.flush()?;
    if !cli.quiet {
        eprintln!("\n{} Monitor closed", style("✓").green());
    }
    Ok(())
}
