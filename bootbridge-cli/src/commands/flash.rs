//! Flash and sync command implementations.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bootbridge::{
    DirStore, Engine, ImageStore, MemoryStore, NativePort, Notification, NotificationSink, Phase,
    STAGED_IMAGE, SerialConfig,
};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};

use crate::config::Config;
use crate::{Cli, CliError, serial, use_fancy_output};

/// Sleep between engine polls that found nothing to do.
const POLL_TICK: Duration = Duration::from_millis(1);

/// Renders engine notifications on the terminal.
struct TerminalSink {
    pb: ProgressBar,
    phase: Option<Phase>,
    quiet: bool,
}

impl TerminalSink {
    fn new(pb: ProgressBar, quiet: bool) -> Self {
        Self {
            pb,
            phase: None,
            quiet,
        }
    }
}

impl NotificationSink for TerminalSink {
    fn notify(&mut self, notification: &Notification) {
        match notification {
            Notification::Progress(phase, pct) => {
                if self.phase != Some(*phase) {
                    self.phase = Some(*phase);
                    self.pb.set_message(phase.to_string());
                }
                self.pb.set_position(u64::from(*pct));
            },
            Notification::Log(msg) => {
                if !self.quiet {
                    self.pb
                        .suspend(|| eprintln!("{} {msg}", style("ℹ").blue()));
                }
            },
            Notification::Success(msg) => {
                if !self.quiet {
                    self.pb
                        .suspend(|| eprintln!("{} {msg}", style("✓").green()));
                }
            },
            // Reported once by main when the run fails
            Notification::Error(msg) => debug!("engine error: {msg}"),
            Notification::Event(event) => debug!("event {}", event.as_str()),
        }
    }
}

type CliEngine<S> = Engine<NativePort, S, TerminalSink>;

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

pub(crate) fn open_port(cli: &Cli, config: &Config) -> Result<NativePort> {
    let name = serial::select_port(cli.port.as_deref(), config)?;
    let baud = cli.baud(config);
    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&name).green(),
            baud
        );
    }
    NativePort::open(&SerialConfig::new(&name, baud))
        .map_err(|e| CliError::Device(format!("Failed to open {name}: {e}")).into())
}

/// Poll the engine until it goes idle or waits for a start signal.
fn drive<S: ImageStore>(engine: &mut CliEngine<S>) -> Result<()> {
    match engine.run(POLL_TICK) {
        Ok(()) => Ok(()),
        Err(bootbridge::Error::Interrupted) => {
            Err(CliError::Cancelled("Interrupted by user".to_string()).into())
        },
        Err(e) => Err(e.into()),
    }
}

/// Reset the target into its bootloader and wait for SYNC.
fn sync_target<S: ImageStore>(engine: &mut CliEngine<S>, quiet: bool) -> Result<()> {
    if !quiet {
        eprintln!("{} Waiting for target bootloader...", style("⏳").yellow());
    }
    engine.prepare()?;
    drive(engine)?;
    if !engine.awaiting_start() {
        bail!("Target did not enter its bootloader");
    }
    Ok(())
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    image: &Path,
    staging_dir: Option<&Path>,
    no_reset: bool,
) -> Result<()> {
    let mut file = File::open(image)
        .with_context(|| format!("Failed to open image {}", image.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("Failed to read image {}", image.display()))?
        .len();
    let size = u32::try_from(len).map_err(|_| bootbridge::Error::ImageTooLarge(len))?;
    if !cli.quiet {
        eprintln!(
            "{} Loaded {} ({size} bytes)",
            style("📦").cyan(),
            image.display()
        );
    }

    let control = if no_reset {
        None
    } else {
        config.boot_control()?
    };
    let port = open_port(cli, config)?;

    let staging = staging_dir
        .map(Path::to_path_buf)
        .or_else(|| config.flash.staging_dir.clone())
        .unwrap_or_else(Config::default_staging_dir);
    let pb = progress_bar(cli.quiet);
    let sink = TerminalSink::new(pb.clone(), cli.quiet);
    let mut engine = Engine::new(
        port,
        DirStore::new(&staging),
        sink,
        config.engine_config(),
    );

    let staged = engine
        .stage_image(&mut file)
        .with_context(|| format!("Failed to stage image in {}", staging.display()))?;
    info!("Staged {staged} bytes in {}", staging.display());

    if let Some(control) = control {
        engine = engine.with_boot_control(control);
        sync_target(&mut engine, cli.quiet)?;
        engine.start_flash();
    } else {
        engine.begin(Some(size))?;
    }

    let result = drive(&mut engine);
    pb.finish_and_clear();
    result?;

    if !cli.quiet {
        eprintln!(
            "\n{} Flashed {size} bytes, target is running the new firmware",
            style("🎉").green().bold()
        );
    }
    Ok(())
}

/// Sync command implementation.
pub(crate) fn cmd_sync(cli: &Cli, config: &Config, reboot: bool) -> Result<()> {
    let control = config.boot_control()?;
    if control.is_none() && !cli.quiet {
        eprintln!(
            "{} Reset lines disabled, expecting the target to be in its bootloader already",
            style("ℹ").blue()
        );
    }
    let port = open_port(cli, config)?;

    // SYNC opens the staged image first; an empty one is enough here
    let mut store = MemoryStore::new();
    store.insert(STAGED_IMAGE, Vec::<u8>::new());
    let sink = TerminalSink::new(ProgressBar::hidden(), cli.quiet);
    let mut engine = Engine::new(port, store, sink, config.engine_config());
    if let Some(control) = control {
        engine = engine.with_boot_control(control);
    }

    sync_target(&mut engine, cli.quiet)?;
    if !cli.quiet {
        eprintln!("{} Target is in bootloader mode", style("✓").green().bold());
    }

    if reboot {
        engine.reboot_target()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_sink_tracks_phase() {
        let mut sink = TerminalSink::new(ProgressBar::hidden(), true);
        sink.notify(&Notification::Progress(Phase::Erase, 40));
        assert_eq!(sink.phase, Some(Phase::Erase));
        assert_eq!(sink.pb.position(), 40);

        sink.notify(&Notification::Progress(Phase::Write, 5));
        assert_eq!(sink.phase, Some(Phase::Write));
        assert_eq!(sink.pb.position(), 5);
        assert_eq!(sink.pb.message(), "Writing");
    }

    #[test]
    fn test_terminal_sink_ignores_text_when_quiet() {
        let mut sink = TerminalSink::new(ProgressBar::hidden(), true);
        sink.notify(&Notification::log("Syncing"));
        sink.notify(&Notification::error("boom"));
        assert!(sink.phase.is_none());
    }
}
