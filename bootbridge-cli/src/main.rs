//! bootbridge CLI - reprogram a microcontroller through its serial bootloader.
//!
//! ## Features
//!
//! - Stage and flash a raw firmware image
//! - Reset the target into its bootloader over DTR/RTS
//! - Compute the image checksum the bootloader verifies
//! - Bridge the terminal to the target's UART between flash sessions
//! - List serial ports
//! - Environment variable and config file support

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use log::debug;
use thiserror::Error;

mod commands;
mod config;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors with a dedicated exit code.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup.
    #[error("{0}")]
    Usage(String),
    /// Invalid configuration.
    #[error("{0}")]
    Config(String),
    /// The serial device could not be used.
    #[error("{0}")]
    Device(String),
    /// Ctrl-C.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Device(_) => 4,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return cli.exit_code();
    }
    match err.downcast_ref::<bootbridge::Error>() {
        Some(bootbridge::Error::Interrupted) => 130,
        Some(bootbridge::Error::Serial(_)) => 4,
        Some(bootbridge::Error::Config(_)) => 3,
        _ => 1,
    }
}

/// bootbridge - flash firmware through a microcontroller's serial bootloader.
///
/// Environment variables:
///   BOOTBRIDGE_PORT   - Default serial port
///   BOOTBRIDGE_BAUD   - Default baud rate (default: 921600)
#[derive(Parser)]
#[command(name = "bootbridge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (auto-detected if only one is present).
    #[arg(short, long, global = true, env = "BOOTBRIDGE_PORT")]
    port: Option<String>,

    /// Baud rate of the bootloader link.
    #[arg(short, long, global = true, env = "BOOTBRIDGE_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Baud rate from the command line, the config file, or the default.
    fn baud(&self, config: &Config) -> u32 {
        self.baud
            .or(config.port.baud)
            .unwrap_or(bootbridge::port::DEFAULT_BAUD)
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Stage a firmware image and flash it to the target.
    Flash {
        /// Raw firmware image.
        image: PathBuf,

        /// Directory the image is staged in.
        #[arg(long, value_name = "DIR")]
        staging_dir: Option<PathBuf>,

        /// Skip the DTR/RTS reset even when the configuration enables it.
        #[arg(long)]
        no_reset: bool,
    },

    /// Reset the target into its bootloader and check that it answers.
    Sync {
        /// Reset the target back into its application afterwards.
        #[arg(long)]
        reboot: bool,
    },

    /// Print the CRC32 the bootloader verifies for an image.
    Crc {
        /// Raw firmware image.
        image: PathBuf,

        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Bridge the terminal to the target's serial output.
    Monitor {
        /// Also append everything the target sends to this file.
        #[arg(long, value_name = "PATH")]
        log: Option<PathBuf>,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code_for(&err)
        },
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "bootbridge v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    bootbridge::set_interrupt_checker(was_interrupted);

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            image,
            staging_dir,
            no_reset,
        } => commands::flash::cmd_flash(&cli, &config, image, staging_dir.as_deref(), *no_reset),
        Commands::Sync { reboot } => commands::flash::cmd_sync(&cli, &config, *reboot),
        Commands::Crc { image, json } => commands::crc::cmd_crc(image, *json),
        Commands::Monitor { log } => {
            commands::monitor::cmd_monitor(&cli, &config, log.as_deref())
        },
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json);
            Ok(())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from(["bootbridge", "flash", "app.bin"]).unwrap();
        match cli.command {
            Commands::Flash {
                image,
                staging_dir,
                no_reset,
            } => {
                assert_eq!(image, PathBuf::from("app.bin"));
                assert!(staging_dir.is_none());
                assert!(!no_reset);
            },
            _ => panic!("Expected Flash command"),
        }
    }

    #[test]
    fn test_cli_parse_flash_with_options() {
        let cli = Cli::try_parse_from([
            "bootbridge",
            "-p",
            "/dev/ttyACM0",
            "-b",
            "115200",
            "flash",
            "app.bin",
            "--staging-dir",
            "/tmp/stage",
            "--no-reset",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cli.baud, Some(115_200));
        match cli.command {
            Commands::Flash {
                staging_dir,
                no_reset,
                ..
            } => {
                assert_eq!(staging_dir, Some(PathBuf::from("/tmp/stage")));
                assert!(no_reset);
            },
            _ => panic!("Expected Flash command"),
        }
    }

    #[test]
    fn test_cli_parse_sync() {
        let cli = Cli::try_parse_from(["bootbridge", "sync", "--reboot"]).unwrap();
        assert!(matches!(cli.command, Commands::Sync { reboot: true }));
    }

    #[test]
    fn test_cli_parse_crc_json() {
        let cli = Cli::try_parse_from(["bootbridge", "crc", "app.bin", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Crc { json: true, .. }));
    }

    #[test]
    fn test_cli_parse_monitor() {
        let cli = Cli::try_parse_from(["bootbridge", "monitor"]).unwrap();
        assert!(matches!(cli.command, Commands::Monitor { log: None }));

        let cli =
            Cli::try_parse_from(["bootbridge", "monitor", "--log", "target.log"]).unwrap();
        match cli.command {
            Commands::Monitor { log } => assert_eq!(log, Some(PathBuf::from("target.log"))),
            _ => panic!("Expected Monitor command"),
        }
    }

    #[test]
    fn test_cli_parse_list_ports() {
        let cli = Cli::try_parse_from(["bootbridge", "list-ports"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: false }));
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["bootbridge"]).is_err());
    }

    #[test]
    fn test_cli_flash_requires_image() {
        assert!(Cli::try_parse_from(["bootbridge", "flash"]).is_err());
    }

    #[test]
    fn test_cli_verbosity_count() {
        let cli = Cli::try_parse_from(["bootbridge", "-vv", "list-ports"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_baud_precedence() {
        let mut config = Config::default();
        let cli = Cli::try_parse_from(["bootbridge", "list-ports"]).unwrap();
        if env::var_os("BOOTBRIDGE_BAUD").is_none() {
            assert_eq!(cli.baud(&config), 921_600);
            config.port.baud = Some(115_200);
            assert_eq!(cli.baud(&config), 115_200);
        }

        let cli = Cli::try_parse_from(["bootbridge", "-b", "460800", "list-ports"]).unwrap();
        assert_eq!(cli.baud(&config), 460_800);
    }

    #[test]
    fn test_exit_codes() {
        let usage: anyhow::Error = CliError::Usage("x".into()).into();
        let config: anyhow::Error = CliError::Config("x".into()).into();
        let device: anyhow::Error = CliError::Device("x".into()).into();
        let cancelled: anyhow::Error = CliError::Cancelled("x".into()).into();
        assert_eq!(exit_code_for(&usage), 2);
        assert_eq!(exit_code_for(&config), 3);
        assert_eq!(exit_code_for(&device), 4);
        assert_eq!(exit_code_for(&cancelled), 130);

        let interrupted: anyhow::Error = bootbridge::Error::Interrupted.into();
        assert_eq!(exit_code_for(&interrupted), 130);
        let failed: anyhow::Error = bootbridge::Error::Failed("boom".into()).into();
        assert_eq!(exit_code_for(&failed), 1);
    }
}
