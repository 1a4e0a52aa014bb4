//! convey - bridge the terminal to a named pipe or serial line
//!
//! convey connects its standard input and output to a byte channel such as
//! a Windows named pipe (`\\.\pipe\com_1`, as exposed by virtual machine
//! serial ports), a COM port, a Unix-domain socket, a FIFO or a tty, and
//! forwards bytes both ways until either side goes away or the user types
//! the escape chord.
//!
//! # Quick Start
//!
//! ```text
//! convey \\.\pipe\com_1          # Attach to a VM serial pipe
//! convey -p 30 -v \\.\pipe\com_1 # Wait up to 30 s for the VM to start
//! convey -b 9600 COM3            # Physical serial port
//! convey /tmp/vm.sock            # Unix-domain socket
//! ```
//!
//! # Escape
//!
//! | Platform | Chord |
//! |----------|-------|
//! | Windows console | hold Ctrl+Alt, press Q |
//! | elsewhere | Ctrl+], then q |

mod cli;
mod config;
mod console;
mod core;
mod device;
mod keys;
mod signals;

use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::cli::Cli;
use crate::config::{Config, EscapeMode, EscapeSettings, Settings};
use crate::console::ConsoleGuard;
use crate::core::control::{ByteProbe, DEFAULT_POLL_INTERVAL};
use crate::core::session::{EscapeWatch, RestoreMode, Session, SessionOptions};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version land here too
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("convey: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load(cli.config.as_deref())?;
    let settings = Settings::resolve(&cli, config)?;
    init_logging(&settings);
    info!("convey {} starting", env!("CARGO_PKG_VERSION"));

    if settings.verbose && !settings.poll.is_zero() {
        eprintln!(
            "Polling '{}' for {} seconds",
            settings.target,
            settings.poll.as_secs_f64()
        );
    }
    let started = Instant::now();
    let remote = device::connect(&settings.target, settings.poll, &settings.serial)?;
    if settings.verbose {
        eprintln!(
            "Connection established in {:.1} seconds",
            started.elapsed().as_secs_f64()
        );
    }

    let stdio = device::stdio()?;
    let interactive = stdio.is_interactive();

    // The chord is typed at a keyboard; without one there is nothing to watch
    let escape = match &settings.escape {
        Some(escape) if interactive => Some(escape_watch(escape)),
        _ => None,
    };
    if settings.verbose {
        if let Some(escape) = &escape {
            eprintln!("Press {} to exit", escape.describe());
        }
    }

    let console: Option<Box<dyn RestoreMode>> = if interactive {
        let guard = ConsoleGuard::acquire().context("failed to set up the terminal")?;
        Some(Box::new(guard))
    } else {
        None
    };

    let options = SessionOptions {
        legacy_newline: settings.legacy_newline,
        watch_interval: settings
            .escape
            .as_ref()
            .map_or(DEFAULT_POLL_INTERVAL, |escape| escape.interval),
        exit_on_escape: true,
    };
    let session = Arc::new(
        Session::new(remote, stdio.input, stdio.output, options).with_console(console),
    );

    let _interrupts =
        signals::install(session.clone()).context("failed to install interrupt handlers")?;
    let report = session.run(escape).context("failed to start session")?;

    for fault in &report.faults {
        if !fault.is_end_of_stream() || settings.verbose {
            eprintln!("convey: {}", fault);
        }
    }
    info!(
        "session finished: {} faults, escaped: {}, shutdown requested: {}",
        report.faults.len(),
        report.escaped,
        report.shutdown_requested
    );

    Ok(if report.has_fatal_fault() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Pick how the escape chord is detected
fn escape_watch(escape: &EscapeSettings) -> EscapeWatch {
    let stream = || {
        EscapeWatch::stream(Arc::new(ByteProbe::new(
            escape.prefix,
            escape.confirm as u8,
        )))
    };

    match escape.mode {
        EscapeMode::Stream => stream(),
        EscapeMode::Auto | EscapeMode::Keys => {
            match console::key_probe(escape.modifiers, escape.confirm) {
                Some(probe) => EscapeWatch::keys(probe),
                None => {
                    if escape.mode == EscapeMode::Keys {
                        warn!("keyboard-state escape is unavailable here, using the input stream");
                    }
                    stream()
                }
            }
        }
    }
}

/// Log to a file so nothing interleaves with the bridged stream
fn init_logging(settings: &Settings) {
    let Some(log_path) = &settings.log_file else {
        return;
    };

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .ok();

    if let Some(file) = log_file {
        let level = match settings.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_thread_names(true)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}
