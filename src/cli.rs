//! Command-line arguments

use std::path::PathBuf;

use clap::Parser;

use crate::device::serial::{DataBits, FlowControl, Parity, StopBits};

#[derive(Parser, Debug, Default)]
#[command(name = "convey")]
#[command(version, about = "Bridge the terminal to a named pipe, socket or serial line")]
#[command(after_help = "Example: convey \\\\.\\pipe\\com_1")]
pub struct Cli {
    /// Channel to connect to (named pipe, COM port, socket, FIFO or tty)
    #[arg(value_name = "TARGET", conflicts_with = "pipe")]
    pub target: Option<String>,

    /// Channel path, as an alternative to the positional TARGET
    #[arg(short = 'n', long = "pipe", value_name = "PATH")]
    pub pipe: Option<String>,

    /// Keep retrying the channel for N seconds on startup
    #[arg(short, long, value_name = "SECONDS")]
    pub poll: Option<f64>,

    /// Send a trailing CRLF from local input as LF
    #[arg(short, long)]
    pub legacy_newline: bool,

    /// Print additional messages (repeat for more log detail)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Serial baud rate
    #[arg(short, long, value_name = "RATE")]
    pub baud: Option<u32>,

    /// Serial data bits (5-8)
    #[arg(long, value_name = "BITS")]
    pub data_bits: Option<DataBits>,

    /// Serial parity: none, odd, even, mark, space
    #[arg(long)]
    pub parity: Option<Parity>,

    /// Serial stop bits: 1, 1.5, 2
    #[arg(long, value_name = "BITS")]
    pub stop_bits: Option<StopBits>,

    /// Serial flow control: none, software, hardware
    #[arg(long)]
    pub flow: Option<FlowControl>,

    /// Configure the channel as a serial line even if it does not look like one
    #[arg(long)]
    pub serial: bool,

    /// Disable the escape chord
    #[arg(long)]
    pub no_escape: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write the log to FILE
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// The channel path from either form
    pub fn channel(&self) -> Option<&str> {
        self.pipe.as_deref().or(self.target.as_deref())
    }

    /// Any serial option given on the command line
    pub fn has_serial_options(&self) -> bool {
        self.baud.is_some()
            || self.data_bits.is_some()
            || self.parity.is_some()
            || self.stop_bits.is_some()
            || self.flow.is_some()
    }
}
