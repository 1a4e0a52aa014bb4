//! Configuration for convey.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.convey/config.toml`
//! - Merging of file values with command-line options into [`Settings`]
//! - Validation of everything a session needs before it starts
//!
//! # Configuration File
//!
//! Every field is optional:
//!
//! ```toml
//! # Seconds to keep retrying the channel on startup
//! poll = 5.0
//! legacy_newline = false
//! verbose = false
//! log_file = "C:/logs/convey.log"
//!
//! [serial]
//! baud_rate = 115200
//! data_bits = 8
//! parity = "none"        # none, odd, even, mark, space
//! stop_bits = "1"        # 1, 1.5, 2
//! flow_control = "none"  # none, software, hardware
//!
//! [escape]
//! enabled = true
//! mode = "auto"          # auto, keys, stream
//! modifiers = "ctrl+alt"    # left Alt only; AltGr never arms
//! prefix = "ctrl+]"
//! confirm = "q"
//! poll_interval_ms = 120
//! ```
//!
//! Command-line options take precedence over the file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::Cli;
use crate::device::{SerialRequest, SerialSettings};
use crate::keys::{self, KeyError, Modifiers};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{}'", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file '{}'", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("empty channel path")]
    MissingTarget,

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid escape {field}")]
    Key {
        field: &'static str,
        #[source]
        source: KeyError,
    },
}

/// Main configuration, as read from the file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds to keep retrying the channel
    pub poll: f64,
    /// Send a trailing CRLF as LF
    pub legacy_newline: bool,
    pub verbose: bool,
    /// Log file location
    pub log_file: Option<PathBuf>,
    /// Serial line settings; present means explicitly configured
    pub serial: Option<SerialSettings>,
    pub escape: EscapeConfig,
}

/// How the escape chord is recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscapeMode {
    /// Keyboard state where the platform offers it, input bytes otherwise
    #[default]
    Auto,
    /// Modifier keys held plus the confirm key
    Keys,
    /// Prefix byte followed by the confirm key in the input stream
    Stream,
}

/// Escape chord configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscapeConfig {
    pub enabled: bool,
    pub mode: EscapeMode,
    /// Held to arm the key-state probe. Alt means the left Alt key.
    pub modifiers: String,
    pub prefix: String,
    pub confirm: String,
    pub poll_interval_ms: u64,
}

impl Default for EscapeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: EscapeMode::Auto,
            modifiers: "ctrl+alt".to_string(),
            prefix: "ctrl+]".to_string(),
            confirm: "q".to_string(),
            poll_interval_ms: 120,
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location if none is given.
    ///
    /// A missing default file is not an error; a missing explicit one is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound && !required => {
                return Ok(Self::default())
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// `~/.convey`
    pub fn config_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".convey"))
    }

    /// Default log file path
    pub fn default_log_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("convey.log"))
    }
}

/// Resolved escape chord
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscapeSettings {
    pub mode: EscapeMode,
    pub modifiers: Modifiers,
    pub prefix: u8,
    pub confirm: char,
    pub interval: Duration,
}

/// Everything a run needs, merged and validated
#[derive(Debug, Clone)]
pub struct Settings {
    pub target: String,
    pub poll: Duration,
    pub legacy_newline: bool,
    pub verbose: bool,
    /// Number of `-v` flags, for log detail
    pub verbosity: u8,
    pub log_file: Option<PathBuf>,
    pub serial: SerialRequest,
    /// `None` when the escape chord is disabled
    pub escape: Option<EscapeSettings>,
}

impl Settings {
    pub fn resolve(cli: &Cli, config: Config) -> Result<Self, ConfigError> {
        let target = cli
            .channel()
            .filter(|path| !path.is_empty())
            .ok_or(ConfigError::MissingTarget)?
            .to_string();

        let poll_secs = cli.poll.unwrap_or(config.poll);
        let poll = Duration::try_from_secs_f64(poll_secs).map_err(|_| ConfigError::Invalid {
            field: "poll",
            reason: format!("{} is not a usable number of seconds", poll_secs),
        })?;

        let explicit = config.serial.is_some() || cli.has_serial_options();
        let mut line = config.serial.unwrap_or_default();
        if let Some(baud) = cli.baud {
            line.baud_rate = baud;
        }
        if let Some(bits) = cli.data_bits {
            line.data_bits = bits;
        }
        if let Some(parity) = cli.parity {
            line.parity = parity;
        }
        if let Some(stop) = cli.stop_bits {
            line.stop_bits = stop;
        }
        if let Some(flow) = cli.flow {
            line.flow_control = flow;
        }
        if line.baud_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "baud rate",
                reason: "must be greater than zero".to_string(),
            });
        }

        let escape = if cli.no_escape || !config.escape.enabled {
            None
        } else {
            Some(resolve_escape(&config.escape)?)
        };

        Ok(Self {
            target,
            poll,
            legacy_newline: cli.legacy_newline || config.legacy_newline,
            verbose: cli.verbose > 0 || config.verbose,
            verbosity: cli.verbose,
            log_file: cli
                .log_file
                .clone()
                .or(config.log_file)
                .or_else(Config::default_log_path),
            serial: SerialRequest {
                settings: line,
                force: cli.serial,
                explicit,
            },
            escape,
        })
    }
}

fn key_error(field: &'static str) -> impl FnOnce(KeyError) -> ConfigError {
    move |source| ConfigError::Key { field, source }
}

fn resolve_escape(config: &EscapeConfig) -> Result<EscapeSettings, ConfigError> {
    let modifiers = keys::parse_modifiers(&config.modifiers).map_err(key_error("modifiers"))?;
    let prefix = keys::parse_prefix(&config.prefix).map_err(key_error("prefix"))?;
    let confirm = keys::parse_confirm(&config.confirm).map_err(key_error("confirm key"))?;

    if !(10..=1000).contains(&config.poll_interval_ms) {
        return Err(ConfigError::Invalid {
            field: "escape poll interval",
            reason: format!("{} ms is outside 10..=1000", config.poll_interval_ms),
        });
    }
    if prefix == confirm as u8 {
        return Err(ConfigError::Invalid {
            field: "escape prefix",
            reason: "must differ from the confirm key".to_string(),
        });
    }

    Ok(EscapeSettings {
        mode: config.mode,
        modifiers,
        prefix,
        confirm,
        interval: Duration::from_millis(config.poll_interval_ms),
    })
}
