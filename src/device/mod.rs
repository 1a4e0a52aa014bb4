//! Platform endpoints and channel acquisition
//!
//! - **serial**: line settings for serial channels
//! - **fd** (Unix): descriptor endpoint driven by `poll(2)`
//! - **handle** (Windows): overlapped handle endpoint

pub mod serial;

#[cfg(unix)]
mod fd;
#[cfg(windows)]
mod handle;

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::endpoint::{Endpoint, EndpointKind};
pub use serial::SerialSettings;

#[cfg(unix)]
use fd::{open as open_native, stdio as stdio_native, FdEndpoint as NativeEndpoint};
#[cfg(windows)]
use handle::{open as open_native, stdio as stdio_native, HandleEndpoint as NativeEndpoint};

/// Time between attempts while waiting for the channel to appear
pub const POLL_STEP: Duration = Duration::from_millis(300);

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("'{path}' is unavailable after {:.1} seconds", .waited.as_secs_f64())]
    Unreachable {
        path: String,
        waited: Duration,
        #[source]
        source: io::Error,
    },

    #[error("failed to open '{path}'")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure serial line on '{path}'")]
    Serial {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to acquire standard {stream}")]
    Stdio {
        stream: &'static str,
        #[source]
        source: io::Error,
    },
}

/// How serial settings apply to the channel being opened
#[derive(Debug, Clone, Default)]
pub struct SerialRequest {
    pub settings: SerialSettings,
    /// Configure the line even if the channel does not look like one
    pub force: bool,
    /// Settings were given explicitly rather than defaulted
    pub explicit: bool,
}

/// Local standard input and output
pub struct Stdio {
    pub input: Arc<dyn Endpoint>,
    pub output: Arc<dyn Endpoint>,
}

impl Stdio {
    /// Both ends are attached to a terminal
    pub fn is_interactive(&self) -> bool {
        self.input.kind() == EndpointKind::Console && self.output.kind() == EndpointKind::Console
    }
}

/// Failures worth another attempt while polling: nothing at the path yet,
/// every pipe instance busy, or a socket nobody is accepting on yet.
pub fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionRefused
    )
}

/// Call `attempt` until it succeeds, fails for good, or `timeout` elapses.
///
/// On failure returns the last error and how long was spent.
pub fn poll_open<T, F>(timeout: Duration, step: Duration, mut attempt: F) -> Result<T, (io::Error, Duration)>
where
    F: FnMut() -> io::Result<T>,
{
    let started = Instant::now();
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) && started.elapsed() < timeout => {
                debug!("not ready yet ({}), retrying", e);
                thread::sleep(step);
            }
            Err(e) => return Err((e, started.elapsed())),
        }
    }
}

/// Open the remote channel at `path`, retrying transient failures for up
/// to `poll`, and configure it as a serial line where that applies.
pub fn connect(path: &str, poll: Duration, serial: &SerialRequest) -> Result<Arc<dyn Endpoint>, DeviceError> {
    let endpoint: NativeEndpoint = poll_open(poll, POLL_STEP, || open_native(path)).map_err(
        |(source, waited)| {
            if is_retryable(&source) {
                DeviceError::Unreachable {
                    path: path.to_string(),
                    waited,
                    source,
                }
            } else {
                DeviceError::Open {
                    path: path.to_string(),
                    source,
                }
            }
        },
    )?;

    if endpoint.kind() == EndpointKind::Serial || serial.force {
        endpoint
            .configure_serial(&serial.settings)
            .map_err(|source| DeviceError::Serial {
                path: path.to_string(),
                source,
            })?;
    } else if serial.explicit {
        warn!("'{}' is a {}, serial settings ignored", path, endpoint.kind());
    }

    info!("connected to {} ({})", path, endpoint.kind());
    Ok(Arc::new(endpoint))
}

/// Acquire the local standard streams
pub fn stdio() -> Result<Stdio, DeviceError> {
    let (input, output) = stdio_native().map_err(|source| DeviceError::Stdio {
        stream: "streams",
        source,
    })?;
    Ok(Stdio {
        input: Arc::new(input),
        output: Arc::new(output),
    })
}
