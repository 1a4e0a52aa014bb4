//! Byte endpoints
//!
//! An endpoint is one of the three handles a session bridges: standard
//! input, standard output, or the remote channel. Platform code in
//! `crate::device` provides the implementations; the engine only sees this
//! trait.

use std::fmt;
use std::io;

/// What an opened handle turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Console,
    Pipe,
    Socket,
    Serial,
    File,
    Other,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointKind::Console => "console",
            EndpointKind::Pipe => "pipe",
            EndpointKind::Socket => "socket",
            EndpointKind::Serial => "serial line",
            EndpointKind::File => "file",
            EndpointKind::Other => "device",
        };
        f.write_str(name)
    }
}

/// How reads and writes are issued against a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Submitted asynchronously, finished by waiting on a completion signal
    Overlapped,
    /// Issued after a readiness wait, so a read may report zero bytes
    Polled,
    /// Plain synchronous call
    Blocking,
}

/// One side of the bridge.
///
/// `read` and `write` may block until the operation completes. `close`
/// must release any thread blocked in `read` or `write` on the same
/// endpoint and must be safe to call any number of times from any thread;
/// only the first call closes the handle.
pub trait Endpoint: Send + Sync {
    /// Path or stream name used in diagnostics
    fn name(&self) -> &str;

    fn kind(&self) -> EndpointKind;

    fn mode(&self) -> IoMode;

    /// Read into `buf`. `Ok(0)` means nothing was available right now;
    /// a closed peer is reported as an `UnexpectedEof` or `BrokenPipe`
    /// error.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some prefix of `buf`, returning how much was accepted
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Error returned by operations on an endpoint that has been closed
pub fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "endpoint closed")
}
