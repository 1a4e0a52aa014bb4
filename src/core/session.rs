//! Session coordination
//!
//! Owns the three endpoints and the shared flags, runs the two pumps and
//! the escape watcher on their own threads, and tears everything down
//! exactly once no matter who asks first.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use super::control::{ByteProbe, KeyProbe, WatchOutcome, Watcher, DEFAULT_POLL_INTERVAL};
use super::endpoint::Endpoint;
use super::state::{Fault, SessionState};
use super::worker::{PumpExit, Pump};

/// Something the session switched on before it started and must switch
/// back off during teardown (terminal raw mode, console codepages).
pub trait RestoreMode: Send {
    fn restore(self: Box<Self>);
}

/// Session options
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Forward a trailing CRLF from local input as LF
    pub legacy_newline: bool,
    /// Time between escape watcher polls
    pub watch_interval: Duration,
    /// Terminate the process once the escape chord is confirmed
    pub exit_on_escape: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            legacy_newline: false,
            watch_interval: DEFAULT_POLL_INTERVAL,
            exit_on_escape: true,
        }
    }
}

/// How the escape chord is detected
#[derive(Clone)]
pub struct EscapeWatch {
    probe: Arc<dyn KeyProbe>,
    lookahead: Option<Arc<ByteProbe>>,
}

impl EscapeWatch {
    /// Sample key state directly (Windows console)
    pub fn keys(probe: Arc<dyn KeyProbe>) -> Self {
        Self {
            probe,
            lookahead: None,
        }
    }

    /// Detect the chord in the input byte stream
    pub fn stream(probe: Arc<ByteProbe>) -> Self {
        Self {
            probe: probe.clone(),
            lookahead: Some(probe),
        }
    }

    pub fn describe(&self) -> String {
        self.probe.describe()
    }
}

/// What happened during a finished session
#[derive(Debug, Default)]
pub struct SessionReport {
    /// Faults recorded by the pumps, oldest first
    pub faults: Vec<Fault>,
    /// The escape chord ended the session
    pub escaped: bool,
    /// Shutdown was requested (escape, interrupt, or a fault)
    pub shutdown_requested: bool,
}

impl SessionReport {
    /// A fault other than the peer closing its end
    pub fn has_fatal_fault(&self) -> bool {
        self.faults.iter().any(|f| !f.is_end_of_stream())
    }
}

/// A bridge between local stdio and a remote channel
pub struct Session {
    state: Arc<SessionState>,
    remote: Arc<dyn Endpoint>,
    input: Arc<dyn Endpoint>,
    output: Arc<dyn Endpoint>,
    console: Mutex<Option<Box<dyn RestoreMode>>>,
    options: SessionOptions,
}

impl Session {
    pub fn new(
        remote: Arc<dyn Endpoint>,
        input: Arc<dyn Endpoint>,
        output: Arc<dyn Endpoint>,
        options: SessionOptions,
    ) -> Self {
        Self {
            state: Arc::new(SessionState::new()),
            remote,
            input,
            output,
            console: Mutex::new(None),
            options,
        }
    }

    /// Hand over a terminal mode to restore on shutdown
    pub fn with_console(self, console: Option<Box<dyn RestoreMode>>) -> Self {
        *self.console.lock().unwrap_or_else(|e| e.into_inner()) = console;
        self
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Request shutdown, restore the terminal and close every endpoint.
    ///
    /// Idempotent and callable from any thread. Closing an endpoint
    /// releases a pump blocked on it, so this never waits on the pumps.
    pub fn shutdown(&self) {
        if self.state.request_shutdown() {
            info!("shutting down session");
        }

        let console = self
            .console
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(console) = console {
            console.restore();
        }

        for endpoint in [&self.remote, &self.input, &self.output] {
            if !endpoint.is_closed() {
                debug!("closing {} ({})", endpoint.name(), endpoint.kind());
            }
            endpoint.close();
        }
    }

    /// Run both directions until they stop, then tear down.
    pub fn run(self: &Arc<Self>, escape: Option<EscapeWatch>) -> io::Result<SessionReport> {
        info!(
            "bridging {} <-> {} ({:?} / {:?} / {:?})",
            self.remote.name(),
            self.input.name(),
            self.remote.mode(),
            self.input.mode(),
            self.output.mode()
        );

        let lookahead = escape.as_ref().and_then(|e| e.lookahead.clone());
        let inbound = Pump::inbound(self.input.clone(), self.remote.clone(), self.state.clone())
            .with_legacy_newline(self.options.legacy_newline)
            .with_lookahead(lookahead);
        let outbound = Pump::outbound(self.remote.clone(), self.output.clone(), self.state.clone());

        let mut pumps = Vec::with_capacity(2);
        for pump in [inbound, outbound] {
            match self.spawn_pump(pump) {
                Ok(handle) => pumps.push(handle),
                Err(e) => {
                    error!("failed to start worker: {}", e);
                    self.shutdown();
                    join_all(pumps);
                    return Err(e);
                }
            }
        }

        let watcher = match escape {
            Some(escape) => match self.spawn_watcher(escape) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!("failed to start escape watcher: {}", e);
                    self.shutdown();
                    join_all(pumps);
                    return Err(e);
                }
            },
            None => None,
        };

        join_all(pumps);
        self.shutdown();

        let escaped = match watcher.map(JoinHandle::join) {
            Some(Ok(outcome)) => outcome == WatchOutcome::Confirmed,
            Some(Err(_)) => {
                error!("escape watcher panicked");
                false
            }
            None => false,
        };

        Ok(SessionReport {
            faults: self.state.take_faults(),
            escaped,
            shutdown_requested: self.state.is_shutdown_requested(),
        })
    }

    fn spawn_pump(self: &Arc<Self>, pump: Pump) -> io::Result<JoinHandle<()>> {
        let session = Arc::clone(self);
        thread::Builder::new()
            .name(format!("convey-{}", pump.direction()))
            .spawn(move || {
                if pump.run() == PumpExit::Faulted {
                    // Release the other direction from whatever it is waiting on
                    session.shutdown();
                }
            })
    }

    fn spawn_watcher(self: &Arc<Self>, escape: EscapeWatch) -> io::Result<JoinHandle<WatchOutcome>> {
        let session = Arc::clone(self);
        let watcher = Watcher::new(escape.probe, self.state.clone(), self.options.watch_interval);
        thread::Builder::new()
            .name("convey-escape".to_string())
            .spawn(move || {
                let outcome = watcher.run();
                if outcome == WatchOutcome::Confirmed {
                    session.shutdown();
                    if session.options.exit_on_escape {
                        info!("exiting on escape");
                        std::process::exit(0);
                    }
                }
                outcome
            })
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
    }
}
