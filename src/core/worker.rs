//! Duplex workers
//!
//! Each direction of the bridge runs one `Pump` on its own thread: read a
//! chunk, transform it, write all of it, repeat until a failure or until
//! the session is ending.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::control::ByteProbe;
use super::endpoint::Endpoint;
use super::state::{Fault, FaultClass, SessionState, Stage};
use super::waiter::{self, Failure, Operation};

/// Largest chunk moved per read
pub const CHUNK_SIZE: usize = 4096;

/// Pause after a read that returned nothing
pub const IDLE_DELAY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local input to the remote channel
    Inbound,
    /// Remote channel to local output
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Why a pump returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// A flag was set, or an operation failed during shutdown
    Stopped,
    /// This pump recorded a fault
    Faulted,
}

/// One direction of the byte pipeline
pub struct Pump {
    direction: Direction,
    source: Arc<dyn Endpoint>,
    sink: Arc<dyn Endpoint>,
    state: Arc<SessionState>,
    legacy_newline: bool,
    lookahead: Option<Arc<ByteProbe>>,
}

impl Pump {
    /// Local input to remote
    pub fn inbound(
        input: Arc<dyn Endpoint>,
        remote: Arc<dyn Endpoint>,
        state: Arc<SessionState>,
    ) -> Self {
        Self {
            direction: Direction::Inbound,
            source: input,
            sink: remote,
            state,
            legacy_newline: false,
            lookahead: None,
        }
    }

    /// Remote to local output
    pub fn outbound(
        remote: Arc<dyn Endpoint>,
        output: Arc<dyn Endpoint>,
        state: Arc<SessionState>,
    ) -> Self {
        Self {
            direction: Direction::Outbound,
            source: remote,
            sink: output,
            state,
            legacy_newline: false,
            lookahead: None,
        }
    }

    /// Strip the CR of a trailing CRLF before forwarding (inbound only)
    pub fn with_legacy_newline(mut self, enabled: bool) -> Self {
        self.legacy_newline = enabled && self.direction == Direction::Inbound;
        self
    }

    /// Pass every chunk through the escape lookahead (inbound only)
    pub fn with_lookahead(mut self, probe: Option<Arc<ByteProbe>>) -> Self {
        if self.direction == Direction::Inbound {
            self.lookahead = probe;
        }
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Run until a flag is set or an operation fails
    pub fn run(&self) -> PumpExit {
        let mut buf = vec![0u8; CHUNK_SIZE];
        debug!("{} pump started: {} -> {}", self.direction, self.source.name(), self.sink.name());

        loop {
            if self.state.is_ending() {
                debug!("{} pump stopping", self.direction);
                return PumpExit::Stopped;
            }

            let mut len = match waiter::perform(&*self.source, Operation::Read(&mut buf)) {
                Ok(n) => n,
                Err(failure) => return self.fail(Stage::Read, failure),
            };

            if len == 0 {
                thread::sleep(IDLE_DELAY);
                continue;
            }
            trace!("{} read {} bytes", self.direction, len);

            if self.direction == Direction::Inbound {
                // The lookahead strips chord bytes as it sees them; the
                // published phase lags it by up to one watcher poll
                if let Some(probe) = &self.lookahead {
                    len = probe.intercept(&mut buf[..len]);
                } else if self.state.control().is_engaged() {
                    debug!("control mode engaged, discarding {} bytes", len);
                    continue;
                }
                if self.legacy_newline {
                    len = strip_trailing_cr(&mut buf[..len]);
                }
                if len == 0 {
                    continue;
                }
            }

            if let ControlFlow::Break(exit) = self.forward(&buf[..len]) {
                return exit;
            }
        }
    }

    /// Write the whole chunk, one accepted prefix at a time
    fn forward(&self, mut chunk: &[u8]) -> ControlFlow<PumpExit> {
        while !chunk.is_empty() {
            match waiter::perform(&*self.sink, Operation::Write(chunk)) {
                Ok(0) => {
                    if self.state.is_ending() {
                        return ControlFlow::Break(PumpExit::Stopped);
                    }
                    thread::sleep(IDLE_DELAY);
                }
                Ok(n) => chunk = &chunk[n..],
                Err(failure) => return ControlFlow::Break(self.fail(Stage::Write, failure)),
            }
        }
        ControlFlow::Continue(())
    }

    fn fail(&self, stage: Stage, failure: Failure) -> PumpExit {
        // Teardown closes our handles; the resulting failures are expected
        if self.state.is_shutdown_requested() {
            debug!("{} pump: {} ended by shutdown ({})", self.direction, stage, failure);
            return PumpExit::Stopped;
        }

        let endpoint = match stage {
            Stage::Read => &self.source,
            Stage::Write => &self.sink,
        };
        let class = match (self.direction, stage) {
            (Direction::Inbound, Stage::Read) | (Direction::Outbound, Stage::Write) => {
                FaultClass::LocalIo
            }
            _ => FaultClass::Connection,
        };

        let fault = Fault {
            class,
            stage,
            endpoint: endpoint.name().to_string(),
            failure,
        };
        if fault.is_end_of_stream() {
            debug!("{} pump: {}", self.direction, fault);
        } else {
            warn!("{} pump: {}", self.direction, fault);
        }
        self.state.raise(fault);
        PumpExit::Faulted
    }
}

/// Turn a trailing CR LF into a bare LF. Returns the new length.
pub fn strip_trailing_cr(chunk: &mut [u8]) -> usize {
    let len = chunk.len();
    if len >= 2 && chunk[len - 2] == b'\r' && chunk[len - 1] == b'\n' {
        chunk[len - 2] = b'\n';
        return len - 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::MemoryEndpoint;
    use std::io;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    fn endpoints() -> (Arc<MemoryEndpoint>, Arc<MemoryEndpoint>, Arc<SessionState>) {
        (
            Arc::new(MemoryEndpoint::new("local")),
            Arc::new(MemoryEndpoint::new("remote")),
            Arc::new(SessionState::new()),
        )
    }

    #[test]
    fn test_strip_trailing_cr() {
        let mut chunk = *b"hello\r\n";
        let len = strip_trailing_cr(&mut chunk);
        assert_eq!(&chunk[..len], b"hello\n");

        let mut chunk = *b"hello\n";
        assert_eq!(strip_trailing_cr(&mut chunk), 6);

        let mut chunk = *b"a\r\nb";
        assert_eq!(strip_trailing_cr(&mut chunk), 4);

        let mut chunk = *b"\r\n";
        let len = strip_trailing_cr(&mut chunk);
        assert_eq!(&chunk[..len], b"\n");

        let mut chunk = *b"\n";
        assert_eq!(strip_trailing_cr(&mut chunk), 1);
    }

    #[test]
    fn test_inbound_forwards_in_order() {
        let (local, remote, state) = endpoints();
        local.push(b"first ");
        local.push_empty();
        local.push(b"second\r\n");
        local.push_eof();

        let pump = Pump::inbound(local.clone(), remote.clone(), state.clone());
        assert_eq!(pump.run(), PumpExit::Faulted);

        // Without legacy mode CRLF passes through untouched
        assert_eq!(remote.written(), b"first second\r\n");

        let faults = state.take_faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].class, FaultClass::LocalIo);
        assert!(faults[0].is_end_of_stream());
    }

    #[test]
    fn test_inbound_legacy_newline() {
        let (local, remote, state) = endpoints();
        local.push(b"hello\r\n");
        local.push_eof();

        let pump = Pump::inbound(local.clone(), remote.clone(), state).with_legacy_newline(true);
        pump.run();

        assert_eq!(remote.written(), b"hello\n");
        assert_eq!(remote.written().len(), 6);
    }

    #[test]
    fn test_outbound_is_verbatim() {
        let (local, remote, state) = endpoints();
        let payload: Vec<u8> = (0..=255u8).cycle().take(CHUNK_SIZE * 2 + 17).collect();
        remote.push(&payload);
        remote.push(b"line\r\n");
        remote.push_eof();

        // Legacy mode never applies in this direction
        let pump = Pump::outbound(remote.clone(), local.clone(), state.clone()).with_legacy_newline(true);
        assert_eq!(pump.run(), PumpExit::Faulted);

        let mut expected = payload.clone();
        expected.extend_from_slice(b"line\r\n");
        assert_eq!(local.written(), expected);

        let faults = state.take_faults();
        assert_eq!(faults[0].class, FaultClass::Connection);
        assert_eq!(faults[0].stage, Stage::Read);
    }

    #[test]
    fn test_partial_writes_are_completed() {
        let (local, remote, state) = endpoints();
        remote.limit_writes(3);
        local.push(b"abcdefghij");
        local.push_eof();

        Pump::inbound(local.clone(), remote.clone(), state).run();
        assert_eq!(remote.written(), b"abcdefghij");
    }

    #[test]
    fn test_write_failure_is_connection_fault() {
        let (local, remote, state) = endpoints();
        remote.fail_writes(io::ErrorKind::PermissionDenied);
        local.push(b"data");

        let pump = Pump::inbound(local.clone(), remote.clone(), state.clone());
        assert_eq!(pump.run(), PumpExit::Faulted);

        assert!(state.has_failed());
        let faults = state.take_faults();
        assert_eq!(faults[0].class, FaultClass::Connection);
        assert_eq!(faults[0].stage, Stage::Write);
        assert!(!faults[0].is_end_of_stream());
        assert_eq!(faults[0].endpoint, "remote");
    }

    #[test]
    fn test_input_read_failure_is_local_fault() {
        let (local, remote, state) = endpoints();
        local.push(b"ok");
        local.push_failure(io::ErrorKind::PermissionDenied);

        let pump = Pump::inbound(local.clone(), remote.clone(), state.clone());
        assert_eq!(pump.run(), PumpExit::Faulted);
        assert_eq!(remote.written(), b"ok");

        let faults = state.take_faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].class, FaultClass::LocalIo);
        assert_eq!(faults[0].stage, Stage::Read);
        assert_eq!(faults[0].endpoint, "local");
        assert!(!faults[0].is_end_of_stream());
    }

    #[test]
    fn test_stops_when_flag_already_set() {
        let (local, remote, state) = endpoints();
        local.push(b"never read");
        state.request_shutdown();

        let pump = Pump::inbound(local.clone(), remote.clone(), state);
        assert_eq!(pump.run(), PumpExit::Stopped);
        assert_eq!(local.reads(), 0);
        assert!(remote.written().is_empty());
    }

    #[test]
    fn test_error_elsewhere_stops_after_current_chunk() {
        let (local, remote, state) = endpoints();
        let pump = Arc::new(Pump::inbound(local.clone(), remote.clone(), state.clone()));
        let handle = {
            let pump = pump.clone();
            thread::spawn(move || pump.run())
        };

        local.push(b"one");
        assert_eq!(remote.wait_written(3, WAIT), b"one");
        thread::sleep(Duration::from_millis(50));

        // The other direction fails; this pump sees it on its next check
        state.raise(Fault {
            class: FaultClass::Connection,
            stage: Stage::Read,
            endpoint: "remote".to_string(),
            failure: Failure::EndOfStream,
        });
        local.push(b"two");
        local.push(b"three");

        assert_eq!(handle.join().unwrap(), PumpExit::Stopped);
        // At most the chunk already pending when the flag went up gets through
        let written = remote.written();
        assert!(written == b"onetwo" || written == b"one", "{:?}", written);
    }

    #[test]
    fn test_close_releases_blocked_read_quietly() {
        let (local, remote, state) = endpoints();
        let pump = Pump::outbound(remote.clone(), local.clone(), state.clone());
        let handle = thread::spawn(move || pump.run());

        // Let the pump block on the empty remote
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        state.request_shutdown();
        remote.close();

        assert_eq!(handle.join().unwrap(), PumpExit::Stopped);
        assert!(started.elapsed() < WAIT);
        assert!(!state.has_failed());
        assert!(state.take_faults().is_empty());
    }

    #[test]
    fn test_engaged_control_mode_discards_input() {
        use crate::core::state::ControlPhase;

        let (local, remote, state) = endpoints();
        state.set_control(ControlPhase::Armed);
        local.push(b"secret");
        local.push_eof();

        Pump::inbound(local.clone(), remote.clone(), state).run();
        assert!(remote.written().is_empty());
    }

    #[test]
    fn test_lookahead_decides_while_phase_lags() {
        use crate::core::state::ControlPhase;

        let (local, remote, state) = endpoints();
        // Watcher has not caught up with the released prefix yet
        state.set_control(ControlPhase::Armed);
        local.push(b"\x1d");
        local.push(b"x");
        local.push(b"\x1d");
        local.push(b"\x1d");
        local.push(b"y");
        local.push_eof();

        let probe = Arc::new(ByteProbe::new(0x1d, b'q'));
        Pump::inbound(local.clone(), remote.clone(), state)
            .with_lookahead(Some(probe))
            .run();
        assert_eq!(remote.written(), b"x\x1dy");
    }

    #[test]
    fn test_lookahead_drops_input_after_confirm() {
        let (local, remote, state) = endpoints();
        local.push(b"ok\x1dqtrailing");
        local.push(b"more");
        local.push_eof();

        let probe = Arc::new(ByteProbe::new(0x1d, b'q'));
        Pump::inbound(local.clone(), remote.clone(), state)
            .with_lookahead(Some(probe))
            .run();
        assert_eq!(remote.written(), b"ok");
    }
}
