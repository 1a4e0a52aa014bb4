//! Shared session state
//!
//! The two set-once flags every worker checks on each loop iteration, the
//! control-mode phase written by the escape watcher, and the log of faults
//! the workers recorded before they stopped.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use super::waiter::Failure;

/// Control-mode phase of the escape chord
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ControlPhase {
    /// Keystrokes are forwarded
    #[default]
    Idle = 0,
    /// Chord start seen, waiting for the confirm key
    Armed = 1,
    /// Termination requested
    Confirmed = 2,
}

impl ControlPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ControlPhase::Armed,
            2 => ControlPhase::Confirmed,
            _ => ControlPhase::Idle,
        }
    }

    /// Whether captured keystrokes must be held back from the remote side
    pub fn is_engaged(self) -> bool {
        !matches!(self, ControlPhase::Idle)
    }
}

/// Which side of the bridge a fault happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// The remote channel failed or was closed
    Connection,
    /// Standard input or output failed
    LocalIo,
}

/// The half of a read-then-write pair that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Read,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Read => write!(f, "read from"),
            Stage::Write => write!(f, "write to"),
        }
    }
}

/// A fault recorded by a duplex worker
#[derive(Debug, Error)]
#[error("{stage} {endpoint} failed: {failure}")]
pub struct Fault {
    pub class: FaultClass,
    pub stage: Stage,
    pub endpoint: String,
    #[source]
    pub failure: Failure,
}

impl Fault {
    /// The peer closed its end; the usual way a session finishes
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.failure, Failure::EndOfStream)
    }
}

/// Flags and fault log shared by the coordinator and its workers
#[derive(Debug, Default)]
pub struct SessionState {
    error: AtomicBool,
    shutdown: AtomicBool,
    control: AtomicU8,
    faults: Mutex<Vec<Fault>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fault and set the error flag.
    ///
    /// Returns true for the first fault of the session.
    pub fn raise(&self, fault: Fault) -> bool {
        let first = !self.error.swap(true, Ordering::SeqCst);
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(fault);
        first
    }

    /// Set the shutdown flag. Returns true if this call set it.
    pub fn request_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::SeqCst)
    }

    pub fn has_failed(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Either flag is set; workers stop at their next check
    pub fn is_ending(&self) -> bool {
        self.has_failed() || self.is_shutdown_requested()
    }

    pub fn control(&self) -> ControlPhase {
        ControlPhase::from_u8(self.control.load(Ordering::SeqCst))
    }

    pub fn set_control(&self, phase: ControlPhase) {
        self.control.store(phase as u8, Ordering::SeqCst);
    }

    /// Drain the recorded faults, oldest first
    pub fn take_faults(&self) -> Vec<Fault> {
        std::mem::take(
            &mut *self
                .faults
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn fault(failure: Failure) -> Fault {
        Fault {
            class: FaultClass::Connection,
            stage: Stage::Read,
            endpoint: "remote".to_string(),
            failure,
        }
    }

    #[test]
    fn test_flags_are_set_once() {
        let state = SessionState::new();
        assert!(!state.is_ending());

        assert!(state.request_shutdown());
        assert!(!state.request_shutdown());
        assert!(state.is_shutdown_requested());
        assert!(state.is_ending());
        assert!(!state.has_failed());
    }

    #[test]
    fn test_first_fault_wins() {
        let state = SessionState::new();
        assert!(state.raise(fault(Failure::EndOfStream)));
        assert!(!state.raise(fault(Failure::Io(io::Error::other("boom")))));
        assert!(state.has_failed());

        let faults = state.take_faults();
        assert_eq!(faults.len(), 2);
        assert!(faults[0].is_end_of_stream());
        assert!(!faults[1].is_end_of_stream());

        // Draining does not clear the flag
        assert!(state.take_faults().is_empty());
        assert!(state.has_failed());
    }

    #[test]
    fn test_control_phase_round_trip() {
        let state = SessionState::new();
        assert_eq!(state.control(), ControlPhase::Idle);
        assert!(!state.control().is_engaged());

        state.set_control(ControlPhase::Armed);
        assert!(state.control().is_engaged());
        state.set_control(ControlPhase::Confirmed);
        assert_eq!(state.control(), ControlPhase::Confirmed);
    }

    #[test]
    fn test_fault_message() {
        let f = fault(Failure::Io(io::Error::other("access denied")));
        assert_eq!(f.to_string(), "read from remote failed: access denied");
    }
}
