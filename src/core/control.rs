//! Control-Mode Watcher
//!
//! Watches for the local escape chord: a start key held (or a prefix byte
//! typed) followed by a confirm key. With a key-state probe the inbound
//! pump drops what it reads while the chord is in progress; with the
//! stream lookahead only the chord bytes are removed. Once confirmed the
//! session is shut down.
//!
//! ```text
//!        start             confirm
//! Idle ────────► Armed ────────────► Confirmed
//!   ▲              │
//!   └──────────────┘
//!    start released
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use super::state::{ControlPhase, SessionState};

/// Default time between key-state samples
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(120);

/// Key state observed in one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeySample {
    /// The chord-start key is held
    pub start: bool,
    /// The confirm key is down, or was pressed since the last sample
    pub confirm: bool,
}

/// Source of key samples for the watcher
pub trait KeyProbe: Send + Sync {
    fn sample(&self) -> KeySample;

    /// Human-readable gesture, e.g. "Ctrl+], q"
    fn describe(&self) -> String;
}

/// The chord state machine, advanced once per poll
#[derive(Debug, Default)]
pub struct ChordMachine {
    phase: ControlPhase,
}

impl ChordMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ControlPhase {
        self.phase
    }

    /// Advance on one sample. A start and confirm seen in the same poll
    /// count as a complete chord.
    pub fn step(&mut self, sample: KeySample) -> ControlPhase {
        self.phase = match self.phase {
            ControlPhase::Idle if sample.start && sample.confirm => ControlPhase::Confirmed,
            ControlPhase::Idle if sample.start => ControlPhase::Armed,
            ControlPhase::Idle => ControlPhase::Idle,
            ControlPhase::Armed if sample.confirm => ControlPhase::Confirmed,
            ControlPhase::Armed if !sample.start => ControlPhase::Idle,
            ControlPhase::Armed => ControlPhase::Armed,
            ControlPhase::Confirmed => ControlPhase::Confirmed,
        };
        self.phase
    }
}

/// Escape detection by looking at the bytes typed on local input.
///
/// The inbound pump runs each chunk through [`ByteProbe::intercept`]; the
/// watcher thread reads the latched keys through [`KeyProbe::sample`].
/// The prefix byte is held back and latches "start"; the byte after it
/// either confirms, releases start, or (another prefix) is sent as one
/// literal prefix byte. Nothing typed after the confirm byte is kept.
#[derive(Debug)]
pub struct ByteProbe {
    prefix: u8,
    confirm: u8,
    /// Last byte seen was the prefix
    pending: AtomicBool,
    start: AtomicBool,
    confirmed: AtomicBool,
    /// Chord completed; never cleared
    finished: AtomicBool,
}

impl ByteProbe {
    pub fn new(prefix: u8, confirm: u8) -> Self {
        Self {
            prefix,
            confirm,
            pending: AtomicBool::new(false),
            start: AtomicBool::new(false),
            confirmed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    /// Remove chord bytes from `chunk` in place. Returns the kept length.
    pub fn intercept(&self, chunk: &mut [u8]) -> usize {
        if self.finished.load(Ordering::SeqCst) {
            return 0;
        }

        let mut kept = 0;
        for i in 0..chunk.len() {
            let byte = chunk[i];
            if self.pending.swap(false, Ordering::SeqCst) {
                if byte == self.confirm || byte == self.confirm.to_ascii_uppercase() {
                    self.finished.store(true, Ordering::SeqCst);
                    self.confirmed.store(true, Ordering::SeqCst);
                    return kept;
                }
                self.start.store(false, Ordering::SeqCst);
                if byte != self.prefix {
                    debug!("escape prefix not confirmed, dropped");
                }
            } else if byte == self.prefix {
                self.pending.store(true, Ordering::SeqCst);
                self.start.store(true, Ordering::SeqCst);
                continue;
            }
            chunk[kept] = byte;
            kept += 1;
        }
        kept
    }
}

impl KeyProbe for ByteProbe {
    fn sample(&self) -> KeySample {
        KeySample {
            start: self.start.load(Ordering::SeqCst),
            confirm: self.confirmed.swap(false, Ordering::SeqCst),
        }
    }

    fn describe(&self) -> String {
        format!("{}, {}", crate::keys::describe_byte(self.prefix), self.confirm as char)
    }
}

/// How the watcher finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The chord was completed
    Confirmed,
    /// The session ended some other way first
    SessionEnded,
}

/// Polls a key probe and publishes the control phase
pub struct Watcher {
    probe: Arc<dyn KeyProbe>,
    state: Arc<SessionState>,
    interval: Duration,
}

impl Watcher {
    pub fn new(probe: Arc<dyn KeyProbe>, state: Arc<SessionState>, interval: Duration) -> Self {
        Self {
            probe,
            state,
            interval,
        }
    }

    pub fn run(&self) -> WatchOutcome {
        let mut machine = ChordMachine::new();
        debug!("escape watcher started ({})", self.probe.describe());

        loop {
            if self.state.is_ending() {
                return WatchOutcome::SessionEnded;
            }

            let before = machine.phase();
            let phase = machine.step(self.probe.sample());
            if phase != before {
                debug!("control mode: {:?} -> {:?}", before, phase);
                self.state.set_control(phase);
            }

            if phase == ControlPhase::Confirmed {
                info!("escape chord confirmed");
                return WatchOutcome::Confirmed;
            }

            thread::sleep(self.interval);
        }
    }
}
