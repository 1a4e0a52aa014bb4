//! Bridge engine.
//!
//! - **endpoint**: the handle abstraction the engine reads from and writes to
//! - **waiter**: runs one operation and classifies its outcome
//! - **worker**: one read-then-write loop per direction
//! - **control**: escape chord detection
//! - **state**: flags shared by all of the above
//! - **session**: startup, join and teardown
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── inbound Pump   stdin  ──► remote   (CRLF fixup, escape lookahead)
//! ├── outbound Pump  remote ──► stdout
//! ├── Watcher        key probe ──► control phase
//! └── SessionState   error / shutdown-requested / control phase
//! ```

pub mod control;
pub mod endpoint;
pub mod session;
pub mod state;
pub mod waiter;
pub mod worker;

#[cfg(test)]
pub mod memory;
