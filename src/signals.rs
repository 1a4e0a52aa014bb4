//! Interrupt handling
//!
//! Termination requests from outside the session (SIGINT, SIGTERM and
//! SIGHUP on Unix; console close and logoff events on Windows) run the
//! same shutdown as the escape chord.

use std::io;
use std::sync::Arc;

use crate::core::session::Session;

#[cfg(unix)]
pub use unix::{install, Interrupts};
#[cfg(windows)]
pub use win::{install, Interrupts};

#[cfg(unix)]
mod unix {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::{self, JoinHandle};

    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::{Handle, Signals};
    use tracing::{debug, info, warn};

    const SIGNALS: [libc::c_int; 3] = [SIGINT, SIGTERM, SIGHUP];

    /// Installed handlers; dropping hands the signals back to their
    /// default action
    pub struct Interrupts {
        handle: Handle,
        listener: Option<JoinHandle<()>>,
        default_action: Arc<AtomicBool>,
    }

    /// Route termination signals to `session.shutdown()` via a listener thread
    pub fn install(session: Arc<Session>) -> io::Result<Interrupts> {
        let default_action = Arc::new(AtomicBool::new(false));
        for signal in SIGNALS {
            signal_hook::flag::register_conditional_default(signal, default_action.clone())?;
        }

        let mut signals = Signals::new(SIGNALS)?;
        let handle = signals.handle();
        let listener = thread::Builder::new()
            .name("convey-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    info!("received signal {}", signal);
                    session.shutdown();
                }
            })?;

        debug!("signal handlers installed");
        Ok(Interrupts {
            handle,
            listener: Some(listener),
            default_action,
        })
    }

    impl Drop for Interrupts {
        fn drop(&mut self) {
            self.default_action.store(true, Ordering::SeqCst);
            self.handle.close();
            if let Some(listener) = self.listener.take() {
                if listener.join().is_err() {
                    warn!("signal listener panicked");
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::memory::MemoryEndpoint;
        use crate::core::session::SessionOptions;
        use std::time::{Duration, Instant};

        #[test]
        fn test_sigterm_shuts_down_session() {
            let remote = Arc::new(MemoryEndpoint::new("remote"));
            let session = Arc::new(Session::new(
                remote.clone(),
                Arc::new(MemoryEndpoint::new("stdin")),
                Arc::new(MemoryEndpoint::new("stdout")),
                SessionOptions::default(),
            ));

            let interrupts = install(session.clone()).unwrap();
            signal_hook::low_level::raise(SIGTERM).unwrap();

            let started = Instant::now();
            while !session.state().is_shutdown_requested() {
                assert!(started.elapsed() < Duration::from_secs(5));
                std::thread::sleep(Duration::from_millis(5));
            }
            assert_eq!(remote.close_count(), 1);

            // Drop returns once the listener has stopped
            let started = Instant::now();
            drop(interrupts);
            assert!(started.elapsed() < Duration::from_secs(5));
        }
    }
}

#[cfg(windows)]
mod win {
    use super::*;
    use std::sync::OnceLock;

    use tracing::{debug, info};
    use windows::Win32::Foundation::{BOOL, FALSE};
    use windows::Win32::System::Console::SetConsoleCtrlHandler;

    /// The console control handler has no context argument
    static SESSION: OnceLock<Arc<Session>> = OnceLock::new();

    unsafe extern "system" fn on_console_event(event: u32) -> BOOL {
        if let Some(session) = SESSION.get() {
            info!("console control event {}", event);
            session.shutdown();
        }
        // Let the default handler terminate the process
        FALSE
    }

    /// Installed handler; dropping removes it
    pub struct Interrupts;

    pub fn install(session: Arc<Session>) -> io::Result<Interrupts> {
        let _ = SESSION.set(session);
        unsafe { SetConsoleCtrlHandler(Some(on_console_event), true) }.map_err(io::Error::other)?;
        debug!("console control handler installed");
        Ok(Interrupts)
    }

    impl Drop for Interrupts {
        fn drop(&mut self) {
            unsafe {
                let _ = SetConsoleCtrlHandler(Some(on_console_event), false);
            }
        }
    }
}
