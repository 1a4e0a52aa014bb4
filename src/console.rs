//! Local terminal handling
//!
//! [`ConsoleGuard`] switches the terminal into raw mode for the length of a
//! session so keystrokes reach the remote side unprocessed. On Windows it
//! also selects UTF-8 codepages and virtual-terminal processing, and the
//! escape chord is sampled from the keyboard with [`AsyncKeyProbe`].

use std::io;
#[cfg(windows)]
use std::sync::Arc;

use crossterm::terminal;
use tracing::{debug, warn};

use crate::core::session::RestoreMode;
#[cfg(windows)]
use crate::core::control::KeyProbe;
use crate::keys::Modifiers;

/// Terminal state captured before a session and put back afterwards
pub struct ConsoleGuard {
    active: bool,
    #[cfg(windows)]
    saved: win::SavedConsole,
}

impl ConsoleGuard {
    /// Enter raw mode, remembering what to restore
    pub fn acquire() -> io::Result<Self> {
        #[cfg(windows)]
        let saved = win::SavedConsole::capture()?;

        terminal::enable_raw_mode()?;

        #[cfg(windows)]
        if let Err(e) = saved.apply_utf8_vt() {
            let _ = terminal::disable_raw_mode();
            saved.restore();
            return Err(e);
        }

        debug!("terminal in raw mode");
        Ok(Self {
            active: true,
            #[cfg(windows)]
            saved,
        })
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        if let Err(e) = terminal::disable_raw_mode() {
            warn!("failed to leave raw mode: {}", e);
        }
        #[cfg(windows)]
        self.saved.restore();
        debug!("terminal restored");
    }
}

impl RestoreMode for ConsoleGuard {
    fn restore(mut self: Box<Self>) {
        self.release();
    }
}

impl Drop for ConsoleGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(windows)]
mod win {
    use std::io;

    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Console::{
        GetConsoleCP, GetConsoleMode, GetConsoleOutputCP, GetStdHandle, SetConsoleCP,
        SetConsoleMode, SetConsoleOutputCP, CONSOLE_MODE, ENABLE_VIRTUAL_TERMINAL_INPUT,
        ENABLE_VIRTUAL_TERMINAL_PROCESSING, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
    };

    const CP_UTF8: u32 = 65001;

    pub struct SavedConsole {
        input: HANDLE,
        output: HANDLE,
        input_cp: u32,
        output_cp: u32,
        input_mode: CONSOLE_MODE,
        output_mode: CONSOLE_MODE,
    }

    // Safety: console handles are process-wide and usable from any thread
    unsafe impl Send for SavedConsole {}

    impl SavedConsole {
        pub fn capture() -> io::Result<Self> {
            unsafe {
                let input = GetStdHandle(STD_INPUT_HANDLE).map_err(io::Error::other)?;
                let output = GetStdHandle(STD_OUTPUT_HANDLE).map_err(io::Error::other)?;
                let mut input_mode = CONSOLE_MODE::default();
                let mut output_mode = CONSOLE_MODE::default();
                GetConsoleMode(input, &mut input_mode).map_err(io::Error::other)?;
                GetConsoleMode(output, &mut output_mode).map_err(io::Error::other)?;
                Ok(Self {
                    input,
                    output,
                    input_cp: GetConsoleCP(),
                    output_cp: GetConsoleOutputCP(),
                    input_mode,
                    output_mode,
                })
            }
        }

        /// UTF-8 both ways and VT sequences on top of the current (raw) modes
        pub fn apply_utf8_vt(&self) -> io::Result<()> {
            unsafe {
                SetConsoleCP(CP_UTF8).map_err(io::Error::other)?;
                SetConsoleOutputCP(CP_UTF8).map_err(io::Error::other)?;

                let mut mode = CONSOLE_MODE::default();
                GetConsoleMode(self.input, &mut mode).map_err(io::Error::other)?;
                SetConsoleMode(self.input, mode | ENABLE_VIRTUAL_TERMINAL_INPUT)
                    .map_err(io::Error::other)?;
                SetConsoleMode(self.output, self.output_mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING)
                    .map_err(io::Error::other)?;
            }
            Ok(())
        }

        pub fn restore(&self) {
            unsafe {
                let _ = SetConsoleCP(self.input_cp);
                let _ = SetConsoleOutputCP(self.output_cp);
                let _ = SetConsoleMode(self.input, self.input_mode);
                let _ = SetConsoleMode(self.output, self.output_mode);
            }
        }
    }
}

/// Modifier keys physically down in one key-state sample
#[cfg_attr(not(windows), allow(dead_code))]
#[derive(Debug, Clone, Copy, Default)]
pub struct HeldModifiers {
    pub ctrl: bool,
    pub shift: bool,
    pub left_alt: bool,
}

/// Whether `held` satisfies the chord-start modifiers.
///
/// Only the left Alt key counts as Alt. Windows reports AltGr as right Alt
/// plus Ctrl, so accepting right Alt would arm control mode whenever an
/// AltGr character (`@`, `{` on many European layouts) is typed.
#[cfg_attr(not(windows), allow(dead_code))]
pub fn chord_start_held(required: Modifiers, held: HeldModifiers) -> bool {
    if required.is_empty() {
        return false;
    }
    (!required.contains(Modifiers::CTRL) || held.ctrl)
        && (!required.contains(Modifiers::SHIFT) || held.shift)
        && (!required.contains(Modifiers::ALT) || held.left_alt)
}

/// Samples the physical keyboard: start while every modifier is held,
/// confirm when the confirm key is down or was pressed since the last poll.
#[cfg(windows)]
pub struct AsyncKeyProbe {
    modifiers: Modifiers,
    confirm: char,
}

#[cfg(windows)]
impl AsyncKeyProbe {
    pub fn new(modifiers: Modifiers, confirm: char) -> Self {
        Self { modifiers, confirm }
    }

    fn key_state(vk: u16) -> u16 {
        use windows::Win32::UI::Input::KeyboardAndMouse::GetAsyncKeyState;
        unsafe { GetAsyncKeyState(i32::from(vk)) as u16 }
    }
}

#[cfg(windows)]
impl KeyProbe for AsyncKeyProbe {
    fn sample(&self) -> crate::core::control::KeySample {
        use windows::Win32::UI::Input::KeyboardAndMouse::{
            VK_CONTROL, VK_LMENU, VK_SHIFT,
        };

        let held = |vk: u16| Self::key_state(vk) & 0x8000 != 0;
        let start = chord_start_held(
            self.modifiers,
            HeldModifiers {
                ctrl: held(VK_CONTROL.0),
                shift: held(VK_SHIFT.0),
                left_alt: held(VK_LMENU.0),
            },
        );

        // Letter and digit virtual-key codes are their uppercase ASCII values
        let confirm_vk = u16::from(self.confirm.to_ascii_uppercase() as u8);
        let confirm = Self::key_state(confirm_vk) & 0x8001 != 0;

        crate::core::control::KeySample { start, confirm }
    }

    fn describe(&self) -> String {
        format!(
            "{}, {}",
            crate::keys::describe_modifiers(self.modifiers),
            self.confirm.to_ascii_uppercase()
        )
    }
}

/// A keyboard-state probe where the platform has one
#[cfg(windows)]
pub fn key_probe(modifiers: Modifiers, confirm: char) -> Option<Arc<dyn KeyProbe>> {
    Some(Arc::new(AsyncKeyProbe::new(modifiers, confirm)))
}

#[cfg(not(windows))]
pub fn key_probe(
    _modifiers: crate::keys::Modifiers,
    _confirm: char,
) -> Option<std::sync::Arc<dyn crate::core::control::KeyProbe>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_altgr_does_not_arm_ctrl_alt() {
        let ctrl_alt = Modifiers::CTRL | Modifiers::ALT;

        // AltGr arrives as Ctrl plus right Alt, which leaves left Alt up
        let altgr = HeldModifiers {
            ctrl: true,
            ..Default::default()
        };
        assert!(!chord_start_held(ctrl_alt, altgr));

        let left = HeldModifiers {
            ctrl: true,
            left_alt: true,
            ..Default::default()
        };
        assert!(chord_start_held(ctrl_alt, left));
    }

    #[test]
    fn test_chord_start_needs_every_modifier() {
        let held = HeldModifiers {
            ctrl: true,
            shift: true,
            ..Default::default()
        };
        assert!(chord_start_held(Modifiers::CTRL | Modifiers::SHIFT, held));
        assert!(!chord_start_held(Modifiers::CTRL | Modifiers::ALT, held));
        assert!(!chord_start_held(Modifiers::empty(), held));
    }
}
