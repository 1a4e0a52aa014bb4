//! Key notation for the escape chord
//!
//! Parses the strings used in the config file and on the command line
//! ("ctrl+alt", "ctrl+]", "^]", "q") into modifier sets and control bytes.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid key '{0}'")]
pub struct KeyError(pub String);

/// Parse "ctrl+alt", "Ctrl+Shift" and the like
pub fn parse_modifiers(text: &str) -> Result<Modifiers, KeyError> {
    let mut mods = Modifiers::empty();
    for part in text.split('+').map(str::trim) {
        mods |= match part.to_ascii_lowercase().as_str() {
            "ctrl" | "control" => Modifiers::CTRL,
            "alt" | "menu" => Modifiers::ALT,
            "shift" => Modifiers::SHIFT,
            _ => return Err(KeyError(text.to_string())),
        };
    }
    if mods.is_empty() {
        return Err(KeyError(text.to_string()));
    }
    Ok(mods)
}

/// Resolve a key description to the single byte a terminal sends for it.
///
/// Accepts `ctrl+<key>`, caret notation (`^]`), a hex byte (`0x1d`) or a
/// single ASCII character.
pub fn parse_prefix(text: &str) -> Result<u8, KeyError> {
    let invalid = || KeyError(text.to_string());
    let trimmed = text.trim();

    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u8::from_str_radix(hex, 16).map_err(|_| invalid());
    }

    let lower = trimmed.to_ascii_lowercase();
    let ctrl_key = lower
        .strip_prefix("ctrl+")
        .or_else(|| lower.strip_prefix("control+"))
        .or_else(|| lower.strip_prefix('^'));
    if let Some(key) = ctrl_key {
        let mut chars = key.chars();
        return match (chars.next(), chars.next()) {
            (Some(ch), None) => control_byte(ch).ok_or_else(invalid),
            _ => Err(invalid()),
        };
    }

    let mut chars = trimmed.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) if ch.is_ascii() => Ok(ch as u8),
        _ => Err(invalid()),
    }
}

/// Byte a terminal sends for Ctrl + `ch`
fn control_byte(ch: char) -> Option<u8> {
    if ch.is_ascii_alphabetic() {
        return Some((ch.to_ascii_lowercase() as u8) - b'a' + 1);
    }
    match ch {
        '@' | '`' | ' ' | '2' => Some(0x00),
        '[' | '3' => Some(0x1B),
        '\\' | '4' => Some(0x1C),
        ']' | '5' => Some(0x1D),
        '^' | '~' | '6' => Some(0x1E),
        '_' | '?' | '7' => Some(0x1F),
        _ => None,
    }
}

/// Parse the confirm key: one ASCII letter or digit
pub fn parse_confirm(text: &str) -> Result<char, KeyError> {
    let mut chars = text.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) if ch.is_ascii_alphanumeric() => Ok(ch.to_ascii_lowercase()),
        _ => Err(KeyError(text.to_string())),
    }
}

/// "Ctrl+Alt"
pub fn describe_modifiers(mods: Modifiers) -> String {
    let mut parts = Vec::new();
    if mods.contains(Modifiers::CTRL) {
        parts.push("Ctrl");
    }
    if mods.contains(Modifiers::ALT) {
        parts.push("Alt");
    }
    if mods.contains(Modifiers::SHIFT) {
        parts.push("Shift");
    }
    parts.join("+")
}

/// "Ctrl+]" for 0x1d, the character itself when printable
pub fn describe_byte(byte: u8) -> String {
    match byte {
        0x00 => "Ctrl+@".to_string(),
        0x01..=0x1A => format!("Ctrl+{}", (b'A' + byte - 1) as char),
        0x1B => "Ctrl+[".to_string(),
        0x1C => "Ctrl+\\".to_string(),
        0x1D => "Ctrl+]".to_string(),
        0x1E => "Ctrl+^".to_string(),
        0x1F => "Ctrl+_".to_string(),
        0x20..=0x7E => (byte as char).to_string(),
        _ => format!("0x{:02x}", byte),
    }
}
