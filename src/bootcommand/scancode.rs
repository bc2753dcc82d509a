//! PC/XT set 1 scancodes, as accepted by `VBoxManage keyboardputscancode`.
//!
//! Releases are the press code plus `0x80`. Extended keys carry an `e0`
//! prefix on both press and release.

use super::lexer::needs_shift;
use super::{BackendFuture, BootToken, KeyboardBackend, Modifier, SpecialKey};

const RELEASE: u8 = 0x80;
const SHIFT_PRESS: u8 = 0x2a;
const EXTENDED: u8 = 0xe0;

const ROWS: [(&str, u8); 9] = [
    ("1234567890-=", 0x02),
    ("!@#$%^&*()_+", 0x02),
    ("qwertyuiop[]", 0x10),
    ("QWERTYUIOP{}", 0x10),
    ("asdfghjkl;'`", 0x1e),
    ("ASDFGHJKL:\"~", 0x1e),
    ("\\zxcvbnm,./", 0x2b),
    ("|ZXCVBNM<>?", 0x2b),
    (" ", 0x39),
];

/// Returns the press scancode of a printable character, if the keyboard
/// layout has one.
#[must_use]
pub fn char_code(c: char) -> Option<u8> {
    ROWS.iter().find_map(|(row, base)| {
        row.chars()
            .position(|candidate| candidate == c)
            .and_then(|offset| u8::try_from(offset).ok())
            .map(|offset| base + offset)
    })
}

/// Press and release codes of a named key.
#[must_use]
pub const fn special_code(key: SpecialKey) -> (bool, u8) {
    match key {
        SpecialKey::Backspace => (false, 0x0e),
        SpecialKey::Delete => (true, 0x53),
        SpecialKey::Enter => (false, 0x1c),
        SpecialKey::Escape => (false, 0x01),
        SpecialKey::Tab => (false, 0x0f),
        SpecialKey::Spacebar => (false, 0x39),
        SpecialKey::Function(key) => match key.number() {
            11 => (false, 0x57),
            12 => (false, 0x58),
            // F1 to F10 are contiguous from 0x3b.
            n => (false, 0x3a + n),
        },
        SpecialKey::Insert => (true, 0x52),
        SpecialKey::Home => (true, 0x47),
        SpecialKey::End => (true, 0x4f),
        SpecialKey::PageUp => (true, 0x49),
        SpecialKey::PageDown => (true, 0x51),
        SpecialKey::Up => (true, 0x48),
        SpecialKey::Down => (true, 0x50),
        SpecialKey::Left => (true, 0x4b),
        SpecialKey::Right => (true, 0x4d),
    }
}

/// Press code of a modifier key.
#[must_use]
pub const fn modifier_code(modifier: Modifier) -> (bool, u8) {
    match modifier {
        Modifier::LeftAlt => (false, 0x38),
        Modifier::LeftCtrl => (false, 0x1d),
        Modifier::LeftShift => (false, SHIFT_PRESS),
        Modifier::LeftSuper => (true, 0x5b),
        Modifier::RightAlt => (true, 0x38),
        Modifier::RightCtrl => (true, 0x1d),
        Modifier::RightShift => (false, 0x36),
        Modifier::RightSuper => (true, 0x5c),
    }
}

fn encode((extended, press): (bool, u8), pressed: bool) -> Vec<u8> {
    let code = if pressed { press } else { press | RELEASE };
    if extended { vec![EXTENDED, code] } else { vec![code] }
}

/// Receives raw scancodes.
pub trait ScancodeSink: Send {
    /// Sends `codes` to the keyboard in order.
    fn send_scancodes<'a>(&'a mut self, codes: &'a [u8]) -> BackendFuture<'a>;
}

/// Translates tokens into scancodes for a [`ScancodeSink`].
///
/// A character typed under an implicit shift is released after the shift,
/// so `A` becomes `2a 1e aa 9e`.
#[derive(Debug)]
pub struct ScancodeBackend<S> {
    sink: S,
    deferred_release: Option<u8>,
}

impl<S: ScancodeSink> ScancodeBackend<S> {
    /// Wraps `sink`.
    #[must_use]
    pub const fn new(sink: S) -> Self {
        Self {
            sink,
            deferred_release: None,
        }
    }

    /// Returns the wrapped sink.
    #[must_use]
    pub fn into_inner(self) -> S {
        self.sink
    }

    /// Scancodes for `token`; the deferred state is updated as a side effect.
    fn codes(&mut self, token: &BootToken) -> Vec<u8> {
        match *token {
            BootToken::Wait(_) => Vec::new(),
            BootToken::KeyDown(key) => encode(special_code(key), true),
            BootToken::KeyUp(key) => encode(special_code(key), false),
            BootToken::ModifierSet(modifier, pressed) => {
                let mut codes = encode(modifier_code(modifier), pressed);
                if modifier == Modifier::LeftShift && !pressed {
                    codes.extend(self.deferred_release.take());
                }
                codes
            }
            BootToken::Char(c) => {
                let Some(code) = char_code(c) else {
                    return Vec::new();
                };
                if needs_shift(c) {
                    self.deferred_release = Some(code | RELEASE);
                    vec![code]
                } else {
                    vec![code, code | RELEASE]
                }
            }
        }
    }
}

impl<S: ScancodeSink> KeyboardBackend for ScancodeBackend<S> {
    fn send<'a>(&'a mut self, token: &'a BootToken) -> BackendFuture<'a> {
        let codes = self.codes(token);
        Box::pin(async move {
            if codes.is_empty() {
                return Ok(());
            }
            self.sink.send_scancodes(&codes).await
        })
    }

    fn flush(&mut self) -> BackendFuture<'_> {
        let pending = self.deferred_release.take();
        Box::pin(async move {
            match pending {
                Some(code) => self.sink.send_scancodes(&[code]).await,
                None => Ok(()),
            }
        })
    }
}
