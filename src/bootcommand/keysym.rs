//! X11 keysym events for VNC and USB HID style consoles.

use super::{BackendFuture, BootToken, KeyboardBackend, Modifier, SpecialKey};

/// Keysym of a named key.
#[must_use]
pub const fn special_keysym(key: SpecialKey) -> u32 {
    match key {
        SpecialKey::Backspace => 0xff08,
        SpecialKey::Tab => 0xff09,
        SpecialKey::Enter => 0xff0d,
        SpecialKey::Escape => 0xff1b,
        SpecialKey::Delete => 0xffff,
        SpecialKey::Spacebar => 0x0020,
        SpecialKey::Home => 0xff50,
        SpecialKey::Left => 0xff51,
        SpecialKey::Up => 0xff52,
        SpecialKey::Right => 0xff53,
        SpecialKey::Down => 0xff54,
        SpecialKey::PageUp => 0xff55,
        SpecialKey::PageDown => 0xff56,
        SpecialKey::End => 0xff57,
        SpecialKey::Insert => 0xff63,
        SpecialKey::Function(key) => 0xffbd + key.number() as u32,
    }
}

/// Keysym of a modifier key.
#[must_use]
pub const fn modifier_keysym(modifier: Modifier) -> u32 {
    match modifier {
        Modifier::LeftShift => 0xffe1,
        Modifier::RightShift => 0xffe2,
        Modifier::LeftCtrl => 0xffe3,
        Modifier::RightCtrl => 0xffe4,
        Modifier::LeftAlt => 0xffe9,
        Modifier::RightAlt => 0xffea,
        Modifier::LeftSuper => 0xffeb,
        Modifier::RightSuper => 0xffec,
    }
}

/// Keysym of a printable character.
///
/// Latin-1 keysyms equal their code point; every other character maps into
/// the Unicode keysym range at `0x0100_0000`.
#[must_use]
pub const fn char_keysym(c: char) -> u32 {
    let code = c as u32;
    if code <= 0xff { code } else { 0x0100_0000 | code }
}

/// Receives key press and release events.
pub trait KeyEventSink: Send {
    /// Presses (`down`) or releases the key identified by `keysym`.
    fn key_event(&mut self, keysym: u32, down: bool) -> BackendFuture<'_>;
}

/// Translates tokens into keysym events for a [`KeyEventSink`].
#[derive(Debug)]
pub struct KeysymBackend<S> {
    sink: S,
}

impl<S: KeyEventSink> KeysymBackend<S> {
    /// Wraps `sink`.
    #[must_use]
    pub const fn new(sink: S) -> Self {
        Self { sink }
    }

    /// Returns the wrapped sink.
    #[must_use]
    pub fn into_inner(self) -> S {
        self.sink
    }
}

impl<S: KeyEventSink> KeyboardBackend for KeysymBackend<S> {
    fn send<'a>(&'a mut self, token: &'a BootToken) -> BackendFuture<'a> {
        Box::pin(async move {
            match *token {
                BootToken::Wait(_) => Ok(()),
                BootToken::KeyDown(key) => self.sink.key_event(special_keysym(key), true).await,
                BootToken::KeyUp(key) => self.sink.key_event(special_keysym(key), false).await,
                BootToken::ModifierSet(modifier, pressed) => {
                    self.sink
                        .key_event(modifier_keysym(modifier), pressed)
                        .await
                }
                BootToken::Char(c) => {
                    let keysym = char_keysym(c);
                    self.sink.key_event(keysym, true).await?;
                    self.sink.key_event(keysym, false).await
                }
            }
        })
    }
}
