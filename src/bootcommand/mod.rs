//! Boot command typing engine.
//!
//! A boot command is a list of template strings typed into a machine's
//! console before its network is usable. Each line is rendered, split into
//! [`BootToken`]s by [`lex`], and fed to a [`KeyboardBackend`] one token at a
//! time by [`BootTyper`], which paces the tokens and checks for cancellation
//! between them.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::template::{RenderError, TemplateVars, render};

mod keysym;
mod lexer;
mod scancode;

pub use keysym::{KeyEventSink, KeysymBackend, char_keysym, modifier_keysym, special_keysym};
pub use lexer::{SHIFTED_CHARS, lex, needs_shift};
pub use scancode::{ScancodeBackend, ScancodeSink, char_code, modifier_code, special_code};

/// Environment variable overriding the delay between keystrokes.
pub const KEY_INTERVAL_ENV: &str = "PACKER_KEY_INTERVAL";
/// Delay between keystrokes when [`KEY_INTERVAL_ENV`] is unset.
pub const DEFAULT_KEY_INTERVAL: Duration = Duration::from_millis(100);

/// Named, non-modifier keys.
#[expect(missing_docs, reason = "variants name the key they stand for")]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SpecialKey {
    Backspace,
    Delete,
    Enter,
    Escape,
    Tab,
    Spacebar,
    Function(FunctionKey),
    Insert,
    Home,
    End,
    PageUp,
    PageDown,
    Up,
    Down,
    Left,
    Right,
}

impl SpecialKey {
    /// Looks up the key written as `<name>` in a boot command.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let key = match name {
            "bs" => Self::Backspace,
            "del" => Self::Delete,
            "enter" | "return" => Self::Enter,
            "esc" => Self::Escape,
            "tab" => Self::Tab,
            "spacebar" => Self::Spacebar,
            "insert" => Self::Insert,
            "home" => Self::Home,
            "end" => Self::End,
            "pageUp" => Self::PageUp,
            "pageDown" => Self::PageDown,
            "up" => Self::Up,
            "down" => Self::Down,
            "left" => Self::Left,
            "right" => Self::Right,
            other => Self::Function(FunctionKey::new(other.strip_prefix('f')?.parse().ok()?)?),
        };
        Some(key)
    }
}

/// One of the function keys `F1` to `F12`.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct FunctionKey(u8);

impl FunctionKey {
    /// Returns `F<number>`, or `None` outside `1..=12`.
    #[must_use]
    pub const fn new(number: u8) -> Option<Self> {
        if matches!(number, 1..=12) {
            Some(Self(number))
        } else {
            None
        }
    }

    /// The key's number, between 1 and 12.
    #[must_use]
    pub const fn number(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Modifier keys that can be held across other tokens.
#[expect(missing_docs, reason = "variants name the key they stand for")]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Modifier {
    LeftAlt,
    LeftCtrl,
    LeftShift,
    LeftSuper,
    RightAlt,
    RightCtrl,
    RightShift,
    RightSuper,
}

impl Modifier {
    /// Looks up the modifier written as `<nameOn>` or `<nameOff>`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "leftAlt" => Self::LeftAlt,
            "leftCtrl" => Self::LeftCtrl,
            "leftShift" => Self::LeftShift,
            "leftSuper" => Self::LeftSuper,
            "rightAlt" => Self::RightAlt,
            "rightCtrl" => Self::RightCtrl,
            "rightShift" => Self::RightShift,
            "rightSuper" => Self::RightSuper,
            _ => return None,
        })
    }
}

/// One unit of boot command input.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootToken {
    /// Pause typing.
    Wait(Duration),
    /// Press a named key.
    KeyDown(SpecialKey),
    /// Release a named key.
    KeyUp(SpecialKey),
    /// Press (`true`) or release a modifier.
    ModifierSet(Modifier, bool),
    /// Type a character.
    Char(char),
}

impl BootToken {
    /// Returns `true` for [`BootToken::Wait`].
    #[must_use]
    pub const fn is_wait(&self) -> bool {
        matches!(self, Self::Wait(_))
    }
}

impl fmt::Display for BootToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait(delay) => write!(f, "wait {}", humantime::format_duration(*delay)),
            Self::KeyDown(key) => write!(f, "{key:?} down"),
            Self::KeyUp(key) => write!(f, "{key:?} up"),
            Self::ModifierSet(modifier, true) => write!(f, "{modifier:?} on"),
            Self::ModifierSet(modifier, false) => write!(f, "{modifier:?} off"),
            Self::Char(c) => write!(f, "{c:?}"),
        }
    }
}

/// Failure reported by a keyboard backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
pub struct KeyboardError(pub String);

/// Future returned by keyboard backends.
pub type BackendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), KeyboardError>> + Send + 'a>>;

/// Delivers tokens to a machine's keyboard.
pub trait KeyboardBackend: Send {
    /// Sends one non-wait token.
    fn send<'a>(&'a mut self, token: &'a BootToken) -> BackendFuture<'a>;

    /// Sends anything still buffered. Called after every line.
    fn flush(&mut self) -> BackendFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}

/// Errors raised while rendering or typing a boot command.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BootCommandError {
    /// A line's template expressions could not be rendered.
    #[error("boot command line {line}: {source}")]
    Render {
        /// Zero-based line number.
        line: usize,
        /// Rendering failure.
        #[source]
        source: RenderError,
    },
    /// The backend rejected a key event. Earlier tokens stay typed.
    #[error("sending token {index} ({token}) failed: {source}")]
    Backend {
        /// Zero-based index of the token across the whole command.
        index: usize,
        /// The offending token.
        token: String,
        /// Backend failure.
        #[source]
        source: KeyboardError,
    },
    /// The cancellation token fired between tokens.
    #[error("boot command cancelled after {emitted} key token(s)")]
    Cancelled {
        /// Non-wait tokens delivered before cancellation.
        emitted: usize,
    },
}

/// Renders each boot command line with `vars`.
///
/// # Errors
///
/// Returns [`BootCommandError::Render`] naming the first bad line.
pub fn render_lines(
    lines: &[String],
    vars: &TemplateVars,
) -> Result<Vec<String>, BootCommandError> {
    lines
        .iter()
        .enumerate()
        .map(|(line, text)| {
            render(text, vars).map_err(|source| BootCommandError::Render { line, source })
        })
        .collect()
}

/// Totals reported after a boot command was typed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TypingSummary {
    /// Non-wait tokens delivered.
    pub keys: usize,
    /// Wait tokens honoured.
    pub waits: usize,
}

/// Types tokens into a [`KeyboardBackend`] at a fixed pace.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BootTyper {
    key_interval: Duration,
}

impl Default for BootTyper {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_INTERVAL)
    }
}

impl BootTyper {
    /// Creates a typer that sleeps `key_interval` after each key token.
    #[must_use]
    pub const fn new(key_interval: Duration) -> Self {
        Self { key_interval }
    }

    /// Creates a typer honouring [`KEY_INTERVAL_ENV`].
    ///
    /// An unparsable value is logged and the default is used.
    #[must_use]
    pub fn from_env() -> Self {
        let Some(value) = std::env::var_os(KEY_INTERVAL_ENV) else {
            return Self::default();
        };
        let raw = value.to_string_lossy();
        match humantime::parse_duration(raw.trim()) {
            Ok(interval) => Self::new(interval),
            Err(err) => {
                warn!(value = %raw, error = %err, "ignoring invalid {KEY_INTERVAL_ENV}");
                Self::default()
            }
        }
    }

    /// Returns the delay between key tokens.
    #[must_use]
    pub const fn key_interval(&self) -> Duration {
        self.key_interval
    }

    /// Types already-rendered `lines`.
    ///
    /// # Errors
    ///
    /// Returns [`BootCommandError::Cancelled`] when `cancel` fires and
    /// [`BootCommandError::Backend`] when the backend rejects a token.
    pub async fn type_lines(
        &self,
        lines: &[String],
        backend: &mut dyn KeyboardBackend,
        cancel: &CancellationToken,
    ) -> Result<TypingSummary, BootCommandError> {
        let mut summary = TypingSummary::default();
        let mut index = 0_usize;

        for line in lines {
            for token in lex(line) {
                if cancel.is_cancelled() {
                    return Err(BootCommandError::Cancelled {
                        emitted: summary.keys,
                    });
                }

                let pause = if let BootToken::Wait(delay) = token {
                    debug!(index, delay = %humantime::format_duration(delay), "boot command wait");
                    summary.waits += 1;
                    delay
                } else {
                    let sent = tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(BootCommandError::Cancelled { emitted: summary.keys });
                        }
                        sent = backend.send(&token) => sent,
                    };
                    sent.map_err(|source| BootCommandError::Backend {
                        index,
                        token: token.to_string(),
                        source,
                    })?;
                    summary.keys += 1;
                    self.key_interval
                };
                index += 1;

                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(BootCommandError::Cancelled { emitted: summary.keys });
                    }
                    () = tokio::time::sleep(pause) => {}
                }
            }

            backend
                .flush()
                .await
                .map_err(|source| BootCommandError::Backend {
                    index,
                    token: String::from("flush"),
                    source,
                })?;
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests;
