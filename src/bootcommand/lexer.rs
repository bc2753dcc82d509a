//! Converts a rendered boot command line into [`BootToken`]s.

use std::time::Duration;

use super::{BootToken, Modifier, SpecialKey};

/// Characters typed with shift held that are not letters.
pub const SHIFTED_CHARS: &str = "~!@#$%^&*()_+{}|:\"<>?";

/// Returns `true` when typing `c` needs an implicit shift press.
#[must_use]
pub fn needs_shift(c: char) -> bool {
    c.is_uppercase() || SHIFTED_CHARS.contains(c)
}

/// Tokenises `line`, left to right.
///
/// Recognised `<…>` sequences become waits, modifier toggles or named keys.
/// Anything else, including unrecognised `<…>` sequences, is typed as
/// characters, with shifted characters wrapped in a shift press and release.
#[must_use]
pub fn lex(line: &str) -> Vec<BootToken> {
    let mut tokens = Vec::with_capacity(line.len());
    let mut rest = line;

    while !rest.is_empty() {
        if let Some(inner) = rest.strip_prefix('<')
            && let Some((name, after)) = inner.split_once('>')
            && let Some(special) = special_token(name)
        {
            tokens.extend(special);
            rest = after;
            continue;
        }

        let mut chars = rest.chars();
        let Some(c) = chars.next() else { break };
        rest = chars.as_str();
        push_char(&mut tokens, c);
    }

    tokens
}

fn push_char(tokens: &mut Vec<BootToken>, c: char) {
    if needs_shift(c) {
        tokens.push(BootToken::ModifierSet(Modifier::LeftShift, true));
        tokens.push(BootToken::Char(c));
        tokens.push(BootToken::ModifierSet(Modifier::LeftShift, false));
    } else {
        tokens.push(BootToken::Char(c));
    }
}

fn special_token(name: &str) -> Option<Vec<BootToken>> {
    if let Some(delay) = wait_duration(name) {
        return Some(vec![BootToken::Wait(delay)]);
    }
    if let Some(base) = name.strip_suffix("On") {
        return toggle(base, true);
    }
    if let Some(base) = name.strip_suffix("Off") {
        return toggle(base, false);
    }
    SpecialKey::from_name(name)
        .map(|key| vec![BootToken::KeyDown(key), BootToken::KeyUp(key)])
}

fn toggle(base: &str, pressed: bool) -> Option<Vec<BootToken>> {
    if let Some(modifier) = Modifier::from_name(base) {
        return Some(vec![BootToken::ModifierSet(modifier, pressed)]);
    }
    SpecialKey::from_name(base).map(|key| {
        vec![if pressed {
            BootToken::KeyDown(key)
        } else {
            BootToken::KeyUp(key)
        }]
    })
}

/// Parses `wait`, `waitN` (seconds) and `waitDURATION` (`wait1m30s`).
fn wait_duration(name: &str) -> Option<Duration> {
    let suffix = name.strip_prefix("wait")?;
    if suffix.is_empty() {
        return Some(Duration::from_secs(1));
    }
    if suffix.bytes().all(|b| b.is_ascii_digit()) {
        return suffix.parse().ok().map(Duration::from_secs);
    }
    humantime::parse_duration(suffix).ok()
}
