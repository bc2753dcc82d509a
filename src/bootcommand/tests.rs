//! Unit tests for boot command lexing, encoding and typing.

use std::time::Duration;

use rstest::rstest;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::template::{RenderError, TemplateVars};
use crate::test_support::{EnvGuard, RecordingScancodeSink};

fn vars() -> TemplateVars {
    TemplateVars::from([
        (String::from("HTTPIP"), String::from("10.0.2.2")),
        (String::from("HTTPPort"), String::from("8080")),
        (String::from("Name"), String::from("debian")),
    ])
}

fn function(number: u8) -> SpecialKey {
    SpecialKey::Function(
        FunctionKey::new(number).unwrap_or_else(|| panic!("no function key F{number}")),
    )
}

fn scancodes(line: &str) -> Vec<u8> {
    let mut backend = ScancodeBackend::new(RecordingScancodeSink::new());
    futures_send(&mut backend, line);
    backend.into_inner().codes()
}

fn futures_send<B: KeyboardBackend>(backend: &mut B, line: &str) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap_or_else(|err| panic!("runtime: {err}"));
    runtime.block_on(async {
        for token in lex(line).iter().filter(|token| !token.is_wait()) {
            backend
                .send(token)
                .await
                .unwrap_or_else(|err| panic!("send failed: {err}"));
        }
        backend
            .flush()
            .await
            .unwrap_or_else(|err| panic!("flush failed: {err}"));
    });
}

#[rstest]
#[case("<wait>", Duration::from_secs(1))]
#[case("<wait5>", Duration::from_secs(5))]
#[case("<wait10>", Duration::from_secs(10))]
#[case("<wait3>", Duration::from_secs(3))]
#[case("<wait1m30s>", Duration::from_secs(90))]
#[case("<wait250ms>", Duration::from_millis(250))]
fn lexes_waits(#[case] line: &str, #[case] expected: Duration) {
    assert_eq!(lex(line), vec![BootToken::Wait(expected)]);
}

#[rstest]
#[case("<enter>", SpecialKey::Enter)]
#[case("<return>", SpecialKey::Enter)]
#[case("<spacebar>", SpecialKey::Spacebar)]
#[case("<f5>", function(5))]
#[case("<pageDown>", SpecialKey::PageDown)]
fn named_keys_press_and_release(#[case] line: &str, #[case] key: SpecialKey) {
    assert_eq!(lex(line), vec![BootToken::KeyDown(key), BootToken::KeyUp(key)]);
}

#[rstest]
#[case("<leftAltOn>", BootToken::ModifierSet(Modifier::LeftAlt, true))]
#[case("<rightCtrlOff>", BootToken::ModifierSet(Modifier::RightCtrl, false))]
#[case("<leftSuperOn>", BootToken::ModifierSet(Modifier::LeftSuper, true))]
#[case("<f12On>", BootToken::KeyDown(function(12)))]
#[case("<enterOff>", BootToken::KeyUp(SpecialKey::Enter))]
fn toggles_emit_single_tokens(#[case] line: &str, #[case] expected: BootToken) {
    assert_eq!(lex(line), vec![expected]);
}

#[test]
fn unknown_sequences_are_typed_literally() {
    let tokens = lex("<f13>");
    let typed: String = tokens
        .iter()
        .filter_map(|token| match token {
            BootToken::Char(c) => Some(*c),
            _ => None,
        })
        .collect();

    assert_eq!(typed, "<f13>");
    assert_eq!(tokens.len(), 5 + 2 * 2);
}

#[rstest]
#[case::zero(0, None)]
#[case::first(1, Some(0x3b))]
#[case::tenth(10, Some(0x44))]
#[case::twelfth(12, Some(0x58))]
#[case::thirteenth(13, None)]
#[case::overflowing(255, None)]
fn function_keys_stay_within_f1_to_f12(#[case] number: u8, #[case] press: Option<u8>) {
    let code = FunctionKey::new(number).map(|key| special_code(SpecialKey::Function(key)).1);
    assert_eq!(code, press);
    assert_eq!(SpecialKey::from_name(&format!("f{number}")).is_some(), press.is_some());
}

#[test]
fn token_counts_follow_characters_shifts_and_named_keys() {
    let line = "Hello <enter>World!<wait><wait5>";
    let tokens = lex(line);

    let chars = "Hello World!".chars().count();
    let shifted = "Hello World!".chars().filter(|c| needs_shift(*c)).count();
    let named = 1;
    let keys = tokens.iter().filter(|token| !token.is_wait()).count();
    let waits = tokens.iter().filter(|token| token.is_wait()).count();

    assert_eq!(keys, chars + 2 * shifted + 2 * named);
    assert_eq!(waits, 2);
}

#[test]
fn shifted_characters_release_after_shift() {
    assert_eq!(
        scancodes("A!"),
        vec![0x2a, 0x1e, 0xaa, 0x9e, 0x2a, 0x02, 0xaa, 0x82]
    );
}

#[rstest]
#[case("a", vec![0x1e, 0x9e])]
#[case(" ", vec![0x39, 0xb9])]
#[case("<up>", vec![0xe0, 0x48, 0xe0, 0xc8])]
#[case("<f1>", vec![0x3b, 0xbb])]
#[case("<f11>", vec![0x57, 0xd7])]
#[case("<del>", vec![0xe0, 0x53, 0xe0, 0xd3])]
#[case("<rightAltOn>", vec![0xe0, 0x38])]
#[case("<leftCtrlOff>", vec![0x9d])]
fn scancode_encoding(#[case] line: &str, #[case] expected: Vec<u8>) {
    assert_eq!(scancodes(line), expected);
}

#[rstest]
#[case('1', Some(0x02))]
#[case('=', Some(0x0d))]
#[case('p', Some(0x19))]
#[case('`', Some(0x29))]
#[case('"', Some(0x28))]
#[case('z', Some(0x2c))]
#[case('/', Some(0x35))]
#[case('é', None)]
fn character_scancodes(#[case] c: char, #[case] expected: Option<u8>) {
    assert_eq!(char_code(c), expected);
}

#[derive(Debug, Default)]
struct RecordingKeys {
    events: Vec<(u32, bool)>,
}

impl KeyEventSink for RecordingKeys {
    fn key_event(&mut self, keysym: u32, down: bool) -> BackendFuture<'_> {
        self.events.push((keysym, down));
        Box::pin(async { Ok(()) })
    }
}

#[rstest]
#[case::ascii('a', 0x61)]
#[case::latin1('é', 0xe9)]
#[case::cyrillic('ж', 0x0100_0436)]
#[case::euro('€', 0x0100_20ac)]
fn characters_beyond_latin1_use_unicode_keysyms(#[case] c: char, #[case] keysym: u32) {
    assert_eq!(char_keysym(c), keysym);
}

/// Key sink that never acknowledges an event.
struct StuckKeys;

impl KeyEventSink for StuckKeys {
    fn key_event(&mut self, _keysym: u32, _down: bool) -> BackendFuture<'_> {
        Box::pin(std::future::pending())
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_a_stuck_key_send() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });
    let mut backend = KeysymBackend::new(StuckKeys);

    let result = BootTyper::default()
        .type_lines(&[String::from("a")], &mut backend, &cancel)
        .await;

    assert_eq!(result.err(), Some(BootCommandError::Cancelled { emitted: 0 }));
}

#[test]
fn keysym_backend_wraps_uppercase_in_shift() {
    let mut backend = KeysymBackend::new(RecordingKeys::default());
    futures_send(&mut backend, "A<f1>");

    assert_eq!(
        backend.into_inner().events,
        vec![
            (0xffe1, true),
            (0x41, true),
            (0x41, false),
            (0xffe1, false),
            (0xffbe, true),
            (0xffbe, false),
        ]
    );
}

#[test]
fn render_substitutes_variables() {
    let lines = render_lines(
        &[
            String::from("url=http://{{ .HTTPIP }}:{{.HTTPPort}}/{{ .Name }}.cfg<enter>"),
            String::from("<wait>"),
        ],
        &vars(),
    )
    .unwrap_or_else(|err| panic!("render failed: {err}"));

    assert_eq!(lines, vec!["url=http://10.0.2.2:8080/debian.cfg<enter>", "<wait>"]);
}

#[rstest]
#[case("{{ .Missing }}", RenderError::UnknownVariable { name: String::from("Missing") })]
#[case("{{ .Name", RenderError::Unterminated)]
fn render_names_the_bad_line(#[case] template: &str, #[case] expected: RenderError) {
    let lines = [String::from("ok"), String::from(template)];

    assert_eq!(
        render_lines(&lines, &vars()),
        Err(BootCommandError::Render { line: 1, source: expected })
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_wait_stops_before_next_key() {
    let sink = RecordingScancodeSink::new();
    let mut backend = ScancodeBackend::new(sink.clone());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let result = BootTyper::default()
        .type_lines(&[String::from("hello<wait5>world")], &mut backend, &cancel)
        .await;

    assert_eq!(result, Err(BootCommandError::Cancelled { emitted: 5 }));
    assert_eq!(sink.batches().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn keys_are_paced_by_the_interval() {
    let sink = RecordingScancodeSink::new();
    let mut backend = ScancodeBackend::new(sink.clone());
    let typer = BootTyper::new(Duration::from_millis(200));
    let started = Instant::now();

    let summary = typer
        .type_lines(
            &[String::from("ab"), String::from("<wait>c")],
            &mut backend,
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("typing failed: {err}"));

    assert_eq!(summary, TypingSummary { keys: 3, waits: 1 });
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1600) && elapsed < Duration::from_millis(1650),
        "elapsed {elapsed:?}"
    );
    assert_eq!(sink.codes(), vec![0x1e, 0x9e, 0x30, 0xb0, 0x2e, 0xae]);
}

#[tokio::test(start_paused = true)]
async fn backend_failure_names_the_token_and_keeps_earlier_keys() {
    let sink = RecordingScancodeSink::new().failing_on(2);
    let mut backend = ScancodeBackend::new(sink.clone());

    let result = BootTyper::default()
        .type_lines(&[String::from("abcd")], &mut backend, &CancellationToken::new())
        .await;

    match result {
        Err(BootCommandError::Backend { index, token, .. }) => {
            assert_eq!(index, 2);
            assert_eq!(token, "'c'");
        }
        other => panic!("expected backend error, got {other:?}"),
    }
    assert_eq!(sink.batches().len(), 2);
}

#[tokio::test]
async fn key_interval_comes_from_the_environment() {
    let _guard = EnvGuard::set_vars(&[(KEY_INTERVAL_ENV, "250ms")]).await;
    assert_eq!(BootTyper::from_env().key_interval(), Duration::from_millis(250));
}

#[tokio::test]
async fn invalid_key_interval_falls_back_to_default() {
    let _guard = EnvGuard::set_vars(&[(KEY_INTERVAL_ENV, "soon")]).await;
    assert_eq!(BootTyper::from_env().key_interval(), DEFAULT_KEY_INTERVAL);
}
