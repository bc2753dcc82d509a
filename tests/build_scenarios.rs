//! End-to-end behaviour of builds assembled from the public step library.

use std::sync::Arc;
use std::time::Duration;

use kiln::bootcommand::{BootTyper, KeyboardBackend, ScancodeBackend};
use kiln::communicator::SharedCommunicator;
use kiln::provision::{HookedProvisioner, ProvisionHook, ShellConfig, ShellProvisioner};
use kiln::readiness::{ConnectError, ReadinessWaiter, WaitConfig};
use kiln::state::keys;
use kiln::steps::{StepProvision, StepTypeBootCommand};
use kiln::test_support::{
    RecordingArtifact, RecordingScancodeSink, RecordingStep, RecordingUi, ScriptedCommunicator,
    ScriptedConnector, StepJournal,
};
use kiln::{Action, Artifact, Build, BuildError, Builder, RunOutcome, StateBag, Step, StepRunner};
use rstest::rstest;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const LIFECYCLE: [&str; 6] = ["create", "start", "wait-ready", "provision", "shutdown", "export"];

/// Builder whose steps only record what happened to them.
struct JournalBuilder {
    journal: StepJournal,
    halt_at: Option<&'static str>,
    cancel_at: Option<(&'static str, CancellationToken)>,
}

impl Builder for JournalBuilder {
    fn builder_type(&self) -> &str {
        "journal"
    }

    fn prepare(&mut self) -> Result<Vec<String>, BuildError> {
        Ok(Vec::new())
    }

    fn steps(&self) -> Vec<Box<dyn Step>> {
        LIFECYCLE
            .iter()
            .map(|name| {
                let mut step = RecordingStep::new(*name, &self.journal);
                if let Some((at, token)) = &self.cancel_at
                    && at == name
                {
                    step = step.cancelling(token.clone());
                }
                let action = if self.halt_at == Some(*name) {
                    Action::Halt
                } else {
                    Action::Continue
                };
                Box::new(step.returning(action)) as Box<dyn Step>
            })
            .collect()
    }

    fn artifact(&self, _state: &StateBag) -> Result<Option<Box<dyn Artifact>>, BuildError> {
        Ok(Some(Box::new(RecordingArtifact::new("journal", "image-1"))))
    }
}

fn journal_build(journal: &StepJournal, halt_at: Option<&'static str>) -> Build {
    let builder = JournalBuilder {
        journal: journal.clone(),
        halt_at,
        cancel_at: None,
    };
    Build::new("scenario", Box::new(builder), ProvisionHook::new(Vec::new()))
}

#[tokio::test]
async fn completed_build_returns_its_artifact_and_unwinds_every_step() {
    let journal = StepJournal::default();

    let artifact = journal_build(&journal, None)
        .run(&CancellationToken::new(), RecordingUi::new().shared())
        .await
        .unwrap_or_else(|err| panic!("build: {err}"))
        .unwrap_or_else(|| panic!("expected an artifact"));

    assert_eq!(artifact.id(), "image-1");
    assert_eq!(journal.runs(), LIFECYCLE);
    assert_eq!(
        journal.cleanups(),
        ["export", "shutdown", "provision", "wait-ready", "start", "create"]
    );
}

#[rstest]
#[case::first("create", &["create"])]
#[case::middle("wait-ready", &["wait-ready", "start", "create"])]
#[case::last("export", &["export", "shutdown", "provision", "wait-ready", "start", "create"])]
#[tokio::test]
async fn halting_step_stops_the_build_and_unwinds_only_started_steps(
    #[case] halt_at: &'static str,
    #[case] cleanups: &[&str],
) {
    let journal = StepJournal::default();

    let result = journal_build(&journal, Some(halt_at))
        .run(&CancellationToken::new(), RecordingUi::new().shared())
        .await;

    assert!(matches!(result, Err(BuildError::Halted(_))), "{result:?}");
    assert_eq!(journal.runs().last().map(String::as_str), Some(halt_at));
    assert_eq!(journal.cleanups(), cleanups);
}

#[tokio::test]
async fn interrupt_during_export_discards_the_artifact() {
    let journal = StepJournal::default();
    let cancel = CancellationToken::new();
    let builder = JournalBuilder {
        journal: journal.clone(),
        halt_at: None,
        cancel_at: Some(("export", cancel.clone())),
    };
    let build = Build::new("scenario", Box::new(builder), ProvisionHook::new(Vec::new()));

    let result = build.run(&cancel, RecordingUi::new().shared()).await;

    assert!(matches!(result, Err(BuildError::Cancelled)), "{result:?}");
    assert_eq!(journal.runs(), LIFECYCLE);
    assert_eq!(
        journal.cleanups(),
        ["export", "shutdown", "provision", "wait-ready", "start", "create"]
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_while_typing_stops_before_the_next_key() {
    let journal = StepJournal::default();
    let sink = RecordingScancodeSink::new();
    let keyboard = sink.clone();
    let boot = StepTypeBootCommand::new(
        vec![String::from("hello<wait5>world")],
        Duration::ZERO,
        Box::new(move |_| {
            Ok(Box::new(ScancodeBackend::new(keyboard.clone())) as Box<dyn KeyboardBackend>)
        }),
    )
    .with_typer(BootTyper::new(Duration::from_millis(100)));
    let mut runner = StepRunner::new(vec![
        Box::new(RecordingStep::new("create", &journal)),
        Box::new(boot),
        Box::new(RecordingStep::new("provision", &journal)),
    ]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });
    let state = StateBag::new();

    let outcome = runner.run(&cancel, &state).await;

    assert_eq!(outcome, RunOutcome::Cancelled);
    assert!(state.is_cancelled());
    assert_eq!(sink.batches().len(), 5, "only 'hello' reaches the keyboard");
    assert_eq!(
        sink.codes(),
        [0x23, 0xa3, 0x12, 0x92, 0x26, 0xa6, 0x26, 0xa6, 0x18, 0x98]
    );
    assert_eq!(journal.runs(), ["create"]);
    assert_eq!(journal.cleanups(), ["create"]);
}

#[tokio::test(start_paused = true)]
async fn readiness_wait_retries_until_the_machine_answers() {
    let connector = ScriptedConnector::new(vec![
        Err(ConnectError::Network(String::from("connection refused"))),
        Err(ConnectError::Network(String::from("connection refused"))),
        Err(ConnectError::Network(String::from("connection refused"))),
        Ok(()),
    ]);
    let waiter = ReadinessWaiter::new(WaitConfig {
        poll_interval: Duration::from_secs(1),
        handshake_limit: 10,
        ..WaitConfig::default()
    });
    let started = Instant::now();

    let result = waiter.wait(&connector, &CancellationToken::new()).await;

    let elapsed = started.elapsed();
    assert!(result.is_ok(), "{:?}", result.err());
    assert_eq!(connector.attempts(), 4);
    assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
    assert!(elapsed <= Duration::from_secs(4), "{elapsed:?}");
}

#[tokio::test]
async fn expected_disconnect_lets_the_build_reach_shutdown() {
    let journal = StepJournal::default();
    let remote = ScriptedCommunicator::new();
    remote.push_disconnect();
    let shell = ShellProvisioner::new(ShellConfig {
        inline: vec![String::from("reboot")],
        expect_disconnect: true,
        ..ShellConfig::default()
    })
    .unwrap_or_else(|err| panic!("shell config: {err}"));
    let state = StateBag::new();
    state.put(
        keys::HOOK,
        ProvisionHook::new(vec![HookedProvisioner::new(Box::new(shell))]),
    );
    let comm: SharedCommunicator = remote.shared();
    state.put(keys::COMMUNICATOR, comm);
    let mut runner = StepRunner::new(vec![
        Box::new(StepProvision),
        Box::new(RecordingStep::new("shutdown", &journal)),
    ]);

    let outcome = runner.run(&CancellationToken::new(), &state).await;

    assert_eq!(outcome, RunOutcome::Completed);
    assert!(!state.is_halted());
    assert_eq!(journal.runs(), ["shutdown"]);
    assert_eq!(remote.commands().len(), 1, "script cleanup is skipped");
}

#[tokio::test]
async fn unexpected_disconnect_halts_before_shutdown() {
    let journal = StepJournal::default();
    let remote = ScriptedCommunicator::new();
    remote.push_disconnect();
    let shell = ShellProvisioner::new(ShellConfig {
        inline: vec![String::from("reboot")],
        ..ShellConfig::default()
    })
    .unwrap_or_else(|err| panic!("shell config: {err}"));
    let state = StateBag::new();
    state.put(
        keys::HOOK,
        ProvisionHook::new(vec![HookedProvisioner::new(Box::new(shell))]),
    );
    state.put(keys::COMMUNICATOR, remote.shared());
    let mut runner = StepRunner::new(vec![
        Box::new(StepProvision),
        Box::new(RecordingStep::new("shutdown", &journal)),
    ]);

    let outcome = runner.run(&CancellationToken::new(), &state).await;

    assert_eq!(outcome, RunOutcome::Halted);
    assert!(journal.runs().is_empty());
    let error = state
        .get_cloned(keys::ERROR)
        .unwrap_or_else(|| panic!("halt without an error"));
    assert_eq!(error.step, "provision");
}

#[tokio::test]
async fn post_processing_keeps_the_artifact_without_processors() {
    let artifact = RecordingArtifact::new("journal", "image-1");
    let handle = artifact.clone();
    let ui = RecordingUi::new();

    let published = kiln::publish(
        &CancellationToken::new(),
        &ui,
        "scenario",
        Box::new(artifact),
        &[],
        false,
    )
    .await
    .unwrap_or_else(|err| panic!("publish: {err}"));

    assert_eq!(published.len(), 1);
    assert_eq!(handle.destroyed(), 0);
}
