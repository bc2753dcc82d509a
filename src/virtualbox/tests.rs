//! Tests for the VirtualBox builder against scripted `VBoxManage` output.

use std::ffi::OsString;

use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

use super::driver::pick_host_port;
use super::*;
use crate::bootcommand::ScancodeSink;
use crate::build::Build;
use crate::process::{CommandFuture, CommandRunner};
use crate::provision::ProvisionHook;
use crate::test_support::{RecordingUi, ScriptedRunner};

const STOPPED: &str = "name=\"dev\"\nVMState=\"poweroff\"\n";
const RUNNING: &str = "name=\"dev\"\nVMState=\"running\"\n";

#[fixture]
fn config() -> VirtualBoxVmConfig {
    serde_json::from_str(
        r#"{
            "vm_name": "dev",
            "communicator": "none",
            "boot_wait": "0s",
            "target_snapshot": "golden"
        }"#,
    )
    .unwrap_or_else(|err| panic!("config: {err}"))
}

fn commands(runner: &ScriptedRunner) -> Vec<String> {
    runner
        .invocations()
        .iter()
        .map(|invocation| invocation.command_string())
        .collect()
}

fn driver(runner: &ScriptedRunner) -> Arc<VBoxManage> {
    Arc::new(VBoxManage::new(Arc::new(runner.clone())))
}

fn vm_state() -> StateBag {
    let state = StateBag::new();
    state.put(keys::VM_NAME, String::from("dev"));
    state
}

#[rstest]
#[tokio::test]
async fn build_boots_stops_and_snapshots_the_vm(config: VirtualBoxVmConfig) {
    let runner = ScriptedRunner::new();
    runner.push_stdout(STOPPED);
    runner.push_stdout("SnapshotName=\"base\"\nSnapshotUUID=\"1\"\n");
    runner.push_success();
    runner.push_success();
    runner.push_success();
    runner.push_stdout(STOPPED);
    runner.push_success();

    let builder = VirtualBoxVmBuilder::new(config, Arc::new(runner.clone()));
    let mut build = Build::new("vbox", Box::new(builder), ProvisionHook::new(Vec::new()));
    let warnings = build
        .prepare()
        .unwrap_or_else(|err| panic!("prepare: {err}"));
    assert_eq!(warnings.len(), 1, "communicator none should warn: {warnings:?}");

    let artifact = build
        .run(&CancellationToken::new(), RecordingUi::new().shared())
        .await
        .unwrap_or_else(|err| panic!("build: {err}"))
        .unwrap_or_else(|| panic!("expected a snapshot artifact"));

    assert_eq!(artifact.id(), "dev:golden");
    assert_eq!(artifact.builder_id(), BUILDER_TYPE);
    assert_eq!(artifact.state("snapshot"), Some(serde_json::Value::from("golden")));
    artifact
        .destroy()
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));
    assert_eq!(
        commands(&runner),
        [
            "VBoxManage showvminfo dev --machinereadable",
            "VBoxManage snapshot dev list --machinereadable",
            "VBoxManage startvm dev --type headless",
            "VBoxManage controlvm dev poweroff",
            "VBoxManage snapshot dev take golden",
            "VBoxManage showvminfo dev --machinereadable",
            "VBoxManage snapshot dev delete golden",
        ]
    );
}

#[rstest]
#[case::running(&[RUNNING], false, "already running")]
#[case::snapshot_exists(&[STOPPED, "SnapshotName=\"golden\"\n"], false, "force_delete_snapshot")]
#[tokio::test]
async fn prepare_vm_refuses_unsafe_starts(
    #[case] outputs: &[&str],
    #[case] force: bool,
    #[case] needle: &str,
) {
    let runner = ScriptedRunner::new();
    for output in outputs {
        runner.push_stdout(*output);
    }
    let step = StepPrepareVm::new(
        driver(&runner),
        String::from("dev"),
        None,
        Some(String::from("golden")),
        force,
    );

    let state = StateBag::new();
    let err = step
        .prepare(&state)
        .await
        .err()
        .unwrap_or_else(|| panic!("prepare should fail"));

    assert!(err.message.contains(needle), "{err}");
    assert!(!state.contains(keys::VM_NAME));
}

#[tokio::test]
async fn prepare_vm_replaces_and_restores_snapshots() {
    let runner = ScriptedRunner::new();
    runner.push_stdout(STOPPED);
    runner.push_stdout("SnapshotName=\"golden\"\nSnapshotName-1=\"base\"\n");
    runner.push_success();
    runner.push_success();
    let step = StepPrepareVm::new(
        driver(&runner),
        String::from("dev"),
        Some(String::from("base")),
        Some(String::from("golden")),
        true,
    );
    let state = StateBag::new();

    step.prepare(&state)
        .await
        .unwrap_or_else(|err| panic!("prepare: {err}"));

    assert_eq!(state.get_cloned(keys::VM_NAME).as_deref(), Some("dev"));
    let commands = commands(&runner);
    assert_eq!(
        &commands[2..],
        [
            "VBoxManage snapshot dev delete golden",
            "VBoxManage snapshot dev restore base",
        ]
    );
}

#[tokio::test]
async fn unknown_vm_is_reported_by_name() {
    let runner = ScriptedRunner::new();
    runner.push_failure(1);

    let err = driver(&runner).vm_state("ghost").await.err();

    assert_eq!(err, Some(VirtualBoxError::VmNotFound(String::from("ghost"))));
}

#[tokio::test]
async fn vm_without_snapshots_lists_none() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(1), "", "This machine does not have any snapshots\n");

    let snapshots = driver(&runner)
        .snapshots("dev")
        .await
        .unwrap_or_else(|err| panic!("snapshots: {err}"));

    assert!(snapshots.is_empty());
}

#[tokio::test]
async fn keyboard_sends_hex_scancodes() {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let mut keyboard = VBoxKeyboard::new(driver(&runner), String::from("dev"));

    keyboard
        .send_scancodes(&[0x2a, 0x1e, 0xaa, 0x9e])
        .await
        .unwrap_or_else(|err| panic!("send: {err}"));

    assert_eq!(
        commands(&runner),
        ["VBoxManage controlvm dev keyboardputscancode 2a 1e aa 9e"]
    );
}

/// Runner whose commands never finish.
#[derive(Debug)]
struct StalledRunner;

impl CommandRunner for StalledRunner {
    fn run<'a>(&'a self, _program: &'a str, _args: &'a [OsString]) -> CommandFuture<'a> {
        Box::pin(std::future::pending())
    }
}

#[tokio::test(start_paused = true)]
async fn hung_vboxmanage_does_not_block_cancellation() {
    let driver = Arc::new(VBoxManage::new(Arc::new(StalledRunner)));
    let mut step = StepRunVm::new(driver, true);
    let state = vm_state();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.cancel();
    });

    assert_eq!(step.run(&cancel, &state).await, crate::step::Action::Cancel);
    assert!(!state.is_halted());
}

#[tokio::test]
async fn forwarded_port_is_published_and_removed() {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_success();
    let mut step = StepForwardSsh::new(driver(&runner), 47_000, 47_999, 22);
    let state = vm_state();

    let action = step.run(&CancellationToken::new(), &state).await;
    assert_eq!(action, crate::step::Action::Continue);
    let port = state
        .get_cloned(keys::SSH_HOST_PORT)
        .unwrap_or_else(|| panic!("no port published"));
    assert!((47_000..=47_999).contains(&port));
    assert_eq!(state.get_cloned(keys::SSH_HOST).as_deref(), Some("127.0.0.1"));

    step.cleanup(&state).await;
    assert_eq!(
        commands(&runner),
        [
            format!("VBoxManage modifyvm dev --natpf1 kiln-ssh,tcp,127.0.0.1,{port},,22"),
            String::from("VBoxManage modifyvm dev --natpf1 delete kiln-ssh"),
        ]
    );
}

#[rstest]
#[case::first_free(2222, 2230, &[2222], Some(2223))]
#[case::all_taken(2222, 2223, &[2222, 2223], None)]
#[case::single(5000, 5000, &[], Some(5000))]
fn host_port_skips_busy_ports(
    #[case] min: u16,
    #[case] max: u16,
    #[case] busy: &[u16],
    #[case] expected: Option<u16>,
) {
    assert_eq!(pick_host_port(min, max, |port| !busy.contains(&port)), expected);
}

#[tokio::test]
async fn running_vm_is_powered_off_during_cleanup() {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_stdout(RUNNING);
    runner.push_success();
    let mut step = StepRunVm::new(driver(&runner), false);
    let state = vm_state();

    step.run(&CancellationToken::new(), &state).await;
    step.cleanup(&state).await;

    assert_eq!(
        commands(&runner),
        [
            "VBoxManage startvm dev --type gui",
            "VBoxManage showvminfo dev --machinereadable",
            "VBoxManage controlvm dev poweroff",
        ]
    );
}

#[rstest]
#[case::blank_vm(VirtualBoxVmConfig { vm_name: String::from(" "), ..config() }, "vm_name")]
#[case::inverted_ports(
    VirtualBoxVmConfig { ssh_host_port_min: 5000, ssh_host_port_max: 4000, ..config() },
    "ssh_host_port_min"
)]
#[case::same_snapshots(
    VirtualBoxVmConfig { attach_snapshot: Some(String::from("golden")), ..config() },
    "must differ"
)]
fn prepare_rejects_unusable_settings(#[case] config: VirtualBoxVmConfig, #[case] needle: &str) {
    let mut builder = VirtualBoxVmBuilder::new(config, Arc::new(ScriptedRunner::new()));

    let err = builder
        .prepare()
        .err()
        .unwrap_or_else(|| panic!("prepare should fail"));

    assert!(err.to_string().contains(needle), "{err}");
}

#[test]
fn config_defaults_follow_virtualbox_conventions() {
    let config: VirtualBoxVmConfig = serde_json::from_str(r#"{ "vm_name": "dev" }"#)
        .unwrap_or_else(|err| panic!("parse: {err}"));

    assert!(config.headless);
    assert_eq!(config.boot_wait, Duration::from_secs(10));
    assert_eq!((config.ssh_host_port_min, config.ssh_host_port_max), (2222, 4444));
    assert_eq!(config.shutdown_timeout, Duration::from_secs(300));
    assert!(config.forwards_ssh());
}
