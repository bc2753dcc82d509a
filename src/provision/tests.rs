//! Unit tests for the provision hook and the shell provisioner.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rstest::{fixture, rstest};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::communicator::FileMode;
use crate::test_support::{RecordingUi, ScriptedCommunicator};

#[fixture]
fn data() -> ProvisionData {
    ProvisionData {
        build_name: String::from("vmware"),
        builder_type: String::from("iso"),
        http_ip: None,
        http_port: None,
    }
}

fn inline(lines: &[&str]) -> ShellConfig {
    ShellConfig {
        inline: lines.iter().map(|line| (*line).to_owned()).collect(),
        remote_path: Some(String::from("/tmp/script.sh")),
        ..ShellConfig::default()
    }
}

fn shell(config: ShellConfig) -> ShellProvisioner {
    ShellProvisioner::new(config).unwrap_or_else(|err| panic!("config rejected: {err}"))
}

fn hook_with(config: ShellConfig) -> ProvisionHook {
    ProvisionHook::new(vec![HookedProvisioner::new(Box::new(shell(config)))])
}

#[rstest]
#[case(&[], &[], "PACKER_BUILDER_TYPE='iso' PACKER_BUILD_NAME='vmware'")]
#[case(
    &["FOO=bar"],
    &[("BAR", "foo")],
    "BAR='foo' FOO='bar' PACKER_BUILDER_TYPE='iso' PACKER_BUILD_NAME='vmware'"
)]
#[case(
    &["FOO=bar's"],
    &[("BAR", "foo's")],
    "BAR='foo'\"'\"'s' FOO='bar'\"'\"'s' PACKER_BUILDER_TYPE='iso' PACKER_BUILD_NAME='vmware'"
)]
#[case(
    &["FOO=bar", "BAZ=qux"],
    &[("BAR", "foo"), ("YAR", "yaa")],
    "BAR='foo' BAZ='qux' FOO='bar' PACKER_BUILDER_TYPE='iso' PACKER_BUILD_NAME='vmware' YAR='yaa'"
)]
#[case(
    &["FOO=bar=baz"],
    &[("BAR", "foo=yar")],
    "BAR='foo=yar' FOO='bar=baz' PACKER_BUILDER_TYPE='iso' PACKER_BUILD_NAME='vmware'"
)]
#[case(
    &["FOO==bar"],
    &[("BAR", "=foo")],
    "BAR='=foo' FOO='=bar' PACKER_BUILDER_TYPE='iso' PACKER_BUILD_NAME='vmware'"
)]
fn flattens_environment(
    data: ProvisionData,
    #[case] vars: &[&str],
    #[case] map: &[(&str, &str)],
    #[case] expected: &str,
) {
    let config = ShellConfig {
        environment_vars: vars.iter().map(|entry| (*entry).to_owned()).collect(),
        env: map
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect::<BTreeMap<_, _>>(),
        ..inline(&["true"])
    };

    assert_eq!(shell(config).flattened_env(&data.environment()), expected);
}

#[test]
fn build_facts_include_http_address_when_known() {
    let facts = ProvisionData {
        http_ip: Some(String::from("10.0.2.2")),
        http_port: Some(8080),
        ..data()
    };

    let env = facts.environment();
    assert!(env.contains(&(String::from("PACKER_HTTP_ADDR"), String::from("10.0.2.2:8080"))));
    assert!(env.contains(&(String::from("PACKER_HTTP_PORT"), String::from("8080"))));
}

#[rstest]
#[case(ShellConfig::default(), "must be set")]
#[case(
    ShellConfig { script: Some("a.sh".into()), ..inline(&["true"]) },
    "only one of"
)]
#[case(
    ShellConfig { environment_vars: vec![String::from("NOEQUALS")], ..inline(&["true"]) },
    "KEY=value"
)]
#[case(
    ShellConfig { environment_vars: vec![String::from("=value")], ..inline(&["true"]) },
    "empty name"
)]
#[case(
    ShellConfig { valid_exit_codes: Vec::new(), ..inline(&["true"]) },
    "valid_exit_codes"
)]
fn rejects_invalid_configuration(#[case] config: ShellConfig, #[case] fragment: &str) {
    match ShellProvisioner::new(config) {
        Err(err @ ProvisionError::Config { .. }) => {
            assert!(err.to_string().contains(fragment), "unexpected message: {err}");
        }
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn remote_path_defaults_to_random_script_in_folder() {
    let provisioner = shell(ShellConfig {
        inline: vec![String::from("true")],
        remote_folder: String::from("/var/tmp/"),
        ..ShellConfig::default()
    });

    let path = provisioner.remote_path();
    assert!(path.starts_with("/var/tmp/script_"), "path was {path}");
    assert!(path.ends_with(".sh"));
}

#[test]
fn config_parses_durations_and_defaults() {
    let config: ShellConfig = serde_json::from_str(
        r#"{"inline": ["echo hi"], "start_retry_timeout": "30s", "expect_disconnect": true}"#,
    )
    .unwrap_or_else(|err| panic!("parse failed: {err}"));

    assert_eq!(config.start_retry_timeout, Duration::from_secs(30));
    assert!(config.expect_disconnect);
    assert_eq!(config.valid_exit_codes, vec![0]);
    assert_eq!(config.remote_folder, "/tmp");
}

#[rstest]
#[tokio::test]
async fn inline_script_is_uploaded_run_and_removed(data: ProvisionData) {
    let comm = ScriptedCommunicator::new();
    let ui = RecordingUi::new();
    let hook = hook_with(inline(&["echo one", "echo two"]));

    hook.run(&CancellationToken::new(), &ui, Some(&comm), &data)
        .await
        .unwrap_or_else(|err| panic!("provision failed: {err}"));

    let uploads = comm.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].path, "/tmp/script.sh");
    assert_eq!(uploads[0].contents, "#!/bin/sh -e\necho one\necho two\n");
    assert_eq!(uploads[0].mode, FileMode::EXECUTABLE);
    assert_eq!(
        comm.commands(),
        vec![
            String::from(
                "chmod +x /tmp/script.sh; PACKER_BUILDER_TYPE='iso' PACKER_BUILD_NAME='vmware' /tmp/script.sh"
            ),
            String::from("rm -f /tmp/script.sh"),
        ]
    );
    assert_eq!(ui.said()[0], "Provisioning with shell...");
}

#[rstest]
#[tokio::test]
async fn expected_disconnect_succeeds_and_skips_cleanup(data: ProvisionData) {
    let comm = ScriptedCommunicator::new();
    comm.push_disconnect();
    let ui = RecordingUi::new();
    let hook = hook_with(ShellConfig {
        expect_disconnect: true,
        ..inline(&["reboot"])
    });

    let result = hook
        .run(&CancellationToken::new(), &ui, Some(&comm), &data)
        .await;

    assert_eq!(result, Ok(()));
    assert_eq!(comm.commands().len(), 1);
    assert!(comm.commands().iter().all(|cmd| !cmd.starts_with("rm -f")));
}

#[rstest]
#[tokio::test]
async fn unexpected_disconnect_fails(data: ProvisionData) {
    let comm = ScriptedCommunicator::new();
    comm.push_disconnect();
    let hook = hook_with(inline(&["reboot"]));

    let result = hook
        .run(&CancellationToken::new(), &RecordingUi::new(), Some(&comm), &data)
        .await;

    assert_eq!(
        result,
        Err(ProvisionError::Disconnected {
            script: String::from("/tmp/script.sh")
        })
    );
}

#[rstest]
#[case(vec![0], 3, false)]
#[case(vec![0, 3], 3, true)]
#[tokio::test]
async fn exit_codes_are_checked_against_the_accepted_set(
    data: ProvisionData,
    #[case] valid: Vec<i32>,
    #[case] code: i32,
    #[case] accepted: bool,
) {
    let comm = ScriptedCommunicator::new();
    comm.push_exit(code);
    let hook = hook_with(ShellConfig {
        valid_exit_codes: valid.clone(),
        ..inline(&["exit 3"])
    });

    let result = hook
        .run(&CancellationToken::new(), &RecordingUi::new(), Some(&comm), &data)
        .await;

    if accepted {
        assert_eq!(result, Ok(()));
    } else {
        assert_eq!(
            result,
            Err(ProvisionError::ExitCode {
                script: String::from("/tmp/script.sh"),
                code,
                valid,
            })
        );
    }
}

#[rstest]
#[tokio::test]
async fn skip_clean_leaves_the_script(data: ProvisionData) {
    let comm = ScriptedCommunicator::new();
    let hook = hook_with(ShellConfig {
        skip_clean: true,
        ..inline(&["true"])
    });

    hook.run(&CancellationToken::new(), &RecordingUi::new(), Some(&comm), &data)
        .await
        .unwrap_or_else(|err| panic!("provision failed: {err}"));

    assert_eq!(comm.commands().len(), 1);
}

#[rstest]
#[tokio::test]
async fn empty_hook_needs_no_communicator(data: ProvisionData) {
    let result = ProvisionHook::default()
        .run(&CancellationToken::new(), &RecordingUi::new(), None, &data)
        .await;

    assert_eq!(result, Ok(()));
}

#[rstest]
#[tokio::test]
async fn provisioners_without_communicator_fail(data: ProvisionData) {
    let result = hook_with(inline(&["true"]))
        .run(&CancellationToken::new(), &RecordingUi::new(), None, &data)
        .await;

    assert_eq!(result, Err(ProvisionError::NoCommunicator));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn start_failures_are_retried_until_timeout(data: ProvisionData) {
    let comm = ScriptedCommunicator::new();
    for _ in 0..100 {
        comm.push_start_error(CommunicatorError::Spawn {
            program: String::from("ssh"),
            message: String::from("connection refused"),
        });
    }
    let hook = hook_with(ShellConfig {
        start_retry_timeout: Duration::from_secs(30),
        ..inline(&["true"])
    });

    let result = hook
        .run(&CancellationToken::new(), &RecordingUi::new(), Some(&comm), &data)
        .await;

    match result {
        Err(ProvisionError::RetryTimeout { timeout, message, .. }) => {
            assert_eq!(timeout, Duration::from_secs(30));
            assert!(message.contains("connection refused"), "message was {message}");
        }
        other => panic!("expected retry timeout, got {other:?}"),
    }
    assert!(comm.commands().len() > 1);
}

/// Fails a set number of times before succeeding.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Provisioner for Flaky {
    fn provisioner_type(&self) -> &str {
        "flaky"
    }

    fn provision<'a>(&'a self, _ctx: ProvisionContext<'a>) -> ProvisionFuture<'a> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ProvisionError::Script {
                    path: String::from("flaky.sh"),
                    message: format!("failure {call}"),
                })
            } else {
                Ok(())
            }
        })
    }
}

#[rstest]
#[case(2, 2, true)]
#[case(3, 2, false)]
#[tokio::test]
async fn max_retries_reruns_failed_provisioners(
    data: ProvisionData,
    #[case] failures: u32,
    #[case] retries: u32,
    #[case] succeeds: bool,
) {
    let hook = ProvisionHook::new(vec![
        HookedProvisioner::new(Box::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
        }))
        .with_max_retries(retries),
    ]);
    let ui = RecordingUi::new();

    let result = hook
        .run(&CancellationToken::new(), &ui, Some(&ScriptedCommunicator::new()), &data)
        .await;

    assert_eq!(result.is_ok(), succeeds);
    assert_eq!(ui.errors().len(), usize::try_from(failures.min(retries)).unwrap_or(0));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn pause_before_delays_the_provisioner(data: ProvisionData) {
    let comm = ScriptedCommunicator::new();
    let hook = ProvisionHook::new(vec![
        HookedProvisioner::new(Box::new(shell(inline(&["true"]))))
            .with_pause_before(Some(Duration::from_secs(10))),
    ]);
    let started = Instant::now();

    hook.run(&CancellationToken::new(), &RecordingUi::new(), Some(&comm), &data)
        .await
        .unwrap_or_else(|err| panic!("provision failed: {err}"));

    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cancellation_during_pause_stops_the_hook(data: ProvisionData) {
    let comm = ScriptedCommunicator::new();
    let hook = ProvisionHook::new(vec![
        HookedProvisioner::new(Box::new(shell(inline(&["true"]))))
            .with_pause_before(Some(Duration::from_secs(60))),
    ]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let result = hook
        .run(&cancel, &RecordingUi::new(), Some(&comm), &data)
        .await;

    assert_eq!(result, Err(ProvisionError::Cancelled));
    assert!(comm.uploads().is_empty());
}
