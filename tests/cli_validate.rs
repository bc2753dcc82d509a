//! Behavioural tests for `kiln validate`.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use serde_json::json;

#[path = "common/templates.rs"]
mod templates;

use templates::{Workspace, local_builder};

#[test]
fn valid_template_is_accepted() {
    let workspace = Workspace::new();
    let template = workspace.write_template(&json!({
        "builders": [local_builder("local")],
        "provisioners": [workspace.shell(&[String::from("true")])],
        "post-processors": [{ "type": "manifest", "output": "manifest.json" }]
    }));

    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.args(["validate", &template]);

    cmd.assert()
        .success()
        .stdout(contains("Template validated successfully."));
}

#[test]
fn none_communicator_warns_but_validates() {
    let workspace = Workspace::new();
    let template = workspace.write_template(&json!({
        "builders": [{ "type": "null", "name": "idle", "communicator": "none" }]
    }));

    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.args(["validate", &template]);

    cmd.assert()
        .success()
        .stdout(contains("Warning (idle)"))
        .stdout(contains("Template validated successfully."));
}

#[test]
fn unusable_builder_is_reported_by_name() {
    let workspace = Workspace::new();
    let template = workspace.write_template(&json!({
        "builders": [
            local_builder("fine"),
            { "type": "null", "name": "broken" }
        ]
    }));

    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.args(["validate", &template]);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("* broken:"))
        .stderr(contains("ssh_host"));
}

#[test]
fn filter_naming_an_unknown_build_is_rejected() {
    let workspace = Workspace::new();
    let template = workspace.write_template(&json!({
        "builders": [local_builder("local")],
        "provisioners": [{ "type": "shell", "inline": ["true"], "only": ["elsewhere"] }]
    }));

    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.args(["validate", &template]);

    cmd.assert().failure().code(1).stderr(contains("elsewhere"));
}

#[test]
fn malformed_json_fails() {
    let workspace = Workspace::new();
    let template = workspace.write_raw("{ \"builders\": [");

    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.args(["validate", &template]);

    cmd.assert().failure().code(1);
}

#[test]
fn missing_template_fails() {
    let workspace = Workspace::new();
    let missing = workspace.file("absent.json").display().to_string();

    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.args(["validate", &missing]);

    cmd.assert().failure().code(1).stderr(contains("absent.json"));
}
