//! Unit tests for the Scaleway lifecycle helpers that need no network.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use rstest::{fixture, rstest};
use scaleway_rs::{ScalewayApiError, ScalewayImage};

use super::backup::{image_id_from_href, image_progress};
use super::launch::{BUILD_TAGS, Boot, NewServer, boot_plan, newest_image, rejects_instance_type};
use super::wait::public_address;
use super::*;
use crate::cloud::{InstanceHandle, InstanceRequest};
use crate::retry::Retry;

fn snapshot(state: &str, allowed: &[&str], public_ip: Option<&str>) -> InstanceSnapshot {
    InstanceSnapshot {
        id: InstanceId::from("srv-1"),
        state: InstanceState::from(state),
        allowed_actions: allowed.iter().map(|action| Action::from(*action)).collect(),
        public_ip: public_ip.map(str::to_owned),
    }
}

fn image(id: &str, arch: &str, state: &str, creation_date: &str) -> ScalewayImage {
    ScalewayImage {
        id: id.to_owned(),
        name: String::new(),
        arch: arch.to_owned(),
        creation_date: creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

fn api_error(etype: &str, resource: Option<&str>, message: &str) -> ScalewayApiError {
    ScalewayApiError {
        message: message.to_owned(),
        resource: resource.map(str::to_owned),
        resource_id: None,
        etype: etype.to_owned(),
    }
}

#[fixture]
fn request() -> InstanceRequest {
    InstanceRequest::builder()
        .image_label("Ubuntu 24.04 Noble Numbat")
        .instance_type("DEV1-S")
        .zone("fr-par-1")
        .project_id("proj")
        .architecture("x86_64")
        .cloud_init_user_data(Some(String::from("#cloud-config\n")))
        .build()
        .unwrap_or_else(|err| panic!("request: {err}"))
}

fn handle() -> InstanceHandle {
    InstanceHandle {
        id: String::from("srv-1"),
        zone: String::from("fr-par-1"),
    }
}

#[rstest]
#[case::running(snapshot("running", &[], None), Ok(Boot::Running))]
#[case::stopped(snapshot("stopped", &["poweron", "terminate"], None), Ok(Boot::PowerOn))]
#[case::locked(
    snapshot("stopped", &["terminate"], None),
    Err(ScalewayBackendError::CannotPowerOn {
        id: String::from("srv-1"),
        state: String::from("stopped"),
    })
)]
fn new_servers_boot_only_when_allowed(
    #[case] server: InstanceSnapshot,
    #[case] expected: Result<Boot, ScalewayBackendError>,
) {
    assert_eq!(boot_plan(&server), expected);
}

#[rstest]
fn newest_available_image_of_the_right_arch_wins(request: InstanceRequest) {
    let images = vec![
        image("old", "x86_64", "available", "2024-01-01T00:00:00Z"),
        image("new", "x86_64", "available", "2024-06-01T00:00:00Z"),
        image("arm", "arm64", "available", "2024-09-01T00:00:00Z"),
        image("broken", "x86_64", "error", "2024-12-01T00:00:00Z"),
    ];

    assert_eq!(newest_image(images, &request).as_deref(), Ok("new"));
}

#[rstest]
fn missing_image_names_label_and_zone(request: InstanceRequest) {
    let images = vec![image("arm", "arm64", "available", "2024-01-01")];

    let Err(err) = newest_image(images, &request) else {
        panic!("expected no image to match");
    };
    assert_eq!(
        err.to_string(),
        "no available x86_64 image labelled 'Ubuntu 24.04 Noble Numbat' in fr-par-1"
    );
}

#[rstest]
fn servers_are_created_stopped_with_user_data(request: InstanceRequest) {
    let payload = serde_json::to_value(NewServer::stopped(&request, "img-1"))
        .unwrap_or_else(|err| panic!("serialise: {err}"));

    assert_eq!(payload["image"], "img-1");
    assert_eq!(payload["commercial_type"], "DEV1-S");
    assert_eq!(payload["stopped"], true);
    assert_eq!(payload["cloud_init"], "#cloud-config\n");
    assert_eq!(payload["tags"], serde_json::json!(BUILD_TAGS));
    assert!(payload.get("organization").is_none());
    assert!(payload["name"].as_str().is_some_and(|name| name.starts_with("kiln-")));
}

#[rstest]
#[case::field(api_error("invalid_arguments", Some("commercial_type"), "bad"), true)]
#[case::message(api_error("invalid_arguments", None, "Invalid commercial_type"), true)]
#[case::quota(api_error("quotas_exceeded", Some("instances"), "quota"), false)]
fn instance_type_rejections_are_recognised(
    #[case] api_err: ScalewayApiError,
    #[case] rejected: bool,
) {
    assert_eq!(rejects_instance_type(&api_err, "DEV1-S"), rejected);
}

#[test]
fn rejection_naming_the_type_as_resource_id_counts() {
    let api_err = ScalewayApiError {
        resource_id: Some(String::from("DEV1-S")),
        ..api_error("not_found", None, "unknown")
    };
    assert!(rejects_instance_type(&api_err, "DEV1-S"));
}

#[rstest]
#[case::image("/images/0f1e", Some("0f1e"))]
#[case::trailing_slash("/images/0f1e/", Some("0f1e"))]
#[case::empty("/images/", None)]
#[case::other_resource("/servers/0f1e", None)]
fn backup_result_yields_the_image_id(#[case] href: &str, #[case] expected: Option<&str>) {
    assert_eq!(image_id_from_href(href), expected);
}

#[rstest]
#[case::available("available", None)]
#[case::creating("creating", Some(false))]
#[case::error("error", Some(true))]
fn image_states_drive_the_poll(#[case] state: &str, #[case] fatal: Option<bool>) {
    let outcome = image_progress("img-1", state);
    match (outcome, fatal) {
        (Ok(()), None) => {}
        (Err(Retry::Fatal(_)), Some(true)) | (Err(Retry::Transient(_)), Some(false)) => {}
        (other, _) => panic!("unexpected outcome for {state}: {other:?}"),
    }
}

#[test]
fn running_instance_with_address_is_ready() {
    let server = snapshot("running", &[], Some("192.0.2.7"));
    let address = public_address(&handle(), Some(&server))
        .unwrap_or_else(|err| panic!("not ready: {err:?}"));
    assert_eq!(address, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)));
}

#[rstest]
#[case::vanished(None, false)]
#[case::starting(Some(snapshot("starting", &[], None)), false)]
#[case::no_address(Some(snapshot("running", &[], None)), true)]
#[case::bad_address(Some(snapshot("running", &[], Some("not-an-ip"))), true)]
fn unready_instances_are_polled_again(
    #[case] server: Option<InstanceSnapshot>,
    #[case] missing_ip: bool,
) {
    let Err(Retry::Transient(err)) = public_address(&handle(), server.as_ref()) else {
        panic!("expected a transient failure");
    };
    assert_eq!(
        matches!(err, ScalewayBackendError::NoPublicAddress { .. }),
        missing_ip,
        "{err}"
    );
}

#[rstest]
#[case::cancelled(
    RetryError::Cancelled { attempts: 2 },
    ScalewayBackendError::Cancelled { stage: Stage::Backup, id: String::from("img-1") }
)]
#[case::missing_ip_survives_timeout(
    RetryError::Timeout {
        attempts: 9,
        last: Some(ScalewayBackendError::NoPublicAddress { id: String::from("srv-1") }),
    },
    ScalewayBackendError::NoPublicAddress { id: String::from("srv-1") }
)]
#[case::plain_timeout(
    RetryError::Timeout { attempts: 1, last: None },
    ScalewayBackendError::TimedOut { stage: Stage::Backup, id: String::from("img-1") }
)]
#[case::aborted(
    RetryError::Aborted {
        attempts: 1,
        source: ScalewayBackendError::Api(String::from("401")),
    },
    ScalewayBackendError::Api(String::from("401"))
)]
fn finished_waits_map_to_driver_errors(
    #[case] err: RetryError<ScalewayBackendError>,
    #[case] expected: ScalewayBackendError,
) {
    assert_eq!(from_retry(err, Stage::Backup, "img-1"), expected);
}

#[test]
fn cancelled_backup_wait_reads_naturally() {
    let err = ScalewayBackendError::Cancelled {
        stage: Stage::Backup,
        id: String::from("img-1"),
    };
    assert_eq!(err.to_string(), "image backup of img-1 was cancelled");
}
