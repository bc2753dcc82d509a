//! Unit tests for the readiness waiter.

use std::time::Duration;

use rstest::rstest;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::test_support::ScriptedConnector;

fn network() -> Result<(), ConnectError> {
    Err(ConnectError::Network(String::from("connection refused")))
}

fn handshake() -> Result<(), ConnectError> {
    Err(ConnectError::Handshake(String::from("permission denied")))
}

fn config(poll_secs: u64, total_secs: u64, handshake_limit: u32) -> WaitConfig {
    WaitConfig {
        attempt_timeout: Duration::from_secs(2),
        total_timeout: Duration::from_secs(total_secs),
        poll_interval: Duration::from_secs(poll_secs),
        handshake_limit,
    }
}

#[tokio::test(start_paused = true)]
async fn succeeds_after_transient_failures() {
    let connector = ScriptedConnector::new(vec![network(), network(), network(), Ok(())]);
    let waiter = ReadinessWaiter::new(config(1, 600, 10));
    let started = Instant::now();

    let result = waiter.wait(&connector, &CancellationToken::new()).await;

    assert!(result.is_ok(), "expected success, got {:?}", result.err());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(4), "elapsed {elapsed:?}");
    assert_eq!(connector.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn tolerates_a_flapping_port() {
    let connector = ScriptedConnector::new(vec![
        network(),
        handshake(),
        network(),
        handshake(),
        network(),
        Ok(()),
    ]);
    let waiter = ReadinessWaiter::new(config(1, 600, 10));

    let result = waiter.wait(&connector, &CancellationToken::new()).await;

    assert!(result.is_ok());
    assert_eq!(connector.attempts(), 6);
}

#[rstest]
#[case(0, 1)]
#[case(2, 3)]
#[tokio::test(start_paused = true)]
async fn aborts_once_handshake_failures_exceed_limit(#[case] limit: u32, #[case] expected: u32) {
    let connector = ScriptedConnector::new(vec![handshake(); 5]);
    let waiter = ReadinessWaiter::new(config(1, 600, limit));

    let result = waiter.wait(&connector, &CancellationToken::new()).await;

    match result {
        Err(WaitError::HandshakeLimit { failures, last }) => {
            assert_eq!(failures, expected);
            assert!(matches!(last, ConnectError::Handshake(_)));
        }
        other => panic!("expected handshake limit, got {:?}", other.err()),
    }
    assert_eq!(connector.attempts(), expected);
}

#[tokio::test(start_paused = true)]
async fn network_failures_are_bounded_by_total_timeout() {
    let connector = ScriptedConnector::new(Vec::new());
    let waiter = ReadinessWaiter::new(config(3, 10, 10));
    let started = Instant::now();

    let result = waiter.wait(&connector, &CancellationToken::new()).await;

    assert!(matches!(
        result,
        Err(WaitError::Timeout { last: Some(ConnectError::Network(_)), .. })
    ));
    assert!(started.elapsed() <= Duration::from_secs(13));
}

#[tokio::test(start_paused = true)]
async fn blocked_connect_cannot_overrun_total_timeout() {
    let connector = ScriptedConnector::new(vec![Ok(())]).with_delay(Duration::from_secs(3600));
    let waiter = ReadinessWaiter::new(WaitConfig {
        attempt_timeout: Duration::from_secs(3600),
        total_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_secs(1),
        handshake_limit: 10,
    });
    let started = Instant::now();

    let result = waiter.wait(&connector, &CancellationToken::new()).await;

    assert!(matches!(result, Err(WaitError::Timeout { attempts: 1, last: None })));
    assert!(started.elapsed() <= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn slow_attempts_count_as_network_failures() {
    let connector = ScriptedConnector::new(vec![Ok(()); 3]).with_delay(Duration::from_secs(10));
    let waiter = ReadinessWaiter::new(config(1, 7, 10));

    let result = waiter.wait(&connector, &CancellationToken::new()).await;

    match result {
        Err(WaitError::Timeout { last: Some(ConnectError::Network(message)), .. }) => {
            assert!(message.contains("timed out"), "message: {message}");
        }
        other => panic!("expected timeout, got {:?}", other.err()),
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_is_reported_distinctly() {
    let connector = ScriptedConnector::new(Vec::new());
    let waiter = ReadinessWaiter::new(config(1, 600, 10));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        trigger.cancel();
    });

    let result = waiter.wait(&connector, &cancel).await;

    assert!(matches!(result, Err(WaitError::Cancelled { attempts: 3 })));
}

#[tokio::test]
async fn local_connector_is_immediately_ready() {
    let waiter = ReadinessWaiter::default();

    let result = waiter
        .wait(&LocalConnector::default(), &CancellationToken::new())
        .await;

    assert!(result.is_ok());
}
