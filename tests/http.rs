mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use kira_biogeo::clock::RecordingClock;
use kira_biogeo::error::KiraError;
use kira_biogeo::http::RetryPolicy;

use common::{CannedResponse, CannedServer, local_client};

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts: Some(max_attempts),
        backoff_base: Duration::from_millis(100),
        ..RetryPolicy::idempotent()
    }
}

#[test]
fn retries_retryable_status_then_succeeds() {
    let server = CannedServer::start(vec![
        CannedResponse::text(503, "busy"),
        CannedResponse::text(503, "busy"),
        CannedResponse::text(200, "done"),
    ]);
    let clock = Arc::new(RecordingClock::new());
    let client = local_client("test", fast_policy(5)).with_clock(clock.clone());

    let url = format!("{}/resource", server.url);
    let response = client.execute(|http| http.get(&url)).unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().unwrap(), "done");

    let seen = server.finish();
    assert_eq!(seen.len(), 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
}

#[test]
fn non_retryable_status_is_returned() {
    let server = CannedServer::start(vec![CannedResponse::text(404, "missing")]);
    let clock = Arc::new(RecordingClock::new());
    let client = local_client("test", fast_policy(5)).with_clock(clock.clone());

    let url = format!("{}/nothing", server.url);
    let response = client.execute(|http| http.get(&url)).unwrap();
    assert_eq!(response.status().as_u16(), 404);
    assert!(clock.sleeps().is_empty());

    let err = client.ensure_success(response).unwrap_err();
    assert_matches!(err, KiraError::RemoteRejected { status: 404, .. });
}

#[test]
fn method_outside_allow_list_is_not_retried() {
    let server = CannedServer::start(vec![CannedResponse::text(503, "busy")]);
    let clock = Arc::new(RecordingClock::new());
    let client = local_client("test", fast_policy(5)).with_clock(clock.clone());

    let url = format!("{}/submit", server.url);
    let response = client.execute(|http| http.post(&url).body("x")).unwrap();
    assert_eq!(response.status().as_u16(), 503);
    assert_eq!(server.finish().len(), 1);
    assert!(clock.sleeps().is_empty());
}

#[test]
fn exhausted_retries_raise_remote_unavailable() {
    let server = CannedServer::start(vec![
        CannedResponse::text(502, "bad gateway"),
        CannedResponse::text(502, "bad gateway"),
    ]);
    let clock = Arc::new(RecordingClock::new());
    let client = local_client("test", fast_policy(2)).with_clock(clock.clone());

    let url = format!("{}/flaky", server.url);
    let err = client.execute(|http| http.get(&url)).unwrap_err();
    assert_matches!(err, KiraError::RemoteUnavailable { attempts: 2, ref reason, .. } if reason.contains("502"));
    assert_eq!(server.finish().len(), 2);
    assert_eq!(clock.sleeps().len(), 1);
}

#[test]
fn execute_ok_turns_rejection_into_error() {
    let server = CannedServer::start(vec![CannedResponse::text(400, "bad term")]);
    let client = local_client("entrez", fast_policy(3));

    let url = format!("{}/esearch", server.url);
    let err = client.execute_ok(|http| http.get(&url)).unwrap_err();
    assert_matches!(
        err,
        KiraError::RemoteRejected { status: 400, ref message, .. } if message == "bad term"
    );
}
