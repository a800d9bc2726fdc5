//! Lifecycle and invariant suites: every accepted call reaches its
//! terminal state exactly once, accept capacity survives failed accepts
//! at shutdown, and a stopped server leaves nothing behind.

use std::sync::Arc;
use std::time::{Duration, Instant};

use switchboard_client::{ClientError, ClientStub};
use switchboard_transport::{Metadata, StatusCode};

use crate::harness::{start_server, wait_until};
use crate::messages::*;
use crate::services::TestService;

#[test]
fn test_accepted_calls_finish_exactly_once() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let stub = ClientStub::connected(&server.uri);

    for i in 0..10 {
        let resp = stub
            .call(
                &ping_method(),
                &PingRequest {
                    msg: format!("call-{i}"),
                },
                &Metadata::new(),
                1000,
            )
            .unwrap();
        assert!(resp.result);
    }
    let mut streamed = 0;
    stub.call_stream(
        &server_stream_method(),
        &ServerStreamRequest::default(),
        |_resp| {
            streamed += 1;
            true
        },
        &Metadata::new(),
    )
    .unwrap();
    assert_eq!(streamed, 10);
    let mut sent = 0;
    let resp = stub
        .call_client_stream(
            &client_stream_method(),
            || {
                if sent < 5 {
                    sent += 1;
                    Some(ClientStreamRequest {
                        msg: format!("req-{sent}"),
                    })
                } else {
                    None
                }
            },
            &Metadata::new(),
        )
        .unwrap();
    assert_eq!(resp.received, 5);

    // Twelve calls were accepted; each reaches its terminal state exactly
    // once, and the stream gauge returns to zero.
    let handle = server.handle.clone();
    assert!(wait_until(Duration::from_secs(2), || {
        let metrics = handle.registry_metrics().unwrap();
        metrics.calls_accepted == 12 && metrics.calls_finished == 12
    }));
    let metrics = server.handle.registry_metrics().unwrap();
    assert_eq!(metrics.streams_opened_total, 1);
    assert_eq!(metrics.open_streams, 0);

    server.stop().unwrap();
}

#[test]
fn test_shutdown_mid_accept_keeps_capacity_then_terminates() {
    // At shutdown every armed accept completes ok=false and is replaced
    // by a fresh slot until the workers stop; the drain then discards the
    // replacements, so the server must still terminate promptly.
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let stub = ClientStub::connected(&server.uri);
    let resp = stub
        .call(&ping_method(), &PingRequest::default(), &Metadata::new(), 1000)
        .unwrap();
    assert!(resp.result);

    let started = Instant::now();
    server.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_stopped_server_leaves_nothing_behind() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let handle = server.handle.clone();
    let stub = ClientStub::connected(&server.uri);
    let resp = stub
        .call(&ping_method(), &PingRequest::default(), &Metadata::new(), 1000)
        .unwrap();
    assert!(resp.result);

    // stop() joins the worker threads; returning proves none is live.
    server.stop().unwrap();

    assert!(!handle.is_running());
    assert!(handle.registry_metrics().is_none());
    assert!(handle.get_service(TEST_SERVICE).is_none());

    // The endpoint is released; new calls fail UNAVAILABLE.
    let err = stub
        .call(&ping_method(), &PingRequest::default(), &Metadata::new(), 200)
        .unwrap_err();
    match err {
        ClientError::Call { status, .. } => {
            assert_eq!(status.code(), StatusCode::Unavailable)
        }
        other => panic!("unexpected error {other}"),
    }
}
