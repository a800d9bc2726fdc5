//! Client-stub behaviour: connection state, error formats, fork support.

use std::sync::Arc;

use switchboard_client::{ClientError, ClientStub};
use switchboard_transport::{Metadata, StatusCode};

use crate::harness::{start_server, unique_uri};
use crate::messages::*;
use crate::services::TestService;

#[test]
fn test_unconnected_stub_fails() {
    let stub = ClientStub::new();
    assert!(!stub.is_valid());
    assert!(stub.address_uri().is_none());
    let err = stub
        .call(&ping_method(), &PingRequest::default(), &Metadata::new(), 100)
        .unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
    assert_eq!(err.to_string(), "invalid (null) client channel");
}

#[test]
fn test_reset_clears_channel() {
    let uri = unique_uri("stub");
    let stub = ClientStub::connected(&uri);
    assert!(stub.is_valid());
    assert_eq!(stub.address_uri().as_deref(), Some(uri.as_str()));
    stub.reset();
    assert!(!stub.is_valid());
    assert!(stub.address_uri().is_none());
}

#[test]
fn test_unreachable_endpoint_error_format() {
    let uri = unique_uri("nowhere");
    let stub = ClientStub::connected(&uri);
    let err = stub
        .call(&ping_method(), &PingRequest::default(), &Metadata::new(), 200)
        .unwrap_err();
    match &err {
        ClientError::Call {
            op,
            address_uri,
            status,
        } => {
            assert_eq!(op, "failed to make unary call");
            assert_eq!(address_uri, &uri);
            assert_eq!(status.code(), StatusCode::Unavailable);
        }
        other => panic!("unexpected error {other}"),
    }
    let rendered = err.to_string();
    assert!(rendered.contains(&format!("addressUri='{uri}'")), "{rendered}");
    assert!(rendered.contains("err='UNAVAILABLE"), "{rendered}");
}

#[test]
fn test_stream_callback_early_stop_cancels() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let stub = ClientStub::connected(&server.uri);

    let mut seen = 0;
    let result = stub.call_stream(
        &server_stream_method(),
        &ServerStreamRequest::default(),
        |_resp| {
            seen += 1;
            seen < 4
        },
        &Metadata::new(),
    );
    assert_eq!(seen, 4);
    // A locally cancelled stream does not finish OK.
    match result.unwrap_err() {
        ClientError::Call { status, .. } => {
            assert_eq!(status.code(), StatusCode::Cancelled)
        }
        other => panic!("unexpected error {other}"),
    }

    server.stop().unwrap();
}

#[cfg(unix)]
#[test]
fn test_fork_resets_and_reinits_parent() {
    use switchboard_client::{fork_with_stub, ForkOutcome};

    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let stub = ClientStub::connected(&server.uri);

    match fork_with_stub(&stub).unwrap() {
        ForkOutcome::Child => {
            // The child gets an unconnected stub and must not run the
            // rest of the test harness.
            let ok = !stub.is_valid();
            unsafe { libc::_exit(if ok { 0 } else { 1 }) };
        }
        ForkOutcome::Parent(pid) => {
            // Parent is re-initialized to the same target and can call.
            assert!(stub.is_valid());
            assert_eq!(stub.address_uri().as_deref(), Some(server.uri.as_str()));
            let resp = stub
                .call(&ping_method(), &PingRequest::default(), &Metadata::new(), 1000)
                .unwrap();
            assert!(resp.result);

            let mut status: libc::c_int = 0;
            let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
            assert_eq!(waited, pid);
            assert!(libc::WIFEXITED(status));
            assert_eq!(libc::WEXITSTATUS(status), 0);
        }
    }

    server.stop().unwrap();
}
