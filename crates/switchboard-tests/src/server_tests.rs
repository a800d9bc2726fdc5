//! End-to-end server suites: the reference scenarios plus lifecycle and
//! re-arm behaviour.

use std::sync::Arc;
use std::time::Duration;

use switchboard_client::{ClientError, ClientStub};
use switchboard_server::{ServerConfig, ServerCore, ServerHandler};
use switchboard_transport::{
    bincode_marshaller, Channel, ChannelConfig, Deadline, Metadata, MethodDescriptor, MethodKind,
    StatusCode,
};

use crate::harness::{start_server, start_server_with, test_config, unique_uri, wait_until};
use crate::messages::*;
use crate::services::TestService;

fn request_metadata() -> Metadata {
    let mut md = Metadata::new();
    md.append_str("sessionid", "42").unwrap();
    md.append_str("requestid", "7").unwrap();
    md
}

#[test]
fn test_ping() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let stub = ClientStub::connected(&server.uri);

    let resp = stub
        .call(&ping_method(), &PingRequest::default(), &request_metadata(), 1000)
        .unwrap();
    assert!(resp.result);
    assert_eq!(resp.msg, "Pong");

    server.stop().unwrap();
}

#[test]
fn test_unary_echo_byte_equal() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let stub = ClientStub::connected(&server.uri);

    let cases = [
        EchoRequest::default(),
        EchoRequest {
            msg: "hello".to_string(),
            blob: vec![0, 1, 2, 255],
        },
        EchoRequest {
            msg: "ünïcode ☃".to_string(),
            blob: vec![0u8; 4096],
        },
    ];
    for req in cases {
        let resp = stub
            .call(&echo_method(), &req, &Metadata::new(), 1000)
            .unwrap();
        assert_eq!(resp.msg, req.msg);
        assert_eq!(resp.blob, req.blob);
    }

    server.stop().unwrap();
}

#[test]
fn test_echo_trailing_metadata() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();

    // Drive the transport directly to observe trailing metadata.
    let channel = Channel::connect(&server.uri);
    let desc = echo_method();
    let req = EchoRequest {
        msg: "t".to_string(),
        blob: vec![1, 2, 3],
    };
    let payload = (desc.req.ser)(&req).unwrap();
    let outcome = channel.unary(
        &desc.full_name(),
        payload,
        Metadata::new(),
        Deadline::after_ms(1000),
    );
    assert!(outcome.status.is_ok());
    assert_eq!(outcome.trailing.get_str("echo-len"), Some("3"));

    server.stop().unwrap();
}

#[test]
fn test_server_stream_of_10_in_order() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let stub = ClientStub::connected(&server.uri);

    let mut responses = Vec::new();
    stub.call_stream(
        &server_stream_method(),
        &ServerStreamRequest {
            msg: "go".to_string(),
        },
        |resp| {
            responses.push(resp.msg);
            true
        },
        &request_metadata(),
    )
    .unwrap();

    assert_eq!(responses.len(), 10);
    for (i, msg) in responses.iter().enumerate() {
        assert_eq!(
            msg,
            &format!("Resp[{}]: 'ServerStreamTestResponse #{}'", i + 1, i + 1)
        );
    }

    server.stop().unwrap();
}

#[test]
fn test_client_stream_of_20() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let stub = ClientStub::connected(&server.uri);

    let mut n = 0;
    let resp = stub
        .call_client_stream(
            &client_stream_method(),
            || {
                if n < 20 {
                    n += 1;
                    Some(ClientStreamRequest {
                        msg: format!("ClientStreamTestRequest {n}"),
                    })
                } else {
                    None
                }
            },
            &request_metadata(),
        )
        .unwrap();
    assert!(resp.result);
    assert_eq!(resp.received, 20);

    server.stop().unwrap();
}

#[test]
fn test_shutdown_from_remote_peer_refused() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();

    let stub = ClientStub::new();
    stub.init_with(
        &server.uri,
        ChannelConfig {
            peer_override: Some("ipv4:10.0.0.1:5555".to_string()),
            ..ChannelConfig::default()
        },
    );
    let resp = stub
        .call(
            &shutdown_method(),
            &ShutdownRequest {
                reason: "test".to_string(),
            },
            &Metadata::new(),
            1000,
        )
        .unwrap();
    assert!(!resp.result);
    assert_eq!(resp.msg, "Shutdown from remote client is not allowed");

    // The server keeps serving.
    assert!(server.handle.is_running());
    let local = ClientStub::connected(&server.uri);
    let ping = local
        .call(&ping_method(), &PingRequest::default(), &Metadata::new(), 1000)
        .unwrap();
    assert!(ping.result);

    server.stop().unwrap();
}

#[test]
fn test_shutdown_from_local_peer_stops_server() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let stub = ClientStub::connected(&server.uri);

    // Abstract-socket peers count as local.
    let resp = stub
        .call(
            &shutdown_method(),
            &ShutdownRequest {
                reason: "maintenance".to_string(),
            },
            &Metadata::new(),
            1000,
        )
        .unwrap();
    assert!(resp.result);

    let handle = server.handle.clone();
    assert!(wait_until(Duration::from_secs(5), || !handle.is_running()));
    // run() returns cleanly: workers drained and joined.
    server.join().unwrap();
}

#[test]
fn test_sequential_calls_rearm_slots() {
    // Every accepted call consumes a slot and must re-arm a fresh one; a
    // long sequential run only works if re-arming is airtight.
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let stub = ClientStub::connected(&server.uri);

    for i in 0..50 {
        let resp = stub
            .call(
                &ping_method(),
                &PingRequest {
                    msg: format!("seq-{i}"),
                },
                &Metadata::new(),
                1000,
            )
            .unwrap();
        assert!(resp.result, "call {i} failed");
    }

    server.stop().unwrap();
}

#[test]
fn test_concurrent_mixed_calls() {
    let server = start_server_with(
        vec![Arc::new(TestService)],
        ServerConfig {
            worker_count: 4,
            ..test_config()
        },
    )
    .unwrap();

    let mut threads = Vec::new();
    for t in 0..8 {
        let uri = server.uri.clone();
        threads.push(std::thread::spawn(move || {
            let stub = ClientStub::connected(&uri);
            for i in 0..10 {
                if t % 2 == 0 {
                    let resp = stub
                        .call(
                            &ping_method(),
                            &PingRequest {
                                msg: format!("t{t}-{i}"),
                            },
                            &Metadata::new(),
                            2000,
                        )
                        .unwrap();
                    assert!(resp.result);
                } else {
                    let mut count = 0;
                    stub.call_stream(
                        &server_stream_method(),
                        &ServerStreamRequest {
                            msg: format!("t{t}-{i}"),
                        },
                        |_resp| {
                            count += 1;
                            true
                        },
                        &Metadata::new(),
                    )
                    .unwrap();
                    assert_eq!(count, 10);
                }
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    // The finish completion is consumed by the worker after the client
    // already has its response, so give the counters a moment to settle.
    let handle = server.handle.clone();
    assert!(wait_until(Duration::from_secs(2), || {
        let metrics = handle.registry_metrics().unwrap();
        metrics.open_streams == 0 && metrics.calls_accepted == metrics.calls_finished
    }));

    server.stop().unwrap();
}

#[test]
fn test_registry_metrics_counts() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let stub = ClientStub::connected(&server.uri);

    for _ in 0..3 {
        stub.call(&ping_method(), &PingRequest::default(), &Metadata::new(), 1000)
            .unwrap();
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

    let handle = server.handle.clone();
    assert!(wait_until(Duration::from_secs(2), || {
        let metrics = handle.registry_metrics().unwrap();
        metrics.calls_finished >= 4 && metrics.open_streams == 0
    }));
    let metrics = server.handle.registry_metrics().unwrap();
    assert!(metrics.calls_accepted >= 4);
    assert_eq!(metrics.streams_opened_total, 1);

    server.stop().unwrap();
}

#[test]
fn test_unknown_method_unimplemented() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let stub = ClientStub::connected(&server.uri);

    let bogus: MethodDescriptor<PingRequest, PingResponse> = MethodDescriptor {
        service: TEST_SERVICE,
        method: "NoSuchMethod",
        kind: MethodKind::Unary,
        req: bincode_marshaller(),
        resp: bincode_marshaller(),
    };
    let err = stub
        .call(&bogus, &PingRequest::default(), &Metadata::new(), 1000)
        .unwrap_err();
    match err {
        ClientError::Call { status, .. } => {
            assert_eq!(status.code(), StatusCode::Unimplemented)
        }
        other => panic!("unexpected error {other}"),
    }

    server.stop().unwrap();
}

#[test]
fn test_get_service_handle() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();

    let svc = server.handle.get_service(TEST_SERVICE).unwrap();
    assert_eq!(svc.name(), TEST_SERVICE);
    assert!(svc.is_serving());
    assert!(server.handle.get_service("test.Missing").is_none());

    server.stop().unwrap();
}

#[test]
fn test_multi_listen() {
    // One server bound to two endpoints serves both.
    struct TwoEndpoints;
    impl ServerHandler for TwoEndpoints {
        fn on_init(&self, builder: &mut switchboard_server::ServerBuilder) -> bool {
            builder.set_run_interval(Duration::from_millis(10));
            builder.add_service(Arc::new(TestService)).is_ok()
        }
    }

    let uri_a = unique_uri("multi-a");
    let uri_b = unique_uri("multi-b");
    let core = ServerCore::new(test_config(), Arc::new(TwoEndpoints));
    let handle = core.handle();
    let endpoints: [switchboard_transport::Endpoint; 2] =
        [uri_a.clone().into(), uri_b.clone().into()];
    let thread = std::thread::spawn(move || core.run(&endpoints));
    assert!(wait_until(Duration::from_secs(5), || handle.is_running()));

    for uri in [&uri_a, &uri_b] {
        let stub = ClientStub::connected(uri);
        let resp = stub
            .call(&ping_method(), &PingRequest::default(), &Metadata::new(), 1000)
            .unwrap();
        assert!(resp.result);
    }

    handle.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn test_run_without_services_fails() {
    struct NoServices;
    impl ServerHandler for NoServices {
        fn on_init(&self, _builder: &mut switchboard_server::ServerBuilder) -> bool {
            true
        }
    }
    let core = ServerCore::new(test_config(), Arc::new(NoServices));
    let err = core.run_uri(&unique_uri("empty")).unwrap_err();
    assert!(matches!(err, switchboard_server::ServerError::NoServices));
}

#[test]
fn test_failed_on_init_aborts_run() {
    struct RefusesInit;
    impl ServerHandler for RefusesInit {
        fn on_init(&self, _builder: &mut switchboard_server::ServerBuilder) -> bool {
            false
        }
    }
    let core = ServerCore::new(test_config(), Arc::new(RefusesInit));
    let err = core.run_uri(&unique_uri("refused")).unwrap_err();
    assert!(matches!(err, switchboard_server::ServerError::Init(_)));
}

#[test]
fn test_endpoint_reusable_after_shutdown() {
    let uri = unique_uri("reuse");
    for _ in 0..2 {
        struct Host;
        impl ServerHandler for Host {
            fn on_init(&self, builder: &mut switchboard_server::ServerBuilder) -> bool {
                builder.set_run_interval(Duration::from_millis(10));
                builder.add_service(Arc::new(TestService)).is_ok()
            }
        }
        let core = ServerCore::new(test_config(), Arc::new(Host));
        let handle = core.handle();
        let run_uri = uri.clone();
        let thread = std::thread::spawn(move || core.run_uri(&run_uri));
        assert!(wait_until(Duration::from_secs(5), || handle.is_running()));

        let stub = ClientStub::connected(&uri);
        let resp = stub
            .call(&ping_method(), &PingRequest::default(), &Metadata::new(), 1000)
            .unwrap();
        assert!(resp.result);

        handle.shutdown();
        thread.join().unwrap().unwrap();
    }
}

#[test]
fn test_calls_after_shutdown_fail_unavailable() {
    let server = start_server(vec![Arc::new(TestService)]).unwrap();
    let uri = server.uri.clone();
    server.stop().unwrap();

    let stub = ClientStub::connected(&uri);
    let err = stub
        .call(&ping_method(), &PingRequest::default(), &Metadata::new(), 500)
        .unwrap_err();
    match err {
        ClientError::Call { status, .. } => {
            assert_eq!(status.code(), StatusCode::Unavailable)
        }
        other => panic!("unexpected error {other}"),
    }
}
