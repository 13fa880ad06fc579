//! End-to-end scenario coverage driving real `qwormhole-server`/
//! `qwormhole-client` state machines: trust-tier framing, rate limiting,
//! backpressure recovery, handshake rejection, and reconnect exhaustion.
//!
//! Scenarios that need precise control over the handshake's `nIndex` talk to
//! [`drive_connection`] directly over a `tokio::io::duplex`, the same way
//! `qwormhole-server`'s own `connection.rs` tests do, since the high-level
//! [`Client`] never sets anything but `protocol_version` in its self-built
//! handshake.

use std::{sync::Arc, time::Duration};

use qwormhole_client::{Client, ClientConfig, ClientEvent};
use qwormhole_core::{
    AdaptiveMode, BatchFramer, BatchFramerConfig, FailedHandshakeLedger, FlowController, FlowControllerConfig,
    SliceDriftReason, TokioEnvironment, TokioSchedulerTelemetry, TrustSnapshot,
};
use qwormhole_proto::{FrameDecoder, HandshakePayload, encode_frame};
use qwormhole_server::{
    Server, ServerConfig,
    connection::{ConnectionConfig, ConnectionHandle, ConnectionOutcome, InboundMessage, ServerTelemetryEvent},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    net::TcpListener,
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};

fn trust_sink_channel()
-> (qwormhole_server::connection::TrustSnapshotSink, oneshot::Receiver<TrustSnapshot>) {
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let sink: qwormhole_server::connection::TrustSnapshotSink = Arc::new(move |snapshot| {
        let tx = Arc::clone(&tx);
        Box::pin(async move {
            if let Some(tx) = tx.lock().await.take() {
                let _ = tx.send(snapshot);
            }
        })
    });
    (sink, rx)
}

struct RawConnection {
    client: DuplexStream,
    handle_rx: mpsc::UnboundedReceiver<ConnectionHandle>,
    messages_rx: mpsc::UnboundedReceiver<InboundMessage>,
    telemetry_rx: mpsc::UnboundedReceiver<ServerTelemetryEvent>,
    trust_rx: oneshot::Receiver<TrustSnapshot>,
    driver: JoinHandle<ConnectionOutcome>,
}

fn spawn_raw_connection(config: ConnectionConfig, duplex_buffer: usize) -> RawConnection {
    let (client, server) = tokio::io::duplex(duplex_buffer);
    let (messages_tx, messages_rx) = mpsc::unbounded_channel();
    let (handle_tx, handle_rx) = mpsc::unbounded_channel();
    let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
    let (trust_sink, trust_rx) = trust_sink_channel();
    let ledger =
        Arc::new(Mutex::new(FailedHandshakeLedger::<TokioEnvironment>::new(Duration::from_secs(3600), 10_000)));

    let driver = tokio::spawn(qwormhole_server::connection::drive_connection(
        1,
        "127.0.0.1:1".to_string(),
        server,
        config,
        TokioEnvironment,
        TokioSchedulerTelemetry::default(),
        None,
        ledger,
        messages_tx,
        handle_tx,
        Some(trust_sink),
        Some(telemetry_tx),
    ));

    RawConnection { client, handle_rx, messages_rx, telemetry_rx, trust_rx, driver }
}

fn handshake_wire(n_index: f64) -> Vec<u8> {
    let handshake = HandshakePayload { n_index: Some(n_index), ..HandshakePayload::new(None) };
    let mut wire = Vec::new();
    encode_frame(&handshake.to_json_bytes().unwrap(), &mut wire);
    wire
}

/// nIndex=0.9 puts both sides in the trust-zero tier (table batch size 64);
/// ten thousand round-tripped frames should drift the slice up from its
/// initial half-preferred value and never touch backpressure. Scaled down
/// from the nominal ten thousand frames to keep this fast under `cargo test`.
#[tokio::test]
async fn echo_at_trust_zero_drifts_slice_upward_without_backpressure() {
    let mut conn = spawn_raw_connection(ConnectionConfig::default(), 1 << 20);

    let (mut client_read, mut client_write) = tokio::io::split(conn.client);
    client_write.write_all(&handshake_wire(0.9)).await.unwrap();

    let handle = conn.handle_rx.recv().await.unwrap();

    const FRAME_COUNT: usize = 2_000;
    const FRAME_LEN: usize = 1024;

    let mut messages_rx = conn.messages_rx;
    let echo_task = tokio::spawn(async move {
        for _ in 0..FRAME_COUNT {
            let (_, message) = messages_rx.recv().await.expect("connection closed early");
            handle.send(message);
        }
    });

    let reader = tokio::spawn(async move {
        let mut decoder = FrameDecoder::with_default_max_frame_length();
        let mut buf = vec![0u8; 64 * 1024];
        let mut received = 0usize;
        while received < FRAME_COUNT {
            let n = client_read.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed before echoing every frame");
            decoder.push(&buf[..n]).unwrap();
            while let Some(frame) = decoder.next_frame().unwrap() {
                assert_eq!(frame.len(), FRAME_LEN);
                received += 1;
            }
        }
        received
    });

    let payload = vec![7u8; FRAME_LEN];
    for _ in 0..FRAME_COUNT {
        let mut wire = Vec::new();
        encode_frame(&payload, &mut wire);
        client_write.write_all(&wire).await.unwrap();
    }

    assert_eq!(reader.await.unwrap(), FRAME_COUNT);
    echo_task.await.unwrap();

    client_write.shutdown().await.unwrap();
    drop(client_read);

    let outcome = conn.driver.await.unwrap();
    assert!(!outcome.had_error);

    let mut saw_backpressure = false;
    while let Ok(event) = conn.telemetry_rx.try_recv() {
        saw_backpressure |= matches!(event, ServerTelemetryEvent::Backpressure);
    }
    assert!(!saw_backpressure, "a generously-buffered duplex should never backpressure");

    let snapshot = conn.trust_rx.await.unwrap();
    let diagnostics = snapshot.flow_diagnostics.expect("native peer gets a flow controller");
    assert!(diagnostics.slice_size > 32, "slice should drift up from its initial half-preferred value");
    assert!(!diagnostics.history.iter().any(|e| e.reason == SliceDriftReason::Backpressure));
}

/// nIndex=0.2 is paranoia tier; pinning `forced_slice` to 1 should leave the
/// controller's slice untouched regardless of how much traffic crosses it.
#[tokio::test]
async fn paranoia_handshake_with_forced_slice_pins_flush_granularity() {
    let mut conn =
        spawn_raw_connection(ConnectionConfig { forced_slice: Some(1), ..ConnectionConfig::default() }, 1 << 16);

    let (mut client_read, mut client_write) = tokio::io::split(conn.client);
    client_write.write_all(&handshake_wire(0.2)).await.unwrap();

    let handle = conn.handle_rx.recv().await.unwrap();

    const FRAME_COUNT: usize = 20;
    let mut messages_rx = conn.messages_rx;
    let echo_task = tokio::spawn(async move {
        for _ in 0..FRAME_COUNT {
            let (_, message) = messages_rx.recv().await.expect("connection closed early");
            handle.send(message);
        }
    });

    let reader = tokio::spawn(async move {
        let mut decoder = FrameDecoder::with_default_max_frame_length();
        let mut buf = vec![0u8; 4096];
        let mut received = 0usize;
        while received < FRAME_COUNT {
            let n = client_read.read(&mut buf).await.unwrap();
            assert!(n > 0);
            decoder.push(&buf[..n]).unwrap();
            while decoder.next_frame().unwrap().is_some() {
                received += 1;
            }
        }
        received
    });

    for i in 0..FRAME_COUNT {
        let mut wire = Vec::new();
        encode_frame(format!("frame-{i}").as_bytes(), &mut wire);
        client_write.write_all(&wire).await.unwrap();
    }

    assert_eq!(reader.await.unwrap(), FRAME_COUNT);
    echo_task.await.unwrap();

    client_write.shutdown().await.unwrap();
    drop(client_read);

    let outcome = conn.driver.await.unwrap();
    assert!(!outcome.had_error);

    let snapshot = conn.trust_rx.await.unwrap();
    let diagnostics = snapshot.flow_diagnostics.expect("paranoia peer still gets a flow controller");
    assert!(diagnostics.forced);
    assert_eq!(diagnostics.slice_size, 1);
}

/// A single oversized flush against a tiny duplex buffer forces the
/// write-vectored loop to observe a short write, then finish once the peer
/// drains it — a real backpressure-then-recovery cycle, not a simulated one.
#[tokio::test]
async fn backpressure_contracts_the_slice_then_recovers_on_drain() {
    let mut conn = spawn_raw_connection(ConnectionConfig::default(), 4096);

    let (mut client_read, mut client_write) = tokio::io::split(conn.client);
    client_write.write_all(&handshake_wire(0.9)).await.unwrap();

    let handle = conn.handle_rx.recv().await.unwrap();

    const PAYLOAD_LEN: usize = 256 * 1024;
    let reader = tokio::spawn(async move {
        let mut decoder = FrameDecoder::with_default_max_frame_length();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = client_read.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            decoder.push(&buf[..n]).unwrap();
            if let Some(frame) = decoder.next_frame().unwrap() {
                assert_eq!(frame.len(), PAYLOAD_LEN);
                break;
            }
        }
    });

    handle.send(bytes::Bytes::from(vec![9u8; PAYLOAD_LEN]));

    let mut saw_backpressure = false;
    let mut saw_drain = false;
    while !(saw_backpressure && saw_drain) {
        match conn.telemetry_rx.recv().await.expect("connection closed before draining") {
            ServerTelemetryEvent::Backpressure => saw_backpressure = true,
            ServerTelemetryEvent::Drain => saw_drain = true,
        }
    }

    reader.await.unwrap();
    drop(client_write);

    let outcome = conn.driver.await.unwrap();
    assert!(!outcome.had_error, "backpressure alone must not be fatal below max_backpressure_bytes");

    let snapshot = conn.trust_rx.await.unwrap();
    let diagnostics = snapshot.flow_diagnostics.expect("native peer gets a flow controller");
    assert!(diagnostics.history.iter().any(|e| e.reason == SliceDriftReason::Backpressure));
    assert!(diagnostics.history.iter().any(|e| e.reason == SliceDriftReason::Drain));
}

/// Drives the real token bucket (not a mock) through `FlowController::enqueue`
/// with `rate_bytes_per_sec = burst_budget_bytes = 1024`: the first
/// 1024-byte frame (1028 bytes on the wire) nearly exhausts the bucket, so
/// the second has to wait out almost a full second of refill.
#[tokio::test]
async fn rate_limited_flush_delays_the_second_frame_by_about_one_second() {
    let (_client, server) = tokio::io::duplex(1 << 16);
    let (framer_events_tx, _framer_events_rx) = mpsc::unbounded_channel();
    let framer_config = BatchFramerConfig { batch_size: 1, use_writev: true, ..BatchFramerConfig::default() };
    let mut framer = BatchFramer::new(framer_config, framer_events_tx);
    framer.attach_socket(server);

    let (controller_events_tx, _controller_events_rx) = mpsc::unbounded_channel();
    let mut controller = FlowController::new(
        FlowControllerConfig {
            preferred_batch_size: 1,
            min_slice: 1,
            max_slice: 1,
            burst_budget_bytes: 1024,
            rate_bytes_per_sec: 1024,
            peer_is_native: false,
            neg_index: 0.5,
            forced_slice: Some(1),
            adaptive_mode: AdaptiveMode::Off,
        },
        controller_events_tx,
    );

    let env = TokioEnvironment;
    let telemetry = TokioSchedulerTelemetry::default();
    let payload = vec![0u8; 1024];

    let start = tokio::time::Instant::now();
    controller.enqueue(&payload, &mut framer, &env, &telemetry).await.unwrap();
    let first_elapsed = start.elapsed();

    controller.enqueue(&payload, &mut framer, &env, &telemetry).await.unwrap();
    let second_elapsed = start.elapsed();

    assert!(first_elapsed < Duration::from_millis(200), "first flush should not meaningfully wait on the bucket");
    assert!(
        second_elapsed - first_elapsed >= Duration::from_millis(800),
        "second flush should wait out close to a full second of refill, waited {:?}",
        second_elapsed - first_elapsed
    );
}

/// A protocol version mismatch is rejected during handshake processing; the
/// socket is torn down before any application message is ever delivered.
#[tokio::test]
async fn version_mismatch_tears_down_without_delivering_a_message() {
    let server = Server::bind(ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        protocol_version: Some("1.0.0".to_string()),
        ..ServerConfig::default()
    })
    .await
    .unwrap();
    let remote_addr = server.local_addr().to_string();

    let client = Client::spawn(ClientConfig {
        remote_addr,
        protocol_version: Some("2.0.0".to_string()),
        ..ClientConfig::default()
    });

    assert!(matches!(client.next_event().await, Some(ClientEvent::Connect)));
    let close = client.next_event().await;
    assert!(matches!(close, Some(ClientEvent::Close { had_error: true, .. })), "got {close:?}");

    server.shutdown().await;
}

/// Reconnecting against a closed port should fire exactly `max_attempts`
/// `Reconnecting` events, each delay following `initial_delay_ms *
/// multiplier^(attempt-1)` capped at `max_delay_ms`, then give up for good.
#[tokio::test]
async fn reconnect_storm_gives_up_after_max_attempts() {
    let probe =
        Server::bind(ServerConfig { bind_addr: "127.0.0.1:0".parse().unwrap(), ..ServerConfig::default() })
            .await
            .unwrap();
    let remote_addr = probe.local_addr().to_string();
    probe.shutdown().await;

    let client = Client::spawn(ClientConfig {
        remote_addr,
        reconnect: qwormhole_client::ReconnectConfig {
            enabled: true,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 2.0,
            max_attempts: Some(3),
        },
        ..ClientConfig::default()
    });

    let mut attempts = Vec::new();
    loop {
        match client.next_event().await {
            Some(ClientEvent::Reconnecting { attempt, delay }) => attempts.push((attempt, delay)),
            Some(ClientEvent::Error(_) | ClientEvent::Close { .. }) | None => break,
            Some(_) => {},
        }
    }

    assert_eq!(attempts.len(), 3);
    for (i, (attempt, delay)) in attempts.iter().enumerate() {
        assert_eq!(*attempt, u32::try_from(i + 1).unwrap());
        let expected_ms = (10.0 * 2f64.powi(i32::try_from(i).unwrap())).min(100.0) as u64;
        assert!(
            delay.as_millis().abs_diff(u128::from(expected_ms)) <= 1,
            "attempt {attempt}: expected ~{expected_ms}ms, got {delay:?}"
        );
    }
}

/// A peer that completes the handshake and then closes its write half
/// cleanly (no socket error) is not a user-initiated disconnect, so the
/// client must still schedule a reconnect even though `had_error` on the
/// resulting `Close` is `false`.
#[tokio::test]
async fn graceful_peer_close_after_handshake_still_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let handshake = HandshakePayload::new(None).to_json_bytes().unwrap();
            let mut framed = bytes::BytesMut::new();
            encode_frame(&handshake, &mut framed);
            let _ = socket.write_all(&framed).await;
            let _ = socket.shutdown().await;
        }
    });

    let client = Client::spawn(ClientConfig {
        remote_addr,
        reconnect: qwormhole_client::ReconnectConfig {
            enabled: true,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 2.0,
            max_attempts: Some(1),
        },
        ..ClientConfig::default()
    });

    assert!(matches!(client.next_event().await, Some(ClientEvent::Connect)));
    assert!(matches!(client.next_event().await, Some(ClientEvent::Ready)));

    let close = client.next_event().await;
    assert!(matches!(close, Some(ClientEvent::Close { had_error: false, .. })), "got {close:?}");

    let reconnecting = client.next_event().await;
    assert!(
        matches!(reconnecting, Some(ClientEvent::Reconnecting { attempt: 1, .. })),
        "graceful non-user-initiated close should still trigger a reconnect attempt, got {reconnecting:?}"
    );
}
