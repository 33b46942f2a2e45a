//! Peer lifecycle: reconnect, watchdog, capabilities rejection, malformed
//! traffic, shutdown

use std::time::Duration;

use diam_node::{
    answer_result, app_id, avp_code, base_cmd, Application, DiameterError, DiameterListener,
    DiameterMessage, DiameterTransport, PeerState, ResultCode, TimerConfig,
};

use crate::common::*;

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_persistent_peer_reconnects_after_server_restart() {
    init_logging();
    let server = start_server(0, 1, Application::builder(app_id::EAP).handler(answer_success)).await;
    let port = server.addr.port();

    let client = client(0, server.addr, true).await;
    client.node.start().await.unwrap();
    assert!(client.peer.wait_for_state(PeerState::Open, OPEN_TIMEOUT).await);

    server.node.stop().await;
    drop(server);
    assert!(wait_until(OPEN_TIMEOUT, || !client.peer.is_open()).await);

    // Reconnect attempts fail while nothing listens
    assert!(wait_until(OPEN_TIMEOUT, || client.peer.stats().connect_attempts >= 2).await);

    let server = start_server(port, 1, Application::builder(app_id::EAP).handler(answer_success)).await;
    assert!(client.peer.wait_for_state(PeerState::Open, OPEN_TIMEOUT).await);
    client.app.wait_for_ready(Some(OPEN_TIMEOUT)).await.unwrap();

    let answer = client.app.send_request(eap_request(&client.app).unwrap()).await.unwrap();
    assert_eq!(answer_result(&answer), Some(ResultCode::Success));

    client.node.stop().await;
    server.node.stop().await;
}

#[tokio::test]
async fn test_non_persistent_peer_stays_closed() {
    init_logging();
    let server = start_server(
        0,
        1,
        Application::builder(app_id::EAP).handler(|_app: &Application, _req: &DiameterMessage| None),
    )
    .await;

    let client = client(0, server.addr, false).await;
    client.node.start().await.unwrap();
    // start() only connects persistent peers
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.peer.state(), PeerState::Closed);

    client.node.connect(&client.peer).await.unwrap();
    client.app.wait_for_ready(Some(OPEN_TIMEOUT)).await.unwrap();

    // A request blocked on the peer fails when the connection goes away
    let app = client.app.clone();
    let blocked = tokio::spawn(async move {
        let request = eap_request(&app)?;
        app.send_request_with_timeout(request, Duration::from_secs(10)).await
    });
    assert!(wait_until(OPEN_TIMEOUT, || server.app.stats().requests_received == 1).await);
    server.node.stop().await;

    let err = blocked.await.unwrap().unwrap_err();
    assert!(matches!(err, DiameterError::PeerUnavailable(_)), "{err}");

    assert!(client.peer.wait_for_state(PeerState::Closed, OPEN_TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.peer.state(), PeerState::Closed);
    assert_eq!(client.peer.stats().connect_attempts, 1);

    let err = client
        .app
        .send_request(eap_request(&client.app).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, DiameterError::PeerUnavailable(_)));
    assert_eq!(client.app.pending_count(), 0);

    client.node.stop().await;
}

#[tokio::test]
async fn test_wait_for_ready_times_out_without_server() {
    init_logging();
    let nowhere = (LOOPBACK, unused_port()).into();
    let client = client(0, nowhere, true).await;
    client.node.start().await.unwrap();

    let err = client
        .app
        .wait_for_ready(Some(Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(matches!(err, DiameterError::NotReady(_)));
    assert!(!client.peer.is_open());
    assert!(client.peer.stats().connect_attempts >= 1);

    client.node.stop().await;
}

#[tokio::test]
async fn test_watchdog_expires_on_silent_peer() {
    init_logging();

    // Completes the capabilities exchange, then never says another word
    let listener = DiameterListener::bind((LOOPBACK, 0).into()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let mut transport = listener.accept().await.unwrap();
        let cer = transport.recv().await.unwrap();
        transport.send(&raw_cea(&cer, SERVER_HOST)).await.unwrap();
        let mut dwrs = 0;
        while let Ok(msg) = transport.recv().await {
            if msg.command_code() == base_cmd::DEVICE_WATCHDOG && msg.is_request() {
                dwrs += 1;
            }
        }
        dwrs
    });

    let timers = TimerConfig {
        watchdog_interval_ms: 200,
        watchdog_answer_timeout_ms: 200,
        ..fast_timers()
    };
    let client = client_with_timers(0, addr, false, timers).await;
    client.node.start().await.unwrap();
    client.node.connect(&client.peer).await.unwrap();
    assert!(client.peer.wait_for_state(PeerState::Open, OPEN_TIMEOUT).await);

    assert!(client.peer.wait_for_state(PeerState::Closed, OPEN_TIMEOUT).await);
    let stats = client.peer.stats();
    assert_eq!(stats.watchdogs_sent, 2);
    assert_eq!(stats.watchdog_expirations, 1);
    assert_eq!(silent.await.unwrap(), 2);

    client.node.stop().await;
}

#[tokio::test]
async fn test_watchdog_answered_keeps_peer_open() {
    init_logging();
    let server = start_server(0, 1, Application::builder(app_id::EAP).handler(answer_success)).await;

    let timers = TimerConfig {
        watchdog_interval_ms: 100,
        watchdog_answer_timeout_ms: 100,
        ..fast_timers()
    };
    let client = client_with_timers(0, server.addr, true, timers).await;
    client.node.start().await.unwrap();
    assert!(client.peer.wait_for_state(PeerState::Open, OPEN_TIMEOUT).await);

    assert!(wait_until(OPEN_TIMEOUT, || client.peer.stats().watchdogs_sent >= 3).await);
    assert!(client.peer.is_open());
    assert_eq!(client.peer.stats().watchdog_expirations, 0);
    assert!(client.peer.last_activity().is_some());

    client.node.stop().await;
    server.node.stop().await;
}

#[tokio::test]
async fn test_unknown_peer_gets_unknown_peer_cea() {
    init_logging();
    let server = start_server(0, 1, Application::builder(app_id::EAP).handler(answer_success)).await;

    let mut transport = DiameterTransport::connect(server.addr).await.unwrap();
    let cer = raw_cer("intruder.test.realm", 0x77);
    transport.send(&cer).await.unwrap();

    let cea = transport.recv().await.unwrap();
    assert!(cea.is_answer());
    assert_eq!(cea.command_code(), base_cmd::CAPABILITIES_EXCHANGE);
    assert_eq!(cea.hop_by_hop_id(), 0x77);
    assert_eq!(answer_result(&cea), Some(ResultCode::UnknownPeer));
    assert!(cea.header.is_error());
    assert_eq!(
        cea.find_avp(avp_code::ORIGIN_HOST).and_then(|a| a.as_utf8_string()),
        Some(SERVER_HOST)
    );

    // The server hangs up afterwards
    assert!(transport.recv().await.is_err());

    server.node.stop().await;
}

#[tokio::test]
async fn test_second_connection_for_open_peer_is_refused() {
    init_logging();
    let server = start_server(0, 1, Application::builder(app_id::EAP).handler(answer_success)).await;
    let client = client(0, server.addr, true).await;
    client.node.start().await.unwrap();
    assert!(client.peer.wait_for_state(PeerState::Open, OPEN_TIMEOUT).await);

    let mut transport = DiameterTransport::connect(server.addr).await.unwrap();
    transport.send(&raw_cer(&client_host(0), 1)).await.unwrap();
    let cea = transport.recv().await.unwrap();
    assert_eq!(answer_result(&cea), Some(ResultCode::UnableToComply));

    // The established connection is untouched
    let answer = client.app.send_request(eap_request(&client.app).unwrap()).await.unwrap();
    assert_eq!(answer_result(&answer), Some(ResultCode::Success));

    client.node.stop().await;
    server.node.stop().await;
}

#[tokio::test]
async fn test_rejected_capabilities_are_not_retried() {
    init_logging();
    // The server does not know client7
    let server = start_server(0, 1, Application::builder(app_id::EAP).handler(answer_success)).await;
    let client = client(7, server.addr, true).await;
    client.node.start().await.unwrap();

    let err = client
        .app
        .wait_for_ready(Some(Duration::from_millis(500)))
        .await
        .unwrap_err();
    assert!(matches!(err, DiameterError::NotReady(_)));
    assert_eq!(client.peer.state(), PeerState::Closed);
    assert_eq!(client.peer.stats().connect_attempts, 1);

    client.node.stop().await;
    server.node.stop().await;
}

#[tokio::test]
async fn test_no_common_application_is_rejected() {
    init_logging();
    let server = start_server(0, 1, Application::builder(app_id::NASREQ).handler(answer_success)).await;

    let mut transport = DiameterTransport::connect(server.addr).await.unwrap();
    // Advertises EAP only
    transport.send(&raw_cer(&client_host(0), 9)).await.unwrap();
    let cea = transport.recv().await.unwrap();
    assert_eq!(answer_result(&cea), Some(ResultCode::NoCommonApplication));
    assert_eq!(cea.auth_application_ids(), vec![app_id::NASREQ]);

    let peer = server.node.peers().get(&client_host(0)).await.unwrap();
    assert_eq!(peer.state(), PeerState::Closed);

    server.node.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_pending_requests() {
    init_logging();
    let server = start_server(
        0,
        1,
        Application::builder(app_id::EAP).handler(|_app: &Application, _req: &DiameterMessage| None),
    )
    .await;
    let client = client(0, server.addr, true).await;
    client.node.start().await.unwrap();
    client.app.wait_for_ready(Some(OPEN_TIMEOUT)).await.unwrap();

    let app = client.app.clone();
    let blocked = tokio::spawn(async move {
        let request = eap_request(&app)?;
        app.send_request_with_timeout(request, Duration::from_secs(10)).await
    });
    assert!(wait_until(OPEN_TIMEOUT, || client.app.pending_count() == 1).await);

    client.node.stop().await;
    let err = blocked.await.unwrap().unwrap_err();
    assert!(matches!(err, DiameterError::ShuttingDown));
    assert_eq!(client.peer.state(), PeerState::Closed);

    // Everything after stop fails fast
    assert!(matches!(
        client.app.wait_for_ready(Some(Duration::from_secs(1))).await,
        Err(DiameterError::ShuttingDown)
    ));
    assert!(matches!(
        client.app.send_request(eap_request(&client.app).unwrap()).await,
        Err(DiameterError::ShuttingDown)
    ));

    // The server saw the DPR and closed its side
    let server_peer = server.node.peers().get(&client_host(0)).await.unwrap();
    assert!(server_peer.wait_for_state(PeerState::Closed, OPEN_TIMEOUT).await);

    server.node.stop().await;
}

#[tokio::test]
async fn test_malformed_message_closes_without_reconnect() {
    init_logging();

    // Completes the capabilities exchange, then sends a header with a bad version
    let listener = DiameterListener::bind((LOOPBACK, 0).into()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let garbled = tokio::spawn(async move {
        let mut transport = listener.accept().await.unwrap();
        let cer = transport.recv().await.unwrap();
        transport.send(&raw_cea(&cer, SERVER_HOST)).await.unwrap();

        let mut bad = DiameterMessage::new_request(base_cmd::DEVICE_WATCHDOG, app_id::BASE);
        bad.header.version = 2;
        transport.send(&bad).await.unwrap();

        // The client hangs up; a second connection would be accepted here
        let _ = transport.recv().await;
        tokio::time::timeout(Duration::from_millis(800), listener.accept())
            .await
            .is_ok()
    });

    let client = client(0, addr, true).await;
    client.node.start().await.unwrap();
    assert!(client.peer.wait_for_state(PeerState::Open, OPEN_TIMEOUT).await);
    assert!(client.peer.wait_for_state(PeerState::Closed, OPEN_TIMEOUT).await);

    // Persistent, yet not retried: reconnect_base is 100ms
    assert!(!garbled.await.unwrap(), "client reconnected after a malformed message");
    assert_eq!(client.peer.state(), PeerState::Closed);
    assert_eq!(client.peer.stats().connect_attempts, 1);

    client.node.stop().await;
}

#[tokio::test]
async fn test_stop_lets_inflight_pooled_request_finish() {
    init_logging();
    let server = start_server(
        0,
        1,
        Application::builder(app_id::EAP)
            .pooled(2)
            .handler(|app: &Application, req: &DiameterMessage| {
                std::thread::sleep(Duration::from_millis(300));
                Some(app.generate_answer(req, ResultCode::Success))
            }),
    )
    .await;
    let client = client(0, server.addr, true).await;
    client.node.start().await.unwrap();
    client.app.wait_for_ready(Some(OPEN_TIMEOUT)).await.unwrap();

    let app = client.app.clone();
    let inflight = tokio::spawn(async move {
        let request = eap_request(&app)?;
        app.send_request(request).await
    });
    assert!(wait_until(OPEN_TIMEOUT, || server.app.stats().requests_received == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.node.stop().await;

    // The answer went out before the server disconnected
    let answer = inflight.await.unwrap().unwrap();
    assert_eq!(answer_result(&answer), Some(ResultCode::Success));
    assert_eq!(server.app.stats().answers_sent, 1);

    // New work is refused once stop has begun
    assert!(matches!(
        server.app.send_request(eap_request(&server.app).unwrap()).await,
        Err(DiameterError::ShuttingDown)
    ));

    client.node.stop().await;
}
