//! Request/answer correlation and inbound routing between two nodes

use std::sync::{Arc, Mutex};
use std::time::Duration;

use diam_node::{
    answer_result, app_id, Application, DiameterError, DiameterMessage, PeerState, ResultCode,
};

use crate::common::*;

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_answer_matches_request() {
    init_logging();

    // Server records what it received so the answer can be checked against it
    let seen: Arc<Mutex<Vec<(u32, u32, Option<String>)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let server = start_server(
        0,
        1,
        Application::builder(app_id::EAP)
            .pooled(4)
            .handler(move |app: &Application, req: &DiameterMessage| {
                recorder.lock().unwrap().push((
                    req.hop_by_hop_id(),
                    req.end_to_end_id(),
                    req.session_id().map(str::to_string),
                ));
                Some(app.generate_answer(req, ResultCode::Success))
            }),
    )
    .await;

    let client = client(0, server.addr, true).await;
    client.node.start().await.unwrap();
    client.app.wait_for_ready(Some(OPEN_TIMEOUT)).await.unwrap();
    assert_eq!(client.peer.state(), PeerState::Open);
    assert_eq!(client.peer.common_applications(), vec![app_id::EAP]);

    let request = eap_request(&client.app).unwrap();
    let session_id = request.session_id().map(str::to_string);
    let answer = client.app.send_request(request).await.unwrap();

    assert!(answer.is_answer());
    assert_eq!(answer.origin_host(), Some(SERVER_HOST));
    assert_eq!(answer_result(&answer), Some(ResultCode::Success));

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    let (hop_by_hop_id, end_to_end_id, server_session) = &seen[0];
    assert_eq!(answer.hop_by_hop_id(), *hop_by_hop_id);
    assert_eq!(answer.end_to_end_id(), *end_to_end_id);
    assert_eq!(server_session, &session_id);
    assert_eq!(answer.session_id().map(str::to_string), session_id);

    let stats = client.app.stats();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.answers_received, 1);
    assert_eq!(client.app.pending_count(), 0);

    client.node.stop().await;
    server.node.stop().await;
}

#[tokio::test]
async fn test_many_requests_on_one_connection() {
    init_logging();
    let server = start_server(0, 1, Application::builder(app_id::EAP).pooled(8).handler(answer_success)).await;
    let client = client(0, server.addr, true).await;
    client.node.start().await.unwrap();
    client.app.wait_for_ready(Some(OPEN_TIMEOUT)).await.unwrap();

    let mut calls = Vec::new();
    for _ in 0..20 {
        let app = client.app.clone();
        calls.push(tokio::spawn(async move {
            let request = eap_request(&app)?;
            let session_id = request.session_id().map(str::to_string);
            let answer = app.send_request(request).await?;
            Ok::<_, DiameterError>((session_id, answer))
        }));
    }
    for call in calls {
        let (session_id, answer) = call.await.unwrap().unwrap();
        // Each caller gets its own answer back
        assert_eq!(answer.session_id().map(str::to_string), session_id);
    }
    assert_eq!(server.app.stats().answers_sent, 20);

    client.node.stop().await;
    server.node.stop().await;
}

#[tokio::test]
async fn test_unregistered_application_is_unable_to_deliver() {
    init_logging();
    let server = start_server(0, 1, Application::builder(app_id::EAP).handler(answer_success)).await;

    // The client serves NASREQ as well; the server does not
    let client = client(0, server.addr, true).await;
    let nasreq = Application::builder(app_id::NASREQ).build().unwrap();
    client
        .node
        .add_application(&nasreq, &[client.peer.clone()])
        .await
        .unwrap();
    client.node.start().await.unwrap();
    nasreq.wait_for_ready(Some(OPEN_TIMEOUT)).await.unwrap();

    let request = nasreq.new_request(265).unwrap();
    let session_id = request.session_id().map(str::to_string);
    let answer = nasreq.send_request(request).await.unwrap();

    assert_eq!(answer_result(&answer), Some(ResultCode::UnableToDeliver));
    assert!(answer.header.is_error());
    assert_eq!(answer.application_id(), app_id::NASREQ);
    assert_eq!(answer.command_code(), 265);
    assert_eq!(answer.session_id().map(str::to_string), session_id);
    assert_eq!(answer.origin_host(), Some(SERVER_HOST));

    // The connection survives
    let answer = client.app.send_request(eap_request(&client.app).unwrap()).await.unwrap();
    assert_eq!(answer_result(&answer), Some(ResultCode::Success));

    client.node.stop().await;
    server.node.stop().await;
}

#[tokio::test]
async fn test_application_without_handler() {
    init_logging();
    let server = start_server(0, 1, Application::builder(app_id::EAP)).await;
    let client = client(0, server.addr, true).await;
    client.node.start().await.unwrap();
    client.app.wait_for_ready(Some(OPEN_TIMEOUT)).await.unwrap();

    let answer = client.app.send_request(eap_request(&client.app).unwrap()).await.unwrap();
    assert_eq!(answer_result(&answer), Some(ResultCode::CommandUnsupported));
    assert!(answer.header.is_error());

    client.node.stop().await;
    server.node.stop().await;
}

#[tokio::test]
async fn test_handler_panic_is_answered() {
    init_logging();
    let server = start_server(
        0,
        1,
        Application::builder(app_id::EAP)
            .pooled(2)
            .handler(|_app: &Application, _req: &DiameterMessage| -> Option<DiameterMessage> {
                panic!("handler failure")
            }),
    )
    .await;
    let client = client(0, server.addr, true).await;
    client.node.start().await.unwrap();
    client.app.wait_for_ready(Some(OPEN_TIMEOUT)).await.unwrap();

    for _ in 0..2 {
        let answer = client.app.send_request(eap_request(&client.app).unwrap()).await.unwrap();
        assert_eq!(answer_result(&answer), Some(ResultCode::UnableToComply));
        assert_eq!(answer.error_message(), Some("request handler failed"));
    }
    assert!(client.peer.is_open());

    client.node.stop().await;
    server.node.stop().await;
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
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

    let started = tokio::time::Instant::now();
    let err = client
        .app
        .send_request_with_timeout(eap_request(&client.app).unwrap(), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, DiameterError::CorrelationTimeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(client.app.pending_count(), 0);
    assert_eq!(client.app.stats().timeouts, 1);
    assert!(client.peer.is_open());

    client.node.stop().await;
    server.node.stop().await;
}

#[tokio::test]
async fn test_abandoned_request_leaves_no_entry() {
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

    // The caller gives up before the request deadline
    let call = client.app.send_request(eap_request(&client.app).unwrap());
    assert!(tokio::time::timeout(Duration::from_millis(100), call).await.is_err());
    assert_eq!(client.app.pending_count(), 0);

    client.node.stop().await;
    server.node.stop().await;
}
