//! Pooled dispatch backpressure

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use diam_node::{answer_result, app_id, Application, DiameterMessage, ResultCode};

use crate::common::*;

#[tokio::test]
async fn test_full_queue_answers_too_busy() {
    init_logging();
    const QUEUE: usize = 2;

    // Workers block until the test releases them
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Arc::new(Mutex::new(release_rx));
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel::<u32>();

    let server = start_server(
        0,
        1,
        Application::builder(app_id::EAP)
            .pooled_with_queue(1, QUEUE)
            .handler(move |app: &Application, req: &DiameterMessage| {
                let _ = started_tx.send(req.hop_by_hop_id());
                let _ = release_rx
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(10));
                Some(app.generate_answer(req, ResultCode::Success))
            }),
    )
    .await;

    let client = client(0, server.addr, true).await;
    client.node.start().await.unwrap();
    client.app.wait_for_ready(Some(Duration::from_secs(5))).await.unwrap();

    let send = |app: Arc<Application>| {
        tokio::spawn(async move {
            let request = eap_request(&app).unwrap();
            app.send_request_with_timeout(request, Duration::from_secs(10)).await
        })
    };

    // Occupy the only worker
    let first = send(client.app.clone());
    started_rx.recv().await.unwrap();

    // Q + 1 more while the worker is busy
    let rest: Vec<_> = (0..QUEUE + 1).map(|_| send(client.app.clone())).collect();
    assert!(wait_until(Duration::from_secs(5), || server.app.stats().too_busy == 1).await);

    for _ in 0..QUEUE + 1 {
        release_tx.send(()).unwrap();
    }

    let mut too_busy = 0;
    let mut success = 0;
    for call in std::iter::once(first).chain(rest) {
        let answer = call.await.unwrap().unwrap();
        match answer_result(&answer) {
            Some(ResultCode::TooBusy) => {
                assert!(answer.header.is_error());
                too_busy += 1;
            }
            Some(ResultCode::Success) => success += 1,
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert_eq!(too_busy, 1);
    assert_eq!(success, QUEUE + 1);
    assert_eq!(server.app.stats().too_busy, 1);

    client.node.stop().await;
    server.node.stop().await;
}

#[tokio::test]
async fn test_direct_dispatch_keeps_wire_order() {
    init_logging();
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = order.clone();
    let server = start_server(
        0,
        1,
        Application::builder(app_id::EAP)
            .direct()
            .handler(move |app: &Application, req: &DiameterMessage| {
                if let Some(session_id) = req.session_id() {
                    recorder.lock().unwrap().push(session_id.to_string());
                }
                Some(app.generate_answer(req, ResultCode::Success))
            }),
    )
    .await;

    let client = client(0, server.addr, true).await;
    client.node.start().await.unwrap();
    client.app.wait_for_ready(Some(Duration::from_secs(5))).await.unwrap();

    let mut sent = Vec::new();
    for _ in 0..10 {
        let request = eap_request(&client.app).unwrap();
        sent.push(request.session_id().unwrap().to_string());
        client.app.send_request(request).await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), sent);

    client.node.stop().await;
    server.node.stop().await;
}
