//! Common test utilities
//!
//! Node factories with short timers, a polling helper and hand-built base
//! protocol messages for raw-connection tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use diam_node::{
    app_id, avp_code, base_cmd, Application, ApplicationBuilder, Avp, DiameterMessage,
    DiameterResult, Node, NodeConfig, Peer, ResultCode, TimerConfig, DIAMETER_EAP_CMD,
};

pub const TEST_REALM: &str = "test.realm";
pub const SERVER_HOST: &str = "server.test.realm";
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Timers short enough for reconnect and shutdown tests
pub fn fast_timers() -> TimerConfig {
    TimerConfig {
        watchdog_interval_ms: 30_000,
        watchdog_answer_timeout_ms: 1_000,
        capabilities_timeout_ms: 1_000,
        connect_timeout_ms: 1_000,
        reconnect_base_ms: 100,
        reconnect_max_ms: 400,
        request_timeout_ms: 2_000,
        shutdown_grace_ms: 1_000,
    }
}

pub fn client_host(number: usize) -> String {
    format!("client{number}.{TEST_REALM}")
}

/// A port nothing listens on
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind((LOOPBACK, 0)).expect("bind probe socket");
    listener.local_addr().expect("probe address").port()
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn answer_success(app: &Application, request: &DiameterMessage) -> Option<DiameterMessage> {
    Some(app.generate_answer(request, ResultCode::Success))
}

pub struct TestServer {
    pub node: Node,
    pub app: Arc<Application>,
    pub addr: SocketAddr,
}

/// Server node on `port` (0 for any) accepting `clients` client identities,
/// serving one application built from `app`
pub async fn start_server(port: u16, clients: usize, app: ApplicationBuilder) -> TestServer {
    let config = NodeConfig::new(SERVER_HOST, TEST_REALM)
        .listen_on(vec![LOOPBACK], Some(port))
        .with_timers(fast_timers());
    let node = Node::new(config).expect("server node");

    let mut peers = Vec::with_capacity(clients);
    for number in 0..clients {
        let peer = node
            .add_peer(&format!("aaa://{}", client_host(number)), None, &[], false)
            .await
            .expect("add client peer");
        peers.push(peer);
    }

    let app = app.build().expect("server application");
    node.add_application(&app, &peers).await.expect("bind server application");
    node.start().await.expect("start server");
    let addr = node.listen_addrs()[0];

    TestServer { node, app, addr }
}

pub struct TestClient {
    pub node: Node,
    pub peer: Arc<Peer>,
    pub app: Arc<Application>,
}

/// Client node `number` with one peer towards `server` and an EAP
/// application bound to it. Call `node.start()` (persistent) or
/// `node.connect(&peer)` to bring the peer up.
pub async fn client(number: usize, server: SocketAddr, persistent: bool) -> TestClient {
    client_with_timers(number, server, persistent, fast_timers()).await
}

pub async fn client_with_timers(
    number: usize,
    server: SocketAddr,
    persistent: bool,
    timers: TimerConfig,
) -> TestClient {
    let config = NodeConfig::new(client_host(number), TEST_REALM).with_timers(timers);
    let node = Node::new(config).expect("client node");
    let peer = node
        .add_peer(
            &format!("aaa://{SERVER_HOST}:{}", server.port()),
            None,
            &[server.ip()],
            persistent,
        )
        .await
        .expect("add server peer");

    let app = Application::builder(app_id::EAP)
        .auth()
        .build()
        .expect("client application");
    node.add_application(&app, &[peer.clone()]).await.expect("bind client application");

    TestClient { node, peer, app }
}

/// DER-shaped request addressed to the test server
pub fn eap_request(app: &Application) -> DiameterResult<DiameterMessage> {
    Ok(app
        .new_request(DIAMETER_EAP_CMD)?
        .with_avp(Avp::identity(avp_code::DESTINATION_REALM, TEST_REALM))
        .with_avp(Avp::identity(avp_code::DESTINATION_HOST, SERVER_HOST))
        .with_avp(Avp::unsigned32(avp_code::AUTH_APPLICATION_ID, app_id::EAP)))
}

/// CER as a remote node would send it
pub fn raw_cer(origin_host: &str, hop_by_hop_id: u32) -> DiameterMessage {
    let mut cer = DiameterMessage::new_request(base_cmd::CAPABILITIES_EXCHANGE, app_id::BASE)
        .with_avp(Avp::identity(avp_code::ORIGIN_HOST, origin_host))
        .with_avp(Avp::identity(avp_code::ORIGIN_REALM, TEST_REALM))
        .with_avp(Avp::unsigned32(avp_code::VENDOR_ID, 0))
        .with_avp(Avp::unsigned32(avp_code::AUTH_APPLICATION_ID, app_id::EAP));
    cer.header.hop_by_hop_id = hop_by_hop_id;
    cer.header.end_to_end_id = hop_by_hop_id;
    cer
}

/// Successful CEA advertising EAP
pub fn raw_cea(cer: &DiameterMessage, origin_host: &str) -> DiameterMessage {
    DiameterMessage::answer_with_result(cer, origin_host, TEST_REALM, ResultCode::Success, None)
        .with_avp(Avp::unsigned32(avp_code::AUTH_APPLICATION_ID, app_id::EAP))
}
