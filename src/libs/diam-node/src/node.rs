//! Diameter node: peer table, listeners, outbound connections and inbound
//! routing
//!
//! ```no_run
//! use diam_node::{app_id, Application, Node, ResultCode};
//!
//! # async fn run() -> diam_node::DiameterResult<()> {
//! let node = Node::with_identity("server.test.realm", "test.realm")?;
//! let client = node
//!     .add_peer("aaa://client0.test.realm", None, &[], false)
//!     .await?;
//! let eap = Application::builder(app_id::EAP)
//!     .pooled(8)
//!     .handler(|app, req| Some(app.generate_answer(req, ResultCode::Success)))
//!     .build()?;
//! node.add_application(&eap, &[client]).await?;
//! node.start().await?;
//! # node.stop().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::application::{join_with_grace, Application, ApplicationRole, Binding};
use crate::config::NodeConfig;
use crate::error::{DiameterError, DiameterResult, ResultCode};
use crate::message::DiameterMessage;
use crate::peer::base::LocalIdentity;
use crate::peer::connection::{self, wait_shutdown};
use crate::peer::{Peer, PeerTable};
use crate::session::{unix_seconds, IdSequence, SessionIdGenerator};
use crate::transport::DiameterListener;
use crate::uri::{PeerUri, TransportProtocol, UriScheme};

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// State shared by the node handle and its connection tasks
pub(crate) struct NodeContext {
    pub config: NodeConfig,
    pub local: LocalIdentity,
    pub sessions: Arc<SessionIdGenerator>,
    pub ids: Arc<IdSequence>,
    pub peers: PeerTable,
    /// (application id, peer identity) -> application
    routes: RwLock<HashMap<(u32, String), Arc<Application>>>,
    applications: Mutex<Vec<Arc<Application>>>,
    shutdown: watch::Sender<bool>,
    /// Set when `stop()` begins, before connections are told to close
    stopping: AtomicBool,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listen_addrs: Mutex<Vec<SocketAddr>>,
}

impl NodeContext {
    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire) || *self.shutdown.borrow()
    }

    /// Spawn a node-owned task; `stop()` waits for it
    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn lookup(&self, application_id: u32, peer: &str) -> Option<Arc<Application>> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.get(&(application_id, peer.to_string())).cloned()
    }

    /// Applications bound to `peer`, as advertised in CER/CEA
    pub(crate) fn local_applications(&self, peer: &Peer) -> Vec<(u32, ApplicationRole)> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        let mut apps: Vec<(u32, ApplicationRole)> = routes
            .iter()
            .filter(|((_, identity), _)| identity == peer.identity())
            .map(|((id, _), app)| (*id, app.role()))
            .collect();
        apps.sort_unstable_by_key(|(id, _)| *id);
        apps
    }

    fn applications_for(&self, peer: &Peer) -> Vec<Arc<Application>> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes
            .iter()
            .filter(|((_, identity), _)| identity == peer.identity())
            .map(|(_, app)| app.clone())
            .collect()
    }

    /// Deliver an application message received on `peer`
    pub(crate) async fn route(&self, peer: &Arc<Peer>, msg: DiameterMessage) {
        let app = self.lookup(msg.application_id(), peer.identity());
        match (app, msg.is_request()) {
            (Some(app), true) => app.dispatch(peer, msg).await,
            (Some(app), false) => app.resolve_answer(peer, msg),
            (None, true) => {
                let err = DiameterError::Routing {
                    application_id: msg.application_id(),
                    peer: peer.identity().to_string(),
                };
                log::warn!("{err}, rejecting {msg}");
                let answer = DiameterMessage::answer_with_result(
                    &msg,
                    &self.config.origin_host,
                    &self.config.realm,
                    ResultCode::UnableToDeliver,
                    Some("no application registered"),
                );
                if let Err(e) = peer.try_send(answer) {
                    log::debug!("[{}] routing error answer not sent: {e}", peer.identity());
                }
            }
            (None, false) => {
                log::debug!("[{}] dropping unroutable answer {}", peer.identity(), msg);
            }
        }
    }

    pub(crate) fn peer_opened(&self, peer: &Peer) {
        for app in self.applications_for(peer) {
            app.refresh_ready();
        }
    }

    pub(crate) fn peer_closed(&self, peer: &Peer) {
        for app in self.applications_for(peer) {
            app.peer_closed(peer);
        }
    }

    fn spawn_outbound(self: &Arc<Self>, peer: Arc<Peer>) {
        if !peer.claim_driver() {
            log::debug!("[{}] already being connected", peer.identity());
            return;
        }
        self.spawn(connection::run_outbound(self.clone(), peer));
    }
}

async fn accept_loop(ctx: Arc<NodeContext>, listener: DiameterListener) {
    let mut shutdown = ctx.shutdown_rx();
    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok(transport) => {
                    log::debug!("accepted connection from {}", transport.peer_addr());
                    ctx.spawn(connection::run_inbound(ctx.clone(), transport));
                }
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }
}

/// A Diameter node
pub struct Node {
    ctx: Arc<NodeContext>,
}

impl Node {
    /// Create a node from a validated configuration. Peers listed in the
    /// configuration are not registered; see [`Node::from_config`].
    pub fn new(config: NodeConfig) -> DiameterResult<Self> {
        config.validate()?;

        let local = LocalIdentity {
            origin_host: config.origin_host.clone(),
            origin_realm: config.realm.clone(),
            vendor_id: config.vendor_id,
            product_name: config.product_name.clone(),
            origin_state_id: unix_seconds(),
        };
        let (shutdown, _) = watch::channel(false);
        let ctx = NodeContext {
            sessions: Arc::new(SessionIdGenerator::new(config.origin_host.clone())),
            ids: Arc::new(IdSequence::new()),
            peers: PeerTable::new(),
            routes: RwLock::new(HashMap::new()),
            applications: Mutex::new(Vec::new()),
            shutdown,
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            listen_addrs: Mutex::new(Vec::new()),
            local,
            config,
        };
        Ok(Self { ctx: Arc::new(ctx) })
    }

    /// Client-role node with default settings
    pub fn with_identity(origin_host: &str, realm: &str) -> DiameterResult<Self> {
        Self::new(NodeConfig::new(origin_host, realm))
    }

    /// Create a node and register the peers listed in `config`
    pub async fn from_config(config: NodeConfig) -> DiameterResult<Self> {
        let peers = config.peers.clone();
        let node = Self::new(config)?;
        for peer in peers {
            node.add_peer(&peer.uri, peer.realm.as_deref(), &peer.addresses, peer.persistent)
                .await?;
        }
        Ok(node)
    }

    pub fn origin_host(&self) -> &str {
        &self.ctx.config.origin_host
    }

    pub fn realm(&self) -> &str {
        &self.ctx.config.realm
    }

    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    pub fn peers(&self) -> &PeerTable {
        &self.ctx.peers
    }

    /// The node's Session-Id generator
    pub fn session_ids(&self) -> &Arc<SessionIdGenerator> {
        &self.ctx.sessions
    }

    /// Register a peer in Closed state.
    ///
    /// `realm` defaults to the local realm. An empty `addresses` list means
    /// the URI's FQDN is resolved at connect time. A persistent peer added
    /// after [`start`](Self::start) is connected right away.
    pub async fn add_peer(
        &self,
        uri: &str,
        realm: Option<&str>,
        addresses: &[IpAddr],
        persistent: bool,
    ) -> DiameterResult<Arc<Peer>> {
        let uri = PeerUri::parse(uri)?;
        if uri.transport == TransportProtocol::Sctp {
            return Err(DiameterError::Config(format!(
                "peer {}: SCTP transport is not supported",
                uri.fqdn
            )));
        }
        if uri.scheme == UriScheme::Aaas {
            return Err(DiameterError::Config(format!(
                "peer {}: aaas:// (TLS) is not supported",
                uri.fqdn
            )));
        }
        if uri.fqdn.eq_ignore_ascii_case(&self.ctx.config.origin_host) {
            return Err(DiameterError::Config(format!(
                "peer {} is the local node",
                uri.fqdn
            )));
        }

        let realm = realm.unwrap_or(&self.ctx.config.realm).to_string();
        let peer = Arc::new(Peer::new(uri, realm, addresses.to_vec(), persistent));
        self.ctx.peers.insert(peer.clone()).await?;
        log::debug!("[{}] peer added (persistent: {})", peer.identity(), persistent);

        if persistent && self.is_running() {
            self.ctx.spawn_outbound(peer.clone());
        }
        Ok(peer)
    }

    /// Bind `app` to `peers`.
    ///
    /// Fails if a peer was not added to this node, if another application
    /// already serves the same application id on one of the peers, or if
    /// `app` is already bound.
    pub async fn add_application(
        &self,
        app: &Arc<Application>,
        peers: &[Arc<Peer>],
    ) -> DiameterResult<()> {
        if app.is_attached() {
            return Err(DiameterError::AlreadyAttached(app.application_id()));
        }
        if self.ctx.is_stopping() {
            return Err(DiameterError::ShuttingDown);
        }

        let mut bound: Vec<Arc<Peer>> = Vec::with_capacity(peers.len());
        for peer in peers {
            match self.ctx.peers.get(peer.identity()).await {
                Some(known) if Arc::ptr_eq(&known, peer) => {}
                _ => return Err(DiameterError::UnknownPeer(peer.identity().to_string())),
            }
            if !bound.iter().any(|p| Arc::ptr_eq(p, peer)) {
                bound.push(peer.clone());
            }
        }

        let id = app.application_id();
        let mut routes = self.ctx.routes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(peer) = bound
            .iter()
            .find(|p| routes.contains_key(&(id, p.identity().to_string())))
        {
            return Err(DiameterError::DuplicateApplication {
                application_id: id,
                peer: peer.identity().to_string(),
            });
        }

        app.attach(Binding {
            origin_host: self.ctx.config.origin_host.clone(),
            origin_realm: self.ctx.config.realm.clone(),
            peers: bound.clone(),
            sessions: self.ctx.sessions.clone(),
            ids: self.ctx.ids.clone(),
            shutdown: self.ctx.shutdown_rx(),
            default_timeout: self.ctx.config.timers.request_timeout(),
        })?;
        for peer in &bound {
            routes.insert((id, peer.identity().to_string()), app.clone());
        }
        drop(routes);

        self.ctx
            .applications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(app.clone());
        log::info!(
            "application {} ({:?}, {:?}) bound to {} peer(s)",
            id,
            app.role(),
            app.strategy(),
            bound.len()
        );
        Ok(())
    }

    /// Start listening (if listen addresses are configured) and connect
    /// every persistent peer. Calling it again is a no-op.
    pub async fn start(&self) -> DiameterResult<()> {
        if self.ctx.is_stopping() {
            return Err(DiameterError::ShuttingDown);
        }
        if self.ctx.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let port = self.ctx.config.listen_port();
        let mut listeners = Vec::with_capacity(self.ctx.config.listen_addresses.len());
        for ip in &self.ctx.config.listen_addresses {
            let bound = match DiameterListener::bind(SocketAddr::new(*ip, port)).await {
                Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
                Err(e) => Err(e),
            };
            match bound {
                Ok(pair) => listeners.push(pair),
                Err(e) => {
                    self.ctx.started.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        }

        for (listener, addr) in listeners {
            log::info!("{} listening on {}", self.origin_host(), addr);
            self.ctx
                .listen_addrs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(addr);
            self.ctx.spawn(accept_loop(self.ctx.clone(), listener));
        }

        for peer in self.ctx.peers.all().await {
            if peer.is_persistent() {
                self.ctx.spawn_outbound(peer);
            }
        }
        Ok(())
    }

    /// Connect to `peer` now. Non-persistent peers get a single attempt.
    pub async fn connect(&self, peer: &Arc<Peer>) -> DiameterResult<()> {
        if self.ctx.is_stopping() {
            return Err(DiameterError::ShuttingDown);
        }
        match self.ctx.peers.get(peer.identity()).await {
            Some(known) if Arc::ptr_eq(&known, peer) => {
                self.ctx.spawn_outbound(known);
                Ok(())
            }
            _ => Err(DiameterError::UnknownPeer(peer.identity().to_string())),
        }
    }

    /// Bound listener addresses (resolves port 0)
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.ctx
            .listen_addrs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.ctx.started.load(Ordering::Acquire) && !self.ctx.is_stopping()
    }

    /// Stop the node.
    ///
    /// Pending requests fail with [`DiameterError::ShuttingDown`] and pooled
    /// applications stop taking work. Requests already queued or running get
    /// `shutdown_grace_ms` to finish while their peers are still Open, so
    /// their answers go out. Then listeners close, Open peers get a DPR, and
    /// connection tasks get another `shutdown_grace_ms` before they are
    /// aborted.
    pub async fn stop(&self) {
        if self.ctx.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("{} stopping", self.origin_host());
        let grace = self.ctx.config.timers.shutdown_grace();

        let apps = self
            .ctx
            .applications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for app in &apps {
            app.shutdown();
        }
        for app in &apps {
            app.join(grace).await;
        }

        self.ctx.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.ctx.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        join_with_grace(tasks, grace).await;

        for peer in self.ctx.peers.all().await {
            if peer.force_closed() {
                self.ctx.peer_closed(&peer);
            }
        }
        log::info!("{} stopped", self.origin_host());
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.ctx.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("origin_host", &self.ctx.config.origin_host)
            .field("realm", &self.ctx.config.realm)
            .field("running", &self.is_running())
            .finish()
    }
}
