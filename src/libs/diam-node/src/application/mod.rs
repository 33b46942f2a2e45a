//! Diameter applications: request dispatch and request/answer correlation
//!
//! An [`Application`] is built once, then bound to a set of peers with
//! [`Node::add_application`](crate::Node::add_application). Inbound requests
//! for its application id are handed to its [`RequestHandler`] according to
//! its [`DispatchStrategy`]; inbound answers resolve the matching
//! `send_request` call.

mod dispatch;
mod pending;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::watch;

use crate::avp::{Avp, AvpData};
use crate::common::avp_code;
use crate::error::{DiameterError, DiameterResult, ResultCode};
use crate::message::DiameterMessage;
use crate::peer::Peer;
use crate::session::{IdSequence, SessionIdGenerator};

pub use dispatch::DispatchStrategy;

pub(crate) use dispatch::join_with_grace;
use dispatch::{SubmitError, WorkerPool};
use pending::PendingTable;

/// Whether the application is advertised as Auth- or Acct-Application-Id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationRole {
    Auth,
    Acct,
}

/// Produces the answer for an inbound request.
///
/// Returning `None` sends nothing. Handlers run on the connection reader
/// under [`DispatchStrategy::Direct`] and on the blocking thread pool under
/// [`DispatchStrategy::Pooled`].
pub trait RequestHandler: Send + Sync {
    fn handle_request(&self, app: &Application, request: &DiameterMessage) -> Option<DiameterMessage>;
}

impl<F> RequestHandler for F
where
    F: Fn(&Application, &DiameterMessage) -> Option<DiameterMessage> + Send + Sync,
{
    fn handle_request(&self, app: &Application, request: &DiameterMessage) -> Option<DiameterMessage> {
        self(app, request)
    }
}

/// Per-application counters
#[derive(Debug, Default)]
pub struct ApplicationStats {
    pub requests_received: AtomicU64,
    pub answers_sent: AtomicU64,
    pub requests_sent: AtomicU64,
    pub answers_received: AtomicU64,
    pub timeouts: AtomicU64,
    pub too_busy: AtomicU64,
}

impl ApplicationStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ApplicationStatsSnapshot {
        ApplicationStatsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            answers_sent: self.answers_sent.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            answers_received: self.answers_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            too_busy: self.too_busy.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplicationStatsSnapshot {
    pub requests_received: u64,
    pub answers_sent: u64,
    pub requests_sent: u64,
    pub answers_received: u64,
    pub timeouts: u64,
    pub too_busy: u64,
}

/// Node resources handed to an application when it is added to a node
pub(crate) struct Binding {
    pub origin_host: String,
    pub origin_realm: String,
    pub peers: Vec<Arc<Peer>>,
    pub sessions: Arc<SessionIdGenerator>,
    pub ids: Arc<IdSequence>,
    pub shutdown: watch::Receiver<bool>,
    pub default_timeout: Duration,
}

/// A request waiting for a pooled worker
struct Job {
    peer: Arc<Peer>,
    request: DiameterMessage,
}

/// Builder for [`Application`]
pub struct ApplicationBuilder {
    application_id: u32,
    role: ApplicationRole,
    strategy: DispatchStrategy,
    request_timeout: Option<Duration>,
    handler: Option<Arc<dyn RequestHandler>>,
}

impl ApplicationBuilder {
    pub fn auth(mut self) -> Self {
        self.role = ApplicationRole::Auth;
        self
    }

    pub fn acct(mut self) -> Self {
        self.role = ApplicationRole::Acct;
        self
    }

    pub fn direct(mut self) -> Self {
        self.strategy = DispatchStrategy::Direct;
        self
    }

    /// Pooled dispatch with a queue of twice the worker count
    pub fn pooled(self, workers: usize) -> Self {
        self.pooled_with_queue(workers, workers.saturating_mul(2))
    }

    pub fn pooled_with_queue(mut self, workers: usize, queue_capacity: usize) -> Self {
        self.strategy = DispatchStrategy::Pooled {
            workers,
            queue_capacity,
        };
        self
    }

    /// Default deadline for [`Application::send_request`]; falls back to the
    /// node's `request_timeout_ms`
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Application, &DiameterMessage) -> Option<DiameterMessage> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> DiameterResult<Arc<Application>> {
        if let DispatchStrategy::Pooled {
            workers,
            queue_capacity,
        } = self.strategy
        {
            if workers == 0 || queue_capacity == 0 {
                return Err(DiameterError::Config(format!(
                    "application {}: pooled dispatch needs at least one worker and one queue slot",
                    self.application_id
                )));
            }
        }
        if self.request_timeout == Some(Duration::ZERO) {
            return Err(DiameterError::Config("request timeout must be greater than zero".into()));
        }

        let (ready, _) = watch::channel(false);
        Ok(Arc::new(Application {
            application_id: self.application_id,
            role: self.role,
            strategy: self.strategy,
            request_timeout: self.request_timeout,
            handler: self.handler,
            binding: OnceLock::new(),
            pending: PendingTable::default(),
            ready,
            pool: Mutex::new(None),
            stats: ApplicationStats::default(),
        }))
    }
}

/// A Diameter application registered on a node
pub struct Application {
    application_id: u32,
    role: ApplicationRole,
    strategy: DispatchStrategy,
    request_timeout: Option<Duration>,
    handler: Option<Arc<dyn RequestHandler>>,
    binding: OnceLock<Binding>,
    pending: PendingTable,
    ready: watch::Sender<bool>,
    pool: Mutex<Option<WorkerPool<Job>>>,
    stats: ApplicationStats,
}

impl Application {
    /// Start building an auth application with direct dispatch
    pub fn builder(application_id: u32) -> ApplicationBuilder {
        ApplicationBuilder {
            application_id,
            role: ApplicationRole::Auth,
            strategy: DispatchStrategy::Direct,
            request_timeout: None,
            handler: None,
        }
    }

    pub fn application_id(&self) -> u32 {
        self.application_id
    }

    pub fn role(&self) -> ApplicationRole {
        self.role
    }

    pub fn strategy(&self) -> DispatchStrategy {
        self.strategy
    }

    pub fn is_attached(&self) -> bool {
        self.binding.get().is_some()
    }

    /// Peers this application is bound to (empty before it is added to a node)
    pub fn peers(&self) -> &[Arc<Peer>] {
        self.binding.get().map(|b| b.peers.as_slice()).unwrap_or(&[])
    }

    pub fn stats(&self) -> ApplicationStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of `send_request` calls awaiting an answer
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn binding(&self) -> DiameterResult<&Binding> {
        self.binding
            .get()
            .ok_or(DiameterError::NotAttached(self.application_id))
    }

    fn origin(&self) -> (&str, &str) {
        match self.binding.get() {
            Some(b) => (&b.origin_host, &b.origin_realm),
            None => ("", ""),
        }
    }

    /// Next Session-Id from the node's generator
    pub fn next_session_id(&self) -> DiameterResult<String> {
        Ok(self.binding()?.sessions.next_id())
    }

    /// Proxiable request for this application carrying Session-Id,
    /// Origin-Host and Origin-Realm
    pub fn new_request(&self, command_code: u32) -> DiameterResult<DiameterMessage> {
        let binding = self.binding()?;
        let mut msg = DiameterMessage::new_request(command_code, self.application_id);
        msg.header.set_proxiable();
        msg.add_avp(Avp::utf8(avp_code::SESSION_ID, binding.sessions.next_id()));
        msg.add_avp(Avp::identity(avp_code::ORIGIN_HOST, &binding.origin_host));
        msg.add_avp(Avp::identity(avp_code::ORIGIN_REALM, &binding.origin_realm));
        Ok(msg)
    }

    /// Answer to `request` carrying the request's identifiers and
    /// Session-Id, the local Origin-Host/Origin-Realm and `result_code`.
    /// Nothing is sent.
    pub fn generate_answer(&self, request: &DiameterMessage, result_code: ResultCode) -> DiameterMessage {
        let (host, realm) = self.origin();
        DiameterMessage::answer_with_result(request, host, realm, result_code, None)
    }

    /// [`generate_answer`](Self::generate_answer) with an Error-Message AVP
    pub fn generate_answer_with_error(
        &self,
        request: &DiameterMessage,
        result_code: ResultCode,
        error_message: &str,
    ) -> DiameterMessage {
        let (host, realm) = self.origin();
        DiameterMessage::answer_with_result(request, host, realm, result_code, Some(error_message))
    }

    /// Wait until at least one bound peer is Open.
    ///
    /// `None` waits indefinitely. Fails with [`DiameterError::NotReady`] on
    /// timeout and [`DiameterError::ShuttingDown`] if the node stops.
    pub async fn wait_for_ready(&self, timeout: Option<Duration>) -> DiameterResult<()> {
        let binding = self.binding()?;
        let mut ready = self.ready.subscribe();
        let mut shutdown = binding.shutdown.clone();

        let wait = async move {
            tokio::select! {
                ready = wait_true(&mut ready) => {
                    if ready { Ok(()) } else { Err(DiameterError::ShuttingDown) }
                }
                _ = wait_true(&mut shutdown) => Err(DiameterError::ShuttingDown),
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .unwrap_or(Err(DiameterError::NotReady(limit))),
            None => wait.await,
        }
    }

    /// Send a request with the default deadline and wait for its answer.
    ///
    /// The peer is the bound Open peer named by Destination-Host, otherwise
    /// the first bound Open peer.
    pub async fn send_request(&self, request: DiameterMessage) -> DiameterResult<DiameterMessage> {
        let timeout = self.default_timeout()?;
        self.send_request_with_timeout(request, timeout).await
    }

    pub async fn send_request_with_timeout(
        &self,
        request: DiameterMessage,
        timeout: Duration,
    ) -> DiameterResult<DiameterMessage> {
        if self.is_stopping(self.binding()?) {
            return Err(DiameterError::ShuttingDown);
        }
        let peer = self.select_peer(&request)?;
        self.send_request_to(&peer, request, timeout).await
    }

    /// Send a request on a specific bound peer and wait for its answer.
    ///
    /// Fresh hop-by-hop and end-to-end ids are assigned. Resolves exactly
    /// once: with the matching answer, [`DiameterError::CorrelationTimeout`],
    /// [`DiameterError::PeerUnavailable`] or [`DiameterError::ShuttingDown`].
    pub async fn send_request_to(
        &self,
        peer: &Arc<Peer>,
        mut request: DiameterMessage,
        timeout: Duration,
    ) -> DiameterResult<DiameterMessage> {
        let binding = self.binding()?;
        if self.is_stopping(binding) {
            return Err(DiameterError::ShuttingDown);
        }
        if !request.is_request() {
            return Err(DiameterError::InvalidMessage(
                "send_request needs a message with the R bit set".into(),
            ));
        }
        if !binding.peers.iter().any(|p| Arc::ptr_eq(p, peer)) {
            return Err(DiameterError::PeerUnavailable(format!(
                "{} is not bound to application {}",
                peer.identity(),
                self.application_id
            )));
        }
        if !peer.is_open() {
            return Err(peer.unavailable());
        }

        request.header.application_id = self.application_id;
        request.header.hop_by_hop_id = binding.ids.next_hop_by_hop();
        request.header.end_to_end_id = binding.ids.next_end_to_end();
        let hop_by_hop_id = request.hop_by_hop_id();

        // Removed again by the guard on every early return
        let (_guard, rx) =
            self.pending
                .register(peer.identity(), hop_by_hop_id, request.end_to_end_id())?;

        log::trace!("[{}] -> {}", peer.identity(), request);
        peer.send(request).await?;
        ApplicationStats::inc(&self.stats.requests_sent);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DiameterError::ShuttingDown),
            Err(_) => {
                ApplicationStats::inc(&self.stats.timeouts);
                log::debug!(
                    "[{}] no answer for hbh={:#010x} within {:?}",
                    peer.identity(),
                    hop_by_hop_id,
                    timeout
                );
                Err(DiameterError::CorrelationTimeout {
                    hop_by_hop_id,
                    timeout,
                })
            }
        }
    }

    /// True once the node has begun stopping
    fn is_stopping(&self, binding: &Binding) -> bool {
        *binding.shutdown.borrow() || self.pending.is_closed()
    }

    fn default_timeout(&self) -> DiameterResult<Duration> {
        let binding = self.binding()?;
        Ok(self.request_timeout.unwrap_or(binding.default_timeout))
    }

    fn select_peer(&self, request: &DiameterMessage) -> DiameterResult<Arc<Peer>> {
        let binding = self.binding()?;
        let mut open = binding.peers.iter().filter(|p| p.is_open());

        let preferred = request.destination_host().and_then(|host| {
            binding
                .peers
                .iter()
                .find(|p| p.is_open() && p.identity().eq_ignore_ascii_case(host))
        });
        preferred.or_else(|| open.next()).cloned().ok_or_else(|| {
            DiameterError::PeerUnavailable(format!(
                "no open peer for application {}",
                self.application_id
            ))
        })
    }

    // Node-facing side

    pub(crate) fn attach(self: &Arc<Self>, binding: Binding) -> DiameterResult<()> {
        self.binding
            .set(binding)
            .map_err(|_| DiameterError::AlreadyAttached(self.application_id))?;

        if let DispatchStrategy::Pooled {
            workers,
            queue_capacity,
        } = self.strategy
        {
            let app = Arc::downgrade(self);
            let pool = WorkerPool::spawn(workers, queue_capacity, move |job: Job| {
                run_job(app.clone(), job)
            });
            *self.pool.lock().unwrap_or_else(|e| e.into_inner()) = Some(pool);
        }
        self.refresh_ready();
        Ok(())
    }

    /// Handle an inbound request received on `peer`
    pub(crate) async fn dispatch(&self, peer: &Arc<Peer>, request: DiameterMessage) {
        ApplicationStats::inc(&self.stats.requests_received);
        log::trace!("[{}] <- {}", peer.identity(), request);

        match self.strategy {
            DispatchStrategy::Direct => {
                if let Some(answer) = self.answer_for(&request) {
                    self.send_answer(peer, answer).await;
                }
            }
            DispatchStrategy::Pooled { .. } => {
                let job = Job {
                    peer: peer.clone(),
                    request,
                };
                let submitted = match self.pool.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                    Some(pool) => pool.try_submit(job),
                    None => Err(SubmitError::Closed(job)),
                };
                match submitted {
                    Ok(()) => {}
                    Err(SubmitError::Full(job)) => {
                        ApplicationStats::inc(&self.stats.too_busy);
                        let err = DiameterError::Capacity(self.application_id);
                        log::warn!("[{}] {err}, rejecting {}", peer.identity(), job.request);
                        let answer = self.generate_answer(&job.request, ResultCode::TooBusy);
                        self.try_send_answer(peer, answer);
                    }
                    Err(SubmitError::Closed(job)) => {
                        log::debug!(
                            "[{}] application {} stopped, dropping {}",
                            peer.identity(),
                            self.application_id,
                            job.request
                        );
                    }
                }
            }
        }
    }

    /// Run the handler, turning a missing handler or a panic into an error answer
    fn answer_for(&self, request: &DiameterMessage) -> Option<DiameterMessage> {
        let Some(handler) = self.handler.as_ref() else {
            return Some(self.generate_answer(request, ResultCode::CommandUnsupported));
        };
        match catch_unwind(AssertUnwindSafe(|| handler.handle_request(self, request))) {
            Ok(answer) => answer,
            Err(_) => {
                log::error!(
                    "application {} handler panicked on {}",
                    self.application_id,
                    request
                );
                Some(self.generate_answer_with_error(
                    request,
                    ResultCode::UnableToComply,
                    "request handler failed",
                ))
            }
        }
    }

    async fn send_answer(&self, peer: &Peer, answer: DiameterMessage) {
        match peer.send(answer).await {
            Ok(()) => ApplicationStats::inc(&self.stats.answers_sent),
            Err(e) => log::warn!("[{}] answer not sent: {e}", peer.identity()),
        }
    }

    /// Answer from the reader without waiting for room in the write queue
    fn try_send_answer(&self, peer: &Peer, answer: DiameterMessage) {
        match peer.try_send(answer) {
            Ok(()) => ApplicationStats::inc(&self.stats.answers_sent),
            Err(e) => log::warn!("[{}] answer not sent: {e}", peer.identity()),
        }
    }

    /// Hand an inbound answer to its pending call
    pub(crate) fn resolve_answer(&self, peer: &Peer, answer: DiameterMessage) {
        let description = answer.to_string();
        if self.pending.resolve(peer.identity(), answer) {
            ApplicationStats::inc(&self.stats.answers_received);
        } else {
            log::debug!("[{}] dropping orphan answer {}", peer.identity(), description);
        }
    }

    /// Recompute readiness from the bound peers' states
    pub(crate) fn refresh_ready(&self) {
        let open = self.peers().iter().any(|p| p.is_open());
        self.ready.send_if_modified(|ready| {
            let changed = *ready != open;
            *ready = open;
            changed
        });
    }

    pub(crate) fn peer_closed(&self, peer: &Peer) {
        let failed = self.pending.fail_for_peer(peer.identity(), || peer.unavailable());
        if failed > 0 {
            log::debug!(
                "[{}] failed {} pending request(s) of application {}",
                peer.identity(),
                failed,
                self.application_id
            );
        }
        self.refresh_ready();
    }

    /// Cancel pending calls and stop accepting work
    pub(crate) fn shutdown(&self) {
        let cancelled = self.pending.cancel_all();
        if cancelled > 0 {
            log::info!(
                "application {}: cancelled {} pending request(s)",
                self.application_id,
                cancelled
            );
        }
        if let Some(pool) = self.pool.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            pool.close();
        }
    }

    /// Wait for in-flight pooled work
    pub(crate) async fn join(&self, grace: Duration) {
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = pool {
            pool.join(grace).await;
        }
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("application_id", &self.application_id)
            .field("role", &self.role)
            .field("strategy", &self.strategy)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Pooled worker body: run the handler off the async runtime, then answer
async fn run_job(app: Weak<Application>, job: Job) {
    let Some(app) = app.upgrade() else {
        return;
    };
    let Job { peer, request } = job;

    let worker_app = app.clone();
    let answer = match tokio::task::spawn_blocking(move || worker_app.answer_for(&request)).await {
        Ok(answer) => answer,
        Err(e) => {
            log::error!("application {} worker failed: {e}", app.application_id);
            None
        }
    };
    if let Some(answer) = answer {
        app.send_answer(&peer, answer).await;
    }
}

/// Resolves to the current value once it is true, or false if the sender
/// is gone
async fn wait_true(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|value| *value).await.is_ok()
}

/// Result-Code of an answer as a [`ResultCode`], if known
pub fn answer_result(answer: &DiameterMessage) -> Option<ResultCode> {
    answer.result_code().and_then(ResultCode::from_code)
}

/// EAP-Payload AVP helper for EAP applications
pub fn eap_payload(payload: impl Into<bytes::Bytes>) -> Avp {
    Avp::mandatory(avp_code::EAP_PAYLOAD, AvpData::OctetString(payload.into()))
}
