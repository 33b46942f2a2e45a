//! Diameter peers
//!
//! A [`Peer`] is the Node's record of one remote Diameter node: its identity,
//! candidate addresses, persistence policy and connection state. The
//! connection itself is driven by the tasks in [`connection`]; while Open,
//! the peer holds the sending side of the connection's writer queue.

pub(crate) mod base;
pub(crate) mod connection;
mod retry;
mod state;
mod table;
mod watchdog;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{DiameterError, DiameterResult};
use crate::message::DiameterMessage;
use crate::uri::PeerUri;

pub use state::{PeerInput, PeerState};
pub use table::PeerTable;

/// Per-peer traffic counters
#[derive(Debug, Default)]
pub struct PeerStats {
    /// Messages read from the connection
    pub messages_received: AtomicU64,
    /// Messages written to the connection
    pub messages_sent: AtomicU64,
    /// DWRs sent by the watchdog
    pub watchdogs_sent: AtomicU64,
    /// Connections aborted by the watchdog
    pub watchdog_expirations: AtomicU64,
    /// Outbound connection attempts
    pub connect_attempts: AtomicU64,
}

impl PeerStats {
    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_watchdogs_sent(&self) {
        self.watchdogs_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_watchdog_expirations(&self) {
        self.watchdog_expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connect_attempts(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PeerStatsSnapshot {
        PeerStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            watchdogs_sent: self.watchdogs_sent.load(Ordering::Relaxed),
            watchdog_expirations: self.watchdog_expirations.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStatsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub watchdogs_sent: u64,
    pub watchdog_expirations: u64,
    pub connect_attempts: u64,
}

/// Sending side of an open connection
struct PeerLink {
    tx: mpsc::Sender<DiameterMessage>,
    remote: SocketAddr,
    common_applications: Vec<u32>,
}

/// A remote Diameter node known to the local Node
pub struct Peer {
    identity: String,
    realm: String,
    uri: PeerUri,
    addresses: Vec<IpAddr>,
    persistent: bool,
    state: watch::Sender<PeerState>,
    link: Mutex<Option<PeerLink>>,
    last_activity: Mutex<Option<Instant>>,
    /// Set while an outbound connection task owns this peer
    driven: AtomicBool,
    stats: PeerStats,
}

impl Peer {
    pub(crate) fn new(uri: PeerUri, realm: String, addresses: Vec<IpAddr>, persistent: bool) -> Self {
        let (state, _) = watch::channel(PeerState::Closed);
        Self {
            identity: uri.fqdn.clone(),
            realm,
            uri,
            addresses,
            persistent,
            state,
            link: Mutex::new(None),
            last_activity: Mutex::new(None),
            driven: AtomicBool::new(false),
            stats: PeerStats::default(),
        }
    }

    /// Diameter Identity (lowercase FQDN)
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn uri(&self) -> &PeerUri {
        &self.uri
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    /// Wait until the peer reaches `state`; false on timeout
    pub async fn wait_for_state(&self, state: PeerState, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let reached = async move { rx.wait_for(|s| *s == state).await.is_ok() };
        tokio::time::timeout(timeout, reached).await.unwrap_or(false)
    }

    /// Remote transport address while connected
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.lock_link().as_ref().map(|link| link.remote)
    }

    /// Applications negotiated in the last capabilities exchange
    pub fn common_applications(&self) -> Vec<u32> {
        self.lock_link()
            .as_ref()
            .map(|link| link.common_applications.clone())
            .unwrap_or_default()
    }

    /// Time of the last message received on the current connection
    pub fn last_activity(&self) -> Option<Instant> {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> PeerStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &PeerStats {
        &self.stats
    }

    /// Apply one input to the state machine. Returns the new state, or
    /// `None` if the input was not valid in the current state.
    pub(crate) fn apply(&self, input: PeerInput) -> Option<PeerState> {
        let mut next = None;
        self.state.send_if_modified(|state| match state.on(input) {
            Some(to) => {
                let changed = *state != to;
                if changed {
                    log::debug!("[{}] {} -> {} ({:?})", self.identity, state, to, input);
                }
                *state = to;
                next = Some(to);
                changed
            }
            None => {
                log::trace!("[{}] ignoring {:?} in state {}", self.identity, input, state);
                false
            }
        });
        next
    }

    /// Resolves once the peer is Closed
    pub(crate) async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == PeerState::Closed).await;
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.apply(PeerInput::Traffic);
    }

    pub(crate) fn attach(
        &self,
        tx: mpsc::Sender<DiameterMessage>,
        remote: SocketAddr,
        common_applications: Vec<u32>,
    ) {
        *self.lock_link() = Some(PeerLink {
            tx,
            remote,
            common_applications,
        });
    }

    pub(crate) fn detach(&self) {
        self.lock_link().take();
    }

    /// Claim the outbound driver slot; false if a task already drives this peer
    pub(crate) fn claim_driver(&self) -> bool {
        !self.driven.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_driver(&self) {
        self.driven.store(false, Ordering::Release);
    }

    /// Drive the state machine to Closed from wherever it is.
    /// Returns true if the peer was not already Closed.
    pub(crate) fn force_closed(&self) -> bool {
        self.detach();
        let was_closed = self.state() == PeerState::Closed;
        self.apply(PeerInput::Stop);
        self.apply(PeerInput::Drained);
        !was_closed
    }

    /// Queue a message on the open connection
    pub(crate) async fn send(&self, msg: DiameterMessage) -> DiameterResult<()> {
        let tx = {
            let link = self.lock_link();
            match link.as_ref() {
                Some(link) if self.is_open() => link.tx.clone(),
                _ => return Err(self.unavailable()),
            }
        };
        tx.send(msg).await.map_err(|_| self.unavailable())
    }

    /// Queue a message without waiting; fails if the writer queue is full.
    /// Used from the reader, which must not stall behind the writer.
    pub(crate) fn try_send(&self, msg: DiameterMessage) -> DiameterResult<()> {
        let link = self.lock_link();
        let Some(link) = link.as_ref().filter(|_| self.is_open()) else {
            return Err(self.unavailable());
        };
        link.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => {
                DiameterError::PeerUnavailable(format!("{} write queue full", self.identity))
            }
            TrySendError::Closed(_) => self.unavailable(),
        })
    }

    pub(crate) fn unavailable(&self) -> DiameterError {
        DiameterError::PeerUnavailable(format!("{} is {}", self.identity, self.state()))
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<PeerLink>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("identity", &self.identity)
            .field("realm", &self.realm)
            .field("state", &self.state())
            .field("persistent", &self.persistent)
            .finish()
    }
}
