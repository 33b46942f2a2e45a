//! Pending-request correlation table
//!
//! One entry per outstanding `send_request`, keyed by hop-by-hop id. Each
//! entry is resolved at most once: by a matching answer, by a peer/node
//! failure, or by its [`PendingGuard`] being dropped when the caller gives up.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{DiameterError, DiameterResult};
use crate::message::DiameterMessage;

pub(crate) type Outcome = DiameterResult<DiameterMessage>;

struct PendingCall {
    peer: String,
    end_to_end_id: u32,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct Inner {
    calls: HashMap<u32, PendingCall>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct PendingTable {
    inner: Mutex<Inner>,
}

/// Removes the entry when the awaiting caller goes away
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    hop_by_hop_id: u32,
    end_to_end_id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.hop_by_hop_id, self.end_to_end_id);
    }
}

impl PendingTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register(
        &self,
        peer: &str,
        hop_by_hop_id: u32,
        end_to_end_id: u32,
    ) -> DiameterResult<(PendingGuard<'_>, oneshot::Receiver<Outcome>)> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(DiameterError::ShuttingDown);
        }
        if inner.calls.contains_key(&hop_by_hop_id) {
            return Err(DiameterError::Protocol(format!(
                "hop-by-hop id {hop_by_hop_id:#010x} already in flight"
            )));
        }

        let (tx, rx) = oneshot::channel();
        inner.calls.insert(
            hop_by_hop_id,
            PendingCall {
                peer: peer.to_string(),
                end_to_end_id,
                tx,
            },
        );
        let guard = PendingGuard {
            table: self,
            hop_by_hop_id,
            end_to_end_id,
        };
        Ok((guard, rx))
    }

    /// Hand `answer` to its waiting caller. Returns false if no entry
    /// matches its hop-by-hop id, end-to-end id and receiving peer, or the
    /// caller has already given up.
    pub(crate) fn resolve(&self, peer: &str, answer: DiameterMessage) -> bool {
        let hop_by_hop_id = answer.hop_by_hop_id();
        let call = {
            let mut inner = self.lock();
            let matches = inner.calls.get(&hop_by_hop_id).is_some_and(|call| {
                call.end_to_end_id == answer.end_to_end_id() && call.peer == peer
            });
            if !matches {
                return false;
            }
            inner.calls.remove(&hop_by_hop_id)
        };
        match call {
            Some(call) => call.tx.send(Ok(answer)).is_ok(),
            None => false,
        }
    }

    /// Fail every call sent on `peer`
    pub(crate) fn fail_for_peer(&self, peer: &str, error: impl Fn() -> DiameterError) -> usize {
        let failed: Vec<PendingCall> = {
            let mut inner = self.lock();
            let ids: Vec<u32> = inner
                .calls
                .iter()
                .filter(|(_, call)| call.peer == peer)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| inner.calls.remove(id)).collect()
        };
        let count = failed.len();
        for call in failed {
            let _ = call.tx.send(Err(error()));
        }
        count
    }

    /// Fail everything with [`DiameterError::ShuttingDown`] and refuse new entries
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<PendingCall> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.calls.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.tx.send(Err(DiameterError::ShuttingDown));
        }
        count
    }

    pub(crate) fn remove(&self, hop_by_hop_id: u32, end_to_end_id: u32) -> bool {
        let mut inner = self.lock();
        let matches = inner
            .calls
            .get(&hop_by_hop_id)
            .is_some_and(|call| call.end_to_end_id == end_to_end_id);
        matches && inner.calls.remove(&hop_by_hop_id).is_some()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }
}
