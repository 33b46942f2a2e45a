use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::Peer;
use crate::error::{DiameterError, DiameterResult};

/// Peer table keyed by Diameter Identity (case-insensitive)
pub struct PeerTable {
    peers: Mutex<HashMap<String, Arc<Peer>>>,
}

impl PeerTable {
    /// Create an empty peer table
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a peer; fails if the identity is already present
    pub async fn insert(&self, peer: Arc<Peer>) -> DiameterResult<()> {
        let mut peers = self.peers.lock().await;
        let key = peer.identity().to_ascii_lowercase();
        if peers.contains_key(&key) {
            return Err(DiameterError::Config(format!("peer {key} already registered")));
        }
        peers.insert(key, peer);
        Ok(())
    }

    pub async fn get(&self, identity: &str) -> Option<Arc<Peer>> {
        let peers = self.peers.lock().await;
        peers.get(&identity.to_ascii_lowercase()).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Peer>> {
        let peers = self.peers.lock().await;
        peers.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}
