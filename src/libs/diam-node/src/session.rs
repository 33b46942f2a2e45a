//! Session-Id and message identifier sources
//!
//! Both are constructed once per [`Node`](crate::Node) and shared by `Arc`
//! with the peers and applications that need them.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generates Session-Id values per RFC 6733 Section 8.8:
/// `<DiameterIdentity>;<high 32 bits>;<low 32 bits>[;<optional value>]`
#[derive(Debug)]
pub struct SessionIdGenerator {
    identity: String,
    epoch: u32,
    counter: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            epoch: unix_seconds(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Next unique Session-Id. Unique for the lifetime of the process.
    pub fn next_id(&self) -> String {
        let (high, low) = self.next_parts();
        format!("{};{};{}", self.identity, high, low)
    }

    /// Next Session-Id with an implementation-specific suffix
    pub fn next_id_with(&self, optional: &str) -> String {
        let (high, low) = self.next_parts();
        format!("{};{};{};{}", self.identity, high, low, optional)
    }

    fn next_parts(&self) -> (u32, u32) {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        // Low word overflow carries into the high word
        let high = self.epoch.wrapping_add((n >> 32) as u32);
        (high, n as u32)
    }
}

/// Hop-by-hop and end-to-end identifier allocation.
///
/// Hop-by-hop ids are drawn from one counter shared by every connection of a
/// node, so they are unique among in-flight requests on any single
/// connection.
#[derive(Debug)]
pub struct IdSequence {
    hop_by_hop: AtomicU32,
    end_to_end: AtomicU32,
}

impl IdSequence {
    pub fn new() -> Self {
        // RFC 6733 Section 3: high 12 bits of end-to-end from the clock,
        // low 20 bits random
        let clock = (unix_seconds() & 0x0fff) << 20;
        let random = rand::random::<u32>() & 0x000f_ffff;
        Self {
            hop_by_hop: AtomicU32::new(rand::random::<u32>()),
            end_to_end: AtomicU32::new(clock | random),
        }
    }

    pub fn next_hop_by_hop(&self) -> u32 {
        self.hop_by_hop.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn next_end_to_end(&self) -> u32 {
        self.end_to_end.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
