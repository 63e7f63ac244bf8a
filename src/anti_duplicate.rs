//! Replay-detection cache for inbound posts.
//!
//! The router may redeliver a frame the client already acknowledged when
//! the ack itself was lost, so identical content arriving again within
//! the retention window must not reach the application twice.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

type Fingerprint = [u8; 32];

pub const DEFAULT_MAX_ENTRIES: usize = 4096;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(20 * 60);

/// Window of recently delivered post fingerprints.
///
/// Bounded by both entry count and age. The bound is a tunable, not a
/// correctness invariant — it only has to span realistic network-level
/// retransmission windows.
#[derive(Debug)]
pub struct AntiDuplicate {
    seen: HashSet<Fingerprint>,
    order: VecDeque<(Fingerprint, Instant)>,
    max_entries: usize,
    max_age: Duration,
}

impl Default for AntiDuplicate {
    fn default() -> Self {
        Self::new()
    }
}

impl AntiDuplicate {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_AGE)
    }

    pub fn with_limits(max_entries: usize, max_age: Duration) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            max_entries,
            max_age,
        }
    }

    /// Check-then-insert membership test.
    ///
    /// Returns `true` when an identical post was already delivered within
    /// the retention window; otherwise records it and returns `false`.
    /// Called only from the sequential inbound path, so check-then-insert
    /// cannot race with itself.
    pub fn already_received(&mut self, post: &[u8]) -> bool {
        self.evict();
        let fingerprint: Fingerprint = *blake3::hash(post).as_bytes();
        if self.seen.contains(&fingerprint) {
            return true;
        }
        self.seen.insert(fingerprint);
        self.order.push_back((fingerprint, Instant::now()));
        false
    }

    /// Number of fingerprints currently retained.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn evict(&mut self) {
        while self.order.len() >= self.max_entries {
            if let Some((fingerprint, _)) = self.order.pop_front() {
                self.seen.remove(&fingerprint);
            }
        }
        while let Some((fingerprint, at)) = self.order.front() {
            if at.elapsed() <= self.max_age {
                break;
            }
            let fingerprint = *fingerprint;
            self.order.pop_front();
            self.seen.remove(&fingerprint);
        }
    }
}
