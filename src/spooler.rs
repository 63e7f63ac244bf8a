//! Outbound delivery queue.
//!
//! Holds every not-yet-confirmed frame in enqueue order. Entries leave
//! the queue only when the router acknowledges them by data id — there is
//! no per-entry timeout, because the delivery confirmation is the only
//! authority on whether a resend is needed. Retry cadence belongs to the
//! caller's reconnection logic, not to the queue.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::frame;

/// One queued outbound frame.
#[derive(Debug, Clone)]
struct QueueEntry {
    data_id: u32,
    payload: Bytes,
    enqueued_at: Instant,
    attempts: u32,
    in_flight: bool,
}

/// FIFO outbound queue with confirmation-based removal.
///
/// Interior mutability: mutated concurrently by application `send` calls,
/// the confirmation path on the reader, and the reconnect drain. The lock
/// is never held across an await point.
#[derive(Debug, Default)]
pub struct Spooler {
    queue: Mutex<VecDeque<QueueEntry>>,
}

impl Spooler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload and return its data id.
    pub fn enqueue(&self, payload: Bytes) -> u32 {
        let data_id = frame::data_id(&payload);
        let mut queue = self.queue.lock().expect("spooler lock");
        queue.push_back(QueueEntry {
            data_id,
            payload,
            enqueued_at: Instant::now(),
            attempts: 0,
            in_flight: false,
        });
        data_id
    }

    /// Remove the first entry matching `data_id`, returning its payload.
    ///
    /// Idempotent: confirming an unknown or already-removed id is a no-op,
    /// since duplicate confirmations can arrive after reconnect races.
    pub fn confirm(&self, data_id: u32) -> Option<Bytes> {
        let mut queue = self.queue.lock().expect("spooler lock");
        let pos = queue.iter().position(|e| e.data_id == data_id)?;
        queue.remove(pos).map(|e| e.payload)
    }

    /// Pull every entry not currently in flight, in enqueue order, and
    /// mark each as in flight.
    pub fn take_unsent(&self) -> Vec<(u32, Bytes)> {
        let mut queue = self.queue.lock().expect("spooler lock");
        queue
            .iter_mut()
            .filter(|e| !e.in_flight)
            .map(|e| {
                e.in_flight = true;
                e.attempts += 1;
                (e.data_id, e.payload.clone())
            })
            .collect()
    }

    /// Clear all in-flight marks so the next drain retransmits everything
    /// still unconfirmed, in original enqueue order. Called when the
    /// connection drops: an entry confirmed before the retransmission is
    /// already gone from the queue and will not be resent.
    pub fn reset_in_flight(&self) {
        let mut queue = self.queue.lock().expect("spooler lock");
        for entry in queue.iter_mut() {
            entry.in_flight = false;
        }
    }

    /// Current queue depth.
    pub fn queue_count(&self) -> usize {
        self.queue.lock().expect("spooler lock").len()
    }

    /// Age of the oldest unconfirmed entry, if any.
    pub fn oldest_waiting(&self) -> Option<Duration> {
        let queue = self.queue.lock().expect("spooler lock");
        queue.front().map(|e| e.enqueued_at.elapsed())
    }
}
