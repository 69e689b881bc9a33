//! Subscriber sessions
//!
//! Each connected subscriber owns a bounded queue. The bridge enqueues
//! without ever blocking its broker read loop: past the high-water mark the
//! queue coalesces (latest message per vehicle wins) and counts drops; past
//! the hard limit the subscriber is disconnected.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::core::constants::{SESSION_QUEUE_HARD_LIMIT, SESSION_QUEUE_HIGH_WATER};
use crate::data::types::PushMessage;

/// Outcome of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued after dropping older messages (coalesced)
    QueuedWithDrops,
    /// Hard limit exceeded; the session is now disconnected
    Disconnected,
}

/// One subscriber session
pub struct Session {
    id: Uuid,
    queue: Mutex<VecDeque<PushMessage>>,
    notify: Notify,
    dropped: AtomicU64,
    disconnected: AtomicBool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Mark the session dead; `recv` returns `None` from here on
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Enqueue a message without blocking.
    ///
    /// Above the high-water mark, older queued messages for the same vehicle
    /// are coalesced away first, then the global oldest is dropped until the
    /// queue is back at the mark. Above the hard limit the session is cut.
    pub fn enqueue(&self, message: PushMessage) -> EnqueueOutcome {
        if self.is_disconnected() {
            return EnqueueOutcome::Disconnected;
        }

        let outcome = {
            let mut queue = self.queue.lock();

            if queue.len() >= SESSION_QUEUE_HARD_LIMIT {
                drop(queue);
                self.disconnect();
                return EnqueueOutcome::Disconnected;
            }

            if queue.len() >= SESSION_QUEUE_HIGH_WATER {
                // Keep-latest-per-vehicle: the incoming message supersedes
                // older queued ones for its vehicle. Queues full of distinct
                // vehicles keep growing until the hard limit cuts them.
                let vehicle = message.vehicle_id().to_string();
                let before = queue.len();
                queue.retain(|m| m.vehicle_id() != vehicle);
                let dropped = (before - queue.len()) as u64;

                queue.push_back(message);
                self.dropped.fetch_add(dropped, Ordering::Relaxed);
                EnqueueOutcome::QueuedWithDrops
            } else {
                queue.push_back(message);
                EnqueueOutcome::Queued
            }
        };

        self.notify.notify_waiters();
        outcome
    }

    /// Pop the next message, waiting when the queue is empty.
    /// Returns `None` once the session is disconnected and drained.
    pub async fn recv(&self) -> Option<PushMessage> {
        loop {
            if let Some(message) = self.queue.lock().pop_front() {
                return Some(message);
            }
            if self.is_disconnected() {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
