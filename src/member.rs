// src/member.rs
//
// One user's presence inside a room: a bounded event queue plus an
// inactivity deadline. The queue favors fresh events under backpressure --
// signaling payloads (candidates, session descriptions) age badly, and a
// peer that cannot keep up is already effectively disconnected.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::event::Event;

/// Per-member queue capacity.
pub const QUEUE_CAPACITY: usize = 1024;

/// A member that neither pulls, sends, nor re-joins for this long is evicted.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

// ─── EventQueue ─────────────────────────────────────────────────────────────

struct QueueState {
    items: VecDeque<Event>,
    closed: bool,
}

/// Bounded FIFO of events with drop-oldest overflow.
///
/// `push` never blocks: when the queue is full the head is evicted and the
/// new event appended under the same mutex acquisition, so a concurrent
/// consumer can never observe a half-done eviction. Once closed, pushes are
/// silently ignored and `pop` drains the remainder before returning `None`.
pub struct EventQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Append `event`, evicting the oldest entry if the queue is full.
    /// No effect once the queue is closed.
    pub fn push(&self, event: Event) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            if state.items.len() >= self.capacity {
                if let Some(dropped) = state.items.pop_front() {
                    debug!(kind = %dropped.kind, from = %dropped.from, "queue full, dropped oldest event");
                }
            }
            state.items.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Wait for the next event. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<Event> {
        loop {
            // Arm the notification before inspecting state so a push that
            // lands between the check and the await is not lost.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`pop`](Self::pop); `None` when empty.
    pub fn try_pop(&self) -> Option<Event> {
        self.state.lock().unwrap().items.pop_front()
    }

    /// Close the queue, waking every waiter. Idempotent.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Member ─────────────────────────────────────────────────────────────────

/// A room member: user id, event queue, inactivity deadline.
///
/// The deadline is advanced by [`reset`](Self::reset) on every successful
/// pull, send, or (re-)join; the room's watcher task waits on
/// [`expired`](Self::expired) and evicts the member when it fires.
pub struct Member {
    pub user_id: String,
    queue: EventQueue,
    deadline: Mutex<Instant>,
    closed: Notify,
}

impl Member {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            queue: EventQueue::new(QUEUE_CAPACITY),
            deadline: Mutex::new(Instant::now() + INACTIVITY_TIMEOUT),
            closed: Notify::new(),
        }
    }

    pub fn push(&self, event: Event) {
        self.queue.push(event);
    }

    pub async fn pop(&self) -> Option<Event> {
        self.queue.pop().await
    }

    pub fn try_pop(&self) -> Option<Event> {
        self.queue.try_pop()
    }

    /// Restart the inactivity deadline.
    pub fn reset(&self) {
        *self.deadline.lock().unwrap() = Instant::now() + INACTIVITY_TIMEOUT;
    }

    /// Close the queue and wake the inactivity watcher. Idempotent.
    pub fn close(&self) {
        self.queue.close();
        self.closed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Resolves once the inactivity deadline passes without a reset.
    pub async fn expired(&self) {
        loop {
            let deadline = *self.deadline.lock().unwrap();
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }

    /// Resolves once the member has been closed.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.closed.notified();
            if self.queue.is_closed() {
                return;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
