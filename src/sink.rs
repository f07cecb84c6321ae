//! Message Sink Module
//!
//! Unbounded queue of inbound messages with a received counter. The queue and
//! the counter only change together, under one lock, so readers never observe
//! a count that disagrees with the queue.

use crate::protocol::Message;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Thread-safe store for messages delivered to one client
#[derive(Debug, Default)]
pub struct MessageSink {
    messages: Mutex<VecDeque<Message>>,
    received: AtomicU64,
}

impl MessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message and bump the received counter
    pub fn push(&self, message: Message) {
        let mut queue = self.queue();
        queue.push_back(message);
        self.received.fetch_add(1, Ordering::AcqRel);
    }

    /// Discard everything buffered and zero the counter
    pub fn reset(&self) {
        let mut queue = self.queue();
        queue.clear();
        self.received.store(0, Ordering::Release);
    }

    /// Number of messages received since the last reset.
    ///
    /// Unlike `len`, this is not lowered by `pop` or `drain`.
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// Number of messages currently buffered
    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Take the oldest buffered message
    pub fn pop(&self) -> Option<Message> {
        self.queue().pop_front()
    }

    /// Take every buffered message in arrival order
    pub fn drain(&self) -> Vec<Message> {
        self.queue().drain(..).collect()
    }

    /// Copy of the buffered messages in arrival order
    pub fn snapshot(&self) -> Vec<Message> {
        self.queue().iter().cloned().collect()
    }
}
