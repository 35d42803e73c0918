//! Bounded FIFO wait queue
//!
//! Pending acquisitions queue here when a shard is at capacity. Entries
//! carry a deadline and a oneshot reply; a caller that times out or goes
//! away simply drops its receiver, and the dead entry is skipped and purged
//! rather than ever being satisfied.

use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// One queued acquisition request
#[derive(Debug)]
pub struct Waiter<T> {
    pub ticket: u64,
    /// Correlates the waiter with its originating render call in logs
    pub call_id: String,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub reply: oneshot::Sender<T>,
}

impl<T> Waiter<T> {
    /// A waiter is dead once its caller stopped listening or its deadline
    /// passed; dead waiters must never be satisfied.
    fn is_dead(&self, now: Instant) -> bool {
        self.reply.is_closed() || now >= self.deadline
    }
}

/// Bounded FIFO of pending acquisitions for one shard
#[derive(Debug)]
pub struct WaitQueue<T> {
    entries: VecDeque<Waiter<T>>,
    limit: usize,
    next_ticket: u64,
}

impl<T> WaitQueue<T> {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
            next_ticket: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    /// Enqueue a waiter; returns its ticket
    ///
    /// Callers must check [`is_full`](Self::is_full) first; pushing into a
    /// full queue returns `None` and hands the reply back via the error.
    pub fn push(
        &mut self,
        call_id: String,
        deadline: Instant,
        reply: oneshot::Sender<T>,
    ) -> Result<u64, oneshot::Sender<T>> {
        if self.is_full() {
            return Err(reply);
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.entries.push_back(Waiter {
            ticket,
            call_id,
            enqueued_at: Instant::now(),
            deadline,
            reply,
        });
        Ok(ticket)
    }

    /// Pop the oldest waiter that is still live, discarding dead ones
    pub fn pop_live(&mut self, now: Instant) -> Option<Waiter<T>> {
        while let Some(waiter) = self.entries.pop_front() {
            if waiter.is_dead(now) {
                continue;
            }
            return Some(waiter);
        }
        None
    }

    /// Drop every dead entry; returns how many were removed
    pub fn purge_dead(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|waiter| !waiter.is_dead(now));
        before - self.entries.len()
    }

    /// Fail every remaining waiter with the value produced by `err`
    pub fn drain_with<F>(&mut self, mut err: F)
    where
        F: FnMut() -> T,
    {
        for waiter in self.entries.drain(..) {
            let _ = waiter.reply.send(err());
        }
    }
}
