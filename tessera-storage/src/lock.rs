//! Named priority lock serializing cache rebuilds on a node.
//!
//! A lock has at most one holder. Waiters are granted in priority order
//! (full > incremental > lazy) and FIFO within a priority. Every acquisition
//! is bounded by a timeout, and the returned [`RebuildGuard`] releases the lock
//! when dropped, so every exit path (error, timeout, task cancellation)
//! hands the lock to the next waiter.
//!
//! The internal queue sits behind a `std::sync::Mutex` that is never held
//! across an `.await`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tessera_core::{LockError, RebuildPriority};
use tokio::sync::oneshot;

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Holder {
    priority: RebuildPriority,
    ticket: u64,
    acquired_at: Instant,
}

#[derive(Debug)]
struct Waiter {
    priority: RebuildPriority,
    ticket: u64,
    grant: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then the earlier ticket.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.ticket.cmp(&self.ticket))
    }
}

#[derive(Debug, Default)]
struct LockState {
    held: Option<Holder>,
    waiters: BinaryHeap<Waiter>,
    next_ticket: u64,
}

impl LockState {
    fn is_held_by(&self, ticket: u64) -> bool {
        self.held.map(|h| h.ticket) == Some(ticket)
    }

    /// Hand the lock to the best live waiter, skipping any whose receiver is gone.
    fn grant_next(&mut self) {
        self.held = None;
        while let Some(waiter) = self.waiters.pop() {
            self.held = Some(Holder {
                priority: waiter.priority,
                ticket: waiter.ticket,
                acquired_at: Instant::now(),
            });
            if waiter.grant.send(()).is_ok() {
                return;
            }
            self.held = None;
        }
    }

    fn remove_waiter(&mut self, ticket: u64) {
        self.waiters.retain(|w| w.ticket != ticket);
    }
}

/// Snapshot of one named lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub name: String,
    pub held_by: Option<RebuildPriority>,
    pub held_for_ms: Option<u64>,
    pub queued: usize,
}

// ============================================================================
// MANAGER
// ============================================================================

/// Registry of named rebuild locks. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct RebuildLockManager {
    locks: Arc<Mutex<HashMap<String, LockState>>>,
}

impl RebuildLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for the named lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if the lock was not granted in time. The
    /// request is withdrawn from the queue before returning.
    pub async fn acquire(
        &self,
        name: &str,
        priority: RebuildPriority,
        timeout: Duration,
    ) -> Result<RebuildGuard, LockError> {
        let started = Instant::now();

        let (ticket, granted) = {
            let mut locks = self.table();
            let state = locks.entry(name.to_string()).or_default();
            let ticket = state.next_ticket;
            state.next_ticket += 1;

            if state.held.is_none() && state.waiters.is_empty() {
                state.held = Some(Holder {
                    priority,
                    ticket,
                    acquired_at: Instant::now(),
                });
                tracing::debug!(ctx_lock_name = name, ctx_priority = %priority, "Rebuild lock acquired");
                return Ok(self.guard(name, ticket, priority, started));
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push(Waiter {
                priority,
                ticket,
                grant: tx,
            });
            (ticket, rx)
        };

        tracing::debug!(ctx_lock_name = name, ctx_priority = %priority, "Waiting for rebuild lock");

        let mut pending = PendingAcquire {
            manager: self,
            name,
            ticket,
            armed: true,
        };

        let outcome = tokio::time::timeout(timeout, granted).await;
        pending.armed = false;

        // Decide under the mutex: a grant may race with the timeout.
        let won = {
            let mut locks = self.table();
            match locks.get_mut(name) {
                Some(state) if state.is_held_by(ticket) => true,
                Some(state) => {
                    state.remove_waiter(ticket);
                    false
                }
                None => false,
            }
        };

        if won {
            tracing::debug!(
                ctx_lock_name = name,
                ctx_priority = %priority,
                ctx_waited_ms = started.elapsed().as_millis() as u64,
                "Rebuild lock acquired after wait"
            );
            return Ok(self.guard(name, ticket, priority, started));
        }

        if outcome.is_ok() {
            tracing::warn!(ctx_lock_name = name, "Rebuild lock grant lost");
        }
        Err(LockError::Timeout {
            name: name.to_string(),
            priority: priority.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Current holder and queue depth of `name`.
    pub fn status(&self, name: &str) -> LockStatus {
        let locks = self.table();
        let state = locks.get(name);
        LockStatus {
            name: name.to_string(),
            held_by: state.and_then(|s| s.held.map(|h| h.priority)),
            held_for_ms: state
                .and_then(|s| s.held)
                .map(|h| h.acquired_at.elapsed().as_millis() as u64),
            queued: state.map(|s| s.waiters.len()).unwrap_or(0),
        }
    }

    fn guard(
        &self,
        name: &str,
        ticket: u64,
        priority: RebuildPriority,
        started: Instant,
    ) -> RebuildGuard {
        RebuildGuard {
            manager: self.clone(),
            name: name.to_string(),
            ticket,
            priority,
            waited: started.elapsed(),
        }
    }

    fn release(&self, name: &str, ticket: u64) {
        let mut locks = self.table();
        if let Some(state) = locks.get_mut(name) {
            if state.is_held_by(ticket) {
                state.grant_next();
            }
        }
    }

    /// Withdraw a request whose future was dropped mid-wait.
    fn abandon(&self, name: &str, ticket: u64) {
        let mut locks = self.table();
        if let Some(state) = locks.get_mut(name) {
            if state.is_held_by(ticket) {
                state.grant_next();
            } else {
                state.remove_waiter(ticket);
            }
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, LockState>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cleans up a queued request if the acquiring future is dropped.
struct PendingAcquire<'a> {
    manager: &'a RebuildLockManager,
    name: &'a str,
    ticket: u64,
    armed: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.abandon(self.name, self.ticket);
        }
    }
}

// ============================================================================
// GUARD
// ============================================================================

/// Held rebuild lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct RebuildGuard {
    manager: RebuildLockManager,
    name: String,
    ticket: u64,
    priority: RebuildPriority,
    waited: Duration,
}

impl RebuildGuard {
    pub fn priority(&self) -> RebuildPriority {
        self.priority
    }

    /// Time spent queued before the lock was granted.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for RebuildGuard {
    fn drop(&mut self) {
        self.manager.release(&self.name, self.ticket);
        tracing::debug!(ctx_lock_name = %self.name, ctx_priority = %self.priority, "Rebuild lock released");
    }
}
