//! Named pessimistic locks with hold TTLs and FIFO waiters.
//!
//! One lock per section serializes admissions into that section. A holder
//! that disappears (crash, lost task) is reaped once its `expires_at`
//! passes, so a stuck coordinator cannot park a section forever. Waiters are
//! granted strictly in arrival order: release hands the lock to the front of
//! the queue, and both the handoff and a waiter's timeout resolve under the
//! registry mutex, so a grant can never race a timeout.
//!
//! The registry mutex is never held across an await point.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock {name} is not held by {owner}")]
    NotHolder { name: String, owner: String },
}

/// Outcome of an acquire call.
#[derive(Debug, PartialEq, Eq)]
pub enum Acquisition {
    Acquired,
    /// The caller already holds this lock.
    AlreadyHeld,
    /// `wait_timeout` elapsed while the lock stayed busy.
    TimedOut,
}

impl Acquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquisition::Acquired | Acquisition::AlreadyHeld)
    }
}

#[derive(Debug)]
struct Holder {
    owner: String,
    acquired_at: Instant,
    expires_at: Instant,
}

struct Waiter {
    id: u64,
    owner: String,
    hold_ttl: Duration,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct Entry {
    holder: Option<Holder>,
    queue: VecDeque<Waiter>,
}

/// Process-wide registry of named locks.
pub struct LockManager {
    locks: Mutex<HashMap<String, Entry>>,
    next_waiter_id: AtomicU64,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            next_waiter_id: AtomicU64::new(1),
        }
    }

    /// Acquire `name` for `owner`, waiting up to `wait_timeout` while it is
    /// busy. A stale holder (past its `expires_at`) is reaped rather than
    /// waited out.
    pub async fn acquire(
        &self,
        name: &str,
        owner: &str,
        hold_ttl: Duration,
        wait_timeout: Duration,
    ) -> Acquisition {
        let deadline = Instant::now() + wait_timeout;

        let (waiter_id, mut grant_rx) = {
            let mut locks = self.registry();
            let entry = locks.entry(name.to_string()).or_default();
            let now = Instant::now();

            match &entry.holder {
                Some(holder) if holder.owner == owner => return Acquisition::AlreadyHeld,
                Some(holder) if holder.expires_at <= now && entry.queue.is_empty() => {
                    tracing::warn!(
                        lock = name,
                        stale_owner = %holder.owner,
                        held_for_ms = now.duration_since(holder.acquired_at).as_millis() as u64,
                        "reaping expired lock holder"
                    );
                    entry.holder = Some(new_holder(owner, hold_ttl, now));
                    return Acquisition::Acquired;
                }
                None if entry.queue.is_empty() => {
                    entry.holder = Some(new_holder(owner, hold_ttl, now));
                    return Acquisition::Acquired;
                }
                _ => {
                    let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    entry.queue.push_back(Waiter {
                        id,
                        owner: owner.to_string(),
                        hold_ttl,
                        grant: tx,
                    });
                    (id, rx)
                }
            }
        };

        loop {
            let wake = self.next_wake(name, deadline);
            tokio::select! {
                granted = &mut grant_rx => {
                    return match granted {
                        Ok(()) => Acquisition::Acquired,
                        Err(_) => Acquisition::TimedOut,
                    };
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {
                    let mut locks = self.registry();
                    // A grant sent while we were waking still counts; the
                    // sender runs under this mutex, so the answer is settled.
                    if grant_rx.try_recv().is_ok() {
                        return Acquisition::Acquired;
                    }
                    let now = Instant::now();
                    let Some(entry) = locks.get_mut(name) else {
                        return Acquisition::TimedOut;
                    };
                    if now >= deadline {
                        entry.queue.retain(|w| w.id != waiter_id);
                        if entry.holder.is_none() && entry.queue.is_empty() {
                            locks.remove(name);
                        }
                        return Acquisition::TimedOut;
                    }
                    let at_front = entry.queue.front().map(|w| w.id) == Some(waiter_id);
                    let holder_stale = entry
                        .holder
                        .as_ref()
                        .is_none_or(|h| h.expires_at <= now);
                    if at_front && holder_stale {
                        if let Some(holder) = &entry.holder {
                            tracing::warn!(
                                lock = name,
                                stale_owner = %holder.owner,
                                held_for_ms =
                                    now.duration_since(holder.acquired_at).as_millis() as u64,
                                "reaping expired lock holder"
                            );
                        }
                        entry.queue.pop_front();
                        entry.holder = Some(new_holder(owner, hold_ttl, now));
                        return Acquisition::Acquired;
                    }
                }
            }
        }
    }

    /// Release `name`. The lock is handed to the longest-waiting waiter, if
    /// any.
    pub fn release(&self, name: &str, owner: &str) -> Result<(), LockError> {
        let mut locks = self.registry();
        let Some(entry) = locks.get_mut(name) else {
            return Err(not_holder(name, owner));
        };
        match &entry.holder {
            Some(holder) if holder.owner == owner => {}
            _ => return Err(not_holder(name, owner)),
        }

        let now = Instant::now();
        entry.holder = None;
        while let Some(waiter) = entry.queue.pop_front() {
            let holder = new_holder(&waiter.owner, waiter.hold_ttl, now);
            if waiter.grant.send(()).is_ok() {
                entry.holder = Some(holder);
                break;
            }
            // Receiver gave up between enqueue and handoff; try the next one.
        }
        if entry.holder.is_none() && entry.queue.is_empty() {
            locks.remove(name);
        }
        Ok(())
    }

    /// Push the holder's expiry out by `additional_ttl`.
    pub fn extend(
        &self,
        name: &str,
        owner: &str,
        additional_ttl: Duration,
    ) -> Result<(), LockError> {
        let mut locks = self.registry();
        let holder = locks
            .get_mut(name)
            .and_then(|entry| entry.holder.as_mut())
            .filter(|holder| holder.owner == owner)
            .ok_or_else(|| not_holder(name, owner))?;
        holder.expires_at += additional_ttl;
        Ok(())
    }

    /// Current holder owner, for diagnostics.
    pub fn holder_of(&self, name: &str) -> Option<String> {
        let locks = self.registry();
        locks
            .get(name)
            .and_then(|entry| entry.holder.as_ref())
            .map(|holder| holder.owner.clone())
    }

    /// When to re-check: the holder's expiry or the caller's deadline,
    /// whichever comes first. Clamped at least 10ms out so a waiter behind
    /// the front of the queue polls an already-expired holder instead of
    /// spinning on it.
    fn next_wake(&self, name: &str, deadline: Instant) -> Instant {
        let wake = {
            let locks = self.registry();
            locks
                .get(name)
                .and_then(|entry| entry.holder.as_ref())
                .map_or(deadline, |holder| deadline.min(holder.expires_at))
        };
        wake.max(Instant::now() + Duration::from_millis(10)).min(deadline)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn new_holder(owner: &str, hold_ttl: Duration, now: Instant) -> Holder {
    Holder {
        owner: owner.to_string(),
        acquired_at: now,
        expires_at: now + hold_ttl,
    }
}

fn not_holder(name: &str, owner: &str) -> LockError {
    LockError::NotHolder {
        name: name.to_string(),
        owner: owner.to_string(),
    }
}
