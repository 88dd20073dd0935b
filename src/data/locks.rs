//! Per-key read/write locks
//!
//! `KeyLockTable` behaves like a `HashMap<String, RwLock<()>>` whose entries
//! appear on first use and evict themselves once nobody holds or waits on
//! them. A single structural mutex guards the map and each key's state; it
//! is only held for bookkeeping, never while a caller holds a key lock.
//!
//! Waiters register on the key's `Notify` while still holding the structural
//! mutex, then release it and sleep. A full unlock wakes every waiter and
//! each one re-checks the key state, since a woken writer can still lose to
//! a woken reader.
//!
//! Evicted lock slots go back to a two-generation pool. Every
//! `gc_frequency` unlocks the current generation becomes the victim
//! generation and the old victims are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Default number of unlocks between pool generations
pub const DEFAULT_GC_FREQUENCY: u32 = 1024;

/// Requested lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Read(u32),
    Write,
}

struct KeyLock {
    state: LockState,
    /// Waiters registered since the last broadcast
    waiters: usize,
    /// Changes on every broadcast; lets a cancelled waiter tell whether
    /// its registration is still counted
    ticket: u64,
    notify: Arc<Notify>,
}

impl KeyLock {
    fn new() -> Self {
        Self {
            state: LockState::Unlocked,
            waiters: 0,
            ticket: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn try_lock(&mut self, kind: LockKind) -> bool {
        match (self.state, kind) {
            (LockState::Unlocked, LockKind::Read) => self.state = LockState::Read(1),
            (LockState::Unlocked, LockKind::Write) => self.state = LockState::Write,
            (LockState::Read(n), LockKind::Read) => self.state = LockState::Read(n + 1),
            _ => return false,
        }
        true
    }

    /// Returns true once fully unlocked.
    fn unlock(&mut self) -> bool {
        match self.state {
            LockState::Unlocked => panic!("BUG: unlock of an unlocked key"),
            LockState::Read(0) => panic!("BUG: negative read lock count"),
            LockState::Read(1) | LockState::Write => {
                self.state = LockState::Unlocked;
                true
            }
            LockState::Read(n) => {
                self.state = LockState::Read(n - 1);
                false
            }
        }
    }
}

#[derive(Default)]
struct LockPool {
    current: Vec<KeyLock>,
    victim: Vec<KeyLock>,
}

impl LockPool {
    fn acquire(&mut self) -> KeyLock {
        self.current
            .pop()
            .or_else(|| self.victim.pop())
            .unwrap_or_else(KeyLock::new)
    }

    fn release(&mut self, lock: KeyLock) {
        debug_assert_eq!(lock.state, LockState::Unlocked);
        self.current.push(lock);
    }

    fn gc(&mut self) {
        self.victim = std::mem::take(&mut self.current);
    }

    fn len(&self) -> usize {
        self.current.len() + self.victim.len()
    }
}

struct Table {
    locks: HashMap<String, KeyLock>,
    pool: LockPool,
    unlocks: u32,
    gc_frequency: u32,
    next_ticket: u64,
}

impl Table {
    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn evict(&mut self, key: &str) {
        if let Some(lock) = self.locks.remove(key) {
            self.pool.release(lock);
        }
    }
}

/// Table of per-key read/write locks
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct KeyLockTable {
    table: Arc<Mutex<Table>>,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::with_gc_frequency(DEFAULT_GC_FREQUENCY)
    }

    /// # Arguments
    /// * `gc_frequency` - Unlocks between pool generations (minimum 1)
    pub fn with_gc_frequency(gc_frequency: u32) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                locks: HashMap::new(),
                pool: LockPool::default(),
                unlocks: 0,
                gc_frequency: gc_frequency.max(1),
                next_ticket: 0,
            })),
        }
    }

    /// Acquire an exclusive lock on `key`.
    pub async fn lock(&self, key: impl Into<String>) -> KeyLockGuard {
        self.acquire(key.into(), LockKind::Write).await
    }

    /// Acquire a shared lock on `key`.
    pub async fn read_lock(&self, key: impl Into<String>) -> KeyLockGuard {
        self.acquire(key.into(), LockKind::Read).await
    }

    /// Acquire a lock of the given kind on `key`.
    ///
    /// Blocks until the lock is available. Dropping the returned future
    /// while it waits withdraws the waiter, so callers can race it against
    /// a deadline.
    pub async fn acquire(&self, key: String, kind: LockKind) -> KeyLockGuard {
        loop {
            let (mut notified, ticket) = {
                let mut guard = self.table.lock();
                let Table {
                    locks,
                    pool,
                    next_ticket,
                    ..
                } = &mut *guard;

                let lock = locks.entry(key.clone()).or_insert_with(|| {
                    let mut lock = pool.acquire();
                    *next_ticket += 1;
                    lock.ticket = *next_ticket;
                    lock
                });

                if lock.try_lock(kind) {
                    return KeyLockGuard {
                        table: Arc::clone(&self.table),
                        key,
                        kind,
                    };
                }

                // Register before the structural mutex is released so a
                // concurrent unlock cannot slip between check and sleep.
                lock.waiters += 1;
                let mut notified = Box::pin(Arc::clone(&lock.notify).notified_owned());
                notified.as_mut().enable();
                (notified, lock.ticket)
            };

            crate::metrics::KEY_LOCK_WAITS_TOTAL.inc();
            let mut registration = Registration {
                table: &self.table,
                key: &key,
                ticket,
                armed: true,
            };
            notified.as_mut().await;
            // The broadcaster already reset the waiter count.
            registration.armed = false;
        }
    }

    /// Number of keys currently present in the table.
    pub fn len(&self) -> usize {
        self.table.lock().locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of idle lock slots held by the pool.
    pub fn pooled(&self) -> usize {
        self.table.lock().pool.len()
    }
}

impl Default for KeyLockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Withdraws a waiter whose acquire future was dropped before waking.
struct Registration<'a> {
    table: &'a Mutex<Table>,
    key: &'a str,
    ticket: u64,
    armed: bool,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut table = self.table.lock();
        let Some(lock) = table.locks.get_mut(self.key) else {
            return;
        };
        // A broadcast may already have consumed this registration.
        if lock.ticket == self.ticket {
            lock.waiters -= 1;
        }
        if lock.waiters == 0 && lock.state == LockState::Unlocked {
            table.evict(self.key);
        }
    }
}

/// Held key lock; releases on drop.
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyLockGuard {
    table: Arc<Mutex<Table>>,
    key: String,
    kind: LockKind,
}

impl KeyLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

impl std::fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        let mut guard = self.table.lock();
        let table = &mut *guard;

        let ticket = table.ticket();
        let Some(lock) = table.locks.get_mut(&self.key) else {
            panic!("BUG: unlock of unknown key {:?}", self.key);
        };

        if lock.unlock() {
            if lock.waiters == 0 {
                // Nobody else cares about this key.
                table.evict(&self.key);
            } else {
                lock.waiters = 0;
                lock.ticket = ticket;
                lock.notify.notify_waiters();
            }
        }

        table.unlocks = table.unlocks.wrapping_add(1);
        if table.unlocks % table.gc_frequency == 0 {
            table.pool.gc();
        }
    }
}
