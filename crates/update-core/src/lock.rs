//! Named mutual exclusion for install targets.
//!
//! A [`LockManager`] keeps one table of outstanding keys behind a single
//! mutex. The first caller for a key creates its [`LockToken`]; later
//! callers get the same token and contend on it. Entries leave the table
//! once every caller has returned the key.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// The object callers synchronize on for one key.
#[derive(Debug)]
pub struct LockToken {
    key: String,
    held: Mutex<bool>,
    released: Condvar,
}

impl LockToken {
    fn new(key: String) -> Self {
        Self {
            key,
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Block until the token is free, then hold it.
    pub fn lock(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *held = true;
    }

    pub fn unlock(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = false;
        self.released.notify_one();
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct Entry {
    token: Arc<LockToken>,
    users: usize,
}

/// Table of named locks.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<HashMap<String, Entry>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the token for `key`, registering this caller as a user of it.
    ///
    /// Every call must be paired with [`return_lock`](Self::return_lock).
    pub fn get_lock(&self, key: &str) -> Arc<LockToken> {
        let mut table = self.table();
        let entry = table.entry(key.to_string()).or_insert_with(|| Entry {
            token: Arc::new(LockToken::new(key.to_string())),
            users: 0,
        });
        entry.users += 1;
        Arc::clone(&entry.token)
    }

    /// Give back a key obtained from [`get_lock`](Self::get_lock).
    pub fn return_lock(&self, key: &str) {
        let mut table = self.table();
        let Some(entry) = table.get_mut(key) else {
            tracing::warn!(key, "Returned a lock that is not outstanding");
            return;
        };
        entry.users = entry.users.saturating_sub(1);
        if entry.users == 0 {
            table.remove(key);
        }
    }

    /// Acquire `key` exclusively until the guard drops.
    pub fn acquire(&self, key: &str) -> LockGuard<'_> {
        let token = self.get_lock(key);
        tracing::trace!(key, "Waiting for named lock");
        token.lock();
        LockGuard {
            manager: self,
            token,
        }
    }

    /// Number of keys currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.table().len()
    }
}

/// Holds a named lock; releases and returns it on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    token: Arc<LockToken>,
}

impl LockGuard<'_> {
    pub fn key(&self) -> &str {
        self.token.key()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.token.unlock();
        self.manager.return_lock(self.token.key());
    }
}
