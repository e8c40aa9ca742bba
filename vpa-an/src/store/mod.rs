//! Session state store: per-session locking and cancellation
//!
//! The persisted row (db::sessions) is the source of truth; this module
//! owns the in-process synchronization around it. Each `(owner_id,
//! session_id)` pair gets exactly one entry holding an async mutex and a
//! cancellation token, so unrelated sessions proceed fully in parallel
//! while all mutation of one session is serialized.
//!
//! Entries live for the life of the process. Pruning a live entry could
//! hand two tasks different mutexes for the same key, which is exactly
//! the duplicate-dispatch race the registry exists to prevent.

use crate::models::SessionKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use vpa_common::{Error, Result};

/// Per-session synchronization state
#[derive(Debug)]
pub struct SessionEntry {
    lock: Arc<Mutex<()>>,
    cancel: StdRwLock<CancellationToken>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            cancel: StdRwLock::new(CancellationToken::new()),
        }
    }

    fn token(&self) -> CancellationToken {
        self.cancel
            .read()
            .expect("cancel token lock poisoned")
            .clone()
    }
}

/// Exclusive access to one session's mutable state
///
/// Released on all exit paths (RAII). Holders read/modify the persisted
/// row via db::sessions while the guard is alive.
#[derive(Debug)]
pub struct SessionGuard {
    entry: Arc<SessionEntry>,
    _permit: OwnedMutexGuard<()>,
}

impl SessionGuard {
    /// Cancellation token current at guard acquisition
    pub fn cancel_token(&self) -> CancellationToken {
        self.entry.token()
    }
}

/// Registry of per-session entries
#[derive(Debug)]
pub struct SessionRegistry {
    entries: StdMutex<HashMap<SessionKey, Arc<SessionEntry>>>,
    lock_wait: Duration,
}

impl SessionRegistry {
    pub fn new(lock_wait: Duration) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            lock_wait,
        }
    }

    fn entry(&self, key: &SessionKey) -> Arc<SessionEntry> {
        let mut entries = self.entries.lock().expect("registry map lock poisoned");
        entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(SessionEntry::new()))
            .clone()
    }

    /// Acquire the session lock, bounded by the configured wait
    ///
    /// Exceeding the bound surfaces as `Error::LockTimeout`: a retryable
    /// infrastructure error with session state unchanged.
    pub async fn lock(&self, key: &SessionKey) -> Result<SessionGuard> {
        let entry = self.entry(key);
        let permit = tokio::time::timeout(self.lock_wait, entry.lock.clone().lock_owned())
            .await
            .map_err(|_| {
                Error::LockTimeout(format!(
                    "session {} lock not acquired within {} ms",
                    key,
                    self.lock_wait.as_millis()
                ))
            })?;

        Ok(SessionGuard {
            entry,
            _permit: permit,
        })
    }

    /// Current cancellation token for a session
    pub fn cancel_token(&self, key: &SessionKey) -> CancellationToken {
        self.entry(key).token()
    }

    /// Signal cancellation to any in-flight work for a session
    ///
    /// Safe to call without the session lock: the token is the one piece
    /// of state the coordinator polls at its suspension points.
    pub fn signal_cancel(&self, key: &SessionKey) {
        self.entry(key).token().cancel();
    }

    /// Replace a cancelled token so a reset session can dispatch again
    pub fn reset_cancel_token(&self, key: &SessionKey) -> CancellationToken {
        let entry = self.entry(key);
        let fresh = CancellationToken::new();
        *entry.cancel.write().expect("cancel token lock poisoned") = fresh.clone();
        fresh
    }

    /// Number of tracked sessions (diagnostics)
    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
