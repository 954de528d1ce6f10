//! Named advisory locks.
//!
//! Short critical sections (queue inspection, dispatch, result merges) run
//! under a lock keyed by name. Acquisition is bounded by a timeout; the lock
//! is released when the returned [`LockGuard`] drops.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {name}")]
    Timeout { name: String, waited: Duration },
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Lock service.
pub trait AdvisoryLocks: Send + Sync {
    /// Block until `name` is held or `timeout` elapses.
    fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard, LockError>;
}

impl<L> AdvisoryLocks for Arc<L>
where
    L: AdvisoryLocks + ?Sized,
{
    fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        (**self).acquire(name, timeout)
    }
}

/// Held lock; releases on drop.
pub struct LockGuard {
    name: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(name: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            debug!(lock = %self.name, "lock released");
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

fn poisoned<T>(_: T) -> LockError {
    LockError::Backend("lock table poisoned".to_string())
}

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Process-local locks for tests/dev and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLocks {
    table: Arc<LockTable>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.table
            .held
            .lock()
            .map(|held| held.contains(name))
            .unwrap_or(false)
    }
}

impl AdvisoryLocks for InMemoryLocks {
    fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let mut held = self.table.held.lock().map_err(poisoned)?;

        while held.contains(name) {
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    waited,
                });
            }
            let (guard, _) = self
                .table
                .released
                .wait_timeout(held, timeout - waited)
                .map_err(poisoned)?;
            held = guard;
        }
        held.insert(name.to_string());
        drop(held);
        debug!(lock = %name, "lock acquired");

        let table = self.table.clone();
        let owned = name.to_string();
        Ok(LockGuard::new(name, move || {
            if let Ok(mut held) = table.held.lock() {
                held.remove(&owned);
            }
            table.released.notify_all();
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn guard_releases_on_drop() {
        let locks = InMemoryLocks::new();
        {
            let guard = locks.acquire("bundle_generation_unit_bundle", Duration::from_millis(10)).unwrap();
            assert_eq!(guard.name(), "bundle_generation_unit_bundle");
            assert!(locks.is_held("bundle_generation_unit_bundle"));
        }
        assert!(!locks.is_held("bundle_generation_unit_bundle"));
    }

    #[test]
    fn contended_lock_times_out() {
        let locks = InMemoryLocks::new();
        let _held = locks.acquire("a", Duration::from_millis(10)).unwrap();

        let err = locks.acquire("a", Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { ref name, .. } if name == "a"));
        assert!(locks.acquire("b", Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let locks = InMemoryLocks::new();
        let held = locks.acquire("a", Duration::from_millis(10)).unwrap();

        let contender = locks.clone();
        let waiter = thread::spawn(move || contender.acquire("a", Duration::from_secs(5)).map(|_| ()));
        thread::sleep(Duration::from_millis(20));
        drop(held);

        assert!(waiter.join().unwrap().is_ok());
        assert!(!locks.is_held("a"));
    }
}
