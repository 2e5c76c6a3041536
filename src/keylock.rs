//! Per-key mutual exclusion for limiter state updates.

use crate::error::{RateLimitError, RateLimitResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout_at;

/// One slot in the lock table.
struct LockSlot {
    lock: Arc<Mutex<()>>,
    last_used: Instant,
}

/// Table of per-key async mutexes.
///
/// Every live key maps to one mutex; holding its guard is the per-key
/// critical section that serializes read-modify-write cycles on that key's
/// stored state. Slots are created on first acquire and reclaimed by
/// [`sweep`](Self::sweep) once idle and unreferenced; a racing acquire after
/// eviction simply creates a fresh slot.
pub struct KeyLocks {
    slots: StdMutex<HashMap<String, LockSlot>>,
}

impl KeyLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: StdMutex::new(HashMap::new()),
        }
    }

    /// Acquire the critical section for `key`.
    ///
    /// Waits until the section is free or `deadline` elapses; the table lock
    /// itself is only held while looking up the slot, never across the wait.
    pub async fn acquire(
        &self,
        key: &str,
        deadline: Option<tokio::time::Instant>,
    ) -> RateLimitResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.entry(key.to_string()).or_insert_with(|| LockSlot {
                lock: Arc::new(Mutex::new(())),
                last_used: Instant::now(),
            });
            slot.last_used = Instant::now();
            Arc::clone(&slot.lock)
        };

        match deadline {
            Some(at) => timeout_at(at, lock.lock_owned())
                .await
                .map_err(|_| RateLimitError::Cancelled {
                    waiting_on: "per-key section",
                }),
            None => Ok(lock.lock_owned().await),
        }
    }

    /// Evict slots idle for at least `max_idle` with no holder or waiter.
    ///
    /// Returns the number of slots removed.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap();
        let before = slots.len();

        slots.retain(|_, slot| {
            Arc::strong_count(&slot.lock) > 1 || now.duration_since(slot.last_used) < max_idle
        });

        before - slots.len()
    }

    /// Number of live slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Whether the table has no live slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLocks").field("slots", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::Instant as TokioInstant;

    #[tokio::test]
    async fn test_acquire_creates_and_reuses_slots() {
        let locks = KeyLocks::new();

        let guard = locks.acquire("a", None).await.unwrap();
        assert_eq!(locks.len(), 1);
        drop(guard);

        let _guard = locks.acquire("a", None).await.unwrap();
        assert_eq!(locks.len(), 1);

        let _other = locks.acquire("b", None).await.unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyLocks::new());
        let in_section = Arc::new(AtomicU64::new(0));
        let max_seen = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = Arc::clone(&locks);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("hot", None).await.unwrap();
                let current = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_elapses_while_waiting() {
        let locks = KeyLocks::new();

        let _held = locks.acquire("k", None).await.unwrap();

        let deadline = TokioInstant::now() + Duration::from_millis(20);
        let err = locks.acquire("k", Some(deadline)).await.unwrap_err();
        assert!(matches!(
            err,
            RateLimitError::Cancelled {
                waiting_on: "per-key section"
            }
        ));
    }

    #[tokio::test]
    async fn test_sweep_keeps_held_slots() {
        let locks = KeyLocks::new();

        let guard = locks.acquire("held", None).await.unwrap();
        locks.acquire("idle", None).await.unwrap();
        assert_eq!(locks.len(), 2);

        let removed = locks.sweep(Duration::ZERO);
        assert_eq!(removed, 1);
        assert_eq!(locks.len(), 1);
        drop(guard);

        let removed = locks.sweep(Duration::ZERO);
        assert_eq!(removed, 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_respects_idle_window() {
        let locks = KeyLocks::new();
        locks.acquire("fresh", None).await.unwrap();

        let removed = locks.sweep(Duration::from_secs(60));
        assert_eq!(removed, 0);
        assert_eq!(locks.len(), 1);
    }
}
