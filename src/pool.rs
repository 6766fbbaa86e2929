//! Keyed set of running tail tasks.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};

use tokio_util::{sync::CancellationToken, task::TaskTracker};

#[derive(Debug, Default)]
struct Entry {
    /// Another start was observed while the task was running.
    rearm: bool,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

/// At most one task per container id.
///
/// Every task holds a [`TaskLease`] for its id. A second spawn for an id
/// that still has a lease does not start anything; it only marks the lease
/// so the running task re-checks the container before giving up.
#[derive(Debug, Clone)]
pub struct TaskPool {
    entries: Entries,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl TaskPool {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Spawn the future built by `make` unless a task for `id` is active.
    /// Returns whether a task was spawned.
    pub fn spawn_if_absent<F, Fut>(&self, id: &str, make: F) -> bool
    where
        F: FnOnce(TaskLease, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return false;
        }

        {
            let mut entries = self.entries.lock().expect("Poisoned task pool mutex");
            if let Some(entry) = entries.get_mut(id) {
                entry.rearm = true;
                return false;
            }
            entries.insert(id.to_string(), Entry::default());
        }

        let lease = TaskLease {
            id: id.to_string(),
            entries: Arc::clone(&self.entries),
            released: false,
        };
        self.tracker.spawn(make(lease, self.cancel.child_token()));
        true
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.entries
            .lock()
            .expect("Poisoned task pool mutex")
            .contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.entries.lock().expect("Poisoned task pool mutex").len()
    }

    /// Cancel every task and wait for all of them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Proof that a task owns the slot of a container id.
#[derive(Debug)]
pub struct TaskLease {
    id: String,
    entries: Entries,
    released: bool,
}

impl TaskLease {
    /// Give the slot back. Returns `false` and keeps the slot when a start
    /// was observed since the last call; the caller should then carry on.
    pub fn release(&mut self) -> bool {
        let mut entries = self.entries.lock().expect("Poisoned task pool mutex");
        match entries.get_mut(&self.id) {
            Some(entry) if entry.rearm => {
                entry.rearm = false;
                false
            }
            _ => {
                entries.remove(&self.id);
                self.released = true;
                true
            }
        }
    }
}

impl Drop for TaskLease {
    fn drop(&mut self) {
        if !self.released {
            if let Ok(mut entries) = self.entries.lock() {
                entries.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_spawn_for_same_id_is_ignored() {
        let pool = TaskPool::new(CancellationToken::new());
        let started = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let started = Arc::clone(&started);
            pool.spawn_if_absent("abc", move |lease, cancel| async move {
                let _lease = lease;
                started.fetch_add(1, Ordering::SeqCst);
                cancel.cancelled().await;
            });
        }

        tokio::task::yield_now().await;
        assert_eq!(pool.active_count(), 1);
        assert!(pool.is_active("abc"));

        pool.shutdown().await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_slot_is_freed_when_task_ends() {
        let pool = TaskPool::new(CancellationToken::new());
        assert!(pool.spawn_if_absent("abc", |mut lease, _| async move {
            assert!(lease.release());
        }));

        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.is_active("abc") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("Slot was never freed");

        assert!(pool.spawn_if_absent("abc", |_, _| async {}));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_release_is_refused_once_after_rearm() {
        let pool = TaskPool::new(CancellationToken::new());
        let (lease_tx, lease_rx) = tokio::sync::oneshot::channel();
        pool.spawn_if_absent("abc", move |lease, _| async move {
            let _ = lease_tx.send(lease);
        });
        let mut lease = lease_rx.await.unwrap();

        // Duplicate start while the task is alive
        assert!(!pool.spawn_if_absent("abc", |_, _| async {}));

        assert!(!lease.release());
        assert!(pool.is_active("abc"));
        assert!(lease.release());
        assert!(!pool.is_active("abc"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_slot() {
        let pool = TaskPool::new(CancellationToken::new());
        let (lease_tx, lease_rx) = tokio::sync::oneshot::channel();
        pool.spawn_if_absent("abc", move |lease, _| async move {
            let _ = lease_tx.send(lease);
        });
        let lease = lease_rx.await.unwrap();
        drop(lease);
        assert!(!pool.is_active("abc"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_spawn_after_shutdown() {
        let pool = TaskPool::new(CancellationToken::new());
        pool.shutdown().await;
        assert!(!pool.spawn_if_absent("abc", |_, _| async {}));
    }
}
