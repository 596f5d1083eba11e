//! In-process exclusive leases keyed by id.
//!
//! One async mutex per execution id, created on demand and dropped once
//! nobody holds or waits on it. The controller takes the lease around every
//! advance, approve and cancel so no two tasks in this process ever drive
//! the same execution. Cross-process exclusion is the store lease's job.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Per-id async locks.
#[derive(Debug, Default)]
pub struct ExecutionLeases {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ExecutionLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `id`. Ownership ends when the guard drops.
    pub async fn acquire(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Forget the lock for `id` if no guard or waiter references it.
    pub fn prune(&self, id: &Uuid) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let leases = Arc::new(ExecutionLeases::new());
        let id = Uuid::now_v7();

        let guard = leases.acquire(id).await;

        let waiter = {
            let leases = Arc::clone(&leases);
            tokio::spawn(async move {
                let _guard = leases.acquire(id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_ids_are_independent() {
        let leases = ExecutionLeases::new();
        let _a = leases.acquire(Uuid::now_v7()).await;
        let _b = tokio::time::timeout(Duration::from_millis(100), leases.acquire(Uuid::now_v7()))
            .await
            .unwrap();
        assert_eq!(leases.locks.len(), 2);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let leases = ExecutionLeases::new();
        let id = Uuid::now_v7();

        let guard = leases.acquire(id).await;
        leases.prune(&id);
        assert_eq!(leases.locks.len(), 1);

        drop(guard);
        leases.prune(&id);
        assert!(leases.locks.is_empty());
    }
}
