//! Per-deployment planning locks.
//!
//! A planning pass and the commit of its reservations must not overlap with
//! another pass for the same deployment. Different deployments lock
//! independently; they only meet in the lease table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Registry of deployment locks. Cheap to clone; clones share locks.
///
/// An entry lives only while a guard or a waiter refers to it.
#[derive(Clone, Default)]
pub struct DeploymentLocks {
    locks: LockMap,
}

/// Proof that the caller holds the lock for one deployment.
/// The lock is released on drop.
pub struct DeploymentGuard {
    deployment: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl DeploymentGuard {
    pub fn deployment(&self) -> &str {
        &self.deployment
    }
}

impl Drop for DeploymentGuard {
    fn drop(&mut self) {
        // Unlock first so the map holds the last reference when nobody waits.
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.deployment)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.deployment);
            debug!(deployment = %self.deployment, "deployment lock pruned");
        }
    }
}

impl std::fmt::Debug for DeploymentGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentGuard")
            .field("deployment", &self.deployment)
            .finish()
    }
}

impl DeploymentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deployments with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn guard(&self, deployment: &str, guard: OwnedMutexGuard<()>) -> DeploymentGuard {
        debug!(deployment, "deployment lock acquired");
        DeploymentGuard {
            deployment: deployment.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    fn lock_for(&self, deployment: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(deployment.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait until `deployment` is free and lock it.
    pub async fn acquire(&self, deployment: &str) -> DeploymentGuard {
        let guard = self.lock_for(deployment).lock_owned().await;
        self.guard(deployment, guard)
    }

    /// Lock `deployment` only if nobody holds it right now.
    pub fn try_acquire(&self, deployment: &str) -> Option<DeploymentGuard> {
        let guard = self.lock_for(deployment).try_lock_owned().ok()?;
        Some(self.guard(deployment, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_deployment_is_exclusive() {
        let locks = DeploymentLocks::new();
        let guard = locks.acquire("cf").await;
        assert_eq!(guard.deployment(), "cf");
        assert!(locks.try_acquire("cf").is_none());
        drop(guard);
        assert!(locks.try_acquire("cf").is_some());
    }

    #[tokio::test]
    async fn deployments_lock_independently() {
        let locks = DeploymentLocks::new();
        let _cf = locks.acquire("cf").await;
        assert!(locks.try_acquire("redis").is_some());
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let locks = DeploymentLocks::new();
        let guard = locks.acquire("cf").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let guard = locks.acquire("cf").await;
                guard.deployment().to_string()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);

        let name = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "cf");
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn released_deployments_leave_no_entry() {
        let locks = DeploymentLocks::new();
        for name in ["a", "b", "c"] {
            let guard = locks.acquire(name).await;
            assert_eq!(locks.len(), 1);
            drop(guard);
        }
        assert!(locks.is_empty());

        // A failed try_acquire must not strand an entry either.
        let held = locks.acquire("cf").await;
        assert!(locks.try_acquire("cf").is_none());
        assert_eq!(locks.len(), 1);
        drop(held);
        assert!(locks.is_empty());
    }
}
