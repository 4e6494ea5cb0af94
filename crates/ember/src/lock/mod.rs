//! Cluster-wide named leases.
//!
//! Every replica runs the same periodic duties. A duty body only runs on the
//! replica that holds the lease named after it; the others skip that tick.
//! Leases expire on their own, so a replica that dies mid-duty cannot block
//! the duty forever.

mod error;
mod memory;
mod sqlite;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::{LockError, LockResult};
pub use memory::InMemoryLockProvider;
pub use sqlite::SqliteLockProvider;

/// Where leases are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// The shared database. Required when several replicas run.
    Database,
    /// Process memory. Single replica only.
    #[default]
    Memory,
}

/// Lease settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub provider: LockBackend,
    /// Lease expiry. Another replica may take the lease afterwards.
    pub lock_at_most_for_seconds: u64,
    /// Minimum time a lease stays held once acquired.
    pub lock_at_least_for_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            provider: LockBackend::Memory,
            lock_at_most_for_seconds: 600,
            lock_at_least_for_seconds: 10,
        }
    }
}

impl LockConfig {
    pub fn lease(&self) -> LeaseConfig {
        LeaseConfig {
            lock_at_most_for: Duration::from_secs(self.lock_at_most_for_seconds),
            lock_at_least_for: Duration::from_secs(self.lock_at_least_for_seconds),
        }
    }
}

/// Lease durations applied on acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    pub lock_at_most_for: Duration,
    pub lock_at_least_for: Duration,
}

impl LeaseConfig {
    pub fn validate(&self) -> LockResult<()> {
        if self.lock_at_least_for > self.lock_at_most_for {
            return Err(LockError::InvalidConfig(format!(
                "lock_at_least_for ({:?}) exceeds lock_at_most_for ({:?})",
                self.lock_at_least_for, self.lock_at_most_for
            )));
        }
        Ok(())
    }
}

/// A held lease. Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub locked_by: String,
    pub locked_at: i64,
    pub lock_until: i64,
    pub lock_at_least_for: Duration,
}

impl Lease {
    /// `lock_until` to write on release.
    pub(crate) fn release_until(&self, now: i64) -> i64 {
        now.max(self.locked_at.saturating_add(millis(self.lock_at_least_for)))
    }
}

/// Storage for leases shared between replicas.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Take the lease `name` for `owner`. Returns `None` when another holder's
    /// lease has not expired yet.
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        config: &LeaseConfig,
    ) -> LockResult<Option<Lease>>;

    /// Give the lease back. A no-op when the lease has since been taken by
    /// someone else.
    async fn release(&self, lease: &Lease) -> LockResult<()>;
}

/// Runs closures under named leases.
#[derive(Clone)]
pub struct LockCoordinator {
    provider: Arc<dyn LockProvider>,
    replica_id: String,
    lease: LeaseConfig,
}

impl LockCoordinator {
    pub fn new(
        provider: Arc<dyn LockProvider>,
        replica_id: impl Into<String>,
        lease: LeaseConfig,
    ) -> LockResult<Self> {
        lease.validate()?;
        Ok(Self {
            provider,
            replica_id: replica_id.into(),
            lease,
        })
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// Run `f` if the lease `name` can be taken, releasing it afterwards
    /// whether `f` succeeded or not.
    ///
    /// Returns `Ok(None)` without calling `f` when another replica holds the
    /// lease.
    pub async fn try_run_exclusive<T, F, Fut>(&self, name: &str, f: F) -> anyhow::Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let Some(lease) = self
            .provider
            .try_acquire(name, &self.replica_id, &self.lease)
            .await?
        else {
            debug!("Lock {} is held elsewhere, skipping", name);
            return Ok(None);
        };

        debug!("Lock {} acquired by {}", name, self.replica_id);
        let result = f().await;

        if let Err(e) = self.provider.release(&lease).await {
            warn!("Failed to release lock {}: {}", name, e);
        }

        result.map(Some)
    }
}

/// Identifier of this process among the replicas.
pub fn replica_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "ember".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn lease(at_most: u64, at_least: u64) -> LeaseConfig {
        LeaseConfig {
            lock_at_most_for: Duration::from_secs(at_most),
            lock_at_least_for: Duration::from_secs(at_least),
        }
    }

    fn coordinator(provider: &Arc<InMemoryLockProvider>, replica: &str) -> LockCoordinator {
        LockCoordinator::new(provider.clone(), replica, lease(60, 0)).unwrap()
    }

    #[test]
    fn minimum_hold_exceeding_expiry_is_rejected() {
        assert!(lease(10, 30).validate().is_err());
        assert!(lease(30, 30).validate().is_ok());
        assert!(
            LockCoordinator::new(Arc::new(InMemoryLockProvider::new()), "a", lease(1, 2)).is_err()
        );
    }

    #[test]
    fn release_honours_minimum_hold() {
        let lease = Lease {
            name: "duty".to_string(),
            locked_by: "a".to_string(),
            locked_at: 1_000,
            lock_until: 61_000,
            lock_at_least_for: Duration::from_secs(10),
        };
        assert_eq!(lease.release_until(2_000), 11_000);
        assert_eq!(lease.release_until(20_000), 20_000);
    }

    #[test]
    fn replica_ids_are_unique() {
        assert_ne!(replica_id(), replica_id());
    }

    #[tokio::test]
    async fn concurrent_replicas_run_the_body_once() {
        let provider = Arc::new(InMemoryLockProvider::new());
        let first = coordinator(&provider, "replica-a");
        let second = coordinator(&provider, "replica-b");
        let runs = Arc::new(AtomicUsize::new(0));

        let (entered_tx, entered_rx) = oneshot::channel();
        let (finish_tx, finish_rx) = oneshot::channel::<()>();
        let holder = {
            let runs = runs.clone();
            tokio::spawn(async move {
                first
                    .try_run_exclusive("trackRunningSessions", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        let _ = entered_tx.send(());
                        let _ = finish_rx.await;
                        Ok(())
                    })
                    .await
            })
        };
        entered_rx.await.unwrap();

        let skipped = second
            .try_run_exclusive("trackRunningSessions", || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert!(skipped.is_none());

        finish_tx.send(()).unwrap();
        assert_eq!(holder.await.unwrap().unwrap(), Some(()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_names_do_not_exclude_each_other() {
        let provider = Arc::new(InMemoryLockProvider::new());
        let coordinator = coordinator(&provider, "replica-a");

        let outer = coordinator
            .try_run_exclusive("keepPermanentSession", || async {
                coordinator
                    .try_run_exclusive("handleTimeoutSessions", || async { Ok(7) })
                    .await
            })
            .await
            .unwrap();
        assert_eq!(outer, Some(Some(7)));
    }

    #[tokio::test]
    async fn lease_is_released_after_failure() {
        let provider = Arc::new(InMemoryLockProvider::new());
        let first = coordinator(&provider, "replica-a");
        let second = coordinator(&provider, "replica-b");

        let err = first
            .try_run_exclusive("processScheduledSessions", || async {
                Err::<(), _>(anyhow::anyhow!("store unreachable"))
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("store unreachable"));

        let ran = second
            .try_run_exclusive("processScheduledSessions", || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(ran, Some(()));
    }
}
