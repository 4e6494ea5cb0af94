//! Process-local lease storage.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Lease, LeaseConfig, LockProvider, LockResult, millis, now_millis};

#[derive(Debug, Clone)]
struct Holder {
    locked_by: String,
    locked_at: i64,
    lock_until: i64,
}

/// Leases kept in memory. Only coordinates tasks sharing this instance.
#[derive(Debug, Default)]
pub struct InMemoryLockProvider {
    leases: Mutex<HashMap<String, Holder>>,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        config: &LeaseConfig,
    ) -> LockResult<Option<Lease>> {
        let now = now_millis();
        let mut leases = self.leases.lock().await;

        if leases.get(name).is_some_and(|holder| holder.lock_until > now) {
            return Ok(None);
        }

        let lock_until = now.saturating_add(millis(config.lock_at_most_for));
        leases.insert(
            name.to_string(),
            Holder {
                locked_by: owner.to_string(),
                locked_at: now,
                lock_until,
            },
        );

        Ok(Some(Lease {
            name: name.to_string(),
            locked_by: owner.to_string(),
            locked_at: now,
            lock_until,
            lock_at_least_for: config.lock_at_least_for,
        }))
    }

    async fn release(&self, lease: &Lease) -> LockResult<()> {
        let mut leases = self.leases.lock().await;
        let owned = leases.get_mut(&lease.name).filter(|holder| {
            holder.locked_by == lease.locked_by && holder.locked_at == lease.locked_at
        });
        if let Some(holder) = owned {
            holder.lock_until = lease.release_until(now_millis());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(at_most: u64, at_least: u64) -> LeaseConfig {
        LeaseConfig {
            lock_at_most_for: Duration::from_secs(at_most),
            lock_at_least_for: Duration::from_secs(at_least),
        }
    }

    #[tokio::test]
    async fn held_lease_blocks_other_owners() {
        let provider = InMemoryLockProvider::new();
        let lease = provider.try_acquire("duty", "a", &config(60, 0)).await.unwrap();
        assert!(lease.is_some());
        assert!(provider.try_acquire("duty", "b", &config(60, 0)).await.unwrap().is_none());
        assert!(provider.try_acquire("other", "b", &config(60, 0)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_and_stale_release_ignored() {
        let provider = InMemoryLockProvider::new();
        let stale = provider
            .try_acquire("duty", "a", &config(0, 0))
            .await
            .unwrap()
            .unwrap();

        let fresh = provider.try_acquire("duty", "b", &config(60, 0)).await.unwrap();
        assert!(fresh.is_some());

        provider.release(&stale).await.unwrap();
        assert!(provider.try_acquire("duty", "c", &config(60, 0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn minimum_hold_survives_release() {
        let provider = InMemoryLockProvider::new();
        let lease = provider
            .try_acquire("duty", "a", &config(60, 30))
            .await
            .unwrap()
            .unwrap();
        provider.release(&lease).await.unwrap();
        assert!(provider.try_acquire("duty", "b", &config(60, 30)).await.unwrap().is_none());

        let lease = provider
            .try_acquire("quick", "a", &config(60, 0))
            .await
            .unwrap()
            .unwrap();
        provider.release(&lease).await.unwrap();
        assert!(provider.try_acquire("quick", "b", &config(60, 0)).await.unwrap().is_some());
    }
}
