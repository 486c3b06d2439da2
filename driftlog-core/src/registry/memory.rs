use super::{
    LeaseAction, LeaseCreate, LeaseDelete, LeaseEvent, LeaseRefresh, LeaseRegistry, LeaseWatch,
    watch_channel,
};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

struct MemoryLease {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process lease registry with the same contract as the networked
/// backends. Expired entries are reaped on the next access and reported as
/// [`LeaseAction::Expire`].
pub struct MemoryLeaseRegistry {
    leases: Mutex<HashMap<String, MemoryLease>>,
    events: broadcast::Sender<LeaseEvent>,
}

impl Default for MemoryLeaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLeaseRegistry {
    pub fn new() -> Self {
        let (events, _) = watch_channel();
        Self {
            leases: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Current value of `key`, if present and unexpired.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut leases = self.lock();
        self.reap_expired(&mut leases);
        leases.get(key).map(|lease| lease.value.clone())
    }

    pub fn len(&self) -> usize {
        let mut leases = self.lock();
        self.reap_expired(&mut leases);
        leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryLease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reap_expired(&self, leases: &mut HashMap<String, MemoryLease>) {
        let now = Instant::now();
        let expired: Vec<String> = leases
            .iter()
            .filter(|(_, lease)| lease.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            if let Some(lease) = leases.remove(&key) {
                tracing::debug!("lease {} held by {} expired", key, lease.value);
                self.publish(LeaseAction::Expire, &key, Some(lease.value));
            }
        }
    }

    fn publish(&self, action: LeaseAction, key: &str, value: Option<String>) {
        // No subscribers is fine.
        let _ = self.events.send(LeaseEvent::new(action, key, value));
    }
}

fn expiry(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Some(Instant::now() + ttl)
    }
}

#[async_trait]
impl LeaseRegistry for MemoryLeaseRegistry {
    async fn create(&self, key: &str, value: &str, ttl: Duration) -> Result<LeaseCreate> {
        let mut leases = self.lock();
        self.reap_expired(&mut leases);

        if let Some(existing) = leases.get(key) {
            return Ok(LeaseCreate::AlreadyExists {
                owner: existing.value.clone(),
            });
        }

        leases.insert(
            key.to_string(),
            MemoryLease {
                value: value.to_string(),
                expires_at: expiry(ttl),
            },
        );
        self.publish(LeaseAction::Create, key, Some(value.to_string()));
        Ok(LeaseCreate::Created)
    }

    async fn refresh(&self, key: &str, value: &str, ttl: Duration) -> Result<LeaseRefresh> {
        let mut leases = self.lock();
        self.reap_expired(&mut leases);

        match leases.get_mut(key) {
            Some(lease) if lease.value == value => {
                lease.expires_at = expiry(ttl);
                self.publish(LeaseAction::Update, key, Some(value.to_string()));
                Ok(LeaseRefresh::Refreshed)
            }
            _ => Ok(LeaseRefresh::Lost),
        }
    }

    async fn delete(&self, key: &str, value: &str) -> Result<LeaseDelete> {
        let mut leases = self.lock();
        self.reap_expired(&mut leases);

        match leases.get(key) {
            Some(lease) if lease.value == value => {
                leases.remove(key);
                self.publish(LeaseAction::Delete, key, Some(value.to_string()));
                Ok(LeaseDelete::Deleted)
            }
            _ => Ok(LeaseDelete::NotOwner),
        }
    }

    async fn subscribe(&self, prefix: &str) -> Result<LeaseWatch> {
        let mut leases = self.lock();
        self.reap_expired(&mut leases);

        let mut initial: Vec<LeaseEvent> = leases
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, lease)| {
                LeaseEvent::new(LeaseAction::Get, key.clone(), Some(lease.value.clone()))
            })
            .collect();
        initial.sort_by(|a, b| a.key.cmp(&b.key));

        // Subscribing under the lock keeps the snapshot and the feed gap-free.
        let receiver = self.events.subscribe();
        Ok(LeaseWatch::new(prefix, initial, receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "/locks/fragment";

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let registry = MemoryLeaseRegistry::new();

        let created = registry.create(KEY, "broker-a", Duration::ZERO).await.unwrap();
        assert_eq!(created, LeaseCreate::Created);

        let again = registry.create(KEY, "broker-b", Duration::ZERO).await.unwrap();
        assert_eq!(
            again,
            LeaseCreate::AlreadyExists {
                owner: "broker-a".to_string()
            }
        );
        assert_eq!(registry.get(KEY).as_deref(), Some("broker-a"));
    }

    #[tokio::test]
    async fn test_refresh_and_delete_compare_owner() {
        let registry = MemoryLeaseRegistry::new();
        registry.create(KEY, "broker-a", Duration::ZERO).await.unwrap();

        assert_eq!(
            registry.refresh(KEY, "broker-b", Duration::ZERO).await.unwrap(),
            LeaseRefresh::Lost
        );
        assert_eq!(
            registry.delete(KEY, "broker-b").await.unwrap(),
            LeaseDelete::NotOwner
        );
        assert_eq!(
            registry.refresh(KEY, "broker-a", Duration::ZERO).await.unwrap(),
            LeaseRefresh::Refreshed
        );
        assert_eq!(
            registry.delete(KEY, "broker-a").await.unwrap(),
            LeaseDelete::Deleted
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_reclaimed() {
        let registry = MemoryLeaseRegistry::new();
        registry
            .create(KEY, "broker-a", Duration::from_millis(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            registry.refresh(KEY, "broker-a", Duration::from_secs(1)).await.unwrap(),
            LeaseRefresh::Lost
        );
        assert_eq!(
            registry.create(KEY, "broker-b", Duration::ZERO).await.unwrap(),
            LeaseCreate::Created
        );
    }

    #[tokio::test]
    async fn test_subscribe_reports_snapshot_then_changes() {
        let registry = MemoryLeaseRegistry::new();
        registry.create(KEY, "broker-a", Duration::ZERO).await.unwrap();
        registry
            .create("/elsewhere/key", "broker-a", Duration::ZERO)
            .await
            .unwrap();

        let mut watch = registry.subscribe("/locks/").await.unwrap();
        registry.delete(KEY, "broker-a").await.unwrap();
        registry.delete("/elsewhere/key", "broker-a").await.unwrap();

        let events = watch.drain();
        assert_eq!(
            events,
            vec![
                LeaseEvent::new(LeaseAction::Get, KEY, Some("broker-a".to_string())),
                LeaseEvent::new(LeaseAction::Delete, KEY, Some("broker-a".to_string())),
            ]
        );
    }
}
