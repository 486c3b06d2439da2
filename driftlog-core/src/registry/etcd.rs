use super::{
    LeaseAction, LeaseCreate, LeaseDelete, LeaseEvent, LeaseRefresh, LeaseRegistry, LeaseWatch,
    namespace_prefix, namespaced_key, strip_namespace, watch_channel,
};
use crate::Result;
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, KeyValue, PutOptions, Txn, TxnOp,
    TxnOpResponse, WatchOptions,
};
use std::time::Duration;

/// Lease registry backed by etcd.
///
/// Each created entry is bound to its own etcd lease, granted with the
/// requested TTL rounded up to whole seconds. Refreshing sends a keep-alive
/// for that lease, so the TTL passed to `refresh` is the one fixed at grant.
#[derive(Clone)]
pub struct EtcdLeaseRegistry {
    client: Client,
    prefix: String,
}

impl EtcdLeaseRegistry {
    pub async fn new(endpoints: &[String], namespace: &str) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        tracing::info!("Connected to etcd at {:?}", endpoints);

        Ok(Self {
            client,
            prefix: namespace_prefix(namespace),
        })
    }

    fn key(&self, key: &str) -> String {
        namespaced_key(&self.prefix, key)
    }

    /// Current owner of `key` and the etcd lease it is bound to.
    async fn current(&self, key: &str) -> Result<Option<(String, i64)>> {
        let mut client = self.client.clone();
        let response = client.get(self.key(key), None).await?;

        match response.kvs().first() {
            Some(kv) => Ok(Some((kv.value_str()?.to_string(), kv.lease()))),
            None => Ok(None),
        }
    }

    fn event_from_kv(&self, action: LeaseAction, kv: &KeyValue) -> Option<LeaseEvent> {
        let key = strip_namespace(&self.prefix, kv.key_str().ok()?)?;
        let value = kv.value_str().ok().map(str::to_string);
        Some(LeaseEvent::new(action, key, value))
    }
}

fn ttl_seconds(ttl: Duration) -> i64 {
    let millis = ttl.as_millis().max(1);
    i64::try_from(millis.div_ceil(1000)).unwrap_or(i64::MAX)
}

#[async_trait]
impl LeaseRegistry for EtcdLeaseRegistry {
    async fn create(&self, key: &str, value: &str, ttl: Duration) -> Result<LeaseCreate> {
        let mut client = self.client.clone();
        let full_key = self.key(key);

        let lease_id = if ttl.is_zero() {
            None
        } else {
            Some(client.lease_grant(ttl_seconds(ttl), None).await?.id())
        };

        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                full_key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                full_key.clone(),
                value,
                lease_id.map(|id| PutOptions::new().with_lease(id)),
            )])
            .or_else(vec![TxnOp::get(full_key.clone(), None)]);

        let response = client.txn(txn).await?;
        if response.succeeded() {
            return Ok(LeaseCreate::Created);
        }

        if let Some(id) = lease_id {
            if let Err(error) = client.lease_revoke(id).await {
                tracing::debug!("Failed to revoke unused etcd lease {}: {}", id, error);
            }
        }

        let mut owner = String::new();
        for op in response.op_responses() {
            if let TxnOpResponse::Get(get) = op {
                if let Some(kv) = get.kvs().first() {
                    owner = kv.value_str()?.to_string();
                }
            }
        }

        Ok(LeaseCreate::AlreadyExists { owner })
    }

    async fn refresh(&self, key: &str, value: &str, _ttl: Duration) -> Result<LeaseRefresh> {
        let Some((owner, lease_id)) = self.current(key).await? else {
            return Ok(LeaseRefresh::Lost);
        };
        if owner != value {
            return Ok(LeaseRefresh::Lost);
        }
        if lease_id == 0 {
            // Pinned entry without an etcd lease.
            return Ok(LeaseRefresh::Refreshed);
        }

        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client.lease_keep_alive(lease_id).await?;
        keeper.keep_alive().await?;

        match responses.message().await? {
            Some(response) if response.ttl() > 0 => Ok(LeaseRefresh::Refreshed),
            _ => Ok(LeaseRefresh::Lost),
        }
    }

    async fn delete(&self, key: &str, value: &str) -> Result<LeaseDelete> {
        let mut client = self.client.clone();
        let full_key = self.key(key);

        let txn = Txn::new()
            .when(vec![Compare::value(full_key.clone(), CompareOp::Equal, value)])
            .and_then(vec![
                TxnOp::get(full_key.clone(), None),
                TxnOp::delete(full_key.clone(), None),
            ]);

        let response = client.txn(txn).await?;
        if !response.succeeded() {
            return Ok(LeaseDelete::NotOwner);
        }

        for op in response.op_responses() {
            if let TxnOpResponse::Get(get) = op {
                let lease_id = get.kvs().first().map(|kv| kv.lease()).unwrap_or(0);
                if lease_id != 0 {
                    if let Err(error) = client.lease_revoke(lease_id).await {
                        tracing::debug!("Failed to revoke etcd lease {}: {}", lease_id, error);
                    }
                }
            }
        }

        Ok(LeaseDelete::Deleted)
    }

    async fn subscribe(&self, prefix: &str) -> Result<LeaseWatch> {
        let mut client = self.client.clone();
        let full_prefix = self.key(prefix);

        let snapshot = client
            .get(full_prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = snapshot.header().map(|header| header.revision()).unwrap_or(0);
        let initial = snapshot
            .kvs()
            .iter()
            .filter_map(|kv| self.event_from_kv(LeaseAction::Get, kv))
            .collect();

        let (watcher, mut stream) = client
            .watch(
                full_prefix,
                Some(
                    WatchOptions::new()
                        .with_prefix()
                        .with_start_revision(revision + 1),
                ),
            )
            .await?;

        let (sender, receiver) = watch_channel();
        let registry = self.clone();
        tokio::spawn(async move {
            // Dropping the watcher cancels the watch.
            let _watcher = watcher;

            loop {
                let response = match stream.message().await {
                    Ok(Some(response)) => response,
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!("etcd lease watch ended: {}", error);
                        break;
                    }
                };

                for event in response.events() {
                    let Some(kv) = event.kv() else {
                        continue;
                    };
                    let action = match event.event_type() {
                        EventType::Put if kv.version() == 1 => LeaseAction::Create,
                        EventType::Put => LeaseAction::Update,
                        EventType::Delete => LeaseAction::Delete,
                    };
                    if let Some(lease_event) = registry.event_from_kv(action, kv) {
                        if sender.send(lease_event).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(LeaseWatch::new(prefix, initial, receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_seconds_rounds_up() {
        assert_eq!(ttl_seconds(Duration::from_millis(1)), 1);
        assert_eq!(ttl_seconds(Duration::from_millis(1000)), 1);
        assert_eq!(ttl_seconds(Duration::from_millis(1001)), 2);
        assert_eq!(ttl_seconds(Duration::from_secs(10)), 10);
    }

    #[test]
    fn test_namespaced_keys_round_trip() {
        let prefix = namespace_prefix("default/");
        let stored = namespaced_key(&prefix, "/gazette/persister_locks/abc");
        assert_eq!(stored, "/default/gazette/persister_locks/abc");
        assert_eq!(
            strip_namespace(&prefix, &stored).as_deref(),
            Some("/gazette/persister_locks/abc")
        );
        assert_eq!(strip_namespace(&prefix, "/defaultish/x"), None);
    }
}
