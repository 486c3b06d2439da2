use super::{
    LeaseAction, LeaseCreate, LeaseDelete, LeaseEvent, LeaseRefresh, LeaseRegistry, LeaseWatch,
    namespace_prefix, namespaced_key, strip_namespace, watch_channel,
};
use crate::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::broadcast;

const REFRESH_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    if ARGV[2] == '0' then
        redis.call('PERSIST', KEYS[1])
    else
        redis.call('PEXPIRE', KEYS[1], ARGV[2])
    end
    return 1
end
return 0
"#;

const DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Lease registry backed by a single redis instance.
///
/// Entries are plain string keys with a millisecond expiry. Refresh and
/// delete compare the stored owner inside a Lua script. Redis offers no
/// change feed here, so subscriptions observe only operations issued
/// through this registry.
pub struct RedisLeaseRegistry {
    conn: ConnectionManager,
    prefix: String,
    events: broadcast::Sender<LeaseEvent>,
}

impl RedisLeaseRegistry {
    pub async fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to redis lease registry at {}", url);

        let (events, _) = watch_channel();
        Ok(Self {
            conn,
            prefix: namespace_prefix(namespace),
            events,
        })
    }

    fn key(&self, key: &str) -> String {
        namespaced_key(&self.prefix, key)
    }

    fn publish(&self, action: LeaseAction, key: &str, value: &str) {
        let _ = self
            .events
            .send(LeaseEvent::new(action, key, Some(value.to_string())));
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// Escape glob metacharacters for a `KEYS` pattern.
fn glob_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl LeaseRegistry for RedisLeaseRegistry {
    async fn create(&self, key: &str, value: &str, ttl: Duration) -> Result<LeaseCreate> {
        let mut conn = self.conn.clone();
        let full_key = self.key(key);

        let mut cmd = redis::cmd("SET");
        cmd.arg(&full_key).arg(value).arg("NX");
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }

        let created: Option<String> = cmd.query_async(&mut conn).await?;
        if created.is_some() {
            self.publish(LeaseAction::Create, key, value);
            return Ok(LeaseCreate::Created);
        }

        let owner: Option<String> = redis::cmd("GET")
            .arg(&full_key)
            .query_async(&mut conn)
            .await?;

        Ok(LeaseCreate::AlreadyExists {
            owner: owner.unwrap_or_default(),
        })
    }

    async fn refresh(&self, key: &str, value: &str, ttl: Duration) -> Result<LeaseRefresh> {
        let mut conn = self.conn.clone();

        let refreshed: i64 = redis::Script::new(REFRESH_SCRIPT)
            .key(self.key(key))
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        if refreshed == 1 {
            self.publish(LeaseAction::Update, key, value);
            Ok(LeaseRefresh::Refreshed)
        } else {
            Ok(LeaseRefresh::Lost)
        }
    }

    async fn delete(&self, key: &str, value: &str) -> Result<LeaseDelete> {
        let mut conn = self.conn.clone();

        let deleted: i64 = redis::Script::new(DELETE_SCRIPT)
            .key(self.key(key))
            .arg(value)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 1 {
            self.publish(LeaseAction::Delete, key, value);
            Ok(LeaseDelete::Deleted)
        } else {
            Ok(LeaseDelete::NotOwner)
        }
    }

    async fn subscribe(&self, prefix: &str) -> Result<LeaseWatch> {
        let mut conn = self.conn.clone();
        let receiver = self.events.subscribe();

        let pattern = format!("{}*", glob_escape(&self.key(prefix)));
        let mut keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut conn)
            .await?;
        keys.sort();

        let mut initial = Vec::with_capacity(keys.len());
        for stored in keys {
            let value: Option<String> = redis::cmd("GET")
                .arg(&stored)
                .query_async(&mut conn)
                .await?;
            if let (Some(key), Some(value)) = (strip_namespace(&self.prefix, &stored), value) {
                initial.push(LeaseEvent::new(LeaseAction::Get, key, Some(value)));
            }
        }

        Ok(LeaseWatch::new(prefix, initial, receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_escape() {
        assert_eq!(glob_escape("/ns/locks/"), "/ns/locks/");
        assert_eq!(glob_escape("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_ttl_millis() {
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
        assert_eq!(ttl_millis(Duration::ZERO), 0);
    }
}
