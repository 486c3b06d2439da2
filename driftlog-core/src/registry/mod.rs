//! Lease registry: owner-tagged, TTL-bounded lock entries in a coordination
//! service.

mod etcd;
mod factory;
mod keeper;
mod memory;
mod redis;

pub use etcd::EtcdLeaseRegistry;
pub use factory::RegistryBuilder;
pub use keeper::LeaseKeeper;
pub use memory::MemoryLeaseRegistry;
pub use self::redis::RedisLeaseRegistry;

use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseCreate {
    Created,
    AlreadyExists { owner: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseRefresh {
    Refreshed,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDelete {
    Deleted,
    NotOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseAction {
    /// Entry present when the subscription started.
    Get,
    Create,
    Update,
    Delete,
    Expire,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseEvent {
    pub action: LeaseAction,
    pub key: String,
    pub value: Option<String>,
}

impl LeaseEvent {
    pub fn new(action: LeaseAction, key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            action,
            key: key.into(),
            value,
        }
    }
}

/// Coordination service holding fragment leases.
///
/// A zero `ttl` creates an entry that never expires.
#[async_trait]
pub trait LeaseRegistry: Send + Sync {
    /// Create `key` with `value` unless an entry already exists.
    async fn create(&self, key: &str, value: &str, ttl: Duration) -> Result<LeaseCreate>;

    /// Extend `key` if it still holds `value`.
    async fn refresh(&self, key: &str, value: &str, ttl: Duration) -> Result<LeaseRefresh>;

    /// Delete `key` if it still holds `value`.
    async fn delete(&self, key: &str, value: &str) -> Result<LeaseDelete>;

    /// Observe entries below `prefix`: existing entries first, then changes.
    async fn subscribe(&self, prefix: &str) -> Result<LeaseWatch>;
}

/// Stream of [`LeaseEvent`]s for keys below a prefix.
pub struct LeaseWatch {
    prefix: String,
    initial: VecDeque<LeaseEvent>,
    receiver: broadcast::Receiver<LeaseEvent>,
}

impl LeaseWatch {
    pub fn new(
        prefix: impl Into<String>,
        initial: Vec<LeaseEvent>,
        receiver: broadcast::Receiver<LeaseEvent>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            initial: initial.into(),
            receiver,
        }
    }

    /// Wait for the next event. Returns `None` once the registry side of the
    /// feed is gone.
    pub async fn next(&mut self) -> Option<LeaseEvent> {
        if let Some(event) = self.initial.pop_front() {
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("lease watch on {} skipped {} events", self.prefix, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-delivered event, without waiting.
    pub fn try_next(&mut self) -> Option<LeaseEvent> {
        if let Some(event) = self.initial.pop_front() {
            return Some(event);
        }

        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.key.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn drain(&mut self) -> Vec<LeaseEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

fn watch_channel() -> (broadcast::Sender<LeaseEvent>, broadcast::Receiver<LeaseEvent>) {
    broadcast::channel(WATCH_CHANNEL_CAPACITY)
}

fn namespace_prefix(namespace: &str) -> String {
    format!("/{}", namespace.trim_matches('/'))
}

/// Stored form of a lease key: `/namespace/key`. Lease keys are absolute
/// (`/`-prefixed) so the namespace prefix can be stripped back off.
fn namespaced_key(prefix: &str, key: &str) -> String {
    format!("{}/{}", prefix, key.trim_start_matches('/'))
}

fn strip_namespace(prefix: &str, stored: &str) -> Option<String> {
    stored
        .strip_prefix(prefix)
        .filter(|key| key.starts_with('/'))
        .map(str::to_string)
}
