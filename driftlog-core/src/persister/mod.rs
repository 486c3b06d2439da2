//! Pending-fragment tracking and the convergence loop.

mod status;

pub use status::PersisterStatus;

use crate::{
    BlobStore, ContentSum, ConvergeFragmentOperation, ConvergeFragmentOperationRequest,
    ConvergeOutcome, Fragment, LeaseRegistry, LocalSpool, PersisterConfig, Result,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// `(begin, end, sum)`; orders like the fragment's content name.
type FragmentId = (u64, u64, ContentSum);
type PendingKey = (String, FragmentId);

fn pending_key(fragment: &Fragment) -> PendingKey {
    (
        fragment.journal.clone(),
        (fragment.begin, fragment.end, fragment.sum),
    )
}

struct PendingEntry {
    fragment: Fragment,
    failures: u32,
    not_before: Option<Instant>,
}

#[derive(Default)]
struct PendingState {
    journals: BTreeMap<String, BTreeMap<FragmentId, PendingEntry>>,
    in_flight: HashSet<PendingKey>,
    /// Last fragment handed out by `step`.
    cursor: Option<PendingKey>,
}

impl PendingState {
    /// Pending fragments that may be attempted now, in content-name order.
    fn eligible(&self, now: Instant) -> Vec<PendingKey> {
        self.journals
            .iter()
            .flat_map(|(journal, fragments)| {
                fragments
                    .iter()
                    .filter(move |(_, entry)| entry.not_before.is_none_or(|at| at <= now))
                    .map(move |(id, _)| (journal.clone(), *id))
            })
            .filter(|key| !self.in_flight.contains(key))
            .collect()
    }

    fn get(&self, key: &PendingKey) -> Option<&PendingEntry> {
        self.journals.get(&key.0)?.get(&key.1)
    }

    fn get_mut(&mut self, key: &PendingKey) -> Option<&mut PendingEntry> {
        self.journals.get_mut(&key.0)?.get_mut(&key.1)
    }

    fn remove(&mut self, key: &PendingKey) {
        if let Some(fragments) = self.journals.get_mut(&key.0) {
            fragments.remove(&key.1);
            if fragments.is_empty() {
                self.journals.remove(&key.0);
            }
        }
    }
}

/// Result of one convergence attempt, as reported by [`Persister::step`].
#[derive(Debug, Clone, Serialize)]
pub struct ConvergeReport {
    pub journal: String,
    pub content_name: String,
    #[serde(flatten)]
    pub result: ConvergeResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ConvergeResult {
    Completed(ConvergeOutcome),
    Failed { error: String },
}

/// Tracks spooled fragments awaiting persistence and converges them into
/// the blob store.
pub struct Persister {
    config: Arc<PersisterConfig>,
    operation: ConvergeFragmentOperation,
    pending: Mutex<PendingState>,
}

/// Clears a fragment's in-flight mark when its attempt ends, however it
/// ends.
struct InFlight<'a> {
    persister: &'a Persister,
    key: PendingKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.persister.lock().in_flight.remove(&self.key);
    }
}

impl Persister {
    pub fn new(
        config: PersisterConfig,
        registry: Arc<dyn LeaseRegistry>,
        blob_store: BlobStore,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let spool = LocalSpool::new(config.spool_root.clone());
        let operation =
            ConvergeFragmentOperation::new(registry, blob_store, spool, Arc::clone(&config));

        Ok(Self {
            config,
            operation,
            pending: Mutex::new(PendingState::default()),
        })
    }

    pub fn config(&self) -> &PersisterConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `fragment` for persistence. A fragment with the same identity
    /// already pending is kept as is.
    pub fn persist(&self, fragment: Fragment) {
        let (journal, id) = pending_key(&fragment);
        let mut state = self.lock();

        let fragments = state.journals.entry(journal).or_default();
        if fragments.contains_key(&id) {
            return;
        }

        tracing::debug!("Queued {} for persistence", fragment.content_path());
        fragments.insert(
            id,
            PendingEntry {
                fragment,
                failures: 0,
                not_before: None,
            },
        );
    }

    /// Scan the spool and queue every fragment found. Returns how many were
    /// found.
    pub async fn recover_spool(&self) -> Result<usize> {
        let spool = LocalSpool::new(self.config.spool_root.clone());
        let fragments = spool.scan().await?;
        let found = fragments.len();

        for fragment in fragments {
            self.persist(fragment);
        }

        tracing::info!(
            "Recovered {} spooled fragments from {}",
            found,
            spool.root().display()
        );
        Ok(found)
    }

    pub fn status(&self) -> PersisterStatus {
        let state = self.lock();
        let journals = state
            .journals
            .iter()
            .map(|(journal, fragments)| {
                let names = fragments
                    .values()
                    .map(|entry| entry.fragment.content_name())
                    .collect();
                (journal.clone(), names)
            })
            .collect();
        PersisterStatus(journals)
    }

    pub fn pending_len(&self) -> usize {
        self.lock().journals.values().map(BTreeMap::len).sum()
    }

    /// Run the convergence procedure for `fragment`, whether or not it is
    /// pending. A converged fragment is dropped from the pending set.
    pub async fn converge_one(&self, fragment: &Fragment) -> Result<ConvergeOutcome> {
        let key = pending_key(fragment);
        let Some(_in_flight) = self.claim(&key) else {
            return Ok(ConvergeOutcome::LeaseHeld {
                owner: self.config.route_key.clone(),
            });
        };

        let result = self
            .operation
            .run(ConvergeFragmentOperationRequest {
                fragment: fragment.clone(),
            })
            .await;
        self.settle(fragment, &result);
        result
    }

    /// Converge exactly one eligible pending fragment, continuing after the
    /// one handed out last. Returns `None` if nothing is eligible.
    pub async fn step(&self) -> Option<ConvergeReport> {
        let (fragment, _in_flight) = {
            let mut state = self.lock();
            let eligible = state.eligible(Instant::now());
            let next = match &state.cursor {
                Some(cursor) => eligible
                    .iter()
                    .find(|key| *key > cursor)
                    .or_else(|| eligible.first()),
                None => eligible.first(),
            }?
            .clone();

            let fragment = state.get(&next)?.fragment.clone();
            state.cursor = Some(next.clone());
            state.in_flight.insert(next.clone());
            (
                fragment,
                InFlight {
                    persister: self,
                    key: next,
                },
            )
        };

        Some(self.attempt(&fragment).await)
    }

    /// Converge every fragment eligible at the start of the pass, in order.
    pub async fn run_pass(&self) -> Vec<ConvergeReport> {
        self.run_pass_until(None).await
    }

    async fn run_pass_until(
        &self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Vec<ConvergeReport> {
        let keys = self.lock().eligible(Instant::now());
        let mut reports = Vec::with_capacity(keys.len());

        for key in keys {
            if shutdown.is_some_and(|shutdown| *shutdown.borrow()) {
                break;
            }

            let Some(fragment) = self.lock().get(&key).map(|entry| entry.fragment.clone()) else {
                continue;
            };
            let Some(_in_flight) = self.claim(&key) else {
                continue;
            };
            reports.push(self.attempt(&fragment).await);
        }

        reports
    }

    /// Start the timer-driven convergence loop. It runs a pass every
    /// `converge_interval` until `shutdown` turns true or its sender drops.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let persister = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(persister.config.converge_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                "Persister loop started (route {}, every {:?})",
                persister.config.route_key,
                persister.config.converge_interval
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reports = persister.run_pass_until(Some(&shutdown)).await;
                        if !reports.is_empty() {
                            tracing::debug!(
                                "Convergence pass attempted {} fragments, {} still pending",
                                reports.len(),
                                persister.pending_len()
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Persister loop stopped");
        })
    }

    fn claim(&self, key: &PendingKey) -> Option<InFlight<'_>> {
        let mut state = self.lock();
        if !state.in_flight.insert(key.clone()) {
            return None;
        }
        Some(InFlight {
            persister: self,
            key: key.clone(),
        })
    }

    /// Run one claimed attempt and record its result.
    async fn attempt(&self, fragment: &Fragment) -> ConvergeReport {
        let result = self
            .operation
            .run(ConvergeFragmentOperationRequest {
                fragment: fragment.clone(),
            })
            .await;
        self.settle(fragment, &result);

        let result = match result {
            Ok(outcome) => ConvergeResult::Completed(outcome),
            Err(error) => ConvergeResult::Failed {
                error: error.to_string(),
            },
        };

        ConvergeReport {
            journal: fragment.journal.clone(),
            content_name: fragment.content_name(),
            result,
        }
    }

    fn settle(&self, fragment: &Fragment, result: &Result<ConvergeOutcome>) {
        let key = pending_key(fragment);
        let mut state = self.lock();

        match result {
            Ok(outcome) if outcome.is_converged() => state.remove(&key),
            Ok(_) => {}
            Err(error) => {
                let Some(entry) = state.get_mut(&key) else {
                    tracing::error!("Failed to converge {}: {}", fragment.content_path(), error);
                    return;
                };
                entry.failures += 1;
                let backoff = self.config.backoff_for(entry.failures);
                entry.not_before = Some(Instant::now() + backoff);
                tracing::error!(
                    "Failed to converge {} (attempt {}, retry in {:?}): {}",
                    entry.fragment.content_path(),
                    entry.failures,
                    backoff,
                    error
                );
            }
        }
    }
}

impl fmt::Display for Persister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.status().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryLeaseRegistry;
    use bytes::Bytes;

    fn sum_fixture() -> ContentSum {
        [
            1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
        ]
    }

    fn persister() -> Persister {
        Persister::new(
            PersisterConfig::new("base/directory", "route-key"),
            Arc::new(MemoryLeaseRegistry::new()),
            BlobStore::memory(),
        )
        .unwrap()
    }

    struct UnreadableSource;

    #[async_trait::async_trait]
    impl crate::FragmentSource for UnreadableSource {
        async fn read_at(&self, _offset: u64, _len: usize) -> std::io::Result<Bytes> {
            panic!("status must not read fragment sources");
        }
    }

    #[test]
    fn test_status_lists_offsets_in_order() {
        let persister = persister();
        let source: Arc<dyn crate::FragmentSource> = Arc::new(UnreadableSource);

        let first = Fragment::new("a/journal", 1000, 1010, sum_fixture(), source.clone()).unwrap();
        let mut second = first.clone();
        second.begin = 2000;
        second.end = 3000;

        persister.persist(second);
        persister.persist(first);

        assert_eq!(
            persister.to_string(),
            r#"{"a/journal":["00000000000003e8-00000000000003f2-0102030405060708090a0b0c0d0e0f1011121314","00000000000007d0-0000000000000bb8-0102030405060708090a0b0c0d0e0f1011121314"]}"#
        );
    }

    #[test]
    fn test_persist_deduplicates_by_identity() {
        let persister = persister();
        let fragment = Fragment::new(
            "a/journal",
            0,
            3,
            sum_fixture(),
            Arc::new(Bytes::from_static(b"abc")),
        )
        .unwrap();
        let mut reopened = fragment.clone();
        reopened.source = Arc::new(Bytes::from_static(b"abc"));

        persister.persist(fragment);
        persister.persist(reopened);

        assert_eq!(persister.pending_len(), 1);
        assert_eq!(persister.status().fragments("a/journal").len(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = PersisterConfig::new("base/directory", "route-key");
        config.lease_refresh_interval = config.lease_ttl;

        let result = Persister::new(
            config,
            Arc::new(MemoryLeaseRegistry::new()),
            BlobStore::memory(),
        );
        assert!(matches!(result, Err(crate::DriftError::Config(_))));
    }

    #[test]
    fn test_eligible_skips_in_flight_and_backoff() {
        let persister = persister();
        for begin in [0u64, 10, 20] {
            persister.persist(
                Fragment::new(
                    "a/journal",
                    begin,
                    begin + 10,
                    sum_fixture(),
                    Arc::new(Bytes::new()),
                )
                .unwrap(),
            );
        }

        let now = Instant::now();
        let mut state = persister.lock();
        let all = state.eligible(now);
        assert_eq!(all.len(), 3);

        state.in_flight.insert(all[0].clone());
        if let Some(entry) = state.get_mut(&all[1]) {
            entry.not_before = Some(now + std::time::Duration::from_secs(60));
        }

        assert_eq!(state.eligible(now), vec![all[2].clone()]);
    }
}
