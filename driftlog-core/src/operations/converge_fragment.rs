use crate::{
    BlobStore, BlobWriter, DriftError, Fragment, LeaseCreate, LeaseDelete, LeaseKeeper,
    LeaseRefresh, LeaseRegistry, LocalSpool, PersisterConfig, Result,
};
use serde::Serialize;
use std::sync::Arc;

/// Moves one spooled fragment into the blob store under a lease:
///
/// acquire lease -> check remote -> upload if absent -> remove local copy
/// -> release lease.
#[derive(Clone)]
pub struct ConvergeFragmentOperation {
    registry: Arc<dyn LeaseRegistry>,
    blob_store: BlobStore,
    spool: LocalSpool,
    config: Arc<PersisterConfig>,
}

#[derive(Debug, Clone)]
pub struct ConvergeFragmentOperationRequest {
    pub fragment: Fragment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConvergeOutcome {
    /// Uploaded by this instance.
    Persisted { bytes: u64 },
    /// Already present in the blob store; nothing uploaded.
    AlreadyDurable,
    /// Another instance holds the fragment's lease.
    LeaseHeld { owner: String },
    /// The lease expired or was taken over while this attempt held it.
    LeaseLost,
}

impl ConvergeOutcome {
    /// Whether the fragment is durable and no longer pending.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            ConvergeOutcome::Persisted { .. } | ConvergeOutcome::AlreadyDurable
        )
    }
}

impl ConvergeFragmentOperation {
    pub fn new(
        registry: Arc<dyn LeaseRegistry>,
        blob_store: BlobStore,
        spool: LocalSpool,
        config: Arc<PersisterConfig>,
    ) -> Self {
        Self {
            registry,
            blob_store,
            spool,
            config,
        }
    }

    pub fn lock_key(&self, fragment: &Fragment) -> String {
        format!("{}{}", self.config.locks_root, fragment.content_name())
    }

    pub async fn run(&self, request: ConvergeFragmentOperationRequest) -> Result<ConvergeOutcome> {
        let ConvergeFragmentOperationRequest { fragment } = request;
        let lock_key = self.lock_key(&fragment);
        let route_key = self.config.route_key.as_str();

        match self
            .registry
            .create(&lock_key, route_key, self.config.lease_ttl)
            .await?
        {
            LeaseCreate::Created => {
                tracing::debug!("Acquired lease {} for {}", lock_key, fragment.content_path());
            }
            LeaseCreate::AlreadyExists { owner } if owner == route_key => {
                // Left over from an earlier run of this same instance.
                match self
                    .registry
                    .refresh(&lock_key, route_key, self.config.lease_ttl)
                    .await?
                {
                    LeaseRefresh::Refreshed => {
                        tracing::debug!("Adopted own lease {}", lock_key);
                    }
                    LeaseRefresh::Lost => return Ok(ConvergeOutcome::LeaseLost),
                }
            }
            LeaseCreate::AlreadyExists { owner } => {
                tracing::debug!(
                    "Lease {} is held by {}; skipping {}",
                    lock_key,
                    owner,
                    fragment.content_path()
                );
                return Ok(ConvergeOutcome::LeaseHeld { owner });
            }
        }

        let keeper = LeaseKeeper::start(
            self.registry.clone(),
            lock_key.clone(),
            route_key.to_string(),
            self.config.lease_ttl,
            self.config.lease_refresh_interval,
        );

        let result = self.converge_held(&fragment, &keeper).await;
        let lost = keeper.stop().await;

        let outcome = match result {
            Ok(_) if lost => return Ok(self.lease_lost(&fragment)),
            Ok(outcome) => outcome,
            Err(DriftError::LeaseLost(_)) => return Ok(self.lease_lost(&fragment)),
            Err(error) => {
                if !lost {
                    self.release(&lock_key).await;
                }
                return Err(error);
            }
        };

        match self.spool.remove(&fragment).await {
            Ok(true) => {
                tracing::debug!("Removed spooled {}", self.spool.local_path(&fragment).display());
            }
            Ok(false) => {
                tracing::debug!("Spooled {} was already removed", fragment.content_path());
            }
            Err(error) => {
                tracing::warn!(
                    "Failed to remove spooled {}: {}",
                    self.spool.local_path(&fragment).display(),
                    error
                );
            }
        }

        self.release(&lock_key).await;

        match &outcome {
            ConvergeOutcome::Persisted { bytes } => {
                tracing::info!("Persisted {} ({} bytes)", fragment.content_path(), bytes);
            }
            _ => {
                tracing::info!("{} was already durable", fragment.content_path());
            }
        }

        Ok(outcome)
    }

    /// Check remote and upload, while `keeper` holds the lease.
    async fn converge_held(
        &self,
        fragment: &Fragment,
        keeper: &LeaseKeeper,
    ) -> Result<ConvergeOutcome> {
        let content_path = fragment.content_path();

        if self.blob_store.exists(&content_path).await? {
            return Ok(ConvergeOutcome::AlreadyDurable);
        }
        ensure_held(keeper)?;

        let mut writer = self.blob_store.create(&content_path).await?;
        let copied = tokio::select! {
            result = self.copy_source(fragment, keeper, &mut writer) => result,
            _ = keeper.lost() => Err(DriftError::LeaseLost(keeper.key().to_string())),
        };

        if let Err(error) = copied {
            if let Err(abort_error) = writer.abort().await {
                tracing::warn!("Failed to abort upload of {}: {}", content_path, abort_error);
            }
            return Err(error);
        }

        let bytes = writer.finish().await?;
        Ok(ConvergeOutcome::Persisted { bytes })
    }

    async fn copy_source(
        &self,
        fragment: &Fragment,
        keeper: &LeaseKeeper,
        writer: &mut BlobWriter,
    ) -> Result<()> {
        let total = fragment.len();
        let chunk_size = self.config.upload_chunk_size;
        let mut offset = 0u64;

        while offset < total {
            ensure_held(keeper)?;

            let want = usize::try_from(total - offset)
                .unwrap_or(usize::MAX)
                .min(chunk_size);
            let chunk = fragment.source.read_at(offset, want).await?;
            if chunk.is_empty() {
                return Err(DriftError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "{} ended at offset {} of {}",
                        fragment.content_path(),
                        offset,
                        total
                    ),
                )));
            }

            writer.write(&chunk).await?;
            offset += chunk.len() as u64;
        }

        ensure_held(keeper)
    }

    async fn release(&self, lock_key: &str) {
        match self.registry.delete(lock_key, &self.config.route_key).await {
            Ok(LeaseDelete::Deleted) => tracing::debug!("Released lease {}", lock_key),
            Ok(LeaseDelete::NotOwner) => {
                tracing::warn!("Lease {} was no longer ours at release", lock_key);
            }
            Err(error) => {
                tracing::warn!("Failed to release lease {}: {}", lock_key, error);
            }
        }
    }

    fn lease_lost(&self, fragment: &Fragment) -> ConvergeOutcome {
        tracing::warn!(
            "Lost lease on {} mid-convergence; leaving it pending",
            fragment.content_path()
        );
        ConvergeOutcome::LeaseLost
    }
}

fn ensure_held(keeper: &LeaseKeeper) -> Result<()> {
    if keeper.is_lost() {
        return Err(DriftError::LeaseLost(keeper.key().to_string()));
    }
    Ok(())
}
