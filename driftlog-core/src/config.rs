use crate::{DriftError, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LOCKS_ROOT: &str = "/gazette/persister_locks/";
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Settings for a [`Persister`](crate::Persister) instance.
#[derive(Debug, Clone)]
pub struct PersisterConfig {
    /// Base directory of the local spool; a fragment lives at
    /// `spool_root/journal/content_name`.
    pub spool_root: PathBuf,
    /// Key prefix under which fragment leases are created.
    pub locks_root: String,
    /// Lease value identifying this broker instance.
    pub route_key: String,
    pub lease_ttl: Duration,
    /// Must be strictly shorter than `lease_ttl`.
    pub lease_refresh_interval: Duration,
    pub converge_interval: Duration,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub upload_chunk_size: usize,
}

impl PersisterConfig {
    pub fn new(spool_root: impl Into<PathBuf>, route_key: impl Into<String>) -> Self {
        Self {
            spool_root: spool_root.into(),
            locks_root: DEFAULT_LOCKS_ROOT.to_string(),
            route_key: route_key.into(),
            lease_ttl: Duration::from_secs(10),
            lease_refresh_interval: Duration::from_secs(3),
            converge_interval: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(60),
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.route_key.trim().is_empty() {
            return Err(DriftError::Config(
                "persister route_key cannot be empty".to_string(),
            ));
        }
        if !self.locks_root.starts_with('/') {
            return Err(DriftError::Config(format!(
                "persister locks_root must be an absolute key prefix, got '{}'",
                self.locks_root
            )));
        }
        if self.lease_ttl.is_zero() {
            return Err(DriftError::Config(
                "persister lease_ttl must be positive".to_string(),
            ));
        }
        if self.lease_refresh_interval.is_zero() || self.lease_refresh_interval >= self.lease_ttl {
            return Err(DriftError::Config(format!(
                "persister lease_refresh_interval ({:?}) must be positive and shorter than lease_ttl ({:?})",
                self.lease_refresh_interval, self.lease_ttl
            )));
        }
        if self.converge_interval.is_zero() {
            return Err(DriftError::Config(
                "persister converge_interval must be positive".to_string(),
            ));
        }
        if self.max_retry_backoff < self.retry_backoff {
            return Err(DriftError::Config(
                "persister max_retry_backoff cannot be shorter than retry_backoff".to_string(),
            ));
        }
        if self.upload_chunk_size == 0 {
            return Err(DriftError::Config(
                "persister upload_chunk_size must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Backoff applied after `failures` consecutive transient errors.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_retry_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PersisterConfig::new("/var/spool/driftlog", "route-key");
        config.validate().unwrap();
        assert_eq!(config.locks_root, DEFAULT_LOCKS_ROOT);
    }

    #[test]
    fn test_refresh_must_precede_expiry() {
        let mut config = PersisterConfig::new("/tmp", "route-key");
        config.lease_refresh_interval = config.lease_ttl;
        assert!(matches!(config.validate(), Err(DriftError::Config(_))));

        config.lease_refresh_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(DriftError::Config(_))));
    }

    #[test]
    fn test_empty_route_key_rejected() {
        let config = PersisterConfig::new("/tmp", "  ");
        assert!(matches!(config.validate(), Err(DriftError::Config(_))));
    }

    #[test]
    fn test_relative_locks_root_rejected() {
        let mut config = PersisterConfig::new("/tmp", "route-key");
        config.locks_root = "persister_locks/".to_string();
        assert!(matches!(config.validate(), Err(DriftError::Config(_))));
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut config = PersisterConfig::new("/tmp", "route-key");
        config.retry_backoff = Duration::from_millis(100);
        config.max_retry_backoff = Duration::from_millis(500);

        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for(4), Duration::from_millis(500));
        assert_eq!(config.backoff_for(40), Duration::from_millis(500));
    }
}
