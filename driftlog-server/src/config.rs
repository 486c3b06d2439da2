use driftlog_core::{DriftError, PersisterConfig, RegistryBuilder, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub spool: SpoolConfig,
    pub registry: RegistryConfig,
    pub blob_store: BlobStoreConfig,
    #[serde(default)]
    pub persister: PersisterSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity written into fragment leases.
    pub route_key: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8480".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    pub root: PathBuf,
    #[serde(default = "default_scan_on_start")]
    pub scan_on_start: bool,
}

fn default_scan_on_start() -> bool {
    true
}

/// Registry backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    #[serde(default)]
    pub namespace: Option<String>,
    pub etcd: Option<EtcdConfig>,
    pub redis: Option<RedisConfig>,
}

impl RegistryConfig {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("driftlog")
    }

    pub fn builder(&self) -> Result<RegistryBuilder> {
        let builder = RegistryBuilder::new()
            .backend(self.backend.as_str())
            .namespace(self.namespace_or_default());

        match self.backend {
            RegistryBackend::Memory => Ok(builder),
            RegistryBackend::Etcd => {
                let etcd = self.etcd.as_ref().ok_or_else(|| {
                    DriftError::Config(
                        "etcd configuration is required for etcd backend".to_string(),
                    )
                })?;
                Ok(builder.etcd_endpoints(etcd.endpoints.clone()))
            }
            RegistryBackend::Redis => {
                let redis = self.redis.as_ref().ok_or_else(|| {
                    DriftError::Config(
                        "redis configuration is required for redis backend".to_string(),
                    )
                })?;
                Ok(builder.redis_url(redis.url.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Memory,
    Etcd,
    Redis,
}

impl RegistryBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Etcd => "etcd",
            Self::Redis => "redis",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    /// `memory://`, `file:///dir` or `s3://bucket[/prefix]`.
    pub url: String,
}

/// Persister tuning. Durations are in milliseconds; unset fields keep the
/// core defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersisterSettings {
    #[serde(default)]
    pub locks_root: Option<String>,
    #[serde(default)]
    pub lease_ttl_ms: Option<u64>,
    #[serde(default)]
    pub lease_refresh_interval_ms: Option<u64>,
    #[serde(default)]
    pub converge_interval_ms: Option<u64>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_retry_backoff_ms: Option<u64>,
    #[serde(default)]
    pub upload_chunk_size: Option<usize>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("DRIFTLOG").separator("__"))
            .build()
            .map_err(|e| DriftError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| DriftError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn persister_config(&self) -> Result<PersisterConfig> {
        let mut config = PersisterConfig::new(self.spool.root.clone(), self.node.route_key.clone());
        let settings = &self.persister;

        if let Some(locks_root) = &settings.locks_root {
            config.locks_root = locks_root.clone();
        }
        if let Some(ms) = settings.lease_ttl_ms {
            config.lease_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.lease_refresh_interval_ms {
            config.lease_refresh_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.converge_interval_ms {
            config.converge_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.retry_backoff_ms {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.max_retry_backoff_ms {
            config.max_retry_backoff = Duration::from_millis(ms);
        }
        if let Some(size) = settings.upload_chunk_size {
            config.upload_chunk_size = size;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
node:
  route_key: broker-a
  bind_addr: 0.0.0.0:9000
spool:
  root: /var/spool/driftlog
registry:
  backend: redis
  namespace: prod
  redis:
    url: redis://127.0.0.1:6379
blob_store:
  url: s3://fragments/prod
persister:
  lease_ttl_ms: 20000
  converge_interval_ms: 500
"#;

    fn write_config(contents: &str) -> (tempfile::TempDir, String) {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("driftlog.yaml");
        std::fs::write(&path, contents).unwrap();
        let path = path.to_string_lossy().into_owned();
        (temp_dir, path)
    }

    #[test]
    fn test_load_yaml_config() {
        let (_temp_dir, path) = write_config(YAML);
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.node.route_key, "broker-a");
        assert_eq!(config.node.bind_addr, "0.0.0.0:9000");
        assert!(config.spool.scan_on_start);
        assert_eq!(config.registry.backend, RegistryBackend::Redis);
        assert_eq!(config.registry.namespace_or_default(), "prod");
        assert_eq!(config.blob_store.url, "s3://fragments/prod");

        let persister = config.persister_config().unwrap();
        assert_eq!(persister.route_key, "broker-a");
        assert_eq!(persister.lease_ttl, Duration::from_secs(20));
        assert_eq!(persister.converge_interval, Duration::from_millis(500));
        assert_eq!(persister.lease_refresh_interval, Duration::from_secs(3));
        assert_eq!(persister.locks_root, driftlog_core::config::DEFAULT_LOCKS_ROOT);
    }

    #[test]
    fn test_invalid_persister_settings_rejected() {
        let (_temp_dir, path) = write_config(YAML);
        let mut config = Config::from_file(&path).unwrap();
        config.persister.lease_refresh_interval_ms = Some(30_000);

        assert!(matches!(config.persister_config(), Err(DriftError::Config(_))));
    }

    #[test]
    fn test_backend_section_required() {
        let (_temp_dir, path) = write_config(YAML);
        let mut config = Config::from_file(&path).unwrap();
        config.registry.backend = RegistryBackend::Etcd;
        assert!(matches!(config.registry.builder(), Err(DriftError::Config(_))));

        config.registry.backend = RegistryBackend::Memory;
        assert!(config.registry.builder().is_ok());
    }
}
