use super::{
    LeaseRegistry, etcd::EtcdLeaseRegistry, memory::MemoryLeaseRegistry,
    redis::RedisLeaseRegistry,
};
use crate::{DriftError, Result};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    backend: Option<String>,
    namespace: Option<String>,
    etcd_endpoints: Option<Vec<String>>,
    redis_url: Option<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = Some(endpoints);
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    fn resolve_namespace(&self) -> Result<String> {
        let namespace = self
            .namespace
            .as_deref()
            .unwrap_or_default()
            .trim()
            .trim_matches('/')
            .to_string();
        if namespace.is_empty() {
            return Err(DriftError::Config(
                "registry namespace cannot be empty".to_string(),
            ));
        }

        Ok(namespace)
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(DriftError::Config(
                "registry backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    pub async fn build(&self) -> Result<Arc<dyn LeaseRegistry>> {
        let backend = self.resolve_backend()?;

        match backend.as_str() {
            "memory" => Ok(Arc::new(MemoryLeaseRegistry::new())),
            "etcd" => {
                let namespace = self.resolve_namespace()?;
                let endpoints = self.etcd_endpoints.clone().ok_or_else(|| {
                    DriftError::Config("etcd endpoints are required for etcd backend".to_string())
                })?;

                if endpoints.is_empty() {
                    return Err(DriftError::Config(
                        "etcd endpoints cannot be empty for etcd backend".to_string(),
                    ));
                }

                let registry = EtcdLeaseRegistry::new(&endpoints, &namespace).await?;
                Ok(Arc::new(registry))
            }
            "redis" => {
                let namespace = self.resolve_namespace()?;
                let url = self.redis_url.as_deref().unwrap_or_default().trim();
                if url.is_empty() {
                    return Err(DriftError::Config(
                        "redis url is required for redis backend".to_string(),
                    ));
                }

                let registry = RedisLeaseRegistry::new(url, &namespace).await?;
                Ok(Arc::new(registry))
            }
            other => Err(DriftError::Config(format!(
                "unsupported registry backend: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_needs_no_endpoints() {
        let registry = RegistryBuilder::new().backend(" Memory ").build().await;
        assert!(registry.is_ok());
    }

    #[tokio::test]
    async fn test_missing_backend_is_config_error() {
        let result = RegistryBuilder::new().namespace("default").build().await;
        assert!(matches!(result, Err(DriftError::Config(_))));
    }

    #[tokio::test]
    async fn test_etcd_requires_endpoints() {
        let result = RegistryBuilder::new()
            .backend("etcd")
            .namespace("default")
            .etcd_endpoints(Vec::new())
            .build()
            .await;
        assert!(matches!(result, Err(DriftError::Config(_))));
    }

    #[tokio::test]
    async fn test_redis_requires_namespace() {
        let result = RegistryBuilder::new()
            .backend("redis")
            .namespace("//")
            .redis_url("redis://127.0.0.1:6379")
            .build()
            .await;
        assert!(matches!(result, Err(DriftError::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let result = RegistryBuilder::new()
            .backend("zookeeper")
            .namespace("default")
            .build()
            .await;
        assert!(matches!(result, Err(DriftError::Config(_))));
    }
}
