use crate::{DriftError, Result};
use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::prefix::PrefixStore;
use object_store::{ObjectStore, WriteMultipart};
use std::path::Path;
use std::sync::Arc;

/// Parts uploaded concurrently by a single [`BlobWriter`].
const MAX_UPLOAD_CONCURRENCY: usize = 4;

/// Durable blob storage for persisted fragments.
///
/// Writes go through multipart uploads, so an object becomes visible at its
/// path only once [`BlobWriter::finish`] completes.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlobStore({})", self.inner)
    }
}

impl BlobStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub fn local(root: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let store = LocalFileSystem::new_with_prefix(root.as_ref())?;
        Ok(Self::new(Arc::new(store)))
    }

    /// Build a store from a URL: `memory://`, `file:///dir`, or
    /// `s3://bucket[/prefix]` (credentials and region from the environment).
    pub fn from_url(url: &str) -> Result<Self> {
        let url = url.trim();

        if url == "memory://" || url == "memory:" {
            return Ok(Self::memory());
        }

        if let Some(path) = url.strip_prefix("file://") {
            if !path.starts_with('/') {
                return Err(DriftError::Config(format!(
                    "blob store file url must be absolute: {}",
                    url
                )));
            }
            return Self::local(path);
        }

        if let Some(rest) = url.strip_prefix("s3://") {
            let (bucket, prefix) = match rest.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(DriftError::Config(format!(
                    "blob store s3 url is missing a bucket: {}",
                    url
                )));
            }

            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()?;
            if prefix.is_empty() {
                return Ok(Self::new(Arc::new(store)));
            }
            return Ok(Self::new(Arc::new(PrefixStore::new(store, prefix))));
        }

        Err(DriftError::Config(format!(
            "unsupported blob store url: {}",
            url
        )))
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.inner.head(&object_path(path)?).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Start writing a new object at `path`.
    pub async fn create(&self, path: &str) -> Result<BlobWriter> {
        let location = object_path(path)?;
        let upload = self.inner.put_multipart(&location).await?;

        Ok(BlobWriter {
            path: path.to_string(),
            upload: WriteMultipart::new(upload),
            written: 0,
        })
    }

    pub async fn open(&self, path: &str) -> Result<Bytes> {
        let result = self.inner.get(&object_path(path)?).await?;
        Ok(result.bytes().await?)
    }

    /// Paths of all objects below `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = object_path(prefix)?;
        let objects: Vec<_> = self.inner.list(Some(&prefix)).try_collect().await?;

        let mut paths: Vec<String> = objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect();
        paths.sort();
        Ok(paths)
    }
}

fn object_path(path: &str) -> Result<ObjectPath> {
    ObjectPath::parse(path.trim_matches('/'))
        .map_err(|error| DriftError::ObjectStore(error.into()))
}

/// In-progress object write. Dropping it without [`finish`](Self::finish)
/// leaves nothing visible at the path.
pub struct BlobWriter {
    path: String,
    upload: WriteMultipart,
    written: u64,
}

impl BlobWriter {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.upload
            .wait_for_capacity(MAX_UPLOAD_CONCURRENCY)
            .await?;
        self.upload.write(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Complete the upload, making the object visible. Returns bytes written.
    pub async fn finish(self) -> Result<u64> {
        self.upload.finish().await?;
        tracing::debug!("Completed blob {} ({} bytes)", self.path, self.written);
        Ok(self.written)
    }

    pub async fn abort(self) -> Result<()> {
        tracing::debug!("Aborting blob {} after {} bytes", self.path, self.written);
        self.upload.abort().await?;
        Ok(())
    }
}
