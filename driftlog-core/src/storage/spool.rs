use crate::{ContentSum, DriftError, Fragment, FragmentSource, Result, parse_content_name};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Spool file opened as a [`FragmentSource`].
pub struct FileSource {
    path: PathBuf,
    file: Mutex<fs::File>,
}

impl FileSource {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = fs::File::open(&path).await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FragmentSource for FileSource {
    async fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }
}

/// Local directory of spooled fragments, laid out as
/// `root/journal/content_name`.
#[derive(Debug, Clone)]
pub struct LocalSpool {
    root: PathBuf,
}

impl LocalSpool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn local_path(&self, fragment: &Fragment) -> PathBuf {
        self.root.join(fragment.content_path())
    }

    /// Remove the spooled file of `fragment`. Returns false if it was already
    /// gone.
    pub async fn remove(&self, fragment: &Fragment) -> Result<bool> {
        let path = self.local_path(fragment);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Open an already-spooled fragment.
    pub async fn open(
        &self,
        journal: &str,
        begin: u64,
        end: u64,
        sum: ContentSum,
    ) -> Result<Fragment> {
        let placeholder: Arc<dyn FragmentSource> = Arc::new(Bytes::new());
        let mut fragment = Fragment::new(journal, begin, end, sum, placeholder)?;

        let path = self.local_path(&fragment);
        let len = fs::metadata(&path).await?.len();
        if len != fragment.len() {
            return Err(DriftError::InvalidRequest(format!(
                "spool file {:?} holds {} bytes, fragment spans {}",
                path,
                len,
                fragment.len()
            )));
        }

        fragment.source = Arc::new(FileSource::open(path).await?);
        Ok(fragment)
    }

    /// Write `data` as the fragment `[begin, begin + len)` of `journal`.
    ///
    /// Writes to a temporary file first, then renames for atomicity.
    pub async fn stage(
        &self,
        journal: &str,
        begin: u64,
        sum: ContentSum,
        data: Bytes,
    ) -> Result<Fragment> {
        let end = begin + data.len() as u64;
        let fragment = Fragment::new(journal, begin, end, sum, Arc::new(Bytes::new()))?;
        let path = self.local_path(&fragment);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;
        tracing::debug!("Spooled fragment {} ({} bytes)", fragment.content_path(), data.len());

        self.open(journal, begin, end, sum).await
    }

    /// Rediscover spooled fragments below the root.
    ///
    /// Files whose names are not content names, or whose size disagrees
    /// with the name, are skipped.
    pub async fn scan(&self) -> Result<Vec<Fragment>> {
        let mut fragments = Vec::new();
        if !fs::try_exists(&self.root).await? {
            return Ok(fragments);
        }

        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = fs::read_dir(&dir).await?;

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    dirs.push(entry.path());
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    continue;
                };
                let Ok((begin, end, sum)) = parse_content_name(name) else {
                    tracing::debug!("Skipping non-fragment spool file {:?}", entry.path());
                    continue;
                };
                let Some(journal) = self.journal_of(&dir) else {
                    tracing::warn!("Skipping spool file outside any journal: {:?}", entry.path());
                    continue;
                };

                match self.open(&journal, begin, end, sum).await {
                    Ok(fragment) => fragments.push(fragment),
                    Err(error) => {
                        tracing::warn!("Skipping spool file {:?}: {}", entry.path(), error);
                    }
                }
            }
        }

        fragments.sort();
        Ok(fragments)
    }

    fn journal_of(&self, dir: &Path) -> Option<String> {
        let relative = dir.strip_prefix(&self.root).ok()?;
        let components: Vec<&str> = relative
            .components()
            .map(|component| component.as_os_str().to_str())
            .collect::<Option<_>>()?;

        if components.is_empty() {
            return None;
        }
        Some(components.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_name;

    const SUM: ContentSum = [7u8; 20];

    #[tokio::test]
    async fn test_stage_then_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let spool = LocalSpool::new(temp_dir.path());

        let fragment = spool
            .stage("a/journal", 100, SUM, Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        assert_eq!(fragment.end, 110);
        assert_eq!(
            spool.local_path(&fragment),
            temp_dir
                .path()
                .join("a/journal")
                .join(content_name(100, 110, &SUM))
        );
        assert_eq!(
            fragment.source.read_at(2, 3).await.unwrap(),
            Bytes::from_static(b"234")
        );
        assert_eq!(
            fragment.source.read_at(8, 10).await.unwrap(),
            Bytes::from_static(b"89")
        );
    }

    #[tokio::test]
    async fn test_remove_reports_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let spool = LocalSpool::new(temp_dir.path());
        let fragment = spool
            .stage("a/journal", 0, SUM, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        assert!(spool.remove(&fragment).await.unwrap());
        assert!(!spool.local_path(&fragment).exists());
        assert!(!spool.remove(&fragment).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_rejects_size_mismatch() {
        let temp_dir = tempfile::tempdir().unwrap();
        let spool = LocalSpool::new(temp_dir.path());
        spool
            .stage("a/journal", 0, SUM, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        // Same file name claims a different range.
        let renamed = temp_dir
            .path()
            .join("a/journal")
            .join(content_name(0, 10, &SUM));
        std::fs::rename(
            temp_dir.path().join("a/journal").join(content_name(0, 3, &SUM)),
            &renamed,
        )
        .unwrap();

        let result = spool.open("a/journal", 0, 10, SUM).await;
        assert!(matches!(result, Err(DriftError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_scan_discovers_fragments() {
        let temp_dir = tempfile::tempdir().unwrap();
        let spool = LocalSpool::new(temp_dir.path());

        spool
            .stage("a/journal", 2000, SUM, Bytes::from(vec![1u8; 1000]))
            .await
            .unwrap();
        spool
            .stage("a/journal", 1000, SUM, Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        spool
            .stage("other", 0, SUM, Bytes::from_static(b"x"))
            .await
            .unwrap();
        std::fs::write(temp_dir.path().join("a/journal/garbage.tmp"), b"junk").unwrap();
        std::fs::write(temp_dir.path().join(content_name(0, 1, &SUM)), b"x").unwrap();

        let fragments = spool.scan().await.unwrap();
        let found: Vec<(String, u64, u64)> = fragments
            .iter()
            .map(|fragment| (fragment.journal.clone(), fragment.begin, fragment.end))
            .collect();

        assert_eq!(
            found,
            vec![
                ("a/journal".to_string(), 1000, 1010),
                ("a/journal".to_string(), 2000, 3000),
                ("other".to_string(), 0, 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_journal_cannot_leave_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let spool = LocalSpool::new(temp_dir.path().join("spool"));
        std::fs::create_dir_all(temp_dir.path().join("journal")).unwrap();
        std::fs::write(
            temp_dir.path().join("journal").join(content_name(0, 3, &SUM)),
            b"abc",
        )
        .unwrap();

        let opened = spool.open("../journal", 0, 3, SUM).await;
        assert!(matches!(opened, Err(DriftError::InvalidRequest(_))));

        let staged = spool
            .stage("a/../../escaped", 0, SUM, Bytes::from_static(b"abc"))
            .await;
        assert!(matches!(staged, Err(DriftError::InvalidRequest(_))));
        assert!(!temp_dir.path().join("escaped").exists());
    }

    #[tokio::test]
    async fn test_scan_missing_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let spool = LocalSpool::new(temp_dir.path().join("absent"));
        assert!(spool.scan().await.unwrap().is_empty());
    }
}
