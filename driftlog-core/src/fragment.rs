use crate::{DriftError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Length in bytes of a fragment content sum (160 bits).
pub const SUM_LEN: usize = 20;

pub type ContentSum = [u8; SUM_LEN];

const OFFSET_HEX_LEN: usize = 16;
const SUM_HEX_LEN: usize = SUM_LEN * 2;
const CONTENT_NAME_LEN: usize = OFFSET_HEX_LEN * 2 + SUM_HEX_LEN + 2;

/// Readable byte range backing a fragment.
///
/// Offsets are relative to the fragment's `begin`: offset 0 is the first
/// byte of the fragment. Implementations are owned by the spool; the
/// persister only reads through them.
#[async_trait]
pub trait FragmentSource: Send + Sync {
    /// Read up to `len` bytes starting at `offset`. A short or empty result
    /// means end of data.
    async fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Bytes>;
}

#[async_trait]
impl FragmentSource for Bytes {
    async fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.len());
        let end = start.saturating_add(len).min(self.len());
        Ok(self.slice(start..end))
    }
}

/// A contiguous, content-addressed byte range `[begin, end)` of a journal.
///
/// Equality, ordering and hashing consider `(journal, begin, end, sum)`
/// only; two fragments differing just in `source` are interchangeable.
#[derive(Clone)]
pub struct Fragment {
    pub journal: String,
    pub begin: u64,
    pub end: u64,
    pub sum: ContentSum,
    pub source: Arc<dyn FragmentSource>,
}

impl Fragment {
    pub fn new(
        journal: impl Into<String>,
        begin: u64,
        end: u64,
        sum: ContentSum,
        source: Arc<dyn FragmentSource>,
    ) -> Result<Self> {
        let journal = journal.into();
        validate_journal(&journal)?;
        if begin > end {
            return Err(DriftError::InvalidRequest(format!(
                "fragment begin {} is past end {}",
                begin, end
            )));
        }

        Ok(Self {
            journal,
            begin,
            end,
            sum,
            source,
        })
    }

    /// Zero when the range is empty or inverted.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn content_name(&self) -> String {
        content_name(self.begin, self.end, &self.sum)
    }

    /// `journal/content_name`, the fragment's path in the blob store and
    /// beneath the spool root.
    pub fn content_path(&self) -> String {
        format!("{}/{}", self.journal, self.content_name())
    }

    fn identity(&self) -> (&str, u64, u64, &ContentSum) {
        (&self.journal, self.begin, self.end, &self.sum)
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fragment")
            .field("journal", &self.journal)
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("sum", &hex::encode(self.sum))
            .finish_non_exhaustive()
    }
}

impl PartialEq for Fragment {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Fragment {}

impl PartialOrd for Fragment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fragment {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl Hash for Fragment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

/// A journal names a directory both beneath the spool root and in the blob
/// store, so it must be a relative path of plain segments.
fn validate_journal(journal: &str) -> Result<()> {
    if journal.is_empty() {
        return Err(DriftError::InvalidRequest(
            "fragment journal cannot be empty".to_string(),
        ));
    }

    let bad_segment = journal
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    let bad_char = journal.contains(|c: char| c == '\\' || c.is_ascii_control());
    if bad_segment || bad_char {
        return Err(DriftError::InvalidRequest(format!(
            "fragment journal {:?} must be a relative path of non-empty segments",
            journal
        )));
    }

    Ok(())
}

/// Canonical name of a fragment: `hex16(begin)-hex16(end)-hex40(sum)`.
///
/// Fixed-width, zero-padded fields make lexicographic order of names equal
/// numeric order by `(begin, end, sum)`.
pub fn content_name(begin: u64, end: u64, sum: &ContentSum) -> String {
    format!("{:016x}-{:016x}-{}", begin, end, hex::encode(sum))
}

/// Inverse of [`content_name`]. Only the canonical lower-case form is
/// accepted.
pub fn parse_content_name(name: &str) -> Result<(u64, u64, ContentSum)> {
    let invalid = || DriftError::InvalidContentName(name.to_string());

    if name.len() != CONTENT_NAME_LEN || !name.is_ascii() {
        return Err(invalid());
    }

    let end_at = OFFSET_HEX_LEN + 1;
    let sum_at = end_at + OFFSET_HEX_LEN + 1;
    if &name[OFFSET_HEX_LEN..end_at] != "-" || &name[sum_at - 1..sum_at] != "-" {
        return Err(invalid());
    }

    let begin = u64::from_str_radix(&name[..OFFSET_HEX_LEN], 16).map_err(|_| invalid())?;
    let end = u64::from_str_radix(&name[end_at..sum_at - 1], 16).map_err(|_| invalid())?;
    let mut sum = [0u8; SUM_LEN];
    hex::decode_to_slice(&name[sum_at..], &mut sum).map_err(|_| invalid())?;

    if begin > end || content_name(begin, end, &sum) != name {
        return Err(invalid());
    }

    Ok((begin, end, sum))
}
