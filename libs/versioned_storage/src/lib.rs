//! Provider-neutral access to the per-object version history of an object
//! store bucket.
//!
//! [`VersionedStorage`] is the narrow port a point-in-time rollback needs
//! from a provider: stream every recorded revision (tombstones included),
//! copy a historical version back on top of its own key, and delete the
//! current head, with both mutations carrying an optimistic-concurrency
//! precondition. Two provider shapes are unified behind one [`Version`]
//! record:
//!   * [`s3_bucket`]: opaque version ids and first-class delete markers,
//!   * [`gcs_bucket`]: monotone numeric generations with a deletion
//!     timestamp on superseded or deleted generations,
//! plus [`mem`], an in-memory bucket used by tests.
//!
//! Nothing here ever mutates or reorders recorded history; both mutations
//! only append new revisions or tombstones.
#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]

mod error;
pub mod gcs_bucket;
pub mod mem;
pub mod s3_bucket;

use std::fmt::{self, Debug};
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::Stream;
use tokio_util::sync::CancellationToken;

pub use self::error::{ApplyError, ListError};
pub use self::gcs_bucket::GcsBucket;
pub use self::mem::MemBucket;
pub use self::s3_bucket::S3Bucket;

/// Largest source the S3-style provider copies in a single request; bigger
/// sources go through the multipart path.
pub const MAX_SINGLE_COPY_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Identifier of one recorded revision of an object.
///
/// The S3-style provider hands out opaque tokens, the GCS-style provider
/// monotone integers; nothing in the core depends on which.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionId {
    Opaque(String),
    Generation(i64),
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionId::Opaque(id) => f.write_str(id),
            VersionId::Generation(generation) => write!(f, "{generation}"),
        }
    }
}

/// Opaque equality token over an object payload (trimmed ETag or base64
/// MD5 text). Compared bytewise, never decoded.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentDigest(Vec<u8>);

impl ContentDigest {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({self})")
    }
}

/// One recorded revision of a single object, live or tombstone.
#[derive(Debug, Clone)]
pub struct Version {
    /// Path of the object within the bucket.
    pub key: String,
    pub id: VersionId,
    /// When this revision came into existence. For tombstones on the
    /// numeric-generation provider this is the deletion instant, not the
    /// creation instant of the underlying generation.
    pub created_at: DateTime<Utc>,
    /// True for delete markers and for inferred deletions.
    pub is_tombstone: bool,
    /// Provider hint that this revision is the current head. Display only;
    /// state reconstruction never relies on it.
    pub is_latest: bool,
    pub digest: Option<ContentDigest>,
    /// Payload size in bytes, zero for tombstones.
    pub size: u64,
}

/// One page of a version listing.
#[derive(Debug, Default)]
pub struct VersionPage {
    pub versions: Vec<Version>,
}

/// Descriptor of the new head revision a copy produced.
#[derive(Debug, Clone)]
pub struct CopyResult {
    pub key: String,
    /// Absent when the bucket has no versioning enabled.
    pub version_id: Option<VersionId>,
    pub digest: Option<ContentDigest>,
}

/// Optimistic-concurrency constraint evaluated atomically by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Apply unconditionally.
    None,
    /// Apply only if the current head was not modified after the instant
    /// (S3-style).
    UnmodifiedSince(DateTime<Utc>),
    /// Apply only if the current generation matches exactly (GCS-style).
    GenerationMatch(i64),
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precondition::None => f.write_str("none"),
            Precondition::UnmodifiedSince(instant) => write!(f, "unmodified since {instant}"),
            Precondition::GenerationMatch(generation) => {
                write!(f, "generation matches {generation}")
            }
        }
    }
}

pub type VersionStream<'a> = Pin<Box<dyn Stream<Item = Result<VersionPage, ListError>> + Send + 'a>>;

/// The storage port a rollback run requires from a provider.
///
/// Implementations must be safe for concurrent use; the executor shares one
/// client across all workers.
#[allow(async_fn_in_trait)]
pub trait VersionedStorage: Send + Sync + 'static {
    /// Streams every recorded version under `prefix`, tombstones included,
    /// consuming provider pagination until exhausted. An empty prefix means
    /// the whole bucket. No ordering is guaranteed between pages.
    fn list_versions<'a>(
        &'a self,
        prefix: &'a str,
        cancel: &'a CancellationToken,
    ) -> VersionStream<'a>;

    /// Copies the historical version `from` of `key` on top of its own key,
    /// creating a new head revision with identical content. `size` is the
    /// source version's payload size and selects the copy strategy where
    /// the provider needs one.
    async fn copy_version(
        &self,
        key: &str,
        from: &VersionId,
        size: u64,
        precondition: &Precondition,
        cancel: &CancellationToken,
    ) -> Result<CopyResult, ApplyError>;

    /// Deletes the current head of `key`, appending a tombstone to its
    /// history.
    async fn delete_current(
        &self,
        key: &str,
        precondition: &Precondition,
        cancel: &CancellationToken,
    ) -> Result<(), ApplyError>;
}

/// Every backend currently supported. A simple way to pass the port around
/// without dealing with generics.
#[derive(Clone)]
pub enum GenericVersionedStorage {
    AwsS3(Arc<S3Bucket>),
    Gcs(Arc<GcsBucket>),
    Mem(Arc<MemBucket>),
}

impl GenericVersionedStorage {
    pub fn list_versions<'a>(
        &'a self,
        prefix: &'a str,
        cancel: &'a CancellationToken,
    ) -> VersionStream<'a> {
        match self {
            Self::AwsS3(s) => s.list_versions(prefix, cancel),
            Self::Gcs(s) => s.list_versions(prefix, cancel),
            Self::Mem(s) => s.list_versions(prefix, cancel),
        }
    }

    pub async fn copy_version(
        &self,
        key: &str,
        from: &VersionId,
        size: u64,
        precondition: &Precondition,
        cancel: &CancellationToken,
    ) -> Result<CopyResult, ApplyError> {
        match self {
            Self::AwsS3(s) => s.copy_version(key, from, size, precondition, cancel).await,
            Self::Gcs(s) => s.copy_version(key, from, size, precondition, cancel).await,
            Self::Mem(s) => s.copy_version(key, from, size, precondition, cancel).await,
        }
    }

    pub async fn delete_current(
        &self,
        key: &str,
        precondition: &Precondition,
        cancel: &CancellationToken,
    ) -> Result<(), ApplyError> {
        match self {
            Self::AwsS3(s) => s.delete_current(key, precondition, cancel).await,
            Self::Gcs(s) => s.delete_current(key, precondition, cancel).await,
            Self::Mem(s) => s.delete_current(key, precondition, cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_id_display() {
        assert_eq!(
            VersionId::Opaque("3HL4kqtJlcpXrof3vjVBH40Nrjfkd".to_owned()).to_string(),
            "3HL4kqtJlcpXrof3vjVBH40Nrjfkd"
        );
        assert_eq!(VersionId::Generation(1614203964124856).to_string(), "1614203964124856");
    }

    #[test]
    fn digests_compare_bytewise() {
        let a = ContentDigest::new("d41d8cd98f00b204e9800998ecf8427e");
        let b = ContentDigest::new("d41d8cd98f00b204e9800998ecf8427e".as_bytes().to_vec());
        let c = ContentDigest::new("different");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
