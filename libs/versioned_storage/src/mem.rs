//! In-memory versioned bucket.
//!
//! Backs the executor and pipeline tests: full version-history semantics
//! (appended generations, tombstones, both precondition variants) with a
//! deterministic logical clock, no credentials, no network. Every mutation
//! advances the clock by one second so histories built through the port
//! have strictly increasing creation instants.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::stream;
use tokio_util::sync::CancellationToken;

use crate::{
    ApplyError, ContentDigest, CopyResult, ListError, Precondition, Version, VersionId,
    VersionPage, VersionStream, VersionedStorage,
};

pub struct MemBucket {
    state: Mutex<MemState>,
}

struct MemState {
    objects: HashMap<String, Vec<Version>>,
    next_generation: i64,
    clock_secs: i64,
}

impl MemBucket {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState {
                objects: HashMap::new(),
                next_generation: 1,
                clock_secs: 0,
            }),
        }
    }

    /// Writes a new live head for `key`, as an external writer would.
    pub fn put(&self, key: &str, digest: &[u8], size: u64) -> Version {
        let mut state = self.state.lock().unwrap();
        let MemState {
            objects,
            next_generation,
            clock_secs,
        } = &mut *state;
        *clock_secs += 1;
        let version = Version {
            key: key.to_owned(),
            id: VersionId::Generation(*next_generation),
            created_at: timestamp(*clock_secs),
            is_tombstone: false,
            is_latest: true,
            digest: Some(ContentDigest::new(digest)),
            size,
        };
        *next_generation += 1;
        let versions = objects.entry(key.to_owned()).or_default();
        for recorded in versions.iter_mut() {
            recorded.is_latest = false;
        }
        versions.push(version.clone());
        version
    }

    /// The most recent recorded revision of `key`, tombstone or live.
    pub fn head(&self, key: &str) -> Option<Version> {
        let state = self.state.lock().unwrap();
        state.objects.get(key).and_then(|versions| versions.last()).cloned()
    }

    pub fn version_count(&self, key: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.objects.get(key).map_or(0, Vec::len)
    }

    pub fn keys(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut keys: Vec<_> = state.objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The current logical instant; new revisions are created after it.
    pub fn now(&self) -> DateTime<Utc> {
        let state = self.state.lock().unwrap();
        timestamp(state.clock_secs)
    }
}

impl Default for MemBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedStorage for MemBucket {
    fn list_versions<'a>(
        &'a self,
        prefix: &'a str,
        cancel: &'a CancellationToken,
    ) -> VersionStream<'a> {
        let page = if cancel.is_cancelled() {
            Err(ListError::Cancelled)
        } else {
            let state = self.state.lock().unwrap();
            let versions = state
                .objects
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .flat_map(|(_, versions)| versions.iter().cloned())
                .collect();
            Ok(VersionPage { versions })
        };
        Box::pin(stream::iter([page]))
    }

    async fn copy_version(
        &self,
        key: &str,
        from: &VersionId,
        _size: u64,
        precondition: &Precondition,
        _cancel: &CancellationToken,
    ) -> Result<CopyResult, ApplyError> {
        let mut state = self.state.lock().unwrap();
        let MemState {
            objects,
            next_generation,
            clock_secs,
        } = &mut *state;
        let versions = objects.get_mut(key).ok_or(ApplyError::NotFound)?;
        let source = versions
            .iter()
            .rev()
            .find(|recorded| !recorded.is_tombstone && recorded.id == *from)
            .cloned()
            .ok_or(ApplyError::NotFound)?;
        check_precondition(versions.last(), precondition)?;

        *clock_secs += 1;
        let id = VersionId::Generation(*next_generation);
        *next_generation += 1;
        for recorded in versions.iter_mut() {
            recorded.is_latest = false;
        }
        versions.push(Version {
            key: key.to_owned(),
            id: id.clone(),
            created_at: timestamp(*clock_secs),
            is_tombstone: false,
            is_latest: true,
            digest: source.digest.clone(),
            size: source.size,
        });
        Ok(CopyResult {
            key: key.to_owned(),
            version_id: Some(id),
            digest: source.digest,
        })
    }

    async fn delete_current(
        &self,
        key: &str,
        precondition: &Precondition,
        _cancel: &CancellationToken,
    ) -> Result<(), ApplyError> {
        let mut state = self.state.lock().unwrap();
        let MemState {
            objects,
            next_generation,
            clock_secs,
        } = &mut *state;
        let versions = objects.get_mut(key).ok_or(ApplyError::NotFound)?;
        check_precondition(versions.last(), precondition)?;

        *clock_secs += 1;
        let id = VersionId::Generation(*next_generation);
        *next_generation += 1;
        for recorded in versions.iter_mut() {
            recorded.is_latest = false;
        }
        versions.push(Version {
            key: key.to_owned(),
            id,
            created_at: timestamp(*clock_secs),
            is_tombstone: true,
            is_latest: true,
            digest: None,
            size: 0,
        });
        Ok(())
    }
}

fn check_precondition(
    head: Option<&Version>,
    precondition: &Precondition,
) -> Result<(), ApplyError> {
    let Some(head) = head else {
        return Ok(());
    };
    match precondition {
        Precondition::None => Ok(()),
        Precondition::UnmodifiedSince(instant) if head.created_at <= *instant => Ok(()),
        Precondition::UnmodifiedSince(_) => Err(ApplyError::PreconditionFailed),
        Precondition::GenerationMatch(generation) => match &head.id {
            VersionId::Generation(current) if current == generation => Ok(()),
            _ => Err(ApplyError::PreconditionFailed),
        },
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).expect("logical clock stays in range")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn copy_appends_a_new_head() {
        let bucket = MemBucket::new();
        let v1 = bucket.put("a.txt", b"digest-1", 3);
        bucket.put("a.txt", b"digest-2", 4);

        let result = bucket
            .copy_version("a.txt", &v1.id, v1.size, &Precondition::None, &cancel())
            .await
            .unwrap();
        assert_eq!(result.digest, Some(ContentDigest::new(&b"digest-1"[..])));

        let head = bucket.head("a.txt").unwrap();
        assert!(!head.is_tombstone);
        assert_eq!(head.digest, Some(ContentDigest::new(&b"digest-1"[..])));
        assert_eq!(bucket.version_count("a.txt"), 3);
    }

    #[tokio::test]
    async fn generation_match_rejects_raced_heads() {
        let bucket = MemBucket::new();
        let v1 = bucket.put("a.txt", b"digest-1", 3);
        bucket.put("a.txt", b"digest-2", 4);

        let stale = match v1.id {
            VersionId::Generation(generation) => Precondition::GenerationMatch(generation),
            _ => unreachable!(),
        };
        let err = bucket
            .delete_current("a.txt", &stale, &cancel())
            .await
            .unwrap_err();
        assert!(err.is_precondition_failure());
        // The rejected delete appended nothing.
        assert_eq!(bucket.version_count("a.txt"), 2);
    }

    #[tokio::test]
    async fn delete_appends_a_tombstone() {
        let bucket = MemBucket::new();
        bucket.put("a.txt", b"digest-1", 3);
        bucket
            .delete_current("a.txt", &Precondition::None, &cancel())
            .await
            .unwrap();
        let head = bucket.head("a.txt").unwrap();
        assert!(head.is_tombstone);
        assert_eq!(bucket.version_count("a.txt"), 2);
    }
}
