//! Reconstruction of an object's observable state at an instant from its
//! recorded version history.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use versioned_storage::Version;

/// The observable condition of a path at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    /// No revision precedes the instant.
    NotExistent,
    /// The most recent preceding revision is live data.
    Exists,
    /// The most recent preceding revision is a tombstone.
    Deleted,
}

impl Display for PathStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotExistent => "not existent",
            Self::Exists => "exists",
            Self::Deleted => "deleted",
        })
    }
}

/// The projection of one key's history at an instant, carrying the
/// revision it was derived from where one exists.
#[derive(Debug, Clone)]
pub enum PathState {
    NotExistent,
    Exists(Version),
    Deleted(Version),
}

impl PathState {
    pub fn status(&self) -> PathStatus {
        match self {
            Self::NotExistent => PathStatus::NotExistent,
            Self::Exists(_) => PathStatus::Exists,
            Self::Deleted(_) => PathStatus::Deleted,
        }
    }

    pub fn version(&self) -> Option<&Version> {
        match self {
            Self::NotExistent => None,
            Self::Exists(version) | Self::Deleted(version) => Some(version),
        }
    }
}

impl Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotExistent => f.write_str("not existent"),
            Self::Exists(version) => match &version.digest {
                Some(digest) => {
                    write!(f, "exists at version #{}, digest: {digest}", version.id)
                }
                None => write!(f, "exists at version #{}", version.id),
            },
            Self::Deleted(version) => write!(f, "deleted at version #{}", version.id),
        }
    }
}

/// Orders a key's history by creation instant. Tombstones sort before live
/// revisions created at the same instant: an overwrite on the
/// numeric-generation provider records the old generation's deletion at
/// exactly the successor's creation instant, and the successor must win.
pub fn sort_versions(versions: &mut [Version]) {
    versions.sort_by_key(|version| (version.created_at, !version.is_tombstone));
}

/// Derives `(state at t, current state)` for one key from its versions.
///
/// The state "at t" excludes events happening exactly at `t`: a revision
/// only contributes when `created_at < t`.
pub fn state_diff_at(versions: &mut [Version], t: DateTime<Utc>) -> (PathState, PathState) {
    if versions.is_empty() {
        return (PathState::NotExistent, PathState::NotExistent);
    }
    sort_versions(versions);
    let first = &versions[0];
    let last = &versions[versions.len() - 1];
    let current = state_of(last);

    if t > last.created_at {
        return (state_of_at(last, t), current);
    }
    if t < first.created_at {
        return (PathState::NotExistent, current);
    }

    let mut at_t = PathState::NotExistent;
    for version in versions.iter().rev() {
        if version.created_at < t {
            at_t = state_of_at(version, t);
            break;
        }
    }
    (at_t, current)
}

/// The last known state a revision implies, with no reference instant.
pub fn state_of(version: &Version) -> PathState {
    if version.is_tombstone {
        PathState::Deleted(version.clone())
    } else {
        PathState::Exists(version.clone())
    }
}

/// The state a revision implies as seen from `t`: a tombstone takes effect
/// only strictly before `t`.
fn state_of_at(version: &Version, t: DateTime<Utc>) -> PathState {
    if version.is_tombstone && version.created_at < t {
        PathState::Deleted(version.clone())
    } else {
        PathState::Exists(version.clone())
    }
}
