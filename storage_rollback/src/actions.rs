//! Derivation of the minimal operation that reconciles a key's current
//! state with its desired state.

use std::fmt::{self, Display};

use versioned_storage::{Precondition, Version, VersionId};

use crate::history::PathState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Delete,
    NoAction,
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::NoAction => "no action",
        })
    }
}

/// The object revision an action operates on: the version to copy from for
/// a create, the current head for a delete.
#[derive(Debug, Clone)]
pub struct FileOperand {
    pub key: String,
    pub version: VersionId,
    pub size: u64,
}

/// The decision record for one key. Creates copy an old version of the
/// object onto its own key, producing a new head with identical content;
/// deletes append a tombstone. Neither touches recorded history.
#[derive(Debug, Clone)]
pub enum FileAction {
    Create {
        source: FileOperand,
        precondition: Precondition,
    },
    Delete {
        source: FileOperand,
        precondition: Precondition,
    },
    NoAction,
}

impl FileAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Create { .. } => ActionKind::Create,
            Self::Delete { .. } => ActionKind::Delete,
            Self::NoAction => ActionKind::NoAction,
        }
    }

    pub fn source(&self) -> Option<&FileOperand> {
        match self {
            Self::Create { source, .. } | Self::Delete { source, .. } => Some(source),
            Self::NoAction => None,
        }
    }
}

impl Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { source, .. } => write!(f, "create from version #{}", source.version),
            Self::Delete { .. } => f.write_str("delete"),
            Self::NoAction => f.write_str("no action"),
        }
    }
}

/// Decides the action that transitions `current` into `desired`.
///
/// Two live states are already equal when their version ids match or their
/// digests match; only a key whose head revision and content both differ
/// from the desired version is re-created. Restoring over a tombstone needs
/// no precondition: there is no live head to race against.
pub fn action_for(current: &PathState, desired: &PathState) -> FileAction {
    match (current, desired) {
        (PathState::Exists(from), PathState::NotExistent | PathState::Deleted(_)) => {
            FileAction::Delete {
                source: operand(from),
                precondition: precondition_for(from),
            }
        }
        (PathState::Exists(from), PathState::Exists(to)) => {
            if to.id != from.id && to.digest != from.digest {
                FileAction::Create {
                    source: operand(to),
                    precondition: precondition_for(from),
                }
            } else {
                FileAction::NoAction
            }
        }
        (PathState::Deleted(_), PathState::Exists(to)) => FileAction::Create {
            source: operand(to),
            precondition: Precondition::None,
        },
        // A desired EXISTS with no current record would need a revision
        // that is gone from observable history; there is nothing to copy
        // from. Everything else already agrees.
        _ => FileAction::NoAction,
    }
}

fn operand(version: &Version) -> FileOperand {
    FileOperand {
        key: version.key.clone(),
        version: version.id.clone(),
        size: version.size,
    }
}

/// The optimistic-concurrency constraint protecting an action against
/// writers that touched the head after listing, in the shape the owning
/// provider understands.
fn precondition_for(current: &Version) -> Precondition {
    match &current.id {
        VersionId::Opaque(_) => Precondition::UnmodifiedSince(current.created_at),
        VersionId::Generation(generation) => Precondition::GenerationMatch(*generation),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use versioned_storage::ContentDigest;

    use super::*;
    use crate::history::PathStatus;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn opaque(id: &str, secs: i64, tombstone: bool, digest: &str, size: u64) -> Version {
        Version {
            key: "a.txt".to_owned(),
            id: VersionId::Opaque(id.to_owned()),
            created_at: at(secs),
            is_tombstone: tombstone,
            is_latest: false,
            digest: (!tombstone).then(|| ContentDigest::new(digest)),
            size,
        }
    }

    fn generation(id: i64, secs: i64, digest: &str, size: u64) -> Version {
        Version {
            key: "a.txt".to_owned(),
            id: VersionId::Generation(id),
            created_at: at(secs),
            is_tombstone: false,
            is_latest: false,
            digest: Some(ContentDigest::new(digest)),
            size,
        }
    }

    #[test]
    fn deleted_at_target_while_live_now_deletes_with_precondition() {
        let current = PathState::Exists(opaque("v3", 30, false, "digest-3", 5));
        let desired = PathState::Deleted(opaque("v2", 20, true, "", 0));
        let action = action_for(&current, &desired);
        let FileAction::Delete { source, precondition } = action else {
            panic!("expected a delete, got {action}");
        };
        assert_eq!(source.version, VersionId::Opaque("v3".to_owned()));
        assert_eq!(precondition, Precondition::UnmodifiedSince(at(30)));
    }

    #[test]
    fn differing_content_recreates_from_the_old_version() {
        let current = PathState::Exists(opaque("v3", 30, false, "digest-3", 5));
        let desired = PathState::Exists(opaque("v1", 10, false, "digest-1", 3));
        let action = action_for(&current, &desired);
        let FileAction::Create { source, precondition } = action else {
            panic!("expected a create, got {action}");
        };
        assert_eq!(source.version, VersionId::Opaque("v1".to_owned()));
        // The copy-strategy decision needs the source version's size.
        assert_eq!(source.size, 3);
        assert_eq!(precondition, Precondition::UnmodifiedSince(at(30)));
    }

    #[test]
    fn absent_at_target_while_live_now_deletes() {
        let current = PathState::Exists(opaque("v3", 30, false, "digest-3", 5));
        let action = action_for(&current, &PathState::NotExistent);
        assert_eq!(action.kind(), ActionKind::Delete);
        assert_eq!(action.source().unwrap().size, 5);
    }

    #[test]
    fn identical_content_under_a_different_generation_is_left_alone() {
        // Generations differ but digests are equal: re-creating the head
        // would only duplicate it.
        let current = PathState::Exists(generation(200, 20, "digest-x", 4));
        let desired = PathState::Exists(generation(100, 10, "digest-x", 4));
        assert_eq!(action_for(&current, &desired).kind(), ActionKind::NoAction);
    }

    #[test]
    fn restoring_over_a_tombstone_needs_no_precondition() {
        let current = PathState::Deleted(opaque("v2", 20, true, "", 0));
        let desired = PathState::Exists(opaque("v1", 10, false, "digest-1", 3));
        let FileAction::Create { precondition, .. } = action_for(&current, &desired) else {
            panic!("expected a create");
        };
        assert_eq!(precondition, Precondition::None);
    }

    #[test]
    fn generation_heads_get_generation_preconditions() {
        let current = PathState::Exists(generation(200, 20, "digest-2", 4));
        let desired = PathState::Deleted(generation(100, 10, "digest-1", 3));
        let FileAction::Delete { precondition, .. } = action_for(&current, &desired) else {
            panic!("expected a delete");
        };
        assert_eq!(precondition, Precondition::GenerationMatch(200));
    }

    #[test]
    fn every_status_pair_yields_a_decision() {
        let states = [
            PathState::NotExistent,
            PathState::Exists(opaque("v1", 10, false, "digest-1", 3)),
            PathState::Deleted(opaque("v2", 20, true, "", 0)),
        ];
        for current in &states {
            for desired in &states {
                let kind = action_for(current, desired).kind();
                let expected = match (current.status(), desired.status()) {
                    (PathStatus::Exists, PathStatus::NotExistent | PathStatus::Deleted) => {
                        ActionKind::Delete
                    }
                    // Same id on both sides here, so EXISTS -> EXISTS stays put.
                    (PathStatus::Exists, PathStatus::Exists) => ActionKind::NoAction,
                    (PathStatus::Deleted, PathStatus::Exists) => ActionKind::Create,
                    _ => ActionKind::NoAction,
                };
                assert_eq!(kind, expected, "{} -> {}", current.status(), desired.status());
            }
        }
    }
}
