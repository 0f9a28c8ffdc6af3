//! Parallel execution of rollback actions.
//!
//! Actions are partitioned into contiguous chunks, one sequential worker
//! per chunk, no work stealing. Contiguity keeps each worker inside one
//! region of the (sorted) key space, which plays well with provider-side
//! rate limiting by prefix. Results stream back through a bounded channel
//! in arrival order; the channel closes once every worker is done.

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use versioned_storage::{ApplyError, CopyResult, GenericVersionedStorage};

use crate::actions::FileAction;

/// Capacity of the shared result queue; workers block on send when the
/// consumer lags behind.
pub const RESULT_QUEUE_DEPTH: usize = 1024;

/// Batches this small are not worth the fan-out.
const SEQUENTIAL_BATCH_LIMIT: usize = 4;

/// Outcome of one executed action. Errors are carried here and never
/// propagate out of a worker.
#[derive(Debug)]
pub struct ActionOutcome {
    pub action: FileAction,
    /// The new head revision a successful create produced.
    pub new_version: Option<CopyResult>,
    pub error: Option<ApplyError>,
}

/// The worker count actually used for a batch.
pub fn effective_parallelism(pending: usize, requested: usize) -> usize {
    if pending <= SEQUENTIAL_BATCH_LIMIT {
        1
    } else {
        requested.max(1)
    }
}

/// Splits `actions` into `parts` contiguous chunks of ⌈n/parts⌉ entries;
/// the final chunk takes the remainder.
fn partition(actions: Vec<FileAction>, parts: usize) -> Vec<Vec<FileAction>> {
    if actions.is_empty() {
        return Vec::new();
    }
    let chunk_size = actions.len().div_ceil(parts);
    actions
        .chunks(chunk_size)
        .map(<[FileAction]>::to_vec)
        .collect()
}

/// Spawns the worker fan-out over `actions` and returns the receiving end
/// of the result stream. Results arrive in no particular order.
pub fn spawn_actions(
    storage: GenericVersionedStorage,
    actions: Vec<FileAction>,
    parallelism: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<ActionOutcome> {
    let (result_tx, result_rx) = mpsc::channel(RESULT_QUEUE_DEPTH);
    let parts = effective_parallelism(actions.len(), parallelism);
    let chunks = partition(actions, parts);

    tokio::spawn(async move {
        let mut workers = JoinSet::new();
        for chunk in chunks {
            let storage = storage.clone();
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            workers.spawn(run_chunk(storage, chunk, result_tx, cancel));
        }
        drop(result_tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("action worker failed: {e}");
            }
        }
    });

    result_rx
}

async fn run_chunk(
    storage: GenericVersionedStorage,
    chunk: Vec<FileAction>,
    result_tx: mpsc::Sender<ActionOutcome>,
    cancel: CancellationToken,
) {
    for action in chunk {
        if cancel.is_cancelled() {
            break;
        }
        let outcome = match apply_action(&storage, &action, &cancel).await {
            Ok(new_version) => ActionOutcome {
                action,
                new_version,
                error: None,
            },
            Err(error) => ActionOutcome {
                action,
                new_version: None,
                error: Some(error),
            },
        };
        if result_tx.send(outcome).await.is_err() {
            // Consumer is gone; nothing left to report to.
            break;
        }
    }
}

async fn apply_action(
    storage: &GenericVersionedStorage,
    action: &FileAction,
    cancel: &CancellationToken,
) -> Result<Option<CopyResult>, ApplyError> {
    match action {
        FileAction::Create {
            source,
            precondition,
        } => storage
            .copy_version(&source.key, &source.version, source.size, precondition, cancel)
            .await
            .map(Some),
        FileAction::Delete {
            source,
            precondition,
        } => storage
            .delete_current(&source.key, precondition, cancel)
            .await
            .map(|()| None),
        // Filtered out before execution; nothing to apply.
        FileAction::NoAction => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use versioned_storage::{MemBucket, Precondition, VersionId};

    use super::*;
    use crate::actions::FileOperand;

    fn delete_action(key: &str, generation: i64) -> FileAction {
        FileAction::Delete {
            source: FileOperand {
                key: key.to_owned(),
                version: VersionId::Generation(generation),
                size: 0,
            },
            precondition: Precondition::None,
        }
    }

    #[test]
    fn thousand_actions_split_into_requested_parts() {
        let actions: Vec<_> = (0..1000i64).map(|i| delete_action(&format!("k{i}"), i)).collect();
        let chunks = partition(actions, 32);
        assert_eq!(chunks.len(), 32);
        assert!(chunks[..31].iter().all(|chunk| chunk.len() == 32));
        assert_eq!(chunks[31].len(), 8);
    }

    #[test]
    fn small_batches_run_sequentially() {
        assert_eq!(effective_parallelism(4, 32), 1);
        assert_eq!(effective_parallelism(1, 32), 1);
        assert_eq!(effective_parallelism(5, 32), 32);
        assert_eq!(effective_parallelism(5, 0), 1);
    }

    #[test]
    fn partitioning_preserves_order_and_contiguity() {
        let actions: Vec<_> = (0..10i64).map(|i| delete_action(&format!("k{i}"), i)).collect();
        let chunks = partition(actions, 3);
        assert_eq!(chunks.len(), 3);
        let keys: Vec<_> = chunks
            .iter()
            .flatten()
            .map(|action| action.source().unwrap().key.clone())
            .collect();
        let expected: Vec<_> = (0..10).map(|i| format!("k{i}")).collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn every_action_reports_exactly_once() {
        let bucket = Arc::new(MemBucket::new());
        let mut actions = Vec::new();
        for i in 0..10 {
            let key = format!("dir/file-{i}");
            let version = bucket.put(&key, b"digest", 3);
            actions.push(FileAction::Delete {
                source: FileOperand {
                    key,
                    version: version.id,
                    size: version.size,
                },
                precondition: Precondition::None,
            });
        }

        let storage = GenericVersionedStorage::Mem(bucket.clone());
        let mut results = spawn_actions(storage, actions, 3, CancellationToken::new());
        let mut reported = 0;
        while let Some(outcome) = results.recv().await {
            assert!(outcome.error.is_none(), "{:?}", outcome.error);
            reported += 1;
        }
        assert_eq!(reported, 10);
        for key in bucket.keys() {
            assert!(bucket.head(&key).unwrap().is_tombstone);
        }
    }

    #[tokio::test]
    async fn cancelled_runs_stop_starting_new_actions() {
        let bucket = Arc::new(MemBucket::new());
        let mut actions = Vec::new();
        for i in 0..100 {
            let key = format!("file-{i}");
            let version = bucket.put(&key, b"digest", 3);
            actions.push(FileAction::Delete {
                source: FileOperand {
                    key,
                    version: version.id,
                    size: version.size,
                },
                precondition: Precondition::None,
            });
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let storage = GenericVersionedStorage::Mem(bucket.clone());
        let mut results = spawn_actions(storage, actions, 4, cancel);
        let mut reported = 0;
        while results.recv().await.is_some() {
            reported += 1;
        }
        assert_eq!(reported, 0);
    }
}
