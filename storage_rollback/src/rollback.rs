//! The rollback run: list history, decide one action per key, execute the
//! actions in parallel and aggregate the results.

use std::fmt::{self, Display};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use versioned_storage::GenericVersionedStorage;

use crate::actions::{action_for, ActionKind, FileAction};
use crate::executor::spawn_actions;
use crate::history::state_diff_at;
use crate::listing::list_versions_by_key;
use crate::BucketTarget;

/// Sidecar file in the working directory receiving per-action failures.
pub const ERRORS_LOG_FILE: &str = "errors.log";

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Perform the rollback.
    Execute,
    /// Only tally what would be done, by action kind.
    DryRun,
    /// Like dry-run, plus one record per key explaining the decision.
    Explain,
}

impl Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Execute => "execute",
            Self::DryRun => "dry-run",
            Self::Explain => "explain",
        })
    }
}

pub struct RollbackParams {
    pub target: BucketTarget,
    /// The instant to which observable state is rolled back.
    pub at: DateTime<Utc>,
    pub mode: RunMode,
    pub concurrency: usize,
    pub quiet: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct RollbackSummary {
    pub created: u64,
    pub deleted: u64,
    pub no_action: u64,
    pub errors: usize,
    pub listing_time: Duration,
    pub decision_time: Duration,
    pub execution_time: Duration,
}

impl RollbackSummary {
    pub fn summary_string(&self, at: DateTime<Utc>) -> String {
        let total = self.listing_time + self.decision_time + self.execution_time;
        format!(
            "Bucket restored to {at}:\n\
             \x20   {} objects created\n\
             \x20   {} objects deleted\n\
             \x20   {} objects did not need any action\n\
             \x20   {} errors\n\
             Elapsed time: {total:.1?}\n\
             \x20   retrieving object info: {:.1?}\n\
             \x20   action decision: {:.1?}\n\
             \x20   action execution: {:.1?}",
            self.created,
            self.deleted,
            self.no_action,
            self.errors,
            self.listing_time,
            self.decision_time,
            self.execution_time,
        )
    }
}

/// Runs one rollback (or one of the dry-run modes) against `storage`.
///
/// Per-action failures are printed, counted and written to
/// [`ERRORS_LOG_FILE`]; only input, setup and listing failures surface as
/// an error from here.
pub async fn rollback_bucket(
    storage: &GenericVersionedStorage,
    params: &RollbackParams,
    cancel: &CancellationToken,
) -> anyhow::Result<RollbackSummary> {
    let mut summary = RollbackSummary::default();

    let listing_started = Instant::now();
    let by_key = list_versions_by_key(storage, &params.target.prefix, cancel)
        .await
        .context("list bucket version history")?;
    summary.listing_time = listing_started.elapsed();

    // Decisions are pure CPU; both phases complete before any mutation
    // starts. Keys are processed in sorted order so the executor's
    // contiguous chunks cover contiguous key ranges.
    let decision_started = Instant::now();
    let mut entries: Vec<_> = by_key.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut pending = Vec::new();
    for (key, mut versions) in entries {
        let (desired, current) = state_diff_at(&mut versions, params.at);
        let action = action_for(&current, &desired);
        if params.mode == RunMode::Explain {
            println!(
                "{key}: {action}\n  current state: {current}\n  restore state: {desired}"
            );
        }
        match action.kind() {
            ActionKind::NoAction => summary.no_action += 1,
            ActionKind::Create | ActionKind::Delete => pending.push(action),
        }
    }
    summary.decision_time = decision_started.elapsed();

    match params.mode {
        RunMode::DryRun | RunMode::Explain => {
            let to_create = pending
                .iter()
                .filter(|action| action.kind() == ActionKind::Create)
                .count();
            let to_delete = pending.len() - to_create;
            println!("To create: {to_create} objects");
            println!("To delete: {to_delete} objects");
            println!("No action: {} objects", summary.no_action);
            Ok(summary)
        }
        RunMode::Execute => {
            execute_pending(storage, params, pending, &mut summary, cancel).await?;
            println!("\n{}", summary.summary_string(params.at));
            if summary.errors > 0 {
                println!(
                    "There were errors running the restore command.\n\
                     A file '{ERRORS_LOG_FILE}' was created with the error details"
                );
            }
            Ok(summary)
        }
    }
}

async fn execute_pending(
    storage: &GenericVersionedStorage,
    params: &RollbackParams,
    pending: Vec<FileAction>,
    summary: &mut RollbackSummary,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let execution_started = Instant::now();
    let total = pending.len();
    info!(
        "executing {total} actions against '{}' with concurrency {}",
        params.target, params.concurrency
    );

    let mut results = spawn_actions(
        storage.clone(),
        pending,
        params.concurrency,
        cancel.clone(),
    );

    let mut index = 0usize;
    let mut failures: Vec<String> = Vec::new();
    while let Some(outcome) = results.recv().await {
        index += 1;
        let source = outcome.action.source();
        let key = source.map(|source| source.key.as_str()).unwrap_or_default();
        if let Some(error) = &outcome.error {
            println!(
                "[{index}/{total}] Error for {} '{key}': {error}",
                outcome.action.kind()
            );
            failures.push(format!("{} '{key}': {error}", outcome.action.kind()));
            continue;
        }
        match &outcome.action {
            FileAction::Create { source, .. } => {
                if !params.quiet {
                    match outcome
                        .new_version
                        .as_ref()
                        .and_then(|new| new.version_id.as_ref())
                    {
                        Some(new_id) => println!(
                            "[{index}/{total}] Created {} (#{new_id}) from #{}",
                            source.key, source.version
                        ),
                        None => println!(
                            "[{index}/{total}] Created {} from #{}",
                            source.key, source.version
                        ),
                    }
                }
                summary.created += 1;
            }
            FileAction::Delete { source, .. } => {
                if !params.quiet {
                    println!(
                        "[{index}/{total}] Deleted {} (#{})",
                        source.key, source.version
                    );
                }
                summary.deleted += 1;
            }
            FileAction::NoAction => {}
        }
    }
    summary.execution_time = execution_started.elapsed();
    summary.errors = failures.len();

    if !failures.is_empty() {
        let mut contents = String::new();
        for line in &failures {
            contents.push_str(line);
            contents.push('\n');
        }
        tokio::fs::write(ERRORS_LOG_FILE, contents)
            .await
            .with_context(|| format!("write '{ERRORS_LOG_FILE}'"))?;
    }
    Ok(())
}
