//! Full-history listing, grouped by key.

use std::collections::HashMap;

use anyhow::Context;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use versioned_storage::{GenericVersionedStorage, Version};

/// Drains the version listing for `prefix` and groups every recorded
/// revision by key. An empty prefix lists the whole bucket.
///
/// Per-key work must not begin before this returns: the last page can
/// still add versions to any key. Any listing failure aborts the run and
/// the partial map is discarded.
pub async fn list_versions_by_key(
    storage: &GenericVersionedStorage,
    prefix: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<HashMap<String, Vec<Version>>> {
    let mut by_key: HashMap<String, Vec<Version>> = HashMap::new();
    let mut records = 0usize;
    let mut pages = 0usize;

    let mut stream = storage.list_versions(prefix, cancel);
    while let Some(page) = stream.next().await {
        let page = page.context("list object versions")?;
        pages += 1;
        records += page.versions.len();
        for version in page.versions {
            by_key.entry(version.key.clone()).or_default().push(version);
        }
    }

    debug!(
        "listed {records} versions of {} keys in {pages} pages",
        by_key.len()
    );
    Ok(by_key)
}
