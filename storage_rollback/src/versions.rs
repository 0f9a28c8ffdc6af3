//! The `versions` subcommand: render the recorded history of every object
//! under the prefix.

use tokio_util::sync::CancellationToken;
use versioned_storage::GenericVersionedStorage;

use crate::history::sort_versions;
use crate::listing::list_versions_by_key;
use crate::{format_bytes_iec, BucketTarget};

pub async fn show_versions(
    storage: &GenericVersionedStorage,
    target: &BucketTarget,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let by_key = list_versions_by_key(storage, &target.prefix, cancel).await?;
    let mut entries: Vec<_> = by_key.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (key, mut versions) in entries {
        sort_versions(&mut versions);
        println!("{key}");
        for version in &versions {
            let mut line = format!(
                "    #{} {} {}",
                version.id,
                version.created_at,
                format_bytes_iec(version.size)
            );
            if let Some(digest) = &version.digest {
                line.push_str(&format!(" digest: {digest}"));
            }
            if version.is_tombstone {
                line.push_str(" (delete marker)");
            }
            if version.is_latest {
                line.push_str(" LATEST");
            }
            println!("{line}");
        }
    }
    Ok(())
}
