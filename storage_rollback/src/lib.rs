#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]
pub mod actions;
pub mod executor;
pub mod history;
pub mod listing;
pub mod rollback;
pub mod timestamp;
pub mod versions;

use std::fmt::Display;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use versioned_storage::{GcsBucket, GenericVersionedStorage, S3Bucket};

/// Which provider a bucket URL selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    S3,
    Gcs,
}

impl Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::S3 => "s3",
            Self::Gcs => "gs",
        })
    }
}

/// A parsed bucket URL: provider, bucket name and path prefix. An empty
/// prefix targets the whole bucket; the prefix may also point at a single
/// object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTarget {
    pub kind: StorageKind,
    pub bucket: String,
    pub prefix: String,
}

impl Display for BucketTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "{}://{}", self.kind, self.bucket)
        } else {
            write!(f, "{}://{}/{}", self.kind, self.bucket, self.prefix)
        }
    }
}

/// Parses `(s3|gs)://<bucket>[/<prefix>]`. A single slash after the scheme
/// is tolerated.
pub fn parse_bucket_url(url: &str) -> anyhow::Result<BucketTarget> {
    let (scheme, rest) = url
        .split_once(':')
        .with_context(|| format!("bucket URL '{url}' has no scheme"))?;
    let kind = match scheme {
        "s3" => StorageKind::S3,
        "gs" => StorageKind::Gcs,
        other => bail!("unsupported bucket scheme '{other}', expected 's3' or 'gs'"),
    };
    let rest = rest.trim_start_matches('/');
    let (bucket, prefix) = match rest.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix),
        None => (rest, ""),
    };
    if bucket.is_empty() {
        bail!("bucket URL '{url}' has no bucket name");
    }
    Ok(BucketTarget {
        kind,
        bucket: bucket.to_owned(),
        prefix: prefix.to_owned(),
    })
}

/// Builds the provider client selected by the target's scheme.
pub async fn init_storage(
    target: &BucketTarget,
    aws_profile: Option<&str>,
    gcp_key_file: Option<&str>,
) -> anyhow::Result<GenericVersionedStorage> {
    Ok(match target.kind {
        StorageKind::S3 => GenericVersionedStorage::AwsS3(Arc::new(
            S3Bucket::new(&target.bucket, aws_profile).await,
        )),
        StorageKind::Gcs => GenericVersionedStorage::Gcs(Arc::new(
            GcsBucket::new(&target.bucket, gcp_key_file)
                .await
                .context("construct GCS client")?,
        )),
    })
}

pub fn init_logging(file_name: &str) -> Option<WorkerGuard> {
    let stderr_logs = fmt::Layer::new()
        .with_target(false)
        .with_writer(std::io::stderr);

    let disable_file_logging = match std::env::var("STORAGE_ROLLBACK_DISABLE_FILE_LOGGING") {
        Ok(s) => s == "1" || s.to_lowercase() == "true",
        Err(_) => false,
    };

    if disable_file_logging {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stderr_logs)
            .init();
        None
    } else {
        let (file_writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never("./logs/", file_name));
        let file_logs = fmt::Layer::new()
            .with_target(false)
            .with_ansi(false)
            .with_writer(file_writer);
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stderr_logs)
            .with(file_logs)
            .init();
        Some(guard)
    }
}

/// Renders a byte count with binary prefixes, `1023 B`, `1.5 KiB`, ...
pub fn format_bytes_iec(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_urls_parse() {
        let cases = [
            ("s3:/mybucket", StorageKind::S3, "mybucket", ""),
            ("s3://mybucket", StorageKind::S3, "mybucket", ""),
            ("s3://mybucket/path", StorageKind::S3, "mybucket", "path"),
            (
                "s3://mybucket/nested/path",
                StorageKind::S3,
                "mybucket",
                "nested/path",
            ),
            ("gs://mybucket/dir/a.txt", StorageKind::Gcs, "mybucket", "dir/a.txt"),
        ];
        for (url, kind, bucket, prefix) in cases {
            let target = parse_bucket_url(url).unwrap();
            assert_eq!(target.kind, kind, "{url}");
            assert_eq!(target.bucket, bucket, "{url}");
            assert_eq!(target.prefix, prefix, "{url}");
        }
    }

    #[test]
    fn bad_bucket_urls_are_rejected() {
        assert!(parse_bucket_url("mybucket").is_err());
        assert!(parse_bucket_url("http://mybucket").is_err());
        assert!(parse_bucket_url("s3://").is_err());
    }

    #[test]
    fn byte_counts_format_with_binary_prefixes() {
        assert_eq!(format_bytes_iec(0), "0 B");
        assert_eq!(format_bytes_iec(1023), "1023 B");
        assert_eq!(format_bytes_iec(1024), "1.0 KiB");
        assert_eq!(format_bytes_iec(1536), "1.5 KiB");
        assert_eq!(format_bytes_iec(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }
}
