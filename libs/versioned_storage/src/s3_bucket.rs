//! S3-style backend on top of `aws-sdk-s3`.
//!
//! Version history comes from `ListObjectVersions`: live revisions and
//! delete markers arrive as two separate collections per page and are
//! flattened into [`Version`] records here. Reinstating a version is a
//! server-side copy of `key?versionId=...` onto `key` itself; sources of
//! 5 GiB and above go through the multipart copy path.

use std::time::Duration;

use anyhow::{anyhow, Context};
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::list_object_versions::ListObjectVersionsOutput;
use aws_sdk_s3::primitives::DateTime as SdkDateTime;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, DeleteMarkerEntry, ObjectVersion,
};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    ApplyError, ContentDigest, CopyResult, ListError, Precondition, Version, VersionId,
    VersionPage, VersionStream, VersionedStorage, MAX_SINGLE_COPY_BYTES,
};

const LIST_MAX_RETRIES: usize = 8;
/// Source range covered by one `UploadPartCopy` request.
const MULTIPART_COPY_PART_BYTES: u64 = 1024 * 1024 * 1024;

/// AWS S3 bucket access for rollback operations.
pub struct S3Bucket {
    client: Client,
    bucket_name: String,
}

impl S3Bucket {
    /// Creates the client from the default credential chain (environment,
    /// shared config, IMDS), optionally pinned to a named profile.
    /// `AWS_ENDPOINT_URL` overrides the endpoint for S3-compatible stores.
    pub async fn new(bucket_name: &str, profile: Option<&str>) -> Self {
        debug!("creating S3 client for bucket {bucket_name}");
        let mut loader = aws_config::defaults(BehaviorVersion::v2024_03_28());
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        if let Ok(endpoint) = std::env::var("AWS_ENDPOINT_URL") {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self {
            client: Client::new(&config),
            bucket_name: bucket_name.to_owned(),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    async fn list_versions_page(
        &self,
        prefix: &str,
        key_marker: Option<String>,
        version_id_marker: Option<String>,
    ) -> Result<ListObjectVersionsOutput, ListError> {
        for trial in 0..LIST_MAX_RETRIES {
            match self
                .client
                .list_object_versions()
                .bucket(&self.bucket_name)
                .prefix(prefix)
                .set_key_marker(key_marker.clone())
                .set_version_id_marker(version_id_marker.clone())
                .send()
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if trial == LIST_MAX_RETRIES - 1 {
                        return Err(ListError::Other(anyhow::Error::new(e).context(format!(
                            "list object versions of '{}' under '{prefix}'",
                            self.bucket_name
                        ))));
                    }
                    error!(
                        "list_object_versions failed: bucket={}, prefix={prefix}, error={}",
                        self.bucket_name,
                        DisplayErrorContext(&e),
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        Err(ListError::Other(anyhow!("unreachable unless LIST_MAX_RETRIES == 0")))
    }

    async fn copy_single_part(
        &self,
        key: &str,
        copy_source: &str,
        precondition: &Precondition,
    ) -> Result<CopyResult, ApplyError> {
        let mut request = self
            .client
            .copy_object()
            .bucket(&self.bucket_name)
            .key(key)
            .copy_source(copy_source);
        match precondition {
            Precondition::None => {}
            Precondition::UnmodifiedSince(instant) => {
                request =
                    request.copy_source_if_unmodified_since(SdkDateTime::from_secs(instant.timestamp()));
            }
            Precondition::GenerationMatch(_) => {
                return Err(ApplyError::Other(anyhow!(
                    "the S3-style backend takes unmodified-since preconditions, not generation matches"
                )))
            }
        }
        let response = request
            .send()
            .await
            .map_err(|e| apply_error(e, "copy", key))?;
        Ok(CopyResult {
            key: key.to_owned(),
            version_id: response
                .version_id()
                .map(|id| VersionId::Opaque(id.to_owned())),
            digest: response
                .copy_object_result()
                .and_then(|result| result.e_tag())
                .map(trimmed_etag),
        })
    }

    /// Multipart copy for sources the single-part call cannot handle. The
    /// destination precondition is not expressible on this path.
    async fn copy_multipart(
        &self,
        key: &str,
        copy_source: &str,
        size: u64,
    ) -> Result<CopyResult, ApplyError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| apply_error(e, "start multipart copy of", key))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| ApplyError::Other(anyhow!("multipart upload of '{key}' has no upload id")))?
            .to_owned();

        match self.copy_parts(key, copy_source, size, &upload_id).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if let Err(abort_error) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket_name)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    error!(
                        "failed to abort multipart copy of '{key}': {}",
                        DisplayErrorContext(&abort_error),
                    );
                }
                Err(e)
            }
        }
    }

    async fn copy_parts(
        &self,
        key: &str,
        copy_source: &str,
        size: u64,
        upload_id: &str,
    ) -> Result<CopyResult, ApplyError> {
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1i32;
        while offset < size {
            let end = (offset + MULTIPART_COPY_PART_BYTES).min(size) - 1;
            let part = self
                .client
                .upload_part_copy()
                .bucket(&self.bucket_name)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .copy_source(copy_source)
                .copy_source_range(format!("bytes={offset}-{end}"))
                .send()
                .await
                .map_err(|e| apply_error(e, "copy part of", key))?;
            let etag = part
                .copy_part_result()
                .and_then(|result| result.e_tag())
                .ok_or_else(|| {
                    ApplyError::Other(anyhow!("part {part_number} of '{key}' came back without an etag"))
                })?
                .to_owned();
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build(),
            );
            offset = end + 1;
            part_number += 1;
        }

        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket_name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| apply_error(e, "complete multipart copy of", key))?;
        Ok(CopyResult {
            key: key.to_owned(),
            version_id: completed
                .version_id()
                .map(|id| VersionId::Opaque(id.to_owned())),
            digest: completed.e_tag().map(trimmed_etag),
        })
    }
}

impl VersionedStorage for S3Bucket {
    fn list_versions<'a>(
        &'a self,
        prefix: &'a str,
        cancel: &'a CancellationToken,
    ) -> VersionStream<'a> {
        Box::pin(async_stream::stream! {
            let mut key_marker: Option<String> = None;
            let mut version_id_marker: Option<String> = None;
            loop {
                let response = tokio::select! {
                    response = self.list_versions_page(
                        prefix,
                        key_marker.take(),
                        version_id_marker.take(),
                    ) => response,
                    _ = cancel.cancelled() => Err(ListError::Cancelled),
                };
                let response = match response {
                    Ok(response) => response,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };

                match page_versions(&response) {
                    Ok(page) => yield Ok(page),
                    Err(e) => {
                        yield Err(ListError::Other(e));
                        break;
                    }
                }

                if !response.is_truncated().unwrap_or(false) {
                    break;
                }
                key_marker = response.next_key_marker().map(str::to_owned);
                version_id_marker = response.next_version_id_marker().map(str::to_owned);
                if key_marker.is_none() && version_id_marker.is_none() {
                    yield Err(ListError::Other(anyhow!(
                        "truncated listing without continuation markers"
                    )));
                    break;
                }
            }
        })
    }

    async fn copy_version(
        &self,
        key: &str,
        from: &VersionId,
        size: u64,
        precondition: &Precondition,
        cancel: &CancellationToken,
    ) -> Result<CopyResult, ApplyError> {
        let VersionId::Opaque(from_id) = from else {
            return Err(ApplyError::Other(anyhow!(
                "the S3-style backend uses opaque version ids"
            )));
        };
        let copy_source = copy_source_url(&self.bucket_name, key, from_id);
        let copy = async {
            if size < MAX_SINGLE_COPY_BYTES {
                self.copy_single_part(key, &copy_source, precondition).await
            } else {
                self.copy_multipart(key, &copy_source, size).await
            }
        };
        tokio::select! {
            result = copy => result,
            _ = cancel.cancelled() => Err(ApplyError::Cancelled),
        }
    }

    async fn delete_current(
        &self,
        key: &str,
        _precondition: &Precondition,
        cancel: &CancellationToken,
    ) -> Result<(), ApplyError> {
        // DeleteObject has no unmodified-since condition in the provider
        // API; the delete marker is appended unconditionally.
        let request = self.client.delete_object().bucket(&self.bucket_name).key(key);
        tokio::select! {
            response = request.send() => response
                .map(|_| ())
                .map_err(|e| apply_error(e, "delete", key)),
            _ = cancel.cancelled() => Err(ApplyError::Cancelled),
        }
    }
}

fn page_versions(response: &ListObjectVersionsOutput) -> anyhow::Result<VersionPage> {
    let mut page = VersionPage::default();
    for entry in response.versions() {
        page.versions.push(live_version(entry)?);
    }
    for marker in response.delete_markers() {
        page.versions.push(marker_version(marker)?);
    }
    Ok(page)
}

fn live_version(entry: &ObjectVersion) -> anyhow::Result<Version> {
    Ok(Version {
        key: entry
            .key()
            .context("object version without a key")?
            .to_owned(),
        id: VersionId::Opaque(
            entry
                .version_id()
                .context("object version without a version id")?
                .to_owned(),
        ),
        created_at: chrono_datetime(
            entry
                .last_modified()
                .context("object version without a last-modified time")?,
        )?,
        is_tombstone: false,
        is_latest: entry.is_latest().unwrap_or(false),
        digest: entry.e_tag().map(trimmed_etag),
        size: entry.size().unwrap_or(0).max(0) as u64,
    })
}

fn marker_version(marker: &DeleteMarkerEntry) -> anyhow::Result<Version> {
    Ok(Version {
        key: marker
            .key()
            .context("delete marker without a key")?
            .to_owned(),
        id: VersionId::Opaque(
            marker
                .version_id()
                .context("delete marker without a version id")?
                .to_owned(),
        ),
        created_at: chrono_datetime(
            marker
                .last_modified()
                .context("delete marker without a last-modified time")?,
        )?,
        is_tombstone: true,
        is_latest: marker.is_latest().unwrap_or(false),
        digest: None,
        size: 0,
    })
}

fn trimmed_etag(etag: &str) -> ContentDigest {
    ContentDigest::new(etag.trim_matches('"'))
}

fn chrono_datetime(value: &SdkDateTime) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
        .with_context(|| format!("timestamp {value} out of range"))
}

/// Copy-source reference for `key?versionId=...`, percent-encoded the way
/// the provider expects.
fn copy_source_url(bucket: &str, key: &str, version_id: &str) -> String {
    let encoded_key: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
    let encoded_id: String = url::form_urlencoded::byte_serialize(version_id.as_bytes()).collect();
    format!("{bucket}/{encoded_key}?versionId={encoded_id}")
}

fn apply_error<E>(error: SdkError<E>, verb: &str, key: &str) -> ApplyError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match error.code() {
        Some("PreconditionFailed") => ApplyError::PreconditionFailed,
        Some("NoSuchKey") | Some("NoSuchVersion") | Some("NoSuchUpload") => ApplyError::NotFound,
        _ => ApplyError::Other(anyhow::Error::new(error).context(format!("{verb} '{key}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_source_encodes_key_and_version() {
        assert_eq!(
            copy_source_url("mybucket", "a dir/b.txt", "3HL4kqtJ+lcpXroDTDmJ"),
            "mybucket/a+dir%2Fb.txt?versionId=3HL4kqtJ%2BlcpXroDTDmJ"
        );
    }

    #[test]
    fn live_version_trims_quoted_etag() {
        let entry = ObjectVersion::builder()
            .key("a.txt")
            .version_id("v1")
            .last_modified(SdkDateTime::from_secs(10))
            .is_latest(true)
            .e_tag("\"d41d8cd98f00b204e9800998ecf8427e\"")
            .size(3)
            .build();
        let version = live_version(&entry).unwrap();
        assert_eq!(version.key, "a.txt");
        assert_eq!(version.id, VersionId::Opaque("v1".to_owned()));
        assert_eq!(version.created_at.timestamp(), 10);
        assert!(!version.is_tombstone);
        assert!(version.is_latest);
        assert_eq!(
            version.digest,
            Some(ContentDigest::new("d41d8cd98f00b204e9800998ecf8427e"))
        );
        assert_eq!(version.size, 3);
    }

    #[test]
    fn markers_become_tombstones() {
        let marker = DeleteMarkerEntry::builder()
            .key("a.txt")
            .version_id("v2")
            .last_modified(SdkDateTime::from_secs(20))
            .is_latest(false)
            .build();
        let version = marker_version(&marker).unwrap();
        assert!(version.is_tombstone);
        assert_eq!(version.size, 0);
        assert_eq!(version.digest, None);
    }
}
