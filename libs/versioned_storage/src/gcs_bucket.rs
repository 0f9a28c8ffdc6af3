//! GCS-style backend against the JSON API, authenticated with `gcp_auth`
//! bearer tokens.
//!
//! History comes from an object listing with `versions=true`. A generation
//! carries its own deletion instant (`timeDeleted`) when it was deleted or
//! superseded, so every such generation contributes two records here: a
//! live [`Version`] at `timeCreated` and a tombstone at `timeDeleted`.
//! Reinstating a version is a server-side `copyTo` of the object onto
//! itself with `sourceGeneration` selecting the source.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use gcp_auth::TokenProvider;
use reqwest::{Client, StatusCode};
use serde::{de, Deserialize, Deserializer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use url::form_urlencoded;

use crate::{
    ApplyError, ContentDigest, CopyResult, ListError, Precondition, Version, VersionId,
    VersionPage, VersionStream, VersionedStorage,
};

const GCS_SCOPES: &[&str] = &["https://www.googleapis.com/auth/devstorage.read_write"];
const STORAGE_API_BASE: &str = "https://storage.googleapis.com/storage/v1";
const LIST_MAX_RETRIES: usize = 8;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// GCS bucket access for rollback operations.
pub struct GcsBucket {
    token_provider: Arc<dyn TokenProvider>,
    client: Client,
    bucket_name: String,
    timeout: Duration,
}

impl GcsBucket {
    /// Creates the client. A service-account key file takes precedence over
    /// application-default credentials (`GOOGLE_APPLICATION_CREDENTIALS`).
    pub async fn new(bucket_name: &str, key_file: Option<&str>) -> anyhow::Result<Self> {
        debug!("creating GCS client for bucket {bucket_name}");
        let token_provider: Arc<dyn TokenProvider> = match key_file {
            Some(path) => Arc::new(
                gcp_auth::CustomServiceAccount::from_file(Path::new(path))
                    .with_context(|| format!("read service account key '{path}'"))?,
            ),
            None => gcp_auth::provider()
                .await
                .context("resolve application default credentials")?,
        };
        Ok(Self {
            token_provider,
            client: Client::new(),
            bucket_name: bucket_name.to_owned(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    async fn bearer_token(&self) -> anyhow::Result<Arc<gcp_auth::Token>> {
        self.token_provider
            .token(GCS_SCOPES)
            .await
            .context("fetch GCS access token")
    }

    fn object_uri(&self, key: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(key.as_bytes()).collect();
        format!("{STORAGE_API_BASE}/b/{}/o/{encoded}", self.bucket_name)
    }

    async fn list_versions_page(
        &self,
        prefix: &str,
        page_token: Option<&str>,
    ) -> Result<GcsListResponse, ListError> {
        let mut list_uri = format!(
            "{STORAGE_API_BASE}/b/{}/o?versions=true",
            self.bucket_name
        );
        if !prefix.is_empty() {
            let encoded: String = form_urlencoded::byte_serialize(prefix.as_bytes()).collect();
            list_uri.push_str("&prefix=");
            list_uri.push_str(&encoded);
        }
        if let Some(token) = page_token {
            let encoded: String = form_urlencoded::byte_serialize(token.as_bytes()).collect();
            list_uri.push_str("&pageToken=");
            list_uri.push_str(&encoded);
        }

        for trial in 0..LIST_MAX_RETRIES {
            let token = self.bearer_token().await.map_err(ListError::Other)?;
            let request = self.client.get(&list_uri).bearer_auth(token.as_str()).send();
            let response = match tokio::time::timeout(self.timeout, request).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    if trial == LIST_MAX_RETRIES - 1 {
                        return Err(ListError::Other(
                            anyhow::Error::new(e).context("list object versions"),
                        ));
                    }
                    error!(
                        "GCS listing failed: bucket={}, prefix={prefix}, error={e}",
                        self.bucket_name
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                Err(_) => {
                    if trial == LIST_MAX_RETRIES - 1 {
                        return Err(ListError::Timeout);
                    }
                    error!("GCS listing timed out: bucket={}, prefix={prefix}", self.bucket_name);
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                if status.is_client_error() || trial == LIST_MAX_RETRIES - 1 {
                    return Err(ListError::Other(anyhow!(
                        "GCS listing of '{}' returned {status}: {body}",
                        self.bucket_name
                    )));
                }
                error!(
                    "GCS listing failed: bucket={}, prefix={prefix}, status={status}",
                    self.bucket_name
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let body = response
                .text()
                .await
                .map_err(|e| ListError::Other(e.into()))?;
            return serde_json::from_str(&body)
                .map_err(|e| ListError::Other(anyhow::Error::new(e).context("decode GCS listing")));
        }
        Err(ListError::Other(anyhow!("unreachable unless LIST_MAX_RETRIES == 0")))
    }
}

impl VersionedStorage for GcsBucket {
    fn list_versions<'a>(
        &'a self,
        prefix: &'a str,
        cancel: &'a CancellationToken,
    ) -> VersionStream<'a> {
        Box::pin(async_stream::stream! {
            let mut page_token: Option<String> = None;
            loop {
                let response = tokio::select! {
                    response = self.list_versions_page(prefix, page_token.as_deref()) => response,
                    _ = cancel.cancelled() => Err(ListError::Cancelled),
                };
                let response = match response {
                    Ok(response) => response,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };

                let mut page = VersionPage::default();
                let mut decode_failure = None;
                for object in response.contents() {
                    match object_versions(object) {
                        Ok(versions) => page.versions.extend(versions),
                        Err(e) => {
                            decode_failure = Some(e);
                            break;
                        }
                    }
                }
                if let Some(e) = decode_failure {
                    yield Err(ListError::Other(e));
                    break;
                }
                yield Ok(page);

                match response.next_page_token {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
        })
    }

    async fn copy_version(
        &self,
        key: &str,
        from: &VersionId,
        _size: u64,
        precondition: &Precondition,
        cancel: &CancellationToken,
    ) -> Result<CopyResult, ApplyError> {
        let VersionId::Generation(generation) = from else {
            return Err(ApplyError::Other(anyhow!(
                "the GCS-style backend uses numeric generations"
            )));
        };
        let encoded: String = form_urlencoded::byte_serialize(key.as_bytes()).collect();
        let mut copy_uri = format!(
            "{STORAGE_API_BASE}/b/{bucket}/o/{encoded}/copyTo/b/{bucket}/o/{encoded}?sourceGeneration={generation}",
            bucket = self.bucket_name,
        );
        match precondition {
            Precondition::None => {}
            Precondition::GenerationMatch(current) => {
                copy_uri.push_str(&format!("&ifGenerationMatch={current}"));
            }
            Precondition::UnmodifiedSince(_) => {
                return Err(ApplyError::Other(anyhow!(
                    "the GCS-style backend takes generation-match preconditions, not timestamps"
                )))
            }
        }

        let token = self.bearer_token().await.map_err(ApplyError::Other)?;
        let request = self.client.post(&copy_uri).bearer_auth(token.as_str()).send();
        let response = tokio::select! {
            response = request => response
                .map_err(|e| ApplyError::Other(anyhow::Error::new(e).context(format!("copy '{key}'"))))?,
            _ = tokio::time::sleep(self.timeout) => return Err(ApplyError::Timeout),
            _ = cancel.cancelled() => return Err(ApplyError::Cancelled),
        };

        let status = response.status();
        match status {
            StatusCode::PRECONDITION_FAILED => return Err(ApplyError::PreconditionFailed),
            StatusCode::NOT_FOUND => return Err(ApplyError::NotFound),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(ApplyError::Other(anyhow!(
                    "GCS copy of '{key}' returned {status}: {body}"
                )));
            }
            _ => {}
        }

        let body = response
            .text()
            .await
            .map_err(|e| ApplyError::Other(e.into()))?;
        let object: GcsObject = serde_json::from_str(&body)
            .map_err(|e| ApplyError::Other(anyhow::Error::new(e).context("decode GCS copy response")))?;
        Ok(CopyResult {
            key: key.to_owned(),
            version_id: object.generation.map(VersionId::Generation),
            digest: object.md5_hash.as_deref().map(ContentDigest::new),
        })
    }

    async fn delete_current(
        &self,
        key: &str,
        precondition: &Precondition,
        cancel: &CancellationToken,
    ) -> Result<(), ApplyError> {
        let mut delete_uri = self.object_uri(key);
        match precondition {
            Precondition::None => {}
            Precondition::GenerationMatch(current) => {
                delete_uri.push_str(&format!("?ifGenerationMatch={current}"));
            }
            Precondition::UnmodifiedSince(_) => {
                return Err(ApplyError::Other(anyhow!(
                    "the GCS-style backend takes generation-match preconditions, not timestamps"
                )))
            }
        }

        let token = self.bearer_token().await.map_err(ApplyError::Other)?;
        let request = self.client.delete(&delete_uri).bearer_auth(token.as_str()).send();
        let response = tokio::select! {
            response = request => response
                .map_err(|e| ApplyError::Other(anyhow::Error::new(e).context(format!("delete '{key}'"))))?,
            _ = tokio::time::sleep(self.timeout) => return Err(ApplyError::Timeout),
            _ = cancel.cancelled() => return Err(ApplyError::Cancelled),
        };

        match response.status() {
            StatusCode::PRECONDITION_FAILED => Err(ApplyError::PreconditionFailed),
            StatusCode::NOT_FOUND => Err(ApplyError::NotFound),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                Err(ApplyError::Other(anyhow!(
                    "GCS delete of '{key}' returned {status}: {body}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Flattens one listed generation into version records: always a live
/// record at `timeCreated`, plus a tombstone at `timeDeleted` when the
/// generation has been deleted or superseded.
fn object_versions(object: &GcsObject) -> anyhow::Result<Vec<Version>> {
    let generation = object
        .generation
        .with_context(|| format!("object '{}' has no generation", object.name))?;
    let created_at = parse_rfc3339(&object.time_created)
        .with_context(|| format!("timeCreated of '{}'", object.name))?;
    let mut versions = vec![Version {
        key: object.name.clone(),
        id: VersionId::Generation(generation),
        created_at,
        is_tombstone: false,
        is_latest: object.time_deleted.is_none(),
        digest: object.md5_hash.as_deref().map(ContentDigest::new),
        size: object.size.unwrap_or(0).max(0) as u64,
    }];
    if let Some(deleted) = &object.time_deleted {
        versions.push(Version {
            key: object.name.clone(),
            id: VersionId::Generation(generation),
            created_at: parse_rfc3339(deleted)
                .with_context(|| format!("timeDeleted of '{}'", object.name))?,
            is_tombstone: true,
            is_latest: false,
            digest: None,
            size: 0,
        });
    }
    Ok(versions)
}

fn parse_rfc3339(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("parse timestamp '{value}'"))?
        .with_timezone(&Utc))
}

fn de_i64_from_str<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    match value {
        Some(value) => value.parse().map(Some).map_err(de::Error::custom),
        None => Ok(None),
    }
}

#[derive(Deserialize, Debug)]
struct GcsListResponse {
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    items: Option<Vec<GcsObject>>,
}

impl GcsListResponse {
    fn contents(&self) -> &[GcsObject] {
        self.items.as_deref().unwrap_or_default()
    }
}

/// The subset of an object resource the rollback needs. Integral fields
/// arrive as decimal strings on the wire.
#[derive(Deserialize, Debug)]
struct GcsObject {
    name: String,
    #[serde(default, deserialize_with = "de_i64_from_str")]
    generation: Option<i64>,
    #[serde(default, deserialize_with = "de_i64_from_str")]
    size: Option<i64>,
    #[serde(rename = "md5Hash")]
    md5_hash: Option<String>,
    #[serde(rename = "timeCreated")]
    time_created: String,
    #[serde(rename = "timeDeleted")]
    time_deleted: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"{
        "kind": "storage#objects",
        "nextPageToken": "CgVhLnR4dA==",
        "items": [
            {
                "kind": "storage#object",
                "name": "a.txt",
                "bucket": "mybucket",
                "generation": "1614203964124856",
                "metageneration": "1",
                "storageClass": "STANDARD",
                "size": "11",
                "md5Hash": "XrY7u+Ae7tCTyyK7j1rNww==",
                "crc32c": "yZRlqg==",
                "timeCreated": "2021-02-24T22:39:24.125Z",
                "timeDeleted": "2021-02-25T10:00:00.000Z",
                "updated": "2021-02-24T22:39:24.125Z"
            },
            {
                "kind": "storage#object",
                "name": "a.txt",
                "bucket": "mybucket",
                "generation": "1614247200000000",
                "metageneration": "1",
                "storageClass": "STANDARD",
                "size": "14",
                "md5Hash": "dGVzdGRpZ2VzdA==",
                "crc32c": "yZRlqg==",
                "timeCreated": "2021-02-25T10:00:00.000Z",
                "updated": "2021-02-25T10:00:00.000Z"
            }
        ]
    }"#;

    #[test]
    fn listing_deserializes_with_page_token() {
        let listing: GcsListResponse = serde_json::from_str(LISTING).unwrap();
        assert_eq!(listing.next_page_token.as_deref(), Some("CgVhLnR4dA=="));
        assert_eq!(listing.contents().len(), 2);
        assert_eq!(listing.contents()[0].generation, Some(1614203964124856));
        assert_eq!(listing.contents()[0].size, Some(11));
    }

    #[test]
    fn deleted_generations_emit_a_tombstone() {
        let listing: GcsListResponse = serde_json::from_str(LISTING).unwrap();
        let versions = object_versions(&listing.contents()[0]).unwrap();
        assert_eq!(versions.len(), 2);

        let live = &versions[0];
        assert!(!live.is_tombstone);
        assert!(!live.is_latest);
        assert_eq!(live.id, VersionId::Generation(1614203964124856));
        assert_eq!(live.size, 11);
        assert_eq!(live.digest, Some(ContentDigest::new("XrY7u+Ae7tCTyyK7j1rNww==")));

        let tombstone = &versions[1];
        assert!(tombstone.is_tombstone);
        assert_eq!(tombstone.id, VersionId::Generation(1614203964124856));
        assert_eq!(tombstone.size, 0);
        assert_eq!(tombstone.digest, None);
        assert_eq!(
            tombstone.created_at,
            parse_rfc3339("2021-02-25T10:00:00.000Z").unwrap()
        );
    }

    #[test]
    fn current_generations_stay_single() {
        let listing: GcsListResponse = serde_json::from_str(LISTING).unwrap();
        let versions = object_versions(&listing.contents()[1]).unwrap();
        assert_eq!(versions.len(), 1);
        assert!(versions[0].is_latest);
        assert_eq!(versions[0].size, 14);
    }
}
