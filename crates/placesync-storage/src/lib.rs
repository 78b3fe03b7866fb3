//! Local state files, raw payload archive and the content store client for placesync.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use placesync_core::{parse_timestamp, Cutoff, EntityKind, StoreRecord};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "placesync-storage";

/// Fixed timeout for every content store call.
pub const STORE_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_REASON_CHARS: usize = 500;

/// Write `bytes` to `path` through a sibling temp file and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw upstream payloads, kept for auditing.
#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        entity: EntityKind,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(entity.as_str())
            .join(format!("{content_hash}.json"))
    }

    pub async fn store_payload(
        &self,
        fetched_at: DateTime<Utc>,
        entity: EntityKind,
        payload: &JsonValue,
    ) -> anyhow::Result<ArchivedPayload> {
        let bytes = serde_json::to_vec_pretty(payload).context("serializing raw payload")?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = self.payload_relative_path(fetched_at, entity, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, &bytes).await?;
        }

        Ok(ArchivedPayload {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// JSON file mapping place id to the ISO timestamp of its last synced record.
///
/// A missing, unreadable or corrupt file reads as "no cutoff" for every place.
#[derive(Debug, Clone)]
pub struct CutoffFile {
    path: PathBuf,
}

impl CutoffFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> BTreeMap<String, String> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cutoff file unreadable; ignoring");
                return BTreeMap::new();
            }
        };
        match serde_json::from_str::<BTreeMap<String, JsonValue>>(&text) {
            Ok(map) => map
                .into_iter()
                .filter_map(|(place, value)| value.as_str().map(|s| (place, s.to_string())))
                .collect(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cutoff file corrupt; ignoring");
                BTreeMap::new()
            }
        }
    }

    pub async fn get(&self, place_id: &str) -> Option<Cutoff> {
        let entries = self.load().await;
        let raw = entries.get(place_id)?;
        let parsed = parse_timestamp(&JsonValue::String(raw.clone())).map(Cutoff::new);
        if parsed.is_none() {
            warn!(place_id, value = %raw, "unparseable cutoff entry; ignoring");
        }
        parsed
    }

    /// Records `cutoff` for `place_id`, keeping every other place's entry.
    pub async fn set(&self, place_id: &str, cutoff: Cutoff) -> anyhow::Result<()> {
        let mut entries = self.load().await;
        entries.insert(place_id.to_string(), cutoff.at.to_rfc3339());
        let bytes = serde_json::to_vec_pretty(&entries).context("serializing cutoff file")?;
        write_atomic(&self.path, &bytes).await
    }

    /// Drops the entry for `place_id`; a no-op when there is none.
    pub async fn remove(&self, place_id: &str) -> anyhow::Result<()> {
        let mut entries = self.load().await;
        if entries.remove(place_id).is_none() {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&entries).context("serializing cutoff file")?;
        write_atomic(&self.path, &bytes).await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("content store collection `{collection}` not found at {url}; check the configured collection name (the REST API expects the plural id, e.g. `reviews`)")]
    CollectionNotFound { collection: String, url: String },
    #[error("content store refused credentials ({status}) at {url}; check the API token and its permissions")]
    Unauthorized { status: u16, url: String },
    #[error("entry `{id}` of `{collection}` no longer exists at {url}")]
    EntryNotFound {
        collection: String,
        id: String,
        url: String,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("unexpected content store response from {url}: {detail}")]
    MalformedResponse { url: String, detail: String },
    #[error("content store request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl StoreError {
    /// Configuration problems abort the whole run rather than one record.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StoreError::CollectionNotFound { .. } | StoreError::Unauthorized { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    Accepted,
    Rejected,
    NotFound,
    Unauthorized,
    Failed,
}

pub fn classify_write_status(status: StatusCode) -> WriteDisposition {
    if status.is_success() {
        WriteDisposition::Accepted
    } else if status == StatusCode::BAD_REQUEST {
        WriteDisposition::Rejected
    } else if status == StatusCode::NOT_FOUND {
        WriteDisposition::NotFound
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        WriteDisposition::Unauthorized
    } else {
        WriteDisposition::Failed
    }
}

/// Result of a single create or update call that reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Rejected { reason: String },
}

impl UpsertOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, UpsertOutcome::Rejected { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry {
    pub id: String,
    pub body: JsonValue,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn find_one(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<StoreEntry>, StoreError>;

    async fn create(
        &self,
        collection: &str,
        attributes: &JsonValue,
    ) -> Result<WriteOutcome, StoreError>;

    async fn update(
        &self,
        collection: &str,
        id: &str,
        attributes: &JsonValue,
    ) -> Result<WriteOutcome, StoreError>;

    /// `updatedAt` of the most recently updated entry whose `field` equals `value`.
    async fn latest_updated_at(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Find-then-write upsert keyed by `identity_field == identity_value`.
///
/// Not transactional: two concurrent writers can both miss and both create.
/// Callers must run one writer per place.
pub async fn upsert<S: ContentStore + ?Sized>(
    store: &S,
    collection: &str,
    identity_field: &str,
    identity_value: &str,
    attributes: &JsonValue,
) -> Result<UpsertOutcome, StoreError> {
    let existing = store
        .find_one(collection, identity_field, identity_value)
        .await?;
    let (outcome, on_accept) = match existing {
        Some(entry) => match store.update(collection, &entry.id, attributes).await {
            Ok(outcome) => (outcome, UpsertOutcome::Updated),
            Err(StoreError::EntryNotFound { id, .. }) => {
                warn!(collection, %id, "entry vanished before update; creating it again");
                (
                    store.create(collection, attributes).await?,
                    UpsertOutcome::Created,
                )
            }
            Err(err) => return Err(err),
        },
        None => (
            store.create(collection, attributes).await?,
            UpsertOutcome::Created,
        ),
    };
    Ok(match outcome {
        WriteOutcome::Accepted => on_accept,
        WriteOutcome::Rejected { reason } => UpsertOutcome::Rejected { reason },
    })
}

pub async fn upsert_record<S: ContentStore + ?Sized, R: StoreRecord + Sync>(
    store: &S,
    collection: &str,
    record: &R,
) -> Result<UpsertOutcome, StoreError> {
    upsert(
        store,
        collection,
        record.identity_field(),
        record.identity_value(),
        &record.attributes(),
    )
    .await
}

#[derive(Debug, Clone)]
pub struct StrapiConfig {
    pub base_url: String,
    pub token: String,
}

/// Strapi REST client (`/api/{collection}` endpoints, bearer auth).
#[derive(Debug, Clone)]
pub struct StrapiClient {
    client: reqwest::Client,
    base_url: String,
}

impl StrapiClient {
    pub fn new(config: StrapiConfig) -> anyhow::Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .context("content store token is not a valid header value")?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(STORE_TIMEOUT)
            .default_headers(headers)
            .build()
            .context("building content store client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn collection_url(&self, collection: &str) -> String {
        format!("{}/api/{}", self.base_url, collection)
    }

    async fn write(
        &self,
        request: reqwest::RequestBuilder,
        collection: &str,
        entry_id: Option<&str>,
        url: String,
        attributes: &JsonValue,
    ) -> Result<WriteOutcome, StoreError> {
        let resp = request
            .json(&serde_json::json!({ "data": attributes }))
            .send()
            .await?;
        let status = resp.status();
        match classify_write_status(status) {
            WriteDisposition::Accepted => {
                debug!(status = status.as_u16(), %url, "content store accepted write");
                Ok(WriteOutcome::Accepted)
            }
            WriteDisposition::Rejected => Ok(WriteOutcome::Rejected {
                reason: truncated_body(resp).await,
            }),
            WriteDisposition::NotFound => Err(match entry_id {
                Some(id) => StoreError::EntryNotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    url,
                },
                None => StoreError::CollectionNotFound {
                    collection: collection.to_string(),
                    url,
                },
            }),
            WriteDisposition::Unauthorized => Err(StoreError::Unauthorized {
                status: status.as_u16(),
                url,
            }),
            WriteDisposition::Failed => Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url,
                body: truncated_body(resp).await,
            }),
        }
    }

    async fn query(
        &self,
        collection: &str,
        params: &[(String, String)],
    ) -> Result<Option<Vec<JsonValue>>, StoreError> {
        let url = self.collection_url(collection);
        let resp = self.client.get(&url).query(params).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::CollectionNotFound {
                collection: collection.to_string(),
                url,
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StoreError::Unauthorized {
                status: status.as_u16(),
                url,
            });
        }
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url,
                body: truncated_body(resp).await,
            });
        }
        let body: JsonValue = resp.json().await?;
        match body.get("data") {
            Some(JsonValue::Array(items)) => Ok(Some(items.clone())),
            Some(JsonValue::Null) | None => Ok(None),
            Some(other) => Err(StoreError::MalformedResponse {
                url,
                detail: format!("`data` is not a list: {other}"),
            }),
        }
    }
}

impl StrapiClient {
    async fn find_first(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<StoreEntry>, StoreError> {
        let items = self
            .query(collection, &[filter_param(field, value)])
            .await?
            .unwrap_or_default();
        let Some(first) = items.into_iter().next() else {
            return Ok(None);
        };
        let id = entry_id(&first).ok_or_else(|| StoreError::MalformedResponse {
            url: self.collection_url(collection),
            detail: "matching entry has neither `id` nor `documentId`".to_string(),
        })?;
        Ok(Some(StoreEntry { id, body: first }))
    }
}

fn filter_param(field: &str, value: &str) -> (String, String) {
    (format!("filters[{field}][$eq]"), value.to_string())
}

/// Entry id used in update URLs; `id` first, then Strapi v5's `documentId`.
pub fn entry_id(entry: &JsonValue) -> Option<String> {
    ["id", "documentId"]
        .iter()
        .filter_map(|key| entry.get(*key))
        .find_map(|value| match value {
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
}

/// `updatedAt` of an entry in either the flat (v5) or `attributes` (v4) shape.
fn entry_updated_at(entry: &JsonValue) -> Option<DateTime<Utc>> {
    entry
        .get("updatedAt")
        .or_else(|| entry.get("attributes").and_then(|a| a.get("updatedAt")))
        .and_then(parse_timestamp)
}

async fn truncated_body(resp: reqwest::Response) -> String {
    match resp.text().await {
        Ok(text) => text.chars().take(MAX_REASON_CHARS).collect(),
        Err(err) => format!("<unreadable body: {err}>"),
    }
}

#[async_trait]
impl ContentStore for StrapiClient {
    async fn find_one(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<StoreEntry>, StoreError> {
        self.find_first(collection, field, value)
            .instrument(info_span!("store_find", collection, field, value))
            .await
    }

    async fn create(
        &self,
        collection: &str,
        attributes: &JsonValue,
    ) -> Result<WriteOutcome, StoreError> {
        let url = self.collection_url(collection);
        let request = self.client.post(&url);
        self.write(request, collection, None, url, attributes)
            .instrument(info_span!("store_create", collection))
            .await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        attributes: &JsonValue,
    ) -> Result<WriteOutcome, StoreError> {
        let url = format!("{}/{}", self.collection_url(collection), id);
        let request = self.client.put(&url);
        self.write(request, collection, Some(id), url, attributes)
            .instrument(info_span!("store_update", collection, id))
            .await
    }

    async fn latest_updated_at(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let params = [
            filter_param(field, value),
            ("sort".to_string(), "updatedAt:desc".to_string()),
            ("pagination[pageSize]".to_string(), "1".to_string()),
        ];
        let items = match self.query(collection, &params).await {
            Ok(items) => items.unwrap_or_default(),
            Err(StoreError::HttpStatus { status, url, .. }) => {
                warn!(status, %url, "latest-entry query failed; treating as no cutoff");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        Ok(items.first().and_then(entry_updated_at))
    }
}
