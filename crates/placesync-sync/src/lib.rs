//! Sync pipeline orchestration: cutoff → fetch → normalize → upsert → advance cutoff.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use placesync_adapters::{
    EntityAdapter, OpeningHoursAdapter, OutscraperClient, OutscraperConfig, PlaceDataApi,
    ReviewsAdapter, DEFAULT_BASE_URL,
};
use placesync_core::{Cutoff, EntityKind, StoreRecord};
use placesync_storage::{
    upsert_record, ContentStore, CutoffFile, RawArchive, StoreError, StrapiClient, StrapiConfig,
    UpsertOutcome,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "placesync-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoffStrategy {
    /// Derive the cutoff from the store's most recently updated review.
    ///
    /// Every accepted write moves that value, so a cycle with rejected or
    /// failed writes records a hold in the state file until a clean cycle.
    Store,
    /// Keep cutoffs in a local JSON file.
    File,
}

impl FromStr for CutoffStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "store" => Ok(CutoffStrategy::Store),
            "file" => Ok(CutoffStrategy::File),
            other => bail!("unknown cutoff strategy `{other}` (expected `store` or `file`)"),
        }
    }
}

#[derive(Clone)]
pub struct SyncConfig {
    pub api_key: String,
    pub place_id: String,
    pub upstream_base_url: String,
    pub store_url: String,
    pub store_token: String,
    pub reviews_collection: String,
    pub opening_hours_collection: String,
    pub reviews_limit: i64,
    pub reviews_language: String,
    /// Used only when the tracker has no cutoff for the place.
    pub manual_cutoff: Option<Cutoff>,
    pub cutoff_strategy: CutoffStrategy,
    pub cutoff_state_path: PathBuf,
    pub archive_dir: Option<PathBuf>,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("api_key", &"<redacted>")
            .field("place_id", &self.place_id)
            .field("upstream_base_url", &self.upstream_base_url)
            .field("store_url", &self.store_url)
            .field("store_token", &"<redacted>")
            .field("reviews_collection", &self.reviews_collection)
            .field("opening_hours_collection", &self.opening_hours_collection)
            .field("reviews_limit", &self.reviews_limit)
            .field("reviews_language", &self.reviews_language)
            .field("manual_cutoff", &self.manual_cutoff)
            .field("cutoff_strategy", &self.cutoff_strategy)
            .field("cutoff_state_path", &self.cutoff_state_path)
            .field("archive_dir", &self.archive_dir)
            .finish()
    }
}

impl SyncConfig {
    /// Loads `.env` (if present) and reads the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let optional = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &str| {
            optional(name).ok_or_else(|| anyhow!("missing required env var: {name}"))
        };

        let reviews_limit = match optional("REVIEWS_LIMIT") {
            Some(v) => v
                .parse::<i64>()
                .with_context(|| format!("REVIEWS_LIMIT must be an integer, got `{v}`"))?,
            None => 20,
        };
        let manual_cutoff = match optional("REVIEWS_CUTOFF_UNIX") {
            Some(v) => Cutoff::from_unix_seconds(
                v.parse::<i64>()
                    .with_context(|| format!("REVIEWS_CUTOFF_UNIX must be unix seconds, got `{v}`"))?,
            ),
            None => None,
        };
        let cutoff_strategy = match optional("CUTOFF_STRATEGY") {
            Some(v) => v.parse().context("parsing CUTOFF_STRATEGY")?,
            None => CutoffStrategy::File,
        };

        Ok(Self {
            api_key: required("OUTSCRAPER_API_KEY")?,
            place_id: required("GOOGLE_PLACE_ID")?,
            upstream_base_url: optional("OUTSCRAPER_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            store_url: required("STRAPI_URL")?.trim_end_matches('/').to_string(),
            store_token: required("STRAPI_TOKEN")?,
            reviews_collection: optional("STRAPI_REVIEWS_COLLECTION")
                .unwrap_or_else(|| "reviews".to_string()),
            opening_hours_collection: optional("STRAPI_OPENINGHOURS_COLLECTION")
                .unwrap_or_else(|| "openinghours".to_string()),
            reviews_limit,
            reviews_language: optional("REVIEWS_LANGUAGE").unwrap_or_else(|| "de".to_string()),
            manual_cutoff,
            cutoff_strategy,
            cutoff_state_path: optional("CUTOFF_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("last_fetch_timestamp.json")),
            archive_dir: optional("PLACESYNC_ARCHIVE_DIR").map(PathBuf::from),
        })
    }

    pub fn collection_for(&self, entity: EntityKind) -> &str {
        match entity {
            EntityKind::Reviews => &self.reviews_collection,
            EntityKind::OpeningHours => &self.opening_hours_collection,
        }
    }
}

/// Reads and advances the per-place sync watermark.
#[async_trait]
pub trait CutoffTracker: Send + Sync {
    fn strategy(&self) -> CutoffStrategy;

    async fn get_cutoff(&self, place_id: &str) -> Result<Option<Cutoff>>;

    async fn advance_cutoff(&self, place_id: &str, cutoff: Cutoff) -> Result<()>;

    /// Pins the cutoff at `held` after a cycle that left records behind.
    async fn hold_cutoff(&self, _place_id: &str, _held: Option<Cutoff>) -> Result<()> {
        Ok(())
    }
}

pub struct FileCutoffTracker {
    file: CutoffFile,
}

impl FileCutoffTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: CutoffFile::new(path),
        }
    }
}

#[async_trait]
impl CutoffTracker for FileCutoffTracker {
    fn strategy(&self) -> CutoffStrategy {
        CutoffStrategy::File
    }

    async fn get_cutoff(&self, place_id: &str) -> Result<Option<Cutoff>> {
        Ok(self.file.get(place_id).await)
    }

    async fn advance_cutoff(&self, place_id: &str, cutoff: Cutoff) -> Result<()> {
        self.file
            .set(place_id, cutoff)
            .await
            .with_context(|| format!("writing cutoff file {}", self.file.path().display()))
    }
}

/// Cutoff derived from the store's own latest `updatedAt`; advancing is implicit.
///
/// A hold written to `holds` overrides the store value until the next
/// clean cycle. A hold at the unix epoch means "no cutoff".
pub struct StoreCutoffTracker {
    store: Arc<dyn ContentStore>,
    collection: String,
    holds: CutoffFile,
}

impl StoreCutoffTracker {
    pub fn new(
        store: Arc<dyn ContentStore>,
        collection: impl Into<String>,
        holds_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            holds: CutoffFile::new(holds_path),
        }
    }
}

#[async_trait]
impl CutoffTracker for StoreCutoffTracker {
    fn strategy(&self) -> CutoffStrategy {
        CutoffStrategy::Store
    }

    async fn get_cutoff(&self, place_id: &str) -> Result<Option<Cutoff>> {
        if let Some(held) = self.holds.get(place_id).await {
            info!(cutoff = held.unix_seconds(), "using held cutoff");
            return Ok(Some(held).filter(|c| c.unix_seconds() > 0));
        }
        let latest = self
            .store
            .latest_updated_at(&self.collection, "place_id", place_id)
            .await
            .with_context(|| format!("reading latest entry of `{}`", self.collection))?;
        // Whole seconds, matching the upstream cutoff convention.
        Ok(latest.and_then(|at| Cutoff::from_unix_seconds(at.timestamp())))
    }

    async fn advance_cutoff(&self, place_id: &str, _cutoff: Cutoff) -> Result<()> {
        self.holds
            .remove(place_id)
            .await
            .with_context(|| format!("clearing cutoff hold in {}", self.holds.path().display()))
    }

    async fn hold_cutoff(&self, place_id: &str, held: Option<Cutoff>) -> Result<()> {
        // An existing hold is older than anything this cycle could have read.
        if self.holds.get(place_id).await.is_some() {
            return Ok(());
        }
        let held = held.unwrap_or(Cutoff::new(DateTime::<Utc>::UNIX_EPOCH));
        warn!(cutoff = held.unix_seconds(), "holding cutoff until a clean cycle");
        self.holds
            .set(place_id, held)
            .await
            .with_context(|| format!("writing cutoff hold to {}", self.holds.path().display()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    /// Nothing to fetch (for example a zero review limit).
    Skipped,
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub entity: EntityKind,
    pub status: CycleStatus,
    pub cutoff_before: Option<DateTime<Utc>>,
    pub cutoff_after: Option<DateTime<Utc>>,
    pub cutoff_advanced: bool,
    pub fetched: usize,
    pub normalized: usize,
    pub dropped: usize,
    pub created: usize,
    pub updated: usize,
    pub rejected: usize,
    pub archived_payload: Option<String>,
}

impl CycleReport {
    fn new(entity: EntityKind, cutoff_before: Option<Cutoff>) -> Self {
        let before = cutoff_before.map(|c| c.at);
        Self {
            entity,
            status: CycleStatus::Completed,
            cutoff_before: before,
            cutoff_after: before,
            cutoff_advanced: false,
            fetched: 0,
            normalized: 0,
            dropped: 0,
            created: 0,
            updated: 0,
            rejected: 0,
            archived_payload: None,
        }
    }

    fn aborted(entity: EntityKind, err: &anyhow::Error) -> Self {
        let mut report = Self::new(entity, None);
        report.status = CycleStatus::Aborted {
            reason: format!("{err:#}"),
        };
        report
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.status, CycleStatus::Aborted { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub place_id: String,
    pub cutoff_strategy: CutoffStrategy,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cycles: Vec<CycleReport>,
}

impl SyncRunSummary {
    pub fn is_success(&self) -> bool {
        !self.cycles.iter().any(CycleReport::is_aborted)
    }
}

/// Which entity cycles a run performs, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSelection {
    All,
    Reviews,
    OpeningHours,
}

impl SyncSelection {
    pub fn entities(&self) -> &'static [EntityKind] {
        match self {
            SyncSelection::All => &[EntityKind::Reviews, EntityKind::OpeningHours],
            SyncSelection::Reviews => &[EntityKind::Reviews],
            SyncSelection::OpeningHours => &[EntityKind::OpeningHours],
        }
    }
}

/// A missing collection or similar misconfiguration ends the whole run.
pub fn is_configuration_error(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<StoreError>())
        .any(StoreError::is_configuration)
}

pub struct SyncPipeline {
    config: SyncConfig,
    api: Arc<dyn PlaceDataApi>,
    store: Arc<dyn ContentStore>,
    tracker: Box<dyn CutoffTracker>,
    archive: Option<RawArchive>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let api = OutscraperClient::new(OutscraperConfig {
            api_key: config.api_key.clone(),
            base_url: config.upstream_base_url.clone(),
        })?;
        let store: Arc<dyn ContentStore> = Arc::new(StrapiClient::new(StrapiConfig {
            base_url: config.store_url.clone(),
            token: config.store_token.clone(),
        })?);
        let tracker: Box<dyn CutoffTracker> = match config.cutoff_strategy {
            CutoffStrategy::Store => Box::new(StoreCutoffTracker::new(
                store.clone(),
                config.reviews_collection.clone(),
                config.cutoff_state_path.clone(),
            )),
            CutoffStrategy::File => Box::new(FileCutoffTracker::new(config.cutoff_state_path.clone())),
        };
        let archive = config.archive_dir.clone().map(RawArchive::new);
        Ok(Self {
            config,
            api: Arc::new(api),
            store,
            tracker,
            archive,
        })
    }

    pub fn from_parts(
        config: SyncConfig,
        api: Arc<dyn PlaceDataApi>,
        store: Arc<dyn ContentStore>,
        tracker: Box<dyn CutoffTracker>,
    ) -> Self {
        Self {
            config,
            api,
            store,
            tracker,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: RawArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self, selection: SyncSelection) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            %run_id,
            place_id = %self.config.place_id,
            strategy = ?self.tracker.strategy(),
            "sync run started"
        );

        let mut cycles = Vec::new();
        for entity in selection.entities() {
            let outcome = match entity {
                EntityKind::Reviews => self.sync_reviews().await,
                EntityKind::OpeningHours => self.sync_opening_hours().await,
            };
            match outcome {
                Ok(report) => cycles.push(report),
                Err(err) if is_configuration_error(&err) => {
                    error!(%run_id, entity = %entity, error = %format!("{err:#}"), "configuration error; aborting run");
                    return Err(err);
                }
                Err(err) => {
                    error!(%run_id, entity = %entity, error = %format!("{err:#}"), "cycle aborted; cutoff untouched");
                    cycles.push(CycleReport::aborted(*entity, &err));
                }
            }
        }

        let finished_at = Utc::now();
        info!(%run_id, took_ms = (finished_at - started_at).num_milliseconds(), "sync run finished");
        Ok(SyncRunSummary {
            run_id,
            place_id: self.config.place_id.clone(),
            cutoff_strategy: self.tracker.strategy(),
            started_at,
            finished_at,
            cycles,
        })
    }

    pub async fn sync_reviews(&self) -> Result<CycleReport> {
        let adapter = ReviewsAdapter::new(
            self.config.reviews_limit,
            self.config.reviews_language.clone(),
        );
        self.run_cycle(&adapter).await
    }

    pub async fn sync_opening_hours(&self) -> Result<CycleReport> {
        self.run_cycle(&OpeningHoursAdapter).await
    }

    pub async fn run_cycle<A: EntityAdapter>(&self, adapter: &A) -> Result<CycleReport> {
        let span = info_span!(
            "sync_cycle",
            entity = %adapter.entity(),
            place_id = %self.config.place_id
        );
        self.run_cycle_inner(adapter).instrument(span).await
    }

    async fn resolve_cutoff(&self) -> Result<Option<Cutoff>> {
        let place_id = &self.config.place_id;
        if let Some(cutoff) = self.tracker.get_cutoff(place_id).await? {
            return Ok(Some(cutoff));
        }
        if let Some(manual) = self.config.manual_cutoff {
            info!(cutoff = manual.unix_seconds(), "no tracked cutoff; using manual override");
            return Ok(Some(manual));
        }
        Ok(None)
    }

    async fn run_cycle_inner<A: EntityAdapter>(&self, adapter: &A) -> Result<CycleReport> {
        let entity = adapter.entity();
        let place_id = self.config.place_id.as_str();
        let collection = self.config.collection_for(entity);
        let started_at = Utc::now();

        let cutoff_before = if adapter.tracks_cutoff() {
            self.resolve_cutoff().await?
        } else {
            None
        };
        let mut report = CycleReport::new(entity, cutoff_before);

        let Some(query) = adapter.query(place_id, cutoff_before) else {
            info!("nothing to fetch");
            report.status = CycleStatus::Skipped;
            return Ok(report);
        };

        info!(cutoff = ?cutoff_before.map(|c| c.unix_seconds()), "fetching");
        let payload = self
            .api
            .fetch(&query)
            .await
            .with_context(|| format!("fetching {entity} for {place_id}"))?;
        report.fetched = payload.len();

        if let Some(archive) = &self.archive {
            let archived = archive
                .store_payload(started_at, entity, &JsonValue::Array(payload.clone()))
                .await
                .context("archiving raw payload")?;
            report.archived_payload = Some(archived.relative_path.display().to_string());
        }

        let normalized = adapter.normalize(&payload, place_id);
        report.normalized = normalized.records.len();
        report.dropped = normalized.dropped;
        if normalized.records.is_empty() {
            info!(dropped = normalized.dropped, "no records to store");
        }

        let mut watermark: Option<DateTime<Utc>> = None;
        for record in &normalized.records {
            let identity = record.identity_value();
            let outcome = match upsert_record(self.store.as_ref(), collection, record).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let held = if adapter.tracks_cutoff() {
                        self.tracker.hold_cutoff(place_id, cutoff_before).await
                    } else {
                        Ok(())
                    };
                    if let Err(hold_err) = held {
                        error!(error = %format!("{hold_err:#}"), "could not hold cutoff");
                    }
                    return Err(err)
                        .with_context(|| format!("upserting `{identity}` into `{collection}`"));
                }
            };
            match outcome {
                UpsertOutcome::Created => {
                    report.created += 1;
                    info!(id = %identity, "created");
                }
                UpsertOutcome::Updated => {
                    report.updated += 1;
                    info!(id = %identity, "updated");
                }
                UpsertOutcome::Rejected { reason } => {
                    report.rejected += 1;
                    warn!(id = %identity, %reason, "rejected by store; skipping");
                    continue;
                }
            }
            if let Some(at) = adapter.watermark(record) {
                watermark = Some(watermark.map_or(at, |w| w.max(at)));
            }
        }

        if adapter.tracks_cutoff() {
            if report.rejected > 0 {
                warn!(rejected = report.rejected, "cutoff not advanced; rejected records will be re-offered");
                self.tracker.hold_cutoff(place_id, cutoff_before).await?;
            } else if !normalized.records.is_empty() {
                let candidate = Cutoff::new(watermark.unwrap_or(started_at));
                let next = cutoff_before.map_or(candidate, |before| before.max(candidate));
                self.tracker.advance_cutoff(place_id, next).await?;
                report.cutoff_after = Some(next.at);
                report.cutoff_advanced = true;
                info!(cutoff = %next.at.to_rfc3339(), "cutoff advanced");
            }
        }

        info!(
            created = report.created,
            updated = report.updated,
            rejected = report.rejected,
            dropped = report.dropped,
            "cycle complete"
        );
        Ok(report)
    }
}

pub async fn run_sync_once_from_env(selection: SyncSelection) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once(selection).await
}
