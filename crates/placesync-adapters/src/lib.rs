//! Upstream data API client and field normalization for placesync entities.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use placesync_core::{parse_timestamp, Cutoff, EntityKind, OpeningHours, Review, StoreRecord};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "placesync-adapters";

pub const DEFAULT_BASE_URL: &str = "https://api.app.outscraper.com";
pub const INITIAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_POLL_ATTEMPTS: u32 = 30;

const MAX_BODY_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request {request_id} did not complete after {attempts} status polls")]
    Timeout { request_id: String, attempts: u32 },
    #[error("unexpected response from {url}: {body}")]
    MalformedResponse { url: String, body: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("polling request {request_id} was cancelled")]
    Cancelled { request_id: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Query string sent with the initial data request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchQuery {
    params: Vec<(String, String)>,
}

impl FetchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Source of raw place records.
#[async_trait]
pub trait PlaceDataApi: Send + Sync {
    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<JsonValue>, FetchError>;
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Cooperative cancellation, checked between poll attempts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: POLL_INTERVAL,
            max_attempts: MAX_POLL_ATTEMPTS,
        }
    }
}

/// Status body of `GET /requests/{id}`.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResponse {
    pub status: Option<String>,
    pub data: Vec<JsonValue>,
}

impl PollResponse {
    pub fn from_body(body: &JsonValue) -> Self {
        Self {
            status: body
                .get("status")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string),
            data: non_empty_list(body.get("data")).unwrap_or_default(),
        }
    }

    fn is_complete(&self) -> bool {
        self.status.as_deref() == Some("Success") && !self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    Pending { attempt: u32 },
    Ready(Vec<JsonValue>),
    Exhausted { attempts: u32 },
}

impl PollState {
    pub fn start() -> Self {
        PollState::Pending { attempt: 0 }
    }

    /// Folds one status response into the state. Terminal states are sticky.
    pub fn advance(self, policy: &PollPolicy, response: PollResponse) -> Self {
        let PollState::Pending { attempt } = self else {
            return self;
        };
        let attempt = attempt + 1;
        if response.is_complete() {
            PollState::Ready(response.data)
        } else if attempt >= policy.max_attempts {
            PollState::Exhausted { attempts: attempt }
        } else {
            PollState::Pending { attempt }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutscraperConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Outscraper client: one data request, then status polling until the job completes.
#[derive(Clone)]
pub struct OutscraperClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    sleeper: Arc<dyn Sleeper>,
    policy: PollPolicy,
    cancel: CancelFlag,
}

impl std::fmt::Debug for OutscraperClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutscraperClient")
            .field("base_url", &self.base_url)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl OutscraperClient {
    pub fn new(config: OutscraperConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .build()
            .context("building upstream API client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            sleeper: Arc::new(TokioSleeper),
            policy: PollPolicy::default(),
            cancel: CancelFlag::new(),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<JsonValue, FetchError> {
        let resp = self
            .client
            .get(url)
            .header("X-API-KEY", &self.api_key)
            .query(query)
            .timeout(timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|_| FetchError::MalformedResponse {
            url: url.to_string(),
            body: truncate(&text),
        })
    }

    async fn fetch_inner(&self, query: &FetchQuery) -> Result<Vec<JsonValue>, FetchError> {
        let url = format!("{}/maps/reviews-v3", self.base_url);
        let body = self
            .get_json(&url, query.params(), INITIAL_REQUEST_TIMEOUT)
            .await?;

        if let Some(data) = non_empty_list(body.get("data")) {
            info!(records = data.len(), "upstream answered from cache");
            return Ok(data);
        }

        let request_id = body
            .get("id")
            .and_then(JsonValue::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FetchError::MalformedResponse {
                url: url.clone(),
                body: truncate(&body.to_string()),
            })?;
        self.poll(request_id).await
    }

    /// Polls `GET /requests/{request_id}` until success, exhaustion or a hard error.
    pub async fn poll(&self, request_id: &str) -> Result<Vec<JsonValue>, FetchError> {
        let url = format!("{}/requests/{}", self.base_url, request_id);
        info!(request_id, "request queued, polling");

        let mut state = PollState::start();
        loop {
            match state {
                PollState::Ready(data) => {
                    info!(request_id, records = data.len(), "request completed");
                    return Ok(data);
                }
                PollState::Exhausted { attempts } => {
                    return Err(FetchError::Timeout {
                        request_id: request_id.to_string(),
                        attempts,
                    });
                }
                PollState::Pending { .. } => {}
            }
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled {
                    request_id: request_id.to_string(),
                });
            }

            self.sleeper.sleep(self.policy.interval).await;
            let body = self.get_json(&url, &[], POLL_REQUEST_TIMEOUT).await?;
            let response = PollResponse::from_body(&body);
            let status = response
                .status
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            state = state.advance(&self.policy, response);
            if let PollState::Pending { attempt } = state {
                info!(
                    request_id,
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    %status,
                    "request still pending"
                );
            }
        }
    }
}

#[async_trait]
impl PlaceDataApi for OutscraperClient {
    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<JsonValue>, FetchError> {
        let place = query.get("query").unwrap_or_default().to_string();
        self.fetch_inner(query)
            .instrument(info_span!("upstream_fetch", place = %place))
            .await
    }
}

fn non_empty_list(value: Option<&JsonValue>) -> Option<Vec<JsonValue>> {
    match value {
        Some(JsonValue::Array(items)) if !items.is_empty() => Some(items.clone()),
        _ => None,
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_BODY_CHARS).collect()
}

// Alias priority is significant: the first non-empty alias wins.
pub const REVIEW_ID_ALIASES: &[&str] = &["review_id", "reviewId", "google_id", "review_link"];
pub const AUTHOR_NAME_ALIASES: &[&str] = &["author_name", "author_title"];
pub const RATING_ALIASES: &[&str] = &["review_rating", "rating"];
pub const TEXT_ALIASES: &[&str] = &["review_text", "text"];
pub const REVIEW_URL_ALIASES: &[&str] = &["review_link", "review_url"];
pub const REVIEW_DATE_ALIASES: &[&str] = &[
    "review_timestamp",
    "review_datetime_utc",
    "published_at",
    "date",
];
pub const OPENING_HOURS_ALIASES: &[&str] =
    &["working_hours", "opening_hours", "openingHours", "other_hours"];

/// Canonical field → ordered source aliases, for every normalized field.
pub const ALIAS_TABLE: &[(&str, &[&str])] = &[
    ("review_id", REVIEW_ID_ALIASES),
    ("author_name", AUTHOR_NAME_ALIASES),
    ("rating", RATING_ALIASES),
    ("text", TEXT_ALIASES),
    ("review_url", REVIEW_URL_ALIASES),
    ("review_date", REVIEW_DATE_ALIASES),
    ("opening_hours", OPENING_HOURS_ALIASES),
];

fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// First non-empty value among `aliases`, in order.
pub fn first_present<'a>(
    record: &'a JsonMap<String, JsonValue>,
    aliases: &[&str],
) -> Option<&'a JsonValue> {
    aliases
        .iter()
        .filter_map(|alias| record.get(*alias))
        .find(|value| !is_empty_value(value))
}

fn as_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_rating(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        _ => None,
    }
}

/// RFC 3339 when the value parses; otherwise its string form, kept verbatim.
pub fn normalize_date(value: &JsonValue) -> Option<String> {
    if is_empty_value(value) {
        return None;
    }
    match parse_timestamp(value) {
        Some(dt) => Some(dt.to_rfc3339()),
        None => as_text(value).or_else(|| Some(value.to_string())),
    }
}

/// Maps raw review records to canonical reviews; records without any id alias are dropped.
pub fn normalize_reviews(raw: &[JsonValue], place_id: &str) -> Vec<Review> {
    raw.iter()
        .filter_map(JsonValue::as_object)
        .filter_map(|item| {
            let review_id = first_present(item, REVIEW_ID_ALIASES).and_then(as_text)?;
            Some(Review {
                place_id: place_id.to_string(),
                review_id,
                author_name: first_present(item, AUTHOR_NAME_ALIASES).and_then(as_text),
                rating: first_present(item, RATING_ALIASES).and_then(as_rating),
                text: first_present(item, TEXT_ALIASES).and_then(as_text),
                review_url: first_present(item, REVIEW_URL_ALIASES).and_then(as_text),
                review_date: first_present(item, REVIEW_DATE_ALIASES)
                    .and_then(normalize_date),
                raw: JsonValue::Object(item.clone()),
            })
        })
        .collect()
}

/// Opening hours from the first place object, unwrapping one level of list nesting.
pub fn normalize_opening_hours(raw: &[JsonValue], place_id: &str) -> Option<OpeningHours> {
    let item = match raw.first()? {
        JsonValue::Array(inner) => inner.first()?,
        other => other,
    };
    let place = item.as_object()?;
    let opening_hours = first_present(place, OPENING_HOURS_ALIASES)?;
    Some(OpeningHours {
        place_id: place_id.to_string(),
        opening_hours: opening_hours.clone(),
        raw: item.clone(),
    })
}

/// Canonical records produced from one fetch payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<R> {
    pub records: Vec<R>,
    /// Source records that could not be turned into a canonical record.
    pub dropped: usize,
}

/// Per-entity knowledge of how to ask for and shape upstream data.
pub trait EntityAdapter: Send + Sync {
    type Record: StoreRecord + Send + Sync;

    fn entity(&self) -> EntityKind;

    /// Whether cycles for this entity read and advance a cutoff.
    fn tracks_cutoff(&self) -> bool;

    /// `None` means there is nothing to fetch.
    fn query(&self, place_id: &str, cutoff: Option<Cutoff>) -> Option<FetchQuery>;

    fn normalize(&self, payload: &[JsonValue], place_id: &str) -> Normalized<Self::Record>;

    /// Source timestamp used to advance the cutoff past this record.
    fn watermark(&self, _record: &Self::Record) -> Option<DateTime<Utc>> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ReviewsAdapter {
    pub limit: i64,
    pub language: String,
}

impl ReviewsAdapter {
    pub fn new(limit: i64, language: impl Into<String>) -> Self {
        Self {
            limit,
            language: language.into(),
        }
    }

    /// Reviews nested under each place's `reviews_data`, capped at the limit.
    pub fn extract_reviews(&self, payload: &[JsonValue]) -> Vec<JsonValue> {
        let cap = usize::try_from(self.limit.max(0)).unwrap_or(usize::MAX);
        payload
            .iter()
            .filter_map(|place| place.get("reviews_data").and_then(JsonValue::as_array))
            .flatten()
            .take(cap)
            .cloned()
            .collect()
    }
}

impl EntityAdapter for ReviewsAdapter {
    type Record = Review;

    fn entity(&self) -> EntityKind {
        EntityKind::Reviews
    }

    fn tracks_cutoff(&self) -> bool {
        true
    }

    fn query(&self, place_id: &str, cutoff: Option<Cutoff>) -> Option<FetchQuery> {
        if self.limit <= 0 {
            return None;
        }
        let mut query = FetchQuery::new()
            .param("query", place_id)
            .param("reviewsLimit", self.limit)
            .param("sort", "newest")
            .param("language", &self.language);
        if let Some(cutoff) = cutoff.filter(|c| c.unix_seconds() > 0) {
            query = query.param("cutoff", cutoff.unix_seconds());
        }
        Some(query)
    }

    fn normalize(&self, payload: &[JsonValue], place_id: &str) -> Normalized<Review> {
        let raw = self.extract_reviews(payload);
        let records = normalize_reviews(&raw, place_id);
        Normalized {
            dropped: raw.len() - records.len(),
            records,
        }
    }

    fn watermark(&self, record: &Review) -> Option<DateTime<Utc>> {
        record.review_datetime()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpeningHoursAdapter;

impl EntityAdapter for OpeningHoursAdapter {
    type Record = OpeningHours;

    fn entity(&self) -> EntityKind {
        EntityKind::OpeningHours
    }

    fn tracks_cutoff(&self) -> bool {
        false
    }

    fn query(&self, place_id: &str, _cutoff: Option<Cutoff>) -> Option<FetchQuery> {
        Some(
            FetchQuery::new()
                .param("query", place_id)
                .param("fields", "working_hours")
                .param("limit", 1)
                .param("drop_duplicates", true)
                .param("ignore_paused", true)
                .param("extract_emails", false)
                .param("extract_socials", false),
        )
    }

    fn normalize(&self, payload: &[JsonValue], place_id: &str) -> Normalized<OpeningHours> {
        match normalize_opening_hours(payload, place_id) {
            Some(hours) => Normalized {
                records: vec![hours],
                dropped: 0,
            },
            None => Normalized {
                records: Vec::new(),
                dropped: usize::from(!payload.is_empty()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Default)]
    struct RecordingSleeper {
        naps: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        fn naps(&self) -> Vec<Duration> {
            self.naps.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.naps.lock().unwrap().push(duration);
        }
    }

    fn client_for(server: &MockServer, sleeper: Arc<RecordingSleeper>) -> OutscraperClient {
        OutscraperClient::new(OutscraperConfig {
            api_key: "key".to_string(),
            base_url: server.uri(),
        })
        .unwrap()
        .with_sleeper(sleeper)
    }

    fn reviews_query() -> FetchQuery {
        ReviewsAdapter::new(20, "de")
            .query("place-1", None)
            .unwrap()
    }

    #[tokio::test]
    async fn cached_data_is_returned_without_polling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/maps/reviews-v3"))
            .and(header("x-api-key", "key"))
            .and(query_param("query", "place-1"))
            .and(query_param("reviewsLimit", "20"))
            .and(query_param("sort", "newest"))
            .and(query_param("language", "de"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": [{"name": "Cafe"}]})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/requests/abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let data = client_for(&server, sleeper.clone())
            .fetch(&reviews_query())
            .await
            .unwrap();
        assert_eq!(data, vec![json!({"name": "Cafe"})]);
        assert!(sleeper.naps().is_empty());
    }

    #[tokio::test]
    async fn queued_request_is_polled_until_success_with_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/maps/reviews-v3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "abc"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/requests/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "Pending"})))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/requests/abc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": "Success", "data": []})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/requests/abc"))
            .and(header("x-api-key", "key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"status": "Success", "data": [{"reviews_data": []}]}),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let data = client_for(&server, sleeper.clone())
            .fetch(&reviews_query())
            .await
            .unwrap();
        assert_eq!(data, vec![json!({"reviews_data": []})]);
        assert_eq!(sleeper.naps(), vec![POLL_INTERVAL; 4]);
    }

    #[tokio::test]
    async fn polling_times_out_after_exactly_thirty_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/maps/reviews-v3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "slow"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/requests/slow"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "Pending"})))
            .expect(30)
            .mount(&server)
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let err = client_for(&server, sleeper.clone())
            .fetch(&reviews_query())
            .await
            .unwrap_err();
        match err {
            FetchError::Timeout { request_id, attempts } => {
                assert_eq!(request_id, "slow");
                assert_eq!(attempts, 30);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(sleeper.naps().len(), 30);
    }

    #[tokio::test]
    async fn response_without_data_or_id_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/maps/reviews-v3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "Error"})))
            .mount(&server)
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let err = client_for(&server, sleeper.clone())
            .fetch(&reviews_query())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse { .. }), "{err:?}");
        assert!(sleeper.naps().is_empty());
    }

    #[tokio::test]
    async fn http_error_while_polling_stops_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/maps/reviews-v3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "abc"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/requests/abc"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&server)
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let err = client_for(&server, sleeper)
            .fetch(&reviews_query())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 502, .. }), "{err:?}");
    }

    #[tokio::test]
    async fn cancelled_flag_stops_polling_before_the_next_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/maps/reviews-v3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "abc"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/requests/abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cancel = CancelFlag::new();
        cancel.cancel();
        let sleeper = Arc::new(RecordingSleeper::default());
        let err = client_for(&server, sleeper)
            .with_cancel_flag(cancel)
            .fetch(&reviews_query())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled { .. }), "{err:?}");
    }

    #[test]
    fn poll_state_machine_transitions() {
        let policy = PollPolicy {
            interval: Duration::ZERO,
            max_attempts: 2,
        };
        let pending = PollResponse {
            status: Some("Pending".into()),
            data: vec![],
        };
        let done = PollResponse {
            status: Some("Success".into()),
            data: vec![json!(1)],
        };

        let state = PollState::start().advance(&policy, pending.clone());
        assert_eq!(state, PollState::Pending { attempt: 1 });
        assert_eq!(
            state.clone().advance(&policy, pending.clone()),
            PollState::Exhausted { attempts: 2 }
        );
        assert_eq!(
            state.advance(&policy, done.clone()),
            PollState::Ready(vec![json!(1)])
        );
        let exhausted = PollState::Exhausted { attempts: 2 };
        assert_eq!(exhausted.clone().advance(&policy, done), exhausted);
    }

    #[test]
    fn first_priority_alias_wins() {
        let raw = vec![json!({"review_id": "primary", "reviewId": "secondary"})];
        let reviews = normalize_reviews(&raw, "place-1");
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].review_id, "primary");
    }

    #[test]
    fn empty_alias_falls_through_to_next() {
        let raw = vec![json!({"review_id": "", "reviewId": null, "google_id": 42})];
        let reviews = normalize_reviews(&raw, "place-1");
        assert_eq!(reviews[0].review_id, "42");
    }

    #[test]
    fn records_without_identifier_are_dropped() {
        let raw = vec![
            json!({"review_id": "a"}),
            json!({"author_title": "No Id"}),
            json!("not an object"),
            json!({"reviewId": "b"}),
        ];
        let reviews = normalize_reviews(&raw, "place-1");
        let ids: Vec<_> = reviews.iter().map(|r| r.review_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn review_without_id_uses_permalink() {
        let raw = vec![
            json!({"review_id": "r1", "review_rating": 5, "date": "2024-01-01T00:00:00Z"}),
            json!({"review_link": "http://x/r2"}),
        ];
        let reviews = normalize_reviews(&raw, "place-1");
        assert_eq!(reviews.len(), 2);

        let first = &reviews[0];
        assert_eq!(first.review_id, "r1");
        assert_eq!(first.rating, Some(5));
        assert_eq!(
            first.review_date.as_deref(),
            Some("2024-01-01T00:00:00+00:00")
        );
        assert_eq!(first.raw, raw[0]);

        let second = &reviews[1];
        assert_eq!(second.review_id, "http://x/r2");
        assert_eq!(second.review_url.as_deref(), Some("http://x/r2"));
        assert_eq!(second.rating, None);
        assert_eq!(second.review_date, None);
    }

    #[test]
    fn review_dates_are_lenient() {
        let raw = vec![
            json!({"review_id": "a", "review_timestamp": 1_704_067_200}),
            json!({"review_id": "b", "review_datetime_utc": "2024-01-01 00:00:00 UTC"}),
            json!({"review_id": "c", "date": "a week ago"}),
        ];
        let dates: Vec<_> = normalize_reviews(&raw, "p")
            .into_iter()
            .map(|r| r.review_date)
            .collect();
        assert_eq!(
            dates,
            vec![
                Some("2024-01-01T00:00:00+00:00".to_string()),
                Some("2024-01-01T00:00:00+00:00".to_string()),
                Some("a week ago".to_string()),
            ]
        );
        assert_eq!(normalize_date(&json!(null)), None);
    }

    #[test]
    fn ratings_are_coerced_to_integers() {
        let raw = vec![
            json!({"review_id": "a", "review_rating": 4.0}),
            json!({"review_id": "b", "rating": "3"}),
            json!({"review_id": "c", "rating": "great"}),
        ];
        let ratings: Vec<_> = normalize_reviews(&raw, "p")
            .into_iter()
            .map(|r| r.rating)
            .collect();
        assert_eq!(ratings, vec![Some(4), Some(3), None]);
    }

    #[test]
    fn opening_hours_unwraps_one_nested_level() {
        let raw = vec![json!([{"working_hours": {"Mon": "9-5"}}])];
        let hours = normalize_opening_hours(&raw, "place-1").unwrap();
        assert_eq!(hours.place_id, "place-1");
        assert_eq!(hours.opening_hours, json!({"Mon": "9-5"}));
        assert_eq!(hours.raw, json!({"working_hours": {"Mon": "9-5"}}));
    }

    #[test]
    fn opening_hours_alias_order_and_absence() {
        let raw = vec![json!({"openingHours": {"Tue": "8-4"}, "other_hours": {"Tue": "x"}})];
        let hours = normalize_opening_hours(&raw, "p").unwrap();
        assert_eq!(hours.opening_hours, json!({"Tue": "8-4"}));

        assert!(normalize_opening_hours(&[json!({"name": "Cafe"})], "p").is_none());
        assert!(normalize_opening_hours(&[json!([])], "p").is_none());
        assert!(normalize_opening_hours(&[], "p").is_none());
    }

    #[test]
    fn reviews_query_includes_positive_cutoff_only() {
        let adapter = ReviewsAdapter::new(5, "en");
        let with_cutoff = adapter
            .query("place-1", Cutoff::from_unix_seconds(1_700_000_000))
            .unwrap();
        assert_eq!(with_cutoff.get("cutoff"), Some("1700000000"));
        assert_eq!(with_cutoff.get("reviewsLimit"), Some("5"));
        assert_eq!(adapter.query("place-1", None).unwrap().get("cutoff"), None);
        assert!(ReviewsAdapter::new(0, "en").query("place-1", None).is_none());
    }

    #[test]
    fn reviews_adapter_flattens_and_caps_reviews_data() {
        let adapter = ReviewsAdapter::new(3, "de");
        let payload = vec![
            json!({"name": "Cafe", "reviews_data": [{"review_id": "a"}, {"author_title": "x"}]}),
            json!({"name": "Cafe 2", "reviews_data": [{"review_id": "b"}, {"review_id": "c"}]}),
        ];
        let normalized = adapter.normalize(&payload, "place-1");
        let ids: Vec<_> = normalized.records.iter().map(|r| r.review_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(normalized.dropped, 1);
    }

    #[test]
    fn alias_table_lists_every_canonical_field_once() {
        let fields: Vec<_> = ALIAS_TABLE.iter().map(|(field, _)| *field).collect();
        let mut deduped = fields.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(fields.len(), deduped.len());
        assert_eq!(ALIAS_TABLE[0].1[0], "review_id");
    }
}
