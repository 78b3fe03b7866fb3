//! Canonical entity model shared by every placesync layer.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "placesync-core";

/// Entity families synced from the upstream data API into the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Reviews,
    OpeningHours,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Reviews => "reviews",
            EntityKind::OpeningHours => "opening_hours",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record that can be upserted into a content store collection.
///
/// `attributes` is the exact object sent as the `data` body of create and
/// update calls; `identity_field`/`identity_value` select the existing entry.
pub trait StoreRecord {
    fn identity_field(&self) -> &'static str;
    fn identity_value(&self) -> &str;
    fn attributes(&self) -> JsonValue;
}

/// Canonical review, keyed by `review_id` (never empty).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub place_id: String,
    pub review_id: String,
    pub author_name: Option<String>,
    pub rating: Option<i64>,
    pub text: Option<String>,
    pub review_url: Option<String>,
    /// RFC 3339 when the source date parsed, otherwise the source value verbatim.
    pub review_date: Option<String>,
    pub raw: JsonValue,
}

impl Review {
    /// Strictly parsed review date; `None` for absent or lenient fallback values.
    pub fn review_datetime(&self) -> Option<DateTime<Utc>> {
        let text = self.review_date.as_deref()?;
        parse_timestamp(&JsonValue::String(text.to_string()))
    }
}

impl StoreRecord for Review {
    fn identity_field(&self) -> &'static str {
        "review_id"
    }

    fn identity_value(&self) -> &str {
        &self.review_id
    }

    fn attributes(&self) -> JsonValue {
        serde_json::json!({
            "place_id": self.place_id,
            "review_id": self.review_id,
            "author_name": self.author_name,
            "rating": self.rating,
            "text": self.text,
            "review_url": self.review_url,
            "review_date": self.review_date,
            "raw": self.raw,
        })
    }
}

/// Canonical opening hours; one per `place_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpeningHours {
    pub place_id: String,
    /// Upstream schedule, stored as-is.
    pub opening_hours: JsonValue,
    pub raw: JsonValue,
}

impl StoreRecord for OpeningHours {
    fn identity_field(&self) -> &'static str {
        "place_id"
    }

    fn identity_value(&self) -> &str {
        &self.place_id
    }

    fn attributes(&self) -> JsonValue {
        serde_json::json!({
            "place_id": self.place_id,
            "opening_hours": self.opening_hours,
            "raw": self.raw,
        })
    }
}

/// Watermark of the newest record already synced for a place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cutoff {
    pub at: DateTime<Utc>,
}

impl Cutoff {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at }
    }

    /// Builds a cutoff from unix seconds; non-positive values mean "no cutoff".
    pub fn from_unix_seconds(secs: i64) -> Option<Self> {
        if secs <= 0 {
            return None;
        }
        Utc.timestamp_opt(secs, 0).single().map(Self::new)
    }

    /// The upstream API's cutoff convention.
    pub fn unix_seconds(&self) -> i64 {
        self.at.timestamp()
    }
}

/// Unix values at or above this are taken to be milliseconds.
const MILLIS_THRESHOLD: u64 = 10_000_000_000;

/// Parses an upstream timestamp into UTC.
///
/// Accepts unix seconds (or milliseconds), RFC 3339 / ISO-8601 strings with a
/// trailing `Z` or ` UTC` marker, and naive date-times, which are read as UTC.
pub fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => {
            let secs = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            let secs = if secs.unsigned_abs() >= MILLIS_THRESHOLD {
                secs / 1000
            } else {
                secs
            };
            Utc.timestamp_opt(secs, 0).single()
        }
        JsonValue::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

fn parse_timestamp_str(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (body, utc_marker) = if let Some(body) = trimmed.strip_suffix(" UTC") {
        (body.trim_end(), true)
    } else if let Some(body) = trimmed
        .strip_suffix('Z')
        .or_else(|| trimmed.strip_suffix('z'))
    {
        (body, true)
    } else {
        (trimmed, false)
    };

    let with_offset = if utc_marker {
        format!("{body}+00:00")
    } else {
        body.to_string()
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&with_offset) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(&with_offset, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(body, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(body, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
