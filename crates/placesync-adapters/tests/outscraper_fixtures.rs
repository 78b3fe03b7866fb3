use std::path::{Path, PathBuf};

use placesync_adapters::{EntityAdapter, OpeningHoursAdapter, ReviewsAdapter};
use serde_json::Value as JsonValue;

const PLACE_ID: &str = "ChIJN1t_tDeuEmsRUsoyG83frY4";

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/outscraper")
        .join(name)
}

fn fixture_data(name: &str) -> Vec<JsonValue> {
    let text = std::fs::read_to_string(fixture_path(name)).expect("read fixture");
    let body: JsonValue = serde_json::from_str(&text).expect("parse fixture");
    body["data"].as_array().expect("data array").clone()
}

#[test]
fn reviews_fixture_normalizes_every_keyed_variant() {
    let adapter = ReviewsAdapter::new(20, "de");
    let normalized = adapter.normalize(&fixture_data("reviews_response.json"), PLACE_ID);

    assert_eq!(normalized.records.len(), 3);
    assert_eq!(normalized.dropped, 1);

    let first = &normalized.records[0];
    assert_eq!(first.review_id, "ChdDSUhNMG9nS0VJQ0FnSURuMXZYd1lBEAE");
    assert_eq!(first.author_name.as_deref(), Some("Jana Köhler"));
    assert_eq!(first.rating, Some(5));
    assert_eq!(first.review_date.as_deref(), Some("2024-06-01T12:00:00+00:00"));
    assert_eq!(first.place_id, PLACE_ID);

    let second = &normalized.records[1];
    assert_eq!(second.review_id, "ChZDSUhNMG9nS0VJQ0FnSUNIdS1XbWFREAE");
    assert_eq!(second.author_name.as_deref(), Some("Tom Berger"));
    assert_eq!(second.rating, Some(3));
    assert_eq!(second.text.as_deref(), Some("Etwas laut am Wochenende."));
    assert_eq!(second.review_date.as_deref(), Some("2024-05-20T08:15:00+00:00"));

    let third = &normalized.records[2];
    assert!(third.review_id.ends_with("1sPermalinkOnly"));
    assert_eq!(third.review_url.as_deref(), Some(third.review_id.as_str()));
    assert_eq!(third.text, None);
    assert_eq!(third.review_date.as_deref(), Some("vor 3 Monaten"));

    assert_eq!(
        adapter.watermark(first).map(|d| d.timestamp()),
        Some(1_717_243_200)
    );
    assert_eq!(adapter.watermark(third), None);
}

#[test]
fn reviews_fixture_respects_limit() {
    let adapter = ReviewsAdapter::new(2, "de");
    let normalized = adapter.normalize(&fixture_data("reviews_response.json"), PLACE_ID);
    assert_eq!(normalized.records.len(), 2);
    assert_eq!(normalized.dropped, 0);
}

#[test]
fn opening_hours_fixture_unwraps_nested_place() {
    let adapter = OpeningHoursAdapter;
    let normalized = adapter.normalize(&fixture_data("opening_hours_response.json"), PLACE_ID);

    assert_eq!(normalized.records.len(), 1);
    let hours = &normalized.records[0];
    assert_eq!(hours.place_id, PLACE_ID);
    assert_eq!(hours.opening_hours["Sunday"], "Closed");
    assert_eq!(hours.raw["name"], "Café am Markt");
}
