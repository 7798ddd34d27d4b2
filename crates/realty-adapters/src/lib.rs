//! Inbound event decoding: envelope validation, category-tag to detail schema
//! mapping, and grouping of decoded listings into per-task batches.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use realty_core::{
    Category, DealType, IncomingBatch, Listing, ListingDetails, ListingStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "realty-adapters";

pub const EVENT_TYPE: &str = "ProcessedRealEstateEvent";
pub const EVENT_VERSION: &str = "1.0.0";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unsupported event `{event_type}` version `{event_version}`")]
    UnsupportedEvent {
        event_type: String,
        event_version: String,
    },
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("malformed `{details_type}` details: {source}")]
    MalformedDetails {
        details_type: String,
        source: serde_json::Error,
    },
    #[error("invalid `{field}`: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub event_version: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedListingEvent {
    pub general: GeneralDto,
    pub details_type: String,
    #[serde(default)]
    pub details: JsonValue,
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralDto {
    pub source: String,
    pub source_ad_id: i64,
    pub ad_link: Option<String>,
    pub currency: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    pub list_time: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub title: Option<String>,
    pub deal_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub city_or_district: Option<String>,
    pub region: Option<String>,
    #[serde(rename = "priceBYN")]
    pub price_byn: Option<f64>,
    #[serde(rename = "priceUSD")]
    pub price_usd: Option<f64>,
    #[serde(rename = "priceEUR")]
    pub price_eur: Option<f64>,
    pub address: Option<String>,
    #[serde(default)]
    pub is_agency: bool,
    pub seller_name: Option<String>,
    pub status: Option<String>,
}

/// One decoded event: a listing plus the task and trace it arrived with.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub task_id: Uuid,
    pub trace_id: Option<String>,
    pub listing: Listing,
}

type DetailDecoder = fn(JsonValue) -> Result<ListingDetails, serde_json::Error>;

/// Category tag to detail schema. Tags missing here carry no details.
const DETAIL_DECODERS: &[(&str, DetailDecoder)] = &[
    ("apartment", decode_apartment),
    ("house", decode_house),
    ("commercial", decode_commercial),
    ("room", decode_room),
    ("garage_and_parking", decode_garage_and_parking),
    ("garage", decode_garage_and_parking),
    ("plot", decode_plot),
    ("new_building", decode_new_building),
];

fn decode_apartment(v: JsonValue) -> Result<ListingDetails, serde_json::Error> {
    serde_json::from_value(v).map(ListingDetails::Apartment)
}

fn decode_house(v: JsonValue) -> Result<ListingDetails, serde_json::Error> {
    serde_json::from_value(v).map(ListingDetails::House)
}

fn decode_commercial(v: JsonValue) -> Result<ListingDetails, serde_json::Error> {
    serde_json::from_value(v).map(ListingDetails::Commercial)
}

fn decode_room(v: JsonValue) -> Result<ListingDetails, serde_json::Error> {
    serde_json::from_value(v).map(ListingDetails::Room)
}

fn decode_garage_and_parking(v: JsonValue) -> Result<ListingDetails, serde_json::Error> {
    serde_json::from_value(v).map(ListingDetails::GarageAndParking)
}

fn decode_plot(v: JsonValue) -> Result<ListingDetails, serde_json::Error> {
    serde_json::from_value(v).map(ListingDetails::Plot)
}

fn decode_new_building(v: JsonValue) -> Result<ListingDetails, serde_json::Error> {
    serde_json::from_value(v).map(ListingDetails::NewBuilding)
}

pub fn detail_decoder(details_type: &str) -> Option<DetailDecoder> {
    let tag = details_type.trim().to_ascii_lowercase();
    DETAIL_DECODERS
        .iter()
        .find(|(known, _)| *known == tag)
        .map(|(_, decoder)| *decoder)
}

pub fn decode_details(details_type: &str, details: JsonValue) -> Result<ListingDetails, AdapterError> {
    let Some(decoder) = detail_decoder(details_type) else {
        warn!(details_type, "unknown details type, details will be ignored");
        return Ok(ListingDetails::None);
    };
    let details = if details.is_null() { json!({}) } else { details };
    decoder(details).map_err(|source| AdapterError::MalformedDetails {
        details_type: details_type.to_string(),
        source,
    })
}

pub fn decode_envelope(envelope: EventEnvelope) -> Result<DecodedEvent, AdapterError> {
    if envelope.event_type != EVENT_TYPE || envelope.event_version != EVENT_VERSION {
        return Err(AdapterError::UnsupportedEvent {
            event_type: envelope.event_type,
            event_version: envelope.event_version,
        });
    }
    let event: ProcessedListingEvent = serde_json::from_value(envelope.payload)?;
    let listing = event_to_listing(event.general, &event.details_type, event.details)?;
    Ok(DecodedEvent {
        task_id: event.task_id,
        trace_id: envelope.trace_id,
        listing,
    })
}

pub fn decode_event(bytes: &[u8]) -> Result<DecodedEvent, AdapterError> {
    decode_envelope(serde_json::from_slice(bytes)?)
}

fn event_to_listing(
    general: GeneralDto,
    details_type: &str,
    details: JsonValue,
) -> Result<Listing, AdapterError> {
    let deal_type = general
        .deal_type
        .parse::<DealType>()
        .map_err(|_| AdapterError::InvalidField {
            field: "dealType",
            value: general.deal_type.clone(),
        })?;
    // Anything other than an explicit archive is a sighting of a live ad.
    let status = match general.status.as_deref().map(str::trim) {
        Some(s) if s.eq_ignore_ascii_case("archived") => ListingStatus::Archived,
        _ => ListingStatus::Active,
    };
    let details = decode_details(details_type, details)?;
    let now = Utc::now();

    Ok(Listing {
        id: Uuid::new_v4(),
        source: general.source,
        source_ad_id: general.source_ad_id,
        category: Category::from_tag(details_type),
        deal_type,
        status,
        latitude: general.latitude,
        longitude: general.longitude,
        ad_link: non_empty(general.ad_link),
        title: non_empty(general.title),
        description: non_empty(general.description),
        address: non_empty(general.address),
        city_or_district: non_empty(general.city_or_district),
        region: non_empty(general.region),
        currency: non_empty(general.currency),
        price_byn: general.price_byn,
        price_usd: general.price_usd,
        price_eur: general.price_eur,
        images: general.images,
        is_agency: general.is_agency,
        seller_name: non_empty(general.seller_name),
        list_time: general.list_time,
        created_at: now,
        updated_at: now,
        details,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Groups events into one batch per task, in first-seen task order.
pub fn group_by_task(events: Vec<DecodedEvent>) -> Vec<IncomingBatch> {
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    let mut batches: Vec<IncomingBatch> = Vec::new();
    for event in events {
        let slot = *index.entry(event.task_id).or_insert_with(|| {
            batches.push(IncomingBatch {
                task_id: event.task_id,
                trace_id: event.trace_id.clone(),
                listings: Vec::new(),
            });
            batches.len() - 1
        });
        batches[slot].listings.push(event.listing);
    }
    batches
}

/// Reads a JSON array of event envelopes. Any bad event rejects the file.
pub fn load_event_file(path: impl AsRef<Path>) -> Result<Vec<DecodedEvent>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let envelopes: Vec<EventEnvelope> =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    envelopes
        .into_iter()
        .enumerate()
        .map(|(idx, envelope)| {
            decode_envelope(envelope)
                .with_context(|| format!("decoding event #{idx} in {}", path.display()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn sample_batch_path() -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join("events")
            .join("sample_batch.json")
    }

    fn envelope(details_type: &str, details: JsonValue) -> EventEnvelope {
        EventEnvelope {
            event_type: EVENT_TYPE.into(),
            event_version: EVENT_VERSION.into(),
            trace_id: Some("trace-1".into()),
            payload: json!({
                "general": {
                    "source": "kufar",
                    "sourceAdId": 7,
                    "adLink": "",
                    "dealType": "rent",
                    "latitude": 53.9,
                    "longitude": 27.56,
                    "priceUSD": 450.0,
                    "status": "active"
                },
                "details_type": details_type,
                "details": details,
                "task_id": "6f1c2a8e-4d3b-4a7e-9b1f-0c2d3e4f5a6b"
            }),
        }
    }

    #[test]
    fn sample_file_decodes_every_category() {
        let events = load_event_file(sample_batch_path()).expect("load sample");
        assert_eq!(events.len(), 5);

        let kufar = &events[0].listing;
        assert_eq!(kufar.source, "kufar");
        assert_eq!(kufar.source_ad_id, 111);
        assert_eq!(kufar.category, Category::Apartment);
        match &kufar.details {
            ListingDetails::Apartment(d) => {
                assert_eq!(d.total_area, Some(61.4));
                assert_eq!(d.rooms_amount, Some(2));
            }
            other => panic!("unexpected details: {other:?}"),
        }

        assert!(matches!(events[2].listing.details, ListingDetails::House(_)));
        assert_eq!(events[3].listing.status, ListingStatus::Archived);

        let hostel = &events[4].listing;
        assert_eq!(hostel.category, Category::Other("hostel".into()));
        assert_eq!(hostel.details, ListingDetails::None);
    }

    #[test]
    fn events_group_by_task_in_arrival_order() {
        let events = load_event_file(sample_batch_path()).expect("load sample");
        let batches = group_by_task(events);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].listings.len(), 4);
        assert_eq!(batches[0].listings[1].source, "realt");
        assert_eq!(batches[1].listings.len(), 1);
        assert_eq!(batches[0].trace_id.as_deref(), Some("trace-sample-a"));
    }

    #[test]
    fn wrong_event_version_is_rejected() {
        let mut env = envelope("apartment", json!({}));
        env.event_version = "2.0.0".into();
        let err = decode_envelope(env).expect_err("version mismatch");
        assert!(matches!(err, AdapterError::UnsupportedEvent { .. }));
    }

    #[test]
    fn malformed_details_reject_the_event() {
        let env = envelope("apartment", json!({"roomsAmount": "two"}));
        let err = decode_envelope(env).expect_err("bad details");
        assert!(matches!(err, AdapterError::MalformedDetails { .. }));
    }

    #[test]
    fn missing_details_and_blank_text_decode_to_empty_values() {
        let decoded = decode_envelope(envelope("plot", JsonValue::Null)).expect("decode");
        assert_eq!(
            decoded.listing.details,
            ListingDetails::Plot(Default::default())
        );
        assert_eq!(decoded.listing.ad_link, None);
        assert_eq!(decoded.listing.deal_type, DealType::Rent);
        assert_eq!(decoded.trace_id.as_deref(), Some("trace-1"));
    }

    #[test]
    fn garage_alias_resolves_to_the_same_schema() {
        let details = decode_details("garage", json!({"parkingPlacesAmount": 1})).expect("decode");
        assert!(matches!(details, ListingDetails::GarageAndParking(_)));
        assert!(detail_decoder("castle").is_none());
    }

    #[test]
    fn raw_bytes_decode() {
        let bytes = serde_json::to_vec(&envelope("room", json!({"totalArea": 14.5}))).unwrap();
        let decoded = decode_event(&bytes).expect("decode");
        assert_eq!(decoded.listing.category, Category::Room);
        assert!(decode_event(b"{not json").is_err());
    }
}
