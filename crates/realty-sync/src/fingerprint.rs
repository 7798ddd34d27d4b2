//! Canonical fingerprints: a coarse location bucket plus the category and a
//! few normalized attributes, hashed so that re-sightings of the same
//! property from any source land on the same master object.

use geo_types::Coord;
use realty_core::{Listing, ListingDetails};
use sha2::{Digest, Sha256};
use tracing::warn;

pub const NULL_TOKEN: &str = "null";
pub const SEPARATOR: &str = "|";

/// Geohash cell of `precision` characters, or `None` when the point lies
/// outside the valid coordinate range.
pub fn geohash_cell(latitude: f64, longitude: f64, precision: usize) -> Option<String> {
    if !latitude.is_finite() || !longitude.is_finite() {
        return None;
    }
    geohash::encode(
        Coord {
            x: longitude,
            y: latitude,
        },
        precision,
    )
    .ok()
}

fn location(listing: &Listing, precision: usize) -> String {
    match geohash_cell(listing.latitude, listing.longitude, precision) {
        Some(cell) => cell,
        None => {
            warn!(
                source = %listing.source,
                source_ad_id = listing.source_ad_id,
                latitude = listing.latitude,
                longitude = listing.longitude,
                "coordinates out of range, location token left empty"
            );
            NULL_TOKEN.to_string()
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn bucket(value: Option<f64>, bin_width: f64) -> String {
    let Some(value) = value else {
        return NULL_TOKEN.to_string();
    };
    let width = if bin_width.is_finite() && bin_width > 0.0 {
        bin_width
    } else {
        1.0
    };
    format!("{}", (value / width).floor() as i64)
}

fn raw(value: Option<f64>) -> String {
    value.map_or_else(|| NULL_TOKEN.to_string(), |v| format!("{v:.6}"))
}

fn count(value: Option<i16>) -> String {
    value.map_or_else(|| NULL_TOKEN.to_string(), |v| v.to_string())
}

fn text(value: Option<&str>) -> String {
    match value.map(|v| v.trim().to_lowercase()) {
        Some(v) if !v.is_empty() => v,
        _ => NULL_TOKEN.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    config: FingerprintConfig,
}

impl Fingerprinter {
    pub fn new(config: FingerprintConfig) -> Self {
        Self { config }
    }

    pub fn payload(&self, listing: &Listing) -> String {
        let cfg = &self.config;
        let mut parts = vec![
            location(listing, cfg.geohash_precision),
            listing.category.as_str().to_string(),
        ];

        match &listing.details {
            ListingDetails::Apartment(d) => {
                parts.push(bucket(d.total_area, cfg.apartment_area_bin));
                parts.push(count(d.rooms_amount));
            }
            ListingDetails::House(d) => {
                parts.push(bucket(d.total_area, cfg.house_area_bin));
                parts.push(bucket(d.plot_area, cfg.plot_area_bin));
                parts.push(count(d.rooms_amount));
                parts.push(text(d.house_type.as_deref()));
            }
            ListingDetails::Commercial(d) => {
                parts.push(text(d.property_type.as_deref()));
                parts.push(raw(d.total_area));
            }
            ListingDetails::Room(d) => parts.push(raw(d.total_area)),
            ListingDetails::GarageAndParking(d) => {
                parts.push(text(d.property_type.as_deref()));
                parts.push(raw(d.total_area));
            }
            ListingDetails::Plot(d) => parts.push(raw(d.plot_area)),
            ListingDetails::NewBuilding(d) => parts.push(text(d.builder.as_deref())),
            // TODO: decide whether detail-less categories should fold in the
            // deal type or address once the matching rules for them are agreed.
            ListingDetails::None => {}
        }

        parts.join(SEPARATOR)
    }

    pub fn canonical_hash(&self, listing: &Listing) -> String {
        sha256_hex(self.payload(listing).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use realty_core::{
        ApartmentDetails, Category, DealType, HouseDetails, ListingStatus, PlotDetails,
        RoomDetails,
    };
    use uuid::Uuid;

    fn at_minsk(category: Category, details: ListingDetails) -> Listing {
        Listing {
            id: Uuid::new_v4(),
            source: "kufar".into(),
            source_ad_id: 1,
            category,
            deal_type: DealType::Sale,
            status: ListingStatus::Active,
            latitude: 53.90254,
            longitude: 27.56181,
            ad_link: None,
            title: None,
            description: None,
            address: None,
            city_or_district: None,
            region: None,
            currency: None,
            price_byn: None,
            price_usd: None,
            price_eur: None,
            images: vec![],
            is_agency: false,
            seller_name: None,
            list_time: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            details,
        }
    }

    #[test]
    fn geohash_matches_reference_vectors() {
        assert_eq!(geohash_cell(57.64911, 10.40744, 11).as_deref(), Some("u4pruydqqvj"));
        assert_eq!(geohash_cell(42.6, -5.6, 5).as_deref(), Some("ezs42"));
        assert_eq!(geohash_cell(37.8324, 112.5584, 9).as_deref(), Some("ww8p1r4t8"));
        assert_eq!(geohash_cell(53.90254, 27.56181, 5).as_deref(), Some("u9ede"));
    }

    #[test]
    fn out_of_range_coordinates_get_a_placeholder_location() {
        assert_eq!(geohash_cell(95.0, 27.5, 5), None);
        assert_eq!(geohash_cell(53.9, f64::NAN, 5), None);

        let fp = Fingerprinter::default();
        let mut flat = at_minsk(
            Category::Apartment,
            ListingDetails::Apartment(ApartmentDetails {
                total_area: Some(61.4),
                rooms_amount: Some(2),
                ..Default::default()
            }),
        );
        flat.longitude = 181.0;
        assert_eq!(fp.payload(&flat), "null|apartment|30|2");
    }

    #[test]
    fn apartment_payload_buckets_area_with_floor() {
        let fp = Fingerprinter::default();
        let a = at_minsk(
            Category::Apartment,
            ListingDetails::Apartment(ApartmentDetails {
                total_area: Some(61.4),
                rooms_amount: Some(2),
                ..Default::default()
            }),
        );
        let b = at_minsk(
            Category::Apartment,
            ListingDetails::Apartment(ApartmentDetails {
                total_area: Some(60.9),
                rooms_amount: Some(2),
                ..Default::default()
            }),
        );

        assert_eq!(fp.payload(&a), "u9ede|apartment|30|2");
        assert_eq!(fp.payload(&b), fp.payload(&a));
        assert_eq!(
            fp.canonical_hash(&a),
            "9769913e3d39a5affdc699f42172689dafeb4f6a921ecbf48f258f497cc4eb03"
        );
    }

    #[test]
    fn house_payload_normalizes_text_and_buckets_both_areas() {
        let fp = Fingerprinter::default();
        let house = at_minsk(
            Category::House,
            ListingDetails::House(HouseDetails {
                total_area: Some(120.0),
                plot_area: Some(6.0),
                rooms_amount: Some(4),
                house_type: Some("  Cottage ".into()),
                ..Default::default()
            }),
        );
        assert_eq!(fp.payload(&house), "u9ede|house|60|6|4|cottage");
    }

    #[test]
    fn missing_values_become_placeholders() {
        let fp = Fingerprinter::default();
        let plot = at_minsk(Category::Plot, ListingDetails::Plot(PlotDetails::default()));
        assert_eq!(fp.payload(&plot), "u9ede|plot|null");
        assert_eq!(
            fp.canonical_hash(&plot),
            "010ae16de4608ebb2b80a224804d5fd7f2378642b67a82e34f14282e93bf03a2"
        );

        let empty_house = at_minsk(
            Category::House,
            ListingDetails::House(HouseDetails {
                house_type: Some("   ".into()),
                ..Default::default()
            }),
        );
        assert_eq!(fp.payload(&empty_house), "u9ede|house|null|null|null|null");
    }

    #[test]
    fn raw_areas_use_six_decimals() {
        let fp = Fingerprinter::default();
        let room = at_minsk(
            Category::Room,
            ListingDetails::Room(RoomDetails {
                total_area: Some(14.5),
                ..Default::default()
            }),
        );
        assert_eq!(fp.payload(&room), "u9ede|room|14.500000");
    }

    #[test]
    fn unknown_category_uses_location_and_tag_only() {
        let fp = Fingerprinter::default();
        let hostel = at_minsk(Category::Other("hostel".into()), ListingDetails::None);
        assert_eq!(fp.payload(&hostel), "u9ede|hostel");
    }

    #[test]
    fn non_positive_bin_width_falls_back_to_one() {
        let fp = Fingerprinter::new(FingerprintConfig {
            apartment_area_bin: 0.0,
            ..Default::default()
        });
        let a = at_minsk(
            Category::Apartment,
            ListingDetails::Apartment(ApartmentDetails {
                total_area: Some(61.4),
                ..Default::default()
            }),
        );
        assert_eq!(fp.payload(&a), "u9ede|apartment|61|null");
    }

    #[test]
    fn category_separates_identical_locations() {
        let fp = Fingerprinter::default();
        let apartment = at_minsk(
            Category::Apartment,
            ListingDetails::Apartment(ApartmentDetails::default()),
        );
        let house = at_minsk(Category::House, ListingDetails::House(HouseDetails::default()));
        assert_ne!(fp.canonical_hash(&apartment), fp.canonical_hash(&house));
    }
}
