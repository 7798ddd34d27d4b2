//! Core domain model for the realty listing consolidator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "realty-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown deal type `{0}`")]
    DealType(String),
    #[error("unknown listing status `{0}`")]
    Status(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealType {
    Sale,
    Rent,
}

impl DealType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sale => "sale",
            Self::Rent => "rent",
        }
    }
}

impl FromStr for DealType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sale" | "sell" => Ok(Self::Sale),
            "rent" | "let" => Ok(Self::Rent),
            other => Err(ParseError::DealType(other.to_string())),
        }
    }
}

impl fmt::Display for DealType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Active,
    Archived,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

impl FromStr for ListingStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(ParseError::Status(other.to_string())),
        }
    }
}

/// Property category. Tags outside the known set are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Apartment,
    House,
    Commercial,
    Room,
    GarageAndParking,
    Plot,
    NewBuilding,
    Other(String),
}

impl Category {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "apartment" => Self::Apartment,
            "house" => Self::House,
            "commercial" => Self::Commercial,
            "room" => Self::Room,
            "garage_and_parking" | "garage" | "parking" => Self::GarageAndParking,
            "plot" => Self::Plot,
            "new_building" => Self::NewBuilding,
            _ => Self::Other(tag.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Apartment => "apartment",
            Self::House => "house",
            Self::Commercial => "commercial",
            Self::Room => "room",
            Self::GarageAndParking => "garage_and_parking",
            Self::Plot => "plot",
            Self::NewBuilding => "new_building",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for Category {
    fn from(value: String) -> Self {
        Self::from_tag(&value)
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage identity of a listing: unique per source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListingKey {
    pub source: String,
    pub source_ad_id: i64,
}

impl ListingKey {
    pub fn new(source: impl Into<String>, source_ad_id: i64) -> Self {
        Self {
            source: source.into(),
            source_ad_id,
        }
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.source_ad_id)
    }
}

/// The (master, source, deal type) triple that owns at most one active champion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub master_id: Uuid,
    pub source: String,
    pub deal_type: DealType,
}

impl GroupKey {
    pub fn new(master_id: Uuid, source: impl Into<String>, deal_type: DealType) -> Self {
        Self {
            master_id,
            source: source.into(),
            deal_type,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.master_id, self.source, self.deal_type)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApartmentDetails {
    pub rooms_amount: Option<i16>,
    pub floor_number: Option<i16>,
    pub building_floors: Option<i16>,
    pub total_area: Option<f64>,
    pub living_space_area: Option<f64>,
    pub kitchen_area: Option<f64>,
    pub year_built: Option<i16>,
    pub wall_material: Option<String>,
    pub repair_state: Option<String>,
    pub bathroom_type: Option<String>,
    pub balcony_type: Option<String>,
    pub price_per_square_meter: Option<f64>,
    #[serde(default)]
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseDetails {
    pub total_area: Option<f64>,
    pub plot_area: Option<f64>,
    pub living_space_area: Option<f64>,
    pub kitchen_area: Option<f64>,
    pub rooms_amount: Option<i16>,
    pub building_floors: Option<i16>,
    pub year_built: Option<i16>,
    pub wall_material: Option<String>,
    pub roof_material: Option<String>,
    pub house_type: Option<String>,
    pub heating: Option<String>,
    #[serde(default)]
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommercialDetails {
    pub property_type: Option<String>,
    pub total_area: Option<f64>,
    pub floor_number: Option<i16>,
    pub building_floors: Option<i16>,
    pub commercial_repair: Option<String>,
    pub price_per_square_meter: Option<f64>,
    pub commercial_building_location: Option<String>,
    pub commercial_rent_type: Option<String>,
    #[serde(default)]
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDetails {
    pub total_area: Option<f64>,
    pub rooms_amount: Option<i16>,
    pub suggested_rooms_amount: Option<i16>,
    pub floor_number: Option<i16>,
    pub building_floors: Option<i16>,
    pub room_type: Option<String>,
    pub condition: Option<String>,
    #[serde(default)]
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GarageAndParkingDetails {
    pub property_type: Option<String>,
    pub total_area: Option<f64>,
    pub parking_places_amount: Option<i16>,
    pub parking_type: Option<String>,
    pub heating: Option<String>,
    #[serde(default)]
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlotDetails {
    pub plot_area: Option<f64>,
    pub property_rights: Option<String>,
    pub in_gardening_community: Option<bool>,
    pub electricity: Option<String>,
    pub water: Option<String>,
    pub gaz: Option<String>,
    pub sewage: Option<String>,
    #[serde(default)]
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBuildingDetails {
    pub builder: Option<String>,
    pub deadline: Option<String>,
    pub wall_material: Option<String>,
    pub ceiling_height: Option<String>,
    pub with_finishing: Option<bool>,
    pub share_participation: Option<bool>,
    #[serde(default)]
    pub parameters: JsonValue,
}

/// Category-specific payload. `None` covers listings whose category has no detail schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "details_type", content = "details", rename_all = "snake_case")]
pub enum ListingDetails {
    Apartment(ApartmentDetails),
    House(HouseDetails),
    Commercial(CommercialDetails),
    Room(RoomDetails),
    GarageAndParking(GarageAndParkingDetails),
    Plot(PlotDetails),
    NewBuilding(NewBuildingDetails),
    #[default]
    None,
}

/// One sighting of an ad as delivered by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Provisional id; the durable id is assigned by the merge.
    pub id: Uuid,
    pub source: String,
    pub source_ad_id: i64,
    pub category: Category,
    pub deal_type: DealType,
    pub status: ListingStatus,
    pub latitude: f64,
    pub longitude: f64,
    pub ad_link: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    pub city_or_district: Option<String>,
    pub region: Option<String>,
    pub currency: Option<String>,
    pub price_byn: Option<f64>,
    pub price_usd: Option<f64>,
    pub price_eur: Option<f64>,
    pub images: Vec<String>,
    pub is_agency: bool,
    pub seller_name: Option<String>,
    pub list_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub details: ListingDetails,
}

impl Listing {
    pub fn key(&self) -> ListingKey {
        ListingKey::new(self.source.clone(), self.source_ad_id)
    }

    pub fn group(&self, master_id: Uuid) -> GroupKey {
        GroupKey::new(master_id, self.source.clone(), self.deal_type)
    }

    pub fn is_archived(&self) -> bool {
        self.status == ListingStatus::Archived
    }
}

/// A batch of listings delivered for one orchestration task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingBatch {
    pub task_id: Uuid,
    pub trace_id: Option<String>,
    pub listings: Vec<Listing>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchStats {
    pub created: u64,
    pub updated: u64,
    pub archived: u64,
}

impl BatchStats {
    pub fn total(&self) -> u64 {
        self.created + self.updated + self.archived
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Display row used by list views and representative picking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub id: Uuid,
    pub master_object_id: Uuid,
    pub source: String,
    pub source_ad_id: i64,
    pub category: Category,
    pub deal_type: DealType,
    pub status: ListingStatus,
    pub is_source_duplicate: bool,
    pub title: Option<String>,
    pub ad_link: Option<String>,
    pub address: Option<String>,
    pub currency: Option<String>,
    pub price_byn: Option<f64>,
    pub price_usd: Option<f64>,
    pub price_eur: Option<f64>,
    pub images: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedOffer {
    pub id: Uuid,
    pub source: String,
    pub ad_link: Option<String>,
    pub deal_type: DealType,
    pub is_source_duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingView {
    pub summary: ListingSummary,
    pub description: Option<String>,
    pub city_or_district: Option<String>,
    pub region: Option<String>,
    pub is_agency: bool,
    pub seller_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub details: ListingDetails,
    pub related_offers: Vec<RelatedOffer>,
}
