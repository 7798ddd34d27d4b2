//! Durable listing storage for the realty consolidator: store traits, the
//! Postgres and in-memory backends, detail routing and retry classification.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use realty_core::{
    ApartmentDetails, Category, CommercialDetails, GarageAndParkingDetails, GroupKey, HouseDetails,
    Listing, ListingDetails, ListingKey, ListingSummary, ListingView, NewBuildingDetails,
    PlotDetails, RoomDetails,
};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryListingStore;
pub use postgres::PgListingStore;

pub const CRATE_NAME: &str = "realty-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("group {0} would have more than one active champion")]
    ChampionConflict(GroupKey),
    #[error("store session already committed")]
    SessionClosed,
    #[error("malformed stored value in column `{column}`: {value}")]
    Decode { column: &'static str, value: String },
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Database(err) => classify_sqlx_error(err),
            Self::ChampionConflict(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Unique violations, serialization failures and deadlocks all come from
/// overlapping batches and succeed once the other transaction has committed.
pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") | Some("40001") | Some("40P01") => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// A listing flipped to archived, with the group it occupied at the time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedListing {
    pub key: ListingKey,
    pub group: GroupKey,
    pub was_champion: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChampionRow {
    pub group: GroupKey,
    pub key: ListingKey,
}

/// A listing ready to be merged, with its master and champion flag decided.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedListing<'a> {
    pub listing: &'a Listing,
    pub master_id: Uuid,
    pub is_source_duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub key: ListingKey,
    pub id: Uuid,
    pub inserted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetailTable {
    Apartments,
    Houses,
    Commercial,
    Rooms,
    GaragesAndParkings,
    Plots,
    NewBuildings,
}

impl DetailTable {
    pub fn for_details(details: &ListingDetails) -> Option<Self> {
        match details {
            ListingDetails::Apartment(_) => Some(Self::Apartments),
            ListingDetails::House(_) => Some(Self::Houses),
            ListingDetails::Commercial(_) => Some(Self::Commercial),
            ListingDetails::Room(_) => Some(Self::Rooms),
            ListingDetails::GarageAndParking(_) => Some(Self::GaragesAndParkings),
            ListingDetails::Plot(_) => Some(Self::Plots),
            ListingDetails::NewBuilding(_) => Some(Self::NewBuildings),
            ListingDetails::None => None,
        }
    }

    pub fn for_category(category: &Category) -> Option<Self> {
        match category {
            Category::Apartment => Some(Self::Apartments),
            Category::House => Some(Self::Houses),
            Category::Commercial => Some(Self::Commercial),
            Category::Room => Some(Self::Rooms),
            Category::GarageAndParking => Some(Self::GaragesAndParkings),
            Category::Plot => Some(Self::Plots),
            Category::NewBuilding => Some(Self::NewBuildings),
            Category::Other(_) => None,
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Apartments => "apartments",
            Self::Houses => "houses",
            Self::Commercial => "commercial",
            Self::Rooms => "rooms",
            Self::GaragesAndParkings => "garages_and_parkings",
            Self::Plots => "plots",
            Self::NewBuildings => "new_buildings",
        }
    }
}

/// Detail payloads split per destination table, keyed by durable listing id.
#[derive(Debug, Clone, Default)]
pub struct RoutedDetails {
    pub apartments: Vec<(Uuid, ApartmentDetails)>,
    pub houses: Vec<(Uuid, HouseDetails)>,
    pub commercial: Vec<(Uuid, CommercialDetails)>,
    pub rooms: Vec<(Uuid, RoomDetails)>,
    pub garages_and_parkings: Vec<(Uuid, GarageAndParkingDetails)>,
    pub plots: Vec<(Uuid, PlotDetails)>,
    pub new_buildings: Vec<(Uuid, NewBuildingDetails)>,
    /// Listings that carried no recognized detail payload.
    pub unrouted: Vec<Uuid>,
}

impl RoutedDetails {
    pub fn route<'a>(pairs: impl IntoIterator<Item = (Uuid, &'a ListingDetails)>) -> Self {
        let mut routed = Self::default();
        for (id, details) in pairs {
            match details {
                ListingDetails::Apartment(d) => routed.apartments.push((id, d.clone())),
                ListingDetails::House(d) => routed.houses.push((id, d.clone())),
                ListingDetails::Commercial(d) => routed.commercial.push((id, d.clone())),
                ListingDetails::Room(d) => routed.rooms.push((id, d.clone())),
                ListingDetails::GarageAndParking(d) => {
                    routed.garages_and_parkings.push((id, d.clone()))
                }
                ListingDetails::Plot(d) => routed.plots.push((id, d.clone())),
                ListingDetails::NewBuilding(d) => routed.new_buildings.push((id, d.clone())),
                ListingDetails::None => routed.unrouted.push(id),
            }
        }
        routed
    }

    pub fn routed_len(&self) -> usize {
        self.apartments.len()
            + self.houses.len()
            + self.commercial.len()
            + self.rooms.len()
            + self.garages_and_parkings.len()
            + self.plots.len()
            + self.new_buildings.len()
    }

    pub fn per_table(&self) -> Vec<(DetailTable, usize)> {
        [
            (DetailTable::Apartments, self.apartments.len()),
            (DetailTable::Houses, self.houses.len()),
            (DetailTable::Commercial, self.commercial.len()),
            (DetailTable::Rooms, self.rooms.len()),
            (DetailTable::GaragesAndParkings, self.garages_and_parkings.len()),
            (DetailTable::Plots, self.plots.len()),
            (DetailTable::NewBuildings, self.new_buildings.len()),
        ]
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .collect()
    }
}

/// One transactional unit of work. Dropping a session without `commit`
/// discards every write made through it.
#[async_trait]
pub trait StoreSession: Send {
    /// Archives the active listings among `keys`; keys that are unknown or
    /// already archived are skipped.
    async fn archive(&mut self, keys: &[ListingKey]) -> Result<Vec<ArchivedListing>, StoreError>;

    /// Promotes the most recently updated active duplicate in each group that
    /// currently has no champion. Returns the promoted listings.
    async fn reelect_champions(
        &mut self,
        groups: &[GroupKey],
    ) -> Result<Vec<ListingKey>, StoreError>;

    /// Returns a master id for every hash, creating missing masters.
    async fn ensure_masters(
        &mut self,
        hashes: &[String],
    ) -> Result<HashMap<String, Uuid>, StoreError>;

    /// Active champions belonging to any of `master_ids` or identified by `keys`.
    async fn load_champions(
        &mut self,
        master_ids: &[Uuid],
        keys: &[ListingKey],
    ) -> Result<Vec<ChampionRow>, StoreError>;

    async fn merge_listings(
        &mut self,
        rows: &[ResolvedListing<'_>],
    ) -> Result<Vec<MergeOutcome>, StoreError>;

    async fn merge_details(&mut self, routed: &RoutedDetails) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError>;

    /// Best current listing per master: active first, then champion, then
    /// most recently updated. Masters without listings are omitted.
    async fn best_by_masters(
        &self,
        master_ids: &[Uuid],
    ) -> Result<Vec<ListingSummary>, StoreError>;

    async fn listing_view(&self, id: Uuid) -> Result<Option<ListingView>, StoreError>;
}
