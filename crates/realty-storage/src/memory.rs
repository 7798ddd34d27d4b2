//! In-process store with the same transactional contract as the Postgres
//! backend. A session holds the store lock until it commits or is dropped.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use realty_core::{
    GroupKey, Listing, ListingDetails, ListingKey, ListingStatus, ListingSummary, ListingView,
    RelatedOffer,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    ArchivedListing, ChampionRow, DetailTable, ListingStore, MergeOutcome, ResolvedListing, RoutedDetails,
    StoreError, StoreSession,
};

/// A persisted general row. `listing.details` is always empty here; detail
/// payloads live in their own map keyed by listing id.
#[derive(Debug, Clone)]
pub struct StoredListing {
    pub listing: Listing,
    pub master_object_id: Uuid,
    pub is_source_duplicate: bool,
}

impl StoredListing {
    pub fn group(&self) -> GroupKey {
        self.listing.group(self.master_object_id)
    }

    pub fn is_active_champion(&self) -> bool {
        self.listing.status == ListingStatus::Active && !self.is_source_duplicate
    }

    fn summary(&self) -> ListingSummary {
        let l = &self.listing;
        ListingSummary {
            id: l.id,
            master_object_id: self.master_object_id,
            source: l.source.clone(),
            source_ad_id: l.source_ad_id,
            category: l.category.clone(),
            deal_type: l.deal_type,
            status: l.status,
            is_source_duplicate: self.is_source_duplicate,
            title: l.title.clone(),
            ad_link: l.ad_link.clone(),
            address: l.address.clone(),
            currency: l.currency.clone(),
            price_byn: l.price_byn,
            price_usd: l.price_usd,
            price_eur: l.price_eur,
            images: l.images.clone(),
            updated_at: l.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    masters: HashMap<String, Uuid>,
    listings: BTreeMap<ListingKey, StoredListing>,
    details: HashMap<Uuid, ListingDetails>,
}

impl MemoryState {
    fn check_champions(&self) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        for row in self.listings.values().filter(|r| r.is_active_champion()) {
            let group = row.group();
            if !seen.insert(group.clone()) {
                return Err(StoreError::ChampionConflict(group));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryListingStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<StoredListing> {
        self.state.lock().await.listings.values().cloned().collect()
    }

    pub async fn row(&self, key: &ListingKey) -> Option<StoredListing> {
        self.state.lock().await.listings.get(key).cloned()
    }

    pub async fn master_count(&self) -> usize {
        self.state.lock().await.masters.len()
    }

    pub async fn details_for(&self, id: Uuid) -> Option<ListingDetails> {
        self.state.lock().await.details.get(&id).cloned()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = (*guard).clone();
        Ok(Box::new(MemorySession {
            guard: Some(guard),
            working,
        }))
    }

    async fn best_by_masters(
        &self,
        master_ids: &[Uuid],
    ) -> Result<Vec<ListingSummary>, StoreError> {
        let state = self.state.lock().await;
        let mut seen = HashSet::new();
        let best = master_ids
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| {
                state
                    .listings
                    .values()
                    .filter(|r| r.master_object_id == *id)
                    .min_by_key(|r| {
                        (
                            r.listing.status != ListingStatus::Active,
                            r.is_source_duplicate,
                            Reverse(r.listing.updated_at),
                            r.listing.id,
                        )
                    })
                    .map(StoredListing::summary)
            })
            .collect();
        Ok(best)
    }

    async fn listing_view(&self, id: Uuid) -> Result<Option<ListingView>, StoreError> {
        let state = self.state.lock().await;
        let Some(row) = state.listings.values().find(|r| r.listing.id == id) else {
            return Ok(None);
        };

        let mut related: Vec<&StoredListing> = state
            .listings
            .values()
            .filter(|r| {
                r.master_object_id == row.master_object_id
                    && r.listing.id != id
                    && r.listing.status == ListingStatus::Active
            })
            .collect();
        related.sort_by_key(|r| (r.is_source_duplicate, Reverse(r.listing.updated_at), r.listing.id));

        // Only the table of the current category is consulted.
        let table = DetailTable::for_category(&row.listing.category);
        let details = state
            .details
            .get(&id)
            .filter(|d| table.is_some() && DetailTable::for_details(d) == table)
            .cloned()
            .unwrap_or_default();

        Ok(Some(ListingView {
            summary: row.summary(),
            description: row.listing.description.clone(),
            city_or_district: row.listing.city_or_district.clone(),
            region: row.listing.region.clone(),
            is_agency: row.listing.is_agency,
            seller_name: row.listing.seller_name.clone(),
            created_at: row.listing.created_at,
            details,
            related_offers: related
                .into_iter()
                .map(|r| RelatedOffer {
                    id: r.listing.id,
                    source: r.listing.source.clone(),
                    ad_link: r.listing.ad_link.clone(),
                    deal_type: r.listing.deal_type,
                    is_source_duplicate: r.is_source_duplicate,
                })
                .collect(),
        }))
    }
}

pub struct MemorySession {
    guard: Option<OwnedMutexGuard<MemoryState>>,
    working: MemoryState,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.guard.is_some() {
            Ok(())
        } else {
            Err(StoreError::SessionClosed)
        }
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn archive(&mut self, keys: &[ListingKey]) -> Result<Vec<ArchivedListing>, StoreError> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut archived = Vec::new();
        for key in keys {
            let Some(row) = self.working.listings.get_mut(key) else {
                continue;
            };
            if row.listing.status == ListingStatus::Archived {
                continue;
            }
            row.listing.status = ListingStatus::Archived;
            row.listing.updated_at = now;
            archived.push(ArchivedListing {
                key: key.clone(),
                group: row.group(),
                was_champion: !row.is_source_duplicate,
            });
        }
        Ok(archived)
    }

    async fn reelect_champions(
        &mut self,
        groups: &[GroupKey],
    ) -> Result<Vec<ListingKey>, StoreError> {
        self.ensure_open()?;
        let now = Utc::now();
        let groups: BTreeSet<&GroupKey> = groups.iter().collect();
        let mut promoted = Vec::new();
        for group in groups {
            let members = || {
                self.working
                    .listings
                    .values()
                    .filter(|r| r.listing.status == ListingStatus::Active && &r.group() == group)
            };
            if members().any(|r| !r.is_source_duplicate) {
                continue;
            }
            let successor = members()
                .min_by_key(|r| (Reverse(r.listing.updated_at), r.listing.id))
                .map(|r| r.listing.key());
            if let Some(key) = successor {
                if let Some(row) = self.working.listings.get_mut(&key) {
                    row.is_source_duplicate = false;
                    row.listing.updated_at = now;
                }
                promoted.push(key);
            }
        }
        self.working.check_champions()?;
        Ok(promoted)
    }

    async fn ensure_masters(
        &mut self,
        hashes: &[String],
    ) -> Result<HashMap<String, Uuid>, StoreError> {
        self.ensure_open()?;
        Ok(hashes
            .iter()
            .map(|hash| {
                let id = *self
                    .working
                    .masters
                    .entry(hash.clone())
                    .or_insert_with(Uuid::new_v4);
                (hash.clone(), id)
            })
            .collect())
    }

    async fn load_champions(
        &mut self,
        master_ids: &[Uuid],
        keys: &[ListingKey],
    ) -> Result<Vec<ChampionRow>, StoreError> {
        self.ensure_open()?;
        let masters: HashSet<&Uuid> = master_ids.iter().collect();
        let keys: HashSet<&ListingKey> = keys.iter().collect();
        Ok(self
            .working
            .listings
            .iter()
            .filter(|(key, row)| {
                row.is_active_champion()
                    && (masters.contains(&row.master_object_id) || keys.contains(key))
            })
            .map(|(key, row)| ChampionRow {
                group: row.group(),
                key: key.clone(),
            })
            .collect())
    }

    async fn merge_listings(
        &mut self,
        rows: &[ResolvedListing<'_>],
    ) -> Result<Vec<MergeOutcome>, StoreError> {
        self.ensure_open()?;
        let mut outcomes = Vec::with_capacity(rows.len());
        for resolved in rows {
            let key = resolved.listing.key();
            let mut incoming = resolved.listing.clone();
            incoming.details = ListingDetails::None;

            let outcome = match self.working.listings.get_mut(&key) {
                Some(existing) => {
                    incoming.id = existing.listing.id;
                    incoming.created_at = existing.listing.created_at;
                    existing.listing = incoming;
                    existing.master_object_id = resolved.master_id;
                    existing.is_source_duplicate = resolved.is_source_duplicate;
                    MergeOutcome {
                        key,
                        id: existing.listing.id,
                        inserted: false,
                    }
                }
                None => {
                    let id = incoming.id;
                    self.working.listings.insert(
                        key.clone(),
                        StoredListing {
                            listing: incoming,
                            master_object_id: resolved.master_id,
                            is_source_duplicate: resolved.is_source_duplicate,
                        },
                    );
                    MergeOutcome {
                        key,
                        id,
                        inserted: true,
                    }
                }
            };
            outcomes.push(outcome);
        }
        self.working.check_champions()?;
        Ok(outcomes)
    }

    async fn merge_details(&mut self, routed: &RoutedDetails) -> Result<(), StoreError> {
        self.ensure_open()?;
        let details = &mut self.working.details;
        for (id, d) in &routed.apartments {
            details.insert(*id, ListingDetails::Apartment(d.clone()));
        }
        for (id, d) in &routed.houses {
            details.insert(*id, ListingDetails::House(d.clone()));
        }
        for (id, d) in &routed.commercial {
            details.insert(*id, ListingDetails::Commercial(d.clone()));
        }
        for (id, d) in &routed.rooms {
            details.insert(*id, ListingDetails::Room(d.clone()));
        }
        for (id, d) in &routed.garages_and_parkings {
            details.insert(*id, ListingDetails::GarageAndParking(d.clone()));
        }
        for (id, d) in &routed.plots {
            details.insert(*id, ListingDetails::Plot(d.clone()));
        }
        for (id, d) in &routed.new_buildings {
            details.insert(*id, ListingDetails::NewBuilding(d.clone()));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut guard = self.guard.take().ok_or(StoreError::SessionClosed)?;
        *guard = std::mem::take(&mut self.working);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};
    use realty_core::{ApartmentDetails, Category, DealType};

    fn ts(offset_minutes: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
            + Duration::minutes(offset_minutes)
    }

    fn listing(source: &str, ad_id: i64, updated_minutes: i64) -> Listing {
        Listing {
            id: Uuid::new_v4(),
            source: source.to_string(),
            source_ad_id: ad_id,
            category: Category::Apartment,
            deal_type: DealType::Sale,
            status: ListingStatus::Active,
            latitude: 53.9,
            longitude: 27.56,
            ad_link: Some(format!("https://{source}.example/{ad_id}")),
            title: None,
            description: None,
            address: None,
            city_or_district: None,
            region: None,
            currency: Some("USD".into()),
            price_byn: None,
            price_usd: Some(80_000.0),
            price_eur: None,
            images: vec![],
            is_agency: false,
            seller_name: None,
            list_time: None,
            created_at: ts(0),
            updated_at: ts(updated_minutes),
            details: ListingDetails::None,
        }
    }

    async fn seed(
        store: &MemoryListingStore,
        master: Uuid,
        rows: &[(&Listing, bool)],
    ) -> Vec<MergeOutcome> {
        let resolved: Vec<ResolvedListing<'_>> = rows
            .iter()
            .map(|(listing, dup)| ResolvedListing {
                listing,
                master_id: master,
                is_source_duplicate: *dup,
            })
            .collect();
        let mut session = store.begin().await.expect("begin");
        let outcomes = session.merge_listings(&resolved).await.expect("merge");
        session.commit().await.expect("commit");
        outcomes
    }

    #[tokio::test]
    async fn ensure_masters_is_idempotent() {
        let store = MemoryListingStore::new();
        let hashes = vec!["a".to_string(), "b".to_string(), "a".to_string()];

        let mut session = store.begin().await.expect("begin");
        let first = session.ensure_masters(&hashes).await.expect("ensure");
        let again = session.ensure_masters(&hashes[..1]).await.expect("ensure");
        session.commit().await.expect("commit");

        assert_eq!(first.len(), 2);
        assert_eq!(first["a"], again["a"]);
        assert_eq!(store.master_count().await, 2);
    }

    #[tokio::test]
    async fn dropped_session_discards_writes() {
        let store = MemoryListingStore::new();
        let a = listing("kufar", 1, 0);
        {
            let mut session = store.begin().await.expect("begin");
            let resolved = [ResolvedListing {
                listing: &a,
                master_id: Uuid::new_v4(),
                is_source_duplicate: false,
            }];
            session.merge_listings(&resolved).await.expect("merge");
        }
        assert!(store.rows().await.is_empty());
    }

    #[tokio::test]
    async fn merge_preserves_identity_and_reports_updates() {
        let store = MemoryListingStore::new();
        let master = Uuid::new_v4();
        let first = listing("kufar", 1, 0);
        let created = seed(&store, master, &[(&first, false)]).await;
        assert!(created[0].inserted);

        let mut resighted = listing("kufar", 1, 5);
        resighted.price_usd = Some(79_000.0);
        let updated = seed(&store, master, &[(&resighted, false)]).await;

        assert!(!updated[0].inserted);
        assert_eq!(updated[0].id, created[0].id);
        let row = store.row(&first.key()).await.expect("row");
        assert_eq!(row.listing.price_usd, Some(79_000.0));
        assert_eq!(row.listing.created_at, first.created_at);
    }

    #[tokio::test]
    async fn second_champion_in_group_is_rejected() {
        let store = MemoryListingStore::new();
        let master = Uuid::new_v4();
        let a = listing("kufar", 1, 0);
        let b = listing("kufar", 2, 0);
        seed(&store, master, &[(&a, false)]).await;

        let mut session = store.begin().await.expect("begin");
        let err = session
            .merge_listings(&[ResolvedListing {
                listing: &b,
                master_id: master,
                is_source_duplicate: false,
            }])
            .await
            .expect_err("conflict");
        assert!(matches!(err, StoreError::ChampionConflict(_)));
    }

    #[tokio::test]
    async fn reelection_promotes_latest_active_duplicate() {
        let store = MemoryListingStore::new();
        let master = Uuid::new_v4();
        let champion = listing("kufar", 1, 0);
        let older = listing("kufar", 2, 10);
        let newer = listing("kufar", 3, 20);
        seed(
            &store,
            master,
            &[(&champion, false), (&older, true), (&newer, true)],
        )
        .await;

        let mut session = store.begin().await.expect("begin");
        let archived = session.archive(&[champion.key()]).await.expect("archive");
        assert_eq!(archived.len(), 1);
        assert!(archived[0].was_champion);
        let promoted = session
            .reelect_champions(&[archived[0].group.clone()])
            .await
            .expect("reelect");
        session.commit().await.expect("commit");

        assert_eq!(promoted, vec![newer.key()]);
        let champions: Vec<_> = store
            .rows()
            .await
            .into_iter()
            .filter(|r| r.is_active_champion())
            .map(|r| r.listing.key())
            .collect();
        assert_eq!(champions, vec![newer.key()]);
    }

    #[tokio::test]
    async fn archiving_twice_reports_once() {
        let store = MemoryListingStore::new();
        let a = listing("kufar", 1, 0);
        seed(&store, Uuid::new_v4(), &[(&a, false)]).await;

        let mut session = store.begin().await.expect("begin");
        let first = session.archive(&[a.key(), a.key()]).await.expect("archive");
        let unknown = session
            .archive(&[ListingKey::new("kufar", 999)])
            .await
            .expect("archive");
        session.commit().await.expect("commit");

        assert_eq!(first.len(), 1);
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn best_by_masters_prefers_active_champion() {
        let store = MemoryListingStore::new();
        let master = Uuid::new_v4();
        let champion = listing("kufar", 1, 0);
        let duplicate = listing("kufar", 2, 30);
        seed(&store, master, &[(&champion, false), (&duplicate, true)]).await;

        let outcome_id = store.row(&champion.key()).await.expect("row").listing.id;
        let apartment = ListingDetails::Apartment(ApartmentDetails {
            rooms_amount: Some(3),
            ..Default::default()
        });
        let mut session = store.begin().await.expect("begin");
        session
            .merge_details(&RoutedDetails::route([(outcome_id, &apartment)]))
            .await
            .expect("details");
        session.commit().await.expect("commit");

        let best = store
            .best_by_masters(&[master, Uuid::new_v4(), master])
            .await
            .expect("best");
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].source_ad_id, 1);

        let view = store
            .listing_view(outcome_id)
            .await
            .expect("view")
            .expect("present");
        assert_eq!(view.details, apartment);
        assert_eq!(view.related_offers.len(), 1);
        assert!(view.related_offers[0].is_source_duplicate);
    }
    #[tokio::test]
    async fn listing_view_ignores_details_left_by_a_previous_category() {
        let store = MemoryListingStore::new();
        let master = Uuid::new_v4();
        let flat = listing("kufar", 1, 0);
        let id = seed(&store, master, &[(&flat, false)]).await[0].id;

        let apartment = ListingDetails::Apartment(ApartmentDetails {
            rooms_amount: Some(2),
            ..Default::default()
        });
        let mut session = store.begin().await.expect("begin");
        session
            .merge_details(&RoutedDetails::route([(id, &apartment)]))
            .await
            .expect("details");
        session.commit().await.expect("commit");

        let mut hostel = flat.clone();
        hostel.category = Category::Other("hostel".into());
        seed(&store, master, &[(&hostel, false)]).await;

        let view = store.listing_view(id).await.expect("view").expect("present");
        assert_eq!(view.details, ListingDetails::None);
        assert_eq!(store.details_for(id).await, Some(apartment));
    }
}
