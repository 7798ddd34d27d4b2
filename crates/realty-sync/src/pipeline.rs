use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use realty_core::{BatchStats, GroupKey, IncomingBatch, Listing, ListingKey};
use realty_storage::{
    ListingStore, ResolvedListing, RetryDisposition, RoutedDetails, StoreError, StoreSession,
};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::champion::ChampionResolver;
use crate::fingerprint::Fingerprinter;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("merge returned no row for listing {0}")]
    MissingMergeResult(ListingKey),
    #[error("no master resolved for canonical hash {0}")]
    MissingMaster(String),
    #[error("batch timed out after {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Store(err) => err.disposition(),
            Self::Timeout(_) => RetryDisposition::Retryable,
            Self::MissingMergeResult(_) | Self::MissingMaster(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Listings of one batch split by intent. Upserts are unique by key.
#[derive(Debug, Default)]
pub struct SplitBatch<'a> {
    pub archive: Vec<ListingKey>,
    pub upsert: Vec<&'a Listing>,
}

/// Archived keys keep their first occurrence. For repeated active keys the
/// last sighting's data is kept at the first sighting's position.
pub fn split_batch(listings: &[Listing]) -> SplitBatch<'_> {
    let mut split = SplitBatch::default();
    let mut archive_seen = HashSet::new();
    let mut upsert_slot: HashMap<ListingKey, usize> = HashMap::new();

    for listing in listings {
        let key = listing.key();
        if listing.is_archived() {
            if archive_seen.insert(key.clone()) {
                split.archive.push(key);
            }
            continue;
        }
        match upsert_slot.get(&key) {
            Some(&slot) => split.upsert[slot] = listing,
            None => {
                upsert_slot.insert(key, split.upsert.len());
                split.upsert.push(listing);
            }
        }
    }
    split
}

pub struct BatchPipeline {
    store: Arc<dyn ListingStore>,
    fingerprinter: Fingerprinter,
}

impl BatchPipeline {
    pub fn new(store: Arc<dyn ListingStore>, fingerprinter: Fingerprinter) -> Self {
        Self {
            store,
            fingerprinter,
        }
    }

    /// Applies one batch in a single store transaction: archives and
    /// successions first, then the upserts.
    pub async fn process(&self, batch: &IncomingBatch) -> Result<BatchStats, PipelineError> {
        let span = info_span!(
            "batch",
            task_id = %batch.task_id,
            trace_id = batch.trace_id.as_deref().unwrap_or(""),
            size = batch.listings.len(),
        );
        self.process_in_span(batch).instrument(span).await
    }

    async fn process_in_span(&self, batch: &IncomingBatch) -> Result<BatchStats, PipelineError> {
        let split = split_batch(&batch.listings);
        let mut stats = BatchStats::default();
        let mut session = self.store.begin().await?;

        if !split.archive.is_empty() {
            stats.archived = archive_and_reelect(session.as_mut(), &split.archive).await?;
        }
        if !split.upsert.is_empty() {
            let (created, updated) = self.upsert(session.as_mut(), &split.upsert).await?;
            stats.created = created;
            stats.updated = updated;
        }

        session.commit().await?;
        info!(
            created = stats.created,
            updated = stats.updated,
            archived = stats.archived,
            "batch committed"
        );
        Ok(stats)
    }

    async fn upsert(
        &self,
        session: &mut dyn StoreSession,
        listings: &[&Listing],
    ) -> Result<(u64, u64), PipelineError> {
        let hashes: Vec<String> = listings
            .iter()
            .map(|l| self.fingerprinter.canonical_hash(l))
            .collect();
        let masters = session.ensure_masters(&hashes).await?;
        let master_ids = hashes
            .iter()
            .map(|hash| {
                masters
                    .get(hash)
                    .copied()
                    .ok_or_else(|| PipelineError::MissingMaster(hash.clone()))
            })
            .collect::<Result<Vec<Uuid>, _>>()?;
        debug!(listings = listings.len(), masters = masters.len(), "masters resolved");

        let keys: Vec<ListingKey> = listings.iter().map(|l| l.key()).collect();
        let groups: Vec<GroupKey> = listings
            .iter()
            .zip(&master_ids)
            .map(|(l, master)| l.group(*master))
            .collect();

        let mut involved = master_ids.clone();
        involved.sort();
        involved.dedup();
        let champions = session.load_champions(&involved, &keys).await?;
        let mut resolver = ChampionResolver::new(champions);

        let resolved: Vec<ResolvedListing<'_>> = listings
            .iter()
            .zip(&master_ids)
            .zip(keys.iter().zip(&groups))
            .map(|((listing, master), (key, group))| ResolvedListing {
                listing: *listing,
                master_id: *master,
                is_source_duplicate: resolver.resolve(group, key),
            })
            .collect();
        let vacated = resolver.vacated_groups(keys.iter().zip(&groups));

        let outcomes = session.merge_listings(&resolved).await?;
        let created = outcomes.iter().filter(|o| o.inserted).count() as u64;
        let updated = outcomes.len() as u64 - created;
        let ids: HashMap<&ListingKey, Uuid> = outcomes.iter().map(|o| (&o.key, o.id)).collect();

        let mut pairs = Vec::with_capacity(listings.len());
        for (key, listing) in keys.iter().zip(listings) {
            let id = ids
                .get(key)
                .copied()
                .ok_or_else(|| PipelineError::MissingMergeResult(key.clone()))?;
            pairs.push((id, &listing.details));
        }
        let routed = RoutedDetails::route(pairs);
        debug!(
            routed = routed.routed_len(),
            unrouted = routed.unrouted.len(),
            "details routed"
        );
        if !routed.unrouted.is_empty() {
            warn!(
                count = routed.unrouted.len(),
                "listings without a recognized detail schema stored with empty details"
            );
        }
        for (table, rows) in routed.per_table() {
            debug!(table = table.table_name(), rows, "merging details");
        }
        session.merge_details(&routed).await?;

        if !vacated.is_empty() {
            let promoted = session.reelect_champions(&vacated).await?;
            info!(
                vacated = vacated.len(),
                promoted = promoted.len(),
                "re-elected groups left by moved champions"
            );
        }

        Ok((created, updated))
    }
}

/// Archives `keys` and re-elects every group that lost its champion.
/// Returns the number of listings actually archived.
pub async fn archive_and_reelect(
    session: &mut dyn StoreSession,
    keys: &[ListingKey],
) -> Result<u64, PipelineError> {
    let archived = session.archive(keys).await?;
    let demoted: Vec<GroupKey> = archived
        .iter()
        .filter(|a| a.was_champion)
        .map(|a| a.group.clone())
        .collect();

    let promoted = if demoted.is_empty() {
        0
    } else {
        session.reelect_champions(&demoted).await?.len()
    };
    info!(
        requested = keys.len(),
        archived = archived.len(),
        demoted = demoted.len(),
        promoted,
        "archive applied"
    );
    Ok(archived.len() as u64)
}
