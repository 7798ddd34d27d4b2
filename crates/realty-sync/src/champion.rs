use std::collections::{HashMap, HashSet};

use realty_core::{GroupKey, ListingKey};
use realty_storage::ChampionRow;

/// Decides champion vs source duplicate for the listings of one batch.
///
/// Seeded with the active champions persisted before the merge; every group
/// a listing is resolved into is claimed, so later listings of the same
/// group in the batch become duplicates.
#[derive(Debug, Default)]
pub struct ChampionResolver {
    persisted: HashMap<GroupKey, ListingKey>,
    placed_in: HashMap<ListingKey, GroupKey>,
    claimed: HashSet<GroupKey>,
}

impl ChampionResolver {
    pub fn new(champions: impl IntoIterator<Item = ChampionRow>) -> Self {
        let mut resolver = Self::default();
        for row in champions {
            resolver.placed_in.insert(row.key.clone(), row.group.clone());
            resolver.persisted.insert(row.group, row.key);
        }
        resolver
    }

    /// Returns `true` when the listing is a source duplicate in `group`.
    pub fn resolve(&mut self, group: &GroupKey, key: &ListingKey) -> bool {
        if let Some(champion) = self.persisted.get(group) {
            self.claimed.insert(group.clone());
            return champion != key;
        }
        !self.claimed.insert(group.clone())
    }

    /// Groups whose persisted champion is being re-written into another group.
    pub fn vacated_groups<'a>(
        &self,
        placements: impl IntoIterator<Item = (&'a ListingKey, &'a GroupKey)>,
    ) -> Vec<GroupKey> {
        let mut vacated: Vec<GroupKey> = placements
            .into_iter()
            .filter_map(|(key, group)| match self.placed_in.get(key) {
                Some(previous) if previous != group => Some(previous.clone()),
                _ => None,
            })
            .collect();
        vacated.sort();
        vacated.dedup();
        vacated
    }
}
