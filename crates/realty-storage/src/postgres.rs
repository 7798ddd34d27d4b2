use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use realty_core::{
    ApartmentDetails, Category, CommercialDetails, GarageAndParkingDetails, GroupKey,
    HouseDetails, ListingDetails, ListingKey, ListingSummary, ListingView, NewBuildingDetails,
    PlotDetails, RelatedOffer, RoomDetails,
};
use serde_json::{json, Map, Value as JsonValue};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::{
    ArchivedListing, ChampionRow, DetailTable, ListingStore, MergeOutcome, ResolvedListing,
    RoutedDetails, StoreError, StoreSession,
};

/// Column name and Postgres array element type, in staging bind order.
const LISTING_COLUMNS: &[(&str, &str)] = &[
    ("id", "uuid"),
    ("source", "text"),
    ("source_ad_id", "int8"),
    ("master_object_id", "uuid"),
    ("is_source_duplicate", "bool"),
    ("status", "text"),
    ("category", "text"),
    ("deal_type", "text"),
    ("ad_link", "text"),
    ("title", "text"),
    ("description", "text"),
    ("address", "text"),
    ("city_or_district", "text"),
    ("region", "text"),
    ("currency", "text"),
    ("price_byn", "float8"),
    ("price_usd", "float8"),
    ("price_eur", "float8"),
    ("images", "jsonb"),
    ("is_agency", "bool"),
    ("seller_name", "text"),
    ("list_time", "timestamptz"),
    ("latitude", "float8"),
    ("longitude", "float8"),
    ("created_at", "timestamptz"),
    ("updated_at", "timestamptz"),
];

/// Never overwritten when an existing row is merged.
const IMMUTABLE_COLUMNS: &[&str] = &["id", "source", "source_ad_id", "created_at"];

const SUMMARY_COLUMNS: &str = "id, master_object_id, source, source_ad_id, category, deal_type, \
     status, is_source_duplicate, title, ad_link, address, currency, price_byn, price_usd, \
     price_eur, images, updated_at";

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch_details(
        &self,
        category: &Category,
        listing_id: Uuid,
    ) -> Result<ListingDetails, StoreError> {
        let Some(table) = DetailTable::for_category(category) else {
            return Ok(ListingDetails::None);
        };
        let sql = format!(
            "SELECT to_jsonb(t) AS body FROM {} t WHERE listing_id = $1",
            table.table_name()
        );
        let Some(row) = sqlx::query(&sql)
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(ListingDetails::None);
        };

        let body: JsonValue = row.try_get("body")?;
        let tagged = json!({
            "details_type": category.as_str(),
            "details": camelize_keys(body),
        });
        serde_json::from_value(tagged).map_err(|err| StoreError::Decode {
            column: "details",
            value: err.to_string(),
        })
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession {
            tx: Some(tx),
            staged_table_ready: false,
        }))
    }

    async fn best_by_masters(
        &self,
        master_ids: &[Uuid],
    ) -> Result<Vec<ListingSummary>, StoreError> {
        if master_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM (
                SELECT {SUMMARY_COLUMNS},
                    ROW_NUMBER() OVER (
                        PARTITION BY master_object_id
                        ORDER BY (status = 'active') DESC, is_source_duplicate ASC, updated_at DESC, id
                    ) AS rn
                FROM listings
                WHERE master_object_id = ANY($1)
            ) ranked
            WHERE rn = 1"
        );
        let rows = sqlx::query(&sql)
            .bind(master_ids.to_vec())
            .fetch_all(&self.pool)
            .await?;

        let mut best = rows
            .iter()
            .map(summary_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let position: HashMap<Uuid, usize> = master_ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (*id, idx))
            .rev()
            .collect();
        best.sort_by_key(|s| position.get(&s.master_object_id).copied());
        Ok(best)
    }

    async fn listing_view(&self, id: Uuid) -> Result<Option<ListingView>, StoreError> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS}, description, city_or_district, region, is_agency, \
             seller_name, created_at FROM listings WHERE id = $1"
        );
        let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let summary = summary_from_row(&row)?;

        let details = self.fetch_details(&summary.category, id).await?;

        let related = sqlx::query(
            "SELECT id, source, ad_link, deal_type, is_source_duplicate
             FROM listings
             WHERE master_object_id = $1 AND id <> $2 AND status = 'active'
             ORDER BY is_source_duplicate ASC, updated_at DESC, id",
        )
        .bind(summary.master_object_id)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let related_offers = related
            .iter()
            .map(|r| {
                let deal_type: String = r.try_get("deal_type")?;
                Ok(RelatedOffer {
                    id: r.try_get("id")?,
                    source: r.try_get("source")?,
                    ad_link: r.try_get("ad_link")?,
                    deal_type: parse_column("deal_type", &deal_type)?,
                    is_source_duplicate: r.try_get("is_source_duplicate")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Some(ListingView {
            description: row.try_get("description")?,
            city_or_district: row.try_get("city_or_district")?,
            region: row.try_get("region")?,
            is_agency: row.try_get("is_agency")?,
            seller_name: row.try_get("seller_name")?,
            created_at: row.try_get("created_at")?,
            summary,
            details,
            related_offers,
        }))
    }
}

pub struct PgSession {
    tx: Option<Transaction<'static, Postgres>>,
    staged_table_ready: bool,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.tx.as_deref_mut().ok_or(StoreError::SessionClosed)
    }

    async fn stage(&mut self, rows: &[ResolvedListing<'_>]) -> Result<(), StoreError> {
        let ready = self.staged_table_ready;
        let conn = self.conn()?;
        if ready {
            sqlx::query("TRUNCATE staged_listings")
                .execute(&mut *conn)
                .await?;
        } else {
            sqlx::query(
                "CREATE TEMP TABLE IF NOT EXISTS staged_listings
                 (LIKE listings INCLUDING DEFAULTS) ON COMMIT DROP",
            )
            .execute(&mut *conn)
            .await?;
        }

        let names = column_names(LISTING_COLUMNS);
        let types: Vec<&str> = LISTING_COLUMNS.iter().map(|(_, ty)| *ty).collect();
        let sql = format!(
            "INSERT INTO staged_listings ({}) {}",
            names.join(", "),
            unnest_select(&types)
        );

        sqlx::query(&sql)
            .bind(col(rows, |r| r.listing.id))
            .bind(col(rows, |r| r.listing.source.clone()))
            .bind(col(rows, |r| r.listing.source_ad_id))
            .bind(col(rows, |r| r.master_id))
            .bind(col(rows, |r| r.is_source_duplicate))
            .bind(col(rows, |r| r.listing.status.as_str().to_string()))
            .bind(col(rows, |r| r.listing.category.as_str().to_string()))
            .bind(col(rows, |r| r.listing.deal_type.as_str().to_string()))
            .bind(col(rows, |r| r.listing.ad_link.clone()))
            .bind(col(rows, |r| r.listing.title.clone()))
            .bind(col(rows, |r| r.listing.description.clone()))
            .bind(col(rows, |r| r.listing.address.clone()))
            .bind(col(rows, |r| r.listing.city_or_district.clone()))
            .bind(col(rows, |r| r.listing.region.clone()))
            .bind(col(rows, |r| r.listing.currency.clone()))
            .bind(col(rows, |r| r.listing.price_byn))
            .bind(col(rows, |r| r.listing.price_usd))
            .bind(col(rows, |r| r.listing.price_eur))
            .bind(col(rows, |r| json!(r.listing.images)))
            .bind(col(rows, |r| r.listing.is_agency))
            .bind(col(rows, |r| r.listing.seller_name.clone()))
            .bind(col(rows, |r| r.listing.list_time))
            .bind(col(rows, |r| r.listing.latitude))
            .bind(col(rows, |r| r.listing.longitude))
            .bind(col(rows, |r| r.listing.created_at))
            .bind(col(rows, |r| r.listing.updated_at))
            .execute(&mut *conn)
            .await?;

        self.staged_table_ready = true;
        Ok(())
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn archive(&mut self, keys: &[ListingKey]) -> Result<Vec<ArchivedListing>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let rows = sqlx::query(
            "UPDATE listings l
             SET status = 'archived', updated_at = NOW()
             FROM UNNEST($1::text[], $2::int8[]) AS k(source, source_ad_id)
             WHERE l.source = k.source
               AND l.source_ad_id = k.source_ad_id
               AND l.status <> 'archived'
             RETURNING l.source, l.source_ad_id, l.master_object_id, l.deal_type, l.is_source_duplicate",
        )
        .bind(col(keys, |k| k.source.clone()))
        .bind(col(keys, |k| k.source_ad_id))
        .fetch_all(&mut *conn)
        .await?;

        let archived = rows
            .iter()
            .map(|row| {
                let key = ListingKey::new(
                    row.try_get::<String, _>("source")?,
                    row.try_get::<i64, _>("source_ad_id")?,
                );
                let deal_type: String = row.try_get("deal_type")?;
                let is_duplicate: bool = row.try_get("is_source_duplicate")?;
                Ok(ArchivedListing {
                    group: GroupKey::new(
                        row.try_get("master_object_id")?,
                        key.source.clone(),
                        parse_column("deal_type", &deal_type)?,
                    ),
                    key,
                    was_champion: !is_duplicate,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        debug!(requested = keys.len(), archived = archived.len(), "archived listings");
        Ok(archived)
    }

    async fn reelect_champions(
        &mut self,
        groups: &[GroupKey],
    ) -> Result<Vec<ListingKey>, StoreError> {
        let groups: BTreeSet<&GroupKey> = groups.iter().collect();
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let groups: Vec<&GroupKey> = groups.into_iter().collect();
        let conn = self.conn()?;
        let rows = sqlx::query(
            "WITH vacant AS (
                 SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::text[])
                     AS g(master_object_id, source, deal_type)
             ),
             candidates AS (
                 SELECT l.id,
                        ROW_NUMBER() OVER (
                            PARTITION BY l.master_object_id, l.source, l.deal_type
                            ORDER BY l.updated_at DESC, l.id
                        ) AS rn
                 FROM listings l
                 JOIN vacant g
                   ON l.master_object_id = g.master_object_id
                  AND l.source = g.source
                  AND l.deal_type = g.deal_type
                 WHERE l.status = 'active'
                   AND l.is_source_duplicate
                   AND NOT EXISTS (
                       SELECT 1 FROM listings c
                       WHERE c.master_object_id = l.master_object_id
                         AND c.source = l.source
                         AND c.deal_type = l.deal_type
                         AND c.status = 'active'
                         AND NOT c.is_source_duplicate
                   )
             )
             UPDATE listings l
             SET is_source_duplicate = FALSE, updated_at = NOW()
             FROM candidates c
             WHERE l.id = c.id AND c.rn = 1
             RETURNING l.source, l.source_ad_id",
        )
        .bind(col(&groups, |g| g.master_id))
        .bind(col(&groups, |g| g.source.clone()))
        .bind(col(&groups, |g| g.deal_type.as_str().to_string()))
        .fetch_all(&mut *conn)
        .await?;

        let promoted = rows
            .iter()
            .map(|row| {
                Ok(ListingKey::new(
                    row.try_get::<String, _>("source")?,
                    row.try_get::<i64, _>("source_ad_id")?,
                ))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        debug!(groups = groups.len(), promoted = promoted.len(), "re-elected champions");
        Ok(promoted)
    }

    async fn ensure_masters(
        &mut self,
        hashes: &[String],
    ) -> Result<HashMap<String, Uuid>, StoreError> {
        let unique: BTreeSet<&String> = hashes.iter().collect();
        if unique.is_empty() {
            return Ok(HashMap::new());
        }
        let unique: Vec<String> = unique.into_iter().cloned().collect();
        let conn = self.conn()?;

        // Pre-existing rows come back from neither ON CONFLICT branch, so re-read.
        sqlx::query(
            "INSERT INTO master_objects (canonical_hash)
             SELECT unnest($1::text[])
             ON CONFLICT (canonical_hash) DO NOTHING",
        )
        .bind(&unique)
        .execute(&mut *conn)
        .await?;

        let rows = sqlx::query(
            "SELECT canonical_hash, id FROM master_objects WHERE canonical_hash = ANY($1)",
        )
        .bind(&unique)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| -> Result<(String, Uuid), StoreError> {
                Ok((row.try_get("canonical_hash")?, row.try_get("id")?))
            })
            .collect()
    }

    async fn load_champions(
        &mut self,
        master_ids: &[Uuid],
        keys: &[ListingKey],
    ) -> Result<Vec<ChampionRow>, StoreError> {
        if master_ids.is_empty() && keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let rows = sqlx::query(
            "SELECT l.master_object_id, l.source, l.source_ad_id, l.deal_type
             FROM listings l
             WHERE l.status = 'active'
               AND NOT l.is_source_duplicate
               AND (
                   l.master_object_id = ANY($1)
                   OR (l.source, l.source_ad_id) IN (
                       SELECT * FROM UNNEST($2::text[], $3::int8[])
                   )
               )",
        )
        .bind(master_ids.to_vec())
        .bind(col(keys, |k| k.source.clone()))
        .bind(col(keys, |k| k.source_ad_id))
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| {
                let key = ListingKey::new(
                    row.try_get::<String, _>("source")?,
                    row.try_get::<i64, _>("source_ad_id")?,
                );
                let deal_type: String = row.try_get("deal_type")?;
                Ok(ChampionRow {
                    group: GroupKey::new(
                        row.try_get("master_object_id")?,
                        key.source.clone(),
                        parse_column("deal_type", &deal_type)?,
                    ),
                    key,
                })
            })
            .collect()
    }

    async fn merge_listings(
        &mut self,
        rows: &[ResolvedListing<'_>],
    ) -> Result<Vec<MergeOutcome>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        self.stage(rows).await?;

        let names = column_names(LISTING_COLUMNS);
        let updates = names
            .iter()
            .filter(|name| !IMMUTABLE_COLUMNS.contains(*name))
            .map(|name| format!("{name} = EXCLUDED.{name}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO listings ({cols})
             SELECT {cols} FROM staged_listings
             ON CONFLICT (source, source_ad_id) DO UPDATE SET {updates}
             RETURNING id, source, source_ad_id, (xmax = 0) AS inserted",
            cols = names.join(", "),
        );

        let conn = self.conn()?;
        let merged = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        merged
            .iter()
            .map(|row| {
                Ok(MergeOutcome {
                    key: ListingKey::new(
                        row.try_get::<String, _>("source")?,
                        row.try_get::<i64, _>("source_ad_id")?,
                    ),
                    id: row.try_get("id")?,
                    inserted: row.try_get("inserted")?,
                })
            })
            .collect()
    }

    async fn merge_details(&mut self, routed: &RoutedDetails) -> Result<(), StoreError> {
        let conn = self.conn()?;
        upsert_apartments(&mut *conn, &routed.apartments).await?;
        upsert_houses(&mut *conn, &routed.houses).await?;
        upsert_commercial(&mut *conn, &routed.commercial).await?;
        upsert_rooms(&mut *conn, &routed.rooms).await?;
        upsert_garages(&mut *conn, &routed.garages_and_parkings).await?;
        upsert_plots(&mut *conn, &routed.plots).await?;
        upsert_new_buildings(&mut *conn, &routed.new_buildings).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::SessionClosed)?;
        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_apartments(
    conn: &mut PgConnection,
    rows: &[(Uuid, ApartmentDetails)],
) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }
    let sql = detail_upsert_sql(
        DetailTable::Apartments,
        &[
            ("rooms_amount", "int2"),
            ("floor_number", "int2"),
            ("building_floors", "int2"),
            ("total_area", "float8"),
            ("living_space_area", "float8"),
            ("kitchen_area", "float8"),
            ("year_built", "int2"),
            ("wall_material", "text"),
            ("repair_state", "text"),
            ("bathroom_type", "text"),
            ("balcony_type", "text"),
            ("price_per_square_meter", "float8"),
            ("parameters", "jsonb"),
        ],
    );
    sqlx::query(&sql)
        .bind(col(rows, |(id, _)| *id))
        .bind(col(rows, |(_, d)| d.rooms_amount))
        .bind(col(rows, |(_, d)| d.floor_number))
        .bind(col(rows, |(_, d)| d.building_floors))
        .bind(col(rows, |(_, d)| d.total_area))
        .bind(col(rows, |(_, d)| d.living_space_area))
        .bind(col(rows, |(_, d)| d.kitchen_area))
        .bind(col(rows, |(_, d)| d.year_built))
        .bind(col(rows, |(_, d)| d.wall_material.clone()))
        .bind(col(rows, |(_, d)| d.repair_state.clone()))
        .bind(col(rows, |(_, d)| d.bathroom_type.clone()))
        .bind(col(rows, |(_, d)| d.balcony_type.clone()))
        .bind(col(rows, |(_, d)| d.price_per_square_meter))
        .bind(col(rows, |(_, d)| parameters(&d.parameters)))
        .execute(conn)
        .await?;
    Ok(())
}

async fn upsert_houses(
    conn: &mut PgConnection,
    rows: &[(Uuid, HouseDetails)],
) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }
    let sql = detail_upsert_sql(
        DetailTable::Houses,
        &[
            ("total_area", "float8"),
            ("plot_area", "float8"),
            ("living_space_area", "float8"),
            ("kitchen_area", "float8"),
            ("rooms_amount", "int2"),
            ("building_floors", "int2"),
            ("year_built", "int2"),
            ("wall_material", "text"),
            ("roof_material", "text"),
            ("house_type", "text"),
            ("heating", "text"),
            ("parameters", "jsonb"),
        ],
    );
    sqlx::query(&sql)
        .bind(col(rows, |(id, _)| *id))
        .bind(col(rows, |(_, d)| d.total_area))
        .bind(col(rows, |(_, d)| d.plot_area))
        .bind(col(rows, |(_, d)| d.living_space_area))
        .bind(col(rows, |(_, d)| d.kitchen_area))
        .bind(col(rows, |(_, d)| d.rooms_amount))
        .bind(col(rows, |(_, d)| d.building_floors))
        .bind(col(rows, |(_, d)| d.year_built))
        .bind(col(rows, |(_, d)| d.wall_material.clone()))
        .bind(col(rows, |(_, d)| d.roof_material.clone()))
        .bind(col(rows, |(_, d)| d.house_type.clone()))
        .bind(col(rows, |(_, d)| d.heating.clone()))
        .bind(col(rows, |(_, d)| parameters(&d.parameters)))
        .execute(conn)
        .await?;
    Ok(())
}

async fn upsert_commercial(
    conn: &mut PgConnection,
    rows: &[(Uuid, CommercialDetails)],
) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }
    let sql = detail_upsert_sql(
        DetailTable::Commercial,
        &[
            ("property_type", "text"),
            ("total_area", "float8"),
            ("floor_number", "int2"),
            ("building_floors", "int2"),
            ("commercial_repair", "text"),
            ("price_per_square_meter", "float8"),
            ("commercial_building_location", "text"),
            ("commercial_rent_type", "text"),
            ("parameters", "jsonb"),
        ],
    );
    sqlx::query(&sql)
        .bind(col(rows, |(id, _)| *id))
        .bind(col(rows, |(_, d)| d.property_type.clone()))
        .bind(col(rows, |(_, d)| d.total_area))
        .bind(col(rows, |(_, d)| d.floor_number))
        .bind(col(rows, |(_, d)| d.building_floors))
        .bind(col(rows, |(_, d)| d.commercial_repair.clone()))
        .bind(col(rows, |(_, d)| d.price_per_square_meter))
        .bind(col(rows, |(_, d)| d.commercial_building_location.clone()))
        .bind(col(rows, |(_, d)| d.commercial_rent_type.clone()))
        .bind(col(rows, |(_, d)| parameters(&d.parameters)))
        .execute(conn)
        .await?;
    Ok(())
}

async fn upsert_rooms(
    conn: &mut PgConnection,
    rows: &[(Uuid, RoomDetails)],
) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }
    let sql = detail_upsert_sql(
        DetailTable::Rooms,
        &[
            ("total_area", "float8"),
            ("rooms_amount", "int2"),
            ("suggested_rooms_amount", "int2"),
            ("floor_number", "int2"),
            ("building_floors", "int2"),
            ("room_type", "text"),
            ("condition", "text"),
            ("parameters", "jsonb"),
        ],
    );
    sqlx::query(&sql)
        .bind(col(rows, |(id, _)| *id))
        .bind(col(rows, |(_, d)| d.total_area))
        .bind(col(rows, |(_, d)| d.rooms_amount))
        .bind(col(rows, |(_, d)| d.suggested_rooms_amount))
        .bind(col(rows, |(_, d)| d.floor_number))
        .bind(col(rows, |(_, d)| d.building_floors))
        .bind(col(rows, |(_, d)| d.room_type.clone()))
        .bind(col(rows, |(_, d)| d.condition.clone()))
        .bind(col(rows, |(_, d)| parameters(&d.parameters)))
        .execute(conn)
        .await?;
    Ok(())
}

async fn upsert_garages(
    conn: &mut PgConnection,
    rows: &[(Uuid, GarageAndParkingDetails)],
) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }
    let sql = detail_upsert_sql(
        DetailTable::GaragesAndParkings,
        &[
            ("property_type", "text"),
            ("total_area", "float8"),
            ("parking_places_amount", "int2"),
            ("parking_type", "text"),
            ("heating", "text"),
            ("parameters", "jsonb"),
        ],
    );
    sqlx::query(&sql)
        .bind(col(rows, |(id, _)| *id))
        .bind(col(rows, |(_, d)| d.property_type.clone()))
        .bind(col(rows, |(_, d)| d.total_area))
        .bind(col(rows, |(_, d)| d.parking_places_amount))
        .bind(col(rows, |(_, d)| d.parking_type.clone()))
        .bind(col(rows, |(_, d)| d.heating.clone()))
        .bind(col(rows, |(_, d)| parameters(&d.parameters)))
        .execute(conn)
        .await?;
    Ok(())
}

async fn upsert_plots(
    conn: &mut PgConnection,
    rows: &[(Uuid, PlotDetails)],
) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }
    let sql = detail_upsert_sql(
        DetailTable::Plots,
        &[
            ("plot_area", "float8"),
            ("property_rights", "text"),
            ("in_gardening_community", "bool"),
            ("electricity", "text"),
            ("water", "text"),
            ("gaz", "text"),
            ("sewage", "text"),
            ("parameters", "jsonb"),
        ],
    );
    sqlx::query(&sql)
        .bind(col(rows, |(id, _)| *id))
        .bind(col(rows, |(_, d)| d.plot_area))
        .bind(col(rows, |(_, d)| d.property_rights.clone()))
        .bind(col(rows, |(_, d)| d.in_gardening_community))
        .bind(col(rows, |(_, d)| d.electricity.clone()))
        .bind(col(rows, |(_, d)| d.water.clone()))
        .bind(col(rows, |(_, d)| d.gaz.clone()))
        .bind(col(rows, |(_, d)| d.sewage.clone()))
        .bind(col(rows, |(_, d)| parameters(&d.parameters)))
        .execute(conn)
        .await?;
    Ok(())
}

async fn upsert_new_buildings(
    conn: &mut PgConnection,
    rows: &[(Uuid, NewBuildingDetails)],
) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }
    let sql = detail_upsert_sql(
        DetailTable::NewBuildings,
        &[
            ("builder", "text"),
            ("deadline", "text"),
            ("wall_material", "text"),
            ("ceiling_height", "text"),
            ("with_finishing", "bool"),
            ("share_participation", "bool"),
            ("parameters", "jsonb"),
        ],
    );
    sqlx::query(&sql)
        .bind(col(rows, |(id, _)| *id))
        .bind(col(rows, |(_, d)| d.builder.clone()))
        .bind(col(rows, |(_, d)| d.deadline.clone()))
        .bind(col(rows, |(_, d)| d.wall_material.clone()))
        .bind(col(rows, |(_, d)| d.ceiling_height.clone()))
        .bind(col(rows, |(_, d)| d.with_finishing))
        .bind(col(rows, |(_, d)| d.share_participation))
        .bind(col(rows, |(_, d)| parameters(&d.parameters)))
        .execute(conn)
        .await?;
    Ok(())
}

fn col<R, T>(rows: &[R], f: impl Fn(&R) -> T) -> Vec<T> {
    rows.iter().map(f).collect()
}

fn column_names(columns: &[(&'static str, &'static str)]) -> Vec<&'static str> {
    columns.iter().map(|(name, _)| *name).collect()
}

/// `SELECT * FROM UNNEST($1::t1[], $2::t2[], ...)`
fn unnest_select(types: &[&str]) -> String {
    let args = types
        .iter()
        .enumerate()
        .map(|(idx, ty)| format!("${}::{ty}[]", idx + 1))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT * FROM UNNEST({args})")
}

fn detail_upsert_sql(table: DetailTable, columns: &[(&str, &str)]) -> String {
    let mut types = vec!["uuid"];
    types.extend(columns.iter().map(|(_, ty)| *ty));
    let names = columns.iter().map(|(name, _)| *name).collect::<Vec<_>>();
    let updates = names
        .iter()
        .map(|name| format!("{name} = EXCLUDED.{name}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} (listing_id, {cols}) {select}
         ON CONFLICT (listing_id) DO UPDATE SET {updates}",
        table = table.table_name(),
        cols = names.join(", "),
        select = unnest_select(&types),
    )
}

fn parameters(value: &JsonValue) -> JsonValue {
    if value.is_null() {
        json!({})
    } else {
        value.clone()
    }
}

fn parse_column<T: FromStr>(column: &'static str, value: &str) -> Result<T, StoreError> {
    value.parse().map_err(|_| StoreError::Decode {
        column,
        value: value.to_string(),
    })
}

fn summary_from_row(row: &PgRow) -> Result<ListingSummary, StoreError> {
    let category: String = row.try_get("category")?;
    let deal_type: String = row.try_get("deal_type")?;
    let status: String = row.try_get("status")?;
    let images: JsonValue = row.try_get("images")?;
    let images = serde_json::from_value(images.clone()).map_err(|_| StoreError::Decode {
        column: "images",
        value: images.to_string(),
    })?;

    Ok(ListingSummary {
        id: row.try_get("id")?,
        master_object_id: row.try_get("master_object_id")?,
        source: row.try_get("source")?,
        source_ad_id: row.try_get("source_ad_id")?,
        category: Category::from_tag(&category),
        deal_type: parse_column("deal_type", &deal_type)?,
        status: parse_column("status", &status)?,
        is_source_duplicate: row.try_get("is_source_duplicate")?,
        title: row.try_get("title")?,
        ad_link: row.try_get("ad_link")?,
        address: row.try_get("address")?,
        currency: row.try_get("currency")?,
        price_byn: row.try_get("price_byn")?,
        price_usd: row.try_get("price_usd")?,
        price_eur: row.try_get("price_eur")?,
        images,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Rewrites top-level `snake_case` keys of a row object to `camelCase`.
fn camelize_keys(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(
            map.into_iter()
                .map(|(key, v)| (camel_case(&key), v))
                .collect::<Map<_, _>>(),
        ),
        other => other,
    }
}

fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for ch in key.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}
