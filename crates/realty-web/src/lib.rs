//! Axum JSON query surface over the listing store.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use realty_core::ListingSummary;
use realty_storage::{ListingStore, PgListingStore, StoreError};
use realty_sync::IngestConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "realty-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ListingStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BestByMastersRequest {
    pub master_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
struct BestByMastersResponse {
    listings: Vec<ListingSummary>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/masters/best", post(best_by_masters_handler))
        .route("/listings/{id}", get(listing_view_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = IngestConfig::from_env();
    let store = PgListingStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to listing database")?;
    serve(AppState::new(Arc::new(store)), config.web_port).await
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "query surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn best_by_masters_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BestByMastersRequest>,
) -> Response {
    match state.store.best_by_masters(&request.master_ids).await {
        Ok(listings) => Json(BestByMastersResponse { listings }).into_response(),
        Err(err) => store_error(err),
    }
}

async fn listing_view_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.store.listing_view(id).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("listing {id} not found") })),
        )
            .into_response(),
        Err(err) => store_error(err),
    }
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "store query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use realty_core::{
        ApartmentDetails, Category, DealType, IncomingBatch, Listing, ListingDetails, ListingKey,
        ListingStatus,
    };
    use realty_storage::MemoryListingStore;
    use realty_sync::{BatchPipeline, Fingerprinter};
    use tower::ServiceExt;

    fn apartment(source: &str, ad_id: i64) -> Listing {
        let now = Utc::now();
        Listing {
            id: Uuid::new_v4(),
            source: source.to_string(),
            source_ad_id: ad_id,
            category: Category::Apartment,
            deal_type: DealType::Sale,
            status: ListingStatus::Active,
            latitude: 53.90254,
            longitude: 27.56181,
            ad_link: None,
            title: Some("2-room flat".into()),
            description: Some("Near the metro".into()),
            address: None,
            city_or_district: Some("Minsk".into()),
            region: None,
            currency: Some("USD".into()),
            price_byn: None,
            price_usd: Some(80_000.0),
            price_eur: None,
            images: vec![],
            is_agency: false,
            seller_name: None,
            list_time: None,
            created_at: now,
            updated_at: now,
            details: ListingDetails::Apartment(ApartmentDetails {
                total_area: Some(61.4),
                rooms_amount: Some(2),
                ..Default::default()
            }),
        }
    }

    async fn seeded() -> (MemoryListingStore, Router) {
        let store = MemoryListingStore::new();
        let pipeline = BatchPipeline::new(Arc::new(store.clone()), Fingerprinter::default());
        pipeline
            .process(&IncomingBatch {
                task_id: Uuid::new_v4(),
                trace_id: None,
                listings: vec![apartment("kufar", 111), apartment("realt", 222)],
            })
            .await
            .unwrap();
        let router = app(AppState::new(Arc::new(store.clone())));
        (store, router)
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (_, router) = seeded().await;
        let resp = router
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn best_by_masters_returns_one_summary_per_master() {
        let (store, router) = seeded().await;
        let master = store
            .row(&ListingKey::new("kufar", 111))
            .await
            .unwrap()
            .master_object_id;
        let request = serde_json::to_vec(&BestByMastersRequest {
            master_ids: vec![master, Uuid::new_v4()],
        })
        .unwrap();

        let resp = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/masters/best")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(request))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        let listings = body["listings"].as_array().unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0]["master_object_id"], master.to_string());
        assert_eq!(listings[0]["is_source_duplicate"], false);
    }

    #[tokio::test]
    async fn listing_view_includes_related_offers() {
        let (store, router) = seeded().await;
        let kufar = store.row(&ListingKey::new("kufar", 111)).await.unwrap();
        let realt = store.row(&ListingKey::new("realt", 222)).await.unwrap();

        let resp = router
            .oneshot(
                Request::builder()
                    .uri(format!("/listings/{}", kufar.listing.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["description"], "Near the metro");
        let related = body["related_offers"].as_array().unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0]["id"], realt.listing.id.to_string());
    }

    #[tokio::test]
    async fn unknown_listing_is_not_found() {
        let (_, router) = seeded().await;
        let resp = router
            .oneshot(
                Request::builder()
                    .uri(format!("/listings/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(json_body(resp).await["error"]
            .as_str()
            .unwrap()
            .contains("not found"));
    }

    #[tokio::test]
    async fn malformed_listing_id_is_rejected() {
        let (_, router) = seeded().await;
        let resp = router
            .oneshot(
                Request::builder()
                    .uri("/listings/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
