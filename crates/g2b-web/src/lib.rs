//! Read-only JSON API over collected bid documents.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use g2b_storage::{DocumentStore, StoreError};
use g2b_sync::{load_collectors, open_store, CollectorProfile, SyncConfig, BID_DATE_FIELD};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "g2b-web";

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub collectors: Vec<CollectorProfile>,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>, collectors: Vec<CollectorProfile>) -> Self {
        Self { store, collectors }
    }

    fn default_collection(&self) -> String {
        self.collectors
            .first()
            .map(|p| p.collection.clone())
            .unwrap_or_else(|| CollectorProfile::builtin_ax().collection)
    }

    fn profile_for(&self, collection: &str) -> Option<&CollectorProfile> {
        self.collectors.iter().find(|p| p.collection == collection)
    }
}

#[derive(Debug, Deserialize, Default)]
struct BidsQuery {
    collection: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StateQuery {
    collection: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/bids", get(bids_handler))
        .route("/api/collection-state", get(collection_state_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port: u16 = std::env::var("G2B_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3001);
    let store = open_store(&config).await?;
    let collectors = load_collectors(&config.collectors_file)?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, backend = store.backend(), "serving bid API");
    axum::serve(listener, app(AppState::new(store, collectors))).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    let collection = state.default_collection();
    let store_ok = state.store.latest_by(&collection, BID_DATE_FIELD).await.is_ok();
    Json(json!({ "status": "ok", "store": store_ok }))
}

async fn bids_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BidsQuery>,
) -> Response {
    let collection = query
        .collection
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| state.default_collection());
    if state.profile_for(&collection).is_none() {
        return not_found(&format!("unknown collection {collection}"));
    }
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    match state.store.list_desc(&collection, BID_DATE_FIELD, limit).await {
        Ok(rows) => {
            let bids: Vec<JsonValue> = rows
                .into_iter()
                .map(|(id, mut doc)| {
                    doc.insert("id".to_string(), JsonValue::String(id));
                    JsonValue::Object(doc)
                })
                .collect();
            Json(json!({ "collection": collection, "count": bids.len(), "bids": bids }))
                .into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn collection_state_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StateQuery>,
) -> Response {
    let collection = query
        .collection
        .unwrap_or_else(|| state.default_collection());
    let Some(profile) = state.profile_for(&collection) else {
        return not_found(&format!("unknown collection {collection}"));
    };

    match state.store.get(&profile.meta_collection, &profile.meta_doc).await {
        Ok(Some(doc)) => Json(JsonValue::Object(doc)).into_response(),
        Ok(None) => not_found("collection has not been synced yet"),
        Err(err) => store_error(err),
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "store request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
