//! Document store + HTTP fetch utilities for the G2B collector.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "g2b-storage";

/// A stored document: a flat JSON object.
pub type Document = JsonMap<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// 401/403: the credential is broken; callers must not read this as "no data".
    Unauthorized,
    Failed,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        StatusClass::Unauthorized
    } else {
        StatusClass::Failed
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Fixed pause callers take between consecutive upstream requests.
    pub request_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            request_delay: Duration::from_millis(150),
        }
    }
}

/// Single-shot GET client. The upstream API throttles aggressively, so there are no
/// retries here; pacing is the caller's job via [`HttpFetcher::pause`].
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    request_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_unauthorized(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == StatusClass::Unauthorized)
                .unwrap_or(false),
            FetchError::Request(_) => false,
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            request_delay: config.request_delay,
        })
    }

    pub fn request_delay(&self) -> Duration {
        self.request_delay
    }

    pub async fn pause(&self) {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
    }

    /// GET `url` with `query` appended. Non-2xx statuses become [`FetchError::HttpStatus`].
    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(reqwest::Error::without_url)?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if classify_status(status) != StatusClass::Success {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: redact_service_key(&final_url),
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(reqwest::Error::without_url)?
                .to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Strip the `serviceKey` value from a URL before it ends up in logs or errors.
pub fn redact_service_key(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let query = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((name, _)) if name.eq_ignore_ascii_case("servicekey") => format!("{name}=***"),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{query}")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("document serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
}

/// Keyed JSON document collections with merge-on-write semantics.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Merge every document into `collection` as one atomic unit. Fields absent from the
    /// incoming document keep their stored value.
    async fn upsert_batch(
        &self,
        collection: &str,
        documents: &[(String, Document)],
    ) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Document>, StoreError>;

    /// Returns whether a document was removed.
    async fn delete(&self, collection: &str, doc_id: &str) -> Result<bool, StoreError>;

    /// Documents carrying `field`, ordered by its text value descending.
    async fn list_desc(
        &self,
        collection: &str,
        field: &str,
        limit: usize,
    ) -> Result<Vec<(String, Document)>, StoreError>;

    async fn latest_by(
        &self,
        collection: &str,
        field: &str,
    ) -> Result<Option<(String, Document)>, StoreError> {
        Ok(self.list_desc(collection, field, 1).await?.into_iter().next())
    }
}

fn sort_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Process-local store used by tests and `G2B_STORE=memory` dry runs.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<BTreeMap<String, BTreeMap<String, Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .await
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub async fn doc_ids(&self, collection: &str) -> Vec<String> {
        self.collections
            .lock()
            .await
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn upsert_batch(
        &self,
        collection: &str,
        documents: &[(String, Document)],
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().await;
        let docs = collections.entry(collection.to_string()).or_default();
        for (doc_id, incoming) in documents {
            let stored = docs.entry(doc_id.clone()).or_default();
            for (field, value) in incoming {
                stored.insert(field.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self
            .collections
            .lock()
            .await
            .get(collection)
            .and_then(|docs| docs.get(doc_id))
            .cloned())
    }

    async fn delete(&self, collection: &str, doc_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .collections
            .lock()
            .await
            .get_mut(collection)
            .and_then(|docs| docs.remove(doc_id))
            .is_some())
    }

    async fn list_desc(
        &self,
        collection: &str,
        field: &str,
        limit: usize,
    ) -> Result<Vec<(String, Document)>, StoreError> {
        let collections = self.collections.lock().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut rows = docs
            .iter()
            .filter_map(|(id, doc)| {
                let key = doc.get(field).and_then(sort_text)?;
                Some((key, id.clone(), doc.clone()))
            })
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|(_, id, doc)| (id, doc))
            .collect())
    }
}

/// PostgreSQL-backed store: one `documents` table of JSONB rows keyed by (collection, doc_id).
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        info!("document store migrations applied");
        Ok(())
    }
}

fn into_document(value: JsonValue) -> Result<Document, StoreError> {
    match value {
        JsonValue::Object(map) => Ok(map),
        other => Err(StoreError::Backend(format!(
            "stored document is not an object: {other}"
        ))),
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn upsert_batch(
        &self,
        collection: &str,
        documents: &[(String, Document)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (doc_id, doc) in documents {
            sqlx::query(
                r#"
                INSERT INTO documents (collection, doc_id, data, updated_at)
                VALUES ($1, $2, $3, now())
                ON CONFLICT (collection, doc_id)
                DO UPDATE SET data = documents.data || EXCLUDED.data,
                              updated_at = now()
                "#,
            )
            .bind(collection)
            .bind(doc_id)
            .bind(Json(doc))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query("SELECT data FROM documents WHERE collection = $1 AND doc_id = $2")
            .bind(collection)
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: JsonValue = row.try_get("data")?;
                Ok(Some(into_document(data)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, collection: &str, doc_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND doc_id = $2")
            .bind(collection)
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_desc(
        &self,
        collection: &str,
        field: &str,
        limit: usize,
    ) -> Result<Vec<(String, Document)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc_id, data
              FROM documents
             WHERE collection = $1
               AND data->>$2 IS NOT NULL
             ORDER BY data->>$2 DESC, doc_id
             LIMIT $3
            "#,
        )
        .bind(collection)
        .bind(field)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let doc_id: String = row.try_get("doc_id")?;
            let data: JsonValue = row.try_get("data")?;
            out.push((doc_id, into_document(data)?));
        }
        Ok(out)
    }
}

type Registry = Mutex<HashMap<String, Arc<dyn DocumentStore>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Process-scoped registry of named store handles. Initializing a name twice returns the
/// handle built the first time.
pub struct StoreRegistry;

impl StoreRegistry {
    fn registry() -> &'static Registry {
        REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
    }

    pub async fn get_or_init<F, Fut>(
        name: &str,
        init: F,
    ) -> Result<Arc<dyn DocumentStore>, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn DocumentStore>, StoreError>>,
    {
        let mut handles = Self::registry().lock().await;
        if let Some(existing) = handles.get(name) {
            return Ok(existing.clone());
        }
        let store = init().await?;
        info!(name, backend = store.backend(), "document store initialized");
        handles.insert(name.to_string(), store.clone());
        Ok(store)
    }

    pub async fn get(name: &str) -> Option<Arc<dyn DocumentStore>> {
        Self::registry().lock().await.get(name).cloned()
    }
}
