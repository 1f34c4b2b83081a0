//! HTTP JSON fetching and Postgres persistence for the owl ingestor.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use owl_core::{DeclaredStats, DetailEntry, ItemSummary};
use serde::de::DeserializeOwned;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const UPSERT_ITEM_QUERY: &str = "upsert_item";
pub const INSERT_SUMMARY_QUERY: &str = "insert_item_summary";
pub const INSERT_RECORD_QUERY: &str = "insert_item_record";
pub const UPSERT_DECLARED_STATS_QUERY: &str = "upsert_declared_stats";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetch of {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
        Ok(Self { client })
    }

    /// GET `url` and decode the body as JSON. Non-2xx statuses are errors.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        self.get_json(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.bytes().await?;
        debug!(bytes = body.len(), "fetched body");
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unknown query template: {0}")]
    UnknownQuery(String),
    #[error("query {query} failed: {source}")]
    Database {
        query: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Named SQL templates loaded from a directory tree of `.sql` files.
#[derive(Debug, Clone, Default)]
pub struct QueryCatalog {
    queries: BTreeMap<String, String>,
}

impl QueryCatalog {
    /// Register every `*.sql` file under `root` by its root-relative path
    /// without extension, e.g. `items/upsert.sql` becomes `items/upsert`.
    pub fn load_dir(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref();
        let mut queries = BTreeMap::new();
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("reading query directory {}", dir.display()))?;
            for entry in entries {
                let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
                let path = entry.path();
                if entry
                    .file_type()
                    .with_context(|| format!("inspecting {}", path.display()))?
                    .is_dir()
                {
                    pending.push(path);
                    continue;
                }
                if path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
                    continue;
                }

                let sql = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading query template {}", path.display()))?;
                queries.insert(query_name(root, &path), sql);
            }
        }

        Ok(Self { queries })
    }

    pub fn insert(&mut self, name: impl Into<String>, sql: impl Into<String>) {
        self.queries.insert(name.into(), sql.into());
    }

    pub fn get(&self, name: &str) -> Result<&str, PersistenceError> {
        self.queries
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| PersistenceError::UnknownQuery(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

fn query_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path).with_extension("");
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Positional argument for a named query. `None` binds a typed NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Text(Option<String>),
    Int(Option<i64>),
    Float(Option<f64>),
}

impl From<&str> for SqlArg {
    fn from(value: &str) -> Self {
        SqlArg::Text(Some(value.to_string()))
    }
}

impl From<String> for SqlArg {
    fn from(value: String) -> Self {
        SqlArg::Text(Some(value))
    }
}

impl From<i64> for SqlArg {
    fn from(value: i64) -> Self {
        SqlArg::Int(Some(value))
    }
}

impl From<Option<i64>> for SqlArg {
    fn from(value: Option<i64>) -> Self {
        SqlArg::Int(value)
    }
}

impl From<f64> for SqlArg {
    fn from(value: f64) -> Self {
        SqlArg::Float(Some(value))
    }
}

impl From<Option<f64>> for SqlArg {
    fn from(value: Option<f64>) -> Self {
        SqlArg::Float(value)
    }
}

/// Destination for item summaries. Each call is independent; callers decide
/// how to treat failures.
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn upsert_item(&self, item_name: &str) -> Result<(), PersistenceError>;

    async fn insert_summary(
        &self,
        item_name: &str,
        summary: &ItemSummary,
    ) -> Result<(), PersistenceError>;

    async fn insert_record(
        &self,
        item_name: &str,
        snapshot_time: &str,
        record: &DetailEntry,
    ) -> Result<(), PersistenceError>;

    async fn upsert_declared_stats(
        &self,
        item_name: &str,
        stats: &DeclaredStats,
    ) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    queries: Arc<QueryCatalog>,
}

impl PgStore {
    pub fn new(pool: PgPool, queries: QueryCatalog) -> Self {
        Self {
            pool,
            queries: Arc::new(queries),
        }
    }

    pub async fn connect(database_url: &str, queries: QueryCatalog) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool, queries))
    }

    /// Run the named template with positional args, returning rows affected.
    pub async fn execute(&self, name: &str, args: &[SqlArg]) -> Result<u64, PersistenceError> {
        let sql = self.queries.get(name)?;
        let mut query = sqlx::query::<Postgres>(sql);
        for arg in args {
            query = match arg.clone() {
                SqlArg::Text(v) => query.bind(v),
                SqlArg::Int(v) => query.bind(v),
                SqlArg::Float(v) => query.bind(v),
            };
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|source| PersistenceError::Database {
                query: name.to_string(),
                source,
            })?;
        Ok(result.rows_affected())
    }

    pub async fn migrate(&self, migrations_dir: &Path) -> anyhow::Result<()> {
        let migrator = sqlx::migrate::Migrator::new(migrations_dir)
            .await
            .with_context(|| format!("loading migrations from {}", migrations_dir.display()))?;
        migrator
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        Ok(())
    }
}

#[async_trait]
impl SummarySink for PgStore {
    async fn upsert_item(&self, item_name: &str) -> Result<(), PersistenceError> {
        self.execute(UPSERT_ITEM_QUERY, &[SqlArg::from(item_name)]).await?;
        Ok(())
    }

    async fn insert_summary(
        &self,
        item_name: &str,
        summary: &ItemSummary,
    ) -> Result<(), PersistenceError> {
        let args: [SqlArg; 7] = [
            item_name.into(),
            summary.snapshot_time.as_str().into(),
            summary.min_price.into(),
            summary.p25.into(),
            summary.p50.into(),
            summary.p75.into(),
            summary.max_price.into(),
        ];
        self.execute(INSERT_SUMMARY_QUERY, &args).await?;
        Ok(())
    }

    async fn insert_record(
        &self,
        item_name: &str,
        snapshot_time: &str,
        record: &DetailEntry,
    ) -> Result<(), PersistenceError> {
        let args: [SqlArg; 7] = [
            item_name.into(),
            snapshot_time.into(),
            record.record_id.as_str().into(),
            record.seller_name.as_str().into(),
            record.bundle_size.into(),
            record.price.into(),
            record.quantity.into(),
        ];
        self.execute(INSERT_RECORD_QUERY, &args).await?;
        Ok(())
    }

    async fn upsert_declared_stats(
        &self,
        item_name: &str,
        stats: &DeclaredStats,
    ) -> Result<(), PersistenceError> {
        let args: [SqlArg; 9] = [
            item_name.into(),
            stats.p0.into(),
            stats.p25.into(),
            stats.p50.into(),
            stats.p75.into(),
            stats.p100.into(),
            stats.mean.into(),
            stats.std.into(),
            stats.n_owled.into(),
        ];
        self.execute(UPSERT_DECLARED_STATS_QUERY, &args).await?;
        Ok(())
    }
}
