//! Destination tables: PostgreSQL and an append-only JSON-lines file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use mmrl_core::{CompositeKey, NormalizedRow};
use regex::Regex;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

static TABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("static pattern")
});

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error("sink file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding row: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait TableSink: Send + Sync {
    /// Subset of `keys` already present in the destination.
    async fn query_existing_keys(&self, keys: &[CompositeKey]) -> Result<HashSet<CompositeKey>, SinkError>;

    async fn ensure_container_exists(&self) -> Result<(), SinkError>;

    /// Appends every row and returns how many were written.
    async fn append(&self, rows: &[NormalizedRow]) -> Result<usize, SinkError>;
}

pub struct PgTableSink {
    pool: PgPool,
    table: String,
}

impl PgTableSink {
    /// Connections are opened on first use, so an unreachable database surfaces as a load failure.
    pub fn connect_lazy(database_url: &str, table: &str) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_lazy(database_url)?;
        Self::with_pool(pool, table)
    }

    pub fn with_pool(pool: PgPool, table: &str) -> Result<Self, SinkError> {
        if !TABLE_NAME.is_match(table) {
            return Err(SinkError::InvalidTable(table.to_string()));
        }
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }
}

#[async_trait]
impl TableSink for PgTableSink {
    async fn query_existing_keys(&self, keys: &[CompositeKey]) -> Result<HashSet<CompositeKey>, SinkError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let wanted: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
        let sql = format!(
            r#"
            SELECT DISTINCT message_id || '|' || sending_time AS composite_key
              FROM {}
             WHERE message_id || '|' || sending_time = ANY($1)
            "#,
            self.table
        );
        let rows = sqlx::query(&sql).bind(&wanted).fetch_all(&self.pool).await?;

        let mut found = HashSet::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("composite_key")?;
            found.insert(CompositeKey::from(key));
        }
        debug!(requested = keys.len(), found = found.len(), "checked existing keys");
        Ok(found)
    }

    async fn ensure_container_exists(&self) -> Result<(), SinkError> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                message_id   TEXT NOT NULL,
                sender       TEXT NOT NULL,
                sending_time TEXT NOT NULL,
                price        TEXT NOT NULL,
                sent         BIGINT NOT NULL,
                viewed       BIGINT NOT NULL,
                purchased    BIGINT NOT NULL,
                earnings     DOUBLE PRECISION NOT NULL,
                message      TEXT NOT NULL,
                loaded_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn append(&self, rows: &[NormalizedRow]) -> Result<usize, SinkError> {
        let sql = format!(
            r#"
            INSERT INTO {} (message_id, sender, sending_time, price, sent, viewed, purchased, earnings, message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            self.table
        );
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(&sql)
                .bind(&row.message_id)
                .bind(&row.sender)
                .bind(&row.sending_time)
                .bind(&row.price)
                .bind(saturating_i64(row.sent))
                .bind(saturating_i64(row.viewed))
                .bind(saturating_i64(row.purchased))
                .bind(row.earnings)
                .bind(&row.message)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!(table = %self.table, rows = rows.len(), "appended rows");
        Ok(rows.len())
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// One JSON document per line. Writes are serialized through an in-process lock.
pub struct JsonlTableSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTableSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl TableSink for JsonlTableSink {
    async fn query_existing_keys(&self, keys: &[CompositeKey]) -> Result<HashSet<CompositeKey>, SinkError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(err) => return Err(self.io_error(err)),
        };
        let wanted: HashSet<&CompositeKey> = keys.iter().collect();
        let mut found = HashSet::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let row: NormalizedRow = serde_json::from_str(line)?;
            let key = row.composite_key();
            if wanted.contains(&key) {
                found.insert(key);
            }
        }
        Ok(found)
    }

    async fn ensure_container_exists(&self) -> Result<(), SinkError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| self.io_error(err))?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| self.io_error(err))?;
        Ok(())
    }

    async fn append(&self, rows: &[NormalizedRow]) -> Result<usize, SinkError> {
        let mut buffer = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buffer, row)?;
            buffer.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| self.io_error(err))?;
        file.write_all(&buffer)
            .await
            .map_err(|err| self.io_error(err))?;
        file.flush().await.map_err(|err| self.io_error(err))?;
        Ok(rows.len())
    }
}
