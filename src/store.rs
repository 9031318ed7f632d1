//! Record store: tables of JSON records keyed by numeric id.
//!
//! The engine receives an explicitly constructed [`Store`] and never reaches
//! for a global. Every mutation is serialized: the JSON file variant holds an
//! async lock while it rewrites the file through `tokio::fs`, the SQLite
//! variant uses a single connection and a transaction per mutation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{StorageConfig, StorageKind};
use crate::create_timestamp;
use crate::models::Record;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("record in {0} is not a JSON object")]
    NotAnObject(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Equality filters on top-level record fields
pub type Filters<'a> = &'a [(&'a str, Value)];

pub enum Store {
    Json(JsonFileStore),
    Sqlite(SqliteStore),
}

impl Store {
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let path = match &config.path {
            Some(path) => path.clone(),
            None => default_path(config.kind)?,
        };
        match config.kind {
            StorageKind::JsonFile => Ok(Self::Json(JsonFileStore::open(path)?)),
            StorageKind::Sqlite => Ok(Self::Sqlite(SqliteStore::open(&path).await?)),
        }
    }

    /// Store that lives only as long as the handle
    pub fn in_memory() -> Self {
        Self::Json(JsonFileStore::empty(None))
    }

    /// Inserts `record`, assigning `id` and both timestamps
    pub async fn create(&self, table: &str, record: Value) -> Result<Value> {
        let Value::Object(mut record) = record else {
            return Err(StoreError::NotAnObject(table.to_string()));
        };
        let now = create_timestamp();
        record.insert("created_at".to_string(), Value::String(now.clone()));
        record.insert("updated_at".to_string(), Value::String(now));

        match self {
            Self::Json(store) => store.create(table, record).await,
            Self::Sqlite(store) => store.create(table, record).await,
        }
    }

    pub async fn get(&self, table: &str, id: u64) -> Result<Option<Value>> {
        match self {
            Self::Json(store) => Ok(store.get(table, id).await),
            Self::Sqlite(store) => store.get(table, id).await,
        }
    }

    /// Records whose fields equal every filter, in id order
    pub async fn query(&self, table: &str, filters: Filters<'_>) -> Result<Vec<Value>> {
        match self {
            Self::Json(store) => Ok(store.query(table, filters).await),
            Self::Sqlite(store) => store.query(table, filters).await,
        }
    }

    /// Shallow-merges `partial` into the record. The id is never overwritten.
    pub async fn update(&self, table: &str, id: u64, partial: Value) -> Result<Option<Value>> {
        let Value::Object(partial) = partial else {
            return Err(StoreError::NotAnObject(table.to_string()));
        };
        match self {
            Self::Json(store) => store.update(table, id, partial).await,
            Self::Sqlite(store) => store.update(table, id, partial).await,
        }
    }

    pub async fn clear(&self) -> Result<()> {
        match self {
            Self::Json(store) => store.clear().await,
            Self::Sqlite(store) => store.clear().await,
        }
    }

    pub async fn insert<T: Record>(&self, record: &T) -> Result<T> {
        let mut value = serde_json::to_value(record)?;
        if let Value::Object(fields) = &mut value {
            fields.remove("id");
        }
        Ok(serde_json::from_value(self.create(T::TABLE, value).await?)?)
    }

    pub async fn find<T: Record>(&self, id: u64) -> Result<Option<T>> {
        self.get(T::TABLE, id)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub async fn select<T: Record>(&self, filters: Filters<'_>) -> Result<Vec<T>> {
        self.query(T::TABLE, filters)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }

    pub async fn patch<T: Record>(&self, id: u64, partial: Value) -> Result<Option<T>> {
        self.update(T::TABLE, id, partial)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }
}

fn default_path(kind: StorageKind) -> Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "assessd").ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "Unable to find user directory")
    })?;
    let data_dir = proj_dirs.data_local_dir();
    fs::create_dir_all(data_dir)?;

    Ok(match kind {
        StorageKind::JsonFile => data_dir.join("assessd.json"),
        StorageKind::Sqlite => data_dir.join("assessd.sqlite3"),
    })
}

fn matches(record: &Value, filters: Filters<'_>) -> bool {
    filters
        .iter()
        .all(|(field, expected)| record.get(field) == Some(expected))
}

fn merge(record: &mut Map<String, Value>, partial: Map<String, Value>) {
    for (field, value) in partial {
        if field != "id" {
            record.insert(field, value);
        }
    }
    record.insert("updated_at".to_string(), Value::String(create_timestamp()));
}

type Tables = BTreeMap<String, BTreeMap<u64, Value>>;

/// All tables in one JSON document, rewritten in full on every mutation
pub struct JsonFileStore {
    path: Option<PathBuf>,
    tables: Mutex<Tables>,
}

impl JsonFileStore {
    fn empty(path: Option<PathBuf>) -> Self {
        Self {
            path,
            tables: Mutex::new(Tables::new()),
        }
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let tables = match fs::read(&path) {
            Ok(bytes) => match Self::parse(&bytes) {
                Ok(tables) => tables,
                Err(e) => {
                    let backup = path.with_extension("json.corrupt");
                    log::warn!(
                        "Record store at {} is unreadable ({e}), starting empty; old file moved to {}",
                        path.display(),
                        backup.display()
                    );
                    fs::rename(&path, &backup)?;
                    Tables::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No record store at {}, starting empty", path.display());
                Tables::new()
            }
            Err(e) => return Err(e.into()),
        };
        log::info!("Opened record store at {}", path.display());

        Ok(Self {
            path: Some(path),
            tables: Mutex::new(tables),
        })
    }

    fn parse(bytes: &[u8]) -> Result<Tables> {
        let document: BTreeMap<String, Vec<Value>> = serde_json::from_slice(bytes)?;
        let mut tables = Tables::new();
        for (name, records) in document {
            let table = tables.entry(name.clone()).or_default();
            for record in records {
                let id = record
                    .get("id")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| StoreError::NotAnObject(name.clone()))?;
                table.insert(id, record);
            }
        }
        Ok(tables)
    }

    /// Writes to a sibling temp file first so a crash never leaves half a document
    async fn persist(&self, tables: &Tables) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let document: BTreeMap<&String, Vec<&Value>> = tables
            .iter()
            .map(|(name, records)| (name, records.values().collect()))
            .collect();

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&document)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn create(&self, table: &str, mut record: Map<String, Value>) -> Result<Value> {
        let mut tables = self.tables.lock().await;
        let records = tables.entry(table.to_string()).or_default();
        let id = records.keys().next_back().map_or(1, |last| last + 1);
        record.insert("id".to_string(), Value::from(id));
        let record = Value::Object(record);
        records.insert(id, record.clone());

        self.persist(&tables).await?;
        Ok(record)
    }

    async fn get(&self, table: &str, id: u64) -> Option<Value> {
        self.tables.lock().await.get(table)?.get(&id).cloned()
    }

    async fn query(&self, table: &str, filters: Filters<'_>) -> Vec<Value> {
        let tables = self.tables.lock().await;
        let Some(records) = tables.get(table) else {
            return Vec::new();
        };
        records
            .values()
            .filter(|r| matches(r, filters))
            .cloned()
            .collect()
    }

    async fn update(
        &self,
        table: &str,
        id: u64,
        partial: Map<String, Value>,
    ) -> Result<Option<Value>> {
        let mut tables = self.tables.lock().await;
        let Some(Value::Object(record)) = tables.get_mut(table).and_then(|t| t.get_mut(&id)) else {
            return Ok(None);
        };
        merge(record, partial);
        let updated = Value::Object(record.clone());

        self.persist(&tables).await?;
        Ok(Some(updated))
    }

    async fn clear(&self) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.clear();
        self.persist(&tables).await?;
        if let Some(path) = &self.path {
            log::info!("Cleared record store at {}", path.display());
        }
        Ok(())
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite://{}?mode=rwc", path.display()); // rwc = read/write/create
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // one connection is the single writer
            .min_connections(0)
            .connect(&db_url)
            .await?;

        for sql in &[
            "PRAGMA busy_timeout = 2000;",
            "PRAGMA journal_mode = WAL;",
            "PRAGMA synchronous = NORMAL;",
            r"
            CREATE TABLE IF NOT EXISTS records (
                table_name  TEXT     NOT NULL,
                id          INTEGER  NOT NULL,
                body        TEXT     NOT NULL,
                PRIMARY KEY (table_name, id)
            );",
        ] {
            sqlx::query(sql).execute(&pool).await?;
        }

        log::info!("Opened record store at {}", path.display());
        Ok(Self { pool })
    }

    async fn create(&self, table: &str, mut record: Map<String, Value>) -> Result<Value> {
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM records WHERE table_name = ?",
        )
        .bind(table)
        .fetch_one(&mut *tx)
        .await?;

        record.insert("id".to_string(), Value::from(id));
        let record = Value::Object(record);
        sqlx::query("INSERT INTO records (table_name, id, body) VALUES (?, ?, ?)")
            .bind(table)
            .bind(id)
            .bind(serde_json::to_string(&record)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(record)
    }

    async fn get(&self, table: &str, id: u64) -> Result<Option<Value>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM records WHERE table_name = ? AND id = ?")
                .bind(table)
                .bind(id as i64)
                .fetch_optional(&self.pool)
                .await?;
        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(Into::into)
    }

    async fn query(&self, table: &str, filters: Filters<'_>) -> Result<Vec<Value>> {
        let bodies: Vec<String> =
            sqlx::query_scalar("SELECT body FROM records WHERE table_name = ? ORDER BY id")
                .bind(table)
                .fetch_all(&self.pool)
                .await?;

        let mut records = Vec::with_capacity(bodies.len());
        for body in bodies {
            let record: Value = serde_json::from_str(&body)?;
            if matches(&record, filters) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn update(
        &self,
        table: &str,
        id: u64,
        partial: Map<String, Value>,
    ) -> Result<Option<Value>> {
        let mut tx = self.pool.begin().await?;
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM records WHERE table_name = ? AND id = ?")
                .bind(table)
                .bind(id as i64)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(body) = body else {
            return Ok(None);
        };

        let Value::Object(mut record) = serde_json::from_str(&body)? else {
            return Err(StoreError::NotAnObject(table.to_string()));
        };
        merge(&mut record, partial);
        let record = Value::Object(record);

        sqlx::query("UPDATE records SET body = ? WHERE table_name = ? AND id = ?")
            .bind(serde_json::to_string(&record)?)
            .bind(table)
            .bind(id as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(record))
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM records").execute(&self.pool).await?;
        log::info!("Cleared record store");
        Ok(())
    }
}
