//! Local SQLite store for extracted records.
//!
//! A connection is opened per operation and dropped before returning, so no
//! database lock is held while the browser is waiting on the network.

mod schema;

use crate::dedup;
use crate::extract::{CandidateRecord, Category, Record, RecordKind};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create database directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {kind} record `{name}`: {reason}")]
    Invalid { kind: RecordKind, name: String, reason: String },
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// A row with the same natural key already exists.
    Duplicate,
}

/// One row of the session log table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionLog {
    pub timestamp: DateTime<Utc>,
    pub city: String,
    pub target: String,
    pub status: String,
    pub seen: usize,
    pub duplicates: usize,
    pub inserted: usize,
    pub errors: usize,
    pub duration_seconds: f64,
}

/// Storage operations the pipeline depends on.
pub trait RecordStore: Send + Sync {
    /// Whether a row with this natural key exists in `kind`'s table.
    fn contains_key(&self, kind: RecordKind, key: &str) -> Result<bool, StoreError>;

    /// Inserts `record` under `key` unless the key is already taken.
    fn insert(&self, key: &str, record: &CandidateRecord) -> Result<InsertOutcome, StoreError>;

    /// Categories collected for `city`, oldest first.
    fn known_categories(&self, city: &str) -> Result<Vec<Category>, StoreError>;

    /// Id of a stored merchant.
    fn merchant_id(&self, name: &str, city: &str) -> Result<Option<i64>, StoreError>;

    fn log_session(&self, entry: &SessionLog) -> Result<(), StoreError>;
}

/// SQLite-backed [`RecordStore`].
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|source| StoreError::Io { path: dir.to_path_buf(), source })?;
        }

        let store = Self { db_path: db_path.to_path_buf() };
        store.init_schema()?;
        debug!("Opened store at {}", db_path.display());
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(())
    }

    /// Number of rows in `kind`'s table.
    pub fn count(&self, kind: RecordKind) -> Result<usize, StoreError> {
        let conn = self.connect()?;
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// All natural keys in `kind`'s table, by id.
    pub fn natural_keys(&self, kind: RecordKind) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let sql = format!("SELECT natural_key FROM {} ORDER BY id", kind.table());
        let mut stmt = conn.prepare(&sql)?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Number of rows in the session log.
    pub fn session_count(&self) -> Result<usize, StoreError> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM scraping_logs", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn key_exists(conn: &Connection, kind: RecordKind, key: &str) -> Result<bool, rusqlite::Error> {
    let sql = format!("SELECT 1 FROM {} WHERE natural_key = ?1 LIMIT 1", kind.table());
    Ok(conn.query_row(&sql, params![key], |_| Ok(())).optional()?.is_some())
}

fn insert_row(
    conn: &Connection,
    id: i64,
    key: &str,
    record: &Record,
    now: &str,
) -> Result<(), rusqlite::Error> {
    match record {
        Record::Category(c) => conn.execute(
            "INSERT INTO categories (id, name, link, city, natural_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, c.name, c.link, c.city, key, now],
        ),
        Record::Merchant(m) => conn.execute(
            "INSERT INTO restaurants (id, name, city, category, cuisine, rating, distance_km,
                 delivery_fee, delivery_time_min, min_order, link, natural_key, scraped_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id,
                m.name,
                m.city,
                m.category,
                m.cuisine,
                m.rating,
                m.distance_km,
                m.delivery_fee,
                m.delivery_time_min,
                m.min_order,
                m.link,
                key,
                now,
            ],
        ),
        Record::MenuItem(p) => conn.execute(
            "INSERT INTO products (id, restaurant_id, restaurant_name, city, name, category,
                 description, price, natural_key, scraped_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                p.restaurant_id,
                p.restaurant_name,
                p.city,
                p.name,
                p.category,
                p.description,
                p.price,
                key,
                now,
            ],
        ),
    }?;
    Ok(())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

impl RecordStore for SqliteStore {
    fn contains_key(&self, kind: RecordKind, key: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        Ok(key_exists(&conn, kind, key)?)
    }

    fn insert(&self, key: &str, candidate: &CandidateRecord) -> Result<InsertOutcome, StoreError> {
        let kind = candidate.kind();
        let record = Record::from_candidate(candidate).map_err(|reason| StoreError::Invalid {
            kind,
            name: candidate.name().to_string(),
            reason,
        })?;

        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if key_exists(&tx, kind, key)? {
            trace!("{} `{}` already stored", kind, candidate.name());
            return Ok(InsertOutcome::Duplicate);
        }

        let sql = format!("SELECT COALESCE(MAX(id), 0) + 1 FROM {}", kind.table());
        let id: i64 = tx.query_row(&sql, [], |row| row.get(0))?;
        let now = Utc::now().to_rfc3339();

        match insert_row(&tx, id, key, &record, &now) {
            Ok(()) => {}
            Err(e) if is_unique_violation(&e) => return Ok(InsertOutcome::Duplicate),
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        trace!("Inserted {} #{} `{}`", kind, id, candidate.name());
        Ok(InsertOutcome::Inserted(id))
    }

    fn known_categories(&self, city: &str) -> Result<Vec<Category>, StoreError> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT name, link, city FROM categories WHERE city = ?1 ORDER BY id")?;
        let categories = stmt
            .query_map(params![city], |row| {
                Ok(Category { name: row.get(0)?, link: row.get(1)?, city: row.get(2)? })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(categories)
    }

    fn merchant_id(&self, name: &str, city: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.connect()?;
        let key = dedup::compose_key(&[name, city]);
        let id = conn
            .query_row(
                "SELECT id FROM restaurants WHERE natural_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn log_session(&self, entry: &SessionLog) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO scraping_logs (timestamp, city, target, status, seen, duplicates,
                 inserted, errors, duration_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.timestamp.to_rfc3339(),
                entry.city,
                entry.target,
                entry.status,
                entry.seen as i64,
                entry.duplicates as i64,
                entry.inserted as i64,
                entry.errors as i64,
                entry.duration_seconds,
            ],
        )?;
        Ok(())
    }
}
