//! Usage store — append-only time series of usage points, backed by SQLite.
//!
//! Every successful poll lands here as one or two rows. Rows are
//! metric-tagged rather than provider-shaped so a provider can start
//! reporting a new metric without a schema change. Rows are never
//! updated or deleted.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Mutex;

/// Metric name for monetary cost points.
pub const METRIC_COST_USD: &str = "cost_usd";
/// Metric name for token / request-count points.
pub const METRIC_TOKENS_TOTAL: &str = "tokens_total";

/// Tolerance when re-joining a tokens point to its cost point.
/// The two rows are written back-to-back by one poll but carry no
/// shared id, so `latest` joins on timestamp proximity.
const JOIN_TOLERANCE_SECS: i64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("meta encode error: {0}")]
    Meta(#[from] serde_json::Error),
}

/// One historical point for a (provider, metric) pair.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPoint {
    pub timestamp: i64,
    pub value: f64,
    pub meta: Value,
}

/// The most recent cost snapshot for a provider, with the tokens
/// point from the same poll merged in when one exists.
#[derive(Debug, Clone, Serialize)]
pub struct LatestUsage {
    pub cost_usd: f64,
    pub timestamp: i64,
    pub tokens_total: f64,
    pub meta: Value,
}

/// Append-only usage point store.
pub struct UsageStore {
    db: Mutex<Connection>,
}

impl UsageStore {
    /// Open (or create) the store at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let db = Connection::open(db_path)?;

        // WAL mode for concurrent reads
        db.pragma_update(None, "journal_mode", "WAL")?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS usage_points (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                metric TEXT NOT NULL,
                value REAL NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_provider_ts ON usage_points (provider, timestamp);
            ",
        )?;

        Ok(Self { db: Mutex::new(db) })
    }

    /// Append one point stamped with the current time. Returns the rowid.
    pub fn append(
        &self,
        provider: &str,
        metric: &str,
        value: f64,
        meta: &Map<String, Value>,
    ) -> Result<i64, StoreError> {
        self.append_at(provider, metric, value, meta, Utc::now().timestamp())
    }

    fn append_at(
        &self,
        provider: &str,
        metric: &str,
        value: f64,
        meta: &Map<String, Value>,
        timestamp: i64,
    ) -> Result<i64, StoreError> {
        let meta_json = serde_json::to_string(meta)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO usage_points (provider, timestamp, metric, value, meta)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![provider, timestamp, metric, value, meta_json],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// All points for a (provider, metric) pair newer than
    /// `since_secs` ago, ascending by timestamp. No data is an empty
    /// vec, never an error.
    pub fn history(
        &self,
        provider: &str,
        metric: &str,
        since_secs: i64,
    ) -> Result<Vec<HistoryPoint>, StoreError> {
        let cutoff = Utc::now().timestamp() - since_secs;
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT timestamp, value, meta FROM usage_points
             WHERE provider = ?1 AND metric = ?2 AND timestamp > ?3
             ORDER BY timestamp ASC",
        )?;

        let points = stmt
            .query_map(params![provider, metric, cutoff], |row| {
                let meta_json: String = row.get(2)?;
                Ok(HistoryPoint {
                    timestamp: row.get(0)?,
                    value: row.get(1)?,
                    meta: parse_meta(&meta_json),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(points)
    }

    /// The most recent cost point for a provider, merged with a
    /// tokens point within the join tolerance. `None` when the
    /// provider has never reported a cost — not zero-filled.
    pub fn latest(&self, provider: &str) -> Result<Option<LatestUsage>, StoreError> {
        let db = self.db.lock().unwrap();
        let cost_row = db
            .query_row(
                "SELECT value, timestamp, meta FROM usage_points
                 WHERE provider = ?1 AND metric = ?2
                 ORDER BY timestamp DESC, id DESC LIMIT 1",
                params![provider, METRIC_COST_USD],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((cost_usd, timestamp, meta_json)) = cost_row else {
            return Ok(None);
        };

        let tokens_total = db
            .query_row(
                "SELECT value FROM usage_points
                 WHERE provider = ?1 AND metric = ?2
                   AND timestamp >= ?3 AND timestamp <= ?4
                 ORDER BY timestamp DESC LIMIT 1",
                params![
                    provider,
                    METRIC_TOKENS_TOTAL,
                    timestamp - JOIN_TOLERANCE_SECS,
                    timestamp + JOIN_TOLERANCE_SECS
                ],
                |row| row.get::<_, f64>(0),
            )
            .optional()?
            .unwrap_or(0.0);

        Ok(Some(LatestUsage {
            cost_usd,
            timestamp,
            tokens_total,
            meta: parse_meta(&meta_json),
        }))
    }
}

fn parse_meta(meta_json: &str) -> Value {
    serde_json::from_str(meta_json).unwrap_or_else(|_| Value::Object(Map::new()))
}
