// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! SQLite-backed catalog of every partition file in the lake.
//!
//! One row per file, keyed by its path relative to the data root. The
//! manifest is the source of truth for resumption (`max(time_to)` per
//! series) and for partition pruning in range queries. Writes run inside
//! `BEGIN IMMEDIATE` transactions so concurrent ingest jobs serialize;
//! readers go through the same connection guarded by a mutex.

use chrono::Utc;
use core_types::identity::normalize;
use core_types::SeriesIdentity;
use rusqlite::{params, Connection, OptionalExtension, ToSql, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("manifest entry {0} not found")]
    NotFound(i64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestError {
    /// SQLITE_BUSY surfaces when another process holds the write lock
    /// longer than the busy timeout.
    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            ManifestError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::DatabaseBusy
        )
    }
}

/// One catalog row. `path` is relative to the data root and unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: i64,
    pub exchange: String,
    pub market: String,
    pub symbol: String,
    pub data_type: String,
    pub period: Option<String>,
    pub path: String,
    pub time_from: Option<i64>,
    pub time_to: Option<i64>,
    pub row_count: i64,
    pub file_size: i64,
    pub checksum: String,
    pub version: Option<String>,
    pub created_at: String,
    pub last_modified: String,
}

/// Fields of a new or replacing row; timestamps are filled by `upsert`.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub identity: SeriesIdentity,
    pub data_type: String,
    pub period: Option<String>,
    pub path: String,
    pub time_from: Option<i64>,
    pub time_to: Option<i64>,
    pub row_count: i64,
    pub file_size: i64,
    pub checksum: String,
    pub version: Option<String>,
}

/// Filter for `find` / `delete_by`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub exchange: Option<String>,
    pub market: Option<String>,
    pub symbol: Option<String>,
    pub data_type: Option<String>,
    pub period: Option<String>,
    /// Keep rows whose `[time_from, time_to]` intersects this closed range.
    pub overlaps: Option<(i64, i64)>,
}

impl EntryFilter {
    pub fn for_identity(identity: &SeriesIdentity) -> Self {
        Self {
            exchange: Some(identity.exchange.clone()),
            market: Some(identity.market.clone()),
            symbol: Some(identity.symbol.clone()),
            ..Self::default()
        }
    }

    fn to_sql(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        let mut push = |clause: &str, value: Box<dyn ToSql>| {
            clauses.push(format!("{} = ?{}", clause, values.len() + 1));
            values.push(value);
        };
        if let Some(exchange) = &self.exchange {
            push("exchange", Box::new(normalize(exchange)));
        }
        if let Some(market) = &self.market {
            push("market", Box::new(normalize(market)));
        }
        if let Some(symbol) = &self.symbol {
            push("symbol", Box::new(normalize(symbol)));
        }
        if let Some(data_type) = &self.data_type {
            push("type", Box::new(data_type.clone()));
        }
        if let Some(period) = &self.period {
            push("period", Box::new(period.clone()));
        }
        if let Some((t0, t1)) = self.overlaps {
            clauses.push(format!(
                "time_from <= ?{} AND time_to >= ?{}",
                values.len() + 1,
                values.len() + 2
            ));
            values.push(Box::new(t1));
            values.push(Box::new(t0));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (where_sql, values)
    }
}

/// Reconcile report: catalog/filesystem discrepancies, not remediated here.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Parquet files under the root with no manifest row.
    pub orphans: Vec<String>,
    /// Manifest rows whose file is gone.
    pub dead_links: Vec<String>,
}

const SELECT_COLUMNS: &str = "id, exchange, market, symbol, type, period, path, \
     time_from, time_to, row_count, file_size, checksum, version, created_at, last_modified";

pub struct Manifest {
    conn: Mutex<Connection>,
}

impl Manifest {
    pub fn open(db_path: &Path) -> Result<Self, ManifestError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange TEXT NOT NULL,
                market TEXT NOT NULL,
                symbol TEXT NOT NULL,
                type TEXT NOT NULL,
                period TEXT,
                path TEXT UNIQUE NOT NULL,
                time_from INTEGER,
                time_to INTEGER,
                row_count INTEGER NOT NULL DEFAULT 0,
                file_size INTEGER NOT NULL DEFAULT 0,
                checksum TEXT NOT NULL DEFAULT '',
                version TEXT,
                created_at TEXT NOT NULL,
                last_modified TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_entries_series
                ON entries (exchange, symbol, market, type, period);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace by path. Replacing keeps `id` and `created_at` and
    /// advances `last_modified`, so re-writing a partition updates its row
    /// in place rather than duplicating it.
    pub fn upsert(&self, entry: &NewEntry) -> Result<i64, ManifestError> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().expect("manifest lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO entries (exchange, market, symbol, type, period, path,
                 time_from, time_to, row_count, file_size, checksum, version,
                 created_at, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
             ON CONFLICT(path) DO UPDATE SET
                 exchange = excluded.exchange,
                 market = excluded.market,
                 symbol = excluded.symbol,
                 type = excluded.type,
                 period = excluded.period,
                 time_from = excluded.time_from,
                 time_to = excluded.time_to,
                 row_count = excluded.row_count,
                 file_size = excluded.file_size,
                 checksum = excluded.checksum,
                 version = excluded.version,
                 last_modified = excluded.last_modified",
            params![
                entry.identity.exchange,
                entry.identity.market,
                entry.identity.symbol,
                entry.data_type,
                entry.period,
                entry.path,
                entry.time_from,
                entry.time_to,
                entry.row_count,
                entry.file_size,
                entry.checksum,
                entry.version,
                now,
            ],
        )?;
        let id = tx.query_row(
            "SELECT id FROM entries WHERE path = ?1",
            params![entry.path],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(id)
    }

    pub fn find(&self, filter: &EntryFilter) -> Result<Vec<ManifestEntry>, ManifestError> {
        let (where_sql, values) = filter.to_sql();
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM entries{where_sql} ORDER BY time_from, id"
        );
        let conn = self.conn.lock().expect("manifest lock poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get(&self, id: i64) -> Result<ManifestEntry, ManifestError> {
        let conn = self.conn.lock().expect("manifest lock poisoned");
        let sql = format!("SELECT {SELECT_COLUMNS} FROM entries WHERE id = ?1");
        conn.query_row(&sql, params![id], row_to_entry)
            .optional()?
            .ok_or(ManifestError::NotFound(id))
    }

    pub fn get_by_path(&self, path: &str) -> Result<Option<ManifestEntry>, ManifestError> {
        let conn = self.conn.lock().expect("manifest lock poisoned");
        let sql = format!("SELECT {SELECT_COLUMNS} FROM entries WHERE path = ?1");
        Ok(conn.query_row(&sql, params![path], row_to_entry).optional()?)
    }

    /// Remove matching rows, returning the removed set so callers can delete
    /// the files behind them.
    pub fn delete_by(&self, filter: &EntryFilter) -> Result<Vec<ManifestEntry>, ManifestError> {
        let (where_sql, values) = filter.to_sql();
        let mut conn = self.conn.lock().expect("manifest lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = {
            let sql = format!("SELECT {SELECT_COLUMNS} FROM entries{where_sql}");
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(values.iter()), row_to_entry)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        tx.execute(
            &format!("DELETE FROM entries{where_sql}"),
            rusqlite::params_from_iter(values.iter()),
        )?;
        tx.commit()?;
        Ok(removed)
    }

    /// Remove the row for one file, if present.
    pub fn delete_by_path(&self, path: &str) -> Result<bool, ManifestError> {
        let conn = self.conn.lock().expect("manifest lock poisoned");
        let removed = conn.execute("DELETE FROM entries WHERE path = ?1", params![path])?;
        Ok(removed > 0)
    }

    pub fn delete_by_id(&self, id: i64) -> Result<ManifestEntry, ManifestError> {
        let entry = self.get(id)?;
        let conn = self.conn.lock().expect("manifest lock poisoned");
        conn.execute("DELETE FROM entries WHERE id = ?1", params![id])?;
        Ok(entry)
    }

    /// Resume point for a series: the largest `time_to` across its rows.
    pub fn max_time_to(
        &self,
        identity: &SeriesIdentity,
        data_type: &str,
        period: Option<&str>,
    ) -> Result<Option<i64>, ManifestError> {
        let conn = self.conn.lock().expect("manifest lock poisoned");
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(time_to) FROM entries
             WHERE exchange = ?1 AND market = ?2 AND symbol = ?3 AND type = ?4
               AND (?5 IS NULL OR period = ?5)",
            params![
                identity.exchange,
                identity.market,
                identity.symbol,
                data_type,
                period,
            ],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Latest feature row by lexicographic `version`, ties broken by
    /// `created_at` descending.
    pub fn latest_version(
        &self,
        feature_set: &str,
        identity: &SeriesIdentity,
    ) -> Result<Option<ManifestEntry>, ManifestError> {
        let conn = self.conn.lock().expect("manifest lock poisoned");
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM entries
             WHERE type = ?1 AND exchange = ?2 AND market = ?3 AND symbol = ?4
             ORDER BY version DESC, created_at DESC LIMIT 1"
        );
        Ok(conn
            .query_row(
                &sql,
                params![
                    feature_set,
                    identity.exchange,
                    identity.market,
                    identity.symbol
                ],
                row_to_entry,
            )
            .optional()?)
    }

    /// Distinct feature-set names known to the catalog.
    pub fn feature_sets(&self) -> Result<Vec<String>, ManifestError> {
        let conn = self.conn.lock().expect("manifest lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT DISTINCT type FROM entries
             WHERE type NOT IN ('raw', 'funding') ORDER BY type",
        )?;
        let sets = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sets)
    }

    /// Walk the data root and report files without rows and rows without
    /// files. Read-only; remediation is the caller's call.
    pub fn reconcile(&self, root: &Path) -> Result<ReconcileReport, ManifestError> {
        let mut on_disk = BTreeSet::new();
        collect_parquet(root, root, &mut on_disk)?;

        let cataloged: BTreeSet<String> = self
            .find(&EntryFilter::default())?
            .into_iter()
            .map(|e| e.path)
            .collect();

        Ok(ReconcileReport {
            orphans: on_disk.difference(&cataloged).cloned().collect(),
            dead_links: cataloged.difference(&on_disk).cloned().collect(),
        })
    }
}

fn collect_parquet(
    root: &Path,
    dir: &Path,
    out: &mut BTreeSet<String>,
) -> Result<(), ManifestError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_parquet(root, &path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            out.insert(rel_path_string(rel));
        }
    }
    Ok(())
}

/// Manifest paths always use forward slashes, whatever the platform.
pub fn rel_path_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a manifest-relative path back onto the data root.
pub fn resolve_path(root: &Path, rel: &str) -> PathBuf {
    let candidate = Path::new(rel);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManifestEntry> {
    Ok(ManifestEntry {
        id: row.get(0)?,
        exchange: row.get(1)?,
        market: row.get(2)?,
        symbol: row.get(3)?,
        data_type: row.get(4)?,
        period: row.get(5)?,
        path: row.get(6)?,
        time_from: row.get(7)?,
        time_to: row.get(8)?,
        row_count: row.get(9)?,
        file_size: row.get(10)?,
        checksum: row.get(11)?,
        version: row.get(12)?,
        created_at: row.get(13)?,
        last_modified: row.get(14)?,
    })
}
