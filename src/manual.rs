use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::cache::{upsert_with, CacheEntry, ResolutionSource};
use crate::clock::Clock;
use crate::db::{parse_timestamp, to_timestamp};
use crate::errors::{AppError, AppResult};
use crate::failcache::clear_with;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualQueueEntry {
    pub id: i64,
    pub address: String,
    pub raw_address: String,
    pub reason: String,
    pub status: ManualStatus,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManualQueueStats {
    pub open: u64,
    pub by_reason: BTreeMap<String, u64>,
}

/// Addresses that exhausted automation and wait for an operator.
pub trait ManualQueue: Send + Sync {
    /// Returns `false` when the address already had an open entry.
    fn add_open(&self, addr: &str, raw_address: &str, reason: &str) -> AppResult<bool>;
    fn list_open(&self, limit: usize) -> AppResult<Vec<ManualQueueEntry>>;
    fn close(&self, addr: &str) -> AppResult<bool>;
    fn is_open(&self, addr: &str) -> AppResult<bool>;
    fn stats(&self) -> AppResult<ManualQueueStats>;
    fn export_csv(&self, path: &Path) -> AppResult<usize>;
    fn clear(&self) -> AppResult<usize>;
    /// Operator completion: cache write, fail clear and close commit together.
    fn complete(&self, addr: &str, lat: f64, lon: f64) -> AppResult<CacheEntry>;
}

pub struct SqliteManualQueue {
    db: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteManualQueue {
    pub fn new(db: Arc<Mutex<Connection>>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

impl ManualQueue for SqliteManualQueue {
    fn add_open(&self, addr: &str, raw_address: &str, reason: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO manual_queue (address_norm, raw_address, reason, status, created_at)
            VALUES (?1, ?2, ?3, 'open', ?4)",
            (addr, raw_address, reason, to_timestamp(self.clock.now())),
        )?;
        if inserted > 0 {
            info!(target: "manual_queue", address = %addr, reason, "address escalated");
        }
        Ok(inserted > 0)
    }

    fn list_open(&self, limit: usize) -> AppResult<Vec<ManualQueueEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, address_norm, raw_address, reason, status, created_at, closed_at
            FROM manual_queue
            WHERE status = 'open'
            ORDER BY created_at DESC, id DESC
            LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map([limit], parse_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn close(&self, addr: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        close_with(&conn, addr, self.clock.now())
    }

    fn is_open(&self, addr: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM manual_queue WHERE address_norm = ?1 AND status = 'open'",
                [addr],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn stats(&self) -> AppResult<ManualQueueStats> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT reason, COUNT(*) FROM manual_queue WHERE status = 'open' GROUP BY reason",
        )?;
        let rows = stmt.query_map([], |row| {
            let reason: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((reason, count.max(0) as u64))
        })?;

        let mut stats = ManualQueueStats::default();
        for row in rows {
            let (reason, count) = row?;
            stats.open += count;
            stats.by_reason.insert(reason, count);
        }
        Ok(stats)
    }

    fn export_csv(&self, path: &Path) -> AppResult<usize> {
        let entries = self.list_open(usize::MAX)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        for entry in &entries {
            writer.serialize(entry)?;
        }
        writer.flush()?;
        info!(
            target: "manual_queue",
            path = %path.display(),
            rows = entries.len(),
            "open escalations exported"
        );
        Ok(entries.len())
    }

    fn clear(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM manual_queue", [])?;
        Ok(removed)
    }

    fn complete(&self, addr: &str, lat: f64, lon: f64) -> AppResult<CacheEntry> {
        if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
            return Err(AppError::InvalidCoordinate { lat, lon });
        }

        let now = self.clock.now();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let entry = upsert_with(&tx, addr, lat, lon, &ResolutionSource::Manual, now)?;
        clear_with(&tx, addr)?;
        close_with(&tx, addr, now)?;
        tx.commit()?;

        info!(target: "manual_queue", address = %addr, lat, lon, "operator resolution stored");
        Ok(entry)
    }
}

fn close_with(conn: &Connection, addr: &str, now: DateTime<Utc>) -> AppResult<bool> {
    let closed = conn.execute(
        "UPDATE manual_queue SET status = 'closed', closed_at = ?2
        WHERE address_norm = ?1 AND status = 'open'",
        (addr, to_timestamp(now)),
    )?;
    Ok(closed > 0)
}

fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManualQueueEntry> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let closed_at: Option<String> = row.get(6)?;
    Ok(ManualQueueEntry {
        id: row.get(0)?,
        address: row.get(1)?,
        raw_address: row.get(2)?,
        reason: row.get(3)?,
        status: if status == "closed" {
            ManualStatus::Closed
        } else {
            ManualStatus::Open
        },
        created_at: parse_timestamp(&created_at),
        closed_at: closed_at.as_deref().map(parse_timestamp),
    })
}
