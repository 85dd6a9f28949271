use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::{Serialize, Serializer};
use tracing::debug;

use crate::clock::Clock;
use crate::db::{parse_timestamp, to_timestamp};
use crate::errors::{AppError, AppResult};

/// SQLite caps bound parameters per statement; lookups are chunked below it.
pub(crate) const SQL_CHUNK: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolutionSource {
    Synonym,
    Alias,
    Heuristic,
    Manual,
    Provider(String),
}

impl ResolutionSource {
    pub fn as_tag(&self) -> &str {
        match self {
            ResolutionSource::Synonym => "synonym",
            ResolutionSource::Alias => "alias",
            ResolutionSource::Heuristic => "heuristic",
            ResolutionSource::Manual => "manual",
            ResolutionSource::Provider(name) => name.as_str(),
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "synonym" => ResolutionSource::Synonym,
            "alias" => ResolutionSource::Alias,
            "heuristic" => ResolutionSource::Heuristic,
            "manual" => ResolutionSource::Manual,
            other => ResolutionSource::Provider(other.to_string()),
        }
    }
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl Serialize for ResolutionSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_tag())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub address: String,
    pub lat: f64,
    pub lon: f64,
    pub source: ResolutionSource,
    pub updated_at: DateTime<Utc>,
}

/// Durable address to coordinate mapping. Entries never expire.
pub trait CacheStore: Send + Sync {
    fn get(&self, addr: &str) -> AppResult<Option<CacheEntry>>;
    fn bulk_get(&self, addrs: &[String]) -> AppResult<HashMap<String, CacheEntry>>;
    fn upsert(&self, addr: &str, lat: f64, lon: f64, source: &ResolutionSource)
        -> AppResult<CacheEntry>;
    fn delete(&self, addr: &str) -> AppResult<bool>;
    fn count(&self) -> AppResult<u64>;
}

pub struct SqliteCacheStore {
    db: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteCacheStore {
    pub fn new(db: Arc<Mutex<Connection>>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

impl CacheStore for SqliteCacheStore {
    fn get(&self, addr: &str) -> AppResult<Option<CacheEntry>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT address_norm, lat, lon, source, updated_at FROM geo_cache WHERE address_norm = ?1",
            [addr],
            parse_entry,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn bulk_get(&self, addrs: &[String]) -> AppResult<HashMap<String, CacheEntry>> {
        let mut found = HashMap::new();
        if addrs.is_empty() {
            return Ok(found);
        }

        let conn = self.db.lock();
        for chunk in addrs.chunks(SQL_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT address_norm, lat, lon, source, updated_at FROM geo_cache WHERE address_norm IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), parse_entry)?;
            for row in rows {
                let entry = row?;
                found.insert(entry.address.clone(), entry);
            }
        }
        debug!(target: "geo_cache", requested = addrs.len(), hits = found.len(), "bulk cache lookup");
        Ok(found)
    }

    fn upsert(
        &self,
        addr: &str,
        lat: f64,
        lon: f64,
        source: &ResolutionSource,
    ) -> AppResult<CacheEntry> {
        let conn = self.db.lock();
        upsert_with(&conn, addr, lat, lon, source, self.clock.now())
    }

    fn delete(&self, addr: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM geo_cache WHERE address_norm = ?1", [addr])?;
        Ok(removed > 0)
    }

    fn count(&self) -> AppResult<u64> {
        let conn = self.db.lock();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM geo_cache", [], |row| row.get(0))?;
        Ok(total.max(0) as u64)
    }
}

/// Single-statement upsert, usable inside a caller's transaction.
pub(crate) fn upsert_with(
    conn: &Connection,
    addr: &str,
    lat: f64,
    lon: f64,
    source: &ResolutionSource,
    now: DateTime<Utc>,
) -> AppResult<CacheEntry> {
    conn.execute(
        "INSERT INTO geo_cache (address_norm, lat, lon, source, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(address_norm) DO UPDATE SET
            lat = excluded.lat,
            lon = excluded.lon,
            source = excluded.source,
            updated_at = excluded.updated_at",
        (addr, lat, lon, source.as_tag(), to_timestamp(now)),
    )?;
    Ok(CacheEntry {
        address: addr.to_string(),
        lat,
        lon,
        source: source.clone(),
        updated_at: now,
    })
}

pub(crate) fn exists_with(conn: &Connection, addr: &str) -> AppResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM geo_cache WHERE address_norm = ?1",
            [addr],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    let address: String = row.get(0)?;
    let lat: f64 = row.get(1)?;
    let lon: f64 = row.get(2)?;
    let source: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(CacheEntry {
        address,
        lat,
        lon,
        source: ResolutionSource::from_tag(&source),
        updated_at: parse_timestamp(&updated_at),
    })
}
