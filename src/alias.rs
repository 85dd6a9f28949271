use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::cache::exists_with;
use crate::clock::Clock;
use crate::db::{parse_timestamp, to_timestamp};
use crate::errors::{AppError, AppResult};
use crate::normalize::{canonical_key, normalize};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AliasMapping {
    /// Canonical key of the spelling that should be folded.
    pub alias: String,
    /// Normalized address whose cache entry answers for the alias.
    pub canonical: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Curated duplicate-spelling mappings. Lookups go through
/// [`canonical_key`], so `Dresdner Str. 5` and `dresdner straße 5` match the
/// same row.
pub trait AliasStore: Send + Sync {
    fn resolve_alias(&self, addr: &str) -> AppResult<Option<String>>;
    fn bulk_resolve(&self, addrs: &[String]) -> AppResult<HashMap<String, String>>;
    fn set_alias(
        &self,
        query: &str,
        canonical: &str,
        created_by: Option<&str>,
    ) -> AppResult<AliasMapping>;
    fn remove_alias(&self, query: &str) -> AppResult<bool>;
    fn list_aliases(&self) -> AppResult<Vec<AliasMapping>>;
}

pub struct SqliteAliasStore {
    db: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteAliasStore {
    pub fn new(db: Arc<Mutex<Connection>>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

impl AliasStore for SqliteAliasStore {
    fn resolve_alias(&self, addr: &str) -> AppResult<Option<String>> {
        let key = canonical_key(addr);
        if key.is_empty() {
            return Ok(None);
        }
        let conn = self.db.lock();
        lookup_with(&conn, &key)
    }

    fn bulk_resolve(&self, addrs: &[String]) -> AppResult<HashMap<String, String>> {
        let conn = self.db.lock();
        let mut resolved = HashMap::new();
        for addr in addrs {
            let key = canonical_key(addr);
            if key.is_empty() {
                continue;
            }
            if let Some(canonical) = lookup_with(&conn, &key)? {
                resolved.insert(addr.clone(), canonical);
            }
        }
        Ok(resolved)
    }

    fn set_alias(
        &self,
        query: &str,
        canonical: &str,
        created_by: Option<&str>,
    ) -> AppResult<AliasMapping> {
        let query_norm = normalize(query)?;
        let canonical_norm = normalize(canonical)?;
        if query_norm.is_empty() || canonical_norm.is_empty() {
            return Err(AppError::InvalidAlias("both addresses must be non-empty".into()));
        }

        let alias = canonical_key(query_norm.as_str());
        if alias == canonical_key(canonical_norm.as_str()) {
            return Err(AppError::InvalidAlias(format!(
                "{query_norm:?} already is its own canonical form"
            )));
        }

        let now = self.clock.now();
        let conn = self.db.lock();
        if !exists_with(&conn, canonical_norm.as_str())? {
            return Err(AppError::InvalidAlias(format!(
                "canonical address {canonical_norm:?} has no cached coordinate"
            )));
        }

        conn.execute(
            "INSERT INTO geo_alias (address_norm, canonical_norm, created_by, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(address_norm) DO UPDATE SET
                canonical_norm = excluded.canonical_norm,
                created_by = excluded.created_by,
                created_at = excluded.created_at",
            (alias.as_str(), canonical_norm.as_str(), created_by, to_timestamp(now)),
        )?;
        info!(
            target: "geo_alias",
            alias = %alias,
            canonical = %canonical_norm,
            "alias stored"
        );

        Ok(AliasMapping {
            alias,
            canonical: canonical_norm.into_string(),
            created_by: created_by.map(str::to_string),
            created_at: now,
        })
    }

    fn remove_alias(&self, query: &str) -> AppResult<bool> {
        let key = canonical_key(normalize(query)?.as_str());
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM geo_alias WHERE address_norm = ?1", [key])?;
        Ok(removed > 0)
    }

    fn list_aliases(&self) -> AppResult<Vec<AliasMapping>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT address_norm, canonical_norm, created_by, created_at
            FROM geo_alias
            ORDER BY address_norm ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let created_at: String = row.get(3)?;
                Ok(AliasMapping {
                    alias: row.get(0)?,
                    canonical: row.get(1)?,
                    created_by: row.get(2)?,
                    created_at: parse_timestamp(&created_at),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn lookup_with(conn: &Connection, key: &str) -> AppResult<Option<String>> {
    conn.query_row(
        "SELECT canonical_norm FROM geo_alias WHERE address_norm = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
    .map_err(AppError::from)
}
