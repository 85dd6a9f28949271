use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::SQL_CHUNK;
use crate::clock::Clock;
use crate::db::{parse_timestamp, to_timestamp};
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailReason {
    TransientError,
    NoResult,
}

impl FailReason {
    pub fn as_tag(&self) -> &'static str {
        match self {
            FailReason::TransientError => "transient-error",
            FailReason::NoResult => "no-result",
        }
    }

    fn from_tag(tag: &str) -> Self {
        match tag {
            "no-result" => FailReason::NoResult,
            _ => FailReason::TransientError,
        }
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailEntry {
    pub address: String,
    pub reason: FailReason,
    pub detail: Option<String>,
    pub until: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FailEntry {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.until > now
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FailStats {
    pub total: u64,
    pub active: u64,
}

/// TTL-governed record of failed lookups. An entry suppresses retries only
/// while `until` lies in the future; a success always deletes it.
pub trait FailCache: Send + Sync {
    fn skip_set(&self, addrs: &[String]) -> AppResult<HashSet<String>>;
    fn mark_transient(&self, addr: &str, ttl_minutes: u32, detail: &str) -> AppResult<FailEntry>;
    fn mark_no_result(&self, addr: &str, ttl_minutes: u32, detail: &str) -> AppResult<FailEntry>;
    fn clear(&self, addr: &str) -> AppResult<()>;
    fn clear_all(&self) -> AppResult<usize>;
    fn cleanup_expired(&self) -> AppResult<usize>;
    fn status(&self, addr: &str) -> AppResult<Option<FailEntry>>;
    fn stats(&self) -> AppResult<FailStats>;
    fn reasons_histogram(&self) -> AppResult<BTreeMap<String, u64>>;
}

pub struct SqliteFailCache {
    db: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteFailCache {
    pub fn new(db: Arc<Mutex<Connection>>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    fn mark(
        &self,
        addr: &str,
        reason: FailReason,
        ttl_minutes: u32,
        detail: &str,
    ) -> AppResult<FailEntry> {
        let now = self.clock.now();
        // Stored with second precision.
        let until = (now + Duration::minutes(i64::from(ttl_minutes.max(1)))).trunc_subsecs(0);
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO geo_fail (address_norm, reason, detail, until_ts, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(address_norm) DO UPDATE SET
                reason = excluded.reason,
                detail = excluded.detail,
                until_ts = excluded.until_ts,
                updated_at = excluded.updated_at",
            (
                addr,
                reason.as_tag(),
                detail,
                until.timestamp(),
                to_timestamp(now),
            ),
        )?;
        info!(
            target: "fail_cache",
            address = %addr,
            reason = %reason,
            ttl_minutes,
            "recorded failed lookup"
        );
        Ok(FailEntry {
            address: addr.to_string(),
            reason,
            detail: Some(detail.to_string()),
            until,
            updated_at: now,
        })
    }
}

impl FailCache for SqliteFailCache {
    fn skip_set(&self, addrs: &[String]) -> AppResult<HashSet<String>> {
        let mut active = HashSet::new();
        if addrs.is_empty() {
            return Ok(active);
        }

        let now_ts = self.clock.now().timestamp();
        let conn = self.db.lock();
        for chunk in addrs.chunks(SQL_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT address_norm FROM geo_fail WHERE until_ts > {now_ts} AND address_norm IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?;
            for row in rows {
                active.insert(row?);
            }
        }
        if !active.is_empty() {
            debug!(target: "fail_cache", skipped = active.len(), "active failures suppress lookups");
        }
        Ok(active)
    }

    fn mark_transient(&self, addr: &str, ttl_minutes: u32, detail: &str) -> AppResult<FailEntry> {
        self.mark(addr, FailReason::TransientError, ttl_minutes, detail)
    }

    fn mark_no_result(&self, addr: &str, ttl_minutes: u32, detail: &str) -> AppResult<FailEntry> {
        self.mark(addr, FailReason::NoResult, ttl_minutes, detail)
    }

    fn clear(&self, addr: &str) -> AppResult<()> {
        let conn = self.db.lock();
        clear_with(&conn, addr)
    }

    fn clear_all(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM geo_fail", [])?;
        info!(target: "fail_cache", removed, "cleared every failure record");
        Ok(removed)
    }

    fn cleanup_expired(&self) -> AppResult<usize> {
        let now_ts = self.clock.now().timestamp();
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM geo_fail WHERE until_ts <= ?1", [now_ts])?;
        debug!(target: "fail_cache", removed, "expired failure records purged");
        Ok(removed)
    }

    fn status(&self, addr: &str) -> AppResult<Option<FailEntry>> {
        let now = self.clock.now();
        let conn = self.db.lock();
        let entry = conn
            .query_row(
                "SELECT address_norm, reason, detail, until_ts, updated_at FROM geo_fail WHERE address_norm = ?1",
                [addr],
                parse_entry,
            )
            .optional()
            .map_err(AppError::from)?;
        Ok(entry.filter(|entry| entry.is_active(now)))
    }

    fn stats(&self) -> AppResult<FailStats> {
        let now_ts = self.clock.now().timestamp();
        let conn = self.db.lock();
        let (total, active): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN until_ts > ?1 THEN 1 ELSE 0 END), 0) FROM geo_fail",
            [now_ts],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(FailStats {
            total: total.max(0) as u64,
            active: active.max(0) as u64,
        })
    }

    fn reasons_histogram(&self) -> AppResult<BTreeMap<String, u64>> {
        let now_ts = self.clock.now().timestamp();
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT reason, COUNT(*) FROM geo_fail WHERE until_ts > ?1 GROUP BY reason",
        )?;
        let rows = stmt.query_map([now_ts], |row| {
            let reason: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((reason, count.max(0) as u64))
        })?;
        let mut histogram = BTreeMap::new();
        for row in rows {
            let (reason, count) = row?;
            histogram.insert(reason, count);
        }
        Ok(histogram)
    }
}

pub(crate) fn clear_with(conn: &Connection, addr: &str) -> AppResult<()> {
    let removed = conn.execute("DELETE FROM geo_fail WHERE address_norm = ?1", [addr])?;
    if removed > 0 {
        debug!(target: "fail_cache", address = %addr, "failure record cleared");
    }
    Ok(())
}

fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailEntry> {
    let address: String = row.get(0)?;
    let reason: String = row.get(1)?;
    let detail: Option<String> = row.get(2)?;
    let until_ts: i64 = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(FailEntry {
        address,
        reason: FailReason::from_tag(&reason),
        detail,
        until: DateTime::from_timestamp(until_ts, 0).unwrap_or_default(),
        updated_at: parse_timestamp(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::open_in_memory;

    fn fail_cache() -> (SqliteFailCache, ManualClock) {
        let clock = ManualClock::default();
        let db = Arc::new(Mutex::new(open_in_memory().unwrap()));
        (SqliteFailCache::new(db, Arc::new(clock.clone())), clock)
    }

    fn keys(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn no_result_suppresses_until_ttl_expires() {
        let (fails, clock) = fail_cache();
        fails.mark_no_result("Nirgendwo 1", 60, "empty").unwrap();

        let lookups = keys(&["Nirgendwo 1", "Irgendwo 2"]);
        let skipped = fails.skip_set(&lookups).unwrap();
        assert_eq!(skipped.len(), 1);
        assert!(skipped.contains("Nirgendwo 1"));

        clock.advance(Duration::minutes(59));
        assert!(fails.skip_set(&lookups).unwrap().contains("Nirgendwo 1"));

        clock.advance(Duration::minutes(2));
        assert!(fails.skip_set(&lookups).unwrap().is_empty());
        assert!(fails.status("Nirgendwo 1").unwrap().is_none());
    }

    #[test]
    fn repeated_failure_refreshes_until() {
        let (fails, clock) = fail_cache();
        let first = fails.mark_transient("Weg 5", 60, "timeout").unwrap();
        clock.advance(Duration::minutes(45));
        let second = fails.mark_no_result("Weg 5", 60, "empty").unwrap();
        assert!(second.until > first.until);

        clock.advance(Duration::minutes(30));
        let status = fails.status("Weg 5").unwrap().unwrap();
        assert_eq!(status.reason, FailReason::NoResult);
        assert_eq!(status.detail.as_deref(), Some("empty"));
    }

    #[test]
    fn clear_removes_entry_unconditionally() {
        let (fails, _) = fail_cache();
        fails.mark_no_result("Weg 7", 600, "empty").unwrap();
        fails.clear("Weg 7").unwrap();
        fails.clear("never-recorded").unwrap();
        assert!(fails.skip_set(&keys(&["Weg 7"])).unwrap().is_empty());
        assert_eq!(fails.stats().unwrap(), FailStats::default());
    }

    #[test]
    fn stats_histogram_and_cleanup_agree() {
        let (fails, clock) = fail_cache();
        fails.mark_transient("A 1", 10, "503").unwrap();
        fails.mark_no_result("B 2", 120, "empty").unwrap();
        fails.mark_no_result("C 3", 120, "outside service area").unwrap();

        clock.advance(Duration::minutes(11));
        assert_eq!(fails.stats().unwrap(), FailStats { total: 3, active: 2 });

        let histogram = fails.reasons_histogram().unwrap();
        assert_eq!(histogram.get("no-result"), Some(&2));
        assert_eq!(histogram.get("transient-error"), None);

        assert_eq!(fails.cleanup_expired().unwrap(), 1);
        assert_eq!(fails.stats().unwrap(), FailStats { total: 2, active: 2 });
        assert_eq!(fails.clear_all().unwrap(), 2);
    }

    #[test]
    fn zero_ttl_is_raised_to_one_minute() {
        let (fails, clock) = fail_cache();
        let entry = fails.mark_transient("Weg 9", 0, "reset").unwrap();
        assert_eq!(entry.until, (clock.now() + Duration::minutes(1)).trunc_subsecs(0));
    }

    #[test]
    fn returned_entry_matches_the_stored_row() {
        let (fails, clock) = fail_cache();
        let start = DateTime::parse_from_rfc3339("2026-03-02T08:15:42.875+00:00")
            .unwrap()
            .with_timezone(&Utc);
        clock.set(start);

        let marked = fails.mark_no_result("Weg 11", 30, "empty").unwrap();
        let stored = fails.status("Weg 11").unwrap().unwrap();
        assert_eq!(marked.until, stored.until);
        assert_eq!(marked.until.timestamp_subsec_nanos(), 0);
        assert_eq!(marked.until.timestamp(), (start + Duration::minutes(30)).timestamp());
    }
}
