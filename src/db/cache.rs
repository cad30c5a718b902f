//! Metadata cache keyed by (path, fingerprint).
//!
//! Entries live independently of asset rows: removing an asset does not
//! remove its cache entries, and eviction is purely time/size based.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{placeholders, unix_now, MAX_IN_PARAMS};
use crate::config::CacheConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub payload: String,
    pub payload_hash: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub expired: usize,
    pub evicted: usize,
}

pub fn payload_hash(payload: &str) -> String {
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

pub fn store(conn: &Connection, path_key: &str, fingerprint: &str, payload: &str) -> Result<()> {
    let now = unix_now();
    conn.execute(
        r#"
        INSERT INTO metadata_cache (path_key, fingerprint, payload, payload_hash, created_at, last_used)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(path_key, fingerprint) DO UPDATE SET
            payload = excluded.payload,
            payload_hash = excluded.payload_hash,
            last_used = excluded.last_used
        "#,
        params![path_key, fingerprint, payload, payload_hash(payload), now, now],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, path_key: &str, fingerprint: &str) -> Result<Option<CacheEntry>> {
    let entry = conn
        .query_row(
            "SELECT payload, payload_hash FROM metadata_cache WHERE path_key = ? AND fingerprint = ?",
            [path_key, fingerprint],
            |row| {
                Ok(CacheEntry {
                    payload: row.get(0)?,
                    payload_hash: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(entry)
}

/// Batched lookup of `(path_key, fingerprint)` pairs. Hits have their
/// `last_used` bumped so size-bound eviction prefers cold entries.
pub fn lookup(conn: &Connection, pairs: &[(String, String)]) -> Result<HashMap<String, CacheEntry>> {
    let wanted: HashMap<&str, &str> = pairs.iter().map(|(k, f)| (k.as_str(), f.as_str())).collect();
    let keys: Vec<&str> = wanted.keys().copied().collect();
    let mut hits = HashMap::new();

    for chunk in keys.chunks(MAX_IN_PARAMS) {
        let sql = format!(
            "SELECT path_key, fingerprint, payload, payload_hash FROM metadata_cache WHERE path_key IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                CacheEntry {
                    payload: row.get(2)?,
                    payload_hash: row.get(3)?,
                },
            ))
        })?;
        for row in rows {
            let (key, fingerprint, entry) = row?;
            if wanted.get(key.as_str()) == Some(&fingerprint.as_str()) {
                hits.insert(key, entry);
            }
        }
    }

    if !hits.is_empty() {
        let now = unix_now();
        let mut touch = conn.prepare_cached(
            "UPDATE metadata_cache SET last_used = ? WHERE path_key = ? AND fingerprint = ?",
        )?;
        for key in hits.keys() {
            touch.execute(params![now, key, wanted[key.as_str()]])?;
        }
    }

    Ok(hits)
}

pub fn count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM metadata_cache", [], |row| row.get(0))?)
}

/// Delete entries unused for longer than `ttl`, then the least recently
/// used remainder above `max_entries`.
pub fn cleanup(conn: &Connection, ttl: Duration, max_entries: usize, now: i64) -> Result<CleanupStats> {
    let cutoff = now - ttl.as_secs() as i64;
    let expired = conn.execute("DELETE FROM metadata_cache WHERE last_used < ?", [cutoff])?;

    let remaining = count(conn)? as usize;
    let evicted = if remaining > max_entries {
        conn.execute(
            r#"
            DELETE FROM metadata_cache WHERE rowid IN (
                SELECT rowid FROM metadata_cache ORDER BY last_used ASC, created_at ASC LIMIT ?
            )
            "#,
            [(remaining - max_entries) as i64],
        )?
    } else {
        0
    };

    Ok(CleanupStats { expired, evicted })
}

/// Rate-limited driver for [`cleanup`], owned by the indexer.
pub struct CacheMaintenance {
    ttl: Duration,
    max_entries: usize,
    interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl CacheMaintenance {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            ttl: config.ttl(),
            max_entries: config.max_entries,
            interval: config.cleanup_interval(),
            last_run: Mutex::new(None),
        }
    }

    /// Run a cleanup pass unless one ran within the configured interval.
    pub fn maybe_run(&self, conn: &Connection) -> Result<Option<CleanupStats>> {
        {
            let mut last_run = self.last_run.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(at) = *last_run {
                if at.elapsed() < self.interval {
                    return Ok(None);
                }
            }
            *last_run = Some(Instant::now());
        }

        let stats = cleanup(conn, self.ttl, self.max_entries, unix_now())?;
        tracing::debug!(expired = stats.expired, evicted = stats.evicted, "Metadata cache maintenance");
        Ok(Some(stats))
    }
}
