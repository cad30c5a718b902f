//! Scan history rows.

use rusqlite::{params, Connection};
use std::path::Path;

use super::timestamp_now;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }
}

/// Counters written when a scan finishes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanTotals {
    pub scanned: usize,
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub id: i64,
    pub root: String,
    pub mode: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub totals: ScanTotals,
    pub status: String,
}

pub fn start_scan(conn: &Connection, root: &Path, mode: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO scans (root, mode, started_at, status) VALUES (?, ?, ?, ?)",
        params![
            root.to_string_lossy(),
            mode,
            timestamp_now(),
            ScanStatus::Running.as_str()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_scan(conn: &Connection, id: i64, totals: &ScanTotals, status: ScanStatus) -> Result<()> {
    conn.execute(
        r#"
        UPDATE scans SET
            completed_at = ?, files_scanned = ?, files_added = ?, files_updated = ?,
            files_skipped = ?, errors = ?, status = ?
        WHERE id = ?
        "#,
        params![
            timestamp_now(),
            totals.scanned as i64,
            totals.added as i64,
            totals.updated as i64,
            totals.skipped as i64,
            totals.errors as i64,
            status.as_str(),
            id,
        ],
    )?;
    Ok(())
}

pub fn recent_scans(conn: &Connection, limit: usize) -> Result<Vec<ScanRecord>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, root, mode, started_at, completed_at,
               files_scanned, files_added, files_updated, files_skipped, errors, status
        FROM scans
        ORDER BY id DESC
        LIMIT ?
        "#,
    )?;
    let scans = stmt
        .query_map([limit as i64], |row| {
            Ok(ScanRecord {
                id: row.get(0)?,
                root: row.get(1)?,
                mode: row.get(2)?,
                started_at: row.get(3)?,
                completed_at: row.get(4)?,
                totals: ScanTotals {
                    scanned: row.get::<_, i64>(5)? as usize,
                    added: row.get::<_, i64>(6)? as usize,
                    updated: row.get::<_, i64>(7)? as usize,
                    skipped: row.get::<_, i64>(8)? as usize,
                    errors: row.get::<_, i64>(9)? as usize,
                },
                status: row.get(10)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(scans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_scan_lifecycle() {
        let db = test_db();
        db.with_conn(|conn| {
            let id = start_scan(conn, Path::new("/media"), "full")?;
            let running = recent_scans(conn, 1)?;
            assert_eq!(running[0].status, "running");
            assert!(running[0].completed_at.is_none());

            let totals = ScanTotals {
                scanned: 3,
                added: 2,
                updated: 1,
                skipped: 0,
                errors: 0,
            };
            finish_scan(conn, id, &totals, ScanStatus::Completed)?;

            let done = &recent_scans(conn, 1)?[0];
            assert_eq!(done.id, id);
            assert_eq!(done.status, "completed");
            assert_eq!(done.totals.added, 2);
            assert!(done.completed_at.is_some());
            Ok(())
        })
        .unwrap();
    }
}
