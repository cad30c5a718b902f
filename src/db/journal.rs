//! Change journal: per path, the fingerprint the stored metadata describes.
//!
//! A journal hit lets a rescan skip a file without reading its asset row.
//! Rows are written in the same transaction as the asset write they
//! describe, after it, so a journal row never exists for an uncommitted
//! asset state. A row older than the asset's fingerprint marks metadata
//! that still has to be extracted again.

use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;

use super::{placeholders, unix_now, MAX_IN_PARAMS};
use crate::error::Result;

/// Fingerprints for the given keys, one query per 500 keys.
pub fn lookup(conn: &Connection, keys: &[String]) -> Result<HashMap<String, String>> {
    let mut found = HashMap::with_capacity(keys.len());
    for chunk in keys.chunks(MAX_IN_PARAMS) {
        let sql = format!(
            "SELECT path_key, fingerprint FROM change_journal WHERE path_key IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, fingerprint) = row?;
            found.insert(key, fingerprint);
        }
    }
    Ok(found)
}

pub fn record(conn: &Connection, path_key: &str, fingerprint: &str) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO change_journal (path_key, fingerprint, last_seen) VALUES (?, ?, ?)
        ON CONFLICT(path_key) DO UPDATE SET
            fingerprint = excluded.fingerprint,
            last_seen = excluded.last_seen
        "#,
        params![path_key, fingerprint, unix_now()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_record_then_lookup() {
        let db = test_db();
        db.with_conn(|conn| {
            record(conn, "/m/a.png", "fp1")?;
            record(conn, "/m/b.png", "fp2")?;
            record(conn, "/m/a.png", "fp3")?;

            let found = lookup(
                conn,
                &["/m/a.png".to_string(), "/m/b.png".to_string(), "/m/c.png".to_string()],
            )?;
            assert_eq!(found.len(), 2);
            assert_eq!(found["/m/a.png"], "fp3");
            assert_eq!(found["/m/b.png"], "fp2");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_lookup_spans_multiple_chunks() {
        let db = test_db();
        db.with_conn(|conn| {
            let keys: Vec<String> = (0..1200).map(|i| format!("/m/{i}.png")).collect();
            for key in &keys {
                record(conn, key, "fp")?;
            }
            assert_eq!(lookup(conn, &keys)?.len(), 1200);
            Ok(())
        })
        .unwrap();
    }
}
