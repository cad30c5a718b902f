//! Asset and asset-metadata rows.
//!
//! Only the persistence engine and the enrichment worker call the write
//! functions here; everything else reads.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::{placeholders, timestamp_now, MAX_IN_PARAMS};
use crate::error::Result;
use crate::scanner::fingerprint::FileStat;
use crate::scanner::kinds::FileKind;
use crate::scanner::metadata::{Extraction, Quality};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashState {
    Pending,
    Done,
    Failed,
}

impl HashState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashState::Pending => "pending",
            HashState::Done => "done",
            HashState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "done" => HashState::Done,
            "failed" => HashState::Failed,
            _ => HashState::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssetRecord {
    pub id: i64,
    pub filepath: String,
    pub filename: String,
    pub subfolder: String,
    pub source: String,
    pub kind: Option<FileKind>,
    pub ext: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<f64>,
    pub size_bytes: i64,
    pub mtime_ns: i64,
    pub fingerprint: String,
    pub content_hash: Option<String>,
    pub perceptual_hash: Option<String>,
    pub hash_state: HashState,
    pub indexed_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetMetadataRecord {
    pub asset_id: i64,
    pub rating: u8,
    pub tags: Vec<String>,
    pub tags_text: String,
    pub has_workflow: bool,
    pub has_generation_data: bool,
    pub quality: Quality,
    pub raw: Option<String>,
}

/// What the batch preparer needs to know about a path already in the catalog.
#[derive(Debug, Clone)]
pub struct ExistingAsset {
    pub id: i64,
    pub kind: Option<FileKind>,
    pub fingerprint: String,
    pub quality: Quality,
}

impl ExistingAsset {
    pub fn has_metadata(&self) -> bool {
        self.quality > Quality::None
    }

    pub fn has_rich_metadata(&self) -> bool {
        self.quality >= Quality::Partial
    }
}

/// Stat-derived columns written on insert and on every detected change.
#[derive(Debug, Clone)]
pub struct AssetRow<'a> {
    pub filepath: &'a str,
    pub path_key: &'a str,
    pub filename: &'a str,
    pub subfolder: &'a str,
    pub source: &'a str,
    pub kind: FileKind,
    pub ext: &'a str,
    pub stat: FileStat,
    pub fingerprint: &'a str,
}

/// Outcome of [`write_metadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataWrite {
    /// No prior row; everything written.
    Inserted,
    /// Tier was equal or better and something changed.
    Replaced,
    /// Tier was equal or better but nothing differed; no write.
    Unchanged,
    /// Tier was lower; only rating/tags merged (if they changed).
    Rejected,
}

impl MetadataWrite {
    /// The extraction's quality-dependent fields are now the stored ones.
    pub fn accepted(&self) -> bool {
        matches!(self, MetadataWrite::Inserted | MetadataWrite::Replaced | MetadataWrite::Unchanged)
    }

    pub fn wrote(&self) -> bool {
        matches!(self, MetadataWrite::Inserted | MetadataWrite::Replaced)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub total: i64,
    pub by_kind: Vec<(String, i64)>,
    pub by_quality: Vec<(String, i64)>,
    pub hashed: i64,
}

/// Batched lookup of existing rows by path key.
pub fn lookup_existing(conn: &Connection, keys: &[String]) -> Result<HashMap<String, ExistingAsset>> {
    let mut found = HashMap::with_capacity(keys.len());
    for chunk in keys.chunks(MAX_IN_PARAMS) {
        let sql = format!(
            r#"
            SELECT a.path_key, a.id, a.kind, a.fingerprint,
                   COALESCE(m.quality, 'none')
            FROM assets a
            LEFT JOIN asset_metadata m ON m.asset_id = a.id
            WHERE a.path_key IN ({})
            "#,
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                ExistingAsset {
                    id: row.get(1)?,
                    kind: FileKind::parse(&row.get::<_, String>(2)?),
                    fingerprint: row.get(3)?,
                    quality: Quality::parse(&row.get::<_, String>(4)?),
                },
            ))
        })?;
        for row in rows {
            let (key, asset) = row?;
            found.insert(key, asset);
        }
    }
    Ok(found)
}

pub fn insert_asset(conn: &Connection, row: &AssetRow<'_>, extraction: &Extraction) -> Result<i64> {
    let now = timestamp_now();
    conn.execute(
        r#"
        INSERT INTO assets (
            filepath, path_key, filename, subfolder, source, kind, ext,
            width, height, duration, size_bytes, mtime_ns, fingerprint,
            hash_state, indexed_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
        "#,
        params![
            row.filepath,
            row.path_key,
            row.filename,
            row.subfolder,
            row.source,
            row.kind.as_str(),
            row.ext,
            extraction.width,
            extraction.height,
            extraction.duration,
            row.stat.size as i64,
            row.stat.mtime_ns,
            row.fingerprint,
            now,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Refresh stat columns after a detected change. Hashes computed for an
/// earlier fingerprint are cleared and the row goes back to `pending`.
pub fn update_asset(conn: &Connection, id: i64, row: &AssetRow<'_>) -> Result<()> {
    conn.execute(
        r#"
        UPDATE assets SET
            filepath = ?1, filename = ?2, subfolder = ?3, source = ?4, kind = ?5, ext = ?6,
            size_bytes = ?7, mtime_ns = ?8, fingerprint = ?9,
            content_hash = CASE WHEN fingerprint = ?9 THEN content_hash ELSE NULL END,
            perceptual_hash = CASE WHEN fingerprint = ?9 THEN perceptual_hash ELSE NULL END,
            hash_state = CASE WHEN fingerprint = ?9 THEN hash_state ELSE 'pending' END,
            updated_at = ?10
        WHERE id = ?11
        "#,
        params![
            row.filepath,
            row.filename,
            row.subfolder,
            row.source,
            row.kind.as_str(),
            row.ext,
            row.stat.size as i64,
            row.stat.mtime_ns,
            row.fingerprint,
            timestamp_now(),
            id,
        ],
    )?;
    Ok(())
}

/// Overwrite dimensions/duration with any values the extraction resolved.
pub fn update_dimensions(conn: &Connection, id: i64, extraction: &Extraction) -> Result<()> {
    if extraction.width.is_none() && extraction.height.is_none() && extraction.duration.is_none() {
        return Ok(());
    }
    conn.execute(
        r#"
        UPDATE assets SET
            width = COALESCE(?, width),
            height = COALESCE(?, height),
            duration = COALESCE(?, duration)
        WHERE id = ?
        "#,
        params![extraction.width, extraction.height, extraction.duration, id],
    )?;
    Ok(())
}

pub fn get_metadata(conn: &Connection, asset_id: i64) -> Result<Option<AssetMetadataRecord>> {
    let record = conn
        .query_row(
            r#"
            SELECT asset_id, rating, tags, tags_text, has_workflow, has_generation_data, quality, raw
            FROM asset_metadata
            WHERE asset_id = ?
            "#,
            [asset_id],
            |row| {
                let tags_json: String = row.get(2)?;
                Ok(AssetMetadataRecord {
                    asset_id: row.get(0)?,
                    rating: row.get::<_, i64>(1)?.clamp(0, 5) as u8,
                    tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                    tags_text: row.get(3)?,
                    has_workflow: row.get::<_, i64>(4)? != 0,
                    has_generation_data: row.get::<_, i64>(5)? != 0,
                    quality: Quality::parse(&row.get::<_, String>(6)?),
                    raw: row.get(7)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

/// Merge two tag lists keeping first occurrences in order.
pub fn merge_tags(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(existing.len() + incoming.len());
    for tag in existing.iter().chain(incoming.iter()) {
        let tag = tag.trim();
        if !tag.is_empty() && !merged.iter().any(|t| t == tag) {
            merged.push(tag.to_string());
        }
    }
    merged
}

fn tags_text(tags: &[String]) -> String {
    tags.join(" ")
}

/// Write an extraction for `asset_id` under the monotonic quality policy.
///
/// Quality, flags and raw payload are replaced only when the incoming tier
/// ranks at or above the stored one. Rating never decreases through
/// extraction; tags are merged.
pub fn write_metadata(conn: &Connection, asset_id: i64, extraction: &Extraction) -> Result<MetadataWrite> {
    let raw = extraction.raw_json();
    let now = timestamp_now();

    let Some(stored) = get_metadata(conn, asset_id)? else {
        let tags = merge_tags(&[], &extraction.tags);
        conn.execute(
            r#"
            INSERT INTO asset_metadata (
                asset_id, rating, tags, tags_text, has_workflow, has_generation_data,
                quality, raw, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                asset_id,
                extraction.rating.unwrap_or(0).min(5),
                serde_json::to_string(&tags)?,
                tags_text(&tags),
                extraction.has_workflow,
                extraction.has_generation_data,
                extraction.quality.as_str(),
                raw,
                now,
            ],
        )?;
        return Ok(MetadataWrite::Inserted);
    };

    let rating = stored.rating.max(extraction.rating.unwrap_or(0).min(5));
    let tags = merge_tags(&stored.tags, &extraction.tags);
    let user_fields_changed = rating != stored.rating || tags != stored.tags;

    if extraction.quality < stored.quality {
        if user_fields_changed {
            conn.execute(
                "UPDATE asset_metadata SET rating = ?, tags = ?, tags_text = ?, updated_at = ? WHERE asset_id = ?",
                params![rating, serde_json::to_string(&tags)?, tags_text(&tags), now, asset_id],
            )?;
        }
        return Ok(MetadataWrite::Rejected);
    }

    let same_payload = stored.quality == extraction.quality
        && stored.has_workflow == extraction.has_workflow
        && stored.has_generation_data == extraction.has_generation_data
        && stored.raw.as_deref() == Some(raw.as_str());
    if same_payload && !user_fields_changed {
        return Ok(MetadataWrite::Unchanged);
    }

    conn.execute(
        r#"
        UPDATE asset_metadata SET
            rating = ?, tags = ?, tags_text = ?,
            has_workflow = ?, has_generation_data = ?, quality = ?, raw = ?,
            updated_at = ?
        WHERE asset_id = ?
        "#,
        params![
            rating,
            serde_json::to_string(&tags)?,
            tags_text(&tags),
            extraction.has_workflow,
            extraction.has_generation_data,
            extraction.quality.as_str(),
            raw,
            now,
            asset_id,
        ],
    )?;
    Ok(MetadataWrite::Replaced)
}

fn map_asset(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssetRecord> {
    Ok(AssetRecord {
        id: row.get(0)?,
        filepath: row.get(1)?,
        filename: row.get(2)?,
        subfolder: row.get(3)?,
        source: row.get(4)?,
        kind: FileKind::parse(&row.get::<_, String>(5)?),
        ext: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        duration: row.get(9)?,
        size_bytes: row.get(10)?,
        mtime_ns: row.get(11)?,
        fingerprint: row.get(12)?,
        content_hash: row.get(13)?,
        perceptual_hash: row.get(14)?,
        hash_state: HashState::parse(&row.get::<_, String>(15)?),
        indexed_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

const ASSET_COLUMNS: &str = r#"
    id, filepath, filename, subfolder, source, kind, ext,
    width, height, duration, size_bytes, mtime_ns, fingerprint,
    content_hash, perceptual_hash, hash_state, indexed_at, updated_at
"#;

pub fn get_asset_by_key(conn: &Connection, path_key: &str) -> Result<Option<AssetRecord>> {
    let sql = format!("SELECT {ASSET_COLUMNS} FROM assets WHERE path_key = ?");
    Ok(conn.query_row(&sql, [path_key], map_asset).optional()?)
}

pub fn get_asset(conn: &Connection, id: i64) -> Result<Option<AssetRecord>> {
    let sql = format!("SELECT {ASSET_COLUMNS} FROM assets WHERE id = ?");
    Ok(conn.query_row(&sql, [id], map_asset).optional()?)
}

pub fn count_assets(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?)
}

/// User-facing rating update, clamped to 0..=5.
pub fn set_rating(conn: &Connection, asset_id: i64, rating: u8) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE asset_metadata SET rating = ?, updated_at = ? WHERE asset_id = ?",
        params![rating.min(5), timestamp_now(), asset_id],
    )?;
    Ok(changed > 0)
}

/// User-facing tag replacement. Duplicates and blanks are dropped.
pub fn set_tags(conn: &Connection, asset_id: i64, tags: &[String]) -> Result<bool> {
    let tags = merge_tags(&[], tags);
    let changed = conn.execute(
        "UPDATE asset_metadata SET tags = ?, tags_text = ?, updated_at = ? WHERE asset_id = ?",
        params![serde_json::to_string(&tags)?, tags_text(&tags), timestamp_now(), asset_id],
    )?;
    Ok(changed > 0)
}

/// Explicit removal: asset, metadata (cascade) and journal rows.
/// Cache rows are left to their own eviction.
pub fn delete_by_keys(conn: &Connection, keys: &[String]) -> Result<usize> {
    let mut removed = 0;
    for chunk in keys.chunks(MAX_IN_PARAMS) {
        let marks = placeholders(chunk.len());
        removed += conn.execute(
            &format!("DELETE FROM assets WHERE path_key IN ({marks})"),
            params_from_iter(chunk.iter()),
        )?;
        conn.execute(
            &format!("DELETE FROM change_journal WHERE path_key IN ({marks})"),
            params_from_iter(chunk.iter()),
        )?;
    }
    Ok(removed)
}

/// Catalogued file paths at or below `root`.
pub fn paths_under(conn: &Connection, root: &Path) -> Result<Vec<PathBuf>> {
    let root = root.to_string_lossy();
    let prefix = format!("{}/", root.trim_end_matches(&['/', '\\'][..]));
    let mut stmt = conn.prepare(
        "SELECT filepath FROM assets WHERE substr(filepath, 1, length(?1)) = ?1 ORDER BY filepath",
    )?;
    let paths = stmt
        .query_map([prefix], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(paths.into_iter().map(PathBuf::from).collect())
}

/// An asset whose hashes are missing or stale.
#[derive(Debug, Clone)]
pub struct HashCandidate {
    pub id: i64,
    pub filepath: PathBuf,
    pub path_key: String,
    pub fingerprint: String,
    pub kind: Option<FileKind>,
}

/// Up to `limit` assets awaiting hashes with ids above `after_id`.
pub fn pending_hashes(conn: &Connection, after_id: i64, limit: usize) -> Result<Vec<HashCandidate>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, filepath, path_key, fingerprint, kind
        FROM assets
        WHERE hash_state = 'pending' AND id > ?
        ORDER BY id
        LIMIT ?
        "#,
    )?;
    let candidates = stmt
        .query_map(params![after_id, limit as i64], |row| {
            Ok(HashCandidate {
                id: row.get(0)?,
                filepath: PathBuf::from(row.get::<_, String>(1)?),
                path_key: row.get(2)?,
                fingerprint: row.get(3)?,
                kind: FileKind::parse(&row.get::<_, String>(4)?),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(candidates)
}

/// Store hashes computed for `hashed_fingerprint`. Returns false, writing
/// nothing, when the row has since moved to a different fingerprint.
pub fn record_hashes(
    conn: &Connection,
    id: i64,
    hashed_fingerprint: &str,
    content_hash: Option<&str>,
    perceptual_hash: Option<&str>,
    state: HashState,
) -> Result<bool> {
    let changed = conn.execute(
        r#"
        UPDATE assets SET
            content_hash = ?, perceptual_hash = ?, hash_state = ?, hash_fingerprint = ?
        WHERE id = ? AND fingerprint = ?
        "#,
        params![
            content_hash,
            perceptual_hash,
            state.as_str(),
            hashed_fingerprint,
            id,
            hashed_fingerprint,
        ],
    )?;
    Ok(changed > 0)
}

pub fn catalog_stats(conn: &Connection) -> Result<CatalogStats> {
    let total = count_assets(conn)?;

    let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM assets GROUP BY kind ORDER BY kind")?;
    let by_kind = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        r#"
        SELECT COALESCE(m.quality, 'none') AS q, COUNT(*)
        FROM assets a LEFT JOIN asset_metadata m ON m.asset_id = a.id
        GROUP BY q ORDER BY q
        "#,
    )?;
    let by_quality = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let hashed = conn.query_row(
        "SELECT COUNT(*) FROM assets WHERE hash_state = 'done'",
        [],
        |row| row.get(0),
    )?;

    Ok(CatalogStats {
        total,
        by_kind,
        by_quality,
        hashed,
    })
}
