pub const SCHEMA: &str = r#"
-- Assets: one row per catalogued file
CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filepath TEXT NOT NULL,
    path_key TEXT NOT NULL UNIQUE,     -- case-folded on case-insensitive filesystems
    filename TEXT NOT NULL,
    subfolder TEXT NOT NULL DEFAULT '',
    source TEXT NOT NULL DEFAULT 'default',
    kind TEXT NOT NULL,                -- image/video/audio/model3d
    ext TEXT NOT NULL,

    width INTEGER,
    height INTEGER,
    duration REAL,

    size_bytes INTEGER NOT NULL,
    mtime_ns INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,

    -- Hashes for duplicate detection
    content_hash TEXT,
    perceptual_hash TEXT,
    hash_state TEXT NOT NULL DEFAULT 'pending',  -- pending/done/failed
    hash_fingerprint TEXT,                       -- fingerprint the hashes were computed for

    indexed_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_assets_content_hash ON assets(content_hash);
CREATE INDEX IF NOT EXISTS idx_assets_kind ON assets(kind);
CREATE INDEX IF NOT EXISTS idx_assets_subfolder ON assets(subfolder);
CREATE INDEX IF NOT EXISTS idx_assets_hash_state ON assets(hash_state);

-- Extracted and user-set metadata, 1:1 with assets
CREATE TABLE IF NOT EXISTS asset_metadata (
    asset_id INTEGER PRIMARY KEY,
    rating INTEGER NOT NULL DEFAULT 0,
    tags TEXT NOT NULL DEFAULT '[]',       -- JSON array, ordered and unique
    tags_text TEXT NOT NULL DEFAULT '',    -- flattened for full-text indexing
    has_workflow INTEGER NOT NULL DEFAULT 0,
    has_generation_data INTEGER NOT NULL DEFAULT 0,
    quality TEXT NOT NULL DEFAULT 'none',  -- none/degraded/partial/full
    raw TEXT,                              -- extracted payload as JSON
    updated_at TEXT NOT NULL,
    FOREIGN KEY (asset_id) REFERENCES assets(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_asset_metadata_quality ON asset_metadata(quality);

-- Last fingerprint seen for each path, written after the asset row commits
CREATE TABLE IF NOT EXISTS change_journal (
    path_key TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    last_seen INTEGER NOT NULL             -- unix seconds
);

-- Extraction results by file state; outlives asset rows
CREATE TABLE IF NOT EXISTS metadata_cache (
    path_key TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    payload TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL,           -- unix seconds
    last_used INTEGER NOT NULL,            -- unix seconds
    PRIMARY KEY (path_key, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_metadata_cache_last_used ON metadata_cache(last_used);

-- Scan history
CREATE TABLE IF NOT EXISTS scans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    root TEXT NOT NULL,
    mode TEXT NOT NULL,                    -- 'full' or 'fast' or 'paths'
    started_at TEXT NOT NULL,
    completed_at TEXT,
    files_scanned INTEGER DEFAULT 0,
    files_added INTEGER DEFAULT 0,
    files_updated INTEGER DEFAULT 0,
    files_skipped INTEGER DEFAULT 0,
    errors INTEGER DEFAULT 0,
    status TEXT DEFAULT 'running'          -- 'running', 'completed', 'failed', 'cancelled'
);
"#;

/// Column additions for catalogs created by earlier releases. Each
/// statement fails harmlessly when the column already exists.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE assets ADD COLUMN hash_fingerprint TEXT",
    "ALTER TABLE assets ADD COLUMN source TEXT NOT NULL DEFAULT 'default'",
    "ALTER TABLE scans ADD COLUMN files_skipped INTEGER DEFAULT 0",
];
