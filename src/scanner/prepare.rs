//! Batch preparer: walked paths → typed pending entries.
//!
//! One call handles one batch. Journal, asset and cache state for the
//! whole batch is read in a single store round trip; extraction runs
//! batched on the blocking pool for the files that still need it.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::discovery::WalkedFile;
use super::fingerprint::{self, FileStat};
use super::kinds::FileKind;
use super::metadata::{Extraction, MetadataExtractor};
use crate::db::assets::{self, AssetRow, ExistingAsset};
use crate::db::{cache, journal, CacheEntry, Database};
use crate::error::Result;

/// A walked file with the stat snapshot taken at preparation time.
#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub path: PathBuf,
    pub path_key: String,
    pub kind: FileKind,
    pub stat: FileStat,
    pub fingerprint: String,
}

/// Everything needed to write one file's asset, metadata and journal rows.
#[derive(Debug, Clone)]
pub struct EntryWrite {
    pub file: PreparedFile,
    /// Known asset row; `None` for new files.
    pub asset_id: Option<i64>,
    pub extraction: Extraction,
    /// The journal does not yet hold this fingerprint.
    pub journal_stale: bool,
    pub filepath: String,
    pub filename: String,
    pub subfolder: String,
    pub source: String,
    pub ext: String,
}

impl EntryWrite {
    pub fn row(&self) -> AssetRow<'_> {
        AssetRow {
            filepath: &self.filepath,
            path_key: &self.file.path_key,
            filename: &self.filename,
            subfolder: &self.subfolder,
            source: &self.source,
            kind: self.file.kind,
            ext: &self.ext,
            stat: self.file.stat,
            fingerprint: &self.file.fingerprint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Unchanged file whose stored metadata is already partial or better,
    /// with nothing cached to refresh from.
    RichMetadata,
    /// Gone between the walk and the stat.
    Vanished,
    /// Stat failed after retries.
    StatFailed,
}

/// One file's pending result within a batch.
#[derive(Debug, Clone)]
pub enum PendingEntry {
    Added(EntryWrite),
    Updated(EntryWrite),
    Refreshed(EntryWrite),
    SkippedJournal { path: PathBuf },
    Skipped { path: PathBuf, reason: SkipReason },
}

impl PendingEntry {
    pub fn path(&self) -> &Path {
        match self {
            PendingEntry::Added(w) | PendingEntry::Updated(w) | PendingEntry::Refreshed(w) => &w.file.path,
            PendingEntry::SkippedJournal { path } | PendingEntry::Skipped { path, .. } => path,
        }
    }

    pub fn write(&self) -> Option<&EntryWrite> {
        match self {
            PendingEntry::Added(w) | PendingEntry::Updated(w) | PendingEntry::Refreshed(w) => Some(w),
            _ => None,
        }
    }
}

/// Per-scan inputs shared by every batch.
#[derive(Clone)]
pub struct PrepareContext {
    pub db: Database,
    pub extractor: Arc<MetadataExtractor>,
    /// Scan root; subfolders are recorded relative to it.
    pub root: Option<PathBuf>,
    pub source: String,
    pub fast: bool,
    pub stat_retries: u32,
    pub stat_backoff: Duration,
}

#[derive(Debug, Default)]
pub struct PreparedBatch {
    pub entries: Vec<PendingEntry>,
    /// Fast-scan paths whose extraction was deferred.
    pub to_enrich: Vec<PathBuf>,
}

enum Draft {
    Ready(PendingEntry),
    Extract {
        file: PreparedFile,
        existing: Option<ExistingAsset>,
        journal_stale: bool,
    },
}

struct Lookups {
    journal: HashMap<String, String>,
    existing: HashMap<String, ExistingAsset>,
    cached: HashMap<String, CacheEntry>,
}

fn subfolder_of(path: &Path, root: Option<&Path>) -> String {
    let (Some(root), Some(parent)) = (root, path.parent()) else {
        return String::new();
    };
    parent
        .strip_prefix(root)
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default()
}

impl PrepareContext {
    fn entry_write(
        &self,
        file: PreparedFile,
        existing: Option<&ExistingAsset>,
        extraction: Extraction,
        journal_stale: bool,
    ) -> EntryWrite {
        EntryWrite {
            filepath: file.path.to_string_lossy().into_owned(),
            filename: file
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            subfolder: subfolder_of(&file.path, self.root.as_deref()),
            source: self.source.clone(),
            ext: file
                .path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default(),
            asset_id: existing.map(|e| e.id),
            file,
            extraction,
            journal_stale,
        }
    }

    /// Added for new paths, Refreshed when the stored state already
    /// matches, Updated otherwise.
    fn classify(&self, write: EntryWrite, existing: Option<&ExistingAsset>) -> PendingEntry {
        match existing {
            None => PendingEntry::Added(write),
            Some(e) if e.fingerprint == write.file.fingerprint => PendingEntry::Refreshed(write),
            Some(_) => PendingEntry::Updated(write),
        }
    }

    async fn stat_files(&self, files: Vec<WalkedFile>) -> Vec<std::result::Result<PreparedFile, PendingEntry>> {
        let mut out = Vec::with_capacity(files.len());
        for walked in files {
            match fingerprint::stat_with_retry(&walked.path, self.stat_retries, self.stat_backoff).await {
                Ok(stat) => {
                    let path_key = fingerprint::path_key(&walked.path);
                    let fingerprint = fingerprint::fingerprint_stat(&path_key, &stat);
                    out.push(Ok(PreparedFile {
                        path: walked.path,
                        path_key,
                        kind: walked.kind,
                        stat,
                        fingerprint,
                    }));
                }
                Err(e) => {
                    let reason = if e.kind() == io::ErrorKind::NotFound {
                        SkipReason::Vanished
                    } else {
                        tracing::warn!(path = %walked.path.display(), error = %e, "Stat failed");
                        SkipReason::StatFailed
                    };
                    out.push(Err(PendingEntry::Skipped {
                        path: walked.path,
                        reason,
                    }));
                }
            }
        }
        out
    }

    async fn lookups(&self, files: &[&PreparedFile]) -> Result<Lookups> {
        let keys: Vec<String> = files.iter().map(|f| f.path_key.clone()).collect();
        let fingerprints: HashMap<String, String> = files
            .iter()
            .map(|f| (f.path_key.clone(), f.fingerprint.clone()))
            .collect();
        let fast = self.fast;

        self.db
            .call(move |conn| {
                let journal = journal::lookup(conn, &keys)?;
                let existing = assets::lookup_existing(conn, &keys)?;

                // Only files the journal cannot settle need a cache lookup.
                let pairs: Vec<(String, String)> = fingerprints
                    .into_iter()
                    .filter(|(key, fp)| !journal_settles(journal.get(key), fp, existing.get(key), fast))
                    .collect();
                let cached = cache::lookup(conn, &pairs)?;

                Ok(Lookups {
                    journal,
                    existing,
                    cached,
                })
            })
            .await
    }

    /// Turn one batch of walked files into pending entries, in input order.
    pub async fn prepare_batch(&self, files: Vec<WalkedFile>) -> Result<PreparedBatch> {
        let statted = self.stat_files(files).await;
        let ready: Vec<&PreparedFile> = statted.iter().filter_map(|r| r.as_ref().ok()).collect();
        let lookups = if ready.is_empty() {
            Lookups {
                journal: HashMap::new(),
                existing: HashMap::new(),
                cached: HashMap::new(),
            }
        } else {
            self.lookups(&ready).await?
        };

        let mut batch = PreparedBatch::default();
        let mut drafts = Vec::with_capacity(statted.len());

        for item in statted {
            let file = match item {
                Ok(file) => file,
                Err(skipped) => {
                    drafts.push(Draft::Ready(skipped));
                    continue;
                }
            };

            let journaled = lookups.journal.get(&file.path_key);
            let existing = lookups.existing.get(&file.path_key);
            if journal_settles(journaled, &file.fingerprint, existing, self.fast) {
                drafts.push(Draft::Ready(PendingEntry::SkippedJournal { path: file.path }));
                continue;
            }
            let journal_stale = journaled != Some(&file.fingerprint);

            if let Some(hit) = lookups.cached.get(&file.path_key) {
                match Extraction::from_payload(&hit.payload) {
                    Ok(extraction) => {
                        let write = self.entry_write(file, existing, extraction, journal_stale);
                        drafts.push(Draft::Ready(self.classify(write, existing)));
                        continue;
                    }
                    Err(e) => tracing::debug!(path = %file.path.display(), error = %e, "Ignoring unreadable cache entry"),
                }
            }

            if metadata_current(journaled, &file.fingerprint, existing) {
                drafts.push(Draft::Ready(PendingEntry::Skipped {
                    path: file.path,
                    reason: SkipReason::RichMetadata,
                }));
                continue;
            }

            if self.fast {
                batch.to_enrich.push(file.path.clone());
                let write = self.entry_write(file, existing, Extraction::none(), journal_stale);
                drafts.push(Draft::Ready(self.classify(write, existing)));
                continue;
            }

            drafts.push(Draft::Extract {
                file,
                existing: existing.cloned(),
                journal_stale,
            });
        }

        let wanted: Vec<(PathBuf, FileKind)> = drafts
            .iter()
            .filter_map(|d| match d {
                Draft::Extract { file, .. } => Some((file.path.clone(), file.kind)),
                Draft::Ready(_) => None,
            })
            .collect();

        let mut extracted = if wanted.is_empty() {
            HashMap::new()
        } else {
            self.extractor.extract_batch_blocking(wanted).await?
        };

        let mut to_cache = Vec::new();
        for draft in drafts {
            let entry = match draft {
                Draft::Ready(entry) => entry,
                Draft::Extract {
                    file,
                    existing,
                    journal_stale,
                } => {
                    let extraction = extracted.remove(&file.path).unwrap_or_else(Extraction::none);
                    if extraction.is_rich() {
                        to_cache.push((file.path_key.clone(), file.fingerprint.clone(), extraction.raw_json()));
                    }
                    let write = self.entry_write(file, existing.as_ref(), extraction, journal_stale);
                    self.classify(write, existing.as_ref())
                }
            };
            batch.entries.push(entry);
        }

        if !to_cache.is_empty() {
            self.db
                .call(move |conn| {
                    for (key, fingerprint, payload) in &to_cache {
                        cache::store(conn, key, fingerprint, payload)?;
                    }
                    Ok(())
                })
                .await?;
        }

        Ok(batch)
    }
}

/// A journal hit skips the file when the fingerprint still matches and
/// either the scan is fast or the asset already carries metadata.
fn journal_settles(journaled: Option<&String>, fingerprint: &str, existing: Option<&ExistingAsset>, fast: bool) -> bool {
    let Some(existing) = existing else {
        return false;
    };
    journaled.map(String::as_str) == Some(fingerprint) && (fast || existing.has_metadata())
}

/// Stored metadata is partial or better and was extracted for this exact
/// file state. A journal row naming another fingerprint means the last
/// write for this state was rejected and the metadata is older.
fn metadata_current(journaled: Option<&String>, fingerprint: &str, existing: Option<&ExistingAsset>) -> bool {
    let Some(existing) = existing else {
        return false;
    };
    existing.fingerprint == fingerprint
        && existing.has_rich_metadata()
        && journaled.map_or(true, |j| j == fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::scanner::kinds::FileKind;
    use crate::scanner::metadata::Quality;
    use crate::scanner::tools::{MetadataTool, ToolMap, ToolResult};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingTool(AtomicUsize);

    impl MetadataTool for CountingTool {
        fn name(&self) -> &str {
            "counting"
        }
        fn supports(&self, _kind: FileKind) -> bool {
            true
        }
        fn read(&self, _path: &Path, _fields: Option<&[&str]>) -> ToolResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            let mut map = ToolMap::new();
            map.insert("ImageWidth".into(), Value::from(4));
            map.insert("ImageHeight".into(), Value::from(3));
            Ok(map)
        }
    }

    fn context(db: &Database, root: &Path, tool: Arc<CountingTool>, fast: bool) -> PrepareContext {
        let tool: Arc<dyn MetadataTool> = tool;
        PrepareContext {
            db: db.clone(),
            extractor: Arc::new(MetadataExtractor::new(Some(tool), None)),
            root: Some(root.to_path_buf()),
            source: "default".to_string(),
            fast,
            stat_retries: 2,
            stat_backoff: Duration::from_millis(1),
        }
    }

    fn walked(path: PathBuf) -> WalkedFile {
        WalkedFile {
            path,
            kind: FileKind::Image,
        }
    }

    #[tokio::test]
    async fn test_new_file_is_extracted_and_cached() {
        let db = test_db();
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let path = dir.path().join("sub/a.png");
        std::fs::write(&path, b"png").unwrap();
        let tool = Arc::new(CountingTool(AtomicUsize::new(0)));
        let ctx = context(&db, dir.path(), tool.clone(), false);

        let batch = ctx.prepare_batch(vec![walked(path.clone())]).await.unwrap();
        assert_eq!(batch.entries.len(), 1);
        let PendingEntry::Added(write) = &batch.entries[0] else {
            panic!("expected an added entry");
        };
        assert_eq!(write.extraction.quality, Quality::Full);
        assert_eq!(write.subfolder, "sub");
        assert_eq!(write.ext, "png");
        assert_eq!(tool.0.load(Ordering::SeqCst), 1);

        let key = fingerprint::path_key(&path);
        let fp = write.file.fingerprint.clone();
        let cached = db.with_conn(|conn| cache::get(conn, &key, &fp)).unwrap();
        assert!(cached.is_some());

        // Nothing committed yet, so a second pass hits the cache instead of the tool.
        let batch = ctx.prepare_batch(vec![walked(path)]).await.unwrap();
        assert!(matches!(batch.entries[0], PendingEntry::Added(_)));
        assert_eq!(tool.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fast_mode_defers_extraction() {
        let db = test_db();
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"png").unwrap();
        let tool = Arc::new(CountingTool(AtomicUsize::new(0)));
        let ctx = context(&db, dir.path(), tool.clone(), true);

        let batch = ctx.prepare_batch(vec![walked(path.clone())]).await.unwrap();
        let PendingEntry::Added(write) = &batch.entries[0] else {
            panic!("expected an added entry");
        };
        assert_eq!(write.extraction.quality, Quality::None);
        assert_eq!(batch.to_enrich, vec![path]);
        assert_eq!(tool.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_vanished_file_is_skipped() {
        let db = test_db();
        let dir = tempdir().unwrap();
        let tool = Arc::new(CountingTool(AtomicUsize::new(0)));
        let ctx = context(&db, dir.path(), tool, false);

        let batch = ctx.prepare_batch(vec![walked(dir.path().join("gone.png"))]).await.unwrap();
        assert!(matches!(
            batch.entries[0],
            PendingEntry::Skipped {
                reason: SkipReason::Vanished,
                ..
            }
        ));
    }

    #[test]
    fn test_journal_settles_rules() {
        let rich = ExistingAsset {
            id: 1,
            kind: Some(FileKind::Image),
            fingerprint: "fp".into(),
            quality: Quality::Full,
        };
        let bare = ExistingAsset {
            quality: Quality::None,
            ..rich.clone()
        };
        let fp = "fp".to_string();
        assert!(journal_settles(Some(&fp), "fp", Some(&rich), false));
        assert!(!journal_settles(Some(&fp), "fp", Some(&bare), false));
        assert!(journal_settles(Some(&fp), "fp", Some(&bare), true));
        assert!(!journal_settles(Some(&fp), "other", Some(&rich), true));
        assert!(!journal_settles(Some(&fp), "fp", None, true));
    }

    #[test]
    fn test_metadata_current_needs_matching_state() {
        let rich = ExistingAsset {
            id: 1,
            kind: Some(FileKind::Image),
            fingerprint: "fp2".into(),
            quality: Quality::Partial,
        };
        let degraded = ExistingAsset {
            quality: Quality::Degraded,
            ..rich.clone()
        };
        let current = "fp2".to_string();
        let older = "fp1".to_string();

        assert!(metadata_current(Some(&current), "fp2", Some(&rich)));
        assert!(metadata_current(None, "fp2", Some(&rich)));
        // Row moved to fp2 but the metadata write for it was rejected.
        assert!(!metadata_current(Some(&older), "fp2", Some(&rich)));
        assert!(!metadata_current(Some(&current), "fp3", Some(&rich)));
        assert!(!metadata_current(Some(&current), "fp2", Some(&degraded)));
        assert!(!metadata_current(Some(&current), "fp2", None));
    }

    #[test]
    fn test_subfolder_relative_to_root() {
        let root = Path::new("/media");
        assert_eq!(subfolder_of(Path::new("/media/a/b/c.png"), Some(root)), "a/b");
        assert_eq!(subfolder_of(Path::new("/media/c.png"), Some(root)), "");
        assert_eq!(subfolder_of(Path::new("/other/c.png"), Some(root)), "");
        assert_eq!(subfolder_of(Path::new("/media/c.png"), None), "");
    }
}
