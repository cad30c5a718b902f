//! Background enrichment of fast-scanned assets.
//!
//! A fast scan writes assets without metadata and hands their paths here.
//! One worker task drains the queue in chunks, reusing cached extractions
//! where the file is unchanged and running the tools otherwise. It keeps
//! off the store while a scan runs or shortly after an interactive read.

pub mod queue;

use rusqlite::{Connection, TransactionBehavior};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

pub use queue::{EnrichmentQueue, RetryEnvelope};

use crate::config::EnrichmentConfig;
use crate::db::assets;
use crate::db::{cache, journal, AssetLocks, Database};
use crate::error::{IndexError, Result};
use crate::scanner::fingerprint::{self, FileStat};
use crate::scanner::kinds::FileKind;
use crate::scanner::metadata::{Extraction, MetadataExtractor, Quality};

/// How often `wait_idle` re-checks in case a wakeup was missed.
const IDLE_RECHECK: Duration = Duration::from_millis(50);

/// Pause windows shared between the indexer and the enrichment worker.
#[derive(Debug)]
pub struct PauseControl {
    interaction_ttl: Duration,
    interaction_until: Mutex<Option<Instant>>,
    active_scans: AtomicUsize,
}

impl PauseControl {
    pub fn new(interaction_ttl: Duration) -> Self {
        Self {
            interaction_ttl,
            interaction_until: Mutex::new(None),
            active_scans: AtomicUsize::new(0),
        }
    }

    /// Hold the worker off for one interaction window from now.
    pub fn note_interaction(&self) {
        let mut until = self.interaction_until.lock().unwrap_or_else(|p| p.into_inner());
        *until = Some(Instant::now() + self.interaction_ttl);
    }

    /// Pause the worker until the returned guard drops. Guards nest.
    pub fn scan_pause(self: &Arc<Self>) -> ScanPause {
        self.active_scans.fetch_add(1, Ordering::SeqCst);
        ScanPause {
            control: Arc::clone(self),
        }
    }

    pub fn active_scans(&self) -> usize {
        self.active_scans.load(Ordering::SeqCst)
    }

    /// Time left in the current pause, if any. Open-ended while a scan runs.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if self.active_scans() > 0 {
            return Some(Duration::MAX);
        }
        let until = *self.interaction_until.lock().unwrap_or_else(|p| p.into_inner());
        until.filter(|t| *t > now).map(|t| t - now)
    }

    pub fn is_paused(&self) -> bool {
        self.remaining(Instant::now()).is_some()
    }
}

/// Counted scan pause; releases on drop.
#[derive(Debug)]
pub struct ScanPause {
    control: Arc<PauseControl>,
}

impl Drop for ScanPause {
    fn drop(&mut self) {
        self.control.active_scans.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentStats {
    pub enriched: u64,
    /// Nothing to do: already full, gone from the catalog, or changed on disk.
    pub skipped: u64,
    pub retried: u64,
    /// Given up on after an error or too many attempts.
    pub dropped: u64,
}

struct Shared {
    queue: Mutex<EnrichmentQueue>,
    stats: Mutex<EnrichmentStats>,
    in_flight: AtomicUsize,
    stopping: AtomicBool,
    draining: AtomicBool,
    finished: AtomicBool,
    wake: Notify,
    idle: Notify,
}

impl Shared {
    fn new(config: &EnrichmentConfig) -> Self {
        Self {
            queue: Mutex::new(EnrichmentQueue::new(config.max_queue, config.max_attempts)),
            stats: Mutex::new(EnrichmentStats::default()),
            in_flight: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            wake: Notify::new(),
            idle: Notify::new(),
        }
    }

    fn queue(&self) -> MutexGuard<'_, EnrichmentQueue> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn stats(&self) -> MutexGuard<'_, EnrichmentStats> {
        self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_idle(&self) -> bool {
        let queue = self.queue();
        queue.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Requeue after a transient failure, otherwise give up on the path.
    fn settle(&self, envelope: RetryEnvelope, err: &IndexError, delay: Duration) {
        let path = envelope.path.clone();
        if !err.is_transient() {
            if err.is_fatal() {
                tracing::error!(path = %path.display(), error = %err, "Catalog store failed during enrichment");
            } else {
                tracing::warn!(path = %path.display(), error = %err, "Enrichment failed");
            }
            self.stats().dropped += 1;
            return;
        }

        let attempts = envelope.attempt + 1;
        if self.queue().requeue(envelope, delay) {
            tracing::debug!(path = %path.display(), attempts, error = %err, "Enrichment deferred");
            self.stats().retried += 1;
        } else {
            tracing::warn!(path = %path.display(), attempts, error = %err, "Enrichment dropped after max attempts");
            self.stats().dropped += 1;
        }
    }
}

/// Caller side of a running worker.
#[derive(Clone)]
pub struct EnrichmentHandle {
    shared: Arc<Shared>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EnrichmentHandle {
    /// Queue `path`; lower priorities run first. Returns false once stopping.
    pub fn enqueue(&self, path: PathBuf, priority: i32) -> bool {
        if self.shared.stopping.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.queue().push(path, priority);
        self.shared.wake.notify_one();
        true
    }

    pub fn enqueue_many(&self, paths: impl IntoIterator<Item = PathBuf>, priority: i32) -> usize {
        if self.shared.stopping.load(Ordering::SeqCst) {
            return 0;
        }
        let mut queued = 0;
        {
            let mut queue = self.shared.queue();
            for path in paths {
                queue.push(path, priority);
                queued += 1;
            }
        }
        if queued > 0 {
            self.shared.wake.notify_one();
        }
        queued
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn stats(&self) -> EnrichmentStats {
        *self.shared.stats()
    }

    pub fn is_idle(&self) -> bool {
        self.shared.is_idle()
    }

    /// Resolve once the queue is empty and no chunk is in flight, or the
    /// worker has exited.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.is_idle() || self.shared.finished.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(IDLE_RECHECK) => {}
            }
        }
    }

    /// Stop the worker and wait for its task. With `drain`, queued paths
    /// are processed first; otherwise they are discarded.
    pub async fn stop(&self, drain: bool) {
        self.shared.draining.store(drain, Ordering::SeqCst);
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();

        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Enrichment worker ended abnormally");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Enriched {
    Written,
    Unchanged,
    /// The row moved on between load and write.
    Stale,
}

struct Target {
    envelope: RetryEnvelope,
    path_key: String,
    fingerprint: String,
    id: i64,
    /// The journal does not yet name this fingerprint.
    journal_stale: bool,
}

pub struct EnrichmentWorker {
    db: Database,
    extractor: Arc<MetadataExtractor>,
    config: EnrichmentConfig,
    pause: Arc<PauseControl>,
    permits: Arc<Semaphore>,
    shared: Arc<Shared>,
}

impl EnrichmentWorker {
    /// Start the worker on the current tokio runtime. `permits` bounds
    /// in-flight work shared with the indexer.
    pub fn spawn(
        db: Database,
        extractor: Arc<MetadataExtractor>,
        config: EnrichmentConfig,
        pause: Arc<PauseControl>,
        permits: Arc<Semaphore>,
    ) -> EnrichmentHandle {
        let shared = Arc::new(Shared::new(&config));
        let worker = EnrichmentWorker {
            db,
            extractor,
            config,
            pause,
            permits,
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(worker.run());
        EnrichmentHandle {
            shared,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn sleep_or_wake(&self, wait: Duration) {
        tokio::select! {
            _ = self.shared.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    async fn run(self) {
        tracing::debug!("Enrichment worker started");
        let idle_poll = self.config.idle_poll();

        loop {
            let stopping = self.shared.stopping.load(Ordering::SeqCst);
            if stopping && !self.shared.draining.load(Ordering::SeqCst) {
                break;
            }
            if !stopping {
                if let Some(wait) = self.pause.remaining(Instant::now()) {
                    self.sleep_or_wake(wait.min(idle_poll)).await;
                    continue;
                }
            }

            let now = Instant::now();
            let (chunk, next_due) = {
                let mut queue = self.shared.queue();
                let chunk = queue.pop_ready(now, self.config.chunk_size);
                self.shared.in_flight.fetch_add(chunk.len(), Ordering::SeqCst);
                (chunk, queue.next_due_in(now))
            };

            if chunk.is_empty() {
                if next_due.is_none() {
                    if stopping {
                        break;
                    }
                    self.shared.idle.notify_waiters();
                }
                self.sleep_or_wake(next_due.unwrap_or(idle_poll).min(idle_poll)).await;
                continue;
            }

            let size = chunk.len();
            let _permit = self.permits.acquire().await.ok();
            self.process_chunk(chunk).await;
            self.shared.in_flight.fetch_sub(size, Ordering::SeqCst);
            if self.shared.is_idle() {
                self.shared.idle.notify_waiters();
            }
        }

        let abandoned = {
            let mut queue = self.shared.queue();
            let left = queue.len();
            queue.clear();
            left
        };
        if abandoned > 0 {
            tracing::debug!(abandoned, "Enrichment worker stopped with paths still queued");
        }
        self.shared.finished.store(true, Ordering::SeqCst);
        self.shared.idle.notify_waiters();
        tracing::debug!("Enrichment worker stopped");
    }

    async fn process_chunk(&self, chunk: Vec<RetryEnvelope>) {
        let delay = self.config.retry_delay();

        let mut stamped = Vec::with_capacity(chunk.len());
        for envelope in chunk {
            match FileStat::read(&envelope.path) {
                Ok(stat) => {
                    let key = fingerprint::path_key(&envelope.path);
                    let fp = fingerprint::fingerprint_stat(&key, &stat);
                    stamped.push((envelope, key, fp));
                }
                Err(e) => {
                    tracing::debug!(path = %envelope.path.display(), error = %e, "File gone before enrichment");
                    self.shared.stats().skipped += 1;
                }
            }
        }
        if stamped.is_empty() {
            return;
        }

        let keys: Vec<String> = stamped.iter().map(|(_, key, _)| key.clone()).collect();
        let pairs: Vec<(String, String)> = stamped.iter().map(|(_, key, fp)| (key.clone(), fp.clone())).collect();
        let loaded = self
            .db
            .call(move |conn| {
                let journaled = journal::lookup(conn, &keys)?;
                let existing = assets::lookup_existing(conn, &keys)?;
                let cached = cache::lookup(conn, &pairs)?;
                Ok((journaled, existing, cached))
            })
            .await;
        let (journaled, existing, cached) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                for (envelope, _, _) in stamped {
                    self.shared.settle(envelope, &e, delay);
                }
                return;
            }
        };

        let mut targets = Vec::with_capacity(stamped.len());
        let mut ready: HashMap<PathBuf, (Extraction, bool)> = HashMap::new();
        let mut wanted: Vec<(PathBuf, FileKind)> = Vec::new();

        for (envelope, key, fp) in stamped {
            let Some((current, Some(kind))) = existing.get(&key).map(|e| (e, e.kind)) else {
                tracing::debug!(path = %envelope.path.display(), "Not catalogued; skipping enrichment");
                self.shared.stats().skipped += 1;
                continue;
            };
            if current.fingerprint != fp {
                tracing::debug!(path = %envelope.path.display(), "Changed since indexing; left for the next scan");
                self.shared.stats().skipped += 1;
                continue;
            }
            let journal_stale = journaled.get(&key) != Some(&fp);
            // Full metadata only counts if no rejected write for this state
            // left the journal behind.
            if current.quality == Quality::Full && journaled.get(&key).map_or(true, |j| *j == fp) {
                self.shared.stats().skipped += 1;
                continue;
            }

            let from_cache = cached
                .get(&key)
                .and_then(|hit| Extraction::from_payload(&hit.payload).ok());
            match from_cache {
                Some(extraction) => {
                    ready.insert(envelope.path.clone(), (extraction, false));
                }
                None => wanted.push((envelope.path.clone(), kind)),
            }
            targets.push(Target {
                envelope,
                path_key: key,
                fingerprint: fp,
                id: current.id,
                journal_stale,
            });
        }

        if !wanted.is_empty() {
            match self.extractor.extract_batch_blocking(wanted).await {
                Ok(extracted) => {
                    ready.extend(extracted.into_iter().map(|(path, e)| (path, (e, true))));
                }
                Err(e) => {
                    // Cached targets can still be written.
                    let (keep, lost): (Vec<_>, Vec<_>) =
                        targets.into_iter().partition(|t| ready.contains_key(&t.envelope.path));
                    for target in lost {
                        self.shared.settle(target.envelope, &e, delay);
                    }
                    targets = keep;
                }
            }
        }

        let writes: Vec<(Target, Extraction, bool)> = targets
            .into_iter()
            .filter_map(|target| {
                let (extraction, fresh) = ready.remove(&target.envelope.path)?;
                Some((target, extraction, fresh))
            })
            .collect();
        if writes.is_empty() {
            return;
        }

        let count = writes.len();
        let locks = self.db.locks();
        let results = self
            .db
            .call(move |conn| {
                Ok(writes
                    .into_iter()
                    .map(|(target, extraction, fresh)| {
                        let result = write_one(conn, &locks, &target, &extraction, fresh);
                        (target.envelope, result)
                    })
                    .collect::<Vec<_>>())
            })
            .await;

        match results {
            Ok(results) => {
                for (envelope, result) in results {
                    match result {
                        Ok(Enriched::Written) => self.shared.stats().enriched += 1,
                        Ok(Enriched::Unchanged) | Ok(Enriched::Stale) => self.shared.stats().skipped += 1,
                        Err(e) => self.shared.settle(envelope, &e, delay),
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, count, "Enrichment write task failed");
                self.shared.stats().dropped += count as u64;
            }
        }
    }
}

/// Apply one extraction under the asset's stripe lock, provided the row
/// still describes the file that was extracted.
fn write_one(
    conn: &mut Connection,
    locks: &AssetLocks,
    target: &Target,
    extraction: &Extraction,
    fresh: bool,
) -> Result<Enriched> {
    let _guard = locks.lock(&target.path_key);
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current = assets::lookup_existing(&tx, std::slice::from_ref(&target.path_key))?;
    let outcome = match current.get(&target.path_key) {
        Some(row) if row.id == target.id && row.fingerprint == target.fingerprint => {
            let written = assets::write_metadata(&tx, target.id, extraction)?;
            if written.wrote() {
                assets::update_dimensions(&tx, target.id, extraction)?;
            }
            if fresh && extraction.is_rich() {
                cache::store(&tx, &target.path_key, &target.fingerprint, &extraction.raw_json())?;
            }
            if written.accepted() && target.journal_stale {
                journal::record(&tx, &target.path_key, &target.fingerprint)?;
            }
            if written.wrote() {
                Enriched::Written
            } else {
                Enriched::Unchanged
            }
        }
        _ => Enriched::Stale,
    };

    tx.commit()?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::assets::AssetRow;
    use crate::db::test_db;
    use crate::scanner::tools::{MetadataTool, ToolMap, ToolResult};
    use serde_json::Value;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    struct SizedTool(AtomicUsize);

    impl MetadataTool for SizedTool {
        fn name(&self) -> &str {
            "sized"
        }
        fn supports(&self, kind: FileKind) -> bool {
            kind == FileKind::Image
        }
        fn read(&self, _path: &Path, _fields: Option<&[&str]>) -> ToolResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            let mut map = ToolMap::new();
            map.insert("ImageWidth".into(), Value::from(64));
            map.insert("ImageHeight".into(), Value::from(48));
            Ok(map)
        }
    }

    fn config() -> EnrichmentConfig {
        EnrichmentConfig {
            chunk_size: 4,
            retry_delay_ms: 1,
            idle_poll_ms: 5,
            interaction_pause_ms: 30,
            ..EnrichmentConfig::default()
        }
    }

    fn catalogue(db: &Database, path: &Path) -> i64 {
        let stat = FileStat::read(path).unwrap();
        let key = fingerprint::path_key(path);
        let fp = fingerprint::fingerprint_stat(&key, &stat);
        let filepath = path.to_string_lossy().into_owned();
        db.with_conn(|conn| {
            let row = AssetRow {
                filepath: &filepath,
                path_key: &key,
                filename: "a.png",
                subfolder: "",
                source: "default",
                kind: FileKind::Image,
                ext: "png",
                stat,
                fingerprint: &fp,
            };
            let id = assets::insert_asset(conn, &row, &Extraction::none())?;
            assets::write_metadata(conn, id, &Extraction::none())?;
            Ok(id)
        })
        .unwrap()
    }

    fn spawn(db: &Database, tool: Arc<SizedTool>, pause: Arc<PauseControl>) -> EnrichmentHandle {
        let tool: Arc<dyn MetadataTool> = tool;
        EnrichmentWorker::spawn(
            db.clone(),
            Arc::new(MetadataExtractor::new(Some(tool), None)),
            config(),
            pause,
            Arc::new(Semaphore::new(2)),
        )
    }

    #[test]
    fn test_scan_pause_nests() {
        let pause = Arc::new(PauseControl::new(Duration::from_millis(10)));
        assert!(!pause.is_paused());
        let outer = pause.scan_pause();
        let inner = pause.scan_pause();
        drop(outer);
        assert!(pause.is_paused());
        drop(inner);
        assert!(!pause.is_paused());

        pause.note_interaction();
        assert!(pause.is_paused());
        let later = Instant::now() + Duration::from_millis(20);
        assert_eq!(pause.remaining(later), None);
    }

    #[tokio::test]
    async fn test_worker_fills_metadata_and_cache() {
        let db = test_db();
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"png").unwrap();
        let id = catalogue(&db, &path);

        let tool = Arc::new(SizedTool(AtomicUsize::new(0)));
        let handle = spawn(&db, tool.clone(), Arc::new(PauseControl::new(Duration::ZERO)));
        assert!(handle.enqueue(path.clone(), 0));
        handle.wait_idle().await;
        handle.stop(false).await;

        let meta = db.with_conn(|conn| assets::get_metadata(conn, id)).unwrap().unwrap();
        assert_eq!(meta.quality, Quality::Full);
        let asset = db.with_conn(|conn| assets::get_asset(conn, id)).unwrap().unwrap();
        assert_eq!((asset.width, asset.height), (Some(64), Some(48)));
        assert_eq!(db.with_conn(|conn| cache::count(conn)).unwrap(), 1);
        assert_eq!(handle.stats().enriched, 1);
        assert_eq!(tool.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_uncatalogued_and_missing_paths_are_skipped() {
        let db = test_db();
        let dir = tempdir().unwrap();
        let stray = dir.path().join("stray.png");
        std::fs::write(&stray, b"png").unwrap();

        let tool = Arc::new(SizedTool(AtomicUsize::new(0)));
        let handle = spawn(&db, tool.clone(), Arc::new(PauseControl::new(Duration::ZERO)));
        handle.enqueue_many(vec![stray, dir.path().join("gone.png")], 0);
        handle.wait_idle().await;
        handle.stop(false).await;

        assert_eq!(handle.stats().skipped, 2);
        assert_eq!(tool.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scan_pause_holds_worker_until_released() {
        let db = test_db();
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"png").unwrap();
        let id = catalogue(&db, &path);

        let pause = Arc::new(PauseControl::new(Duration::ZERO));
        let guard = pause.scan_pause();
        let handle = spawn(&db, Arc::new(SizedTool(AtomicUsize::new(0))), Arc::clone(&pause));
        handle.enqueue(path, 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(handle.queue_len(), 1);

        drop(guard);
        handle.wait_idle().await;
        let meta = db.with_conn(|conn| assets::get_metadata(conn, id)).unwrap().unwrap();
        assert_eq!(meta.quality, Quality::Full);
        handle.stop(false).await;
    }

    #[tokio::test]
    async fn test_stop_with_drain_processes_queue() {
        let db = test_db();
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"png").unwrap();
        let id = catalogue(&db, &path);

        let pause = Arc::new(PauseControl::new(Duration::ZERO));
        let guard = pause.scan_pause();
        let handle = spawn(&db, Arc::new(SizedTool(AtomicUsize::new(0))), Arc::clone(&pause));
        handle.enqueue(path.clone(), 0);

        // Draining ignores the pause.
        handle.stop(true).await;
        drop(guard);
        let meta = db.with_conn(|conn| assets::get_metadata(conn, id)).unwrap().unwrap();
        assert_eq!(meta.quality, Quality::Full);
        assert!(!handle.enqueue(path, 0));
    }

    #[tokio::test]
    async fn test_full_metadata_behind_journal_is_extracted_again() {
        let db = test_db();
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"png").unwrap();
        let id = catalogue(&db, &path);
        let key = fingerprint::path_key(&path);
        let current = fingerprint::fingerprint_stat(&key, &FileStat::read(&path).unwrap());

        // Full metadata left by an earlier file state whose successor was rejected.
        db.with_conn(|conn| {
            let mut older = Extraction::from_raw(Quality::Full, serde_json::json!({ "marker": "older" }));
            older.has_workflow = true;
            assets::write_metadata(conn, id, &older)?;
            journal::record(conn, &key, "older-state")
        })
        .unwrap();

        let tool = Arc::new(SizedTool(AtomicUsize::new(0)));
        let handle = spawn(&db, tool.clone(), Arc::new(PauseControl::new(Duration::ZERO)));
        handle.enqueue(path.clone(), 0);
        handle.wait_idle().await;
        handle.stop(false).await;

        assert_eq!(tool.0.load(Ordering::SeqCst), 1);
        let asset = db.with_conn(|conn| assets::get_asset(conn, id)).unwrap().unwrap();
        assert_eq!((asset.width, asset.height), (Some(64), Some(48)));
        let journaled = db.with_conn(|conn| journal::lookup(conn, &[key.clone()])).unwrap();
        assert_eq!(journaled.get(&key), Some(&current));

        // Settled now: a second pass leaves the tool alone.
        let handle = spawn(&db, tool.clone(), Arc::new(PauseControl::new(Duration::ZERO)));
        handle.enqueue(path, 0);
        handle.wait_idle().await;
        handle.stop(false).await;
        assert_eq!(tool.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scan_update_and_enrichment_write_never_interleave() {
        use crate::scanner::persist;
        use crate::scanner::prepare::{EntryWrite, PendingEntry, PreparedFile};
        use std::sync::Barrier;

        for round in 0..20 {
            let db = test_db();
            let dir = tempdir().unwrap();
            let path = dir.path().join("a.png");
            std::fs::write(&path, b"png").unwrap();
            let id = catalogue(&db, &path);
            let key = fingerprint::path_key(&path);
            let old_fp = fingerprint::fingerprint_stat(&key, &FileStat::read(&path).unwrap());

            // Enrichment extracted the old state; the scan saw an edit.
            let mut queue = EnrichmentQueue::new(4, 3);
            queue.push(path.clone(), 0);
            let target = Target {
                envelope: queue.pop_ready(Instant::now(), 1).remove(0),
                path_key: key.clone(),
                fingerprint: old_fp.clone(),
                id,
                journal_stale: true,
            };
            let mut enriched = Extraction::from_raw(Quality::Full, serde_json::json!({ "marker": "enrich" }));
            enriched.has_workflow = true;

            std::fs::write(&path, b"edited png").unwrap();
            let stat = FileStat::read(&path).unwrap();
            let new_fp = fingerprint::fingerprint_stat(&key, &stat);
            let update = PendingEntry::Updated(EntryWrite {
                file: PreparedFile {
                    path: path.clone(),
                    path_key: key.clone(),
                    kind: FileKind::Image,
                    stat,
                    fingerprint: new_fp.clone(),
                },
                asset_id: Some(id),
                extraction: Extraction::from_raw(Quality::Partial, serde_json::json!({ "marker": "scan" })),
                journal_stale: true,
                filepath: path.to_string_lossy().into_owned(),
                filename: "a.png".to_string(),
                subfolder: String::new(),
                source: "default".to_string(),
                ext: "png".to_string(),
            });

            let barrier = Arc::new(Barrier::new(2));
            let scan = {
                let db = db.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let locks = db.locks();
                    barrier.wait();
                    db.with_conn(|conn| persist::apply_batch(conn, &locks, std::slice::from_ref(&update)))
                })
            };
            let enrich = {
                let db = db.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let locks = db.locks();
                    barrier.wait();
                    db.with_conn(|conn| write_one(conn, &locks, &target, &enriched, true))
                })
            };
            let report = scan.join().unwrap().unwrap();
            let outcome = enrich.join().unwrap().unwrap();
            assert_eq!(report.outcome.updated, 1, "round {round}");

            let meta = db.with_conn(|conn| assets::get_metadata(conn, id)).unwrap().unwrap();
            let marker = meta
                .raw
                .as_deref()
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .and_then(|raw| raw["marker"].as_str().map(str::to_string));
            let journaled = db.with_conn(|conn| journal::lookup(conn, &[key.clone()])).unwrap();
            match outcome {
                // Enrichment landed first; the scan's lower tier was rejected
                // and the journal still points at the old state.
                Enriched::Written => {
                    assert_eq!(
                        (meta.quality, meta.has_workflow, marker.as_deref()),
                        (Quality::Full, true, Some("enrich")),
                        "round {round}"
                    );
                    assert_eq!(journaled.get(&key), Some(&old_fp), "round {round}");
                }
                // The scan landed first; the enrichment result was stale.
                Enriched::Stale => {
                    assert_eq!(
                        (meta.quality, meta.has_workflow, marker.as_deref()),
                        (Quality::Partial, false, Some("scan")),
                        "round {round}"
                    );
                    assert_eq!(journaled.get(&key), Some(&new_fp), "round {round}");
                }
                Enriched::Unchanged => panic!("round {round}: unexpected no-op"),
            }
        }
    }

    #[test]
    fn test_transient_failures_retry_then_drop() {
        let mut config = config();
        config.max_attempts = 2;
        let shared = Shared::new(&config);
        let busy = IndexError::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));

        shared.queue().push(PathBuf::from("/m/a.png"), 0);
        let envelope = shared.queue().pop_ready(Instant::now(), 1).remove(0);
        shared.settle(envelope, &busy, Duration::ZERO);
        assert_eq!(shared.stats().retried, 1);
        assert_eq!(shared.queue().len(), 1);

        let envelope = shared.queue().pop_ready(Instant::now(), 1).remove(0);
        shared.settle(envelope, &busy, Duration::ZERO);
        assert_eq!(shared.stats().dropped, 1);
        assert!(shared.queue().is_empty());

        shared.queue().push(PathBuf::from("/m/b.png"), 0);
        let envelope = shared.queue().pop_ready(Instant::now(), 1).remove(0);
        shared.settle(envelope, &IndexError::InvalidInput("bad".into()), Duration::ZERO);
        assert_eq!(shared.stats().dropped, 2);
        assert!(shared.queue().is_empty());
    }
}
