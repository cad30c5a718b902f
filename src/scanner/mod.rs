pub mod discovery;
pub mod fingerprint;
pub mod hashing;
pub mod kinds;
pub mod metadata;
pub mod persist;
pub mod prepare;
pub mod tools;
pub mod workflow;

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use crate::config::Config;
use crate::db::assets::{self, CatalogStats};
use crate::db::scans::{self, ScanStatus, ScanTotals};
use crate::db::{similarity, CacheMaintenance, Database, ExactDuplicateGroup, NearDuplicatePair};
use crate::enrichment::{EnrichmentHandle, EnrichmentWorker, PauseControl};
use crate::error::{IndexError, Result};
use crate::notify::{self, IndexEvent, NoopNotifier, Notifier};

pub use discovery::CancelToken;
pub use hashing::HashReport;
pub use kinds::{FileKind, KindTable};
pub use metadata::{Extraction, MetadataExtractor, Quality};
pub use persist::BatchOutcome;

use discovery::{WalkItem, WalkOptions, WalkedFile};
use prepare::PrepareContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub scanned: usize,
    pub added: usize,
    pub updated: usize,
    /// Unchanged files whose metadata improved from the cache.
    pub refreshed: usize,
    /// All skips, journal skips and state drift included.
    pub skipped: usize,
    pub journal_skipped: usize,
    pub state_drifted: usize,
    pub errors: usize,
    /// Paths handed to the enrichment worker.
    pub enqueued: usize,
    pub cancelled: bool,
}

impl ScanStats {
    fn absorb(&mut self, outcome: &BatchOutcome) {
        self.added += outcome.added;
        self.updated += outcome.updated;
        self.refreshed += outcome.refreshed;
        self.skipped += outcome.skipped;
        self.journal_skipped += outcome.journal_skipped;
        self.state_drifted += outcome.state_drifted;
        self.errors += outcome.errors;
    }

    pub fn totals(&self) -> ScanTotals {
        ScanTotals {
            scanned: self.scanned,
            added: self.added,
            updated: self.updated,
            skipped: self.skipped,
            errors: self.errors,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScanProgress {
    Started { root: PathBuf },
    Batch { scanned: usize, added: usize, updated: usize, skipped: usize, errors: usize },
    Completed { stats: ScanStats },
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub recursive: bool,
    /// Defer metadata extraction to the enrichment worker.
    pub fast: bool,
    /// Label stored on every asset this scan writes.
    pub source: String,
    pub progress: Option<mpsc::Sender<ScanProgress>>,
    pub cancel: CancelToken,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            fast: false,
            source: "default".to_string(),
            progress: None,
            cancel: CancelToken::new(),
        }
    }
}

impl ScanOptions {
    fn report(&self, progress: ScanProgress) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(progress);
        }
    }
}

/// The indexing service: scans, explicit-path indexing, removal and the
/// duplicate queries, all over one catalog.
///
/// Exactly one scan or explicit-path index runs at a time.
pub struct Indexer {
    db: Database,
    config: Config,
    extractor: Arc<MetadataExtractor>,
    kinds: Arc<KindTable>,
    scan_lock: Mutex<()>,
    permits: Arc<Semaphore>,
    pause: Arc<PauseControl>,
    enrichment: EnrichmentHandle,
    notifier: Arc<dyn Notifier>,
    cache_maintenance: Arc<CacheMaintenance>,
}

impl Indexer {
    /// Build an indexer using the configured external tools. Must run
    /// inside a tokio runtime; the enrichment worker is spawned here.
    pub fn new(db: Database, config: Config) -> Result<Self> {
        let extractor = Arc::new(MetadataExtractor::from_config(&config.tools));
        Self::with_extractor(db, config, extractor)
    }

    pub fn with_extractor(db: Database, config: Config, extractor: Arc<MetadataExtractor>) -> Result<Self> {
        config.validate()?;

        let permits = Arc::new(Semaphore::new(config.scanner.max_in_flight));
        let pause = Arc::new(PauseControl::new(config.enrichment.interaction_pause()));
        let enrichment = EnrichmentWorker::spawn(
            db.clone(),
            Arc::clone(&extractor),
            config.enrichment.clone(),
            Arc::clone(&pause),
            Arc::clone(&permits),
        );

        Ok(Self {
            kinds: Arc::new(KindTable::with_overrides(&config.scanner.extra_extensions)),
            cache_maintenance: Arc::new(CacheMaintenance::new(&config.cache)),
            scan_lock: Mutex::new(()),
            notifier: Arc::new(NoopNotifier),
            db,
            config,
            extractor,
            permits,
            pause,
            enrichment,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn enrichment(&self) -> &EnrichmentHandle {
        &self.enrichment
    }

    /// Defaults for a scan, with the configured scan mode.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            fast: self.config.scanner.fast_scan,
            ..ScanOptions::default()
        }
    }

    /// Signal an interactive read; enrichment backs off briefly.
    pub fn note_interaction(&self) {
        self.pause.note_interaction();
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| IndexError::Task("indexer is shutting down".into()))
    }

    fn context(&self, root: Option<&Path>, options: &ScanOptions) -> PrepareContext {
        PrepareContext {
            db: self.db.clone(),
            extractor: Arc::clone(&self.extractor),
            root: root.map(Path::to_path_buf),
            source: options.source.clone(),
            fast: options.fast,
            stat_retries: self.config.scanner.stat_retries,
            stat_backoff: self.config.scanner.stat_backoff(),
        }
    }

    fn mode(options: &ScanOptions) -> &'static str {
        if options.fast {
            "fast"
        } else {
            "full"
        }
    }

    /// Walk `root` and bring the catalog in line with it.
    ///
    /// Always returns the statistics gathered so far unless the store
    /// itself failed; per-file problems only show up in `errors`.
    pub async fn scan_directory(&self, root: &Path, options: ScanOptions) -> Result<ScanStats> {
        let meta = match tokio::fs::metadata(root).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IndexError::NotFound(root.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_dir() {
            return Err(IndexError::InvalidInput(format!("{} is not a directory", root.display())));
        }

        let _scan = self.scan_lock.lock().await;
        let _pause = self.pause.scan_pause();
        let root = root.to_path_buf();
        let mode = Self::mode(&options);

        let scan_root = root.clone();
        let scan_id = self
            .db
            .call(move |conn| scans::start_scan(conn, &scan_root, mode))
            .await?;
        tracing::info!(root = %root.display(), mode, "Scan started");
        options.report(ScanProgress::Started { root: root.clone() });

        let result = self.drive_walk(&root, &options).await;
        self.finish(scan_id, &root, &options, result).await
    }

    async fn drive_walk(&self, root: &Path, options: &ScanOptions) -> Result<ScanStats> {
        let walk = WalkOptions {
            recursive: options.recursive,
            io_rate_per_sec: self.config.scanner.io_rate_per_sec,
            capacity: self.config.scanner.queue_capacity,
            kinds: Arc::clone(&self.kinds),
        };
        let mut rx = discovery::spawn_walk(root, walk, options.cancel.clone())?;
        let ctx = self.context(Some(root), options);
        let batch_size = self.config.scanner.batch_size;

        let mut stats = ScanStats::default();
        let mut pending: Vec<WalkedFile> = Vec::with_capacity(batch_size);

        while let Some(item) = rx.recv().await {
            match item {
                WalkItem::File(file) => {
                    pending.push(file);
                    if pending.len() >= batch_size {
                        if options.cancel.is_cancelled() {
                            break;
                        }
                        let batch = std::mem::replace(&mut pending, Vec::with_capacity(batch_size));
                        self.run_batch(&ctx, batch, &mut stats, options).await?;
                    }
                }
                WalkItem::Done(summary) => {
                    stats.errors += summary.errors;
                    break;
                }
            }
        }

        if !pending.is_empty() && !options.cancel.is_cancelled() {
            self.run_batch(&ctx, pending, &mut stats, options).await?;
        }
        stats.cancelled = options.cancel.is_cancelled();
        Ok(stats)
    }

    /// Index exactly `paths`, through the same pipeline as a scan.
    /// Missing or unsupported paths are counted as skipped.
    pub async fn index_paths(&self, paths: &[PathBuf], options: ScanOptions) -> Result<ScanStats> {
        if let Some(relative) = paths.iter().find(|p| !p.is_absolute()) {
            return Err(IndexError::InvalidInput(format!("{} is not an absolute path", relative.display())));
        }

        let _scan = self.scan_lock.lock().await;
        let _pause = self.pause.scan_pause();
        let mut stats = ScanStats::default();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let is_file = tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false);
            match self.kinds.kind_for_path(path) {
                Some(kind) if is_file => files.push(WalkedFile {
                    path: path.clone(),
                    kind,
                }),
                _ => {
                    tracing::debug!(path = %path.display(), "Not an indexable file");
                    stats.scanned += 1;
                    stats.skipped += 1;
                }
            }
        }

        let label = paths
            .first()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let scan_label = label.clone();
        let scan_id = self
            .db
            .call(move |conn| scans::start_scan(conn, &scan_label, "paths"))
            .await?;

        let ctx = self.context(None, &options);
        let batch_size = self.config.scanner.batch_size;
        let result = async {
            let mut remaining = files.into_iter().peekable();
            while remaining.peek().is_some() {
                if options.cancel.is_cancelled() {
                    stats.cancelled = true;
                    break;
                }
                let batch: Vec<WalkedFile> = remaining.by_ref().take(batch_size).collect();
                self.run_batch(&ctx, batch, &mut stats, &options).await?;
            }
            Ok::<_, IndexError>(stats)
        }
        .await;

        self.finish(scan_id, &label, &options, result).await
    }

    /// Prepare and persist one batch, retrying the whole batch while the
    /// store reports contention.
    async fn run_batch(
        &self,
        ctx: &PrepareContext,
        files: Vec<WalkedFile>,
        stats: &mut ScanStats,
        options: &ScanOptions,
    ) -> Result<()> {
        let _permit = self.permit().await?;
        let count = files.len();
        stats.scanned += count;

        let retries = self.config.scanner.busy_retries;
        let mut attempt = 0;
        let (report, to_enrich) = loop {
            match self.prepare_and_persist(ctx, files.clone()).await {
                Ok(done) => break done,
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Catalog store failed; aborting scan");
                    return Err(e);
                }
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    tracing::debug!(attempt, error = %e, "Batch hit a busy store; retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => {
                    tracing::warn!(files = count, error = %e, "Batch abandoned");
                    stats.errors += count;
                    options.report(ScanProgress::Error {
                        message: format!("batch of {count} files failed: {e}"),
                    });
                    return Ok(());
                }
            }
        };

        stats.absorb(&report.outcome);
        for event in &report.events {
            notify::emit(self.notifier.as_ref(), event);
        }

        if !to_enrich.is_empty() {
            let room = self.config.scanner.max_enrich_backlog.saturating_sub(stats.enqueued);
            let cut = to_enrich.len().saturating_sub(room);
            if cut > 0 {
                tracing::warn!(
                    dropped = cut,
                    backlog = self.config.scanner.max_enrich_backlog,
                    "Enrichment backlog full; files left without metadata until the next full scan"
                );
            }
            stats.enqueued += self.enrichment.enqueue_many(to_enrich.into_iter().take(room), 0);
        }

        options.report(ScanProgress::Batch {
            scanned: stats.scanned,
            added: stats.added,
            updated: stats.updated,
            skipped: stats.skipped,
            errors: stats.errors,
        });
        Ok(())
    }

    async fn prepare_and_persist(
        &self,
        ctx: &PrepareContext,
        files: Vec<WalkedFile>,
    ) -> Result<(persist::BatchReport, Vec<PathBuf>)> {
        let prepared = ctx.prepare_batch(files).await?;
        let entries = prepared.entries;
        let locks = self.db.locks();
        let report = self
            .db
            .call(move |conn| persist::apply_batch(conn, &locks, &entries))
            .await?;
        if report.outcome.fell_back {
            tracing::debug!(errors = report.outcome.errors, "Batch applied entry by entry");
        }
        Ok((report, prepared.to_enrich))
    }

    /// Record the scan row, run cache maintenance and announce the result.
    async fn finish(
        &self,
        scan_id: i64,
        root: &Path,
        options: &ScanOptions,
        result: Result<ScanStats>,
    ) -> Result<ScanStats> {
        let (status, totals) = match &result {
            Ok(stats) if stats.cancelled => (ScanStatus::Cancelled, stats.totals()),
            Ok(stats) => (ScanStatus::Completed, stats.totals()),
            Err(_) => (ScanStatus::Failed, ScanTotals::default()),
        };

        let recorded = self
            .db
            .call(move |conn| scans::finish_scan(conn, scan_id, &totals, status))
            .await;
        if let Err(e) = recorded {
            tracing::warn!(scan_id, error = %e, "Could not record scan result");
        }

        let stats = match result {
            Ok(stats) => stats,
            Err(e) => {
                options.report(ScanProgress::Error { message: e.to_string() });
                return Err(e);
            }
        };

        let maintenance = Arc::clone(&self.cache_maintenance);
        match self.db.call(move |conn| maintenance.maybe_run(conn)).await {
            Ok(Some(cleaned)) => {
                tracing::debug!(expired = cleaned.expired, evicted = cleaned.evicted, "Metadata cache maintenance");
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Metadata cache maintenance failed"),
        }

        tracing::info!(
            root = %root.display(),
            scanned = stats.scanned,
            added = stats.added,
            updated = stats.updated,
            skipped = stats.skipped,
            errors = stats.errors,
            drifted = stats.state_drifted,
            enqueued = stats.enqueued,
            cancelled = stats.cancelled,
            "Scan finished"
        );
        notify::emit(
            self.notifier.as_ref(),
            &IndexEvent::scan_complete(root.to_path_buf(), &totals),
        );
        options.report(ScanProgress::Completed { stats });
        Ok(stats)
    }

    /// Delete the given paths from the catalog, with their journal rows.
    pub async fn remove_paths(&self, paths: &[PathBuf]) -> Result<usize> {
        let _scan = self.scan_lock.lock().await;
        let keys: Vec<String> = paths.iter().map(|p| fingerprint::path_key(p)).collect();
        let removed = self.db.call(move |conn| assets::delete_by_keys(conn, &keys)).await?;
        tracing::info!(requested = paths.len(), removed, "Removed assets");
        Ok(removed)
    }

    /// Catalogued paths under `root` that no longer exist on disk.
    pub async fn find_missing(&self, root: &Path) -> Result<Vec<PathBuf>> {
        self.note_interaction();
        let root = root.to_path_buf();
        let known = self.db.call(move |conn| assets::paths_under(conn, &root)).await?;
        let missing = tokio::task::spawn_blocking(move || {
            known
                .into_iter()
                .filter(|p| !p.exists())
                .collect::<Vec<_>>()
        })
        .await?;
        Ok(missing)
    }

    /// Hash every asset whose content or perceptual hash is outstanding.
    pub async fn compute_hashes(&self) -> Result<HashReport> {
        let _permit = self.permit().await?;
        hashing::hash_pending(&self.db, &self.config.duplicates).await
    }

    pub async fn exact_duplicates(&self) -> Result<Vec<ExactDuplicateGroup>> {
        self.note_interaction();
        let max_members = self.config.duplicates.max_group_members;
        self.db
            .call(move |conn| similarity::find_exact_duplicates(conn, max_members))
            .await
    }

    pub async fn near_duplicates(&self) -> Result<Vec<NearDuplicatePair>> {
        self.note_interaction();
        let threshold = self.config.duplicates.hamming_threshold;
        let max_pairs = self.config.duplicates.max_pairs;
        self.db
            .call(move |conn| similarity::find_near_duplicates(conn, threshold, max_pairs))
            .await
    }

    pub async fn catalog_stats(&self) -> Result<CatalogStats> {
        self.note_interaction();
        self.db.call(|conn| assets::catalog_stats(conn)).await
    }

    /// Stop background work. With `drain`, queued enrichment finishes first.
    pub async fn shutdown(&self, drain: bool) {
        self.enrichment.stop(drain).await;
        self.permits.close();
    }
}
