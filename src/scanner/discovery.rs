use governor::clock::{Clock, DefaultClock};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use super::kinds::{FileKind, KindTable};

/// Cooperative stop signal shared by a scan, its walker and its batch loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub recursive: bool,
    /// Directory entries read per second; 0 disables pacing.
    pub io_rate_per_sec: u32,
    pub capacity: usize,
    pub kinds: Arc<KindTable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedFile {
    pub path: PathBuf,
    pub kind: FileKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub files: usize,
    /// Entries that could not be read; their subtrees were skipped.
    pub errors: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkItem {
    File(WalkedFile),
    /// Always the last item sent.
    Done(WalkSummary),
}

type Pacer = RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

fn pacer(rate: u32) -> Option<Pacer> {
    NonZeroU32::new(rate).map(|rate| RateLimiter::direct(Quota::per_second(rate)))
}

fn wait_for_slot(pacer: &Pacer, clock: &DefaultClock) {
    while let Err(not_until) = pacer.check() {
        thread::sleep(not_until.wait_time_from(clock.now()));
    }
}

/// Classify one directory entry. Symlinks to files are followed; symlinks
/// to directories are not, so the walk cannot cycle.
fn classify(entry: &walkdir::DirEntry, kinds: &KindTable) -> Option<WalkedFile> {
    let file_type = entry.file_type();
    let is_file = if file_type.is_symlink() {
        std::fs::metadata(entry.path()).map(|m| m.is_file()).unwrap_or(false)
    } else {
        file_type.is_file()
    };
    if !is_file {
        return None;
    }
    let kind = kinds.kind_for_path(entry.path())?;
    Some(WalkedFile {
        path: entry.path().to_path_buf(),
        kind,
    })
}

/// Walk `root` on a dedicated thread, emitting supported files into a
/// bounded channel. The walk pauses when the consumer falls behind and
/// stops early if the consumer goes away or `cancel` trips.
pub fn spawn_walk(root: &Path, options: WalkOptions, cancel: CancelToken) -> std::io::Result<mpsc::Receiver<WalkItem>> {
    let (tx, rx) = mpsc::channel(options.capacity.max(1));
    let root = root.to_path_buf();

    thread::Builder::new()
        .name("mediadex-walker".to_string())
        .spawn(move || {
            let summary = walk(&root, &options, &cancel, |file| tx.blocking_send(WalkItem::File(file)).is_ok());
            let _ = tx.blocking_send(WalkItem::Done(summary));
        })?;

    Ok(rx)
}

/// The walk loop itself; `emit` returns false when the consumer is gone.
fn walk(root: &Path, options: &WalkOptions, cancel: &CancelToken, mut emit: impl FnMut(WalkedFile) -> bool) -> WalkSummary {
    let mut summary = WalkSummary::default();
    let pacer = pacer(options.io_rate_per_sec);
    let clock = DefaultClock::default();

    let mut walker = WalkDir::new(root).follow_links(false);
    if !options.recursive {
        walker = walker.max_depth(1);
    }
    let mut entries = walker.into_iter();

    loop {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }
        if let Some(pacer) = &pacer {
            wait_for_slot(pacer, &clock);
        }

        let entry = match entries.next() {
            Some(Ok(entry)) => entry,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Skipping unreadable entry");
                summary.errors += 1;
                continue;
            }
            None => break,
        };

        if let Some(file) = classify(&entry, &options.kinds) {
            summary.files += 1;
            if !emit(file) {
                summary.cancelled = true;
                break;
            }
        }
    }

    summary
}
