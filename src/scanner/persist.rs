//! Persistence engine: applies one prepared batch to the store.
//!
//! The whole batch runs in one immediate transaction. If that fails for a
//! reason that is neither lock contention nor store corruption, the
//! offending file is diagnosed and every entry is retried in its own
//! transaction so the rest of the batch still lands.

use rusqlite::{Connection, TransactionBehavior};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::fingerprint::FileStat;
use super::prepare::{EntryWrite, PendingEntry, SkipReason};
use crate::db::assets;
use crate::db::{journal, AssetLocks};
use crate::error::Result;
use crate::notify::IndexEvent;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub added: usize,
    pub updated: usize,
    /// Unchanged files whose stored metadata improved from the cache.
    pub refreshed: usize,
    /// All skips, journal skips and state drift included.
    pub skipped: usize,
    pub journal_skipped: usize,
    pub state_drifted: usize,
    pub errors: usize,
    /// The batch transaction failed and entries were applied one by one.
    pub fell_back: bool,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: &BatchOutcome) {
        self.added += other.added;
        self.updated += other.updated;
        self.refreshed += other.refreshed;
        self.skipped += other.skipped;
        self.journal_skipped += other.journal_skipped;
        self.state_drifted += other.state_drifted;
        self.errors += other.errors;
        self.fell_back |= other.fell_back;
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcome: BatchOutcome,
    /// Events for committed writes, for the caller to deliver.
    pub events: Vec<IndexEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Added(i64),
    Updated(i64),
    Refreshed(i64),
    /// Refresh that changed nothing.
    Unchanged,
    /// The file changed or vanished after preparation.
    Drifted,
}

impl Applied {
    fn record(self, path: &Path, outcome: &mut BatchOutcome, events: &mut Vec<IndexEvent>) {
        let path = path.to_path_buf();
        match self {
            Applied::Added(id) => {
                outcome.added += 1;
                events.push(IndexEvent::AssetAdded { id, path });
            }
            Applied::Updated(id) => {
                outcome.updated += 1;
                events.push(IndexEvent::AssetUpdated { id, path });
            }
            Applied::Refreshed(id) => {
                outcome.refreshed += 1;
                events.push(IndexEvent::AssetUpdated { id, path });
            }
            Applied::Unchanged => outcome.skipped += 1,
            Applied::Drifted => {
                tracing::debug!(path = %path.display(), "File changed after preparation; entry voided");
                outcome.skipped += 1;
                outcome.state_drifted += 1;
            }
        }
    }
}

/// The file still has the stat captured at preparation time.
fn still_current(write: &EntryWrite) -> bool {
    FileStat::read(&write.file.path)
        .map(|stat| stat == write.file.stat)
        .unwrap_or(false)
}

fn apply_entry(conn: &Connection, locks: &AssetLocks, entry: &PendingEntry) -> Result<Applied> {
    let Some(write) = entry.write() else {
        return Ok(Applied::Unchanged);
    };
    if !still_current(write) {
        return Ok(Applied::Drifted);
    }

    let _guard = locks.lock(&write.file.path_key);
    let row = write.row();
    let extraction = &write.extraction;

    // Whether the stored metadata now describes this file state.
    let (applied, settled) = match (entry, write.asset_id) {
        (PendingEntry::Added(_), _) | (_, None) => {
            let id = assets::insert_asset(conn, &row, extraction)?;
            let written = assets::write_metadata(conn, id, extraction)?;
            (Applied::Added(id), written.accepted())
        }
        (PendingEntry::Updated(_), Some(id)) => {
            assets::update_asset(conn, id, &row)?;
            let written = assets::write_metadata(conn, id, extraction)?;
            if written.accepted() {
                assets::update_dimensions(conn, id, extraction)?;
            }
            (Applied::Updated(id), written.accepted())
        }
        (_, Some(id)) => {
            let written = assets::write_metadata(conn, id, extraction)?;
            let applied = if written.wrote() {
                assets::update_dimensions(conn, id, extraction)?;
                Applied::Refreshed(id)
            } else {
                Applied::Unchanged
            };
            (applied, written.accepted())
        }
    };

    // Journal last, in the same transaction as the asset write. A rejected
    // write leaves metadata from an earlier state, so the journal is not
    // advanced and the next scan extracts again.
    if settled && (write.journal_stale || applied != Applied::Unchanged) {
        journal::record(conn, &write.file.path_key, &write.file.fingerprint)?;
    }
    Ok(applied)
}

/// Repeated path first, otherwise the first entry that writes.
fn diagnose<'a>(writes: &[&'a PendingEntry]) -> Option<&'a Path> {
    let mut seen = HashSet::new();
    for &entry in writes {
        if let Some(write) = entry.write() {
            if !seen.insert(write.file.path_key.as_str()) {
                return Some(entry.path());
            }
        }
    }
    writes.first().copied().map(PendingEntry::path)
}

fn apply_all(conn: &mut Connection, locks: &AssetLocks, writes: &[&PendingEntry]) -> Result<Vec<Applied>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut applied = Vec::with_capacity(writes.len());
    for entry in writes {
        applied.push(apply_entry(&tx, locks, entry)?);
    }
    tx.commit()?;
    Ok(applied)
}

fn apply_one(conn: &mut Connection, locks: &AssetLocks, entry: &PendingEntry) -> Result<Applied> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let applied = apply_entry(&tx, locks, entry)?;
    tx.commit()?;
    Ok(applied)
}

/// Apply `entries` in order.
///
/// Returns `Err` only for lock contention on the batch transaction (the
/// caller may retry the batch) or a fatal store error.
pub fn apply_batch(conn: &mut Connection, locks: &AssetLocks, entries: &[PendingEntry]) -> Result<BatchReport> {
    let mut report = BatchReport::default();
    let mut writes: Vec<&PendingEntry> = Vec::with_capacity(entries.len());

    for entry in entries {
        match entry {
            PendingEntry::SkippedJournal { .. } => {
                report.outcome.skipped += 1;
                report.outcome.journal_skipped += 1;
            }
            PendingEntry::Skipped {
                reason: SkipReason::StatFailed,
                ..
            } => report.outcome.errors += 1,
            PendingEntry::Skipped { .. } => report.outcome.skipped += 1,
            _ => writes.push(entry),
        }
    }

    if writes.is_empty() {
        return Ok(report);
    }

    let failure = match apply_all(conn, locks, &writes) {
        Ok(applied) => {
            for (entry, result) in writes.iter().zip(applied) {
                result.record(entry.path(), &mut report.outcome, &mut report.events);
            }
            return Ok(report);
        }
        Err(e) if e.is_transient() || e.is_fatal() => return Err(e),
        Err(e) => e,
    };

    let suspect: Option<PathBuf> = diagnose(&writes).map(Path::to_path_buf);
    tracing::warn!(
        error = %failure,
        suspect = ?suspect,
        entries = writes.len(),
        "Batch transaction failed; applying entries individually"
    );

    report.outcome.fell_back = true;
    report.outcome.errors += writes.len();
    for entry in &writes {
        match apply_one(conn, locks, entry) {
            Ok(result) => {
                report.outcome.errors -= 1;
                result.record(entry.path(), &mut report.outcome, &mut report.events);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "Entry failed");
            }
        }
    }

    Ok(report)
}
