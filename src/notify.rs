//! Best-effort change notifications.
//!
//! The indexer fires events after a batch commits. A sink can never fail
//! the operation that produced the event: errors and panics stop here.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use crate::db::scans::ScanTotals;

#[derive(Debug, Clone, PartialEq)]
pub enum IndexEvent {
    AssetAdded { id: i64, path: PathBuf },
    AssetUpdated { id: i64, path: PathBuf },
    ScanComplete { root: PathBuf, added: usize, updated: usize, skipped: usize, errors: usize },
}

impl IndexEvent {
    pub fn scan_complete(root: PathBuf, totals: &ScanTotals) -> Self {
        IndexEvent::ScanComplete {
            root,
            added: totals.added,
            updated: totals.updated,
            skipped: totals.skipped,
            errors: totals.errors,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &IndexEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: &IndexEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Forwards events over a std channel, for a UI thread or a test.
pub struct ChannelNotifier {
    tx: Mutex<Sender<IndexEvent>>,
}

impl ChannelNotifier {
    pub fn new(tx: Sender<IndexEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: &IndexEvent) -> anyhow::Result<()> {
        let tx = self.tx.lock().map_err(|_| anyhow::anyhow!("notifier lock poisoned"))?;
        tx.send(event.clone())?;
        Ok(())
    }
}

/// Deliver `event`, swallowing sink errors and panics.
pub fn emit(notifier: &dyn Notifier, event: &IndexEvent) {
    match panic::catch_unwind(AssertUnwindSafe(|| notifier.notify(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "Notification dropped"),
        Err(_) => tracing::warn!("Notifier panicked; event dropped"),
    }
}
