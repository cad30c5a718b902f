//! Priority queue of deferred extractions, deduplicated by path.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One queued path with its retry state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEnvelope {
    pub path: PathBuf,
    /// Lower runs first; negative values jump the queue.
    pub priority: i32,
    /// Attempts already made.
    pub attempt: u32,
    pub max_attempts: u32,
    pub not_before: Option<Instant>,
    seq: u64,
}

impl RetryEnvelope {
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug)]
pub struct EnrichmentQueue {
    entries: HashMap<PathBuf, RetryEnvelope>,
    /// (priority, seq) → run order.
    order: BTreeSet<(i32, u64)>,
    /// seq → path, oldest first, for eviction.
    by_age: BTreeMap<u64, PathBuf>,
    next_seq: u64,
    capacity: usize,
    max_attempts: u32,
    dropped: u64,
}

impl EnrichmentQueue {
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeSet::new(),
            by_age: BTreeMap::new(),
            next_seq: 0,
            capacity: capacity.max(1),
            max_attempts: max_attempts.max(1),
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Entries evicted for capacity since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn unlink(&mut self, envelope: &RetryEnvelope) {
        self.order.remove(&(envelope.priority, envelope.seq));
        self.by_age.remove(&envelope.seq);
    }

    fn link(&mut self, mut envelope: RetryEnvelope) {
        envelope.seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert((envelope.priority, envelope.seq));
        self.by_age.insert(envelope.seq, envelope.path.clone());
        self.entries.insert(envelope.path.clone(), envelope);
    }

    fn evict_oldest(&mut self) {
        let Some((_, path)) = self.by_age.pop_first() else {
            return;
        };
        if let Some(envelope) = self.entries.remove(&path) {
            self.order.remove(&(envelope.priority, envelope.seq));
            self.dropped += 1;
            tracing::debug!(path = %path.display(), "Enrichment queue full; dropped oldest entry");
        }
    }

    /// Enqueue `path`. A path already queued keeps its attempt count and
    /// takes the new priority.
    pub fn push(&mut self, path: PathBuf, priority: i32) {
        let envelope = match self.entries.remove(&path) {
            Some(existing) => {
                self.unlink(&existing);
                RetryEnvelope { priority, ..existing }
            }
            None => {
                if self.entries.len() >= self.capacity {
                    self.evict_oldest();
                }
                RetryEnvelope {
                    path,
                    priority,
                    attempt: 0,
                    max_attempts: self.max_attempts,
                    not_before: None,
                    seq: 0,
                }
            }
        };
        self.link(envelope);
    }

    /// Put a failed envelope back with one more attempt recorded.
    /// Returns false, leaving it out, once attempts are exhausted.
    pub fn requeue(&mut self, mut envelope: RetryEnvelope, delay: Duration) -> bool {
        envelope.attempt += 1;
        if envelope.exhausted() {
            return false;
        }
        if let Some(newer) = self.entries.remove(&envelope.path) {
            // Re-enqueued while in flight; keep the newer priority.
            self.unlink(&newer);
            envelope.priority = newer.priority;
        } else if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        envelope.not_before = Some(Instant::now() + delay);
        self.link(envelope);
        true
    }

    /// Up to `max` envelopes that are due at `now`, in priority order.
    pub fn pop_ready(&mut self, now: Instant, max: usize) -> Vec<RetryEnvelope> {
        let due: Vec<(i32, u64)> = self
            .order
            .iter()
            .filter(|(_, seq)| {
                self.by_age
                    .get(seq)
                    .and_then(|path| self.entries.get(path))
                    .map(|e| e.not_before.map_or(true, |t| t <= now))
                    .unwrap_or(false)
            })
            .take(max)
            .copied()
            .collect();

        let mut out = Vec::with_capacity(due.len());
        for key in due {
            if let Some(path) = self.by_age.get(&key.1).cloned() {
                if let Some(envelope) = self.entries.remove(&path) {
                    self.unlink(&envelope);
                    out.push(envelope);
                }
            }
        }
        out
    }

    /// Time until the earliest deferred envelope becomes due.
    pub fn next_due_in(&self, now: Instant) -> Option<Duration> {
        self.entries
            .values()
            .map(|e| e.not_before.map_or(Duration::ZERO, |t| t.saturating_duration_since(now)))
            .min()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.by_age.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(envelopes: &[RetryEnvelope]) -> Vec<&str> {
        envelopes.iter().map(|e| e.path.to_str().unwrap()).collect()
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut q = EnrichmentQueue::new(10, 3);
        q.push("/a".into(), 0);
        q.push("/b".into(), -5);
        q.push("/c".into(), 0);
        let ready = q.pop_ready(Instant::now(), 10);
        assert_eq!(paths(&ready), vec!["/b", "/a", "/c"]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_coalesces_keeping_latest_priority() {
        let mut q = EnrichmentQueue::new(10, 3);
        q.push("/a".into(), 0);
        q.push("/b".into(), 0);
        q.push("/a".into(), -1);
        assert_eq!(q.len(), 2);
        let ready = q.pop_ready(Instant::now(), 1);
        assert_eq!(paths(&ready), vec!["/a"]);
        assert_eq!(ready[0].priority, -1);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let mut q = EnrichmentQueue::new(2, 3);
        q.push("/a".into(), -10);
        q.push("/b".into(), 0);
        q.push("/c".into(), 0);
        assert_eq!(q.len(), 2);
        assert!(!q.contains(Path::new("/a")));
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn test_requeue_is_bounded() {
        let mut q = EnrichmentQueue::new(10, 2);
        q.push("/a".into(), 0);
        let envelope = q.pop_ready(Instant::now(), 1).remove(0);
        assert!(q.requeue(envelope, Duration::ZERO));

        let envelope = q.pop_ready(Instant::now(), 1).remove(0);
        assert_eq!(envelope.attempt, 1);
        assert!(!q.requeue(envelope, Duration::ZERO));
        assert!(q.is_empty());
    }

    #[test]
    fn test_deferred_envelopes_wait() {
        let mut q = EnrichmentQueue::new(10, 5);
        q.push("/a".into(), 0);
        let envelope = q.pop_ready(Instant::now(), 1).remove(0);
        q.requeue(envelope, Duration::from_secs(60));

        assert!(q.pop_ready(Instant::now(), 10).is_empty());
        assert!(q.next_due_in(Instant::now()).unwrap() > Duration::from_secs(50));
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(q.pop_ready(later, 10).len(), 1);
    }
}
