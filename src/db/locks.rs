use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

/// Striped advisory locks keyed by asset path key.
///
/// The persistence engine and the enrichment worker take the stripe for an
/// asset before its read-compare-write of metadata, so two writers never
/// interleave on one row. Lock order: store connection first, then stripe.
/// A holder never takes a second stripe.
pub struct AssetLocks {
    stripes: Vec<Mutex<()>>,
}

impl AssetLocks {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    pub fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_for(key)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
