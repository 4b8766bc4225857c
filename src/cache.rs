//! The blob cache (§4.5): at most one live in-memory `Blob` per digest,
//! held by weak reference so an inactive blob is evicted once its last
//! strong reference (the opener, or the pager) drops.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};

use crate::blob::Blob;
use crate::config::CachePolicy;
use crate::error::{Result, StoreError};
use crate::format::DIGEST_LEN;

pub struct BlobCache {
    entries: spin::Mutex<BTreeMap<[u8; DIGEST_LEN], Weak<Blob>>>,
    policy: CachePolicy,
}

impl BlobCache {
    pub fn new(policy: CachePolicy) -> BlobCache {
        BlobCache { entries: spin::Mutex::new(BTreeMap::new()), policy }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Looks up a live blob, upgrading the weak reference. A dead entry
    /// (no strong references survive) is removed and reported not-found so
    /// the caller reloads from disk.
    pub fn lookup(&self, digest: &[u8; DIGEST_LEN]) -> Option<Arc<Blob>> {
        let mut entries = self.entries.lock();
        match entries.get(digest).and_then(Weak::upgrade) {
            Some(blob) => Some(blob),
            None => {
                entries.remove(digest);
                None
            }
        }
    }

    /// Fails if an entry already exists and is still upgradable.
    pub fn insert(&self, digest: [u8; DIGEST_LEN], blob: Arc<Blob>) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&digest) {
            if existing.upgrade().is_some() {
                return Err(StoreError::AlreadyExists);
            }
        }
        entries.insert(digest, Arc::downgrade(&blob));
        Ok(())
    }

    /// Drops stale (no longer upgradable) entries. Not required for
    /// correctness — `lookup` self-heals — but useful for bounding map
    /// growth under churn.
    pub fn reap_dead_entries(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().values().filter(|w| w.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::node::NodeIndex;

    fn sample_blob(digest: [u8; DIGEST_LEN]) -> Arc<Blob> {
        Arc::new(Blob::new_writing(digest, NodeIndex(0), 0, crate::config::BlobLayout::CompactAtEnd))
    }

    #[test]
    fn lookup_misses_after_last_strong_ref_drops() {
        let cache = BlobCache::new(CachePolicy::EvictImmediately);
        let digest = [1u8; DIGEST_LEN];
        {
            let blob = sample_blob(digest);
            cache.insert(digest, Arc::clone(&blob)).unwrap();
            assert!(cache.lookup(&digest).is_some());
        }
        assert!(cache.lookup(&digest).is_none());
    }

    #[test]
    fn insert_over_live_entry_fails() {
        let cache = BlobCache::new(CachePolicy::EvictImmediately);
        let digest = [2u8; DIGEST_LEN];
        let blob = sample_blob(digest);
        cache.insert(digest, Arc::clone(&blob)).unwrap();
        assert!(cache.insert(digest, Arc::clone(&blob)).is_err());
    }

    #[test]
    fn insert_over_dead_entry_succeeds() {
        let cache = BlobCache::new(CachePolicy::EvictImmediately);
        let digest = [3u8; DIGEST_LEN];
        {
            let blob = sample_blob(digest);
            cache.insert(digest, blob).unwrap();
        }
        let fresh = sample_blob(digest);
        assert!(cache.insert(digest, fresh).is_ok());
    }
}
