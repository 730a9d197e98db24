use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use super::inflight::InFlight;
use crate::store::BackingStore;
use crate::types::{FsError, FsResult, ObjectId};

/// Bounded cache of blob content fetched from the backing store.
///
/// Misses go through an [`InFlight`] so that concurrent readers of the same
/// uncached blob share a single fetch. Eviction is first-in first-out.
pub struct BlobCache {
    capacity: usize,
    entries: Mutex<CacheState>,
    fetches: InFlight<ObjectId, Arc<Vec<u8>>>,
}

#[derive(Default)]
struct CacheState {
    blobs: HashMap<ObjectId, Arc<Vec<u8>>>,
    order: VecDeque<ObjectId>,
}

impl BlobCache {
    pub fn new(capacity: usize) -> Self {
        BlobCache {
            capacity,
            entries: Mutex::new(CacheState::default()),
            fetches: InFlight::new(),
        }
    }

    pub fn get(&self, id: &ObjectId) -> Option<Arc<Vec<u8>>> {
        self.entries.lock().blobs.get(id).cloned()
    }

    pub fn fetch(&self, id: &ObjectId, store: &dyn BackingStore) -> FsResult<Arc<Vec<u8>>> {
        if let Some(blob) = self.get(id) {
            return Ok(blob);
        }
        self.fetches.run(*id, || {
            // A fetch that finished between the check above and now already filled the cache.
            if let Some(blob) = self.get(id) {
                return Ok(blob);
            }
            trace!("fetching blob {}", id);
            let blob = Arc::new(store.get_blob(id).map_err(FsError::from)?);
            self.insert(*id, blob.clone());
            Ok(blob)
        })
    }

    fn insert(&self, id: ObjectId, blob: Arc<Vec<u8>>) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.entries.lock();
        if state.blobs.insert(id, blob).is_none() {
            state.order.push_back(id);
        }
        while state.order.len() > self.capacity {
            if let Some(evicted) = state.order.pop_front() {
                state.blobs.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackingStore;

    #[test]
    fn test_fetch_is_cached() {
        let store = MemoryBackingStore::new();
        let id = store.add_blob("abc");
        let cache = BlobCache::new(4);
        assert_eq!(cache.fetch(&id, &store).unwrap().as_slice(), b"abc");
        assert_eq!(cache.fetch(&id, &store).unwrap().as_slice(), b"abc");
        assert_eq!(store.blob_fetch_count(), 1);
    }

    #[test]
    fn test_eviction_is_bounded() {
        let store = MemoryBackingStore::new();
        let ids: Vec<_> = (0..3).map(|i| store.add_blob(vec![i])).collect();
        let cache = BlobCache::new(2);
        for id in &ids {
            cache.fetch(id, &store).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&ids[0]).is_none());
        assert!(cache.get(&ids[2]).is_some());
    }

    #[test]
    fn test_store_failure_surfaces_as_unavailable() {
        let store = MemoryBackingStore::new();
        let id = store.add_blob("abc");
        store.set_available(false);
        let cache = BlobCache::new(4);
        let err = cache.fetch(&id, &store).unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::StoreUnavailable);
        assert!(cache.is_empty());
    }
}
