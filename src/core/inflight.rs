//! Deduplication of concurrent fetches for the same key.
//!
//! The first caller for a key runs the fetch; callers arriving while it is in
//! flight suspend on a condition variable and receive a clone of its result.
//! Nothing is cached once the fetch completes. Leader and waiters alike run
//! inside a [`blocking`](super::blocking::blocking) section.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::blocking::blocking;
use crate::types::{FsError, FsResult};

pub struct InFlight<K, V> {
    slots: Mutex<HashMap<K, Arc<Slot<V>>>>,
}

struct Slot<V> {
    result: Mutex<Option<FsResult<V>>>,
    ready: Condvar,
}

impl<V: Clone> Slot<V> {
    fn wait(&self) -> FsResult<V> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            self.ready.wait(&mut result);
        }
    }
}

impl<K, V> Default for InFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        InFlight {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `fetch` unless a fetch for `key` is already running, in which case
    /// waits for that one and shares its result. Either way the caller is in a
    /// [`blocking`] section until the result is in.
    pub fn run<F>(&self, key: K, fetch: F) -> FsResult<V>
    where
        F: FnOnce() -> FsResult<V>,
    {
        blocking(|| self.run_blocking(key, fetch))
    }

    fn run_blocking<F>(&self, key: K, fetch: F) -> FsResult<V>
    where
        F: FnOnce() -> FsResult<V>,
    {
        let slot = {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get(&key) {
                let slot = slot.clone();
                drop(slots);
                return slot.wait();
            }
            let slot = Arc::new(Slot {
                result: Mutex::new(None),
                ready: Condvar::new(),
            });
            slots.insert(key.clone(), slot.clone());
            slot
        };

        let mut leader = Leader {
            owner: self,
            key,
            slot,
            done: false,
        };
        let result = fetch();
        leader.finish(result.clone());
        result
    }

    /// Number of fetches currently running.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Publishes the leader's result; if the fetch unwinds, waiters get an error
/// instead of sleeping forever.
struct Leader<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    owner: &'a InFlight<K, V>,
    key: K,
    slot: Arc<Slot<V>>,
    done: bool,
}

impl<K, V> Leader<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn finish(&mut self, result: FsResult<V>) {
        self.done = true;
        *self.slot.result.lock() = Some(result);
        self.owner.slots.lock().remove(&self.key);
        self.slot.ready.notify_all();
    }
}

impl<K, V> Drop for Leader<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.done {
            self.finish(Err(FsError::internal("fetch aborted")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_concurrent_callers_share_one_fetch() {
        let inflight = Arc::new(InFlight::<u64, Arc<Vec<u8>>>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let inflight = inflight.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    inflight.run(7, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        Ok(Arc::new(b"content".to_vec()))
                    })
                })
            })
            .collect();

        for t in threads {
            assert_eq!(t.join().unwrap().unwrap().as_slice(), b"content");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(inflight.is_empty());
    }

    #[test]
    fn test_errors_are_shared_and_not_cached() {
        let inflight = InFlight::<u64, u32>::new();
        let err = inflight
            .run(1, || Err(FsError::not_found("gone")))
            .unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::NotFound);
        assert_eq!(inflight.run(1, || Ok(5)).unwrap(), 5);
    }

    #[test]
    fn test_panicking_leader_releases_waiters() {
        let inflight = Arc::new(InFlight::<u64, u32>::new());
        let entered = Arc::new(Barrier::new(2));

        let leader = {
            let inflight = inflight.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                let _ = panic::catch_unwind(AssertUnwindSafe(|| {
                    inflight.run(3, || {
                        entered.wait();
                        thread::sleep(Duration::from_millis(50));
                        panic!("fetch blew up");
                    })
                }));
            })
        };

        entered.wait();
        let waiter = inflight.run(3, || Ok(1));
        leader.join().unwrap();
        // Either we joined the doomed fetch or ran after it was cleared.
        match waiter {
            Ok(v) => assert_eq!(v, 1),
            Err(e) => assert_eq!(e.kind(), crate::types::ErrorKind::GenericError),
        }
        assert!(inflight.is_empty());
    }
}
