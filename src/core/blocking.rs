//! Sections where a worker thread waits on the backing store.
//!
//! A worker pool installs itself on its threads with [`on_worker`]. Code that
//! may wait for a fetch wraps the wait in [`blocking`], which tells the pool
//! so it can keep other requests moving while this thread is parked.

use std::cell::RefCell;
use std::sync::Arc;

/// A pool that compensates for workers parked in a [`blocking`] section.
pub trait BlockingPool: Send + Sync {
    fn enter_blocking(&self);

    fn exit_blocking(&self);
}

thread_local! {
    static POOL: RefCell<Option<Arc<dyn BlockingPool>>> = const { RefCell::new(None) };
}

/// Runs `job` with `pool` registered as the current thread's pool.
pub fn on_worker<R>(pool: Arc<dyn BlockingPool>, job: impl FnOnce() -> R) -> R {
    let previous = POOL.with(|current| current.replace(Some(pool)));
    let _restore = Restore(previous);
    job()
}

/// Runs `wait`, announcing it to the current worker pool if there is one.
///
/// Nested sections count once: the pool is detached from the thread until
/// the outer section ends.
pub fn blocking<R>(wait: impl FnOnce() -> R) -> R {
    let Some(pool) = POOL.with(|current| current.borrow_mut().take()) else {
        return wait();
    };
    pool.enter_blocking();
    let _exit = Exit(Some(pool));
    wait()
}

struct Restore(Option<Arc<dyn BlockingPool>>);

impl Drop for Restore {
    fn drop(&mut self) {
        let previous = self.0.take();
        POOL.with(|current| *current.borrow_mut() = previous);
    }
}

struct Exit(Option<Arc<dyn BlockingPool>>);

impl Drop for Exit {
    fn drop(&mut self) {
        if let Some(pool) = self.0.take() {
            pool.exit_blocking();
            POOL.with(|current| *current.borrow_mut() = Some(pool));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl BlockingPool for Recorder {
        fn enter_blocking(&self) {
            self.0.lock().push("enter");
        }

        fn exit_blocking(&self) {
            self.0.lock().push("exit");
        }
    }

    #[test]
    fn test_outside_a_pool_just_runs() {
        assert_eq!(blocking(|| 3), 3);
    }

    #[test]
    fn test_nested_sections_count_once() {
        let recorder = Arc::new(Recorder::default());
        on_worker(recorder.clone(), || {
            blocking(|| blocking(|| ()));
            blocking(|| ());
        });
        assert_eq!(*recorder.0.lock(), ["enter", "exit", "enter", "exit"]);
        // the registration ends with the job
        blocking(|| ());
        assert_eq!(recorder.0.lock().len(), 4);
    }

    #[test]
    fn test_unwinding_section_still_exits() {
        let recorder = Arc::new(Recorder::default());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            on_worker(recorder.clone(), || blocking(|| panic!("fetch failed")))
        }));
        assert!(result.is_err());
        assert_eq!(*recorder.0.lock(), ["enter", "exit"]);
    }
}
