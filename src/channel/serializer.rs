use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{error, trace};
use parking_lot::Mutex;
use threadpool::ThreadPool;

use crate::core::{on_worker, BlockingPool};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

type Queues = Arc<Mutex<HashMap<u64, VecDeque<Job>>>>;

/// Runs jobs on a worker pool, in submission order for jobs sharing a key
/// and concurrently otherwise.
///
/// A key has an entry in `queues` exactly while one pool task drains it;
/// later jobs for that key wait in the entry instead of taking a worker.
/// A worker parked in a [`blocking`](crate::core::blocking) section is
/// replaced for as long as it waits, so stalled fetches on some inodes never
/// hold up the others.
pub struct InodeSerializer {
    queues: Queues,
    workers: Arc<Workers>,
}

struct Workers {
    base: usize,
    state: Mutex<WorkerState>,
}

struct WorkerState {
    pool: ThreadPool,
    blocked: usize,
}

impl BlockingPool for Workers {
    fn enter_blocking(&self) {
        let mut state = self.state.lock();
        state.blocked += 1;
        let threads = self.base + state.blocked;
        trace!("worker blocked, pool grows to {}", threads);
        state.pool.set_num_threads(threads);
    }

    fn exit_blocking(&self) {
        let mut state = self.state.lock();
        state.blocked = state.blocked.saturating_sub(1);
        let threads = self.base + state.blocked;
        state.pool.set_num_threads(threads);
    }
}

impl InodeSerializer {
    pub fn new(workers: usize) -> Self {
        #[cfg(feature = "deadlock_detection")]
        spawn_deadlock_checker();
        let base = workers.max(1);
        InodeSerializer {
            queues: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Workers {
                base,
                state: Mutex::new(WorkerState {
                    pool: ThreadPool::with_name("lazy-fuser-worker".to_string(), base),
                    blocked: 0,
                }),
            }),
        }
    }

    pub fn submit(&self, key: u64, job: Job) {
        {
            let mut queues = self.queues.lock();
            if let Some(queue) = queues.get_mut(&key) {
                queue.push_back(job);
                return;
            }
            queues.insert(key, VecDeque::new());
        }
        let queues = self.queues.clone();
        let workers: Arc<dyn BlockingPool> = self.workers.clone();
        self.workers
            .state
            .lock()
            .pool
            .execute(move || on_worker(workers, || drain(&queues, key, job)));
    }

    /// Blocks until every submitted job has run.
    pub fn wait_idle(&self) {
        // joined outside the lock; parked workers need it to resize the pool
        let pool = self.workers.state.lock().pool.clone();
        pool.join();
    }

    /// Keys with a job running or queued.
    pub fn busy_keys(&self) -> usize {
        self.queues.lock().len()
    }

    /// Threads the pool currently runs, including stand-ins for blocked workers.
    pub fn thread_count(&self) -> usize {
        self.workers.state.lock().pool.max_count()
    }
}

fn drain(queues: &Queues, key: u64, first: Job) {
    let mut next = Some(first);
    while let Some(job) = next.take() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("job for inode {} panicked", key);
        }
        let mut queues = queues.lock();
        match queues.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(job) => next = Some(job),
            None => {
                queues.remove(&key);
            }
        }
    }
}

#[cfg(feature = "deadlock_detection")]
fn spawn_deadlock_checker() {
    use log::info;
    use parking_lot::deadlock;
    use std::thread;
    use std::time::Duration;

    // Checks for deadlocks every 10s
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(10));
        let deadlocks = deadlock::check_deadlock();
        if deadlocks.is_empty() {
            info!("# No deadlock");
            continue;
        }

        error!("# {} deadlocks detected", deadlocks.len());
        for (i, threads) in deadlocks.iter().enumerate() {
            error!("Deadlock #{}", i);
            for t in threads {
                error!("Thread Id {:#?}\n, {:#?}", t.thread_id(), t.backtrace());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_key_runs_in_order() {
        let serializer = InodeSerializer::new(4);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = order.clone();
            serializer.submit(
                3,
                Box::new(move || {
                    if i % 3 == 0 {
                        thread::sleep(Duration::from_millis(2));
                    }
                    order.lock().push(i);
                }),
            );
        }
        serializer.wait_idle();
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
        assert_eq!(serializer.busy_keys(), 0);
    }

    #[test]
    fn test_different_keys_run_concurrently() {
        let serializer = InodeSerializer::new(2);
        let (blocked_tx, blocked_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        serializer.submit(
            1,
            Box::new(move || {
                let _ = blocked_rx.recv_timeout(Duration::from_secs(5));
            }),
        );
        serializer.submit(
            2,
            Box::new(move || {
                done_tx.send(()).unwrap();
            }),
        );
        // key 2 finishes while key 1 is still parked
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        blocked_tx.send(()).unwrap();
        serializer.wait_idle();
    }

    #[test]
    fn test_panicking_job_does_not_stall_queue() {
        let serializer = InodeSerializer::new(1);
        let ran = Arc::new(AtomicUsize::new(0));
        serializer.submit(5, Box::new(|| panic!("handler bug")));
        let counter = ran.clone();
        serializer.submit(
            5,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        serializer.wait_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocked_workers_are_replaced() {
        let serializer = InodeSerializer::new(2);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let (parked_tx, parked_rx) = mpsc::channel();

        for key in [1, 2] {
            let release_rx = release_rx.clone();
            let parked_tx = parked_tx.clone();
            serializer.submit(
                key,
                Box::new(move || {
                    crate::core::blocking(|| {
                        parked_tx.send(()).unwrap();
                        let _ = release_rx.lock().recv_timeout(Duration::from_secs(5));
                    })
                }),
            );
        }
        parked_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        parked_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(serializer.thread_count(), 4);

        // both base workers are parked, a third key still gets a thread
        let (done_tx, done_rx) = mpsc::channel();
        serializer.submit(
            3,
            Box::new(move || {
                done_tx.send(()).unwrap();
            }),
        );
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        serializer.wait_idle();
        assert_eq!(serializer.thread_count(), 2);
    }
}
