//! Where async instances run their work.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::error::TrickleError;

/// A unit of work submitted to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs submitted by async instances.
///
/// Jobs should start roughly in submission order. An executor may run them on any thread and
/// any number at a time.
pub trait Executor: Send + Sync + 'static {
    /// Schedule `job` to run.
    fn submit(&self, job: Job);
}

struct Queue {
    jobs: VecDeque<Job>,
    shut_down: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// A fixed pool of worker threads sharing one FIFO queue.
///
/// A panicking job is logged and does not take its worker down. Dropping the pool shuts it
/// down.
///
/// To run on another runtime, implement [`Executor`] and pass it to
/// [`TrickleInstanceBuilder::executor`](crate::TrickleInstanceBuilder::executor).
pub struct ThreadPoolExecutor {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl ThreadPoolExecutor {
    /// Start `threads` workers (at least one).
    pub fn new(threads: usize) -> Result<Self, TrickleError> {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                shut_down: false,
            }),
            available: Condvar::new(),
        });
        let pool = Self {
            shared,
            handles: Mutex::new(Vec::with_capacity(threads)),
            threads,
        };
        for i in 0..threads {
            let shared = pool.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("trickle-worker-{i}"))
                .spawn(move || run_worker(&shared))
                .map_err(|err| TrickleError::ExecutorUnavailable {
                    message: err.to_string(),
                })?;
            pool.handles.lock().push(handle);
        }
        Ok(pool)
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Stop the workers. Queued jobs that have not started are dropped.
    ///
    /// Waits for running jobs unless called from one of the pool's own workers.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shut_down = true;
            queue.jobs.clear();
        }
        self.shared.available.notify_all();
        let current = thread::current().id();
        for handle in self.handles.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                #[cfg(feature = "log")]
                log::warn!(target: "trickle", "executor worker exited with a panic");
            }
        }
    }
}

fn run_worker(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shut_down {
                    return;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                shared.available.wait(&mut queue);
            }
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            #[cfg(feature = "log")]
            log::error!(target: "trickle", "executor job panicked");
        }
    }
}

impl Executor for ThreadPoolExecutor {
    fn submit(&self, job: Job) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shut_down {
                return;
            }
            queue.jobs.push_back(job);
        }
        self.shared.available.notify_one();
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("threads", &self.threads)
            .finish()
    }
}
