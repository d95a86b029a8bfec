//! Fixed-size worker pool shared by clustering and the index.
//!
//! Parallel phases are fork-join: the caller hands a batch of work to the
//! pool and blocks until all of it has finished. [`TaskPool::install`] runs a
//! rayon parallel loop on the pool's workers; [`TaskPool::submit`] and
//! [`TaskPool::await_all`] cover free-standing `'static` tasks.

use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};

use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::PaseError;

#[derive(Debug)]
struct LiveWorkers {
    count: Mutex<usize>,
    exited: Condvar,
}

impl LiveWorkers {
    fn worker_exited(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.exited.notify_all();
        }
    }

    fn wait_for_exit(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.exited.wait(&mut count);
        }
    }
}

/// Worker pool with an explicit lifetime.
#[derive(Debug)]
pub struct TaskPool {
    workers: ThreadPool,
    threads: usize,
    live: Arc<LiveWorkers>,
}

impl TaskPool {
    /// Start `threads` workers; `0` means one per available core.
    pub fn new(threads: usize) -> Result<Self, PaseError> {
        let threads = if threads == 0 {
            default_threads()
        } else {
            threads
        };

        let live = Arc::new(LiveWorkers {
            count: Mutex::new(threads),
            exited: Condvar::new(),
        });
        let on_exit = Arc::clone(&live);
        let workers = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("pase-worker-{idx}"))
            .exit_handler(move |_| on_exit.worker_exited())
            .build()
            .map_err(|err| PaseError::ThreadPool(err.to_string()))?;

        tracing::debug!(threads, "task pool started");
        Ok(Self {
            workers,
            threads,
            live,
        })
    }

    /// One worker per available core.
    pub fn with_default_threads() -> Result<Self, PaseError> {
        Self::new(0)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run a fork-join phase on the pool's workers and wait for it.
    ///
    /// Rayon parallel iterators used inside `op` are scheduled on this pool.
    /// A panic in any unit of work resumes on the calling thread.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.workers.install(op)
    }

    /// Queue `task` and return a handle to its result.
    pub fn submit<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel(1);
        self.workers.spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task)).map_err(panic_message);
            // The receiver may already be gone if the caller dropped the handle.
            let _ = sender.send(outcome);
        });
        TaskHandle { receiver }
    }

    /// Block until every handle in `handles` has completed.
    ///
    /// Results come back in submission order. If any task failed, the first
    /// failure in submission order is returned once the whole batch is done.
    pub fn await_all<T, I>(handles: I) -> Result<Vec<T>, PaseError>
    where
        I: IntoIterator<Item = TaskHandle<T>>,
    {
        let mut results = Vec::new();
        let mut first_error = None;
        for handle in handles {
            match handle.wait() {
                Ok(value) => results.push(value),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    /// Shut the pool down and wait until every worker thread has exited.
    ///
    /// Tasks already submitted still run to completion.
    pub fn join(self) {
        let TaskPool {
            workers,
            threads,
            live,
        } = self;
        drop(workers);
        live.wait_for_exit();
        tracing::debug!(threads, "task pool joined");
    }
}

/// Pending result of a submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<Result<T, String>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes.
    pub fn wait(self) -> Result<T, PaseError> {
        match self.receiver.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(PaseError::TaskFailed(message)),
            Err(_) => Err(PaseError::TaskFailed(
                "task was dropped before it completed".to_string(),
            )),
        }
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}
