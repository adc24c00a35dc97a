//! Worker pool for blocking suspensions
//!
//! `suspend_blocking` is the only sanctioned way a script waits on a
//! synchronous call; the thunk runs on one of these workers and the fiber
//! is not runnable until the worker delivers the result. One process-wide
//! pool is shared by default; hosts embedding several runtimes can build
//! their own.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;

use crate::error::RunResult;
use crate::suspend::BlockingWork;
use crate::value::Value;

struct Job {
    work: BlockingWork,
    reply: Sender<RunResult<Value>>,
}

/// Fixed-size pool of worker threads executing blocking thunks
pub struct WorkerPool {
    tx: Sender<Job>,
}

impl WorkerPool {
    /// Create a pool with the given number of worker threads
    pub fn new(threads: usize) -> Self {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = unbounded();
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("quill-worker-{}", i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let result = (job.work)();
                        // The fiber may have been dropped; nothing to do then
                        let _ = job.reply.send(result);
                    }
                    log::debug!("worker thread exiting");
                })
                .expect("failed to spawn worker thread");
        }
        Self { tx }
    }

    /// The shared process-wide pool (sized to the CPU count)
    pub fn shared() -> Arc<WorkerPool> {
        static SHARED: Lazy<Arc<WorkerPool>> =
            Lazy::new(|| Arc::new(WorkerPool::new(num_cpus::get())));
        SHARED.clone()
    }

    /// Submit a blocking thunk; the result is sent to `reply` when done
    pub fn submit(&self, work: BlockingWork, reply: Sender<RunResult<Value>>) {
        let job = Job { work, reply };
        // The receiver lives as long as the pool
        let _ = self.tx.send(job);
    }
}
