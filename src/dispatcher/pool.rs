//! Executor worker pool.
//!
//! Workers pull jobs from one bounded queue and report back on the
//! completion channel. The dispatcher never has more jobs in flight than
//! there are workers, so neither side blocks on a full queue.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::entry::Entry;
use crate::error::{TributaryError, TributaryResult};
use crate::execution::{ExecutionFailure, ExecutionKey, ExecutionRecord};
use crate::executor::Executor;

/// One attempt of one execution: the record as it stood when the attempt
/// started, and the input entry.
#[derive(Debug)]
pub(crate) struct Job {
    pub record: ExecutionRecord,
    pub entry: Arc<Entry>,
}

/// Outcome of a job, sent back to the dispatcher.
#[derive(Debug)]
pub(crate) struct Completion {
    pub key: ExecutionKey,
    pub result: Result<Vec<Entry>, ExecutionFailure>,
}

pub(crate) struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        workers: usize,
        executor: Arc<Executor>,
        completions: Sender<Completion>,
    ) -> TributaryResult<Self> {
        let workers = workers.max(1);
        let (tx, rx) = bounded::<Job>(workers);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let executor = Arc::clone(&executor);
            let completions = completions.clone();
            let handle = thread::Builder::new()
                .name(format!("tributary-worker-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let result = executor.execute(&job.record, &job.entry);
                        let key = job.record.key;
                        if completions.send(Completion { key, result }).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| TributaryError::internal(format!("failed to spawn worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers: handles,
        })
    }

    /// Hands a job to the next free worker.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        match &self.tx {
            Some(tx) => tx.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }

    /// Closes the queue and detaches the workers; each exits after its
    /// current job. Used when a worker may still be inside trigger code.
    pub fn close(&mut self) {
        self.tx = None;
        self.workers.clear();
    }

    /// Closes the queue and waits for every worker to exit. Only call this
    /// with no job in flight.
    pub fn join(&mut self) {
        self.tx = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}
