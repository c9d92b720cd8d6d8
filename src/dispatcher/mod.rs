//! Trigger dispatcher.
//!
//! The dispatcher turns appended entries into execution records, enforces
//! per-(trigger, partition key) exclusivity, retries retryable failures
//! with backoff and tracks every cascade until it resolves. All of that
//! state lives on one thread; this module's [`Dispatcher`] is the handle the
//! rest of the crate talks to.

mod event_loop;
mod lanes;
mod pool;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, SendTimeoutError, Sender};

use crate::catalog::Catalog;
use crate::entry::{EntryId, Sequence};
use crate::error::{ExecutionError, TributaryError, TributaryResult};
use crate::execution::{CascadeReport, ExecutionKey, ExecutionRecord};
use crate::executor::Executor;
use crate::pipeline::PipelineConfig;
use crate::storage::EntryStore;

use self::event_loop::DispatcherCore;
use self::pool::{Completion, WorkerPool};

const CONTROL_PATH: &str = "dispatcher_control";

/// An entry was committed to a relation.
#[derive(Debug, Clone)]
pub(crate) enum Event {
    Appended { relation: String, sequence: Sequence },
}

#[derive(Debug)]
pub(crate) enum ControlMsg {
    CascadeStatus {
        root: EntryId,
        at: Option<(String, Sequence)>,
        reply: Sender<CascadeReport>,
    },
    WaitCascade {
        root: EntryId,
        at: Option<(String, Sequence)>,
        reply: Sender<CascadeReport>,
    },
    Execution {
        key: ExecutionKey,
        reply: Sender<Option<ExecutionRecord>>,
    },
    FailedExecutions {
        reply: Sender<Vec<ExecutionRecord>>,
    },
    CancelCascade {
        root: EntryId,
        reply: Sender<bool>,
    },
    WaitIdle {
        reply: Sender<()>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

/// Handle to the dispatcher thread.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    events_tx: Sender<Event>,
    control_tx: Sender<ControlMsg>,
    enqueue_timeout: Duration,
    shutdown_timeout: Duration,
    coalesced: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn start(
        catalog: Arc<Catalog>,
        store: Arc<dyn EntryStore>,
        executor: Arc<Executor>,
        config: &PipelineConfig,
    ) -> TributaryResult<Self> {
        let workers = config.workers.max(1);
        let (events_tx, events_rx) = bounded::<Event>(config.event_queue_capacity.max(1));
        let (control_tx, control_rx) = bounded::<ControlMsg>(config.control_queue_capacity.max(1));
        let (completion_tx, completion_rx) = bounded::<Completion>(workers);

        let pool = WorkerPool::start(workers, executor, completion_tx)?;
        let core = DispatcherCore::new(catalog, store, config.clone(), pool);

        let join = thread::Builder::new()
            .name("tributary-dispatcher".to_string())
            .spawn(move || core.run(events_rx, completion_rx, control_rx))
            .map_err(|e| TributaryError::internal(format!("failed to spawn dispatcher: {e}")))?;

        Ok(Self {
            events_tx,
            control_tx,
            enqueue_timeout: config.enqueue_timeout,
            shutdown_timeout: config.shutdown_timeout,
            coalesced: AtomicU64::new(0),
            join: Mutex::new(Some(join)),
        })
    }

    /// Tells the dispatcher `relation` has grown to `sequence`.
    ///
    /// Blocks for at most the enqueue timeout. A notification that does not
    /// fit is counted and left to the dispatcher's periodic catch-up.
    pub fn notify_append(&self, relation: &str, sequence: Sequence) {
        let event = Event::Appended {
            relation: relation.to_string(),
            sequence,
        };
        match self.events_tx.send_timeout(event, self.enqueue_timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(relation, sequence, "append notification coalesced");
            }
            Err(SendTimeoutError::Disconnected(_)) => {}
        }
    }

    /// Notifications that were coalesced into the periodic catch-up.
    #[must_use]
    pub fn coalesced_events(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub fn cascade_status(&self, root: EntryId, at: Option<(String, Sequence)>) -> TributaryResult<CascadeReport> {
        self.request(|reply| ControlMsg::CascadeStatus { root, at, reply })
    }

    pub fn wait_for_cascade(
        &self,
        root: EntryId,
        at: Option<(String, Sequence)>,
        timeout: Duration,
    ) -> TributaryResult<CascadeReport> {
        let (reply, rx) = bounded(1);
        self.send(ControlMsg::WaitCascade { root, at, reply })?;
        rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ExecutionError::timeout(timeout).into(),
            RecvTimeoutError::Disconnected => ExecutionError::disconnected(CONTROL_PATH).into(),
        })
    }

    pub fn execution(&self, key: ExecutionKey) -> TributaryResult<Option<ExecutionRecord>> {
        self.request(|reply| ControlMsg::Execution { key, reply })
    }

    pub fn failed_executions(&self) -> TributaryResult<Vec<ExecutionRecord>> {
        self.request(|reply| ControlMsg::FailedExecutions { reply })
    }

    pub fn cancel_cascade(&self, root: EntryId) -> TributaryResult<bool> {
        self.request(|reply| ControlMsg::CancelCascade { root, reply })
    }

    /// Blocks until nothing is queued, running, retrying or unresolved.
    pub fn wait_idle(&self, timeout: Duration) -> TributaryResult<()> {
        let (reply, rx) = bounded(1);
        self.send(ControlMsg::WaitIdle { reply })?;
        rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ExecutionError::timeout(timeout).into(),
            RecvTimeoutError::Disconnected => ExecutionError::disconnected(CONTROL_PATH).into(),
        })
    }

    /// Cancels pending work, waits for running executions and stops the thread.
    pub fn shutdown(&self) -> TributaryResult<()> {
        let (reply, rx) = bounded(1);
        let acknowledged = self.send(ControlMsg::Shutdown { reply }).is_ok()
            && rx.recv_timeout(self.shutdown_timeout + Duration::from_secs(1)).is_ok();
        let handle = self
            .join
            .lock()
            .map_err(|_| TributaryError::internal("poisoned lock: dispatcher join handle"))?
            .take();
        match handle {
            Some(handle) if acknowledged => handle
                .join()
                .map_err(|_| TributaryError::internal("dispatcher thread panicked")),
            Some(_) => {
                tracing::warn!("dispatcher did not acknowledge shutdown; detaching");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn send(&self, msg: ControlMsg) -> TributaryResult<()> {
        self.control_tx
            .send(msg)
            .map_err(|_| ExecutionError::disconnected(CONTROL_PATH).into())
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> ControlMsg) -> TributaryResult<T> {
        let (reply, rx) = bounded(1);
        self.send(build(reply))?;
        rx.recv()
            .map_err(|_| ExecutionError::disconnected(CONTROL_PATH).into())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Closing both channels ends the loop; the thread is detached.
        let (events_tx, _) = bounded::<Event>(1);
        drop(std::mem::replace(&mut self.events_tx, events_tx));
        let (control_tx, _) = bounded::<ControlMsg>(1);
        drop(std::mem::replace(&mut self.control_tx, control_tx));
        if let Ok(mut guard) = self.join.lock() {
            drop(guard.take());
        }
    }
}
