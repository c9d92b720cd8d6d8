//! Dispatcher state machine and event loop.
//!
//! A single thread owns every execution record. It is fed by three bounded
//! channels (append notifications, worker completions, control requests)
//! and a periodic tick, and it is the only place records change state.
//!
//! Append notifications only say "look at relation R". The relation's log
//! is the queue: the loop keeps a watermark per watched relation and admits
//! entries by reading past it in sequence order, so the order in which
//! notifications arrive, or whether they arrive at all, never changes the
//! order in which executions are created.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{never, select, Receiver, Sender};

use crate::catalog::Catalog;
use crate::entry::{Entry, EntryId, Sequence};
use crate::execution::{log_append, CascadeReport, CascadeState, ExecutionKey, ExecutionRecord};
use crate::pipeline::{PipelineConfig, StartPosition};
use crate::storage::{EntryStore, WriteBatch};

use super::lanes::Lanes;
use super::pool::{Completion, Job, WorkerPool};
use super::{ControlMsg, Event};

struct Slot {
    record: ExecutionRecord,
    entry: Arc<Entry>,
    stateful: bool,
}

#[derive(Default)]
struct Cascade {
    members: Vec<ExecutionKey>,
    open: usize,
    cancelled: bool,
    /// Relations this cascade wrote to whose catch-up has not completed.
    behind: HashSet<String>,
    waiters: Vec<Sender<CascadeReport>>,
}

pub(crate) struct DispatcherCore {
    catalog: Arc<Catalog>,
    store: Arc<dyn EntryStore>,
    config: PipelineConfig,
    pool: WorkerPool,

    watermarks: HashMap<String, Sequence>,
    /// Relations whose last catch-up failed.
    lagging: HashSet<String>,

    slots: HashMap<ExecutionKey, Slot>,
    lanes: Lanes,
    ready: VecDeque<ExecutionKey>,
    retries: BTreeMap<(Instant, u64), ExecutionKey>,
    retry_seq: u64,
    in_flight: usize,

    cascades: HashMap<EntryId, Cascade>,
    archive: VecDeque<EntryId>,
    archived: HashMap<EntryId, CascadeReport>,
    failed: VecDeque<ExecutionRecord>,

    idle_waiters: Vec<Sender<()>>,
    shutdown: Option<(Instant, Sender<()>)>,
}

impl DispatcherCore {
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<dyn EntryStore>,
        config: PipelineConfig,
        pool: WorkerPool,
    ) -> Self {
        let mut watermarks = HashMap::new();
        let mut lagging = HashSet::new();
        for relation in catalog.watched_relations() {
            let start = match config.start_position {
                StartPosition::Beginning => Ok(0),
                StartPosition::Latest => store.last_sequence(relation),
            };
            match start {
                Ok(seq) => {
                    watermarks.insert(relation.to_string(), seq);
                }
                Err(e) => {
                    tracing::warn!(relation, error = %e, "could not read start position; replaying from beginning");
                    watermarks.insert(relation.to_string(), 0);
                    lagging.insert(relation.to_string());
                }
            }
        }

        Self {
            catalog,
            store,
            config,
            pool,
            watermarks,
            lagging,
            slots: HashMap::new(),
            lanes: Lanes::new(),
            ready: VecDeque::new(),
            retries: BTreeMap::new(),
            retry_seq: 0,
            in_flight: 0,
            cascades: HashMap::new(),
            archive: VecDeque::new(),
            archived: HashMap::new(),
            failed: VecDeque::new(),
            idle_waiters: Vec::new(),
            shutdown: None,
        }
    }

    /// Runs until shutdown completes or every sender is gone.
    pub fn run(
        mut self,
        events: Receiver<Event>,
        completions: Receiver<Completion>,
        control: Receiver<ControlMsg>,
    ) {
        tracing::info!(
            workers = self.config.workers,
            relations = self.watermarks.len(),
            "dispatcher started"
        );

        let mut events = events;
        let mut completions = completions;
        let mut control = control;
        for relation in self.watermarks.keys().cloned().collect::<Vec<_>>() {
            self.catch_up(&relation);
        }

        loop {
            self.promote_due_retries();
            self.dispatch();
            self.resolve_ready_cascades();
            self.answer_idle_waiters();
            if self.shutdown_complete() {
                break;
            }

            let wait = self.next_wake();
            select! {
                recv(completions) -> msg => match msg {
                    Ok(completion) => self.on_completion(completion),
                    Err(_) => {
                        completions = never();
                        self.in_flight = 0;
                    }
                },
                recv(events) -> msg => match msg {
                    Ok(Event::Appended { relation, sequence }) => self.on_append(&relation, sequence),
                    Err(_) => {
                        events = never();
                        self.begin_shutdown(None);
                    }
                },
                recv(control) -> msg => match msg {
                    Ok(msg) => self.on_control(msg),
                    Err(_) => {
                        control = never();
                        self.begin_shutdown(None);
                    }
                },
                default(wait) => self.on_tick(),
            }
        }

        self.finish();
    }

    fn next_wake(&self) -> Duration {
        let tick = self.config.tick_interval;
        let now = Instant::now();
        let retry = self
            .retries
            .keys()
            .next()
            .map_or(tick, |(due, _)| due.saturating_duration_since(now));
        let wait = tick.min(retry);
        match &self.shutdown {
            Some((deadline, _)) => wait.min(deadline.saturating_duration_since(now)),
            None => wait,
        }
    }

    fn on_append(&mut self, relation: &str, sequence: Sequence) {
        let behind = self
            .watermarks
            .get(relation)
            .is_some_and(|&wm| wm < sequence);
        if behind {
            self.catch_up(relation);
        }
    }

    fn on_tick(&mut self) {
        let relations: Vec<String> = self.watermarks.keys().cloned().collect();
        for relation in relations {
            let watermark = self.watermarks.get(&relation).copied().unwrap_or(0);
            match self.store.last_sequence(&relation) {
                Ok(last) if last > watermark => {
                    tracing::debug!(relation = %relation, watermark, last, "tick picked up coalesced appends");
                    self.catch_up(&relation);
                }
                Ok(_) => {
                    self.lagging.remove(&relation);
                }
                Err(e) => {
                    tracing::warn!(relation = %relation, error = %e, "store read failed during tick");
                }
            }
        }
    }

    /// Admits every entry of `relation` past its watermark.
    fn catch_up(&mut self, relation: &str) {
        let Some(mut watermark) = self.watermarks.get(relation).copied() else {
            return;
        };
        let batch_size = self.config.cursor_batch_size.max(1);
        loop {
            let batch = match self.store.read_after(relation, watermark, None, batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(relation, watermark, error = %e, "store read failed during catch-up");
                    self.lagging.insert(relation.to_string());
                    break;
                }
            };
            let full = batch.len() >= batch_size;
            for entry in batch {
                watermark = entry.sequence;
                self.admit(entry);
            }
            self.watermarks.insert(relation.to_string(), watermark);
            if !full {
                self.lagging.remove(relation);
                break;
            }
        }
    }

    /// Creates a pending record for every trigger subscribed to the entry's relation.
    fn admit(&mut self, entry: Entry) {
        if self.shutdown.is_some() {
            return;
        }
        if self
            .archived
            .get(&entry.root)
            .is_some_and(|r| r.state == CascadeState::Cancelled)
            || self.cascades.get(&entry.root).is_some_and(|c| c.cancelled)
        {
            tracing::debug!(entry = %entry.id, root = %entry.root, "skipping entry of cancelled cascade");
            return;
        }
        let Some(relation) = self.catalog.relation(&entry.relation) else {
            return;
        };

        let entry = Arc::new(entry);
        for trigger in self.catalog.triggers_for(&entry.relation) {
            let key = ExecutionKey::new(trigger.name(), entry.id);
            if self.slots.contains_key(&key) {
                continue;
            }
            let partition = trigger.partition_key(&entry, relation);
            let record = ExecutionRecord::new(
                key.clone(),
                trigger.trigger_version(),
                entry.relation.clone(),
                entry.sequence,
                entry.root,
                partition.clone(),
                trigger.attempt_limit().unwrap_or(self.config.max_attempts),
            );
            tracing::debug!(
                trigger = %key.trigger,
                entry = %entry.id,
                relation = %entry.relation,
                sequence = entry.sequence,
                partition = %partition,
                "execution created"
            );

            let cascade = self.cascades.entry(entry.root).or_default();
            cascade.members.push(key.clone());
            cascade.open += 1;

            let stateful = trigger.is_stateful();
            let runnable = !stateful || self.lanes.push(&partition, key.clone());
            self.slots.insert(
                key.clone(),
                Slot {
                    record,
                    entry: Arc::clone(&entry),
                    stateful,
                },
            );
            if runnable {
                self.ready.push_back(key);
            }
        }
    }

    fn dispatch(&mut self) {
        while self.in_flight < self.config.workers.max(1) {
            let Some(key) = self.ready.pop_front() else {
                break;
            };
            let Some(slot) = self.slots.get_mut(&key) else {
                continue;
            };
            let Some(attempt) = slot.record.start() else {
                continue;
            };
            tracing::debug!(trigger = %key.trigger, entry = %key.entry, attempt, "execution started");
            let job = Job {
                record: slot.record.clone(),
                entry: Arc::clone(&slot.entry),
            };
            match self.pool.submit(job) {
                Ok(()) => self.in_flight += 1,
                Err(job) => {
                    let key = &job.record.key;
                    tracing::error!(trigger = %key.trigger, entry = %key.entry, "worker pool closed");
                    break;
                }
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let Completion { key, result } = completion;
        let Some(slot) = self.slots.get_mut(&key) else {
            return;
        };

        match result {
            Ok(outputs) => {
                let ids = outputs.iter().map(|e| e.id).collect();
                slot.record.succeed(ids);
                let root = slot.record.root;
                tracing::debug!(
                    trigger = %key.trigger,
                    entry = %key.entry,
                    outputs = outputs.len(),
                    "execution succeeded"
                );
                // Admit downstream work before this record can close its cascade.
                let mut relations: Vec<&str> = outputs.iter().map(|e| e.relation.as_str()).collect();
                relations.sort_unstable();
                relations.dedup();
                let relations: Vec<String> = relations.into_iter().map(str::to_string).collect();
                for relation in &relations {
                    self.catch_up(relation);
                }
                if let Some(cascade) = self.cascades.get_mut(&root) {
                    for relation in relations {
                        if self.lagging.contains(&relation) {
                            cascade.behind.insert(relation);
                        }
                    }
                }
                self.finish_record(&key);
            }
            Err(failure) => {
                let attempt = failure.attempt;
                let message = failure.message.clone();
                let kind = failure.kind;
                let root = slot.record.root;
                let retry = slot.record.fail(failure);
                let stopping = self.shutdown.is_some()
                    || self.cascades.get(&root).is_some_and(|c| c.cancelled);
                if retry && stopping {
                    tracing::debug!(
                        trigger = %key.trigger,
                        entry = %key.entry,
                        attempt,
                        error = %message,
                        "execution failed after cancellation; not retrying"
                    );
                    slot.record.cancel();
                    let record = slot.record.clone();
                    self.log_records(&[record]);
                    self.finish_record(&key);
                } else if retry {
                    let delay = self.config.retry_backoff.delay(attempt);
                    tracing::warn!(
                        trigger = %key.trigger,
                        entry = %key.entry,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "execution failed; retrying"
                    );
                    self.retry_seq += 1;
                    self.retries
                        .insert((Instant::now() + delay, self.retry_seq), key);
                } else {
                    tracing::error!(
                        trigger = %key.trigger,
                        entry = %key.entry,
                        attempt,
                        kind = ?kind,
                        error = %message,
                        "execution failed permanently"
                    );
                    let record = slot.record.clone();
                    self.log_records(std::slice::from_ref(&record));
                    self.failed.push_back(record);
                    while self.failed.len() > self.config.archive_capacity.max(1) {
                        self.failed.pop_front();
                    }
                    self.finish_record(&key);
                }
            }
        }
    }

    /// Appends terminal records the executor did not commit itself.
    fn log_records(&self, records: &[ExecutionRecord]) {
        if records.is_empty() {
            return;
        }
        let appends = match records.iter().map(log_append).collect::<Result<Vec<_>, _>>() {
            Ok(appends) => appends,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode execution log rows");
                return;
            }
        };
        let batch = WriteBatch {
            appends,
            state: None,
        };
        if let Err(e) = self.store.commit(batch) {
            tracing::warn!(records = records.len(), error = %e, "could not write execution log");
        }
    }

    /// Releases the lane of a terminal record and closes it in its cascade.
    fn finish_record(&mut self, key: &ExecutionKey) {
        let Some(slot) = self.slots.get(key) else {
            return;
        };
        let root = slot.record.root;
        if slot.stateful {
            let partition = slot.record.partition.clone();
            if let Some(next) = self.lanes.remove(&partition, key) {
                self.ready.push_back(next);
            }
        }
        if let Some(cascade) = self.cascades.get_mut(&root) {
            cascade.open = cascade.open.saturating_sub(1);
        }
    }

    fn promote_due_retries(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.retries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            if let Some(slot) = self.slots.get_mut(&key) {
                if slot.record.retry() {
                    self.ready.push_back(key);
                }
            }
        }
    }

    fn resolve_ready_cascades(&mut self) {
        let done: Vec<EntryId> = self
            .cascades
            .iter()
            .filter(|(_, c)| c.open == 0 && !c.behind.iter().any(|r| self.lagging.contains(r)))
            .map(|(root, _)| *root)
            .collect();
        for root in done {
            self.resolve(root);
        }
    }

    fn resolve(&mut self, root: EntryId) {
        let Some(cascade) = self.cascades.remove(&root) else {
            return;
        };
        let records = cascade
            .members
            .iter()
            .filter_map(|k| self.slots.remove(k))
            .map(|s| s.record)
            .collect();
        let report = CascadeReport::from_records(root, cascade.cancelled, records);
        tracing::debug!(
            root = %root,
            state = ?report.state,
            executions = report.executions.len(),
            "cascade resolved"
        );
        for waiter in cascade.waiters {
            let _ = waiter.send(report.clone());
        }
        self.archive.push_back(root);
        self.archived.insert(root, report);
        while self.archive.len() > self.config.archive_capacity.max(1) {
            if let Some(old) = self.archive.pop_front() {
                self.archived.remove(&old);
            }
        }
    }

    fn report(&self, root: EntryId) -> CascadeReport {
        if let Some(cascade) = self.cascades.get(&root) {
            let records = cascade
                .members
                .iter()
                .filter_map(|k| self.slots.get(k))
                .map(|s| s.record.clone())
                .collect();
            return CascadeReport::from_records(root, cascade.cancelled, records);
        }
        if let Some(report) = self.archived.get(&root) {
            return report.clone();
        }
        CascadeReport::from_records(root, false, Vec::new())
    }

    fn ensure_admitted(&mut self, at: Option<&(String, Sequence)>) {
        if let Some((relation, sequence)) = at {
            self.on_append(relation, *sequence);
        }
    }

    fn cancel(&mut self, root: EntryId) -> bool {
        let Some(cascade) = self.cascades.get_mut(&root) else {
            return false;
        };
        cascade.cancelled = true;
        let members = cascade.members.clone();
        let mut cancelled = Vec::new();
        for key in &members {
            let Some(slot) = self.slots.get_mut(key) else {
                continue;
            };
            if slot.record.cancel() {
                cancelled.push(slot.record.clone());
                self.finish_record(key);
            }
        }
        self.log_records(&cancelled);
        tracing::info!(root = %root, cancelled = cancelled.len(), "cascade cancelled");
        true
    }

    fn on_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::CascadeStatus { root, at, reply } => {
                self.ensure_admitted(at.as_ref());
                let _ = reply.send(self.report(root));
            }
            ControlMsg::WaitCascade { root, at, reply } => {
                self.ensure_admitted(at.as_ref());
                match self.cascades.get_mut(&root) {
                    Some(cascade) => cascade.waiters.push(reply),
                    None => {
                        let _ = reply.send(self.report(root));
                    }
                }
            }
            ControlMsg::Execution { key, reply } => {
                let record = self.slots.get(&key).map(|s| s.record.clone()).or_else(|| {
                    self.archived
                        .values()
                        .flat_map(|r| r.executions.iter())
                        .find(|r| r.key == key)
                        .cloned()
                });
                let _ = reply.send(record);
            }
            ControlMsg::FailedExecutions { reply } => {
                let _ = reply.send(self.failed.iter().cloned().collect());
            }
            ControlMsg::CancelCascade { root, reply } => {
                let _ = reply.send(self.cancel(root));
            }
            ControlMsg::WaitIdle { reply } => self.idle_waiters.push(reply),
            ControlMsg::Shutdown { reply } => self.begin_shutdown(Some(reply)),
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight == 0
            && self.ready.is_empty()
            && self.retries.is_empty()
            && self.cascades.is_empty()
            && self.lagging.is_empty()
            && self.watermarks.iter().all(|(relation, &wm)| {
                self.store
                    .last_sequence(relation)
                    .is_ok_and(|last| last <= wm)
            })
    }

    fn answer_idle_waiters(&mut self) {
        if self.idle_waiters.is_empty() || !self.is_idle() {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Cancels everything not running; running executions get `shutdown_timeout`.
    fn begin_shutdown(&mut self, reply: Option<Sender<()>>) {
        if self.shutdown.is_some() {
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
            return;
        }
        let roots: Vec<EntryId> = self.cascades.keys().copied().collect();
        for root in roots {
            self.cancel(root);
        }
        self.ready.clear();
        self.retries.clear();
        let (tx, _) = crossbeam_channel::bounded(1);
        let reply = reply.unwrap_or(tx);
        self.shutdown = Some((Instant::now() + self.config.shutdown_timeout, reply));
        tracing::info!(in_flight = self.in_flight, "dispatcher shutting down");
    }

    fn shutdown_complete(&self) -> bool {
        match &self.shutdown {
            Some((deadline, _)) => self.in_flight == 0 || Instant::now() >= *deadline,
            None => false,
        }
    }

    fn finish(mut self) {
        let detach = self.in_flight > 0;
        if detach {
            tracing::warn!(in_flight = self.in_flight, "shutdown timeout elapsed; detaching running executions");
        }
        self.resolve_ready_cascades();
        for (root, cascade) in std::mem::take(&mut self.cascades) {
            let records: Vec<ExecutionRecord> = cascade
                .members
                .iter()
                .filter_map(|k| self.slots.get(k))
                .map(|s| s.record.clone())
                .collect();
            let report = CascadeReport::from_records(root, cascade.cancelled, records);
            for waiter in cascade.waiters {
                let _ = waiter.send(report.clone());
            }
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
        if detach {
            self.pool.close();
        } else {
            self.pool.join();
        }
        self.lanes.clear();
        if let Some((_, reply)) = self.shutdown.take() {
            let _ = reply.send(());
        }
        tracing::info!("dispatcher stopped");
    }
}
