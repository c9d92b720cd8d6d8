//! Pipeline lifecycle and configuration.
//!
//! A [`Pipeline`] binds a built [`Catalog`] to an [`EntryStore`]. Starting it
//! spawns the dispatcher, its worker pool and one clock thread per scheduled
//! trigger; stopping it cancels pending work and waits for running
//! executions. Applications talk to a running pipeline through
//! [`Connection`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::catalog::{Catalog, TICK_FIELD};
use crate::clock::{parse_schedule, Clock, TickSink};
use crate::connection::Connection;
use crate::cursor::{AppendNotifier, DEFAULT_BATCH_SIZE, DEFAULT_WAIT_TIMEOUT};
use crate::dispatcher::Dispatcher;
use crate::entry::{fields, AppendRequest, Entry};
use crate::error::{ExecutionError, TributaryError, TributaryResult, ValidationError};
use crate::executor::Executor;
use crate::storage::EntryStore;
use crate::trigger::tick_relation_name;
use crate::value::Value;

/// Exponential retry backoff for retryable failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    /// Delay before the second attempt.
    pub initial: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryBackoff {
    /// No delay between attempts.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    ///
    /// ```
    /// use std::time::Duration;
    /// use tributary::RetryBackoff;
    ///
    /// let b = RetryBackoff::default();
    /// assert_eq!(b.delay(1), Duration::from_millis(10));
    /// assert_eq!(b.delay(3), Duration::from_millis(40));
    /// assert_eq!(b.delay(30), Duration::from_secs(1));
    /// ```
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64);
        let factor = self.multiplier.powi(exponent as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ValidationError::InvalidConfig {
                reason: format!("retry multiplier must be >= 1.0, got {}", self.multiplier),
            });
        }
        if self.initial > self.max {
            return Err(ValidationError::InvalidConfig {
                reason: "retry initial delay exceeds max delay".to_string(),
            });
        }
        Ok(())
    }
}

/// Where a starting pipeline begins watching each relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only entries written after start fire triggers.
    #[default]
    Latest,
    /// Every stored entry fires triggers again.
    Beginning,
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Executor threads; also the bound on concurrently running executions.
    pub workers: usize,
    /// Max queued append notifications before writers start coalescing.
    pub event_queue_capacity: usize,
    /// Max queued control requests.
    pub control_queue_capacity: usize,
    /// How long a writer waits for room in the event queue.
    pub enqueue_timeout: Duration,
    /// Default attempt limit; a trigger may override it.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub retry_backoff: RetryBackoff,
    /// Period of the dispatcher's catch-up pass.
    pub tick_interval: Duration,
    /// Resolved cascades kept for status queries.
    pub archive_capacity: usize,
    /// Default batch size of cursors opened by connections.
    pub cursor_batch_size: usize,
    /// Default wait of live cursors opened by connections.
    pub live_cursor_timeout: Duration,
    /// How long `stop` waits for running executions.
    pub shutdown_timeout: Duration,
    /// Where watching starts on `start`.
    pub start_position: StartPosition,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            event_queue_capacity: 4096,
            control_queue_capacity: 1024,
            enqueue_timeout: Duration::from_millis(100),
            max_attempts: 3,
            retry_backoff: RetryBackoff::default(),
            tick_interval: Duration::from_millis(50),
            archive_capacity: 1024,
            cursor_batch_size: DEFAULT_BATCH_SIZE,
            live_cursor_timeout: DEFAULT_WAIT_TIMEOUT,
            shutdown_timeout: Duration::from_secs(5),
            start_position: StartPosition::Latest,
        }
    }
}

impl PipelineConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` for zero-sized pools, queues or limits, a zero tick
    /// interval, or an invalid backoff.
    pub fn validate(self) -> TributaryResult<Self> {
        let positive = [
            ("workers", self.workers),
            ("event_queue_capacity", self.event_queue_capacity),
            ("control_queue_capacity", self.control_queue_capacity),
            ("archive_capacity", self.archive_capacity),
            ("cursor_batch_size", self.cursor_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("{name} must be greater than zero"),
                }
                .into());
            }
        }
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "max_attempts must be at least 1".to_string(),
            }
            .into());
        }
        if self.tick_interval.is_zero() {
            return Err(ValidationError::InvalidConfig {
                reason: "tick_interval must be non-zero".to_string(),
            }
            .into());
        }
        self.retry_backoff.validate()?;
        Ok(self)
    }
}

pub(crate) struct Runtime {
    pub dispatcher: Dispatcher,
}

/// State shared by a pipeline and its connections.
pub(crate) struct Shared {
    pub catalog: Arc<Catalog>,
    pub store: Arc<dyn EntryStore>,
    pub notifier: Arc<AppendNotifier>,
    pub config: PipelineConfig,
    runtime: RwLock<Option<Arc<Runtime>>>,
    stopping: AtomicBool,
}

impl Shared {
    /// The running runtime, or the reason there is none.
    pub fn running(&self) -> TributaryResult<Arc<Runtime>> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(ExecutionError::ShuttingDown.into());
        }
        self.runtime
            .read()
            .map_err(|_| TributaryError::internal("poisoned lock: pipeline runtime"))?
            .clone()
            .ok_or_else(|| ExecutionError::NotStarted.into())
    }

    /// Validates and commits one external write, then wakes cursors and
    /// the dispatcher.
    pub fn write(&self, request: AppendRequest) -> TributaryResult<Entry> {
        let relation = self.catalog.require_relation(&request.relation)?;
        relation.validate(&request.fields)?;
        let runtime = self.running()?;

        let latest_key = relation.key_for(&request.fields);
        let committed = self.store.append(request.latest_key(latest_key))?;
        let entry = committed.entry;
        if committed.deduplicated {
            tracing::debug!(relation = %entry.relation, entry = %entry.id, "duplicate write returned original entry");
        } else {
            if let Err(e) = self.notifier.notify(&entry.relation, entry.sequence) {
                tracing::warn!(relation = %entry.relation, error = %e, "cursor wake-up failed");
            }
            runtime.dispatcher.notify_append(&entry.relation, entry.sequence);
        }
        Ok(entry)
    }
}

impl TickSink for Shared {
    fn tick(&self, trigger: &str, fired_at: DateTime<Utc>) -> TributaryResult<Entry> {
        let request = AppendRequest::new(
            tick_relation_name(trigger),
            fields([(TICK_FIELD, Value::Timestamp(fired_at))]),
        );
        self.write(request)
    }
}

/// A deployable pipeline: catalog, store and the threads that run it.
///
/// ```
/// use std::time::Duration;
/// use tributary::{
///     fields, Catalog, FieldType, Pipeline, PipelineConfig, Relation, Schema, Trigger,
///     TriggerOutput, Value,
/// };
/// use tributary::storage::InMemoryEntryStore;
/// use std::sync::Arc;
///
/// let mut builder = Catalog::builder();
/// builder
///     .relation(Relation::new("raw", Schema::new().field("text", FieldType::String)))?
///     .relation(Relation::new("counts", Schema::new().field("n", FieldType::Int)))?
///     .trigger(
///         Trigger::on("word_count", "raw", |input: &tributary::TriggerInput<'_>| {
///             let text = input.entry.get("text").and_then(Value::as_string).unwrap_or("");
///             let n = text.split_whitespace().count() as i64;
///             Ok(TriggerOutput::none().emit("counts", fields([("n", n)])))
///         })
///         .writes_to("counts"),
///     )?;
/// let catalog = builder.build()?;
///
/// let pipeline = Pipeline::new(catalog, Arc::new(InMemoryEntryStore::new()), PipelineConfig::default())?;
/// pipeline.start()?;
/// let conn = pipeline.connect();
/// let raw = conn.write("raw", fields([("text", "a b c")]))?;
/// let report = conn.wait_for_cascade(raw.id, Duration::from_secs(5))?;
/// assert_eq!(report.outputs().count(), 1);
/// pipeline.stop()?;
/// # Ok::<(), tributary::TributaryError>(())
/// ```
pub struct Pipeline {
    shared: Arc<Shared>,
    clock: Mutex<Option<Clock>>,
}

impl Pipeline {
    /// Creates a stopped pipeline.
    ///
    /// # Errors
    /// `InvalidConfig` if the configuration does not validate.
    pub fn new(catalog: Arc<Catalog>, store: Arc<dyn EntryStore>, config: PipelineConfig) -> TributaryResult<Self> {
        let config = config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                catalog,
                store,
                notifier: Arc::new(AppendNotifier::new()),
                config,
                runtime: RwLock::new(None),
                stopping: AtomicBool::new(false),
            }),
            clock: Mutex::new(None),
        })
    }

    /// Definition the pipeline runs.
    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.shared.catalog
    }

    /// Backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.shared.store
    }

    /// Tuning the pipeline was created with.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Spawns the dispatcher, workers and clock threads.
    ///
    /// # Errors
    /// `AlreadyStarted` if the pipeline is running.
    pub fn start(&self) -> TributaryResult<()> {
        let shared = &self.shared;
        {
            let mut runtime = shared
                .runtime
                .write()
                .map_err(|_| TributaryError::internal("poisoned lock: pipeline runtime"))?;
            if runtime.is_some() {
                return Err(ExecutionError::AlreadyStarted.into());
            }
            let executor = Arc::new(Executor::new(
                Arc::clone(&shared.catalog),
                Arc::clone(&shared.store),
                Arc::clone(&shared.notifier),
            ));
            let dispatcher = Dispatcher::start(
                Arc::clone(&shared.catalog),
                Arc::clone(&shared.store),
                executor,
                &shared.config,
            )?;
            *runtime = Some(Arc::new(Runtime { dispatcher }));
        }

        let mut schedules = Vec::new();
        for trigger in shared.catalog.scheduled_triggers() {
            if let Some(expr) = trigger.schedule() {
                schedules.push((trigger.name().to_string(), parse_schedule(expr)?));
            }
        }
        let scheduled = schedules.len();
        if !schedules.is_empty() {
            let sink: Arc<dyn TickSink> = Arc::clone(shared) as Arc<dyn TickSink>;
            let clock = Clock::start(schedules, sink)?;
            *self
                .clock
                .lock()
                .map_err(|_| TributaryError::internal("poisoned lock: pipeline clock"))? = Some(clock);
        }

        tracing::info!(
            workers = shared.config.workers,
            triggers = shared.catalog.triggers().count(),
            scheduled,
            "pipeline started"
        );
        Ok(())
    }

    /// Stops the pipeline. Stopping a stopped pipeline is a no-op.
    ///
    /// Pending executions are cancelled; running ones get the configured
    /// shutdown timeout to finish.
    pub fn stop(&self) -> TributaryResult<()> {
        let clock = self
            .clock
            .lock()
            .map_err(|_| TributaryError::internal("poisoned lock: pipeline clock"))?
            .take();
        if let Some(mut clock) = clock {
            clock.stop();
        }

        self.shared.stopping.store(true, Ordering::Release);
        let runtime = self
            .shared
            .runtime
            .write()
            .map_err(|_| TributaryError::internal("poisoned lock: pipeline runtime"))
            .map(|mut r| r.take());
        let result = match runtime {
            Ok(Some(runtime)) => {
                let result = runtime.dispatcher.shutdown();
                tracing::info!("pipeline stopped");
                result
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        self.shared.stopping.store(false, Ordering::Release);
        result
    }

    /// True between `start` and `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running().is_ok()
    }

    /// Opens a connection. Connections outlive restarts of the pipeline.
    #[must_use]
    pub fn connect(&self) -> Connection {
        Connection::new(Arc::clone(&self.shared))
    }

    /// Fires a scheduled trigger now, as if its clock had ticked.
    ///
    /// # Errors
    /// `UnknownTrigger` if no trigger has that name; `InvalidConfig` if it is
    /// not a scheduled trigger.
    pub fn fire(&self, trigger: &str) -> TributaryResult<Entry> {
        let definition = self.shared.catalog.require_trigger(trigger)?;
        if definition.schedule().is_none() {
            return Err(ValidationError::InvalidConfig {
                reason: format!("trigger '{trigger}' is not scheduled"),
            }
            .into());
        }
        self.shared.tick(trigger, Utc::now())
    }

    /// Blocks until the dispatcher has nothing left to do.
    pub fn wait_idle(&self, timeout: Duration) -> TributaryResult<()> {
        self.shared.running()?.dispatcher.wait_idle(timeout)
    }

    /// Append notifications that were coalesced into periodic catch-up.
    #[must_use]
    pub fn coalesced_events(&self) -> u64 {
        self.shared
            .running()
            .map(|r| r.dispatcher.coalesced_events())
            .unwrap_or(0)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "pipeline stop on drop failed");
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("running", &self.is_running())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}
