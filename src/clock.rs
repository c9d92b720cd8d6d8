//! Cron clock for scheduled triggers.
//!
//! Each scheduled trigger gets one thread that sleeps until the next fire
//! time and then writes a tick entry into the trigger's `__tick_` relation.
//! Ticks go through the ordinary write path, so a scheduled trigger runs
//! exactly like one fed by application writes.

use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::entry::Entry;
use crate::error::{TributaryError, TributaryResult, ValidationError};

/// Parses a six or seven field cron expression (seconds first).
pub(crate) fn parse_schedule(expression: &str) -> Result<Schedule, ValidationError> {
    Schedule::from_str(expression).map_err(|e| ValidationError::InvalidSchedule {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Destination of tick entries.
pub(crate) trait TickSink: Send + Sync {
    fn tick(&self, trigger: &str, fired_at: DateTime<Utc>) -> TributaryResult<Entry>;
}

/// Running clock threads. Dropping the clock stops them.
pub(crate) struct Clock {
    shutdown: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl Clock {
    pub fn start(schedules: Vec<(String, Schedule)>, sink: Arc<dyn TickSink>) -> TributaryResult<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let mut threads = Vec::with_capacity(schedules.len());
        for (trigger, schedule) in schedules {
            let shutdown = shutdown_rx.clone();
            let sink = Arc::clone(&sink);
            let handle = thread::Builder::new()
                .name(format!("tributary-clock-{trigger}"))
                .spawn(move || clock_loop(&trigger, &schedule, sink.as_ref(), &shutdown))
                .map_err(|e| TributaryError::internal(format!("failed to spawn clock: {e}")))?;
            threads.push(handle);
        }
        Ok(Self {
            shutdown: Some(shutdown_tx),
            threads,
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Stops every clock thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.shutdown = None;
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("clock thread panicked");
            }
        }
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.stop();
    }
}

fn clock_loop(trigger: &str, schedule: &Schedule, sink: &dyn TickSink, shutdown: &Receiver<()>) {
    loop {
        let now = Utc::now();
        let Some(next) = schedule.upcoming(Utc).next() else {
            tracing::warn!(trigger, "schedule has no upcoming fire times");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!(trigger, next_fire = %next, wait_ms = wait.as_millis() as u64, "waiting for next fire");

        select! {
            recv(shutdown) -> _ => return,
            default(wait) => match sink.tick(trigger, next) {
                Ok(entry) => tracing::info!(trigger, entry = %entry.id, fired_at = %next, "scheduled trigger fired"),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(trigger, fired_at = %next, error = %e, "tick write failed");
                }
                Err(e) => {
                    tracing::warn!(trigger, error = %e, "tick write rejected; stopping clock");
                    return;
                }
            },
        }
    }
}
