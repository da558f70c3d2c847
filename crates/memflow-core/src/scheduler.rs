//! The Scheduler: `sleepFor`/`waitFor` timer primitives, 5-field cron, and
//! signal-before-wait storage.
//!
//! Grounded on `dispatch.rs`'s `ExecutionMode::Scheduled` handling (deferred
//! dispatch keyed by a due time), generalized to the cron/duration parsing
//! rules in the external interface.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::MemFlowError;
use crate::util::CronSchedule;

/// A durable timer: fires by publishing a resume message to the owning
/// job's engine stream once `due_at` passes.
#[derive(Debug, Clone)]
pub struct Timer {
    pub job_id: String,
    pub due_at: DateTime<Utc>,
    pub label: String,
}

/// A signal recorded before its corresponding `waitFor` call observed it —
/// "signal-before-wait" storage, so a signal delivered early is not lost.
#[derive(Debug, Clone)]
pub struct StoredSignal {
    pub job_id: String,
    pub signal_name: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

pub struct Scheduler {
    timers: Mutex<Vec<Timer>>,
    signals: Mutex<HashMap<(String, String), StoredSignal>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            timers: Mutex::new(Vec::new()),
            signals: Mutex::new(HashMap::new()),
        }
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a timer to fire after `duration` from now. The external
    /// interface floors the default poll granularity at 5 seconds; this
    /// only records the due time, it does not itself sleep.
    pub fn sleep_for(&self, job_id: &str, label: &str, duration: Duration) -> DateTime<Utc> {
        let due_at = Utc::now()
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        self.timers.lock().expect("scheduler mutex poisoned").push(Timer {
            job_id: job_id.to_string(),
            due_at,
            label: label.to_string(),
        });
        due_at
    }

    /// Schedule a timer from a 5-field cron expression, evaluated against
    /// `now`.
    pub fn sleep_for_cron(
        &self,
        job_id: &str,
        label: &str,
        cron_expr: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, MemFlowError> {
        let schedule = CronSchedule::parse(cron_expr)?;
        let delay = schedule.next_delay(now)?;
        Ok(self.sleep_for(job_id, label, delay))
    }

    /// Timers whose due time has passed, removing them from the pending
    /// set. Called by the Router on each tick.
    pub fn due_timers(&self, now: DateTime<Utc>) -> Vec<Timer> {
        let mut timers = self.timers.lock().expect("scheduler mutex poisoned");
        let (due, pending): (Vec<_>, Vec<_>) = timers.drain(..).partition(|t| t.due_at <= now);
        *timers = pending;
        due
    }

    /// Record a signal, to be observed by a matching `waitFor` whether it
    /// arrives before or after the signal itself.
    pub fn record_signal(&self, job_id: &str, signal_name: &str, payload: Value) {
        let key = (job_id.to_string(), signal_name.to_string());
        self.signals
            .lock()
            .expect("scheduler mutex poisoned")
            .insert(key, StoredSignal {
                job_id: job_id.to_string(),
                signal_name: signal_name.to_string(),
                payload,
                received_at: Utc::now(),
            });
    }

    /// Consume a previously-recorded signal, if any. A `waitFor` call that
    /// finds nothing here should suspend and rely on a later
    /// `record_signal` call to wake it.
    pub fn take_signal(&self, job_id: &str, signal_name: &str) -> Option<StoredSignal> {
        let key = (job_id.to_string(), signal_name.to_string());
        self.signals.lock().expect("scheduler mutex poisoned").remove(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_timers_are_partitioned_by_due_time() {
        let scheduler = Scheduler::new();
        scheduler.sleep_for("job-1", "t1", Duration::from_secs(0));
        scheduler.sleep_for("job-1", "t2", Duration::from_secs(3600));

        let due = scheduler.due_timers(Utc::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].label, "t1");

        let due_again = scheduler.due_timers(Utc::now());
        assert!(due_again.is_empty());
    }

    #[test]
    fn signal_before_wait_is_retained_until_consumed() {
        let scheduler = Scheduler::new();
        scheduler.record_signal("job-1", "approve", Value::from(true));
        let signal = scheduler.take_signal("job-1", "approve");
        assert!(signal.is_some());
        assert!(scheduler.take_signal("job-1", "approve").is_none());
    }
}
