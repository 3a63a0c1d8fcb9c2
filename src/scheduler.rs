//! Cron-driven recurring harvests.
//!
//! The [`Scheduler`] keeps one timer task per source id. Each tick spawns a
//! harvest run through the shared [`HarvestController`]; a tick that finds
//! the previous run still in flight is skipped and logged, never queued.
//!
//! Schedules are standard 5-field cron expressions (`min hour dom month
//! dow`), evaluated in UTC. 6- and 7-field expressions with a leading
//! seconds field are accepted as well.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::harvest::{HarvestController, HarvestError};
use crate::store::{HarvestSource, HarvestStore, SourceStatus, StoreError};

/// Interval at which [`Scheduler::shutdown`] polls for in-flight runs.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Errors from scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The source's recurrence expression does not parse.
    #[error("invalid schedule '{expression}' for source {source_id}: {message}\n  Suggestion: Use a 5-field cron expression such as \"0 3 * * *\"")]
    InvalidSchedule {
        /// Source id
        source_id: i64,
        /// The rejected expression
        expression: String,
        /// Parser message
        message: String,
    },

    /// Loading sources failed.
    #[error("failed to load sources for scheduling: {0}")]
    Store(#[from] StoreError),
}

/// Parses a cron expression, adding a zero seconds field to 5-field input.
///
/// # Errors
///
/// Returns the cron parser error for malformed expressions.
pub fn parse_schedule(expression: &str) -> Result<Schedule, cron::error::Error> {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        Schedule::from_str(&format!("0 {trimmed}"))
    } else {
        Schedule::from_str(trimmed)
    }
}

/// Next fire time of `expression` strictly after `after`.
#[must_use]
pub fn next_fire(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse_schedule(expression).ok()?.after(&after).next()
}

/// What a timer tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fire {
    Started,
    Skipped,
}

/// Owns per-source recurring harvest timers.
pub struct Scheduler {
    controller: Arc<HarvestController>,
    store: Arc<dyn HarvestStore>,
    timers: DashMap<i64, JoinHandle<()>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler with no timers.
    #[must_use]
    pub fn new(controller: Arc<HarvestController>, store: Arc<dyn HarvestStore>) -> Self {
        Self {
            controller,
            store,
            timers: DashMap::new(),
        }
    }

    /// Schedules every non-paused source; returns how many timers are active.
    ///
    /// Sources with an invalid expression are logged and left unscheduled.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if sources cannot be listed.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<usize, SchedulerError> {
        for source in self.store.list_active_sources().await? {
            if let Err(error) = self.schedule_source(&source) {
                warn!(source_id = source.id, error = %error, "source not scheduled");
            }
        }
        let count = self.timers.len();
        info!(count, "scheduler started");
        Ok(count)
    }

    /// Installs (or replaces) the timer for `source`.
    ///
    /// A paused source has its timer removed instead.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidSchedule`] for a malformed expression;
    /// any previous timer for the source is left untouched in that case.
    #[instrument(skip(self, source), fields(source_id = source.id, schedule = %source.schedule))]
    pub fn schedule_source(&self, source: &HarvestSource) -> Result<(), SchedulerError> {
        if source.status == SourceStatus::Paused {
            self.unschedule_source(source.id);
            return Ok(());
        }

        let schedule =
            parse_schedule(&source.schedule).map_err(|e| SchedulerError::InvalidSchedule {
                source_id: source.id,
                expression: source.schedule.clone(),
                message: e.to_string(),
            })?;

        let handle = tokio::spawn(timer_loop(
            Arc::clone(&self.controller),
            source.id,
            schedule,
        ));
        if let Some(previous) = self.timers.insert(source.id, handle) {
            previous.abort();
            debug!("replaced existing timer");
        }
        Ok(())
    }

    /// Cancels the timer for `source_id`; returns false if none existed.
    ///
    /// An in-flight run is not interrupted.
    pub fn unschedule_source(&self, source_id: i64) -> bool {
        match self.timers.remove(&source_id) {
            Some((_, handle)) => {
                handle.abort();
                debug!(source_id, "timer removed");
                true
            }
            None => false,
        }
    }

    /// Returns true if `source_id` has an active timer.
    #[must_use]
    pub fn is_scheduled(&self, source_id: i64) -> bool {
        self.timers.contains_key(&source_id)
    }

    /// Ids of all scheduled sources, ascending.
    #[must_use]
    pub fn scheduled_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.timers.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Stops all timers, signals in-flight runs to stop after their current
    /// page, and waits up to `grace` for them to finalize.
    ///
    /// Returns the number of runs still in flight when `grace` expired.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let ids = self.scheduled_ids();
        for id in ids {
            self.unschedule_source(id);
        }
        self.controller.request_shutdown();

        let deadline = tokio::time::Instant::now() + grace;
        while self.controller.active_runs() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let remaining = self.controller.active_runs();
        if remaining > 0 {
            warn!(remaining, "runs still in flight at shutdown deadline");
        } else {
            info!("scheduler stopped");
        }
        remaining
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
    }
}

async fn timer_loop(controller: Arc<HarvestController>, source_id: i64, schedule: Schedule) {
    let mut cursor = Utc::now();
    loop {
        let Some(next) = schedule.after(&cursor).next() else {
            warn!(source_id, "schedule has no future fire times");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(source_id, next = %next, "waiting for next fire");
        tokio::time::sleep(wait).await;
        fire(&controller, source_id);
        cursor = next;
    }
}

fn fire(controller: &Arc<HarvestController>, source_id: i64) -> Fire {
    if controller.is_running(source_id) {
        warn!(source_id, "previous harvest still running; skipping scheduled fire");
        return Fire::Skipped;
    }

    info!(source_id, "scheduled harvest firing");
    let controller = Arc::clone(controller);
    tokio::spawn(async move {
        match controller.run(source_id).await {
            Ok(outcome) => debug!(source_id, status = %outcome.status, "scheduled harvest finished"),
            Err(HarvestError::AlreadyRunning { .. }) => {
                warn!(source_id, "previous harvest still running; skipping scheduled fire");
            }
            Err(error) => error!(source_id, error = %error, "scheduled harvest could not run"),
        }
    });
    Fire::Started
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::db::Database;
    use crate::harvest::HarvestSettings;
    use crate::oai::{ListPage, ListRequest, OaiProtocol, ProtocolError};
    use crate::store::{NewHarvestSource, SourceStatePatch, Store};

    /// Counts calls; blocks each call until released when `gate` is set.
    #[derive(Default)]
    struct CountingProtocol {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl OaiProtocol for CountingProtocol {
        async fn list_page(
            &self,
            _endpoint: &str,
            _request: &ListRequest,
        ) -> Result<ListPage, ProtocolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Err(ProtocolError::NoRecordsMatch)
        }
    }

    async fn setup(
        protocol: Arc<CountingProtocol>,
        schedule: &str,
    ) -> (Arc<Store>, Arc<HarvestController>, HarvestSource) {
        let store = Arc::new(Store::new(Database::new_in_memory().await.unwrap()));
        let id = store
            .create_source(&NewHarvestSource {
                name: "Repo".to_string(),
                endpoint_url: "https://example.org/oai".to_string(),
                metadata_prefix: "oai_dc".to_string(),
                schedule: schedule.to_string(),
                ..NewHarvestSource::default()
            })
            .await
            .unwrap();
        let controller = Arc::new(HarvestController::new(
            Arc::clone(&store) as Arc<dyn HarvestStore>,
            protocol,
            HarvestSettings::default(),
        ));
        let source = store.get_source(id).await.unwrap().unwrap();
        (store, controller, source)
    }

    #[test]
    fn test_parse_schedule_accepts_five_and_six_fields() {
        assert!(parse_schedule("0 3 * * *").is_ok());
        assert!(parse_schedule("*/30 * * * * *").is_ok());
        assert!(parse_schedule("not a cron").is_err());
    }

    #[test]
    fn test_next_fire_daily() {
        let after = DateTime::parse_from_rfc3339("2026-01-01T04:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = next_fire("0 3 * * *", after).unwrap();
        assert_eq!(next.to_rfc3339(), "2026-01-02T03:00:00+00:00");
    }

    #[tokio::test]
    async fn test_schedule_replace_and_unschedule() {
        let (store, controller, source) =
            setup(Arc::new(CountingProtocol::default()), "0 3 * * *").await;
        let scheduler = Scheduler::new(controller, store);

        scheduler.schedule_source(&source).unwrap();
        scheduler.schedule_source(&source).unwrap();
        assert_eq!(scheduler.scheduled_ids(), vec![source.id]);

        assert!(scheduler.unschedule_source(source.id));
        assert!(!scheduler.unschedule_source(source.id));
        assert!(!scheduler.is_scheduled(source.id));
    }

    #[tokio::test]
    async fn test_invalid_schedule_rejected_and_previous_timer_kept() {
        let (store, controller, mut source) =
            setup(Arc::new(CountingProtocol::default()), "0 3 * * *").await;
        let scheduler = Scheduler::new(controller, store);
        scheduler.schedule_source(&source).unwrap();

        source.schedule = "every tuesday".to_string();
        let err = scheduler.schedule_source(&source).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
        assert!(scheduler.is_scheduled(source.id));
    }

    #[tokio::test]
    async fn test_start_skips_paused_sources() {
        let (store, controller, source) =
            setup(Arc::new(CountingProtocol::default()), "0 3 * * *").await;
        store
            .update_source_state(source.id, &SourceStatePatch::status(SourceStatus::Paused))
            .await
            .unwrap();
        let scheduler = Scheduler::new(controller, Arc::clone(&store) as Arc<dyn HarvestStore>);

        assert_eq!(scheduler.start().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fire_skips_while_run_in_flight() {
        let gate = Arc::new(Notify::new());
        let protocol = Arc::new(CountingProtocol {
            gate: Some(Arc::clone(&gate)),
            ..CountingProtocol::default()
        });
        let (_store, controller, source) = setup(Arc::clone(&protocol), "0 3 * * *").await;

        assert_eq!(fire(&controller, source.id), Fire::Started);
        while protocol.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fire(&controller, source.id), Fire::Skipped);

        gate.notify_one();
        while controller.is_running(source.id) {
            tokio::task::yield_now().await;
        }
        assert_eq!(protocol.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timer_fires_harvest() {
        let protocol = Arc::new(CountingProtocol::default());
        let (store, controller, source) = setup(Arc::clone(&protocol), "* * * * * *").await;
        let scheduler = Scheduler::new(controller, store);
        scheduler.schedule_source(&source).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while protocol.calls.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(protocol.calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(scheduler.shutdown(Duration::from_secs(2)).await, 0);
        assert!(scheduler.scheduled_ids().is_empty());
    }
}
