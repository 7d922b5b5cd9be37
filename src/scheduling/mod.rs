//! Cron-driven schedule reconciliation.
//!
//! The scheduler owns a map from routine key (`"{name}|{cron}"`) to an
//! active timer task. `reconcile()` diffs that map against the enabled
//! backup specs: specs without a timer get one, timers whose key is gone
//! (spec deleted, disabled, or its cron string edited) are stopped. A cron
//! edit therefore tears the timer down and starts a fresh one.

pub mod cron;

pub use cron::{Schedule, ScheduleParseError};

use crate::coordinator::TriggerOutcome;
use crate::engine::Engine;
use crate::error::Result;
use crate::observability;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Fixed safety-net interval that drives state forward even when the backup
/// cron fires rarely (e.g. weekly specs).
const SAFETY_INTERVAL: Duration = Duration::from_secs(4 * 3600);

/// How often the scheduler re-diffs its timers against the spec set.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

fn routine_key(backup_name: &str, cron: &str) -> String {
    format!("{}|{}", backup_name, cron)
}

struct Routine {
    handle: JoinHandle<()>,
}

/// Reconciles active timers against the set of enabled backup specs.
pub struct Scheduler {
    engine: Arc<Engine>,
    routines: Mutex<HashMap<String, Routine>>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            routines: Mutex::new(HashMap::new()),
        }
    }

    /// Bring the timer map in sync with the enabled specs.
    pub async fn reconcile(&self) -> Result<()> {
        debug!("refreshing timers according to active schedules");
        let enabled = self.engine.store().list_specs(Some(true)).await?;

        let desired: HashSet<String> = enabled
            .iter()
            .map(|spec| routine_key(&spec.name, &spec.backup_cron_string))
            .collect();

        let mut routines = self.routines.lock();

        routines.retain(|key, routine| {
            if desired.contains(key) {
                return true;
            }
            info!(routine = %key, "stopping timer");
            routine.handle.abort();
            false
        });

        for spec in &enabled {
            let key = routine_key(&spec.name, &spec.backup_cron_string);
            if routines.contains_key(&key) {
                continue;
            }
            let schedule = match Schedule::parse(&spec.backup_cron_string) {
                Ok(schedule) => schedule,
                Err(e) => {
                    error!(backup = %spec.name, cron = %spec.backup_cron_string, error = %e,
                           "invalid cron expression, backup will not be scheduled");
                    continue;
                }
            };
            info!(backup = %spec.name, cron = %spec.backup_cron_string, "creating timer");
            let handle = tokio::spawn(run_routine(
                Arc::clone(&self.engine),
                spec.name.clone(),
                schedule,
            ));
            routines.insert(key, Routine { handle });
        }

        Ok(())
    }

    /// Keys of the currently active routines.
    pub fn routine_keys(&self) -> Vec<String> {
        self.routines.lock().keys().cloned().collect()
    }

    /// Periodically re-reconcile so external spec edits converge even
    /// without an API-triggered reconcile.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = self.reconcile().await {
                error!(error = %e, "scheduler reconcile failed");
            }
        }
    }

    /// Stop every routine.
    pub fn shutdown(&self) {
        let mut routines = self.routines.lock();
        for (key, routine) in routines.drain() {
            debug!(routine = %key, "stopping timer");
            routine.handle.abort();
        }
    }
}

/// One backup's timer loop.
///
/// The body runs to completion per fire; if a fire outlasts its interval the
/// overdue tick is skipped, never queued. The safety interval keeps the
/// create/delete state machines and retention moving between cron fires.
async fn run_routine(engine: Arc<Engine>, backup_name: String, schedule: Schedule) {
    let mut safety = tokio::time::interval(SAFETY_INTERVAL);
    safety.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first interval tick completes immediately
    safety.tick().await;

    loop {
        let now = Utc::now();
        let Some(next) = schedule.next_fire(now) else {
            error!(backup = %backup_name, cron = %schedule, "schedule has no next fire time, stopping timer");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                fire(&engine, &backup_name).await;
            }
            _ = safety.tick() => {
                debug!(backup = %backup_name, "safety timer fired");
                engine.check_create(&backup_name).await;
                engine.check_deletes(&backup_name).await;
                engine.run_retention_task(&backup_name).await;
            }
        }
    }
}

/// The body of one scheduled fire.
async fn fire(engine: &Engine, backup_name: &str) {
    debug!(backup = backup_name, "timer fired");

    engine.check_create(backup_name).await;
    engine.check_deletes(backup_name).await;

    let spec = match engine.store().get_spec(backup_name).await {
        Ok(spec) => spec,
        Err(e) => {
            error!(backup = backup_name, error = %e, "couldn't load backup spec");
            observability::record_backup_task(backup_name, "error");
            return;
        }
    };

    if !spec.enabled {
        warn!(backup = backup_name, "backup is disabled but its timer is still running");
        observability::record_backup_task(backup_name, "success");
        return;
    }

    if !spec.active_at(Utc::now()) {
        debug!(backup = backup_name, "backup is enabled but outside its activation window");
        observability::record_backup_task(backup_name, "success");
        return;
    }

    let mut outcome = "success";
    match engine.trigger_new_backup(backup_name).await {
        Ok(TriggerOutcome::Launched(workflow_id)) => {
            info!(backup = backup_name, workflow_id = %workflow_id, "backup launched");
            observability::record_backup_trigger(backup_name, "success");
        }
        Ok(TriggerOutcome::Skipped(reason)) => {
            debug!(backup = backup_name, reason = %reason, "backup trigger skipped");
        }
        Err(e) => {
            warn!(backup = backup_name, error = %e, "error launching backup workflow");
            observability::record_backup_trigger(backup_name, "error");
            observability::record_backup_warn(backup_name, "warning");
            outcome = "error";
        }
    }

    engine.run_retention_task(backup_name).await;
    observability::record_backup_task(backup_name, outcome);
}
