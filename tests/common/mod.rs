//! Shared fixtures for integration tests: a scripted workflow engine and
//! spec/store helpers.

// each test binary uses its own subset of these helpers
#![allow(dead_code)]

use async_trait::async_trait;
use cairn::conductor::{WorkflowEngine, WorkflowInstance, WorkflowStatus};
use cairn::engine::Engine;
use cairn::error::{CairnError, Result};
use cairn::model::BackupSpec;
use cairn::scheduling::Scheduler;
use cairn::store::BackupStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct MockState {
    counter: u32,
    workflows: HashMap<String, WorkflowInstance>,
    create_calls: Vec<String>,
    delete_calls: Vec<(String, String)>,
    fail_lookups: HashSet<String>,
}

/// A scripted in-memory workflow engine.
///
/// `start_*` calls hand out sequential workflow ids and record the call;
/// tests then drive each workflow's lifecycle explicitly.
#[derive(Default)]
pub struct MockWorkflowEngine {
    state: Mutex<MockState>,
}

impl MockWorkflowEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_calls(&self) -> Vec<String> {
        self.state.lock().create_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<(String, String)> {
        self.state.lock().delete_calls.clone()
    }

    /// Drive a create workflow to COMPLETED with the given output.
    pub fn complete_create(
        &self,
        workflow_id: &str,
        data_id: &str,
        size_mb: f64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) {
        let mut state = self.state.lock();
        if let Some(wf) = state.workflows.get_mut(workflow_id) {
            wf.status = WorkflowStatus::Completed;
            wf.data_id = Some(data_id.to_string());
            wf.data_size_mb = Some(size_mb);
            wf.start_time = Some(start_time);
            wf.end_time = Some(end_time);
        }
    }

    /// Move a workflow to an arbitrary status.
    pub fn finish(&self, workflow_id: &str, status: WorkflowStatus) {
        let mut state = self.state.lock();
        if let Some(wf) = state.workflows.get_mut(workflow_id) {
            if status == WorkflowStatus::Completed {
                let now = Utc::now();
                wf.start_time.get_or_insert(now);
                wf.end_time.get_or_insert(now);
            }
            wf.status = status;
        }
    }

    /// Make the engine forget a workflow entirely (lookups yield NOT_FOUND).
    pub fn forget(&self, workflow_id: &str) {
        self.state.lock().workflows.remove(workflow_id);
    }

    /// Make lookups of a workflow fail with a transport error.
    pub fn fail_lookup(&self, workflow_id: &str) {
        self.state
            .lock()
            .fail_lookups
            .insert(workflow_id.to_string());
    }

    fn launch(&self, prefix: &str) -> String {
        let mut state = self.state.lock();
        state.counter += 1;
        let id = format!("{}-{}", prefix, state.counter);
        state.workflows.insert(
            id.clone(),
            WorkflowInstance {
                id: id.clone(),
                status: WorkflowStatus::Running,
                data_id: None,
                data_size_mb: None,
                start_time: Some(Utc::now()),
                end_time: None,
            },
        );
        id
    }
}

#[async_trait]
impl WorkflowEngine for MockWorkflowEngine {
    async fn start_create(&self, backup_name: &str) -> Result<String> {
        let id = self.launch("create");
        self.state.lock().create_calls.push(backup_name.to_string());
        Ok(id)
    }

    async fn start_delete(
        &self,
        backup_name: &str,
        data_id: &str,
        _timeout_seconds: u64,
        _worker_config: Option<&str>,
    ) -> Result<String> {
        let id = self.launch("delete");
        self.state
            .lock()
            .delete_calls
            .push((backup_name.to_string(), data_id.to_string()));
        Ok(id)
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowInstance> {
        let state = self.state.lock();
        if state.fail_lookups.contains(workflow_id) {
            return Err(CairnError::Workflow(format!(
                "engine unreachable looking up {}",
                workflow_id
            )));
        }
        Ok(state
            .workflows
            .get(workflow_id)
            .cloned()
            .unwrap_or_else(|| WorkflowInstance {
                id: workflow_id.to_string(),
                status: WorkflowStatus::NotFound,
                data_id: None,
                data_size_mb: None,
                start_time: None,
                end_time: None,
            }))
    }
}

/// Engine + store + mock workflow engine over an in-memory database.
pub fn test_engine() -> (Arc<Engine>, Arc<BackupStore>, Arc<MockWorkflowEngine>) {
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let workflows = MockWorkflowEngine::new();
    let engine = Arc::new(Engine::new(
        Arc::clone(&store),
        Arc::clone(&workflows) as Arc<dyn WorkflowEngine>,
    ));
    (engine, store, workflows)
}

/// Engine wired to a tempdir-backed database plus a scheduler, for tests
/// that exercise real timers or the HTTP API.
pub fn test_stack(
    data_dir: &std::path::Path,
) -> (
    Arc<Engine>,
    Arc<BackupStore>,
    Arc<MockWorkflowEngine>,
    Arc<Scheduler>,
) {
    let store = Arc::new(BackupStore::open(data_dir.join("cairn.db")).unwrap());
    let workflows = MockWorkflowEngine::new();
    let engine = Arc::new(Engine::new(
        Arc::clone(&store),
        Arc::clone(&workflows) as Arc<dyn WorkflowEngine>,
    ));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&engine)));
    (engine, store, workflows, scheduler)
}

/// A spec with every retention level disabled except daily.
pub fn spec_daily(name: &str, daily: &str) -> BackupSpec {
    BackupSpec {
        name: name.to_string(),
        enabled: true,
        running_create_workflow: None,
        from_date: None,
        to_date: None,
        backup_cron_string: "@every 1m".to_string(),
        retention_minutely: "0@L".to_string(),
        retention_hourly: "0@L".to_string(),
        retention_daily: daily.to_string(),
        retention_weekly: "0@L".to_string(),
        retention_monthly: "0@L".to_string(),
        retention_yearly: "0@L".to_string(),
        timeout_seconds: 7200,
        worker_config: None,
        last_update: Utc::now(),
    }
}
