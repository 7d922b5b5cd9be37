//! Adapter to the external workflow engine that performs the actual backup
//! create/delete work.
//!
//! The interface is deliberately narrow: start a create workflow, start a
//! delete workflow, fetch a workflow's status. No retry policy lives here;
//! the coordinator decides when to relaunch.

use crate::config::ConductorConfig;
use crate::error::{CairnError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Workflow definition names on the engine side.
const CREATE_WORKFLOW: &str = "create_backup";
const REMOVE_WORKFLOW: &str = "remove_backup";

/// Status of a workflow instance as reported by the engine.
///
/// Anything that is neither `RUNNING` nor `NOT_FOUND` is terminal; terminal
/// statuses other than `COMPLETED` are treated as failures by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Terminated,
    TimedOut,
    NotFound,
    Other(String),
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running | WorkflowStatus::NotFound)
    }

    pub fn as_str(&self) -> &str {
        match self {
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Terminated => "TERMINATED",
            WorkflowStatus::TimedOut => "TIMED_OUT",
            WorkflowStatus::NotFound => "NOT_FOUND",
            WorkflowStatus::Other(s) => s,
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "RUNNING" => WorkflowStatus::Running,
            "COMPLETED" => WorkflowStatus::Completed,
            "FAILED" => WorkflowStatus::Failed,
            "TERMINATED" => WorkflowStatus::Terminated,
            "TIMED_OUT" => WorkflowStatus::TimedOut,
            "NOT_FOUND" => WorkflowStatus::NotFound,
            other => WorkflowStatus::Other(other.to_string()),
        })
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workflow instance snapshot.
#[derive(Debug, Clone)]
pub struct WorkflowInstance {
    pub id: String,
    pub status: WorkflowStatus,
    /// Handle to the produced backup data, present on completed creates.
    pub data_id: Option<String>,
    /// Size of the produced backup in megabytes.
    pub data_size_mb: Option<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Narrow interface to the workflow engine.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Launch a create workflow for a backup; returns the workflow id.
    async fn start_create(&self, backup_name: &str) -> Result<String>;

    /// Launch a delete workflow for a materialized backup's data.
    async fn start_delete(
        &self,
        backup_name: &str,
        data_id: &str,
        timeout_seconds: u64,
        worker_config: Option<&str>,
    ) -> Result<String>;

    /// Fetch a workflow instance. An unknown id yields a `NOT_FOUND` status,
    /// not an error.
    async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowInstance>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartWorkflowRequest<'a> {
    name: &'a str,
    input: WorkflowInput<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowInput<'a> {
    backup_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker_config: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowResponse {
    #[serde(default)]
    workflow_id: Option<String>,
    status: String,
    #[serde(default)]
    output: Option<WorkflowOutput>,
    /// Epoch milliseconds; 0 when the engine has not stamped it yet.
    #[serde(default)]
    start_time: i64,
    #[serde(default)]
    end_time: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowOutput {
    #[serde(default)]
    data_id: Option<String>,
    #[serde(default)]
    size_mb: Option<f64>,
}

/// HTTP client for a Conductor-style workflow API.
pub struct ConductorClient {
    base_url: String,
    client: reqwest::Client,
}

impl ConductorClient {
    pub fn new(config: &ConductorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CairnError::Network(e.to_string()))?;
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn start_workflow(&self, request: &StartWorkflowRequest<'_>) -> Result<String> {
        let url = format!("{}/workflow", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;
        let response = response
            .error_for_status()
            .map_err(|e| CairnError::Workflow(format!("start {}: {}", request.name, e)))?;
        let id = response.text().await?;
        let id = id.trim().trim_matches('"').to_string();
        if id.is_empty() {
            return Err(CairnError::Workflow(format!(
                "engine returned empty workflow id for {}",
                request.name
            )));
        }
        debug!(workflow = request.name, workflow_id = %id, "workflow launched");
        Ok(id)
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    if millis <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

#[async_trait]
impl WorkflowEngine for ConductorClient {
    async fn start_create(&self, backup_name: &str) -> Result<String> {
        self.start_workflow(&StartWorkflowRequest {
            name: CREATE_WORKFLOW,
            input: WorkflowInput {
                backup_name,
                data_id: None,
                timeout_seconds: None,
                worker_config: None,
            },
        })
        .await
    }

    async fn start_delete(
        &self,
        backup_name: &str,
        data_id: &str,
        timeout_seconds: u64,
        worker_config: Option<&str>,
    ) -> Result<String> {
        self.start_workflow(&StartWorkflowRequest {
            name: REMOVE_WORKFLOW,
            input: WorkflowInput {
                backup_name,
                data_id: Some(data_id),
                timeout_seconds: Some(timeout_seconds),
                worker_config,
            },
        })
        .await
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowInstance> {
        let url = format!("{}/workflow/{}", self.base_url, workflow_id);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(WorkflowInstance {
                id: workflow_id.to_string(),
                status: WorkflowStatus::NotFound,
                data_id: None,
                data_size_mb: None,
                start_time: None,
                end_time: None,
            });
        }

        let response = response
            .error_for_status()
            .map_err(|e| CairnError::Workflow(format!("get workflow {}: {}", workflow_id, e)))?;
        let body: WorkflowResponse = response.json().await?;

        let status: WorkflowStatus = body.status.parse().unwrap_or(WorkflowStatus::NotFound);
        let (data_id, data_size_mb) = match body.output {
            Some(output) => (output.data_id, output.size_mb),
            None => (None, None),
        };
        Ok(WorkflowInstance {
            id: body.workflow_id.unwrap_or_else(|| workflow_id.to_string()),
            status,
            data_id,
            data_size_mb,
            start_time: millis_to_datetime(body.start_time),
            end_time: millis_to_datetime(body.end_time),
        })
    }
}
