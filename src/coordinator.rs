//! Per-backup coordination of create and delete workflows.
//!
//! The coordinator never waits for a workflow to finish: every long-running
//! operation is broken into ticks driven by the scheduler. All per-backup
//! errors are logged and absorbed here so one failing backup cannot poison
//! the others.

use crate::conductor::WorkflowStatus;
use crate::engine::Engine;
use crate::error::{CairnError, Result};
use crate::model::MaterializedStatus;
use crate::observability;
use tracing::{debug, error, info, warn};

/// Maximum rows reconciled per delete sweep.
const DELETE_SWEEP_LIMIT: u32 = 20;

/// Outcome of a backup trigger attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A create workflow was launched.
    Launched(String),
    /// The trigger was refused because a create workflow is still running.
    /// This is not an error; the timer simply waits for the next tick.
    Skipped(String),
}

impl Engine {
    /// Launch a new create workflow for a backup, unless one is in flight.
    ///
    /// At most one create workflow per backup: if the recorded workflow is
    /// still `RUNNING` the trigger is skipped. A recorded workflow the
    /// engine no longer knows about is treated as never having existed.
    pub async fn trigger_new_backup(&self, backup_name: &str) -> Result<TriggerOutcome> {
        debug!(backup = backup_name, "checking for a running create workflow");
        let spec = self.store().get_spec(backup_name).await?;

        if let Some(workflow_id) = &spec.running_create_workflow {
            let wf = self.workflows().get_workflow(workflow_id).await?;
            match wf.status {
                WorkflowStatus::Running => {
                    observability::record_backup_warn(backup_name, "warning");
                    return Ok(TriggerOutcome::Skipped(format!(
                        "create workflow {} is still running",
                        workflow_id
                    )));
                }
                WorkflowStatus::NotFound => {
                    warn!(
                        backup = backup_name,
                        workflow_id = %workflow_id,
                        "recorded create workflow not found on the engine, launching a new one"
                    );
                }
                _ => {}
            }
        }

        let workflow_id = match self.workflows().start_create(backup_name).await {
            Ok(id) => id,
            Err(e) => {
                observability::record_backup_warn(backup_name, "error");
                return Err(e);
            }
        };
        info!(backup = backup_name, workflow_id = %workflow_id, "create workflow launched");

        self.store()
            .update_spec_running_create_workflow(backup_name, Some(&workflow_id))
            .await?;
        Ok(TriggerOutcome::Launched(workflow_id))
    }

    /// Observe the running create workflow, if any, and drive it to rest.
    ///
    /// On a `COMPLETED` terminal the retention lock is held from the moment
    /// the terminal is observed through tagging, so the new materialized
    /// backup can never be elected for deletion untagged.
    pub async fn check_create(&self, backup_name: &str) {
        debug!(backup = backup_name, "checking create workflow");
        let spec = match self.store().get_spec(backup_name).await {
            Ok(spec) => spec,
            Err(e) => {
                debug!(backup = backup_name, error = %e, "couldn't load backup spec");
                observability::record_backup_warn(backup_name, "error");
                return;
            }
        };
        let Some(workflow_id) = spec.running_create_workflow else {
            debug!(backup = backup_name, "no running create workflow");
            return;
        };

        let wf = match self.workflows().get_workflow(&workflow_id).await {
            Ok(wf) => wf,
            Err(e) => {
                debug!(backup = backup_name, workflow_id = %workflow_id, error = %e,
                       "couldn't fetch create workflow");
                observability::record_backup_warn(backup_name, "error");
                return;
            }
        };

        if wf.status == WorkflowStatus::Running {
            debug!(backup = backup_name, workflow_id = %workflow_id, "create workflow still running");
            return;
        }

        info!(
            backup = backup_name,
            workflow_id = %workflow_id,
            status = %wf.status,
            "create workflow finish detected"
        );

        // Hold the retention lock until the new backup is tagged, so it
        // cannot be elected for deletion while it still has no tags.
        let _guard = self.locks().acquire(backup_name).await;

        if let Err(e) = self
            .store()
            .update_spec_running_create_workflow(backup_name, None)
            .await
        {
            error!(backup = backup_name, error = %e, "couldn't clear running create workflow id");
            observability::record_backup_warn(backup_name, "error");
            return;
        }

        if wf.status == WorkflowStatus::NotFound {
            warn!(
                backup = backup_name,
                workflow_id = %workflow_id,
                "create workflow vanished from the engine, treating as never started"
            );
            observability::record_backup_warn(backup_name, "warning");
            return;
        }

        if wf.status != WorkflowStatus::Completed {
            warn!(
                backup = backup_name,
                workflow_id = %workflow_id,
                status = %wf.status,
                "create workflow finished without completing"
            );
            observability::record_backup_warn(backup_name, "warning");
            return;
        }

        let (data_id, size_mb) = match (&wf.data_id, wf.data_size_mb) {
            (Some(data_id), Some(size_mb)) if size_mb > 0.0 => (data_id.clone(), size_mb),
            _ => {
                warn!(
                    backup = backup_name,
                    workflow_id = %workflow_id,
                    "create workflow completed without dataId/sizeMb, ignoring backup"
                );
                observability::record_backup_warn(backup_name, "warning");
                return;
            }
        };
        let (Some(start_time), Some(end_time)) = (wf.start_time, wf.end_time) else {
            warn!(
                backup = backup_name,
                workflow_id = %workflow_id,
                "create workflow completed without timestamps, ignoring backup"
            );
            observability::record_backup_warn(backup_name, "warning");
            return;
        };

        if let Err(e) = self
            .store()
            .create_materialized(
                &workflow_id,
                backup_name,
                &data_id,
                MaterializedStatus::Completed,
                start_time,
                end_time,
                size_mb,
            )
            .await
        {
            error!(backup = backup_name, workflow_id = %workflow_id, error = %e,
                   "couldn't persist materialized backup");
            observability::record_backup_warn(backup_name, "error");
            return;
        }

        debug!(backup = backup_name, id = %workflow_id, "materialized backup persisted");
        observability::record_workflow(backup_name, "success");
        observability::set_last_backup_size(backup_name, size_mb);
        observability::set_last_backup_time(backup_name, (end_time - start_time).num_seconds() as f64);

        if let Err(e) = self.tag_all_backups(backup_name).await {
            error!(backup = backup_name, error = %e, "error tagging backups");
            observability::record_backup_warn(backup_name, "error");
        }
    }

    /// Reconcile in-flight delete workflows for a backup.
    ///
    /// Fetches up to [`DELETE_SWEEP_LIMIT`] materialized backups stuck in
    /// `deleting` and advances each one independently.
    pub async fn check_deletes(&self, backup_name: &str) {
        debug!(backup = backup_name, "checking delete workflows");
        let pending = match self
            .store()
            .list_materialized(
                backup_name,
                DELETE_SWEEP_LIMIT,
                None,
                Some(MaterializedStatus::Deleting),
                false,
            )
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(backup = backup_name, error = %e, "couldn't load pending deletes");
                observability::record_backup_warn(backup_name, "error");
                return;
            }
        };
        if pending.is_empty() {
            debug!(backup = backup_name, "no materialized backups pending delete");
            return;
        }

        for mb in pending {
            let Some(delete_workflow) = mb.running_delete_workflow.clone() else {
                error!(
                    backup = backup_name,
                    id = %mb.id,
                    "materialized backup is 'deleting' but has no delete workflow id"
                );
                observability::record_backup_warn(backup_name, "error");
                continue;
            };

            let wf = match self.workflows().get_workflow(&delete_workflow).await {
                Ok(wf) if wf.status != WorkflowStatus::NotFound => wf,
                lookup => {
                    if let Err(e) = lookup {
                        debug!(workflow_id = %delete_workflow, error = %e, "couldn't fetch delete workflow");
                    }
                    observability::record_backup_warn(backup_name, "error");
                    self.relaunch_delete(backup_name, &mb.id).await;
                    continue;
                }
            };

            if wf.status == WorkflowStatus::Running {
                debug!(workflow_id = %delete_workflow, "delete workflow still running");
                continue;
            }

            info!(
                backup = backup_name,
                workflow_id = %delete_workflow,
                status = %wf.status,
                "delete workflow finished"
            );

            if wf.status != WorkflowStatus::Completed {
                warn!(
                    backup = backup_name,
                    id = %mb.id,
                    workflow_id = %delete_workflow,
                    status = %wf.status,
                    "delete workflow finished without completing"
                );
                if let Err(e) = self
                    .store()
                    .set_materialized_status(&mb.id, MaterializedStatus::DeleteError, Some(&delete_workflow))
                    .await
                {
                    error!(id = %mb.id, error = %e, "couldn't set materialized backup status");
                    observability::record_backup_warn(backup_name, "error");
                }
                continue;
            }

            if let Err(e) = self
                .store()
                .set_materialized_status(&mb.id, MaterializedStatus::Deleted, None)
                .await
            {
                error!(id = %mb.id, error = %e, "couldn't set materialized backup status");
                observability::record_backup_warn(backup_name, "error");
                continue;
            }
            info!(
                backup = backup_name,
                id = %mb.id,
                data_id = ?mb.data_id,
                "backup data removed"
            );
            observability::record_retention_delete(backup_name, wf.status.as_str());
        }
    }

    /// Launch a replacement delete workflow for a materialized backup whose
    /// previous delete workflow is gone or unreachable, and persist the new
    /// workflow id so the next sweep tracks the replacement.
    async fn relaunch_delete(&self, backup_name: &str, materialized_id: &str) {
        warn!(
            backup = backup_name,
            id = %materialized_id,
            "delete workflow is missing or unreachable, relaunching"
        );
        let mb = match self.store().get_materialized(materialized_id).await {
            Ok(mb) => mb,
            Err(e) => {
                error!(id = %materialized_id, error = %e, "couldn't load materialized backup");
                return;
            }
        };
        let spec = match self.store().get_spec(backup_name).await {
            Ok(spec) => spec,
            Err(e) => {
                error!(backup = backup_name, error = %e, "couldn't load backup spec");
                return;
            }
        };
        let Some(data_id) = mb.data_id.as_deref() else {
            error!(id = %materialized_id, "materialized backup has no data id, cannot delete");
            return;
        };

        let workflow_id = match self
            .workflows()
            .start_delete(backup_name, data_id, spec.timeout_seconds, spec.worker_config.as_deref())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(data_id = %data_id, error = %e, "couldn't relaunch delete workflow");
                return;
            }
        };
        info!(data_id = %data_id, workflow_id = %workflow_id, "delete workflow relaunched");
        observability::record_retention_delete_retry();

        if let Err(e) = self
            .store()
            .set_materialized_status(materialized_id, MaterializedStatus::Deleting, Some(&workflow_id))
            .await
        {
            error!(id = %materialized_id, error = %e, "couldn't record relaunched delete workflow");
        }
    }

    /// Start deleting one materialized backup: launch its delete workflow
    /// and transition it to `deleting`.
    pub async fn trigger_backup_delete(&self, materialized_id: &str) -> Result<()> {
        debug!(id = %materialized_id, "triggering backup delete");
        let mb = self.store().get_materialized(materialized_id).await?;

        if mb.status != MaterializedStatus::Completed {
            return Err(CairnError::InvalidState(format!(
                "materialized backup {} cannot be deleted in status '{}'",
                mb.id, mb.status
            )));
        }
        if mb.running_delete_workflow.is_some() {
            return Err(CairnError::InvalidState(format!(
                "materialized backup {} already has a delete workflow in flight",
                mb.id
            )));
        }
        let Some(data_id) = mb.data_id.as_deref() else {
            return Err(CairnError::InvalidState(format!(
                "materialized backup {} has no data id",
                mb.id
            )));
        };

        let spec = self.store().get_spec(&mb.backup_name).await?;
        let workflow_id = match self
            .workflows()
            .start_delete(
                &mb.backup_name,
                data_id,
                spec.timeout_seconds,
                spec.worker_config.as_deref(),
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                observability::record_backup_warn(&mb.backup_name, "error");
                return Err(e);
            }
        };
        info!(
            backup = %mb.backup_name,
            data_id = %data_id,
            workflow_id = %workflow_id,
            "delete workflow launched"
        );

        self.store()
            .set_materialized_status(materialized_id, MaterializedStatus::Deleting, Some(&workflow_id))
            .await?;
        Ok(())
    }
}
