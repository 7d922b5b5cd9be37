//! Retention: calendar-bucket tagging and deletion election.
//!
//! Tagging runs entirely inside one store transaction. It does not take the
//! retention lock itself: its callers (`check_create`'s completion tail and
//! `run_retention_task`) hold it, which is what guarantees a freshly created
//! backup is tagged before it can ever be elected.

use crate::engine::Engine;
use crate::error::Result;
use crate::model::{BackupSpec, BucketRef, MaterializedBackup, TagLevel};
use crate::observability;
use crate::store::tagging;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Maximum rows elected per tag sweep.
const ELECTION_LIMIT: u32 = 30;

impl Engine {
    /// Recompute every tag flag for a backup's materialized rows.
    ///
    /// One transaction: newest COMPLETED row → clear all flags → minutely
    /// references → hourly/daily/weekly/monthly/yearly bucket marks →
    /// `set_all_tags` on the freshest row. Commits only if every step
    /// succeeds; a no-op commit when the backup has no completed rows.
    pub async fn tag_all_backups(&self, backup_name: &str) -> Result<()> {
        debug!(backup = backup_name, "tagging backups");
        let spec = self.store().get_spec(backup_name).await?;

        // Unparseable references disable their level but never abort the
        // pass; the remaining levels still need their tags.
        let minutely_ref = parse_reference(&spec, TagLevel::Minutely);
        let level_refs: Vec<(TagLevel, Option<BucketRef>)> = [
            TagLevel::Hourly,
            TagLevel::Daily,
            TagLevel::Weekly,
            TagLevel::Monthly,
            TagLevel::Yearly,
        ]
        .into_iter()
        .map(|level| (level, parse_reference(&spec, level)))
        .collect();

        let name = backup_name.to_string();
        let result = self
            .store()
            .with_tagging_tx(move |tx| {
                let Some(last) = tagging::newest_completed(tx, &name)? else {
                    warn!(backup = %name, "no completed backups found, skipping tagging");
                    return Ok(false);
                };

                let cleared = tagging::clear_tags_and_references(tx, &name)?;
                debug!(backup = %name, rows = cleared, "cleared tags and references");

                if let Some(reference) = minutely_ref {
                    let marked = tagging::mark_references_minutely(tx, &name, reference)?;
                    debug!(backup = %name, rows = marked, "marked minutely references");
                }

                for (level, reference) in level_refs {
                    let Some(reference) = reference else { continue };
                    let marked = tagging::mark_bucket_tag(tx, level, &name, reference)?;
                    debug!(backup = %name, level = %level, rows = marked, "marked bucket tags");
                }

                tagging::set_all_tags(tx, &last.id)?;
                debug!(backup = %name, id = %last.id, "tagged freshest backup with all tags");
                Ok(true)
            })
            .await;

        match result {
            Ok(tagged) => {
                if tagged {
                    observability::record_backup_tag(backup_name, "success");
                }
                Ok(())
            }
            Err(e) => {
                observability::record_backup_tag(backup_name, "error");
                Err(e)
            }
        }
    }

    /// Elect surplus materialized backups for deletion.
    ///
    /// Walks the untagged sweep first (rows that fell out of every bucket,
    /// keep count hard-coded to zero), then each calendar tag with its
    /// configured keep count. Per-tag errors skip that tag only.
    pub async fn elect_for_deletion(&self, spec: &BackupSpec) -> Vec<MaterializedBackup> {
        let mut sweeps: Vec<(Option<TagLevel>, u32)> = vec![(None, 0)];
        for level in TagLevel::ALL {
            match spec.retention_rule(level) {
                Ok(rule) => sweeps.push((Some(level), rule.keep)),
                Err(e) => {
                    error!(backup = %spec.name, level = %level, error = %e,
                           "invalid retention rule, skipping level");
                }
            }
        }

        let mut elected = Vec::new();
        for (tag, keep) in sweeps {
            let label = tag.map(|l| l.column()).unwrap_or("untagged");
            match self
                .store()
                .list_tag_surplus(&spec.name, tag, keep, ELECTION_LIMIT)
                .await
            {
                Ok(batch) => {
                    debug!(
                        backup = %spec.name,
                        tag = label,
                        count = batch.len(),
                        "backups elected for deletion"
                    );
                    elected.extend(batch);
                }
                Err(e) => {
                    error!(backup = %spec.name, tag = label, error = %e,
                           "error querying backups for deletion");
                }
            }
        }
        elected
    }

    /// One full retention pass for a backup: re-tag, elect, trigger deletes.
    ///
    /// Holds the retention lock for the whole pass. Per-item delete failures
    /// are logged and do not stop the remaining items.
    pub async fn run_retention_task(&self, backup_name: &str) {
        info!(backup = backup_name, "running retention task");
        let _guard = self.locks().acquire(backup_name).await;

        let start = Instant::now();
        observability::record_retention_task();

        let spec = match self.store().get_spec(backup_name).await {
            Ok(spec) => spec,
            Err(e) => {
                error!(backup = backup_name, error = %e, "couldn't load backup spec");
                return;
            }
        };

        if let Err(e) = self.tag_all_backups(backup_name).await {
            error!(backup = backup_name, error = %e, "error tagging backups");
        }

        debug!(
            backup = backup_name,
            minutely = %spec.retention_minutely,
            hourly = %spec.retention_hourly,
            daily = %spec.retention_daily,
            weekly = %spec.retention_weekly,
            monthly = %spec.retention_monthly,
            yearly = %spec.retention_yearly,
            "retention policy"
        );

        let elected = self.elect_for_deletion(&spec).await;
        info!(backup = backup_name, count = elected.len(), "backups elected for deletion");

        for mb in elected {
            debug!(backup = backup_name, id = %mb.id, "deleting backup");
            if let Err(e) = self.trigger_backup_delete(&mb.id).await {
                error!(backup = backup_name, id = %mb.id, error = %e,
                       "couldn't trigger backup delete");
                observability::record_retention_delete(backup_name, "error");
                continue;
            }
        }

        info!(backup = backup_name, elapsed_ms = start.elapsed().as_millis() as u64,
              "retention task done");
    }
}

fn parse_reference(spec: &BackupSpec, level: TagLevel) -> Option<BucketRef> {
    match spec.retention_rule(level) {
        Ok(rule) => Some(rule.reference),
        Err(e) => {
            error!(backup = %spec.name, level = %level, error = %e,
                   "invalid retention rule, level will not be tagged");
            None
        }
    }
}
