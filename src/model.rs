//! Domain model: backup specifications, materialized backups, and the
//! calendar-bucket retention rules that connect them.

use crate::error::{CairnError, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The six calendar levels a materialized backup can be tagged with.
///
/// Each level groups backups into buckets derived from `end_time` and elects
/// one canonical representative per bucket. Levels above minutely only
/// consider rows already tagged at their parent level, so tags form a chain:
/// `yearly ⇒ monthly ⇒ daily ⇒ hourly ⇒ minutely`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagLevel {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl TagLevel {
    /// All levels, in tagging order (parents before children).
    pub const ALL: [TagLevel; 6] = [
        TagLevel::Minutely,
        TagLevel::Hourly,
        TagLevel::Daily,
        TagLevel::Weekly,
        TagLevel::Monthly,
        TagLevel::Yearly,
    ];

    /// Column name carrying this level's tag flag.
    pub fn column(&self) -> &'static str {
        match self {
            TagLevel::Minutely => "minutely",
            TagLevel::Hourly => "hourly",
            TagLevel::Daily => "daily",
            TagLevel::Weekly => "weekly",
            TagLevel::Monthly => "monthly",
            TagLevel::Yearly => "yearly",
        }
    }

    /// The level whose tag gates candidacy at this level.
    ///
    /// Minutely has no parent; it is seeded by the reference-marking pass.
    /// Weekly and monthly both derive from daily.
    pub fn parent(&self) -> Option<TagLevel> {
        match self {
            TagLevel::Minutely => None,
            TagLevel::Hourly => Some(TagLevel::Minutely),
            TagLevel::Daily => Some(TagLevel::Hourly),
            TagLevel::Weekly => Some(TagLevel::Daily),
            TagLevel::Monthly => Some(TagLevel::Daily),
            TagLevel::Yearly => Some(TagLevel::Monthly),
        }
    }

    /// Levels outside this level's ancestry.
    ///
    /// A row is exclusively tagged at this level when none of these flags
    /// are set: ancestor tags are structurally implied by the chain, but a
    /// tag at any other level means another bucket still claims the row, so
    /// this level's sweep must not elect it. The freshest backup carries
    /// every tag and is therefore never exclusive anywhere.
    pub fn foreign_levels(&self) -> Vec<TagLevel> {
        let mut ancestry = vec![*self];
        let mut cursor = *self;
        while let Some(parent) = cursor.parent() {
            ancestry.push(parent);
            cursor = parent;
        }
        TagLevel::ALL
            .iter()
            .copied()
            .filter(|level| !ancestry.contains(level))
            .collect()
    }

    /// Bucket key for a timestamp: rows sharing a key compete for the same
    /// canonical slot. Weeks use ISO 8601 (week year + week number).
    pub fn bucket_key(&self, at: &DateTime<Utc>) -> String {
        match self {
            TagLevel::Minutely => at.format("%Y-%m-%dT%H:%M").to_string(),
            TagLevel::Hourly => at.format("%Y-%m-%dT%H").to_string(),
            TagLevel::Daily => at.format("%Y-%m-%d").to_string(),
            TagLevel::Weekly => format!("{}-W{:02}", at.iso_week().year(), at.iso_week().week()),
            TagLevel::Monthly => at.format("%Y-%m").to_string(),
            TagLevel::Yearly => at.format("%Y").to_string(),
        }
    }

    /// Position of a timestamp within its bucket, matched against the
    /// retention rule's reference value.
    pub fn position(&self, at: &DateTime<Utc>) -> u32 {
        match self {
            TagLevel::Minutely => at.second(),
            TagLevel::Hourly => at.minute(),
            TagLevel::Daily => at.hour(),
            TagLevel::Weekly => at.weekday().number_from_monday(),
            TagLevel::Monthly => at.day(),
            TagLevel::Yearly => at.month(),
        }
    }
}

impl fmt::Display for TagLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Which row inside a bucket is canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketRef {
    /// The rightmost position present in the bucket (`L`).
    Last,
    /// An exact position (e.g. monthly `15` = the 15th of the month).
    At(u32),
}

impl FromStr for BucketRef {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "L" {
            return Ok(BucketRef::Last);
        }
        s.parse::<u32>()
            .map(BucketRef::At)
            .map_err(|_| CairnError::InvalidArgument(format!("invalid bucket reference '{}'", s)))
    }
}

/// One parsed `COUNT@REF` retention rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionRule {
    /// How many tagged backups to keep at this level.
    pub keep: u32,
    /// Which row inside each bucket is canonical.
    pub reference: BucketRef,
}

impl FromStr for RetentionRule {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        let (count, reference) = s
            .split_once('@')
            .ok_or_else(|| CairnError::InvalidArgument(format!("invalid retention rule '{}'", s)))?;
        let keep = count.parse::<u32>().map_err(|_| {
            CairnError::InvalidArgument(format!("invalid retention count in '{}'", s))
        })?;
        Ok(RetentionRule {
            keep,
            reference: reference.parse()?,
        })
    }
}

/// Declarative description of a backup job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSpec {
    /// Unique backup name.
    pub name: String,
    /// Whether the scheduler should run this backup.
    pub enabled: bool,
    /// Create workflow currently in flight, if any.
    pub running_create_workflow: Option<String>,
    /// Activation window start (inclusive).
    pub from_date: Option<DateTime<Utc>>,
    /// Activation window end (inclusive).
    pub to_date: Option<DateTime<Utc>>,
    /// Cron expression driving the backup timer.
    pub backup_cron_string: String,
    /// Retention rules per level, stored as `COUNT@REF` strings.
    pub retention_minutely: String,
    pub retention_hourly: String,
    pub retention_daily: String,
    pub retention_weekly: String,
    pub retention_monthly: String,
    pub retention_yearly: String,
    /// Workflow timeout forwarded to delete workflows.
    pub timeout_seconds: u64,
    /// Opaque worker configuration forwarded to delete workflows.
    pub worker_config: Option<String>,
    /// Timestamp of the last mutation.
    pub last_update: DateTime<Utc>,
}

impl BackupSpec {
    /// The raw retention string for a level.
    pub fn retention_string(&self, level: TagLevel) -> &str {
        match level {
            TagLevel::Minutely => &self.retention_minutely,
            TagLevel::Hourly => &self.retention_hourly,
            TagLevel::Daily => &self.retention_daily,
            TagLevel::Weekly => &self.retention_weekly,
            TagLevel::Monthly => &self.retention_monthly,
            TagLevel::Yearly => &self.retention_yearly,
        }
    }

    /// Parse the retention rule for a level.
    pub fn retention_rule(&self, level: TagLevel) -> Result<RetentionRule> {
        self.retention_string(level).parse()
    }

    /// Check whether the spec is inside its activation window.
    ///
    /// Both ends are inclusive; absent ends are unbounded.
    pub fn active_at(&self, now: DateTime<Utc>) -> bool {
        let after_start = self.from_date.map_or(true, |from| now >= from);
        let before_end = self.to_date.map_or(true, |to| now <= to);
        after_start && before_end
    }
}

/// Lifecycle status of a materialized backup.
///
/// Delete transitions are one-way: `COMPLETED → deleting → {deleted,
/// delete-error}`; `delete-error` may be re-driven to `deleting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaterializedStatus {
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "deleting")]
    Deleting,
    #[serde(rename = "deleted")]
    Deleted,
    #[serde(rename = "delete-error")]
    DeleteError,
}

impl MaterializedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterializedStatus::Completed => "COMPLETED",
            MaterializedStatus::Deleting => "deleting",
            MaterializedStatus::Deleted => "deleted",
            MaterializedStatus::DeleteError => "delete-error",
        }
    }
}

impl FromStr for MaterializedStatus {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "COMPLETED" => Ok(MaterializedStatus::Completed),
            "deleting" => Ok(MaterializedStatus::Deleting),
            "deleted" => Ok(MaterializedStatus::Deleted),
            "delete-error" => Ok(MaterializedStatus::DeleteError),
            other => Err(CairnError::Storage(format!(
                "unknown materialized backup status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for MaterializedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed instance of a backup, keyed by its create workflow id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializedBackup {
    /// The create workflow id; duplicate completions are idempotent on it.
    pub id: String,
    /// Owning backup spec.
    pub backup_name: String,
    /// Opaque handle to the stored data, needed to delete it later.
    pub data_id: Option<String>,
    pub status: MaterializedStatus,
    /// Delete workflow in flight (or crashed mid-flight), if any.
    pub running_delete_workflow: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub size_mb: f64,
    /// Calendar tag flags, recomputed from scratch on every tagging pass.
    pub minutely: bool,
    pub hourly: bool,
    pub daily: bool,
    pub weekly: bool,
    pub monthly: bool,
    pub yearly: bool,
    /// Canonical instance of its minute bucket.
    pub reference: bool,
}

impl MaterializedBackup {
    /// Whether a tag flag is set for the given level.
    pub fn tagged(&self, level: TagLevel) -> bool {
        match level {
            TagLevel::Minutely => self.minutely,
            TagLevel::Hourly => self.hourly,
            TagLevel::Daily => self.daily,
            TagLevel::Weekly => self.weekly,
            TagLevel::Monthly => self.monthly,
            TagLevel::Yearly => self.yearly,
        }
    }

    /// Whether no tag flag is set at all (candidate for the untagged sweep).
    pub fn untagged(&self) -> bool {
        TagLevel::ALL.iter().all(|level| !self.tagged(*level))
    }
}
