//! Tag-marking primitives for the retention pass.
//!
//! All functions here operate on one open [`rusqlite::Transaction`] so the
//! whole tagging pass commits or rolls back atomically. Bucket keys and
//! in-bucket positions are computed in host code with chrono rather than in
//! SQL, which keeps the week convention unambiguous (ISO 8601 throughout).

use crate::error::{CairnError, Result};
use crate::model::{BucketRef, MaterializedBackup, TagLevel};
use crate::store::{row_to_materialized, MATERIALIZED_COLUMNS};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use std::collections::HashMap;

/// The newest `COMPLETED` materialized backup for a backup, if any.
pub fn newest_completed(tx: &Transaction<'_>, backup_name: &str) -> Result<Option<MaterializedBackup>> {
    let sql = format!(
        "SELECT {} FROM materialized_backup \
         WHERE backup_name = ?1 AND status = 'COMPLETED' \
         ORDER BY end_time DESC LIMIT 1",
        MATERIALIZED_COLUMNS
    );
    tx.query_row(&sql, params![backup_name], row_to_materialized)
        .optional()
        .map_err(Into::into)
}

/// Reset all six tag flags and the reference flag for a backup's rows.
pub fn clear_tags_and_references(tx: &Transaction<'_>, backup_name: &str) -> Result<usize> {
    let changed = tx.execute(
        "UPDATE materialized_backup SET minutely = 0, hourly = 0, daily = 0, \
         weekly = 0, monthly = 0, yearly = 0, reference = 0 \
         WHERE backup_name = ?1",
        params![backup_name],
    )?;
    Ok(changed)
}

/// Mark the reference row of every minute bucket, setting both `reference`
/// and `minutely` on it. This seeds the parent chain for the higher levels.
pub fn mark_references_minutely(
    tx: &Transaction<'_>,
    backup_name: &str,
    reference: BucketRef,
) -> Result<usize> {
    let candidates = completed_candidates(tx, backup_name, None)?;
    let elected = elect_per_bucket(&candidates, TagLevel::Minutely, reference);
    for id in &elected {
        tx.execute(
            "UPDATE materialized_backup SET reference = 1, minutely = 1 WHERE id = ?1",
            params![id],
        )?;
    }
    Ok(elected.len())
}

/// Mark one level's tag: among rows already tagged at the parent level,
/// group by the level's bucket key and flag the elected row per bucket.
/// Returns the number of rows marked.
pub fn mark_bucket_tag(
    tx: &Transaction<'_>,
    level: TagLevel,
    backup_name: &str,
    reference: BucketRef,
) -> Result<usize> {
    let parent = level.parent().ok_or_else(|| {
        CairnError::InvalidArgument(format!("level {} has no parent tag", level))
    })?;
    let candidates = completed_candidates(tx, backup_name, Some(parent))?;
    let elected = elect_per_bucket(&candidates, level, reference);
    for id in &elected {
        let sql = format!(
            "UPDATE materialized_backup SET {} = 1 WHERE id = ?1",
            level.column()
        );
        tx.execute(&sql, params![id])?;
    }
    Ok(elected.len())
}

/// Force one row (the freshest completed backup) to carry every tag, so it
/// can never be elected for deletion before the next tagging pass.
pub fn set_all_tags(tx: &Transaction<'_>, id: &str) -> Result<usize> {
    let changed = tx.execute(
        "UPDATE materialized_backup SET minutely = 1, hourly = 1, daily = 1, \
         weekly = 1, monthly = 1, yearly = 1 \
         WHERE id = ?1",
        params![id],
    )?;
    Ok(changed)
}

/// Load `(id, end_time)` of COMPLETED rows, optionally gated on a parent tag.
fn completed_candidates(
    tx: &Transaction<'_>,
    backup_name: &str,
    parent: Option<TagLevel>,
) -> Result<Vec<(String, DateTime<Utc>)>> {
    let mut sql = String::from(
        "SELECT id, end_time FROM materialized_backup \
         WHERE backup_name = ?1 AND status = 'COMPLETED'",
    );
    if let Some(parent) = parent {
        sql.push_str(&format!(" AND {} = 1", parent.column()));
    }
    let mut stmt = tx.prepare(&sql)?;
    let rows = stmt.query_map(params![backup_name], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, DateTime<Utc>>(1)?))
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Group candidates by bucket key, then pick one row per bucket: the row at
/// the exact reference position, or for `L` the row with the maximum
/// position present. Ties are broken by the latest `end_time`.
fn elect_per_bucket(
    candidates: &[(String, DateTime<Utc>)],
    level: TagLevel,
    reference: BucketRef,
) -> Vec<String> {
    let mut buckets: HashMap<String, Vec<&(String, DateTime<Utc>)>> = HashMap::new();
    for row in candidates {
        buckets.entry(level.bucket_key(&row.1)).or_default().push(row);
    }

    let mut elected = Vec::with_capacity(buckets.len());
    for rows in buckets.values() {
        let winner = match reference {
            BucketRef::Last => rows
                .iter()
                .max_by_key(|(_, end)| (level.position(end), *end)),
            BucketRef::At(position) => rows
                .iter()
                .filter(|(_, end)| level.position(end) == position)
                .max_by_key(|(_, end)| *end),
        };
        if let Some((id, _)) = winner {
            elected.push(id.clone());
        }
    }
    elected
}
