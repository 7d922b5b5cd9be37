//! Persistent store for backup specs and materialized backups.
//!
//! Backed by an embedded sqlite database. Every public method bridges onto
//! the blocking pool with `spawn_blocking`; the connection itself lives
//! behind a mutex so the tagging transaction can hold it exclusively.

pub mod tagging;

use crate::error::{CairnError, Result};
use crate::model::{BackupSpec, MaterializedBackup, MaterializedStatus, TagLevel};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const SPEC_COLUMNS: &str = "name, enabled, running_create_workflow, from_date, to_date, \
     backup_cron_string, retention_minutely, retention_hourly, retention_daily, \
     retention_weekly, retention_monthly, retention_yearly, timeout_seconds, \
     worker_config, last_update";

pub(crate) const MATERIALIZED_COLUMNS: &str = "id, backup_name, data_id, status, \
     running_delete_workflow, start_time, end_time, size, minutely, hourly, daily, \
     weekly, monthly, yearly, reference";

/// sqlite-backed store for backup specs and materialized backups.
pub struct BackupStore {
    conn: Arc<Mutex<Connection>>,
}

impl BackupStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        debug!("database initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| CairnError::Internal(format!("store task panicked: {}", e)))?
    }

    /// Fetch a backup spec by name.
    pub async fn get_spec(&self, name: &str) -> Result<BackupSpec> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let sql = format!("SELECT {} FROM backup_spec WHERE name = ?1", SPEC_COLUMNS);
            conn.query_row(&sql, params![name], row_to_spec)
                .optional()?
                .ok_or_else(|| CairnError::NotFound(format!("backup spec '{}'", name)))
        })
        .await
    }

    /// List backup specs, optionally filtered on the enabled flag.
    pub async fn list_specs(&self, enabled: Option<bool>) -> Result<Vec<BackupSpec>> {
        self.blocking(move |conn| {
            let mut sql = format!("SELECT {} FROM backup_spec", SPEC_COLUMNS);
            if enabled.is_some() {
                sql.push_str(" WHERE enabled = ?1");
            }
            sql.push_str(" ORDER BY name");
            let mut stmt = conn.prepare(&sql)?;
            let rows = match enabled {
                Some(e) => stmt.query_map(params![e], row_to_spec)?,
                None => stmt.query_map([], row_to_spec)?,
            };
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
        .await
    }

    /// Insert a new backup spec. Fails if the name is already taken.
    pub async fn create_spec(&self, spec: BackupSpec) -> Result<()> {
        self.blocking(move |conn| {
            let res = conn.execute(
                "INSERT INTO backup_spec (name, enabled, running_create_workflow, from_date, \
                 to_date, backup_cron_string, retention_minutely, retention_hourly, \
                 retention_daily, retention_weekly, retention_monthly, retention_yearly, \
                 timeout_seconds, worker_config, last_update) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    spec.name,
                    spec.enabled,
                    spec.running_create_workflow,
                    spec.from_date,
                    spec.to_date,
                    spec.backup_cron_string,
                    spec.retention_minutely,
                    spec.retention_hourly,
                    spec.retention_daily,
                    spec.retention_weekly,
                    spec.retention_monthly,
                    spec.retention_yearly,
                    spec.timeout_seconds,
                    spec.worker_config,
                    spec.last_update,
                ],
            );
            match res {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(CairnError::AlreadyExists(format!("backup spec '{}'", spec.name)))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Replace the mutable fields of an existing spec.
    pub async fn update_spec(&self, spec: BackupSpec) -> Result<()> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE backup_spec SET enabled = ?2, from_date = ?3, to_date = ?4, \
                 backup_cron_string = ?5, retention_minutely = ?6, retention_hourly = ?7, \
                 retention_daily = ?8, retention_weekly = ?9, retention_monthly = ?10, \
                 retention_yearly = ?11, timeout_seconds = ?12, worker_config = ?13, \
                 last_update = ?14 WHERE name = ?1",
                params![
                    spec.name,
                    spec.enabled,
                    spec.from_date,
                    spec.to_date,
                    spec.backup_cron_string,
                    spec.retention_minutely,
                    spec.retention_hourly,
                    spec.retention_daily,
                    spec.retention_weekly,
                    spec.retention_monthly,
                    spec.retention_yearly,
                    spec.timeout_seconds,
                    spec.worker_config,
                    spec.last_update,
                ],
            )?;
            if changed == 0 {
                return Err(CairnError::NotFound(format!("backup spec '{}'", spec.name)));
            }
            Ok(())
        })
        .await
    }

    /// Delete a spec by name.
    pub async fn delete_spec(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute("DELETE FROM backup_spec WHERE name = ?1", params![name])?;
            if changed == 0 {
                return Err(CairnError::NotFound(format!("backup spec '{}'", name)));
            }
            Ok(())
        })
        .await
    }

    /// Atomically set or clear the running create workflow id.
    pub async fn update_spec_running_create_workflow(
        &self,
        name: &str,
        workflow_id: Option<&str>,
    ) -> Result<()> {
        let name = name.to_string();
        let workflow_id = workflow_id.map(str::to_string);
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE backup_spec SET running_create_workflow = ?2, last_update = ?3 \
                 WHERE name = ?1",
                params![name, workflow_id, Utc::now()],
            )?;
            if changed == 0 {
                return Err(CairnError::NotFound(format!("backup spec '{}'", name)));
            }
            Ok(())
        })
        .await
    }

    /// Fetch a materialized backup by id.
    pub async fn get_materialized(&self, id: &str) -> Result<MaterializedBackup> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {} FROM materialized_backup WHERE id = ?1",
                MATERIALIZED_COLUMNS
            );
            conn.query_row(&sql, params![id], row_to_materialized)
                .optional()?
                .ok_or_else(|| CairnError::NotFound(format!("materialized backup '{}'", id)))
        })
        .await
    }

    /// List materialized backups for a backup, ordered by `end_time`
    /// descending unless `ascending`. `after_id` is a keyset cursor: rows
    /// strictly beyond the named row in scan order.
    pub async fn list_materialized(
        &self,
        backup_name: &str,
        limit: u32,
        after_id: Option<&str>,
        status: Option<MaterializedStatus>,
        ascending: bool,
    ) -> Result<Vec<MaterializedBackup>> {
        let backup_name = backup_name.to_string();
        let after_id = after_id.map(str::to_string);
        self.blocking(move |conn| {
            let mut sql = format!(
                "SELECT {} FROM materialized_backup WHERE backup_name = :name",
                MATERIALIZED_COLUMNS
            );
            if status.is_some() {
                sql.push_str(" AND status = :status");
            }
            if after_id.is_some() {
                if ascending {
                    sql.push_str(
                        " AND end_time > (SELECT end_time FROM materialized_backup WHERE id = :after)",
                    );
                } else {
                    sql.push_str(
                        " AND end_time < (SELECT end_time FROM materialized_backup WHERE id = :after)",
                    );
                }
            }
            sql.push_str(if ascending {
                " ORDER BY end_time ASC LIMIT :limit"
            } else {
                " ORDER BY end_time DESC LIMIT :limit"
            });

            let mut stmt = conn.prepare(&sql)?;
            let status_str = status.map(|s| s.as_str().to_string());
            let mut named: Vec<(&str, &dyn rusqlite::ToSql)> =
                vec![(":name", &backup_name), (":limit", &limit)];
            if let Some(ref s) = status_str {
                named.push((":status", s));
            }
            if let Some(ref after) = after_id {
                named.push((":after", after));
            }
            let rows = stmt.query_map(named.as_slice(), row_to_materialized)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
        .await
    }

    /// Persist a freshly completed backup. Fails if `id` already exists,
    /// which makes create-workflow completion idempotent.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_materialized(
        &self,
        id: &str,
        backup_name: &str,
        data_id: &str,
        status: MaterializedStatus,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        size_mb: f64,
    ) -> Result<()> {
        let id = id.to_string();
        let backup_name = backup_name.to_string();
        let data_id = data_id.to_string();
        self.blocking(move |conn| {
            let res = conn.execute(
                "INSERT INTO materialized_backup \
                 (id, backup_name, data_id, status, start_time, end_time, size) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, backup_name, data_id, status.as_str(), start_time, end_time, size_mb],
            );
            match res {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(CairnError::AlreadyExists(format!("materialized backup '{}'", id)))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Update the status (and running delete workflow id) of a materialized
    /// backup, returning the updated row.
    pub async fn set_materialized_status(
        &self,
        id: &str,
        status: MaterializedStatus,
        running_delete_workflow: Option<&str>,
    ) -> Result<MaterializedBackup> {
        let id = id.to_string();
        let workflow_id = running_delete_workflow.map(str::to_string);
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE materialized_backup SET status = ?2, running_delete_workflow = ?3 \
                 WHERE id = ?1",
                params![id, status.as_str(), workflow_id],
            )?;
            if changed == 0 {
                return Err(CairnError::NotFound(format!("materialized backup '{}'", id)));
            }
            let sql = format!(
                "SELECT {} FROM materialized_backup WHERE id = ?1",
                MATERIALIZED_COLUMNS
            );
            conn.query_row(&sql, params![id], row_to_materialized)
                .map_err(Into::into)
        })
        .await
    }

    /// Deletion candidates for one tag sweep: `COMPLETED` rows exclusively
    /// tagged at the given level (its flag set, every flag outside its
    /// ancestry clear), beyond the newest `keep` rows carrying the flag,
    /// oldest first, capped at `limit`. A row tagged at a foreign level is
    /// still claimed by that bucket and is never electable here; since the
    /// freshest backup carries every tag, it is never electable anywhere.
    /// `tag = None` is the untagged sweep: rows with no flag at all.
    pub async fn list_tag_surplus(
        &self,
        backup_name: &str,
        tag: Option<TagLevel>,
        keep: u32,
        limit: u32,
    ) -> Result<Vec<MaterializedBackup>> {
        let backup_name = backup_name.to_string();
        self.blocking(move |conn| {
            let (exclusive, window) = match tag {
                Some(level) => {
                    let mut exclusive = format!("{} = 1", level.column());
                    for foreign in level.foreign_levels() {
                        exclusive.push_str(&format!(" AND {} = 0", foreign.column()));
                    }
                    (exclusive, format!("{} = 1", level.column()))
                }
                None => {
                    let untagged = TagLevel::ALL
                        .iter()
                        .map(|l| format!("{} = 0", l.column()))
                        .collect::<Vec<_>>()
                        .join(" AND ");
                    (untagged.clone(), untagged)
                }
            };
            let sql = format!(
                "SELECT {cols} FROM materialized_backup \
                 WHERE backup_name = ?1 AND status = 'COMPLETED' AND {exclusive} \
                 AND id NOT IN ( \
                     SELECT id FROM materialized_backup \
                     WHERE backup_name = ?1 AND status = 'COMPLETED' AND {window} \
                     ORDER BY end_time DESC LIMIT ?2) \
                 ORDER BY end_time ASC LIMIT ?3",
                cols = MATERIALIZED_COLUMNS,
                exclusive = exclusive,
                window = window,
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![backup_name, keep, limit], row_to_materialized)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
        .await
    }

    /// Run `f` inside one transaction on the blocking pool. Commits on `Ok`,
    /// rolls back on `Err`; partial tag updates are never visible.
    pub async fn with_tagging_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }
}

pub(crate) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS backup_spec (
            name TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL,
            running_create_workflow TEXT,
            from_date TIMESTAMP,
            to_date TIMESTAMP,
            backup_cron_string TEXT NOT NULL,
            retention_minutely VARCHAR NOT NULL DEFAULT '0@L',
            retention_hourly VARCHAR NOT NULL DEFAULT '0@L',
            retention_daily VARCHAR NOT NULL DEFAULT '4@L',
            retention_weekly VARCHAR NOT NULL DEFAULT '4@L',
            retention_monthly VARCHAR NOT NULL DEFAULT '3@L',
            retention_yearly VARCHAR NOT NULL DEFAULT '2@L',
            timeout_seconds INTEGER NOT NULL DEFAULT 7200,
            worker_config TEXT,
            last_update TIMESTAMP NOT NULL
        );
        CREATE TABLE IF NOT EXISTS materialized_backup (
            id TEXT PRIMARY KEY,
            backup_name TEXT NOT NULL,
            data_id TEXT,
            status TEXT NOT NULL,
            running_delete_workflow TEXT,
            start_time TIMESTAMP NOT NULL,
            end_time TIMESTAMP NOT NULL,
            size REAL NOT NULL DEFAULT 0,
            minutely INTEGER NOT NULL DEFAULT 0,
            hourly INTEGER NOT NULL DEFAULT 0,
            daily INTEGER NOT NULL DEFAULT 0,
            weekly INTEGER NOT NULL DEFAULT 0,
            monthly INTEGER NOT NULL DEFAULT 0,
            yearly INTEGER NOT NULL DEFAULT 0,
            reference INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_materialized_backup_lookup
            ON materialized_backup (backup_name, status, end_time);",
    )?;
    Ok(())
}

fn row_to_spec(row: &Row<'_>) -> rusqlite::Result<BackupSpec> {
    Ok(BackupSpec {
        name: row.get(0)?,
        enabled: row.get(1)?,
        running_create_workflow: row.get(2)?,
        from_date: row.get(3)?,
        to_date: row.get(4)?,
        backup_cron_string: row.get(5)?,
        retention_minutely: row.get(6)?,
        retention_hourly: row.get(7)?,
        retention_daily: row.get(8)?,
        retention_weekly: row.get(9)?,
        retention_monthly: row.get(10)?,
        retention_yearly: row.get(11)?,
        timeout_seconds: row.get(12)?,
        worker_config: row.get(13)?,
        last_update: row.get(14)?,
    })
}

pub(crate) fn row_to_materialized(row: &Row<'_>) -> rusqlite::Result<MaterializedBackup> {
    let status_raw: String = row.get(3)?;
    let status = status_raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{}", e))),
        )
    })?;
    Ok(MaterializedBackup {
        id: row.get(0)?,
        backup_name: row.get(1)?,
        data_id: row.get(2)?,
        status,
        running_delete_workflow: row.get(4)?,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        size_mb: row.get(7)?,
        minutely: row.get(8)?,
        hourly: row.get(9)?,
        daily: row.get(10)?,
        weekly: row.get(11)?,
        monthly: row.get(12)?,
        yearly: row.get(13)?,
        reference: row.get(14)?,
    })
}
