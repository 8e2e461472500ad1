//! SQLite-based state store for the probe agent.
//!
//! This provides durable storage for job instances, enabling recovery after
//! agent restarts without double-submitting or losing in-flight jobs.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use sitemon_model::{InstanceKey, InstanceState, JobHandle, JobInstance, ProbeResult};
use thiserror::Error;
use tracing::debug;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Result encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("State store lock poisoned")]
    Poisoned,
}

/// A terminal or active instance together with its recorded outcome.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub instance: JobInstance,
    pub result: Option<ProbeResult>,
    pub reported: bool,
}

const INSTANCE_COLUMNS: &str = "probe_name, submitted_at, site, external_handle, state, deadline, \
     artifact_path, last_error, updated_at";

const ACTIVE_STATES: &str = "('PENDING', 'SUBMITTED', 'RUNNING')";

/// SQLite state store.
///
/// The connection is serialized behind a mutex, so a read always observes the
/// latest completed write.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StateStoreError> {
        self.conn.lock().map_err(|_| StateStoreError::Poisoned)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS job_instances (
                probe_name TEXT NOT NULL,
                submitted_at INTEGER NOT NULL,
                site TEXT NOT NULL,
                external_handle TEXT,
                state TEXT NOT NULL,
                deadline INTEGER NOT NULL,
                artifact_path TEXT,
                last_error TEXT,
                updated_at INTEGER NOT NULL,
                result_json TEXT,
                reported INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (probe_name, submitted_at)
            );

            CREATE INDEX IF NOT EXISTS idx_job_instances_state ON job_instances(state);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Insert or update an instance record.
    pub fn upsert(&self, instance: &JobInstance) -> Result<(), StateStoreError> {
        let conn = self.conn()?;
        upsert_instance(&conn, instance)?;
        debug!(
            probe = %instance.probe_name,
            state = %instance.state,
            "Instance checkpointed"
        );
        Ok(())
    }

    /// Persist a terminal instance together with its outcome, not yet reported.
    pub fn record_outcome(
        &self,
        instance: &JobInstance,
        result: &ProbeResult,
    ) -> Result<(), StateStoreError> {
        let json = serde_json::to_string(result)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        upsert_instance(&tx, instance)?;
        tx.execute(
            "UPDATE job_instances SET result_json = ?1, reported = 0
             WHERE probe_name = ?2 AND submitted_at = ?3",
            params![
                json,
                instance.probe_name,
                instance.submitted_at.timestamp_millis()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Note that the outcome of an instance has been handed to the sink.
    pub fn mark_reported(&self, key: &InstanceKey) -> Result<(), StateStoreError> {
        self.conn()?.execute(
            "UPDATE job_instances SET reported = 1 WHERE probe_name = ?1 AND submitted_at = ?2",
            params![key.probe_name, key.submitted_at.timestamp_millis()],
        )?;
        Ok(())
    }

    /// All instances in a non-terminal state, oldest first.
    pub fn load_active(&self) -> Result<Vec<JobInstance>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances
             WHERE state IN {ACTIVE_STATES} ORDER BY submitted_at"
        ))?;

        let records = stmt
            .query_map([], instance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Count non-terminal instances for a probe.
    pub fn active_count(&self, probe_name: &str) -> Result<i64, StateStoreError> {
        let count: i64 = self.conn()?.query_row(
            &format!(
                "SELECT COUNT(*) FROM job_instances
                 WHERE probe_name = ?1 AND state IN {ACTIVE_STATES}"
            ),
            params![probe_name],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Submission time of the most recent instance of a probe.
    pub fn last_submission(
        &self,
        probe_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StateStoreError> {
        let millis: Option<i64> = self.conn()?.query_row(
            "SELECT MAX(submitted_at) FROM job_instances WHERE probe_name = ?1",
            params![probe_name],
            |row| row.get(0),
        )?;
        Ok(millis.and_then(DateTime::from_timestamp_millis))
    }

    /// Terminal instances whose outcome was persisted but never reported.
    pub fn load_unreported(&self) -> Result<Vec<(JobInstance, ProbeResult)>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS}, result_json, reported FROM job_instances
             WHERE reported = 0 AND result_json IS NOT NULL ORDER BY submitted_at"
        ))?;

        let entries = stmt
            .query_map([], history_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| entry.result.map(|result| (entry.instance, result)))
            .collect())
    }

    /// Most recent instances of a probe, newest first.
    pub fn history(
        &self,
        probe_name: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS}, result_json, reported FROM job_instances
             WHERE probe_name = ?1 ORDER BY submitted_at DESC LIMIT ?2"
        ))?;

        let entries = stmt
            .query_map(params![probe_name, limit as i64], history_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Delete reported terminal instances submitted before `cutoff`.
    pub fn prune_history(&self, cutoff: DateTime<Utc>) -> Result<usize, StateStoreError> {
        let deleted = self.conn()?.execute(
            &format!(
                "DELETE FROM job_instances
                 WHERE submitted_at < ?1 AND reported = 1 AND state NOT IN {ACTIVE_STATES}"
            ),
            params![cutoff.timestamp_millis()],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
impl StateStore {
    pub(crate) fn get(&self, key: &InstanceKey) -> Result<Option<JobInstance>, StateStoreError> {
        use rusqlite::OptionalExtension;

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances
             WHERE probe_name = ?1 AND submitted_at = ?2"
        ))?;

        stmt.query_row(
            params![key.probe_name, key.submitted_at.timestamp_millis()],
            instance_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Make every insert and update fail until [`StateStore::accept_writes`].
    pub(crate) fn reject_writes(&self) {
        self.conn()
            .unwrap()
            .execute_batch(
                r#"
                CREATE TRIGGER reject_insert BEFORE INSERT ON job_instances
                BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;
                CREATE TRIGGER reject_update BEFORE UPDATE ON job_instances
                BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;
                "#,
            )
            .unwrap();
    }

    pub(crate) fn accept_writes(&self) {
        self.conn()
            .unwrap()
            .execute_batch("DROP TRIGGER reject_insert; DROP TRIGGER reject_update;")
            .unwrap();
    }
}

fn upsert_instance(conn: &Connection, instance: &JobInstance) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT INTO job_instances (probe_name, submitted_at, site, external_handle, state, deadline, artifact_path, last_error, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(probe_name, submitted_at) DO UPDATE SET
            site = excluded.site,
            external_handle = excluded.external_handle,
            state = excluded.state,
            deadline = excluded.deadline,
            artifact_path = excluded.artifact_path,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at
        "#,
        params![
            instance.probe_name,
            instance.submitted_at.timestamp_millis(),
            instance.site,
            instance.external_handle.as_ref().map(JobHandle::as_str),
            instance.state.as_str(),
            instance.deadline.timestamp_millis(),
            instance
                .artifact_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            instance.last_error,
            instance.updated_at.timestamp_millis(),
        ],
    )
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<JobInstance> {
    let state_str: String = row.get(4)?;
    let state = state_str
        .parse::<InstanceState>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(JobInstance {
        probe_name: row.get(0)?,
        submitted_at: millis_to_utc(1, row.get(1)?)?,
        site: row.get(2)?,
        external_handle: row.get::<_, Option<String>>(3)?.map(JobHandle::new),
        state,
        deadline: millis_to_utc(5, row.get(5)?)?,
        artifact_path: row.get::<_, Option<String>>(6)?.map(PathBuf::from),
        last_error: row.get(7)?,
        updated_at: millis_to_utc(8, row.get(8)?)?,
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let instance = instance_from_row(row)?;
    let result = match row.get::<_, Option<String>>(9)? {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?,
        ),
        None => None,
    };
    let reported: i64 = row.get(10)?;

    Ok(HistoryEntry {
        instance,
        result,
        reported: reported != 0,
    })
}

fn millis_to_utc(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {millis}").into(),
        )
    })
}
