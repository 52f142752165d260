//! SQLite-backed job store.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    EnqueueRequest, Job, JobCounter, JobFilter, JobState, JobStore, JobStoreError,
    RUNNABLE_STATES,
};

const JOB_COLUMNS: &str = "id, source, destination, domain, dry_run, requested_by, state, \
     bytes_transferred, sessions, crash_count, stall_count, rotation_count, created_at, updated_at";

pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open (or create) the jobs table in the database at `path`.
    pub fn new(path: &Path) -> Result<Self, JobStoreError> {
        let conn = Connection::open(path).map_err(|e| JobStoreError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, JobStoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| JobStoreError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                destination TEXT NOT NULL,
                domain TEXT NOT NULL,
                dry_run INTEGER NOT NULL DEFAULT 0,
                requested_by TEXT NOT NULL,
                state TEXT NOT NULL,
                bytes_transferred INTEGER NOT NULL DEFAULT 0,
                sessions INTEGER NOT NULL DEFAULT 0,
                crash_count INTEGER NOT NULL DEFAULT 0,
                stall_count INTEGER NOT NULL DEFAULT 0,
                rotation_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_domain ON jobs(domain);
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
            "#,
        )
        .map_err(|e| JobStoreError::Database(e.to_string()))
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref state) = filter.state {
            conditions.push("json_extract(state, '$.type') = ?".to_string());
            params.push(Box::new(state.clone()));
        }

        if let Some(ref domain) = filter.domain {
            conditions.push("domain = ?".to_string());
            params.push(Box::new(domain.clone()));
        }

        if !filter.exclude_domains.is_empty() {
            let placeholders = vec!["?"; filter.exclude_domains.len()].join(", ");
            conditions.push(format!("domain NOT IN ({})", placeholders));
            for domain in &filter.exclude_domains {
                params.push(Box::new(domain.clone()));
            }
        }

        if filter.runnable {
            let placeholders = vec!["?"; RUNNABLE_STATES.len()].join(", ");
            conditions.push(format!(
                "json_extract(state, '$.type') IN ({})",
                placeholders
            ));
            for state in RUNNABLE_STATES {
                params.push(Box::new(state));
            }
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let state_json: String = row.get(6)?;
        let state: JobState = serde_json::from_str(&state_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let created_at: String = row.get(12)?;
        let updated_at: String = row.get(13)?;

        Ok(Job {
            id: row.get(0)?,
            source: row.get(1)?,
            destination: row.get(2)?,
            domain: row.get(3)?,
            dry_run: row.get(4)?,
            requested_by: row.get(5)?,
            state,
            bytes_transferred: row.get::<_, i64>(7)?.max(0) as u64,
            sessions: row.get(8)?,
            crash_count: row.get(9)?,
            stall_count: row.get(10)?,
            rotation_count: row.get(11)?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Job, JobStoreError> {
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
            params![id],
            Self::row_to_job,
        )
        .optional()
        .map_err(|e| JobStoreError::Database(e.to_string()))?
        .ok_or_else(|| JobStoreError::NotFound(id.to_string()))
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl JobStore for SqliteJobStore {
    fn create(&self, request: EnqueueRequest) -> Result<Job, JobStoreError> {
        let conn = self.conn.lock().unwrap();

        let now = Utc::now();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            source: request.source,
            destination: request.destination,
            domain: request.domain,
            dry_run: request.dry_run,
            requested_by: request.requested_by,
            state: JobState::Queued,
            bytes_transferred: 0,
            sessions: 0,
            crash_count: 0,
            stall_count: 0,
            rotation_count: 0,
            created_at: now,
            updated_at: now,
        };
        let state_json =
            serde_json::to_string(&job.state).map_err(|e| JobStoreError::Database(e.to_string()))?;

        conn.execute(
            &format!(
                "INSERT INTO jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, 0, 0, 0, ?, ?)",
                JOB_COLUMNS
            ),
            params![
                job.id,
                job.source,
                job.destination,
                job.domain,
                job.dry_run,
                job.requested_by,
                state_json,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| JobStoreError::Database(e.to_string()))?;

        Ok(job)
    }

    fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        let conn = self.conn.lock().unwrap();
        match Self::fetch(&conn, id) {
            Ok(job) => Ok(Some(job)),
            Err(JobStoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let conn = self.conn.lock().unwrap();

        let (where_clause, mut params) = Self::build_where_clause(filter);
        let sql = format!(
            "SELECT {} FROM jobs {} ORDER BY created_at ASC, rowid ASC LIMIT ? OFFSET ?",
            JOB_COLUMNS, where_clause
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| JobStoreError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_job)
            .map_err(|e| JobStoreError::Database(e.to_string()))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| JobStoreError::Database(e.to_string()))
    }

    fn count(&self, filter: &JobFilter) -> Result<i64, JobStoreError> {
        let conn = self.conn.lock().unwrap();

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(|e| JobStoreError::Database(e.to_string()))
    }

    fn update_state(&self, id: &str, state: JobState) -> Result<Job, JobStoreError> {
        let conn = self.conn.lock().unwrap();

        let current = Self::fetch(&conn, id)?;
        if current.state.is_terminal() {
            return Err(JobStoreError::InvalidState {
                job_id: id.to_string(),
                current_state: current.state.state_type().to_string(),
                operation: format!("move to {}", state.state_type()),
            });
        }

        let now = Utc::now();
        let state_json =
            serde_json::to_string(&state).map_err(|e| JobStoreError::Database(e.to_string()))?;
        conn.execute(
            "UPDATE jobs SET state = ?, updated_at = ? WHERE id = ?",
            params![state_json, now.to_rfc3339(), id],
        )
        .map_err(|e| JobStoreError::Database(e.to_string()))?;

        Ok(Job {
            state,
            updated_at: now,
            ..current
        })
    }

    fn add_bytes(&self, id: &str, delta: u64) -> Result<Job, JobStoreError> {
        let conn = self.conn.lock().unwrap();

        let delta = i64::try_from(delta).unwrap_or(i64::MAX);
        let updated = conn
            .execute(
                "UPDATE jobs SET bytes_transferred = bytes_transferred + ?, updated_at = ? WHERE id = ?",
                params![delta, Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| JobStoreError::Database(e.to_string()))?;
        if updated == 0 {
            return Err(JobStoreError::NotFound(id.to_string()));
        }

        Self::fetch(&conn, id)
    }

    fn increment_counter(&self, id: &str, counter: JobCounter) -> Result<Job, JobStoreError> {
        let conn = self.conn.lock().unwrap();

        let column = counter.column();
        let updated = conn
            .execute(
                &format!(
                    "UPDATE jobs SET {column} = {column} + 1, updated_at = ? WHERE id = ?",
                    column = column
                ),
                params![Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| JobStoreError::Database(e.to_string()))?;
        if updated == 0 {
            return Err(JobStoreError::NotFound(id.to_string()));
        }

        Self::fetch(&conn, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(domain: &str) -> EnqueueRequest {
        EnqueueRequest::new("/srv/media", "gdrive:Backup", domain)
    }

    #[test]
    fn test_create_and_get() {
        let store = SqliteJobStore::in_memory().unwrap();
        let job = store
            .create(request("example.com").with_dry_run(true).with_requested_by("admin"))
            .unwrap();

        let fetched = store.get(&job.id).unwrap().unwrap();
        assert_eq!(fetched.state, JobState::Queued);
        assert_eq!(fetched.domain, "example.com");
        assert!(fetched.dry_run);
        assert_eq!(fetched.requested_by, "admin");
        assert_eq!(fetched.bytes_transferred, 0);

        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_oldest_first_with_filters() {
        let store = SqliteJobStore::in_memory().unwrap();
        let first = store.create(request("a.com")).unwrap();
        let second = store.create(request("b.com")).unwrap();
        let third = store.create(request("a.com")).unwrap();
        store
            .update_state(
                &third.id,
                JobState::Failed {
                    reason: "boom".into(),
                    failed_at: Utc::now(),
                },
            )
            .unwrap();

        let all = store.list(&JobFilter::new()).unwrap();
        let ids: Vec<&str> = all.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str(), third.id.as_str()]);

        assert_eq!(store.count(&JobFilter::new().with_domain("a.com")).unwrap(), 2);
        assert_eq!(store.count(&JobFilter::new().with_state("failed")).unwrap(), 1);
        assert_eq!(store.count(&JobFilter::new().runnable()).unwrap(), 2);
        assert_eq!(
            store
                .list(&JobFilter::new().with_limit(1).with_offset(1))
                .unwrap()[0]
                .id,
            second.id
        );
    }

    #[test]
    fn test_excluding_domains() {
        let store = SqliteJobStore::in_memory().unwrap();
        for domain in ["a.com", "a.com", "b.com", "c.com"] {
            store.create(request(domain)).unwrap();
        }

        let rest = store
            .list(&JobFilter::new().excluding_domains(["a.com", "c.com"]))
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].domain, "b.com");
        assert_eq!(
            store
                .count(&JobFilter::new().runnable().excluding_domains(["a.com"]))
                .unwrap(),
            2
        );
    }

    #[test]
    fn test_terminal_state_is_final() {
        let store = SqliteJobStore::in_memory().unwrap();
        let job = store.create(request("example.com")).unwrap();
        store
            .update_state(
                &job.id,
                JobState::Cancelled {
                    reason: "operator".into(),
                    cancelled_at: Utc::now(),
                },
            )
            .unwrap();

        let result = store.update_state(&job.id, JobState::Queued);
        assert!(matches!(result, Err(JobStoreError::InvalidState { .. })));
    }

    #[test]
    fn test_add_bytes_accumulates() {
        let store = SqliteJobStore::in_memory().unwrap();
        let job = store.create(request("example.com")).unwrap();

        store.add_bytes(&job.id, 100).unwrap();
        let updated = store.add_bytes(&job.id, 250).unwrap();
        assert_eq!(updated.bytes_transferred, 350);

        assert!(matches!(
            store.add_bytes("missing", 1),
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_counters() {
        let store = SqliteJobStore::in_memory().unwrap();
        let job = store.create(request("example.com")).unwrap();

        store.increment_counter(&job.id, JobCounter::Crash).unwrap();
        store.increment_counter(&job.id, JobCounter::Crash).unwrap();
        store.increment_counter(&job.id, JobCounter::Stall).unwrap();
        let job = store.increment_counter(&job.id, JobCounter::Rotation).unwrap();

        assert_eq!(job.crash_count, 2);
        assert_eq!(job.stall_count, 1);
        assert_eq!(job.rotation_count, 1);
        assert_eq!(job.sessions, 0);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("isync.db");

        let id = {
            let store = SqliteJobStore::new(&path).unwrap();
            let job = store.create(request("example.com")).unwrap();
            store.add_bytes(&job.id, 42).unwrap();
            job.id
        };

        let reopened = SqliteJobStore::new(&path).unwrap();
        assert_eq!(reopened.get(&id).unwrap().unwrap().bytes_transferred, 42);
    }
}
