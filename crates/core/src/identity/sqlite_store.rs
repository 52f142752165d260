//! SQLite-backed identity store implementation.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{Identity, IdentityFilter, IdentityState, IdentityStore, IdentityStoreError};

const SELECT_COLUMNS: &str = "SELECT handle, domain, state, cumulative_bytes, window_started_at, created_at, updated_at, failure_reason FROM identities";

/// SQLite-backed identity store.
pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
    /// Create a new SQLite identity store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, IdentityStoreError> {
        let conn =
            Connection::open(path).map_err(|e| IdentityStoreError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite identity store (useful for testing).
    pub fn in_memory() -> Result<Self, IdentityStoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| IdentityStoreError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), IdentityStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS identities (
                handle TEXT PRIMARY KEY,
                domain TEXT NOT NULL,
                state TEXT NOT NULL,
                cumulative_bytes INTEGER NOT NULL DEFAULT 0,
                window_started_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                failure_reason TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_identities_domain ON identities(domain);
            CREATE INDEX IF NOT EXISTS idx_identities_state ON identities(state);
            "#,
        )
        .map_err(|e| IdentityStoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn row_to_identity(row: &rusqlite::Row) -> rusqlite::Result<Identity> {
        let handle: String = row.get(0)?;
        let domain: String = row.get(1)?;
        let state_str: String = row.get(2)?;
        let cumulative_bytes: i64 = row.get(3)?;
        let window_started_at: String = row.get(4)?;
        let created_at: String = row.get(5)?;
        let updated_at: String = row.get(6)?;
        let failure_reason: Option<String> = row.get(7)?;

        // An unreadable state is treated as failed so it never gets handed out.
        let state = state_str
            .parse::<IdentityState>()
            .unwrap_or(IdentityState::Failed);

        Ok(Identity {
            handle,
            domain,
            state,
            cumulative_bytes: cumulative_bytes.max(0) as u64,
            window_started_at: parse_timestamp(&window_started_at),
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
            failure_reason,
        })
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn db_err(e: rusqlite::Error) -> IdentityStoreError {
    IdentityStoreError::Database(e.to_string())
}

impl IdentityStore for SqliteIdentityStore {
    fn insert(&self, identity: &Identity) -> Result<(), IdentityStoreError> {
        let conn = self.conn.lock().unwrap();

        let result = conn.execute(
            "INSERT INTO identities (handle, domain, state, cumulative_bytes, window_started_at, created_at, updated_at, failure_reason) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                identity.handle,
                identity.domain,
                identity.state.as_str(),
                identity.cumulative_bytes as i64,
                identity.window_started_at.to_rfc3339(),
                identity.created_at.to_rfc3339(),
                identity.updated_at.to_rfc3339(),
                identity.failure_reason,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(IdentityStoreError::Duplicate(identity.handle.clone()))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    fn get(&self, handle: &str) -> Result<Option<Identity>, IdentityStoreError> {
        let conn = self.conn.lock().unwrap();

        let result = conn.query_row(
            &format!("{} WHERE handle = ?", SELECT_COLUMNS),
            params![handle],
            Self::row_to_identity,
        );

        match result {
            Ok(identity) => Ok(Some(identity)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    fn list(&self, filter: &IdentityFilter) -> Result<Vec<Identity>, IdentityStoreError> {
        let conn = self.conn.lock().unwrap();

        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref domain) = filter.domain {
            conditions.push("domain = ?".to_string());
            params.push(Box::new(domain.clone()));
        }

        if !filter.states.is_empty() {
            let placeholders = vec!["?"; filter.states.len()].join(", ");
            conditions.push(format!("state IN ({})", placeholders));
            for state in &filter.states {
                params.push(Box::new(state.as_str()));
            }
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "{} {} ORDER BY created_at ASC, handle ASC",
            SELECT_COLUMNS, where_clause
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_identity)
            .map_err(db_err)?;

        let mut identities = Vec::new();
        for row in rows {
            identities.push(row.map_err(db_err)?);
        }

        Ok(identities)
    }

    fn update(&self, identity: &Identity) -> Result<(), IdentityStoreError> {
        let conn = self.conn.lock().unwrap();

        let changed = conn
            .execute(
                "UPDATE identities SET domain = ?, state = ?, cumulative_bytes = ?, window_started_at = ?, updated_at = ?, failure_reason = ? WHERE handle = ?",
                params![
                    identity.domain,
                    identity.state.as_str(),
                    identity.cumulative_bytes as i64,
                    identity.window_started_at.to_rfc3339(),
                    identity.updated_at.to_rfc3339(),
                    identity.failure_reason,
                    identity.handle,
                ],
            )
            .map_err(db_err)?;

        if changed == 0 {
            return Err(IdentityStoreError::NotFound(identity.handle.clone()));
        }

        Ok(())
    }

    fn delete(&self, handle: &str) -> Result<bool, IdentityStoreError> {
        let conn = self.conn.lock().unwrap();

        let changed = conn
            .execute("DELETE FROM identities WHERE handle = ?", params![handle])
            .map_err(db_err)?;

        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> SqliteIdentityStore {
        SqliteIdentityStore::in_memory().unwrap()
    }

    fn identity(handle: &str, domain: &str, state: IdentityState) -> Identity {
        let mut identity = Identity::new(handle, domain, Utc::now());
        identity.state = state;
        identity
    }

    #[test]
    fn test_insert_and_get() {
        let store = store();
        let mut original = identity("a@example.com", "example.com", IdentityState::Active);
        original.cumulative_bytes = 12_345_678_901;

        store.insert(&original).unwrap();
        let fetched = store.get("a@example.com").unwrap().unwrap();

        assert_eq!(fetched.handle, original.handle);
        assert_eq!(fetched.state, IdentityState::Active);
        assert_eq!(fetched.cumulative_bytes, 12_345_678_901);
        assert!(store.get("missing@example.com").unwrap().is_none());
    }

    #[test]
    fn test_insert_duplicate() {
        let store = store();
        let record = identity("a@example.com", "example.com", IdentityState::Active);
        store.insert(&record).unwrap();

        let result = store.insert(&record);
        assert!(matches!(result, Err(IdentityStoreError::Duplicate(_))));
    }

    #[test]
    fn test_update_persists_counters_and_state() {
        let store = store();
        let mut record = identity("a@example.com", "example.com", IdentityState::Active);
        store.insert(&record).unwrap();

        record.cumulative_bytes = 500;
        record.state = IdentityState::Failed;
        record.failure_reason = Some("auth revoked".to_string());
        store.update(&record).unwrap();

        let fetched = store.get("a@example.com").unwrap().unwrap();
        assert_eq!(fetched.cumulative_bytes, 500);
        assert_eq!(fetched.state, IdentityState::Failed);
        assert_eq!(fetched.failure_reason.as_deref(), Some("auth revoked"));
    }

    #[test]
    fn test_update_missing() {
        let store = store();
        let record = identity("ghost@example.com", "example.com", IdentityState::Active);
        assert!(matches!(
            store.update(&record),
            Err(IdentityStoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_filters_and_orders() {
        let store = store();
        let base = Utc::now();

        let mut first = identity("b@example.com", "example.com", IdentityState::Active);
        first.created_at = base - Duration::minutes(10);
        let mut second = identity("a@example.com", "example.com", IdentityState::Retired);
        second.created_at = base - Duration::minutes(5);
        let third = identity("c@other.org", "other.org", IdentityState::Active);

        for record in [&first, &second, &third] {
            store.insert(record).unwrap();
        }

        let all = store.list(&IdentityFilter::new()).unwrap();
        assert_eq!(all.len(), 3);

        let example = store
            .list(&IdentityFilter::new().with_domain("example.com"))
            .unwrap();
        assert_eq!(example.len(), 2);
        assert_eq!(example[0].handle, "b@example.com");

        let live = store
            .list(&IdentityFilter::new().with_domain("example.com").live())
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].handle, "b@example.com");
    }

    #[test]
    fn test_delete() {
        let store = store();
        let record = identity("a@example.com", "example.com", IdentityState::Retired);
        store.insert(&record).unwrap();

        assert!(store.delete("a@example.com").unwrap());
        assert!(!store.delete("a@example.com").unwrap());
        assert!(store.get("a@example.com").unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.db");

        {
            let store = SqliteIdentityStore::new(&path).unwrap();
            let mut record = identity("a@example.com", "example.com", IdentityState::Active);
            record.cumulative_bytes = 42;
            store.insert(&record).unwrap();
        }

        let reopened = SqliteIdentityStore::new(&path).unwrap();
        let fetched = reopened.get("a@example.com").unwrap().unwrap();
        assert_eq!(fetched.cumulative_bytes, 42);
    }
}
