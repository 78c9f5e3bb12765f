//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("connection lock poisoned")]
    Poisoned,
}

/// Read side consumed by the scheduler.
pub trait TargetStore: Send + Sync {
    /// Snapshot of every target, unfiltered.
    fn list_targets(&self) -> Result<Vec<TargetRef>, DbError>;
}

/// Write side consumed by the scheduler.
pub trait CheckStore: Send + Sync {
    /// Append a single check row and return its ID.
    fn insert_check(&self, check: &CheckResult) -> Result<i64, DbError>;
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Targets ---

    /// Add a new target and return it with its assigned ID.
    pub fn add_target(&self, url: &str, name: Option<&str>) -> Result<Target, DbError> {
        let created_at = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO targets (url, name, created_at) VALUES (?1, ?2, ?3)",
            params![url, name, format_db_time(&created_at)],
        )?;
        Ok(Target {
            id: conn.last_insert_rowid(),
            url: url.to_string(),
            name: name.map(str::to_string),
            created_at,
        })
    }

    /// Get all targets, newest first.
    pub fn get_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, url, name, created_at FROM targets ORDER BY created_at DESC, id DESC",
        )?;
        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: i64) -> Result<Target, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, url, name, created_at FROM targets WHERE id = ?1",
            params![id],
            target_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a target; its checks go with it.
    pub fn delete_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Checks ---

    /// Each target with its most recent check.
    pub fn latest_statuses(&self) -> Result<Vec<TargetStatus>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.id, t.url, t.name, c.checked_at, c.status_code, c.latency_ms, c.is_up, c.error
             FROM targets t
             LEFT JOIN checks c ON c.id = (
                 SELECT id FROM checks WHERE target_id = t.id
                 ORDER BY checked_at DESC, id DESC LIMIT 1
             )
             ORDER BY t.created_at DESC, t.id DESC",
        )?;

        let statuses = stmt
            .query_map([], |row| {
                let checked_at: Option<String> = row.get(3)?;
                Ok(TargetStatus {
                    id: row.get(0)?,
                    url: row.get(1)?,
                    name: row.get(2)?,
                    checked_at: checked_at.and_then(|s| parse_db_time(&s)),
                    status_code: row.get(4)?,
                    latency_ms: row.get(5)?,
                    reachable: row.get::<_, Option<bool>>(6)?.unwrap_or(false),
                    error: row.get(7)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(statuses)
    }

    /// Get the most recent checks for a target, newest first.
    pub fn recent_checks(&self, target_id: i64, limit: u32) -> Result<Vec<CheckResult>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT target_id, checked_at, status_code, latency_ms, is_up, error FROM checks
             WHERE target_id = ?1 ORDER BY checked_at DESC, id DESC LIMIT ?2",
        )?;

        let checks = stmt
            .query_map(params![target_id, limit], |row| {
                let time_str: String = row.get(1)?;
                Ok(CheckResult {
                    target_id: row.get(0)?,
                    checked_at: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                    status_code: row.get(2)?,
                    latency_ms: row.get(3)?,
                    reachable: row.get(4)?,
                    error: row.get(5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(checks)
    }

    /// Total number of stored checks.
    pub fn count_checks(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM checks", [], |r| r.get(0))?)
    }
}

impl TargetStore for Store {
    fn list_targets(&self) -> Result<Vec<TargetRef>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, url FROM targets")?;
        let targets = stmt
            .query_map([], |row| {
                Ok(TargetRef {
                    id: row.get(0)?,
                    url: row.get(1)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }
}

impl CheckStore for Store {
    fn insert_check(&self, check: &CheckResult) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO checks (target_id, checked_at, status_code, latency_ms, is_up, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                check.target_id,
                format_db_time(&check.checked_at),
                check.status_code,
                check.latency_ms,
                check.reachable,
                check.error.as_deref().filter(|e| !e.is_empty()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

fn target_from_row(row: &Row<'_>) -> SqlResult<Target> {
    let time_str: String = row.get(3)?;
    Ok(Target {
        id: row.get(0)?,
        url: row.get(1)?,
        name: row.get(2)?,
        created_at: parse_db_time(&time_str).unwrap_or_else(Utc::now),
    })
}

fn format_db_time(t: &DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    fn temp_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn check_at(target_id: i64, checked_at: DateTime<Utc>, status: u16) -> CheckResult {
        CheckResult {
            target_id,
            checked_at,
            status_code: Some(status),
            latency_ms: Some(5),
            reachable: is_reachable_status(status),
            error: None,
        }
    }

    #[test]
    fn test_target_crud() {
        let (_tmp, store) = temp_store();

        let target = store.add_target("https://example.com/", Some("Example")).unwrap();
        assert!(target.id > 0);

        let fetched = store.get_target(target.id).unwrap();
        assert_eq!(fetched.url, "https://example.com/");
        assert_eq!(fetched.name.as_deref(), Some("Example"));

        let refs = store.list_targets().unwrap();
        assert_eq!(
            refs,
            vec![TargetRef { id: target.id, url: "https://example.com/".to_string() }]
        );

        store.delete_target(target.id).unwrap();
        assert!(matches!(store.get_target(target.id), Err(DbError::NotFound)));
        assert!(matches!(store.delete_target(target.id), Err(DbError::NotFound)));
    }

    #[test]
    fn test_reopen_existing_database() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = Store::new(tmp.path()).unwrap();
            store.add_target("https://example.com/", None).unwrap();
        }
        let store = Store::new(tmp.path()).unwrap();
        assert_eq!(store.get_targets().unwrap().len(), 1);
    }

    #[test]
    fn test_insert_check_round_trip() {
        let (_tmp, store) = temp_store();
        let target = store.add_target("https://example.com/", None).unwrap();

        let failed = CheckResult::blocked(target.id, "localhost is not allowed");
        store.insert_check(&failed).unwrap();

        let checks = store.recent_checks(target.id, 10).unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].status_code, None);
        assert_eq!(checks[0].latency_ms, None);
        assert!(!checks[0].reachable);
        assert_eq!(checks[0].error.as_deref(), Some("localhost is not allowed"));
        assert_eq!(checks[0].checked_at, failed.checked_at);
    }

    #[test]
    fn test_insert_check_unknown_target_fails() {
        let (_tmp, store) = temp_store();
        let orphan = CheckResult::blocked(42, "missing hostname");
        assert!(store.insert_check(&orphan).is_err());
        assert_eq!(store.count_checks().unwrap(), 0);
    }

    #[test]
    fn test_latest_status_picks_newest_check() {
        let (_tmp, store) = temp_store();
        let checked = store.add_target("https://a.example/", None).unwrap();
        let unchecked = store.add_target("https://b.example/", Some("B")).unwrap();

        let now = Utc::now();
        store.insert_check(&check_at(checked.id, now, 200)).unwrap();
        store
            .insert_check(&check_at(checked.id, now - ChronoDuration::minutes(5), 500))
            .unwrap();

        let statuses = store.latest_statuses().unwrap();
        assert_eq!(statuses.len(), 2);

        let a = statuses.iter().find(|s| s.id == checked.id).unwrap();
        assert!(a.reachable);
        assert_eq!(a.status_code, Some(200));
        assert_eq!(a.checked_at, Some(now));

        let b = statuses.iter().find(|s| s.id == unchecked.id).unwrap();
        assert!(!b.reachable);
        assert_eq!(b.checked_at, None);
        assert_eq!(b.status_code, None);
    }

    #[test]
    fn test_recent_checks_newest_first_and_limited() {
        let (_tmp, store) = temp_store();
        let target = store.add_target("https://example.com/", None).unwrap();
        let now = Utc::now();
        for i in 0..5 {
            store
                .insert_check(&check_at(target.id, now - ChronoDuration::seconds(i), 200))
                .unwrap();
        }

        let checks = store.recent_checks(target.id, 3).unwrap();
        assert_eq!(checks.len(), 3);
        assert_eq!(checks[0].checked_at, now);
        assert!(checks[0].checked_at > checks[1].checked_at);
        assert!(checks[1].checked_at > checks[2].checked_at);
    }

    #[test]
    fn test_delete_target_cascades_checks() {
        let (_tmp, store) = temp_store();
        let target = store.add_target("https://example.com/", None).unwrap();
        store.insert_check(&check_at(target.id, Utc::now(), 200)).unwrap();
        assert_eq!(store.count_checks().unwrap(), 1);

        store.delete_target(target.id).unwrap();
        assert_eq!(store.count_checks().unwrap(), 0);
    }
}
