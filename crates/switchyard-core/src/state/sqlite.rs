//! SQLite state backend
//!
//! Every supervisor in a deployment points at the same database file, so the
//! version and owner checks ride on SQL conditional updates rather than any
//! in-process lock. Timestamps are stored as fixed-width RFC 3339 text
//! (microsecond precision, Z suffix) so string comparison matches time order.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use async_trait::async_trait;

use crate::directory::{SupervisorRecord, SupervisorStatus};
use crate::session::{Session, SessionCounts, SessionStatus};
use crate::state::StateBackend;
use crate::{Error, Result};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the shared database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        // Multiple supervisor processes share this file
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::init_tables(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_tables(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                turns TEXT NOT NULL,
                variables TEXT NOT NULL,
                status TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS supervisors (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                status TEXT NOT NULL,
                load REAL NOT NULL,
                session_count INTEGER NOT NULL,
                last_heartbeat TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }
}

fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

fn session_status_to_sql(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Completed => "completed",
        SessionStatus::Error => "error",
    }
}

fn session_status_from_sql(s: &str) -> SessionStatus {
    match s {
        "completed" => SessionStatus::Completed,
        "error" => SessionStatus::Error,
        _ => SessionStatus::Active,
    }
}

fn supervisor_status_to_sql(status: SupervisorStatus) -> &'static str {
    match status {
        SupervisorStatus::Available => "available",
        SupervisorStatus::Degraded => "degraded",
        SupervisorStatus::Unreachable => "unreachable",
    }
}

fn supervisor_status_from_sql(s: &str) -> SupervisorStatus {
    match s {
        "degraded" => SupervisorStatus::Degraded,
        "unreachable" => SupervisorStatus::Unreachable,
        _ => SupervisorStatus::Available,
    }
}

const SESSION_COLUMNS: &str =
    "id, user_id, turns, variables, status, owner_id, version, created_at, updated_at, expires_at";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let turns_json: String = row.get(2)?;
    let variables_json: String = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    let expires_at: String = row.get(9)?;

    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        turns: serde_json::from_str(&turns_json).map_err(|_| rusqlite::Error::InvalidQuery)?,
        variables: serde_json::from_str(&variables_json)
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        status: session_status_from_sql(&status),
        owner_id: row.get(5)?,
        version: row.get::<_, i64>(6)? as u64,
        created_at: ts_from_sql(&created_at)?,
        updated_at: ts_from_sql(&updated_at)?,
        expires_at: ts_from_sql(&expires_at)?,
    })
}

fn row_to_supervisor(row: &rusqlite::Row<'_>) -> rusqlite::Result<SupervisorRecord> {
    let status: String = row.get(2)?;
    let last_heartbeat: String = row.get(5)?;

    Ok(SupervisorRecord {
        id: row.get(0)?,
        address: row.get(1)?,
        status: supervisor_status_from_sql(&status),
        load: row.get::<_, f64>(3)? as f32,
        session_count: row.get::<_, i64>(4)? as u32,
        last_heartbeat: ts_from_sql(&last_heartbeat)?,
    })
}

#[async_trait]
impl StateBackend for SqliteStore {
    async fn insert_session(&self, session: &Session) -> Result<bool> {
        let conn = self.conn.lock().await;
        let now = ts_to_sql(Utc::now());

        // Clear an expired leftover row first so the id can be reused
        conn.execute(
            "DELETE FROM sessions WHERE id = ?1 AND expires_at <= ?2",
            params![session.id, now],
        )?;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sessions
             (id, user_id, turns, variables, status, owner_id, version, created_at, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.id,
                session.user_id,
                serde_json::to_string(&session.turns)?,
                serde_json::to_string(&session.variables)?,
                session_status_to_sql(session.status),
                session.owner_id,
                session.version as i64,
                ts_to_sql(session.created_at),
                ts_to_sql(session.updated_at),
                ts_to_sql(session.expires_at),
            ],
        )?;
        Ok(inserted == 1)
    }

    async fn fetch_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().await;
        let now = ts_to_sql(Utc::now());
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1 AND expires_at > ?2"
        ))?;

        match stmt.query_row(params![id, now], row_to_session) {
            Ok(session) => Ok(Some(session)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn store_session(&self, session: &Session, expected_version: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = ts_to_sql(Utc::now());
        let changed = conn.execute(
            "UPDATE sessions
             SET user_id = ?2, turns = ?3, variables = ?4, status = ?5, owner_id = ?6,
                 version = ?7, updated_at = ?8, expires_at = ?9
             WHERE id = ?1 AND version = ?10 AND expires_at > ?11",
            params![
                session.id,
                session.user_id,
                serde_json::to_string(&session.turns)?,
                serde_json::to_string(&session.variables)?,
                session_status_to_sql(session.status),
                session.owner_id,
                session.version as i64,
                ts_to_sql(session.updated_at),
                ts_to_sql(session.expires_at),
                expected_version as i64,
                now,
            ],
        )?;
        if changed == 1 {
            return Ok(());
        }

        // Distinguish a lost race from a vanished session
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE id = ?1 AND expires_at > ?2",
            params![session.id, now],
            |row| row.get::<_, i64>(0).map(|n| n > 0),
        )?;
        if exists {
            Err(Error::Conflict(session.id.clone()))
        } else {
            Err(Error::SessionNotFound(session.id.clone()))
        }
    }

    async fn remove_session(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let conn = self.conn.lock().await;
        let now = ts_to_sql(Utc::now());
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE user_id = ?1 AND expires_at > ?2 ORDER BY updated_at DESC"
        ))?;

        let rows = stmt.query_map(params![user_id, now], row_to_session)?;
        let mut result = Vec::new();
        for session in rows {
            result.push(session?);
        }
        Ok(result)
    }

    async fn transfer_owner(&self, id: &str, from: &str, to: &str) -> Result<Session> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let now_sql = ts_to_sql(now);
        let changed = conn.execute(
            "UPDATE sessions
             SET owner_id = ?3, version = version + 1, updated_at = ?4
             WHERE id = ?1 AND owner_id = ?2 AND expires_at > ?5",
            params![id, from, to, now_sql, now_sql],
        )?;

        if changed == 1 {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
            ))?;
            return stmt
                .query_row(params![id], row_to_session)
                .map_err(Error::from);
        }

        let owner: Option<String> = match conn.query_row(
            "SELECT owner_id FROM sessions WHERE id = ?1 AND expires_at > ?2",
            params![id, now_sql],
            |row| row.get(0),
        ) {
            Ok(owner) => Some(owner),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(Error::from(e)),
        };

        match owner {
            Some(current) => Err(Error::StillOwned(id.to_string(), current)),
            None => Err(Error::SessionNotFound(id.to_string())),
        }
    }

    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let purged = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            params![ts_to_sql(now)],
        )?;
        Ok(purged)
    }

    async fn session_counts(&self) -> Result<SessionCounts> {
        let conn = self.conn.lock().await;
        let now = ts_to_sql(Utc::now());
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM sessions WHERE expires_at > ?1 GROUP BY status",
        )?;

        let rows = stmt.query_map(params![now], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = SessionCounts::default();
        for row in rows {
            let (status, n) = row?;
            counts.add_many(session_status_from_sql(&status), n as u64);
        }
        Ok(counts)
    }

    async fn upsert_supervisor(&self, record: &SupervisorRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO supervisors
             (id, address, status, load, session_count, last_heartbeat)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.address,
                supervisor_status_to_sql(record.status),
                record.load as f64,
                record.session_count as i64,
                ts_to_sql(record.last_heartbeat),
            ],
        )?;
        Ok(())
    }

    async fn list_supervisors(&self) -> Result<Vec<SupervisorRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, address, status, load, session_count, last_heartbeat FROM supervisors",
        )?;

        let rows = stmt.query_map([], row_to_supervisor)?;
        let mut result = Vec::new();
        for record in rows {
            result.push(record?);
        }
        Ok(result)
    }

    async fn remove_supervisor(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM supervisors WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    async fn purge_supervisors(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let purged = conn.execute(
            "DELETE FROM supervisors WHERE last_heartbeat < ?1",
            params![ts_to_sql(cutoff)],
        )?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Turn;
    use chrono::Duration;

    fn session(id: &str, owner: &str) -> Session {
        Session::new(id, Some("user-1".to_string()), owner, Duration::seconds(60))
    }

    #[tokio::test]
    async fn test_insert_and_fetch_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let mut s = session("s-1", "sup-a");
        s.push_turn(Turn::user("am I free tomorrow?"));
        s.variables
            .insert("events".to_string(), serde_json::json!(["standup"]));

        assert!(store.insert_session(&s).await.unwrap());
        let loaded = store.fetch_session("s-1").await.unwrap().unwrap();
        assert_eq!(loaded.owner_id, "sup-a");
        assert_eq!(loaded.turn_count(), 1);
        assert_eq!(loaded.variables.get("events"), Some(&serde_json::json!(["standup"])));
    }

    #[tokio::test]
    async fn test_insert_preserves_existing_row() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.insert_session(&session("s-1", "sup-a")).await.unwrap());
        assert!(!store.insert_session(&session("s-1", "sup-b")).await.unwrap());
        let found = store.fetch_session("s-1").await.unwrap().unwrap();
        assert_eq!(found.owner_id, "sup-a");
    }

    #[tokio::test]
    async fn test_versioned_update_conflict() {
        let store = SqliteStore::in_memory().unwrap();
        let s = session("s-1", "sup-a");
        store.insert_session(&s).await.unwrap();

        let mut winner = s.clone();
        winner.push_turn(Turn::user("first"));
        winner.version = 2;
        store.store_session(&winner, 1).await.unwrap();

        let mut loser = s.clone();
        loser.push_turn(Turn::user("second"));
        loser.version = 2;
        let err = store.store_session(&loser, 1).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // the winner's turn is the one that stuck
        let stored = store.fetch_session("s-1").await.unwrap().unwrap();
        assert_eq!(stored.turns[0].text, "first");
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_transfer_owner_race() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_session(&session("s-1", "sup-a")).await.unwrap();

        let claimed = store.transfer_owner("s-1", "sup-a", "sup-b").await.unwrap();
        assert_eq!(claimed.owner_id, "sup-b");
        assert_eq!(claimed.version, 2);

        let err = store.transfer_owner("s-1", "sup-a", "sup-c").await.unwrap_err();
        assert!(matches!(err, Error::StillOwned(_, ref owner) if owner == "sup-b"));
    }

    #[tokio::test]
    async fn test_expired_sessions_are_invisible() {
        let store = SqliteStore::in_memory().unwrap();
        let expired = Session::new("s-1", Some("user-1".to_string()), "sup-a", Duration::seconds(-5));
        store.insert_session(&expired).await.unwrap();

        assert!(store.fetch_session("s-1").await.unwrap().is_none());
        assert!(store.sessions_for_user("user-1").await.unwrap().is_empty());
        assert_eq!(store.purge_expired_sessions(Utc::now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_two_handles_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.db");

        let store_a = SqliteStore::open(&path).unwrap();
        let store_b = SqliteStore::open(&path).unwrap();

        store_a.insert_session(&session("s-1", "sup-a")).await.unwrap();
        let seen = store_b.fetch_session("s-1").await.unwrap().unwrap();
        assert_eq!(seen.owner_id, "sup-a");

        // ownership transferred through one handle is visible through the other
        store_b.transfer_owner("s-1", "sup-a", "sup-b").await.unwrap();
        let seen = store_a.fetch_session("s-1").await.unwrap().unwrap();
        assert_eq!(seen.owner_id, "sup-b");
    }

    #[tokio::test]
    async fn test_supervisor_table() {
        let store = SqliteStore::in_memory().unwrap();
        let mut record = SupervisorRecord::new("sup-a", "127.0.0.1:8080");
        record.load = 0.5;
        record.session_count = 25;
        store.upsert_supervisor(&record).await.unwrap();

        let listed = store.list_supervisors().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_count, 25);
        assert!((listed[0].load - 0.5).abs() < f32::EPSILON);

        assert_eq!(
            store.purge_supervisors(Utc::now() + Duration::seconds(1)).await.unwrap(),
            1
        );
    }
}
