//! In-memory state backend
//!
//! Used by tests and single-node runs. Holds the same atomicity contract as
//! the SQLite backend: every conditional write performs its check and its
//! mutation under one write lock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::directory::SupervisorRecord;
use crate::session::{Session, SessionCounts};
use crate::state::StateBackend;
use crate::{Error, Result};

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    supervisors: RwLock<HashMap<String, SupervisorRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live(session: &Session, now: DateTime<Utc>) -> bool {
    !session.is_expired(now)
}

#[async_trait]
impl StateBackend for MemoryStore {
    async fn insert_session(&self, session: &Session) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let now = Utc::now();
        if let Some(existing) = sessions.get(&session.id) {
            if live(existing, now) {
                return Ok(false);
            }
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(true)
    }

    async fn fetch_session(&self, id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(id)
            .filter(|s| live(s, Utc::now()))
            .cloned())
    }

    async fn store_session(&self, session: &Session, expected_version: u64) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let now = Utc::now();
        match sessions.get(&session.id) {
            Some(existing) if live(existing, now) => {
                if existing.version != expected_version {
                    return Err(Error::Conflict(session.id.clone()));
                }
                sessions.insert(session.id.clone(), session.clone());
                Ok(())
            }
            _ => Err(Error::SessionNotFound(session.id.clone())),
        }
    }

    async fn remove_session(&self, id: &str) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.remove(id).is_some())
    }

    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let now = Utc::now();
        let mut result: Vec<Session> = sessions
            .values()
            .filter(|s| s.user_id.as_deref() == Some(user_id) && live(s, now))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(result)
    }

    async fn transfer_owner(&self, id: &str, from: &str, to: &str) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let now = Utc::now();
        let session = sessions
            .get_mut(id)
            .filter(|s| live(s, now))
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

        if session.owner_id != from {
            return Err(Error::StillOwned(id.to_string(), session.owner_id.clone()));
        }
        session.owner_id = to.to_string();
        session.version += 1;
        session.updated_at = now;
        Ok(session.clone())
    }

    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| live(s, now));
        Ok(before - sessions.len())
    }

    async fn session_counts(&self) -> Result<SessionCounts> {
        let sessions = self.sessions.read().await;
        let now = Utc::now();
        let mut counts = SessionCounts::default();
        for session in sessions.values().filter(|s| live(s, now)) {
            counts.add(session.status);
        }
        Ok(counts)
    }

    async fn upsert_supervisor(&self, record: &SupervisorRecord) -> Result<()> {
        let mut supervisors = self.supervisors.write().await;
        supervisors.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn list_supervisors(&self) -> Result<Vec<SupervisorRecord>> {
        let supervisors = self.supervisors.read().await;
        Ok(supervisors.values().cloned().collect())
    }

    async fn remove_supervisor(&self, id: &str) -> Result<bool> {
        let mut supervisors = self.supervisors.write().await;
        Ok(supervisors.remove(id).is_some())
    }

    async fn purge_supervisors(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut supervisors = self.supervisors.write().await;
        let before = supervisors.len();
        supervisors.retain(|_, r| r.last_heartbeat >= cutoff);
        Ok(before - supervisors.len())
    }
}
