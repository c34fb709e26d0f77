//! Session store service
//!
//! Thin orchestration over a [`StateBackend`]: id generation, idempotent
//! creation, TTL refresh, and the conditional ownership transfer used during
//! failover. Deliberately cache-free: ownership moves between processes, so
//! the backend is always consulted.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::session::{Session, SessionCounts};
use crate::state::StateBackend;
use crate::{Error, Result};

#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn StateBackend>,
    ttl: Duration,
}

impl SessionStore {
    /// Create a store with the given default session TTL
    pub fn new(backend: Arc<dyn StateBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create a session, or return the existing one when the id is taken.
    ///
    /// Retried requests carrying an explicit id therefore cannot produce
    /// duplicate sessions.
    pub async fn create_session(
        &self,
        id: Option<String>,
        user_id: Option<String>,
        owner: &str,
    ) -> Result<Session> {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        for _ in 0..3 {
            let candidate = Session::new(&id, user_id.clone(), owner, self.ttl);
            if self.backend.insert_session(&candidate).await? {
                info!("created session {} owned by {}", id, owner);
                return Ok(candidate);
            }
            // Someone beat us to the id; hand back theirs
            if let Some(existing) = self.backend.fetch_session(&id).await? {
                debug!("session {} already exists, returning it", id);
                return Ok(existing);
            }
            // The existing row expired between insert and fetch; go again
        }

        Err(Error::StoreUnavailable(format!(
            "session {id} could neither be created nor fetched"
        )))
    }

    /// Fetch a session without refreshing its TTL.
    pub async fn get_session(&self, id: &str) -> Result<Session> {
        self.backend
            .fetch_session(id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Like `get_session`, but absence is an answer rather than an error.
    pub async fn find_session(&self, id: &str) -> Result<Option<Session>> {
        self.backend.fetch_session(id).await
    }

    /// Atomic read-modify-write, preconditioned on ownership.
    ///
    /// The mutation is applied to a fresh read of the session, and the write
    /// only lands while `owner` still holds the session and the version is
    /// unchanged; otherwise `Conflict` comes back and the caller decides
    /// whether to retry. A reassignment bumps the version, so a takeover
    /// racing this call is caught on whichever side of the read it lands.
    /// Success refreshes the TTL.
    pub async fn update_session<F>(&self, id: &str, owner: &str, mutate: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut session = self.get_session(id).await?;
        if session.owner_id != owner {
            warn!(
                "session {} now owned by {}, refusing write from {}",
                id, session.owner_id, owner
            );
            return Err(Error::Conflict(id.to_string()));
        }
        let expected = session.version;

        mutate(&mut session);
        session.version = expected + 1;
        session.touch(self.ttl);

        self.backend.store_session(&session, expected).await?;
        Ok(session)
    }

    /// Remove a session immediately, TTL notwithstanding.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        if self.backend.remove_session(id).await? {
            info!("deleted session {}", id);
            Ok(())
        } else {
            Err(Error::SessionNotFound(id.to_string()))
        }
    }

    /// All live sessions for a user, most recently updated first.
    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<Session>> {
        self.backend.sessions_for_user(user_id).await
    }

    /// Claim a session from a supervisor believed dead.
    ///
    /// The caller confirms staleness through the directory first; this call is
    /// the arbiter. Exactly one of any number of racing claimants succeeds,
    /// the rest see `StillOwned` with the winner's id.
    pub async fn reassign_owner(
        &self,
        id: &str,
        stale_owner: &str,
        new_owner: &str,
    ) -> Result<Session> {
        match self.backend.transfer_owner(id, stale_owner, new_owner).await {
            Ok(session) => {
                info!(
                    "session {} reassigned from {} to {}",
                    id, stale_owner, new_owner
                );
                Ok(session)
            }
            Err(Error::StillOwned(id, current)) => {
                warn!("session {} already claimed by {}", id, current);
                Err(Error::StillOwned(id, current))
            }
            Err(e) => Err(e),
        }
    }

    /// Reaper hook: drop sessions past their expiry deadline.
    pub async fn purge_expired(&self) -> Result<usize> {
        let purged = self.backend.purge_expired_sessions(Utc::now()).await?;
        if purged > 0 {
            info!("purged {} expired sessions", purged);
        }
        Ok(purged)
    }

    /// Live-session totals by status.
    pub async fn stats(&self) -> Result<SessionCounts> {
        self.backend.session_counts().await
    }
}
