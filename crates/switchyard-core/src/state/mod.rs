//! Shared state backends
//!
//! One store holds both session records and supervisor heartbeat records; it
//! is the single source of truth for session ownership. Conditional writes
//! (version check, owner check) are the only cross-process mutual-exclusion
//! primitive in the system, so both live here rather than in callers.

mod memory;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::{StoreBackendKind, StoreConfig};
use crate::directory::SupervisorRecord;
use crate::session::{Session, SessionCounts};
use crate::Result;

/// Storage contract shared by all backends
///
/// Expired sessions are invisible to every read and conditional write,
/// whether or not the reaper has physically removed them yet.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Insert a session if the id is free. Returns `false` when a live session
    /// with the same id already exists; an expired leftover row is replaced.
    async fn insert_session(&self, session: &Session) -> Result<bool>;

    /// Fetch a live session.
    async fn fetch_session(&self, id: &str) -> Result<Option<Session>>;

    /// Persist `session` only while the stored version still equals
    /// `expected_version`. Fails with `Conflict` when another writer got
    /// there first, `SessionNotFound` when the session vanished.
    async fn store_session(&self, session: &Session, expected_version: u64) -> Result<()>;

    /// Remove a session immediately. Returns `false` when absent.
    async fn remove_session(&self, id: &str) -> Result<bool>;

    /// All live sessions for a user, most recently updated first.
    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>>;

    /// Move ownership from `from` to `to` in one conditional step. Fails with
    /// `StillOwned` when the stored owner is no longer `from`, which is how
    /// racing claimants lose.
    async fn transfer_owner(&self, id: &str, from: &str, to: &str) -> Result<Session>;

    /// Drop sessions whose expiry deadline has passed. Returns how many went.
    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Live-session totals by status.
    async fn session_counts(&self) -> Result<SessionCounts>;

    /// Insert or overwrite a supervisor record keyed by its id.
    async fn upsert_supervisor(&self, record: &SupervisorRecord) -> Result<()>;

    /// Every supervisor record, fresh or stale. Callers apply liveness math.
    async fn list_supervisors(&self) -> Result<Vec<SupervisorRecord>>;

    /// Remove one supervisor record. Returns `false` when absent.
    async fn remove_supervisor(&self, id: &str) -> Result<bool>;

    /// Drop supervisor records whose heartbeat predates `cutoff`.
    async fn purge_supervisors(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Open the backend selected by configuration.
pub fn open_backend(config: &StoreConfig) -> Result<Arc<dyn StateBackend>> {
    match config.backend {
        StoreBackendKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackendKind::Sqlite => Ok(Arc::new(SqliteStore::open(&config.path)?)),
    }
}
