//! Supervisor directory
//!
//! Peer liveness built from periodic heartbeats. Liveness math is advisory:
//! a stale heartbeat authorizes a reassignment attempt, but the session
//! store's conditional transfer decides who actually wins.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::state::StateBackend;
use crate::Result;

/// Advertised health of a supervisor instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorStatus {
    #[default]
    Available,
    Degraded,
    Unreachable,
}

/// One supervisor's entry in the shared directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorRecord {
    /// Unique supervisor id
    pub id: String,
    /// Address peers redirect to
    pub address: String,
    /// Self-reported health
    pub status: SupervisorStatus,
    /// In-flight turns over capacity, 0..1
    pub load: f32,
    /// Sessions currently in flight
    pub session_count: u32,
    /// When this record was last published
    pub last_heartbeat: DateTime<Utc>,
}

impl SupervisorRecord {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            status: SupervisorStatus::Available,
            load: 0.0,
            session_count: 0,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_heartbeat
    }
}

/// Directory service over the shared state backend
#[derive(Clone)]
pub struct SupervisorDirectory {
    backend: Arc<dyn StateBackend>,
    liveness: Duration,
}

impl SupervisorDirectory {
    /// `liveness` is the heartbeat age beyond which a supervisor counts as stale
    pub fn new(backend: Arc<dyn StateBackend>, liveness: Duration) -> Self {
        Self { backend, liveness }
    }

    pub fn liveness_threshold(&self) -> Duration {
        self.liveness
    }

    /// Upsert `record` with a fresh timestamp.
    pub async fn publish(&self, record: &SupervisorRecord) -> Result<()> {
        let mut stamped = record.clone();
        stamped.last_heartbeat = Utc::now();
        debug!(
            "heartbeat from {} (load {:.2}, {} sessions)",
            stamped.id, stamped.load, stamped.session_count
        );
        self.backend.upsert_supervisor(&stamped).await
    }

    /// Every record regardless of age, for introspection.
    pub async fn list_all(&self) -> Result<Vec<SupervisorRecord>> {
        self.backend.list_supervisors().await
    }

    /// Supervisors heard from within the liveness window, least loaded first.
    pub async fn list_live(&self) -> Result<Vec<SupervisorRecord>> {
        let now = Utc::now();
        let mut live: Vec<SupervisorRecord> = self
            .backend
            .list_supervisors()
            .await?
            .into_iter()
            .filter(|r| r.heartbeat_age(now) < self.liveness)
            .collect();
        live.sort_by(|a, b| a.load.total_cmp(&b.load));
        Ok(live)
    }

    /// Supervisors whose heartbeat has lapsed; their sessions may be claimed.
    pub async fn detect_stale(&self) -> Result<Vec<SupervisorRecord>> {
        let now = Utc::now();
        Ok(self
            .backend
            .list_supervisors()
            .await?
            .into_iter()
            .filter(|r| r.heartbeat_age(now) >= self.liveness)
            .collect())
    }

    /// Look up a single record.
    pub async fn find(&self, id: &str) -> Result<Option<SupervisorRecord>> {
        Ok(self
            .backend
            .list_supervisors()
            .await?
            .into_iter()
            .find(|r| r.id == id))
    }

    /// Whether `id` has a heartbeat inside the liveness window. A missing
    /// record counts as stale: it stopped beating long enough ago to have
    /// been purged, or never started.
    pub async fn is_live(&self, id: &str) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .find(id)
            .await?
            .map(|r| r.heartbeat_age(now) < self.liveness)
            .unwrap_or(false))
    }

    /// Remove own record on graceful shutdown.
    pub async fn withdraw(&self, id: &str) -> Result<()> {
        if self.backend.remove_supervisor(id).await? {
            info!("withdrew supervisor record {}", id);
        }
        Ok(())
    }

    /// Drop records that stopped heartbeating past the grace horizon.
    pub async fn purge_stale(&self, grace: Duration) -> Result<usize> {
        let cutoff = Utc::now() - grace;
        let purged = self.backend.purge_supervisors(cutoff).await?;
        if purged > 0 {
            info!("purged {} lapsed supervisor records", purged);
        }
        Ok(purged)
    }
}
