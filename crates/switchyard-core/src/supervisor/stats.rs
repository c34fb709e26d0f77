//! Aggregate statistics snapshot

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agent::AgentCounts;
use crate::directory::SupervisorRecord;
use crate::session::SessionCounts;

/// One observability snapshot: sessions by status, agents by status, and the
/// directory as this supervisor currently sees it.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    /// Supervisor that produced the snapshot
    pub supervisor_id: String,
    /// Turns executing on that supervisor right now
    pub in_flight: u32,
    pub sessions: SessionCounts,
    pub agents: AgentCounts,
    pub supervisors: Vec<SupervisorRecord>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_serialize_shape() {
        let stats = SystemStats {
            supervisor_id: "sup-1".to_string(),
            in_flight: 2,
            sessions: SessionCounts::default(),
            agents: AgentCounts::default(),
            supervisors: vec![],
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["supervisor_id"], "sup-1");
        assert_eq!(json["in_flight"], 2);
        assert!(json["sessions"].is_object());
        assert!(json["agents"].is_object());
    }
}
