//! Session types

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a conversation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Error,
}

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

/// One entry in the ordered conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    /// Which agent answered; None for user turns
    pub agent: Option<String>,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
            agent: None,
            at: Utc::now(),
        }
    }

    pub fn agent(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Agent,
            text: text.into(),
            agent: Some(name.into()),
            at: Utc::now(),
        }
    }
}

/// Represents one ongoing conversation, owned by exactly one supervisor
///
/// The `version` counter backs optimistic concurrency: every successful write
/// through the store bumps it, and writers must present the version they read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier
    pub id: String,
    /// User the conversation belongs to, when known
    pub user_id: Option<String>,
    /// Ordered conversation history
    pub turns: Vec<Turn>,
    /// Arbitrary conversation state maintained by agents
    pub variables: HashMap<String, serde_json::Value>,
    /// Session lifecycle status
    pub status: SessionStatus,
    /// Supervisor currently holding the write lease
    pub owner_id: String,
    /// Optimistic concurrency counter
    pub version: u64,
    /// Session creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
    /// Absolute expiry deadline, refreshed on each successful turn
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session owned by `owner`, expiring after `ttl` of inactivity
    pub fn new(id: impl Into<String>, user_id: Option<String>, owner: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id,
            turns: Vec::new(),
            variables: HashMap::new(),
            status: SessionStatus::Active,
            owner_id: owner.into(),
            version: 1,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Create a session with a generated id
    pub fn generate(user_id: Option<String>, owner: impl Into<String>, ttl: Duration) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), user_id, owner, ttl)
    }

    /// Append a turn to the history
    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.updated_at = Utc::now();
    }

    /// Merge agent-provided state into the session variables
    pub fn merge_variables(&mut self, variables: HashMap<String, serde_json::Value>) {
        self.variables.extend(variables);
    }

    /// Refresh activity timestamps, pushing expiry out by `ttl`
    pub fn touch(&mut self, ttl: Duration) {
        let now = Utc::now();
        self.updated_at = now;
        self.expires_at = now + ttl;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Get turn count
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }
}

/// Live-session totals by status, for introspection surfaces
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionCounts {
    pub total: u64,
    pub active: u64,
    pub completed: u64,
    pub error: u64,
}

impl SessionCounts {
    pub fn add(&mut self, status: SessionStatus) {
        self.add_many(status, 1);
    }

    pub fn add_many(&mut self, status: SessionStatus, n: u64) {
        self.total += n;
        match status {
            SessionStatus::Active => self.active += n,
            SessionStatus::Completed => self.completed += n,
            SessionStatus::Error => self.error += n,
        }
    }
}
