//! Agent types and trait definitions
//!
//! Defines the core types for capability-routed agents:
//! - Agent trait: uniform invoke/stream contract for handler bodies
//! - AgentDescriptor: fixed-shape metadata owned by the registry
//! - AgentReply / StateFragment: what a handler returns to the supervisor

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::session::Turn;
use crate::Result;

/// Lifecycle status of a registered agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
    Degraded,
}

/// Per-agent configuration with a closed set of recognized fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// IANA timezone the handler should assume for date phrases
    pub timezone: Option<String>,

    /// Endpoint of the external service the handler talks to
    pub endpoint: Option<String>,

    /// Timeout for the handler's own outbound calls, in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Metadata describing a registered agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Capability tags this agent serves; never empty
    pub capabilities: BTreeSet<String>,
    /// Current lifecycle status
    #[serde(default)]
    pub status: AgentStatus,
    /// Implementation version
    pub version: String,
    /// External services the handler depends on
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Handler configuration
    #[serde(default)]
    pub config: AgentConfig,
}

impl AgentDescriptor {
    /// Create a descriptor with default version and empty capability set.
    /// Callers add capabilities before registering.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            capabilities: BTreeSet::new(),
            status: AgentStatus::Active,
            version: "1.0.0".to_string(),
            dependencies: vec![],
            config: AgentConfig::default(),
        }
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.insert(tag.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Whether this agent serves every tag in `required`.
    pub fn covers(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// Runtime counters co-located with a descriptor
#[derive(Debug, Clone, Serialize)]
pub struct AgentRuntimeStats {
    /// Dispatches currently executing
    pub in_flight: u32,
    /// Total completed dispatches
    pub dispatches: u64,
    /// Last observed liveness signal
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRuntimeStats {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            in_flight: 0,
            dispatches: 0,
            last_heartbeat: now,
        }
    }
}

/// Everything a handler sees for one turn: the new message plus a
/// snapshot of the conversation state it may read
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub message: String,
    pub user_id: Option<String>,
    pub history: Vec<Turn>,
    pub variables: HashMap<String, serde_json::Value>,
}

impl AgentRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user_id: None,
            history: vec![],
            variables: HashMap::new(),
        }
    }
}

/// Key/value updates a handler wants merged into the session state
#[derive(Debug, Clone, Default)]
pub struct StateFragment {
    pub variables: HashMap<String, serde_json::Value>,
}

impl StateFragment {
    pub fn set(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

/// A handler's answer for one turn
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// User-facing reply text
    pub text: String,
    /// State updates to persist alongside the turn
    pub state: StateFragment,
}

impl AgentReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            state: StateFragment::default(),
        }
    }

    pub fn with_state(mut self, state: StateFragment) -> Self {
        self.state = state;
        self
    }
}

/// Handler body behind a registered descriptor
///
/// Implementations may call arbitrary external services; the supervisor only
/// relies on this contract and applies its own timeout around `invoke`.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Execute one turn against a state snapshot.
    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply>;

    /// Cheap liveness probe, polled on the runtime tick. Handlers that lose
    /// a backing resource report false and stop receiving heartbeats until
    /// they recover.
    fn healthy(&self) -> bool {
        true
    }

    /// Streaming variant: push partial output through `chunks`, then return
    /// the complete reply. The default implementation emits the final text as
    /// a single chunk. A closed receiver means the caller has gone away and
    /// the handler should stop early.
    async fn invoke_stream(
        &self,
        request: AgentRequest,
        chunks: mpsc::Sender<String>,
    ) -> Result<AgentReply> {
        let reply = self.invoke(request).await?;
        if !reply.text.is_empty() {
            let _ = chunks.send(reply.text.clone()).await;
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder() {
        let desc = AgentDescriptor::new("availability-checker", "Checks calendar availability")
            .with_capability("calendar-read")
            .with_version("2.0.0")
            .with_dependency("calendar-provider");

        assert_eq!(desc.name, "availability-checker");
        assert_eq!(desc.status, AgentStatus::Active);
        assert_eq!(desc.version, "2.0.0");
        assert!(desc.capabilities.contains("calendar-read"));
        assert_eq!(desc.dependencies, vec!["calendar-provider".to_string()]);
    }

    #[test]
    fn test_descriptor_covers_subset() {
        let desc = AgentDescriptor::new("scheduler", "Creates events")
            .with_capabilities(["event-create", "calendar-read"]);

        let mut required = BTreeSet::new();
        required.insert("event-create".to_string());
        assert!(desc.covers(&required));

        required.insert("calendar-read".to_string());
        assert!(desc.covers(&required));

        required.insert("event-delete".to_string());
        assert!(!desc.covers(&required));
    }

    #[test]
    fn test_agent_config_rejects_unknown_fields() {
        let good: std::result::Result<AgentConfig, _> =
            serde_json::from_str(r#"{"timezone": "Asia/Colombo"}"#);
        assert!(good.is_ok());

        let bad: std::result::Result<AgentConfig, _> =
            serde_json::from_str(r#"{"timezone": "UTC", "api_secret": "x"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_reply_with_state() {
        let reply = AgentReply::text("done").with_state(
            StateFragment::default().set("events", serde_json::json!(["standup"])),
        );
        assert_eq!(reply.text, "done");
        assert_eq!(
            reply.state.variables.get("events"),
            Some(&serde_json::json!(["standup"]))
        );
    }
}
