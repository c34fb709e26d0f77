//! Capability-routed agent system
//!
//! Agents are opaque async handlers labelled with capability tags. The
//! supervisor never names an agent directly; it asks the registry for
//! whoever covers the tags a message needs.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     AgentRegistry                        │
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐            │
//! │  │ checker   │  │ scheduler │  │ remover … │  handlers  │
//! │  │ {read}    │  │ {create,  │  │ {delete,  │  + stats   │
//! │  │           │  │  read}    │  │  read}    │            │
//! │  └───────────┘  └───────────┘  └───────────┘            │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ find_by_capabilities(tags)
//!                            ▼
//!            active ∧ live ∧ covers(tags), least-loaded first
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use switchyard_core::agent::{AgentRegistry, register_builtin_agents};
//! use chrono::Duration;
//!
//! let registry = AgentRegistry::new(Duration::seconds(90));
//! register_builtin_agents(&registry)?;
//!
//! let required = ["calendar-read".to_string()].into_iter().collect();
//! let candidates = registry.find_by_capabilities(&required);
//! ```

pub mod builtin;
pub mod registry;
pub mod types;

// Re-exports
pub use builtin::{
    builtin_capabilities, builtin_descriptors, register_builtin_agents, ScriptedAgent,
    EVENTS_VARIABLE,
};
pub use registry::{AgentCounts, AgentRegistry, DispatchGuard, RegisteredAgent};
pub use types::{
    Agent, AgentConfig, AgentDescriptor, AgentReply, AgentRequest, AgentRuntimeStats, AgentStatus,
    StateFragment,
};
