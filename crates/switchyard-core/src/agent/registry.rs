//! Agent registry
//!
//! Thread-safe table of capability-tagged handlers. Capability lookup only
//! ever returns agents that are active and recently heard from; ordering is
//! ascending in-flight load with registration order breaking ties.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::agent::types::{Agent, AgentDescriptor, AgentRuntimeStats, AgentStatus};
use crate::{Error, Result};

struct AgentEntry {
    descriptor: AgentDescriptor,
    handler: Arc<dyn Agent>,
    stats: AgentRuntimeStats,
    /// Registration sequence, used as the lookup tie-break
    seq: u64,
}

/// Detached snapshot of one registry entry
#[derive(Clone)]
pub struct RegisteredAgent {
    pub descriptor: AgentDescriptor,
    pub stats: AgentRuntimeStats,
    pub handler: Arc<dyn Agent>,
}

/// Agent tallies by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct AgentCounts {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub degraded: usize,
}

pub struct AgentRegistry {
    agents: DashMap<String, AgentEntry>,
    next_seq: AtomicU64,
    liveness: Duration,
}

impl AgentRegistry {
    /// `liveness` is the heartbeat age beyond which an agent is invisible to
    /// capability lookups
    pub fn new(liveness: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            next_seq: AtomicU64::new(0),
            liveness,
        }
    }

    /// Register a handler under its descriptor's name.
    ///
    /// The descriptor always enters active with zero load, whatever status the
    /// caller put on it.
    pub fn register(&self, descriptor: AgentDescriptor, handler: Arc<dyn Agent>) -> Result<()> {
        if descriptor.capabilities.is_empty() {
            return Err(Error::Config(format!(
                "agent {} declares no capabilities",
                descriptor.name
            )));
        }

        let name = descriptor.name.clone();
        match self.agents.entry(name.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateName(name)),
            Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let mut descriptor = descriptor;
                descriptor.status = AgentStatus::Active;
                info!(
                    "registered agent {} with capabilities {:?}",
                    name, descriptor.capabilities
                );
                slot.insert(AgentEntry {
                    descriptor,
                    handler,
                    stats: AgentRuntimeStats::new(Utc::now()),
                    seq,
                });
                Ok(())
            }
        }
    }

    /// Remove an agent. Strict mode errors when the name is unknown;
    /// otherwise removal is a no-op for absent names.
    pub fn unregister(&self, name: &str, strict: bool) -> Result<()> {
        let removed = self.agents.remove(name).is_some();
        if removed {
            info!("unregistered agent {}", name);
        }
        if !removed && strict {
            return Err(Error::AgentNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Set an agent's lifecycle status.
    ///
    /// Re-activation also refreshes the heartbeat so the sweep does not
    /// immediately push the agent back to degraded.
    pub fn set_status(&self, name: &str, status: AgentStatus) -> Result<()> {
        let mut entry = self
            .agents
            .get_mut(name)
            .ok_or_else(|| Error::AgentNotFound(name.to_string()))?;
        entry.descriptor.status = status;
        if status == AgentStatus::Active {
            entry.stats.last_heartbeat = Utc::now();
        }
        info!("agent {} status set to {:?}", name, status);
        Ok(())
    }

    /// Record a liveness signal. A degraded agent recovers to active here.
    pub fn heartbeat(&self, name: &str) -> Result<()> {
        let mut entry = self
            .agents
            .get_mut(name)
            .ok_or_else(|| Error::AgentNotFound(name.to_string()))?;
        entry.stats.last_heartbeat = Utc::now();
        if entry.descriptor.status == AgentStatus::Degraded {
            info!("agent {} recovered from degraded", name);
            entry.descriptor.status = AgentStatus::Active;
        }
        Ok(())
    }

    /// Active, live agents whose capability set covers `required`, ordered by
    /// ascending in-flight load, then by registration order. Empty means no
    /// match; the caller decides whether that is fatal.
    pub fn find_by_capabilities(&self, required: &BTreeSet<String>) -> Vec<RegisteredAgent> {
        let now = Utc::now();
        let mut matches: Vec<(u32, u64, RegisteredAgent)> = self
            .agents
            .iter()
            .filter(|entry| {
                entry.descriptor.status == AgentStatus::Active
                    && now - entry.stats.last_heartbeat < self.liveness
                    && entry.descriptor.covers(required)
            })
            .map(|entry| {
                (
                    entry.stats.in_flight,
                    entry.seq,
                    RegisteredAgent {
                        descriptor: entry.descriptor.clone(),
                        stats: entry.stats.clone(),
                        handler: entry.handler.clone(),
                    },
                )
            })
            .collect();

        matches.sort_by_key(|(in_flight, seq, _)| (*in_flight, *seq));
        matches.into_iter().map(|(_, _, agent)| agent).collect()
    }

    /// Snapshot of one entry.
    pub fn get(&self, name: &str) -> Option<RegisteredAgent> {
        self.agents.get(name).map(|entry| RegisteredAgent {
            descriptor: entry.descriptor.clone(),
            stats: entry.stats.clone(),
            handler: entry.handler.clone(),
        })
    }

    /// Snapshot of every entry regardless of status, for observability.
    pub fn list(&self) -> Vec<RegisteredAgent> {
        let mut all: Vec<(u64, RegisteredAgent)> = self
            .agents
            .iter()
            .map(|entry| {
                (
                    entry.seq,
                    RegisteredAgent {
                        descriptor: entry.descriptor.clone(),
                        stats: entry.stats.clone(),
                        handler: entry.handler.clone(),
                    },
                )
            })
            .collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, agent)| agent).collect()
    }

    /// Agent tallies by status.
    pub fn counts(&self) -> AgentCounts {
        let mut counts = AgentCounts::default();
        for entry in self.agents.iter() {
            counts.total += 1;
            match entry.descriptor.status {
                AgentStatus::Active => counts.active += 1,
                AgentStatus::Inactive => counts.inactive += 1,
                AgentStatus::Degraded => counts.degraded += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Refresh heartbeats for handlers that report themselves healthy.
    /// Called on the runtime tick; a handler that stops reporting healthy
    /// misses beats and gets degraded by the sweep.
    pub fn beat_healthy(&self) {
        let now = Utc::now();
        for mut entry in self.agents.iter_mut() {
            if entry.descriptor.status == AgentStatus::Inactive {
                continue;
            }
            if entry.handler.healthy() {
                entry.stats.last_heartbeat = now;
                if entry.descriptor.status == AgentStatus::Degraded {
                    info!("agent {} recovered from degraded", entry.descriptor.name);
                    entry.descriptor.status = AgentStatus::Active;
                }
            }
        }
    }

    /// Mark active agents degraded once their heartbeat lapses. Returns how
    /// many were demoted.
    pub fn sweep_stale(&self) -> usize {
        let now = Utc::now();
        let mut swept = 0;
        for mut entry in self.agents.iter_mut() {
            if entry.descriptor.status == AgentStatus::Active
                && now - entry.stats.last_heartbeat >= self.liveness
            {
                warn!(
                    "agent {} missed its heartbeat window, marking degraded",
                    entry.descriptor.name
                );
                entry.descriptor.status = AgentStatus::Degraded;
                swept += 1;
            }
        }
        swept
    }

    /// Start tracking a dispatch against `name`. The returned guard restores
    /// the in-flight count however the dispatch ends, including cancellation.
    pub fn begin_dispatch(self: Arc<Self>, name: &str) -> DispatchGuard {
        if let Some(mut entry) = self.agents.get_mut(name) {
            entry.stats.in_flight += 1;
        }
        debug!("dispatch started on agent {}", name);
        DispatchGuard {
            name: name.to_string(),
            finished: false,
            registry: self,
        }
    }

    fn finish_dispatch(&self, name: &str, ok: bool) {
        if let Some(mut entry) = self.agents.get_mut(name) {
            entry.stats.in_flight = entry.stats.in_flight.saturating_sub(1);
            if ok {
                entry.stats.dispatches += 1;
                entry.stats.last_heartbeat = Utc::now();
            }
        }
    }
}

/// RAII guard for one in-flight dispatch
pub struct DispatchGuard {
    registry: Arc<AgentRegistry>,
    name: String,
    finished: bool,
}

impl DispatchGuard {
    /// Record completion. A successful dispatch counts as a liveness signal.
    pub fn finish(mut self, ok: bool) {
        self.registry.finish_dispatch(&self.name, ok);
        self.finished = true;
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        // Cancelled or abandoned dispatch still releases its slot
        if !self.finished {
            self.registry.finish_dispatch(&self.name, false);
        }
    }
}
