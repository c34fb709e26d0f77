//! Built-in calendar agents
//!
//! Deterministic handlers over the session's `events` variable. They stand in
//! for externally-backed calendar services while exercising the full routing
//! path: capability tags, state fragments, and streaming.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::agent::registry::AgentRegistry;
use crate::agent::types::{
    Agent, AgentConfig, AgentDescriptor, AgentReply, AgentRequest, StateFragment,
};
use crate::Result;

/// Session variable the calendar handlers read and write
pub const EVENTS_VARIABLE: &str = "events";

const DEFAULT_TIMEZONE: &str = "Asia/Colombo";

/// What a scripted handler does with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    CheckAvailability,
    ScheduleEvent,
    ModifyEvent,
    RemoveEvent,
    /// Fallback for descriptors registered over the API without a body
    Acknowledge,
}

/// In-process handler driven by a fixed script
pub struct ScriptedAgent {
    name: String,
    script: Script,
}

impl ScriptedAgent {
    pub fn availability_checker() -> Self {
        Self {
            name: "availability-checker".to_string(),
            script: Script::CheckAvailability,
        }
    }

    pub fn event_scheduler() -> Self {
        Self {
            name: "event-scheduler".to_string(),
            script: Script::ScheduleEvent,
        }
    }

    pub fn event_modifier() -> Self {
        Self {
            name: "event-modifier".to_string(),
            script: Script::ModifyEvent,
        }
    }

    pub fn event_remover() -> Self {
        Self {
            name: "event-remover".to_string(),
            script: Script::RemoveEvent,
        }
    }

    /// Handler bound to descriptors registered over the API. It acknowledges
    /// every message so out-of-band registrations stay dispatchable.
    pub fn acknowledger(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Script::Acknowledge,
        }
    }

    fn check_availability(&self, request: &AgentRequest) -> AgentReply {
        let events = read_events(request);
        if events.is_empty() {
            return AgentReply::text(
                "No events during the given time period. The requested dates are free.",
            );
        }
        AgentReply::text(format!(
            "Found {} scheduled event(s): {}. Any time outside those is free.",
            events.len(),
            events.join(", ")
        ))
    }

    fn schedule_event(&self, request: &AgentRequest) -> AgentReply {
        let title = quoted_titles(&request.message)
            .into_iter()
            .next()
            .unwrap_or_else(|| condense(&request.message));
        let mut events = read_events(request);
        events.push(title.clone());
        let count = events.len();
        AgentReply::text(format!(
            "Scheduled \"{title}\". The calendar now holds {count} event(s)."
        ))
        .with_state(StateFragment::default().set(EVENTS_VARIABLE, events_value(&events)))
    }

    fn modify_event(&self, request: &AgentRequest) -> AgentReply {
        let titles = quoted_titles(&request.message);
        let (from, to) = match titles.as_slice() {
            [from, to, ..] => (from.clone(), to.clone()),
            _ => {
                return AgentReply::text(
                    "To update an event, name the current title and the new one in quotes.",
                )
            }
        };
        let mut events = read_events(request);
        match events.iter_mut().find(|e| **e == from) {
            Some(slot) => {
                *slot = to.clone();
                AgentReply::text(format!("Updated \"{from}\" to \"{to}\"."))
                    .with_state(StateFragment::default().set(EVENTS_VARIABLE, events_value(&events)))
            }
            None => AgentReply::text(format!("No event named \"{from}\" on the calendar.")),
        }
    }

    fn remove_event(&self, request: &AgentRequest) -> AgentReply {
        let title = match quoted_titles(&request.message).into_iter().next() {
            Some(t) => t,
            None => {
                return AgentReply::text("To cancel an event, name its title in quotes.");
            }
        };
        let mut events = read_events(request);
        let before = events.len();
        events.retain(|e| *e != title);
        if events.len() == before {
            return AgentReply::text(format!("No event named \"{title}\" on the calendar."));
        }
        AgentReply::text(format!(
            "Removed \"{title}\". {} event(s) remain.",
            events.len()
        ))
        .with_state(StateFragment::default().set(EVENTS_VARIABLE, events_value(&events)))
    }

    fn acknowledge(&self, request: &AgentRequest) -> AgentReply {
        AgentReply::text(format!("{} received: {}", self.name, request.message))
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply> {
        let reply = match self.script {
            Script::CheckAvailability => self.check_availability(&request),
            Script::ScheduleEvent => self.schedule_event(&request),
            Script::ModifyEvent => self.modify_event(&request),
            Script::RemoveEvent => self.remove_event(&request),
            Script::Acknowledge => self.acknowledge(&request),
        };
        Ok(reply)
    }

    async fn invoke_stream(
        &self,
        request: AgentRequest,
        chunks: mpsc::Sender<String>,
    ) -> Result<AgentReply> {
        let reply = self.invoke(request).await?;
        for piece in reply.text.split_inclusive(". ") {
            // receiver gone means the caller disconnected
            if chunks.send(piece.to_string()).await.is_err() {
                break;
            }
        }
        Ok(reply)
    }
}

/// Events array from the session variables; non-string entries are skipped.
fn read_events(request: &AgentRequest) -> Vec<String> {
    request
        .variables
        .get(EVENTS_VARIABLE)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn events_value(events: &[String]) -> Value {
    Value::Array(events.iter().cloned().map(Value::String).collect())
}

/// Double-quoted segments of a message, in order of appearance.
fn quoted_titles(message: &str) -> Vec<String> {
    let mut titles = vec![];
    let mut rest = message;
    while let Some(open) = rest.find('"') {
        let after = &rest[open + 1..];
        match after.find('"') {
            Some(close) => {
                let title = after[..close].trim();
                if !title.is_empty() {
                    titles.push(title.to_string());
                }
                rest = &after[close + 1..];
            }
            None => break,
        }
    }
    titles
}

/// Fallback title when the message carries no quoted text.
fn condense(message: &str) -> String {
    let trimmed = message.trim().trim_end_matches(['.', '!', '?']);
    if trimmed.is_empty() {
        "Untitled event".to_string()
    } else {
        trimmed.to_string()
    }
}

fn calendar_descriptor(name: &str, description: &str, capabilities: &[&str]) -> AgentDescriptor {
    AgentDescriptor::new(name, description)
        .with_capabilities(capabilities.iter().copied())
        .with_dependency("calendar-provider")
        .with_config(AgentConfig {
            timezone: Some(DEFAULT_TIMEZONE.to_string()),
            ..AgentConfig::default()
        })
}

/// Descriptors for the four built-in calendar agents.
pub fn builtin_descriptors() -> Vec<AgentDescriptor> {
    vec![
        calendar_descriptor(
            "availability-checker",
            "Checks calendar availability for requested dates",
            &["calendar-read"],
        ),
        calendar_descriptor(
            "event-scheduler",
            "Creates events on the calendar",
            &["event-create", "calendar-read"],
        ),
        calendar_descriptor(
            "event-modifier",
            "Updates existing calendar events",
            &["event-update", "calendar-read"],
        ),
        calendar_descriptor(
            "event-remover",
            "Cancels calendar events",
            &["event-delete", "calendar-read"],
        ),
    ]
}

/// Register the four built-in calendar agents.
pub fn register_builtin_agents(registry: &AgentRegistry) -> Result<()> {
    for descriptor in builtin_descriptors() {
        let handler: Arc<dyn Agent> = match descriptor.name.as_str() {
            "availability-checker" => Arc::new(ScriptedAgent::availability_checker()),
            "event-scheduler" => Arc::new(ScriptedAgent::event_scheduler()),
            "event-modifier" => Arc::new(ScriptedAgent::event_modifier()),
            "event-remover" => Arc::new(ScriptedAgent::event_remover()),
            other => Arc::new(ScriptedAgent::acknowledger(other)),
        };
        registry.register(descriptor, handler)?;
    }
    Ok(())
}

/// Capability tags served by at least one built-in agent.
pub fn builtin_capabilities() -> BTreeSet<String> {
    builtin_descriptors()
        .into_iter()
        .flat_map(|d| d.capabilities)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request_with_events(message: &str, events: &[&str]) -> AgentRequest {
        let mut request = AgentRequest::new(message);
        request.variables.insert(
            EVENTS_VARIABLE.to_string(),
            Value::Array(events.iter().map(|e| Value::String(e.to_string())).collect()),
        );
        request
    }

    #[tokio::test]
    async fn test_checker_reports_free_calendar() {
        let agent = ScriptedAgent::availability_checker();
        let reply = agent
            .invoke(AgentRequest::new("Am I free on the 12th?"))
            .await
            .unwrap();
        assert!(reply.text.contains("free"));
        assert!(reply.state.is_empty());
    }

    #[tokio::test]
    async fn test_checker_lists_existing_events() {
        let agent = ScriptedAgent::availability_checker();
        let reply = agent
            .invoke(request_with_events("Am I free?", &["standup", "dentist"]))
            .await
            .unwrap();
        assert!(reply.text.contains("2 scheduled"));
        assert!(reply.text.contains("standup"));
    }

    #[tokio::test]
    async fn test_scheduler_appends_event() {
        let agent = ScriptedAgent::event_scheduler();
        let reply = agent
            .invoke(request_with_events(
                "Schedule \"design review\" for Friday",
                &["standup"],
            ))
            .await
            .unwrap();
        assert!(reply.text.contains("design review"));
        assert_eq!(
            reply.state.variables.get(EVENTS_VARIABLE),
            Some(&serde_json::json!(["standup", "design review"]))
        );
    }

    #[tokio::test]
    async fn test_modifier_renames_matching_event() {
        let agent = ScriptedAgent::event_modifier();
        let reply = agent
            .invoke(request_with_events(
                "Rename \"standup\" to \"daily sync\"",
                &["standup", "dentist"],
            ))
            .await
            .unwrap();
        assert_eq!(
            reply.state.variables.get(EVENTS_VARIABLE),
            Some(&serde_json::json!(["daily sync", "dentist"]))
        );

        let miss = agent
            .invoke(request_with_events("Rename \"gym\" to \"run\"", &["standup"]))
            .await
            .unwrap();
        assert!(miss.text.contains("No event named"));
        assert!(miss.state.is_empty());
    }

    #[tokio::test]
    async fn test_remover_deletes_event() {
        let agent = ScriptedAgent::event_remover();
        let reply = agent
            .invoke(request_with_events(
                "Cancel \"dentist\" please",
                &["standup", "dentist"],
            ))
            .await
            .unwrap();
        assert_eq!(
            reply.state.variables.get(EVENTS_VARIABLE),
            Some(&serde_json::json!(["standup"]))
        );
        assert!(reply.text.contains("Removed"));
    }

    #[tokio::test]
    async fn test_stream_emits_chunks_then_reply() {
        let agent = ScriptedAgent::availability_checker();
        let (tx, mut rx) = mpsc::channel(16);
        let reply = agent
            .invoke_stream(request_with_events("free?", &["standup"]), tx)
            .await
            .unwrap();

        let mut streamed = String::new();
        while let Some(chunk) = rx.recv().await {
            streamed.push_str(&chunk);
        }
        assert_eq!(streamed, reply.text);
    }

    #[test]
    fn test_quoted_titles_extraction() {
        assert_eq!(
            quoted_titles("Rename \"a b\" to \"c\""),
            vec!["a b".to_string(), "c".to_string()]
        );
        assert!(quoted_titles("no quotes here").is_empty());
        // unbalanced quote: ignore the dangling fragment
        assert_eq!(quoted_titles("drop \"x\" and \"y"), vec!["x".to_string()]);
    }

    #[test]
    fn test_register_builtin_populates_registry() {
        let registry = AgentRegistry::new(Duration::seconds(90));
        register_builtin_agents(&registry).unwrap();
        assert_eq!(registry.len(), 4);

        let caps = builtin_capabilities();
        assert!(caps.contains("calendar-read"));
        assert!(caps.contains("event-create"));
        assert!(caps.contains("event-update"));
        assert!(caps.contains("event-delete"));
    }
}
