//! Route definitions
//!
//! Defines all HTTP API endpoints.

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::handlers::{
    agent_heartbeat, chat, chat_stream, delete_session, get_agent, get_session, health,
    list_agents, list_supervisors, register_agent, set_agent_status, stats, unregister_agent,
    user_sessions,
};
use crate::server::AppState;

/// Create the API router
pub fn routes() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(health))
        // Chat endpoints
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        // Session management
        .route("/api/sessions/{session_id}", get(get_session))
        .route("/api/sessions/{session_id}", delete(delete_session))
        .route("/api/sessions/user/{user_id}", get(user_sessions))
        // Agent registry
        .route("/api/agents", get(list_agents))
        .route("/api/agents", post(register_agent))
        .route("/api/agents/{name}", get(get_agent))
        .route("/api/agents/{name}", delete(unregister_agent))
        .route("/api/agents/{name}/status", post(set_agent_status))
        .route("/api/agents/{name}/heartbeat", post(agent_heartbeat))
        // Cluster introspection
        .route("/api/supervisors", get(list_supervisors))
        .route("/api/stats", get(stats))
}
