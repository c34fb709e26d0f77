//! HTTP API handlers
//!
//! Request handlers for chat routing, session inspection, and the agent
//! registry. Routing failures surface through [`ApiError`]'s status mapping;
//! a session owned by a live peer answers with `307` and a `Location` header
//! pointing at the owner so the client can replay the request there.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{debug, info};

use switchyard_core::agent::{
    AgentConfig, AgentCounts, AgentDescriptor, AgentRegistry, AgentRuntimeStats, AgentStatus,
    RegisteredAgent, ScriptedAgent,
};
use switchyard_core::{
    ChatRequest, RedirectTarget, Session, SessionStatus, StreamStart, SupervisorRecord,
    SupervisorStatus, SystemStats, TurnOutcome,
};

use crate::error::{ApiError, Result};
use crate::server::AppState;

// ============================================================================
// Request/Response types
// ============================================================================

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: SupervisorStatus,
    pub supervisor_id: String,
    pub in_flight: u32,
    pub agents: AgentCounts,
    pub timestamp: DateTime<Utc>,
}

/// Agent registration payload
#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub name: String,
    pub description: String,
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub config: AgentConfig,
}

/// Agent status update payload
#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: AgentStatus,
}

/// Wire view of one registered agent: descriptor plus runtime counters
#[derive(Debug, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub descriptor: AgentDescriptor,
    #[serde(flatten)]
    pub stats: AgentRuntimeStats,
}

impl From<RegisteredAgent> for AgentView {
    fn from(agent: RegisteredAgent) -> Self {
        Self {
            descriptor: agent.descriptor,
            stats: agent.stats,
        }
    }
}

/// Per-user session listing entry
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: Option<String>,
    pub status: SessionStatus,
    pub turns: usize,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<Session> for SessionSummary {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.id,
            user_id: session.user_id,
            status: session.status,
            turns: session.turns.len(),
            owner_id: session.owner_id,
            created_at: session.created_at,
            updated_at: session.updated_at,
            expires_at: session.expires_at,
        }
    }
}

// ============================================================================
// Handler functions
// ============================================================================

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let record = state.supervisor.record();
    Json(HealthResponse {
        status: record.status,
        supervisor_id: record.id,
        in_flight: record.session_count,
        agents: state.supervisor.registry().counts(),
        timestamp: Utc::now(),
    })
}

/// Chat endpoint - route one message and wait for the reply
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response> {
    validate(&request)?;
    debug!(
        "chat request (session {:?}, user {:?})",
        request.session_id, request.user_id
    );

    match state.supervisor.handle_message(request).await? {
        TurnOutcome::Reply(reply) => Ok(Json(reply).into_response()),
        TurnOutcome::Redirect(target) => Ok(redirect_response(target, "/api/chat")),
    }
}

/// Streaming chat endpoint - emits SSE events until the terminal one
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response> {
    validate(&request)?;

    match state.supervisor.clone().stream_message(request).await? {
        StreamStart::Stream(events) => {
            let stream =
                ReceiverStream::new(events).map(|event| Event::default().json_data(&event));
            Ok(Sse::new(stream)
                .keep_alive(KeepAlive::default())
                .into_response())
        }
        StreamStart::Redirect(target) => Ok(redirect_response(target, "/api/chat/stream")),
    }
}

/// Get the full session, turns and state variables included
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>> {
    let session = state.supervisor.store().get_session(&session_id).await?;
    Ok(Json(session))
}

/// Delete a session ahead of its TTL
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode> {
    state.supervisor.store().delete_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// List a user's live sessions, most recently updated first
pub async fn user_sessions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<SessionSummary>>> {
    let sessions = state.supervisor.store().list_by_user(&user_id).await?;
    Ok(Json(
        sessions.into_iter().map(SessionSummary::from).collect(),
    ))
}

/// List every registered agent
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentView>> {
    let agents = state.supervisor.registry().list();
    Json(agents.into_iter().map(AgentView::from).collect())
}

/// Register an agent. Agents announced over the wire get the scripted
/// acknowledger body; their capability tags still participate in routing.
pub async fn register_agent(
    State(state): State<AppState>,
    Json(request): Json<RegisterAgentRequest>,
) -> Result<(StatusCode, Json<AgentView>)> {
    if request.name.trim().is_empty() {
        return Err(ApiError::InvalidRequest(
            "agent name must not be empty".to_string(),
        ));
    }

    let name = request.name.clone();
    let mut descriptor = AgentDescriptor::new(request.name, request.description)
        .with_capabilities(request.capabilities);
    if let Some(version) = request.version {
        descriptor = descriptor.with_version(version);
    }
    descriptor.dependencies = request.dependencies;
    descriptor.config = request.config;

    let handler = Arc::new(ScriptedAgent::acknowledger(name.clone()));
    state.supervisor.registry().register(descriptor, handler)?;
    info!("registered agent {} via API", name);

    let view = agent_view(state.supervisor.registry(), &name)?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// Get one agent's descriptor and runtime counters
pub async fn get_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<AgentView>> {
    Ok(Json(agent_view(state.supervisor.registry(), &name)?))
}

/// Unregister an agent
pub async fn unregister_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.supervisor.registry().unregister(&name, true)?;
    info!("unregistered agent {} via API", name);
    Ok(StatusCode::NO_CONTENT)
}

/// Change an agent's lifecycle status
pub async fn set_agent_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<StatusUpdateRequest>,
) -> Result<Json<AgentView>> {
    state.supervisor.registry().set_status(&name, request.status)?;
    debug!("agent {} status set to {:?}", name, request.status);
    Ok(Json(agent_view(state.supervisor.registry(), &name)?))
}

/// Record a liveness signal for an agent
pub async fn agent_heartbeat(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.supervisor.registry().heartbeat(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Every supervisor the directory knows about, stale ones included
pub async fn list_supervisors(
    State(state): State<AppState>,
) -> Result<Json<Vec<SupervisorRecord>>> {
    Ok(Json(state.supervisor.directory().list_all().await?))
}

/// Aggregate counters across store, registry, and directory
pub async fn stats(State(state): State<AppState>) -> Result<Json<SystemStats>> {
    Ok(Json(state.supervisor.stats().await?))
}

fn validate(request: &ChatRequest) -> Result<()> {
    if request.message.trim().is_empty() {
        return Err(ApiError::InvalidRequest(
            "message must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn agent_view(registry: &AgentRegistry, name: &str) -> Result<AgentView> {
    registry
        .get(name)
        .map(AgentView::from)
        .ok_or_else(|| ApiError::Core(switchyard_core::Error::AgentNotFound(name.to_string())))
}

/// 307 keeps the method and body; the caller replays the same request
/// against the owning supervisor.
fn redirect_response(target: RedirectTarget, path: &str) -> Response {
    let location = format!("http://{}{}", target.address, path);
    (
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, location)],
        Json(target),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use switchyard_core::agent::register_builtin_agents;
    use switchyard_core::state::MemoryStore;
    use switchyard_core::{
        KeywordClassifier, SessionStore, Supervisor, SupervisorConfig, SupervisorDirectory,
    };

    use crate::server::app;

    fn harness(with_builtins: bool) -> (Router, Arc<Supervisor>) {
        let backend = Arc::new(MemoryStore::new());
        let store = SessionStore::new(backend.clone(), chrono::Duration::seconds(3600));
        let registry = Arc::new(AgentRegistry::new(chrono::Duration::seconds(90)));
        if with_builtins {
            register_builtin_agents(&registry).unwrap();
        }
        let directory = SupervisorDirectory::new(backend, chrono::Duration::seconds(90));
        let supervisor = Arc::new(Supervisor::new(
            &SupervisorConfig {
                id: "sup-test".to_string(),
                address: "127.0.0.1:9100".to_string(),
                max_sessions: 8,
                dispatch_timeout_secs: 30,
                update_retries: 3,
            },
            store,
            registry,
            directory,
            Arc::new(KeywordClassifier::new()),
        ));
        (app(supervisor.clone()), supervisor)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn delete(uri: &str) -> Request<Body> {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn read_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_chat_creates_session_and_replies() {
        let (app, _sup) = harness(true);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/chat",
                json!({"message": "Check my availability for Friday"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = read_json(response).await;
        assert_eq!(body["agent"], "availability-checker");
        assert_eq!(body["status"], "success");
        let session_id = body["session_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(get(&format!("/api/sessions/{session_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session = read_json(response).await;
        assert_eq!(session["turns"].as_array().unwrap().len(), 2);
        assert_eq!(session["owner_id"], "sup-test");
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let (app, _sup) = harness(true);

        let response = app
            .oneshot(post_json("/api/chat", json!({"message": "   "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = read_json(response).await;
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let (app, _sup) = harness(true);

        let response = app.oneshot(get("/api/sessions/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_session_then_gone() {
        let (app, _sup) = harness(true);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/chat",
                json!({"message": "Am I free on Monday?", "session_id": "s-del"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(delete("/api/sessions/s-del")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(delete("/api/sessions/s-del")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_foreign_live_owner_redirects_with_location() {
        let (app, sup) = harness(true);
        sup.store()
            .create_session(Some("s-remote".into()), None, "sup-peer")
            .await
            .unwrap();
        sup.directory()
            .publish(&SupervisorRecord::new("sup-peer", "10.0.0.2:8080"))
            .await
            .unwrap();

        let response = app
            .oneshot(post_json(
                "/api/chat",
                json!({"message": "check", "session_id": "s-remote"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(location, "http://10.0.0.2:8080/api/chat");

        let body = read_json(response).await;
        assert_eq!(body["supervisor_id"], "sup-peer");
        assert_eq!(body["session_id"], "s-remote");
    }

    #[tokio::test]
    async fn test_agent_registration_lifecycle() {
        let (app, _sup) = harness(false);

        let payload = json!({
            "name": "travel-planner",
            "description": "Plans trips",
            "capabilities": ["travel-plan"],
            "version": "0.2.0"
        });
        let response = app
            .clone()
            .oneshot(post_json("/api/agents", payload.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = read_json(response).await;
        assert_eq!(body["name"], "travel-planner");
        assert_eq!(body["status"], "active");
        assert_eq!(body["version"], "0.2.0");
        assert_eq!(body["in_flight"], 0);

        // same name again
        let response = app
            .clone()
            .oneshot(post_json("/api/agents", payload))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/agents/travel-planner/status",
                json!({"status": "inactive"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["status"], "inactive");

        let response = app
            .clone()
            .oneshot(delete("/api/agents/travel-planner"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(get("/api/agents/travel-planner")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_registration_without_capabilities_is_rejected() {
        let (app, _sup) = harness(false);

        let response = app
            .oneshot(post_json(
                "/api/agents",
                json!({"name": "mute", "description": "no tags", "capabilities": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_no_capable_agent_maps_to_unprocessable() {
        let (app, _sup) = harness(false);

        let response = app
            .oneshot(post_json("/api/chat", json!({"message": "hello there"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_health_and_stats_views() {
        let (app, sup) = harness(true);
        sup.publish_heartbeat().await.unwrap();

        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["status"], "available");
        assert_eq!(body["supervisor_id"], "sup-test");
        assert_eq!(body["agents"]["total"], 4);

        let response = app.clone().oneshot(get("/api/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["supervisor_id"], "sup-test");
        assert_eq!(body["agents"]["active"], 4);

        let response = app.oneshot(get("/api/supervisors")).await.unwrap();
        let body = read_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], "sup-test");
    }

    #[tokio::test]
    async fn test_user_sessions_listing() {
        let (app, _sup) = harness(true);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/chat",
                json!({"message": "Am I free on Monday?", "user_id": "mira"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get("/api/sessions/user/mira")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        let listing = body.as_array().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0]["user_id"], "mira");
        assert_eq!(listing[0]["turns"], 2);

        let response = app.oneshot(get("/api/sessions/user/nobody")).await.unwrap();
        let body = read_json(response).await;
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_emits_chunks_then_done() {
        let (app, _sup) = harness(true);

        let response = app
            .oneshot(post_json(
                "/api/chat/stream",
                json!({"message": "Check my availability for Friday"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("text/event-stream"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains(r#""type":"chunk""#));
        assert!(body.contains(r#""type":"done""#));
        assert!(body.contains(r#""agent":"availability-checker""#));
    }
}
