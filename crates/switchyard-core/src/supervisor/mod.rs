//! Router/supervisor orchestration core
//!
//! One `Supervisor` instance accepts chat requests, resolves which process
//! owns the session, picks a capable agent, dispatches with a timeout, and
//! persists the turn through the optimistic store. Peer coordination happens
//! entirely through the shared state backend: ownership moves via conditional
//! writes, liveness via the heartbeat directory.
//!
//! Per-request state machine:
//!
//! ```text
//!   resolve ──► capacity ──► classify ──► dispatch ──► persist ──► heartbeat
//!     │                         │            │            │
//!     ├─ owner live elsewhere   │            │            └─ Conflict: retry
//!     │       └─► redirect      │            └─ timeout: no write   the cycle
//!     ├─ owner stale ─► claim   └─ no match: session → error
//!     └─ absent ─► create
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentRegistry, AgentReply, AgentRequest, RegisteredAgent};
use crate::classify::CapabilityClassifier;
use crate::config::SupervisorConfig;
use crate::directory::{SupervisorDirectory, SupervisorRecord, SupervisorStatus};
use crate::session::{Session, SessionStatus, SessionStore, Turn};
use crate::{Error, Result};

mod stats;

pub use stats::SystemStats;

/// One inbound chat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_id: None,
            user_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Terminal status of one turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Success,
    Error,
}

/// Completed-turn payload returned to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
    pub session_id: String,
    pub agent: String,
    pub status: TurnStatus,
    pub timestamp: DateTime<Utc>,
}

/// Where a request for a foreign-owned live session should go instead
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectTarget {
    pub session_id: String,
    pub supervisor_id: String,
    pub address: String,
}

/// How one non-streamed request ended
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Reply(ChatReply),
    Redirect(RedirectTarget),
}

/// Events of one streamed turn: zero or more chunks, then exactly one
/// `Done` or `Error`. A broken stream is restarted from scratch, never
/// resumed mid-way.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk {
        session_id: String,
        agent: String,
        delta: String,
    },
    Done {
        #[serde(flatten)]
        reply: ChatReply,
    },
    Error {
        message: String,
    },
}

/// Successful opening of a streamed turn
pub enum StreamStart {
    Stream(mpsc::Receiver<StreamEvent>),
    Redirect(RedirectTarget),
}

enum Resolved {
    Local(Session),
    Elsewhere(RedirectTarget),
}

pub struct Supervisor {
    id: String,
    address: String,
    store: SessionStore,
    registry: Arc<AgentRegistry>,
    directory: SupervisorDirectory,
    classifier: Arc<dyn CapabilityClassifier>,
    dispatch_timeout: StdDuration,
    update_retries: u32,
    max_sessions: u32,
    /// Admission permits; one turn in flight per permit
    turn_permits: Arc<Semaphore>,
    /// Single-flight gates so one process never races itself on a session
    session_gates: DashMap<String, Arc<Mutex<()>>>,
    /// Set while the store is unreachable; reflected in the next heartbeat
    degraded: AtomicBool,
}

impl Supervisor {
    pub fn new(
        config: &SupervisorConfig,
        store: SessionStore,
        registry: Arc<AgentRegistry>,
        directory: SupervisorDirectory,
        classifier: Arc<dyn CapabilityClassifier>,
    ) -> Self {
        info!(
            "supervisor {} starting at {} (max {} concurrent turns)",
            config.id, config.address, config.max_sessions
        );
        Self {
            id: config.id.clone(),
            address: config.address.clone(),
            store,
            registry,
            directory,
            classifier,
            dispatch_timeout: StdDuration::from_secs(config.dispatch_timeout_secs),
            update_retries: config.update_retries,
            max_sessions: config.max_sessions,
            turn_permits: Arc::new(Semaphore::new(config.max_sessions as usize)),
            session_gates: DashMap::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &SupervisorDirectory {
        &self.directory
    }

    /// Turns currently executing on this instance.
    pub fn in_flight(&self) -> u32 {
        self.max_sessions - self.turn_permits.available_permits() as u32
    }

    /// Liveness record describing this instance right now.
    pub fn record(&self) -> SupervisorRecord {
        let in_flight = self.in_flight();
        let mut record = SupervisorRecord::new(&self.id, &self.address);
        record.status = if self.degraded.load(Ordering::Relaxed) {
            SupervisorStatus::Degraded
        } else {
            SupervisorStatus::Available
        };
        record.session_count = in_flight;
        record.load = if self.max_sessions == 0 {
            1.0
        } else {
            in_flight as f32 / self.max_sessions as f32
        };
        record
    }

    pub async fn publish_heartbeat(&self) -> Result<()> {
        self.directory.publish(&self.record()).await
    }

    /// Process one chat message to completion.
    ///
    /// `Conflict` retries the whole resolve-dispatch-persist cycle a bounded
    /// number of times; every other failure is surfaced per its policy.
    pub async fn handle_message(&self, request: ChatRequest) -> Result<TurnOutcome> {
        // Redirects to a live peer cost no admission permit
        if let Some(target) = self.peek_redirect(&request).await? {
            debug!(
                "session {} owned by live peer {}, redirecting",
                target.session_id, target.supervisor_id
            );
            return Ok(TurnOutcome::Redirect(target));
        }

        let permit = match self.turn_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "supervisor {} at capacity ({} turns), rejecting request",
                    self.id, self.max_sessions
                );
                return Err(Error::CapacityExceeded(self.max_sessions));
            }
        };

        let session_id = requested_session_id(&request).unwrap_or_else(new_session_id);
        let gate = self.session_gate(&session_id);
        let _turn = gate.lock().await;

        let mut attempt = 0;
        loop {
            match self.run_turn(&session_id, &request).await {
                Ok(outcome) => {
                    self.degraded.store(false, Ordering::Relaxed);
                    // freed capacity shows in the post-turn heartbeat
                    drop(permit);
                    self.finish_turn().await;
                    return Ok(outcome);
                }
                Err(Error::Conflict(_)) if attempt < self.update_retries => {
                    attempt += 1;
                    debug!(
                        "session {} write conflicted, retrying cycle {}/{}",
                        session_id, attempt, self.update_retries
                    );
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => {
                    self.note_failure(&session_id, &e).await;
                    drop(permit);
                    self.finish_turn().await;
                    return Err(e);
                }
            }
        }
    }

    /// Open a streamed turn. Admission, resolution and agent selection happen
    /// up front so their failures arrive as plain errors; after that the
    /// caller reads chunks until the terminal event.
    ///
    /// Dropping the receiver cancels the dispatch and aborts persistence.
    pub async fn stream_message(self: Arc<Self>, request: ChatRequest) -> Result<StreamStart> {
        if let Some(target) = self.peek_redirect(&request).await? {
            return Ok(StreamStart::Redirect(target));
        }

        let permit = self
            .turn_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::CapacityExceeded(self.max_sessions))?;

        let session_id = requested_session_id(&request).unwrap_or_else(new_session_id);
        let gate = self.session_gate(&session_id);
        let turn = gate.clone().lock_owned().await;

        let session = match self.resolve_session(&session_id, &request).await {
            Ok(Resolved::Local(session)) => session,
            Ok(Resolved::Elsewhere(target)) => return Ok(StreamStart::Redirect(target)),
            Err(e) => {
                self.note_failure(&session_id, &e).await;
                return Err(e);
            }
        };
        let required = self.classifier.classify(&request.message);
        let agent = match self.select_agent(&session_id, &required).await {
            Ok(agent) => agent,
            Err(e) => {
                self.note_failure(&session_id, &e).await;
                return Err(e);
            }
        };

        let (event_tx, event_rx) = mpsc::channel(32);
        let supervisor = self;
        let message = request.message;
        tokio::spawn(async move {
            supervisor.pump_stream(session, agent, message, event_tx).await;
            drop(permit);
            drop(turn);
            supervisor.finish_turn().await;
        });

        Ok(StreamStart::Stream(event_rx))
    }

    /// Aggregate view across the store, the registry, and the directory.
    pub async fn stats(&self) -> Result<SystemStats> {
        Ok(SystemStats {
            supervisor_id: self.id.clone(),
            in_flight: self.in_flight(),
            sessions: self.store.stats().await?,
            agents: self.registry.counts(),
            supervisors: self.directory.list_all().await?,
            timestamp: Utc::now(),
        })
    }

    /// Teardown: remove this instance from the directory so peers stop
    /// redirecting to it. Owned sessions stay put for later adoption.
    pub async fn withdraw(&self) -> Result<()> {
        self.directory.withdraw(&self.id).await
    }

    /// Drop single-flight gates nobody holds. Called from the runtime tick.
    pub fn prune_gates(&self) {
        self.session_gates
            .retain(|_, gate| Arc::strong_count(gate) > 1);
    }

    async fn run_turn(&self, session_id: &str, request: &ChatRequest) -> Result<TurnOutcome> {
        let session = match self.resolve_session(session_id, request).await? {
            Resolved::Local(session) => session,
            Resolved::Elsewhere(target) => return Ok(TurnOutcome::Redirect(target)),
        };

        let required = self.classifier.classify(&request.message);
        let agent = self.select_agent(session_id, &required).await?;
        let reply = self.dispatch(&agent, &session, &request.message).await?;

        let name = agent.descriptor.name.clone();
        let updated = self
            .persist_turn(session_id, &request.message, &name, &reply)
            .await?;
        debug!(
            "session {} now at {} turns, version {}",
            updated.id,
            updated.turn_count(),
            updated.version
        );

        Ok(TurnOutcome::Reply(ChatReply {
            response: reply.text,
            session_id: session_id.to_string(),
            agent: name,
            status: TurnStatus::Success,
            timestamp: Utc::now(),
        }))
    }

    /// Cheap pre-admission check: a session owned by a live peer is answered
    /// with a redirect before any permit or gate is taken.
    async fn peek_redirect(&self, request: &ChatRequest) -> Result<Option<RedirectTarget>> {
        let Some(id) = requested_session_id(request) else {
            return Ok(None);
        };
        let Some(session) = self.store.find_session(&id).await? else {
            return Ok(None);
        };
        if session.owner_id != self.id && self.directory.is_live(&session.owner_id).await? {
            return Ok(Some(self.redirect_target(&id, &session.owner_id).await?));
        }
        Ok(None)
    }

    async fn resolve_session(&self, session_id: &str, request: &ChatRequest) -> Result<Resolved> {
        match self.store.find_session(session_id).await? {
            Some(session) if session.owner_id == self.id => Ok(Resolved::Local(session)),
            Some(session) => self.adopt_or_redirect(session).await,
            // Unknown or expired id: either way, a fresh conversation starts
            None => {
                let session = self
                    .store
                    .create_session(
                        Some(session_id.to_string()),
                        request.user_id.clone(),
                        &self.id,
                    )
                    .await?;
                if session.owner_id != self.id {
                    // Lost the create race to a peer; theirs came back
                    return self.adopt_or_redirect(session).await;
                }
                Ok(Resolved::Local(session))
            }
        }
    }

    /// The directory only authorizes a take-over attempt; the store's
    /// conditional write decides who actually wins.
    async fn adopt_or_redirect(&self, session: Session) -> Result<Resolved> {
        let owner = session.owner_id.clone();
        if self.directory.is_live(&owner).await? {
            let target = self.redirect_target(&session.id, &owner).await?;
            return Ok(Resolved::Elsewhere(target));
        }

        match self.store.reassign_owner(&session.id, &owner, &self.id).await {
            Ok(claimed) => {
                info!(
                    "supervisor {} adopted session {} from stale owner {}",
                    self.id, claimed.id, owner
                );
                Ok(Resolved::Local(claimed))
            }
            Err(Error::StillOwned(_, current)) => {
                // Someone else recovered it first; resolve against the winner
                if self.directory.is_live(&current).await? {
                    let target = self.redirect_target(&session.id, &current).await?;
                    Ok(Resolved::Elsewhere(target))
                } else {
                    warn!(
                        "session {} claimed by {} which is itself stale, backing off",
                        session.id, current
                    );
                    Err(Error::StillOwned(session.id.clone(), current))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn redirect_target(&self, session_id: &str, owner: &str) -> Result<RedirectTarget> {
        let address = self
            .directory
            .find(owner)
            .await?
            .map(|record| record.address)
            .unwrap_or_default();
        Ok(RedirectTarget {
            session_id: session_id.to_string(),
            supervisor_id: owner.to_string(),
            address,
        })
    }

    async fn select_agent(
        &self,
        session_id: &str,
        required: &BTreeSet<String>,
    ) -> Result<RegisteredAgent> {
        let mut candidates = self.registry.find_by_capabilities(required);
        if candidates.is_empty() {
            let tags = required.iter().cloned().collect::<Vec<_>>().join(", ");
            warn!("no capable agent for [{}] on session {}", tags, session_id);
            return Err(Error::NoCapableAgent(tags));
        }
        Ok(candidates.remove(0))
    }

    async fn dispatch(
        &self,
        agent: &RegisteredAgent,
        session: &Session,
        message: &str,
    ) -> Result<AgentReply> {
        let name = agent.descriptor.name.as_str();
        let guard = self.registry.clone().begin_dispatch(name);
        let request = agent_request(message, session);

        match timeout(self.dispatch_timeout, agent.handler.invoke(request)).await {
            Ok(Ok(reply)) => {
                guard.finish(true);
                Ok(reply)
            }
            Ok(Err(e)) => {
                guard.finish(false);
                warn!("agent {} failed on session {}: {}", name, session.id, e);
                Err(Error::DispatchFailed(name.to_string(), e.to_string()))
            }
            Err(_) => {
                guard.finish(false);
                warn!(
                    "agent {} timed out after {:?} on session {}",
                    name, self.dispatch_timeout, session.id
                );
                Err(Error::DispatchTimeout(name.to_string()))
            }
        }
    }

    /// Write both turns of the exchange and the agent's state fragment in one
    /// optimistic update, preconditioned on this supervisor still owning the
    /// session. A peer that adopted it mid-dispatch surfaces here as
    /// `Conflict`, and the retry re-resolves into a redirect. A timed-out
    /// dispatch never reaches this point, so a timeout leaves the session
    /// exactly as it was.
    async fn persist_turn(
        &self,
        session_id: &str,
        message: &str,
        agent: &str,
        reply: &AgentReply,
    ) -> Result<Session> {
        let message = message.to_string();
        let agent = agent.to_string();
        let text = reply.text.clone();
        let variables = reply.state.variables.clone();

        self.store
            .update_session(session_id, &self.id, move |session| {
                session.push_turn(Turn::user(message));
                session.push_turn(Turn::agent(agent, text));
                session.merge_variables(variables);
                session.status = SessionStatus::Active;
            })
            .await
    }

    async fn pump_stream(
        &self,
        session: Session,
        agent: RegisteredAgent,
        message: String,
        events: mpsc::Sender<StreamEvent>,
    ) {
        let name = agent.descriptor.name.clone();
        let session_id = session.id.clone();
        let guard = self.registry.clone().begin_dispatch(&name);

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(32);
        let request = agent_request(&message, &session);
        let invoke = agent.handler.invoke_stream(request, chunk_tx);
        tokio::pin!(invoke);
        let deadline = tokio::time::sleep(self.dispatch_timeout);
        tokio::pin!(deadline);

        let mut chunks_open = true;
        let result = loop {
            tokio::select! {
                result = &mut invoke => break result,
                maybe = chunk_rx.recv(), if chunks_open => match maybe {
                    Some(delta) => {
                        let event = StreamEvent::Chunk {
                            session_id: session_id.clone(),
                            agent: name.clone(),
                            delta,
                        };
                        if events.send(event).await.is_err() {
                            // Client disconnect: drop the dispatch, persist nothing
                            info!("stream for session {} cancelled by client", session_id);
                            return;
                        }
                    }
                    None => chunks_open = false,
                },
                _ = &mut deadline => {
                    warn!(
                        "agent {} timed out after {:?} while streaming",
                        name, self.dispatch_timeout
                    );
                    guard.finish(false);
                    let timeout_err = Error::DispatchTimeout(name.clone());
                    let _ = events
                        .send(StreamEvent::Error { message: timeout_err.to_string() })
                        .await;
                    return;
                }
            }
        };

        // Chunks buffered before the handler finished
        while let Ok(delta) = chunk_rx.try_recv() {
            let event = StreamEvent::Chunk {
                session_id: session_id.clone(),
                agent: name.clone(),
                delta,
            };
            if events.send(event).await.is_err() {
                return;
            }
        }

        match result {
            Ok(reply) => {
                guard.finish(true);
                match self.persist_turn(&session_id, &message, &name, &reply).await {
                    Ok(_) => {
                        self.degraded.store(false, Ordering::Relaxed);
                        let done = ChatReply {
                            response: reply.text,
                            session_id: session_id.clone(),
                            agent: name.clone(),
                            status: TurnStatus::Success,
                            timestamp: Utc::now(),
                        };
                        let _ = events.send(StreamEvent::Done { reply: done }).await;
                    }
                    Err(e) => {
                        // The stream restarts from scratch, so a lost write
                        // surfaces as a terminal stream error
                        warn!(
                            "could not persist streamed turn for session {}: {}",
                            session_id, e
                        );
                        if e.is_store_failure() {
                            self.degraded.store(true, Ordering::Relaxed);
                        }
                        let _ = events
                            .send(StreamEvent::Error { message: e.to_string() })
                            .await;
                    }
                }
            }
            Err(e) => {
                guard.finish(false);
                let failure = Error::DispatchFailed(name.clone(), e.to_string());
                self.note_failure(&session_id, &failure).await;
                let _ = events
                    .send(StreamEvent::Error { message: failure.to_string() })
                    .await;
            }
        }
    }

    /// Error bookkeeping after a failed turn. Store faults flip this
    /// supervisor to degraded; agent-level failures mark the session errored
    /// so the caller sees it, while the conversation stays resumable.
    async fn note_failure(&self, session_id: &str, error: &Error) {
        if error.is_store_failure() {
            error!(
                "store unavailable, supervisor {} now degraded: {}",
                self.id, error
            );
            self.degraded.store(true, Ordering::Relaxed);
            return;
        }

        if !matches!(error, Error::NoCapableAgent(_) | Error::DispatchFailed(_, _)) {
            return;
        }
        if let Err(e) = self
            .store
            .update_session(session_id, &self.id, |session| {
                session.status = SessionStatus::Error;
            })
            .await
        {
            warn!("could not mark session {} as errored: {}", session_id, e);
        }
    }

    async fn finish_turn(&self) {
        if let Err(e) = self.publish_heartbeat().await {
            warn!("heartbeat publish failed for supervisor {}: {}", self.id, e);
        }
    }

    fn session_gate(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_gates
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn requested_session_id(request: &ChatRequest) -> Option<String> {
    request
        .session_id
        .clone()
        .filter(|id| !id.trim().is_empty())
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn agent_request(message: &str, session: &Session) -> AgentRequest {
    AgentRequest {
        message: message.to_string(),
        user_id: session.user_id.clone(),
        history: session.turns.clone(),
        variables: session.variables.clone(),
    }
}

fn backoff(attempt: u32) -> StdDuration {
    StdDuration::from_millis(25 * u64::from(attempt))
}
