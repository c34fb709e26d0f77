//! switchyard-core: Distributed Conversation Routing Core
//!
//! 能力タグによるエージェントルーティング、楽観的バージョニング付き
//! セッションストア、ハートビートディレクトリによるスーパーバイザー
//! フェイルオーバーのコア機能を提供します。

pub mod agent;
pub mod classify;
pub mod config;
pub mod directory;
pub mod error;
pub mod runtime;
pub mod session;
pub mod state;
pub mod supervisor;

pub use agent::{
    Agent, AgentDescriptor, AgentRegistry, AgentReply, AgentRequest, AgentStatus, StateFragment,
};
pub use classify::{CapabilityClassifier, KeywordClassifier};
pub use config::{ApiConfig, Config, HeartbeatConfig, StoreConfig, SupervisorConfig};
pub use directory::{SupervisorDirectory, SupervisorRecord, SupervisorStatus};
pub use error::{Error, Result};
pub use runtime::{Runtime, RuntimeHandle};
pub use session::{Session, SessionStatus, SessionStore, Speaker, Turn};
pub use state::{open_backend, StateBackend};
pub use supervisor::{
    ChatReply, ChatRequest, RedirectTarget, StreamEvent, StreamStart, Supervisor, SystemStats,
    TurnOutcome, TurnStatus,
};
