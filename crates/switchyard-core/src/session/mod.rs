//! Session management module
//!
//! Conversation state that survives supervisor restarts: session types, and
//! the store service enforcing idempotent creation, optimistic versioning,
//! TTL expiry, and conditional ownership transfer.

mod store;
mod types;

pub use store::SessionStore;
pub use types::{Session, SessionCounts, SessionStatus, Speaker, Turn};
