//! switchyard-api: HTTP API for the conversation router
//!
//! Exposes chat, session, agent, and supervisor endpoints over axum.
//! Requests for sessions owned by a live peer come back as 307 redirects
//! carrying the owner's address.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;

pub use error::{ApiError, Result};
pub use server::{start_server, AppState};
