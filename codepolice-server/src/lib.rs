//! code-police server: webhook-triggered code analysis and automated fixes.
//!
//! A push webhook enqueues a job; a background worker drives it through
//! fetch, analyze, fix, publish, and notify stages, persisting every status
//! change and recording every external side effect so that crashes and
//! duplicate queue deliveries never repeat visible work.

pub mod config;
pub mod db;
pub mod email;
pub mod github;
pub mod idempotency;
pub mod llm;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::Config;
use crate::store::Store;

/// Shared state for the HTTP handlers.
pub struct AppState {
    pub config: Config,
    pub store: Store,
}
