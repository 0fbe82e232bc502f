//! Time-bucketed request and process metrics for a single service instance.
//!
//! Producers hand [`metrics::Sample`]s to a [`MetricsEngine`]; the engine
//! folds them into fixed windows per series, persists finalized windows
//! through one of three backends and answers dashboard queries.

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod sampler;
pub mod server;

use std::sync::Arc;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::EngineConfig;
pub use crate::error::{MetricsError, Result};
pub use crate::metrics::MetricsEngine;

/// Shared application state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    /// Central metrics engine: the timing middleware ingests, handlers query.
    pub metrics: Arc<MetricsEngine>,
}
