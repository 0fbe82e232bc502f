use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::metrics::query::OverviewRow;
use crate::metrics::{DashboardReport, DiagnosticsSnapshot};
use crate::AppState;

use super::AppError;

/// Range used when the caller does not pass `ts_from` (seconds).
const DEFAULT_RANGE_SECS: i64 = 3_600;

// ─── Request / response types ────────────────────────────────────

/// `?ts_from=&ts_to=` in epoch seconds; `ts_to` defaults to now.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RangeParams {
    pub ts_from: Option<i64>,
    pub ts_to: Option<i64>,
}

impl RangeParams {
    pub fn resolve(self, now: i64) -> Result<(i64, i64), AppError> {
        let ts_to = self.ts_to.unwrap_or(now);
        let ts_from = self.ts_from.unwrap_or(ts_to - DEFAULT_RANGE_SECS);
        if ts_from < 0 {
            return Err(AppError::BadRequest("ts_from must not be negative".into()));
        }
        if ts_from > ts_to {
            return Err(AppError::BadRequest(format!(
                "ts_from ({ts_from}) is after ts_to ({ts_to})"
            )));
        }
        Ok((ts_from, ts_to))
    }
}

#[derive(Debug, Serialize)]
pub struct StatusMessage {
    pub status: &'static str,
}

// ─── GET /metrics/json ───────────────────────────────────────────

pub async fn get_report(
    State(state): State<Arc<AppState>>,
    Query(range): Query<RangeParams>,
) -> Result<Json<DashboardReport>, AppError> {
    let (ts_from, ts_to) = range.resolve(state.metrics.now_secs())?;
    Ok(Json(state.metrics.report(ts_from, ts_to).await?))
}

// ─── GET /metrics/table_overview ─────────────────────────────────

pub async fn get_overview(
    State(state): State<Arc<AppState>>,
    Query(range): Query<RangeParams>,
) -> Result<Json<Vec<OverviewRow>>, AppError> {
    let (ts_from, ts_to) = range.resolve(state.metrics.now_secs())?;
    Ok(Json(state.metrics.overview(ts_from, ts_to).await?))
}

// ─── GET /metrics/diagnostics ────────────────────────────────────

pub async fn get_diagnostics(State(state): State<Arc<AppState>>) -> Json<DiagnosticsSnapshot> {
    Json(state.metrics.diagnostics())
}

// ─── GET /metrics/health ─────────────────────────────────────────

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<StatusMessage>, AppError> {
    state.metrics.health().await?;
    Ok(Json(StatusMessage { status: "ok" }))
}

// ─── DELETE /metrics/reset ───────────────────────────────────────

pub async fn reset(State(state): State<Arc<AppState>>) -> Result<Json<StatusMessage>, AppError> {
    state.metrics.reset().await?;
    Ok(Json(StatusMessage { status: "reset" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_defaults_to_last_hour() {
        assert_eq!(RangeParams::default().resolve(10_000).unwrap(), (6_400, 10_000));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let params = RangeParams {
            ts_from: Some(500),
            ts_to: Some(100),
        };
        assert!(matches!(params.resolve(1_000), Err(AppError::BadRequest(_))));
    }
}
