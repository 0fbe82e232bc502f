use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::AppState;

use super::metrics::RangeParams;

// ─── GET /metrics/stream ─────────────────────────────────────────
/// Server-Sent Events endpoint.
/// Pushes a full `DashboardReport` as JSON once per aggregation window,
/// sliding the requested range forward on every tick. A failed report is
/// sent as an `error` event so the dashboard shows a gap, not stale data.

pub async fn metrics_stream(
    State(state): State<Arc<AppState>>,
    Query(range): Query<RangeParams>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let window = state.metrics.config().window_size_secs.max(1);
    let span = range.ts_from.map(|from| state.metrics.now_secs() - from);
    let (tx, rx) = mpsc::channel::<Event>(1);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(window));
        let mut shutdown = state.metrics.shutdown_signal();
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            let event = match report_json(&state, span).await {
                Ok(json) => Event::default().data(json),
                Err(message) => {
                    warn!(error = %message, "metrics stream tick failed");
                    Event::default().event("error").data(message)
                }
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
        debug!("metrics stream closed");
    });

    let stream = ReceiverStream::new(rx).map(Ok);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

async fn report_json(state: &AppState, span: Option<i64>) -> Result<String, String> {
    let now = state.metrics.now_secs();
    let params = RangeParams {
        ts_from: span.map(|span| now - span),
        ts_to: None,
    };
    let (ts_from, ts_to) = params.resolve(now).map_err(|e| format!("{e:?}"))?;
    let report = state
        .metrics
        .report(ts_from, ts_to)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_string(&report).map_err(|e| e.to_string())
}
