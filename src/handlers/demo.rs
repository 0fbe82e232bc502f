//! Small routes that give the request producer something to measure.

use axum::{http::StatusCode, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Message {
    pub message: &'static str,
}

// ─── GET / ───────────────────────────────────────────────────────

pub async fn index() -> Json<Message> {
    Json(Message {
        message: "metrics dashboard: see /metrics/json",
    })
}

// ─── GET /ping ───────────────────────────────────────────────────

pub async fn ping() -> Json<Message> {
    Json(Message { message: "pong" })
}

// ─── PATCH /patch ────────────────────────────────────────────────

pub async fn patch(body: String) -> (StatusCode, String) {
    (StatusCode::OK, body)
}

// ─── GET /fail ───────────────────────────────────────────────────

pub async fn fail() -> (StatusCode, Json<Message>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(Message {
            message: "deliberate failure",
        }),
    )
}

// ─── GET /sensitive ──────────────────────────────────────────────

/// Listed under `ignored_routes` by the bundled configuration.
pub async fn sensitive() -> Json<Message> {
    Json(Message {
        message: "not sampled",
    })
}
