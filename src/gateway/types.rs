//! Gateway wire types
//!
//! Shared between the single-shot HTTP endpoints and the persistent
//! WebSocket loop so both connection modes speak the same call/result
//! vocabulary.

use serde::{Deserialize, Serialize};

use crate::engine::RenderOptions;
use crate::error::RenderError;

/// One render call within a batch
#[derive(Debug, Clone, Deserialize)]
pub struct RenderCall {
    /// Client-chosen identifier; generated when absent. Must be unique
    /// within its batch.
    #[serde(default)]
    pub id: Option<String>,
    /// HTML document source. May embed `{{call:<id>}}` placeholders that
    /// splice in an earlier call's output as a data URI.
    pub document: String,
    #[serde(default)]
    pub options: RenderOptions,
    /// Ids of earlier calls this call must wait for, beyond any
    /// placeholder references
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Single-shot render request body
#[derive(Debug, Deserialize)]
pub struct RenderOneRequest {
    pub document: String,
    #[serde(default)]
    pub options: RenderOptions,
}

/// Batch request body
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub calls: Vec<RenderCall>,
}

/// Wire form of an error
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&RenderError> for ErrorBody {
    fn from(error: &RenderError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            retry_after_ms: error.retry_after().map(|d| d.as_millis() as u64),
        }
    }
}

/// Result of one completed call
#[derive(Debug, Clone, Serialize)]
pub struct CallResult {
    pub call_id: String,
    /// Position of the call in its batch
    pub index: usize,
    /// Rendered output, base64-encoded
    pub data: String,
    pub timing_ms: u64,
}

/// Failure of one call, keyed like its sibling results
#[derive(Debug, Clone, Serialize)]
pub struct CallFailure {
    pub call_id: String,
    pub index: usize,
    pub error: ErrorBody,
}

/// Response of `POST /v1/render`
#[derive(Debug, Serialize)]
pub struct RenderOneResponse {
    pub data: String,
    pub timing_ms: u64,
}

/// Response of `POST /v1/render/batch`
///
/// Results and errors partition the batch; a failing call never removes
/// its siblings from `results`.
#[derive(Debug, Default, Serialize)]
pub struct BatchResponse {
    pub results: Vec<CallResult>,
    pub errors: Vec<CallFailure>,
}

/// Response of `GET /v1/stats`
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_instances: usize,
    pub idle_instances: usize,
    pub busy_instances: usize,
    pub starting_instances: usize,
    pub queued_waiters: usize,
    pub total_rendered: u64,
    pub fallback_renders: u64,
    pub active_sessions: usize,
    /// Busy fraction of total capacity, 0.0..=1.0
    pub current_load: f64,
}

/// Frames sent by clients over a persistent connection
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Submit a batch of calls; results stream back as they complete
    Batch { calls: Vec<RenderCall> },
    /// Heartbeat reply
    Pong,
}

/// Frames sent by the server over a persistent connection
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// One call completed
    Result(CallResult),
    /// One call failed
    Error(CallFailure),
    /// A whole submission was rejected before dispatch
    Rejected { error: ErrorBody },
    /// Heartbeat probe; clients answer with `pong`
    Ping,
}
