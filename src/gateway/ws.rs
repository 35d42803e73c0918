//! Persistent connection loop
//!
//! One WebSocket session submits batches incrementally and receives results
//! streamed back as calls complete, keyed by call id. The server pings every
//! heartbeat interval; a client silent past the grace window is closed and
//! its not-yet-acquired calls cancelled. Dispatch semantics are identical to
//! the single-shot batch endpoint — both feed the same pipeline.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::RenderError;

use super::http::{GatewayState, tenant_identity};
use super::pipeline::build_dispatch;
use super::session::{CancelOnDrop, ConnectionType, SessionId, SessionManager};
use super::types::{CallFailure, CallResult, ClientFrame, ErrorBody, RenderCall, ServerFrame};

/// `GET /v1/session` — upgrade to a persistent render session
pub async fn session_upgrade(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = tenant_identity(&headers);
    ws.on_upgrade(move |socket| handle_session(state, identity, socket))
}

async fn handle_session(state: GatewayState, identity: String, socket: WebSocket) {
    let session_id = state
        .sessions
        .open(identity.clone(), ConnectionType::Persistent);
    info!(session = %session_id, tenant = %identity, "persistent session opened");

    let (mut sink, mut stream) = socket.split();

    // All outbound frames funnel through one writer so per-call tasks never
    // contend on the socket.
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode server frame"),
            }
        }
        let _ = sink.close().await;
    });

    let (cancel_guard, cancel) = CancelOnDrop::new();

    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let grace = state.config.heartbeat_grace();
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    state.sessions.heartbeat(session_id);
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(ClientFrame::Pong) => {}
                        Ok(ClientFrame::Batch { calls }) => {
                            submit_batch(&state, &identity, session_id, calls, &cancel, &frame_tx);
                        }
                        Err(e) => {
                            let error = RenderError::Validation(format!("unparseable frame: {e}"));
                            let _ = frame_tx.send(ServerFrame::Rejected {
                                error: ErrorBody::from(&error),
                            });
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // Binary and protocol-level ping/pong frames carry no calls
                    last_seen = Instant::now();
                }
                Some(Err(e)) => {
                    debug!(session = %session_id, error = %e, "websocket read error");
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > grace {
                    warn!(
                        session = %session_id,
                        silent_ms = last_seen.elapsed().as_millis() as u64,
                        "heartbeat timed out, closing session"
                    );
                    break;
                }
                if frame_tx.send(ServerFrame::Ping).is_err() {
                    break;
                }
            }
        }
    }

    state.sessions.close(session_id);
    info!(session = %session_id, "persistent session closed");
    // Dropping the guard cancels calls that have not begun acquisition.
    // Calls already holding an instance run to completion on their detached
    // tasks and release through their leases; their results are discarded.
    drop(cancel_guard);
}

/// Decode and dispatch one submitted batch; results stream back per call
fn submit_batch(
    state: &GatewayState,
    identity: &str,
    session_id: SessionId,
    calls: Vec<RenderCall>,
    cancel: &watch::Receiver<bool>,
    frame_tx: &mpsc::UnboundedSender<ServerFrame>,
) {
    let prepared = match super::validation::prepare_batch(calls, &state.batch_limits()) {
        Ok(prepared) => prepared,
        Err(error) => {
            let _ = frame_tx.send(ServerFrame::Rejected {
                error: ErrorBody::from(&error),
            });
            return;
        }
    };
    state.sessions.add_pending(session_id, prepared.len());

    let handles = build_dispatch(&state.router, identity, prepared, cancel);
    for handle in handles {
        let frame_tx = frame_tx.clone();
        let sessions: Arc<SessionManager> = Arc::clone(&state.sessions);
        tokio::spawn(async move {
            let frame = match handle.future.await {
                Ok(output) => ServerFrame::Result(CallResult {
                    call_id: handle.call_id,
                    index: handle.index,
                    data: BASE64.encode(&output.data),
                    timing_ms: output.timing_ms,
                }),
                Err(error) => ServerFrame::Error(CallFailure {
                    call_id: handle.call_id,
                    index: handle.index,
                    error: ErrorBody::from(&error),
                }),
            };
            sessions.call_finished(session_id);
            let _ = frame_tx.send(frame);
        });
    }
}
