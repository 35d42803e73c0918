//! Pipelined request gateway
//!
//! Lets one client connection submit many render calls — independent or
//! dependent — and receive results as they complete, without a network
//! round trip per call. Two connection modes share one dispatch pipeline:
//! single-shot HTTP batches and persistent WebSocket sessions.

pub mod http;
pub mod pipeline;
pub mod session;
pub mod types;
pub mod validation;
pub mod ws;

pub use http::{GatewayState, TENANT_HEADER, app};
pub use pipeline::{CallHandle, build_dispatch, collect_batch};
pub use session::{CancelOnDrop, ConnectionType, SessionId, SessionManager};
pub use types::{
    BatchRequest, BatchResponse, CallFailure, CallResult, ClientFrame, ErrorBody, RenderCall,
    RenderOneRequest, RenderOneResponse, ServerFrame, StatsResponse,
};
pub use validation::{BatchLimits, PreparedCall, prepare_batch};
