//! Request handlers of the tunnel endpoint.

use super::error::ApiError;
use super::token::SessionToken;
use super::AppState;
use crate::supervisor::StartOutcome;
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use htunnel_core::{Message, Submission, TunnelError, REORDER_WINDOW};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

/// Body of a `POST` to the endpoint.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
enum Command {
    Start,
    Sync {
        seq: u64,
        #[serde(default)]
        msgs: Vec<Message>,
    },
    Stop,
}

#[derive(Debug, Serialize)]
struct SyncReply {
    seq: u64,
    cmd: &'static str,
    msgs: Vec<Message>,
}

type Reply = Result<(HeaderMap, Json<Value>), ApiError>;

/// `POST` dispatcher.
pub async fn command(
    State(state): State<AppState>,
    token: SessionToken,
    body: Result<Bytes, BytesRejection>,
) -> Reply {
    let body = body.map_err(ApiError::from)?;
    let command: Command = serde_json::from_slice(&body).map_err(TunnelError::from)?;

    let reply = match command {
        // a minted token only reaches the client once `start` returns
        Command::Start if token.minted => {
            return Err(ApiError::bad_request(
                "missing_session_token",
                "start requires a session token in the x-tunnel-session header or tunnel_session cookie",
            ));
        }
        Command::Start => start(&state, &token).await?,
        Command::Sync { seq, msgs } => sync(&state, &token, seq, msgs).await?,
        Command::Stop => stop(&state, &token).await?,
    };
    Ok((token.headers(), Json(reply)))
}

/// Held open until the session's engine stops.
async fn start(state: &AppState, token: &SessionToken) -> Result<Value, ApiError> {
    match state.supervisor.start(&token.id).await? {
        StartOutcome::AlreadyRunning => Ok(json!({"cmd": "start", "status": "running"})),
        StartOutcome::Started(worker) => {
            let session_id = worker.session_id().to_string();
            worker.wait().await;
            debug!(session_id = %session_id, "start request released");
            Ok(json!({"cmd": "start", "status": "stopped"}))
        }
    }
}

async fn sync(
    state: &AppState,
    token: &SessionToken,
    seq: u64,
    msgs: Vec<Message>,
) -> Result<Value, ApiError> {
    let mut session = state.store.acquire(&token.id).await?;
    session.touch();

    let count = msgs.len();
    match session.submit_inbound(seq, msgs) {
        Submission::Stale { expected } => {
            debug!(session_id = %token.id, seq, expected, "stale batch rejected");
            return Err(TunnelError::StaleSequence { got: seq, expected }.into());
        }
        Submission::OutOfWindow { expected } => {
            debug!(session_id = %token.id, seq, expected, "batch outside reorder window");
            return Err(TunnelError::SequenceWindow {
                got: seq,
                expected,
                window: REORDER_WINDOW,
            }
            .into());
        }
        Submission::Buffered => {
            debug!(session_id = %token.id, seq, count, "batch buffered");
        }
        Submission::Applied { batches } => {
            debug!(session_id = %token.id, seq, count, batches, "batch applied");
        }
    }

    let page = session.drain_outbound(state.drain_limit);
    drop(session);

    let reply = SyncReply {
        seq: page.seq,
        cmd: "sync",
        msgs: page.msgs,
    };
    serde_json::to_value(reply).map_err(|e| ApiError::from(TunnelError::from(e)))
}

async fn stop(state: &AppState, token: &SessionToken) -> Result<Value, ApiError> {
    let mut session = state.store.acquire(&token.id).await?;
    session.touch();
    session.stop();
    info!(session_id = %token.id, "session stop requested");
    Ok(json!({"cmd": "stop"}))
}

/// `GET`: the raw session state, or `{}` when there is none.
pub async fn dump(State(state): State<AppState>, token: SessionToken) -> Reply {
    let body = match state.store.snapshot(&token.id).await {
        Ok(session) => serde_json::to_value(session).map_err(TunnelError::from)?,
        Err(TunnelError::SessionNotFound(_)) => json!({}),
        Err(e) => return Err(e.into()),
    };
    Ok((token.headers(), Json(body)))
}

/// `DELETE`: destroy the session. Deleting a missing session succeeds.
pub async fn destroy(
    State(state): State<AppState>,
    token: SessionToken,
) -> Result<(StatusCode, HeaderMap), ApiError> {
    match state.store.destroy(&token.id).await {
        Ok(()) | Err(TunnelError::SessionNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    Ok((StatusCode::NO_CONTENT, token.headers()))
}

pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.store.count().await;
    let workers = state.supervisor.live_workers().await;
    Json(json!({
        "status": "ok",
        "sessions": sessions,
        "workers": workers,
    }))
}
