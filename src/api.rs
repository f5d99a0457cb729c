use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::container::ServiceContainer;
use crate::error::ChatError;
use crate::handoff::ToggleReason;
use crate::session::AgentType;

#[derive(Clone)]
pub struct AppState {
    container: Arc<ServiceContainer>,
}

pub fn create_router(container: Arc<ServiceContainer>) -> Router {
    let state = AppState { container };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/message", post(post_message))
        .route("/session/{id}", get(get_session))
        .route("/handover", post(post_handover))
        .route("/handover/return", post(post_handover_return))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

fn error_response(e: ChatError) -> Response {
    let status = match e {
        ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

#[derive(Deserialize)]
struct MessageReq {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
    customer_id: String,
}

#[derive(Serialize)]
struct MessageResp {
    response: String,
    session_id: String,
    current_agent: Option<AgentType>,
}

async fn post_message(
    State(state): State<AppState>,
    Json(body): Json<MessageReq>,
) -> Json<MessageResp> {
    let c = &state.container;
    // Blank session id: reuse the customer's live session or mint a new one.
    let session_id = match body.session_id.filter(|s| !s.trim().is_empty()) {
        Some(id) => id,
        None => {
            c.sessions
                .resolve_for_customer(&body.customer_id, c.cfg.session_timeout_hours)
                .await
        }
    };

    let response = c
        .handler
        .handle_query(&body.message, &session_id, &body.customer_id)
        .await;

    let current_agent = match c.sessions.lookup(&session_id) {
        Some(shared) => Some(shared.lock().await.current_agent),
        None => None,
    };

    Json(MessageResp {
        response,
        session_id,
        current_agent,
    })
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.container.handoff.session_stats(&id).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct HandoverReq {
    session_id: String,
    #[serde(default)]
    reason: Option<ToggleReason>,
}

#[derive(Serialize)]
struct HandoverResp {
    transferred: bool,
}

/// Staff-initiated takeover of a session.
async fn post_handover(
    State(state): State<AppState>,
    Json(body): Json<HandoverReq>,
) -> Response {
    let reason = body.reason.unwrap_or(ToggleReason::AgentInitiated);
    match state
        .container
        .handoff
        .transfer_to_human(&body.session_id, reason)
        .await
    {
        Ok(transferred) => Json(HandoverResp { transferred }).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct HandoverReturnReq {
    session_id: String,
}

#[derive(Serialize)]
struct HandoverReturnResp {
    returned: bool,
}

/// Staff hands the conversation back to the bot.
async fn post_handover_return(
    State(state): State<AppState>,
    Json(body): Json<HandoverReturnReq>,
) -> Response {
    match state
        .container
        .handoff
        .transfer_to_bot(&body.session_id)
        .await
    {
        Ok(returned) => Json(HandoverReturnResp { returned }).into_response(),
        Err(e) => error_response(e),
    }
}
