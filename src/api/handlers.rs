use axum::{extract::State, http::StatusCode, Json};
use tracing::error;

use crate::api::types::{ChatReply, ChatRequest, ErrorResponse};
use crate::api::AppState;
use crate::conversation::{assemble_turns, extract_reply};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// POST /api/chat — filter history, append the message, render the chat
/// template, generate, return the assistant's new turn.
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatReply>, ApiError> {
    let history = req.history.as_deref().unwrap_or(&[]);
    let turns = assemble_turns(&req.message, history)
        .ok_or_else(|| client_error("message must not be empty"))?;

    let prompt = state
        .template
        .render(&turns)
        .map_err(|e| server_error("prompt rendering failed", e))?;

    let decoded = state
        .infer
        .generate(&prompt, &state.params)
        .await
        .map_err(|e| server_error("generation failed", e))?;

    Ok(Json(ChatReply {
        reply: extract_reply(&decoded),
    }))
}

fn client_error(msg: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
}

fn server_error(ctx: &str, err: anyhow::Error) -> ApiError {
    error!("{ctx}: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("{ctx}: {err}"),
        }),
    )
}
