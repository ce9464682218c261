use axum::{
    extract::{self, Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::error::ok;
use super::{ApiError, AppState, Requester};

#[derive(Deserialize)]
struct Answer {
    answer: String,
}

// POST /submissions/:challenge
async fn submit(
    State(state): State<Arc<AppState>>,
    user: Requester,
    Path(challenge_id): Path<i64>,
    extract::Json(body): extract::Json<Answer>,
) -> Result<Json<Value>, ApiError> {
    let (game, participation, challenge) = user.context(&state, challenge_id).await?;
    let submission = state
        .submissions
        .submit(user.0, &game, &participation, &challenge, &body.answer)
        .await?;
    Ok(ok(submission.id))
}

// GET /submissions/:challenge/status/:id
async fn status(
    State(state): State<Arc<AppState>>,
    user: Requester,
    Path((challenge_id, id)): Path<(i64, i64)>,
) -> Result<Json<Value>, ApiError> {
    let status = state.submissions.poll(user.0, challenge_id, id).await?;
    Ok(ok(status))
}

// /submissions/
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/:challenge", post(submit))
        .route("/:challenge/status/:id", get(status))
        .with_state(state)
}
