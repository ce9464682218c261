use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde_json::Value;
use std::sync::Arc;

use super::error::ok;
use super::{ApiError, AppState, InstanceDescriptor, Requester};

// POST /admin/instances/:challenge
async fn create_test(
    State(state): State<Arc<AppState>>,
    user: Requester,
    Path(challenge_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if !user.is_admin(&state) {
        return Err(ApiError::Forbidden("admins only".into()));
    }

    let challenge = state
        .store
        .challenge(challenge_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("no such challenge".into()))?;
    let instance = state.instances.create_test(&challenge).await?;

    Ok(ok(InstanceDescriptor::from(&instance)))
}

// /admin/
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/instances/:challenge", post(create_test))
        .with_state(state)
}
