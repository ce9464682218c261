use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ok;
use super::{ApiError, AppState, Requester};
use crate::types::{Challenge, Game, Instance, InstanceStatus, Participation, ParticipationStatus};

/// What a team gets to see of its instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceDescriptor {
    pub id: Uuid,
    pub challenge_id: i64,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub expected_stop: DateTime<Utc>,
    /// proxy path or `host:port`
    pub entry: Option<String>,
}

impl From<&Instance> for InstanceDescriptor {
    fn from(instance: &Instance) -> Self {
        let entry = match (instance.is_proxy, instance.participation_id) {
            (true, Some(_)) => Some(format!("/proxy/{}", instance.id)),
            (true, None) => Some(format!("/proxy/noinst/{}", instance.id)),
            (false, _) => instance.public_entry.clone(),
        };

        Self {
            id: instance.id,
            challenge_id: instance.challenge_id,
            status: instance.status,
            created_at: instance.created_at,
            expected_stop: instance.expected_stop,
            entry,
        }
    }
}

async fn accepted(
    state: &AppState,
    user: Requester,
    challenge_id: i64,
) -> Result<(Game, Participation, Challenge), ApiError> {
    let (game, participation, challenge) = user.context(state, challenge_id).await?;

    if participation.status != ParticipationStatus::Accepted {
        return Err(ApiError::Forbidden("participation is not accepted".into()));
    }
    if !challenge.enabled {
        return Err(ApiError::NotFound("no such challenge".into()));
    }
    Ok((game, participation, challenge))
}

// POST /instances/:challenge
async fn create(
    State(state): State<Arc<AppState>>,
    user: Requester,
    Path(challenge_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let (game, participation, challenge) = accepted(&state, user, challenge_id).await?;
    let instance = state
        .instances
        .create(&game, &participation, &challenge)
        .await?;
    Ok(ok(InstanceDescriptor::from(&instance)))
}

// POST /instances/:challenge/prolong
async fn prolong(
    State(state): State<Arc<AppState>>,
    user: Requester,
    Path(challenge_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let (_, participation, challenge) = accepted(&state, user, challenge_id).await?;
    let instance = state.instances.prolong(&participation, &challenge).await?;
    Ok(ok(InstanceDescriptor::from(&instance)))
}

// DELETE /instances/:challenge
async fn destroy(
    State(state): State<Arc<AppState>>,
    user: Requester,
    Path(challenge_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let (_, participation, challenge) = accepted(&state, user, challenge_id).await?;
    let instance = state.instances.destroy(&participation, &challenge).await?;
    state.admission.forget(instance.id);
    Ok(ok(InstanceDescriptor::from(&instance)))
}

// /instances/
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/:challenge", post(create).delete(destroy))
        .route("/:challenge/prolong", post(prolong))
        .with_state(state)
}
