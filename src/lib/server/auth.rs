use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

use super::{ApiError, AppState};
use crate::types::{Challenge, Game, Participation};

/// User id set by the authenticating gateway in front of us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester(pub i64);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Requester {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(state.server.user_header.as_str())
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .map(Requester)
            .ok_or(ApiError::Unauthorized)
    }
}

impl Requester {
    pub fn is_admin(&self, state: &AppState) -> bool {
        state.server.admin_users.contains(&self.0)
    }

    /// Challenge, its game and the requester's participation in it
    pub async fn context(
        &self,
        state: &AppState,
        challenge_id: i64,
    ) -> Result<(Game, Participation, Challenge), ApiError> {
        let challenge = state
            .store
            .challenge(challenge_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("no such challenge".into()))?;
        let game = state
            .store
            .game(challenge.game_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("no such game".into()))?;
        let participation = state
            .store
            .participation_for_user(self.0, game.id)
            .await?
            .ok_or_else(|| ApiError::Forbidden("not participating in this game".into()))?;

        Ok((game, participation, challenge))
    }
}
