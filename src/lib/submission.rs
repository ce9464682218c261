use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::db::{Store, StoreError};
use crate::inserter::SubmissionInserter;
use crate::types::{Challenge, Game, Participation, ParticipationStatus, Submission, SubmissionStatus};

pub const MAX_ANSWER_LEN: usize = 127;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("participation is not accepted")]
    NotAccepted,
    #[error("game is not running")]
    GameNotActive,
    #[error("challenge is not available")]
    ChallengeUnavailable,
    #[error("empty answer")]
    EmptyAnswer,
    #[error("answer longer than {MAX_ANSWER_LEN} characters")]
    AnswerTooLong,
    #[error("no such submission")]
    NotFound,
    #[error("checker queue closed")]
    QueueClosed,
    #[error("store error")]
    Store(#[from] StoreError),
}

/// Accepts answers and hands them to whatever consumes the queue. Judging
/// happens elsewhere.
pub struct SubmissionPipeline {
    store: Arc<dyn Store>,
    queue: flume::Sender<Submission>,
}

impl SubmissionPipeline {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> (Self, flume::Receiver<Submission>) {
        let (queue, rx) = flume::bounded(capacity);
        (Self { store, queue }, rx)
    }

    pub async fn submit(
        &self,
        user_id: i64,
        game: &Game,
        participation: &Participation,
        challenge: &Challenge,
        answer: &str,
    ) -> Result<Submission, SubmitError> {
        if participation.status != ParticipationStatus::Accepted
            || participation.game_id != game.id
        {
            return Err(SubmitError::NotAccepted);
        }
        if !game.is_active(Utc::now()) {
            return Err(SubmitError::GameNotActive);
        }
        if !challenge.enabled || challenge.game_id != game.id {
            return Err(SubmitError::ChallengeUnavailable);
        }

        let answer = answer.trim();
        if answer.is_empty() {
            return Err(SubmitError::EmptyAnswer);
        }
        if answer.chars().count() > MAX_ANSWER_LEN {
            return Err(SubmitError::AnswerTooLong);
        }

        let submission = self
            .store
            .add_submission(&SubmissionInserter {
                answer: answer.to_string(),
                user_id,
                team_id: participation.team_id,
                participation_id: participation.id,
                game_id: game.id,
                challenge_id: challenge.id,
                submitted_at: Utc::now(),
            })
            .await?;

        // waits for room when the checkers are behind
        self.queue
            .send_async(submission.clone())
            .await
            .map_err(|_| SubmitError::QueueClosed)?;

        debug!(
            submission = submission.id,
            team = submission.team_id,
            challenge = submission.challenge_id,
            "submission queued"
        );
        Ok(submission)
    }

    /// Status as the submitting user may see it
    pub async fn poll(
        &self,
        user_id: i64,
        challenge_id: i64,
        id: i64,
    ) -> Result<SubmissionStatus, SubmitError> {
        self.store
            .submission(id)
            .await?
            .filter(|s| s.user_id == user_id && s.challenge_id == challenge_id)
            .map(|s| s.status.public())
            .ok_or(SubmitError::NotFound)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
