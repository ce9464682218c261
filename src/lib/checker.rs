use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{Store, StoreError};
use crate::types::{ChallengeKind, Submission, SubmissionStatus};

/// Judges one submission
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, submission: &Submission) -> Result<SubmissionStatus, StoreError>;
}

/// Compares against the challenge's static flags, or against the flag
/// injected into the team's instance for dynamic container challenges.
pub struct FlagChecker {
    store: Arc<dyn Store>,
}

impl FlagChecker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn check_dynamic(&self, sub: &Submission) -> Result<SubmissionStatus, StoreError> {
        let own = self
            .store
            .latest_instance(sub.participation_id, sub.challenge_id)
            .await?;
        if own.and_then(|i| i.flag).as_deref() == Some(sub.answer.as_str()) {
            return Ok(SubmissionStatus::Accepted);
        }

        let owners = self
            .store
            .instances_with_flag(sub.challenge_id, &sub.answer)
            .await?;
        let stolen = owners
            .iter()
            .find(|i| i.participation_id.is_some() && i.participation_id != Some(sub.participation_id));

        match stolen {
            Some(victim) => {
                warn!(
                    submission = sub.id,
                    challenge = sub.challenge_id,
                    team = sub.team_id,
                    user = sub.user_id,
                    victim = ?victim.team_id,
                    instance = %victim.id,
                    "submitted another team's flag"
                );
                Ok(SubmissionStatus::CheatDetected)
            }
            None => Ok(SubmissionStatus::WrongAnswer),
        }
    }
}

#[async_trait]
impl Checker for FlagChecker {
    async fn check(&self, sub: &Submission) -> Result<SubmissionStatus, StoreError> {
        let Some(challenge) = self.store.challenge(sub.challenge_id).await? else {
            return Ok(SubmissionStatus::WrongAnswer);
        };

        match challenge.kind {
            ChallengeKind::DynamicContainer => self.check_dynamic(sub).await,
            _ if challenge.flags.iter().any(|f| f == &sub.answer) => Ok(SubmissionStatus::Accepted),
            _ => Ok(SubmissionStatus::WrongAnswer),
        }
    }
}

async fn worker(
    id: usize,
    checker: Arc<dyn Checker>,
    store: Arc<dyn Store>,
    queue: flume::Receiver<Submission>,
) {
    while let Ok(sub) = queue.recv_async().await {
        let status = match checker.check(&sub).await {
            Ok(status) => status,
            Err(e) => {
                warn!(worker = id, submission = sub.id, "check failed: {:?}", e);
                continue;
            }
        };

        match store.set_submission_status(sub.id, status).await {
            Ok(true) => info!(
                submission = sub.id,
                team = sub.team_id,
                challenge = sub.challenge_id,
                %status,
                "submission judged"
            ),
            Ok(false) => warn!(submission = sub.id, "submission was already judged"),
            Err(e) => warn!(submission = sub.id, "failed to store verdict: {:?}", e),
        }
    }
}

/// Runs `workers` consumers until the queue closes
pub async fn run(
    checker: Arc<dyn Checker>,
    store: Arc<dyn Store>,
    queue: flume::Receiver<Submission>,
    workers: usize,
) {
    let handles = (0..workers.max(1)).map(|id| {
        tokio::spawn(worker(
            id,
            Arc::clone(&checker),
            Arc::clone(&store),
            queue.clone(),
        ))
    });
    join_all(handles).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::inserter::{InstanceInserter, SubmissionInserter};
    use crate::types::Challenge;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn challenge(id: i64, kind: ChallengeKind) -> Challenge {
        Challenge {
            id,
            game_id: 1,
            title: "chall".to_string(),
            kind,
            enabled: true,
            image: Some("img".to_string()),
            cpu_count: 1,
            memory_limit: 64,
            storage_limit: 0,
            exposed_port: Some(1337),
            flags: vec!["flag{static}".to_string()],
            flag_template: None,
            enable_traffic_capture: false,
        }
    }

    async fn instance(store: &MemoryStore, participation: i64, team: i64, flag: &str) {
        store
            .add_instance(&InstanceInserter {
                id: Uuid::new_v4(),
                participation_id: Some(participation),
                team_id: Some(team),
                game_id: 1,
                challenge_id: 2,
                created_at: Utc::now(),
                expected_stop: Utc::now() + Duration::hours(2),
                flag: Some(flag.to_string()),
                is_proxy: true,
            })
            .await
            .unwrap();
    }

    async fn submit(store: &MemoryStore, participation: i64, challenge: i64, answer: &str) -> Submission {
        store
            .add_submission(&SubmissionInserter {
                answer: answer.to_string(),
                user_id: 1,
                team_id: participation * 10,
                participation_id: participation,
                game_id: 1,
                challenge_id: challenge,
                submitted_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn static_flags() {
        let store = Arc::new(MemoryStore::new());
        store.put_challenge(challenge(1, ChallengeKind::StaticAttachment));
        let checker = FlagChecker::new(store.clone());

        let good = submit(&store, 1, 1, "flag{static}").await;
        let bad = submit(&store, 1, 1, "flag{nope}").await;
        let unknown = submit(&store, 1, 99, "flag{static}").await;

        assert_eq!(checker.check(&good).await.unwrap(), SubmissionStatus::Accepted);
        assert_eq!(checker.check(&bad).await.unwrap(), SubmissionStatus::WrongAnswer);
        assert_eq!(checker.check(&unknown).await.unwrap(), SubmissionStatus::WrongAnswer);
    }

    #[tokio::test]
    async fn dynamic_flags_and_cheating() {
        let store = Arc::new(MemoryStore::new());
        store.put_challenge(challenge(2, ChallengeKind::DynamicContainer));
        instance(&store, 1, 10, "flag{team1}").await;
        instance(&store, 2, 20, "flag{team2}").await;
        let checker = FlagChecker::new(store.clone());

        let own = submit(&store, 1, 2, "flag{team1}").await;
        let stolen = submit(&store, 1, 2, "flag{team2}").await;
        let wrong = submit(&store, 1, 2, "flag{static}").await;

        assert_eq!(checker.check(&own).await.unwrap(), SubmissionStatus::Accepted);
        assert_eq!(checker.check(&stolen).await.unwrap(), SubmissionStatus::CheatDetected);
        assert_eq!(checker.check(&wrong).await.unwrap(), SubmissionStatus::WrongAnswer);
    }

    #[tokio::test]
    async fn workers_drain_queue() {
        let store = Arc::new(MemoryStore::new());
        store.put_challenge(challenge(1, ChallengeKind::StaticAttachment));

        let (tx, rx) = flume::bounded(8);
        let mut ids = vec![];
        for answer in ["flag{static}", "nope", "flag{static}"] {
            let sub = submit(&store, 1, 1, answer).await;
            ids.push(sub.id);
            tx.send_async(sub).await.unwrap();
        }
        drop(tx);

        run(Arc::new(FlagChecker::new(store.clone())), store.clone(), rx, 2).await;

        let mut statuses = vec![];
        for id in ids {
            statuses.push(store.submission(id).await.unwrap().unwrap().status);
        }
        assert_eq!(
            statuses,
            vec![
                SubmissionStatus::Accepted,
                SubmissionStatus::WrongAnswer,
                SubmissionStatus::Accepted
            ]
        );
    }
}
