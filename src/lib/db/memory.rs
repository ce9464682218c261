use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use super::{Store, StoreError};
use crate::inserter::{InstanceInserter, SubmissionInserter};
use crate::types::{
    Challenge, Game, Instance, InstanceStatus, Participation, Submission, SubmissionStatus,
};

#[derive(Default)]
struct Tables {
    games: HashMap<i64, Game>,
    challenges: HashMap<i64, Challenge>,
    participations: HashMap<i64, Participation>,
    /// (user, game) -> participation
    members: HashMap<(i64, i64), i64>,
    instances: HashMap<Uuid, Instance>,
    submissions: Vec<Submission>,
}

/// Process-local store, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_game(&self, game: Game) {
        self.tables.lock().games.insert(game.id, game);
    }

    pub fn put_challenge(&self, challenge: Challenge) {
        self.tables.lock().challenges.insert(challenge.id, challenge);
    }

    pub fn put_participation(&self, participation: Participation, users: &[i64]) {
        let mut tables = self.tables.lock();
        for user in users {
            tables
                .members
                .insert((*user, participation.game_id), participation.id);
        }
        tables.participations.insert(participation.id, participation);
    }

    /// Snapshot of every instance row, destroyed ones included
    pub fn instances(&self) -> Vec<Instance> {
        self.tables.lock().instances.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn game(&self, id: i64) -> Result<Option<Game>, StoreError> {
        Ok(self.tables.lock().games.get(&id).cloned())
    }

    async fn challenge(&self, id: i64) -> Result<Option<Challenge>, StoreError> {
        Ok(self.tables.lock().challenges.get(&id).cloned())
    }

    async fn participation_for_user(
        &self,
        user_id: i64,
        game_id: i64,
    ) -> Result<Option<Participation>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .members
            .get(&(user_id, game_id))
            .and_then(|id| tables.participations.get(id))
            .cloned())
    }

    async fn instance(&self, id: Uuid) -> Result<Option<Instance>, StoreError> {
        Ok(self.tables.lock().instances.get(&id).cloned())
    }

    async fn latest_instance(
        &self,
        participation_id: i64,
        challenge_id: i64,
    ) -> Result<Option<Instance>, StoreError> {
        Ok(self
            .tables
            .lock()
            .instances
            .values()
            .filter(|i| {
                i.participation_id == Some(participation_id) && i.challenge_id == challenge_id
            })
            .max_by_key(|i| i.created_at)
            .cloned())
    }

    async fn count_team_instances(&self, game_id: i64, team_id: i64) -> Result<i64, StoreError> {
        Ok(self
            .tables
            .lock()
            .instances
            .values()
            .filter(|i| i.game_id == game_id && i.team_id == Some(team_id) && i.is_active())
            .count() as i64)
    }

    async fn add_instance(&self, instance: &InstanceInserter) -> Result<Instance, StoreError> {
        let mut tables = self.tables.lock();

        // same guarantee as the partial unique index in postgres
        let clash = instance.participation_id.is_some()
            && tables.instances.values().any(|i| {
                i.participation_id == instance.participation_id
                    && i.challenge_id == instance.challenge_id
                    && i.is_active()
            });
        if clash {
            return Err(StoreError::Conflict);
        }

        let row = Instance {
            id: instance.id,
            participation_id: instance.participation_id,
            team_id: instance.team_id,
            game_id: instance.game_id,
            challenge_id: instance.challenge_id,
            container_id: None,
            ip: None,
            port: None,
            public_entry: None,
            status: InstanceStatus::Pending,
            created_at: instance.created_at,
            expected_stop: instance.expected_stop,
            last_operation: instance.created_at,
            flag: instance.flag.clone(),
            is_proxy: instance.is_proxy,
        };
        tables.instances.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        if let Some(row) = self.tables.lock().instances.get_mut(&instance.id) {
            *row = instance.clone();
        }
        Ok(())
    }

    async fn finish_provision(&self, instance: &Instance) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        match tables.instances.get_mut(&instance.id) {
            Some(row) if row.status == InstanceStatus::Pending => {
                row.container_id = instance.container_id.clone();
                row.ip = instance.ip.clone();
                row.port = instance.port;
                row.public_entry = instance.public_entry.clone();
                row.status = instance.status;
                row.expected_stop = instance.expected_stop;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired_instances(&self, now: DateTime<Utc>) -> Result<Vec<Instance>, StoreError> {
        Ok(self
            .tables
            .lock()
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Running && i.expected_stop <= now)
            .cloned()
            .collect())
    }

    async fn instances_with_flag(
        &self,
        challenge_id: i64,
        flag: &str,
    ) -> Result<Vec<Instance>, StoreError> {
        Ok(self
            .tables
            .lock()
            .instances
            .values()
            .filter(|i| i.challenge_id == challenge_id && i.flag.as_deref() == Some(flag))
            .cloned()
            .collect())
    }

    async fn add_submission(&self, sub: &SubmissionInserter) -> Result<Submission, StoreError> {
        let mut tables = self.tables.lock();
        let row = Submission {
            id: tables.submissions.len() as i64 + 1,
            answer: sub.answer.clone(),
            user_id: sub.user_id,
            team_id: sub.team_id,
            participation_id: sub.participation_id,
            game_id: sub.game_id,
            challenge_id: sub.challenge_id,
            status: SubmissionStatus::FlagSubmitted,
            submitted_at: sub.submitted_at,
        };
        tables.submissions.push(row.clone());
        Ok(row)
    }

    async fn submission(&self, id: i64) -> Result<Option<Submission>, StoreError> {
        Ok(self
            .tables
            .lock()
            .submissions
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn set_submission_status(
        &self,
        id: i64,
        status: SubmissionStatus,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        match tables.submissions.iter_mut().find(|s| s.id == id) {
            Some(sub) if sub.status == SubmissionStatus::FlagSubmitted => {
                sub.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
