use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct InstanceInserter {
    pub id: Uuid,
    pub participation_id: Option<i64>,
    /// FOREIGN KEY
    pub team_id: Option<i64>,
    pub game_id: i64,
    /// FOREIGN KEY
    pub challenge_id: i64,
    pub created_at: DateTime<Utc>,
    pub expected_stop: DateTime<Utc>,
    pub flag: Option<String>,
    pub is_proxy: bool,
}

#[derive(Debug, Clone)]
pub struct SubmissionInserter {
    pub answer: String,
    pub user_id: i64,
    pub team_id: i64,
    /// FOREIGN KEY
    pub participation_id: i64,
    pub game_id: i64,
    /// FOREIGN KEY
    pub challenge_id: i64,
    pub submitted_at: DateTime<Utc>,
}
