use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use uuid::Uuid;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum ChallengeKind {
    StaticAttachment,
    DynamicAttachment,
    StaticContainer,
    DynamicContainer,
}

impl ChallengeKind {
    /// Backed by a live instance
    pub fn is_container(self) -> bool {
        matches!(self, Self::StaticContainer | Self::DynamicContainer)
    }

    /// Every team gets its own flag, injected into the instance
    pub fn has_team_flag(self) -> bool {
        matches!(self, Self::DynamicContainer)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum ParticipationStatus {
    Pending,
    Accepted,
    Rejected,
    Suspended,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum InstanceStatus {
    Pending,
    Running,
    Destroyed,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum SubmissionStatus {
    FlagSubmitted,
    Accepted,
    WrongAnswer,
    /// Never leaves the server, see [`SubmissionStatus::public`]
    CheatDetected,
}

impl SubmissionStatus {
    /// What the submitting team is allowed to see
    pub fn public(self) -> Self {
        match self {
            Self::CheatDetected => Self::WrongAnswer,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Game {
    pub id: i64,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// max concurrent instances per team
    pub container_count_limit: i32,
}

impl Game {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Challenge {
    pub id: i64,
    pub game_id: i64,
    pub title: String,
    pub kind: ChallengeKind,
    pub enabled: bool,
    pub image: Option<String>,
    /// tenths of a core
    pub cpu_count: i32,
    /// MiB
    pub memory_limit: i32,
    /// MiB
    pub storage_limit: i32,
    pub exposed_port: Option<u16>,
    #[serde(skip)]
    pub flags: Vec<String>,
    #[serde(skip)]
    pub flag_template: Option<String>,
    pub enable_traffic_capture: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Participation {
    pub id: i64,
    pub game_id: i64,
    pub team_id: i64,
    pub status: ParticipationStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: Uuid,
    /// None for admin test instances
    pub participation_id: Option<i64>,
    pub team_id: Option<i64>,
    pub game_id: i64,
    pub challenge_id: i64,
    pub container_id: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    /// host:port reachable without the proxy
    pub public_entry: Option<String>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub expected_stop: DateTime<Utc>,
    pub last_operation: DateTime<Utc>,
    #[serde(skip)]
    pub flag: Option<String>,
    pub is_proxy: bool,
}

impl Instance {
    /// Counts against the team quota
    pub fn is_active(&self) -> bool {
        !matches!(self.status, InstanceStatus::Destroyed)
    }

    /// Private endpoint of the running container
    pub fn target(&self) -> Option<SocketAddr> {
        let ip = self.ip.as_ref()?.parse().ok()?;
        Some(SocketAddr::new(ip, self.port?))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub id: i64,
    pub answer: String,
    pub user_id: i64,
    pub team_id: i64,
    pub participation_id: i64,
    pub game_id: i64,
    pub challenge_id: i64,
    pub status: SubmissionStatus,
    pub submitted_at: DateTime<Utc>,
}
