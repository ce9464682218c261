use crate::inserter::{InstanceInserter, SubmissionInserter};
use crate::types::{
    Challenge, Game, Instance, InstanceStatus, Participation, Submission, SubmissionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use uuid::Uuid;

pub mod memory;
pub use memory::MemoryStore;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sqlx error")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("conflicting live instance")]
    Conflict,
}

/// Everything the core needs from persistence. Users, teams and game content
/// are managed elsewhere; this only reads them.
#[async_trait]
pub trait Store: Send + Sync {
    // == game content ==
    async fn game(&self, id: i64) -> Result<Option<Game>, StoreError>;
    async fn challenge(&self, id: i64) -> Result<Option<Challenge>, StoreError>;
    async fn participation_for_user(
        &self,
        user_id: i64,
        game_id: i64,
    ) -> Result<Option<Participation>, StoreError>;

    // == instances ==
    async fn instance(&self, id: Uuid) -> Result<Option<Instance>, StoreError>;
    /// most recent instance of any status
    async fn latest_instance(
        &self,
        participation_id: i64,
        challenge_id: i64,
    ) -> Result<Option<Instance>, StoreError>;
    /// non-destroyed instances of a team in a game
    async fn count_team_instances(&self, game_id: i64, team_id: i64) -> Result<i64, StoreError>;
    /// inserts as [`InstanceStatus::Pending`]
    async fn add_instance(&self, instance: &InstanceInserter) -> Result<Instance, StoreError>;
    async fn update_instance(&self, instance: &Instance) -> Result<(), StoreError>;
    /// Stores a started instance only if its row is still pending, returns
    /// whether it was
    async fn finish_provision(&self, instance: &Instance) -> Result<bool, StoreError>;
    async fn expired_instances(&self, now: DateTime<Utc>) -> Result<Vec<Instance>, StoreError>;
    async fn instances_with_flag(
        &self,
        challenge_id: i64,
        flag: &str,
    ) -> Result<Vec<Instance>, StoreError>;

    // == submissions ==
    async fn add_submission(&self, sub: &SubmissionInserter) -> Result<Submission, StoreError>;
    async fn submission(&self, id: i64) -> Result<Option<Submission>, StoreError>;
    /// only moves out of `FlagSubmitted`, returns whether anything changed
    async fn set_submission_status(
        &self,
        id: i64,
        status: SubmissionStatus,
    ) -> Result<bool, StoreError>;
}

fn parse<T: FromStr>(what: &str, raw: &str) -> Result<T, StoreError> {
    T::from_str(raw).map_err(|_| StoreError::Corrupt(format!("{what} '{raw}'")))
}

fn port(raw: Option<i32>) -> Result<Option<u16>, StoreError> {
    raw.map(|p| u16::try_from(p).map_err(|_| StoreError::Corrupt(format!("port {p}"))))
        .transpose()
}

#[derive(sqlx::FromRow)]
struct GameRow {
    id: i64,
    title: String,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    container_count_limit: i32,
}

impl From<GameRow> for Game {
    fn from(row: GameRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            start: row.start_at,
            end: row.end_at,
            container_count_limit: row.container_count_limit,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ChallengeRow {
    id: i64,
    game_id: i64,
    title: String,
    kind: String,
    enabled: bool,
    image: Option<String>,
    cpu_count: i32,
    memory_limit: i32,
    storage_limit: i32,
    exposed_port: Option<i32>,
    flags: Vec<String>,
    flag_template: Option<String>,
    enable_traffic_capture: bool,
}

impl TryFrom<ChallengeRow> for Challenge {
    type Error = StoreError;

    fn try_from(row: ChallengeRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            game_id: row.game_id,
            title: row.title,
            kind: parse("challenge kind", &row.kind)?,
            enabled: row.enabled,
            image: row.image,
            cpu_count: row.cpu_count,
            memory_limit: row.memory_limit,
            storage_limit: row.storage_limit,
            exposed_port: port(row.exposed_port)?,
            flags: row.flags,
            flag_template: row.flag_template,
            enable_traffic_capture: row.enable_traffic_capture,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ParticipationRow {
    id: i64,
    game_id: i64,
    team_id: i64,
    status: String,
}

impl TryFrom<ParticipationRow> for Participation {
    type Error = StoreError;

    fn try_from(row: ParticipationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            game_id: row.game_id,
            team_id: row.team_id,
            status: parse("participation status", &row.status)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    participation_id: Option<i64>,
    team_id: Option<i64>,
    game_id: i64,
    challenge_id: i64,
    container_id: Option<String>,
    ip: Option<String>,
    port: Option<i32>,
    public_entry: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    expected_stop: DateTime<Utc>,
    last_operation: DateTime<Utc>,
    flag: Option<String>,
    is_proxy: bool,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            participation_id: row.participation_id,
            team_id: row.team_id,
            game_id: row.game_id,
            challenge_id: row.challenge_id,
            container_id: row.container_id,
            ip: row.ip,
            port: port(row.port)?,
            public_entry: row.public_entry,
            status: parse("instance status", &row.status)?,
            created_at: row.created_at,
            expected_stop: row.expected_stop,
            last_operation: row.last_operation,
            flag: row.flag,
            is_proxy: row.is_proxy,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    id: i64,
    answer: String,
    user_id: i64,
    team_id: i64,
    participation_id: i64,
    game_id: i64,
    challenge_id: i64,
    status: String,
    submitted_at: DateTime<Utc>,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = StoreError;

    fn try_from(row: SubmissionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            answer: row.answer,
            user_id: row.user_id,
            team_id: row.team_id,
            participation_id: row.participation_id,
            game_id: row.game_id,
            challenge_id: row.challenge_id,
            status: parse("submission status", &row.status)?,
            submitted_at: row.submitted_at,
        })
    }
}

fn instances(rows: Vec<InstanceRow>) -> Result<Vec<Instance>, StoreError> {
    rows.into_iter().map(Instance::try_from).collect()
}

#[derive(Clone)]
pub struct Db {
    conn: sqlx::Pool<sqlx::Postgres>,
}

impl Db {
    pub fn wrap(conn: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self { conn }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for Db {
    // == game content ==

    async fn game(&self, id: i64) -> Result<Option<Game>, StoreError> {
        Ok(
            sqlx::query_as::<_, GameRow>("SELECT * FROM game WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.conn)
                .await?
                .map(Game::from),
        )
    }

    async fn challenge(&self, id: i64) -> Result<Option<Challenge>, StoreError> {
        sqlx::query_as::<_, ChallengeRow>("SELECT * FROM challenge WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.conn)
            .await?
            .map(Challenge::try_from)
            .transpose()
    }

    async fn participation_for_user(
        &self,
        user_id: i64,
        game_id: i64,
    ) -> Result<Option<Participation>, StoreError> {
        sqlx::query_as::<_, ParticipationRow>(
            "SELECT p.* FROM participation AS p
                INNER JOIN participation_member AS m ON m.participation_id = p.id
             WHERE m.user_id = $1 AND p.game_id = $2",
        )
        .bind(user_id)
        .bind(game_id)
        .fetch_optional(&self.conn)
        .await?
        .map(Participation::try_from)
        .transpose()
    }

    // == instances ==

    async fn instance(&self, id: Uuid) -> Result<Option<Instance>, StoreError> {
        sqlx::query_as::<_, InstanceRow>("SELECT * FROM instance WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.conn)
            .await?
            .map(Instance::try_from)
            .transpose()
    }

    async fn latest_instance(
        &self,
        participation_id: i64,
        challenge_id: i64,
    ) -> Result<Option<Instance>, StoreError> {
        sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM instance WHERE participation_id = $1 AND challenge_id = $2
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(participation_id)
        .bind(challenge_id)
        .fetch_optional(&self.conn)
        .await?
        .map(Instance::try_from)
        .transpose()
    }

    async fn count_team_instances(&self, game_id: i64, team_id: i64) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM instance WHERE game_id = $1 AND team_id = $2 AND status <> $3",
        )
        .bind(game_id)
        .bind(team_id)
        .bind(InstanceStatus::Destroyed.to_string())
        .fetch_one(&self.conn)
        .await?)
    }

    async fn add_instance(&self, instance: &InstanceInserter) -> Result<Instance, StoreError> {
        let InstanceInserter {
            id,
            participation_id,
            team_id,
            game_id,
            challenge_id,
            created_at,
            expected_stop,
            flag,
            is_proxy,
        } = instance;

        let row = sqlx::query_as::<_, InstanceRow>(
            "INSERT INTO instance (id, participation_id, team_id, game_id, challenge_id, status, created_at, expected_stop, last_operation, flag, is_proxy)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $7, $9, $10) RETURNING *",
        )
        .bind(id)
        .bind(participation_id)
        .bind(team_id)
        .bind(game_id)
        .bind(challenge_id)
        .bind(InstanceStatus::Pending.to_string())
        .bind(created_at)
        .bind(expected_stop)
        .bind(flag)
        .bind(is_proxy)
        .fetch_one(&self.conn)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
            e => StoreError::Sqlx(e),
        })?;

        row.try_into()
    }

    async fn update_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE instance SET container_id = $2, ip = $3, port = $4, public_entry = $5, status = $6,
                expected_stop = $7, last_operation = $8, flag = $9
             WHERE id = $1",
        )
        .bind(instance.id)
        .bind(&instance.container_id)
        .bind(&instance.ip)
        .bind(instance.port.map(i32::from))
        .bind(&instance.public_entry)
        .bind(instance.status.to_string())
        .bind(instance.expected_stop)
        .bind(instance.last_operation)
        .bind(&instance.flag)
        .execute(&self.conn)
        .await?;
        Ok(())
    }

    async fn finish_provision(&self, instance: &Instance) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE instance SET container_id = $2, ip = $3, port = $4, public_entry = $5, status = $6,
                expected_stop = $7
             WHERE id = $1 AND status = $8",
        )
        .bind(instance.id)
        .bind(&instance.container_id)
        .bind(&instance.ip)
        .bind(instance.port.map(i32::from))
        .bind(&instance.public_entry)
        .bind(instance.status.to_string())
        .bind(instance.expected_stop)
        .bind(InstanceStatus::Pending.to_string())
        .execute(&self.conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn expired_instances(&self, now: DateTime<Utc>) -> Result<Vec<Instance>, StoreError> {
        instances(
            sqlx::query_as::<_, InstanceRow>(
                "SELECT * FROM instance WHERE status = $1 AND expected_stop <= $2",
            )
            .bind(InstanceStatus::Running.to_string())
            .bind(now)
            .fetch_all(&self.conn)
            .await?,
        )
    }

    async fn instances_with_flag(
        &self,
        challenge_id: i64,
        flag: &str,
    ) -> Result<Vec<Instance>, StoreError> {
        instances(
            sqlx::query_as::<_, InstanceRow>(
                "SELECT * FROM instance WHERE challenge_id = $1 AND flag = $2",
            )
            .bind(challenge_id)
            .bind(flag)
            .fetch_all(&self.conn)
            .await?,
        )
    }

    // == submissions ==

    async fn add_submission(&self, sub: &SubmissionInserter) -> Result<Submission, StoreError> {
        let SubmissionInserter {
            answer,
            user_id,
            team_id,
            participation_id,
            game_id,
            challenge_id,
            submitted_at,
        } = sub;

        sqlx::query_as::<_, SubmissionRow>(
            "INSERT INTO submission (answer, user_id, team_id, participation_id, game_id, challenge_id, status, submitted_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
        )
        .bind(answer)
        .bind(user_id)
        .bind(team_id)
        .bind(participation_id)
        .bind(game_id)
        .bind(challenge_id)
        .bind(SubmissionStatus::FlagSubmitted.to_string())
        .bind(submitted_at)
        .fetch_one(&self.conn)
        .await?
        .try_into()
    }

    async fn submission(&self, id: i64) -> Result<Option<Submission>, StoreError> {
        sqlx::query_as::<_, SubmissionRow>("SELECT * FROM submission WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.conn)
            .await?
            .map(Submission::try_from)
            .transpose()
    }

    async fn set_submission_status(
        &self,
        id: i64,
        status: SubmissionStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE submission SET status = $2 WHERE id = $1 AND status = $3")
            .bind(id)
            .bind(status.to_string())
            .bind(SubmissionStatus::FlagSubmitted.to_string())
            .execute(&self.conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
