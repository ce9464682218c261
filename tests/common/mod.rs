#![allow(dead_code)]

use chrono::{Duration, Utc};
use skansen::config;
use skansen::db::MemoryStore;
use skansen::runtime::DummyRuntime;
use skansen::server::AppState;
use skansen::types::{
    Challenge, ChallengeKind, Game, Participation, ParticipationStatus, Submission,
};
use std::sync::Arc;

pub const PLAYER: i64 = 1000;
pub const OUTSIDER: i64 = 2000;
pub const PENDING_PLAYER: i64 = 3000;
pub const ADMIN: i64 = 1;

pub struct Platform {
    pub store: Arc<MemoryStore>,
    pub runtime: Arc<DummyRuntime>,
    pub state: Arc<AppState>,
    pub queue: flume::Receiver<Submission>,
    pub game: Game,
    pub participation: Participation,
}

pub fn challenge(id: i64, kind: ChallengeKind) -> Challenge {
    Challenge {
        id,
        game_id: 1,
        title: format!("chall{id}"),
        kind,
        enabled: true,
        image: Some("ctf/chall:latest".to_string()),
        cpu_count: 1,
        memory_limit: 64,
        storage_limit: 0,
        exposed_port: Some(1337),
        flags: vec!["flag{static}".to_string()],
        flag_template: None,
        enable_traffic_capture: false,
    }
}

/// Game 1 with a quota of 3, container challenges 1-4, attachment
/// challenge 5 and an accepted team 100 with one player
pub fn platform(config: config::Root, runtime: DummyRuntime) -> Platform {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(runtime);

    let game = Game {
        id: 1,
        title: "finals".to_string(),
        start: Utc::now() - Duration::hours(1),
        end: Utc::now() + Duration::hours(8),
        container_count_limit: 3,
    };
    store.put_game(game.clone());

    for id in 1..=4 {
        store.put_challenge(challenge(id, ChallengeKind::StaticContainer));
    }
    store.put_challenge(challenge(5, ChallengeKind::StaticAttachment));

    let participation = Participation {
        id: 10,
        game_id: 1,
        team_id: 100,
        status: ParticipationStatus::Accepted,
    };
    store.put_participation(participation.clone(), &[PLAYER]);
    store.put_participation(
        Participation {
            id: 20,
            game_id: 1,
            team_id: 200,
            status: ParticipationStatus::Pending,
        },
        &[PENDING_PLAYER],
    );

    let (state, queue) = AppState::new(&config, store.clone(), runtime.clone());

    Platform {
        store,
        runtime,
        state,
        queue,
        game,
        participation,
    }
}

pub fn test_config() -> config::Root {
    let mut config = config::Root::default();
    config.server.admin_users = vec![ADMIN];
    config
}
