use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config;
use crate::db::{Store, StoreError};
use crate::flag;
use crate::inserter::InstanceInserter;
use crate::runtime::{ContainerSpec, Runtime, RuntimeError};
use crate::types::{Challenge, Game, Instance, InstanceStatus, Participation};

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("challenge is not backed by a container")]
    NotContainerType,
    #[error("challenge has no image or exposed port")]
    Misconfigured,
    #[error("an instance is already running")]
    AlreadyRunning,
    #[error("too many operations, retry in {0}s")]
    CooldownActive(i64),
    #[error("team already runs {0} instances")]
    QuotaExceeded(i32),
    #[error("no instance")]
    NoInstance,
    #[error("instance can be prolonged in {0}s")]
    NotYetProlongable(i64),
    #[error("instance reached its maximum lifetime")]
    ProlongLimitReached,
    #[error("runtime error")]
    Runtime(#[from] RuntimeError),
    #[error("store error")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub cooldown: Duration,
    pub lifetime: Duration,
    pub prolong_window: Duration,
    pub prolong: Duration,
    pub max_lifetime: Option<Duration>,
    /// new instances are reached through the proxy
    pub proxy: bool,
}

impl Settings {
    pub fn from_conf(config: &config::Root) -> Self {
        let instances = &config.instances;
        Self {
            cooldown: instances.cooldown(),
            lifetime: instances.lifetime(),
            prolong_window: instances.prolong_window(),
            prolong: instances.prolong(),
            max_lifetime: instances.max_lifetime(),
            proxy: config.proxy.enable,
        }
    }
}

/// Owns the lifecycle of the one instance a participation may have per
/// challenge.
///
/// The cooldown is a heuristic: it compares against the stored
/// `last_operation`, so requests racing across processes may both pass it.
/// Within one process, creates of a team are serialized so that the quota
/// check and the insert cannot interleave.
pub struct InstanceManager {
    store: Arc<dyn Store>,
    runtime: Arc<dyn Runtime>,
    settings: Settings,
    team_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstanceManager {
    pub fn new(store: Arc<dyn Store>, runtime: Arc<dyn Runtime>, settings: Settings) -> Self {
        Self {
            store,
            runtime,
            settings,
            team_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn team_lock(&self, team: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.team_locks.lock().entry(team).or_default().clone()
    }

    fn check_cooldown(&self, instance: &Instance, now: DateTime<Utc>) -> Result<(), InstanceError> {
        let elapsed = now - instance.last_operation;
        if elapsed < self.settings.cooldown {
            let wait = (self.settings.cooldown - elapsed).num_seconds().max(1);
            return Err(InstanceError::CooldownActive(wait));
        }
        Ok(())
    }

    pub async fn create(
        &self,
        game: &Game,
        participation: &Participation,
        challenge: &Challenge,
    ) -> Result<Instance, InstanceError> {
        if !challenge.kind.is_container() {
            return Err(InstanceError::NotContainerType);
        }

        let lock = self.team_lock(participation.team_id);
        let guard = lock.lock().await;

        let now = Utc::now();
        if let Some(latest) = self
            .store
            .latest_instance(participation.id, challenge.id)
            .await?
        {
            if latest.is_active() {
                return Err(InstanceError::AlreadyRunning);
            }
            self.check_cooldown(&latest, now)?;
        }

        let running = self
            .store
            .count_team_instances(game.id, participation.team_id)
            .await?;
        if running >= i64::from(game.container_count_limit) {
            return Err(InstanceError::QuotaExceeded(game.container_count_limit));
        }

        let id = Uuid::new_v4();
        let flag = challenge.kind.has_team_flag().then(|| {
            flag::team_flag(
                challenge.flag_template.as_deref(),
                participation.team_id,
                challenge.id,
                id,
            )
        });
        let spec = ContainerSpec::for_instance(
            challenge,
            id,
            Some(participation.team_id),
            flag.clone(),
            !self.settings.proxy,
        )
        .ok_or(InstanceError::Misconfigured)?;

        // accepted from here on, the pending row holds the quota slot and
        // starts the cooldown
        let instance = self
            .store
            .add_instance(&InstanceInserter {
                id,
                participation_id: Some(participation.id),
                team_id: Some(participation.team_id),
                game_id: game.id,
                challenge_id: challenge.id,
                created_at: now,
                expected_stop: now + self.settings.lifetime,
                flag,
                is_proxy: self.settings.proxy,
            })
            .await
            .map_err(|e| match e {
                StoreError::Conflict => InstanceError::AlreadyRunning,
                e => e.into(),
            })?;
        drop(guard);

        self.provision(instance, &spec).await
    }

    /// Admin test instance, no participation, quota or cooldown
    pub async fn create_test(&self, challenge: &Challenge) -> Result<Instance, InstanceError> {
        if !challenge.kind.is_container() {
            return Err(InstanceError::NotContainerType);
        }

        let id = Uuid::new_v4();
        let flag = challenge
            .kind
            .has_team_flag()
            .then(|| flag::team_flag(challenge.flag_template.as_deref(), 0, challenge.id, id));
        let spec = ContainerSpec::for_instance(challenge, id, None, flag.clone(), !self.settings.proxy)
            .ok_or(InstanceError::Misconfigured)?;

        let now = Utc::now();
        let instance = self
            .store
            .add_instance(&InstanceInserter {
                id,
                participation_id: None,
                team_id: None,
                game_id: challenge.game_id,
                challenge_id: challenge.id,
                created_at: now,
                expected_stop: now + self.settings.lifetime,
                flag,
                is_proxy: self.settings.proxy,
            })
            .await?;

        self.provision(instance, &spec).await
    }

    async fn provision(
        &self,
        mut instance: Instance,
        spec: &ContainerSpec,
    ) -> Result<Instance, InstanceError> {
        match self.runtime.start(spec).await {
            Ok(container) => {
                instance.container_id = Some(container.container_id.clone());
                instance.ip = Some(container.ip);
                instance.port = Some(container.port);
                instance.public_entry = container.public_entry;
                instance.status = InstanceStatus::Running;
                instance.expected_stop = Utc::now() + self.settings.lifetime;

                let stored = match self.store.finish_provision(&instance).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        self.discard(&instance, &container.container_id).await;
                        return Err(e.into());
                    }
                };
                if !stored {
                    // destroyed while the container was starting
                    info!(instance = %instance.id, "instance destroyed during start");
                    self.discard(&instance, &container.container_id).await;
                    return Err(InstanceError::NoInstance);
                }

                info!(
                    instance = %instance.id,
                    challenge = instance.challenge_id,
                    team = ?instance.team_id,
                    "instance started"
                );
                Ok(instance)
            }
            Err(e) => {
                warn!(
                    instance = %instance.id,
                    challenge = instance.challenge_id,
                    team = ?instance.team_id,
                    "failed to start instance: {:?}", e
                );

                // keep the row so the cooldown still applies
                instance.status = InstanceStatus::Destroyed;
                if let Err(e) = self.store.finish_provision(&instance).await {
                    warn!(instance = %instance.id, "failed to release failed instance: {:?}", e);
                }
                Err(e.into())
            }
        }
    }

    async fn discard(&self, instance: &Instance, container: &str) {
        if let Err(e) = self.runtime.stop(container).await {
            warn!(instance = %instance.id, container = %container, "failed to stop container: {:?}", e);
        }
    }

    pub async fn running(
        &self,
        participation: &Participation,
        challenge: &Challenge,
    ) -> Result<Instance, InstanceError> {
        self.store
            .latest_instance(participation.id, challenge.id)
            .await?
            .filter(|i| i.status == InstanceStatus::Running)
            .ok_or(InstanceError::NoInstance)
    }

    pub async fn prolong(
        &self,
        participation: &Participation,
        challenge: &Challenge,
    ) -> Result<Instance, InstanceError> {
        let mut instance = self.running(participation, challenge).await?;

        let now = Utc::now();
        let remaining = instance.expected_stop - now;
        if remaining > self.settings.prolong_window {
            let wait = (remaining - self.settings.prolong_window).num_seconds().max(1);
            return Err(InstanceError::NotYetProlongable(wait));
        }

        let mut expected_stop = instance.expected_stop + self.settings.prolong;
        if let Some(max) = self.settings.max_lifetime {
            let cap = instance.created_at + max;
            if instance.expected_stop >= cap {
                return Err(InstanceError::ProlongLimitReached);
            }
            expected_stop = expected_stop.min(cap);
        }

        instance.expected_stop = expected_stop;
        instance.last_operation = now;
        self.store.update_instance(&instance).await?;

        info!(instance = %instance.id, until = %instance.expected_stop, "instance prolonged");
        Ok(instance)
    }

    pub async fn destroy(
        &self,
        participation: &Participation,
        challenge: &Challenge,
    ) -> Result<Instance, InstanceError> {
        let mut instance = self
            .store
            .latest_instance(participation.id, challenge.id)
            .await?
            .ok_or(InstanceError::NoInstance)?;

        if !instance.is_active() {
            return Ok(instance);
        }

        let now = Utc::now();
        self.check_cooldown(&instance, now)?;

        instance.last_operation = now;
        self.store.update_instance(&instance).await?;

        self.teardown(&mut instance, false).await?;
        Ok(instance)
    }

    /// Destroys everything past its expected stop, returns the destroyed ids
    pub async fn sweep(&self) -> Result<Vec<Uuid>, InstanceError> {
        let expired = self.store.expired_instances(Utc::now()).await?;
        let mut destroyed = Vec::with_capacity(expired.len());

        for mut instance in expired {
            self.teardown(&mut instance, true).await?;
            destroyed.push(instance.id);
        }

        Ok(destroyed)
    }

    /// With `force`, runtime failures are logged and the instance is
    /// released anyway
    async fn teardown(&self, instance: &mut Instance, force: bool) -> Result<(), InstanceError> {
        if let Some(container) = &instance.container_id {
            if let Err(e) = self.runtime.stop(container).await {
                warn!(instance = %instance.id, container = %container, "failed to stop container: {:?}", e);
                if !force {
                    return Err(e.into());
                }
            }
        }

        instance.status = InstanceStatus::Destroyed;
        self.store.update_instance(instance).await?;

        info!(
            instance = %instance.id,
            challenge = instance.challenge_id,
            team = ?instance.team_id,
            "instance destroyed"
        );
        Ok(())
    }
}
