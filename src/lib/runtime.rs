use async_trait::async_trait;
use color_eyre::{eyre::eyre, Report};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config;
use crate::types::Challenge;

// implementations
mod docker;
pub use docker::DockerRuntime;
mod dummy;
pub use dummy::DummyRuntime;

#[derive(Debug)]
pub enum Runtimes {
    Docker(DockerRuntime),
    Dummy(DummyRuntime),
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("docker error")]
    Docker(#[from] bollard::errors::Error),
    #[error("container {0} has no reachable address")]
    NoAddress(String),
    #[error("runtime refused: {0}")]
    Refused(String),
}

/// What to run for one instance
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// tenths of a core
    pub cpu_count: i32,
    /// MiB
    pub memory_limit: i32,
    /// MiB
    pub storage_limit: i32,
    pub exposed_port: u16,
    /// injected as `FLAG` into the environment
    pub flag: Option<String>,
    /// publish the port on the host, needed when not going through the proxy
    pub publish: bool,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// None if the challenge lacks an image or port
    pub fn for_instance(
        challenge: &Challenge,
        instance: Uuid,
        team: Option<i64>,
        flag: Option<String>,
        publish: bool,
    ) -> Option<Self> {
        let mut labels = HashMap::from([
            ("skansen.instance".to_string(), instance.to_string()),
            ("skansen.challenge".to_string(), challenge.id.to_string()),
        ]);
        if let Some(team) = team {
            labels.insert("skansen.team".to_string(), team.to_string());
        }

        Some(Self {
            name: format!("skansen_{}_{}", challenge.id, instance.simple()),
            image: challenge.image.clone()?,
            cpu_count: challenge.cpu_count,
            memory_limit: challenge.memory_limit,
            storage_limit: challenge.storage_limit,
            exposed_port: challenge.exposed_port?,
            flag,
            publish,
            labels,
        })
    }
}

/// A started container, as reported by the runtime
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub container_id: String,
    /// private address, only the proxy dials this
    pub ip: String,
    pub port: u16,
    pub public_entry: Option<String>,
}

/// Starts and stops sandboxed containers
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerInfo, RuntimeError>;
    /// stopping an already gone container is not an error
    async fn stop(&self, container_id: &str) -> Result<(), RuntimeError>;
}

impl Runtimes {
    pub fn from_conf(conf: &config::Runtime) -> Result<Self, Report> {
        let opt = |key: &str| -> Result<Option<String>, Report> {
            conf.runtime
                .get(key)
                .map(|v| {
                    v.as_str()
                        .map(str::to_owned)
                        .ok_or(eyre!("runtime option {key} must be a string"))
                })
                .transpose()
        };

        match conf.runtime_name.as_str() {
            "dummy" => {
                let address = opt("address")?
                    .unwrap_or_else(|| "127.0.0.1".to_string())
                    .parse()?;
                let port = conf
                    .runtime
                    .get("port")
                    .map(|p| {
                        p.as_integer()
                            .and_then(|p| u16::try_from(p).ok())
                            .ok_or(eyre!("dummy runtime port must be a port number"))
                    })
                    .transpose()?;
                Ok(Self::Dummy(DummyRuntime::new(address, port)))
            }
            "docker" => {
                let public_host = opt("public_host")?.unwrap_or_else(|| "127.0.0.1".to_string());
                let storage_opt = conf
                    .runtime
                    .get("storage_opt")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let docker = DockerRuntime::new(opt("network")?, public_host, storage_opt)?;
                Ok(Self::Docker(docker))
            }
            _ => Err(eyre!("Unknown runtime {}", conf.runtime_name)),
        }
    }

    pub fn into_dyn(self) -> Arc<dyn Runtime> {
        match self {
            Self::Docker(docker) => Arc::new(docker),
            Self::Dummy(dummy) => Arc::new(dummy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChallengeKind;

    fn challenge() -> Challenge {
        Challenge {
            id: 7,
            game_id: 1,
            title: "pwn".to_string(),
            kind: ChallengeKind::StaticContainer,
            enabled: true,
            image: Some("ghcr.io/ctf/pwn:latest".to_string()),
            cpu_count: 5,
            memory_limit: 128,
            storage_limit: 256,
            exposed_port: Some(1337),
            flags: vec![],
            flag_template: None,
            enable_traffic_capture: false,
        }
    }

    #[test]
    fn spec_from_challenge() {
        let id = Uuid::new_v4();
        let spec = ContainerSpec::for_instance(&challenge(), id, Some(3), None, false).unwrap();
        assert_eq!(spec.exposed_port, 1337);
        assert_eq!(spec.labels["skansen.team"], "3");
        assert!(spec.name.ends_with(&id.simple().to_string()));

        let mut broken = challenge();
        broken.exposed_port = None;
        assert!(ContainerSpec::for_instance(&broken, id, None, None, false).is_none());
    }

    #[test]
    fn runtime_selection() {
        let conf: config::Runtime = toml::from_str(
            r#"
            runtime_name = "dummy"
            runtime = { address = "10.0.0.5", port = 31337 }
            "#,
        )
        .unwrap();
        assert!(matches!(Runtimes::from_conf(&conf).unwrap(), Runtimes::Dummy(_)));

        let conf = config::Runtime {
            runtime_name: "k8s".to_string(),
            runtime: toml::Table::new(),
        };
        assert!(Runtimes::from_conf(&conf).is_err());
    }
}
