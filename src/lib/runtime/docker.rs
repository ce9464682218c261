use async_trait::async_trait;
use bollard::{
    container::{Config, CreateContainerOptions, RemoveContainerOptions},
    errors::Error as BollardError,
    models::{ContainerInspectResponse, HostConfig},
    Docker,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{ContainerInfo, ContainerSpec, Runtime, RuntimeError};

pub struct DockerRuntime {
    docker: Docker,
    /// network the challenge containers join, the proxy must be able to reach it
    network: Option<String>,
    /// hostname handed out for published ports
    public_host: String,
    /// storage quotas need overlay2 on xfs with pquota
    storage_opt: bool,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("network", &self.network)
            .field("public_host", &self.public_host)
            .finish()
    }
}

impl DockerRuntime {
    pub fn new(
        network: Option<String>,
        public_host: String,
        storage_opt: bool,
    ) -> Result<Self, RuntimeError> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
            network,
            public_host,
            storage_opt,
        })
    }

    fn config(&self, spec: &ContainerSpec) -> Config<String> {
        let port_key = format!("{}/tcp", spec.exposed_port);

        let host_config = HostConfig {
            memory: Some(i64::from(spec.memory_limit) * 1024 * 1024),
            // cpu_count is in tenths of a core
            nano_cpus: Some(i64::from(spec.cpu_count) * 100_000_000),
            storage_opt: (self.storage_opt && spec.storage_limit > 0).then(|| {
                HashMap::from([("size".to_string(), format!("{}M", spec.storage_limit))])
            }),
            network_mode: self.network.clone(),
            publish_all_ports: Some(spec.publish),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            env: spec.flag.as_ref().map(|flag| vec![format!("FLAG={flag}")]),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    fn address(
        &self,
        spec: &ContainerSpec,
        id: &str,
        info: &ContainerInspectResponse,
    ) -> Result<ContainerInfo, RuntimeError> {
        let settings = info
            .network_settings
            .as_ref()
            .ok_or_else(|| RuntimeError::NoAddress(id.to_string()))?;

        let ip = settings
            .networks
            .as_ref()
            .and_then(|networks| match &self.network {
                Some(name) => networks.get(name).and_then(|n| n.ip_address.clone()),
                None => networks.values().find_map(|n| n.ip_address.clone()),
            })
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| RuntimeError::NoAddress(id.to_string()))?;

        let published = settings
            .ports
            .as_ref()
            .and_then(|ports| ports.get(&format!("{}/tcp", spec.exposed_port)))
            .and_then(|bindings| bindings.as_ref())
            .and_then(|bindings| bindings.iter().find_map(|b| b.host_port.clone()))
            .and_then(|port| port.parse::<u16>().ok());

        if spec.publish && published.is_none() {
            return Err(RuntimeError::NoAddress(id.to_string()));
        }

        Ok(ContainerInfo {
            container_id: id.to_string(),
            ip,
            port: spec.exposed_port,
            public_entry: published.map(|port| format!("{}:{}", self.public_host, port)),
        })
    }

    async fn start_inner(
        &self,
        spec: &ContainerSpec,
        id: &str,
    ) -> Result<ContainerInfo, RuntimeError> {
        self.docker.start_container::<String>(id, None).await?;
        let info = self.docker.inspect_container(id, None).await?;
        self.address(spec, id, &info)
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerInfo, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(Some(options), self.config(spec))
            .await?;
        for warning in &container.warnings {
            warn!(container = %container.id, "docker: {}", warning);
        }

        match self.start_inner(spec, &container.id).await {
            Ok(info) => {
                info!(container = %info.container_id, image = %spec.image, ip = %info.ip, "container started");
                Ok(info)
            }
            Err(err) => {
                // don't leave half started containers around
                if let Err(e) = self.stop(&container.id).await {
                    warn!(container = %container.id, "failed to clean up container: {:?}", e);
                }
                Err(err)
            }
        }
    }

    async fn stop(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => {
                debug!(container = %container_id, "container removed");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = %container_id, "container already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
