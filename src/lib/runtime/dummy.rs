use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{ContainerInfo, ContainerSpec, Runtime, RuntimeError};

/// Pretends to run containers. Every "container" points at one fixed
/// address, which makes it handy for local development against a single
/// service and for tests.
#[derive(Debug)]
pub struct DummyRuntime {
    address: IpAddr,
    /// overrides the challenge port
    port: Option<u16>,
    running: Mutex<HashSet<String>>,
    failing: AtomicBool,
}

impl DummyRuntime {
    pub fn new(address: IpAddr, port: Option<u16>) -> Self {
        Self {
            address,
            port,
            running: Mutex::new(HashSet::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every following start fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn running(&self) -> usize {
        self.running.lock().len()
    }
}

#[async_trait]
impl Runtime for DummyRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerInfo, RuntimeError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RuntimeError::Refused(format!(
                "dummy runtime refuses {}",
                spec.name
            )));
        }

        let container_id = {
            let mut bytes = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        };
        let port = self.port.unwrap_or(spec.exposed_port);

        self.running.lock().insert(container_id.clone());

        Ok(ContainerInfo {
            container_id,
            ip: self.address.to_string(),
            port,
            public_entry: spec.publish.then(|| format!("{}:{}", self.address, port)),
        })
    }

    async fn stop(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.running.lock().remove(container_id);
        Ok(())
    }
}
