use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::instance::InstanceManager;

/// Tears down expired instances every `every`
pub async fn run(instances: Arc<InstanceManager>, admission: Arc<AdmissionController>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;

        match instances.sweep().await {
            Ok(destroyed) if destroyed.is_empty() => {}
            Ok(destroyed) => {
                for id in &destroyed {
                    admission.forget(*id);
                }
                info!("swept {} expired instances", destroyed.len());
            }
            Err(e) => warn!("sweep failed: {:?}", e),
        }

        let pruned = admission.prune();
        if pruned > 0 {
            debug!("pruned {} admission entries", pruned);
        }
    }
}
