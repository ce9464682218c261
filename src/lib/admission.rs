//! Per-instance proxy admission.
//!
//! One entry per instance id holds either `-1` (known not to be a proxied
//! instance) or the number of open proxy connections. Validity lookups are
//! cached briefly, while entries with open connections live long enough to
//! outlast any relay. Every read-modify-write happens under a single lock, so
//! concurrent connects can never push a count past the limit.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::db::StoreError;

const INVALID: i64 = -1;
/// cache lifetime of a validity lookup
pub const VALIDITY_TTL: Duration = Duration::from_secs(10 * 60);
/// lifetime of an entry with open connections
pub const ACTIVE_TTL: Duration = Duration::from_secs(10 * 60 * 60);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AdmitError {
    #[error("not a proxied instance")]
    Unknown,
    #[error("instance already has {0} connections")]
    Full(i64),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires: Instant,
}

impl Entry {
    fn new(value: i64, ttl: Duration) -> Self {
        Self {
            value,
            expires: Instant::now() + ttl,
        }
    }
}

#[derive(Debug)]
pub struct AdmissionController {
    entries: Mutex<HashMap<Uuid, Entry>>,
    max_connections: i64,
}

impl AdmissionController {
    pub fn new(max_connections: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_connections,
        }
    }

    fn get(&self, id: &Uuid) -> Option<i64> {
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.value),
            Some(_) => {
                entries.remove(id);
                None
            }
            None => None,
        }
    }

    /// Whether `id` may be proxied to. Misses ask `lookup` and cache the
    /// answer, lookup errors are not cached.
    pub async fn validate<F, Fut>(&self, id: Uuid, lookup: F) -> Result<bool, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<bool, StoreError>>,
    {
        if let Some(value) = self.get(&id) {
            return Ok(value != INVALID);
        }

        let valid = lookup().await?;

        // a connection may have been admitted while we were looking up
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(&id) {
            Some(entry) if entry.expires > now => Ok(entry.value != INVALID),
            _ => {
                let value = if valid { 0 } else { INVALID };
                entries.insert(id, Entry::new(value, VALIDITY_TTL));
                debug!(instance = %id, valid, "cached proxy validity");
                Ok(valid)
            }
        }
    }

    /// Counts one more connection to `id`
    pub fn admit(&self, id: Uuid) -> Result<(), AdmitError> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        let current = match entries.get(&id) {
            Some(entry) if entry.expires > now => entry.value,
            _ => return Err(AdmitError::Unknown),
        };

        if current == INVALID {
            return Err(AdmitError::Unknown);
        }
        if current >= self.max_connections {
            return Err(AdmitError::Full(current));
        }

        entries.insert(id, Entry::new(current + 1, ACTIVE_TTL));
        Ok(())
    }

    /// Gives back a connection admitted with [`AdmissionController::admit`]
    pub fn release(&self, id: Uuid) {
        let mut entries = self.entries.lock();

        match entries.get(&id).map(|e| e.value) {
            Some(count) if count > 1 => {
                entries.insert(id, Entry::new(count - 1, ACTIVE_TTL));
            }
            // idle again, fall back to a short lived validity entry
            Some(1) => {
                entries.insert(id, Entry::new(0, VALIDITY_TTL));
            }
            _ => {}
        }
    }

    /// Admits and hands out a guard that releases on drop
    pub fn slot(self: &Arc<Self>, id: Uuid) -> Result<AdmissionSlot, AdmitError> {
        self.admit(id)?;
        Ok(AdmissionSlot {
            controller: Arc::clone(self),
            id,
        })
    }

    /// Open connections, None if nothing is cached or the id is invalid
    pub fn connections(&self, id: Uuid) -> Option<i64> {
        self.get(&id).filter(|v| *v != INVALID)
    }

    /// Forgets a cached verdict, e.g. after the instance was destroyed
    pub fn forget(&self, id: Uuid) {
        let mut entries = self.entries.lock();
        if matches!(entries.get(&id), Some(e) if e.value <= 0) {
            entries.remove(&id);
        }
    }

    /// Drops expired entries, returns how many
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires > now);
        before - entries.len()
    }
}

/// One admitted proxy connection
#[derive(Debug)]
pub struct AdmissionSlot {
    controller: Arc<AdmissionController>,
    id: Uuid,
}

impl AdmissionSlot {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.controller.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn valid(ctl: &AdmissionController, id: Uuid, answer: bool) -> bool {
        ctl.validate(id, || async move { Ok::<_, StoreError>(answer) })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit() {
        let ctl = Arc::new(AdmissionController::new(64));
        let id = Uuid::new_v4();
        assert!(valid(&ctl, id, true).await);

        let slots: Vec<_> = (0..64).map(|_| ctl.slot(id).unwrap()).collect();
        assert_eq!(ctl.connections(id), Some(64));
        assert_eq!(ctl.slot(id).unwrap_err(), AdmitError::Full(64));

        drop(slots);
        assert_eq!(ctl.connections(id), Some(0));
        assert!(ctl.slot(id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_is_cached() {
        let ctl = AdmissionController::new(64);
        let id = Uuid::new_v4();
        let lookups = AtomicUsize::new(0);

        for _ in 0..3 {
            let ok = ctl
                .validate(id, || async {
                    lookups.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StoreError>(false)
                })
                .await
                .unwrap();
            assert!(!ok);
        }
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.admit(id), Err(AdmitError::Unknown));

        // verdict expires
        tokio::time::advance(VALIDITY_TTL + Duration::from_secs(1)).await;
        assert!(valid(&ctl, id, true).await);
        assert!(ctl.admit(id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unvalidated_is_rejected() {
        let ctl = AdmissionController::new(64);
        assert_eq!(ctl.admit(Uuid::new_v4()), Err(AdmitError::Unknown));
    }

    #[tokio::test(start_paused = true)]
    async fn active_entries_outlive_validity() {
        let ctl = Arc::new(AdmissionController::new(2));
        let id = Uuid::new_v4();
        assert!(valid(&ctl, id, true).await);

        let slot = ctl.slot(id).unwrap();
        tokio::time::advance(VALIDITY_TTL * 3).await;
        assert_eq!(ctl.prune(), 0);
        assert_eq!(ctl.connections(id), Some(1));

        drop(slot);
        assert_eq!(ctl.connections(id), Some(0));
        tokio::time::advance(VALIDITY_TTL + Duration::from_secs(1)).await;
        assert_eq!(ctl.prune(), 1);
        assert_eq!(ctl.connections(id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn release_never_goes_negative() {
        let ctl = AdmissionController::new(64);
        let id = Uuid::new_v4();
        assert!(valid(&ctl, id, true).await);

        ctl.release(id);
        ctl.release(id);
        assert_eq!(ctl.connections(id), Some(0));

        // and never turns an invalid id valid
        let bad = Uuid::new_v4();
        assert!(!valid(&ctl, bad, false).await);
        ctl.release(bad);
        assert!(!valid(&ctl, bad, true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_admits_respect_limit() {
        let ctl = Arc::new(AdmissionController::new(64));
        let id = Uuid::new_v4();
        assert!(valid(&ctl, id, true).await);

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let ctl = Arc::clone(&ctl);
                tokio::spawn(async move { ctl.admit(id).is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 64);
        assert_eq!(ctl.connections(id), Some(64));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_keeps_open_connections() {
        let ctl = Arc::new(AdmissionController::new(64));
        let id = Uuid::new_v4();
        assert!(valid(&ctl, id, true).await);

        let _slot = ctl.slot(id).unwrap();
        ctl.forget(id);
        assert_eq!(ctl.connections(id), Some(1));
    }
}
