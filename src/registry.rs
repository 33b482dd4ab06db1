//! Naming/registry service.
//!
//! A process-wide directory mapping logical instrument names to network
//! endpoints and driver types. The registry is an explicitly owned service
//! instance: it is constructed at process start and handed to the proxy by
//! `Arc`, never reached through ambient global state.
//!
//! Entries carry a liveness TTL. Hosts renew their registrations
//! periodically; entries that are not renewed are evicted both by a
//! background sweep task and lazily at lookup time, so a stale name is
//! never observable past its TTL regardless of sweep timing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RegistrySettings;
use crate::error::LabError;

/// Public record for one registered instrument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentDescriptor {
    /// Unique logical name (e.g. "laser-1").
    pub name: String,
    /// Driver type tag (e.g. "scpi").
    pub driver_type: String,
    /// Host the instrument is attached to.
    pub host: String,
    /// Proxy port on that host.
    pub port: u16,
}

struct Entry {
    descriptor: InstrumentDescriptor,
    registered_at: DateTime<Utc>,
    last_renewed: Instant,
}

pub struct Registry {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl Registry {
    pub fn new(settings: &RegistrySettings) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: settings.entry_ttl,
            sweep_interval: settings.sweep_interval,
        }
    }

    /// Bind a name to a descriptor.
    ///
    /// Re-registering an identical descriptor is treated as a renewal, so a
    /// restarting host does not conflict with itself. A different descriptor
    /// under a live name fails with `NameConflict`.
    pub async fn register(&self, descriptor: InstrumentDescriptor) -> Result<(), LabError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        if let Some(existing) = entries.get_mut(&descriptor.name) {
            if now.duration_since(existing.last_renewed) <= self.ttl {
                if existing.descriptor == descriptor {
                    existing.last_renewed = now;
                    debug!(name = %descriptor.name, "re-registration renewed");
                    return Ok(());
                }
                return Err(LabError::NameConflict(descriptor.name));
            }
            // Expired entry: the name is free again.
        }

        info!(
            name = %descriptor.name,
            host = %descriptor.host,
            port = descriptor.port,
            driver = %descriptor.driver_type,
            "instrument registered"
        );
        entries.insert(
            descriptor.name.clone(),
            Entry {
                descriptor,
                registered_at: Utc::now(),
                last_renewed: now,
            },
        );
        Ok(())
    }

    /// Resolve a name. Expired entries fail with `NotFound`.
    pub async fn lookup(&self, name: &str) -> Result<InstrumentDescriptor, LabError> {
        let entries = self.entries.read().await;
        match entries.get(name) {
            Some(entry) if entry.last_renewed.elapsed() <= self.ttl => {
                Ok(entry.descriptor.clone())
            }
            _ => Err(LabError::NotFound(name.to_string())),
        }
    }

    pub async fn deregister(&self, name: &str) -> Result<(), LabError> {
        let mut entries = self.entries.write().await;
        match entries.remove(name) {
            Some(entry) => {
                let lifetime = Utc::now().signed_duration_since(entry.registered_at);
                info!(name, %lifetime, "instrument deregistered");
                Ok(())
            }
            None => Err(LabError::NotFound(name.to_string())),
        }
    }

    /// Reset the TTL of a live entry.
    pub async fn renew(&self, name: &str) -> Result<(), LabError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(name) {
            Some(entry) if entry.last_renewed.elapsed() <= self.ttl => {
                entry.last_renewed = Instant::now();
                Ok(())
            }
            _ => Err(LabError::NotFound(name.to_string())),
        }
    }

    /// All live names, unordered.
    pub async fn list(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(_, e)| e.last_renewed.elapsed() <= self.ttl)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Remove every expired entry. Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.last_renewed.elapsed() <= self.ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "registry sweep evicted stale entries");
        }
        evicted
    }

    /// Spawn the background expiry sweep. The task runs until aborted.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, port: u16) -> InstrumentDescriptor {
        InstrumentDescriptor {
            name: name.to_string(),
            driver_type: "scpi".to_string(),
            host: "10.0.0.5".to_string(),
            port,
        }
    }

    fn registry(ttl_ms: u64) -> Registry {
        Registry::new(&RegistrySettings {
            entry_ttl: Duration::from_millis(ttl_ms),
            sweep_interval: Duration::from_millis(ttl_ms / 2),
        })
    }

    #[tokio::test]
    async fn test_register_lookup_deregister() {
        let registry = registry(10_000);
        let d = descriptor("laser-1", 9000);
        registry.register(d.clone()).await.unwrap();

        assert_eq!(registry.lookup("laser-1").await.unwrap(), d);

        registry.deregister("laser-1").await.unwrap();
        assert!(matches!(
            registry.lookup("laser-1").await,
            Err(LabError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_conflicting_registration_fails() {
        let registry = registry(10_000);
        registry.register(descriptor("laser-1", 9000)).await.unwrap();

        let err = registry
            .register(descriptor("laser-1", 9001))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::NameConflict(_)));

        // Same descriptor again is a renewal, not a conflict.
        registry.register(descriptor("laser-1", 9000)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_without_renewal() {
        let registry = registry(100);
        registry.register(descriptor("laser-1", 9000)).await.unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(matches!(
            registry.lookup("laser-1").await,
            Err(LabError::NotFound(_))
        ));

        // The stale name is free for a different descriptor.
        registry.register(descriptor("laser-1", 9001)).await.unwrap();
        assert_eq!(registry.lookup("laser-1").await.unwrap().port, 9001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_ttl() {
        let registry = registry(100);
        registry.register(descriptor("laser-1", 9000)).await.unwrap();

        tokio::time::advance(Duration::from_millis(80)).await;
        registry.renew("laser-1").await.unwrap();

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(registry.lookup("laser-1").await.is_ok());

        tokio::time::advance(Duration::from_millis(120)).await;
        assert!(matches!(
            registry.renew("laser-1").await,
            Err(LabError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_stale() {
        let registry = registry(100);
        registry.register(descriptor("laser-1", 9000)).await.unwrap();
        registry.register(descriptor("stage-1", 9000)).await.unwrap();

        tokio::time::advance(Duration::from_millis(80)).await;
        registry.renew("stage-1").await.unwrap();
        tokio::time::advance(Duration::from_millis(40)).await;

        assert_eq!(registry.sweep().await, 1);
        assert!(registry.lookup("stage-1").await.is_ok());

        let names = registry.list().await;
        assert_eq!(names, vec!["stage-1".to_string()]);
    }
}
