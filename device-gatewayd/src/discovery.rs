use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use shared::types::DeviceRecord;
use crate::config::DiscoveryConfig;
use crate::mdns::name::AdvertisedName;
use crate::mdns::{DiscoveryEvent, DiscoveryTransport, ResolvedService, Subscription};
use crate::store::db::DeviceUpdate;
use crate::store::{StoreError, StoreResult};
use crate::store_manager::StoreHandle;

const EVENT_BUFFER: usize = 256;

/// Keeps the device store in line with what the network announces and
/// bounds how often the transport is asked to re-resolve every device.
pub struct DiscoveryCache {
    transport: Arc<dyn DiscoveryTransport>,
    store: StoreHandle,
    config: DiscoveryConfig,
    events: mpsc::Sender<DiscoveryEvent>,
    /// When the last full sweep finished. Held across the sweep itself.
    last_sweep: Mutex<Option<Instant>>,
    subscription: Mutex<Option<Subscription>>,
    /// Device name -> instance name exactly as last announced. Sweeps resolve
    /// only devices present here.
    instances: std::sync::Mutex<HashMap<String, String>>,
}

impl DiscoveryCache {
    /// Build the cache. The returned receiver must be driven by [`run`].
    pub fn new(
        transport: Arc<dyn DiscoveryTransport>,
        store: StoreHandle,
        config: DiscoveryConfig,
    ) -> (Arc<Self>, mpsc::Receiver<DiscoveryEvent>) {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let cache = Arc::new(Self {
            transport,
            store,
            config,
            events,
            last_sweep: Mutex::new(None),
            subscription: Mutex::new(None),
            instances: std::sync::Mutex::new(HashMap::new()),
        });
        (cache, rx)
    }

    /// Subscribe to the transport if not already subscribed.
    pub async fn start(&self) -> Result<()> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_none() {
            *subscription = Some(
                self.transport
                    .subscribe(&self.config.service_type, self.events.clone())?,
            );
        }
        Ok(())
    }

    /// Drop the transport subscription and create a fresh one. The next
    /// listing re-validates every device.
    pub async fn restart(&self) -> Result<()> {
        tracing::info!("Restarting discovery of {}", self.config.service_type);

        let mut subscription = self.subscription.lock().await;
        if let Some(old) = subscription.take() {
            old.cancel().await;
        }
        *subscription = Some(
            self.transport
                .subscribe(&self.config.service_type, self.events.clone())?,
        );
        drop(subscription);

        *self.last_sweep.lock().await = None;
        Ok(())
    }

    /// Cancel the transport subscription.
    pub async fn shutdown(&self) {
        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.cancel().await;
        }
    }

    pub async fn on_added(&self, raw_name: &str) {
        self.announce(raw_name).await;
    }

    pub async fn on_updated(&self, raw_name: &str) {
        self.announce(raw_name).await;
    }

    pub async fn on_removed(&self, raw_name: &str) {
        let Some(parsed) = self.parse(raw_name) else {
            return;
        };

        self.forget_instance(&parsed.name, raw_name);

        match self.store.update(parsed.name.clone(), DeviceUpdate::offline()).await {
            Ok(_) => tracing::info!("Device {} went offline", parsed.name),
            Err(StoreError::NotFound(_)) => {
                tracing::debug!("Removal of unknown device {}", parsed.name);
            }
            Err(e) => tracing::error!("Failed to mark {} offline: {}", parsed.name, e),
        }
    }

    /// Current device list. Re-resolves every known device first when the
    /// last sweep is older than the check period.
    pub async fn list_devices(&self) -> StoreResult<Vec<DeviceRecord>> {
        {
            let mut last_sweep = self.last_sweep.lock().await;
            let stale = last_sweep
                .map_or(true, |at| at.elapsed() > self.config.check_period());
            if stale {
                self.sweep().await?;
                *last_sweep = Some(Instant::now());
            }
        }
        self.store.list().await
    }

    /// Single device lookup without a sweep.
    pub async fn get_device(&self, name: &str) -> StoreResult<Option<DeviceRecord>> {
        self.store.get(name.to_string()).await
    }

    async fn sweep(&self) -> StoreResult<()> {
        let devices = self.store.list().await?;
        let targets: Vec<(String, String)> = {
            let instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
            devices
                .iter()
                .filter_map(|device| {
                    instances
                        .get(&device.name)
                        .map(|raw| (device.name.clone(), raw.clone()))
                })
                .collect()
        };
        tracing::debug!(
            "Re-validating {} of {} devices ({} not announced since start)",
            targets.len(),
            devices.len(),
            devices.len() - targets.len()
        );

        let results = join_all(targets.into_iter().map(|(name, raw_name)| async move {
            let update = self.resolve_update(&raw_name).await;
            (name, update)
        }))
        .await;

        for (name, update) in results {
            if let Err(e) = self.store.update(name.clone(), update).await {
                tracing::error!("Failed to refresh {}: {}", name, e);
            }
        }
        Ok(())
    }

    async fn announce(&self, raw_name: &str) {
        let Some(parsed) = self.parse(raw_name) else {
            return;
        };

        let update = self.resolve_update(raw_name).await;
        let online = update.online == Some(true);

        match self
            .store
            .get_or_create(parsed.name.clone(), parsed.hardware_id.clone(), update)
            .await
        {
            Ok((record, true)) => {
                self.remember_instance(&record.name, raw_name);
                tracing::info!("New device {} [{}] at {:?}", record.name, record.hardware_id, record.address);
            }
            Ok((record, false)) => {
                self.remember_instance(&record.name, raw_name);
                tracing::debug!("Updated device {} (online: {})", record.name, online);
            }
            Err(StoreError::IdentityMismatch { name, stored, advertised }) => {
                tracing::warn!(
                    "Ignoring announcement of {} with hardware id {}; already bound to {}",
                    name,
                    advertised,
                    stored
                );
            }
            Err(e) => tracing::error!("Failed to record {}: {}", parsed.name, e),
        }
    }

    /// Resolve an announced instance and turn the outcome into a store update.
    async fn resolve_update(&self, raw_name: &str) -> DeviceUpdate {
        match self.resolve(raw_name).await.and_then(|r| r.preferred_address()) {
            Some(address) => DeviceUpdate::seen(address.to_string(), Utc::now()),
            None => {
                tracing::debug!("Could not resolve {}", raw_name);
                DeviceUpdate::offline()
            }
        }
    }

    async fn resolve(&self, raw_name: &str) -> Option<ResolvedService> {
        let transport = self.transport.clone();
        let service_type = self.config.service_type.clone();
        let instance = raw_name.to_string();
        let timeout = self.config.resolve_timeout();

        match tokio::task::spawn_blocking(move || transport.resolve(&service_type, &instance, timeout)).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!("Resolve task for {} failed: {}", raw_name, e);
                None
            }
        }
    }

    fn remember_instance(&self, name: &str, raw_name: &str) {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), raw_name.to_string());
    }

    /// Only forgets `name` if it was last announced under `raw_name`.
    fn forget_instance(&self, name: &str, raw_name: &str) {
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        if instances.get(name).is_some_and(|known| known == raw_name) {
            instances.remove(name);
        }
    }

    fn parse(&self, raw_name: &str) -> Option<AdvertisedName> {
        match AdvertisedName::parse(raw_name, &self.config.service_type) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Discarding discovery event: {}", e);
                None
            }
        }
    }

    #[cfg(test)]
    async fn backdate_sweep(&self, by: std::time::Duration) {
        if let Some(at) = self.last_sweep.lock().await.as_mut() {
            *at -= by;
        }
    }
}

/// Discovery event loop: applies transport events to the cache one at a time.
pub async fn run(
    cache: Arc<DiscoveryCache>,
    mut rx: mpsc::Receiver<DiscoveryEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                match event {
                    DiscoveryEvent::Added(name) => cache.on_added(&name).await,
                    DiscoveryEvent::Updated(name) => cache.on_updated(&name).await,
                    DiscoveryEvent::Removed(name) => cache.on_removed(&name).await,
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Discovery loop shutting down");
                break;
            }
        }
    }

    Ok(())
}
