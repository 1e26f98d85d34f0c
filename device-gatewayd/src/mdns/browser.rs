use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use mdns_sd::{HostnameResolutionEvent, ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use super::transport::{DiscoveryEvent, DiscoveryTransport, ResolvedService, Subscription};

/// Instance fullname -> advertised hostname, filled from browse results.
type HostTable = Arc<Mutex<HashMap<String, String>>>;

/// One lock per hostname. mdns-sd keeps a single resolver per hostname, so
/// a second query for the same host replaces the first one's listener.
#[derive(Default)]
struct HostLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HostLocks {
    fn for_host(&self, hostname: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(hostname.to_string())
            .or_default()
            .clone()
    }
}

/// Discovery backed by an mdns-sd daemon.
///
/// mdns-sd resolves instances while browsing, so the first resolved record
/// for an instance is reported as `Added` and later ones as `Updated`.
/// `resolve` re-queries the instance's hostname on the wire.
pub struct MdnsTransport {
    daemon: ServiceDaemon,
    hosts: HostTable,
    resolving: HostLocks,
}

impl MdnsTransport {
    pub fn new(daemon: ServiceDaemon) -> Self {
        Self {
            daemon,
            hosts: Arc::new(Mutex::new(HashMap::new())),
            resolving: HostLocks::default(),
        }
    }

    fn hostname_of(&self, raw_name: &str) -> Option<String> {
        self.hosts
            .lock()
            .ok()
            .and_then(|hosts| hosts.get(raw_name).cloned())
    }
}

impl DiscoveryTransport for MdnsTransport {
    fn subscribe(
        &self,
        service_type: &str,
        events: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<Subscription> {
        let receiver = self
            .daemon
            .browse(service_type)
            .with_context(|| format!("Failed to browse {}", service_type))?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_browser(
            self.daemon.clone(),
            service_type.to_string(),
            receiver,
            events,
            self.hosts.clone(),
            cancel.clone(),
        ));

        Ok(Subscription::new(cancel, task))
    }

    fn resolve(&self, service_type: &str, raw_name: &str, timeout: Duration) -> Option<ResolvedService> {
        let Some(hostname) = self.hostname_of(raw_name) else {
            tracing::debug!("No hostname known for {} ({})", raw_name, service_type);
            return None;
        };

        // Held until the resolver is stopped
        let host_lock = self.resolving.for_host(&hostname);
        let _resolving = host_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let receiver = match self
            .daemon
            .resolve_hostname(&hostname, Some(timeout.as_millis() as u64))
        {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::warn!("Failed to start resolving {}: {}", hostname, e);
                return None;
            }
        };

        let deadline = Instant::now() + timeout;
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(remaining) {
                Ok(HostnameResolutionEvent::AddressesFound(_, addresses)) if !addresses.is_empty() => {
                    break Some(ResolvedService {
                        raw_name: raw_name.to_string(),
                        addresses: addresses.into_iter().collect(),
                    });
                }
                Ok(HostnameResolutionEvent::SearchTimeout(_)) | Err(_) => break None,
                Ok(_) => {}
            }
        };

        if let Err(e) = self.daemon.stop_resolve_hostname(&hostname) {
            tracing::debug!("Failed to stop resolving {}: {}", hostname, e);
        }
        result
    }
}

async fn run_browser(
    daemon: ServiceDaemon,
    service_type: String,
    receiver: flume::Receiver<ServiceEvent>,
    events: mpsc::Sender<DiscoveryEvent>,
    hosts: HostTable,
    cancel: CancellationToken,
) {
    tracing::info!("Browsing {}", service_type);

    let mut known = HashSet::new();

    loop {
        let event = tokio::select! {
            event = receiver.recv_async() => event,
            _ = cancel.cancelled() => break,
        };

        let event = match event {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let fullname = info.get_fullname().to_string();
                if let Ok(mut hosts) = hosts.lock() {
                    hosts.insert(fullname.clone(), info.get_hostname().to_string());
                }
                if known.insert(fullname.clone()) {
                    DiscoveryEvent::Added(fullname)
                } else {
                    DiscoveryEvent::Updated(fullname)
                }
            }
            Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                known.remove(&fullname);
                DiscoveryEvent::Removed(fullname)
            }
            Ok(other) => {
                tracing::trace!("Ignoring mDNS event {:?}", other);
                continue;
            }
            Err(e) => {
                tracing::warn!("mDNS browse of {} disconnected: {}", service_type, e);
                break;
            }
        };

        tracing::debug!("Discovery event: {:?}", event);
        if events.send(event).await.is_err() {
            tracing::debug!("Discovery event receiver dropped");
            break;
        }
    }

    if let Err(e) = daemon.stop_browse(&service_type) {
        tracing::debug!("Failed to stop browsing {}: {}", service_type, e);
    }
    tracing::info!("Stopped browsing {}", service_type);
}
