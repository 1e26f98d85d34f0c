use std::net::IpAddr;
use std::time::Duration;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Presence notifications for one service type, keyed by the raw instance name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Added(String),
    Updated(String),
    Removed(String),
}

/// Answer to a resolve query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub raw_name: String,
    pub addresses: Vec<IpAddr>,
}

impl ResolvedService {
    /// The address recorded for a device: IPv4 first, then the lowest IPv6.
    pub fn preferred_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .copied()
            .min_by_key(|addr| (addr.is_ipv6(), *addr))
    }
}

/// Multicast discovery backend.
///
/// `subscribe` pushes events for `service_type` into `events` until the
/// returned subscription is cancelled. `resolve` blocks for at most `timeout`
/// and must be called off the async runtime.
pub trait DiscoveryTransport: Send + Sync + 'static {
    fn subscribe(
        &self,
        service_type: &str,
        events: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<Subscription>;

    fn resolve(&self, service_type: &str, raw_name: &str, timeout: Duration) -> Option<ResolvedService>;
}

/// A running event pump. Dropping it stops delivery; `cancel` additionally
/// waits for the pump to finish.
pub struct Subscription {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub async fn cancel(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Discovery subscription ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
