use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use super::transport::{DiscoveryEvent, DiscoveryTransport, ResolvedService, Subscription};

/// In-process transport: resolves whatever the test registers with `set`.
#[derive(Default)]
pub struct FakeTransport {
    hosts: Mutex<HashMap<String, IpAddr>>,
    resolves: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl FakeTransport {
    pub fn set(&self, raw_name: &str, addr: &str) {
        self.hosts
            .lock()
            .unwrap()
            .insert(raw_name.to_string(), addr.parse().unwrap());
    }

    pub fn unplug(&self, raw_name: &str) {
        self.hosts.lock().unwrap().remove(raw_name);
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

impl DiscoveryTransport for FakeTransport {
    fn subscribe(
        &self,
        _service_type: &str,
        _events: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<Subscription> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { token.cancelled().await });
        Ok(Subscription::new(cancel, task))
    }

    fn resolve(&self, _service_type: &str, raw_name: &str, _timeout: Duration) -> Option<ResolvedService> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        self.hosts
            .lock()
            .unwrap()
            .get(raw_name)
            .map(|addr| ResolvedService {
                raw_name: raw_name.to_string(),
                addresses: vec![*addr],
            })
    }
}
