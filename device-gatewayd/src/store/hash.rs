use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::types::DeviceRecord;

/// last_seen moves on every successful sweep, so it is left out; a page that
/// polls the hash only needs to re-render when identity, address or
/// liveness changed.
#[derive(Serialize)]
struct HashView<'a> {
    name: &'a str,
    hardware_id: &'a str,
    address: &'a str,
    online: bool,
}

/// Computes a SHA-256 hash of the device list.
/// Devices are sorted by name for deterministic output.
pub fn compute_hash(devices: &[DeviceRecord]) -> String {
    let mut views: Vec<HashView<'_>> = devices
        .iter()
        .map(|d| HashView {
            name: &d.name,
            hardware_id: &d.hardware_id,
            address: &d.address,
            online: d.online,
        })
        .collect();
    views.sort_by(|a, b| a.name.cmp(b.name));

    let mut hasher = Sha256::new();
    for view in &views {
        hasher.update(serde_json::to_vec(view).unwrap_or_default());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
