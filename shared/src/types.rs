use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A device discovered on the network.
/// This is the canonical data model used by the gateway daemon and its API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Human identity taken from the advertised name, e.g. "dock-door-3"
    pub name: String,

    /// Hardware identity from the bracketed part of the advertised name,
    /// usually the MAC address. Never changes once recorded.
    pub hardware_id: String,

    /// Last address the device resolved to (IPv4 or IPv6 literal)
    pub address: String,

    /// Last time a resolve for this device succeeded
    pub last_seen: DateTime<Utc>,

    /// Whether the most recent resolve attempt succeeded
    pub online: bool,
}
