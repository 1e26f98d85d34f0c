/// mDNS service type the devices advertise themselves under
pub const DEVICE_SERVICE_TYPE: &str = "_workstation._tcp.local.";

/// Request header carrying the upstream the gateway forwards to
pub const TARGET_HOST_HEADER: &str = "X-Target-Host";

/// Path the reverse proxy is mounted under
pub const PROXY_MOUNT: &str = "/keonn_proxy";

/// API path prefix
pub const API_PREFIX: &str = "/v1";
