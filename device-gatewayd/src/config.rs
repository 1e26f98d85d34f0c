use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use shared::protocol::{DEVICE_SERVICE_TYPE, PROXY_MOUNT, TARGET_HOST_HEADER};

/// Exclusive upper bound for `proxy.timeout_ms`
const MAX_PROXY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Restrict mDNS to one interface; all interfaces when unset
    #[serde(default)]
    pub interface: Option<String>,
    /// Minimum time between two re-validation sweeps of the device list
    #[serde(default = "default_check_period")]
    pub check_period_secs: u64,
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_mount")]
    pub mount: String,
    #[serde(default = "default_target_header")]
    pub target_header: String,
    #[serde(default = "default_proxy_timeout")]
    pub timeout_ms: u64,
    /// Accepted methods; `["*"]` accepts any method
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub auth: Option<DigestCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DigestCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_service_type() -> String {
    DEVICE_SERVICE_TYPE.to_string()
}

fn default_check_period() -> u64 {
    10
}

fn default_resolve_timeout() -> u64 {
    3000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/device-gateway/devices.db")
}

fn default_mount() -> String {
    PROXY_MOUNT.to_string()
}

fn default_target_header() -> String {
    TARGET_HOST_HEADER.to_string()
}

fn default_proxy_timeout() -> u64 {
    2000
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "PUT".to_string(), "OPTIONS".to_string()]
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            interface: None,
            check_period_secs: default_check_period(),
            resolve_timeout_ms: default_resolve_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mount: default_mount(),
            target_header: default_target_header(),
            timeout_ms: default_proxy_timeout(),
            methods: default_methods(),
            auth: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl DiscoveryConfig {
    pub fn check_period(&self) -> Duration {
        Duration::from_secs(self.check_period_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether `method` may be forwarded under this deployment's policy.
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods
            .iter()
            .any(|m| m == "*" || m.eq_ignore_ascii_case(method))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.proxy.timeout_ms == 0 || self.proxy.timeout_ms >= MAX_PROXY_TIMEOUT_MS {
            bail!(
                "proxy.timeout_ms must be between 1 and {} (got {})",
                MAX_PROXY_TIMEOUT_MS - 1,
                self.proxy.timeout_ms
            );
        }
        if !self.proxy.mount.starts_with('/') || self.proxy.mount.ends_with('/') {
            bail!("proxy.mount must start with '/' and not end with one (got {:?})", self.proxy.mount);
        }
        if self.proxy.methods.is_empty() {
            bail!("proxy.methods must name at least one method");
        }
        Ok(())
    }
}
