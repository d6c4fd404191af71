// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Gate Configuration Types
//
// Defines the configuration schema for a reconcile gate, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Per-visitor API rate limiting and idle eviction
// - Image index capacity, lookup deadline and target platform
// - Registry transport settings
// - Logging and metrics settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::image::Platform;

pub const API_VERSION: &str = "reconcile-gate/v1";
pub const KIND: &str = "GateConfig";

/// Top-level Kubernetes-style gate configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfigManifest {
    /// API version (must be "reconcile-gate/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "GateConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: GateConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable gate name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Gate configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfigSpec {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub image_index: ImageIndexConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// When false every visitor is admitted
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Steady-state tokens per second per visitor
    #[serde(default = "default_rate_limit")]
    pub limit: f64,

    /// Bucket capacity
    #[serde(default = "default_rate_burst")]
    pub burst: u32,

    /// How often idle visitors are swept
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Visitors unseen for this long are evicted
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Headers consulted, in order, for the client IP (e.g. "X-Forwarded-For")
    #[serde(default)]
    pub ip_key_headers: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: default_rate_limit(),
            burst: default_rate_burst(),
            sweep_interval: default_sweep_interval(),
            idle_timeout: default_idle_timeout(),
            ip_key_headers: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndexConfig {
    /// Maximum cached image commands
    #[serde(default = "default_image_capacity")]
    pub capacity: usize,

    /// Deadline applied to lookups that carry none of their own
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub lookup_timeout: Option<Duration>,

    /// Platform selected from multi-platform images, "os/arch[/variant]".
    /// Default: the host platform
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl Default for ImageIndexConfig {
    fn default() -> Self {
        Self {
            capacity: default_image_capacity(),
            lookup_timeout: None,
            platform: None,
        }
    }
}

impl ImageIndexConfig {
    pub fn platform(&self) -> anyhow::Result<Platform> {
        match &self.platform {
            Some(p) => p.parse().map_err(|e: String| anyhow::anyhow!(e)),
            None => Ok(Platform::host()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Per-request timeout for registry HTTP calls
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Registries reached over plain HTTP (host or host:port)
    #[serde(default)]
    pub insecure_registries: Vec<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Explicit credentials file; overrides keychain discovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_file: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            insecure_registries: vec![],
            user_agent: default_user_agent(),
            auth_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_metrics_port(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_rate_limit() -> f64 {
    1000.0
}

fn default_rate_burst() -> u32 {
    1000
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_image_capacity() -> usize {
    1024
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    format!("reconcile-gate/{}", env!("CARGO_PKG_VERSION"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for GateConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "reconcile-gate".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                labels: None,
            },
            spec: GateConfigSpec::default(),
        }
    }
}

impl GateConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. RECONCILE_GATE_CONFIG_PATH environment variable
    /// 2. ./reconcile-gate.yaml (working directory)
    /// 3. ~/.reconcile-gate/config.yaml (user home)
    /// 4. /etc/reconcile-gate/config.yaml (Unix)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("RECONCILE_GATE_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./reconcile-gate.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".reconcile-gate").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        {
            let system_config = PathBuf::from("/etc/reconcile-gate/config.yaml");
            if system_config.exists() {
                return Some(system_config);
            }
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(explicit_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // An explicit path must exist and parse
        if let Some(path) = explicit_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            config.validate()?;
            return Ok(config);
        }

        let mut config = if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            Self::from_yaml_file(config_path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("RECONCILE_GATE_API_RATE_LIMIT") {
            match val.parse::<f64>() {
                Ok(limit) => {
                    tracing::info!("Environment override: RECONCILE_GATE_API_RATE_LIMIT={}", limit);
                    self.spec.rate_limit.limit = limit;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for RECONCILE_GATE_API_RATE_LIMIT: '{}'. Expected a number. Ignoring.",
                    val
                ),
            }
        }

        if let Some(val) = lookup("RECONCILE_GATE_API_RATE_BURST") {
            match val.parse::<u32>() {
                Ok(burst) => {
                    tracing::info!("Environment override: RECONCILE_GATE_API_RATE_BURST={}", burst);
                    self.spec.rate_limit.burst = burst;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for RECONCILE_GATE_API_RATE_BURST: '{}'. Expected an integer. Ignoring.",
                    val
                ),
            }
        }

        if let Some(val) = lookup("IP_KEY_FUNC_HEADERS") {
            let headers: Vec<String> = val
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
            if !headers.is_empty() {
                tracing::info!("Environment override: IP_KEY_FUNC_HEADERS={}", val);
                self.spec.rate_limit.ip_key_headers = headers;
            }
        }

        if let Some(val) = lookup("RECONCILE_GATE_IMAGE_CACHE_CAPACITY") {
            match val.parse::<usize>() {
                Ok(capacity) => {
                    tracing::info!("Environment override: RECONCILE_GATE_IMAGE_CACHE_CAPACITY={}", capacity);
                    self.spec.image_index.capacity = capacity;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for RECONCILE_GATE_IMAGE_CACHE_CAPACITY: '{}'. Expected an integer. Ignoring.",
                    val
                ),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let rate_limit = &self.spec.rate_limit;
        if !rate_limit.limit.is_finite() || rate_limit.limit <= 0.0 {
            anyhow::bail!("spec.rate_limit.limit must be a positive number, got {}", rate_limit.limit);
        }
        if rate_limit.burst == 0 {
            anyhow::bail!("spec.rate_limit.burst must be at least 1");
        }
        if rate_limit.sweep_interval.is_zero() {
            anyhow::bail!("spec.rate_limit.sweep_interval must be greater than zero");
        }

        if self.spec.image_index.capacity == 0 {
            anyhow::bail!("spec.image_index.capacity must be at least 1");
        }
        self.spec.image_index.platform()?;

        if self.spec.registry.request_timeout.is_zero() {
            anyhow::bail!("spec.registry.request_timeout must be greater than zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = GateConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.image_index.capacity, 1024);
        assert!(manifest.spec.rate_limit.enabled);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_with_durations() {
        let yaml = r#"
apiVersion: reconcile-gate/v1
kind: GateConfig
metadata:
  name: controller-a
spec:
  rate_limit:
    limit: 5
    burst: 10
    sweep_interval: 30s
    idle_timeout: 2m
    ip_key_headers: ["X-Forwarded-For"]
  image_index:
    capacity: 16
    lookup_timeout: 5s
    platform: linux/arm64
  registry:
    insecure_registries: ["localhost:5000"]
"#;
        let manifest = GateConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.metadata.name, "controller-a");
        assert_eq!(manifest.spec.rate_limit.limit, 5.0);
        assert_eq!(manifest.spec.rate_limit.burst, 10);
        assert_eq!(manifest.spec.rate_limit.sweep_interval, Duration::from_secs(30));
        assert_eq!(manifest.spec.rate_limit.idle_timeout, Duration::from_secs(120));
        assert_eq!(manifest.spec.image_index.lookup_timeout, Some(Duration::from_secs(5)));
        assert_eq!(manifest.spec.image_index.platform().unwrap(), Platform::new("linux", "arm64"));
        assert_eq!(manifest.spec.registry.insecure_registries, vec!["localhost:5000"]);
        assert_eq!(manifest.spec.registry.request_timeout, Duration::from_secs(30));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_string_parses_back() {
        let manifest = GateConfigManifest::default();
        let yaml = manifest.to_yaml_string().unwrap();
        let parsed = GateConfigManifest::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.metadata.name, manifest.metadata.name);
        assert_eq!(parsed.spec.rate_limit.idle_timeout, manifest.spec.rate_limit.idle_timeout);
    }

    #[test]
    fn test_validation() {
        let mut manifest = GateConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "WrongKind".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.rate_limit.limit = 0.0;
        assert!(manifest.validate().is_err());
        manifest.spec.rate_limit.limit = 1.0;

        manifest.spec.rate_limit.burst = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.rate_limit.burst = 1;

        manifest.spec.image_index.capacity = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.image_index.capacity = 8;

        manifest.spec.image_index.platform = Some("linux".to_string());
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut manifest = GateConfigManifest::default();
        let env = HashMap::from([
            ("RECONCILE_GATE_API_RATE_LIMIT", "2.5"),
            ("RECONCILE_GATE_API_RATE_BURST", "not-a-number"),
            ("IP_KEY_FUNC_HEADERS", "X-Forwarded-For, X-Real-IP"),
            ("RECONCILE_GATE_IMAGE_CACHE_CAPACITY", "64"),
        ]);
        manifest.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(manifest.spec.rate_limit.limit, 2.5);
        assert_eq!(manifest.spec.rate_limit.burst, 1000);
        assert_eq!(manifest.spec.rate_limit.ip_key_headers, vec!["X-Forwarded-For", "X-Real-IP"]);
        assert_eq!(manifest.spec.image_index.capacity, 64);
    }
}
