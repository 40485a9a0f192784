// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Agent Configuration Types
//
// Defines the configuration schema for the fwsync host agent, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Collaborator endpoints (inventory command, policy service, VM directory)
// - Firewall backend command
// - HTTP API and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub const API_VERSION: &str = "fwsync/v1";
pub const KIND: &str = "AgentConfig";

/// Top-level agent configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigManifest {
    /// API version (must be "fwsync/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "AgentConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: AgentConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable agent name, defaults to the hostname
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfigSpec {
    #[serde(default)]
    pub server: ServerIdentity,

    #[serde(default)]
    pub inventory: InventoryConfig,

    /// Policy service (which rules apply to a VM)
    #[serde(default)]
    pub policy: ServiceEndpoint,

    /// VM directory (remote VM resolution)
    #[serde(default = "ServiceEndpoint::directory_default")]
    pub directory: ServiceEndpoint,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Identity of the compute node this agent runs on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Stamped on every VM listed by the inventory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// Listing command; must print a JSON array of VM objects
    #[serde(default = "default_inventory_command")]
    pub command: String,

    #[serde(default = "default_inventory_args")]
    pub args: Vec<String>,

    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Base URL, e.g. "http://fwapi.local"
    pub endpoint: String,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Command receiving one JSON document per call on stdin
    #[serde(default = "default_backend_command")]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_inventory_command() -> String {
    "vmadm".to_string()
}

fn default_inventory_args() -> Vec<String> {
    vec!["lookup".to_string(), "-j".to_string()]
}

fn default_backend_command() -> String {
    "fwadm".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    10
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    2021
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9464
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            command: default_inventory_command(),
            args: default_inventory_args(),
            timeout_secs: default_command_timeout(),
        }
    }
}

impl ServiceEndpoint {
    fn directory_default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8081".to_string(),
            timeout_secs: default_request_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ServiceEndpoint {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
            timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            args: Vec::new(),
            timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Default for AgentConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "fwsync-agent".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                labels: None,
            },
            spec: AgentConfigSpec {
                directory: ServiceEndpoint::directory_default(),
                ..Default::default()
            },
        }
    }
}

impl AgentConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. FWSYNC_CONFIG_PATH environment variable
    /// 2. ./fwsync-config.yaml (working directory)
    /// 3. ~/.fwsync/config.yaml (user home)
    /// 4. /etc/fwsync/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("FWSYNC_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./fwsync-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".fwsync").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/fwsync/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FWSYNC_POLICY_ENDPOINT") {
            tracing::info!("Environment override: FWSYNC_POLICY_ENDPOINT={}", val);
            self.spec.policy.endpoint = val;
        }

        if let Ok(val) = std::env::var("FWSYNC_DIRECTORY_ENDPOINT") {
            tracing::info!("Environment override: FWSYNC_DIRECTORY_ENDPOINT={}", val);
            self.spec.directory.endpoint = val;
        }

        if let Ok(val) = std::env::var("FWSYNC_METRICS_ENABLED") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: FWSYNC_METRICS_ENABLED=true");
                    self.spec.observability.metrics.enabled = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: FWSYNC_METRICS_ENABLED=false");
                    self.spec.observability.metrics.enabled = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for FWSYNC_METRICS_ENABLED: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        for (field, endpoint) in [
            ("spec.policy", &self.spec.policy),
            ("spec.directory", &self.spec.directory),
        ] {
            if !(endpoint.endpoint.starts_with("http://") || endpoint.endpoint.starts_with("https://")) {
                anyhow::bail!(
                    "{}.endpoint must be an http(s) URL, got '{}'",
                    field,
                    endpoint.endpoint
                );
            }
            if endpoint.timeout_secs == 0 {
                anyhow::bail!("{}.timeout_secs must be greater than zero", field);
            }
        }

        if self.spec.inventory.command.is_empty() {
            anyhow::bail!("spec.inventory.command cannot be empty");
        }

        if self.spec.backend.command.is_empty() {
            anyhow::bail!("spec.backend.command cannot be empty");
        }

        if self.spec.inventory.timeout_secs == 0 || self.spec.backend.timeout_secs == 0 {
            anyhow::bail!("command timeouts must be greater than zero");
        }

        if !matches!(self.spec.observability.logging.format.as_str(), "text" | "json") {
            anyhow::bail!(
                "Invalid logging format: '{}'. Expected 'text' or 'json'",
                self.spec.observability.logging.format
            );
        }

        Ok(())
    }
}
