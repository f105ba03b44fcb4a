//! Configuration management
//!
//! This module handles loading, validation, and management of the Orca configuration.
//! Configuration is stored in TOML format at ~/.orca/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: log level
//! - **orchestrator**: iteration cap, wake timeout, worker pool size
//! - **retry**: backoff policy for transient upstream failures
//! - **endpoints**: the fixed set of model endpoints (one `[[endpoints]]` table each)
//! - **tools**: tool call timeout, catalog strictness and tool backends
//!
//! # Examples
//!
//! ```no_run
//! use orca_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! for endpoint in &config.endpoints {
//!     println!("{} -> {}", endpoint.key, endpoint.base_url);
//! }
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::harmony::GenerationSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Task orchestrator settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Retry policy for upstream calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Model endpoints, registered once at startup
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Tool backends
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Keychain service used to look up endpoint credentials
    #[serde(default = "default_keyring_service")]
    pub keyring_service: String,
}

/// Task orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum generation calls per task
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// How long a task waits for its endpoint to reach Running
    #[serde(default = "default_wake_timeout")]
    pub wake_timeout_secs: u64,

    /// Readiness poll interval while an endpoint is Starting
    #[serde(default = "default_wake_poll_interval")]
    pub wake_poll_interval_ms: u64,

    /// Size of the task worker pool
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Consecutive all-failed tool turns before a task is failed
    #[serde(default = "default_max_tool_failures")]
    pub max_consecutive_tool_failures: u32,

    /// Time in-flight tasks get to finish on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Interval of the endpoint idle control loop
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_secs: u64,

    /// Queue `serve` consumes `{"task_id": ...}` start requests from
    #[serde(default = "default_task_queue")]
    pub task_queue: String,
}

/// Exponential backoff policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f32,

    /// Relative jitter applied to each delay (0.0-1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f32,
}

/// A model endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint key referenced by tasks (e.g. "20b", "120b")
    pub key: String,

    /// Provider identity (informational, e.g. "modal", "runpod")
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Base URL of the model server
    pub base_url: String,

    /// Base URL of the scaling control plane (defaults to `base_url`)
    #[serde(default)]
    pub control_url: Option<String>,

    /// Model id sent with each generation request
    pub model: String,

    /// Seconds without generation activity before Running becomes Idle
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Further idle seconds before an Idle endpoint is put to sleep
    #[serde(default = "default_sleep_after_idle")]
    pub sleep_after_idle_secs: u64,

    /// HTTP timeout for a single generation request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Environment variable (or keychain entry) holding the bearer token
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Default sampling parameters for this endpoint
    #[serde(default)]
    pub sampling: SamplingDefaults,
}

/// Endpoint-level sampling defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SamplingDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Tool backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Per tool call timeout
    #[serde(default = "default_tool_call_timeout")]
    pub call_timeout_secs: u64,

    /// Fail catalog load when two backends declare the same tool name
    #[serde(default = "default_true")]
    pub strict_catalog: bool,

    /// Configured tool backends
    #[serde(default)]
    pub backends: Vec<ToolBackendConfig>,
}

/// An HTTP tool backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolBackendConfig {
    /// Backend identifier, owner of the tools it declares
    pub id: String,

    /// Base URL of the tool server
    pub base_url: String,

    /// Environment variable (or keychain entry) holding the bearer token
    #[serde(default)]
    pub api_key_env: Option<String>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_keyring_service() -> String {
    "orca".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    20
}

fn default_wake_timeout() -> u64 {
    600
}

fn default_wake_poll_interval() -> u64 {
    2000
}

fn default_max_concurrent_tasks() -> usize {
    8
}

fn default_max_tool_failures() -> u32 {
    3
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_idle_check_interval() -> u64 {
    30
}

fn default_task_queue() -> String {
    "orca:tasks".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f32 {
    2.0
}

fn default_jitter_factor() -> f32 {
    0.1
}

fn default_provider() -> String {
    "http".to_string()
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_sleep_after_idle() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    300
}

fn default_tool_call_timeout() -> u64 {
    30
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            wake_timeout_secs: default_wake_timeout(),
            wake_poll_interval_ms: default_wake_poll_interval(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_consecutive_tool_failures: default_max_tool_failures(),
            shutdown_grace_secs: default_shutdown_grace(),
            idle_check_interval_secs: default_idle_check_interval(),
            task_queue: default_task_queue(),
        }
    }
}

impl OrchestratorConfig {
    pub fn wake_timeout(&self) -> Duration {
        Duration::from_secs(self.wake_timeout_secs)
    }

    pub fn wake_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wake_poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs.max(1))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_tool_call_timeout(),
            strict_catalog: true,
            backends: Vec::new(),
        }
    }
}

impl ToolsConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl EndpointConfig {
    /// Minimal endpoint with default timeouts
    pub fn new(key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            provider: default_provider(),
            base_url: base_url.into(),
            control_url: None,
            model: model.into(),
            idle_timeout_secs: default_idle_timeout(),
            sleep_after_idle_secs: default_sleep_after_idle(),
            request_timeout_secs: default_request_timeout(),
            api_key_env: None,
            sampling: SamplingDefaults::default(),
        }
    }

    /// Scaling control plane base URL
    pub fn control_url(&self) -> &str {
        self.control_url.as_deref().unwrap_or(&self.base_url)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sleep_after_idle(&self) -> Duration {
        Duration::from_secs(self.sleep_after_idle_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Generation settings a task starts from on this endpoint
    pub fn default_settings(&self) -> GenerationSettings {
        GenerationSettings {
            model: self.model.clone(),
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
            max_tokens: self.sampling.max_tokens,
            ..Default::default()
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.orca/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        Self::load_or_create_at(&Self::default_config_path()?)
    }

    /// Load `path`, writing the default configuration there first if missing
    pub fn load_or_create_at(path: &Path) -> Result<Self, EngineError> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            Self::create_default(path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config = Self::default_config();
        config.validate()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Wrote default configuration to {}", path.display());
        Ok(config)
    }

    /// Get the default configuration file path (~/.orca/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".orca").join("config.toml"))
    }

    /// Create a default configuration with the two stock endpoint sizes
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                keyring_service: default_keyring_service(),
            },
            orchestrator: OrchestratorConfig::default(),
            retry: RetryConfig::default(),
            endpoints: vec![
                EndpointConfig::new("20b", "http://localhost:8020", "gpt-oss-20b"),
                EndpointConfig::new("120b", "http://localhost:8120", "gpt-oss-120b"),
            ],
            tools: ToolsConfig::default(),
        }
    }

    /// Look up an endpoint by key
    pub fn endpoint(&self, key: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.key == key)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` describing the first problem found.
    pub fn validate(&self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let orch = &self.orchestrator;
        if orch.max_iterations == 0 {
            return Err(EngineError::Config(
                "orchestrator.max_iterations must be at least 1".to_string(),
            ));
        }
        if orch.max_concurrent_tasks == 0 {
            return Err(EngineError::Config(
                "orchestrator.max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if orch.wake_poll_interval_ms == 0 {
            return Err(EngineError::Config(
                "orchestrator.wake_poll_interval_ms must be positive".to_string(),
            ));
        }
        if orch.max_consecutive_tool_failures == 0 {
            return Err(EngineError::Config(
                "orchestrator.max_consecutive_tool_failures must be at least 1".to_string(),
            ));
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err(EngineError::Config(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(EngineError::Config(
                "retry.jitter_factor must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(EngineError::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".to_string(),
            ));
        }

        if self.endpoints.is_empty() {
            return Err(EngineError::Config(
                "At least one [[endpoints]] entry is required".to_string(),
            ));
        }
        let mut keys = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.key.trim().is_empty() {
                return Err(EngineError::Config("Endpoint key must not be empty".to_string()));
            }
            if !keys.insert(endpoint.key.as_str()) {
                return Err(EngineError::Config(format!(
                    "Duplicate endpoint key '{}'",
                    endpoint.key
                )));
            }
            if endpoint.model.trim().is_empty() {
                return Err(EngineError::Config(format!(
                    "Endpoint '{}' has no model",
                    endpoint.key
                )));
            }
            validate_url(&endpoint.base_url, &format!("endpoint '{}' base_url", endpoint.key))?;
            if let Some(control) = &endpoint.control_url {
                validate_url(control, &format!("endpoint '{}' control_url", endpoint.key))?;
            }
        }

        let mut ids = HashSet::new();
        for backend in &self.tools.backends {
            if backend.id.trim().is_empty() {
                return Err(EngineError::Config("Tool backend id must not be empty".to_string()));
            }
            if !ids.insert(backend.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "Duplicate tool backend id '{}'",
                    backend.id
                )));
            }
            validate_url(&backend.base_url, &format!("tool backend '{}'", backend.id))?;
        }

        Ok(())
    }
}

fn validate_url(url: &str, what: &str) -> Result<(), EngineError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "Invalid URL for {}: '{}' (expected http:// or https://)",
            what, url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[core]
log_level = "debug"

[[endpoints]]
key = "120b"
base_url = "http://gpu-120b.internal:8000"
model = "gpt-oss-120b"
"#;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.orchestrator.max_iterations, 20);
        assert_eq!(config.endpoints.len(), 2);
        assert!(config.endpoint("120b").is_some());
        assert!(config.tools.strict_catalog);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let endpoint = config.endpoint("120b").unwrap();

        assert_eq!(endpoint.provider, "http");
        assert_eq!(endpoint.idle_timeout_secs, 600);
        assert_eq!(endpoint.control_url(), "http://gpu-120b.internal:8000");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.tools.call_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_duplicate_endpoint_key_rejected() {
        let toml = format!(
            "{}\n[[endpoints]]\nkey = \"120b\"\nbase_url = \"http://other\"\nmodel = \"m\"\n",
            MINIMAL
        );
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("Duplicate endpoint key"));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let toml = MINIMAL.replace("debug", "loud");
        assert!(matches!(
            Config::from_toml_str(&toml),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let toml = MINIMAL.replace("http://gpu-120b.internal:8000", "gpu-120b:8000");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_no_endpoints_rejected() {
        let err = Config::from_toml_str("[core]\n").unwrap_err();
        assert!(err.to_string().contains("endpoints"));
    }

    #[test]
    fn test_endpoint_default_settings() {
        let mut endpoint = EndpointConfig::new("20b", "http://localhost:1", "gpt-oss-20b");
        endpoint.sampling.temperature = Some(0.3);
        let settings = endpoint.default_settings();
        assert_eq!(settings.model, "gpt-oss-20b");
        assert_eq!(settings.temperature, Some(0.3));
        assert_eq!(settings.seed, None);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(config.endpoints.len(), deserialized.endpoints.len());
        assert_eq!(config.retry, deserialized.retry);
    }
}
