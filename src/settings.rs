//! Configuration management with environment variable support and validation.

use anyhow::{anyhow, Result};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            enable_cors: true,
            cors_origins: vec!["*".to_string()],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Agent registry and health-probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub manifest_path: PathBuf,
    pub health_check_interval_seconds: u64,
    pub probe_timeout_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from("config/registry.json"),
            health_check_interval_seconds: 30,
            probe_timeout_seconds: 2,
        }
    }
}

/// Intent classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout_seconds: u64,
    pub context_turns: usize,
    pub confidence_threshold: f64,
    pub min_acceptable_confidence: f64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "llama3.1".to_string(),
            api_key: None,
            request_timeout_seconds: 10,
            context_turns: 5,
            confidence_threshold: 0.70,
            min_acceptable_confidence: 0.50,
        }
    }
}

/// Conversation memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_history_per_user: usize,
    pub short_term_cache_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_history_per_user: 50,
            short_term_cache_size: 20,
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    pub fallback_agent_id: String,
    pub max_clarification_attempts: usize,
    pub recent_lookback: usize,
    pub forward_timeout_seconds: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            fallback_agent_id: "general_assistant".to_string(),
            max_clarification_attempts: 3,
            recent_lookback: 10,
            forward_timeout_seconds: 15,
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub classifier: ClassifierSettings,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            // Start with baked-in defaults
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            // Add local config file if it exists
            .add_source(config::File::with_name("config").required(false))
            // Add environment variables with SWB_ prefix
            .add_source(
                Environment::with_prefix("SWB")
                    .separator("__")
                    .list_separator(",")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;

        Self::apply_env_overrides(&mut settings)?;
        settings.validate()?;

        Ok(settings)
    }

    /// Apply environment variable overrides for the settings touched most
    /// often in deployment.
    fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
        if let Ok(host) = std::env::var("SWB_SERVER_HOST") {
            settings.server.host = host;
        }
        if let Ok(port) = std::env::var("SWB_SERVER_PORT") {
            settings.server.port = port.parse()?;
        }
        if let Ok(manifest) = std::env::var("SWB_REGISTRY_MANIFEST") {
            settings.registry.manifest_path = PathBuf::from(manifest);
        }
        if let Ok(base_url) = std::env::var("SWB_CLASSIFIER_BASE_URL") {
            settings.classifier.base_url = base_url;
        }
        if let Ok(api_key) = std::env::var("SWB_CLASSIFIER_API_KEY") {
            settings.classifier.api_key = Some(api_key);
        }

        Ok(())
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if !self.registry.manifest_path.exists() {
            warn!(
                "Agent manifest does not exist yet: {:?}",
                self.registry.manifest_path
            );
        }
        if self.registry.probe_timeout_seconds == 0 {
            return Err(anyhow!("Health probe timeout cannot be 0"));
        }
        if self.registry.health_check_interval_seconds == 0 {
            return Err(anyhow!("Health check interval cannot be 0"));
        }

        for (name, value) in [
            ("confidence_threshold", self.classifier.confidence_threshold),
            (
                "min_acceptable_confidence",
                self.classifier.min_acceptable_confidence,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("Classifier {} must be within [0, 1]", name));
            }
        }
        if self.classifier.min_acceptable_confidence > self.classifier.confidence_threshold {
            return Err(anyhow!(
                "min_acceptable_confidence cannot exceed confidence_threshold"
            ));
        }

        if self.memory.max_history_per_user == 0 {
            return Err(anyhow!("Conversation history bound cannot be 0"));
        }
        if self.memory.short_term_cache_size == 0 {
            return Err(anyhow!("Short-term cache size cannot be 0"));
        }

        if self.dispatcher.fallback_agent_id.trim().is_empty() {
            return Err(anyhow!("Fallback agent id cannot be empty"));
        }
        if self.dispatcher.max_clarification_attempts == 0 {
            return Err(anyhow!("Clarification budget cannot be 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut settings = Settings::default();
        settings.server.port = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn inverted_confidence_bounds_are_rejected() {
        let mut settings = Settings::default();
        settings.classifier.min_acceptable_confidence = 0.9;
        settings.classifier.confidence_threshold = 0.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let mut settings = Settings::default();
        settings.classifier.confidence_threshold = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_history_bound_is_rejected() {
        let mut settings = Settings::default();
        settings.memory.max_history_per_user = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn empty_fallback_agent_is_rejected() {
        let mut settings = Settings::default();
        settings.dispatcher.fallback_agent_id = "  ".to_string();
        assert!(settings.validate().is_err());
    }
}
