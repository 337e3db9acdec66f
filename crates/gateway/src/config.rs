use anyhow::{Context, Result};
use llm::provider_config::substitute_env_vars_in_value;
use llm::ModelCatalog;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Outbound concurrency limits.
///
/// A value that is absent or not positive means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    pub default_concurrency: Option<i64>,
    /// Per model id overrides
    pub models: HashMap<String, i64>,
    /// Per tool id overrides
    pub tools: HashMap<String, i64>,
    pub acquire_timeout_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            default_concurrency: None,
            models: HashMap::new(),
            tools: HashMap::new(),
            acquire_timeout_secs: 30,
        }
    }
}

impl ThrottleConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Bounds on what one provider response may accumulate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamLimits {
    pub max_text_bytes: usize,
    pub max_tool_calls: usize,
    pub max_tool_argument_bytes: usize,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_text_bytes: 1024 * 1024,
            max_tool_calls: 32,
            max_tool_argument_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub throttle: ThrottleConfig,
    pub limits: StreamLimits,
    pub max_tool_iterations: u32,
    pub tool_timeout_secs: u64,
    pub turn_timeout_secs: Option<u64>,
    /// Transport retries for rate limits and transient upstream failures
    pub max_retries: u32,
    pub models: ModelCatalog,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            throttle: ThrottleConfig::default(),
            limits: StreamLimits::default(),
            max_tool_iterations: 10,
            tool_timeout_secs: 60,
            turn_timeout_secs: None,
            max_retries: 3,
            models: ModelCatalog::default(),
        }
    }
}

impl GatewayConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read gateway config: {}", path.display()))?;
        let raw: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse gateway config: {}", path.display()))?;
        Self::from_value(raw)
            .with_context(|| format!("Invalid gateway config: {}", path.display()))
    }

    /// Build a config from raw JSON, substituting `${VAR}` references
    pub fn from_value(mut raw: serde_json::Value) -> Result<Self> {
        // The catalog does its own substitution and validation
        let models = raw
            .as_object_mut()
            .and_then(|object| object.remove("models"));

        let value = substitute_env_vars_in_value(raw)?;
        let mut config: GatewayConfig = serde_json::from_value(value)?;
        if let Some(models) = models {
            config.models = ModelCatalog::from_value(models).context("Invalid models section")?;
        }
        Ok(config)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn turn_timeout(&self) -> Option<Duration> {
        self.turn_timeout_secs.map(Duration::from_secs)
    }
}
