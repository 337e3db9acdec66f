use crate::factory::ProviderKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Configuration for a single model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Provider family, selects the adapter
    pub provider: ProviderKind,
    /// Model ID within the provider
    pub model: String,
    /// Overrides the provider's default endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Default output token budget when the request doesn't set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Overrides the built-in detection of models that reject `temperature`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_temperature: Option<bool>,
    /// Default sampling temperature when the request doesn't set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ModelConfig {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
            api_key: None,
            max_output_tokens: None,
            supports_temperature: None,
            temperature: None,
        }
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .unwrap_or_else(|| self.provider.default_base_url())
    }
}

/// Configuration for all models (model id -> ModelConfig)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ModelCatalog {
    models: HashMap<String, ModelConfig>,
}

impl ModelCatalog {
    pub fn new(models: HashMap<String, ModelConfig>) -> Self {
        Self { models }
    }

    /// Load a catalog file, substituting `${VAR}` references first
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read models config: {}", path.display()))?;
        let raw: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse models config: {}", path.display()))?;
        Self::from_value(raw)
            .with_context(|| format!("Invalid models config: {}", path.display()))
    }

    pub fn from_value(raw: serde_json::Value) -> Result<Self> {
        let value = substitute_env_vars_in_value(raw)?;
        let catalog: ModelCatalog = serde_json::from_value(value)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<&ModelConfig> {
        self.models.get(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, config: ModelConfig) {
        self.models.insert(id.into(), config);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn validate(&self) -> Result<()> {
        for (id, model) in &self.models {
            if model.model.trim().is_empty() {
                return Err(anyhow::anyhow!("Model '{}' has an empty model name", id));
            }
        }
        Ok(())
    }
}

/// Recursively substitute environment variables in JSON values
pub fn substitute_env_vars_in_value(value: serde_json::Value) -> Result<serde_json::Value> {
    match value {
        serde_json::Value::String(s) => Ok(serde_json::Value::String(
            substitute_env_vars_in_string(&s)?,
        )),
        serde_json::Value::Object(map) => {
            let mut substituted = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                let val = substitute_env_vars_in_value(val)
                    .with_context(|| format!("Failed to substitute env vars in '{key}'"))?;
                substituted.insert(key, val);
            }
            Ok(serde_json::Value::Object(substituted))
        }
        serde_json::Value::Array(arr) => Ok(serde_json::Value::Array(
            arr.into_iter()
                .map(substitute_env_vars_in_value)
                .collect::<Result<_>>()?,
        )),
        other => Ok(other),
    }
}

/// Substitute environment variables in a string (${VAR_NAME} format)
pub fn substitute_env_vars_in_string(input: &str) -> Result<String> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let end = rest[start..].find('}').ok_or_else(|| {
            anyhow::anyhow!("Unclosed environment variable substitution: {input}")
        })?;
        let var_name = &rest[start + 2..start + end];
        let var_value = std::env::var(var_name)
            .with_context(|| format!("Environment variable not set: {var_name}"))?;

        result.push_str(&rest[..start]);
        result.push_str(&var_value);
        rest = &rest[start + end + 1..];
    }
    result.push_str(rest);

    Ok(result)
}
