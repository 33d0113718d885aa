//! Execution targets.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Name of the implicit target used when no testset declares one.
pub const DEFAULT_TARGET: &str = "default";

/// Per-target execution settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Environment setup script sourced before every shell command.
    #[serde(default)]
    pub sourceme: Option<PathBuf>,

    /// Environment variable overrides.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Custom properties, usable as `{name}` placeholders in commands.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,

    /// Requested per-run timeout in seconds (capped by the global maximum).
    #[serde(default)]
    pub timeout: Option<f64>,

    /// When set, every run on this target is skipped with this message.
    #[serde(default)]
    pub skip: Option<String>,
}

/// A named execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub config: TargetConfig,
}

impl Default for Target {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET, TargetConfig::default())
    }
}

impl Target {
    pub fn new(name: impl Into<String>, config: TargetConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Property rendered as plain text (strings without quotes).
    pub fn property(&self, name: &str) -> Option<String> {
        self.config.properties.get(name).map(render_scalar)
    }
}

/// Render a JSON value the way a user expects to see it inside a command line.
pub fn render_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
