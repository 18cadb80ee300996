//! Pure-data tool descriptors used for registry listing and serialization.
//!
//! The handler itself (a closure/trait object plus bound secrets) is a
//! broker-layer concern — `ToolMeta` here is just what a client or an
//! admin endpoint is allowed to see.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMeta {
    pub name: String,
    pub description: String,
    /// JSON Schema the tool call's `args` must validate against.
    #[serde(rename = "argsSchema")]
    pub args_schema: serde_json::Value,
    /// Secret names this tool requires to be bound before it is callable.
    /// Never holds the secret values themselves.
    #[serde(default)]
    pub requires_secrets: Vec<String>,
    /// Opaque, tool-specific configuration surfaced verbatim via
    /// `ToolRegistry::get_configs` (§4.4) — e.g. rate limits or endpoint
    /// overrides a tool's own handler interprets. The registry never reads
    /// into it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl ToolMeta {
    pub fn new(name: impl Into<String>, description: impl Into<String>, args_schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args_schema,
            requires_secrets: Vec::new(),
            config: None,
        }
    }

    pub fn with_secrets(mut self, secrets: impl IntoIterator<Item = String>) -> Self {
        self.requires_secrets = secrets.into_iter().collect();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_required_secrets() {
        let meta = ToolMeta::new("http_get", "fetch a URL", serde_json::json!({"type": "object"}))
            .with_secrets(["API_KEY".to_string()]);
        assert_eq!(meta.requires_secrets, vec!["API_KEY".to_string()]);
    }

    #[test]
    fn serializes_args_schema_camel_case() {
        let meta = ToolMeta::new("noop", "does nothing", serde_json::json!({}));
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"argsSchema\""));
    }
}
