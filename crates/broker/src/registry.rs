//! Tool registry (§4.4): the set of tools a broker instance exposes, with
//! their argument schemas, required secrets, and (in embedded mode) their
//! handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::Validator;
use parking_lot::RwLock;

use sbx_domain::error::{BrokerError, Result};
use sbx_domain::ids::{CallId, SessionId};
use sbx_domain::tool::ToolMeta;

use crate::cancel::CancelToken;

/// Everything a handler gets alongside its (already-validated) arguments:
/// `(validatedArgs, {sessionId, callId, secrets, abortSignal})` per §4.4's
/// handler invocation contract.
pub struct ToolCallContext<'a> {
    pub session_id: &'a SessionId,
    pub call_id: &'a CallId,
    pub secrets: &'a HashMap<String, String>,
    pub abort_signal: &'a CancelToken,
}

/// An in-process tool handler, for embedded mode (§2's embedded topology).
/// Runtime-mode tool calls never go through this trait — they're routed
/// to the connected runtime instead (see `dispatcher.rs`).
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: serde_json::Value, ctx: &ToolCallContext<'_>) -> Result<serde_json::Value>;
}

struct RegisteredTool {
    meta: ToolMeta,
    schema: Validator,
    handler: Option<Arc<dyn ToolHandler>>,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    secrets: RwLock<HashMap<String, String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool with no in-process handler — used for runtime mode,
    /// where the registry only needs to validate arguments and list
    /// descriptors, not actually execute anything.
    pub fn register_descriptor(&self, meta: ToolMeta) -> Result<()> {
        self.register_inner(meta, None)
    }

    pub fn register(&self, meta: ToolMeta, handler: Arc<dyn ToolHandler>) -> Result<()> {
        self.register_inner(meta, Some(handler))
    }

    /// Lookup by name is unique; registering an already-registered name is
    /// an error (§4.4).
    fn register_inner(&self, meta: ToolMeta, handler: Option<Arc<dyn ToolHandler>>) -> Result<()> {
        let schema = jsonschema::validator_for(&meta.args_schema)
            .map_err(|e| BrokerError::InvalidRequest(format!("invalid argsSchema for {}: {e}", meta.name)))?;
        let mut tools = self.tools.write();
        if tools.contains_key(&meta.name) {
            return Err(BrokerError::InvalidRequest(format!(
                "tool {} is already registered",
                meta.name
            )));
        }
        let name = meta.name.clone();
        tools.insert(
            name,
            RegisteredTool {
                meta,
                schema,
                handler,
            },
        );
        Ok(())
    }

    /// Remove a tool. Returns `true` if a tool by that name existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<ToolMeta> {
        self.tools.read().values().map(|t| t.meta.clone()).collect()
    }

    /// Each registered tool's opaque `config`, keyed by name, omitting
    /// tools that were registered with none.
    pub fn get_configs(&self) -> HashMap<String, serde_json::Value> {
        self.tools
            .read()
            .values()
            .filter_map(|t| t.meta.config.clone().map(|c| (t.meta.name.clone(), c)))
            .collect()
    }

    pub fn bind_secret(&self, name: impl Into<String>, value: impl Into<String>) {
        self.secrets.write().insert(name.into(), value.into());
    }

    /// `setSecret` (§4.4).
    pub fn set_secret(&self, name: impl Into<String>, value: impl Into<String>) {
        self.bind_secret(name, value);
    }

    /// `removeSecret` (§4.4). Returns `true` if the secret existed.
    pub fn remove_secret(&self, name: &str) -> bool {
        self.secrets.write().remove(name).is_some()
    }

    pub fn has_secret(&self, name: &str) -> bool {
        self.secrets.read().contains_key(name)
    }

    pub fn clear_secrets(&self) {
        self.secrets.write().clear();
    }

    /// Validate `args` against the tool's schema and confirm every secret
    /// the tool requires has been bound. Does not execute anything.
    pub fn validate_call(&self, tool_name: &str, args: &serde_json::Value) -> Result<()> {
        let tools = self.tools.read();
        let tool = tools
            .get(tool_name)
            .ok_or_else(|| BrokerError::UnknownTool(tool_name.to_string()))?;

        if let Err(mut errors) = tool.schema.validate(args) {
            let first = errors.next().map(|e| e.to_string()).unwrap_or_default();
            return Err(BrokerError::ValidationError(first));
        }

        let secrets = self.secrets.read();
        for required in &tool.meta.requires_secrets {
            if !secrets.contains_key(required) {
                return Err(BrokerError::SecretError(required.clone()));
            }
        }
        Ok(())
    }

    /// Execute an embedded-mode tool call. Callers must have already run
    /// `validate_call` — this does not re-validate the schema.
    pub async fn execute(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        session_id: &SessionId,
        call_id: &CallId,
        abort_signal: &CancelToken,
    ) -> Result<serde_json::Value> {
        let (handler, secrets) = {
            let tools = self.tools.read();
            let tool = tools
                .get(tool_name)
                .ok_or_else(|| BrokerError::UnknownTool(tool_name.to_string()))?;
            let handler = tool
                .handler
                .clone()
                .ok_or_else(|| BrokerError::ExecutionError(format!("{tool_name} has no embedded handler")))?;
            (handler, self.secrets.read().clone())
        };
        let ctx = ToolCallContext {
            session_id,
            call_id,
            secrets: &secrets,
            abort_signal,
        };
        handler.call(args, &ctx).await
    }

    pub fn is_runtime_routed(&self, tool_name: &str) -> bool {
        self.tools
            .read()
            .get(tool_name)
            .map(|t| t.handler.is_none())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn call(&self, args: serde_json::Value, _ctx: &ToolCallContext<'_>) -> Result<serde_json::Value> {
            Ok(args)
        }
    }

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let registry = ToolRegistry::new();
        let err = registry.validate_call("nope", &serde_json::json!({})).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_TOOL");
    }

    #[test]
    fn args_must_satisfy_schema() {
        let registry = ToolRegistry::new();
        registry
            .register(ToolMeta::new("echo", "echoes input", schema()), Arc::new(EchoHandler))
            .unwrap();
        assert!(registry.validate_call("echo", &serde_json::json!({"text": "hi"})).is_ok());
        let err = registry.validate_call("echo", &serde_json::json!({})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn missing_secret_is_rejected_before_execution() {
        let registry = ToolRegistry::new();
        registry
            .register(
                ToolMeta::new("echo", "echoes input", schema()).with_secrets(["API_KEY".to_string()]),
                Arc::new(EchoHandler),
            )
            .unwrap();
        let err = registry.validate_call("echo", &serde_json::json!({"text": "hi"})).unwrap_err();
        assert_eq!(err.code(), "SECRET_ERROR");
        registry.bind_secret("API_KEY", "sk-test");
        assert!(registry.validate_call("echo", &serde_json::json!({"text": "hi"})).is_ok());
    }

    #[tokio::test]
    async fn execute_runs_the_bound_handler() {
        let registry = ToolRegistry::new();
        registry
            .register(ToolMeta::new("echo", "echoes input", schema()), Arc::new(EchoHandler))
            .unwrap();
        let result = registry
            .execute(
                "echo",
                serde_json::json!({"text": "hi"}),
                &SessionId::generate(),
                &CallId::generate(),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"text": "hi"}));
    }

    #[test]
    fn descriptor_only_registration_is_runtime_routed() {
        let registry = ToolRegistry::new();
        registry.register_descriptor(ToolMeta::new("remote_exec", "runs on the runtime", schema())).unwrap();
        assert!(registry.is_runtime_routed("remote_exec"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ToolRegistry::new();
        registry
            .register(ToolMeta::new("echo", "echoes input", schema()), Arc::new(EchoHandler))
            .unwrap();
        let err = registry
            .register(ToolMeta::new("echo", "echoes input again", schema()), Arc::new(EchoHandler))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn unregister_removes_the_tool() {
        let registry = ToolRegistry::new();
        registry
            .register(ToolMeta::new("echo", "echoes input", schema()), Arc::new(EchoHandler))
            .unwrap();
        assert!(registry.has("echo"));
        assert!(registry.unregister("echo"));
        assert!(!registry.has("echo"));
        assert!(!registry.unregister("echo"));
    }

    #[test]
    fn secret_lifecycle_is_queryable_and_clearable() {
        let registry = ToolRegistry::new();
        assert!(!registry.has_secret("API_KEY"));
        registry.set_secret("API_KEY", "sk-test");
        assert!(registry.has_secret("API_KEY"));
        assert!(registry.remove_secret("API_KEY"));
        assert!(!registry.has_secret("API_KEY"));

        registry.set_secret("A", "1");
        registry.set_secret("B", "2");
        registry.clear_secrets();
        assert!(!registry.has_secret("A"));
        assert!(!registry.has_secret("B"));
    }

    #[test]
    fn get_configs_only_includes_tools_with_a_config() {
        let registry = ToolRegistry::new();
        registry
            .register(
                ToolMeta::new("with_cfg", "has config", schema()).with_config(serde_json::json!({"rateLimit": 5})),
                Arc::new(EchoHandler),
            )
            .unwrap();
        registry
            .register(ToolMeta::new("without_cfg", "no config", schema()), Arc::new(EchoHandler))
            .unwrap();
        let configs = registry.get_configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs["with_cfg"], serde_json::json!({"rateLimit": 5}));
    }
}
