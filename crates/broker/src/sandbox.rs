//! The sandbox execution seam (§4.7).
//!
//! Running untrusted code is explicitly out of scope for this broker — the
//! real sandbox lives on the other side of `SandboxAdapter`, either
//! in-process (embedded topology) or across the runtime WebSocket (runtime
//! topology). What lives here is the trait itself, the types that cross
//! it, and a minimal reference adapter that is only ever wired up in tests
//! and the `doctor` CLI subcommand — never in a real deployment.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use sbx_domain::error::Result;
use sbx_domain::ids::CallId;

use crate::cancel::CancelToken;

/// One thing the sandboxed code asked the broker to do on its behalf,
/// surfaced as a `tool_call` event and awaited via the dispatcher.
///
/// `result` is filled in by the session once the call has been resolved
/// (embedded execution, a runtime's `tool_result`, or a validation
/// failure) — an adapter that needs the outcome to keep running awaits
/// the paired receiver before proceeding (§9 "pending tool-call map").
pub struct ToolInvocation {
    pub call_id: CallId,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub result: oneshot::Sender<ToolOutcome>,
}

impl std::fmt::Debug for ToolInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvocation")
            .field("call_id", &self.call_id)
            .field("tool_name", &self.tool_name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// What a tool call resolved to, delivered back to the sandbox adapter
/// through a `ToolInvocation`'s `result` channel.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub ok: bool,
    pub value: Option<serde_json::Value>,
    pub error: Option<ToolError>,
}

/// A tool call's failure, carrying the original taxonomy code (§7) so
/// sandboxed code that lets the failure propagate uncaught reports the
/// *specific* code (`UNKNOWN_TOOL`, `TOOL_TIMEOUT`, ...) in `final.error`
/// rather than a generic `EXECUTION_ERROR`.
#[derive(Debug, Clone)]
pub struct ToolError {
    pub code: String,
    pub message: String,
}

/// A chunk of progress from a running sandbox: either a tool invocation
/// that needs a result before execution can continue, or stdout the
/// broker should forward as trace/log data (subject to `maxStdoutBytes`).
#[derive(Debug)]
pub enum SandboxEvent {
    ToolInvocation(ToolInvocation),
    Stdout(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub ok: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<ToolError>,
}

/// What code runs, where tool results come back to it, and the limits it
/// must enforce against itself (§4.7).
pub struct ExecutionContext {
    pub code: String,
    /// The adapter sends `SandboxEvent::ToolInvocation` here; the
    /// invocation's own `result` channel carries the eventual outcome
    /// back, so an adapter that needs it before continuing awaits that
    /// receiver rather than this sender.
    pub events: mpsc::Sender<SandboxEvent>,
    /// Wall-clock budget remaining on the session's own TTL at the moment
    /// execution starts — not an independent timeout, since the broker
    /// already races this same deadline in its own `select!` loop.
    pub timeout: Duration,
    pub max_iterations: u32,
    pub max_tool_calls: u32,
    pub memory_limit: u64,
    /// Cancelled the instant the session is torn down (client `DELETE`,
    /// TTL reaper, broker shutdown). An adapter must observe this and
    /// unwind promptly rather than running sandboxed code to completion
    /// ("`abortSignal` must cause prompt termination", §4.7).
    pub abort_signal: CancelToken,
}

/// The seam between the broker's session engine and wherever untrusted
/// code actually executes. Implementations are responsible for enforcing
/// their own isolation — the broker only enforces the wire-level limits
/// (stdout bytes, tool-call count, timeouts).
#[async_trait]
pub trait SandboxAdapter: Send + Sync {
    async fn run(&self, ctx: ExecutionContext) -> Result<ExecutionOutcome>;

    /// Release whatever resources this adapter holds for a finished
    /// session (worker process, VM, temp files, ...). Called once per
    /// session after its execution loop reaches a terminal outcome.
    /// Adapters with nothing to release can keep the default no-op.
    async fn dispose(&self) {}
}

/// A minimal, deliberately unsandboxed stand-in used only for local
/// development (`sandbox-broker doctor`) and the integration tests that
/// exercise the six end-to-end scenarios. It recognizes exactly the
/// handful of scripted forms those scenarios need and nothing else.
///
/// This is demo scaffolding, not a sandbox — it must never be reachable
/// from a deployed broker's default configuration.
pub mod reference {
    use super::*;

    pub struct ReferenceAdapter;

    #[async_trait]
    impl SandboxAdapter for ReferenceAdapter {
        async fn run(&self, ctx: ExecutionContext) -> Result<ExecutionOutcome> {
            if let Some(rest) = ctx.code.strip_prefix("const:") {
                let value: serde_json::Value =
                    serde_json::from_str(rest).unwrap_or(serde_json::Value::Null);
                return Ok(ExecutionOutcome {
                    ok: true,
                    result: Some(value),
                    error: None,
                });
            }

            if let Some(rest) = ctx.code.strip_prefix("echo:") {
                return Ok(ExecutionOutcome {
                    ok: true,
                    result: Some(serde_json::json!({ "echo": rest })),
                    error: None,
                });
            }

            if let Some(rest) = ctx.code.strip_prefix("call_tool_seq:") {
                let mut results = Vec::new();
                for call in rest.split('|') {
                    match dispatch_one(&ctx, call.trim()).await {
                        Ok(value) => results.push(value),
                        Err(tool_error) => {
                            return Ok(ExecutionOutcome {
                                ok: false,
                                result: None,
                                error: Some(tool_error),
                            })
                        }
                    }
                }
                return Ok(ExecutionOutcome {
                    ok: true,
                    result: Some(serde_json::Value::Array(results)),
                    error: None,
                });
            }

            if let Some(rest) = ctx.code.strip_prefix("call_tool:") {
                return match dispatch_one(&ctx, rest).await {
                    Ok(value) => Ok(ExecutionOutcome {
                        ok: true,
                        result: Some(value),
                        error: None,
                    }),
                    Err(tool_error) => Ok(ExecutionOutcome {
                        ok: false,
                        result: None,
                        error: Some(tool_error),
                    }),
                };
            }

            if ctx.code == "fail" {
                return Ok(ExecutionOutcome {
                    ok: false,
                    result: None,
                    error: Some(ToolError {
                        code: "EXECUTION_ERROR".into(),
                        message: "intentional failure".into(),
                    }),
                });
            }

            Ok(ExecutionOutcome {
                ok: true,
                result: Some(serde_json::Value::Null),
                error: None,
            })
        }
    }

    /// Dispatch one `name {args}` call, wait for its outcome, and collapse
    /// it into either the tool's returned value or the `ToolError` the
    /// broker resolved it with — this is how an *uncaught* tool-call
    /// failure's original taxonomy code (`UNKNOWN_TOOL`, `TOOL_TIMEOUT`,
    /// ...) reaches `final.error.code` unchanged (§8 scenario 5).
    async fn dispatch_one(ctx: &ExecutionContext, call: &str) -> std::result::Result<serde_json::Value, ToolError> {
        let mut parts = call.splitn(2, ' ');
        let tool_name = parts.next().unwrap_or_default().to_string();
        let args_raw = parts.next().unwrap_or("{}");
        let args: serde_json::Value =
            serde_json::from_str(args_raw).unwrap_or(serde_json::Value::Null);
        let call_id = CallId::generate();
        let (result_tx, result_rx) = oneshot::channel();
        if ctx
            .events
            .send(SandboxEvent::ToolInvocation(ToolInvocation {
                call_id,
                tool_name,
                args,
                result: result_tx,
            }))
            .await
            .is_err()
        {
            return Err(ToolError {
                code: "EXECUTION_ERROR".into(),
                message: "session closed before dispatching the tool call".into(),
            });
        }
        match result_rx.await {
            Ok(outcome) if outcome.ok => Ok(outcome.value.unwrap_or(serde_json::Value::Null)),
            Ok(outcome) => Err(outcome.error.unwrap_or(ToolError {
                code: "EXECUTION_ERROR".into(),
                message: String::new(),
            })),
            Err(_) => Err(ToolError {
                code: "EXECUTION_ERROR".into(),
                message: "session dropped the tool call before it resolved".into(),
            }),
        }
    }

}
