//! Tool dispatch for backend-issued function calls.
//!
//! - `Tool` is the typed trait built-in tools implement
//! - `ToolHandler` is its object-safe view, with argument parsing folded in
//! - `ToolRegistry::dispatch` always returns text, whatever the handler does

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use async_trait::async_trait;
use chatrelay_provider::{BackendError, ToolDef};
use chatrelay_schema::{ConversationId, OutputFragment};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::emitter::FragmentSink;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ToolError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Context passed to a tool invocation.
pub struct ToolContext<'a> {
    pub conversation_id: &'a ConversationId,
    progress: &'a dyn FragmentSink,
}

impl<'a> ToolContext<'a> {
    pub fn new(conversation_id: &'a ConversationId, progress: &'a dyn FragmentSink) -> Self {
        Self {
            conversation_id,
            progress,
        }
    }

    /// Send a fragment to the user right away, before the tool returns.
    pub async fn emit(&self, fragment: OutputFragment) {
        let status = self.progress.emit(fragment).await;
        if !status.is_delivered() {
            tracing::debug!(status = status.0, "progress fragment not delivered");
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync + 'static {
    type Args: DeserializeOwned + Send;

    /// Capability descriptor sent to the backend.
    fn definition(&self) -> ToolDef;

    async fn invoke(&self, args: Self::Args, ctx: &ToolContext<'_>) -> Result<String, ToolError>;
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDef;

    async fn call(&self, raw_arguments: &str, ctx: &ToolContext<'_>) -> Result<String, ToolError>;
}

#[async_trait]
impl<T: Tool> ToolHandler for T {
    fn descriptor(&self) -> ToolDef {
        self.definition()
    }

    async fn call(&self, raw_arguments: &str, ctx: &ToolContext<'_>) -> Result<String, ToolError> {
        let args = parse_arguments::<T::Args>(raw_arguments)?;
        self.invoke(args, ctx).await
    }
}

/// Missing or blank argument text is read as an empty object.
pub fn parse_arguments<A: DeserializeOwned>(raw: &str) -> Result<A, ToolError> {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

pub fn unknown_tool_message(name: &str) -> String {
    format!("call tool failed. undefined tool: {name}")
}

pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register<T: Tool>(&mut self, tool: T) {
        self.register_handler(Box::new(tool));
    }

    pub fn register_handler(&mut self, handler: Box<dyn ToolHandler>) {
        let name = handler.descriptor().name;
        if self.tools.insert(name.clone(), handler).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, keeping the last one");
        }
    }

    /// Descriptors sorted by name.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.descriptor()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run one tool call. Never fails: unknown names, bad arguments, handler
    /// errors and handler panics all come back as text.
    pub async fn dispatch(&self, name: &str, raw_arguments: &str, ctx: &ToolContext<'_>) -> String {
        let Some(tool) = self.tools.get(name) else {
            tracing::warn!(tool = %name, "backend requested an unregistered tool");
            return unknown_tool_message(name);
        };

        tracing::info!(
            tool = %name,
            conversation_id = %ctx.conversation_id,
            arguments = %truncate(raw_arguments, 200),
            "invoking tool"
        );
        let started = Instant::now();
        let outcome = AssertUnwindSafe(tool.call(raw_arguments, ctx))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(text)) => text,
            Ok(Err(ToolError::InvalidArguments(reason))) => {
                format!("tool failed: malformed arguments for {name}: {reason}")
            }
            Ok(Err(err)) => format!("tool failed: {err}"),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                tracing::error!(tool = %name, %reason, "tool handler panicked");
                format!("tool failed: {reason}")
            }
        };

        tracing::info!(
            tool = %name,
            result_len = result.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool finished"
        );
        result
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
