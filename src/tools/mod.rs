//! Tools the model can call
//!
//! A tool is a typed async function with a descriptor. Tools are registered
//! once at startup into a [`ToolRegistry`]; at the registry boundary the
//! typed parameters are erased to JSON so the chat engine only ever deals
//! with `name + arguments JSON -> ToolOutcome`.
//!
//! # Example
//!
//! ```ignore
//! use harmony_chat::tools::prelude::*;
//!
//! #[derive(Default, Deserialize)]
//! pub struct EchoParams {
//!     text: String,
//! }
//!
//! pub struct Echo;
//!
//! #[async_trait]
//! impl Tool for Echo {
//!     type Params = EchoParams;
//!
//!     fn descriptor(&self) -> ToolDescriptor {
//!         ToolDescriptor::new("echo", "Repeats the input")
//!             .with_parameter(ToolParameter::new("text", ParameterType::String, "Text to repeat"))
//!     }
//!
//!     async fn invoke(&self, params: EchoParams) -> Result<String, ToolError> {
//!         Ok(json!({ "text": params.text }).to_string())
//!     }
//! }
//! ```

pub mod weather;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use weather::GetCurrentWeather;

/// Prelude for tool development
pub mod prelude {
    pub use super::{ParameterType, Tool, ToolDescriptor, ToolError, ToolParameter};
    pub use async_trait::async_trait;
    pub use serde::Deserialize;
    pub use serde_json::json;
}

/// Errors a tool implementation can return
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Shape of a parameter as shown to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Array(Box<ParameterType>),
    Any,
}

impl ParameterType {
    pub fn array_of(item: ParameterType) -> Self {
        ParameterType::Array(Box::new(item))
    }
}

/// One field of a tool's parameter object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl ToolParameter {
    /// A required parameter
    pub fn new(name: impl Into<String>, kind: ParameterType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            required: true,
            default: None,
            enum_values: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Restrict a string parameter to a fixed set of values
    pub fn with_enum<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// Name, description and parameters of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique name of the tool (e.g., "get_current_weather")
    pub name: String,

    /// Human-readable description for the model to understand when to use this tool
    pub description: String,

    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MalformedToolName,
    MalformedArguments,
    ExecutionError,
}

/// Result of dispatching a tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Success(String),
    Failure { kind: FailureKind, message: String },
}

impl ToolOutcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        ToolOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    /// Text shown to the model: the result, or a human-readable error.
    pub fn describe(&self, tool_name: &str) -> String {
        match self {
            ToolOutcome::Success(result) => result.clone(),
            ToolOutcome::Failure { message, .. } if !message.is_empty() => message.clone(),
            ToolOutcome::Failure { kind, .. } => match kind {
                FailureKind::MalformedToolName => format!(
                    "Tool name \"{tool_name}\" was incorrect, not a tool, or couldn't be parsed."
                ),
                FailureKind::MalformedArguments => {
                    format!("Arguments for \"{tool_name}\" were incorrect or couldn't be parsed.")
                }
                FailureKind::ExecutionError => {
                    "An error occured during execution of the tool.".to_string()
                }
            },
        }
    }
}

/// A callable tool with typed parameters
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    /// Parameter object; blank arguments produce `Default::default()`
    type Params: DeserializeOwned + Default + Send;

    fn descriptor(&self) -> ToolDescriptor;

    /// Returns the result as JSON text
    async fn invoke(&self, params: Self::Params) -> Result<String, ToolError>;
}

/// Tool with its parameter type erased to JSON
#[async_trait]
trait DynTool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn call(&self, arguments: &str) -> ToolOutcome;
}

struct Registered<T> {
    tool: T,
    descriptor: ToolDescriptor,
}

#[async_trait]
impl<T: Tool> DynTool for Registered<T> {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, arguments: &str) -> ToolOutcome {
        let params = match parse_arguments::<T::Params>(arguments) {
            Ok(params) => params,
            Err(e) => {
                return ToolOutcome::failure(
                    FailureKind::MalformedArguments,
                    format!("Failed to deserialize parameters: {e}"),
                )
            }
        };

        match AssertUnwindSafe(self.tool.invoke(params)).catch_unwind().await {
            Ok(Ok(result)) if !result.trim().is_empty() => ToolOutcome::Success(result),
            Ok(Ok(_)) => ToolOutcome::failure(FailureKind::ExecutionError, "Tool returned an empty result."),
            Ok(Err(e)) => ToolOutcome::failure(
                FailureKind::ExecutionError,
                format!("Tool execution failed: {e}"),
            ),
            Err(_) => ToolOutcome::failure(FailureKind::ExecutionError, "Tool execution panicked."),
        }
    }
}

fn parse_arguments<P: DeserializeOwned + Default>(arguments: &str) -> Result<P, serde_json::Error> {
    let trimmed = arguments.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(P::default());
    }
    serde_json::from_str(trimmed)
}

/// Name to implementation map, built once at startup
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn DynTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the tools shipped in this crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(GetCurrentWeather);
        registry
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register<T: Tool>(&mut self, tool: T) {
        let descriptor = tool.descriptor();
        let name = descriptor.name.clone();
        if self.tools.contains_key(&name) {
            tracing::warn!(tool = %name, "Replacing already registered tool");
        }
        self.tools
            .insert(name, Arc::new(Registered { tool, descriptor }));
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|t| t.descriptor())
    }

    /// All descriptors, sorted by name
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut all: Vec<ToolDescriptor> = self.tools.values().map(|t| t.descriptor().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
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

    /// Resolve `tool_name`, parse `arguments` and run the tool.
    pub async fn execute(&self, tool_name: &str, arguments: &str) -> ToolOutcome {
        let Some(tool) = self.tools.get(tool_name) else {
            tracing::warn!(tool = %tool_name, "Tool not found");
            return ToolOutcome::failure(
                FailureKind::MalformedToolName,
                format!("Tool '{tool_name}' not found."),
            );
        };

        let started = Instant::now();
        let outcome = tool.call(arguments).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            ToolOutcome::Success(_) => {
                tracing::info!(tool = %tool_name, duration_ms, "Tool call succeeded")
            }
            ToolOutcome::Failure { kind, message } => {
                tracing::warn!(tool = %tool_name, ?kind, %message, duration_ms, "Tool call failed")
            }
        }
        outcome
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}
