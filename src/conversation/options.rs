//! Per-conversation options and typed lookups into the open-ended option bag
//!
//! Backends need different knob sets (model name, reasoning effort, ...).
//! Instead of growing [`ConversationOptions`] for each of them, the knobs
//! live in `extended_properties` and are read through an [`OptionDescriptor`]
//! that knows the key, the expected type, the allowed values and the default.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptionError {
    #[error("Option '{key}' has invalid type. Expected {expected}.")]
    InvalidType { key: String, expected: &'static str },

    #[error("Option '{key}' has invalid value '{value}'. Must be one of: {allowed}")]
    NotAllowed {
        key: String,
        value: String,
        allowed: String,
    },
}

/// Sampling options forwarded verbatim to the model backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_last_n: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// Options the caller attaches to a chat request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationOptions {
    #[serde(default)]
    pub chat_provider_name: String,

    /// Instruction text placed in the developer turn
    #[serde(default)]
    pub system_message: String,

    #[serde(default)]
    pub model_options: ModelOptions,

    /// Tools the model may call; `None` or empty disables tool calling
    #[serde(default)]
    pub enabled_tool_names: Option<Vec<String>>,

    /// Provider-specific knobs, read through [`OptionDescriptor`]s
    #[serde(default)]
    pub extended_properties: HashMap<String, Value>,
}

impl ConversationOptions {
    pub fn tools_enabled(&self) -> bool {
        matches!(&self.enabled_tool_names, Some(names) if !names.is_empty())
    }

    pub fn with_system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = message.into();
        self
    }

    pub fn with_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_tool_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extended_properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    String,
    Enum,
    Boolean,
    Integer,
    Float,
}

/// Describes one provider-specific option
#[derive(Debug, Clone, Serialize)]
pub struct OptionDescriptor {
    /// Key in `extended_properties`
    pub key: &'static str,
    /// Human friendly name
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "type")]
    pub kind: OptionKind,
    /// Textual default, converted like any raw value
    pub default_value: &'static str,
    /// Only used with [`OptionKind::Enum`]
    #[serde(skip_serializing_if = "no_values")]
    pub allowed_values: &'static [&'static str],
}

fn no_values(values: &&'static [&'static str]) -> bool {
    values.is_empty()
}

impl OptionDescriptor {
    /// Read this option from `options`, falling back to the default when absent.
    pub fn value<T: DeserializeOwned>(&self, options: &ConversationOptions) -> Result<T, OptionError> {
        let raw = options
            .extended_properties
            .get(self.key)
            .cloned()
            .unwrap_or_else(|| Value::String(self.default_value.to_string()));

        let normalized = self.normalize(raw)?;
        serde_json::from_value(normalized).map_err(|_| self.invalid_type())
    }

    fn normalize(&self, raw: Value) -> Result<Value, OptionError> {
        match self.kind {
            OptionKind::String => match raw {
                Value::String(_) => Ok(raw),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(self.invalid_type()),
            },
            OptionKind::Enum => {
                let value = match raw {
                    Value::String(s) => s,
                    _ => return Err(self.invalid_type()),
                };
                if !self.allowed_values.contains(&value.as_str()) {
                    return Err(OptionError::NotAllowed {
                        key: self.key.to_string(),
                        value,
                        allowed: self.allowed_values.join(", "),
                    });
                }
                Ok(Value::String(value))
            }
            OptionKind::Boolean => match raw {
                Value::Bool(_) => Ok(raw),
                Value::String(s) => s
                    .trim()
                    .parse::<bool>()
                    .map(Value::Bool)
                    .map_err(|_| self.invalid_type()),
                _ => Err(self.invalid_type()),
            },
            OptionKind::Integer => match raw {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(Value::Number(n)),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| self.invalid_type()),
                _ => Err(self.invalid_type()),
            },
            OptionKind::Float => match raw {
                Value::Number(_) => Ok(raw),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| self.invalid_type()),
                _ => Err(self.invalid_type()),
            },
        }
    }

    fn invalid_type(&self) -> OptionError {
        let expected = match self.kind {
            OptionKind::String | OptionKind::Enum => "string",
            OptionKind::Boolean => "boolean",
            OptionKind::Integer => "integer",
            OptionKind::Float => "float",
        };
        OptionError::InvalidType {
            key: self.key.to_string(),
            expected,
        }
    }
}
