//! Renders a conversation into prompt text
//!
//! Layout of a compiled prompt:
//!
//! ```text
//! <|start|>system<|message|>{identity, date, reasoning level, channels}<|end|>
//! <|start|>developer<|message|># Instructions ... # Tools ...<|end|>
//! <|start|>user<|message|>...<|end|>
//! <|start|>assistant<|channel|>analysis<|message|>...<|end|>
//! ...
//! ```
//!
//! The caller appends the `<|start|>assistant` trailer itself.

use chrono::{Local, NaiveDate};
use serde_json::Value;

use super::options::{META_INFORMATION, REASONING_LEVEL};
use super::{channels, roles, tokens};
use crate::conversation::{Conversation, ConversationOptions, OptionError, Role, ToolContext, Turn};
use crate::tools::{ParameterType, ToolDescriptor, ToolParameter, ToolRegistry};

const KNOWLEDGE_CUTOFF: &str = "2024-06";

pub struct HistoryCompiler<'a> {
    tools: &'a ToolRegistry,
    today: NaiveDate,
}

impl<'a> HistoryCompiler<'a> {
    pub fn new(tools: &'a ToolRegistry) -> Self {
        Self {
            tools,
            today: Local::now().date_naive(),
        }
    }

    /// Pin the date written into the system turn.
    pub fn with_date(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// Compile `conversation` into prompt text.
    ///
    /// With `continuation` the last turn is left without its terminator so
    /// the model picks it up where it stopped.
    pub fn compile(
        &self,
        conversation: &Conversation,
        options: &ConversationOptions,
        continuation: bool,
    ) -> Result<String, OptionError> {
        let tools = self.enabled_tools(options);
        let mut out = String::new();

        let system = self.system_text(options, !tools.is_empty())?;
        append_message(&mut out, roles::SYSTEM, None, &system, tokens::END);
        append_message(
            &mut out,
            roles::DEVELOPER,
            None,
            &developer_text(options, &tools),
            tokens::END,
        );

        let last = conversation.len().saturating_sub(1);
        for (i, turn) in conversation.turns.iter().enumerate() {
            append_turn(&mut out, turn, continuation && i == last);
        }

        Ok(out)
    }

    /// Tool manifest as it appears in the developer turn.
    pub fn manifest(&self, options: &ConversationOptions) -> Option<String> {
        let tools = self.enabled_tools(options);
        if tools.is_empty() {
            None
        } else {
            Some(render_manifest(&tools))
        }
    }

    fn enabled_tools(&self, options: &ConversationOptions) -> Vec<&'a ToolDescriptor> {
        let Some(names) = options.enabled_tool_names.as_ref() else {
            return Vec::new();
        };

        names
            .iter()
            .filter_map(|name| {
                let descriptor = self.tools.descriptor(name);
                if descriptor.is_none() {
                    tracing::warn!(tool = %name, "Enabled tool is not registered, leaving it out");
                }
                descriptor
            })
            .collect()
    }

    fn system_text(&self, options: &ConversationOptions, tools_enabled: bool) -> Result<String, OptionError> {
        let meta: String = META_INFORMATION.value(options)?;
        let level: String = REASONING_LEVEL.value(options)?;

        let mut text = format!(
            "{meta}\nKnowledge cutoff: {KNOWLEDGE_CUTOFF}\nCurrent date: {}\n\nReasoning: {level}\n\n# Valid channels: analysis, commentary, final. Channel must be included for every message.",
            self.today.format("%Y-%m-%d"),
        );
        if tools_enabled {
            text.push_str("\nCalls to these tools must go to the commentary channel: 'functions'.");
        }
        Ok(text)
    }
}

fn developer_text(options: &ConversationOptions, tools: &[&ToolDescriptor]) -> String {
    let mut text = format!("# Instructions\n{}\n", options.system_message);
    if !tools.is_empty() {
        text.push_str(&render_manifest(tools));
    }
    text
}

fn render_manifest(tools: &[&ToolDescriptor]) -> String {
    let mut out = String::from("# Tools\n## functions\nnamespace functions {\n");
    for tool in tools {
        render_tool(&mut out, tool);
    }
    out.push_str("\n} // namespace functions");
    out
}

fn render_tool(out: &mut String, tool: &ToolDescriptor) {
    out.push_str(&format!("// {}\ntype {} = (", tool.description, tool.name));

    if !tool.parameters.is_empty() {
        out.push_str("_: {");
        for parameter in &tool.parameters {
            out.push_str(&format!(
                "\n// {}\n{}{}: {},",
                parameter.description,
                parameter.name,
                if parameter.required { "" } else { "?" },
                parameter_type(parameter),
            ));
            if let Some(default) = &parameter.default {
                out.push_str(&format!(" // default: {}", default_text(default)));
            }
        }
        out.push_str("\n}");
    }

    out.push_str(") => any;");
}

fn parameter_type(parameter: &ToolParameter) -> String {
    match &parameter.enum_values {
        Some(values) if !values.is_empty() => values
            .iter()
            .map(|v| format!("\"{}\"", v.to_lowercase()))
            .collect::<Vec<_>>()
            .join(" | "),
        _ => type_name(&parameter.kind),
    }
}

fn type_name(kind: &ParameterType) -> String {
    match kind {
        ParameterType::String => "string".to_string(),
        ParameterType::Number => "number".to_string(),
        ParameterType::Boolean => "boolean".to_string(),
        ParameterType::Array(item) => format!("{}[]", type_name(item)),
        ParameterType::Any => "any".to_string(),
    }
}

fn default_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}

fn append_turn(out: &mut String, turn: &Turn, open: bool) {
    if turn.role == Role::Tool {
        match &turn.tool_context {
            Some(context) => append_tool_turn(out, context, open),
            None => tracing::warn!(turn = %turn.id, "Tool turn without tool context, skipping"),
        }
        return;
    }

    let role = match turn.role {
        Role::User => roles::USER,
        Role::Assistant => roles::ASSISTANT,
        Role::System | Role::Tool => roles::SYSTEM,
    };

    let content = turn.content.as_deref().unwrap_or_default();
    let terminator = turn.end_token.literal();

    // terminal turns keep the marker inside their content
    let end = if open || content.ends_with(terminator) {
        ""
    } else {
        terminator
    };

    append_message(out, role, turn.channel.as_deref(), content, end);
}

fn append_tool_turn(out: &mut String, context: &ToolContext, open: bool) {
    let (role, channel, end) = if context.is_result {
        (
            format!("functions.{} to=assistant", context.tool_name),
            channels::COMMENTARY.to_string(),
            tokens::END,
        )
    } else {
        (
            roles::ASSISTANT.to_string(),
            format!("{}{} {}", channels::FUNCTION_CALL_PREFIX, context.tool_name, channels::FUNCTION_CALL_SUFFIX),
            tokens::CALL,
        )
    };

    append_message(out, &role, Some(&channel), &context.content, if open { "" } else { end });
}

fn append_message(out: &mut String, role: &str, channel: Option<&str>, content: &str, end: &str) {
    out.push_str(tokens::START);
    out.push_str(role);
    if let Some(channel) = channel {
        out.push_str(tokens::CHANNEL);
        out.push_str(channel);
    }
    out.push_str(tokens::MESSAGE);
    out.push_str(content);
    out.push_str(end);
}
