//! Wire types for the OpenAI Responses API.
//!
//! Output items are kept as raw JSON so a caller can echo them back verbatim
//! as input on the next round (hosted tool calls and reasoning items carry
//! provider-specific fields we never need to interpret).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Request
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ResponseRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<TextConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    pub store: bool,
}

impl ResponseRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            instructions: None,
            input: Vec::new(),
            tools: Vec::new(),
            text: None,
            temperature: None,
            max_output_tokens: None,
            store: false,
        }
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn input(mut self, input: Vec<InputItem>) -> Self {
        self.input = input;
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn text_format(mut self, format: TextFormat) -> Self {
        self.text = Some(TextConfig { format });
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InputItem {
    Message(InputMessage),
    FunctionCallOutput(FunctionCallOutput),
    /// An output item from a previous response, echoed back unchanged.
    Echo(Value),
}

impl InputItem {
    pub fn user(content: impl Into<String>) -> Self {
        Self::Message(InputMessage {
            role: "user".to_string(),
            content: content.into(),
        })
    }

    pub fn developer(content: impl Into<String>) -> Self {
        Self::Message(InputMessage {
            role: "developer".to_string(),
            content: content.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputMessage {
    pub role: String,
    pub content: String,
}

/// Result of one function tool invocation, keyed by the model's call id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionCallOutput {
    #[serde(rename = "type")]
    item_type: &'static str,
    pub call_id: String,
    pub output: String,
}

impl FunctionCallOutput {
    pub fn new(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            item_type: "function_call_output",
            call_id: call_id.into(),
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolSpec {
    /// Provider-hosted web search.
    WebSearch,
    Function {
        name: String,
        description: String,
        parameters: Value,
        strict: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TextConfig {
    pub format: TextFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextFormat {
    #[serde(rename = "type")]
    pub format_type: String,
    pub name: String,
    pub schema: Value,
    pub strict: bool,
}

impl TextFormat {
    pub fn json_schema(name: impl Into<String>, schema: Value) -> Self {
        Self {
            format_type: "json_schema".to_string(),
            name: name.into(),
            schema,
            strict: true,
        }
    }
}

// =============================================================================
// Response
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseBody {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    pub error: Option<ResponseErrorBody>,
    #[serde(default)]
    pub output: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A function call requested by the model that has not been answered yet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FunctionCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

impl ResponseBody {
    /// Completion status; a missing status is reported as `"unknown"`.
    pub fn status(&self) -> &str {
        self.status.as_deref().unwrap_or("unknown")
    }

    pub fn is_completed(&self) -> bool {
        self.status() == "completed"
    }

    /// Why the response stopped early: the incomplete reason, else the error code.
    pub fn incomplete_reason(&self) -> Option<&str> {
        self.incomplete_details
            .as_ref()
            .and_then(|d| d.reason.as_deref())
            .or_else(|| self.error.as_ref().and_then(|e| e.code.as_deref()))
    }

    /// Function calls in output order. Items that fail to parse are skipped.
    pub fn function_calls(&self) -> Vec<FunctionCallRequest> {
        self.output
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("function_call"))
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect()
    }

    /// Concatenated `output_text` parts of every assistant message.
    pub fn output_text(&self) -> String {
        let mut text = String::new();
        for item in &self.output {
            if item.get("type").and_then(Value::as_str) != Some("message") {
                continue;
            }
            let Some(parts) = item.get("content").and_then(Value::as_array) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(Value::as_str) == Some("output_text") {
                    if let Some(t) = part.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
            }
        }
        text
    }
}
