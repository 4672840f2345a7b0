use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::error::Error;

use crate::error::AiError;
use crate::responses::ToolSpec;

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    /// Strict function tool declaration for a Responses request.
    pub fn into_spec(self) -> ToolSpec {
        ToolSpec::Function {
            name: self.name,
            description: self.description,
            parameters: self.parameters,
            strict: true,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    const NAME: &'static str;
    type Error: Error + Send + Sync + 'static;
    type Args: DeserializeOwned + Send + Sync;
    type Output: Serialize + Send + Sync;

    fn definition(&self) -> ToolDefinition;
    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error>;
}

/// Object-safe view of a [`Tool`], taking and returning raw JSON.
#[async_trait]
pub trait DynTool: Send + Sync {
    fn name(&self) -> &'static str;
    fn definition(&self) -> ToolDefinition;
    async fn call_json(&self, arguments: &str) -> Result<Value, AiError>;
}

pub struct ToolWrapper<T: Tool>(pub T);

#[async_trait]
impl<T: Tool> DynTool for ToolWrapper<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn definition(&self) -> ToolDefinition {
        self.0.definition()
    }

    async fn call_json(&self, arguments: &str) -> Result<Value, AiError> {
        let parsed: T::Args = serde_json::from_str(arguments)
            .map_err(|e| AiError::Tool(format!("invalid arguments for {}: {}", T::NAME, e)))?;

        let result = self
            .0
            .call(parsed)
            .await
            .map_err(|e| AiError::Tool(format!("{} failed: {}", T::NAME, e)))?;

        Ok(serde_json::to_value(result)?)
    }
}
