pub mod error;
pub mod openai;
pub mod responses;
pub mod schema;
pub mod tool;
pub mod traits;
pub mod util;

pub use error::AiError;
pub use openai::OpenAi;
pub use responses::{
    FunctionCallOutput, FunctionCallRequest, InputItem, ResponseBody, ResponseRequest, TextFormat,
    ToolSpec,
};
pub use schema::StructuredOutput;
pub use tool::{DynTool, Tool, ToolDefinition, ToolWrapper};
pub use traits::ResponsesApi;
pub use util::{preview, truncate_to_char_boundary};
