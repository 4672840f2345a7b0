pub mod cache;
pub mod prompt;
pub mod text;

pub use cache::{PromptCache, PromptCacheError};
pub use prompt::{PgPromptStore, Prompt, PromptStore};
pub use text::{INVESTIGATION_PROMPT, INVESTIGATION_PROMPT_VERSION, VALIDATION_PROMPT};
