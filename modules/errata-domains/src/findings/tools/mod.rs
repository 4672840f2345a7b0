pub mod fetch_url;

pub use fetch_url::{FetchUrlArgs, FetchUrlOutput, FetchUrlTool};
