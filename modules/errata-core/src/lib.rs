pub mod clock;
pub mod config;
pub mod deps;
pub mod fetcher;
pub mod file_config;
pub mod hashing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use deps::ServerDeps;
pub use fetcher::{FetchError, FetchServiceClient, FetchedPage, PageFetcher};
pub use file_config::{load_config, FileConfig, ModelsConfig, TimingConfig, WorkerConfig};
pub use hashing::content_hash;
