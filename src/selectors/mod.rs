//! Versioned CSS selector sets for marketplace listing forms, with
//! first-match resolution, persisted remote updates and health probing.

pub mod defaults;
pub mod health;
pub mod page;
pub mod prober;
pub mod registry;
pub mod store;
pub mod types;

pub use health::generate_probe_script;
pub use page::{MAX_SNAPSHOT_BYTES, PageSource, SNAPSHOT_BODY_LIMIT, StaticPage};
pub use prober::HealthProber;
pub use registry::SelectorRegistry;
#[cfg(test)]
pub use store::MemoryStore;
pub use store::{ConfigStore, FileStore};
pub use types::HealthCheckResult;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("No selector config for platform: {0}")]
    UnknownPlatform(String),
    #[error("selector config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("selector config decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("page fetch failed: {0}")]
    Fetch(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}
