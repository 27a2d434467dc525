//! Public API for configuration

pub mod loader;
pub mod types;

// Re-export the main entrypoints:
pub use loader::load;
pub use types::{Config, ConfigError};
