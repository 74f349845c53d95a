//! # loom-config
//!
//! Configuration for the Loom engine. Reads `loom.toml`, then applies
//! environment variable overrides.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::LoomConfig;
pub use schema::{ConfigWarning, StoreBackend, WarningSeverity};
