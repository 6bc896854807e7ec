//! ENM Session Core - shared types, errors and infrastructure
//!
//! This crate defines the error taxonomy, configuration, logging and the
//! persistence/locking abstractions used by every other session crate

pub mod async_utils;
pub mod config;
pub mod error;
pub mod logging;
pub mod traits;
pub mod types;

pub use async_utils::*;
pub use config::*;
pub use error::*;
pub use logging::*;
pub use traits::*;
pub use types::*;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio;
pub use tracing;
