//! Storage backends for the session layer
//!
//! Key/value stores and named locks implementing the traits from
//! `enm-session-core`. The in-memory variants serve a single process; the
//! file-backed variants are shared by every process on the host.

pub mod file;
pub mod locks;
pub mod memory;

pub use file::FileStore;
pub use locks::{FileLocks, ProcessLocks};
pub use memory::MemoryStore;
