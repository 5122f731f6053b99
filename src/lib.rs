//! Model acquisition and storage resolution for the voxkey dictation
//! keyboard (Android IME and Windows tray front-ends).
//!
//! The speech engine is external; this crate produces verified local model
//! files for it and tracks where they live.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod settings;

#[cfg(test)]
mod tests;

pub use config::ManagerConfig;
pub use error::{ErrorKind, ModelError, Result, UserAction};
pub use models::{DownloadState, ModelManager, StorageBackendRef};
