//! Model acquisition and storage resolution.
//!
//! Lookups go manager -> locator -> backends (default first, then custom).
//! Downloads go manager -> catalog -> downloader -> active backend.

pub mod catalog;
pub mod downloader;
pub mod locator;
pub mod manager;
pub mod state;
pub mod storage;

pub use catalog::{ModelCatalog, ModelDescriptor};
pub use downloader::{DownloadEvent, Downloader};
pub use locator::ModelLocator;
pub use manager::{ModelManager, ModelManagerBuilder, ModelStatus};
pub use state::DownloadState;
pub use storage::{
    AccessGrants, CustomBackend, DirectPathTranslator, LocalBackend, PathTranslator,
    PersistedGrants, SafTreeTranslator, StorageBackend, StorageBackendRef,
};
