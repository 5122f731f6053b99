//! Error taxonomy for model acquisition and storage resolution.
//!
//! Every public operation returns a typed [`ModelError`] so that UI code can
//! branch on [`ErrorKind`] and pick the right recovery (retry the download vs.
//! re-select a storage folder).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Unknown model '{0}'")]
    UnknownModel(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Download cancelled by user")]
    Cancelled,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// I/O or connection failure after the transfer started.
    #[error("Download failed: {0}")]
    Download(String),

    #[error("A download is already in progress for model '{0}'")]
    DownloadInProgress(String),

    #[error("Transcription engine error: {0}")]
    Engine(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Coarse classification of a [`ModelError`], safe to hand to a UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownModel,
    Network,
    Verification,
    Cancelled,
    StorageUnavailable,
    Download,
    DownloadInProgress,
    Engine,
    Settings,
    Io,
}

/// What the user should be offered after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    Retry,
    ReconfigureStorage,
    None,
}

impl ErrorKind {
    pub fn suggested_action(self) -> UserAction {
        match self {
            ErrorKind::Network
            | ErrorKind::Verification
            | ErrorKind::Download
            | ErrorKind::Cancelled
            | ErrorKind::Io => UserAction::Retry,
            ErrorKind::StorageUnavailable => UserAction::ReconfigureStorage,
            ErrorKind::UnknownModel
            | ErrorKind::DownloadInProgress
            | ErrorKind::Engine
            | ErrorKind::Settings => UserAction::None,
        }
    }
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::UnknownModel(_) => ErrorKind::UnknownModel,
            ModelError::Network(_) => ErrorKind::Network,
            ModelError::Verification(_) => ErrorKind::Verification,
            ModelError::Cancelled => ErrorKind::Cancelled,
            ModelError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            ModelError::Download(_) => ErrorKind::Download,
            ModelError::DownloadInProgress(_) => ErrorKind::DownloadInProgress,
            ModelError::Engine(_) => ErrorKind::Engine,
            ModelError::Settings(_) => ErrorKind::Settings,
            ModelError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self {
        ModelError::Settings(e.to_string())
    }
}
