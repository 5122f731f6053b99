//! Storage backends: places that can hold model files.
//!
//! The default backend is a fixed subdirectory of the app's private data
//! directory. A custom backend is a user-picked folder identified by an opaque
//! location token (an Android tree URI, or a plain path / `file://` URI on
//! desktop). Custom tokens go through a [`PathTranslator`] and an
//! [`AccessGrants`] check on every resolution; neither result is cached.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{ModelError, Result};

/// Which backend new downloads go to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum StorageBackendRef {
    #[default]
    Default,
    Custom(String),
}

impl StorageBackendRef {
    pub fn from_token(token: Option<String>) -> Self {
        match token {
            Some(t) if !t.trim().is_empty() => StorageBackendRef::Custom(t),
            _ => StorageBackendRef::Default,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            StorageBackendRef::Default => None,
            StorageBackendRef::Custom(token) => Some(token.as_str()),
        }
    }
}

pub trait StorageBackend: Send + Sync {
    /// Human readable name for logs and error messages.
    fn label(&self) -> String;

    /// Directory holding model files, or `StorageUnavailable`.
    fn resolve_directory(&self) -> Result<PathBuf>;

    /// Create the directory if needed and prove a file can be written there.
    fn ensure_writable(&self) -> bool;
}

/// Maps a location token to a physical directory. Best effort.
pub trait PathTranslator: Send + Sync {
    fn translate(&self, token: &str) -> Option<PathBuf>;
}

/// Answers whether the user's access grant for a token is still valid.
pub trait AccessGrants: Send + Sync {
    fn is_granted(&self, token: &str) -> bool;
}

/// Grants remembered by the app itself (desktop stand-in for the OS's
/// persisted URI permissions).
#[derive(Debug, Default)]
pub struct PersistedGrants {
    granted: RwLock<HashSet<String>>,
}

impl PersistedGrants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            granted: RwLock::new(tokens.into_iter().collect()),
        }
    }

    pub fn grant(&self, token: &str) {
        match self.granted.write() {
            Ok(mut g) => {
                g.insert(token.to_string());
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(token.to_string());
            }
        }
    }

    pub fn revoke(&self, token: &str) -> bool {
        match self.granted.write() {
            Ok(mut g) => g.remove(token),
            Err(poisoned) => poisoned.into_inner().remove(token),
        }
    }

    pub fn tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .granted
            .read()
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default();
        tokens.sort();
        tokens
    }
}

impl AccessGrants for PersistedGrants {
    fn is_granted(&self, token: &str) -> bool {
        self.granted
            .read()
            .map(|g| g.contains(token))
            .unwrap_or(false)
    }
}

/// App-private models directory. Always available.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    dir: PathBuf,
}

impl LocalBackend {
    pub fn new(app_data_dir: &Path, models_subdir: &str) -> Self {
        Self {
            dir: app_data_dir.join(models_subdir),
        }
    }
}

impl StorageBackend for LocalBackend {
    fn label(&self) -> String {
        format!("default storage ({})", self.dir.display())
    }

    fn resolve_directory(&self) -> Result<PathBuf> {
        if !self.dir.is_dir() {
            std::fs::create_dir_all(&self.dir).map_err(|e| {
                ModelError::StorageUnavailable(format!(
                    "Failed to create models directory {:?}: {}",
                    self.dir, e
                ))
            })?;
        }
        Ok(self.dir.clone())
    }

    fn ensure_writable(&self) -> bool {
        match self.resolve_directory() {
            Ok(dir) => probe_writable(&dir),
            Err(e) => {
                log::warn!("[LocalBackend] {}", e);
                false
            }
        }
    }
}

/// User-selected external folder.
pub struct CustomBackend {
    token: String,
    models_subdir: String,
    translator: Arc<dyn PathTranslator>,
    grants: Arc<dyn AccessGrants>,
}

impl CustomBackend {
    pub fn new(
        token: impl Into<String>,
        models_subdir: impl Into<String>,
        translator: Arc<dyn PathTranslator>,
        grants: Arc<dyn AccessGrants>,
    ) -> Self {
        Self {
            token: token.into(),
            models_subdir: models_subdir.into(),
            translator,
            grants,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl StorageBackend for CustomBackend {
    fn label(&self) -> String {
        format!("custom storage ({})", self.token)
    }

    fn resolve_directory(&self) -> Result<PathBuf> {
        if !self.grants.is_granted(&self.token) {
            return Err(ModelError::StorageUnavailable(format!(
                "Access to '{}' is no longer granted. Please select the folder again.",
                self.token
            )));
        }

        let root = self.translator.translate(&self.token).ok_or_else(|| {
            ModelError::StorageUnavailable(format!(
                "Cannot map '{}' to a local folder",
                self.token
            ))
        })?;

        if !root.is_dir() {
            return Err(ModelError::StorageUnavailable(format!(
                "Folder {:?} for '{}' is not available (removed or unmounted?)",
                root, self.token
            )));
        }

        Ok(root.join(&self.models_subdir))
    }

    fn ensure_writable(&self) -> bool {
        let dir = match self.resolve_directory() {
            Ok(dir) => dir,
            Err(e) => {
                log::warn!("[CustomBackend] {}", e);
                return false;
            }
        };
        if let Err(e) = std::fs::create_dir_all(&dir) {
            log::warn!("[CustomBackend] Failed to create {:?}: {}", dir, e);
            return false;
        }
        probe_writable(&dir)
    }
}

fn probe_writable(dir: &Path) -> bool {
    let probe = tempfile::Builder::new()
        .prefix(".voxkey-probe")
        .tempfile_in(dir)
        .and_then(|mut f| {
            f.write_all(b"ok")?;
            f.flush()
        });
    match probe {
        Ok(()) => true,
        Err(e) => {
            log::warn!("[storage] {:?} is not writable: {}", dir, e);
            false
        }
    }
}

const EXTERNAL_STORAGE_TREE: &str = "content://com.android.externalstorage.documents/tree/";
const DOWNLOADS_TREE: &str = "content://com.android.providers.downloads.documents/tree/";

static VOLUME_ID: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}$").ok());

/// Translates Android storage-access-framework tree URIs to filesystem paths.
///
/// Only the external storage and downloads document providers are understood.
/// `primary:` maps under `primary_root`, `XXXX-XXXX:` (SD card / USB volume ids)
/// maps under `volumes_root`.
#[derive(Debug, Clone)]
pub struct SafTreeTranslator {
    primary_root: PathBuf,
    volumes_root: PathBuf,
}

impl Default for SafTreeTranslator {
    fn default() -> Self {
        Self::new("/storage/emulated/0", "/storage")
    }
}

impl SafTreeTranslator {
    pub fn new(primary_root: impl Into<PathBuf>, volumes_root: impl Into<PathBuf>) -> Self {
        Self {
            primary_root: primary_root.into(),
            volumes_root: volumes_root.into(),
        }
    }

    fn document_id(token: &str, prefix: &str) -> Option<String> {
        let rest = token.strip_prefix(prefix)?;
        let encoded = rest.split('/').next().filter(|s| !s.is_empty())?;
        urlencoding::decode(encoded).ok().map(|s| s.into_owned())
    }
}

impl PathTranslator for SafTreeTranslator {
    fn translate(&self, token: &str) -> Option<PathBuf> {
        if let Some(doc_id) = Self::document_id(token, DOWNLOADS_TREE) {
            // Downloads provider exposes raw paths as "raw:/storage/..."
            let raw = doc_id.strip_prefix("raw:")?;
            let path = PathBuf::from(raw);
            return (path.is_absolute() && is_contained(&path)).then_some(path);
        }

        let doc_id = Self::document_id(token, EXTERNAL_STORAGE_TREE)?;
        let (volume, relative) = doc_id.split_once(':')?;

        let root = if volume.eq_ignore_ascii_case("primary") {
            self.primary_root.clone()
        } else if VOLUME_ID.as_ref().is_some_and(|re| re.is_match(volume)) {
            self.volumes_root.join(volume)
        } else {
            log::debug!("[SafTreeTranslator] Unrecognised volume '{}'", volume);
            return None;
        };

        let relative = Path::new(relative.trim_matches('/'));
        if relative.as_os_str().is_empty() {
            return Some(root);
        }
        if !is_contained(relative) {
            return None;
        }
        Some(root.join(relative))
    }
}

/// Desktop translator: tokens are absolute paths or `file://` URIs.
#[derive(Debug, Clone, Default)]
pub struct DirectPathTranslator;

impl PathTranslator for DirectPathTranslator {
    fn translate(&self, token: &str) -> Option<PathBuf> {
        let path = if token.starts_with("file://") {
            url::Url::parse(token).ok()?.to_file_path().ok()?
        } else {
            PathBuf::from(token)
        };
        (path.is_absolute() && is_contained(&path)).then_some(path)
    }
}

pub fn platform_translator() -> Arc<dyn PathTranslator> {
    #[cfg(target_os = "android")]
    {
        Arc::new(SafTreeTranslator::default())
    }
    #[cfg(not(target_os = "android"))]
    {
        Arc::new(DirectPathTranslator)
    }
}

fn is_contained(path: &Path) -> bool {
    !path.components().any(|c| matches!(c, Component::ParentDir))
}
