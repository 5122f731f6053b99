use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{broadcast, watch};

use super::catalog::{ModelCatalog, ModelDescriptor};
use super::downloader::{partial_path_for, DownloadEvent, Downloader};
use super::locator::ModelLocator;
use super::state::{DownloadState, DownloadStateHolder};
use super::storage::{
    platform_translator, AccessGrants, CustomBackend, LocalBackend, PathTranslator,
    PersistedGrants, StorageBackend, StorageBackendRef,
};
use crate::config::ManagerConfig;
use crate::error::{ModelError, Result};
use crate::settings::{SettingsStore, StorageSettings, KEY_GRANTED_STORAGE_URIS};

/// Catalog entry plus where (and whether) it is on disk right now.
#[derive(Clone, Debug, Serialize)]
pub struct ModelStatus {
    pub id: String,
    pub display_name: String,
    pub file_name: String,
    pub size: u64,
    pub downloaded: bool,
    pub path: Option<PathBuf>,
}

struct ActiveDownload {
    model_id: String,
    cancel: Arc<AtomicBool>,
}

struct Inner {
    config: ManagerConfig,
    catalog: Arc<ModelCatalog>,
    locator: ModelLocator,
    downloader: Downloader,
    local: LocalBackend,
    active_backend: RwLock<StorageBackendRef>,
    translator: Arc<dyn PathTranslator>,
    grants: Arc<dyn AccessGrants>,
    // Only set when the manager keeps grants itself (desktop)
    own_grants: Option<Arc<PersistedGrants>>,
    store: Arc<dyn SettingsStore>,
    // Guards the single in-flight download and backend swaps
    active_download: Mutex<Option<ActiveDownload>>,
    state: DownloadStateHolder,
}

/// Public entry point for model downloads and lookups.
///
/// Cheap to clone; clones share the same state. [`ModelManager::start_download`]
/// spawns onto the current Tokio runtime.
#[derive(Clone)]
pub struct ModelManager {
    inner: Arc<Inner>,
}

pub struct ModelManagerBuilder {
    config: ManagerConfig,
    catalog: Option<ModelCatalog>,
    store: Option<Arc<dyn SettingsStore>>,
    translator: Option<Arc<dyn PathTranslator>>,
    grants: Option<Arc<dyn AccessGrants>>,
    http_client: Option<reqwest::Client>,
}

impl ModelManagerBuilder {
    pub fn catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the platform's location-token translation.
    pub fn path_translator(mut self, translator: Arc<dyn PathTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Use platform-managed access grants instead of the persisted list.
    pub fn access_grants(mut self, grants: Arc<dyn AccessGrants>) -> Self {
        self.grants = Some(grants);
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn build(self) -> Result<ModelManager> {
        let config = self.config;
        let catalog = Arc::new(
            self.catalog
                .unwrap_or_else(|| ModelCatalog::whisper_ggml(&config.base_url)),
        );
        let store: Arc<dyn SettingsStore> = self
            .store
            .unwrap_or_else(|| Arc::new(crate::settings::MemoryStore::new()));
        let settings = StorageSettings::load(store.as_ref());

        let (grants, own_grants): (Arc<dyn AccessGrants>, Option<Arc<PersistedGrants>>) =
            match self.grants {
                Some(grants) => (grants, None),
                None => {
                    let persisted = Arc::new(PersistedGrants::with_tokens(
                        settings.granted_storage_uris.iter().cloned(),
                    ));
                    (persisted.clone(), Some(persisted))
                }
            };

        let downloader = match self.http_client {
            Some(client) => Downloader::with_client(client),
            None => Downloader::new(config.connect_timeout, config.read_timeout)?,
        };

        let active_backend = settings.backend();
        log::info!(
            "[ModelManager] Models directory: {:?}, active backend: {:?}",
            config.app_data_dir.join(&config.models_subdir),
            active_backend
        );

        Ok(ModelManager {
            inner: Arc::new(Inner {
                locator: ModelLocator::new(catalog.clone()),
                local: LocalBackend::new(&config.app_data_dir, &config.models_subdir),
                catalog,
                downloader,
                active_backend: RwLock::new(active_backend),
                translator: self.translator.unwrap_or_else(platform_translator),
                grants,
                own_grants,
                store,
                active_download: Mutex::new(None),
                state: DownloadStateHolder::new(),
                config,
            }),
        })
    }
}

// Progress publication interval when neither server nor catalog gives a size
const UNKNOWN_SIZE_PUBLISH_BYTES: u64 = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::error!("[ModelManager] Recovering from poisoned lock");
        poisoned.into_inner()
    })
}

impl ModelManager {
    pub fn builder(config: ManagerConfig) -> ModelManagerBuilder {
        ModelManagerBuilder {
            config,
            catalog: None,
            store: None,
            translator: None,
            grants: None,
            http_client: None,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.inner.catalog
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn active_backend(&self) -> StorageBackendRef {
        self.inner
            .active_backend
            .read()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    fn custom_backend(&self) -> Option<CustomBackend> {
        match self.active_backend() {
            StorageBackendRef::Default => None,
            StorageBackendRef::Custom(token) => Some(CustomBackend::new(
                token,
                self.inner.config.models_subdir.clone(),
                self.inner.translator.clone(),
                self.inner.grants.clone(),
            )),
        }
    }

    /// Default backend first, then the configured custom backend.
    fn with_backends<R>(&self, f: impl FnOnce(&[&dyn StorageBackend]) -> R) -> R {
        match self.custom_backend() {
            Some(custom) => f(&[&self.inner.local, &custom]),
            None => f(&[&self.inner.local]),
        }
    }

    pub fn is_downloaded(&self, model_id: &str) -> bool {
        self.path_for(model_id).is_some()
    }

    /// Locate a usable copy of `model_id`. Recomputed on every call.
    pub fn path_for(&self, model_id: &str) -> Option<PathBuf> {
        match self.with_backends(|backends| self.inner.locator.locate(model_id, backends)) {
            Ok(path) => path,
            Err(e) => {
                log::warn!("[ModelManager] {}", e);
                None
            }
        }
    }

    /// Where a new download of `model_id` would be written.
    ///
    /// Always the active backend. A custom backend that cannot currently be
    /// written to is an error; there is no fallback to default storage.
    pub fn download_path_for(&self, model_id: &str) -> Result<PathBuf> {
        let descriptor = self.inner.catalog.lookup(model_id)?;
        let dir = match self.custom_backend() {
            Some(custom) => {
                let dir = custom.resolve_directory()?;
                if !custom.ensure_writable() {
                    return Err(ModelError::StorageUnavailable(format!(
                        "Cannot write to {}",
                        custom.label()
                    )));
                }
                dir
            }
            None => {
                let dir = self.inner.local.resolve_directory()?;
                if !self.inner.local.ensure_writable() {
                    return Err(ModelError::StorageUnavailable(format!(
                        "Cannot write to {}",
                        self.inner.local.label()
                    )));
                }
                dir
            }
        };
        Ok(dir.join(&descriptor.file_name))
    }

    pub fn state(&self) -> DownloadState {
        self.inner.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.inner.state.subscribe()
    }

    /// Every state transition, including each published progress step.
    pub fn transitions(&self) -> broadcast::Receiver<DownloadState> {
        self.inner.state.transitions()
    }

    pub fn is_downloading(&self) -> bool {
        lock(&self.inner.active_download).is_some()
    }

    /// Start downloading `model_id` in the background.
    ///
    /// Returns immediately; progress and the outcome are published through
    /// [`ModelManager::subscribe`] / [`ModelManager::transitions`]. Rejected
    /// with `DownloadInProgress` while another download is running.
    pub fn start_download(&self, model_id: &str) -> Result<()> {
        let descriptor = self.inner.catalog.lookup(model_id)?.clone();

        let mut active = lock(&self.inner.active_download);
        if let Some(current) = active.as_ref() {
            log::warn!(
                "[ModelManager] Rejecting download of '{}': '{}' is still downloading",
                model_id,
                current.model_id
            );
            return Err(ModelError::DownloadInProgress(current.model_id.clone()));
        }

        let preflight = self.download_path_for(model_id).and_then(|target| {
            tokio::runtime::Handle::try_current()
                .map(|runtime| (target, runtime))
                .map_err(|e| ModelError::Download(format!("No async runtime available: {}", e)))
        });
        let (target, runtime) = match preflight {
            Ok(ok) => ok,
            Err(e) => {
                log::error!("[ModelManager] Cannot start download of '{}': {}", model_id, e);
                self.inner.state.transition(DownloadState::error(model_id, &e));
                return Err(e);
            }
        };

        let cancel = Arc::new(AtomicBool::new(false));
        *active = Some(ActiveDownload {
            model_id: model_id.to_string(),
            cancel: cancel.clone(),
        });
        self.inner.state.transition(DownloadState::Downloading {
            model_id: model_id.to_string(),
            progress: 0.0,
            bytes_done: 0,
            bytes_total: descriptor.expected_size_bytes,
        });
        drop(active);

        log::info!(
            "[ModelManager] Starting download of '{}' to {:?}",
            model_id,
            target
        );

        let manager = self.clone();
        runtime.spawn(async move {
            manager.run_download(descriptor, target, cancel).await;
        });
        Ok(())
    }

    async fn run_download(&self, descriptor: ModelDescriptor, target: PathBuf, cancel: Arc<AtomicBool>) {
        let model_id = descriptor.id.clone();
        let step = self.inner.config.progress_step;
        let mut last_published = 0.0_f64;
        let mut last_published_bytes = 0_u64;

        let result = self
            .inner
            .downloader
            .download(&descriptor, &target, &cancel, |event| match event {
                DownloadEvent::Progress {
                    fraction,
                    bytes_done,
                    bytes_total,
                } => {
                    // Only publish every `step` to avoid flooding the UI. With no
                    // known total the fraction never moves, so count bytes instead.
                    let moved = if bytes_total == 0 {
                        bytes_done - last_published_bytes >= UNKNOWN_SIZE_PUBLISH_BYTES
                    } else {
                        fraction - last_published >= step
                    };
                    if moved || fraction >= 1.0 || bytes_done == 0 {
                        last_published = fraction;
                        last_published_bytes = bytes_done;
                        self.inner.state.transition(DownloadState::Downloading {
                            model_id: model_id.clone(),
                            progress: fraction,
                            bytes_done,
                            bytes_total,
                        });
                    }
                }
                DownloadEvent::Verifying => {
                    self.inner.state.transition(DownloadState::Verifying {
                        model_id: model_id.clone(),
                    });
                }
            })
            .await;

        let mut active = lock(&self.inner.active_download);
        match result {
            Ok(size) => {
                log::info!(
                    "[ModelManager] Download of '{}' completed ({} bytes)",
                    model_id,
                    size
                );
                self.inner.state.transition(DownloadState::Completed {
                    model_id: model_id.clone(),
                    path: target,
                });
            }
            Err(e) => {
                log::error!("[ModelManager] Download of '{}' failed: {}", model_id, e);
                self.inner.state.transition(DownloadState::error(&model_id, &e));
            }
        }
        *active = None;
    }

    /// Ask the running download to stop. Returns false if nothing was running.
    pub fn cancel_download(&self) -> bool {
        match lock(&self.inner.active_download).as_ref() {
            Some(active) => {
                log::info!("[ModelManager] Cancelling download of '{}'", active.model_id);
                active.cancel.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Wait until no download is running and return the final state.
    pub async fn wait_for_idle(&self) -> DownloadState {
        let mut rx = self.subscribe();
        loop {
            // Clone before locking: the watch guard must not be held across it
            let state = rx.borrow_and_update().clone();
            if !state.is_active() && !self.is_downloading() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Remove `model_id` from every backend that holds it.
    ///
    /// Returns whether any file was deleted.
    pub fn delete_model(&self, model_id: &str) -> Result<bool> {
        let active = lock(&self.inner.active_download);
        if let Some(current) = active.as_ref() {
            if current.model_id == model_id {
                return Err(ModelError::DownloadInProgress(model_id.to_string()));
            }
        }

        let paths = self.with_backends(|backends| self.inner.locator.locate_all(model_id, backends))?;
        let deleted = remove_copies(model_id, &paths)?;

        // Leftovers from a crashed attempt
        let file_name = &self.inner.catalog.lookup(model_id)?.file_name;
        let dirs: Vec<PathBuf> = self.with_backends(|backends| {
            backends
                .iter()
                .filter_map(|b| b.resolve_directory().ok())
                .collect()
        });
        for dir in dirs {
            let part = partial_path_for(&dir.join(file_name));
            if !part.exists() {
                continue;
            }
            match std::fs::remove_file(&part) {
                Ok(()) => log::info!("[ModelManager] Removed stale partial file {:?}", part),
                Err(e) => log::warn!(
                    "[ModelManager] Failed to remove stale partial file {:?}: {}",
                    part,
                    e
                ),
            }
        }

        drop(active);
        Ok(deleted)
    }

    /// Switch where new downloads go. Existing files are left in place.
    ///
    /// Rejected while a download is running so its target cannot change
    /// mid-stream.
    pub fn set_active_backend(&self, backend: StorageBackendRef) -> Result<()> {
        let active = lock(&self.inner.active_download);
        if let Some(current) = active.as_ref() {
            return Err(ModelError::DownloadInProgress(current.model_id.clone()));
        }

        let mut settings = StorageSettings::load(self.inner.store.as_ref());
        settings.model_storage_uri = backend.token().map(|t| t.to_string());
        settings.save(self.inner.store.as_ref())?;

        match self.inner.active_backend.write() {
            Ok(mut current) => *current = backend.clone(),
            Err(poisoned) => *poisoned.into_inner() = backend.clone(),
        }
        log::info!("[ModelManager] Active storage backend set to {:?}", backend);
        drop(active);
        Ok(())
    }

    /// Record that the user granted access to `token` (desktop only; on
    /// platforms with their own grant store this is an error).
    pub fn grant_storage_access(&self, token: &str) -> Result<()> {
        let grants = self.inner.own_grants.as_ref().ok_or_else(|| {
            ModelError::Settings("storage access grants are managed by the platform".to_string())
        })?;
        grants.grant(token);
        self.persist_grants(grants)
    }

    pub fn revoke_storage_access(&self, token: &str) -> Result<bool> {
        let grants = self.inner.own_grants.as_ref().ok_or_else(|| {
            ModelError::Settings("storage access grants are managed by the platform".to_string())
        })?;
        let removed = grants.revoke(token);
        self.persist_grants(grants)?;
        Ok(removed)
    }

    fn persist_grants(&self, grants: &PersistedGrants) -> Result<()> {
        let store = self.inner.store.as_ref();
        store.set(
            KEY_GRANTED_STORAGE_URIS,
            Value::Array(grants.tokens().into_iter().map(Value::String).collect()),
        );
        store.save()
    }

    pub fn model_statuses(&self) -> Vec<ModelStatus> {
        self.inner
            .catalog
            .descriptors()
            .into_iter()
            .map(|d| {
                let path = self.path_for(&d.id);
                ModelStatus {
                    id: d.id.clone(),
                    display_name: d.display_name.clone(),
                    file_name: d.file_name.clone(),
                    size: d.expected_size_bytes,
                    downloaded: path.is_some(),
                    path,
                }
            })
            .collect()
    }

    pub fn downloaded_model_ids(&self) -> Vec<String> {
        self.model_statuses()
            .into_iter()
            .filter(|s| s.downloaded)
            .map(|s| s.id)
            .collect()
    }

    /// Smallest downloaded model, for auto-selection on first launch.
    pub fn first_downloaded_model(&self) -> Option<String> {
        self.downloaded_model_ids().into_iter().next()
    }
}

/// Remove every located copy, carrying on past failures.
///
/// `Ok(true)` if at least one copy went away. An error only when copies
/// existed and none of them could be removed.
fn remove_copies(model_id: &str, paths: &[PathBuf]) -> Result<bool> {
    let mut deleted = false;
    let mut last_error = None;
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => {
                log::info!("[ModelManager] Deleted model '{}' at {:?}", model_id, path);
                deleted = true;
            }
            Err(e) => {
                log::warn!(
                    "[ModelManager] Failed to delete model '{}' at {:?}: {}",
                    model_id,
                    path,
                    e
                );
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) if !deleted => Err(e.into()),
        _ => Ok(deleted),
    }
}
