//! Default and custom storage working together through `ModelManager`.

use serial_test::serial;
use std::sync::Arc;
use tempfile::TempDir;

use super::test_server::{descriptor, manager_with, payload, write_model, Serve, TestServer};
use crate::config::ManagerConfig;
use crate::error::{ErrorKind, ModelError, UserAction};
use crate::models::catalog::ModelCatalog;
use crate::models::manager::ModelManager;
use crate::models::state::DownloadState;
use crate::models::storage::{PersistedGrants, StorageBackendRef};
use crate::settings::{JsonFileStore, MemoryStore, SettingsStore, KEY_MODEL_STORAGE_URI};

struct Fixture {
    app_dir: TempDir,
    custom_dir: TempDir,
    grants: Arc<PersistedGrants>,
    store: Arc<MemoryStore>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            app_dir: TempDir::new().unwrap(),
            custom_dir: TempDir::new().unwrap(),
            grants: Arc::new(PersistedGrants::new()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    fn token(&self) -> String {
        self.custom_dir.path().to_string_lossy().into_owned()
    }

    fn custom_ref(&self) -> StorageBackendRef {
        StorageBackendRef::Custom(self.token())
    }

    fn manager(&self, source_url: String) -> ModelManager {
        manager_with(
            self.app_dir.path(),
            ModelCatalog::from_descriptors([descriptor("tiny", 1000, source_url)]),
            self.store.clone(),
            self.grants.clone(),
        )
    }

    fn default_models(&self) -> std::path::PathBuf {
        self.app_dir.path().join("models")
    }

    fn custom_models(&self) -> std::path::PathBuf {
        self.custom_dir.path().join("models")
    }
}

fn offline_url() -> String {
    "http://127.0.0.1:1/tiny.bin".to_string()
}

#[test]
fn test_switching_backend_keeps_default_files_locatable() {
    let fx = Fixture::new();
    let manager = fx.manager(offline_url());
    write_model(&fx.default_models(), "tiny.bin", 1000);

    assert_eq!(
        manager.download_path_for("tiny").unwrap(),
        fx.default_models().join("tiny.bin")
    );

    fx.grants.grant(&fx.token());
    manager.set_active_backend(fx.custom_ref()).unwrap();

    assert!(manager.is_downloaded("tiny"));
    assert_eq!(
        manager.path_for("tiny"),
        Some(fx.default_models().join("tiny.bin"))
    );
    assert_eq!(
        manager.download_path_for("tiny").unwrap(),
        fx.custom_models().join("tiny.bin")
    );
}

#[test]
fn test_custom_only_copy_is_not_located_after_reverting_to_default() {
    let fx = Fixture::new();
    fx.grants.grant(&fx.token());
    let manager = fx.manager(offline_url());
    manager.set_active_backend(fx.custom_ref()).unwrap();
    write_model(&fx.custom_models(), "tiny.bin", 1000);
    assert!(manager.is_downloaded("tiny"));

    // Only default and the active custom folder are scanned
    manager
        .set_active_backend(StorageBackendRef::Default)
        .unwrap();
    assert!(!manager.is_downloaded("tiny"));
    assert_eq!(manager.path_for("tiny"), None);
    assert!(!manager.delete_model("tiny").unwrap());
    assert!(fx.custom_models().join("tiny.bin").exists());

    // The file was left alone and is found again once reselected
    manager.set_active_backend(fx.custom_ref()).unwrap();
    assert_eq!(
        manager.path_for("tiny"),
        Some(fx.custom_models().join("tiny.bin"))
    );
}

#[test]
fn test_default_copy_wins_over_custom_copy() {
    let fx = Fixture::new();
    fx.grants.grant(&fx.token());
    let manager = fx.manager(offline_url());
    manager.set_active_backend(fx.custom_ref()).unwrap();

    write_model(&fx.custom_models(), "tiny.bin", 1000);
    assert_eq!(
        manager.path_for("tiny"),
        Some(fx.custom_models().join("tiny.bin"))
    );

    write_model(&fx.default_models(), "tiny.bin", 1000);
    assert_eq!(
        manager.path_for("tiny"),
        Some(fx.default_models().join("tiny.bin"))
    );

    // Both copies go
    assert!(manager.delete_model("tiny").unwrap());
    assert!(!fx.default_models().join("tiny.bin").exists());
    assert!(!fx.custom_models().join("tiny.bin").exists());
    assert!(!manager.is_downloaded("tiny"));
}

#[tokio::test]
async fn test_revoked_grant_fails_without_fallback() {
    let server = TestServer::with_file("tiny.bin", Serve::Full(payload(1000))).await;
    let fx = Fixture::new();
    fx.grants.grant(&fx.token());
    let manager = fx.manager(server.url_for("tiny.bin"));
    manager.set_active_backend(fx.custom_ref()).unwrap();
    write_model(&fx.default_models(), "tiny.bin", 1000);

    fx.grants.revoke(&fx.token());

    // Lookups still see the default copy
    assert_eq!(
        manager.path_for("tiny"),
        Some(fx.default_models().join("tiny.bin"))
    );

    let err = manager.download_path_for("tiny").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
    assert_eq!(err.kind().suggested_action(), UserAction::ReconfigureStorage);

    std::fs::remove_file(fx.default_models().join("tiny.bin")).unwrap();
    assert!(matches!(
        manager.start_download("tiny"),
        Err(ModelError::StorageUnavailable(_))
    ));
    assert!(matches!(
        manager.state(),
        DownloadState::Error {
            kind: ErrorKind::StorageUnavailable,
            ..
        }
    ));
    assert!(!manager.is_downloading());
    assert!(!fx.default_models().join("tiny.bin").exists());
    assert!(!fx.custom_models().join("tiny.bin").exists());
}

#[test]
fn test_removed_custom_folder_is_unavailable() {
    let fx = Fixture::new();
    let token = fx.custom_dir.path().join("gone").to_string_lossy().into_owned();
    fx.grants.grant(&token);
    let manager = fx.manager(offline_url());
    manager
        .set_active_backend(StorageBackendRef::Custom(token))
        .unwrap();

    assert_eq!(
        manager.download_path_for("tiny").unwrap_err().kind(),
        ErrorKind::StorageUnavailable
    );
    assert!(!manager.is_downloaded("tiny"));
}

#[tokio::test]
async fn test_download_lands_in_custom_backend() {
    let server = TestServer::with_file("tiny.bin", Serve::Full(payload(1000))).await;
    let fx = Fixture::new();
    fx.grants.grant(&fx.token());
    let manager = fx.manager(server.url_for("tiny.bin"));
    manager.set_active_backend(fx.custom_ref()).unwrap();

    manager.start_download("tiny").unwrap();
    let target = fx.custom_models().join("tiny.bin");
    assert_eq!(
        manager.wait_for_idle().await,
        DownloadState::Completed {
            model_id: "tiny".to_string(),
            path: target.clone(),
        }
    );
    assert_eq!(std::fs::metadata(&target).unwrap().len(), 1000);
    assert!(!fx.default_models().join("tiny.bin").exists());
    assert_eq!(manager.path_for("tiny"), Some(target));
}

#[tokio::test]
async fn test_backend_switch_rejected_while_downloading() {
    let server = TestServer::with_file(
        "tiny.bin",
        Serve::Slow {
            data: payload(1000),
            chunk: 10,
            delay: std::time::Duration::from_millis(20),
        },
    )
    .await;
    let fx = Fixture::new();
    fx.grants.grant(&fx.token());
    let manager = fx.manager(server.url_for("tiny.bin"));

    manager.start_download("tiny").unwrap();
    assert!(matches!(
        manager.set_active_backend(fx.custom_ref()),
        Err(ModelError::DownloadInProgress(_))
    ));
    assert_eq!(manager.active_backend(), StorageBackendRef::Default);

    manager.cancel_download();
    manager.wait_for_idle().await;
    manager.set_active_backend(fx.custom_ref()).unwrap();
}

#[test]
fn test_backend_choice_is_persisted() {
    let fx = Fixture::new();
    fx.grants.grant(&fx.token());
    let manager = fx.manager(offline_url());
    manager.set_active_backend(fx.custom_ref()).unwrap();

    assert_eq!(
        fx.store.get(KEY_MODEL_STORAGE_URI),
        Some(serde_json::Value::String(fx.token()))
    );
    let reopened = fx.manager(offline_url());
    assert_eq!(reopened.active_backend(), fx.custom_ref());

    reopened
        .set_active_backend(StorageBackendRef::Default)
        .unwrap();
    assert_eq!(fx.store.get(KEY_MODEL_STORAGE_URI), None);
}

#[test]
#[serial]
fn test_desktop_grants_survive_restart() {
    let app_dir = TempDir::new().unwrap();
    let custom_dir = TempDir::new().unwrap();
    let token = custom_dir.path().to_string_lossy().into_owned();
    let settings_path = app_dir.path().join("settings.json");

    let open = || {
        let store: Arc<dyn SettingsStore> = Arc::new(JsonFileStore::open(&settings_path).unwrap());
        ModelManager::builder(ManagerConfig::from_env(app_dir.path()))
            .catalog(ModelCatalog::from_descriptors([descriptor(
                "tiny",
                1000,
                offline_url(),
            )]))
            .settings_store(store)
            .path_translator(Arc::new(crate::models::storage::DirectPathTranslator))
            .build()
            .unwrap()
    };

    let manager = open();
    manager.grant_storage_access(&token).unwrap();
    manager
        .set_active_backend(StorageBackendRef::Custom(token.clone()))
        .unwrap();
    drop(manager);

    let manager = open();
    assert_eq!(
        manager.download_path_for("tiny").unwrap(),
        custom_dir.path().join("models").join("tiny.bin")
    );

    assert!(manager.revoke_storage_access(&token).unwrap());
    drop(manager);

    let manager = open();
    assert_eq!(
        manager.download_path_for("tiny").unwrap_err().kind(),
        ErrorKind::StorageUnavailable
    );
}
