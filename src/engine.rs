//! Seam to the native speech engine.
//!
//! The engine itself (whisper.cpp behind JNI on Android, linked directly on
//! Windows) is not part of this crate. This module only turns a located
//! model file into a loaded handle and guarantees the handle is released.

use std::path::{Path, PathBuf};

use crate::error::{ModelError, Result};
use crate::models::manager::ModelManager;

/// The engine expects mono f32 PCM at this rate.
pub const SAMPLE_RATE_HZ: u32 = 16_000;

/// Opaque engine context. Zero is never a valid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(pub u64);

#[cfg_attr(test, mockall::automock)]
pub trait TranscriptionEngine: Send + Sync {
    /// Load a model file; `None` when the engine rejects it.
    fn init(&self, model_path: &Path) -> Option<EngineHandle>;

    /// Transcribe 16 kHz mono samples. Empty string on engine failure.
    fn transcribe(&self, handle: EngineHandle, samples: &[f32], threads: u32) -> String;

    fn is_loaded(&self, handle: EngineHandle) -> bool;

    fn release(&self, handle: EngineHandle);

    fn system_info(&self) -> String;
}

/// A model loaded into the engine; released on drop.
pub struct LoadedModel<'e> {
    engine: &'e dyn TranscriptionEngine,
    handle: EngineHandle,
    model_id: String,
    path: PathBuf,
    threads: u32,
}

impl<'e> LoadedModel<'e> {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.is_loaded(self.handle)
    }

    pub fn set_threads(&mut self, threads: u32) {
        self.threads = threads.max(1);
    }

    pub fn transcribe(&self, samples: &[f32]) -> String {
        if samples.is_empty() {
            return String::new();
        }
        log::debug!(
            "[engine] Transcribing {} samples ({:.2}s) with {} threads",
            samples.len(),
            samples.len() as f64 / SAMPLE_RATE_HZ as f64,
            self.threads
        );
        self.engine
            .transcribe(self.handle, samples, self.threads)
            .trim_start()
            .to_string()
    }
}

impl Drop for LoadedModel<'_> {
    fn drop(&mut self) {
        self.engine.release(self.handle);
        log::info!("[engine] Released model '{}'", self.model_id);
    }
}

/// Locate `model_id` through the manager and load it into `engine`.
pub fn load_model<'e>(
    manager: &ModelManager,
    engine: &'e dyn TranscriptionEngine,
    model_id: &str,
) -> Result<LoadedModel<'e>> {
    manager.catalog().lookup(model_id)?;
    let path = manager
        .path_for(model_id)
        .ok_or_else(|| ModelError::Engine(format!("Model '{}' is not downloaded", model_id)))?;

    log::info!("[engine] Loading model '{}' from {:?}", model_id, path);
    let handle = engine
        .init(&path)
        .filter(|h| h.0 != 0)
        .ok_or_else(|| ModelError::Engine(format!("Failed to load model from {:?}", path)))?;

    Ok(LoadedModel {
        engine,
        handle,
        model_id: model_id.to_string(),
        path,
        threads: default_threads(),
    })
}

fn default_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4) as u32)
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::models::catalog::{ModelCatalog, ModelDescriptor};
    use mockall::predicate::eq;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ModelManager {
        let catalog = ModelCatalog::from_descriptors([ModelDescriptor {
            id: "tiny".to_string(),
            file_name: "tiny.bin".to_string(),
            display_name: "Tiny".to_string(),
            expected_size_bytes: 4,
            integrity_token: String::new(),
            source_url: "http://127.0.0.1:1/tiny.bin".to_string(),
        }]);
        ModelManager::builder(ManagerConfig::new(dir.path()))
            .catalog(catalog)
            .build()
            .unwrap()
    }

    #[test]
    fn test_load_transcribe_release() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let models = dir.path().join("models");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(models.join("tiny.bin"), b"ggml").unwrap();

        let mut engine = MockTranscriptionEngine::new();
        engine
            .expect_init()
            .withf(|p| p.ends_with("models/tiny.bin"))
            .times(1)
            .returning(|_| Some(EngineHandle(7)));
        engine
            .expect_transcribe()
            .withf(|h, samples, _| *h == EngineHandle(7) && samples.len() == 3)
            .returning(|_, _, _| "  hello world".to_string());
        engine
            .expect_release()
            .with(eq(EngineHandle(7)))
            .times(1)
            .return_const(());

        let model = load_model(&manager, &engine, "tiny").unwrap();
        assert_eq!(model.model_id(), "tiny");
        assert_eq!(model.transcribe(&[0.0, 0.1, 0.2]), "hello world");
        assert_eq!(model.transcribe(&[]), "");
        drop(model);
    }

    #[test]
    fn test_missing_model_is_not_loaded() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let mut engine = MockTranscriptionEngine::new();
        engine.expect_init().never();

        assert!(matches!(
            load_model(&manager, &engine, "tiny"),
            Err(ModelError::Engine(_))
        ));
        assert!(matches!(
            load_model(&manager, &engine, "large"),
            Err(ModelError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_engine_init_failure() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let models = dir.path().join("models");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(models.join("tiny.bin"), b"junk").unwrap();

        let mut engine = MockTranscriptionEngine::new();
        engine.expect_init().returning(|_| Some(EngineHandle(0)));
        engine.expect_release().never();

        let err = load_model(&manager, &engine, "tiny").err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Engine);
    }
}
