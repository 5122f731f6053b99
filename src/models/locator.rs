use std::path::PathBuf;
use std::sync::Arc;

use super::catalog::ModelCatalog;
use super::storage::StorageBackend;
use crate::error::Result;

/// Finds already-downloaded models by scanning backends in priority order.
///
/// Only existence and non-zero length are checked here; this runs on every UI
/// refresh and every engine load, so no hashing or size comparison happens.
#[derive(Clone)]
pub struct ModelLocator {
    catalog: Arc<ModelCatalog>,
}

impl ModelLocator {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self { catalog }
    }

    /// First backend holding a non-empty copy of `model_id` wins.
    ///
    /// Backends that are currently unavailable are skipped, not reported.
    pub fn locate(
        &self,
        model_id: &str,
        backends: &[&dyn StorageBackend],
    ) -> Result<Option<PathBuf>> {
        let file_name = &self.catalog.lookup(model_id)?.file_name;
        Ok(backends
            .iter()
            .find_map(|backend| Self::probe(*backend, file_name)))
    }

    /// Every backend copy of `model_id`, in priority order.
    pub fn locate_all(
        &self,
        model_id: &str,
        backends: &[&dyn StorageBackend],
    ) -> Result<Vec<PathBuf>> {
        let file_name = &self.catalog.lookup(model_id)?.file_name;
        let mut found: Vec<PathBuf> = Vec::new();
        for backend in backends {
            if let Some(path) = Self::probe(*backend, file_name) {
                // Default and custom may resolve to the same folder
                if !found.contains(&path) {
                    found.push(path);
                }
            }
        }
        Ok(found)
    }

    fn probe(backend: &dyn StorageBackend, file_name: &str) -> Option<PathBuf> {
        let dir = match backend.resolve_directory() {
            Ok(dir) => dir,
            Err(e) => {
                log::debug!("[ModelLocator] Skipping {}: {}", backend.label(), e);
                return None;
            }
        };

        let path = dir.join(file_name);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path),
            Ok(meta) if meta.is_file() => {
                log::warn!(
                    "[ModelLocator] Ignoring empty file {:?} (interrupted download?)",
                    path
                );
                None
            }
            _ => None,
        }
    }
}
