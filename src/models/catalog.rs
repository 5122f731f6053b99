use serde::Serialize;
use std::collections::HashMap;

use crate::error::{ModelError, Result};

/// Immutable metadata for one downloadable model variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub file_name: String,
    pub display_name: String,
    pub expected_size_bytes: u64,
    /// SHA-1 (40 hex) or SHA-256 (64 hex) digest; anything else is advisory.
    pub integrity_token: String,
    pub source_url: String,
}

struct BuiltinModel {
    id: &'static str,
    display_name: &'static str,
    size: u64,
    sha1: &'static str,
}

// Sizes and SHA1 checksums match the ggml files published by whisper.cpp
// (models/download-ggml-model.sh). Files are named `ggml-<id>.bin`.
const BUILTIN_MODELS: &[BuiltinModel] = &[
    BuiltinModel {
        id: "tiny",
        display_name: "Tiny",
        size: 77_691_713,
        sha1: "bd577a113a864445d4c299885e0cb97d4ba92b5f",
    },
    BuiltinModel {
        id: "tiny.en",
        display_name: "Tiny (English)",
        size: 77_704_715,
        sha1: "c78c86eb1a8faa21b369bcd33207cc90d64ae9df",
    },
    BuiltinModel {
        id: "base",
        display_name: "Base",
        size: 147_951_465,
        sha1: "465707469ff3a37a2b9b8d8f89f2f99de7299dac",
    },
    BuiltinModel {
        id: "base.en",
        display_name: "Base (English)",
        size: 147_964_211,
        sha1: "137c40403d78fd54d454da0f9bd998f78703390c",
    },
    BuiltinModel {
        id: "small",
        display_name: "Small",
        size: 487_601_967,
        sha1: "55356645c2b361a969dfd0ef2c5a50d530afd8d5",
    },
    BuiltinModel {
        id: "small.en",
        display_name: "Small (English)",
        size: 487_614_201,
        sha1: "db8a495a91d927739e50b3fc1cc4c6b8f6c2d022",
    },
];

/// Static registry of known model variants.
///
/// The catalog is the only authority on file names and expected sizes; no
/// other component infers them from files on disk.
#[derive(Clone, Debug)]
pub struct ModelCatalog {
    models: HashMap<String, ModelDescriptor>,
}

impl ModelCatalog {
    /// Build the whisper.cpp ggml catalog, resolving URLs against `base_url`.
    pub fn whisper_ggml(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let descriptors = BUILTIN_MODELS.iter().map(|m| {
            let file_name = format!("ggml-{}.bin", m.id);
            ModelDescriptor {
                id: m.id.to_string(),
                display_name: m.display_name.to_string(),
                expected_size_bytes: m.size,
                integrity_token: m.sha1.to_string(),
                source_url: format!("{}/{}", base, file_name),
                file_name,
            }
        });
        Self::from_descriptors(descriptors)
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let models = descriptors
            .into_iter()
            .filter(|d| {
                let ok = is_valid_model_id(&d.id) && is_valid_file_name(&d.file_name);
                if !ok {
                    log::warn!(
                        "[ModelCatalog] Skipping descriptor with unsafe id/file name: {} / {}",
                        d.id,
                        d.file_name
                    );
                }
                ok
            })
            .map(|d| (d.id.clone(), d))
            .collect();
        Self { models }
    }

    pub fn lookup(&self, id: &str) -> Result<&ModelDescriptor> {
        if !is_valid_model_id(id) {
            return Err(ModelError::UnknownModel(id.to_string()));
        }
        self.models
            .get(id)
            .ok_or_else(|| ModelError::UnknownModel(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    /// All descriptors ordered by size (smallest to largest), then id.
    pub fn descriptors(&self) -> Vec<&ModelDescriptor> {
        let mut all: Vec<&ModelDescriptor> = self.models.values().collect();
        all.sort_by(|a, b| {
            a.expected_size_bytes
                .cmp(&b.expected_size_bytes)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Reject anything that could escape the models directory.
pub fn is_valid_model_id(id: &str) -> bool {
    !id.is_empty()
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn is_valid_file_name(name: &str) -> bool {
    is_valid_model_id(name) && !name.ends_with(".part")
}
