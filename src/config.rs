use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";
pub const DEFAULT_MODELS_SUBDIR: &str = "models";

const ENV_BASE_URL: &str = "VOXKEY_MODEL_BASE_URL";
const ENV_MODELS_SUBDIR: &str = "VOXKEY_MODELS_SUBDIR";
const ENV_CONNECT_TIMEOUT: &str = "VOXKEY_CONNECT_TIMEOUT_SECS";
const ENV_READ_TIMEOUT: &str = "VOXKEY_READ_TIMEOUT_SECS";

/// Configuration for [`crate::models::manager::ModelManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// App-private data directory; the default backend lives under it.
    pub app_data_dir: PathBuf,
    /// Subdirectory holding model files in every backend.
    pub models_subdir: String,
    /// Remote source; catalog URLs are `<base_url>/<file_name>`.
    pub base_url: String,
    pub connect_timeout: Duration,
    /// Per-read timeout on the streaming connection. There is no overall
    /// download timeout.
    pub read_timeout: Duration,
    /// Minimum progress delta between published `Downloading` states.
    pub progress_step: f64,
}

impl ManagerConfig {
    pub fn new(app_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_data_dir: app_data_dir.into(),
            models_subdir: DEFAULT_MODELS_SUBDIR.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            progress_step: 0.01, // 1%
        }
    }

    /// Like [`ManagerConfig::new`], with overrides from the environment.
    ///
    /// A `.env` file is loaded first if present (development convenience).
    pub fn from_env(app_data_dir: &Path) -> Self {
        match dotenv::dotenv() {
            Ok(path) => log::info!("[config] Loaded .env file from: {:?}", path),
            Err(e) => log::debug!("[config] No .env file loaded: {}", e),
        }

        let mut config = Self::new(app_data_dir);

        if let Ok(url) = std::env::var(ENV_BASE_URL) {
            if !url.trim().is_empty() {
                config.base_url = url.trim().trim_end_matches('/').to_string();
            }
        }
        if let Ok(subdir) = std::env::var(ENV_MODELS_SUBDIR) {
            let subdir = subdir.trim();
            if is_plain_dir_name(subdir) {
                config.models_subdir = subdir.to_string();
            } else {
                log::warn!(
                    "[config] Ignoring {}='{}': must be a single directory name",
                    ENV_MODELS_SUBDIR,
                    subdir
                );
            }
        }
        if let Some(secs) = env_secs(ENV_CONNECT_TIMEOUT) {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs(ENV_READ_TIMEOUT) {
            config.read_timeout = Duration::from_secs(secs);
        }

        config
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

fn env_secs(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(secs),
        _ => {
            log::warn!("[config] Ignoring {}='{}': expected positive seconds", key, raw);
            None
        }
    }
}

fn is_plain_dir_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}
