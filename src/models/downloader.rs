use futures_util::StreamExt;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::catalog::ModelDescriptor;
use crate::error::{ModelError, Result};

const CHECKSUM_BUFFER_SIZE: usize = 8192; // 8KB

/// Events reported while a download runs. Progress fires at least once per
/// received chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DownloadEvent {
    Progress {
        fraction: f64,
        bytes_done: u64,
        bytes_total: u64,
    },
    Verifying,
}

/// How a descriptor's integrity token is checked after the size check.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Checksum {
    Sha1(String),
    Sha256(String),
    Advisory,
    Missing,
}

impl Checksum {
    fn parse(token: &str) -> Self {
        let token = token.trim();
        let is_hex = !token.is_empty() && token.chars().all(|c| c.is_ascii_hexdigit());
        match (token.len(), is_hex) {
            (0, _) => Checksum::Missing,
            (40, true) => Checksum::Sha1(token.to_ascii_lowercase()),
            (64, true) => Checksum::Sha256(token.to_ascii_lowercase()),
            _ => Checksum::Advisory,
        }
    }
}

/// Removes a partially written file unless the download is committed.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::info!("[download_model] Removed partial file {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::error!(
                "[download_model] Failed to remove partial file {:?}: {}",
                self.path,
                e
            ),
        }
    }
}

/// Path used while bytes are still arriving, next to the final target.
pub fn partial_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

/// Streams model files from their source URL onto disk.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(concat!("voxkey/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ModelError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Download `descriptor` to `target`, returning the verified size.
    ///
    /// Bytes land in `<target>.part` and are renamed into place only after
    /// verification passes. On any failure or cancellation the partial file
    /// is removed before the error is returned.
    pub async fn download(
        &self,
        descriptor: &ModelDescriptor,
        target: &Path,
        cancel: &AtomicBool,
        mut on_event: impl FnMut(DownloadEvent),
    ) -> Result<u64> {
        log::info!("Downloading model {}", descriptor.id);
        log::debug!("Model URL: {}", descriptor.source_url);
        log::debug!("Catalog size: {} bytes", descriptor.expected_size_bytes);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ModelError::StorageUnavailable(format!(
                    "Failed to create models directory {:?}: {}",
                    parent, e
                ))
            })?;
        }

        if cancel.load(Ordering::Relaxed) {
            return Err(ModelError::Cancelled);
        }

        let response = self
            .client
            .get(&descriptor.source_url)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ModelError::Network(format!(
                "HTTP {} from {}",
                response.status(),
                descriptor.source_url
            )));
        }

        let reported_size = response.content_length().filter(|len| *len > 0);
        let total_size = reported_size.unwrap_or(descriptor.expected_size_bytes);
        // Never accept more than either side claims
        let size_cap = total_size.max(descriptor.expected_size_bytes);

        let part_path = partial_path_for(target);
        log::info!("[download_model] Output path: {:?}", target);

        let mut guard = PartialFile::new(part_path.clone());
        let mut file = fs::File::create(&part_path)
            .await
            .map_err(|e| ModelError::Download(format!("Failed to create {:?}: {}", part_path, e)))?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        on_event(progress_event(0, total_size));

        while let Some(chunk) = stream.next().await {
            if cancel.load(Ordering::Relaxed) {
                log::info!("Download cancelled by user for model: {}", descriptor.id);
                return Err(ModelError::Cancelled);
            }

            let chunk = chunk.map_err(|e| ModelError::Download(e.to_string()))?;

            if size_cap > 0 && downloaded + chunk.len() as u64 > size_cap {
                return Err(ModelError::Verification(format!(
                    "download exceeded expected size: got at least {} bytes, expected {}",
                    downloaded + chunk.len() as u64,
                    size_cap
                )));
            }

            file.write_all(&chunk)
                .await
                .map_err(|e| ModelError::Download(format!("Failed to write model file: {}", e)))?;

            downloaded += chunk.len() as u64;
            on_event(progress_event(downloaded, total_size));
        }

        // A cancel that lands after the last chunk still wins
        if cancel.load(Ordering::Relaxed) {
            return Err(ModelError::Cancelled);
        }

        file.flush()
            .await
            .map_err(|e| ModelError::Download(e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| ModelError::Download(format!("Failed to sync file to disk: {}", e)))?;
        drop(file);

        on_event(DownloadEvent::Verifying);

        let actual_size = fs::metadata(&part_path)
            .await
            .map_err(|e| ModelError::Download(e.to_string()))?
            .len();
        verify_size(descriptor, reported_size, actual_size)?;
        verify_checksum(descriptor, &part_path, cancel).await?;

        if cancel.load(Ordering::Relaxed) {
            return Err(ModelError::Cancelled);
        }

        fs::rename(&part_path, target)
            .await
            .map_err(|e| ModelError::Download(format!("Failed to move model into place: {}", e)))?;
        guard.disarm();

        // Also sync the parent directory so the new entry is durable
        if let Some(parent) = target.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        log::info!(
            "[download_model] Model '{}' saved to {:?} ({} bytes)",
            descriptor.id,
            target,
            actual_size
        );
        Ok(actual_size)
    }
}

fn progress_event(bytes_done: u64, bytes_total: u64) -> DownloadEvent {
    let fraction = if bytes_total > 0 {
        (bytes_done as f64 / bytes_total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    DownloadEvent::Progress {
        fraction,
        bytes_done,
        bytes_total,
    }
}

/// The file must match what the server announced and what the catalog
/// declares. Either one missing is skipped; both missing is accepted.
fn verify_size(descriptor: &ModelDescriptor, reported: Option<u64>, actual: u64) -> Result<()> {
    if actual == 0 {
        return Err(ModelError::Verification(
            "size mismatch: downloaded file is empty".to_string(),
        ));
    }
    if let Some(expected) = reported {
        if actual != expected {
            return Err(ModelError::Verification(format!(
                "size mismatch: expected {}, got {}",
                expected, actual
            )));
        }
    }
    let catalog_size = descriptor.expected_size_bytes;
    if catalog_size > 0 && actual != catalog_size {
        return Err(ModelError::Verification(format!(
            "size mismatch: expected {}, got {}",
            catalog_size, actual
        )));
    }
    Ok(())
}

async fn verify_checksum(descriptor: &ModelDescriptor, path: &Path, cancel: &AtomicBool) -> Result<()> {
    let (expected, calculated) = match Checksum::parse(&descriptor.integrity_token) {
        Checksum::Sha1(expected) => {
            log::info!("Verifying SHA1 checksum for {}...", descriptor.id);
            (expected, digest_file::<Sha1>(path, cancel).await?)
        }
        Checksum::Sha256(expected) => {
            log::info!("Verifying SHA256 checksum for {}...", descriptor.id);
            (expected, digest_file::<Sha256>(path, cancel).await?)
        }
        Checksum::Advisory => {
            log::warn!(
                "Integrity token for {} is not a SHA1/SHA256 digest. Skipping checksum verification.",
                descriptor.id
            );
            return Ok(());
        }
        Checksum::Missing => {
            log::warn!(
                "No checksum available for {}. Only the file size was verified.",
                descriptor.id
            );
            return Ok(());
        }
    };

    if calculated != expected {
        return Err(ModelError::Verification(format!(
            "checksum mismatch: expected {}, calculated {}",
            expected, calculated
        )));
    }

    log::info!("Checksum verified successfully for {}", descriptor.id);
    Ok(())
}

async fn digest_file<D: Digest>(path: &Path, cancel: &AtomicBool) -> Result<String> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|e| ModelError::Download(format!("Failed to open file for checksum: {}", e)))?;

    let mut hasher = D::new();
    let mut buffer = vec![0; CHECKSUM_BUFFER_SIZE];

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(ModelError::Cancelled);
        }
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|e| ModelError::Download(format!("Failed to read file for checksum: {}", e)))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
