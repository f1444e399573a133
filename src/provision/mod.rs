//! Server binary provisioning
//!
//! Guarantees a runnable server binary exists locally for a
//! `(backend, platform)` pair, downloading and caching release archives on
//! first use. Cache layout is one directory per pair under the configured
//! root, holding the binary, its bundled shared libraries, and a
//! [`VersionMarker`] file:
//!
//! ```text
//! {cache_root}/
//!   cuda12-linux-x64/
//!     llama-server
//!     libggml.so
//!     version.json
//!   cpu-linux-x64/
//!     ...
//! ```
//!
//! Installs are staged in a temp directory on the same filesystem and
//! renamed into place, so a crash mid-download never corrupts a
//! previously-good entry. Update checks run only when explicitly invoked.

mod archive;
mod progress;

pub use progress::{ProgressObserver, ProgressPhase, TracingObserver};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::ProvisionSettings;
use crate::constants::release;
use crate::error::{Error, Result};
use crate::hardware::OsFamily;

/// Contents of the `version.json` marker in a cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMarker {
    /// Release tag the entry was installed from
    pub tag: String,
    /// Asset file name the entry was extracted from
    pub asset: String,
    /// Install timestamp
    pub installed_at: chrono::DateTime<chrono::Utc>,
}

/// Result of an explicit update check
#[derive(Debug, Clone)]
pub struct UpdateStatus {
    /// Locally installed release tag, if any
    pub installed: Option<String>,
    /// Latest tag the release source advertises
    pub latest: String,
}

impl UpdateStatus {
    pub fn update_available(&self) -> bool {
        self.installed.as_deref() != Some(self.latest.as_str())
    }
}

/// Acquires and caches server binaries per `(backend, platform)` pair.
pub struct Provisioner {
    settings: ProvisionSettings,
    http: reqwest::Client,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl Provisioner {
    pub fn new(settings: ProvisionSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(release::USER_AGENT)
            .timeout(std::time::Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            settings,
            http,
            observer: None,
        })
    }

    /// Attach an advisory progress observer.
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Cache directory for a `(backend, platform)` pair.
    pub fn entry_dir(&self, backend: Backend, platform: &str) -> PathBuf {
        self.settings.cache_root.join(format!("{backend}-{platform}"))
    }

    /// Read the version marker of an installed entry, if present.
    pub fn installed_version(&self, backend: Backend, platform: &str) -> Option<VersionMarker> {
        let path = self.entry_dir(backend, platform).join(release::VERSION_MARKER);
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Guarantee a runnable binary for `(backend, platform)`.
    ///
    /// Returns the cached binary when one exists; otherwise downloads the
    /// configured (or latest) release and installs it atomically. No update
    /// check happens on this path.
    pub async fn acquire(&self, backend: Backend, platform: &str) -> Result<PathBuf> {
        let binary = self.entry_dir(backend, platform).join(release::SERVER_BINARY);
        if binary.is_file() {
            debug!(backend = %backend, platform = %platform, "binary cache hit");
            return Ok(binary);
        }

        let tag = match &self.settings.release_tag {
            Some(tag) => tag.clone(),
            None => self.latest_tag().await.map_err(|e| Error::Provision {
                backend,
                reason: format!("cannot resolve latest release and no cached binary exists: {e:#}"),
            })?,
        };

        self.install(backend, platform, &tag).await
    }

    /// Compare the installed version against the latest available release.
    ///
    /// Never downloads anything; pair with [`Provisioner::apply_update`].
    pub async fn check_update(&self, backend: Backend, platform: &str) -> Result<UpdateStatus> {
        let latest = self.latest_tag().await.map_err(|e| Error::Provision {
            backend,
            reason: format!("update check failed: {e:#}"),
        })?;
        Ok(UpdateStatus {
            installed: self
                .installed_version(backend, platform)
                .map(|marker| marker.tag),
            latest,
        })
    }

    /// Download the latest release and swap it into the cache entry.
    ///
    /// The previous version stays in place (and loadable) until the new
    /// install is fully staged; the swap itself is a pair of renames.
    pub async fn apply_update(&self, backend: Backend, platform: &str) -> Result<PathBuf> {
        let status = self.check_update(backend, platform).await?;
        if !status.update_available() {
            debug!(backend = %backend, tag = %status.latest, "already on latest release");
            return Ok(self.entry_dir(backend, platform).join(release::SERVER_BINARY));
        }
        info!(
            backend = %backend,
            installed = ?status.installed,
            latest = %status.latest,
            "updating server binary"
        );
        self.install(backend, platform, &status.latest).await
    }

    /// Resolve the latest release tag from the metadata API.
    async fn latest_tag(&self) -> anyhow::Result<String> {
        #[derive(Deserialize)]
        struct Release {
            tag_name: String,
        }

        let url = format!(
            "{}/repos/{}/releases/latest",
            self.settings.api_base_url, self.settings.repo
        );
        let release: Release = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(release.tag_name)
    }

    /// Download, extract, and atomically install one release.
    async fn install(&self, backend: Backend, platform: &str, tag: &str) -> Result<PathBuf> {
        let asset = asset_name(backend, platform, tag)?;
        let cache_root = self.settings.cache_root.clone();
        tokio::fs::create_dir_all(&cache_root).await?;
        sweep_stale(&cache_root);

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&cache_root)
            .map_err(|e| Error::Provision {
                backend,
                reason: format!("cannot create staging directory: {e}"),
            })?;

        let url = format!(
            "{}/{}/releases/download/{}/{}",
            self.settings.download_base_url, self.settings.repo, tag, asset
        );
        info!(backend = %backend, tag = %tag, asset = %asset, "downloading server release");

        let archive_path = staging.path().join(&asset);
        self.download_to(&url, &archive_path, &asset)
            .await
            .map_err(|e| Error::Provision {
                backend,
                reason: format!("{e:#}"),
            })?;

        self.report(&asset, 0, None, ProgressPhase::Extracting);
        let extract_dir = staging.path().join("extract");
        {
            let archive_path = archive_path.clone();
            let extract_dir = extract_dir.clone();
            tokio::task::spawn_blocking(move || archive::extract_zip(&archive_path, &extract_dir))
                .await
                .map_err(|e| Error::Internal(format!("extract task failed: {e}")))?
                .map_err(|e| Error::Provision {
                    backend,
                    reason: format!("{e:#}"),
                })?;
        }

        let binary = archive::find_file(&extract_dir, release::SERVER_BINARY).ok_or_else(|| {
            Error::Provision {
                backend,
                reason: format!("archive {asset} does not contain {}", release::SERVER_BINARY),
            }
        })?;

        // The binary's siblings are its bundled shared libraries; install the
        // whole payload directory.
        let payload_dir = binary
            .parent()
            .ok_or_else(|| Error::Internal("binary has no parent directory".to_string()))?;
        let install_dir = staging.path().join("install");
        std::fs::create_dir_all(&install_dir)?;
        for entry in std::fs::read_dir(payload_dir)?.flatten() {
            let path = entry.path();
            if path.is_file() {
                std::fs::copy(&path, install_dir.join(entry.file_name()))?;
            }
        }

        let marker = VersionMarker {
            tag: tag.to_string(),
            asset: asset.clone(),
            installed_at: chrono::Utc::now(),
        };
        std::fs::write(
            install_dir.join(release::VERSION_MARKER),
            serde_json::to_vec_pretty(&marker)?,
        )?;

        let entry_dir = self.entry_dir(backend, platform);
        if entry_dir.exists() {
            let retired = cache_root.join(format!(".prev-{}", uuid::Uuid::new_v4()));
            std::fs::rename(&entry_dir, &retired)?;
            std::fs::rename(&install_dir, &entry_dir)?;
            if let Err(e) = std::fs::remove_dir_all(&retired) {
                warn!(path = %retired.display(), error = %e, "failed to remove retired binary");
            }
        } else {
            std::fs::rename(&install_dir, &entry_dir)?;
        }

        self.report(&asset, 0, None, ProgressPhase::Complete);
        info!(backend = %backend, tag = %tag, path = %entry_dir.display(), "server binary installed");
        Ok(entry_dir.join(release::SERVER_BINARY))
    }

    /// Stream a release asset to disk, reporting progress per chunk.
    async fn download_to(&self, url: &str, dest: &Path, label: &str) -> anyhow::Result<()> {
        let mut response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("{url}: HTTP {}", response.status());
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut downloaded: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            self.report(label, downloaded, total, ProgressPhase::Downloading);
        }
        file.flush().await?;
        Ok(())
    }

    fn report(&self, file: &str, bytes: u64, total: Option<u64>, phase: ProgressPhase) {
        if let Some(observer) = &self.observer {
            observer.on_progress(file, bytes, total, phase);
        }
    }
}

/// Remove leftover staging/retired directories from interrupted installs.
fn sweep_stale(cache_root: &Path) {
    let Ok(entries) = std::fs::read_dir(cache_root) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(".staging-") || name.starts_with(".prev-") {
            if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                debug!(path = %entry.path().display(), error = %e, "stale dir not removed");
            }
        }
    }
}

/// Release asset file name for a `(backend, platform, tag)` triple.
///
/// Follows the upstream naming scheme: OS tag (`ubuntu`/`macos`/`win`),
/// optional backend tag, architecture, `.zip`.
pub(crate) fn asset_name(backend: Backend, platform: &str, tag: &str) -> Result<String> {
    let (os, arch) = platform
        .split_once('-')
        .ok_or_else(|| Error::Internal(format!("malformed platform identifier: {platform}")))?;

    let os_family = match os {
        "linux" => OsFamily::Linux,
        "macos" => OsFamily::Macos,
        "win" => OsFamily::Windows,
        other => {
            return Err(Error::Internal(format!("unknown platform OS: {other}")));
        }
    };

    let unsupported = |reason: &str| {
        Err(Error::UnsupportedBackend {
            backend,
            reason: reason.to_string(),
        })
    };

    let backend_tag = match (backend, os_family) {
        (Backend::Cpu, _) => None,
        // macOS archives are Metal-enabled; there is no separate asset
        (Backend::Metal, OsFamily::Macos) => None,
        (Backend::Metal, _) => return unsupported("Metal archives exist only for macOS"),
        (Backend::Cuda12, OsFamily::Macos) | (Backend::Cuda13, OsFamily::Macos) => {
            return unsupported("no CUDA archives for macOS")
        }
        (Backend::Cuda12, _) => Some("cuda-12"),
        (Backend::Cuda13, _) => Some("cuda-13"),
        (Backend::Vulkan, OsFamily::Macos) => return unsupported("no Vulkan archives for macOS"),
        (Backend::Vulkan, _) => Some("vulkan"),
        (Backend::Hip, OsFamily::Macos) => return unsupported("no HIP archives for macOS"),
        (Backend::Hip, _) => Some("hip"),
    };

    let os_tag = match os_family {
        OsFamily::Linux => "ubuntu",
        OsFamily::Macos => "macos",
        OsFamily::Windows => "win",
    };

    Ok(match backend_tag {
        Some(bt) => format!("llama-{tag}-bin-{os_tag}-{bt}-{arch}.zip"),
        None => format!("llama-{tag}-bin-{os_tag}-{arch}.zip"),
    })
}
