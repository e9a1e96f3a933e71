//! Software installation and configuration

use crate::error::{HostError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A piece of software that can be fetched and put in place
#[async_trait]
pub trait Installer: Send + Sync {
    fn name(&self) -> &str;

    async fn is_installed(&self, cancel: &CancellationToken) -> Result<bool>;

    /// Fetch the artifact into a temporary location
    async fn download(&self, cancel: &CancellationToken) -> Result<()>;

    /// Put the downloaded artifact in place
    async fn install(&self, cancel: &CancellationToken) -> Result<()>;

    /// Remove whatever `download` left behind
    async fn cleanup(&self, cancel: &CancellationToken) -> Result<()>;

    async fn uninstall(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Software with a configuration file of its own
#[async_trait]
pub trait Configurable: Send + Sync {
    /// Whether the configuration on disk matches the rendered one
    async fn is_configured(&self, cancel: &CancellationToken) -> Result<bool>;

    async fn configure(&self, cancel: &CancellationToken) -> Result<()>;

    async fn remove_configuration(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// A configuration file and its rendered content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub content: String,
}

/// A single binary downloaded from a release URL
///
/// `file://` URLs are copied from the local filesystem, which is how
/// air-gapped hosts are provisioned.
#[derive(Debug, Clone)]
pub struct ReleaseBinary {
    name: String,
    url: String,
    sha256: Option<String>,
    install_path: PathBuf,
    download_dir: PathBuf,
    config: Option<ConfigFile>,
    client: reqwest::Client,
}

impl ReleaseBinary {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        install_path: impl Into<PathBuf>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            sha256: None,
            install_path: install_path.into(),
            download_dir: download_dir.into(),
            config: None,
            client: reqwest::Client::new(),
        }
    }

    /// Verify the download against this digest
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into().to_lowercase());
        self
    }

    pub fn with_config(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.config = Some(ConfigFile {
            path: path.into(),
            content: content.into(),
        });
        self
    }

    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    pub fn config(&self) -> Option<&ConfigFile> {
        self.config.as_ref()
    }

    /// Where `download` puts the artifact
    pub fn download_path(&self) -> PathBuf {
        self.download_dir.join(format!("{}.download", self.name))
    }

    async fn fetch_http(&self, cancel: &CancellationToken, output: &Path) -> Result<()> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(HostError::Cancelled(format!("download of {}", self.url))),
            response = self.client.get(&self.url).send() => response?,
        };
        if !response.status().is_success() {
            return Err(HostError::HttpStatus {
                url: self.url.clone(),
                status: response.status().as_u16(),
            });
        }

        let content_length = response.content_length();
        info!(url = %self.url, content_length = ?content_length, "Download started");

        let mut file = fs::File::create(output)
            .await
            .map_err(|e| HostError::io(output, e))?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_report = Instant::now();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(HostError::Cancelled(format!("download of {}", self.url))),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| HostError::io(output, e))?;
            downloaded += chunk.len() as u64;

            if last_report.elapsed() > Duration::from_secs(5) {
                let pct = content_length
                    .filter(|total| *total > 0)
                    .map(|total| (downloaded * 100) / total)
                    .unwrap_or(0);
                info!(downloaded, percent = pct, "Download progress");
                last_report = Instant::now();
            }
        }

        file.sync_all()
            .await
            .map_err(|e| HostError::io(output, e))?;
        info!(bytes = downloaded, "Download complete");
        Ok(())
    }

    async fn verify(&self, path: &Path) -> Result<()> {
        let Some(expected) = &self.sha256 else {
            return Ok(());
        };
        let data = fs::read(path).await.map_err(|e| HostError::io(path, e))?;
        let actual = sha256_hex(&data);
        if &actual != expected {
            return Err(HostError::Checksum {
                path: path.to_path_buf(),
                expected: expected.clone(),
                actual,
            });
        }
        debug!(path = %path.display(), "Checksum verified");
        Ok(())
    }
}

async fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(HostError::io(path, e)),
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| HostError::io(parent, e))?;
    }
    Ok(())
}

#[async_trait]
impl Installer for ReleaseBinary {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_installed(&self, _cancel: &CancellationToken) -> Result<bool> {
        fs::try_exists(&self.install_path)
            .await
            .map_err(|e| HostError::io(&self.install_path, e))
    }

    async fn download(&self, cancel: &CancellationToken) -> Result<()> {
        let output = self.download_path();
        create_parent(&output).await?;

        if let Some(local) = self.url.strip_prefix("file://") {
            info!(source = local, "Copying local artifact");
            fs::copy(local, &output)
                .await
                .map_err(|e| HostError::io(local, e))?;
        } else {
            self.fetch_http(cancel, &output).await?;
        }
        self.verify(&output).await
    }

    async fn install(&self, _cancel: &CancellationToken) -> Result<()> {
        let source = self.download_path();
        create_parent(&self.install_path).await?;

        // copy next to the target, then rename into place
        let staged = self.install_path.with_extension("nodeforge-new");
        fs::copy(&source, &staged)
            .await
            .map_err(|e| HostError::io(&source, e))?;
        fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| HostError::io(&staged, e))?;
        fs::rename(&staged, &self.install_path)
            .await
            .map_err(|e| HostError::io(&self.install_path, e))?;

        info!(name = %self.name, path = %self.install_path.display(), "Installed");
        Ok(())
    }

    async fn cleanup(&self, _cancel: &CancellationToken) -> Result<()> {
        let path = self.download_path();
        if remove_if_present(&path).await? {
            debug!(path = %path.display(), "Removed download");
        }
        Ok(())
    }

    async fn uninstall(&self, _cancel: &CancellationToken) -> Result<()> {
        if remove_if_present(&self.install_path).await? {
            info!(name = %self.name, "Uninstalled");
        }
        Ok(())
    }
}

#[async_trait]
impl Configurable for ReleaseBinary {
    async fn is_configured(&self, _cancel: &CancellationToken) -> Result<bool> {
        let Some(config) = &self.config else {
            return Ok(true);
        };
        match fs::read(&config.path).await {
            Ok(on_disk) => Ok(sha256_hex(&on_disk) == sha256_hex(config.content.as_bytes())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(HostError::io(&config.path, e)),
        }
    }

    async fn configure(&self, _cancel: &CancellationToken) -> Result<()> {
        let Some(config) = &self.config else {
            return Ok(());
        };
        create_parent(&config.path).await?;
        fs::write(&config.path, &config.content)
            .await
            .map_err(|e| HostError::io(&config.path, e))?;
        info!(path = %config.path.display(), "Wrote configuration");
        Ok(())
    }

    async fn remove_configuration(&self, _cancel: &CancellationToken) -> Result<()> {
        if let Some(config) = &self.config {
            if remove_if_present(&config.path).await? {
                info!(path = %config.path.display(), "Removed configuration");
            }
        }
        Ok(())
    }
}
