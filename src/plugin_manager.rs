//! Install and uninstall plugin bundles from the remote plugin registry.
//!
//! Changes take effect on the next start: installed bundles are picked up
//! by discovery, and uninstalled ones (metadata removed) are cleaned up then.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tar::Archive;

use crate::config::constants;
use crate::error::PluginError;
use crate::plugin_loader::PluginMetadata;

/// One entry of the remote registry listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryPlugin {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub download_url: Option<String>,
}

pub struct PluginManager {
    client: reqwest::Client,
    registry_url: String,
    plugins_dir: PathBuf,
    max_retries: u32,
    retry_delay: Duration,
}

impl PluginManager {
    pub fn new(registry_url: impl Into<String>, plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry_url: registry_url.into(),
            plugins_dir: plugins_dir.into(),
            max_retries: constants::MAX_RETRIES,
            retry_delay: Duration::from_millis(constants::RETRY_DELAY_MILLIS),
        }
    }

    /// Override the download retry policy.
    pub fn with_retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Fetch the raw registry listing.
    pub async fn fetch_registry(&self) -> Result<Vec<RegistryPlugin>, PluginError> {
        let registry_error = |reason: String| PluginError::Registry {
            url: self.registry_url.clone(),
            reason,
        };

        let response = self
            .client
            .get(&self.registry_url)
            .send()
            .await
            .map_err(|e| registry_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(registry_error(format!("HTTP {}", response.status())));
        }
        response
            .json::<Vec<RegistryPlugin>>()
            .await
            .map_err(|e| registry_error(e.to_string()))
    }

    /// Registry listing annotated with what is installed locally.
    pub async fn get_plugins(&self) -> Result<Vec<PluginMetadata>, PluginError> {
        let installed = self.get_installed_plugins()?;
        let registry = self.fetch_registry().await?;

        Ok(registry
            .into_iter()
            .map(|item| {
                let local = installed.iter().find(|m| m.name == item.name);
                let installed_version = local.and_then(|m| m.installed_version.clone());
                let is_update_available = installed_version
                    .as_deref()
                    .is_some_and(|v| v != item.version);
                PluginMetadata {
                    name: item.name,
                    author: item.author,
                    description: item.description,
                    version: item.version,
                    download_url: item.download_url,
                    is_installed: local.is_some(),
                    installed_version,
                    is_update_available,
                }
            })
            .collect())
    }

    /// Metadata of every bundle that has a `plugin.json`.
    pub fn get_installed_plugins(&self) -> Result<Vec<PluginMetadata>, PluginError> {
        Ok(self
            .installed_bundles()?
            .into_iter()
            .map(|(_, metadata)| metadata)
            .collect())
    }

    fn installed_bundles(&self) -> Result<Vec<(PathBuf, PluginMetadata)>, PluginError> {
        let entries = match fs::read_dir(&self.plugins_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PluginError::Io {
                    path: self.plugins_dir.clone(),
                    source,
                });
            }
        };

        let mut bundles = Vec::new();
        for path in entries.filter_map(Result::ok).map(|e| e.path()) {
            if !PluginMetadata::path_in(&path).exists() {
                continue;
            }
            match PluginMetadata::read(&path) {
                Ok(metadata) => bundles.push((path, metadata)),
                Err(e) => warn!("Ignoring bundle at {}: {}", path.display(), e),
            }
        }
        bundles.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        Ok(bundles)
    }

    /// Download, extract and record a plugin bundle.
    ///
    /// Any previous contents of the bundle directory are removed first.
    ///
    /// # Errors
    ///
    /// * [`PluginError::MissingDownloadUrl`] if the item has no download URL
    /// * [`PluginError::Download`] once every download attempt failed
    /// * [`PluginError::Archive`] if the archive cannot be extracted
    /// * [`PluginError::Io`] / [`PluginError::Metadata`] on filesystem errors
    pub async fn install_plugin(&self, plugin: &RegistryPlugin) -> Result<PluginMetadata, PluginError> {
        let url = plugin
            .download_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| PluginError::MissingDownloadUrl {
                name: plugin.name.clone(),
            })?;

        let archive = self.download_with_retry(url).await?;

        let bundle_dir = self.plugins_dir.join(bundle_dir_name(&plugin.name));
        match fs::remove_dir_all(&bundle_dir) {
            Ok(()) => debug!("Removed previous contents of {}", bundle_dir.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(PluginError::Io {
                    path: bundle_dir,
                    source,
                });
            }
        }
        fs::create_dir_all(&bundle_dir).map_err(|source| PluginError::Io {
            path: bundle_dir.clone(),
            source,
        })?;

        let target = bundle_dir.clone();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &target))
            .await
            .map_err(|e| PluginError::Archive {
                path: bundle_dir.clone(),
                reason: e.to_string(),
            })??;

        let metadata = PluginMetadata {
            name: plugin.name.clone(),
            author: plugin.author.clone(),
            description: plugin.description.clone(),
            version: plugin.version.clone(),
            download_url: plugin.download_url.clone(),
            is_installed: true,
            installed_version: Some(plugin.version.clone()),
            is_update_available: false,
        };
        metadata.write(&bundle_dir)?;

        info!(
            "Installed plugin '{}' v{} into {}; it will be loaded on next start",
            metadata.name,
            metadata.version,
            bundle_dir.display()
        );
        Ok(metadata)
    }

    /// Look up a plugin in the registry by name and install it.
    pub async fn install_plugin_by_name(&self, name: &str) -> Result<PluginMetadata, PluginError> {
        let registry = self.fetch_registry().await?;
        let plugin = registry
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| PluginError::Registry {
                url: self.registry_url.clone(),
                reason: format!("no plugin named '{}'", name),
            })?;
        self.install_plugin(&plugin).await
    }

    /// Mark a plugin for removal by deleting its `plugin.json`.
    ///
    /// The loaded code stays active until restart; the directory itself is
    /// removed by discovery on the next start.
    pub fn uninstall_plugin(&self, name: &str) -> Result<(), PluginError> {
        let (bundle_dir, _) = self
            .installed_bundles()?
            .into_iter()
            .find(|(_, metadata)| metadata.name == name)
            .ok_or_else(|| PluginError::NotInstalled {
                name: name.to_string(),
            })?;

        let path = PluginMetadata::path_in(&bundle_dir);
        fs::remove_file(&path).map_err(|source| PluginError::Io { path, source })?;
        info!("Uninstalled plugin '{}'; restart to unload it", name);
        Ok(())
    }

    async fn download_with_retry(&self, url: &str) -> Result<Vec<u8>, PluginError> {
        let mut delay = self.retry_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.download(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(reason) if attempt >= self.max_retries => {
                    return Err(PluginError::Download {
                        url: url.to_string(),
                        attempts: attempt,
                        reason,
                    });
                }
                Err(reason) => {
                    warn!(
                        "Plugin download from {} failed (attempt {}/{}): {}; retrying in {:?}",
                        url, attempt, self.max_retries, reason, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(bytes.to_vec())
    }
}

/// Directory name for a plugin: its name with anything unusual replaced by `_`.
pub fn bundle_dir_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn extract_archive(archive: &[u8], target: &Path) -> Result<(), PluginError> {
    let mut archive = Archive::new(GzDecoder::new(archive));
    archive.unpack(target).map_err(|e| PluginError::Archive {
        path: target.to_path_buf(),
        reason: e.to_string(),
    })
}
