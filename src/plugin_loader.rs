//! Discovery and loading of plugin bundles from the plugins directory.
//!
//! A bundle is a directory containing `plugin.json` and exactly one driver
//! library named `overseer_*.{so,dylib,dll}`. The library exports
//! [`PLUGIN_ENTRY_SYMBOL`], which hands back the bundle's plugin
//! configuration. Each library is loaded on its own; once its bundle is
//! accepted it stays mapped for the rest of the process.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use libloading::Library;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::capabilities::{CapabilityRegistry, PluginConfiguration};
use crate::config::constants;
use crate::error::PluginError;

/// Signature of the entry point every bundle library exports.
pub type PluginEntryFn = unsafe extern "C" fn() -> Vec<Box<dyn PluginConfiguration>>;

/// Name of the entry point symbol looked up in bundle libraries.
pub const PLUGIN_ENTRY_SYMBOL: &str = "overseer_plugin_entry";

const LIBRARY_PREFIX: &str = "overseer_";
const LIBRARY_EXTENSIONS: [&str; 3] = ["so", "dylib", "dll"];

/// Contents of a bundle's `plugin.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub is_installed: bool,
    #[serde(default)]
    pub installed_version: Option<String>,
    #[serde(default)]
    pub is_update_available: bool,
}

impl PluginMetadata {
    /// Path of the metadata file inside a bundle directory.
    pub fn path_in(bundle_dir: &Path) -> PathBuf {
        bundle_dir.join(constants::PLUGIN_METADATA_FILE)
    }

    /// Read `plugin.json` from a bundle directory.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the file cannot be read and
    /// [`PluginError::Metadata`] if it is not valid metadata JSON.
    pub fn read(bundle_dir: &Path) -> Result<Self, PluginError> {
        let path = Self::path_in(bundle_dir);
        let raw = fs::read_to_string(&path).map_err(|source| PluginError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|e| PluginError::Metadata {
            path,
            reason: e.to_string(),
        })
    }

    /// Write `plugin.json` into a bundle directory.
    pub fn write(&self, bundle_dir: &Path) -> Result<(), PluginError> {
        let path = Self::path_in(bundle_dir);
        let json = serde_json::to_string_pretty(self).map_err(|e| PluginError::Metadata {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, json).map_err(|source| PluginError::Io { path, source })
    }
}

/// What a [`BundleLoader`] hands back for one library.
pub struct LoadedBundle {
    pub configurations: Vec<Box<dyn PluginConfiguration>>,
    /// The mapped library. `None` for in-process loaders.
    pub library: Option<Library>,
}

/// Loads the code of one bundle library.
pub trait BundleLoader: Send + Sync {
    fn load(&self, library_path: &Path) -> Result<LoadedBundle, PluginError>;
}

/// Default loader: maps the library with `libloading` and calls its entry point.
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLibraryLoader;

impl BundleLoader for DynamicLibraryLoader {
    fn load(&self, library_path: &Path) -> Result<LoadedBundle, PluginError> {
        // SAFETY: bundle libraries are expected to export `PLUGIN_ENTRY_SYMBOL`
        // with the `PluginEntryFn` signature and to be built with the same
        // compiler as the host. Loading arbitrary code is inherently unsafe.
        unsafe {
            let library = Library::new(library_path).map_err(|e| PluginError::Load {
                path: library_path.to_path_buf(),
                reason: e.to_string(),
            })?;

            let configurations = {
                let entry = library
                    .get::<PluginEntryFn>(PLUGIN_ENTRY_SYMBOL.as_bytes())
                    .map_err(|e| PluginError::Load {
                        path: library_path.to_path_buf(),
                        reason: format!("missing entry point '{}': {}", PLUGIN_ENTRY_SYMBOL, e),
                    })?;
                entry()
            };

            Ok(LoadedBundle {
                configurations,
                library: Some(library),
            })
        }
    }
}

/// A bundle that passed validation.
///
/// The library of an accepted bundle is never unmapped: objects and tasks
/// created by its code may outlive the registry, the capability table and
/// even the async runtime.
pub struct LoadedPlugin {
    pub configuration: Arc<dyn PluginConfiguration>,
    pub metadata: PluginMetadata,
    pub library: Option<&'static Library>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.configuration.name())
            .field("metadata", &self.metadata)
            .field("dynamic", &self.library.is_some())
            .finish()
    }
}

/// Finds and loads plugin bundles.
pub struct PluginRegistry {
    plugins_dir: PathBuf,
    loader: Box<dyn BundleLoader>,
    /// Libraries of accepted bundles, keyed by plugin name.
    libraries: DashMap<String, &'static Library>,
}

impl PluginRegistry {
    /// Create a registry that loads bundles with [`DynamicLibraryLoader`].
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self::with_loader(plugins_dir, DynamicLibraryLoader)
    }

    pub fn with_loader(plugins_dir: impl Into<PathBuf>, loader: impl BundleLoader + 'static) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            loader: Box::new(loader),
            libraries: DashMap::new(),
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Enumerate the bundle directories and yield every bundle that loads.
    ///
    /// The sequence is lazy: each bundle is validated and loaded when the
    /// iterator reaches it. A missing plugins directory yields nothing.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] only if the plugins directory exists but
    /// cannot be listed. Problems with individual bundles are logged and the
    /// bundle is skipped.
    pub fn discover_plugins(
        &self,
    ) -> Result<impl Iterator<Item = LoadedPlugin> + '_, PluginError> {
        let entries = match fs::read_dir(&self.plugins_dir) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(
                    "Plugins directory {} does not exist; no plugins to load",
                    self.plugins_dir.display()
                );
                None
            }
            Err(source) => {
                return Err(PluginError::Io {
                    path: self.plugins_dir.clone(),
                    source,
                });
            }
        };

        Ok(entries
            .into_iter()
            .flatten()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.path()),
                Err(e) => {
                    warn!("Skipping unreadable entry in plugins directory: {}", e);
                    None
                }
            })
            .filter(|path| path.is_dir())
            .filter_map(move |path| self.load_plugin(&path)))
    }

    /// Validate and load a single bundle directory.
    ///
    /// Returns `None` when the bundle is skipped:
    /// - no `plugin.json`: the directory is an uninstalled leftover and is removed
    /// - unreadable metadata
    /// - zero or several driver libraries
    /// - the library fails to load or yields zero or several configurations
    pub fn load_plugin(&self, bundle_dir: &Path) -> Option<LoadedPlugin> {
        if !PluginMetadata::path_in(bundle_dir).exists() {
            remove_orphaned_bundle(bundle_dir);
            return None;
        }

        let metadata = match PluginMetadata::read(bundle_dir) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Skipping plugin at {}: {}", bundle_dir.display(), e);
                return None;
            }
        };

        let libraries = match find_libraries(bundle_dir) {
            Ok(libraries) => libraries,
            Err(e) => {
                warn!("Skipping plugin '{}': {}", metadata.name, e);
                return None;
            }
        };
        let library_path = match libraries.as_slice() {
            [single] => single,
            [] => {
                warn!(
                    "Skipping plugin '{}': no driver library found in {}",
                    metadata.name,
                    bundle_dir.display()
                );
                return None;
            }
            many => {
                warn!(
                    "Skipping plugin '{}': expected one driver library, found {}",
                    metadata.name,
                    many.len()
                );
                return None;
            }
        };

        let bundle = match self.loader.load(library_path) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!("Skipping plugin '{}': {}", metadata.name, e);
                return None;
            }
        };

        let LoadedBundle {
            mut configurations,
            library,
        } = bundle;
        if configurations.len() != 1 {
            warn!(
                "Skipping plugin '{}': expected one plugin configuration, found {}",
                metadata.name,
                configurations.len()
            );
            // Release the objects before the library holding their code.
            drop(configurations);
            drop(library);
            return None;
        }
        let configuration: Arc<dyn PluginConfiguration> = Arc::from(configurations.remove(0));

        let library: Option<&'static Library> =
            library.map(|library| &*Box::leak(Box::new(library)));
        if let Some(library) = library {
            self.libraries.insert(metadata.name.clone(), library);
        }

        info!(
            "Loaded plugin '{}' v{} from {}",
            metadata.name,
            metadata.version,
            library_path.display()
        );

        Some(LoadedPlugin {
            configuration,
            metadata,
            library,
        })
    }

    /// Apply the compiled-in plugins, then every discovered bundle, to a new
    /// capability registry.
    ///
    /// Bundles are applied after the built-ins so their analyzers and
    /// embedding models take precedence.
    pub fn build_capabilities(
        &self,
        builtins: &[&dyn PluginConfiguration],
    ) -> Result<CapabilityRegistry, PluginError> {
        let mut capabilities = CapabilityRegistry::new();
        for plugin in builtins {
            capabilities.apply(*plugin);
        }
        for plugin in self.discover_plugins()? {
            capabilities.apply(plugin.configuration.as_ref());
        }
        Ok(capabilities)
    }

    /// Whether a dynamic library for the named plugin is held.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.libraries.contains_key(name)
    }

    pub fn loaded_count(&self) -> usize {
        self.libraries.len()
    }
}

/// Remove a bundle directory whose metadata was deleted by an uninstall.
/// Removing a directory that is already gone is not an error.
fn remove_orphaned_bundle(bundle_dir: &Path) {
    match fs::remove_dir_all(bundle_dir) {
        Ok(()) => info!("Removed uninstalled plugin directory {}", bundle_dir.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Plugin directory {} already removed", bundle_dir.display())
        }
        Err(e) => warn!(
            "Failed to remove uninstalled plugin directory {}: {}",
            bundle_dir.display(),
            e
        ),
    }
}

fn find_libraries(bundle_dir: &Path) -> Result<Vec<PathBuf>, PluginError> {
    let entries = fs::read_dir(bundle_dir).map_err(|source| PluginError::Io {
        path: bundle_dir.to_path_buf(),
        source,
    })?;

    let mut libraries: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_plugin_library(path))
        .collect();
    libraries.sort();
    Ok(libraries)
}

/// Whether a file name looks like a bundle driver library.
pub fn is_plugin_library(path: &Path) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    // Unix toolchains prefix cdylibs with "lib".
    let stem = stem.strip_prefix("lib").unwrap_or(stem);
    stem.starts_with(LIBRARY_PREFIX)
        && LIBRARY_EXTENSIONS
            .iter()
            .any(|ext| extension.eq_ignore_ascii_case(ext))
}
