//! Typed capability registry filled in by plugin configurations.
//!
//! Each plugin, compiled-in or loaded from a bundle, contributes device
//! types (with their driver factory and configurator), failure analyzers
//! and embedding models. The registry is built once at startup and then
//! shared read-only behind an `Arc`.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::detector::{EmbeddingModel, FailureAnalyzer};
use crate::model::{Device, FieldDescriptor};
use crate::providers::DeviceDriver;

/// Entry object exported by every plugin.
///
/// A plugin registers everything it provides in [`PluginConfiguration::configure`].
pub trait PluginConfiguration: Send + Sync {
    /// Human-readable plugin name used in logs.
    fn name(&self) -> &str;

    /// Register the plugin's capabilities.
    fn configure(&self, registry: &mut CapabilityRegistry);
}

/// Builds a driver instance for one device.
pub trait DriverFactory: Send + Sync {
    fn create(&self, device: &Device) -> Result<Arc<dyn DeviceDriver>>;
}

/// Vendor-specific configuration routine run when a device is created or updated.
///
/// Typically contacts the device to discover tools and fills in fields
/// the user did not provide.
#[async_trait]
pub trait DeviceConfigurator: Send + Sync {
    async fn configure(&self, device: Device) -> Result<Device>;
}

/// Builds a failure analyzer for one sentinel.
pub trait AnalyzerFactory: Send + Sync {
    /// # Arguments
    ///
    /// * `capabilities` - The full registry, so the factory can pick up an
    ///   embedding model registered by another plugin.
    fn create(&self, capabilities: &CapabilityRegistry) -> Result<Arc<dyn FailureAnalyzer>>;
}

/// A device type contributed by a plugin.
#[derive(Clone)]
pub struct DeviceTypeRegistration {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    pub driver: Option<Arc<dyn DriverFactory>>,
    pub configurator: Option<Arc<dyn DeviceConfigurator>>,
}

impl DeviceTypeRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            driver: None,
            configurator: None,
        }
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn driver(mut self, factory: impl DriverFactory + 'static) -> Self {
        self.driver = Some(Arc::new(factory));
        self
    }

    pub fn configurator(mut self, configurator: impl DeviceConfigurator + 'static) -> Self {
        self.configurator = Some(Arc::new(configurator));
        self
    }
}

impl fmt::Debug for DeviceTypeRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTypeRegistration")
            .field("name", &self.name)
            .field("fields", &self.fields.len())
            .field("driver", &self.driver.is_some())
            .field("configurator", &self.configurator.is_some())
            .finish()
    }
}

/// Table of every capability contributed by the loaded plugins.
#[derive(Default)]
pub struct CapabilityRegistry {
    device_types: Vec<DeviceTypeRegistration>,
    analyzers: Vec<(String, Arc<dyn AnalyzerFactory>)>,
    embedding_models: Vec<(String, Arc<dyn EmbeddingModel>)>,
    plugins: Vec<String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a plugin's configuration against this registry.
    pub fn apply(&mut self, plugin: &dyn PluginConfiguration) {
        let before = (
            self.device_types.len(),
            self.analyzers.len(),
            self.embedding_models.len(),
        );
        plugin.configure(self);
        log::info!(
            "Plugin '{}' registered {} device type(s), {} analyzer(s), {} embedding model(s)",
            plugin.name(),
            self.device_types.len() - before.0,
            self.analyzers.len() - before.1,
            self.embedding_models.len() - before.2
        );
        self.plugins.push(plugin.name().to_string());
    }

    /// Register a device type. A later registration with the same name is
    /// kept but never resolved, since lookup returns the first match.
    pub fn register_device_type(&mut self, registration: DeviceTypeRegistration) {
        if self.find_device_type(&registration.name).is_some() {
            log::warn!(
                "Device type '{}' is already registered; the duplicate will be ignored",
                registration.name
            );
        }
        self.device_types.push(registration);
    }

    pub fn register_analyzer(
        &mut self,
        name: impl Into<String>,
        factory: impl AnalyzerFactory + 'static,
    ) {
        self.analyzers.push((name.into(), Arc::new(factory)));
    }

    pub fn register_embedding_model(
        &mut self,
        name: impl Into<String>,
        model: impl EmbeddingModel + 'static,
    ) {
        self.embedding_models.push((name.into(), Arc::new(model)));
    }

    pub fn device_types(&self) -> &[DeviceTypeRegistration] {
        &self.device_types
    }

    /// Linear scan by type name.
    pub fn find_device_type(&self, name: &str) -> Option<&DeviceTypeRegistration> {
        self.device_types.iter().find(|t| t.name == name)
    }

    pub fn analyzer(&self, name: &str) -> Option<Arc<dyn AnalyzerFactory>> {
        self.analyzers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| Arc::clone(f))
    }

    /// Analyzer registered last; plugin analyzers override the built-in default.
    pub fn default_analyzer(&self) -> Option<Arc<dyn AnalyzerFactory>> {
        self.analyzers.last().map(|(_, f)| Arc::clone(f))
    }

    pub fn embedding_model(&self, name: &str) -> Option<Arc<dyn EmbeddingModel>> {
        self.embedding_models
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| Arc::clone(m))
    }

    /// Embedding model registered last; plugin models override the built-in default.
    pub fn default_embedding_model(&self) -> Option<Arc<dyn EmbeddingModel>> {
        self.embedding_models.last().map(|(_, m)| Arc::clone(m))
    }

    /// Names of the plugins applied so far, in order.
    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }
}
