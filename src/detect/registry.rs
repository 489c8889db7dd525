use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::result::PresencePolicy;

type BackendFactory = Box<dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Registry of detector backend factories.
///
/// Sessions never share a detector: every stream asks the registry for a
/// fresh instance, so per-stream backend state stays isolated.
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
            default_name: None,
        }
    }

    /// Registry preloaded with the backends compiled into this build.
    ///
    /// The stub backend reports marker regions as the policy's person class,
    /// and the tract backend drops candidates at or below its `min_confidence`.
    pub fn with_builtin(model_path: Option<&str>, policy: PresencePolicy) -> Self {
        let person_class_id = policy.person_class_id;
        let mut registry = Self::new();
        registry.register("stub", move || {
            Ok(Box::new(
                super::StubBackend::new().with_class_id(person_class_id),
            ))
        });

        #[cfg(feature = "backend-tract")]
        if let Some(path) = model_path {
            let path = path.to_string();
            registry.register("tract", move || {
                Ok(Box::new(
                    super::backends::TractBackend::new(&path)?
                        .with_confidence_threshold(policy.min_confidence),
                ))
            });
        }
        #[cfg(not(feature = "backend-tract"))]
        if model_path.is_some() {
            log::warn!("detector model path configured but backend-tract feature is disabled");
        }

        registry
    }

    /// Register a backend factory. The first registered backend becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// Create a new backend instance by name.
    pub fn create(&self, name: &str) -> Result<Box<dyn DetectorBackend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))?;
        factory()
    }

    /// Create a new instance of the default backend.
    pub fn create_default(&self) -> Result<Box<dyn DetectorBackend>> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        self.create(name)
    }

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
