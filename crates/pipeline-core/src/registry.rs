//! Plugin registry
//!
//! Built once at startup. Every plugin a pipeline refers to is resolved when the
//! pipeline is constructed, so a misspelt correction name fails before any
//! image is touched.

use crate::error::RegistryError;
use crate::plugin::{Arity, Plugin, PluginFactory};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Registered plugin factories by name
#[derive(Default)]
pub struct Registry {
    factories: HashMap<String, Arc<dyn PluginFactory>>,
}

/// Summary of one registered plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub arity: Arity,
    pub description: String,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin factory under its own name
    pub fn register(&mut self, factory: Arc<dyn PluginFactory>) -> Result<(), RegistryError> {
        let name = factory.name().to_string();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::DuplicatePlugin(name));
        }

        info!("Registering plugin: {}", name);
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Build a fresh instance of a plugin
    pub fn create(&self, name: &str) -> Result<Box<dyn Plugin>, RegistryError> {
        self.factory(name).map(|f| f.create())
    }

    /// Fail unless every name is registered with the given arity
    pub fn require<'a, I>(&self, names: I, arity: Arity) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            let factory = self.factory(name)?;
            if factory.arity() != arity {
                return Err(RegistryError::ArityMismatch {
                    name: name.to_string(),
                    expected: arity.as_str(),
                    actual: factory.arity().as_str(),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Get all registered plugin names, sorted
    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Name, arity and description of every plugin, sorted by name
    pub fn describe(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self
            .factories
            .values()
            .map(|f| PluginInfo {
                name: f.name().to_string(),
                arity: f.arity(),
                description: f.description().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn factory(&self, name: &str) -> Result<&Arc<dyn PluginFactory>, RegistryError> {
        self.factories
            .get(name)
            .ok_or_else(|| RegistryError::UnknownPlugin(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use crate::image_ref::{ImageRead, ImageWrite};
    use crate::Context;

    struct NoopPlugin;

    impl Plugin for NoopPlugin {
        fn name(&self) -> &str {
            "noop"
        }

        fn arity(&self) -> Arity {
            Arity::Correction
        }

        fn run(
            &mut self,
            _ctx: &Context,
            _inputs: &[ImageRead],
            _output: &ImageWrite,
        ) -> Result<(), PluginError> {
            Ok(())
        }
    }

    struct NoopFactory;

    impl PluginFactory for NoopFactory {
        fn name(&self) -> &str {
            "noop"
        }

        fn description(&self) -> &str {
            "Does nothing"
        }

        fn arity(&self) -> Arity {
            Arity::Correction
        }

        fn create(&self) -> Box<dyn Plugin> {
            Box::new(NoopPlugin)
        }
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = Registry::new();
        registry.register(Arc::new(NoopFactory)).unwrap();

        assert_eq!(registry.plugin_names(), vec!["noop".to_string()]);
        assert_eq!(registry.create("noop").unwrap().name(), "noop");
        assert_eq!(registry.describe()[0].arity, Arity::Correction);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = Registry::new();
        registry.register(Arc::new(NoopFactory)).unwrap();
        assert!(matches!(
            registry.register(Arc::new(NoopFactory)),
            Err(RegistryError::DuplicatePlugin(_))
        ));
    }

    #[test]
    fn test_require_rejects_unknown_and_wrong_arity() {
        let mut registry = Registry::new();
        registry.register(Arc::new(NoopFactory)).unwrap();

        assert!(registry.require(["noop"], Arity::Correction).is_ok());
        assert!(matches!(
            registry.require(["noop", "vignette"], Arity::Correction),
            Err(RegistryError::UnknownPlugin(name)) if name == "vignette"
        ));
        assert!(matches!(
            registry.require(["noop"], Arity::Fusion),
            Err(RegistryError::ArityMismatch { .. })
        ));
    }
}
