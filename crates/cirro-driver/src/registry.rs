use std::collections::HashMap;
use std::sync::Arc;

use crate::driver::Driver;
use crate::error::DriverError;
use crate::native::NativeDriver;
use crate::opentofu::OpenTofuDriver;

/// Factory producing a fresh driver instance for one operation.
pub type DriverFactory = Box<dyn Fn() -> Arc<dyn Driver> + Send + Sync>;

/// Append-only map from driver name to factory.
///
/// Registration happens at process initialization; afterwards the registry is
/// effectively immutable and lookups are lock-free. Instances are created per
/// operation so a long-lived engine holds no driver resources between runs.
#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in drivers (`native`, `opentofu`) registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("native", || Arc::new(NativeDriver::new()));
        registry.register("opentofu", || Arc::new(OpenTofuDriver::new()));
        registry
    }

    /// Register a factory under `name`. Returns `&mut self` for chaining.
    /// Re-registering a name replaces the factory; callers are expected to
    /// register once at startup.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Driver> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    /// Create a driver instance for one operation.
    pub fn create(&self, name: &str) -> Result<Arc<dyn Driver>, DriverError> {
        self.factories
            .get(name)
            .map(|f| f())
            .ok_or_else(|| DriverError::NotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// All registered driver names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
