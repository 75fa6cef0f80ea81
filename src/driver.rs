//! Resource drivers and the registry that maps type tags to them.
//!
//! A [`Driver`] is the engine's only window onto a provider API. The engine
//! hands it fully resolved property values and expects back the
//! provider-assigned id plus any output attributes other resources may
//! reference.
//!
//! # Example
//!
//! ```
//! use hemmer_engine::{async_trait, CurrentResource, Driver, DriverError, DriverOutput, DriverRegistry};
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! struct BucketDriver;
//!
//! #[async_trait]
//! impl Driver for BucketDriver {
//!     async fn create(&self, id: &str, _properties: &Value) -> Result<DriverOutput, DriverError> {
//!         Ok(DriverOutput::new(format!("bucket-{}", id.to_lowercase())))
//!     }
//!
//!     async fn update(
//!         &self,
//!         _id: &str,
//!         current: &CurrentResource,
//!         _properties: &Value,
//!     ) -> Result<DriverOutput, DriverError> {
//!         Ok(DriverOutput::new(current.external_id.clone()))
//!     }
//!
//!     async fn delete(&self, _id: &str, _current: &CurrentResource) -> Result<(), DriverError> {
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = DriverRegistry::new();
//! registry.register("aws_s3_bucket", Arc::new(BucketDriver));
//! assert!(registry.contains("aws_s3_bucket"));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DriverError;
use crate::schema::ResourceSchema;

/// What a driver returns after creating, updating or reading a resource.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriverOutput {
    /// Provider-assigned identifier.
    pub external_id: String,
    /// Output attributes, e.g. `Arn` or `DomainName`.
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl DriverOutput {
    /// Output with no attributes.
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            attributes: Map::new(),
        }
    }

    /// Add an output attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}

/// The recorded view of an existing resource.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CurrentResource {
    /// Provider-assigned identifier.
    pub external_id: String,
    /// Properties as last applied.
    pub properties: Value,
    /// Output attributes as last recorded.
    pub attributes: Map<String, Value>,
}

/// A provider integration for one or more resource types.
///
/// Implementations must be safe to call concurrently for different
/// resources. The engine never calls a driver twice at once for the same
/// resource id.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Schema of the properties this driver accepts, if it publishes one.
    fn schema(&self) -> Option<ResourceSchema> {
        None
    }

    /// Create the resource.
    async fn create(&self, id: &str, properties: &Value) -> Result<DriverOutput, DriverError>;

    /// Read the live resource. `Ok(None)` means it no longer exists.
    async fn read(
        &self,
        id: &str,
        current: &CurrentResource,
    ) -> Result<Option<DriverOutput>, DriverError> {
        let _ = current;
        Err(DriverError::Unimplemented(format!("read is not supported for '{}'", id)))
    }

    /// Update the resource in place.
    async fn update(
        &self,
        id: &str,
        current: &CurrentResource,
        properties: &Value,
    ) -> Result<DriverOutput, DriverError>;

    /// Delete the resource.
    async fn delete(&self, id: &str, current: &CurrentResource) -> Result<(), DriverError>;
}

/// Maps resource type tags to drivers.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver for a type tag, replacing any earlier one.
    pub fn register(&mut self, resource_type: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.insert(resource_type.into(), driver);
    }

    /// Builder form of [`DriverRegistry::register`].
    pub fn with_driver(mut self, resource_type: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.register(resource_type, driver);
        self
    }

    /// Look up the driver for a type tag.
    pub fn resolve(&self, resource_type: &str) -> Result<Arc<dyn Driver>, DriverError> {
        self.drivers
            .get(resource_type)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("no driver for type '{}'", resource_type)))
    }

    /// Whether a driver is registered for the type tag.
    pub fn contains(&self, resource_type: &str) -> bool {
        self.drivers.contains_key(resource_type)
    }

    /// Registered type tags, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.drivers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("types", &self.types())
            .finish()
    }
}
