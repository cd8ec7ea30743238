//! # Operation Capability
//!
//! The kernels themselves live outside this crate. The engine only needs
//! two seams: [`ImageOperation`] (run one kernel) and [`OperationFactory`]
//! (build a kernel for a catalog definition). [`OperationRegistry`] is the
//! closure-map factory: constructors are registered per key, with optional
//! per-kind fallbacks, and resolved when the catalog is loaded.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::definition::{OperationDefinition, OperationKind};
use crate::params::ParameterValues;
use crate::picture::Image;

/// Key of the built-in identity operation
pub const NO_FILTER: &str = "NoFilter";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    #[error("Missing secondary input")]
    MissingSecondary,
    #[error("Invalid parameter {0}")]
    InvalidParameter(String),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// One live image kernel
pub trait ImageOperation: Send {
    fn apply(
        &mut self,
        primary: &Image,
        secondary: Option<&Image>,
        params: &ParameterValues,
    ) -> Result<Image, OperationError>;
}

impl<F> ImageOperation for F
where
    F: FnMut(&Image, Option<&Image>, &ParameterValues) -> Result<Image, OperationError> + Send,
{
    fn apply(
        &mut self,
        primary: &Image,
        secondary: Option<&Image>,
        params: &ParameterValues,
    ) -> Result<Image, OperationError> {
        self(primary, secondary, params)
    }
}

/// Box a closure as a kernel
pub fn from_fn<F>(f: F) -> Box<dyn ImageOperation>
where
    F: FnMut(&Image, Option<&Image>, &ParameterValues) -> Result<Image, OperationError>
        + Send
        + 'static,
{
    Box::new(f)
}

/// Builds kernels for catalog definitions
pub trait OperationFactory: Send + Sync {
    /// `None` means the kernel could not be built
    fn construct(&self, definition: &OperationDefinition) -> Option<Box<dyn ImageOperation>>;

    /// Whether `construct` has any chance of succeeding for this definition
    fn supports(&self, _definition: &OperationDefinition) -> bool {
        true
    }
}

type Constructor = dyn Fn(&OperationDefinition) -> Option<Box<dyn ImageOperation>> + Send + Sync;

/// Identity kernel used by [`NO_FILTER`]
pub(crate) fn passthrough() -> Box<dyn ImageOperation> {
    from_fn(|primary, _, _| Ok(primary.clone()))
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone, Default)]
pub struct OperationRegistry {
    by_key: HashMap<String, Arc<Constructor>>,
    by_kind: HashMap<OperationKind, Arc<Constructor>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in operations already registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(NO_FILTER, |_| Some(passthrough()));
        registry
    }

    pub fn register(
        &mut self,
        key: impl Into<String>,
        constructor: impl Fn(&OperationDefinition) -> Option<Box<dyn ImageOperation>>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        let key = key.into();
        if self.by_key.insert(key.clone(), Arc::new(constructor)).is_some() {
            tracing::warn!("Replacing constructor for {}", key);
        }
        self
    }

    /// Fallback constructor for every key of a kind without its own entry
    pub fn register_kind(
        &mut self,
        kind: OperationKind,
        constructor: impl Fn(&OperationDefinition) -> Option<Box<dyn ImageOperation>>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.by_kind.insert(kind, Arc::new(constructor));
        self
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn constructor_for(&self, definition: &OperationDefinition) -> Option<&Arc<Constructor>> {
        self.by_key
            .get(&definition.key)
            .or_else(|| self.by_kind.get(&definition.kind))
    }
}

impl OperationFactory for OperationRegistry {
    fn construct(&self, definition: &OperationDefinition) -> Option<Box<dyn ImageOperation>> {
        let constructor = self.constructor_for(definition)?;
        constructor(definition)
    }

    fn supports(&self, definition: &OperationDefinition) -> bool {
        !definition.kind.needs_kernel() || self.constructor_for(definition).is_some()
    }
}
