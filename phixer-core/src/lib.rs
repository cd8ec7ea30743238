//! # Phixer Core
//!
//! Filter-chain execution and lifecycle engine for a photo filter app:
//! catalog of named operations, pooled operation instances, committed
//! chains with a live preview, presets and face-region masked operations.

// ============================================================================
// Images / Parameters
// ============================================================================
pub mod picture;
pub mod params;
pub mod regions;

// ============================================================================
// Catalog / Capabilities
// ============================================================================
pub mod definition;
pub mod operation;
pub mod catalog;
pub mod configuration;

// ============================================================================
// Execution
// ============================================================================
pub mod pool;
pub mod output_cache;
pub mod composite;
pub mod presets;
pub mod chain;
pub mod engine;

// ============================================================================
// Config / Errors
// ============================================================================
pub mod config;
pub mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{ListFilter, OperationCatalog, FAVOURITES};
pub use chain::{ChainEntry, ChainEvent, ChainSnapshot, FilterChain, ObserverId};
pub use composite::{Composition, MaskedRegionComposer};
pub use config::{EngineConfig, FailurePolicy};
pub use configuration::{CategoryConfig, CollectionConfig, ConfigurationSource, JsonConfiguration};
pub use definition::{OperationDefinition, OperationFlags, OperationKind};
pub use engine::{BlendSource, Engine, EngineBuilder, StaticBlend};
pub use error::{FilterError, Result};
pub use operation::{ImageOperation, OperationError, OperationFactory, OperationRegistry, NO_FILTER};
pub use output_cache::OutputCache;
pub use params::{ParameterSpec, ParameterType, ParameterValue, ParameterValues};
pub use picture::{Extent, Image, ImageId, Point, Rect};
pub use pool::{InstanceHandle, OperationInstance, OperationInstancePool, PoolLease, PoolStats};
pub use presets::{PresetDescription, PresetExpander, PresetStep};
pub use regions::{FacialFeature, FeatureDetector, FeatureRegion, Orientation, RegionMemo};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
