//! # Engine
//!
//! Application-root object owning every filter service. Built once with
//! [`EngineBuilder`]; clones share the same services.
//!
//! ```text
//!   EngineBuilder ──► catalog ◄── ConfigurationSource
//!        │            pool    ◄── OperationFactory
//!        │            presets ◄── preset documents
//!        │            regions ◄── FeatureDetector
//!        └──────────► Engine ──► FilterChain (one per editing session)
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::catalog::{ListFilter, OperationCatalog};
use crate::chain::FilterChain;
use crate::composite::MaskedRegionComposer;
use crate::config::{EngineConfig, FailurePolicy};
use crate::configuration::{ConfigurationSource, JsonConfiguration};
use crate::definition::{OperationDefinition, OperationKind, INTENSITY_PARAMETER};
use crate::error::{FilterError, Result};
use crate::operation::{passthrough, ImageOperation, OperationFactory, OperationRegistry, NO_FILTER};
use crate::output_cache::{OutputCache, StepKey};
use crate::params::ParameterValues;
use crate::picture::{Extent, Image};
use crate::pool::{InstanceHandle, OperationInstancePool};
use crate::presets::{FoldContext, PresetExpander, PresetStep, StepRunner};
use crate::regions::{FeatureDetector, FeatureRegion, Orientation, RegionMemo};

// ============================================================================
// Blend Source
// ============================================================================

/// Supplies the secondary input of blend operations
pub trait BlendSource: Send + Sync {
    /// Blend image for a primary of the given extent
    fn blend_image(&self, extent: Extent) -> Option<Image>;
}

/// One fixed blend image
pub struct StaticBlend {
    image: Image,
}

impl StaticBlend {
    pub fn new(image: Image) -> Self {
        Self { image }
    }
}

impl BlendSource for StaticBlend {
    fn blend_image(&self, _extent: Extent) -> Option<Image> {
        Some(self.image.clone())
    }
}

/// Resolves the built-in operations before the user factory
struct BuiltinFactory {
    inner: Arc<dyn OperationFactory>,
}

impl OperationFactory for BuiltinFactory {
    fn construct(&self, definition: &OperationDefinition) -> Option<Box<dyn ImageOperation>> {
        if definition.key == NO_FILTER {
            return Some(passthrough());
        }
        self.inner.construct(definition)
    }

    fn supports(&self, definition: &OperationDefinition) -> bool {
        definition.key == NO_FILTER || self.inner.supports(definition)
    }
}

/// A chain step's cache key together with the blend image it runs with
pub(crate) struct ResolvedStep {
    pub key: StepKey,
    pub blend: Option<Image>,
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Default)]
pub struct EngineBuilder {
    configuration: Option<Arc<dyn ConfigurationSource>>,
    factory: Option<Arc<dyn OperationFactory>>,
    detector: Option<Arc<dyn FeatureDetector>>,
    blend_source: Option<Arc<dyn BlendSource>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configuration(mut self, source: impl ConfigurationSource + 'static) -> Self {
        self.configuration = Some(Arc::new(source));
        self
    }

    pub fn factory(mut self, factory: Arc<dyn OperationFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn detector(mut self, detector: Arc<dyn FeatureDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn blend_source(mut self, source: Arc<dyn BlendSource>) -> Self {
        self.blend_source = Some(source);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let source: Arc<dyn ConfigurationSource> = self
            .configuration
            .unwrap_or_else(|| Arc::new(JsonConfiguration::default()));
        let factory: Arc<dyn OperationFactory> = Arc::new(BuiltinFactory {
            inner: self
                .factory
                .unwrap_or_else(|| Arc::new(OperationRegistry::with_builtins())),
        });

        let catalog = Arc::new(OperationCatalog::new());
        catalog.register(
            OperationDefinition::new(NO_FILTER, OperationKind::SingleInput).with_title("No Filter"),
        )?;

        let mut unsupported = 0;
        for definition in source.definitions() {
            if !factory.supports(&definition) {
                tracing::warn!("No constructor for {} operation {}", definition.kind.label(), definition.key);
                unsupported += 1;
            }
            catalog.register(definition)?;
        }
        for category in source.categories() {
            catalog.assign_category(&category.key, &category.title, &category.filters);
        }
        for collection in source.collections() {
            catalog.assign_collection(&collection.key, &collection.title, &collection.categories);
        }

        tracing::info!(
            "Filter engine ready: {} operations ({} unsupported), {} categories, {} collections",
            catalog.len(),
            unsupported,
            catalog.categories().len(),
            catalog.collections().len()
        );

        let config = self.config;
        Ok(Engine {
            inner: Arc::new(EngineInner {
                pool: OperationInstancePool::new(catalog.clone(), factory, config.max_idle_instances),
                presets: PresetExpander::new(source, config.intensity_epsilon),
                composer: MaskedRegionComposer::new(),
                regions: RegionMemo::new(self.detector, config.region_memo_capacity),
                output_cache: OutputCache::new(config.output_cache_capacity),
                blend_source: self.blend_source,
                catalog,
                config,
            }),
        })
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineInner {
    config: EngineConfig,
    catalog: Arc<OperationCatalog>,
    pool: OperationInstancePool,
    presets: PresetExpander,
    composer: MaskedRegionComposer,
    regions: RegionMemo,
    output_cache: OutputCache,
    blend_source: Option<Arc<dyn BlendSource>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.inner.catalog
    }

    pub fn pool(&self) -> &OperationInstancePool {
        &self.inner.pool
    }

    pub fn presets(&self) -> &PresetExpander {
        &self.inner.presets
    }

    pub fn composer(&self) -> &MaskedRegionComposer {
        &self.inner.composer
    }

    pub fn regions(&self) -> &RegionMemo {
        &self.inner.regions
    }

    pub fn output_cache(&self) -> &OutputCache {
        &self.inner.output_cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn new_chain(&self) -> FilterChain {
        FilterChain::new(self.clone())
    }

    /// Run a preset on its own, outside any chain
    pub fn apply_preset(&self, key: &str, base: &Image, intensity: f32) -> Result<Image> {
        let mut ctx = FoldContext::new(base.clone(), Orientation::default());
        self.presets().apply(self, key, base, intensity, &mut ctx)
    }

    /// Construct every operation of a category ahead of use
    pub fn prewarm_category(&self, category: &str) -> usize {
        let keys = self.catalog().list(&ListFilter::category(category).with_hidden());
        self.pool().prewarm(&keys)
    }

    /// [`prewarm_category`](Self::prewarm_category) on a background thread
    pub fn spawn_prewarm(&self, category: &str) -> std::io::Result<JoinHandle<usize>> {
        let engine = self.clone();
        let category = category.to_string();
        std::thread::Builder::new()
            .name(format!("prewarm-{}", category))
            .spawn(move || engine.prewarm_category(&category))
    }

    /// Resolve one chain step against the extent it will run on. The blend
    /// image fetched here is the one the step runs with.
    pub(crate) fn resolve_step(&self, key: &str, extent: Extent) -> ResolvedStep {
        let blend = self.blend_for(key, extent);
        let mut fingerprint = self.pool().parameter_fingerprint(key);
        if self.catalog().kind_of(key) == Some(OperationKind::Preset) {
            let mut hasher = DefaultHasher::new();
            fingerprint.hash(&mut hasher);
            self.hash_preset_steps(key, &mut hasher, &mut Vec::new());
            fingerprint = hasher.finish();
        }
        ResolvedStep {
            key: StepKey::new(key, fingerprint).with_secondary(blend.as_ref().map(Image::id)),
            blend,
        }
    }

    /// Sub-operation parameters change a preset's output too, down through
    /// nested presets
    fn hash_preset_steps(
        &self,
        key: &str,
        hasher: &mut DefaultHasher,
        visiting: &mut Vec<String>,
    ) {
        if visiting.iter().any(|k| k == key) {
            return;
        }
        let Ok(desc) = self.presets().expand(key) else {
            return;
        };
        visiting.push(key.to_string());
        for step in &desc.steps {
            step.operation_key.hash(hasher);
            self.pool().parameter_fingerprint(&step.operation_key).hash(hasher);
            if self.catalog().kind_of(&step.operation_key) == Some(OperationKind::Preset) {
                self.hash_preset_steps(&step.operation_key, hasher, visiting);
            }
        }
        visiting.pop();
    }

    fn blend_for(&self, key: &str, extent: Extent) -> Option<Image> {
        if self.catalog().kind_of(key) != Some(OperationKind::Blend) {
            return None;
        }
        self.inner.blend_source.as_ref()?.blend_image(extent)
    }

    /// Run one chain entry on the running image
    pub(crate) fn run_entry(&self, key: &str, running: &Image, ctx: &mut FoldContext) -> Result<Image> {
        let blend = self.blend_for(key, running.extent());
        self.run_operation(key, running, blend, &ParameterValues::new(), &[], ctx)
    }

    /// Run a step resolved by [`resolve_step`](Self::resolve_step)
    pub(crate) fn run_resolved(
        &self,
        step: &ResolvedStep,
        running: &Image,
        ctx: &mut FoldContext,
    ) -> Result<Image> {
        let blend = step.blend.clone();
        self.run_operation(&step.key.key, running, blend, &ParameterValues::new(), &[], ctx)
    }

    fn run_operation(
        &self,
        key: &str,
        running: &Image,
        blend: Option<Image>,
        overrides: &ParameterValues,
        extent_bound: &[String],
        ctx: &mut FoldContext,
    ) -> Result<Image> {
        let handle = match self.pool().acquire(key) {
            Ok(handle) => handle,
            Err(FilterError::ConstructionFailed { key, reason })
                if self.config().on_construction_failure == FailurePolicy::Skip =>
            {
                tracing::warn!("Skipping {}: {}", key, reason);
                return Ok(running.clone());
            }
            Err(e) => return Err(e),
        };

        match handle.definition().kind {
            OperationKind::Preset => {
                let explicit = overrides
                    .float(INTENSITY_PARAMETER)
                    .or_else(|| handle.parameters().float(INTENSITY_PARAMETER));
                drop(handle);
                let intensity = match explicit {
                    Some(v) => v,
                    None => self.presets().expand(key)?.intensity,
                };
                self.presets().apply(self, key, running, intensity, ctx)
            }
            OperationKind::Blend => match blend {
                Some(secondary) => {
                    Ok(self.run_kernel(&handle, running, Some(&secondary), overrides, extent_bound))
                }
                None => {
                    tracing::warn!("No blend image for {}, passing through", key);
                    Ok(running.clone())
                }
            },
            OperationKind::MaskedRegion => {
                let adjusted = self.run_kernel(&handle, running, None, overrides, extent_bound);
                let regions = self.regions_for(handle.definition(), ctx);
                Ok(self.composer().compose(&adjusted, running, &regions).into_image())
            }
            OperationKind::SingleInput | OperationKind::Lookup => {
                Ok(self.run_kernel(&handle, running, None, overrides, extent_bound))
            }
        }
    }

    /// Kernel failures degrade the step to a pass-through
    fn run_kernel(
        &self,
        handle: &InstanceHandle,
        running: &Image,
        secondary: Option<&Image>,
        overrides: &ParameterValues,
        extent_bound: &[String],
    ) -> Image {
        match handle.run(running, secondary, overrides, extent_bound) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("Operation {} failed, passing through: {}", handle.key(), e);
                running.clone()
            }
        }
    }

    /// Regions of the fold's base image the definition is confined to
    fn regions_for(&self, definition: &OperationDefinition, ctx: &FoldContext) -> Vec<FeatureRegion> {
        let detected = self.regions().regions_for(&ctx.base, ctx.orientation);
        detected
            .iter()
            .filter(|r| definition.features.is_empty() || definition.features.contains(&r.feature))
            .cloned()
            .collect()
    }
}

impl StepRunner for Engine {
    fn run_step(&self, step: &PresetStep, running: &Image, ctx: &mut FoldContext) -> Result<Image> {
        let definition = match self.catalog().lookup(&step.operation_key) {
            Ok(def) => def,
            Err(_) => {
                tracing::warn!("Preset step {} is not a known operation, skipping", step.operation_key);
                return Ok(running.clone());
            }
        };

        let mut overrides = ParameterValues::new();
        for (key, value) in step.overrides.iter() {
            if definition.parameter(key).is_some() {
                overrides.set(key, value.clone());
            } else {
                tracing::warn!("Invalid parameter {} for {}", key, step.operation_key);
            }
        }
        let blend = self.blend_for(&step.operation_key, running.extent());
        self.run_operation(&step.operation_key, running, blend, &overrides, &step.extent_bound, ctx)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("operations", &self.catalog().len())
            .field("config", self.config())
            .finish()
    }
}
