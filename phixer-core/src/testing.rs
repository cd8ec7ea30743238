//! Shared test fixtures: toy kernels, a counting factory, a scripted
//! detector and a small configured engine.
//!
//! Every toy kernel touches one channel so tests can tell steps apart:
//! brightness adds to red, saturation scales green, warmth adds to blue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use image::{Rgba, RgbaImage};
use parking_lot::Mutex;

use crate::catalog::OperationCatalog;
use crate::config::EngineConfig;
use crate::configuration::{ConfigurationSource, JsonConfiguration};
use crate::definition::{OperationDefinition, OperationKind};
use crate::engine::{BlendSource, Engine, EngineBuilder, StaticBlend};
use crate::operation::{from_fn, ImageOperation, OperationError, OperationFactory, OperationRegistry};
use crate::picture::{Extent, Image, Point};
use crate::regions::{FacialFeature, FeatureDetector, FeatureRegion, Orientation};

pub const TEST_CONFIG: &str = r#"{
    "version": { "id": 1.0 },
    "operations": [
        { "key": "brightness", "kind": "single_input",
          "parameters": [{ "key": "amount", "type": "float", "min": 0, "max": 1, "default": 0.1 }] },
        { "key": "saturation", "kind": "single_input",
          "parameters": [{ "key": "amount", "type": "float", "min": 0, "max": 2, "default": 1 }] },
        { "key": "warmth", "kind": "single_input",
          "parameters": [{ "key": "amount", "type": "float", "min": 0, "max": 1, "default": 0 }] },
        { "key": "double", "kind": "single_input" },
        { "key": "add", "kind": "single_input",
          "parameters": [{ "key": "amount", "type": "float", "min": 0, "max": 255, "default": 0 }] },
        { "key": "blend", "kind": "blend" },
        { "key": "lips", "kind": "masked_region", "features": ["outer_lips"] },
        { "key": "eyes", "kind": "masked_region", "features": ["left_eye", "right_eye"] },
        { "key": "broken", "kind": "single_input" },
        { "key": "ghost", "kind": "single_input" },
        { "key": "slowpoke", "kind": "single_input" },
        { "key": "secret", "kind": "single_input", "hide": true }
    ],
    "lookup": [ { "key": "film", "image": "film.png" } ],
    "preset": [
        { "key": "sepia_preset", "title": "Sepia" },
        { "key": "tint_preset" },
        { "key": "layered_preset" },
        { "key": "loop_preset" }
    ],
    "slow": [ "slowpoke" ],
    "categories": [
        { "key": "color", "title": "Colour", "filters": ["brightness", "saturation", "warmth", "sepia_preset"] },
        { "key": "face", "title": "Face", "filters": ["lips", "eyes"] }
    ],
    "collections": [
        { "key": "edit", "title": "Edit", "categories": ["face", "color", "missing"] }
    ],
    "presets": {
        "sepia_preset": { "intensity": 0.5, "filters": [
            { "key": "saturation", "parameters": [ { "key": "amount", "val": 0.0, "type": "CIAttributeTypeScalar" } ] },
            { "key": "warmth", "parameters": [ { "key": "amount", "val": 0.3, "type": "CIAttributeTypeScalar" } ] }
        ] },
        "tint_preset": { "filters": [ { "key": "brightness" } ] },
        "layered_preset": { "filters": [ { "key": "tint_preset" }, { "key": "double" } ] },
        "loop_preset": { "filters": [ { "key": "double" }, { "key": "loop_preset" } ] }
    }
}"#;

/// Red value of the test blend image
pub const BLEND_RED: u8 = 200;

// ============================================================================
// Toy Kernels
// ============================================================================

pub fn add_red(img: &Image, amount: u8) -> Image {
    img.map_pixels(|mut p| {
        p.0[0] = p.0[0].saturating_add(amount);
        p
    })
}

pub fn brighten(img: &Image, amount: f32) -> Image {
    add_red(img, (amount * 100.0).round() as u8)
}

pub fn saturate(img: &Image, amount: f32) -> Image {
    img.map_pixels(|mut p| {
        p.0[1] = (p.0[1] as f32 * amount).round().clamp(0.0, 255.0) as u8;
        p
    })
}

pub fn warm(img: &Image, amount: f32) -> Image {
    img.map_pixels(|mut p| {
        p.0[2] = p.0[2].saturating_add((amount * 100.0).round() as u8);
        p
    })
}

pub fn double_red(img: &Image) -> Image {
    img.map_pixels(|mut p| {
        p.0[0] = p.0[0].saturating_mul(2);
        p
    })
}

fn amount_kernel(f: fn(&Image, f32) -> Image) -> Box<dyn ImageOperation> {
    from_fn(move |img, _, params| Ok(f(img, params.float("amount").unwrap_or(0.0))))
}

fn blend_kernel() -> Box<dyn ImageOperation> {
    from_fn(|img, secondary, _| {
        let secondary = secondary.ok_or(OperationError::MissingSecondary)?;
        let (a, b) = (img.pixels(), secondary.pixels());
        let out = RgbaImage::from_fn(a.width(), a.height(), |x, y| {
            let mut p = *a.get_pixel(x, y);
            if let Some(q) = b.get_pixel_checked(x, y) {
                p.0[0] = ((p.0[0] as u16 + q.0[0] as u16) / 2) as u8;
            }
            p
        });
        Ok(Image::new(out))
    })
}

fn paint_red() -> Box<dyn ImageOperation> {
    from_fn(|img, _, _| {
        Ok(img.map_pixels(|mut p| {
            p.0[0] = 255;
            p
        }))
    })
}

fn invert() -> Box<dyn ImageOperation> {
    from_fn(|img, _, _| {
        Ok(img.map_pixels(|p| Rgba([255 - p.0[0], 255 - p.0[1], 255 - p.0[2], p.0[3]])))
    })
}

/// Registry with a kernel for every test operation except `ghost`
pub fn test_registry() -> OperationRegistry {
    let mut registry = OperationRegistry::with_builtins();
    registry
        .register("brightness", |_| Some(amount_kernel(brighten)))
        .register("saturation", |_| Some(amount_kernel(saturate)))
        .register("warmth", |_| Some(amount_kernel(warm)))
        .register("add", |_| {
            Some(amount_kernel(|img, amount| add_red(img, amount as u8)))
        })
        .register("double", |_| Some(from_fn(|img, _, _| Ok(double_red(img)))))
        .register("blend", |_| Some(blend_kernel()))
        .register("lips", |_| Some(paint_red()))
        .register("eyes", |_| Some(paint_red()))
        .register("broken", |_| {
            Some(from_fn(|_, _, _| Err(OperationError::ProcessingFailed("boom".into()))))
        })
        .register("slowpoke", |_| Some(from_fn(|img, _, _| Ok(add_red(img, 1)))))
        .register("secret", |_| Some(from_fn(|img, _, _| Ok(add_red(img, 2)))))
        .register_kind(OperationKind::Lookup, |_| Some(invert()));
    registry
}

// ============================================================================
// Factory / Detector
// ============================================================================

/// Factory that counts constructions per key, optionally slowly
pub struct CountingFactory {
    registry: OperationRegistry,
    counts: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl CountingFactory {
    pub fn new() -> Self {
        Self {
            registry: test_registry(),
            counts: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn constructions(&self, key: &str) -> usize {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }
}

impl OperationFactory for CountingFactory {
    fn construct(&self, definition: &OperationDefinition) -> Option<Box<dyn ImageOperation>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        *self.counts.lock().entry(definition.key.clone()).or_insert(0) += 1;
        self.registry.construct(definition)
    }

    fn supports(&self, definition: &OperationDefinition) -> bool {
        self.registry.supports(definition)
    }
}

/// Detector reporting fixed features over the left half of every image.
/// When orientation aware, any orientation but `Up` moves them to the
/// right half.
pub struct ScriptedDetector {
    features: Vec<FacialFeature>,
    delay: Option<Duration>,
    orientation_aware: bool,
    calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(features: &[FacialFeature]) -> Self {
        Self {
            features: features.to_vec(),
            delay: None,
            orientation_aware: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn lips() -> Self {
        Self::new(&[FacialFeature::OuterLips])
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Some(Duration::from_millis(ms));
        self
    }

    pub fn orientation_aware(mut self) -> Self {
        self.orientation_aware = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FeatureDetector for ScriptedDetector {
    fn detect(&self, image: &Image, orientation: Orientation) -> Vec<FeatureRegion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let extent = image.extent();
        let (w, h) = (extent.width as f32 / 2.0, extent.height as f32);
        let left = if self.orientation_aware && orientation != Orientation::Up {
            w
        } else {
            0.0
        };
        self.features
            .iter()
            .map(|f| {
                FeatureRegion::new(
                    *f,
                    vec![
                        Point::new(left, 0.0),
                        Point::new(left + w, 0.0),
                        Point::new(left + w, h),
                        Point::new(left, h),
                    ],
                )
            })
            .collect()
    }
}

/// Blend source whose image can be replaced; it has nothing for an empty extent
pub struct SwappableBlend {
    image: Mutex<Image>,
}

impl SwappableBlend {
    pub fn new(image: Image) -> Self {
        Self {
            image: Mutex::new(image),
        }
    }

    pub fn swap(&self, image: Image) {
        *self.image.lock() = image;
    }
}

impl BlendSource for SwappableBlend {
    fn blend_image(&self, extent: Extent) -> Option<Image> {
        if extent.is_empty() {
            return None;
        }
        Some(self.image.lock().clone())
    }
}

// ============================================================================
// Engine Fixtures
// ============================================================================

static LOGGING: Once = Once::new();

/// Route `tracing` output to the test harness (filtered by `RUST_LOG`)
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn test_configuration() -> JsonConfiguration {
    match JsonConfiguration::from_str(TEST_CONFIG) {
        Ok(config) => config,
        Err(e) => panic!("test configuration is invalid: {}", e),
    }
}

/// Catalog holding the test configuration's definitions
pub fn test_catalog() -> OperationCatalog {
    let catalog = OperationCatalog::new();
    for def in test_configuration().definitions() {
        if let Err(e) = catalog.register(def) {
            panic!("test definition rejected: {}", e);
        }
    }
    catalog
}

/// Engine plus the factory it constructs through
pub fn counted_engine(config: EngineConfig) -> (Engine, Arc<CountingFactory>) {
    init_test_logging();
    let factory = Arc::new(CountingFactory::new());
    let engine = EngineBuilder::new()
        .configuration(test_configuration())
        .factory(factory.clone())
        .detector(Arc::new(ScriptedDetector::lips()))
        .blend_source(Arc::new(StaticBlend::new(Image::solid(2, 2, [BLEND_RED, 0, 0, 255]))))
        .config(config)
        .build();
    match engine {
        Ok(engine) => (engine, factory),
        Err(e) => panic!("test engine failed to build: {}", e),
    }
}

/// Test configuration with a custom detector and blend source
pub fn engine_with_sources(
    detector: Arc<dyn FeatureDetector>,
    blend: Arc<dyn BlendSource>,
) -> Engine {
    init_test_logging();
    let engine = EngineBuilder::new()
        .configuration(test_configuration())
        .factory(Arc::new(CountingFactory::new()))
        .detector(detector)
        .blend_source(blend)
        .build();
    match engine {
        Ok(engine) => engine,
        Err(e) => panic!("test engine failed to build: {}", e),
    }
}

pub fn test_engine_with(config: EngineConfig) -> Engine {
    counted_engine(config).0
}

pub fn test_engine() -> Engine {
    test_engine_with(EngineConfig::default())
}
