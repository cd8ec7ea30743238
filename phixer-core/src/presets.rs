//! # Presets
//!
//! A preset is a named, declarative sub-chain:
//!
//! ```json
//! {
//!   "intensity": 0.5,
//!   "filters": [
//!     { "key": "saturation", "parameters": [ { "key": "amount", "val": 0.0, "type": "CIAttributeTypeScalar" } ] },
//!     { "key": "vignette",   "parameters": [ { "key": "center", "val": [0, 0], "type": "CIAttributeTypePosition" } ] }
//!   ]
//! }
//! ```
//!
//! Position, distance and rectangle parameters are always bound to the
//! running image rather than taken from the document. Descriptions are
//! parsed once and cached. Steps are run by a [`StepRunner`] (the engine),
//! so preset steps resolve through the same catalog and pool as chain
//! entries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use crate::composite::dissolve;
use crate::configuration::ConfigurationSource;
use crate::error::{FilterError, Result};
use crate::params::{ParameterType, ParameterValue, ParameterValues};
use crate::picture::{Image, Point};
use crate::regions::Orientation;

// ============================================================================
// Description
// ============================================================================

#[derive(Debug, Deserialize)]
struct PresetDocument {
    #[serde(default = "full_intensity")]
    intensity: f32,
    #[serde(default)]
    filters: Vec<StepDocument>,
}

#[derive(Debug, Deserialize)]
struct StepDocument {
    key: String,
    #[serde(default)]
    parameters: Vec<ParameterDocument>,
}

#[derive(Debug, Deserialize)]
struct ParameterDocument {
    key: String,
    #[serde(default)]
    val: serde_json::Value,
    #[serde(rename = "type", default)]
    param_type: String,
}

fn full_intensity() -> f32 {
    1.0
}

/// One operation of a preset
#[derive(Debug, Clone, PartialEq)]
pub struct PresetStep {
    pub operation_key: String,
    /// Values taken from the document
    pub overrides: ParameterValues,
    /// Parameters bound to the running image extent
    pub extent_bound: Vec<String>,
}

impl PresetStep {
    pub fn new(operation_key: &str) -> Self {
        Self {
            operation_key: operation_key.to_string(),
            overrides: ParameterValues::new(),
            extent_bound: Vec::new(),
        }
    }

    pub fn with(mut self, key: &str, value: ParameterValue) -> Self {
        self.overrides.set(key, value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresetDescription {
    pub key: String,
    pub steps: Vec<PresetStep>,
    pub intensity: f32,
}

impl PresetDescription {
    pub fn parse(key: &str, json: &str) -> Result<Self> {
        let doc: PresetDocument = serde_json::from_str(json).map_err(|e| FilterError::InvalidPreset {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let steps = doc
            .filters
            .into_iter()
            .map(|step| parse_step(key, step))
            .collect();

        Ok(Self {
            key: key.to_string(),
            steps,
            intensity: doc.intensity.clamp(0.0, 1.0),
        })
    }

    pub fn operation_keys(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.operation_key.clone()).collect()
    }
}

fn parse_step(preset: &str, doc: StepDocument) -> PresetStep {
    let mut step = PresetStep::new(&doc.key);
    for param in doc.parameters {
        match ParameterType::from_attribute(&param.param_type) {
            ParameterType::Float => match number(&param.val) {
                Some(v) => step.overrides.set(&param.key, ParameterValue::Float(v)),
                None => tracing::warn!(
                    "Preset {}: non-numeric value for {}.{}",
                    preset,
                    doc.key,
                    param.key
                ),
            },
            ParameterType::Vector => {
                let values: Vec<f32> = param
                    .val
                    .as_array()
                    .map(|a| a.iter().filter_map(number).collect())
                    .unwrap_or_default();
                // Two components are a coordinate
                let value = if values.len() == 2 {
                    ParameterValue::Position(Point::new(values[0], values[1]))
                } else {
                    ParameterValue::Vector(values)
                };
                step.overrides.set(&param.key, value);
            }
            ParameterType::Position | ParameterType::Distance | ParameterType::Rectangle => {
                step.extent_bound.push(param.key);
            }
            other => tracing::warn!(
                "Preset {}: ignoring parameter {} ({:?}) of {}",
                preset,
                param.key,
                other,
                doc.key
            ),
        }
    }
    step
}

/// Numbers may be written as JSON numbers or strings
fn number(value: &serde_json::Value) -> Option<f32> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(|v| v as f32),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ============================================================================
// Running
// ============================================================================

/// State of one fold through a chain, shared with nested presets
#[derive(Debug, Clone)]
pub struct FoldContext {
    /// Image the outermost fold started from
    pub base: Image,
    pub orientation: Orientation,
    /// Presets currently being expanded, outermost first
    expanding: Vec<String>,
    /// Set once a preset served a previous output instead of running
    stale: bool,
}

impl FoldContext {
    pub fn new(base: Image, orientation: Orientation) -> Self {
        Self {
            base,
            orientation,
            expanding: Vec::new(),
            stale: false,
        }
    }

    pub fn is_expanding(&self, key: &str) -> bool {
        self.expanding.iter().any(|k| k == key)
    }

    pub fn depth(&self) -> usize {
        self.expanding.len()
    }

    /// True if any output of this fold so far came from an overlapping
    /// preset run. Such outputs must not be cached.
    pub fn served_stale(&self) -> bool {
        self.stale
    }
}

/// Runs one preset step against the running image
pub trait StepRunner {
    fn run_step(&self, step: &PresetStep, running: &Image, ctx: &mut FoldContext) -> Result<Image>;
}

#[derive(Default)]
struct RunState {
    running: bool,
    last: Option<Image>,
}

/// Clears the running flag when a run ends, however it ends
struct RunGuard<'a> {
    runs: &'a Mutex<HashMap<String, RunState>>,
    key: &'a str,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.runs.lock().get_mut(self.key) {
            state.running = false;
        }
    }
}

pub struct PresetExpander {
    source: Arc<dyn ConfigurationSource>,
    descriptions: RwLock<HashMap<String, Arc<PresetDescription>>>,
    runs: Mutex<HashMap<String, RunState>>,
    epsilon: f32,
}

impl PresetExpander {
    pub fn new(source: Arc<dyn ConfigurationSource>, epsilon: f32) -> Self {
        Self {
            source,
            descriptions: RwLock::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            epsilon,
        }
    }

    /// Parsed description of `key`, cached after the first call
    pub fn expand(&self, key: &str) -> Result<Arc<PresetDescription>> {
        if let Some(desc) = self.descriptions.read().get(key) {
            return Ok(desc.clone());
        }

        let doc = self
            .source
            .preset_document(key)
            .ok_or_else(|| FilterError::PresetNotFound(key.to_string()))?;
        let parsed = Arc::new(PresetDescription::parse(key, &doc)?);
        tracing::debug!("Parsed preset {} ({} steps)", key, parsed.steps.len());

        let mut descriptions = self.descriptions.write();
        Ok(descriptions.entry(key.to_string()).or_insert(parsed).clone())
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.descriptions.read().contains_key(key)
    }

    /// Drop the cached description and last output of `key`
    pub fn forget(&self, key: &str) {
        self.descriptions.write().remove(key);
        self.runs.lock().remove(key);
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    /// Most recent completed output of `key`
    pub fn last_output(&self, key: &str) -> Option<Image> {
        self.runs.lock().get(key).and_then(|s| s.last.clone())
    }

    /// Run preset `key` on `base` and mix the result in by `intensity`.
    ///
    /// While a run of the same preset is in flight, other callers get the
    /// most recent completed output (or `base` if there is none) instead of
    /// waiting, and `ctx` is marked stale. A preset that appears inside its
    /// own expansion is skipped.
    pub fn apply(
        &self,
        runner: &dyn StepRunner,
        key: &str,
        base: &Image,
        intensity: f32,
        ctx: &mut FoldContext,
    ) -> Result<Image> {
        if intensity <= self.epsilon {
            tracing::debug!("Preset {} at zero intensity, not applied", key);
            return Ok(base.clone());
        }
        if ctx.is_expanding(key) {
            tracing::warn!("Preset {} contains itself, skipping nested expansion", key);
            return Ok(base.clone());
        }

        let description = self.expand(key)?;

        {
            let mut runs = self.runs.lock();
            let state = runs.entry(key.to_string()).or_default();
            if state.running {
                tracing::debug!("Preset {} already running, serving last output", key);
                ctx.stale = true;
                return Ok(state.last.clone().unwrap_or_else(|| base.clone()));
            }
            state.running = true;
        }
        let _guard = RunGuard {
            runs: &self.runs,
            key,
        };

        ctx.expanding.push(key.to_string());
        let filtered = description
            .steps
            .iter()
            .try_fold(base.clone(), |running, step| runner.run_step(step, &running, ctx));
        ctx.expanding.pop();
        let filtered = filtered?;

        let output = if intensity < 1.0 - self.epsilon {
            dissolve(base, &filtered, intensity)
        } else {
            filtered
        };

        if let Some(state) = self.runs.lock().get_mut(key) {
            state.last = Some(output.clone());
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::JsonConfiguration;
    use crate::testing::add_red;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    const PRESETS: &str = r#"{
        "presets": {
            "warm": { "intensity": 0.5, "filters": [
                { "key": "add", "parameters": [
                    { "key": "amount", "val": "40", "type": "CIAttributeTypeScalar" },
                    { "key": "center", "val": [1, 2], "type": "CIAttributeTypePosition" },
                    { "key": "offset", "val": ["3", "4"], "type": "CIAttributeTypeOffset" },
                    { "key": "transform", "val": 1, "type": "CIAttributeTypeTransform" }
                ] },
                { "key": "add", "parameters": [ { "key": "amount", "val": 20, "type": "CIAttributeTypeScalar" } ] }
            ] },
            "loop": { "filters": [ { "key": "loop" } ] },
            "broken": { "filters": 7 }
        }
    }"#;

    fn expander() -> PresetExpander {
        PresetExpander::new(Arc::new(JsonConfiguration::from_str(PRESETS).unwrap()), 0.01)
    }

    /// Adds the step's `amount` to the red channel; nested presets recurse
    struct AddRunner<'a> {
        presets: &'a PresetExpander,
        calls: AtomicUsize,
    }

    impl<'a> AddRunner<'a> {
        fn new(presets: &'a PresetExpander) -> Self {
            Self {
                presets,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl StepRunner for AddRunner<'_> {
        fn run_step(&self, step: &PresetStep, running: &Image, ctx: &mut FoldContext) -> Result<Image> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if step.operation_key == "loop" {
                return self.presets.apply(self, "loop", running, 1.0, ctx);
            }
            let amount = step.overrides.float("amount").unwrap_or(0.0);
            Ok(add_red(running, amount as u8))
        }
    }

    /// Blocks inside the first step until released
    struct GateRunner {
        started: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl StepRunner for GateRunner {
        fn run_step(&self, _step: &PresetStep, running: &Image, _ctx: &mut FoldContext) -> Result<Image> {
            if let Some(tx) = self.started.lock().take() {
                tx.send(()).unwrap();
                self.release.lock().recv().unwrap();
            }
            Ok(add_red(running, 10))
        }
    }

    #[test]
    fn test_parse_document() {
        let presets = expander();
        let desc = presets.expand("warm").unwrap();
        assert_eq!(desc.intensity, 0.5);
        assert_eq!(desc.operation_keys(), vec!["add", "add"]);

        let first = &desc.steps[0];
        assert_eq!(first.overrides.float("amount"), Some(40.0));
        assert_eq!(first.extent_bound, vec!["center".to_string()]);
        assert_eq!(
            first.overrides.get("offset"),
            Some(&ParameterValue::Position(Point::new(3.0, 4.0)))
        );
        assert!(!first.overrides.contains("transform"));
        assert!(!first.overrides.contains("center"));
    }

    #[test]
    fn test_expand_is_cached() {
        let presets = expander();
        let a = presets.expand("warm").unwrap();
        let b = presets.expand("warm").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(presets.is_cached("warm"));
        presets.forget("warm");
        assert!(!presets.is_cached("warm"));
    }

    #[test]
    fn test_missing_and_malformed() {
        let presets = expander();
        assert_eq!(
            presets.expand("sepia").err(),
            Some(FilterError::PresetNotFound("sepia".into()))
        );
        assert!(matches!(
            presets.expand("broken"),
            Err(FilterError::InvalidPreset { .. })
        ));
    }

    #[test]
    fn test_zero_intensity_is_identity() {
        let presets = expander();
        let runner = AddRunner::new(&presets);
        let img = Image::solid(2, 2, [10, 0, 0, 255]);
        let mut ctx = FoldContext::new(img.clone(), Orientation::Up);

        let out = presets.apply(&runner, "warm", &img, 0.0, &mut ctx).unwrap();
        assert!(out.same_handle(&img));
        assert!(!ctx.served_stale());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        // Zero intensity does not even need the document
        assert!(presets.apply(&runner, "sepia", &img, 0.0, &mut ctx).is_ok());
    }

    #[test]
    fn test_intensity_mix() {
        let presets = expander();
        let runner = AddRunner::new(&presets);
        let img = Image::solid(2, 2, [10, 0, 0, 255]);
        let mut ctx = FoldContext::new(img.clone(), Orientation::Up);

        let full = presets.apply(&runner, "warm", &img, 1.0, &mut ctx).unwrap();
        assert_eq!(full.pixels().get_pixel(0, 0).0[0], 70);

        let half = presets.apply(&runner, "warm", &img, 0.5, &mut ctx).unwrap();
        assert_eq!(half.pixels().get_pixel(0, 0).0[0], 40);
        assert_eq!(presets.last_output("warm"), Some(half));
    }

    #[test]
    fn test_cyclic_preset_returns_input() {
        let presets = expander();
        let runner = AddRunner::new(&presets);
        let img = Image::solid(1, 1, [0, 0, 0, 255]);
        let mut ctx = FoldContext::new(img.clone(), Orientation::Up);

        let out = presets.apply(&runner, "loop", &img, 1.0, &mut ctx).unwrap();
        assert_eq!(out, img);
        assert_eq!(ctx.depth(), 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_overlapping_call_serves_last_output() {
        let presets = expander();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let runner = GateRunner {
            started: Mutex::new(Some(started_tx)),
            release: Mutex::new(release_rx),
        };
        let img = Image::solid(1, 1, [0, 0, 0, 255]);

        let first = std::thread::scope(|s| {
            let worker = s.spawn(|| {
                let mut ctx = FoldContext::new(img.clone(), Orientation::Up);
                presets.apply(&runner, "warm", &img, 1.0, &mut ctx).unwrap()
            });
            started_rx.recv().unwrap();

            // Nothing completed yet: the input comes back unchanged
            let mut ctx = FoldContext::new(img.clone(), Orientation::Up);
            let during = presets.apply(&runner, "warm", &img, 1.0, &mut ctx).unwrap();
            assert!(during.same_handle(&img));
            assert!(ctx.served_stale());

            release_tx.send(()).unwrap();
            worker.join().unwrap()
        });
        assert_eq!(first.pixels().get_pixel(0, 0).0[0], 20);
        assert_eq!(presets.last_output("warm"), Some(first));
    }
}
