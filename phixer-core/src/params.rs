//! # Operation Parameters
//!
//! Parameter schema ([`ParameterSpec`]) and values ([`ParameterValues`]).
//! Only explicitly set values are stored; everything else is resolved at
//! run time from the schema defaults and the running image extent.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::picture::{Extent, Point, Rect};

// ============================================================================
// Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Float,
    Vector,
    Color,
    Position,
    Distance,
    Rectangle,
    Image,
    #[serde(other)]
    Unknown,
}

impl ParameterType {
    /// Numeric types carry a min/default/max range
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Float | Self::Distance)
    }

    /// Types whose value is derived from the image extent when not set
    pub fn is_extent_bound(&self) -> bool {
        matches!(self, Self::Position | Self::Distance | Self::Rectangle)
    }

    /// Parse either our own type names or CoreImage attribute type names
    pub fn from_attribute(name: &str) -> Self {
        match name {
            "float" | "CIAttributeTypeTime" | "CIAttributeTypeScalar" | "CIAttributeTypeAngle"
            | "CIAttributeTypeBoolean" | "CIAttributeTypeInteger" | "CIAttributeTypeCount" => {
                Self::Float
            }
            "distance" | "CIAttributeTypeDistance" => Self::Distance,
            "position" | "CIAttributeTypePosition" => Self::Position,
            // Rectangles given as attributes are plain 4-vectors
            "vector" | "CIAttributeTypePosition3" | "CIAttributeTypeOffset"
            | "CIAttributeTypeRectangle" | "CIAttributeTypeVector" => Self::Vector,
            "rectangle" => Self::Rectangle,
            "color" | "CIAttributeTypeColor" | "CIAttributeTypeOpaqueColor" => Self::Color,
            "image" | "CIAttributeTypeImage" => Self::Image,
            _ => Self::Unknown,
        }
    }
}

/// Schema entry for one operation parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub key: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub min: f32,
    #[serde(default = "default_max")]
    pub max: f32,
    #[serde(default)]
    pub default: f32,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
}

fn default_max() -> f32 {
    1.0
}

impl ParameterSpec {
    pub fn float(key: &str, min: f32, max: f32, default: f32) -> Self {
        Self {
            key: key.to_string(),
            title: key.to_string(),
            min,
            max,
            default,
            param_type: ParameterType::Float,
        }
    }

    pub fn of_type(key: &str, param_type: ParameterType) -> Self {
        Self {
            key: key.to_string(),
            title: key.to_string(),
            min: 0.0,
            max: 1.0,
            default: 0.0,
            param_type,
        }
    }

    /// Check `min <= default <= max` for numeric types
    pub fn validate(&self) -> Result<(), String> {
        if self.param_type.is_numeric() && !(self.min <= self.default && self.default <= self.max) {
            return Err(format!(
                "parameter {}: default {} outside [{}, {}]",
                self.key, self.default, self.min, self.max
            ));
        }
        Ok(())
    }

    pub fn clamp(&self, value: f32) -> f32 {
        if self.min <= self.max {
            value.clamp(self.min, self.max)
        } else {
            value
        }
    }

    /// Value used when nothing was set explicitly
    pub fn resolve_default(&self, extent: Extent) -> Option<ParameterValue> {
        match self.param_type {
            ParameterType::Float => Some(ParameterValue::Float(self.default)),
            ParameterType::Distance => Some(ParameterValue::Distance(self.default)),
            ParameterType::Position => Some(ParameterValue::Position(extent.center())),
            ParameterType::Rectangle => Some(ParameterValue::Rectangle(extent.rect())),
            _ => None,
        }
    }

    /// Value bound to the image extent (presets always use these)
    pub fn bind_extent(&self, extent: Extent) -> Option<ParameterValue> {
        match self.param_type {
            ParameterType::Position => Some(ParameterValue::Position(extent.center())),
            ParameterType::Distance => Some(ParameterValue::Distance(extent.radius())),
            ParameterType::Rectangle => Some(ParameterValue::Rectangle(extent.rect())),
            _ => None,
        }
    }
}

// ============================================================================
// Values
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterValue {
    Float(f32),
    Vector(Vec<f32>),
    Color([f32; 4]),
    Position(Point),
    Distance(f32),
    Rectangle(Rect),
    Image(String),
}

impl ParameterValue {
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(v) | Self::Distance(v) => Some(*v),
            _ => None,
        }
    }

    fn hash_into(&self, state: &mut impl Hasher) {
        fn bits(state: &mut impl Hasher, values: &[f32]) {
            for v in values {
                v.to_bits().hash(state);
            }
        }
        match self {
            Self::Float(v) => {
                0u8.hash(state);
                bits(state, &[*v]);
            }
            Self::Vector(v) => {
                1u8.hash(state);
                bits(state, v);
            }
            Self::Color(c) => {
                2u8.hash(state);
                bits(state, c);
            }
            Self::Position(p) => {
                3u8.hash(state);
                bits(state, &[p.x, p.y]);
            }
            Self::Distance(v) => {
                4u8.hash(state);
                bits(state, &[*v]);
            }
            Self::Rectangle(r) => {
                5u8.hash(state);
                bits(state, &[r.x, r.y, r.width, r.height]);
            }
            Self::Image(name) => {
                6u8.hash(state);
                name.hash(state);
            }
        }
    }
}

/// Parameter values keyed by parameter key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterValues(BTreeMap<String, ParameterValue>);

impl ParameterValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: ParameterValue) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: ParameterValue) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ParameterValue> {
        self.0.get(key)
    }

    pub fn float(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(ParameterValue::as_float)
    }

    pub fn remove(&mut self, key: &str) -> Option<ParameterValue> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.0.iter()
    }

    /// Values from `other` win over ours
    pub fn overlay(&mut self, other: &ParameterValues) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Fill in every value the schema can provide that was not set explicitly
    pub fn resolve(&self, specs: &[ParameterSpec], extent: Extent) -> ParameterValues {
        let mut resolved = self.clone();
        for spec in specs {
            if !resolved.contains(&spec.key) {
                if let Some(value) = spec.resolve_default(extent) {
                    resolved.0.insert(spec.key.clone(), value);
                }
            }
        }
        resolved
    }

    /// Stable hash of the explicit values, used in cache keys
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for (key, value) in &self.0 {
            key.hash(&mut hasher);
            value.hash_into(&mut hasher);
        }
        hasher.finish()
    }
}
