//! # Operation Definitions
//!
//! Immutable catalog metadata for one operation key. Only the
//! [`OperationFlags`] are user-toggleable after the catalog is loaded.

use serde::{Deserialize, Serialize};

use crate::params::ParameterSpec;
use crate::regions::FacialFeature;

/// Key of the implicit preset intensity parameter
pub const INTENSITY_PARAMETER: &str = "intensity";

/// Closed set of operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// One input image, one output image
    SingleInput,
    /// Needs a secondary (blend) image
    Blend,
    /// Colour lookup table driven
    Lookup,
    /// Expands into a sub-chain
    Preset,
    /// Confined to detected face regions
    MaskedRegion,
}

impl OperationKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SingleInput => "single",
            Self::Blend => "blend",
            Self::Lookup => "lookup",
            Self::Preset => "preset",
            Self::MaskedRegion => "masked",
        }
    }

    /// Kinds whose instances hold a kernel built by the factory
    pub fn needs_kernel(&self) -> bool {
        !matches!(self, Self::Preset)
    }
}

/// User-toggleable flags, persisted by an external store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationFlags {
    pub hidden: bool,
    pub rating: i32,
    pub slow: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDefinition {
    pub key: String,
    #[serde(default)]
    pub title: String,
    pub kind: OperationKind,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default, alias = "hide")]
    pub hidden: bool,
    #[serde(default)]
    pub rating: i32,
    #[serde(default)]
    pub slow: bool,
    /// Lookup image name (Lookup kind)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<String>,
    /// Regions a masked operation is confined to (empty = all detected)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<FacialFeature>,
}

impl OperationDefinition {
    pub fn new(key: &str, kind: OperationKind) -> Self {
        Self {
            key: key.to_string(),
            title: key.to_string(),
            kind,
            parameters: Vec::new(),
            hidden: false,
            rating: 0,
            slow: false,
            lookup: None,
            features: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn with_parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn with_lookup(mut self, image: &str) -> Self {
        self.lookup = Some(image.to_string());
        self
    }

    pub fn with_features(mut self, features: &[FacialFeature]) -> Self {
        self.features = features.to_vec();
        self
    }

    pub fn slow(mut self) -> Self {
        self.slow = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.key == key)
    }

    pub fn flags(&self) -> OperationFlags {
        OperationFlags {
            hidden: self.hidden,
            rating: self.rating,
            slow: self.slow,
        }
    }

    pub fn apply_flags(&mut self, flags: OperationFlags) {
        self.hidden = flags.hidden;
        self.rating = flags.rating;
        self.slow = flags.slow;
    }

    /// Check invariants and add implied parameters
    pub(crate) fn normalize(mut self) -> Result<Self, String> {
        if self.key.is_empty() {
            return Err("empty key".into());
        }
        if self.title.is_empty() {
            self.title = self.key.clone();
        }
        for spec in &self.parameters {
            spec.validate()?;
        }
        if self.kind == OperationKind::Preset && self.parameter(INTENSITY_PARAMETER).is_none() {
            let mut intensity = ParameterSpec::float(INTENSITY_PARAMETER, 0.0, 1.0, 1.0);
            intensity.title = "Intensity".into();
            self.parameters.push(intensity);
        }
        if self.kind == OperationKind::Lookup && self.lookup.is_none() {
            tracing::warn!("Lookup operation {} has no lookup image", self.key);
        }
        Ok(self)
    }

    /// Same definition apart from the user-toggleable flags
    pub(crate) fn same_content(&self, other: &OperationDefinition) -> bool {
        let mut a = self.clone();
        a.apply_flags(other.flags());
        a == *other
    }
}
