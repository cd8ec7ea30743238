//! # Errors
//!
//! Engine-level error taxonomy. Kernel failures use [`OperationError`]
//! (see `operation.rs`) and are degraded to pass-through steps by the
//! chain, so they rarely surface here.

use thiserror::Error;

use crate::definition::OperationKind;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FilterError {
    #[error("Unknown operation key: {0}")]
    UnknownKey(String),
    #[error("Operation {key} already registered as {existing:?}, cannot re-register as {requested:?}")]
    DuplicateKey {
        key: String,
        existing: OperationKind,
        requested: OperationKind,
    },
    #[error("Operation {key} has no parameter {parameter}")]
    UnknownParameter { key: String, parameter: String },
    #[error("Could not construct operation {key}: {reason}")]
    ConstructionFailed { key: String, reason: String },
    #[error("Preset not found: {0}")]
    PresetNotFound(String),
    #[error("No preview operation set")]
    NoPreviewSet,
    #[error("No facial features found")]
    NoFeaturesFound,
    #[error("Index {requested} out of range (chain has {len} committed entries)")]
    IndexOutOfRange { requested: usize, len: usize },
    #[error("Invalid definition for {key}: {reason}")]
    InvalidDefinition { key: String, reason: String },
    #[error("Invalid preset {key}: {reason}")]
    InvalidPreset { key: String, reason: String },
    #[error("Configuration error: {0}")]
    Config(String),
}

impl FilterError {
    /// True for errors caused by a key that simply does not exist.
    pub fn is_missing_key(&self) -> bool {
        matches!(self, Self::UnknownKey(_) | Self::PresetNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
