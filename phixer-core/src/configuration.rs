//! # Catalog Configuration
//!
//! Startup source of operation definitions, category assignments,
//! collections and preset documents. [`JsonConfiguration`] reads the
//! application's JSON configuration file:
//!
//! ```json
//! {
//!   "version":    { "id": 1.2, "overwrite": false },
//!   "operations": [ { "key": "vignette", "kind": "single_input", "parameters": [...] } ],
//!   "lookup":     [ { "key": "film", "image": "film.png", "hide": false, "rating": 0, "slow": false } ],
//!   "preset":     [ { "key": "sepia_preset", "title": "Sepia" } ],
//!   "slow":       [ "vignette" ],
//!   "categories": [ { "key": "color", "title": "Colour", "filters": ["film"] } ],
//!   "collections": [ { "key": "edit", "title": "Edit", "categories": ["color"] } ],
//!   "presets":    { "sepia_preset": { "intensity": 0.5, "filters": [...] } },
//!   "preset_dir": "presets"
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::definition::{OperationDefinition, OperationKind};
use crate::error::{FilterError, Result};

/// Category assignment as configured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub key: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub filters: Vec<String>,
}

/// Collection of categories as configured, in display order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub key: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub categories: Vec<String>,
}

/// Raw catalog entries, category assignments and preset documents
pub trait ConfigurationSource: Send + Sync {
    fn definitions(&self) -> Vec<OperationDefinition>;

    fn categories(&self) -> Vec<CategoryConfig>;

    fn collections(&self) -> Vec<CollectionConfig> {
        Vec::new()
    }

    /// Preset document (JSON text) for `key`, if the source has one
    fn preset_document(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigVersion {
    pub id: f32,
    /// Whether this file should replace previously persisted settings
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct LookupEntry {
    key: String,
    image: String,
    title: Option<String>,
    hide: bool,
    rating: i32,
    slow: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PresetEntry {
    key: String,
    title: Option<String>,
    hide: bool,
    rating: i32,
    slow: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigDocument {
    version: ConfigVersion,
    operations: Vec<OperationDefinition>,
    lookup: Vec<LookupEntry>,
    preset: Vec<PresetEntry>,
    slow: Vec<String>,
    categories: Vec<CategoryConfig>,
    collections: Vec<CollectionConfig>,
    presets: HashMap<String, serde_json::Value>,
    preset_dir: Option<PathBuf>,
}

// ============================================================================
// JSON Configuration
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct JsonConfiguration {
    version: ConfigVersion,
    definitions: Vec<OperationDefinition>,
    categories: Vec<CategoryConfig>,
    collections: Vec<CollectionConfig>,
    presets: HashMap<String, String>,
    preset_dir: Option<PathBuf>,
}

impl JsonConfiguration {
    pub fn from_str(json: &str) -> Result<Self> {
        let doc: ConfigDocument =
            serde_json::from_str(json).map_err(|e| FilterError::Config(e.to_string()))?;
        Ok(Self::from_document(doc))
    }

    /// Load a configuration file. A relative `preset_dir` is resolved
    /// against the file's directory.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let mut config = Self::from_str(&text)
            .with_context(|| format!("parsing configuration {}", path.display()))?;

        if let (Some(dir), Some(parent)) = (&config.preset_dir, path.parent()) {
            if dir.is_relative() {
                config.preset_dir = Some(parent.join(dir));
            }
        }
        tracing::info!(
            "Loaded configuration {} (version {}, {} operations)",
            path.display(),
            config.version.id,
            config.definitions.len()
        );
        Ok(config)
    }

    fn from_document(doc: ConfigDocument) -> Self {
        let mut definitions = doc.operations;

        for entry in doc.lookup {
            let mut def = OperationDefinition::new(&entry.key, OperationKind::Lookup)
                .with_lookup(&entry.image);
            if let Some(title) = &entry.title {
                def.title = title.clone();
            }
            def.hidden = entry.hide;
            def.rating = entry.rating;
            def.slow = entry.slow;
            definitions.push(def);
        }

        for entry in doc.preset {
            let mut def = OperationDefinition::new(&entry.key, OperationKind::Preset);
            if let Some(title) = &entry.title {
                def.title = title.clone();
            }
            def.hidden = entry.hide;
            def.rating = entry.rating;
            def.slow = entry.slow;
            definitions.push(def);
        }

        for key in &doc.slow {
            match definitions.iter_mut().find(|d| &d.key == key) {
                Some(def) => def.slow = true,
                None => tracing::warn!("Slow list names unknown operation {}", key),
            }
        }

        let presets = doc
            .presets
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect();

        Self {
            version: doc.version,
            definitions,
            categories: doc.categories,
            collections: doc.collections,
            presets,
            preset_dir: doc.preset_dir,
        }
    }

    pub fn version(&self) -> ConfigVersion {
        self.version
    }

    pub fn preset_dir(&self) -> Option<&Path> {
        self.preset_dir.as_deref()
    }

    pub fn with_preset_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.preset_dir = Some(dir.into());
        self
    }
}

impl ConfigurationSource for JsonConfiguration {
    fn definitions(&self) -> Vec<OperationDefinition> {
        self.definitions.clone()
    }

    fn categories(&self) -> Vec<CategoryConfig> {
        self.categories.clone()
    }

    fn collections(&self) -> Vec<CollectionConfig> {
        self.collections.clone()
    }

    fn preset_document(&self, key: &str) -> Option<String> {
        if let Some(doc) = self.presets.get(key) {
            return Some(doc.clone());
        }
        let path = self.preset_dir.as_ref()?.join(format!("{}.json", key));
        match std::fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::debug!("No preset file {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "version": { "id": 2.1, "overwrite": true },
        "operations": [
            { "key": "vignette", "kind": "single_input",
              "parameters": [{ "key": "radius", "type": "distance", "max": 500, "default": 100 }] }
        ],
        "lookup": [ { "key": "film", "image": "film.png", "rating": 3 } ],
        "preset": [ { "key": "sepia_preset", "title": "Sepia", "hide": true } ],
        "slow": [ "vignette", "nothing" ],
        "categories": [ { "key": "color", "title": "Colour", "filters": ["film", "sepia_preset"] } ],
        "collections": [ { "key": "edit", "title": "Edit", "categories": ["color"] }, { "key": "bare" } ],
        "presets": { "sepia_preset": { "intensity": 0.5, "filters": [] } }
    }"#;

    #[test]
    fn test_sections_become_definitions() {
        let config = JsonConfiguration::from_str(CONFIG).unwrap();
        assert_eq!(config.version().id, 2.1);
        assert!(config.version().overwrite);

        let defs = config.definitions();
        assert_eq!(defs.len(), 3);
        let vignette = defs.iter().find(|d| d.key == "vignette").unwrap();
        assert!(vignette.slow);
        let film = defs.iter().find(|d| d.key == "film").unwrap();
        assert_eq!(film.kind, OperationKind::Lookup);
        assert_eq!(film.lookup.as_deref(), Some("film.png"));
        assert_eq!(film.rating, 3);
        let sepia = defs.iter().find(|d| d.key == "sepia_preset").unwrap();
        assert_eq!(sepia.kind, OperationKind::Preset);
        assert_eq!(sepia.title, "Sepia");
        assert!(sepia.hidden);

        assert_eq!(config.categories()[0].filters.len(), 2);
        let collections = config.collections();
        assert_eq!(collections[0].categories, vec!["color"]);
        assert_eq!(collections[1].key, "bare");
        assert!(collections[1].title.is_empty());
        let doc = config.preset_document("sepia_preset").unwrap();
        assert!(doc.contains("intensity"));
        assert!(config.preset_document("unknown").is_none());
    }

    #[test]
    fn test_malformed_config() {
        assert!(matches!(
            JsonConfiguration::from_str("{ not json"),
            Err(FilterError::Config(_))
        ));
    }

    #[test]
    fn test_from_path_resolves_preset_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("presets")).unwrap();
        std::fs::write(
            dir.path().join("presets").join("noir.json"),
            r#"{ "filters": [] }"#,
        )
        .unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "preset": [ { "key": "noir" } ], "preset_dir": "presets" }"#,
        )
        .unwrap();

        let config = JsonConfiguration::from_path(&path).unwrap();
        assert_eq!(config.preset_dir(), Some(dir.path().join("presets").as_path()));
        assert_eq!(
            config.preset_document("noir").as_deref(),
            Some(r#"{ "filters": [] }"#)
        );
    }

    #[test]
    fn test_from_path_reports_file() {
        let err = JsonConfiguration::from_path("/nonexistent/phixer.json").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/phixer.json"));
    }
}
