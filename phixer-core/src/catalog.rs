//! # Operation Catalog
//!
//! Registry of operation definitions, the categories they are filed under
//! and the collections grouping those categories. Populated once by the
//! engine builder; afterwards only the hidden / rating / slow flags and
//! category membership change.
//!
//! Listing is always ordered lexicographically by key so UI lists are
//! deterministic regardless of registration order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::definition::{OperationDefinition, OperationFlags, OperationKind};
use crate::error::{FilterError, Result};

/// Well-known category holding the user's favourites
pub const FAVOURITES: &str = "favorites";

/// Selection for [`OperationCatalog::list`]
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub category: Option<String>,
    pub include_hidden: bool,
}

impl ListFilter {
    pub fn category(category: &str) -> Self {
        Self {
            category: Some(category.to_string()),
            include_hidden: false,
        }
    }

    pub fn with_hidden(mut self) -> Self {
        self.include_hidden = true;
        self
    }
}

#[derive(Debug, Clone)]
struct Category {
    title: String,
    members: BTreeSet<String>,
}

/// Ordered group of categories
#[derive(Debug, Clone)]
struct Collection {
    title: String,
    categories: Vec<String>,
}

#[derive(Default)]
struct CatalogState {
    definitions: BTreeMap<String, Arc<OperationDefinition>>,
    categories: BTreeMap<String, Category>,
    collections: BTreeMap<String, Collection>,
}

pub struct OperationCatalog {
    state: RwLock<CatalogState>,
}

impl Default for OperationCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationCatalog {
    pub fn new() -> Self {
        let mut state = CatalogState::default();
        state.categories.insert(
            FAVOURITES.to_string(),
            Category {
                title: "Favourites".to_string(),
                members: BTreeSet::new(),
            },
        );
        Self {
            state: RwLock::new(state),
        }
    }

    // ------------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------------

    pub fn register(&self, definition: OperationDefinition) -> Result<()> {
        let key = definition.key.clone();
        let definition = definition
            .normalize()
            .map_err(|reason| FilterError::InvalidDefinition {
                key: key.clone(),
                reason,
            })?;

        let mut state = self.state.write();
        if let Some(existing) = state.definitions.get(&key) {
            if existing.kind != definition.kind {
                return Err(FilterError::DuplicateKey {
                    key,
                    existing: existing.kind,
                    requested: definition.kind,
                });
            }
            if **existing == definition {
                return Ok(());
            }
            if existing.same_content(&definition) {
                tracing::debug!("Updating flags for {}", key);
            } else {
                tracing::warn!("Overwriting definition for {}", key);
            }
        }
        state.definitions.insert(key, Arc::new(definition));
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Result<Arc<OperationDefinition>> {
        self.state
            .read()
            .definitions
            .get(key)
            .cloned()
            .ok_or_else(|| FilterError::UnknownKey(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.read().definitions.contains_key(key)
    }

    pub fn kind_of(&self, key: &str) -> Option<OperationKind> {
        self.state.read().definitions.get(key).map(|d| d.kind)
    }

    pub fn len(&self) -> usize {
        self.state.read().definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys matching `filter`, sorted by key
    pub fn list(&self, filter: &ListFilter) -> Vec<String> {
        let state = self.state.read();
        let visible = |key: &String| {
            state
                .definitions
                .get(key)
                .map(|d| filter.include_hidden || !d.hidden)
                .unwrap_or(false)
        };

        match &filter.category {
            None => state.definitions.keys().filter(|k| visible(k)).cloned().collect(),
            Some(category) => match state.categories.get(category) {
                Some(cat) => cat.members.iter().filter(|k| visible(k)).cloned().collect(),
                None => {
                    tracing::warn!("Invalid category: {}", category);
                    Vec::new()
                }
            },
        }
    }

    // ------------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------------

    fn update_flags(&self, key: &str, update: impl FnOnce(&mut OperationFlags)) {
        let mut state = self.state.write();
        match state.definitions.get_mut(key) {
            Some(def) => {
                let mut flags = def.flags();
                update(&mut flags);
                Arc::make_mut(def).apply_flags(flags);
            }
            None => tracing::warn!("Flag update for unknown key: {}", key),
        }
    }

    pub fn set_hidden(&self, key: &str, hidden: bool) {
        self.update_flags(key, |f| f.hidden = hidden);
    }

    pub fn set_rating(&self, key: &str, rating: i32) {
        self.update_flags(key, |f| f.rating = rating);
    }

    pub fn set_slow(&self, key: &str, slow: bool) {
        self.update_flags(key, |f| f.slow = slow);
    }

    pub fn is_hidden(&self, key: &str) -> bool {
        self.state
            .read()
            .definitions
            .get(key)
            .map(|d| d.hidden)
            .unwrap_or(true)
    }

    pub fn is_slow(&self, key: &str) -> bool {
        self.state
            .read()
            .definitions
            .get(key)
            .map(|d| d.slow)
            .unwrap_or(false)
    }

    pub fn rating(&self, key: &str) -> i32 {
        self.state
            .read()
            .definitions
            .get(key)
            .map(|d| d.rating)
            .unwrap_or(0)
    }

    /// Current flags of every operation, for an external store
    pub fn flags_snapshot(&self) -> BTreeMap<String, OperationFlags> {
        self.state
            .read()
            .definitions
            .iter()
            .map(|(k, d)| (k.clone(), d.flags()))
            .collect()
    }

    /// Restore saved flags; unknown keys are skipped. Returns how many applied.
    pub fn restore_flags(&self, flags: &BTreeMap<String, OperationFlags>) -> usize {
        let mut state = self.state.write();
        let mut applied = 0;
        for (key, saved) in flags {
            match state.definitions.get_mut(key) {
                Some(def) => {
                    Arc::make_mut(def).apply_flags(*saved);
                    applied += 1;
                }
                None => tracing::debug!("Skipping saved flags for unknown key {}", key),
            }
        }
        applied
    }

    // ------------------------------------------------------------------------
    // Categories
    // ------------------------------------------------------------------------

    /// Create (or extend) a category. Unknown member keys are dropped.
    pub fn assign_category(&self, category: &str, title: &str, members: &[String]) {
        let mut state = self.state.write();
        let known: Vec<String> = members
            .iter()
            .filter(|k| {
                let found = state.definitions.contains_key(k.as_str());
                if !found {
                    tracing::warn!("Category {}: unknown operation {}", category, k);
                }
                found
            })
            .cloned()
            .collect();

        let entry = state
            .categories
            .entry(category.to_string())
            .or_insert_with(|| Category {
                title: title.to_string(),
                members: BTreeSet::new(),
            });
        if !title.is_empty() {
            entry.title = title.to_string();
        }
        entry.members.extend(known);
    }

    /// Category keys, sorted
    pub fn categories(&self) -> Vec<String> {
        self.state.read().categories.keys().cloned().collect()
    }

    pub fn category_title(&self, category: &str) -> Option<String> {
        self.state
            .read()
            .categories
            .get(category)
            .map(|c| c.title.clone())
    }

    pub fn add_to_category(&self, category: &str, key: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.definitions.contains_key(key) {
            return Err(FilterError::UnknownKey(key.to_string()));
        }
        match state.categories.get_mut(category) {
            Some(cat) => {
                cat.members.insert(key.to_string());
                Ok(())
            }
            None => Err(FilterError::Config(format!("unknown category {category}"))),
        }
    }

    /// Returns true if the key was a member
    pub fn remove_from_category(&self, category: &str, key: &str) -> bool {
        self.state
            .write()
            .categories
            .get_mut(category)
            .map(|cat| cat.members.remove(key))
            .unwrap_or(false)
    }

    pub fn is_favourite(&self, key: &str) -> bool {
        self.state
            .read()
            .categories
            .get(FAVOURITES)
            .map(|c| c.members.contains(key))
            .unwrap_or(false)
    }

    pub fn add_favourite(&self, key: &str) -> Result<()> {
        self.add_to_category(FAVOURITES, key)
    }

    pub fn remove_favourite(&self, key: &str) -> bool {
        self.remove_from_category(FAVOURITES, key)
    }

    // ------------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------------

    /// Create (or extend) a collection. Categories keep the given order;
    /// unknown and repeated ones are dropped.
    pub fn assign_collection(&self, collection: &str, title: &str, categories: &[String]) {
        let mut state = self.state.write();
        let known: Vec<String> = categories
            .iter()
            .filter(|c| {
                let found = state.categories.contains_key(c.as_str());
                if !found {
                    tracing::warn!("Collection {}: unknown category {}", collection, c);
                }
                found
            })
            .cloned()
            .collect();

        let entry = state
            .collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                title: title.to_string(),
                categories: Vec::new(),
            });
        if !title.is_empty() {
            entry.title = title.to_string();
        }
        for category in known {
            if !entry.categories.contains(&category) {
                entry.categories.push(category);
            }
        }
    }

    /// Collection keys, sorted
    pub fn collections(&self) -> Vec<String> {
        self.state.read().collections.keys().cloned().collect()
    }

    pub fn is_collection(&self, collection: &str) -> bool {
        self.state.read().collections.contains_key(collection)
    }

    pub fn collection_title(&self, collection: &str) -> Option<String> {
        self.state
            .read()
            .collections
            .get(collection)
            .map(|c| c.title.clone())
    }

    /// Categories of `collection` in configured order. The empty key
    /// selects every category.
    pub fn categories_in(&self, collection: &str) -> Vec<String> {
        if collection.is_empty() {
            return self.categories();
        }
        match self.state.read().collections.get(collection) {
            Some(c) => c.categories.clone(),
            None => {
                tracing::warn!("Invalid collection: {}", collection);
                Vec::new()
            }
        }
    }

    /// Position of `category` within `collection`
    pub fn category_index(&self, collection: &str, category: &str) -> Option<usize> {
        self.categories_in(collection).iter().position(|c| c == category)
    }

    // ------------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------------

    /// Next visible key in `category` after `current`, wrapping around
    pub fn next_key(&self, category: &str, current: &str) -> String {
        self.step_key(category, current, 1)
    }

    /// Previous visible key in `category` before `current`, wrapping around
    pub fn previous_key(&self, category: &str, current: &str) -> String {
        self.step_key(category, current, -1)
    }

    fn step_key(&self, category: &str, current: &str, step: isize) -> String {
        let list = self.list(&ListFilter::category(category));
        if list.len() < 2 {
            return current.to_string();
        }
        match list.iter().position(|k| k == current) {
            Some(index) => {
                let len = list.len() as isize;
                let next = (index as isize + step).rem_euclid(len) as usize;
                list[next].clone()
            }
            None => current.to_string(),
        }
    }
}
