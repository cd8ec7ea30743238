//! # Output Cache
//!
//! LRU cache of intermediate chain outputs. A key is the base image, its
//! orientation and the exact step sequence that produced the value, so a
//! chain fold can resume from the longest prefix it has already computed.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::picture::{Image, ImageId};
use crate::regions::Orientation;

/// One fold step as it affects the output
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey {
    pub key: String,
    /// Fingerprint of the instance's explicit parameters
    pub fingerprint: u64,
    /// Secondary input, for blend steps
    pub secondary: Option<ImageId>,
}

impl StepKey {
    pub fn new(key: &str, fingerprint: u64) -> Self {
        Self {
            key: key.to_string(),
            fingerprint,
            secondary: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Option<ImageId>) -> Self {
        self.secondary = secondary;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub base: ImageId,
    /// Masked steps detect regions for this orientation
    pub orientation: Orientation,
    pub steps: Vec<StepKey>,
}

impl CacheKey {
    pub fn new(base: ImageId, steps: &[StepKey]) -> Self {
        Self {
            base,
            orientation: Orientation::default(),
            steps: steps.to_vec(),
        }
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }
}

struct CacheEntry {
    image: Image,
    last_used: u64,
}

struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct OutputCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl OutputCache {
    /// Capacity 0 disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                tick: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, key: &CacheKey) -> Option<Image> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.tick += 1;
        let tick = state.tick;
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = tick;
                let image = entry.image.clone();
                state.hits += 1;
                Some(image)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, key: CacheKey, image: Image) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        state.entries.insert(
            key,
            CacheEntry {
                image,
                last_used: tick,
            },
        );

        while state.entries.len() > self.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    state.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Image> {
        self.state.lock().entries.remove(key).map(|e| e.image)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Drop every output computed from `base`. Returns how many were dropped.
    pub fn invalidate_base(&self, base: ImageId) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|k, _| k.base != base);
        let dropped = before - state.entries.len();
        if dropped > 0 {
            tracing::debug!("Invalidated {} cached outputs for image {}", dropped, base);
        }
        dropped
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            capacity: self.capacity,
            hits: state.hits,
            misses: state.misses,
        }
    }
}
