//! # Filter Chain
//!
//! Ordered committed operations plus at most one preview operation.
//!
//! ```text
//!   Empty ──append──► Committed(n) ──set_preview──► CommittedWithPreview(n, p)
//!     ▲                  │   ▲                          │        │
//!     └──remove_last─────┘   └──remove_last / promote───┘        │
//!                                                                 └─ apply(.., true) folds p last
//! ```
//!
//! Each entry holds a [`PoolLease`], so operations in use by a chain are
//! never evicted from the pool. Committed prefixes are cached in the
//! engine's output cache; the preview never is.

use serde::{Deserialize, Serialize};

use crate::definition::OperationKind;
use crate::engine::Engine;
use crate::error::{FilterError, Result};
use crate::output_cache::{CacheKey, StepKey};
use crate::picture::Image;
use crate::pool::PoolLease;
use crate::presets::FoldContext;
use crate::regions::Orientation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    pub operation_key: String,
    pub kind: OperationKind,
    pub is_preview: bool,
}

/// Change notification, delivered after the mutation is applied
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    Appended(ChainEntry),
    Removed(ChainEntry),
    PreviewChanged(Option<String>),
    Promoted(String),
    Cleared,
    Restored(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Box<dyn FnMut(&ChainEvent) + Send>;

/// Committed operation keys, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub keys: Vec<String>,
}

struct Entry {
    entry: ChainEntry,
    _lease: PoolLease,
}

pub struct FilterChain {
    engine: Engine,
    committed: Vec<Entry>,
    preview: Option<Entry>,
    orientation: Orientation,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
}

impl FilterChain {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            committed: Vec::new(),
            preview: None,
            orientation: Orientation::default(),
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    fn lease(&self, key: &str, is_preview: bool) -> Result<Entry> {
        let kind = self
            .engine
            .catalog()
            .kind_of(key)
            .ok_or_else(|| FilterError::UnknownKey(key.to_string()))?;
        let lease = self.engine.pool().lease(key)?;
        Ok(Entry {
            entry: ChainEntry {
                operation_key: key.to_string(),
                kind,
                is_preview,
            },
            _lease: lease,
        })
    }

    fn notify(&mut self, event: ChainEvent) {
        for (_, observer) in self.observers.iter_mut() {
            observer(&event);
        }
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    pub fn append(&mut self, key: &str) -> Result<()> {
        let entry = self.lease(key, false)?;
        let event = ChainEvent::Appended(entry.entry.clone());
        self.committed.push(entry);
        tracing::debug!("Chain append {} ({} committed)", key, self.committed.len());
        self.notify(event);
        Ok(())
    }

    /// Pop the preview if set, else the last committed entry
    pub fn remove_last(&mut self) -> Option<ChainEntry> {
        let removed = match self.preview.take() {
            Some(preview) => preview,
            None => self.committed.pop()?,
        };
        let entry = removed.entry.clone();
        drop(removed);
        tracing::debug!("Chain removed {}", entry.operation_key);
        self.notify(ChainEvent::Removed(entry.clone()));
        Some(entry)
    }

    /// Replace (or clear, with `None`) the preview operation
    pub fn set_preview(&mut self, key: Option<&str>) -> Result<()> {
        let next = match key {
            Some(key) => Some(self.lease(key, true)?),
            None => None,
        };
        let previous = std::mem::replace(&mut self.preview, next);
        drop(previous);
        self.notify(ChainEvent::PreviewChanged(key.map(str::to_string)));
        Ok(())
    }

    /// Commit the current preview as the last entry
    pub fn promote_preview(&mut self) -> Result<()> {
        let mut preview = self.preview.take().ok_or(FilterError::NoPreviewSet)?;
        preview.entry.is_preview = false;
        let key = preview.entry.operation_key.clone();
        self.committed.push(preview);
        tracing::debug!("Chain promoted {}", key);
        self.notify(ChainEvent::Promoted(key));
        Ok(())
    }

    pub fn clear(&mut self) {
        self.committed.clear();
        self.preview = None;
        self.notify(ChainEvent::Cleared);
    }

    /// Orientation masked steps detect regions in
    pub fn set_orientation(&mut self, orientation: Orientation) {
        self.orientation = orientation;
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    pub fn subscribe(&mut self, observer: impl FnMut(&ChainEvent) + Send + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    // ------------------------------------------------------------------------
    // Application
    // ------------------------------------------------------------------------

    /// Fold `base` through every committed entry in order, then the preview
    pub fn apply(&self, base: &Image, include_preview: bool) -> Result<Image> {
        let mut ctx = FoldContext::new(base.clone(), self.orientation);
        let mut running = self.fold_committed(base, self.committed.len(), &mut ctx)?;

        if include_preview {
            if let Some(preview) = &self.preview {
                running = self
                    .engine
                    .run_entry(&preview.entry.operation_key, &running, &mut ctx)?;
            }
        }
        Ok(running)
    }

    /// Fold `base` through the first `count` committed entries
    pub fn apply_subset(&self, base: &Image, count: usize) -> Result<Image> {
        if count > self.committed.len() {
            return Err(FilterError::IndexOutOfRange {
                requested: count,
                len: self.committed.len(),
            });
        }
        let mut ctx = FoldContext::new(base.clone(), self.orientation);
        self.fold_committed(base, count, &mut ctx)
    }

    /// Resume from the longest cached prefix, caching every new prefix.
    /// Nothing is cached once a preset in the fold served a stale output.
    fn fold_committed(&self, base: &Image, count: usize, ctx: &mut FoldContext) -> Result<Image> {
        let entries = &self.committed[..count];
        let cache = self.engine.output_cache();
        if !cache.is_enabled() {
            return entries.iter().try_fold(base.clone(), |running, e| {
                self.engine.run_entry(&e.entry.operation_key, &running, ctx)
            });
        }

        let orientation = ctx.orientation;
        let mut steps: Vec<StepKey> = Vec::with_capacity(count);
        let mut running = base.clone();
        let mut resuming = true;

        for (i, e) in entries.iter().enumerate() {
            // Blend inputs depend on the extent the step runs on
            let step = self.engine.resolve_step(&e.entry.operation_key, running.extent());
            steps.push(step.key.clone());
            let key = CacheKey::new(base.id(), &steps).with_orientation(orientation);

            if resuming {
                if let Some(image) = cache.get(&key) {
                    running = image;
                    continue;
                }
                resuming = false;
                if i > 0 {
                    tracing::debug!("Resuming chain fold after {} cached steps", i);
                }
            }

            running = self.engine.run_resolved(&step, &running, ctx)?;
            if ctx.served_stale() {
                tracing::debug!("Not caching output of {}: a preset served a stale frame", step.key.key);
            } else {
                cache.insert(key, running.clone());
            }
        }
        Ok(running)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Committed entries, then the preview
    pub fn entries(&self) -> Vec<ChainEntry> {
        self.committed
            .iter()
            .chain(self.preview.iter())
            .map(|e| e.entry.clone())
            .collect()
    }

    pub fn committed_keys(&self) -> Vec<String> {
        self.committed
            .iter()
            .map(|e| e.entry.operation_key.clone())
            .collect()
    }

    pub fn preview(&self) -> Option<&ChainEntry> {
        self.preview.as_ref().map(|e| &e.entry)
    }

    pub fn has_preview(&self) -> bool {
        self.preview.is_some()
    }

    /// Committed length (the preview is not counted)
    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.preview.is_none()
    }

    /// True if any entry is flagged slow; such chains should be applied
    /// off the UI thread
    pub fn contains_slow(&self) -> bool {
        let catalog = self.engine.catalog();
        self.committed
            .iter()
            .chain(self.preview.iter())
            .any(|e| catalog.is_slow(&e.entry.operation_key))
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            keys: self.committed_keys(),
        }
    }

    /// Replace the chain with a snapshot. Unknown keys are skipped and
    /// returned; the preview is cleared.
    pub fn restore(&mut self, snapshot: &ChainSnapshot) -> Vec<String> {
        let mut restored = Vec::new();
        let mut skipped = Vec::new();
        for key in &snapshot.keys {
            match self.lease(key, false) {
                Ok(entry) => restored.push(entry),
                Err(e) => {
                    tracing::warn!("Not restoring {}: {}", key, e);
                    skipped.push(key.clone());
                }
            }
        }
        self.committed = restored;
        self.preview = None;
        let keys = self.committed_keys();
        self.notify(ChainEvent::Restored(keys));
        skipped
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("committed", &self.committed_keys())
            .field("preview", &self.preview().map(|p| &p.operation_key))
            .finish()
    }
}
