//! # Operation Instance Pool
//!
//! Lazily constructed, reference-counted operation instances, one per key.
//!
//! ```text
//!   acquire(key) ──► slot map (mutex) ──► once-cell ──► factory.construct()
//!        │                                   ▲
//!        └── InstanceHandle (drop = release) │ concurrent callers wait here
//! ```
//!
//! Two counts are kept per key: transient references held by
//! [`InstanceHandle`]s during a single apply, and locks held by chain
//! entries ([`PoolLease`]). An instance is only reclaimable when both are
//! zero, and even then it stays warm until evicted, cleared or trimmed.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::catalog::OperationCatalog;
use crate::definition::OperationDefinition;
use crate::error::{FilterError, Result};
use crate::operation::{ImageOperation, OperationError, OperationFactory};
use crate::params::{ParameterValue, ParameterValues};
use crate::picture::Image;

// ============================================================================
// Operation Instance
// ============================================================================

/// Live state for one operation key
pub struct OperationInstance {
    definition: Arc<OperationDefinition>,
    /// Explicitly set parameter values
    parameters: Mutex<ParameterValues>,
    /// Kernel built by the factory (absent for presets)
    kernel: Option<Mutex<Box<dyn ImageOperation>>>,
}

impl OperationInstance {
    fn new(definition: Arc<OperationDefinition>, kernel: Option<Box<dyn ImageOperation>>) -> Self {
        Self {
            definition,
            parameters: Mutex::new(ParameterValues::new()),
            kernel: kernel.map(Mutex::new),
        }
    }

    pub fn key(&self) -> &str {
        &self.definition.key
    }

    pub fn definition(&self) -> &OperationDefinition {
        &self.definition
    }

    pub fn parameters(&self) -> ParameterValues {
        self.parameters.lock().clone()
    }

    /// Explicit value of one parameter, if set
    pub fn parameter(&self, key: &str) -> Option<ParameterValue> {
        self.parameters.lock().get(key).cloned()
    }

    /// Set a parameter; numeric values are clamped to the schema range
    pub fn set_parameter(&self, key: &str, value: ParameterValue) -> Result<()> {
        let spec = self
            .definition
            .parameter(key)
            .ok_or_else(|| FilterError::UnknownParameter {
                key: self.definition.key.clone(),
                parameter: key.to_string(),
            })?;
        let value = match value {
            ParameterValue::Float(v) => ParameterValue::Float(spec.clamp(v)),
            ParameterValue::Distance(v) => ParameterValue::Distance(spec.clamp(v)),
            other => other,
        };
        self.parameters.lock().set(key, value);
        Ok(())
    }

    pub fn reset_parameters(&self) {
        *self.parameters.lock() = ParameterValues::new();
    }

    pub fn fingerprint(&self) -> u64 {
        self.parameters.lock().fingerprint()
    }

    /// Run the kernel with explicit values, `overrides`, and the
    /// extent-bound parameters resolved against `primary`
    pub(crate) fn run(
        &self,
        primary: &Image,
        secondary: Option<&Image>,
        overrides: &ParameterValues,
        extent_bound: &[String],
    ) -> std::result::Result<Image, OperationError> {
        let Some(kernel) = &self.kernel else {
            return Err(OperationError::ProcessingFailed(format!(
                "{} has no kernel",
                self.definition.key
            )));
        };

        let extent = primary.extent();
        let mut params = self.parameters();
        params.overlay(overrides);
        for key in extent_bound {
            if let Some(value) = self.definition.parameter(key).and_then(|s| s.bind_extent(extent)) {
                params.set(key, value);
            }
        }
        let resolved = params.resolve(&self.definition.parameters, extent);
        kernel.lock().apply(primary, secondary, &resolved)
    }
}

// ============================================================================
// Pool
// ============================================================================

type InstanceCell = Arc<OnceCell<Arc<OperationInstance>>>;

struct Slot {
    cell: InstanceCell,
    refs: usize,
    locks: usize,
    last_used: u64,
}

impl Slot {
    fn new() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            refs: 0,
            locks: 0,
            last_used: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.refs == 0 && self.locks == 0
    }

    fn is_live(&self) -> bool {
        self.cell.get().is_some()
    }
}

struct PoolShared {
    catalog: Arc<OperationCatalog>,
    factory: Arc<dyn OperationFactory>,
    slots: Mutex<HashMap<String, Slot>>,
    /// Idle instances kept warm before LRU reclamation (None = unbounded)
    max_idle: Option<usize>,
    clock: AtomicU64,
    constructed: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
}

impl PoolShared {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn build(&self, definition: &Arc<OperationDefinition>) -> Result<Arc<OperationInstance>> {
        let kernel = if definition.kind.needs_kernel() {
            let kernel = self.factory.construct(definition).ok_or_else(|| {
                FilterError::ConstructionFailed {
                    key: definition.key.clone(),
                    reason: "factory returned no instance".into(),
                }
            })?;
            Some(kernel)
        } else {
            None
        };
        self.constructed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Constructed {} operation {}", definition.kind.label(), definition.key);
        Ok(Arc::new(OperationInstance::new(definition.clone(), kernel)))
    }

    /// Check out the slot for `key` (creating it) and return its cell
    fn check_out(&self, key: &str) -> InstanceCell {
        let now = self.tick();
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_string()).or_insert_with(Slot::new);
        slot.refs += 1;
        slot.last_used = now;
        slot.cell.clone()
    }

    fn release(&self, key: &str) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.is_idle() {
            if !slot.is_live() {
                slots.remove(key);
            }
            self.trim_idle(&mut slots);
        }
    }

    fn unlock(&self, key: &str) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            tracing::warn!("Unlock of unknown pool key {}", key);
            return;
        };
        if slot.locks == 0 {
            tracing::warn!("Unbalanced unlock for {}", key);
            return;
        }
        slot.locks -= 1;
        tracing::debug!("Unlocked {} ({} locks left)", key, slot.locks);
        if slot.is_idle() {
            if !slot.is_live() {
                slots.remove(key);
            }
            self.trim_idle(&mut slots);
        }
    }

    /// Reclaim least-recently-used idle instances beyond `max_idle`
    fn trim_idle(&self, slots: &mut HashMap<String, Slot>) {
        let Some(max_idle) = self.max_idle else {
            return;
        };
        loop {
            let idle: Vec<(&String, u64)> = slots
                .iter()
                .filter(|(_, s)| s.is_idle() && s.is_live())
                .map(|(k, s)| (k, s.last_used))
                .collect();
            if idle.len() <= max_idle {
                return;
            }
            let Some(oldest) = idle.iter().min_by_key(|(_, t)| *t).map(|(k, _)| (*k).clone()) else {
                return;
            };
            slots.remove(&oldest);
            self.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Reclaimed idle operation {}", oldest);
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub locked: usize,
    pub checked_out: usize,
    pub total_constructed: u64,
    pub total_reused: u64,
    pub total_evicted: u64,
}

/// Shared pool of operation instances; clones share the same pool
#[derive(Clone)]
pub struct OperationInstancePool {
    shared: Arc<PoolShared>,
}

impl OperationInstancePool {
    pub fn new(
        catalog: Arc<OperationCatalog>,
        factory: Arc<dyn OperationFactory>,
        max_idle: Option<usize>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                catalog,
                factory,
                slots: Mutex::new(HashMap::new()),
                max_idle,
                clock: AtomicU64::new(0),
                constructed: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
            }),
        }
    }

    /// Get the live instance for `key`, constructing it on first use
    pub fn acquire(&self, key: &str) -> Result<InstanceHandle> {
        let definition = self.shared.catalog.lookup(key)?;
        let cell = self.shared.check_out(key);

        let mut built = false;
        let result = cell.get_or_try_init(|| {
            built = true;
            self.shared.build(&definition)
        });

        match result {
            Ok(instance) => {
                if !built {
                    self.shared.reused.fetch_add(1, Ordering::Relaxed);
                }
                Ok(InstanceHandle {
                    shared: self.shared.clone(),
                    instance: instance.clone(),
                })
            }
            Err(err) => {
                tracing::warn!("Construction of {} failed: {}", key, err);
                self.shared.release(key);
                Err(err)
            }
        }
    }

    /// Return a handle early (dropping it does the same)
    pub fn release(&self, handle: InstanceHandle) {
        drop(handle);
    }

    /// Pin `key` so it is never evicted
    pub fn lock(&self, key: &str) -> Result<()> {
        if !self.shared.catalog.contains(key) {
            return Err(FilterError::UnknownKey(key.to_string()));
        }
        let mut slots = self.shared.slots.lock();
        let slot = slots.entry(key.to_string()).or_insert_with(Slot::new);
        slot.locks += 1;
        tracing::debug!("Locked {} ({} locks)", key, slot.locks);
        Ok(())
    }

    pub fn unlock(&self, key: &str) {
        self.shared.unlock(key);
    }

    /// RAII form of [`lock`](Self::lock)
    pub fn lease(&self, key: &str) -> Result<PoolLease> {
        self.lock(key)?;
        Ok(PoolLease {
            shared: self.shared.clone(),
            key: key.to_string(),
        })
    }

    /// Remove an unlocked, idle instance. Returns true if one was removed.
    pub fn evict(&self, key: &str) -> bool {
        let mut slots = self.shared.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.is_idle() => {
                let live = slot.is_live();
                slots.remove(key);
                if live {
                    self.shared.evicted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Evicted operation {}", key);
                }
                live
            }
            _ => false,
        }
    }

    /// Evict every unlocked, idle instance. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut slots = self.shared.slots.lock();
        let before = slots.values().filter(|s| s.is_live()).count();
        slots.retain(|_, s| !s.is_idle());
        let removed = before - slots.values().filter(|s| s.is_live()).count();
        self.shared.evicted.fetch_add(removed as u64, Ordering::Relaxed);
        tracing::debug!("Cleared {} idle operations", removed);
        removed
    }

    /// Construct instances ahead of use. Unknown keys and failed
    /// constructions are skipped. Returns how many were built.
    pub fn prewarm(&self, keys: &[String]) -> usize {
        let mut built_count = 0;
        for key in keys {
            let definition = match self.shared.catalog.lookup(key) {
                Ok(def) => def,
                Err(_) => {
                    tracing::warn!("Cannot prewarm unknown operation {}", key);
                    continue;
                }
            };
            let cell = self.shared.check_out(key);
            let mut built = false;
            let result = cell.get_or_try_init(|| {
                built = true;
                self.shared.build(&definition)
            });
            if let Err(err) = result {
                tracing::warn!("Prewarm of {} failed: {}", key, err);
            } else if built {
                built_count += 1;
            }
            self.shared.release(key);
        }
        tracing::debug!("Prewarmed {} operations", built_count);
        built_count
    }

    /// Live instance for `key` without checking it out
    pub fn peek(&self, key: &str) -> Option<Arc<OperationInstance>> {
        self.shared
            .slots
            .lock()
            .get(key)
            .and_then(|s| s.cell.get().cloned())
    }

    /// Fingerprint of the explicit parameters currently in effect for `key`
    pub fn parameter_fingerprint(&self, key: &str) -> u64 {
        self.peek(key)
            .map(|i| i.fingerprint())
            .unwrap_or_else(|| ParameterValues::new().fingerprint())
    }

    pub fn is_live(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    pub fn lock_count(&self, key: &str) -> usize {
        self.shared.slots.lock().get(key).map(|s| s.locks).unwrap_or(0)
    }

    pub fn ref_count(&self, key: &str) -> usize {
        self.shared.slots.lock().get(key).map(|s| s.refs).unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.shared.slots.lock();
        PoolStats {
            live: slots.values().filter(|s| s.is_live()).count(),
            locked: slots.values().filter(|s| s.locks > 0).count(),
            checked_out: slots.values().filter(|s| s.refs > 0).count(),
            total_constructed: self.shared.constructed.load(Ordering::Relaxed),
            total_reused: self.shared.reused.load(Ordering::Relaxed),
            total_evicted: self.shared.evicted.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Scoped Handles
// ============================================================================

/// Checked-out instance; dropping it releases the reference
pub struct InstanceHandle {
    shared: Arc<PoolShared>,
    instance: Arc<OperationInstance>,
}

impl InstanceHandle {
    pub fn instance(&self) -> &Arc<OperationInstance> {
        &self.instance
    }

    /// True if both handles refer to the same live instance
    pub fn same_instance(&self, other: &InstanceHandle) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }
}

impl Deref for InstanceHandle {
    type Target = OperationInstance;

    fn deref(&self) -> &OperationInstance {
        &self.instance
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        self.shared.release(self.instance.key());
    }
}

/// Lock on a pool key held by a chain entry; dropping it unlocks
pub struct PoolLease {
    shared: Arc<PoolShared>,
    key: String,
}

impl PoolLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.shared.unlock(&self.key);
    }
}

impl std::fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_catalog, CountingFactory};
    use std::time::Duration;

    fn pool_with(factory: Arc<CountingFactory>, max_idle: Option<usize>) -> OperationInstancePool {
        OperationInstancePool::new(Arc::new(test_catalog()), factory, max_idle)
    }

    #[test]
    fn test_acquire_reuses_instance() {
        let factory = Arc::new(CountingFactory::new());
        let pool = pool_with(factory.clone(), None);

        let first = pool.acquire("brightness").unwrap();
        let second = pool.acquire("brightness").unwrap();
        assert!(first.same_instance(&second));
        assert_eq!(pool.ref_count("brightness"), 2);

        pool.release(first);
        drop(second);
        assert_eq!(pool.ref_count("brightness"), 0);
        // Released instances stay warm
        assert!(pool.is_live("brightness"));
        assert_eq!(factory.constructions("brightness"), 1);

        let _again = pool.acquire("brightness").unwrap();
        assert_eq!(factory.constructions("brightness"), 1);
        assert_eq!(pool.stats().total_reused, 2);
    }

    #[test]
    fn test_acquire_unknown_key() {
        let pool = pool_with(Arc::new(CountingFactory::new()), None);
        assert_eq!(
            pool.acquire("nope").err(),
            Some(FilterError::UnknownKey("nope".into()))
        );
    }

    #[test]
    fn test_construction_failure_propagates() {
        let factory = Arc::new(CountingFactory::new());
        let pool = pool_with(factory.clone(), None);

        let err = pool.acquire("ghost").err().unwrap();
        assert!(matches!(err, FilterError::ConstructionFailed { .. }));
        assert_eq!(pool.ref_count("ghost"), 0);
        assert!(!pool.is_live("ghost"));
        assert_eq!(pool.stats().total_constructed, 0);
    }

    #[test]
    fn test_concurrent_acquire_constructs_once() {
        let factory = Arc::new(CountingFactory::new().with_delay(Duration::from_millis(40)));
        let pool = pool_with(factory.clone(), None);

        let handles: Vec<InstanceHandle> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| s.spawn(|| pool.acquire("brightness").unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(factory.constructions("brightness"), 1);
        assert!(handles.iter().all(|h| h.same_instance(&handles[0])));
        assert_eq!(pool.ref_count("brightness"), 8);
    }

    #[test]
    fn test_lock_prevents_eviction() {
        let pool = pool_with(Arc::new(CountingFactory::new()), None);
        drop(pool.acquire("brightness").unwrap());

        pool.lock("brightness").unwrap();
        assert!(!pool.evict("brightness"));
        assert!(pool.is_live("brightness"));

        pool.unlock("brightness");
        assert!(pool.evict("brightness"));
        assert!(!pool.is_live("brightness"));

        // Absent key is a no-op
        assert!(!pool.evict("brightness"));
    }

    #[test]
    fn test_evict_skips_checked_out() {
        let pool = pool_with(Arc::new(CountingFactory::new()), None);
        let handle = pool.acquire("warmth").unwrap();
        assert!(!pool.evict("warmth"));
        drop(handle);
        assert!(pool.evict("warmth"));
    }

    #[test]
    fn test_lease_unlocks_on_drop() {
        let pool = pool_with(Arc::new(CountingFactory::new()), None);
        let lease = pool.lease("saturation").unwrap();
        let second = pool.lease("saturation").unwrap();
        assert_eq!(pool.lock_count("saturation"), 2);
        drop(lease);
        assert_eq!(pool.lock_count("saturation"), 1);
        drop(second);
        assert_eq!(pool.lock_count("saturation"), 0);
        assert!(pool.lease("nope").is_err());
    }

    #[test]
    fn test_clear_preserves_locked() {
        let pool = pool_with(Arc::new(CountingFactory::new()), None);
        for key in ["brightness", "saturation", "warmth"] {
            drop(pool.acquire(key).unwrap());
        }
        pool.lock("warmth").unwrap();

        assert_eq!(pool.clear(), 2);
        assert!(pool.is_live("warmth"));
        assert!(!pool.is_live("brightness"));
        assert_eq!(pool.stats().live, 1);
    }

    #[test]
    fn test_idle_trim_is_lru_and_respects_locks() {
        let pool = pool_with(Arc::new(CountingFactory::new()), Some(1));
        pool.lock("double").unwrap();
        drop(pool.acquire("double").unwrap());
        drop(pool.acquire("brightness").unwrap());
        drop(pool.acquire("saturation").unwrap());

        // Only the most recent idle instance survives; the locked one stays
        assert!(pool.is_live("double"));
        assert!(!pool.is_live("brightness"));
        assert!(pool.is_live("saturation"));
    }

    #[test]
    fn test_prewarm() {
        let factory = Arc::new(CountingFactory::new());
        let pool = pool_with(factory.clone(), None);
        let keys: Vec<String> = ["brightness", "warmth", "ghost", "missing"]
            .iter()
            .map(|k| k.to_string())
            .collect();

        assert_eq!(pool.prewarm(&keys), 2);
        assert!(pool.is_live("warmth"));
        assert_eq!(pool.ref_count("warmth"), 0);
        // Second pass builds nothing new
        assert_eq!(pool.prewarm(&keys), 0);
        let _h = pool.acquire("brightness").unwrap();
        assert_eq!(factory.constructions("brightness"), 1);
    }

    #[test]
    fn test_set_parameter_clamps_and_fingerprints() {
        let pool = pool_with(Arc::new(CountingFactory::new()), None);
        let before = pool.parameter_fingerprint("brightness");
        let handle = pool.acquire("brightness").unwrap();
        handle
            .set_parameter("amount", ParameterValue::Float(7.0))
            .unwrap();
        assert_eq!(handle.parameters().float("amount"), Some(1.0));
        assert_ne!(pool.parameter_fingerprint("brightness"), before);
        assert!(matches!(
            handle.set_parameter("bogus", ParameterValue::Float(0.0)),
            Err(FilterError::UnknownParameter { .. })
        ));
        handle.reset_parameters();
        assert_eq!(pool.parameter_fingerprint("brightness"), before);
    }
}
