//! Deduplicating registry of calculation descriptors.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slab::Slab;

use crate::calculation::Calculation;
use crate::key::CalculationKey;
use crate::slot::{ResultSlot, SlotStatus};

/// Whether `find_or_add` matched an existing descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lookup {
    /// An equal descriptor was already registered; the candidate was dropped.
    Found,
    /// The candidate became the canonical descriptor.
    Added,
}

/// A canonical descriptor together with its shared result slot.
pub struct Resolved<C: Calculation> {
    descriptor: Arc<C>,
    slot: Arc<ResultSlot<C::Input, C::Output>>,
    key: CalculationKey,
    lookup: Lookup,
}

impl<C: Calculation> Clone for Resolved<C> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            slot: self.slot.clone(),
            key: self.key.clone(),
            lookup: self.lookup,
        }
    }
}

impl<C: Calculation> Resolved<C> {
    /// The canonical descriptor.
    pub fn descriptor(&self) -> &Arc<C> {
        &self.descriptor
    }

    /// The shared result slot.
    pub fn slot(&self) -> &Arc<ResultSlot<C::Input, C::Output>> {
        &self.slot
    }

    /// The registry key of the descriptor.
    pub fn key(&self) -> &CalculationKey {
        &self.key
    }

    /// Whether the descriptor was found or added.
    pub fn lookup(&self) -> Lookup {
        self.lookup
    }

    /// Current state of the shared slot.
    pub fn status(&self) -> SlotStatus {
        self.slot.status()
    }

    /// Returns `true` if both handles point at the same result slot.
    pub fn shares_slot_with(&self, other: &Resolved<C>) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    pub(crate) fn slot_id(&self) -> usize {
        Arc::as_ptr(&self.slot) as *const () as usize
    }
}

/// Type-erased registry entry.
trait ErasedEntry<I>: Send + Sync {
    fn key(&self) -> &CalculationKey;
    fn as_any(&self) -> &dyn Any;
    fn status(&self) -> SlotStatus;
    fn reset(&self) -> bool;
    /// Adopt the outcome of an entry with an equal key.
    fn adopt_from(&self, source: &dyn ErasedEntry<I>) -> bool;
    /// Same descriptor, pending slot.
    fn fresh_copy(&self) -> Arc<dyn ErasedEntry<I>>;
}

struct Entry<C: Calculation> {
    key: CalculationKey,
    descriptor: Arc<C>,
    slot: Arc<ResultSlot<C::Input, C::Output>>,
}

impl<C: Calculation> ErasedEntry<C::Input> for Entry<C> {
    fn key(&self) -> &CalculationKey {
        &self.key
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn status(&self) -> SlotStatus {
        self.slot.status()
    }

    fn reset(&self) -> bool {
        self.slot.reset()
    }

    fn adopt_from(&self, source: &dyn ErasedEntry<C::Input>) -> bool {
        source
            .as_any()
            .downcast_ref::<Entry<C>>()
            .is_some_and(|source| self.slot.assign_result(&source.slot))
    }

    fn fresh_copy(&self) -> Arc<dyn ErasedEntry<C::Input>> {
        Arc::new(Entry {
            key: self.key.clone(),
            descriptor: self.descriptor.clone(),
            slot: Arc::new(ResultSlot::new()),
        })
    }
}

struct RegistryInner<I> {
    entries: Slab<Arc<dyn ErasedEntry<I>>>,
    index: HashMap<CalculationKey, usize, ahash::RandomState>,
}

impl<I> RegistryInner<I> {
    fn snapshot(&self) -> Vec<Arc<dyn ErasedEntry<I>>> {
        self.entries.iter().map(|(_, e)| e.clone()).collect()
    }

    fn get(&self, key: &CalculationKey) -> Option<Arc<dyn ErasedEntry<I>>> {
        self.index.get(key).map(|&idx| self.entries[idx].clone())
    }

    fn insert(&mut self, entry: Arc<dyn ErasedEntry<I>>) {
        let key = entry.key().clone();
        let idx = self.entries.insert(entry);
        self.index.insert(key, idx);
    }
}

/// Deduplicating pool of calculation descriptors for one input type.
///
/// The registry owns every descriptor it accepts and the result slot of each. At
/// most one canonical descriptor exists per equivalence class; resetting clears
/// slots but keeps membership.
pub struct CalculationRegistry<I> {
    inner: Mutex<RegistryInner<I>>,
}

impl<I: Send + Sync + 'static> Default for CalculationRegistry<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Send + Sync + 'static> CalculationRegistry<I> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                entries: Slab::new(),
                index: HashMap::with_hasher(ahash::RandomState::new()),
            }),
        }
    }

    /// Find the canonical descriptor equal to `candidate`, or accept the candidate.
    ///
    /// If an equal descriptor exists the candidate is dropped and the existing
    /// descriptor is returned together with its slot, sharing any cached or
    /// in-flight result.
    pub fn find_or_add<C>(&self, candidate: C) -> Resolved<C>
    where
        C: Calculation<Input = I>,
    {
        let candidate = Arc::new(candidate);
        let key = CalculationKey::of(&candidate);

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.get(&key) {
            drop(inner);
            return match existing.as_any().downcast_ref::<Entry<C>>() {
                Some(entry) => Resolved {
                    descriptor: entry.descriptor.clone(),
                    slot: entry.slot.clone(),
                    key: entry.key.clone(),
                    lookup: Lookup::Found,
                },
                None => unreachable!("calculation keys compare descriptor types before values"),
            };
        }

        let slot = Arc::new(ResultSlot::new());
        inner.insert(Arc::new(Entry {
            key: key.clone(),
            descriptor: candidate.clone(),
            slot: slot.clone(),
        }));
        Resolved {
            descriptor: candidate,
            slot,
            key,
            lookup: Lookup::Added,
        }
    }

    /// State of the slot for the descriptor equal to `descriptor`, if registered.
    pub fn status_of<C>(&self, descriptor: C) -> Option<SlotStatus>
    where
        C: Calculation<Input = I>,
    {
        let key = CalculationKey::of(&Arc::new(descriptor));
        let entry = self.inner.lock().get(&key)?;
        Some(entry.status())
    }

    /// Returns `true` if a descriptor equal to `descriptor` is registered.
    pub fn contains<C>(&self, descriptor: C) -> bool
    where
        C: Calculation<Input = I>,
    {
        let key = CalculationKey::of(&Arc::new(descriptor));
        self.inner.lock().index.contains_key(&key)
    }

    /// Remove the descriptor equal to `descriptor` together with its slot.
    ///
    /// Handles obtained earlier keep their slot alive but it is no longer shared
    /// with later resolutions. Returns `true` if an entry was removed.
    pub fn remove<C>(&self, descriptor: C) -> bool
    where
        C: Calculation<Input = I>,
    {
        let key = CalculationKey::of(&Arc::new(descriptor));
        let mut inner = self.inner.lock();
        match inner.index.remove(&key) {
            Some(idx) => {
                inner.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Number of canonical descriptors.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns `true` if no descriptor has been accepted.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Keys of all canonical descriptors.
    pub fn keys(&self) -> Vec<CalculationKey> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(_, e)| e.key().clone())
            .collect()
    }

    /// Reset every slot, keeping membership.
    ///
    /// Returns the number of slots that held an outcome.
    pub fn reset(&self) -> usize {
        // Slots are reset outside the registry lock so in-flight computations can
        // keep resolving while we wait for them.
        let entries = self.inner.lock().snapshot();
        entries.iter().filter(|e| e.reset()).count()
    }

    /// Port terminal outcomes from `other` into equal descriptors of this registry.
    ///
    /// Entries only in `other` are ignored and entries only in `self` are left
    /// untouched. Returns the number of outcomes ported.
    pub fn transfer_results_from(&self, other: &CalculationRegistry<I>) -> usize {
        if std::ptr::eq(self, other) {
            return 0;
        }
        let sources = other.inner.lock().snapshot();
        let pairs: Vec<_> = {
            let inner = self.inner.lock();
            sources
                .into_iter()
                .filter_map(|source| inner.get(source.key()).map(|target| (target, source)))
                .collect()
        };
        pairs
            .iter()
            .filter(|(target, source)| target.adopt_from(source.as_ref()))
            .count()
    }

    /// Build a registry with the same descriptors and fresh slots, warmed with the
    /// outcomes of this one.
    pub fn duplicate(&self) -> CalculationRegistry<I> {
        let duplicate = CalculationRegistry::new();
        duplicate.copy_membership_from(self);
        duplicate.transfer_results_from(self);
        duplicate
    }

    /// Register pending copies of every descriptor of `other` missing here.
    pub(crate) fn copy_membership_from(&self, other: &CalculationRegistry<I>) {
        if std::ptr::eq(self, other) {
            return;
        }
        let entries = other.inner.lock().snapshot();
        let mut inner = self.inner.lock();
        for entry in entries {
            if !inner.index.contains_key(entry.key()) {
                inner.insert(entry.fresh_copy());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use crate::CalcContext;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Scale {
        factor: i64,
    }

    impl Calculation for Scale {
        type Input = i64;
        type Output = i64;

        fn execute(&self, ctx: &CalcContext<'_, i64>) -> Result<i64, ExecutionError> {
            Ok(ctx.input() * self.factor)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Offset {
        factor: i64,
    }

    impl Calculation for Offset {
        type Input = i64;
        type Output = i64;

        fn execute(&self, ctx: &CalcContext<'_, i64>) -> Result<i64, ExecutionError> {
            Ok(ctx.input() + self.factor)
        }
    }

    #[test]
    fn test_find_or_add_dedups() {
        let registry = CalculationRegistry::<i64>::new();
        let a = registry.find_or_add(Scale { factor: 2 });
        let b = registry.find_or_add(Scale { factor: 2 });
        let c = registry.find_or_add(Scale { factor: 3 });
        let d = registry.find_or_add(Offset { factor: 2 });

        assert_eq!(a.lookup(), Lookup::Added);
        assert_eq!(b.lookup(), Lookup::Found);
        assert!(a.shares_slot_with(&b));
        assert!(Arc::ptr_eq(a.descriptor(), b.descriptor()));
        assert!(!a.shares_slot_with(&c));
        assert_eq!(d.lookup(), Lookup::Added);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_remove_and_contains() {
        let registry = CalculationRegistry::<i64>::new();
        let first = registry.find_or_add(Scale { factor: 2 });
        assert!(registry.contains(Scale { factor: 2 }));
        assert_eq!(registry.status_of(Scale { factor: 2 }), Some(SlotStatus::Pending));

        assert!(registry.remove(Scale { factor: 2 }));
        assert!(!registry.remove(Scale { factor: 2 }));
        assert!(!registry.contains(Scale { factor: 2 }));
        assert!(registry.is_empty());

        let second = registry.find_or_add(Scale { factor: 2 });
        assert_eq!(second.lookup(), Lookup::Added);
        assert!(!first.shares_slot_with(&second));
    }

    #[test]
    fn test_reset_keeps_membership() {
        let registry = CalculationRegistry::<i64>::new();
        let input = Arc::new(4);
        let handle = registry.find_or_add(Scale { factor: 2 });
        handle.slot().get_or_compute(&input, |i| Ok(**i * 2)).unwrap();
        registry.find_or_add(Scale { factor: 5 });

        assert_eq!(registry.reset(), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(handle.status(), SlotStatus::Pending);
    }

    #[test]
    fn test_transfer_only_touches_common_entries() {
        let input = Arc::new(10);
        let source = CalculationRegistry::<i64>::new();
        source
            .find_or_add(Scale { factor: 2 })
            .slot()
            .get_or_compute(&input, |i| Ok(**i * 2))
            .unwrap();
        source
            .find_or_add(Offset { factor: 1 })
            .slot()
            .get_or_compute(&input, |i| Ok(**i + 1))
            .unwrap();

        let target = CalculationRegistry::<i64>::new();
        let shared = target.find_or_add(Scale { factor: 2 });
        let own = target.find_or_add(Scale { factor: 9 });

        assert_eq!(target.transfer_results_from(&source), 1);
        assert_eq!(shared.status(), SlotStatus::Computed);
        assert_eq!(own.status(), SlotStatus::Pending);
        assert!(!target.contains(Offset { factor: 1 }));
        assert_eq!(target.transfer_results_from(&target), 0);
    }

    #[test]
    fn test_duplicate_is_warm_and_independent() {
        let input = Arc::new(3);
        let original = CalculationRegistry::<i64>::new();
        let handle = original.find_or_add(Scale { factor: 2 });
        handle.slot().get_or_compute(&input, |i| Ok(**i * 2)).unwrap();
        original.find_or_add(Scale { factor: 4 });

        let copy = original.duplicate();
        assert_eq!(copy.len(), 2);
        assert_eq!(copy.status_of(Scale { factor: 2 }), Some(SlotStatus::Computed));
        assert_eq!(copy.status_of(Scale { factor: 4 }), Some(SlotStatus::Pending));

        copy.reset();
        assert_eq!(handle.status(), SlotStatus::Computed);
    }
}
