//! Compute-once result slots.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, ExecutionError};
use crate::key::CalculationKey;

// Thread-local stack of slots whose computation is in flight, for cycle detection.
thread_local! {
    static IN_FLIGHT: RefCell<Vec<(usize, CalculationKey)>> = const { RefCell::new(Vec::new()) };
}

/// Observable state of a [`ResultSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    /// Nothing has been computed in the current epoch.
    Pending,
    /// A value is cached.
    Computed,
    /// A failure is cached.
    Failed,
}

enum SlotState<V> {
    Pending,
    Computed(Arc<V>),
    Failed(ExecutionError),
}

impl<V> Clone for SlotState<V> {
    fn clone(&self) -> Self {
        match self {
            SlotState::Pending => SlotState::Pending,
            SlotState::Computed(v) => SlotState::Computed(v.clone()),
            SlotState::Failed(e) => SlotState::Failed(e.clone()),
        }
    }
}

impl<V> SlotState<V> {
    fn status(&self) -> SlotStatus {
        match self {
            SlotState::Pending => SlotStatus::Pending,
            SlotState::Computed(_) => SlotStatus::Computed,
            SlotState::Failed(_) => SlotStatus::Failed,
        }
    }

    fn terminal(&self) -> Option<Result<Arc<V>, ExecutionError>> {
        match self {
            SlotState::Pending => None,
            SlotState::Computed(v) => Some(Ok(v.clone())),
            SlotState::Failed(e) => Some(Err(e.clone())),
        }
    }
}

struct SlotInner<I, V> {
    state: SlotState<V>,
    /// Input the terminal state was computed with. `None` while pending, or after a
    /// result was transplanted from another slot.
    bound: Option<Arc<I>>,
}

/// Holds the at-most-once outcome of one canonical calculation.
///
/// The first caller that finds the slot pending runs the computation while holding
/// the slot's lock. Concurrent callers block on the lock and then read the
/// published outcome, so every caller of one epoch receives the same `Arc` value or
/// the same cached failure.
pub struct ResultSlot<I, V> {
    inner: Mutex<SlotInner<I, V>>,
    epoch: AtomicU64,
}

impl<I, V> Default for ResultSlot<I, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<ResultSlot<Vec<u8>, String>>();
    assert_sync::<ResultSlot<Vec<u8>, String>>();
}

impl<I, V> ResultSlot<I, V> {
    /// Create a pending slot.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: SlotState::Pending,
                bound: None,
            }),
            epoch: AtomicU64::new(0),
        }
    }

    /// Current state of the slot.
    ///
    /// Waits for an in-flight computation to finish.
    pub fn status(&self) -> SlotStatus {
        self.inner.lock().state.status()
    }

    /// Number of resets this slot has gone through.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Read the terminal outcome without computing.
    ///
    /// Returns `None` if the slot is pending.
    pub fn peek(&self) -> Option<Result<Arc<V>, ExecutionError>> {
        self.inner.lock().state.terminal()
    }

    /// Return the cached outcome, computing it with `execute` if pending.
    ///
    /// Fails with [`CacheError::CalculationConsistency`] if the slot already holds an
    /// outcome computed with a different input allocation.
    pub fn get_or_compute<F>(&self, input: &Arc<I>, execute: F) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce(&Arc<I>) -> Result<V, ExecutionError>,
    {
        self.get_or_compute_with(
            input,
            true,
            &|| std::any::type_name::<V>().to_string(),
            execute,
        )
    }

    pub(crate) fn get_or_compute_with<F>(
        &self,
        input: &Arc<I>,
        check_input: bool,
        label: &dyn Fn() -> String,
        execute: F,
    ) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce(&Arc<I>) -> Result<V, ExecutionError>,
    {
        let mut inner = self.inner.lock();

        if let Some(outcome) = inner.state.terminal() {
            let mismatched =
                matches!(&inner.bound, Some(bound) if !Arc::ptr_eq(bound, input));
            if check_input && mismatched {
                return Err(CacheError::CalculationConsistency {
                    calculation: label(),
                });
            }
            if inner.bound.is_none() {
                inner.bound = Some(input.clone());
            }
            return outcome.map_err(CacheError::Execution);
        }

        let state = match execute(input) {
            Ok(value) => SlotState::Computed(Arc::new(value)),
            Err(err) => SlotState::Failed(err),
        };
        inner.state = state;
        inner.bound = Some(input.clone());

        match &inner.state {
            SlotState::Computed(value) => Ok(value.clone()),
            SlotState::Failed(err) => Err(CacheError::Execution(err.clone())),
            SlotState::Pending => unreachable!("slot state was just assigned"),
        }
    }

    /// Return the slot to pending, dropping the cached outcome and bound input.
    ///
    /// Returns `true` if an outcome was discarded.
    pub fn reset(&self) -> bool {
        let mut inner = self.inner.lock();
        let had_outcome = !matches!(inner.state, SlotState::Pending);
        inner.state = SlotState::Pending;
        inner.bound = None;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        had_outcome
    }

    /// Adopt the terminal outcome of another slot verbatim.
    ///
    /// A pending source leaves this slot untouched. The adopted outcome is not bound
    /// to any input until the next `get_or_compute`. Returns `true` if an outcome
    /// was adopted.
    pub fn assign_result(&self, from: &ResultSlot<I, V>) -> bool {
        if std::ptr::eq(self, from) {
            return false;
        }
        let state = from.inner.lock().state.clone();
        if matches!(state, SlotState::Pending) {
            return false;
        }
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.bound = None;
        true
    }
}

/// Marks a slot as in flight on the current thread for the guard's lifetime.
pub(crate) struct InFlightGuard {
    _private: (),
}

impl InFlightGuard {
    /// Enter a slot, or return the cycle path if the slot is already in flight on
    /// this thread.
    pub(crate) fn enter(slot_id: usize, key: &CalculationKey) -> Result<Self, Vec<String>> {
        IN_FLIGHT.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().position(|(id, _)| *id == slot_id) {
                let mut path: Vec<String> =
                    stack[pos..].iter().map(|(_, k)| k.debug_repr()).collect();
                path.push(key.debug_repr());
                return Err(path);
            }
            stack.push((slot_id, key.clone()));
            Ok(InFlightGuard { _private: () })
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        IN_FLIGHT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
