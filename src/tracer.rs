//! Tracer trait for observing cache activity.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! resolution, execution, invalidation and child cache management. The default
//! [`NoopTracer`] costs nothing when tracing is not needed.
//!
//! # Example
//!
//! ```
//! use feature_flow::{CalculationKey, SessionCache, SpanId, Tracer};
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//!
//! struct CountingTracer {
//!     starts: AtomicU64,
//! }
//!
//! impl Tracer for CountingTracer {
//!     fn new_span_id(&self) -> SpanId {
//!         SpanId(self.starts.load(Ordering::Relaxed))
//!     }
//!
//!     fn on_execute_start(&self, _span_id: SpanId, _key: &CalculationKey) {
//!         self.starts.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let session = SessionCache::<Vec<f64>>::builder()
//!     .tracer(Arc::new(CountingTracer { starts: AtomicU64::new(0) }))
//!     .build(Arc::new(vec![1.0]));
//! assert_eq!(session.registry().len(), 0);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::hierarchy::{ChildCacheName, ChildOutcome};
use crate::key::CalculationKey;
use crate::registry::Lookup;

/// Unique identifier for one calculation execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub u64);

/// Calculation execution result classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionResult {
    /// The calculation produced a value.
    Computed,
    /// The calculation failed.
    Failed { message: String },
}

impl ExecutionResult {
    /// Classify the outcome of an execution.
    pub fn of<T>(result: &Result<T, ExecutionError>) -> Self {
        match result {
            Ok(_) => ExecutionResult::Computed,
            Err(err) => ExecutionResult::Failed {
                message: err.to_string(),
            },
        }
    }
}

/// Tracer trait for observing cache activity.
///
/// All methods except [`new_span_id`](Tracer::new_span_id) have empty default
/// implementations, so you only override the events you care about.
///
/// A tracer installed on a root session is shared by all of its child caches and
/// may be called from several threads at once.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new span ID. Called before each calculation execution.
    fn new_span_id(&self) -> SpanId;

    /// Called when a session resolves a descriptor through its registry.
    #[inline]
    fn on_resolve(&self, _key: &CalculationKey, _lookup: Lookup) {}

    /// Called right before a calculation executes.
    #[inline]
    fn on_execute_start(&self, _span_id: SpanId, _key: &CalculationKey) {}

    /// Called after a calculation executed.
    #[inline]
    fn on_execute_end(&self, _span_id: SpanId, _key: &CalculationKey, _result: ExecutionResult) {}

    /// Called when a session is invalidated, with the number of slots that held
    /// an outcome.
    #[inline]
    fn on_invalidate(&self, _reset_slots: usize, _protected: &[ChildCacheName]) {}

    /// Called after results were ported between sessions.
    #[inline]
    fn on_transfer(&self, _ported: usize) {}

    /// Called when a child cache is handed out.
    #[inline]
    fn on_child_cache(&self, _name: &ChildCacheName, _input_type: &'static str, _outcome: ChildOutcome) {}

    /// Called when a feature symbol is looked up.
    #[inline]
    fn on_symbol_lookup(&self, _symbol: &str, _found: bool) {}

    /// Called when a calculation re-entered itself.
    #[inline]
    fn on_cycle_detected(&self, _path: &[String]) {}
}

/// Tracer that discards all events.
///
/// This is the default tracer for [`SessionCache`](crate::SessionCache).
pub struct NoopTracer;

static NOOP_SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        SpanId(NOOP_SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Tracer that forwards events to the `tracing` crate.
///
/// Executions and invalidations are emitted at `debug`, lookups at `trace`, and
/// cycles at `warn`.
#[cfg(feature = "tracing")]
#[derive(Default)]
pub struct TracingTracer {
    next_span: AtomicU64,
}

#[cfg(feature = "tracing")]
impl TracingTracer {
    /// Create a new tracing tracer.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "tracing")]
impl Tracer for TracingTracer {
    fn new_span_id(&self) -> SpanId {
        SpanId(self.next_span.fetch_add(1, Ordering::Relaxed))
    }

    fn on_resolve(&self, key: &CalculationKey, lookup: Lookup) {
        tracing::trace!(calculation = ?key, ?lookup, "resolve");
    }

    fn on_execute_start(&self, span_id: SpanId, key: &CalculationKey) {
        tracing::debug!(span = span_id.0, calculation = ?key, "execute start");
    }

    fn on_execute_end(&self, span_id: SpanId, key: &CalculationKey, result: ExecutionResult) {
        match result {
            ExecutionResult::Computed => {
                tracing::debug!(span = span_id.0, calculation = ?key, "execute end")
            }
            ExecutionResult::Failed { message } => {
                tracing::debug!(span = span_id.0, calculation = ?key, error = %message, "execute failed")
            }
        }
    }

    fn on_invalidate(&self, reset_slots: usize, protected: &[ChildCacheName]) {
        tracing::debug!(reset_slots, protected = protected.len(), "invalidate");
    }

    fn on_transfer(&self, ported: usize) {
        tracing::debug!(ported, "transfer results");
    }

    fn on_child_cache(&self, name: &ChildCacheName, input_type: &'static str, outcome: ChildOutcome) {
        tracing::debug!(child = %name, input_type, ?outcome, "child cache");
    }

    fn on_symbol_lookup(&self, symbol: &str, found: bool) {
        tracing::trace!(symbol, found, "symbol lookup");
    }

    fn on_cycle_detected(&self, path: &[String]) {
        tracing::warn!(path = %path.join(" -> "), "calculation cycle");
    }
}
