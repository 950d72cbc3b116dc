//! Event recording for tests and offline analysis.
//!
//! [`EventCollector`] is a [`Tracer`] that turns every hook into a serializable
//! [`CacheEvent`].

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::hierarchy::{ChildCacheName, ChildOutcome};
use crate::key::CalculationKey;
use crate::registry::Lookup;
use crate::tracer::{ExecutionResult, SpanId, Tracer};

/// A calculation key in a type-erased, serializable form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalcKey {
    /// The descriptor type name.
    pub calc_type: String,
    /// Debug representation of the descriptor (e.g. `"Moment { order: 2 }"`).
    pub descriptor: String,
}

impl From<&CalculationKey> for CalcKey {
    fn from(key: &CalculationKey) -> Self {
        Self {
            calc_type: key.type_name().to_string(),
            descriptor: key.debug_repr(),
        }
    }
}

/// Events recorded by [`EventCollector`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEvent {
    /// A descriptor was resolved through a registry.
    Resolve { calc: CalcKey, lookup: Lookup },

    /// A calculation started executing.
    ExecuteStart { span_id: SpanId, calc: CalcKey },

    /// A calculation finished executing.
    ExecuteEnd {
        span_id: SpanId,
        calc: CalcKey,
        result: ExecutionResult,
    },

    /// A session was invalidated.
    Invalidate {
        /// Number of slots that held an outcome.
        reset_slots: usize,
        /// Children left untouched.
        protected: Vec<String>,
    },

    /// Results were ported between sessions.
    Transfer { ported: usize },

    /// A child cache was handed out.
    ChildCache {
        name: String,
        input_type: String,
        outcome: ChildOutcome,
    },

    /// A feature symbol was looked up.
    SymbolLookup { symbol: String, found: bool },

    /// A calculation re-entered itself.
    CycleDetected { path: Vec<String> },
}

/// Tracer that accumulates [`CacheEvent`]s for later inspection.
///
/// # Example
///
/// ```
/// use feature_flow::{CacheEvent, EventCollector, SessionCache};
/// use std::sync::Arc;
///
/// let collector = Arc::new(EventCollector::new());
/// let session = SessionCache::<u8>::builder()
///     .tracer(collector.clone())
///     .build(Arc::new(1));
///
/// assert!(session.resolve_by_symbol("missing").is_err());
/// assert_eq!(
///     collector.events(),
///     vec![CacheEvent::SymbolLookup { symbol: "missing".into(), found: false }]
/// );
/// ```
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Mutex<Vec<CacheEvent>>,
    next_span: AtomicU64,
}

impl EventCollector {
    /// Create a new empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get collected events.
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().clone()
    }

    /// Take collected events, clearing the collector.
    pub fn take(&self) -> Vec<CacheEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Clear all collected events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Number of collected events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check if no events have been collected.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn push(&self, event: CacheEvent) {
        self.events.lock().push(event);
    }
}

impl Tracer for EventCollector {
    fn new_span_id(&self) -> SpanId {
        SpanId(self.next_span.fetch_add(1, Ordering::Relaxed))
    }

    fn on_resolve(&self, key: &CalculationKey, lookup: Lookup) {
        self.push(CacheEvent::Resolve {
            calc: key.into(),
            lookup,
        });
    }

    fn on_execute_start(&self, span_id: SpanId, key: &CalculationKey) {
        self.push(CacheEvent::ExecuteStart {
            span_id,
            calc: key.into(),
        });
    }

    fn on_execute_end(&self, span_id: SpanId, key: &CalculationKey, result: ExecutionResult) {
        self.push(CacheEvent::ExecuteEnd {
            span_id,
            calc: key.into(),
            result,
        });
    }

    fn on_invalidate(&self, reset_slots: usize, protected: &[ChildCacheName]) {
        self.push(CacheEvent::Invalidate {
            reset_slots,
            protected: protected.iter().map(|name| name.to_string()).collect(),
        });
    }

    fn on_transfer(&self, ported: usize) {
        self.push(CacheEvent::Transfer { ported });
    }

    fn on_child_cache(&self, name: &ChildCacheName, input_type: &'static str, outcome: ChildOutcome) {
        self.push(CacheEvent::ChildCache {
            name: name.to_string(),
            input_type: input_type.to_string(),
            outcome,
        });
    }

    fn on_symbol_lookup(&self, symbol: &str, found: bool) {
        self.push(CacheEvent::SymbolLookup {
            symbol: symbol.to_string(),
            found,
        });
    }

    fn on_cycle_detected(&self, path: &[String]) {
        self.push(CacheEvent::CycleDetected {
            path: path.to_vec(),
        });
    }
}
