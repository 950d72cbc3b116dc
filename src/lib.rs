//! Feature-Flow: session-scoped memoization for dynamically discovered calculations.
//!
//! Feature extraction evaluates many scalar features over one input, and many of
//! them ask for the same expensive intermediate values. This crate lets each
//! feature describe what it needs as a plain value and guarantees that equal
//! requests are computed once per session.
//!
//! # Key Features
//!
//! - **Structural deduplication**: a descriptor's derived `Hash + Eq` is its identity
//! - **Compute once, broadcast**: concurrent requesters block on the first computation
//!   and share its value or its failure
//! - **Explicit invalidation**: reset a session between inputs, optionally keeping
//!   named child caches
//! - **Child caches**: intermediate values over derived inputs, handed out fresh, as
//!   singletons, or warmed from sibling sessions
//! - **Symbols**: features addressable by name within a session
//! - **Observable**: every engine event goes through a [`Tracer`]
//!
//! # Example
//!
//! ```
//! use feature_flow::{feature_fn, CalcContext, Calculation, ExecutionError, SessionCache};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! struct Moment {
//!     order: i32,
//! }
//!
//! impl Calculation for Moment {
//!     type Input = Vec<f64>;
//!     type Output = f64;
//!
//!     fn execute(&self, ctx: &CalcContext<'_, Vec<f64>>) -> Result<f64, ExecutionError> {
//!         let values = ctx.input();
//!         Ok(values.iter().map(|v| v.powi(self.order)).sum::<f64>() / values.len() as f64)
//!     }
//! }
//!
//! let mean = feature_fn("mean", |s: &SessionCache<Vec<f64>>| Ok(*s.calculate(Moment { order: 1 })?));
//! let variance = feature_fn("variance", |s: &SessionCache<Vec<f64>>| {
//!     let m1 = *s.calculate(Moment { order: 1 })?;
//!     let m2 = *s.calculate(Moment { order: 2 })?;
//!     Ok(m2 - m1 * m1)
//! });
//!
//! let session = SessionCache::new(Arc::new(vec![1.0, 2.0, 3.0]));
//! assert_eq!(session.evaluate(&mean).unwrap(), 2.0);
//! assert!((session.evaluate(&variance).unwrap() - 2.0 / 3.0).abs() < 1e-12);
//! assert_eq!(session.registry().len(), 2);
//! ```

mod calculation;
mod config;
mod error;
mod feature;
mod hierarchy;
pub mod inspector;
mod key;
mod registry;
mod session;
mod slot;
pub mod tracer;

pub use calculation::{CalcContext, Calculation};
pub use config::{CacheConfig, ChildPolicyKind};
pub use error::{CacheError, ExecutionError};
pub use feature::{feature_fn, Feature, FeatureFn, SymbolTable};
pub use hierarchy::{ChildCacheName, ChildCachePolicy, ChildOutcome, TransferSources};
pub use inspector::{CacheEvent, CalcKey, EventCollector};
pub use key::{CacheKey, CalculationKey, DynEq};
pub use registry::{CalculationRegistry, Lookup, Resolved};
pub use session::{BoundCalculation, SessionCache, SessionCacheBuilder};
pub use slot::{ResultSlot, SlotStatus};
#[cfg(feature = "tracing")]
pub use tracer::TracingTracer;
pub use tracer::{ExecutionResult, NoopTracer, SpanId, Tracer};
