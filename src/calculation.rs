//! Calculation descriptor trait and execution context.

use std::sync::Arc;

use crate::error::{CacheError, ExecutionError};
use crate::feature::Feature;
use crate::hierarchy::ChildCacheName;
use crate::key::CacheKey;
use crate::session::SessionCache;

/// A request for an intermediate value, identified by its own fields.
///
/// A descriptor is both the identity of a computation and the code that runs it.
/// Every field takes part in the derived `Hash + Eq`, and the descriptor holds no
/// result state: results live in the [`ResultSlot`](crate::ResultSlot) owned by the
/// registry. Two descriptors that compare equal are therefore guaranteed to compute
/// the same thing, and the registry runs only one of them per session.
///
/// # Example
///
/// ```
/// use feature_flow::{CalcContext, Calculation, ExecutionError, SessionCache};
/// use std::sync::Arc;
///
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct SumAbove {
///     threshold: i64,
/// }
///
/// impl Calculation for SumAbove {
///     type Input = Vec<i64>;
///     type Output = i64;
///
///     fn execute(&self, ctx: &CalcContext<'_, Vec<i64>>) -> Result<i64, ExecutionError> {
///         Ok(ctx.input().iter().filter(|v| **v > self.threshold).sum())
///     }
/// }
///
/// let session = SessionCache::new(Arc::new(vec![1, 5, 10]));
/// assert_eq!(*session.calculate(SumAbove { threshold: 2 }).unwrap(), 15);
/// ```
///
/// Related kinds of calculation can share one descriptor type as an enum: each
/// variant carries its own identity payload and equality stays derived.
pub trait Calculation: CacheKey + Sized + 'static {
    /// The input this calculation is evaluated against.
    type Input: Send + Sync + 'static;

    /// The value produced by this calculation.
    type Output: Send + Sync + 'static;

    /// Compute the value.
    ///
    /// Called at most once per slot epoch, while the slot's lock is held. Use the
    /// context to read the input and to request nested calculations.
    fn execute(&self, ctx: &CalcContext<'_, Self::Input>) -> Result<Self::Output, ExecutionError>;
}

/// Context provided to calculations during execution.
pub struct CalcContext<'a, I> {
    session: &'a SessionCache<I>,
    input: &'a Arc<I>,
}

impl<'a, I: Send + Sync + 'static> CalcContext<'a, I> {
    pub(crate) fn new(session: &'a SessionCache<I>, input: &'a Arc<I>) -> Self {
        Self { session, input }
    }

    /// The input the calculation is bound to.
    pub fn input(&self) -> &'a I {
        self.input
    }

    /// The input as a shared pointer, for deriving child inputs.
    pub fn input_arc(&self) -> &'a Arc<I> {
        self.input
    }

    /// The session the calculation was resolved in.
    pub fn session(&self) -> &'a SessionCache<I> {
        self.session
    }

    /// Resolve and compute a nested calculation in the same session.
    pub fn calculate<C>(&self, descriptor: C) -> Result<Arc<C::Output>, CacheError>
    where
        C: Calculation<Input = I>,
    {
        self.session.calculate(descriptor)
    }

    /// Evaluate a feature against the same session.
    pub fn evaluate<F>(&self, feature: &F) -> Result<f64, CacheError>
    where
        F: Feature<I> + ?Sized,
    {
        self.session.evaluate(feature)
    }

    /// Get a named child cache of the session for a derived input.
    pub fn child_cache_for<J>(
        &self,
        name: impl Into<ChildCacheName>,
        input: Arc<J>,
    ) -> Result<Arc<SessionCache<J>>, CacheError>
    where
        J: Send + Sync + 'static,
    {
        self.session.child_cache_for(name, input)
    }
}
