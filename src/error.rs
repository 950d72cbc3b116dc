//! Error types for calculation caching.

use std::fmt;
use std::sync::Arc;

/// A failure raised by a calculation's own logic.
///
/// Any type implementing `Into<anyhow::Error>` converts into this with the `?`
/// operator. Failures are cached by the result slot exactly like values, so every
/// caller of one calculation observes the same error until the slot is reset.
///
/// Errors raised by nested resolution inside a calculation (a [`CacheError`]) are
/// converted too, and can be recovered with [`ExecutionError::downcast_ref`].
#[derive(Clone)]
pub struct ExecutionError(Arc<anyhow::Error>);

impl ExecutionError {
    /// Wrap an error as an execution failure.
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        ExecutionError(Arc::new(err.into()))
    }

    /// Create an execution failure from a message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        ExecutionError(Arc::new(anyhow::Error::msg(message)))
    }

    /// The shared inner error.
    pub fn inner(&self) -> &Arc<anyhow::Error> {
        &self.0
    }

    /// Attempts to downcast the inner error to a specific type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if the inner error is of type `E`.
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    /// Returns `true` if both values are the same cached failure.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl<T: Into<anyhow::Error>> From<T> for ExecutionError {
    fn from(err: T) -> Self {
        ExecutionError(Arc::new(err.into()))
    }
}

/// Errors surfaced by the cache to the code that triggered a resolution.
///
/// The engine never swallows these. Only [`CacheError::Execution`] is a cached
/// outcome; every other variant reports a misuse or a structural problem.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// A calculation's own logic failed.
    #[error("calculation failed: {0}")]
    Execution(ExecutionError),

    /// A computed slot was asked for its result with a different input than the
    /// one it was computed with.
    ///
    /// This means two calculations compared equal although they should not have.
    #[error("calculation {calculation} was reused with a different input")]
    CalculationConsistency {
        /// Debug representation of the offending calculation.
        calculation: String,
    },

    /// A child cache was requested for an input type that was never registered.
    #[error("cannot build child cache `{name}` for unregistered input type `{type_name}`")]
    UnsupportedCacheType {
        /// Name of the requested child cache.
        name: String,
        /// Type name of the requested input.
        type_name: &'static str,
    },

    /// A feature was requested by a symbol that is not registered on the session.
    #[error("unknown feature symbol `{symbol}`")]
    UnknownSymbol {
        /// The symbol that failed to resolve.
        symbol: String,
    },

    /// A calculation requested its own result while computing it.
    #[error("calculation cycle detected: {}", .path.join(" -> "))]
    Cycle {
        /// Debug representations of the calculations forming the cycle.
        path: Vec<String>,
    },
}

impl CacheError {
    /// Create an execution failure from any error.
    pub fn execution(err: impl Into<anyhow::Error>) -> Self {
        CacheError::Execution(ExecutionError::new(err))
    }

    /// Returns the execution failure if this is an `Execution` variant.
    pub fn execution_error(&self) -> Option<&ExecutionError> {
        match self {
            CacheError::Execution(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast an execution failure to a specific type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.execution_error().and_then(|e| e.downcast_ref::<E>())
    }
}

impl From<ExecutionError> for CacheError {
    fn from(err: ExecutionError) -> Self {
        CacheError::Execution(err)
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        CacheError::Execution(ExecutionError::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct DivideByZero;

    impl fmt::Display for DivideByZero {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "divide by zero")
        }
    }

    impl std::error::Error for DivideByZero {}

    #[test]
    fn test_execution_error_from_std_error() {
        let err: ExecutionError = DivideByZero.into();
        assert!(err.is::<DivideByZero>());
        assert_eq!(err.to_string(), "divide by zero");
    }

    #[test]
    fn test_execution_error_clone_shares_inner() {
        let err = ExecutionError::msg("boom");
        let copy = err.clone();
        assert!(err.ptr_eq(&copy));
        assert!(!err.ptr_eq(&ExecutionError::msg("boom")));
    }

    #[test]
    fn test_nested_cache_error_is_recoverable() {
        let nested = CacheError::UnknownSymbol {
            symbol: "area".to_string(),
        };
        let err: ExecutionError = nested.into();
        let recovered = err.downcast_ref::<CacheError>();
        assert!(matches!(
            recovered,
            Some(CacheError::UnknownSymbol { symbol }) if symbol == "area"
        ));
    }

    #[test]
    fn test_cache_error_display() {
        let err = CacheError::Cycle {
            path: vec!["A".to_string(), "B".to_string(), "A".to_string()],
        };
        assert_eq!(err.to_string(), "calculation cycle detected: A -> B -> A");

        let err = CacheError::execution(DivideByZero);
        assert_eq!(err.to_string(), "calculation failed: divide by zero");
        assert_eq!(err.downcast_ref::<DivideByZero>(), Some(&DivideByZero));
    }
}
