//! Features and the session symbol table.

use std::fmt;
use std::sync::Arc;

use crate::error::CacheError;
use crate::session::SessionCache;

/// A scalar function over a session's input.
///
/// Features request intermediate values from the session while computing their own
/// value; the session deduplicates those requests across all features evaluated
/// against it.
pub trait Feature<I>: Send + Sync {
    /// Compute the feature value.
    fn calculate(&self, session: &SessionCache<I>) -> Result<f64, CacheError>;

    /// Human-readable name, used in diagnostics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<I, F: Feature<I> + ?Sized> Feature<I> for Arc<F> {
    fn calculate(&self, session: &SessionCache<I>) -> Result<f64, CacheError> {
        (**self).calculate(session)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// A feature backed by a closure.
///
/// Created by [`feature_fn`].
pub struct FeatureFn<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a named feature.
///
/// # Example
///
/// ```
/// use feature_flow::{feature_fn, SessionCache};
/// use std::sync::Arc;
///
/// let len = feature_fn("len", |session: &SessionCache<Vec<f64>>| {
///     Ok(session.input().len() as f64)
/// });
/// let session = SessionCache::new(Arc::new(vec![1.0, 2.0]));
/// assert_eq!(session.evaluate(&len).unwrap(), 2.0);
/// ```
pub fn feature_fn<I, F>(name: impl Into<String>, f: F) -> FeatureFn<F>
where
    F: Fn(&SessionCache<I>) -> Result<f64, CacheError> + Send + Sync,
{
    FeatureFn {
        name: name.into(),
        f,
    }
}

impl<I, F> Feature<I> for FeatureFn<F>
where
    F: Fn(&SessionCache<I>) -> Result<f64, CacheError> + Send + Sync,
{
    fn calculate(&self, session: &SessionCache<I>) -> Result<f64, CacheError> {
        (self.f)(session)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FeatureFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureFn").field("name", &self.name).finish()
    }
}

/// Features addressable by name within one session.
///
/// Lets a feature refer to a sibling by symbol instead of by composition. Lookups
/// are concurrent and never fall back to a default value.
pub struct SymbolTable<I> {
    features: papaya::HashMap<Arc<str>, Arc<dyn Feature<I>>, ahash::RandomState>,
}

impl<I> Default for SymbolTable<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> SymbolTable<I> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            features: papaya::HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Register a feature under `symbol`, replacing any previous one.
    ///
    /// Returns `true` if a feature was replaced.
    pub fn register(&self, symbol: impl Into<Arc<str>>, feature: Arc<dyn Feature<I>>) -> bool {
        self.features.pin().insert(symbol.into(), feature).is_some()
    }

    /// Look up the feature registered under `symbol`.
    pub fn get(&self, symbol: &str) -> Option<Arc<dyn Feature<I>>> {
        self.features.pin().get(symbol).cloned()
    }

    /// Returns `true` if `symbol` is registered.
    pub fn contains(&self, symbol: &str) -> bool {
        self.features.pin().contains_key(symbol)
    }

    /// Remove the feature registered under `symbol`.
    pub fn unregister(&self, symbol: &str) -> bool {
        self.features.pin().remove(symbol).is_some()
    }

    /// All registered symbols, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .features
            .pin()
            .keys()
            .map(|symbol| symbol.to_string())
            .collect();
        symbols.sort();
        symbols
    }

    /// Number of registered symbols.
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Returns `true` if no symbol is registered.
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub(crate) fn copy_into(&self, other: &SymbolTable<I>) {
        let target = other.features.pin();
        for (symbol, feature) in self.features.pin().iter() {
            target.insert(symbol.clone(), feature.clone());
        }
    }
}
