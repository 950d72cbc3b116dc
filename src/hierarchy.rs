//! Named child caches over derived inputs.
//!
//! A calculation that needs intermediate values over a different input (a
//! sub-region, a derived mask, a neighbouring object) asks its session for a child
//! cache. Children are keyed by name and input allocation, built lazily, and handed
//! out according to the parent's [`ChildCachePolicy`].

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::registry::CalculationRegistry;
use crate::session::SessionCache;

/// Name of a child cache within its parent.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildCacheName(Arc<str>);

impl ChildCacheName {
    /// Create a name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        ChildCacheName(name.into())
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChildCacheName {
    fn from(name: &str) -> Self {
        ChildCacheName(name.into())
    }
}

impl From<String> for ChildCacheName {
    fn from(name: String) -> Self {
        ChildCacheName(name.into())
    }
}

impl fmt::Debug for ChildCacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for ChildCacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a child was obtained by [`SessionCache::child_cache_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildOutcome {
    /// A new, empty child was built.
    Created,
    /// The stored child already bound to the same input was returned.
    Reused,
    /// A new child was warmed from a transfer source.
    Transferred,
}

/// Strategy for handing out child caches.
#[derive(Clone, Default)]
pub enum ChildCachePolicy {
    /// Build a new, empty child for every request.
    Fresh,
    /// Keep the first child built for a name and input allocation and hand it to
    /// every later request for the same pair.
    ///
    /// A request with a different input allocation gets its own child. Children
    /// already handed out keep their input.
    #[default]
    Singleton,
    /// Warm new children from a matching child of one of the sources, then keep
    /// them like [`Singleton`](ChildCachePolicy::Singleton).
    ///
    /// Without a match the child starts empty.
    Transfer(TransferSources),
}

impl fmt::Debug for ChildCachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildCachePolicy::Fresh => write!(f, "Fresh"),
            ChildCachePolicy::Singleton => write!(f, "Singleton"),
            ChildCachePolicy::Transfer(sources) => write!(f, "Transfer({} sources)", sources.len()),
        }
    }
}

/// Name, input type and input allocation of a child.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct ChildKey {
    name: ChildCacheName,
    input_type: TypeId,
    input: usize,
}

impl ChildKey {
    fn of<J: 'static>(name: ChildCacheName, input: &Arc<J>) -> Self {
        Self {
            name,
            input_type: TypeId::of::<J>(),
            input: Arc::as_ptr(input) as *const () as usize,
        }
    }
}

/// Type-erased child session.
pub(crate) trait ErasedSession: Send + Sync {
    fn invalidate_all(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<J: Send + Sync + 'static> ErasedSession for SessionCache<J> {
    fn invalidate_all(&self) {
        self.invalidate();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn downcast_child<J: Send + Sync + 'static>(
    child: Arc<dyn ErasedSession>,
) -> Option<Arc<SessionCache<J>>> {
    child.into_any().downcast::<SessionCache<J>>().ok()
}

/// Children stored under one key, oldest first.
struct ChildEntry {
    // Holding the input keeps the address in the key from being reused.
    _input: Arc<dyn Any + Send + Sync>,
    children: Vec<Arc<dyn ErasedSession>>,
}

impl ChildEntry {
    fn new<J: Send + Sync + 'static>(input: Arc<J>) -> Self {
        Self {
            _input: input,
            children: Vec::new(),
        }
    }
}

/// Children owned by one session.
///
/// The entries lock is only held for map access. Sources are consulted and
/// children are built without it, so no thread ever holds two sessions' locks.
pub(crate) struct ChildCaches {
    policy: Mutex<ChildCachePolicy>,
    entries: Mutex<HashMap<ChildKey, ChildEntry, ahash::RandomState>>,
}

impl ChildCaches {
    pub(crate) fn new(policy: ChildCachePolicy) -> Self {
        Self {
            policy: Mutex::new(policy),
            entries: Mutex::new(HashMap::with_hasher(ahash::RandomState::new())),
        }
    }

    /// Every stored child, including all children built under [`ChildCachePolicy::Fresh`].
    pub(crate) fn snapshot(&self) -> Vec<(ChildCacheName, Arc<dyn ErasedSession>)> {
        self.entries
            .lock()
            .iter()
            .flat_map(|(key, entry)| {
                entry
                    .children
                    .iter()
                    .map(move |child| (key.name.clone(), child.clone()))
            })
            .collect()
    }

    fn latest(&self, key: &ChildKey) -> Option<Arc<dyn ErasedSession>> {
        self.entries.lock().get(key)?.children.last().cloned()
    }

    fn push<J: Send + Sync + 'static>(
        &self,
        key: ChildKey,
        input: Arc<J>,
        child: Arc<SessionCache<J>>,
    ) {
        self.entries
            .lock()
            .entry(key)
            .or_insert_with(|| ChildEntry::new(input))
            .children
            .push(child);
    }

    /// Store `child` unless another requester stored one for the key first.
    fn insert_if_absent<J: Send + Sync + 'static>(
        &self,
        key: ChildKey,
        input: Arc<J>,
        child: Arc<SessionCache<J>>,
        outcome: ChildOutcome,
    ) -> (Arc<SessionCache<J>>, ChildOutcome) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert_with(|| ChildEntry::new(input));
        if let Some(existing) = entry.children.last().cloned().and_then(downcast_child::<J>) {
            return (existing, ChildOutcome::Reused);
        }
        entry.children.push(child.clone());
        (child, outcome)
    }
}

/// A cache whose children can seed new children elsewhere.
pub(crate) trait TransferSource: Send + Sync {
    fn child(&self, key: &ChildKey) -> Option<Arc<dyn ErasedSession>>;
}

impl<P: Send + Sync + 'static> TransferSource for SessionCache<P> {
    fn child(&self, key: &ChildKey) -> Option<Arc<dyn ErasedSession>> {
        self.children.latest(key)
    }
}

/// Caches consulted by [`ChildCachePolicy::Transfer`].
///
/// Typically the sessions of sibling evaluations that already built children over
/// the same derived inputs.
#[derive(Clone, Default)]
pub struct TransferSources {
    sources: Vec<Arc<dyn TransferSource>>,
}

impl TransferSources {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session whose children may be transferred.
    pub fn with_cache<P: Send + Sync + 'static>(mut self, cache: Arc<SessionCache<P>>) -> Self {
        self.push(cache);
        self
    }

    /// Add a session whose children may be transferred.
    pub fn push<P: Send + Sync + 'static>(&mut self, cache: Arc<SessionCache<P>>) {
        self.sources.push(cache);
    }

    /// Number of sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns `true` if there are no sources.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// First source child with the same key that is still bound to the same input.
    fn find<J: Send + Sync + 'static>(
        &self,
        key: &ChildKey,
        input: &Arc<J>,
    ) -> Option<Arc<SessionCache<J>>> {
        self.sources
            .iter()
            .filter_map(|source| source.child(key))
            .filter_map(downcast_child::<J>)
            .find(|child| Arc::ptr_eq(&child.input(), input))
    }
}

impl<I: Send + Sync + 'static> SessionCache<I> {
    /// Get the child cache named `name` for a derived input.
    ///
    /// The child is built on first request and afterwards handed out according to
    /// this session's [`ChildCachePolicy`]. Children are never rebound: a request
    /// for another input allocation gets another child. Children share the tracer
    /// and configuration of the root session.
    ///
    /// Fails with [`CacheError::UnsupportedCacheType`] if no child type was
    /// registered for `J`.
    ///
    /// # Example
    ///
    /// ```
    /// use feature_flow::SessionCache;
    /// use std::sync::Arc;
    ///
    /// let session = SessionCache::builder()
    ///     .child_type::<Vec<u8>>()
    ///     .build(Arc::new(vec![3u8, 7, 9]));
    ///
    /// let mask = Arc::new(vec![1u8, 0, 1]);
    /// let a = session.child_cache_for("mask", mask.clone()).unwrap();
    /// let b = session.child_cache_for("mask", mask).unwrap();
    /// assert!(Arc::ptr_eq(&a, &b));
    /// ```
    pub fn child_cache_for<J>(
        &self,
        name: impl Into<ChildCacheName>,
        input: Arc<J>,
    ) -> Result<Arc<SessionCache<J>>, CacheError>
    where
        J: Send + Sync + 'static,
    {
        let name = name.into();
        let environment = &self.environment;
        let child_type =
            environment
                .child_types
                .get::<J>()
                .ok_or_else(|| CacheError::UnsupportedCacheType {
                    name: name.to_string(),
                    type_name: type_name::<J>(),
                })?;

        let key = ChildKey::of(name.clone(), &input);
        let policy = self.children.policy.lock().clone();

        let stored = match policy {
            ChildCachePolicy::Fresh => None,
            _ => self.children.latest(&key).and_then(downcast_child::<J>),
        };
        let (child, outcome) = match stored {
            Some(existing) => (existing, ChildOutcome::Reused),
            None => {
                let (registry, outcome) = match &policy {
                    ChildCachePolicy::Transfer(sources) => match sources.find(&key, &input) {
                        Some(source) => (source.registry.duplicate(), ChildOutcome::Transferred),
                        None => (CalculationRegistry::new(), ChildOutcome::Created),
                    },
                    _ => (CalculationRegistry::new(), ChildOutcome::Created),
                };
                let built =
                    Arc::new(child_type.build(environment.clone(), input.clone(), registry));
                match policy {
                    ChildCachePolicy::Fresh => {
                        self.children.push(key, input, built.clone());
                        (built, outcome)
                    }
                    // Racing requesters converge on whichever child was stored first.
                    _ => self.children.insert_if_absent(key, input, built, outcome),
                }
            }
        };

        environment
            .tracer
            .on_child_cache(&name, type_name::<J>(), outcome);
        Ok(child)
    }

    /// Replace the policy used for children requested from now on.
    pub fn set_child_policy(&self, policy: ChildCachePolicy) {
        *self.children.policy.lock() = policy;
    }

    /// The policy used for child requests.
    pub fn child_policy(&self) -> ChildCachePolicy {
        self.children.policy.lock().clone()
    }

    /// Names of all stored children, sorted and without repeats.
    pub fn child_names(&self) -> Vec<ChildCacheName> {
        let mut names: Vec<ChildCacheName> = self
            .children
            .entries
            .lock()
            .keys()
            .map(|key| key.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
