//! Session cache: one registry bound to one input.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::calculation::{CalcContext, Calculation};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::feature::{Feature, SymbolTable};
use crate::hierarchy::{ChildCachePolicy, ChildCacheName, ChildCaches, TransferSources};
use crate::registry::{CalculationRegistry, Resolved};
use crate::slot::{InFlightGuard, SlotStatus};
use crate::tracer::{ExecutionResult, NoopTracer, Tracer};

/// Settings shared by a root session and all of its descendants.
pub(crate) struct CacheEnvironment {
    pub(crate) tracer: Arc<dyn Tracer>,
    pub(crate) consistency_check: bool,
    pub(crate) default_policy: ChildCachePolicy,
    pub(crate) child_types: ChildTypes,
}

type Configure<J> = Arc<dyn Fn(&SessionCache<J>) + Send + Sync>;

/// Registered configuration for children of one input type.
pub(crate) struct ChildType<J> {
    configure: Option<Configure<J>>,
}

/// Input types child caches may be built for.
#[derive(Default)]
pub(crate) struct ChildTypes {
    types: HashMap<TypeId, Arc<dyn Any + Send + Sync>, ahash::RandomState>,
}

impl ChildTypes {
    fn register<J: Send + Sync + 'static>(&mut self, configure: Option<Configure<J>>) {
        self.types
            .insert(TypeId::of::<J>(), Arc::new(ChildType { configure }));
    }

    pub(crate) fn get<J: Send + Sync + 'static>(&self) -> Option<&ChildType<J>> {
        self.types
            .get(&TypeId::of::<J>())
            .and_then(|t| t.downcast_ref::<ChildType<J>>())
    }
}

impl<J: Send + Sync + 'static> ChildType<J> {
    /// Build a child session with this type's configuration applied.
    pub(crate) fn build(
        &self,
        environment: Arc<CacheEnvironment>,
        input: Arc<J>,
        registry: CalculationRegistry<J>,
    ) -> SessionCache<J> {
        let child = SessionCache::from_parts(environment, input, registry);
        if let Some(configure) = &self.configure {
            configure(&child);
        }
        child
    }
}

/// Binds one [`CalculationRegistry`] to one input value.
///
/// This is the surface feature logic talks to: it resolves calculations, evaluates
/// features, resolves features by symbol, and hands out child caches for derived
/// inputs.
///
/// # Example
///
/// ```
/// use feature_flow::{CalcContext, Calculation, ExecutionError, SessionCache};
/// use std::sync::Arc;
///
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct Count;
///
/// impl Calculation for Count {
///     type Input = String;
///     type Output = usize;
///
///     fn execute(&self, ctx: &CalcContext<'_, String>) -> Result<usize, ExecutionError> {
///         Ok(ctx.input().chars().count())
///     }
/// }
///
/// let session = SessionCache::new(Arc::new("cell".to_string()));
/// let a = session.resolve(Count);
/// let b = session.resolve(Count);
/// assert!(a.resolved().shares_slot_with(b.resolved()));
/// assert_eq!(*a.get_or_compute().unwrap(), 4);
/// ```
pub struct SessionCache<I> {
    pub(crate) input: RwLock<Arc<I>>,
    pub(crate) registry: CalculationRegistry<I>,
    pub(crate) symbols: SymbolTable<I>,
    pub(crate) children: ChildCaches,
    pub(crate) environment: Arc<CacheEnvironment>,
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<SessionCache<Vec<f64>>>();
    assert_sync::<SessionCache<Vec<f64>>>();
}

impl<I: Send + Sync + 'static> SessionCache<I> {
    /// Create a session with default settings.
    pub fn new(input: Arc<I>) -> Self {
        Self::builder().build(input)
    }

    /// Create a builder for customizing the session.
    pub fn builder() -> SessionCacheBuilder<I> {
        SessionCacheBuilder::new()
    }

    pub(crate) fn from_parts(
        environment: Arc<CacheEnvironment>,
        input: Arc<I>,
        registry: CalculationRegistry<I>,
    ) -> Self {
        Self {
            input: RwLock::new(input),
            registry,
            symbols: SymbolTable::new(),
            children: ChildCaches::new(environment.default_policy.clone()),
            environment,
        }
    }

    /// The bound input.
    pub fn input(&self) -> Arc<I> {
        self.input.read().clone()
    }

    /// The session's registry.
    pub fn registry(&self) -> &CalculationRegistry<I> {
        &self.registry
    }

    /// The session's symbol table.
    pub fn symbols(&self) -> &SymbolTable<I> {
        &self.symbols
    }

    /// Resolve a calculation to its canonical descriptor and slot.
    ///
    /// The returned handle computes against the input bound at resolution time.
    pub fn resolve<C>(&self, descriptor: C) -> BoundCalculation<'_, C>
    where
        C: Calculation<Input = I>,
    {
        let resolved = self.registry.find_or_add(descriptor);
        self.environment
            .tracer
            .on_resolve(resolved.key(), resolved.lookup());
        BoundCalculation {
            session: self,
            input: self.input(),
            resolved,
        }
    }

    /// Resolve a calculation and return its value, computing it if needed.
    pub fn calculate<C>(&self, descriptor: C) -> Result<Arc<C::Output>, CacheError>
    where
        C: Calculation<Input = I>,
    {
        self.resolve(descriptor).get_or_compute()
    }

    /// Evaluate a feature against this session.
    pub fn evaluate<F>(&self, feature: &F) -> Result<f64, CacheError>
    where
        F: Feature<I> + ?Sized,
    {
        feature.calculate(self)
    }

    /// Evaluate several features, sharing this session's registry.
    ///
    /// Each feature is evaluated independently; a failure is reported in its own
    /// position and does not stop the rest.
    pub fn evaluate_batch<'f, F>(
        &self,
        features: impl IntoIterator<Item = &'f F>,
    ) -> Vec<Result<f64, CacheError>>
    where
        F: Feature<I> + ?Sized + 'f,
    {
        features
            .into_iter()
            .map(|feature| self.evaluate(feature))
            .collect()
    }

    /// Register a feature under a symbol scoped to this session.
    pub fn register_symbol(&self, symbol: impl Into<Arc<str>>, feature: Arc<dyn Feature<I>>) {
        self.symbols.register(symbol, feature);
    }

    /// Evaluate the feature registered under `symbol`.
    ///
    /// Fails with [`CacheError::UnknownSymbol`] if nothing is registered.
    pub fn resolve_by_symbol(&self, symbol: &str) -> Result<f64, CacheError> {
        let feature = self.symbols.get(symbol);
        self.environment
            .tracer
            .on_symbol_lookup(symbol, feature.is_some());
        let feature = feature.ok_or_else(|| CacheError::UnknownSymbol {
            symbol: symbol.to_string(),
        })?;
        feature.calculate(self)
    }

    /// Reset every slot of this session and of all its children.
    pub fn invalidate(&self) {
        self.invalidate_except(&[]);
    }

    /// Reset every slot of this session and of all children except the protected
    /// ones, which are left untouched.
    pub fn invalidate_except(&self, protected: &[ChildCacheName]) {
        let reset = self.registry.reset();
        self.environment.tracer.on_invalidate(reset, protected);
        for (name, child) in self.children.snapshot() {
            if !protected.contains(&name) {
                child.invalidate_all();
            }
        }
    }

    /// Invalidate the session and bind it to a new input.
    pub fn rebind(&self, input: Arc<I>) {
        self.invalidate();
        *self.input.write() = input;
    }

    /// Port computed outcomes from `other` into equal calculations of this session.
    ///
    /// Returns the number of outcomes ported.
    pub fn transfer_results_from(&self, other: &SessionCache<I>) -> usize {
        let ported = self.registry.transfer_results_from(&other.registry);
        self.environment.tracer.on_transfer(ported);
        ported
    }

    /// Duplicate this session ahead of a branching evaluation.
    ///
    /// The copy is bound to the same input, has the same calculations and symbols,
    /// starts warm with every outcome computed so far, and is independent from
    /// then on. Child caches are not copied.
    pub fn duplicate(&self) -> SessionCache<I> {
        let copy = SessionCache::from_parts(
            self.environment.clone(),
            self.input(),
            CalculationRegistry::new(),
        );
        copy.registry.copy_membership_from(&self.registry);
        let ported = copy.registry.transfer_results_from(&self.registry);
        self.symbols.copy_into(&copy.symbols);
        copy.set_child_policy(self.child_policy());
        self.environment.tracer.on_transfer(ported);
        copy
    }
}

/// A resolved calculation bound to a session's input.
pub struct BoundCalculation<'s, C: Calculation> {
    session: &'s SessionCache<C::Input>,
    input: Arc<C::Input>,
    resolved: Resolved<C>,
}

impl<'s, C: Calculation> BoundCalculation<'s, C> {
    /// The registry-level handle.
    pub fn resolved(&self) -> &Resolved<C> {
        &self.resolved
    }

    /// The canonical descriptor.
    pub fn descriptor(&self) -> &Arc<C> {
        self.resolved.descriptor()
    }

    /// Current state of the shared slot.
    pub fn status(&self) -> SlotStatus {
        self.resolved.status()
    }

    /// Return the cached value, computing it if the slot is pending.
    ///
    /// A cached failure is returned as [`CacheError::Execution`] without retrying.
    pub fn get_or_compute(&self) -> Result<Arc<C::Output>, CacheError> {
        let environment = &self.session.environment;
        let key = self.resolved.key();

        let _guard = InFlightGuard::enter(self.resolved.slot_id(), key).map_err(|path| {
            environment.tracer.on_cycle_detected(&path);
            CacheError::Cycle { path }
        })?;

        self.resolved.slot().get_or_compute_with(
            &self.input,
            environment.consistency_check,
            &|| key.debug_repr(),
            |input| {
                let span_id = environment.tracer.new_span_id();
                environment.tracer.on_execute_start(span_id, key);
                let ctx = CalcContext::new(self.session, input);
                let result = self.resolved.descriptor().execute(&ctx);
                environment
                    .tracer
                    .on_execute_end(span_id, key, ExecutionResult::of(&result));
                result
            },
        )
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`SessionCache`] with customizable settings.
///
/// # Example
///
/// ```
/// use feature_flow::{feature_fn, ChildCachePolicy, SessionCache};
/// use std::sync::Arc;
///
/// let session = SessionCache::<Vec<f64>>::builder()
///     .child_policy(ChildCachePolicy::Fresh)
///     .child_type::<f64>()
///     .symbol(
///         "count",
///         Arc::new(feature_fn("count", |s: &SessionCache<Vec<f64>>| {
///             Ok(s.input().len() as f64)
///         })),
///     )
///     .build(Arc::new(vec![1.0, 2.0, 3.0]));
///
/// assert_eq!(session.resolve_by_symbol("count").unwrap(), 3.0);
/// ```
pub struct SessionCacheBuilder<I> {
    tracer: Arc<dyn Tracer>,
    config: CacheConfig,
    policy: Option<ChildCachePolicy>,
    transfer_sources: TransferSources,
    child_types: ChildTypes,
    symbols: Vec<(Arc<str>, Arc<dyn Feature<I>>)>,
}

impl<I: Send + Sync + 'static> Default for SessionCacheBuilder<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Send + Sync + 'static> SessionCacheBuilder<I> {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            tracer: Arc::new(NoopTracer),
            config: CacheConfig::default(),
            policy: None,
            transfer_sources: TransferSources::new(),
            child_types: ChildTypes::default(),
            symbols: Vec::new(),
        }
    }

    /// Set the tracer that observes this session and all of its children.
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Apply a configuration.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable or disable the input consistency check on computed slots.
    pub fn consistency_check(mut self, enabled: bool) -> Self {
        self.config.consistency_check = enabled;
        self
    }

    /// Set the child cache policy, overriding the configured policy kind.
    pub fn child_policy(mut self, policy: ChildCachePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the sources consulted when the configured policy kind is `transfer`.
    pub fn transfer_sources(mut self, sources: TransferSources) -> Self {
        self.transfer_sources = sources;
        self
    }

    /// Allow child caches over inputs of type `J`.
    pub fn child_type<J: Send + Sync + 'static>(mut self) -> Self {
        self.child_types.register::<J>(None);
        self
    }

    /// Allow child caches over inputs of type `J`, configuring each new child.
    ///
    /// Use this to register the symbols children of this type expose.
    pub fn child_type_with<J, F>(mut self, configure: F) -> Self
    where
        J: Send + Sync + 'static,
        F: Fn(&SessionCache<J>) + Send + Sync + 'static,
    {
        self.child_types.register::<J>(Some(Arc::new(configure)));
        self
    }

    /// Register a feature symbol on the built session.
    pub fn symbol(mut self, symbol: impl Into<Arc<str>>, feature: Arc<dyn Feature<I>>) -> Self {
        self.symbols.push((symbol.into(), feature));
        self
    }

    /// Build the session bound to `input`.
    pub fn build(self, input: Arc<I>) -> SessionCache<I> {
        let policy = self
            .policy
            .unwrap_or_else(|| self.config.child_policy.into_policy(self.transfer_sources));
        let environment = Arc::new(CacheEnvironment {
            tracer: self.tracer,
            consistency_check: self.config.consistency_check,
            default_policy: policy,
            child_types: self.child_types,
        });
        let session = SessionCache::from_parts(environment, input, CalculationRegistry::new());
        for (symbol, feature) in self.symbols {
            session.symbols.register(symbol, feature);
        }
        session
    }
}
