//! Tests for child caches, symbols and hierarchical invalidation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use feature_flow::{
    feature_fn, CacheError, CalcContext, Calculation, ChildCacheName, ChildCachePolicy,
    ExecutionError, Feature, SessionCache, SlotStatus, TransferSources,
};

/// A labelled object: pixel intensities plus a mask selecting its interior.
struct Object {
    pixels: Vec<u32>,
    interior: Arc<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Sum;

impl Calculation for Sum {
    type Input = Vec<u32>;
    type Output = u32;

    fn execute(&self, ctx: &CalcContext<'_, Vec<u32>>) -> Result<u32, ExecutionError> {
        Ok(ctx.input().iter().sum())
    }
}

/// Sums the object's interior through a named child cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InteriorSum;

impl Calculation for InteriorSum {
    type Input = Object;
    type Output = u32;

    fn execute(&self, ctx: &CalcContext<'_, Object>) -> Result<u32, ExecutionError> {
        let interior = ctx.child_cache_for("interior", ctx.input().interior.clone())?;
        Ok(*interior.calculate(Sum)?)
    }
}

fn object(pixels: Vec<u32>, interior: Vec<u32>) -> Arc<Object> {
    Arc::new(Object {
        pixels,
        interior: Arc::new(interior),
    })
}

// =============================================================================
// Child policies
// =============================================================================

#[test]
fn test_child_cache_through_calculation() {
    let session = SessionCache::builder()
        .child_type::<Vec<u32>>()
        .build(object(vec![1, 2, 3], vec![2]));

    assert_eq!(*session.calculate(InteriorSum).unwrap(), 2);
    let child = session
        .child_cache_for("interior", session.input().interior.clone())
        .unwrap();
    assert_eq!(child.registry().status_of(Sum), Some(SlotStatus::Computed));
}

#[test]
fn test_unsupported_child_type_is_a_cached_failure() {
    let session = SessionCache::new(object(vec![1], vec![1]));
    let err = session.calculate(InteriorSum).unwrap_err();
    let nested = err.downcast_ref::<CacheError>();
    assert!(matches!(
        nested,
        Some(CacheError::UnsupportedCacheType { name, .. }) if name == "interior"
    ));
}

#[test]
fn test_concurrent_child_requests_converge() {
    const THREADS: usize = 6;
    let session = SessionCache::builder()
        .child_type::<Vec<u32>>()
        .build(object(vec![], vec![]));
    let interior = Arc::new(vec![7u32]);
    let barrier = Barrier::new(THREADS);

    let children: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let session = &session;
                let barrier = &barrier;
                let interior = interior.clone();
                scope.spawn(move || {
                    barrier.wait();
                    session.child_cache_for("interior", interior).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(children.iter().all(|c| Arc::ptr_eq(c, &children[0])));
}

#[test]
fn test_policy_can_change_between_evaluations() {
    let session = SessionCache::builder()
        .child_type::<Vec<u32>>()
        .build(object(vec![], vec![]));
    let interior = Arc::new(vec![1u32]);

    let a = session.child_cache_for("interior", interior.clone()).unwrap();
    session.set_child_policy(ChildCachePolicy::Fresh);
    let b = session.child_cache_for("interior", interior).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert!(matches!(session.child_policy(), ChildCachePolicy::Fresh));
}

#[test]
fn test_transfer_policy_reuses_sibling_results() {
    let shared_interior = Arc::new(vec![4u32, 4]);
    let sibling = Arc::new(
        SessionCache::builder()
            .child_type::<Vec<u32>>()
            .build(Arc::new(Object {
                pixels: vec![1],
                interior: shared_interior.clone(),
            })),
    );
    assert_eq!(*sibling.calculate(InteriorSum).unwrap(), 8);

    let session = SessionCache::builder()
        .child_type::<Vec<u32>>()
        .child_policy(ChildCachePolicy::Transfer(
            TransferSources::new().with_cache(sibling.clone()),
        ))
        .build(Arc::new(Object {
            pixels: vec![2],
            interior: shared_interior.clone(),
        }));

    let child = session.child_cache_for("interior", shared_interior).unwrap();
    assert_eq!(child.registry().status_of(Sum), Some(SlotStatus::Computed));
    assert_eq!(*session.calculate(InteriorSum).unwrap(), 8);

    // The transferred child is independent of the sibling's.
    child.invalidate();
    let sibling_child = sibling
        .child_cache_for("interior", sibling.input().interior.clone())
        .unwrap();
    assert_eq!(sibling_child.registry().status_of(Sum), Some(SlotStatus::Computed));
}

#[test]
fn test_singleton_keeps_handed_out_children_bound() {
    let session = SessionCache::builder()
        .child_type::<Vec<u32>>()
        .build(object(vec![], vec![]));
    let left = Arc::new(vec![1u32, 1]);
    let right = Arc::new(vec![5u32]);

    let left_child = session.child_cache_for("interior", left.clone()).unwrap();
    assert_eq!(*left_child.calculate(Sum).unwrap(), 2);
    let right_child = session.child_cache_for("interior", right).unwrap();
    assert_eq!(*right_child.calculate(Sum).unwrap(), 5);

    assert!(!Arc::ptr_eq(&left_child, &right_child));
    assert!(Arc::ptr_eq(&left_child.input(), &left));
    assert_eq!(*left_child.calculate(Sum).unwrap(), 2);
    let again = session.child_cache_for("interior", left).unwrap();
    assert!(Arc::ptr_eq(&again, &left_child));
}

#[test]
fn test_mutual_transfer_sources_do_not_block() {
    const ROUNDS: u32 = 200;
    let build = || {
        Arc::new(
            SessionCache::builder()
                .child_type::<Vec<u32>>()
                .build(object(vec![], vec![])),
        )
    };
    let a = build();
    let b = build();
    a.set_child_policy(ChildCachePolicy::Transfer(
        TransferSources::new().with_cache(b.clone()),
    ));
    b.set_child_policy(ChildCachePolicy::Transfer(
        TransferSources::new().with_cache(a.clone()),
    ));
    let interiors: Vec<Arc<Vec<u32>>> = (0..ROUNDS).map(|i| Arc::new(vec![i, 1])).collect();
    let barrier = Barrier::new(2);

    thread::scope(|scope| {
        for session in [&a, &b] {
            let barrier = &barrier;
            let interiors = &interiors;
            scope.spawn(move || {
                barrier.wait();
                for interior in interiors {
                    let child = session.child_cache_for("interior", interior.clone()).unwrap();
                    assert_eq!(*child.calculate(Sum).unwrap(), interior[0] + 1);
                }
            });
        }
    });

    for interior in &interiors {
        let child = a.child_cache_for("interior", interior.clone()).unwrap();
        assert_eq!(child.registry().status_of(Sum), Some(SlotStatus::Computed));
    }
}

// =============================================================================
// Hierarchical invalidation
// =============================================================================

#[test]
fn test_invalidate_recurses_into_children() {
    let session = SessionCache::builder()
        .child_type::<Vec<u32>>()
        .build(object(vec![1], vec![3]));
    session.calculate(InteriorSum).unwrap();
    let child = session
        .child_cache_for("interior", session.input().interior.clone())
        .unwrap();

    session.invalidate();
    assert_eq!(session.registry().status_of(InteriorSum), Some(SlotStatus::Pending));
    assert_eq!(child.registry().status_of(Sum), Some(SlotStatus::Pending));
}

#[test]
fn test_invalidate_reaches_older_fresh_children() {
    let session = SessionCache::builder()
        .child_type::<Vec<u32>>()
        .child_policy(ChildCachePolicy::Fresh)
        .build(object(vec![1], vec![3]));
    let interior = session.input().interior.clone();

    let first = session.child_cache_for("interior", interior.clone()).unwrap();
    first.calculate(Sum).unwrap();
    let second = session.child_cache_for("interior", interior).unwrap();
    second.calculate(Sum).unwrap();

    session.invalidate();
    assert_eq!(first.registry().status_of(Sum), Some(SlotStatus::Pending));
    assert_eq!(second.registry().status_of(Sum), Some(SlotStatus::Pending));
}

#[test]
fn test_invalidate_except_preserves_protected_children() {
    let session = SessionCache::builder()
        .child_type::<Vec<u32>>()
        .build(object(vec![1], vec![3]));
    let interior = session.input().interior.clone();
    let border = Arc::new(vec![9u32]);

    let kept = session.child_cache_for("interior", interior).unwrap();
    let cleared = session.child_cache_for("border", border).unwrap();
    kept.calculate(Sum).unwrap();
    cleared.calculate(Sum).unwrap();

    session.invalidate_except(&[ChildCacheName::from("interior")]);
    assert_eq!(kept.registry().status_of(Sum), Some(SlotStatus::Computed));
    assert_eq!(cleared.registry().status_of(Sum), Some(SlotStatus::Pending));
}

// =============================================================================
// Symbols
// =============================================================================

#[test]
fn test_features_resolve_siblings_by_symbol() {
    let executions = Arc::new(AtomicUsize::new(0));
    let counter = executions.clone();

    let total: Arc<dyn Feature<Object>> =
        Arc::new(feature_fn("total", move |s: &SessionCache<Object>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(s.input().pixels.iter().sum::<u32>() as f64)
        }));
    let mean = feature_fn("mean", |s: &SessionCache<Object>| {
        let total = s.resolve_by_symbol("total")?;
        Ok(total / s.input().pixels.len() as f64)
    });

    let session = SessionCache::builder()
        .symbol("total", total)
        .build(object(vec![2, 4, 6], vec![]));

    assert_eq!(session.evaluate(&mean).unwrap(), 4.0);
    assert_eq!(session.resolve_by_symbol("total").unwrap(), 12.0);
    // Features are evaluated on every request; only calculations are memoized.
    assert_eq!(executions.load(Ordering::SeqCst), 2);
    assert_eq!(session.symbols().symbols(), vec!["total".to_string()]);
}

#[test]
fn test_unknown_symbol_fails() {
    let session = SessionCache::new(object(vec![], vec![]));
    let err = session.resolve_by_symbol("perimeter").unwrap_err();
    assert!(matches!(err, CacheError::UnknownSymbol { ref symbol } if symbol == "perimeter"));
    assert_eq!(err.to_string(), "unknown feature symbol `perimeter`");
}

#[test]
fn test_child_types_register_child_symbols() {
    let session = SessionCache::builder()
        .child_type_with::<Vec<u32>, _>(|child| {
            child.register_symbol(
                "sum",
                Arc::new(feature_fn("sum", |s: &SessionCache<Vec<u32>>| {
                    Ok(*s.calculate(Sum)? as f64)
                })),
            );
        })
        .build(object(vec![], vec![5, 6]));

    let child = session
        .child_cache_for("interior", session.input().interior.clone())
        .unwrap();
    assert_eq!(child.resolve_by_symbol("sum").unwrap(), 11.0);
    assert!(session.resolve_by_symbol("sum").is_err());
}

#[test]
fn test_duplicate_copies_symbols_but_not_children() {
    let session = SessionCache::<Object>::builder()
        .child_type::<Vec<u32>>()
        .symbol(
            "size",
            Arc::new(feature_fn("size", |s: &SessionCache<Object>| {
                Ok(s.input().pixels.len() as f64)
            })),
        )
        .build(object(vec![1, 1], vec![1]));
    session.calculate(InteriorSum).unwrap();

    let copy = session.duplicate();
    assert_eq!(copy.resolve_by_symbol("size").unwrap(), 2.0);
    assert!(copy.child_names().is_empty());
    assert_eq!(copy.registry().status_of(InteriorSum), Some(SlotStatus::Computed));
}
