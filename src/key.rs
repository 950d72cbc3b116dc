//! Descriptor identity.
//!
//! A calculation descriptor is its own key: two descriptors name the same
//! calculation when they have the same concrete type and compare equal. The
//! registry stores descriptors of many types in one map, so equality and hashing
//! go through trait objects here.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Equality across erased descriptor types.
///
/// Values of different concrete types are never equal.
pub trait DynEq: Any {
    /// `true` if `other` is a `Self` equal to this value.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        match other.downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }
}

/// A value usable as descriptor identity.
///
/// Every `Hash + Eq + Debug + Send + Sync + 'static` type qualifies, so a
/// descriptor's derived `PartialEq` and `Hash` decide which calculations are shared.
pub trait CacheKey: DynHash + DynEq + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Name of the descriptor type, for diagnostics.
    fn descriptor_type_name(&self) -> &'static str;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> CacheKey for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn descriptor_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

dyn_hash::hash_trait_object!(CacheKey);

/// Registry key of one canonical descriptor.
///
/// The key points at the canonical descriptor itself rather than at a copy, so
/// resolving a calculation costs one `Arc` clone.
#[derive(Clone)]
pub struct CalculationKey {
    calc_type: TypeId,
    descriptor: Arc<dyn CacheKey>,
}

impl CalculationKey {
    /// Key for `descriptor`, sharing its allocation.
    pub fn of<C: CacheKey>(descriptor: &Arc<C>) -> Self {
        Self {
            calc_type: TypeId::of::<C>(),
            descriptor: descriptor.clone(),
        }
    }

    /// `Debug` rendering of the descriptor, used in cycle paths and events.
    pub fn debug_repr(&self) -> String {
        format!("{:?}", self.descriptor)
    }

    pub fn downcast<C: 'static>(&self) -> Option<&C> {
        self.descriptor.as_any().downcast_ref()
    }

    pub fn calc_type(&self) -> TypeId {
        self.calc_type
    }

    pub fn type_name(&self) -> &'static str {
        self.descriptor.descriptor_type_name()
    }
}

impl Debug for CalculationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.descriptor, f)
    }
}

impl Hash for CalculationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.calc_type.hash(state);
        self.descriptor.hash(state);
    }
}

impl PartialEq for CalculationKey {
    fn eq(&self, other: &Self) -> bool {
        self.calc_type == other.calc_type && self.descriptor.dyn_eq(other.descriptor.as_any())
    }
}

impl Eq for CalculationKey {}
