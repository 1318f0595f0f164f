//! Type-erased keys and values.
//!
//! Instances store every value behind an `Arc<dyn ...>` so that one store can hold the outputs
//! of nodes with different value types. Typed handles downcast on the way out.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Types that can be produced by a node.
///
/// Automatically implemented for every `Clone + PartialEq + Debug + Send + Sync + 'static` type.
/// `PartialEq` is what lets an instance skip an operation whose inputs did not change.
pub trait NodeValue: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Debug + Send + Sync + 'static> NodeValue for T {}

/// Types that can be used as keys of a key list.
pub trait NodeKey: NodeValue + Eq + Hash {}

impl<T: NodeValue + Eq + Hash> NodeKey for T {}

/// Object-safe view of a [`NodeValue`].
pub trait DynValue: Debug + Send + Sync {
    /// Get the value as `Any` for downcasting.
    fn erased_any(&self) -> &dyn Any;

    /// Compare with another erased value of possibly different type.
    fn erased_eq(&self, other: &dyn Any) -> bool;

    /// Get the type name of the value.
    fn type_name(&self) -> &'static str;
}

impl<T: NodeValue> DynValue for T {
    fn erased_any(&self) -> &dyn Any {
        self
    }

    fn erased_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Object-safe view of a [`NodeKey`].
pub trait DynKey: DynHash + Debug + Send + Sync {
    /// Get the key as `Any` for downcasting.
    fn erased_any(&self) -> &dyn Any;

    /// Compare with another erased key of possibly different type.
    fn erased_eq(&self, other: &dyn Any) -> bool;

    /// The key as a plain value, used when a key list is handed to an operation.
    fn erased_value(&self) -> AnyValue;

    /// Get the type name of the key.
    fn key_type_name(&self) -> &'static str;
}

impl<K: NodeKey> DynKey for K {
    fn erased_any(&self) -> &dyn Any {
        self
    }

    fn erased_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<K>().is_some_and(|o| self == o)
    }

    fn erased_value(&self) -> AnyValue {
        AnyValue::new(self.clone())
    }

    fn key_type_name(&self) -> &'static str {
        std::any::type_name::<K>()
    }
}

// Enable Hash for dyn DynKey using the dyn-hash crate
dyn_hash::hash_trait_object!(DynKey);

/// A type-erased node value.
///
/// Cheap to clone; equality compares the concrete values.
#[derive(Clone)]
pub struct AnyValue(Arc<dyn DynValue>);

impl AnyValue {
    /// Erase a value.
    pub fn new<T: NodeValue>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Downcast the value to its original type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.erased_any().downcast_ref()
    }

    /// Get the type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.0.erased_any().type_id()
    }
}

impl PartialEq for AnyValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.erased_eq(other.0.erased_any())
    }
}

impl Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

/// A type-erased key.
///
/// Hashing and equality include the key's concrete type, so `1u32` and `1i64` are different keys.
#[derive(Clone)]
pub struct AnyKey {
    key_type: TypeId,
    key: Arc<dyn DynKey>,
}

impl AnyKey {
    /// Erase a key.
    pub fn new<K: NodeKey>(key: K) -> Self {
        Self {
            key_type: TypeId::of::<K>(),
            key: Arc::new(key),
        }
    }

    /// Downcast the key to its original type.
    pub fn downcast_ref<K: 'static>(&self) -> Option<&K> {
        self.key.erased_any().downcast_ref()
    }

    /// Get the type name of the wrapped key.
    pub fn type_name(&self) -> &'static str {
        self.key.key_type_name()
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.key_type
    }

    pub(crate) fn to_value(&self) -> AnyValue {
        self.key.erased_value()
    }
}

impl Debug for AnyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.key, f)
    }
}

impl Hash for AnyKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_type.hash(state);
        self.key.hash(state);
    }
}

impl PartialEq for AnyKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_type == other.key_type && self.key.erased_eq(other.key.erased_any())
    }
}

impl Eq for AnyKey {}

/// Downcast helpers shared by typed handles. They return `None` only when a handle's type
/// parameter disagrees with the stored value, which the definition rejects up front.
pub(crate) fn extract_value<T: NodeValue>(value: &AnyValue) -> Option<T> {
    value.downcast_ref::<T>().cloned()
}

pub(crate) fn extract_keys<K: NodeKey>(value: &AnyValue) -> Option<Vec<K>> {
    value
        .downcast_ref::<Vec<AnyKey>>()?
        .iter()
        .map(|key| key.downcast_ref::<K>().cloned())
        .collect()
}

pub(crate) fn extract_list<T: NodeValue>(value: &AnyValue) -> Option<Vec<T>> {
    value
        .downcast_ref::<Vec<AnyValue>>()?
        .iter()
        .map(|item| item.downcast_ref::<T>().cloned())
        .collect()
}
