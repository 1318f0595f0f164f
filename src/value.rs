//! Addresses of values inside an instance, the logical clock, and the ordered key set.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use ahash::HashSet;

use crate::key::{AnyKey, NodeKey};
use crate::name::{KeyListNodeName, KeyedNodeName, NodeName};

/// A logical timestamp (generation) of an instance.
///
/// Every effective input mutation ticks the instance clock by one. Values remember the
/// generation they were computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The generation of inputs that were never set.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Create a timestamp from its raw counter value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw counter value.
    pub const fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// The address of one observable piece of state in an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueId {
    /// The value of a plain node.
    Nonkeyed(Arc<str>),
    /// The ordered membership of a key list node.
    FullKeyList(Arc<str>),
    /// The value of a keyed node at one key.
    Keyed(Arc<str>, AnyKey),
    /// The values of a keyed node at all current keys, in key list order.
    FullKeyedList(Arc<str>),
}

impl ValueId {
    /// Address of a plain node's value.
    pub fn nonkeyed<T>(name: &NodeName<T>) -> Self {
        ValueId::Nonkeyed(name.shared_name())
    }

    /// Address of a key list's membership.
    pub fn key_list<K>(name: &KeyListNodeName<K>) -> Self {
        ValueId::FullKeyList(name.shared_name())
    }

    /// Address of a keyed node's value at `key`.
    pub fn keyed<K: NodeKey, T>(name: &KeyedNodeName<K, T>, key: K) -> Self {
        ValueId::Keyed(name.shared_name(), AnyKey::new(key))
    }

    /// Address of a keyed node's full output.
    pub fn keyed_list<K, T>(name: &KeyedNodeName<K, T>) -> Self {
        ValueId::FullKeyedList(name.shared_name())
    }

    /// The name of the node this value belongs to.
    pub fn node_name(&self) -> &str {
        match self {
            ValueId::Nonkeyed(name)
            | ValueId::FullKeyList(name)
            | ValueId::Keyed(name, _)
            | ValueId::FullKeyedList(name) => name,
        }
    }

    pub(crate) fn shared_node_name(&self) -> &Arc<str> {
        match self {
            ValueId::Nonkeyed(name)
            | ValueId::FullKeyList(name)
            | ValueId::Keyed(name, _)
            | ValueId::FullKeyedList(name) => name,
        }
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueId::Nonkeyed(name) => write!(f, "{name}"),
            ValueId::FullKeyList(name) => write!(f, "{name}[keys]"),
            ValueId::Keyed(name, key) => write!(f, "{name}[{key:?}]"),
            ValueId::FullKeyedList(name) => write!(f, "{name}[*]"),
        }
    }
}

/// An ordered set.
///
/// Adding a present element is ignored, removing and re-adding an element moves it to the end,
/// and building from a sequence keeps the first occurrence of each element.
#[derive(Debug, Clone)]
pub struct KeyList<K> {
    order: Vec<K>,
    members: HashSet<K>,
}

impl<K> Default for KeyList<K> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            members: HashSet::default(),
        }
    }
}

impl<K: Clone + Eq + Hash> KeyList<K> {
    /// Create an empty key list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key at the end. Returns `false` if it was already present.
    pub fn add(&mut self, key: K) -> bool {
        if !self.members.insert(key.clone()) {
            return false;
        }
        self.order.push(key);
        true
    }

    /// Remove a key. Returns `false` if it was not present.
    pub fn remove(&mut self, key: &K) -> bool {
        if !self.members.remove(key) {
            return false;
        }
        self.order.retain(|k| k != key);
        true
    }

    /// Check membership.
    pub fn contains(&self, key: &K) -> bool {
        self.members.contains(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the list has no keys.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate keys in order.
    pub fn iter(&self) -> std::slice::Iter<'_, K> {
        self.order.iter()
    }

    /// The keys in order, as a slice.
    pub fn as_slice(&self) -> &[K] {
        &self.order
    }

    /// A copy of the keys in order.
    pub fn to_vec(&self) -> Vec<K> {
        self.order.clone()
    }
}

impl<K: Clone + Eq + Hash> FromIterator<K> for KeyList<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut list = KeyList::new();
        for key in iter {
            list.add(key);
        }
        list
    }
}

impl<K: Eq + Hash> PartialEq for KeyList<K> {
    /// Key lists are equal when they hold the same keys in the same order.
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}

impl<K: Eq + Hash> Eq for KeyList<K> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_list_is_an_ordered_set() {
        let mut list = KeyList::new();
        assert!(list.add(3));
        assert!(!list.add(3));
        assert!(list.add(4));
        assert!(list.add(6));
        assert!(list.add(5));
        assert_eq!(list.as_slice(), &[3, 4, 6, 5]);

        assert!(list.remove(&4));
        assert!(!list.remove(&8));
        assert_eq!(list.as_slice(), &[3, 6, 5]);

        list.add(4);
        assert_eq!(list.as_slice(), &[3, 6, 5, 4]);
        assert!(list.contains(&4));
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_key_list_from_iter_dedups() {
        let list: KeyList<i32> = [1, 3, 2, 3, 4, 4, 1].into_iter().collect();
        assert_eq!(list.to_vec(), vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_key_list_copies_are_independent() {
        let mut list: KeyList<i32> = [1, 2].into_iter().collect();
        let copy = list.to_vec();
        list.add(3);
        list.remove(&1);
        assert_eq!(copy, vec![1, 2]);
        assert_eq!(list.to_vec(), vec![2, 3]);
    }

    #[test]
    fn test_value_id_display() {
        let name: Arc<str> = Arc::from("b");
        assert_eq!(ValueId::Nonkeyed(name.clone()).to_string(), "b");
        assert_eq!(ValueId::Keyed(name.clone(), AnyKey::new(4)).to_string(), "b[4]");
        assert_eq!(ValueId::FullKeyedList(name).to_string(), "b[*]");
    }
}
