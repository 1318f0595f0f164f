//! Batched input mutations.

use std::sync::Arc;

use crate::key::{AnyKey, AnyValue, NodeKey, NodeValue};
use crate::name::{KeyListNodeName, KeyedNodeName, NodeName};

/// One change to an input node.
///
/// A batch of changes passed to `set_inputs` lands at a single timestamp. Values are checked
/// against the definition when the batch is applied.
#[derive(Debug, Clone)]
pub enum TrickleInputChange {
    /// Set the value of a plain input node.
    SetBasic {
        /// Node name.
        name: Arc<str>,
        /// New value.
        value: AnyValue,
    },
    /// Replace the membership of a key list input node.
    SetKeys {
        /// Node name.
        name: Arc<str>,
        /// New keys in order. Later duplicates are dropped.
        keys: Vec<AnyKey>,
    },
    /// Remove and then add keys of a key list input node.
    EditKeys {
        /// Node name.
        name: Arc<str>,
        /// Keys appended at the end, unless already present.
        added: Vec<AnyKey>,
        /// Keys removed, if present.
        removed: Vec<AnyKey>,
    },
    /// Set the value of a keyed input node at one key.
    SetKeyed {
        /// Node name.
        name: Arc<str>,
        /// The key.
        key: AnyKey,
        /// New value.
        value: AnyValue,
    },
}

impl TrickleInputChange {
    /// Set a plain input.
    pub fn set_basic<T: NodeValue>(name: &NodeName<T>, value: T) -> Self {
        TrickleInputChange::SetBasic {
            name: name.shared_name(),
            value: AnyValue::new(value),
        }
    }

    /// Replace a key list.
    pub fn set_keys<K: NodeKey>(name: &KeyListNodeName<K>, keys: impl IntoIterator<Item = K>) -> Self {
        TrickleInputChange::SetKeys {
            name: name.shared_name(),
            keys: keys.into_iter().map(AnyKey::new).collect(),
        }
    }

    /// Add and remove keys of a key list.
    pub fn edit_keys<K: NodeKey>(
        name: &KeyListNodeName<K>,
        added: impl IntoIterator<Item = K>,
        removed: impl IntoIterator<Item = K>,
    ) -> Self {
        TrickleInputChange::EditKeys {
            name: name.shared_name(),
            added: added.into_iter().map(AnyKey::new).collect(),
            removed: removed.into_iter().map(AnyKey::new).collect(),
        }
    }

    /// Add one key to a key list.
    pub fn add_key<K: NodeKey>(name: &KeyListNodeName<K>, key: K) -> Self {
        Self::edit_keys(name, [key], [])
    }

    /// Remove one key from a key list.
    pub fn remove_key<K: NodeKey>(name: &KeyListNodeName<K>, key: K) -> Self {
        Self::edit_keys(name, [], [key])
    }

    /// Set a keyed input at `key`.
    pub fn set_keyed<K: NodeKey, T: NodeValue>(name: &KeyedNodeName<K, T>, key: K, value: T) -> Self {
        TrickleInputChange::SetKeyed {
            name: name.shared_name(),
            key: AnyKey::new(key),
            value: AnyValue::new(value),
        }
    }

    /// The name of the node this change applies to.
    pub fn node_name(&self) -> &str {
        match self {
            TrickleInputChange::SetBasic { name, .. }
            | TrickleInputChange::SetKeys { name, .. }
            | TrickleInputChange::EditKeys { name, .. }
            | TrickleInputChange::SetKeyed { name, .. } => name,
        }
    }
}
