//! The lazily computing instance.

use std::fmt;

use crate::change::TrickleInputChange;
use crate::error::TrickleError;
use crate::key::{NodeKey, NodeValue};
use crate::name::{KeyListNodeName, KeyedNodeName, NodeName};
use crate::outcome::NodeOutcome;
use crate::raw::{into_value, TrickleRawInstance};
use crate::value::{Timestamp, ValueId};

/// An instance that computes on the calling thread, and only what a read needs.
///
/// Setters never compute anything. A read runs the steps of the queried value's dependencies
/// until that value is settled, leaving unrelated nodes stale.
pub struct TrickleSyncInstance {
    raw: TrickleRawInstance,
}

impl TrickleSyncInstance {
    /// Wrap a raw instance.
    pub fn from_raw(raw: TrickleRawInstance) -> Self {
        Self { raw }
    }

    /// The underlying raw instance.
    pub fn raw(&self) -> &TrickleRawInstance {
        &self.raw
    }

    /// Unwrap into the underlying raw instance.
    pub fn into_raw(self) -> TrickleRawInstance {
        self.raw
    }

    /// Set a plain input node.
    pub fn set_input<T: NodeValue>(
        &self,
        name: &NodeName<T>,
        value: T,
    ) -> Result<Timestamp, TrickleError> {
        self.raw.set_input(name, value)
    }

    /// Replace the keys of a key list input node.
    pub fn set_key_list_input<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<Timestamp, TrickleError> {
        self.raw.set_key_list_input(name, keys)
    }

    /// Append a key to a key list input node.
    pub fn add_key_input<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        key: K,
    ) -> Result<Timestamp, TrickleError> {
        self.raw.add_key_input(name, key)
    }

    /// Remove a key from a key list input node.
    ///
    /// Values of keyed input nodes at the removed key are dropped. Adding the key back reads
    /// [`NodeOutcome::NotYetComputed`] for them until they are set again.
    pub fn remove_key_input<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        key: K,
    ) -> Result<Timestamp, TrickleError> {
        self.raw.remove_key_input(name, key)
    }

    /// Remove `removed`, then append `added`.
    pub fn edit_keys<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        added: impl IntoIterator<Item = K>,
        removed: impl IntoIterator<Item = K>,
    ) -> Result<Timestamp, TrickleError> {
        self.raw.edit_keys(name, added, removed)
    }

    /// Set a keyed input node at `key`.
    pub fn set_keyed_input<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        key: K,
        value: T,
    ) -> Result<Timestamp, TrickleError> {
        self.raw.set_keyed_input(name, key, value)
    }

    /// Set a keyed input node at several keys.
    pub fn set_keyed_inputs<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        values: impl IntoIterator<Item = (K, T)>,
    ) -> Result<Timestamp, TrickleError> {
        self.raw.set_keyed_inputs(name, values)
    }

    /// Apply a batch of changes at one timestamp.
    pub fn set_inputs(
        &self,
        changes: impl IntoIterator<Item = TrickleInputChange>,
    ) -> Result<Timestamp, TrickleError> {
        self.raw.set_inputs(changes)
    }

    /// Run the steps `target` depends on until none are left.
    fn settle(&self, target: &ValueId) -> Result<(), TrickleError> {
        let relevant = self.raw.definition().relevant_values(target)?;
        loop {
            let steps = self.raw.next_steps_for(&relevant);
            if steps.is_empty() {
                return Ok(());
            }
            for step in steps {
                let result = step.execute();
                self.raw.lock().apply_result(result);
            }
        }
    }

    /// Compute and return the outcome of a plain node.
    pub fn get_outcome<T: NodeValue>(
        &self,
        name: &NodeName<T>,
    ) -> Result<NodeOutcome<T>, TrickleError> {
        self.settle(&ValueId::nonkeyed(name))?;
        self.raw.get_node_outcome(name)
    }

    /// Compute and return the value of a plain node.
    pub fn get_value<T: NodeValue>(&self, name: &NodeName<T>) -> Result<T, TrickleError> {
        into_value(self.get_outcome(name)?, ValueId::nonkeyed(name))
    }

    /// Compute and return the outcome of a key list node.
    pub fn get_key_list_outcome<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
    ) -> Result<NodeOutcome<Vec<K>>, TrickleError> {
        self.settle(&ValueId::key_list(name))?;
        self.raw.get_key_list_outcome(name)
    }

    /// Compute and return the keys of a key list node.
    pub fn get_key_list_value<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
    ) -> Result<Vec<K>, TrickleError> {
        into_value(self.get_key_list_outcome(name)?, ValueId::key_list(name))
    }

    /// Compute and return the outcome of a keyed node at `key`.
    pub fn get_keyed_outcome<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        key: &K,
    ) -> Result<NodeOutcome<T>, TrickleError> {
        self.settle(&ValueId::keyed(name, key.clone()))?;
        self.raw.get_keyed_outcome(name, key)
    }

    /// Compute and return the value of a keyed node at `key`.
    pub fn get_keyed_value<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        key: &K,
    ) -> Result<T, TrickleError> {
        into_value(
            self.get_keyed_outcome(name, key)?,
            ValueId::keyed(name, key.clone()),
        )
    }

    /// Compute and return the full output of a keyed node.
    pub fn get_keyed_list_outcome<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
    ) -> Result<NodeOutcome<Vec<T>>, TrickleError> {
        self.settle(&ValueId::keyed_list(name))?;
        self.raw.get_keyed_list_outcome(name)
    }

    /// Compute and return the values of a keyed node in key order.
    pub fn get_keyed_list_value<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
    ) -> Result<Vec<T>, TrickleError> {
        into_value(self.get_keyed_list_outcome(name)?, ValueId::keyed_list(name))
    }
}

impl fmt::Debug for TrickleSyncInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TrickleSyncInstance").field(&self.raw).finish()
    }
}
