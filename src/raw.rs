//! The manually stepped instance.

use std::collections::HashSet as StdHashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::change::TrickleInputChange;
use crate::definition::TrickleDefinition;
use crate::error::TrickleError;
use crate::instance::InstanceId;
use crate::key::{extract_keys, extract_list, extract_value, AnyKey, AnyValue, NodeKey, NodeValue};
use crate::name::{KeyListNodeName, KeyedNodeName, NodeName};
use crate::outcome::NodeOutcome;
use crate::step::{TrickleStep, TrickleStepResult};
use crate::store::Store;
use crate::tracer::{NoopTracer, Tracer};
use crate::value::{Timestamp, ValueId};

/// An instance that never computes on its own.
///
/// The caller asks for [`TrickleStep`]s, executes them wherever and in whatever order it likes,
/// and reports the results back. Results computed from outdated inputs are dropped, so the
/// values read from the instance are always consistent with some input generation.
///
/// # Example
///
/// ```ignore
/// let instance = definition.instantiate_raw();
/// instance.set_input(&A, 2)?;
/// for step in instance.get_next_steps() {
///     instance.report_result(step.execute())?;
/// }
/// ```
pub struct TrickleRawInstance {
    definition: TrickleDefinition,
    id: InstanceId,
    store: Mutex<Store>,
}

impl TrickleRawInstance {
    /// Create an instance that reports to `tracer`.
    pub fn with_tracer(definition: TrickleDefinition, tracer: Arc<dyn Tracer>) -> Self {
        let id = InstanceId::next();
        let store = Store::new(definition.clone(), id, tracer);
        Self {
            definition,
            id,
            store: Mutex::new(store),
        }
    }

    /// Create an untraced instance.
    pub fn new(definition: TrickleDefinition) -> Self {
        Self::with_tracer(definition, Arc::new(NoopTracer))
    }

    /// The definition this instance was created from.
    pub fn definition(&self) -> &TrickleDefinition {
        &self.definition
    }

    /// The tag carried by this instance's steps and results.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock()
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    /// Set a plain input node.
    pub fn set_input<T: NodeValue>(
        &self,
        name: &NodeName<T>,
        value: T,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs([TrickleInputChange::set_basic(name, value)])
    }

    /// Replace the keys of a key list input node.
    pub fn set_key_list_input<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs([TrickleInputChange::set_keys(name, keys)])
    }

    /// Append a key to a key list input node, unless it is already present.
    pub fn add_key_input<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        key: K,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs([TrickleInputChange::add_key(name, key)])
    }

    /// Remove a key from a key list input node, if present.
    ///
    /// Values of keyed input nodes at the removed key are dropped. Adding the key back reads
    /// [`NodeOutcome::NotYetComputed`] for them until they are set again.
    pub fn remove_key_input<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        key: K,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs([TrickleInputChange::remove_key(name, key)])
    }

    /// Remove `removed`, then append `added`, at one timestamp.
    pub fn edit_keys<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        added: impl IntoIterator<Item = K>,
        removed: impl IntoIterator<Item = K>,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs([TrickleInputChange::edit_keys(name, added, removed)])
    }

    /// Set a keyed input node at `key`.
    pub fn set_keyed_input<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        key: K,
        value: T,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs([TrickleInputChange::set_keyed(name, key, value)])
    }

    /// Set a keyed input node at several keys at one timestamp.
    pub fn set_keyed_inputs<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        values: impl IntoIterator<Item = (K, T)>,
    ) -> Result<Timestamp, TrickleError> {
        self.set_inputs(
            values
                .into_iter()
                .map(|(key, value)| TrickleInputChange::set_keyed(name, key, value)),
        )
    }

    /// Apply a batch of changes at one timestamp.
    ///
    /// The whole batch is rejected if any change is invalid. Returns the current timestamp,
    /// which only moves if some change had an effect.
    pub fn set_inputs(
        &self,
        changes: impl IntoIterator<Item = TrickleInputChange>,
    ) -> Result<Timestamp, TrickleError> {
        let changes: Vec<_> = changes.into_iter().collect();
        self.store.lock().apply_changes(changes)
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    /// Steps for every stale value whose inputs are up to date.
    ///
    /// Values that need no computation are settled as a side effect. Asking again before any
    /// result is reported returns the same steps.
    pub fn get_next_steps(&self) -> Vec<TrickleStep> {
        self.store.lock().next_steps(None)
    }

    pub(crate) fn next_steps_for(&self, relevant: &StdHashSet<ValueId>) -> Vec<TrickleStep> {
        self.store.lock().next_steps(Some(relevant))
    }

    /// Report the result of a step created by this instance.
    ///
    /// Results for outdated inputs, removed keys, or values already settled are ignored.
    pub fn report_result(&self, result: TrickleStepResult) -> Result<(), TrickleError> {
        let mut store = self.store.lock();
        store.check_owner(&result)?;
        store.apply_result(result);
        Ok(())
    }

    /// Execute steps on the calling thread until everything is settled.
    pub fn complete_synchronously(&self) {
        loop {
            let steps = self.get_next_steps();
            if steps.is_empty() {
                break;
            }
            for step in steps {
                let result = step.execute();
                self.store.lock().apply_result(result);
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Outcome of a plain node.
    pub fn get_node_outcome<T: NodeValue>(
        &self,
        name: &NodeName<T>,
    ) -> Result<NodeOutcome<T>, TrickleError> {
        self.store.lock().node_outcome(name)
    }

    /// Value of a plain node, or [`TrickleError::NotComputed`].
    pub fn get_node_value<T: NodeValue>(&self, name: &NodeName<T>) -> Result<T, TrickleError> {
        into_value(self.get_node_outcome(name)?, ValueId::nonkeyed(name))
    }

    /// Outcome of a key list node.
    pub fn get_key_list_outcome<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
    ) -> Result<NodeOutcome<Vec<K>>, TrickleError> {
        self.store.lock().key_list_outcome_typed(name)
    }

    /// Keys of a key list node, or [`TrickleError::NotComputed`].
    pub fn get_key_list_value<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
    ) -> Result<Vec<K>, TrickleError> {
        into_value(self.get_key_list_outcome(name)?, ValueId::key_list(name))
    }

    /// Outcome of a keyed node at `key`.
    pub fn get_keyed_outcome<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        key: &K,
    ) -> Result<NodeOutcome<T>, TrickleError> {
        self.store.lock().keyed_outcome_typed(name, key)
    }

    /// Value of a keyed node at `key`, or [`TrickleError::NotComputed`].
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

    /// Outcome of a keyed node's full output: its values in key order.
    pub fn get_keyed_list_outcome<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
    ) -> Result<NodeOutcome<Vec<T>>, TrickleError> {
        self.store.lock().keyed_list_outcome_typed(name)
    }

    /// Values of a keyed node in key order, or [`TrickleError::NotComputed`].
    pub fn get_keyed_list_value<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
    ) -> Result<Vec<T>, TrickleError> {
        into_value(self.get_keyed_list_outcome(name)?, ValueId::keyed_list(name))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Timestamp of the latest effective input change.
    pub fn current_timestamp(&self) -> Timestamp {
        self.store.lock().clock()
    }

    /// Timestamp of the stored entry for `value_id`, if there is one.
    pub fn value_timestamp(&self, value_id: &ValueId) -> Result<Option<Timestamp>, TrickleError> {
        self.store.lock().value_timestamp(value_id)
    }

    /// Whether the stored entry for `value_id` reflects the current inputs.
    pub fn is_settled(&self, value_id: &ValueId) -> Result<bool, TrickleError> {
        self.store.lock().is_settled(value_id)
    }
}

impl fmt::Debug for TrickleRawInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrickleRawInstance")
            .field("id", &self.id)
            .field("nodes", &self.definition.len())
            .finish()
    }
}

/// Typed reads shared by every instance flavor.
impl Store {
    pub(crate) fn node_outcome<T: NodeValue>(
        &self,
        name: &NodeName<T>,
    ) -> Result<NodeOutcome<T>, TrickleError> {
        let index = self.definition().resolve_basic(name)?;
        downcast_outcome(self.basic_outcome(index), name.name(), extract_value)
    }

    pub(crate) fn key_list_outcome_typed<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
    ) -> Result<NodeOutcome<Vec<K>>, TrickleError> {
        let index = self.definition().resolve_key_list(name)?;
        let outcome = self.key_list_outcome(index).map(AnyValue::new);
        downcast_outcome(outcome, name.name(), extract_keys)
    }

    pub(crate) fn keyed_outcome_typed<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        key: &K,
    ) -> Result<NodeOutcome<T>, TrickleError> {
        let index = self.definition().resolve_keyed(name)?;
        let outcome = self.keyed_outcome(index, &AnyKey::new(key.clone()));
        downcast_outcome(outcome, name.name(), extract_value)
    }

    pub(crate) fn keyed_list_outcome_typed<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
    ) -> Result<NodeOutcome<Vec<T>>, TrickleError> {
        let index = self.definition().resolve_keyed(name)?;
        downcast_outcome(self.keyed_list_outcome(index), name.name(), extract_list)
    }
}

fn downcast_outcome<T>(
    outcome: NodeOutcome<AnyValue>,
    name: &str,
    extract: impl FnOnce(&AnyValue) -> Option<T>,
) -> Result<NodeOutcome<T>, TrickleError> {
    Ok(match outcome {
        NodeOutcome::Computed(value) => match extract(&value) {
            Some(value) => NodeOutcome::Computed(value),
            None => {
                return Err(TrickleError::TypeMismatch {
                    name: Arc::from(name),
                    expected: std::any::type_name::<T>(),
                    actual: value.type_name(),
                })
            }
        },
        NodeOutcome::NotYetComputed => NodeOutcome::NotYetComputed,
        NodeOutcome::Failure(failure) => NodeOutcome::Failure(failure),
        NodeOutcome::NoSuchKey => NodeOutcome::NoSuchKey,
    })
}

/// Unwrap a computed outcome or describe why there is no value.
pub(crate) fn into_value<T>(outcome: NodeOutcome<T>, value_id: ValueId) -> Result<T, TrickleError> {
    let outcome = match outcome {
        NodeOutcome::Computed(value) => return Ok(value),
        NodeOutcome::NotYetComputed => "not yet computed".to_string(),
        NodeOutcome::NoSuchKey => "no such key".to_string(),
        NodeOutcome::Failure(failure) => format!("failed: {failure}"),
    };
    Err(TrickleError::NotComputed { value_id, outcome })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::TrickleDefinitionBuilder;

    #[test]
    fn test_value_getter_describes_missing_value() {
        let a = NodeName::<i32>::new("a");
        let mut builder = TrickleDefinitionBuilder::new();
        builder.create_input_node(&a).unwrap();
        let instance = TrickleRawInstance::new(builder.build());

        let err = instance.get_node_value(&a).unwrap_err();
        assert_eq!(
            err,
            TrickleError::NotComputed {
                value_id: ValueId::nonkeyed(&a),
                outcome: "not yet computed".to_string(),
            }
        );
        instance.set_input(&a, 4).unwrap();
        assert_eq!(instance.get_node_value(&a).unwrap(), 4);
    }

    #[test]
    fn test_wrongly_typed_name_is_rejected() {
        let a = NodeName::<i32>::new("a");
        let a_as_string = NodeName::<String>::new("a");
        let mut builder = TrickleDefinitionBuilder::new();
        builder.create_input_node(&a).unwrap();
        let instance = TrickleRawInstance::new(builder.build());

        assert!(matches!(
            instance.set_input(&a_as_string, "x".to_string()),
            Err(TrickleError::TypeMismatch { .. })
        ));
        assert!(matches!(
            instance.get_node_outcome(&a_as_string),
            Err(TrickleError::TypeMismatch { .. })
        ));
    }
}
