//! Per-instance value storage and staleness tracking.
//!
//! Nothing is marked dirty eagerly. Every stored entry remembers the generation it was computed
//! against, and a sweep over the nodes in topological order compares that with the newest
//! generation of the entry's inputs. Entries whose inputs are all up to date but newer than the
//! entry are stale: they are resolved inline when no computation is needed (failed or missing
//! inputs without a catch, unchanged arguments, full keyed outputs) and otherwise produce a
//! [`TrickleStep`].

use std::collections::HashSet as StdHashSet;
use std::sync::Arc;

use ahash::HashMap;

use crate::change::TrickleInputChange;
use crate::definition::{is_relevant, NodeRecord, NodeShape, TrickleDefinition};
use crate::error::TrickleError;
use crate::inputs::{InputShape, NodeIndex};
use crate::instance::InstanceId;
use crate::key::{AnyKey, AnyValue};
use crate::outcome::{NodeOutcome, TrickleFailure};
use crate::step::{StepOutcome, StepWork, TrickleStep, TrickleStepResult};
use crate::tracer::{AppliedResult, DiscardReason, Tracer};
use crate::value::{KeyList, Timestamp, ValueId};

#[derive(Clone)]
pub(crate) enum Stored {
    Value(AnyValue),
    Failure(TrickleFailure),
}

impl Stored {
    fn same_as(&self, other: &Stored) -> bool {
        match (self, other) {
            (Stored::Value(a), Stored::Value(b)) => a == b,
            (Stored::Failure(a), Stored::Failure(b)) => a == b,
            _ => false,
        }
    }

    fn to_outcome(&self) -> NodeOutcome<AnyValue> {
        match self {
            Stored::Value(value) => NodeOutcome::Computed(value.clone()),
            Stored::Failure(failure) => NodeOutcome::Failure(failure.clone()),
        }
    }
}

struct Slot {
    stored: Stored,
    timestamp: Timestamp,
    /// Arguments of the operation that produced `stored`.
    snapshot: Option<Arc<[AnyValue]>>,
}

struct KeyListState {
    keys: KeyList<AnyKey>,
    /// The keys erased as one value, handed to `list_output` consumers.
    keys_value: AnyValue,
    /// When each member last joined the list.
    joined: HashMap<AnyKey, Timestamp>,
    /// `None` until a computed list is first resolved.
    timestamp: Option<Timestamp>,
    failure: Option<TrickleFailure>,
    snapshot: Option<Arc<[AnyValue]>>,
}

impl KeyListState {
    fn new(timestamp: Option<Timestamp>) -> Self {
        Self {
            keys: KeyList::new(),
            keys_value: AnyValue::new(Vec::<AnyKey>::new()),
            joined: HashMap::default(),
            timestamp,
            failure: None,
            snapshot: None,
        }
    }
}

#[derive(Default)]
struct KeyedState {
    /// Values at each key. For keyed inputs this may hold keys that are not members yet.
    per_key: HashMap<AnyKey, Slot>,
    full: Option<Slot>,
}

enum NodeState {
    Basic(Option<Slot>),
    KeyList(KeyListState),
    Keyed(KeyedState),
}

/// A change of an observable value, recorded for listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ValueEvent {
    pub(crate) value_id: ValueId,
    pub(crate) timestamp: Timestamp,
}

struct Gathered {
    timestamp: Timestamp,
    values: Vec<AnyValue>,
    failure: Option<TrickleFailure>,
}

struct Sweep<'a> {
    /// Values found up to date so far, with their generation.
    up: HashMap<ValueId, Timestamp>,
    steps: Vec<TrickleStep>,
    relevant: Option<&'a StdHashSet<ValueId>>,
}

type Memo = HashMap<(NodeIndex, Option<AnyKey>), Option<Timestamp>>;

pub(crate) struct Store {
    definition: TrickleDefinition,
    instance: InstanceId,
    tracer: Arc<dyn Tracer>,
    clock: Timestamp,
    nodes: Vec<NodeState>,
    events: Option<Vec<ValueEvent>>,
}

impl Store {
    pub(crate) fn new(
        definition: TrickleDefinition,
        instance: InstanceId,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        let nodes = definition
            .nodes()
            .iter()
            .map(|record| match record.shape {
                NodeShape::Basic => NodeState::Basic(None),
                NodeShape::KeyList if record.is_input() => {
                    NodeState::KeyList(KeyListState::new(Some(Timestamp::ZERO)))
                }
                NodeShape::KeyList => NodeState::KeyList(KeyListState::new(None)),
                NodeShape::Keyed { .. } => NodeState::Keyed(KeyedState::default()),
            })
            .collect();
        Self {
            definition,
            instance,
            tracer,
            clock: Timestamp::ZERO,
            nodes,
            events: None,
        }
    }

    pub(crate) fn definition(&self) -> &TrickleDefinition {
        &self.definition
    }

    pub(crate) fn instance(&self) -> InstanceId {
        self.instance
    }

    pub(crate) fn clock(&self) -> Timestamp {
        self.clock
    }

    fn basic(&self, index: NodeIndex) -> Option<&Slot> {
        match self.nodes.get(index.0)? {
            NodeState::Basic(slot) => slot.as_ref(),
            _ => None,
        }
    }

    fn list(&self, index: NodeIndex) -> Option<&KeyListState> {
        match self.nodes.get(index.0)? {
            NodeState::KeyList(list) => Some(list),
            _ => None,
        }
    }

    fn list_mut(&mut self, index: NodeIndex) -> Option<&mut KeyListState> {
        match self.nodes.get_mut(index.0)? {
            NodeState::KeyList(list) => Some(list),
            _ => None,
        }
    }

    fn keyed(&self, index: NodeIndex) -> Option<&KeyedState> {
        match self.nodes.get(index.0)? {
            NodeState::Keyed(keyed) => Some(keyed),
            _ => None,
        }
    }

    fn keyed_mut(&mut self, index: NodeIndex) -> Option<&mut KeyedState> {
        match self.nodes.get_mut(index.0)? {
            NodeState::Keyed(keyed) => Some(keyed),
            _ => None,
        }
    }

    fn record_event(&mut self, value_id: ValueId, timestamp: Timestamp) {
        if let Some(events) = &mut self.events {
            events.push(ValueEvent {
                value_id,
                timestamp,
            });
        }
    }

    /// Start or stop recording value changes.
    pub(crate) fn set_recording(&mut self, enabled: bool) {
        match (enabled, self.events.is_some()) {
            (true, false) => self.events = Some(Vec::new()),
            (false, true) => self.events = None,
            _ => {}
        }
    }

    pub(crate) fn take_events(&mut self) -> Vec<ValueEvent> {
        self.events.as_mut().map(std::mem::take).unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Input changes
    // ------------------------------------------------------------------

    /// Check a change against the definition without applying it.
    pub(crate) fn validate(&self, change: &TrickleInputChange) -> Result<NodeIndex, TrickleError> {
        let (index, name) = match change {
            TrickleInputChange::SetBasic { name, value } => (
                self.definition
                    .resolve_basic_erased(name, value.type_id(), value.type_name())?,
                name,
            ),
            TrickleInputChange::SetKeys { name, keys } => {
                (self.resolve_keys(name, keys.iter())?, name)
            }
            TrickleInputChange::EditKeys {
                name,
                added,
                removed,
            } => (self.resolve_keys(name, added.iter().chain(removed))?, name),
            TrickleInputChange::SetKeyed { name, key, value } => (
                self.definition.resolve_keyed_erased(
                    name,
                    Some((key.type_id(), key.type_name())),
                    Some((value.type_id(), value.type_name())),
                )?,
                name,
            ),
        };
        if !self.definition.node(index).is_input() {
            return Err(TrickleError::NotAnInput { name: name.clone() });
        }
        Ok(index)
    }

    fn resolve_keys<'a>(
        &self,
        name: &Arc<str>,
        mut keys: impl Iterator<Item = &'a AnyKey>,
    ) -> Result<NodeIndex, TrickleError> {
        let index = match keys.next() {
            Some(first) => {
                let index =
                    self.definition
                        .resolve_key_list_erased(name, first.type_id(), first.type_name())?;
                let expected = self.definition.node(index).value_type;
                if let Some(other) = keys.find(|key| key.type_id() != expected.id) {
                    return Err(TrickleError::TypeMismatch {
                        name: name.clone(),
                        expected: other.type_name(),
                        actual: expected.name,
                    });
                }
                index
            }
            None => {
                self.definition
                    .resolve_value_id(&ValueId::FullKeyList(name.clone()))?
                    .0
            }
        };
        Ok(index)
    }

    /// Apply a batch of changes at one new timestamp.
    ///
    /// Every change is validated before anything is applied. The clock only ticks if some change
    /// had an effect.
    pub(crate) fn apply_changes(
        &mut self,
        changes: Vec<TrickleInputChange>,
    ) -> Result<Timestamp, TrickleError> {
        let targets = changes
            .iter()
            .map(|change| self.validate(change))
            .collect::<Result<Vec<_>, _>>()?;
        let timestamp = self.clock.next();
        let mut effective = 0;
        for (change, index) in changes.into_iter().zip(targets) {
            if self.apply_change(index, change, timestamp) {
                effective += 1;
            }
        }
        if effective > 0 {
            self.clock = timestamp;
            self.tracer.on_input_changed(timestamp, effective);
        }
        Ok(self.clock)
    }

    fn apply_change(
        &mut self,
        index: NodeIndex,
        change: TrickleInputChange,
        timestamp: Timestamp,
    ) -> bool {
        match change {
            TrickleInputChange::SetBasic { name, value } => {
                if let Some(NodeState::Basic(slot)) = self.nodes.get_mut(index.0) {
                    *slot = Some(Slot {
                        stored: Stored::Value(value),
                        timestamp,
                        snapshot: None,
                    });
                    self.record_event(ValueId::Nonkeyed(name), timestamp);
                    return true;
                }
                false
            }
            TrickleInputChange::SetKeys { keys, .. } => {
                let keys: KeyList<AnyKey> = keys.into_iter().collect();
                self.replace_input_keys(index, keys, timestamp)
            }
            TrickleInputChange::EditKeys { added, removed, .. } => {
                let Some(list) = self.list(index) else {
                    return false;
                };
                let mut keys = list.keys.clone();
                for key in &removed {
                    keys.remove(key);
                }
                for key in added {
                    keys.add(key);
                }
                self.replace_input_keys(index, keys, timestamp)
            }
            TrickleInputChange::SetKeyed { name, key, value } => {
                let Some(source) = self.definition.node(index).key_source() else {
                    return false;
                };
                let member = self.list(source).is_some_and(|list| list.keys.contains(&key));
                let Some(keyed) = self.keyed_mut(index) else {
                    return false;
                };
                keyed.per_key.insert(
                    key.clone(),
                    Slot {
                        stored: Stored::Value(value),
                        timestamp,
                        snapshot: None,
                    },
                );
                if member {
                    self.record_event(ValueId::Keyed(name, key), timestamp);
                }
                true
            }
        }
    }

    fn replace_input_keys(
        &mut self,
        index: NodeIndex,
        keys: KeyList<AnyKey>,
        timestamp: Timestamp,
    ) -> bool {
        if !self.set_membership(index, keys, timestamp) {
            return false;
        }
        if let Some(list) = self.list_mut(index) {
            list.timestamp = Some(timestamp);
        }
        true
    }

    /// Replace the members of a key list. New members are stamped with `timestamp`; values of
    /// keyed nodes at removed members are dropped. Returns `false` if nothing changed.
    fn set_membership(
        &mut self,
        index: NodeIndex,
        keys: KeyList<AnyKey>,
        timestamp: Timestamp,
    ) -> bool {
        let definition = self.definition.clone();
        let Some(list) = self.list_mut(index) else {
            return false;
        };
        if list.keys == keys {
            return false;
        }
        let removed: Vec<AnyKey> = list
            .keys
            .iter()
            .filter(|key| !keys.contains(key))
            .cloned()
            .collect();
        for key in keys.iter() {
            if !list.keys.contains(key) {
                list.joined.insert(key.clone(), timestamp);
            }
        }
        for key in &removed {
            list.joined.remove(key);
        }
        list.keys_value = AnyValue::new(keys.to_vec());
        list.keys = keys;

        let mut dropped = Vec::new();
        for &keyed_index in definition.keyed_over(index) {
            let name = &definition.node(keyed_index).name;
            if let Some(keyed) = self.keyed_mut(keyed_index) {
                for key in &removed {
                    if keyed.per_key.remove(key).is_some() {
                        dropped.push(ValueId::Keyed(name.clone(), key.clone()));
                    }
                }
            }
        }
        self.record_event(
            ValueId::FullKeyList(definition.node(index).name.clone()),
            timestamp,
        );
        for value_id in dropped {
            self.record_event(value_id, timestamp);
        }
        true
    }

    // ------------------------------------------------------------------
    // Sweep
    // ------------------------------------------------------------------

    /// Resolve everything that needs no computation and return steps for the rest.
    ///
    /// With `relevant`, only steps for values in that set are returned.
    pub(crate) fn next_steps(
        &mut self,
        relevant: Option<&StdHashSet<ValueId>>,
    ) -> Vec<TrickleStep> {
        let definition = self.definition.clone();
        let mut sweep = Sweep {
            up: HashMap::default(),
            steps: Vec::new(),
            relevant,
        };
        for (i, record) in definition.nodes().iter().enumerate() {
            let index = NodeIndex(i);
            match record.shape {
                NodeShape::Basic => self.sweep_basic(index, record, &mut sweep),
                NodeShape::KeyList => self.sweep_key_list(index, record, &mut sweep),
                NodeShape::Keyed { key_source } => {
                    self.sweep_keyed(index, record, key_source, &mut sweep)
                }
            }
        }
        sweep.steps
    }

    fn sweep_basic(&mut self, index: NodeIndex, record: &NodeRecord, sweep: &mut Sweep<'_>) {
        let value_id = ValueId::Nonkeyed(record.name.clone());
        if record.is_input() {
            let timestamp = self.basic(index).map_or(Timestamp::ZERO, |slot| slot.timestamp);
            sweep.up.insert(value_id, timestamp);
            return;
        }
        if let Some(gathered) = self.gather(record, None, Timestamp::ZERO, &sweep.up) {
            self.resolve(index, record, value_id, None, gathered, sweep);
        }
    }

    fn sweep_key_list(&mut self, index: NodeIndex, record: &NodeRecord, sweep: &mut Sweep<'_>) {
        let value_id = ValueId::FullKeyList(record.name.clone());
        if record.is_input() {
            let timestamp = self
                .list(index)
                .and_then(|list| list.timestamp)
                .unwrap_or(Timestamp::ZERO);
            sweep.up.insert(value_id, timestamp);
            return;
        }
        if let Some(gathered) = self.gather(record, None, Timestamp::ZERO, &sweep.up) {
            self.resolve(index, record, value_id, None, gathered, sweep);
        }
    }

    fn sweep_keyed(
        &mut self,
        index: NodeIndex,
        record: &NodeRecord,
        key_source: NodeIndex,
        sweep: &mut Sweep<'_>,
    ) {
        let source_id = ValueId::FullKeyList(self.definition.node(key_source).name.clone());
        let Some(&list_timestamp) = sweep.up.get(&source_id) else {
            return;
        };
        let members: Vec<(AnyKey, Timestamp)> = match self.list(key_source) {
            Some(list) => list
                .keys
                .iter()
                .map(|key| {
                    let joined = list.joined.get(key).copied().unwrap_or(Timestamp::ZERO);
                    (key.clone(), joined)
                })
                .collect(),
            None => return,
        };
        for (key, joined) in members {
            let value_id = ValueId::Keyed(record.name.clone(), key.clone());
            if record.is_input() {
                let timestamp = self
                    .keyed(index)
                    .and_then(|keyed| keyed.per_key.get(&key))
                    .map_or(joined, |slot| slot.timestamp.max(joined));
                sweep.up.insert(value_id, timestamp);
                continue;
            }
            if let Some(gathered) = self.gather(record, Some(&key), joined, &sweep.up) {
                self.resolve(index, record, value_id, Some(key), gathered, sweep);
            }
        }
        self.sweep_full_output(index, record, key_source, list_timestamp, sweep);
    }

    /// Assemble a keyed node's full output once the list and every member are up to date.
    fn sweep_full_output(
        &mut self,
        index: NodeIndex,
        record: &NodeRecord,
        key_source: NodeIndex,
        list_timestamp: Timestamp,
        sweep: &mut Sweep<'_>,
    ) {
        let value_id = ValueId::FullKeyedList(record.name.clone());
        let (Some(list), Some(keyed)) = (self.list(key_source), self.keyed(index)) else {
            return;
        };
        let mut timestamp = list_timestamp;
        let mut values = Vec::with_capacity(list.keys.len());
        let mut failure = list.failure.clone();
        for key in list.keys.iter() {
            let key_id = ValueId::Keyed(record.name.clone(), key.clone());
            let Some(&key_timestamp) = sweep.up.get(&key_id) else {
                return;
            };
            timestamp = timestamp.max(key_timestamp);
            match keyed.per_key.get(key).map(|slot| &slot.stored) {
                Some(Stored::Value(value)) => values.push(value.clone()),
                Some(Stored::Failure(f)) => failure.get_or_insert_with(Default::default).merge(f),
                None => failure
                    .get_or_insert_with(Default::default)
                    .merge(&TrickleFailure::missing(key_id)),
            }
        }
        if let Some(current) = keyed.full.as_ref().map(|slot| slot.timestamp) {
            if current >= timestamp {
                sweep.up.insert(value_id, current);
                return;
            }
        }
        let stored = match failure {
            Some(failure) => Stored::Failure(failure),
            None => Stored::Value(AnyValue::new(values)),
        };
        let changed = keyed
            .full
            .as_ref()
            .map_or(true, |slot| !slot.stored.same_as(&stored));
        if let Some(keyed) = self.keyed_mut(index) {
            keyed.full = Some(Slot {
                stored,
                timestamp,
                snapshot: None,
            });
        }
        if changed {
            self.record_event(value_id.clone(), timestamp);
        }
        sweep.up.insert(value_id, timestamp);
    }

    /// Read the inputs of `record` for `key`. Returns `None` if some input is not up to date.
    fn gather(
        &self,
        record: &NodeRecord,
        key: Option<&AnyKey>,
        base: Timestamp,
        up: &HashMap<ValueId, Timestamp>,
    ) -> Option<Gathered> {
        let mut timestamp = base;
        let mut values = Vec::with_capacity(record.inputs.len());
        let mut failure: Option<TrickleFailure> = None;
        for input in &record.inputs {
            let name = &self.definition.node(input.source).name;
            let value_id = match input.shape {
                InputShape::Value => ValueId::Nonkeyed(name.clone()),
                InputShape::KeyList => ValueId::FullKeyList(name.clone()),
                InputShape::KeyedCurrent => ValueId::Keyed(name.clone(), key?.clone()),
                InputShape::FullKeyed => ValueId::FullKeyedList(name.clone()),
            };
            timestamp = timestamp.max(*up.get(&value_id)?);
            let stored = match input.shape {
                InputShape::Value => self.basic(input.source).map(|slot| slot.stored.clone()),
                InputShape::KeyList => self.list(input.source).map(|list| match &list.failure {
                    Some(failure) => Stored::Failure(failure.clone()),
                    None => Stored::Value(list.keys_value.clone()),
                }),
                InputShape::KeyedCurrent => self
                    .keyed(input.source)
                    .and_then(|keyed| keyed.per_key.get(key?))
                    .map(|slot| slot.stored.clone()),
                InputShape::FullKeyed => self
                    .keyed(input.source)
                    .and_then(|keyed| keyed.full.as_ref())
                    .map(|slot| slot.stored.clone()),
            };
            match stored {
                Some(Stored::Value(value)) => values.push(value),
                Some(Stored::Failure(f)) => failure.get_or_insert_with(Default::default).merge(&f),
                None => failure
                    .get_or_insert_with(Default::default)
                    .merge(&TrickleFailure::missing(value_id)),
            }
        }
        Some(Gathered {
            timestamp,
            values,
            failure,
        })
    }

    fn resolve(
        &mut self,
        index: NodeIndex,
        record: &NodeRecord,
        value_id: ValueId,
        key: Option<AnyKey>,
        gathered: Gathered,
        sweep: &mut Sweep<'_>,
    ) {
        let Gathered {
            timestamp,
            values,
            failure,
        } = gathered;
        let (current, snapshot) = match self.stored_meta(index, key.as_ref()) {
            Some((current, snapshot)) => (Some(current), snapshot.cloned()),
            None => (None, None),
        };
        if let Some(current) = current.filter(|current| *current >= timestamp) {
            sweep.up.insert(value_id, current);
            return;
        }

        if let Some(failure) = failure {
            match &record.catch {
                Some(catch) => self.emit(
                    sweep,
                    value_id,
                    timestamp,
                    StepWork::Catch {
                        catch: catch.clone(),
                        failure,
                    },
                ),
                None => {
                    self.tracer.on_failure_resolved(&value_id, timestamp);
                    self.store(index, key.as_ref(), &value_id, Stored::Failure(failure), timestamp, None);
                    sweep.up.insert(value_id, timestamp);
                }
            }
            return;
        }

        if snapshot.is_some_and(|snapshot| snapshot[..] == values[..]) {
            self.tracer.on_operation_skipped(&value_id, timestamp);
            self.touch(index, key.as_ref(), timestamp);
            sweep.up.insert(value_id, timestamp);
            return;
        }

        if let Some(operation) = &record.operation {
            self.emit(
                sweep,
                value_id,
                timestamp,
                StepWork::Compute {
                    operation: operation.clone(),
                    key,
                    inputs: Arc::from(values),
                },
            );
        }
    }

    fn emit(&self, sweep: &mut Sweep<'_>, value_id: ValueId, timestamp: Timestamp, work: StepWork) {
        if let Some(relevant) = sweep.relevant {
            if !is_relevant(relevant, &value_id) {
                return;
            }
        }
        self.tracer.on_step_created(&value_id, timestamp);
        sweep.steps.push(TrickleStep {
            instance: self.instance,
            value_id,
            timestamp,
            work,
        });
    }

    /// Timestamp and snapshot of the entry for `key` of a node. For keyed nodes, no key means
    /// the full output.
    fn stored_meta(
        &self,
        index: NodeIndex,
        key: Option<&AnyKey>,
    ) -> Option<(Timestamp, Option<&Arc<[AnyValue]>>)> {
        match self.nodes.get(index.0)? {
            NodeState::Basic(slot) => slot
                .as_ref()
                .map(|slot| (slot.timestamp, slot.snapshot.as_ref())),
            NodeState::KeyList(list) => list
                .timestamp
                .map(|timestamp| (timestamp, list.snapshot.as_ref())),
            NodeState::Keyed(keyed) => {
                let slot = match key {
                    Some(key) => keyed.per_key.get(key),
                    None => keyed.full.as_ref(),
                };
                slot.map(|slot| (slot.timestamp, slot.snapshot.as_ref()))
            }
        }
    }

    fn touch(&mut self, index: NodeIndex, key: Option<&AnyKey>, timestamp: Timestamp) {
        match self.nodes.get_mut(index.0) {
            Some(NodeState::Basic(Some(slot))) => slot.timestamp = timestamp,
            Some(NodeState::KeyList(list)) => list.timestamp = Some(timestamp),
            Some(NodeState::Keyed(keyed)) => {
                let slot = match key {
                    Some(key) => keyed.per_key.get_mut(key),
                    None => keyed.full.as_mut(),
                };
                if let Some(slot) = slot {
                    slot.timestamp = timestamp;
                }
            }
            _ => {}
        }
    }

    fn store(
        &mut self,
        index: NodeIndex,
        key: Option<&AnyKey>,
        value_id: &ValueId,
        stored: Stored,
        timestamp: Timestamp,
        snapshot: Option<Arc<[AnyValue]>>,
    ) {
        let slot = Slot {
            stored,
            timestamp,
            snapshot,
        };
        let changed = match self.nodes.get_mut(index.0) {
            Some(NodeState::Basic(current)) => {
                let changed = current
                    .as_ref()
                    .map_or(true, |current| !current.stored.same_as(&slot.stored));
                *current = Some(slot);
                changed
            }
            Some(NodeState::Keyed(keyed)) => match key {
                Some(key) => {
                    let previous = keyed.per_key.insert(key.clone(), slot);
                    let current = keyed.per_key.get(key);
                    match (previous, current) {
                        (Some(previous), Some(current)) => !previous.stored.same_as(&current.stored),
                        _ => true,
                    }
                }
                None => false,
            },
            Some(NodeState::KeyList(_)) => {
                return self.store_key_list(index, value_id, slot);
            }
            None => false,
        };
        if changed {
            self.record_event(value_id.clone(), timestamp);
        }
    }

    fn store_key_list(&mut self, index: NodeIndex, value_id: &ValueId, slot: Slot) {
        let Slot {
            stored,
            timestamp,
            snapshot,
        } = slot;
        let (keys, failure) = match stored {
            Stored::Value(value) => {
                let keys: KeyList<AnyKey> = value
                    .downcast_ref::<Vec<AnyKey>>()
                    .map(|keys| keys.iter().cloned().collect())
                    .unwrap_or_default();
                (keys, None)
            }
            Stored::Failure(failure) => (KeyList::new(), Some(failure)),
        };
        let membership_changed = self.set_membership(index, keys, timestamp);
        let Some(list) = self.list_mut(index) else {
            return;
        };
        let failure_changed = list.failure != failure;
        list.failure = failure;
        list.timestamp = Some(timestamp);
        list.snapshot = snapshot;
        if failure_changed && !membership_changed {
            self.record_event(value_id.clone(), timestamp);
        }
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    pub(crate) fn check_owner(&self, result: &TrickleStepResult) -> Result<(), TrickleError> {
        if result.instance != self.instance {
            return Err(TrickleError::ForeignResult {
                value_id: result.value_id.clone(),
            });
        }
        Ok(())
    }

    /// Store a result if it was computed against the current generation of its target and
    /// nothing at least as new is stored. Anything else is dropped.
    pub(crate) fn apply_result(&mut self, result: TrickleStepResult) {
        let TrickleStepResult {
            value_id,
            timestamp,
            outcome,
            ..
        } = result;
        let Ok((index, key)) = self.definition.resolve_value_id(&value_id) else {
            return;
        };
        let mut memo = Memo::default();
        match self.generation_of(index, key.as_ref(), &mut memo) {
            None => {
                self.tracer
                    .on_result_discarded(&value_id, timestamp, DiscardReason::KeyRemoved);
                return;
            }
            Some(generation) if generation != timestamp => {
                self.tracer
                    .on_result_discarded(&value_id, timestamp, DiscardReason::Superseded);
                return;
            }
            Some(_) => {}
        }
        if let Some((current, _)) = self.stored_meta(index, key.as_ref()) {
            if current >= timestamp {
                self.tracer
                    .on_result_discarded(&value_id, timestamp, DiscardReason::AlreadyApplied);
                return;
            }
        }
        let (stored, snapshot, applied) = match outcome {
            StepOutcome::Computed { value, snapshot } => {
                (Stored::Value(value), snapshot, AppliedResult::Computed)
            }
            StepOutcome::Failed(failure) => (Stored::Failure(failure), None, AppliedResult::Failed),
        };
        self.store(index, key.as_ref(), &value_id, stored, timestamp, snapshot);
        self.tracer.on_result_applied(&value_id, timestamp, applied);
    }

    // ------------------------------------------------------------------
    // Generations
    // ------------------------------------------------------------------

    /// The newest input generation `value_id` depends on, or `None` for a key that is not a
    /// member of its list.
    pub(crate) fn generation(&self, value_id: &ValueId) -> Result<Option<Timestamp>, TrickleError> {
        let (index, key) = self.definition.resolve_value_id(value_id)?;
        Ok(self.generation_of(index, key.as_ref(), &mut Memo::default()))
    }

    fn generation_of(
        &self,
        index: NodeIndex,
        key: Option<&AnyKey>,
        memo: &mut Memo,
    ) -> Option<Timestamp> {
        let memo_key = (index, key.cloned());
        if let Some(known) = memo.get(&memo_key) {
            return *known;
        }
        let record = self.definition.node(index);
        let generation = match (record.shape, key) {
            (NodeShape::Basic, _) if record.is_input() => Some(
                self.basic(index)
                    .map_or(Timestamp::ZERO, |slot| slot.timestamp),
            ),
            (NodeShape::KeyList, _) if record.is_input() => Some(
                self.list(index)
                    .and_then(|list| list.timestamp)
                    .unwrap_or(Timestamp::ZERO),
            ),
            (NodeShape::Basic, _) | (NodeShape::KeyList, _) => {
                self.inputs_generation(record, None, Timestamp::ZERO, memo)
            }
            (NodeShape::Keyed { key_source }, Some(key)) => {
                let joined = self
                    .list(key_source)
                    .and_then(|list| list.joined.get(key).copied());
                match joined {
                    None => None,
                    Some(joined) if record.is_input() => Some(
                        self.keyed(index)
                            .and_then(|keyed| keyed.per_key.get(key))
                            .map_or(joined, |slot| slot.timestamp.max(joined)),
                    ),
                    Some(joined) => self.inputs_generation(record, Some(key), joined, memo),
                }
            }
            (NodeShape::Keyed { key_source }, None) => {
                self.full_output_generation(index, key_source, memo)
            }
        };
        memo.insert(memo_key, generation);
        generation
    }

    fn full_output_generation(
        &self,
        index: NodeIndex,
        key_source: NodeIndex,
        memo: &mut Memo,
    ) -> Option<Timestamp> {
        let mut generation = self.generation_of(key_source, None, memo)?;
        let keys: Vec<AnyKey> = self.list(key_source)?.keys.to_vec();
        for key in &keys {
            generation = generation.max(self.generation_of(index, Some(key), memo)?);
        }
        Some(generation)
    }

    fn inputs_generation(
        &self,
        record: &NodeRecord,
        key: Option<&AnyKey>,
        base: Timestamp,
        memo: &mut Memo,
    ) -> Option<Timestamp> {
        let mut generation = base;
        for input in &record.inputs {
            let key = match input.shape {
                InputShape::KeyedCurrent => key,
                _ => None,
            };
            generation = generation.max(self.generation_of(input.source, key, memo)?);
        }
        Some(generation)
    }

    /// Whether the stored entry for `value_id` reflects the current inputs.
    ///
    /// Inputs are always settled. A key that is not a member of its list is settled once the
    /// list is.
    pub(crate) fn is_settled(&self, value_id: &ValueId) -> Result<bool, TrickleError> {
        let (index, key) = self.definition.resolve_value_id(value_id)?;
        Ok(self.settled(index, key.as_ref()))
    }

    fn settled(&self, index: NodeIndex, key: Option<&AnyKey>) -> bool {
        let record = self.definition.node(index);
        if let (NodeShape::Keyed { key_source }, Some(key)) = (record.shape, key) {
            let member = self
                .list(key_source)
                .is_some_and(|list| list.keys.contains(key));
            if !member {
                return self.settled(key_source, None);
            }
        }
        let full_output = matches!(record.shape, NodeShape::Keyed { .. }) && key.is_none();
        if record.is_input() && !full_output {
            return true;
        }
        let generation = self.generation_of(index, key, &mut Memo::default());
        match (generation, self.stored_meta(index, key)) {
            (Some(generation), Some((current, _))) => current >= generation,
            _ => false,
        }
    }

    /// Timestamp of the stored entry for `value_id`.
    pub(crate) fn value_timestamp(&self, value_id: &ValueId) -> Result<Option<Timestamp>, TrickleError> {
        let (index, key) = self.definition.resolve_value_id(value_id)?;
        if let (Some(key), Some(source)) = (&key, self.definition.node(index).key_source()) {
            let member = self.list(source).is_some_and(|list| list.keys.contains(key));
            if !member {
                return Ok(None);
            }
        }
        Ok(self.stored_meta(index, key.as_ref()).map(|(timestamp, _)| timestamp))
    }

    // ------------------------------------------------------------------
    // Outcomes
    // ------------------------------------------------------------------

    pub(crate) fn basic_outcome(&self, index: NodeIndex) -> NodeOutcome<AnyValue> {
        match self.basic(index) {
            Some(slot) => slot.stored.to_outcome(),
            None => NodeOutcome::NotYetComputed,
        }
    }

    pub(crate) fn key_list_outcome(&self, index: NodeIndex) -> NodeOutcome<Vec<AnyKey>> {
        match self.list(index) {
            Some(list) if list.timestamp.is_some() => match &list.failure {
                Some(failure) => NodeOutcome::Failure(failure.clone()),
                None => NodeOutcome::Computed(list.keys.to_vec()),
            },
            _ => NodeOutcome::NotYetComputed,
        }
    }

    pub(crate) fn keyed_outcome(&self, index: NodeIndex, key: &AnyKey) -> NodeOutcome<AnyValue> {
        let Some(source) = self.definition.node(index).key_source() else {
            return NodeOutcome::NotYetComputed;
        };
        match self.list(source) {
            Some(list) if list.timestamp.is_some() => {
                if !list.keys.contains(key) {
                    return NodeOutcome::NoSuchKey;
                }
            }
            _ => return NodeOutcome::NotYetComputed,
        }
        match self.keyed(index).and_then(|keyed| keyed.per_key.get(key)) {
            Some(slot) => slot.stored.to_outcome(),
            None => NodeOutcome::NotYetComputed,
        }
    }

    /// Current members of the key list a keyed node is defined over.
    pub(crate) fn member_keys(&self, index: NodeIndex) -> Vec<AnyKey> {
        self.definition
            .node(index)
            .key_source()
            .and_then(|source| self.list(source))
            .map(|list| list.keys.to_vec())
            .unwrap_or_default()
    }

    /// The full output, as an erased `Vec<AnyValue>`.
    pub(crate) fn keyed_list_outcome(&self, index: NodeIndex) -> NodeOutcome<AnyValue> {
        match self.keyed(index).and_then(|keyed| keyed.full.as_ref()) {
            Some(slot) => slot.stored.to_outcome(),
            None => NodeOutcome::NotYetComputed,
        }
    }
}
