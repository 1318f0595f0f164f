//! Graph definitions and the builder that creates them.

use std::any::TypeId;
use std::collections::HashSet as StdHashSet;
use std::fmt;
use std::sync::Arc;

use ahash::{HashMap, HashSet};

use crate::async_instance::TrickleAsyncInstance;
use crate::error::TrickleError;
use crate::executor::Executor;
use crate::inputs::{
    BuiltKeyListNode, BuiltKeyedNode, BuiltNode, InputDescriptor, InputParts, InputShape,
    NodeIndex, RawInput, TrickleInputs,
};
use crate::instance::{BuilderId, TrickleInstanceBuilder};
use crate::key::{AnyKey, AnyValue, NodeKey, NodeValue};
use crate::name::{KeyListNodeName, KeyedNodeName, NodeKind, NodeName};
use crate::outcome::TrickleFailure;
use crate::raw::TrickleRawInstance;
use crate::sync::TrickleSyncInstance;
use crate::value::ValueId;

/// An operation with its argument extraction erased. Keyed nodes receive their key.
pub(crate) type ErasedOperation =
    Arc<dyn Fn(Option<&AnyKey>, &[AnyValue]) -> anyhow::Result<AnyValue> + Send + Sync>;

/// A catch function with its result erased.
pub(crate) type ErasedCatch =
    Arc<dyn Fn(&TrickleFailure) -> anyhow::Result<AnyValue> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeShape {
    Basic,
    KeyList,
    Keyed { key_source: NodeIndex },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TypeTag {
    pub(crate) id: TypeId,
    pub(crate) name: &'static str,
}

impl TypeTag {
    fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

pub(crate) struct NodeRecord {
    pub(crate) name: Arc<str>,
    pub(crate) shape: NodeShape,
    /// Value type for plain and keyed nodes, key type for key lists.
    pub(crate) value_type: TypeTag,
    /// Key type of keyed nodes.
    pub(crate) key_type: Option<TypeTag>,
    pub(crate) inputs: Vec<RawInput>,
    pub(crate) operation: Option<ErasedOperation>,
    pub(crate) catch: Option<ErasedCatch>,
}

impl NodeRecord {
    pub(crate) fn is_input(&self) -> bool {
        self.operation.is_none()
    }

    pub(crate) fn kind(&self) -> NodeKind {
        match self.shape {
            NodeShape::Basic => NodeKind::Basic,
            NodeShape::KeyList => NodeKind::KeyList,
            NodeShape::Keyed { .. } => NodeKind::Keyed,
        }
    }

    pub(crate) fn key_source(&self) -> Option<NodeIndex> {
        match self.shape {
            NodeShape::Keyed { key_source } => Some(key_source),
            _ => None,
        }
    }
}

fn erase_operation<V, T, F>(parts_extract: Box<dyn Fn(&[AnyValue]) -> Option<V> + Send + Sync>, op: F) -> ErasedOperation
where
    V: 'static,
    T: NodeValue,
    F: Fn(V) -> anyhow::Result<T> + Send + Sync + 'static,
{
    Arc::new(move |_key, values| {
        let values = parts_extract(values)
            .ok_or_else(|| anyhow::anyhow!("input values do not match the declared input types"))?;
        op(values).map(AnyValue::new)
    })
}

fn erase_keyed_operation<K, V, T, F>(
    parts_extract: Box<dyn Fn(&[AnyValue]) -> Option<V> + Send + Sync>,
    op: F,
) -> ErasedOperation
where
    K: NodeKey,
    V: 'static,
    T: NodeValue,
    F: Fn(K, V) -> anyhow::Result<T> + Send + Sync + 'static,
{
    Arc::new(move |key, values| {
        let key = key
            .and_then(|key| key.downcast_ref::<K>())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("keyed operation called without a key"))?;
        let values = parts_extract(values)
            .ok_or_else(|| anyhow::anyhow!("input values do not match the declared input types"))?;
        op(key, values).map(AnyValue::new)
    })
}

fn erase_key_list_operation<K, V, F>(
    parts_extract: Box<dyn Fn(&[AnyValue]) -> Option<V> + Send + Sync>,
    op: F,
) -> ErasedOperation
where
    K: NodeKey,
    V: 'static,
    F: Fn(V) -> anyhow::Result<Vec<K>> + Send + Sync + 'static,
{
    Arc::new(move |_key, values| {
        let values = parts_extract(values)
            .ok_or_else(|| anyhow::anyhow!("input values do not match the declared input types"))?;
        op(values).map(erase_keys)
    })
}

fn erase_keys<K: NodeKey>(keys: Vec<K>) -> AnyValue {
    AnyValue::new(keys.into_iter().map(AnyKey::new).collect::<Vec<_>>())
}

fn erase_catch<T, C>(catch: C) -> ErasedCatch
where
    T: NodeValue,
    C: Fn(&TrickleFailure) -> anyhow::Result<T> + Send + Sync + 'static,
{
    Arc::new(move |failure| catch(failure).map(AnyValue::new))
}

fn erase_key_list_catch<K, C>(catch: C) -> ErasedCatch
where
    K: NodeKey,
    C: Fn(&TrickleFailure) -> anyhow::Result<Vec<K>> + Send + Sync + 'static,
{
    Arc::new(move |failure| catch(failure).map(erase_keys))
}

/// Builder for a [`TrickleDefinition`].
///
/// Nodes must be created after their inputs, so every definition is acyclic and creation order
/// is a topological order.
///
/// # Example
///
/// ```ignore
/// let mut builder = TrickleDefinitionBuilder::new();
/// let a = builder.create_input_node(&A)?;
/// let b = builder.create_node(&B, &a, |a| Ok(a + 1))?;
/// let definition = builder.build();
/// ```
pub struct TrickleDefinitionBuilder {
    id: BuilderId,
    nodes: Vec<NodeRecord>,
    by_name: HashMap<Arc<str>, NodeIndex>,
}

impl Default for TrickleDefinitionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrickleDefinitionBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            id: BuilderId::next(),
            nodes: Vec::new(),
            by_name: HashMap::default(),
        }
    }

    /// Create a plain input node.
    pub fn create_input_node<T: NodeValue>(
        &mut self,
        name: &NodeName<T>,
    ) -> Result<BuiltNode<T>, TrickleError> {
        let index = self.register(
            name.shared_name(),
            NodeShape::Basic,
            TypeTag::of::<T>(),
            None,
            Vec::new(),
            None,
            None,
        )?;
        Ok(BuiltNode {
            owner: self.id,
            index,
            name: name.clone(),
        })
    }

    /// Create a plain node computed from `inputs`.
    pub fn create_node<T, I, F>(
        &mut self,
        name: &NodeName<T>,
        inputs: I,
        op: F,
    ) -> Result<BuiltNode<T>, TrickleError>
    where
        T: NodeValue,
        I: TrickleInputs,
        F: Fn(I::Values) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.basic_node(name, inputs.into_parts(), op, None)
    }

    /// Create a plain node whose failed inputs are handed to `catch` instead.
    pub fn create_node_with_catch<T, I, F, C>(
        &mut self,
        name: &NodeName<T>,
        inputs: I,
        op: F,
        catch: C,
    ) -> Result<BuiltNode<T>, TrickleError>
    where
        T: NodeValue,
        I: TrickleInputs,
        F: Fn(I::Values) -> anyhow::Result<T> + Send + Sync + 'static,
        C: Fn(&TrickleFailure) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.basic_node(name, inputs.into_parts(), op, Some(erase_catch(catch)))
    }

    fn basic_node<T, V, F>(
        &mut self,
        name: &NodeName<T>,
        parts: InputParts<V>,
        op: F,
        catch: Option<ErasedCatch>,
    ) -> Result<BuiltNode<T>, TrickleError>
    where
        T: NodeValue,
        V: 'static,
        F: Fn(V) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let shared = name.shared_name();
        let inputs = self.check_inputs(&shared, None, &parts.inputs)?;
        let index = self.register(
            shared,
            NodeShape::Basic,
            TypeTag::of::<T>(),
            None,
            inputs,
            Some(erase_operation(parts.extract, op)),
            catch,
        )?;
        Ok(BuiltNode {
            owner: self.id,
            index,
            name: name.clone(),
        })
    }

    /// Create a key list input node. Its membership starts out empty.
    pub fn create_key_list_input_node<K: NodeKey>(
        &mut self,
        name: &KeyListNodeName<K>,
    ) -> Result<BuiltKeyListNode<K>, TrickleError> {
        let index = self.register(
            name.shared_name(),
            NodeShape::KeyList,
            TypeTag::of::<K>(),
            None,
            Vec::new(),
            None,
            None,
        )?;
        Ok(BuiltKeyListNode {
            owner: self.id,
            index,
            name: name.clone(),
        })
    }

    /// Create a key list node computed from `inputs`. Duplicate keys in the result are dropped.
    pub fn create_key_list_node<K, I, F>(
        &mut self,
        name: &KeyListNodeName<K>,
        inputs: I,
        op: F,
    ) -> Result<BuiltKeyListNode<K>, TrickleError>
    where
        K: NodeKey,
        I: TrickleInputs,
        F: Fn(I::Values) -> anyhow::Result<Vec<K>> + Send + Sync + 'static,
    {
        self.key_list_node(name, inputs.into_parts(), op, None)
    }

    /// Create a key list node whose failed inputs are handed to `catch` instead.
    pub fn create_key_list_node_with_catch<K, I, F, C>(
        &mut self,
        name: &KeyListNodeName<K>,
        inputs: I,
        op: F,
        catch: C,
    ) -> Result<BuiltKeyListNode<K>, TrickleError>
    where
        K: NodeKey,
        I: TrickleInputs,
        F: Fn(I::Values) -> anyhow::Result<Vec<K>> + Send + Sync + 'static,
        C: Fn(&TrickleFailure) -> anyhow::Result<Vec<K>> + Send + Sync + 'static,
    {
        self.key_list_node(
            name,
            inputs.into_parts(),
            op,
            Some(erase_key_list_catch(catch)),
        )
    }

    fn key_list_node<K, V, F>(
        &mut self,
        name: &KeyListNodeName<K>,
        parts: InputParts<V>,
        op: F,
        catch: Option<ErasedCatch>,
    ) -> Result<BuiltKeyListNode<K>, TrickleError>
    where
        K: NodeKey,
        V: 'static,
        F: Fn(V) -> anyhow::Result<Vec<K>> + Send + Sync + 'static,
    {
        let shared = name.shared_name();
        let inputs = self.check_inputs(&shared, None, &parts.inputs)?;
        let index = self.register(
            shared,
            NodeShape::KeyList,
            TypeTag::of::<K>(),
            None,
            inputs,
            Some(erase_key_list_operation(parts.extract, op)),
            catch,
        )?;
        Ok(BuiltKeyListNode {
            owner: self.id,
            index,
            name: name.clone(),
        })
    }

    /// Create a keyed input node over an input key list.
    pub fn create_keyed_input_node<K: NodeKey, T: NodeValue>(
        &mut self,
        name: &KeyedNodeName<K, T>,
        key_source: &BuiltKeyListNode<K>,
    ) -> Result<BuiltKeyedNode<K, T>, TrickleError> {
        let shared = name.shared_name();
        self.check_owner(key_source.owner, &key_source.name.shared_name())?;
        if !self.nodes[key_source.index.0].is_input() {
            return Err(TrickleError::NonInputKeySource {
                name: shared,
                key_source: key_source.name.shared_name(),
            });
        }
        let index = self.register(
            shared,
            NodeShape::Keyed {
                key_source: key_source.index,
            },
            TypeTag::of::<T>(),
            Some(TypeTag::of::<K>()),
            Vec::new(),
            None,
            None,
        )?;
        Ok(BuiltKeyedNode {
            owner: self.id,
            index,
            name: name.clone(),
        })
    }

    /// Create a keyed node: one value per key of `key_source`, each computed from the key and
    /// `inputs`.
    pub fn create_keyed_node<K, T, I, F>(
        &mut self,
        name: &KeyedNodeName<K, T>,
        key_source: &BuiltKeyListNode<K>,
        inputs: I,
        op: F,
    ) -> Result<BuiltKeyedNode<K, T>, TrickleError>
    where
        K: NodeKey,
        T: NodeValue,
        I: TrickleInputs,
        F: Fn(K, I::Values) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.keyed_node(name, key_source, inputs.into_parts(), op, None)
    }

    /// Create a keyed node whose failed inputs are handed to `catch` instead.
    pub fn create_keyed_node_with_catch<K, T, I, F, C>(
        &mut self,
        name: &KeyedNodeName<K, T>,
        key_source: &BuiltKeyListNode<K>,
        inputs: I,
        op: F,
        catch: C,
    ) -> Result<BuiltKeyedNode<K, T>, TrickleError>
    where
        K: NodeKey,
        T: NodeValue,
        I: TrickleInputs,
        F: Fn(K, I::Values) -> anyhow::Result<T> + Send + Sync + 'static,
        C: Fn(&TrickleFailure) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.keyed_node(
            name,
            key_source,
            inputs.into_parts(),
            op,
            Some(erase_catch(catch)),
        )
    }

    fn keyed_node<K, T, V, F>(
        &mut self,
        name: &KeyedNodeName<K, T>,
        key_source: &BuiltKeyListNode<K>,
        parts: InputParts<V>,
        op: F,
        catch: Option<ErasedCatch>,
    ) -> Result<BuiltKeyedNode<K, T>, TrickleError>
    where
        K: NodeKey,
        T: NodeValue,
        V: 'static,
        F: Fn(K, V) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let shared = name.shared_name();
        self.check_owner(key_source.owner, &key_source.name.shared_name())?;
        let inputs = self.check_inputs(&shared, Some(key_source.index), &parts.inputs)?;
        let index = self.register(
            shared,
            NodeShape::Keyed {
                key_source: key_source.index,
            },
            TypeTag::of::<T>(),
            Some(TypeTag::of::<K>()),
            inputs,
            Some(erase_keyed_operation(parts.extract, op)),
            catch,
        )?;
        Ok(BuiltKeyedNode {
            owner: self.id,
            index,
            name: name.clone(),
        })
    }

    /// Finish the definition.
    pub fn build(self) -> TrickleDefinition {
        let mut keyed_by_source: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::default();
        for (i, record) in self.nodes.iter().enumerate() {
            if let Some(source) = record.key_source() {
                keyed_by_source.entry(source).or_default().push(NodeIndex(i));
            }
        }
        TrickleDefinition {
            inner: Arc::new(DefinitionInner {
                builder: self.id,
                nodes: self.nodes,
                by_name: self.by_name,
                keyed_by_source,
            }),
        }
    }

    fn check_owner(&self, owner: BuilderId, name: &Arc<str>) -> Result<(), TrickleError> {
        if owner != self.id {
            return Err(TrickleError::ForeignNode { name: name.clone() });
        }
        Ok(())
    }

    fn check_inputs(
        &self,
        consumer: &Arc<str>,
        key_source: Option<NodeIndex>,
        inputs: &[InputDescriptor],
    ) -> Result<Vec<RawInput>, TrickleError> {
        inputs
            .iter()
            .map(|input| {
                self.check_owner(input.owner, &input.name)?;
                if input.raw.shape == InputShape::KeyedCurrent {
                    let producer_source = self.nodes[input.raw.source.0].key_source();
                    if key_source.is_none() || producer_source != key_source {
                        return Err(TrickleError::KeyedOutputMisuse {
                            consumer: consumer.clone(),
                            producer: input.name.clone(),
                        });
                    }
                }
                Ok(input.raw)
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        name: Arc<str>,
        shape: NodeShape,
        value_type: TypeTag,
        key_type: Option<TypeTag>,
        inputs: Vec<RawInput>,
        operation: Option<ErasedOperation>,
        catch: Option<ErasedCatch>,
    ) -> Result<NodeIndex, TrickleError> {
        if self.by_name.contains_key(&name) {
            return Err(TrickleError::DuplicateName { name });
        }
        let index = NodeIndex(self.nodes.len());
        self.by_name.insert(name.clone(), index);
        self.nodes.push(NodeRecord {
            name,
            shape,
            value_type,
            key_type,
            inputs,
            operation,
            catch,
        });
        Ok(index)
    }
}

pub(crate) struct DefinitionInner {
    builder: BuilderId,
    nodes: Vec<NodeRecord>,
    by_name: HashMap<Arc<str>, NodeIndex>,
    keyed_by_source: HashMap<NodeIndex, Vec<NodeIndex>>,
}

/// An immutable graph of nodes.
///
/// Cheap to clone and shareable across threads. Any number of independent instances can be
/// created from one definition.
#[derive(Clone)]
pub struct TrickleDefinition {
    inner: Arc<DefinitionInner>,
}

impl TrickleDefinition {
    /// Configure a new instance.
    pub fn instance_builder(&self) -> TrickleInstanceBuilder {
        TrickleInstanceBuilder::new(self.clone())
    }

    /// Create a manually stepped instance.
    pub fn instantiate_raw(&self) -> TrickleRawInstance {
        self.instance_builder().build_raw()
    }

    /// Create a lazily computing instance.
    pub fn instantiate_sync(&self) -> TrickleSyncInstance {
        self.instance_builder().build_sync()
    }

    /// Create an instance computing on `executor`.
    pub fn instantiate_async(&self, executor: Arc<dyn Executor>) -> TrickleAsyncInstance {
        let raw = self.instantiate_raw();
        TrickleAsyncInstance::new(raw, executor)
    }

    /// The id of the builder that created this definition.
    pub fn builder_id(&self) -> BuilderId {
        self.inner.builder
    }

    /// The number of nodes.
    pub fn len(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Whether the definition has no nodes.
    pub fn is_empty(&self) -> bool {
        self.inner.nodes.is_empty()
    }

    /// All value ids `target` transitively depends on, including `target` itself.
    ///
    /// Dependencies through `keyed_output` are tracked per key. A keyed node needed at all of
    /// its keys is reported as its [`ValueId::FullKeyedList`].
    pub fn relevant_values(&self, target: &ValueId) -> Result<StdHashSet<ValueId>, TrickleError> {
        let (index, key) = self.resolve_value_id(target)?;
        let mut relevant = StdHashSet::new();
        let mut visited: HashSet<(NodeIndex, Option<AnyKey>)> = HashSet::default();
        let mut pending = vec![(index, key)];
        while let Some((index, key)) = pending.pop() {
            if !visited.insert((index, key.clone())) {
                continue;
            }
            let record = self.node(index);
            let value_id = match (&record.shape, &key) {
                (NodeShape::Basic, _) => ValueId::Nonkeyed(record.name.clone()),
                (NodeShape::KeyList, _) => ValueId::FullKeyList(record.name.clone()),
                (NodeShape::Keyed { .. }, Some(key)) => {
                    ValueId::Keyed(record.name.clone(), key.clone())
                }
                (NodeShape::Keyed { .. }, None) => ValueId::FullKeyedList(record.name.clone()),
            };
            relevant.insert(value_id);
            if let Some(source) = record.key_source() {
                pending.push((source, None));
            }
            for input in &record.inputs {
                let key = match input.shape {
                    InputShape::KeyedCurrent => key.clone(),
                    _ => None,
                };
                pending.push((input.source, key));
            }
        }
        Ok(relevant)
    }

    pub(crate) fn node(&self, index: NodeIndex) -> &NodeRecord {
        &self.inner.nodes[index.0]
    }

    pub(crate) fn nodes(&self) -> &[NodeRecord] {
        &self.inner.nodes
    }

    pub(crate) fn keyed_over(&self, source: NodeIndex) -> &[NodeIndex] {
        self.inner
            .keyed_by_source
            .get(&source)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn lookup(&self, name: &Arc<str>, expected: NodeKind) -> Result<NodeIndex, TrickleError> {
        let index = *self
            .inner
            .by_name
            .get(name)
            .ok_or_else(|| TrickleError::UnknownNode { name: name.clone() })?;
        let actual = self.node(index).kind();
        if actual != expected {
            return Err(TrickleError::WrongKind {
                name: name.clone(),
                expected,
                actual,
            });
        }
        Ok(index)
    }

    fn check_type(
        &self,
        name: &Arc<str>,
        actual: Option<TypeTag>,
        expected: TypeId,
        expected_name: &'static str,
    ) -> Result<(), TrickleError> {
        match actual {
            Some(tag) if tag.id == expected => Ok(()),
            Some(tag) => Err(TrickleError::TypeMismatch {
                name: name.clone(),
                expected: expected_name,
                actual: tag.name,
            }),
            None => Err(TrickleError::TypeMismatch {
                name: name.clone(),
                expected: expected_name,
                actual: "()",
            }),
        }
    }

    /// Resolve a plain node by name and check its value type.
    pub(crate) fn resolve_basic_erased(
        &self,
        name: &Arc<str>,
        value_type: TypeId,
        value_type_name: &'static str,
    ) -> Result<NodeIndex, TrickleError> {
        let index = self.lookup(name, NodeKind::Basic)?;
        self.check_type(name, Some(self.node(index).value_type), value_type, value_type_name)?;
        Ok(index)
    }

    pub(crate) fn resolve_key_list_erased(
        &self,
        name: &Arc<str>,
        key_type: TypeId,
        key_type_name: &'static str,
    ) -> Result<NodeIndex, TrickleError> {
        let index = self.lookup(name, NodeKind::KeyList)?;
        self.check_type(name, Some(self.node(index).value_type), key_type, key_type_name)?;
        Ok(index)
    }

    pub(crate) fn resolve_keyed_erased(
        &self,
        name: &Arc<str>,
        key_type: Option<(TypeId, &'static str)>,
        value_type: Option<(TypeId, &'static str)>,
    ) -> Result<NodeIndex, TrickleError> {
        let index = self.lookup(name, NodeKind::Keyed)?;
        let record = self.node(index);
        if let Some((id, type_name)) = key_type {
            self.check_type(name, record.key_type, id, type_name)?;
        }
        if let Some((id, type_name)) = value_type {
            self.check_type(name, Some(record.value_type), id, type_name)?;
        }
        Ok(index)
    }

    pub(crate) fn resolve_basic<T: 'static>(
        &self,
        name: &NodeName<T>,
    ) -> Result<NodeIndex, TrickleError> {
        self.resolve_basic_erased(
            &name.shared_name(),
            TypeId::of::<T>(),
            std::any::type_name::<T>(),
        )
    }

    pub(crate) fn resolve_key_list<K: 'static>(
        &self,
        name: &KeyListNodeName<K>,
    ) -> Result<NodeIndex, TrickleError> {
        self.resolve_key_list_erased(
            &name.shared_name(),
            TypeId::of::<K>(),
            std::any::type_name::<K>(),
        )
    }

    pub(crate) fn resolve_keyed<K: 'static, T: 'static>(
        &self,
        name: &KeyedNodeName<K, T>,
    ) -> Result<NodeIndex, TrickleError> {
        self.resolve_keyed_erased(
            &name.shared_name(),
            Some((TypeId::of::<K>(), std::any::type_name::<K>())),
            Some((TypeId::of::<T>(), std::any::type_name::<T>())),
        )
    }

    /// Resolve the node a value id points into, with its key if it names one.
    pub(crate) fn resolve_value_id(
        &self,
        value_id: &ValueId,
    ) -> Result<(NodeIndex, Option<AnyKey>), TrickleError> {
        match value_id {
            ValueId::Nonkeyed(name) => Ok((self.lookup(name, NodeKind::Basic)?, None)),
            ValueId::FullKeyList(name) => Ok((self.lookup(name, NodeKind::KeyList)?, None)),
            ValueId::Keyed(name, key) => {
                let index = self.lookup(name, NodeKind::Keyed)?;
                if let Some(tag) = self.node(index).key_type {
                    if tag.id != key.type_id() {
                        return Err(TrickleError::TypeMismatch {
                            name: name.clone(),
                            expected: key.type_name(),
                            actual: tag.name,
                        });
                    }
                }
                Ok((index, Some(key.clone())))
            }
            ValueId::FullKeyedList(name) => Ok((self.lookup(name, NodeKind::Keyed)?, None)),
        }
    }
}

/// Whether a step for `value_id` is needed to settle any value of `relevant`.
pub(crate) fn is_relevant(relevant: &StdHashSet<ValueId>, value_id: &ValueId) -> bool {
    if relevant.contains(value_id) {
        return true;
    }
    match value_id {
        ValueId::Keyed(name, _) => relevant.contains(&ValueId::FullKeyedList(name.clone())),
        _ => false,
    }
}

impl fmt::Debug for TrickleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrickleDefinition")
            .field("builder", &self.inner.builder)
            .field("nodes", &self.inner.nodes.len())
            .finish()
    }
}

impl fmt::Display for TrickleDefinition {
    /// One line per node in topological order: name, kind, key source and inputs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in self.nodes() {
            write!(f, "{}: {}", record.name, record.kind())?;
            if record.is_input() {
                f.write_str(" input")?;
            }
            if let Some(source) = record.key_source() {
                write!(f, " over {}", self.node(source).name)?;
            }
            if !record.inputs.is_empty() {
                f.write_str(" <- ")?;
                for (i, input) in record.inputs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    let source = &self.node(input.source).name;
                    match input.shape {
                        InputShape::Value => write!(f, "{source}")?,
                        InputShape::KeyList => write!(f, "{source}[keys]")?,
                        InputShape::KeyedCurrent => write!(f, "{source}[key]")?,
                        InputShape::FullKeyed => write!(f, "{source}[*]")?,
                    }
                }
            }
            if record.catch.is_some() {
                f.write_str(" (catches)")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
