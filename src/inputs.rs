//! Node handles and the inputs a node can consume.

use std::sync::Arc;

use crate::instance::BuilderId;
use crate::key::{extract_keys, extract_list, extract_value, AnyValue, NodeKey, NodeValue};
use crate::name::{KeyListNodeName, KeyedNodeName, NodeName};

/// Position of a node in its definition, which is also its topological position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeIndex(pub(crate) usize);

/// How a consumer reads a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputShape {
    /// The producer's single value.
    Value,
    /// The membership of a key list, in order.
    KeyList,
    /// A keyed producer's value at the consumer's current key.
    KeyedCurrent,
    /// All values of a keyed producer, in key list order.
    FullKeyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawInput {
    pub(crate) source: NodeIndex,
    pub(crate) shape: InputShape,
}

/// A reference from a consuming node to the output of a producing node.
///
/// Obtained from the handles returned by [`TrickleDefinitionBuilder`](crate::TrickleDefinitionBuilder)
/// and only usable with the builder that created them.
pub struct TrickleInput<T> {
    owner: BuilderId,
    name: Arc<str>,
    raw: RawInput,
    extract: fn(&AnyValue) -> Option<T>,
}

impl<T> Clone for TrickleInput<T> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner,
            name: self.name.clone(),
            raw: self.raw,
            extract: self.extract,
        }
    }
}

impl<T> std::fmt::Debug for TrickleInput<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrickleInput")
            .field("name", &self.name)
            .field("shape", &self.raw.shape)
            .finish()
    }
}

impl<T> TrickleInput<T> {
    fn descriptor(&self) -> InputDescriptor {
        InputDescriptor {
            owner: self.owner,
            name: self.name.clone(),
            raw: self.raw,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct InputDescriptor {
    pub(crate) owner: BuilderId,
    pub(crate) name: Arc<str>,
    pub(crate) raw: RawInput,
}

/// Handle to a plain node.
#[derive(Debug, Clone)]
pub struct BuiltNode<T> {
    pub(crate) owner: BuilderId,
    pub(crate) index: NodeIndex,
    pub(crate) name: NodeName<T>,
}

impl<T: NodeValue> BuiltNode<T> {
    /// The node's name.
    pub fn name(&self) -> &NodeName<T> {
        &self.name
    }

    /// The node's value as an input.
    pub fn output(&self) -> TrickleInput<T> {
        TrickleInput {
            owner: self.owner,
            name: self.name.shared_name(),
            raw: RawInput {
                source: self.index,
                shape: InputShape::Value,
            },
            extract: extract_value::<T>,
        }
    }
}

/// Handle to a key list node.
#[derive(Debug, Clone)]
pub struct BuiltKeyListNode<K> {
    pub(crate) owner: BuilderId,
    pub(crate) index: NodeIndex,
    pub(crate) name: KeyListNodeName<K>,
}

impl<K: NodeKey> BuiltKeyListNode<K> {
    /// The node's name.
    pub fn name(&self) -> &KeyListNodeName<K> {
        &self.name
    }

    /// The ordered keys as an input.
    pub fn list_output(&self) -> TrickleInput<Vec<K>> {
        TrickleInput {
            owner: self.owner,
            name: self.name.shared_name(),
            raw: RawInput {
                source: self.index,
                shape: InputShape::KeyList,
            },
            extract: extract_keys::<K>,
        }
    }
}

/// Handle to a keyed node.
#[derive(Debug, Clone)]
pub struct BuiltKeyedNode<K, T> {
    pub(crate) owner: BuilderId,
    pub(crate) index: NodeIndex,
    pub(crate) name: KeyedNodeName<K, T>,
}

impl<K: NodeKey, T: NodeValue> BuiltKeyedNode<K, T> {
    /// The node's name.
    pub fn name(&self) -> &KeyedNodeName<K, T> {
        &self.name
    }

    /// The value at the key currently being computed.
    ///
    /// Only keyed nodes over the same key list can consume this.
    pub fn keyed_output(&self) -> TrickleInput<T> {
        TrickleInput {
            owner: self.owner,
            name: self.name.shared_name(),
            raw: RawInput {
                source: self.index,
                shape: InputShape::KeyedCurrent,
            },
            extract: extract_value::<T>,
        }
    }

    /// The values at all current keys, in key list order.
    pub fn full_output(&self) -> TrickleInput<Vec<T>> {
        TrickleInput {
            owner: self.owner,
            name: self.name.shared_name(),
            raw: RawInput {
                source: self.index,
                shape: InputShape::FullKeyed,
            },
            extract: extract_list::<T>,
        }
    }
}

/// Anything that can be used as one input of a node.
pub trait IntoTrickleInput {
    /// The type the operation receives for this input.
    type Value: NodeValue;

    /// Convert into an input reference.
    fn into_input(self) -> TrickleInput<Self::Value>;
}

impl<T: NodeValue> IntoTrickleInput for TrickleInput<T> {
    type Value = T;

    fn into_input(self) -> TrickleInput<T> {
        self
    }
}

impl<T: NodeValue> IntoTrickleInput for &BuiltNode<T> {
    type Value = T;

    fn into_input(self) -> TrickleInput<T> {
        self.output()
    }
}

impl<K: NodeKey> IntoTrickleInput for &BuiltKeyListNode<K> {
    type Value = Vec<K>;

    fn into_input(self) -> TrickleInput<Vec<K>> {
        self.list_output()
    }
}

/// The erased form of a set of inputs: what to read and how to turn the values read back into
/// the operation's argument type.
pub struct InputParts<V> {
    pub(crate) inputs: Vec<InputDescriptor>,
    pub(crate) extract: Box<dyn Fn(&[AnyValue]) -> Option<V> + Send + Sync>,
}

/// The full set of inputs of a node: `()`, a single input, or a tuple of up to four inputs.
///
/// The operation receives [`TrickleInputs::Values`]: nothing, the single value, or a tuple of
/// values in the same order.
pub trait TrickleInputs {
    /// The argument type of the operation.
    type Values: 'static;

    /// Split into descriptors and an extractor.
    fn into_parts(self) -> InputParts<Self::Values>;
}

impl TrickleInputs for () {
    type Values = ();

    fn into_parts(self) -> InputParts<()> {
        InputParts {
            inputs: Vec::new(),
            extract: Box::new(|_| Some(())),
        }
    }
}

fn single<T: NodeValue>(input: TrickleInput<T>) -> InputParts<T> {
    let extract = input.extract;
    InputParts {
        inputs: vec![input.descriptor()],
        extract: Box::new(move |values| extract(values.first()?)),
    }
}

impl<T: NodeValue> TrickleInputs for TrickleInput<T> {
    type Values = T;

    fn into_parts(self) -> InputParts<T> {
        single(self)
    }
}

impl<T: NodeValue> TrickleInputs for &BuiltNode<T> {
    type Values = T;

    fn into_parts(self) -> InputParts<T> {
        single(self.output())
    }
}

impl<K: NodeKey> TrickleInputs for &BuiltKeyListNode<K> {
    type Values = Vec<K>;

    fn into_parts(self) -> InputParts<Vec<K>> {
        single(self.list_output())
    }
}

macro_rules! tuple_inputs {
    ($($ty:ident $idx:tt),+) => {
        impl<$($ty: IntoTrickleInput),+> TrickleInputs for ($($ty,)+) {
            type Values = ($(<$ty as IntoTrickleInput>::Value,)+);

            fn into_parts(self) -> InputParts<Self::Values> {
                let inputs = ($(self.$idx.into_input(),)+);
                let descriptors = vec![$(inputs.$idx.descriptor(),)+];
                let extractors = ($(inputs.$idx.extract,)+);
                InputParts {
                    inputs: descriptors,
                    extract: Box::new(move |values: &[AnyValue]| {
                        Some(($((extractors.$idx)(values.get($idx)?)?,)+))
                    }),
                }
            }
        }
    };
}

tuple_inputs!(A 0);
tuple_inputs!(A 0, B 1);
tuple_inputs!(A 0, B 1, C 2);
tuple_inputs!(A 0, B 1, C 2, D 3);
