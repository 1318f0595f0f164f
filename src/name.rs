//! Typed node identifiers.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// The three kinds of nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A node holding a single value.
    Basic,
    /// A node holding an ordered set of keys.
    KeyList,
    /// A family of values, one per key of a key list.
    Keyed,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Basic => write!(f, "basic"),
            NodeKind::KeyList => write!(f, "key list"),
            NodeKind::Keyed => write!(f, "keyed"),
        }
    }
}

macro_rules! node_name {
    ($(#[$meta:meta])* $name:ident<$($param:ident),+>, $kind:expr) => {
        $(#[$meta])*
        pub struct $name<$($param),+> {
            name: Arc<str>,
            _marker: PhantomData<fn() -> ($($param,)+)>,
        }

        impl<$($param),+> $name<$($param),+> {
            /// Create a name.
            pub fn new(name: impl Into<Arc<str>>) -> Self {
                Self {
                    name: name.into(),
                    _marker: PhantomData,
                }
            }

            /// The name as a string.
            pub fn name(&self) -> &str {
                &self.name
            }

            /// The kind of node this name refers to.
            pub fn kind(&self) -> NodeKind {
                $kind
            }

            pub(crate) fn shared_name(&self) -> Arc<str> {
                self.name.clone()
            }
        }

        impl<$($param),+> Clone for $name<$($param),+> {
            fn clone(&self) -> Self {
                Self {
                    name: self.name.clone(),
                    _marker: PhantomData,
                }
            }
        }

        impl<$($param),+> PartialEq for $name<$($param),+> {
            fn eq(&self, other: &Self) -> bool {
                self.name == other.name
            }
        }

        impl<$($param),+> Eq for $name<$($param),+> {}

        impl<$($param),+> Hash for $name<$($param),+> {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.name.hash(state);
            }
        }

        impl<$($param),+> fmt::Debug for $name<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.name)
            }
        }

        impl<$($param),+> fmt::Display for $name<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.name)
            }
        }
    };
}

node_name!(
    /// Name of a plain node producing values of type `T`.
    NodeName<T>,
    NodeKind::Basic
);

node_name!(
    /// Name of a key list node holding keys of type `K`.
    KeyListNodeName<K>,
    NodeKind::KeyList
);

node_name!(
    /// Name of a keyed node producing one `T` per key of type `K`.
    KeyedNodeName<K, T>,
    NodeKind::Keyed
);
