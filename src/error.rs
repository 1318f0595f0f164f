//! Usage errors.
//!
//! These report misuse of the API: mixing handles between builders or instances, naming nodes
//! that do not exist, or mutating nodes that are not inputs. They are returned at the call site
//! and never stored in an instance. Problems inside node operations are modeled as data instead
//! (see [`TrickleFailure`](crate::TrickleFailure)).

use std::sync::Arc;

use crate::name::NodeKind;
use crate::value::ValueId;

/// Errors returned for misuse of builders and instances.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrickleError {
    /// A node handle created by another builder was passed to a builder.
    #[error("node `{name}` was created by a different definition builder")]
    ForeignNode {
        /// Name of the foreign node.
        name: Arc<str>,
    },

    /// A step result created by another instance was reported.
    #[error("result for {value_id} was produced by a different instance")]
    ForeignResult {
        /// Target of the reported result.
        value_id: ValueId,
    },

    /// The definition has no node with this name.
    #[error("unknown node `{name}`")]
    UnknownNode {
        /// The unknown name.
        name: Arc<str>,
    },

    /// The node exists but has another kind.
    #[error("node `{name}` is a {actual} node, not a {expected} node")]
    WrongKind {
        /// Name of the node.
        name: Arc<str>,
        /// Kind requested by the caller.
        expected: NodeKind,
        /// Kind in the definition.
        actual: NodeKind,
    },

    /// The node exists but holds values or keys of another type.
    #[error("node `{name}` holds `{actual}`, not `{expected}`")]
    TypeMismatch {
        /// Name of the node.
        name: Arc<str>,
        /// Type requested by the caller.
        expected: &'static str,
        /// Type in the definition.
        actual: &'static str,
    },

    /// The node is computed, so it cannot be set from outside.
    #[error("node `{name}` is not an input node")]
    NotAnInput {
        /// Name of the node.
        name: Arc<str>,
    },

    /// A node with this name already exists in the builder.
    #[error("a node named `{name}` already exists")]
    DuplicateName {
        /// The duplicated name.
        name: Arc<str>,
    },

    /// A keyed input node was given a computed key list as its key source.
    #[error("keyed input node `{name}` needs a key list input node as key source, but `{key_source}` is computed")]
    NonInputKeySource {
        /// Name of the keyed input node.
        name: Arc<str>,
        /// Name of the computed key list.
        key_source: Arc<str>,
    },

    /// `keyed_output` was used by a node that does not share its key source.
    #[error("`{consumer}` cannot use the per-key output of `{producer}`; only keyed nodes over the same key list can")]
    KeyedOutputMisuse {
        /// Name of the consuming node.
        consumer: Arc<str>,
        /// Name of the keyed producer.
        producer: Arc<str>,
    },

    /// A value was requested, but the outcome is not [`NodeOutcome::Computed`](crate::NodeOutcome::Computed).
    #[error("{value_id} has no computed value ({outcome})")]
    NotComputed {
        /// The queried value.
        value_id: ValueId,
        /// Description of the actual outcome.
        outcome: String,
    },

    /// An async read did not complete before its deadline.
    #[error("timed out waiting for {value_id}")]
    Timeout {
        /// The value that was waited for.
        value_id: ValueId,
    },

    /// The async instance was shut down.
    #[error("instance has been shut down")]
    Shutdown,

    /// The bundled thread pool could not start its workers.
    #[error("could not start executor: {message}")]
    ExecutorUnavailable {
        /// The underlying I/O error.
        message: String,
    },
}
