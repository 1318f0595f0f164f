#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod async_instance;
mod change;
mod definition;
mod error;
mod executor;
mod inputs;
mod instance;
mod key;
mod name;
mod outcome;
mod raw;
mod step;
mod store;
mod sync;
mod tracer;
mod value;

pub use async_instance::{ListenerId, TrickleAsyncInstance, TrickleAsyncTimestamp, TrickleEvent};
pub use change::TrickleInputChange;
pub use definition::{TrickleDefinition, TrickleDefinitionBuilder};
pub use error::TrickleError;
pub use executor::{Executor, Job, ThreadPoolExecutor};
pub use inputs::{
    BuiltKeyListNode, BuiltKeyedNode, BuiltNode, InputParts, IntoTrickleInput, TrickleInput,
    TrickleInputs,
};
pub use instance::{BuilderId, InstanceId, TrickleInstanceBuilder};
pub use key::{AnyKey, AnyValue, DynKey, DynValue, NodeKey, NodeValue};
pub use name::{KeyListNodeName, KeyedNodeName, NodeKind, NodeName};
pub use outcome::{NodeOutcome, TrickleFailure};
pub use raw::TrickleRawInstance;
pub use step::{TrickleStep, TrickleStepResult};
pub use sync::TrickleSyncInstance;
#[cfg(feature = "log")]
pub use tracer::LogTracer;
pub use tracer::{AppliedResult, DiscardReason, NoopTracer, Tracer};
pub use value::{KeyList, Timestamp, ValueId};
