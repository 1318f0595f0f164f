//! Units of work handed out by an instance.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::definition::{ErasedCatch, ErasedOperation};
use crate::instance::InstanceId;
use crate::key::{extract_keys, AnyKey, AnyValue, NodeKey, NodeValue};
use crate::outcome::TrickleFailure;
use crate::value::{Timestamp, ValueId};

pub(crate) enum StepWork {
    /// Run the node's operation on a snapshot of its inputs.
    Compute {
        operation: ErasedOperation,
        key: Option<AnyKey>,
        inputs: Arc<[AnyValue]>,
    },
    /// Run the node's catch function on the failure of its inputs.
    Catch {
        catch: ErasedCatch,
        failure: TrickleFailure,
    },
}

/// A pure computation of one value, captured with everything it needs.
///
/// Executing a step does not touch the instance, so steps can run on any thread and in any
/// order. The result must be reported back to the instance that created the step.
pub struct TrickleStep {
    pub(crate) instance: InstanceId,
    pub(crate) value_id: ValueId,
    pub(crate) timestamp: Timestamp,
    pub(crate) work: StepWork,
}

impl TrickleStep {
    /// The value this step computes.
    pub fn value_id(&self) -> &ValueId {
        &self.value_id
    }

    /// The generation of the inputs this step was created from.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The instance that created this step.
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Whether this step runs a catch function rather than the operation.
    pub fn is_catch(&self) -> bool {
        matches!(self.work, StepWork::Catch { .. })
    }

    /// Run the computation. Errors and panics become a failure of the target value.
    pub fn execute(&self) -> TrickleStepResult {
        let outcome = match &self.work {
            StepWork::Compute {
                operation,
                key,
                inputs,
            } => match run_guarded(|| operation(key.as_ref(), &inputs[..])) {
                Ok(value) => StepOutcome::Computed {
                    value,
                    snapshot: Some(inputs.clone()),
                },
                Err(error) => StepOutcome::Failed(TrickleFailure::error(self.value_id.clone(), error)),
            },
            StepWork::Catch { catch, failure } => match run_guarded(|| catch(failure)) {
                Ok(value) => StepOutcome::Computed {
                    value,
                    snapshot: None,
                },
                Err(error) => StepOutcome::Failed(
                    failure
                        .clone()
                        .union(&TrickleFailure::error(self.value_id.clone(), error)),
                ),
            },
        };
        TrickleStepResult {
            instance: self.instance,
            value_id: self.value_id.clone(),
            timestamp: self.timestamp,
            outcome,
        }
    }
}

fn run_guarded(f: impl FnOnce() -> anyhow::Result<AnyValue>) -> anyhow::Result<AnyValue> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("operation panicked: {message}"))
        }
    }
}

impl fmt::Debug for TrickleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_catch() { "catch" } else { "compute" };
        write!(f, "TrickleStep({kind} {} @ {})", self.value_id, self.timestamp)
    }
}

#[derive(Clone)]
pub(crate) enum StepOutcome {
    Computed {
        value: AnyValue,
        /// Inputs the value was computed from; absent for values produced by a catch.
        snapshot: Option<Arc<[AnyValue]>>,
    },
    Failed(TrickleFailure),
}

/// The result of executing a [`TrickleStep`].
#[derive(Clone)]
pub struct TrickleStepResult {
    pub(crate) instance: InstanceId,
    pub(crate) value_id: ValueId,
    pub(crate) timestamp: Timestamp,
    pub(crate) outcome: StepOutcome,
}

impl TrickleStepResult {
    /// The value this result is for.
    pub fn value_id(&self) -> &ValueId {
        &self.value_id
    }

    /// The generation of the inputs the result was computed from.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The instance that created the step.
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// The computed value of a plain or keyed node, if the step succeeded.
    pub fn value<T: NodeValue>(&self) -> Option<T> {
        match &self.outcome {
            StepOutcome::Computed { value, .. } => value.downcast_ref::<T>().cloned(),
            StepOutcome::Failed(_) => None,
        }
    }

    /// The computed keys of a key list node, if the step succeeded.
    pub fn keys<K: NodeKey>(&self) -> Option<Vec<K>> {
        match &self.outcome {
            StepOutcome::Computed { value, .. } => extract_keys(value),
            StepOutcome::Failed(_) => None,
        }
    }

    /// The failure, if the step failed.
    pub fn failure(&self) -> Option<&TrickleFailure> {
        match &self.outcome {
            StepOutcome::Failed(failure) => Some(failure),
            StepOutcome::Computed { .. } => None,
        }
    }

    /// Whether the step failed.
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, StepOutcome::Failed(_))
    }
}

impl fmt::Debug for TrickleStepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TrickleStepResult");
        s.field("value_id", &self.value_id)
            .field("timestamp", &self.timestamp);
        match &self.outcome {
            StepOutcome::Computed { value, .. } => s.field("value", value),
            StepOutcome::Failed(failure) => s.field("failure", failure),
        };
        s.finish()
    }
}
