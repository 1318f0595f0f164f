//! Observable results of querying a node.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::value::ValueId;

/// Everything that kept a value from being computed: errors raised by operations and inputs
/// that had no value.
///
/// Failures of several inputs combine with [`TrickleFailure::union`], which keeps every error
/// and every missing input.
#[derive(Clone, Default)]
pub struct TrickleFailure {
    /// Errors raised while computing the given values.
    pub errors: HashMap<ValueId, Arc<anyhow::Error>>,
    /// Inputs that had no value.
    pub missing_inputs: HashSet<ValueId>,
}

impl TrickleFailure {
    /// A failure caused by `value_id` raising `error`.
    pub fn error(value_id: ValueId, error: anyhow::Error) -> Self {
        let mut errors = HashMap::new();
        errors.insert(value_id, Arc::new(error));
        Self {
            errors,
            missing_inputs: HashSet::new(),
        }
    }

    /// A failure caused by `value_id` having no value.
    pub fn missing(value_id: ValueId) -> Self {
        let mut missing_inputs = HashSet::new();
        missing_inputs.insert(value_id);
        Self {
            errors: HashMap::new(),
            missing_inputs,
        }
    }

    /// Combine two failures, keeping everything from both.
    pub fn union(mut self, other: &TrickleFailure) -> Self {
        self.merge(other);
        self
    }

    pub(crate) fn merge(&mut self, other: &TrickleFailure) {
        for (value_id, error) in &other.errors {
            self.errors
                .entry(value_id.clone())
                .or_insert_with(|| error.clone());
        }
        self.missing_inputs
            .extend(other.missing_inputs.iter().cloned());
    }

    /// Combine any number of failures.
    pub fn combine<'a>(failures: impl IntoIterator<Item = &'a TrickleFailure>) -> Self {
        let mut combined = TrickleFailure::default();
        for failure in failures {
            combined.merge(failure);
        }
        combined
    }

    /// Returns the error raised by `value_id`, if any.
    pub fn error_for(&self, value_id: &ValueId) -> Option<&Arc<anyhow::Error>> {
        self.errors.get(value_id)
    }
}

impl PartialEq for TrickleFailure {
    /// Errors compare by the value that raised them and their rendered message.
    fn eq(&self, other: &Self) -> bool {
        self.missing_inputs == other.missing_inputs
            && self.errors.len() == other.errors.len()
            && self.errors.iter().all(|(value_id, error)| {
                other
                    .errors
                    .get(value_id)
                    .is_some_and(|o| Arc::ptr_eq(error, o) || format!("{error:#}") == format!("{o:#}"))
            })
    }
}

impl fmt::Debug for TrickleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errors: Vec<String> = self
            .errors
            .iter()
            .map(|(value_id, error)| format!("{value_id}: {error:#}"))
            .collect();
        let missing: Vec<String> = self.missing_inputs.iter().map(|v| v.to_string()).collect();
        f.debug_struct("TrickleFailure")
            .field("errors", &errors)
            .field("missing_inputs", &missing)
            .finish()
    }
}

impl fmt::Display for TrickleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (value_id, error) in &self.errors {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{value_id} failed: {error:#}")?;
        }
        for value_id in &self.missing_inputs {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{value_id} is missing")?;
        }
        Ok(())
    }
}

/// The result of querying a value.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome<T> {
    /// Nothing has been computed for the value yet.
    NotYetComputed,
    /// The value was computed.
    Computed(T),
    /// The value could not be computed.
    Failure(TrickleFailure),
    /// The queried key is not in the node's key list.
    NoSuchKey,
}

impl<T> NodeOutcome<T> {
    /// Returns the computed value, if any.
    pub fn value(self) -> Option<T> {
        match self {
            NodeOutcome::Computed(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the failure, if any.
    pub fn failure(&self) -> Option<&TrickleFailure> {
        match self {
            NodeOutcome::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    /// Returns `true` for [`NodeOutcome::Computed`].
    pub fn is_computed(&self) -> bool {
        matches!(self, NodeOutcome::Computed(_))
    }

    /// Map the computed value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> NodeOutcome<U> {
        match self {
            NodeOutcome::NotYetComputed => NodeOutcome::NotYetComputed,
            NodeOutcome::Computed(value) => NodeOutcome::Computed(f(value)),
            NodeOutcome::Failure(failure) => NodeOutcome::Failure(failure),
            NodeOutcome::NoSuchKey => NodeOutcome::NoSuchKey,
        }
    }
}
