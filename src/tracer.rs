//! Tracer trait for observing instance activity.
//!
//! This module defines the [`Tracer`] trait. The default [`NoopTracer`] ignores everything;
//! [`LogTracer`] forwards events to the `log` crate.
//!
//! # Example
//!
//! ```ignore
//! use trickle::{Timestamp, Tracer, ValueId};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn on_step_created(&self, value_id: &ValueId, timestamp: Timestamp) {
//!         println!("will compute {value_id} at {timestamp}");
//!     }
//! }
//!
//! let instance = definition.instance_builder().tracer(PrintTracer).build_raw();
//! ```

use crate::value::{Timestamp, ValueId};

/// How a reported result ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedResult {
    /// The operation (or catch) produced a value.
    Computed,
    /// The operation (or catch) failed.
    Failed,
}

/// Why a reported result was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Inputs of the target changed after the step was created.
    Superseded,
    /// A result at least as new was already applied.
    AlreadyApplied,
    /// The target key left its key list.
    KeyRemoved,
}

/// Tracer trait for observing instance activity.
///
/// All methods have default empty implementations. Hooks are called while the instance's
/// store is locked, so they should return quickly and must not call back into the instance.
pub trait Tracer: Send + Sync + 'static {
    /// Called when input changes were applied at `timestamp`.
    #[inline]
    fn on_input_changed(&self, _timestamp: Timestamp, _changes: usize) {}

    /// Called when a step is handed out for `value_id`.
    #[inline]
    fn on_step_created(&self, _value_id: &ValueId, _timestamp: Timestamp) {}

    /// Called when an operation was not rerun because its inputs were unchanged.
    #[inline]
    fn on_operation_skipped(&self, _value_id: &ValueId, _timestamp: Timestamp) {}

    /// Called when a failure was recorded without running anything (failed or missing inputs).
    #[inline]
    fn on_failure_resolved(&self, _value_id: &ValueId, _timestamp: Timestamp) {}

    /// Called when a reported result was stored.
    #[inline]
    fn on_result_applied(&self, _value_id: &ValueId, _timestamp: Timestamp, _result: AppliedResult) {}

    /// Called when a reported result was ignored.
    #[inline]
    fn on_result_discarded(&self, _value_id: &ValueId, _timestamp: Timestamp, _reason: DiscardReason) {
    }
}

/// Tracer that discards all events.
///
/// This is the default tracer for every instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Tracer that forwards events to the `log` crate under the `trickle` target.
#[cfg(feature = "log")]
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

#[cfg(feature = "log")]
impl Tracer for LogTracer {
    fn on_input_changed(&self, timestamp: Timestamp, changes: usize) {
        log::debug!(target: "trickle", "applied {changes} input change(s) at {timestamp}");
    }

    fn on_step_created(&self, value_id: &ValueId, timestamp: Timestamp) {
        log::trace!(target: "trickle", "step for {value_id} at {timestamp}");
    }

    fn on_operation_skipped(&self, value_id: &ValueId, timestamp: Timestamp) {
        log::trace!(target: "trickle", "inputs of {value_id} unchanged at {timestamp}");
    }

    fn on_failure_resolved(&self, value_id: &ValueId, timestamp: Timestamp) {
        log::debug!(target: "trickle", "{value_id} failed at {timestamp}");
    }

    fn on_result_applied(&self, value_id: &ValueId, timestamp: Timestamp, result: AppliedResult) {
        match result {
            AppliedResult::Computed => {
                log::trace!(target: "trickle", "computed {value_id} at {timestamp}")
            }
            AppliedResult::Failed => {
                log::debug!(target: "trickle", "operation for {value_id} failed at {timestamp}")
            }
        }
    }

    fn on_result_discarded(&self, value_id: &ValueId, timestamp: Timestamp, reason: DiscardReason) {
        log::trace!(target: "trickle", "discarded result for {value_id} at {timestamp}: {reason:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTracer {
        steps: AtomicUsize,
        discarded: AtomicUsize,
    }

    impl CountingTracer {
        fn new() -> Self {
            Self {
                steps: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
            }
        }
    }

    impl Tracer for CountingTracer {
        fn on_step_created(&self, _value_id: &ValueId, _timestamp: Timestamp) {
            self.steps.fetch_add(1, Ordering::Relaxed);
        }

        fn on_result_discarded(&self, _value_id: &ValueId, _timestamp: Timestamp, _reason: DiscardReason) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_counting_tracer() {
        let tracer = CountingTracer::new();
        let id = ValueId::Nonkeyed(Arc::from("b"));

        tracer.on_step_created(&id, Timestamp::new(1));
        tracer.on_step_created(&id, Timestamp::new(2));
        tracer.on_result_discarded(&id, Timestamp::new(1), DiscardReason::Superseded);
        tracer.on_result_applied(&id, Timestamp::new(2), AppliedResult::Computed);

        assert_eq!(tracer.steps.load(Ordering::Relaxed), 2);
        assert_eq!(tracer.discarded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_tracer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopTracer>();
        assert_send_sync::<Arc<dyn Tracer>>();
    }
}
