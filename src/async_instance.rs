//! The instance that computes in the background.
//!
//! All state changes go through one management job at a time: it applies queued input changes
//! in submission order, settles what needs no computation and submits one job per new step.
//! Step jobs execute on the executor without any lock held, report their result and schedule
//! the management job again. Readers block on a condition variable until the changes they
//! depend on are applied and their value is settled.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use slab::Slab;

use crate::change::TrickleInputChange;
use crate::definition::TrickleDefinition;
use crate::error::TrickleError;
use crate::executor::{Executor, Job};
use crate::key::{AnyKey, NodeKey, NodeValue};
use crate::name::{KeyListNodeName, KeyedNodeName, NodeName};
use crate::outcome::NodeOutcome;
use crate::raw::{into_value, TrickleRawInstance};
use crate::step::TrickleStep;
use crate::store::Store;
use crate::value::{Timestamp, ValueId};

/// Marks a change submitted to a [`TrickleAsyncInstance`].
///
/// Pass it to a read to wait until the change has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrickleAsyncTimestamp(u64);

impl TrickleAsyncTimestamp {
    /// Position of the change in submission order, starting at 1.
    pub fn sequence(self) -> u64 {
        self.0
    }
}

/// A change of a value, delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct TrickleEvent<T> {
    /// The value that changed.
    pub value_id: ValueId,
    /// Timestamp of the change. The event sent at registration carries the instance's clock.
    pub timestamp: Timestamp,
    /// The outcome when the event was collected.
    pub outcome: NodeOutcome<T>,
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

enum ListenerTarget {
    Value(ValueId),
    EveryKey(Arc<str>),
}

impl ListenerTarget {
    fn matches(&self, value_id: &ValueId) -> bool {
        match (self, value_id) {
            (ListenerTarget::Value(target), value_id) => target == value_id,
            (ListenerTarget::EveryKey(name), ValueId::Keyed(keyed, _)) => name == keyed,
            (ListenerTarget::EveryKey(_), _) => false,
        }
    }
}

type Notify = Box<dyn Fn(&Store, &ValueId, Timestamp) -> Option<Job> + Send + Sync>;

struct Listener {
    target: ListenerTarget,
    notify: Notify,
}

/// Runs a task on one thread at a time. A request made while the task runs makes it run again.
#[derive(Default)]
struct Serial {
    running: Mutex<()>,
    requested: AtomicBool,
}

impl Serial {
    fn run(&self, mut task: impl FnMut()) {
        self.requested.store(true, Ordering::SeqCst);
        loop {
            let Some(guard) = self.running.try_lock() else {
                return;
            };
            while self.requested.swap(false, Ordering::SeqCst) {
                task();
            }
            drop(guard);
            if !self.requested.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

struct Pending {
    sequence: u64,
    changes: Vec<TrickleInputChange>,
}

#[derive(Default)]
struct Queue {
    last_sequence: u64,
    pending: VecDeque<Pending>,
}

struct Progress {
    /// Sequence of the last applied change.
    applied: u64,
}

struct AsyncInner {
    raw: TrickleRawInstance,
    executor: Mutex<Option<Arc<dyn Executor>>>,
    queue: Mutex<Queue>,
    management: Serial,
    in_flight: Mutex<HashSet<(ValueId, Timestamp)>>,
    progress: Mutex<Progress>,
    changed: Condvar,
    listeners: Mutex<Slab<Listener>>,
    deliveries: Mutex<VecDeque<Job>>,
    delivery: Serial,
    shut_down: AtomicBool,
}

impl AsyncInner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn submit(&self, job: Job) {
        let executor = self.executor.lock().clone();
        if let Some(executor) = executor {
            executor.submit(job);
        }
    }

    fn schedule_management(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }
        let inner = self.clone();
        self.submit(Box::new(move || inner.manage()));
    }

    fn manage(self: &Arc<Self>) {
        self.management.run(|| self.manage_once());
    }

    fn manage_once(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }
        let batches: Vec<Pending> = self.queue.lock().pending.drain(..).collect();
        let (applied, steps) = {
            let mut store = self.raw.lock();
            let mut applied = None;
            for batch in batches {
                if let Err(err) = store.apply_changes(batch.changes) {
                    #[cfg(feature = "log")]
                    log::warn!(target: "trickle", "dropping queued input change: {err}");
                    #[cfg(not(feature = "log"))]
                    let _ = err;
                }
                applied = Some(batch.sequence);
            }
            let steps = store.next_steps(None);
            self.collect_events(&mut store);
            (applied, steps)
        };
        {
            let mut progress = self.progress.lock();
            if let Some(sequence) = applied {
                progress.applied = progress.applied.max(sequence);
            }
            self.changed.notify_all();
        }
        self.schedule_deliveries();

        let mut fresh = Vec::new();
        {
            let mut in_flight = self.in_flight.lock();
            for step in steps {
                if in_flight.insert((step.value_id().clone(), step.timestamp())) {
                    fresh.push(step);
                }
            }
        }
        for step in fresh {
            let inner = self.clone();
            self.submit(Box::new(move || inner.run_step(step)));
        }
    }

    fn run_step(self: &Arc<Self>, step: TrickleStep) {
        let key = (step.value_id().clone(), step.timestamp());
        if !self.is_shut_down() {
            let result = step.execute();
            let mut store = self.raw.lock();
            store.apply_result(result);
            self.collect_events(&mut store);
        }
        self.in_flight.lock().remove(&key);
        {
            let _progress = self.progress.lock();
            self.changed.notify_all();
        }
        self.schedule_deliveries();
        self.schedule_management();
    }

    /// Turn recorded value changes into listener jobs, in the order they happened.
    fn collect_events(&self, store: &mut Store) {
        let events = store.take_events();
        if events.is_empty() {
            return;
        }
        let mut latest: HashMap<ValueId, Timestamp> = HashMap::default();
        let mut order = Vec::new();
        for event in events {
            if latest.insert(event.value_id.clone(), event.timestamp).is_none() {
                order.push(event.value_id);
            }
        }
        let listeners = self.listeners.lock();
        let mut deliveries = self.deliveries.lock();
        for value_id in order {
            let timestamp = latest.get(&value_id).copied().unwrap_or_default();
            for (_, listener) in listeners.iter() {
                if listener.target.matches(&value_id) {
                    if let Some(job) = (listener.notify)(store, &value_id, timestamp) {
                        deliveries.push_back(job);
                    }
                }
            }
        }
    }

    fn schedule_deliveries(self: &Arc<Self>) {
        if self.deliveries.lock().is_empty() {
            return;
        }
        let inner = self.clone();
        self.submit(Box::new(move || inner.deliver()));
    }

    fn deliver(&self) {
        self.delivery.run(|| loop {
            let job = self.deliveries.lock().pop_front();
            match job {
                Some(job) => job(),
                None => break,
            }
        });
    }

    fn wait_for<R>(
        &self,
        value_id: ValueId,
        timeout: Duration,
        after: &[TrickleAsyncTimestamp],
        read: impl Fn(&Store) -> Result<R, TrickleError>,
    ) -> Result<R, TrickleError> {
        self.raw.definition().resolve_value_id(&value_id)?;
        if self.is_shut_down() {
            return Err(TrickleError::Shutdown);
        }
        let Some(target) = after.iter().map(|timestamp| timestamp.0).max() else {
            return read(&self.raw.lock());
        };
        // A deadline past what `Instant` can represent means no deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut progress = self.progress.lock();
        loop {
            if self.is_shut_down() {
                return Err(TrickleError::Shutdown);
            }
            if progress.applied >= target {
                let store = self.raw.lock();
                if store.is_settled(&value_id)? {
                    return read(&store);
                }
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut progress, deadline).timed_out() {
                        return Err(TrickleError::Timeout { value_id });
                    }
                }
                None => self.changed.wait(&mut progress),
            }
        }
    }
}

/// An instance that computes on an [`Executor`].
///
/// Mutators return immediately with a [`TrickleAsyncTimestamp`]; reads given timestamps wait
/// until those changes are reflected in the queried value.
///
/// # Example
///
/// ```ignore
/// let instance = definition.instance_builder().threads(2).build_async()?;
/// let t = instance.set_input(&A, 2)?;
/// let b = instance.get_value(&B, Duration::from_secs(1), &[t])?;
/// ```
pub struct TrickleAsyncInstance {
    inner: Arc<AsyncInner>,
}

impl TrickleAsyncInstance {
    /// Run `raw` on `executor`.
    pub fn new(raw: TrickleRawInstance, executor: Arc<dyn Executor>) -> Self {
        let inner = Arc::new(AsyncInner {
            raw,
            executor: Mutex::new(Some(executor)),
            queue: Mutex::new(Queue::default()),
            management: Serial::default(),
            in_flight: Mutex::new(HashSet::default()),
            progress: Mutex::new(Progress { applied: 0 }),
            changed: Condvar::new(),
            listeners: Mutex::new(Slab::new()),
            deliveries: Mutex::new(VecDeque::new()),
            delivery: Serial::default(),
            shut_down: AtomicBool::new(false),
        });
        // Settle what needs no computation and hand out the first steps.
        inner.manage();
        Self { inner }
    }

    /// The definition this instance was created from.
    pub fn definition(&self) -> &TrickleDefinition {
        self.inner.raw.definition()
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    /// Set a plain input node.
    pub fn set_input<T: NodeValue>(
        &self,
        name: &NodeName<T>,
        value: T,
    ) -> Result<TrickleAsyncTimestamp, TrickleError> {
        self.set_inputs([TrickleInputChange::set_basic(name, value)])
    }

    /// Replace the keys of a key list input node.
    pub fn set_key_list_input<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<TrickleAsyncTimestamp, TrickleError> {
        self.set_inputs([TrickleInputChange::set_keys(name, keys)])
    }

    /// Append a key to a key list input node.
    pub fn add_key_input<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        key: K,
    ) -> Result<TrickleAsyncTimestamp, TrickleError> {
        self.set_inputs([TrickleInputChange::add_key(name, key)])
    }

    /// Remove a key from a key list input node.
    ///
    /// Values of keyed input nodes at the removed key are dropped. Adding the key back reads
    /// [`NodeOutcome::NotYetComputed`] for them until they are set again.
    pub fn remove_key_input<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        key: K,
    ) -> Result<TrickleAsyncTimestamp, TrickleError> {
        self.set_inputs([TrickleInputChange::remove_key(name, key)])
    }

    /// Remove `removed`, then append `added`.
    pub fn edit_keys<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        added: impl IntoIterator<Item = K>,
        removed: impl IntoIterator<Item = K>,
    ) -> Result<TrickleAsyncTimestamp, TrickleError> {
        self.set_inputs([TrickleInputChange::edit_keys(name, added, removed)])
    }

    /// Set a keyed input node at `key`.
    pub fn set_keyed_input<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        key: K,
        value: T,
    ) -> Result<TrickleAsyncTimestamp, TrickleError> {
        self.set_inputs([TrickleInputChange::set_keyed(name, key, value)])
    }

    /// Set a keyed input node at several keys.
    pub fn set_keyed_inputs<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        values: impl IntoIterator<Item = (K, T)>,
    ) -> Result<TrickleAsyncTimestamp, TrickleError> {
        self.set_inputs(
            values
                .into_iter()
                .map(|(key, value)| TrickleInputChange::set_keyed(name, key, value)),
        )
    }

    /// Queue a batch of changes to be applied at one timestamp.
    ///
    /// The batch is validated before it is queued.
    pub fn set_inputs(
        &self,
        changes: impl IntoIterator<Item = TrickleInputChange>,
    ) -> Result<TrickleAsyncTimestamp, TrickleError> {
        if self.inner.is_shut_down() {
            return Err(TrickleError::Shutdown);
        }
        let changes: Vec<_> = changes.into_iter().collect();
        {
            let store = self.inner.raw.lock();
            for change in &changes {
                store.validate(change)?;
            }
        }
        let sequence = {
            let mut queue = self.inner.queue.lock();
            queue.last_sequence += 1;
            let sequence = queue.last_sequence;
            queue.pending.push_back(Pending { sequence, changes });
            sequence
        };
        self.inner.schedule_management();
        Ok(TrickleAsyncTimestamp(sequence))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Outcome of a plain node.
    ///
    /// Waits up to `timeout` until every change in `after` is applied and the value is settled.
    /// With no timestamps, returns what is currently stored.
    pub fn get_outcome<T: NodeValue>(
        &self,
        name: &NodeName<T>,
        timeout: Duration,
        after: &[TrickleAsyncTimestamp],
    ) -> Result<NodeOutcome<T>, TrickleError> {
        self.inner
            .wait_for(ValueId::nonkeyed(name), timeout, after, |store| {
                store.node_outcome(name)
            })
    }

    /// Value of a plain node; see [`get_outcome`](Self::get_outcome).
    pub fn get_value<T: NodeValue>(
        &self,
        name: &NodeName<T>,
        timeout: Duration,
        after: &[TrickleAsyncTimestamp],
    ) -> Result<T, TrickleError> {
        into_value(self.get_outcome(name, timeout, after)?, ValueId::nonkeyed(name))
    }

    /// Outcome of a key list node.
    pub fn get_key_list_outcome<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        timeout: Duration,
        after: &[TrickleAsyncTimestamp],
    ) -> Result<NodeOutcome<Vec<K>>, TrickleError> {
        self.inner
            .wait_for(ValueId::key_list(name), timeout, after, |store| {
                store.key_list_outcome_typed(name)
            })
    }

    /// Keys of a key list node.
    pub fn get_key_list_value<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        timeout: Duration,
        after: &[TrickleAsyncTimestamp],
    ) -> Result<Vec<K>, TrickleError> {
        into_value(
            self.get_key_list_outcome(name, timeout, after)?,
            ValueId::key_list(name),
        )
    }

    /// Outcome of a keyed node at `key`.
    pub fn get_keyed_outcome<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        key: &K,
        timeout: Duration,
        after: &[TrickleAsyncTimestamp],
    ) -> Result<NodeOutcome<T>, TrickleError> {
        self.inner
            .wait_for(ValueId::keyed(name, key.clone()), timeout, after, |store| {
                store.keyed_outcome_typed(name, key)
            })
    }

    /// Value of a keyed node at `key`.
    pub fn get_keyed_value<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        key: &K,
        timeout: Duration,
        after: &[TrickleAsyncTimestamp],
    ) -> Result<T, TrickleError> {
        into_value(
            self.get_keyed_outcome(name, key, timeout, after)?,
            ValueId::keyed(name, key.clone()),
        )
    }

    /// Outcome of a keyed node's full output.
    pub fn get_keyed_list_outcome<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        timeout: Duration,
        after: &[TrickleAsyncTimestamp],
    ) -> Result<NodeOutcome<Vec<T>>, TrickleError> {
        self.inner
            .wait_for(ValueId::keyed_list(name), timeout, after, |store| {
                store.keyed_list_outcome_typed(name)
            })
    }

    /// Values of a keyed node in key order.
    pub fn get_keyed_list_value<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        timeout: Duration,
        after: &[TrickleAsyncTimestamp],
    ) -> Result<Vec<T>, TrickleError> {
        into_value(
            self.get_keyed_list_outcome(name, timeout, after)?,
            ValueId::keyed_list(name),
        )
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Call `callback` on the executor whenever the value of a plain node changes.
    ///
    /// The current outcome is delivered once right away.
    pub fn add_listener<T: NodeValue>(
        &self,
        name: &NodeName<T>,
        callback: impl Fn(TrickleEvent<T>) + Send + Sync + 'static,
    ) -> Result<ListenerId, TrickleError> {
        let name = name.clone();
        self.register(
            ListenerTarget::Value(ValueId::nonkeyed(&name)),
            move |store, _| store.node_outcome(&name),
            callback,
        )
    }

    /// Call `callback` whenever the keys of a key list node change.
    pub fn add_key_list_listener<K: NodeKey>(
        &self,
        name: &KeyListNodeName<K>,
        callback: impl Fn(TrickleEvent<Vec<K>>) + Send + Sync + 'static,
    ) -> Result<ListenerId, TrickleError> {
        let name = name.clone();
        self.register(
            ListenerTarget::Value(ValueId::key_list(&name)),
            move |store, _| store.key_list_outcome_typed(&name),
            callback,
        )
    }

    /// Call `callback` whenever the full output of a keyed node changes.
    pub fn add_keyed_list_listener<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        callback: impl Fn(TrickleEvent<Vec<T>>) + Send + Sync + 'static,
    ) -> Result<ListenerId, TrickleError> {
        let name = name.clone();
        self.register(
            ListenerTarget::Value(ValueId::keyed_list(&name)),
            move |store, _| store.keyed_list_outcome_typed(&name),
            callback,
        )
    }

    /// Call `callback` whenever a keyed node changes at any key, including keys being removed.
    ///
    /// The current outcome at every current key is delivered right away.
    pub fn add_per_key_listener<K: NodeKey, T: NodeValue>(
        &self,
        name: &KeyedNodeName<K, T>,
        callback: impl Fn(TrickleEvent<T>) + Send + Sync + 'static,
    ) -> Result<ListenerId, TrickleError> {
        let name = name.clone();
        self.register(
            ListenerTarget::EveryKey(Arc::from(name.name())),
            move |store, value_id| match value_id {
                ValueId::Keyed(_, key) => match key.downcast_ref::<K>() {
                    Some(key) => store.keyed_outcome_typed(&name, key),
                    None => Ok(NodeOutcome::NoSuchKey),
                },
                _ => Ok(NodeOutcome::NoSuchKey),
            },
            callback,
        )
    }

    fn register<T: Send + 'static>(
        &self,
        target: ListenerTarget,
        read: impl Fn(&Store, &ValueId) -> Result<NodeOutcome<T>, TrickleError> + Send + Sync + 'static,
        callback: impl Fn(TrickleEvent<T>) + Send + Sync + 'static,
    ) -> Result<ListenerId, TrickleError> {
        if self.inner.is_shut_down() {
            return Err(TrickleError::Shutdown);
        }
        let callback = Arc::new(callback);
        let notify: Notify = Box::new(
            move |store: &Store, value_id: &ValueId, timestamp: Timestamp| -> Option<Job> {
                let outcome = read(store, value_id).ok()?;
                let callback = callback.clone();
                let event = TrickleEvent {
                    value_id: value_id.clone(),
                    timestamp,
                    outcome,
                };
                let job: Job = Box::new(move || callback(event));
                Some(job)
            },
        );

        let mut store = self.inner.raw.lock();
        let initial: Vec<ValueId> = match &target {
            ListenerTarget::Value(value_id) => {
                store.definition().resolve_value_id(value_id)?;
                vec![value_id.clone()]
            }
            ListenerTarget::EveryKey(name) => {
                let value_id = ValueId::FullKeyedList(name.clone());
                let (index, _) = store.definition().resolve_value_id(&value_id)?;
                store
                    .member_keys(index)
                    .into_iter()
                    .map(|key: AnyKey| ValueId::Keyed(name.clone(), key))
                    .collect()
            }
        };
        let clock = store.clock();
        let jobs: Vec<Job> = initial
            .iter()
            .filter_map(|value_id| notify(&store, value_id, clock))
            .collect();
        store.set_recording(true);

        let id = self.inner.listeners.lock().insert(Listener { target, notify });
        self.inner.deliveries.lock().extend(jobs);
        drop(store);
        self.inner.schedule_deliveries();
        Ok(ListenerId(id))
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    ///
    /// Events already collected for the listener may still be delivered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut store = self.inner.raw.lock();
        let mut listeners = self.inner.listeners.lock();
        let removed = listeners.try_remove(id.0).is_some();
        if listeners.is_empty() {
            store.set_recording(false);
        }
        removed
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop accepting work and wake every blocked reader with [`TrickleError::Shutdown`].
    ///
    /// Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.queue.lock().pending.clear();
        {
            let _progress = self.inner.progress.lock();
            self.inner.changed.notify_all();
        }
        let executor = self.inner.executor.lock().take();
        drop(executor);
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}

impl Drop for TrickleAsyncInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TrickleAsyncInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrickleAsyncInstance")
            .field("raw", &self.inner.raw)
            .field("shut_down", &self.inner.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_serial_reruns_requests_made_while_running() {
        let serial = Arc::new(Serial::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let inner_serial = serial.clone();
        let inner_runs = runs.clone();
        serial.run(|| {
            // A nested request cannot take the lock, so it is picked up by the running loop.
            if inner_runs.fetch_add(1, Ordering::SeqCst) == 0 {
                inner_serial.run(|| unreachable!());
            }
        });
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_targets() {
        let every = ListenerTarget::EveryKey(Arc::from("b"));
        assert!(every.matches(&ValueId::Keyed(Arc::from("b"), AnyKey::new(1))));
        assert!(!every.matches(&ValueId::FullKeyedList(Arc::from("b"))));
        let exact = ListenerTarget::Value(ValueId::Nonkeyed(Arc::from("a")));
        assert!(exact.matches(&ValueId::Nonkeyed(Arc::from("a"))));
        assert!(!exact.matches(&ValueId::Nonkeyed(Arc::from("b"))));
    }
}
