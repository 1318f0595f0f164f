//! Tests for the lazily computing sync instance.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use trickle::{
    KeyListNodeName, KeyedNodeName, NodeName, NodeOutcome, TrickleDefinitionBuilder,
    TrickleFailure, ValueId,
};

// =============================================================================
// Laziness Tests
// =============================================================================

#[test]
fn test_reads_compute_only_what_they_need() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");
    let c = NodeName::<i32>::new("c");
    let unnecessary = Arc::new(AtomicBool::new(false));
    let flag = unnecessary.clone();

    let mut builder = TrickleDefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    builder.create_node(&b, &a_node, |a| Ok(a + 4)).unwrap();
    builder
        .create_node(&c, &a_node, move |a| {
            flag.store(true, Ordering::SeqCst);
            Ok(a * 2)
        })
        .unwrap();
    let instance = builder.build().instantiate_sync();

    assert_eq!(
        instance.get_outcome(&b).unwrap(),
        NodeOutcome::Failure(TrickleFailure::missing(ValueId::nonkeyed(&a)))
    );
    instance.set_input(&a, 3).unwrap();
    assert_eq!(instance.get_value(&b).unwrap(), 7);
    assert!(!unnecessary.load(Ordering::SeqCst));
    assert!(!instance.raw().is_settled(&ValueId::nonkeyed(&c)).unwrap());

    assert_eq!(instance.get_value(&c).unwrap(), 6);
    assert!(unnecessary.load(Ordering::SeqCst));
}

#[test]
fn test_keyed_reads_compute_only_their_key() {
    let a_keys = KeyListNodeName::<i32>::new("aKeys");
    let b_keyed = KeyedNodeName::<i32, i32>::new("bKeyed");
    let unnecessary = Arc::new(AtomicBool::new(false));
    let flag = unnecessary.clone();

    let mut builder = TrickleDefinitionBuilder::new();
    let keys = builder.create_key_list_input_node(&a_keys).unwrap();
    builder
        .create_keyed_node(&b_keyed, &keys, (), move |key, ()| {
            if key == 1 {
                flag.store(true, Ordering::SeqCst);
            }
            Ok(key - 2)
        })
        .unwrap();
    let instance = builder.build().instantiate_sync();

    assert_eq!(
        instance.get_keyed_outcome(&b_keyed, &1).unwrap(),
        NodeOutcome::NoSuchKey
    );
    instance.set_key_list_input(&a_keys, [1, 2]).unwrap();
    assert_eq!(instance.get_keyed_value(&b_keyed, &2).unwrap(), 0);
    assert!(!unnecessary.load(Ordering::SeqCst));

    assert_eq!(instance.get_keyed_list_value(&b_keyed).unwrap(), vec![-1, 0]);
    assert!(unnecessary.load(Ordering::SeqCst));
}

#[test]
fn test_repeated_reads_do_not_recompute() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = runs.clone();

    let mut builder = TrickleDefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    builder
        .create_node(&b, &a_node, move |a| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(a + 1)
        })
        .unwrap();
    let instance = builder.build().instantiate_sync();

    instance.set_input(&a, 1).unwrap();
    assert_eq!(instance.get_value(&b).unwrap(), 2);
    assert_eq!(instance.get_value(&b).unwrap(), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Several changes before a read cost a single computation.
    instance.set_input(&a, 2).unwrap();
    instance.set_input(&a, 3).unwrap();
    assert_eq!(instance.get_value(&b).unwrap(), 4);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Graph Tests
// =============================================================================

#[test]
fn test_key_lists_and_keyed_nodes() {
    let a = NodeName::<i32>::new("a");
    let a_keys = KeyListNodeName::<i32>::new("aKeys");
    let b_keyed = KeyedNodeName::<i32, i32>::new("bKeyed");
    let total = NodeName::<i32>::new("total");

    let mut builder = TrickleDefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    let keys = builder
        .create_key_list_node(&a_keys, &a_node, |a| Ok((1..=a).collect()))
        .unwrap();
    let keyed = builder
        .create_keyed_node(&b_keyed, &keys, &a_node, |key, a| Ok(key * a))
        .unwrap();
    builder
        .create_node(&total, keyed.full_output(), |values| Ok(values.iter().sum()))
        .unwrap();
    let instance = builder.build().instantiate_sync();

    instance.set_input(&a, 3).unwrap();
    assert_eq!(instance.get_key_list_value(&a_keys).unwrap(), vec![1, 2, 3]);
    assert_eq!(instance.get_keyed_value(&b_keyed, &2).unwrap(), 6);
    assert_eq!(instance.get_value(&total).unwrap(), 3 + 6 + 9);

    instance.set_input(&a, 1).unwrap();
    assert_eq!(instance.get_value(&total).unwrap(), 1);
    assert_eq!(
        instance.get_keyed_outcome(&b_keyed, &2).unwrap(),
        NodeOutcome::NoSuchKey
    );
}

#[test]
fn test_keyed_inputs() {
    let a_keys = KeyListNodeName::<String>::new("aKeys");
    let b_keyed = KeyedNodeName::<String, i32>::new("bKeyed");
    let c_keyed = KeyedNodeName::<String, String>::new("cKeyed");

    let mut builder = TrickleDefinitionBuilder::new();
    let keys = builder.create_key_list_input_node(&a_keys).unwrap();
    let b = builder.create_keyed_input_node(&b_keyed, &keys).unwrap();
    builder
        .create_keyed_node(&c_keyed, &keys, b.keyed_output(), |key, b| {
            Ok(format!("{key}={b}"))
        })
        .unwrap();
    let instance = builder.build().instantiate_sync();

    instance
        .set_key_list_input(&a_keys, ["x".to_string(), "y".to_string()])
        .unwrap();
    instance
        .set_keyed_inputs(&b_keyed, [("x".to_string(), 1), ("y".to_string(), 2)])
        .unwrap();
    assert_eq!(
        instance.get_keyed_list_value(&c_keyed).unwrap(),
        vec!["x=1".to_string(), "y=2".to_string()]
    );

    instance
        .edit_keys(&a_keys, ["z".to_string()], ["x".to_string()])
        .unwrap();
    instance.set_keyed_input(&b_keyed, "z".to_string(), 3).unwrap();
    assert_eq!(
        instance.get_keyed_list_value(&c_keyed).unwrap(),
        vec!["y=2".to_string(), "z=3".to_string()]
    );
}

#[test]
fn test_failures_and_catches() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");
    let c = NodeName::<i32>::new("c");

    let mut builder = TrickleDefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    let b_node = builder
        .create_node(&b, &a_node, |a| {
            anyhow::ensure!(a != 0, "division by zero");
            Ok(100 / a)
        })
        .unwrap();
    builder
        .create_node_with_catch(&c, &b_node, |b| Ok(b + 1), |_| Ok(0))
        .unwrap();
    let instance = builder.build().instantiate_sync();

    instance.set_input(&a, 0).unwrap();
    assert!(instance.get_outcome(&b).unwrap().failure().is_some());
    assert!(instance.get_value(&b).is_err());
    assert_eq!(instance.get_value(&c).unwrap(), 0);

    instance.set_input(&a, 4).unwrap();
    assert_eq!(instance.get_value(&c).unwrap(), 26);
}

#[test]
fn test_into_raw_keeps_state() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");

    let mut builder = TrickleDefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    builder.create_node(&b, &a_node, |a| Ok(a + 1)).unwrap();
    let instance = builder.build().instantiate_sync();

    instance.set_input(&a, 1).unwrap();
    assert_eq!(instance.get_value(&b).unwrap(), 2);
    let raw = instance.into_raw();
    assert_eq!(raw.get_node_value(&b).unwrap(), 2);
    assert!(raw.get_next_steps().is_empty());
}
