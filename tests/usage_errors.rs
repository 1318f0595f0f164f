//! Tests for API misuse reported as `TrickleError`.

use std::time::Duration;

use trickle::{
    KeyListNodeName, KeyedNodeName, NodeKind, NodeName, Timestamp, TrickleDefinitionBuilder,
    TrickleError, TrickleInputChange, ValueId,
};

// =============================================================================
// Builder Errors
// =============================================================================

#[test]
fn test_node_from_other_builder() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");

    let mut first = TrickleDefinitionBuilder::new();
    let a_node = first.create_input_node(&a).unwrap();
    let mut second = TrickleDefinitionBuilder::new();
    let err = second.create_node(&b, &a_node, |a| Ok(a + 1)).unwrap_err();
    assert!(matches!(err, TrickleError::ForeignNode { ref name } if &**name == "a"));
}

#[test]
fn test_key_source_from_other_builder() {
    let keys = KeyListNodeName::<i32>::new("keys");
    let keyed = KeyedNodeName::<i32, i32>::new("keyed");

    let mut first = TrickleDefinitionBuilder::new();
    let keys_node = first.create_key_list_input_node(&keys).unwrap();
    let mut second = TrickleDefinitionBuilder::new();
    let err = second.create_keyed_input_node(&keyed, &keys_node).unwrap_err();
    assert!(matches!(err, TrickleError::ForeignNode { .. }));
    let err = second
        .create_keyed_node(&keyed, &keys_node, (), |key, ()| Ok(key))
        .unwrap_err();
    assert!(matches!(err, TrickleError::ForeignNode { .. }));
}

#[test]
fn test_duplicate_name() {
    let a = NodeName::<i32>::new("a");
    let a_keys = KeyListNodeName::<i32>::new("a");

    let mut builder = TrickleDefinitionBuilder::new();
    builder.create_input_node(&a).unwrap();
    let err = builder.create_input_node(&a).unwrap_err();
    assert!(matches!(err, TrickleError::DuplicateName { ref name } if &**name == "a"));
    // Names are shared across node kinds.
    let err = builder.create_key_list_input_node(&a_keys).unwrap_err();
    assert!(matches!(err, TrickleError::DuplicateName { .. }));
}

#[test]
fn test_keyed_input_needs_input_key_source() {
    let a = NodeName::<i32>::new("a");
    let keys = KeyListNodeName::<i32>::new("keys");
    let keyed = KeyedNodeName::<i32, i32>::new("keyed");

    let mut builder = TrickleDefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    let keys_node = builder
        .create_key_list_node(&keys, &a_node, |a| Ok((0..a).collect()))
        .unwrap();
    let err = builder.create_keyed_input_node(&keyed, &keys_node).unwrap_err();
    assert_eq!(
        err,
        TrickleError::NonInputKeySource {
            name: "keyed".into(),
            key_source: "keys".into(),
        }
    );
}

#[test]
fn test_keyed_output_needs_shared_key_source() {
    let a_keys = KeyListNodeName::<i32>::new("aKeys");
    let b_keys = KeyListNodeName::<i32>::new("bKeys");
    let a_keyed = KeyedNodeName::<i32, i32>::new("aKeyed");
    let b_keyed = KeyedNodeName::<i32, i32>::new("bKeyed");
    let c = NodeName::<i32>::new("c");

    let mut builder = TrickleDefinitionBuilder::new();
    let a_keys_node = builder.create_key_list_input_node(&a_keys).unwrap();
    let b_keys_node = builder.create_key_list_input_node(&b_keys).unwrap();
    let a_keyed_node = builder
        .create_keyed_node(&a_keyed, &a_keys_node, (), |key, ()| Ok(key))
        .unwrap();

    let err = builder
        .create_node(&c, a_keyed_node.keyed_output(), Ok)
        .unwrap_err();
    assert!(matches!(
        err,
        TrickleError::KeyedOutputMisuse { ref consumer, ref producer }
            if &**consumer == "c" && &**producer == "aKeyed"
    ));

    let err = builder
        .create_keyed_node(&b_keyed, &b_keys_node, a_keyed_node.keyed_output(), |_, a| {
            Ok(a)
        })
        .unwrap_err();
    assert!(matches!(err, TrickleError::KeyedOutputMisuse { .. }));

    // The full output can be used anywhere.
    builder
        .create_node(&c, a_keyed_node.full_output(), |values| Ok(values.len() as i32))
        .unwrap();
}

// =============================================================================
// Instance Errors
// =============================================================================

#[test]
fn test_result_from_other_instance() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");

    let mut builder = TrickleDefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    builder.create_node(&b, &a_node, |a| Ok(a + 1)).unwrap();
    let definition = builder.build();
    let first = definition.instantiate_raw();
    let second = definition.instantiate_raw();

    first.set_input(&a, 1).unwrap();
    second.set_input(&a, 1).unwrap();
    let step = first.get_next_steps().pop().unwrap();
    let err = second.report_result(step.execute()).unwrap_err();
    assert_eq!(
        err,
        TrickleError::ForeignResult {
            value_id: ValueId::nonkeyed(&b),
        }
    );
    assert!(!second.is_settled(&ValueId::nonkeyed(&b)).unwrap());
}

#[test]
fn test_unknown_nodes() {
    let a = NodeName::<i32>::new("a");
    let unknown = NodeName::<i32>::new("unknown");
    let unknown_keys = KeyListNodeName::<i32>::new("unknownKeys");
    let unknown_keyed = KeyedNodeName::<i32, i32>::new("unknownKeyed");

    let mut builder = TrickleDefinitionBuilder::new();
    builder.create_input_node(&a).unwrap();
    let instance = builder.build().instantiate_raw();

    let is_unknown = |err: TrickleError| matches!(err, TrickleError::UnknownNode { .. });
    assert!(is_unknown(instance.set_input(&unknown, 1).unwrap_err()));
    assert!(is_unknown(instance.add_key_input(&unknown_keys, 1).unwrap_err()));
    assert!(is_unknown(instance.remove_key_input(&unknown_keys, 1).unwrap_err()));
    assert!(is_unknown(instance.set_key_list_input(&unknown_keys, [1]).unwrap_err()));
    assert!(is_unknown(instance.set_keyed_input(&unknown_keyed, 1, 1).unwrap_err()));
    assert!(is_unknown(instance.get_node_outcome(&unknown).unwrap_err()));
    assert!(is_unknown(instance.get_key_list_outcome(&unknown_keys).unwrap_err()));
    assert!(is_unknown(instance.get_keyed_outcome(&unknown_keyed, &1).unwrap_err()));
    assert!(is_unknown(
        instance.is_settled(&ValueId::nonkeyed(&unknown)).unwrap_err()
    ));
}

#[test]
fn test_setting_computed_nodes() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");
    let keys = KeyListNodeName::<i32>::new("keys");
    let keyed = KeyedNodeName::<i32, i32>::new("keyed");

    let mut builder = TrickleDefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    builder.create_node(&b, &a_node, |a| Ok(a + 1)).unwrap();
    let keys_node = builder
        .create_key_list_node(&keys, &a_node, |a| Ok((0..a).collect()))
        .unwrap();
    builder
        .create_keyed_node(&keyed, &keys_node, (), |key, ()| Ok(key))
        .unwrap();
    let instance = builder.build().instantiate_raw();

    let not_input = |err: TrickleError| matches!(err, TrickleError::NotAnInput { .. });
    assert!(not_input(instance.set_input(&b, 1).unwrap_err()));
    assert!(not_input(instance.add_key_input(&keys, 1).unwrap_err()));
    assert!(not_input(instance.remove_key_input(&keys, 1).unwrap_err()));
    assert!(not_input(instance.set_key_list_input(&keys, [1]).unwrap_err()));
    assert!(not_input(instance.set_keyed_input(&keyed, 1, 1).unwrap_err()));
    assert_eq!(instance.current_timestamp(), Timestamp::ZERO);
}

#[test]
fn test_wrong_kind() {
    let a = NodeName::<i32>::new("a");
    let a_as_keys = KeyListNodeName::<i32>::new("a");

    let mut builder = TrickleDefinitionBuilder::new();
    builder.create_input_node(&a).unwrap();
    let instance = builder.build().instantiate_raw();

    let err = instance.add_key_input(&a_as_keys, 1).unwrap_err();
    assert_eq!(
        err,
        TrickleError::WrongKind {
            name: "a".into(),
            expected: NodeKind::KeyList,
            actual: NodeKind::Basic,
        }
    );
}

#[test]
fn test_wrong_value_type() {
    let a = NodeName::<i32>::new("a");
    let a_as_string = NodeName::<String>::new("a");

    let mut builder = TrickleDefinitionBuilder::new();
    builder.create_input_node(&a).unwrap();
    let instance = builder.build().instantiate_raw();

    let err = instance.set_input(&a_as_string, "x".to_string()).unwrap_err();
    assert!(matches!(err, TrickleError::TypeMismatch { .. }));
    let err = instance.get_node_outcome(&a_as_string).unwrap_err();
    assert!(matches!(err, TrickleError::TypeMismatch { .. }));
}

#[test]
fn test_invalid_batch_is_rejected_whole() {
    let a = NodeName::<i32>::new("a");
    let unknown = NodeName::<i32>::new("unknown");

    let mut builder = TrickleDefinitionBuilder::new();
    builder.create_input_node(&a).unwrap();
    let instance = builder.build().instantiate_raw();

    let err = instance
        .set_inputs([
            TrickleInputChange::set_basic(&a, 1),
            TrickleInputChange::set_basic(&unknown, 2),
        ])
        .unwrap_err();
    assert!(matches!(err, TrickleError::UnknownNode { .. }));
    assert_eq!(instance.current_timestamp(), Timestamp::ZERO);
    assert!(instance.get_node_value(&a).is_err());
}

#[test]
fn test_value_getter_reports_outcome() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");

    let mut builder = TrickleDefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    builder.create_node(&b, &a_node, |a| Ok(a + 1)).unwrap();
    let instance = builder.build().instantiate_raw();

    let err = instance.get_node_value(&b).unwrap_err();
    assert_eq!(
        err,
        TrickleError::NotComputed {
            value_id: ValueId::nonkeyed(&b),
            outcome: "not yet computed".into(),
        }
    );

    instance.complete_synchronously();
    let err = instance.get_node_value(&b).unwrap_err();
    assert!(err.to_string().starts_with("b has no computed value (failed:"));
}

// =============================================================================
// Async Instance Errors
// =============================================================================

#[test]
fn test_async_unknown_nodes() {
    let a = NodeName::<i32>::new("a");
    let unknown = NodeName::<i32>::new("unknown");
    let unknown_keys = KeyListNodeName::<i32>::new("unknownKeys");

    let mut builder = TrickleDefinitionBuilder::new();
    builder.create_input_node(&a).unwrap();
    let instance = builder
        .build()
        .instance_builder()
        .threads(1)
        .build_async()
        .unwrap();

    let timeout = Duration::from_secs(1);
    assert!(matches!(
        instance.set_input(&unknown, 1).unwrap_err(),
        TrickleError::UnknownNode { .. }
    ));
    assert!(matches!(
        instance.add_key_input(&unknown_keys, 1).unwrap_err(),
        TrickleError::UnknownNode { .. }
    ));
    assert!(matches!(
        instance.get_outcome(&unknown, timeout, &[]).unwrap_err(),
        TrickleError::UnknownNode { .. }
    ));
    assert!(matches!(
        instance.get_key_list_outcome(&unknown_keys, timeout, &[]).unwrap_err(),
        TrickleError::UnknownNode { .. }
    ));
    assert!(matches!(
        instance.add_listener(&unknown, |_| {}).unwrap_err(),
        TrickleError::UnknownNode { .. }
    ));
}
