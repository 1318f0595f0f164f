//! Randomized graphs driven with random inputs.
//!
//! Results reported out of order, stale results and lazy reads must all end in the same
//! state as computing everything in order after each change.

use rand::prelude::*;

use trickle::{
    BuiltKeyListNode, BuiltKeyedNode, BuiltNode, KeyListNodeName, KeyedNodeName, NodeName,
    NodeOutcome, TrickleDefinition, TrickleDefinitionBuilder, TrickleFailure, TrickleInputChange,
    TrickleRawInstance, TrickleStep, TrickleSyncInstance,
};

const KEY_RANGE: std::ops::Range<i32> = 0..6;

/// A generated definition and the names needed to drive and read it.
struct Graph {
    definition: TrickleDefinition,
    basics: Vec<NodeName<i32>>,
    basic_inputs: Vec<NodeName<i32>>,
    key_lists: Vec<KeyListNodeName<i32>>,
    key_list_inputs: Vec<KeyListNodeName<i32>>,
    keyed: Vec<KeyedNodeName<i32, i32>>,
    keyed_inputs: Vec<KeyedNodeName<i32, i32>>,
}

fn fallback(failure: &TrickleFailure) -> anyhow::Result<i32> {
    Ok(-((failure.errors.len() + failure.missing_inputs.len()) as i32))
}

fn generate(seed: u64) -> Graph {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut builder = TrickleDefinitionBuilder::new();
    let mut basics: Vec<BuiltNode<i32>> = Vec::new();
    let mut key_lists: Vec<BuiltKeyListNode<i32>> = Vec::new();
    // Keyed nodes with the position of their key source in `key_lists`.
    let mut keyed: Vec<(BuiltKeyedNode<i32, i32>, usize)> = Vec::new();
    let mut basic_inputs = Vec::new();
    let mut key_list_inputs = Vec::new();
    let mut keyed_inputs = Vec::new();

    for i in 0..2 {
        let name = NodeName::new(format!("in{i}"));
        basics.push(builder.create_input_node(&name).unwrap());
        basic_inputs.push(name);
    }
    for i in 0..rng.gen_range(1..=2) {
        let name = KeyListNodeName::new(format!("keys{i}"));
        key_lists.push(builder.create_key_list_input_node(&name).unwrap());
        key_list_inputs.push(name);
        if rng.gen_bool(0.6) {
            let keyed_name = KeyedNodeName::new(format!("keyedIn{i}"));
            let source = key_lists.len() - 1;
            let node = builder
                .create_keyed_input_node(&keyed_name, &key_lists[source])
                .unwrap();
            keyed.push((node, source));
            keyed_inputs.push(keyed_name);
        }
    }

    for i in 0..rng.gen_range(4..10) {
        let fails = rng.gen_bool(0.3);
        let catches = rng.gen_bool(0.3);
        match rng.gen_range(0..4) {
            0 => {
                let name = NodeName::new(format!("sum{i}"));
                let x = basics.choose(&mut rng).unwrap().clone();
                let y = basics.choose(&mut rng).unwrap().clone();
                let op = move |(x, y): (i32, i32)| {
                    let v = (x + y) % 1000;
                    anyhow::ensure!(!(fails && v % 3 == 0), "{v} is divisible by 3");
                    Ok(v)
                };
                let node = if catches {
                    builder.create_node_with_catch(&name, (&x, &y), op, fallback)
                } else {
                    builder.create_node(&name, (&x, &y), op)
                };
                basics.push(node.unwrap());
            }
            1 => {
                let name = NodeName::new(format!("fold{i}"));
                let x = basics.choose(&mut rng).unwrap().clone();
                let list = match keyed.choose(&mut rng) {
                    Some((node, _)) if rng.gen_bool(0.5) => node.full_output(),
                    _ => key_lists.choose(&mut rng).unwrap().list_output(),
                };
                let op = |(list, x): (Vec<i32>, i32)| -> anyhow::Result<i32> {
                    Ok((list.iter().sum::<i32>() + x) % 1000)
                };
                let node = if catches {
                    builder.create_node_with_catch(&name, (list, &x), op, fallback)
                } else {
                    builder.create_node(&name, (list, &x), op)
                };
                basics.push(node.unwrap());
            }
            2 => {
                let name = KeyListNodeName::new(format!("range{i}"));
                let x = basics.choose(&mut rng).unwrap().clone();
                let node = builder
                    .create_key_list_node(&name, &x, move |x| {
                        anyhow::ensure!(!(fails && x.rem_euclid(5) == 4), "no range for {x}");
                        Ok((0..x.rem_euclid(4)).rev().collect())
                    })
                    .unwrap();
                key_lists.push(node);
            }
            _ => {
                let name = KeyedNodeName::new(format!("perKey{i}"));
                let source = rng.gen_range(0..key_lists.len());
                let siblings: Vec<_> = keyed
                    .iter()
                    .filter(|(_, node_source)| *node_source == source)
                    .map(|(node, _)| node.clone())
                    .collect();
                let input = match siblings.choose(&mut rng) {
                    Some(sibling) if rng.gen_bool(0.5) => sibling.keyed_output(),
                    _ => basics.choose(&mut rng).unwrap().output(),
                };
                let op = move |key: i32, x: i32| {
                    anyhow::ensure!(!(fails && key == 2), "key 2 rejected");
                    Ok((key * 7 + x) % 1000)
                };
                let node = if catches {
                    builder.create_keyed_node_with_catch(
                        &name,
                        &key_lists[source],
                        input,
                        op,
                        fallback,
                    )
                } else {
                    builder.create_keyed_node(&name, &key_lists[source], input, op)
                };
                keyed.push((node.unwrap(), source));
            }
        }
    }

    Graph {
        definition: builder.build(),
        basics: basics.iter().map(|node| node.name().clone()).collect(),
        basic_inputs,
        key_lists: key_lists.iter().map(|node| node.name().clone()).collect(),
        key_list_inputs,
        keyed: keyed.iter().map(|(node, _)| node.name().clone()).collect(),
        keyed_inputs,
    }
}

// =============================================================================
// Operations
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    SetBasic(usize, i32),
    AddKey(usize, i32),
    RemoveKey(usize, i32),
    SetKeys(usize, Vec<i32>),
    SetKeyed(usize, i32, i32),
    Compare,
}

impl Op {
    fn random(rng: &mut StdRng, graph: &Graph) -> Op {
        match rng.gen_range(0..10) {
            0..=2 => Op::SetBasic(
                rng.gen_range(0..graph.basic_inputs.len()),
                rng.gen_range(-5..10),
            ),
            3 => Op::AddKey(
                rng.gen_range(0..graph.key_list_inputs.len()),
                rng.gen_range(KEY_RANGE),
            ),
            4 => Op::RemoveKey(
                rng.gen_range(0..graph.key_list_inputs.len()),
                rng.gen_range(KEY_RANGE),
            ),
            5 => {
                let len = rng.gen_range(0..5);
                Op::SetKeys(
                    rng.gen_range(0..graph.key_list_inputs.len()),
                    (0..len).map(|_| rng.gen_range(KEY_RANGE)).collect(),
                )
            }
            6 | 7 if !graph.keyed_inputs.is_empty() => Op::SetKeyed(
                rng.gen_range(0..graph.keyed_inputs.len()),
                rng.gen_range(KEY_RANGE),
                rng.gen_range(-5..10),
            ),
            8 => Op::Compare,
            _ => Op::SetBasic(0, rng.gen_range(-5..10)),
        }
    }

    fn change(&self, graph: &Graph) -> Option<TrickleInputChange> {
        Some(match self {
            Op::SetBasic(i, value) => TrickleInputChange::set_basic(&graph.basic_inputs[*i], *value),
            Op::AddKey(i, key) => TrickleInputChange::add_key(&graph.key_list_inputs[*i], *key),
            Op::RemoveKey(i, key) => {
                TrickleInputChange::remove_key(&graph.key_list_inputs[*i], *key)
            }
            Op::SetKeys(i, keys) => {
                TrickleInputChange::set_keys(&graph.key_list_inputs[*i], keys.iter().copied())
            }
            Op::SetKeyed(i, key, value) => {
                TrickleInputChange::set_keyed(&graph.keyed_inputs[*i], *key, *value)
            }
            Op::Compare => return None,
        })
    }
}

// =============================================================================
// Observed State
// =============================================================================

#[derive(Debug, PartialEq)]
struct State {
    basics: Vec<NodeOutcome<i32>>,
    key_lists: Vec<NodeOutcome<Vec<i32>>>,
    per_key: Vec<NodeOutcome<i32>>,
    full: Vec<NodeOutcome<Vec<i32>>>,
}

fn read_raw(graph: &Graph, instance: &TrickleRawInstance) -> State {
    State {
        basics: graph
            .basics
            .iter()
            .map(|name| instance.get_node_outcome(name).unwrap())
            .collect(),
        key_lists: graph
            .key_lists
            .iter()
            .map(|name| instance.get_key_list_outcome(name).unwrap())
            .collect(),
        per_key: graph
            .keyed
            .iter()
            .flat_map(|name| KEY_RANGE.map(move |key| (name, key)))
            .map(|(name, key)| instance.get_keyed_outcome(name, &key).unwrap())
            .collect(),
        full: graph
            .keyed
            .iter()
            .map(|name| instance.get_keyed_list_outcome(name).unwrap())
            .collect(),
    }
}

fn read_sync(graph: &Graph, instance: &TrickleSyncInstance) -> State {
    State {
        basics: graph
            .basics
            .iter()
            .map(|name| instance.get_outcome(name).unwrap())
            .collect(),
        key_lists: graph
            .key_lists
            .iter()
            .map(|name| instance.get_key_list_outcome(name).unwrap())
            .collect(),
        per_key: graph
            .keyed
            .iter()
            .flat_map(|name| KEY_RANGE.map(move |key| (name, key)))
            .map(|(name, key)| instance.get_keyed_outcome(name, &key).unwrap())
            .collect(),
        full: graph
            .keyed
            .iter()
            .map(|name| instance.get_keyed_list_outcome(name).unwrap())
            .collect(),
    }
}

// =============================================================================
// Drivers
// =============================================================================

/// Collects steps as they appear and reports them late and in random order.
struct Shuffled {
    instance: TrickleRawInstance,
    pending: Vec<TrickleStep>,
}

impl Shuffled {
    fn after_change(&mut self, rng: &mut StdRng) {
        self.pending.extend(self.instance.get_next_steps());
        while !self.pending.is_empty() && rng.gen_bool(0.5) {
            let step = self.pending.swap_remove(rng.gen_range(0..self.pending.len()));
            self.instance.report_result(step.execute()).unwrap();
        }
    }

    fn settle(&mut self, rng: &mut StdRng) {
        loop {
            self.pending.extend(self.instance.get_next_steps());
            if self.pending.is_empty() {
                return;
            }
            self.pending.shuffle(rng);
            for step in self.pending.drain(..) {
                self.instance.report_result(step.execute()).unwrap();
            }
        }
    }
}

fn run(graph_seed: u64, op_seed: u64, ops: usize) {
    let graph = generate(graph_seed);
    let mut rng = StdRng::seed_from_u64(op_seed);
    let reference = graph.definition.instantiate_raw();
    reference.complete_synchronously();
    let sync = graph.definition.instantiate_sync();
    let mut shuffled = Shuffled {
        instance: graph.definition.instantiate_raw(),
        pending: Vec::new(),
    };

    let mut history = Vec::new();
    for _ in 0..ops {
        let op = Op::random(&mut rng, &graph);
        history.push(op.clone());
        let Some(change) = op.change(&graph) else {
            shuffled.settle(&mut rng);
            let expected = read_raw(&graph, &reference);
            assert_eq!(
                read_raw(&graph, &shuffled.instance),
                expected,
                "out of order, graph {graph_seed}, ops {op_seed}: {history:?}\n{}",
                graph.definition
            );
            assert_eq!(
                read_sync(&graph, &sync),
                expected,
                "sync, graph {graph_seed}, ops {op_seed}: {history:?}\n{}",
                graph.definition
            );
            continue;
        };

        let t_reference = reference.set_inputs([change.clone()]).unwrap();
        reference.complete_synchronously();
        let t_shuffled = shuffled.instance.set_inputs([change.clone()]).unwrap();
        let t_sync = sync.set_inputs([change]).unwrap();
        assert_eq!(t_reference, t_shuffled);
        assert_eq!(t_reference, t_sync);
        shuffled.after_change(&mut rng);
    }

    shuffled.settle(&mut rng);
    let expected = read_raw(&graph, &reference);
    assert_eq!(read_raw(&graph, &shuffled.instance), expected);
    assert_eq!(read_sync(&graph, &sync), expected);
}

// =============================================================================
// Fuzz Tests
// =============================================================================

#[test]
fn test_fuzz_small_runs() {
    for graph_seed in 0..40 {
        for op_seed in 0..3 {
            run(graph_seed, op_seed, 40);
        }
    }
}

#[test]
fn test_fuzz_long_runs() {
    for graph_seed in 100..105 {
        run(graph_seed, graph_seed * 31, 400);
    }
}

#[test]
fn test_generated_graphs_are_deterministic() {
    assert_eq!(
        generate(7).definition.to_string(),
        generate(7).definition.to_string()
    );
}
