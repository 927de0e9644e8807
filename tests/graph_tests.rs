use std::collections::HashMap;

use petgraph::algo::is_cyclic_directed;
use rand::prelude::*;

use tensor_planner::{
    error::Error,
    memory::CpuRuntime,
    ops::{DataType, OpKind, OperatorId, TensorId},
    Graph, OptimizationLevel, PlannerOptions,
};

fn graph() -> Graph {
    Graph::new(Box::new(CpuRuntime::default())).unwrap()
}

/// Random DAG over `[4]` tensors where operator `i` produces tensor `i`,
/// inserted into the graph in shuffled order
fn random_dag(seed: u64, size: usize) -> Graph {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut g = graph();
    let tensors: Vec<TensorId> = (0..size).map(|_| g.add_tensor(vec![4], DataType::Float32)).collect();

    let mut ops: Vec<(OpKind, Vec<TensorId>, TensorId)> = Vec::new();
    for i in 1..size {
        let j = if i == 1 { 0 } else { rng.gen_range(0..i) };
        if rng.gen_bool(0.5) {
            ops.push((OpKind::Relu, vec![tensors[j]], tensors[i]));
        } else {
            let k = rng.gen_range(0..i);
            ops.push((OpKind::Add, vec![tensors[j], tensors[k]], tensors[i]));
        }
    }
    ops.shuffle(&mut rng);

    for (kind, inputs, output) in ops {
        g.add_operator(kind, inputs, Some(vec![output])).unwrap();
    }
    g
}

fn assert_topological(g: &Graph) {
    let position: HashMap<OperatorId, usize> =
        g.operator_ids().iter().enumerate().map(|(i, &id)| (id, i)).collect();
    for op in g.operators() {
        for &input in op.inputs() {
            if let Some(source) = g.tensor(input).unwrap().source() {
                assert!(position[&source] < position[&op.guid()]);
            }
        }
    }
}

#[test]
fn test_topo_sort_on_random_dags() {
    for seed in 0..10 {
        let mut g = random_dag(seed, 30);
        g.check_valid().unwrap();
        assert!(!is_cyclic_directed(&g.dependency_graph()));

        assert!(g.topo_sort());
        assert_eq!(g.num_operators(), 29);
        assert_topological(&g);
        g.check_valid().unwrap();
    }
}

#[test]
fn test_cycle_is_detected() {
    let mut g = graph();
    let a = g.add_tensor(vec![4], DataType::Float32);
    let b = g.add_tensor(vec![4], DataType::Float32);
    let c = g.add_tensor(vec![4], DataType::Float32);
    g.add_operator(OpKind::Relu, vec![a], Some(vec![b])).unwrap();
    g.add_operator(OpKind::Relu, vec![b], Some(vec![c])).unwrap();
    g.add_operator(OpKind::Relu, vec![c], Some(vec![a])).unwrap();

    assert!(is_cyclic_directed(&g.dependency_graph()));
    assert!(!g.topo_sort());
    assert!(matches!(g.data_malloc(), Err(Error::CyclicGraph)));
}

#[test]
fn test_data_malloc_binds_every_tensor() {
    let mut g = random_dag(3, 20);
    let extra = g.add_tensor(vec![3, 5], DataType::Int8);
    g.add_operator(OpKind::transpose(vec![1, 0]), vec![extra], None).unwrap();

    g.data_malloc().unwrap();

    let mut regions: Vec<(usize, usize)> = g
        .tensors()
        .map(|t| (t.data_blob().expect("tensor bound").offset(), t.bytes()))
        .collect();
    regions.sort();
    for pair in regions.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0);
    }
    let total: usize = regions.iter().map(|r| r.1).sum();
    assert_eq!(g.allocator().used(), g.allocator().aligned_size(total).unwrap());
    assert!(regions.iter().all(|&(offset, bytes)| offset + bytes <= g.allocator().peak()));
}

#[test]
fn test_matmul_chain_shapes() {
    let mut g = graph();
    let a = g.add_tensor(vec![8, 2, 3], DataType::Float32);
    let b = g.add_tensor(vec![8, 4, 3], DataType::Float32);
    let mm = g.add_operator(OpKind::matmul(false, true), vec![a, b], None).unwrap();
    let c = g.operator(mm).unwrap().outputs()[0];
    assert_eq!(g.tensor(c).unwrap().dims(), &[8, 2, 4]);

    let bad = g.add_tensor(vec![8, 5, 3], DataType::Float32);
    assert!(matches!(
        g.add_operator(OpKind::matmul(false, false), vec![a, bad], None),
        Err(Error::InvalidOperator(_))
    ));
}

#[test]
fn test_optimize_with_level_none_changes_nothing() {
    let options = PlannerOptions::new().set_optimization_level(OptimizationLevel::None);
    let mut g = Graph::with_options(Box::new(CpuRuntime::default()), options).unwrap();
    let x = g.add_tensor(vec![2, 3], DataType::Float32);
    let t1 = g.add_operator(OpKind::transpose(vec![1, 0]), vec![x], None).unwrap();
    let mid = g.operator(t1).unwrap().outputs()[0];
    let t2 = g.add_operator(OpKind::transpose(vec![1, 0]), vec![mid], None).unwrap();
    let y = g.operator(t2).unwrap().outputs()[0];
    g.add_operator(OpKind::Relu, vec![y], None).unwrap();

    let stats = g.optimize().unwrap();
    assert_eq!(stats.total_optimizations, 0);
    assert!(stats.pass_results.is_empty());
    assert_eq!(g.num_operators(), 3);
}

#[test]
fn test_display_lists_tensors_and_operators() {
    let mut g = graph();
    let a = g.add_tensor(vec![2, 3], DataType::Float32);
    let b = g.add_tensor(vec![3, 4], DataType::Float32);
    // A rejected operator consumes no id
    assert!(g.add_operator(OpKind::matmul(true, false), vec![a, b], None).is_err());
    assert_eq!(g.num_tensors(), 2);

    let mm = g.add_operator(OpKind::matmul(false, false), vec![a, b], None).unwrap();
    let c = g.operator(mm).unwrap().outputs()[0];
    g.add_operator(OpKind::Relu, vec![c], None).unwrap();

    let dump = g.to_string();
    assert!(dump.contains("Graph Tensors:"));
    assert!(dump.contains("Graph operators:"));
    assert!(dump.contains("OP 0, pred [], succ [1], Matmul([A,B],A=0,B=1,C=2)"));
    assert!(dump.contains("OP 1, pred [0], succ [], Relu(input=2,output=3)"));
}
