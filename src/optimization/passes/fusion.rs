use std::collections::HashSet;
use std::time::Instant;

use log::debug;

use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::ops::registry::{OpKind, Operator, OperatorId};
use crate::ops::tensor::TensorId;
use crate::ops::transform::TransposeAttrs;
use crate::optimization::graph_optimizer::{OptimizationPass, PassResult};

/// A planned local rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// Two transposes composing to the identity: both disappear
    CancelTransposes { inner: OperatorId, outer: OperatorId },
    /// Two transposes replaced by one carrying the composed permutation
    MergeTransposes {
        inner: OperatorId,
        outer: OperatorId,
        composed: TransposeAttrs,
    },
    /// A last-two-axes transpose absorbed into a MatMul transpose flag
    FoldIntoMatMul {
        matmul: OperatorId,
        operand: usize,
        transpose: OperatorId,
    },
}

/// Transpose fusion pass.
///
/// Scans the operator list once, planning rewrites against the unmodified
/// graph, then applies them. Operators taking part in a planned rewrite are
/// claimed so that no two rewrites touch the same transpose. An intermediate
/// tensor is only fused away when it has exactly one consumer.
pub struct TransposeFusion {
    name: String,
    eliminate_pairs: bool,
    fold_into_matmul: bool,
}

impl TransposeFusion {
    /// Both pattern families
    pub fn new() -> Self {
        Self {
            name: "TransposeFusion".to_string(),
            eliminate_pairs: true,
            fold_into_matmul: true,
        }
    }

    /// Only transpose pair elimination
    pub fn elimination_only() -> Self {
        Self {
            name: "TransposeElimination".to_string(),
            eliminate_pairs: true,
            fold_into_matmul: false,
        }
    }

    /// Plan the rewrites for the current graph without modifying it
    pub fn find_rewrites(&self, graph: &Graph) -> Vec<Rewrite> {
        let mut claimed: HashSet<OperatorId> = HashSet::new();
        let mut rewrites = Vec::new();

        for op in graph.operators() {
            if claimed.contains(&op.guid()) {
                continue;
            }
            match op.kind() {
                OpKind::Transpose(outer) if self.eliminate_pairs => {
                    if let Some(rewrite) = self.match_transpose_pair(graph, op, outer, &claimed) {
                        if let Rewrite::CancelTransposes { inner, .. } | Rewrite::MergeTransposes { inner, .. } =
                            &rewrite
                        {
                            claimed.insert(*inner);
                        }
                        claimed.insert(op.guid());
                        rewrites.push(rewrite);
                    }
                }
                OpKind::MatMul(_) if self.fold_into_matmul => {
                    for operand in 0..op.inputs().len() {
                        if let Some(transpose) = self.match_matmul_operand(graph, op, operand, &claimed) {
                            claimed.insert(transpose);
                            rewrites.push(Rewrite::FoldIntoMatMul {
                                matmul: op.guid(),
                                operand,
                                transpose,
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        rewrites
    }

    /// The single-consumer producer of `tensor`, if it is an unclaimed transpose
    fn sole_transpose_producer<'g>(
        graph: &'g Graph,
        tensor: TensorId,
        claimed: &HashSet<OperatorId>,
    ) -> Option<(&'g Operator, &'g TransposeAttrs)> {
        let tensor = graph.tensor(tensor)?;
        if tensor.targets().len() != 1 {
            return None;
        }
        let producer = graph.operator(tensor.source()?)?;
        if claimed.contains(&producer.guid()) {
            return None;
        }
        match producer.kind() {
            OpKind::Transpose(attrs) => Some((producer, attrs)),
            _ => None,
        }
    }

    fn match_transpose_pair(
        &self,
        graph: &Graph,
        outer: &Operator,
        outer_attrs: &TransposeAttrs,
        claimed: &HashSet<OperatorId>,
    ) -> Option<Rewrite> {
        let &[intermediate] = outer.inputs() else {
            return None;
        };
        let (inner, inner_attrs) = Self::sole_transpose_producer(graph, intermediate, claimed)?;
        if inner.guid() == outer.guid() {
            return None;
        }
        // A pair closing a cycle feeds its own input; leave it alone
        let output = *outer.outputs().first()?;
        let consumers = graph.tensor(output)?.targets();
        if inner.inputs().contains(&output)
            || consumers.iter().any(|&c| c == inner.guid() || c == outer.guid())
        {
            return None;
        }
        let composed = inner_attrs.then(outer_attrs)?;

        if composed.is_identity() {
            // Without consumers the outer output is a graph result; keep it
            if consumers.is_empty() {
                return None;
            }
            Some(Rewrite::CancelTransposes {
                inner: inner.guid(),
                outer: outer.guid(),
            })
        } else {
            Some(Rewrite::MergeTransposes {
                inner: inner.guid(),
                outer: outer.guid(),
                composed,
            })
        }
    }

    fn match_matmul_operand(
        &self,
        graph: &Graph,
        matmul: &Operator,
        operand: usize,
        claimed: &HashSet<OperatorId>,
    ) -> Option<OperatorId> {
        let tensor = *matmul.inputs().get(operand)?;
        let (transpose, attrs) = Self::sole_transpose_producer(graph, tensor, claimed)?;
        let source = graph.tensor(*transpose.inputs().first()?)?;
        if source.source() == Some(matmul.guid()) {
            return None;
        }
        if attrs.swaps_last_two_axes() {
            Some(transpose.guid())
        } else {
            None
        }
    }

    /// Apply planned rewrites in order, returning how many were applied
    pub fn apply_rewrites(&self, graph: &mut Graph, rewrites: Vec<Rewrite>) -> Result<usize> {
        let mut count = 0;
        for rewrite in rewrites {
            debug!("applying {:?}", rewrite);
            match rewrite {
                Rewrite::CancelTransposes { inner, outer } => Self::cancel_transposes(graph, inner, outer)?,
                Rewrite::MergeTransposes { inner, outer, composed } => {
                    Self::merge_transposes(graph, inner, outer, composed)?
                }
                Rewrite::FoldIntoMatMul {
                    matmul,
                    operand,
                    transpose,
                } => Self::fold_into_matmul(graph, matmul, operand, transpose)?,
            }
            count += 1;
        }
        Ok(count)
    }

    fn sole_input(graph: &Graph, op: OperatorId) -> Result<TensorId> {
        let operator = graph.operator(op).ok_or(Error::UnknownOperator(op))?;
        operator.inputs().first().copied().ok_or_else(|| {
            Error::InvalidOperator(format!("operator {} has no input", op))
        })
    }

    fn sole_output(graph: &Graph, op: OperatorId) -> Result<TensorId> {
        let operator = graph.operator(op).ok_or(Error::UnknownOperator(op))?;
        operator.outputs().first().copied().ok_or_else(|| {
            Error::InvalidOperator(format!("operator {} has no output", op))
        })
    }

    fn cancel_transposes(graph: &mut Graph, inner: OperatorId, outer: OperatorId) -> Result<()> {
        let source = Self::sole_input(graph, inner)?;
        let intermediate = Self::sole_output(graph, inner)?;
        let output = Self::sole_output(graph, outer)?;

        let mut consumers = graph
            .tensor(output)
            .ok_or(Error::UnknownTensor(output))?
            .targets()
            .to_vec();
        consumers.sort();
        consumers.dedup();

        graph.remove_operator(outer)?;
        graph.remove_operator(inner)?;
        for consumer in consumers {
            graph.replace_input(consumer, output, source)?;
        }
        graph.remove_tensor(intermediate)?;
        graph.remove_tensor(output)?;
        Ok(())
    }

    fn merge_transposes(
        graph: &mut Graph,
        inner: OperatorId,
        outer: OperatorId,
        composed: TransposeAttrs,
    ) -> Result<()> {
        let source = Self::sole_input(graph, inner)?;
        let intermediate = Self::sole_output(graph, inner)?;
        let output = Self::sole_output(graph, outer)?;

        graph.remove_operator(outer)?;
        graph.remove_operator(inner)?;
        graph.remove_tensor(intermediate)?;
        graph.add_operator_and_connect(OpKind::Transpose(composed), vec![source], vec![output])?;
        Ok(())
    }

    fn fold_into_matmul(
        graph: &mut Graph,
        matmul: OperatorId,
        operand: usize,
        transpose: OperatorId,
    ) -> Result<()> {
        let source = Self::sole_input(graph, transpose)?;
        let intermediate = Self::sole_output(graph, transpose)?;
        let current = graph
            .operator(matmul)
            .ok_or(Error::UnknownOperator(matmul))?
            .inputs()
            .get(operand)
            .copied();
        if current != Some(intermediate) {
            return Err(Error::InvalidGraph(format!(
                "operand {} of operator {} is no longer produced by transpose {}",
                operand, matmul, transpose
            )));
        }

        graph.remove_operator(transpose)?;
        graph.replace_input_at(matmul, operand, source)?;
        match &mut graph.operator_mut(matmul)?.kind {
            OpKind::MatMul(attrs) if operand == 0 => attrs.trans_a = !attrs.trans_a,
            OpKind::MatMul(attrs) => attrs.trans_b = !attrs.trans_b,
            _ => {
                return Err(Error::InvalidOperator(format!("operator {} is not a MatMul", matmul)));
            }
        }
        graph.remove_tensor(intermediate)?;
        Ok(())
    }
}

impl Default for TransposeFusion {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for TransposeFusion {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult> {
        let start_time = Instant::now();

        let rewrites = self.find_rewrites(graph);
        let count = self.apply_rewrites(graph, rewrites)?;

        let duration = start_time.elapsed();

        Ok(PassResult {
            name: self.name.clone(),
            optimizations_applied: count,
            duration,
            changed: count > 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::CpuRuntime;
    use crate::ops::DataType;

    fn graph() -> Graph {
        Graph::new(Box::new(CpuRuntime::default())).unwrap()
    }

    #[test]
    fn test_plans_cancel_for_inverse_pair() {
        let mut g = graph();
        let x = g.add_tensor(vec![2, 3], DataType::Float32);
        let t1 = g.add_operator(OpKind::transpose(vec![1, 0]), vec![x], None).unwrap();
        let mid = g.operator(t1).unwrap().outputs()[0];
        let t2 = g.add_operator(OpKind::transpose(vec![1, 0]), vec![mid], None).unwrap();
        let y = g.operator(t2).unwrap().outputs()[0];
        g.add_operator(OpKind::Relu, vec![y], None).unwrap();

        let rewrites = TransposeFusion::new().find_rewrites(&g);
        assert_eq!(rewrites, vec![Rewrite::CancelTransposes { inner: t1, outer: t2 }]);
    }

    #[test]
    fn test_pair_without_consumers_is_kept() {
        let mut g = graph();
        let x = g.add_tensor(vec![2, 3], DataType::Float32);
        let t1 = g.add_operator(OpKind::transpose(vec![1, 0]), vec![x], None).unwrap();
        let mid = g.operator(t1).unwrap().outputs()[0];
        g.add_operator(OpKind::transpose(vec![1, 0]), vec![mid], None).unwrap();

        assert!(TransposeFusion::new().find_rewrites(&g).is_empty());
    }

    #[test]
    fn test_claimed_transpose_is_not_reused() {
        // x -> t1 -> t2 -> t3 -> relu, every transpose swapping the two axes
        let mut g = graph();
        let x = g.add_tensor(vec![2, 3], DataType::Float32);
        let mut current = x;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let t = g.add_operator(OpKind::transpose(vec![1, 0]), vec![current], None).unwrap();
            current = g.operator(t).unwrap().outputs()[0];
            ids.push(t);
        }
        g.add_operator(OpKind::Relu, vec![current], None).unwrap();

        let rewrites = TransposeFusion::new().find_rewrites(&g);
        assert_eq!(
            rewrites,
            vec![Rewrite::CancelTransposes { inner: ids[0], outer: ids[1] }]
        );
    }

    #[test]
    fn test_transpose_cycle_is_not_rewritten() {
        let mut g = graph();
        let x = g.add_tensor(vec![3, 3], DataType::Float32);
        let m = g.add_tensor(vec![3, 3], DataType::Float32);
        g.add_operator(OpKind::transpose(vec![1, 0]), vec![x], Some(vec![m])).unwrap();
        g.add_operator(OpKind::transpose(vec![1, 0]), vec![m], Some(vec![x])).unwrap();

        assert!(TransposeFusion::new().find_rewrites(&g).is_empty());
    }

    #[test]
    fn test_matmul_feeding_its_own_transpose_is_not_folded() {
        let mut g = graph();
        let c = g.add_tensor(vec![3, 3], DataType::Float32);
        let ct = g.add_tensor(vec![3, 3], DataType::Float32);
        let w = g.add_tensor(vec![3, 3], DataType::Float32);
        g.add_operator(OpKind::transpose(vec![1, 0]), vec![c], Some(vec![ct])).unwrap();
        g.add_operator(OpKind::matmul(false, false), vec![ct, w], Some(vec![c])).unwrap();

        assert!(TransposeFusion::new().find_rewrites(&g).is_empty());
    }

    #[test]
    fn test_elimination_only_skips_matmul() {
        let mut g = graph();
        let x = g.add_tensor(vec![4, 3], DataType::Float32);
        let w = g.add_tensor(vec![4, 5], DataType::Float32);
        let t = g.add_operator(OpKind::transpose(vec![1, 0]), vec![x], None).unwrap();
        let xt = g.operator(t).unwrap().outputs()[0];
        g.add_operator(OpKind::matmul(false, false), vec![xt, w], None).unwrap();

        assert!(TransposeFusion::elimination_only().find_rewrites(&g).is_empty());
        assert_eq!(TransposeFusion::new().find_rewrites(&g).len(), 1);
    }
}
