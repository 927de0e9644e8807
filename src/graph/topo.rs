use std::collections::HashSet;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::graph::Graph;

impl Graph {
    /// Reorder operators so every operator follows the producers of its inputs.
    ///
    /// Repeatedly scans the unplaced operators and places each one whose inputs
    /// are graph inputs or come from placed operators. A scan that places
    /// nothing means the graph has a cycle: `false` is returned and the
    /// operator list is left as it was.
    pub fn topo_sort(&mut self) -> bool {
        if self.sorted {
            return true;
        }

        let mut sorted = Vec::with_capacity(self.order.len());
        let mut placed = HashSet::with_capacity(self.order.len());

        while sorted.len() < self.order.len() {
            let mut modified = false;
            for &id in &self.order {
                if placed.contains(&id) {
                    continue;
                }
                let Some(op) = self.operators.get(&id) else {
                    continue;
                };
                let ready = op.inputs.iter().all(|input| {
                    match self.tensors.get(input).and_then(|t| t.source()) {
                        Some(source) => placed.contains(&source),
                        None => true,
                    }
                });
                if ready {
                    modified = true;
                    sorted.push(id);
                    placed.insert(id);
                }
            }
            if !modified {
                warn!(
                    "topological sort stalled with {} of {} operators placed: graph has a cycle",
                    sorted.len(),
                    self.order.len()
                );
                return false;
            }
        }

        self.order = sorted;
        self.sorted = true;
        true
    }

    /// Recompute output shapes from input shapes in topological order
    pub fn shape_infer(&mut self) -> Result<()> {
        if !self.topo_sort() {
            return Err(Error::CyclicGraph);
        }
        for id in self.order.clone() {
            let op = self.operator(id).ok_or(Error::UnknownOperator(id))?;
            let shapes = op
                .inputs
                .iter()
                .map(|&t| self.tensor(t).map(|t| t.dims()).ok_or(Error::UnknownTensor(t)))
                .collect::<Result<Vec<&[usize]>>>()?;
            let inferred = op.kind.infer_shape(&shapes).ok_or(Error::ShapeInference(id))?;
            if inferred.len() != op.outputs.len() {
                return Err(Error::ArityMismatch {
                    op: id,
                    inferred: inferred.len(),
                    outputs: op.outputs.len(),
                });
            }
            let outputs = op.outputs.clone();

            for (output, shape) in outputs.into_iter().zip(inferred) {
                let tensor = self.tensor_mut(output)?;
                if tensor.dims() != shape.as_slice() {
                    debug!("tensor {} reshaped {:?} -> {:?} by operator {}", output, tensor.dims(), shape, id);
                    tensor.set_shape(shape);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::graph::Graph;
    use crate::memory::CpuRuntime;
    use crate::ops::{DataType, OpKind};

    fn graph() -> Graph {
        Graph::new(Box::new(CpuRuntime::default())).unwrap()
    }

    #[test]
    fn test_sort_reorders_reversed_chain() {
        let mut g = graph();
        let x = g.add_tensor(vec![4], DataType::Float32);
        let y = g.add_tensor(vec![4], DataType::Float32);
        let z = g.add_tensor(vec![4], DataType::Float32);
        let second = g.add_operator(OpKind::Relu, vec![y], Some(vec![z])).unwrap();
        let first = g.add_operator(OpKind::Relu, vec![x], Some(vec![y])).unwrap();

        assert!(!g.is_sorted());
        assert!(g.topo_sort());
        assert_eq!(g.operator_ids(), &[first, second]);
        assert!(g.is_sorted());
        assert!(g.topo_sort());
    }

    #[test]
    fn test_cycle_leaves_order_untouched() {
        let mut g = graph();
        let a = g.add_tensor(vec![4], DataType::Float32);
        let b = g.add_tensor(vec![4], DataType::Float32);
        let first = g.add_operator(OpKind::Relu, vec![a], Some(vec![b])).unwrap();
        let second = g.add_operator(OpKind::Relu, vec![b], Some(vec![a])).unwrap();

        assert!(!g.topo_sort());
        assert_eq!(g.operator_ids(), &[first, second]);
        assert!(!g.is_sorted());
    }

    #[test]
    fn test_shape_infer_propagates_new_shapes() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3], DataType::Float32);
        let b = g.add_tensor(vec![3, 4], DataType::Float32);
        let mm = g.add_operator(OpKind::matmul(false, false), vec![a, b], None).unwrap();
        let c = g.operator(mm).unwrap().outputs()[0];
        let t = g.add_operator(OpKind::transpose(vec![1, 0]), vec![c], None).unwrap();
        let d = g.operator(t).unwrap().outputs()[0];

        g.set_tensor_shape(a, vec![5, 3]).unwrap();
        assert!(g.topo_sort());
        g.shape_infer().unwrap();
        assert_eq!(g.tensor(c).unwrap().dims(), &[5, 4]);
        assert_eq!(g.tensor(d).unwrap().dims(), &[4, 5]);
    }

    #[test]
    fn test_shape_infer_sorts_first() {
        let mut g = graph();
        let x = g.add_tensor(vec![2, 3], DataType::Float32);
        let y = g.add_tensor(vec![3, 2], DataType::Float32);
        let z = g.add_tensor(vec![2, 3], DataType::Float32);
        // Consumer added before its producer
        g.add_operator(OpKind::transpose(vec![1, 0]), vec![y], Some(vec![z])).unwrap();
        g.add_operator(OpKind::transpose(vec![1, 0]), vec![x], Some(vec![y])).unwrap();

        g.set_tensor_shape(x, vec![4, 5]).unwrap();
        g.shape_infer().unwrap();
        assert!(g.is_sorted());
        assert_eq!(g.tensor(y).unwrap().dims(), &[5, 4]);
        assert_eq!(g.tensor(z).unwrap().dims(), &[4, 5]);
    }

    #[test]
    fn test_shape_infer_rejects_cycle() {
        let mut g = graph();
        let a = g.add_tensor(vec![4], DataType::Float32);
        let b = g.add_tensor(vec![4], DataType::Float32);
        g.add_operator(OpKind::Relu, vec![a], Some(vec![b])).unwrap();
        g.add_operator(OpKind::Relu, vec![b], Some(vec![a])).unwrap();

        assert!(matches!(g.shape_infer(), Err(Error::CyclicGraph)));
    }

    #[test]
    fn test_shape_infer_reports_failure() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3], DataType::Float32);
        let b = g.add_tensor(vec![3, 4], DataType::Float32);
        let mm = g.add_operator(OpKind::matmul(false, false), vec![a, b], None).unwrap();

        g.set_tensor_shape(b, vec![7, 4]).unwrap();
        assert!(matches!(g.shape_infer(), Err(Error::ShapeInference(op)) if op == mm));
    }
}
