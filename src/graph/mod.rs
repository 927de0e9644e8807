//! Computation graph: an arena of tensors and operators addressed by id.
//!
//! Every edge mutation goes through `Graph` so that tensor producer/consumer
//! links and operator predecessor/successor sets stay consistent.

pub mod alloc;
pub mod export;
pub mod topo;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::config::PlannerOptions;
use crate::error::{Error, Result};
use crate::memory::{Allocator, Runtime};
use crate::ops::registry::{OpKind, Operator, OperatorId};
use crate::ops::tensor::{DataType, Shape, Tensor, TensorId};
use crate::optimization::graph_optimizer::{GraphOptimizer, OptimizationStats};

#[derive(Debug)]
pub struct Graph {
    /// Tensors keyed by fuid; ids are handed out in creation order
    tensors: BTreeMap<TensorId, Tensor>,
    operators: HashMap<OperatorId, Operator>,
    /// Current operator order
    order: Vec<OperatorId>,
    /// Whether `order` is known to be topological
    sorted: bool,
    next_tensor: usize,
    next_operator: usize,
    allocator: Allocator,
    options: PlannerOptions,
}

impl Graph {
    /// Create a graph with default options
    pub fn new(runtime: Box<dyn Runtime>) -> Result<Self> {
        Self::with_options(runtime, PlannerOptions::default())
    }

    pub fn with_options(runtime: Box<dyn Runtime>, options: PlannerOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            tensors: BTreeMap::new(),
            operators: HashMap::new(),
            order: Vec::new(),
            sorted: false,
            next_tensor: 0,
            next_operator: 0,
            allocator: Allocator::new(runtime, options.alignment)?,
            options,
        })
    }

    pub fn options(&self) -> &PlannerOptions {
        &self.options
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn num_operators(&self) -> usize {
        self.order.len()
    }

    pub fn tensor(&self, id: TensorId) -> Option<&Tensor> {
        self.tensors.get(&id)
    }

    /// Tensors in creation order
    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.values()
    }

    pub fn operator(&self, id: OperatorId) -> Option<&Operator> {
        self.operators.get(&id)
    }

    /// Operators in the current list order
    pub fn operators(&self) -> impl Iterator<Item = &Operator> {
        self.order.iter().filter_map(move |id| self.operators.get(id))
    }

    pub fn operator_ids(&self) -> &[OperatorId] {
        &self.order
    }

    pub(crate) fn tensor_mut(&mut self, id: TensorId) -> Result<&mut Tensor> {
        self.tensors.get_mut(&id).ok_or(Error::UnknownTensor(id))
    }

    pub(crate) fn operator_mut(&mut self, id: OperatorId) -> Result<&mut Operator> {
        self.operators.get_mut(&id).ok_or(Error::UnknownOperator(id))
    }

    /// Add an unconnected tensor; it must be wired to an operator before validation
    pub fn add_tensor(&mut self, dims: Shape, dtype: DataType) -> TensorId {
        let fuid = TensorId(self.next_tensor);
        self.next_tensor += 1;
        self.tensors.insert(fuid, Tensor::new(fuid, dims, dtype));
        self.sorted = false;
        fuid
    }

    /// Overwrite a tensor's shape
    pub fn set_tensor_shape(&mut self, id: TensorId, dims: Shape) -> Result<()> {
        self.tensor_mut(id)?.set_shape(dims);
        Ok(())
    }

    /// Add an operator after checking its inputs and inferring its outputs.
    ///
    /// When `outputs` is `None` the output tensors are created with the
    /// inferred shapes and the element type of the first input. Given outputs
    /// must already match the inferred shapes and must not have a producer.
    pub fn add_operator(
        &mut self,
        kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Option<Vec<TensorId>>,
    ) -> Result<OperatorId> {
        if inputs.len() != kind.num_inputs() {
            return Err(Error::InvalidOperator(format!(
                "{} expects {} inputs, got {}",
                kind.op_type(),
                kind.num_inputs(),
                inputs.len()
            )));
        }

        let shapes = inputs
            .iter()
            .map(|&id| self.tensor(id).map(Tensor::dims).ok_or(Error::UnknownTensor(id)))
            .collect::<Result<Vec<&[usize]>>>()?;
        let inferred = kind.infer_shape(&shapes).ok_or_else(|| {
            Error::InvalidOperator(format!(
                "cannot infer the output shape of {} from inputs {:?}",
                kind.op_type(),
                shapes
            ))
        })?;
        let dtype = self.tensors[&inputs[0]].dtype();

        let outputs = match outputs {
            Some(outputs) => {
                if outputs.len() != inferred.len() {
                    return Err(Error::InvalidOperator(format!(
                        "{} produces {} outputs, got {}",
                        kind.op_type(),
                        inferred.len(),
                        outputs.len()
                    )));
                }
                for (&id, shape) in outputs.iter().zip(&inferred) {
                    let tensor = self.tensor(id).ok_or(Error::UnknownTensor(id))?;
                    if tensor.dims() != shape.as_slice() {
                        return Err(Error::ShapeMismatch {
                            tensor: id,
                            expected: shape.clone(),
                            found: tensor.dims().to_vec(),
                        });
                    }
                }
                outputs
            }
            None => inferred
                .into_iter()
                .map(|shape| self.add_tensor(shape, dtype))
                .collect(),
        };

        self.add_operator_and_connect(kind, inputs, outputs)
    }

    /// Append an operator and wire it to the producers and consumers of its tensors
    pub fn add_operator_and_connect(
        &mut self,
        kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Result<OperatorId> {
        for &id in inputs.iter().chain(outputs.iter()) {
            if !self.tensors.contains_key(&id) {
                return Err(Error::UnknownTensor(id));
            }
        }
        for &id in &outputs {
            if let Some(source) = self.tensors[&id].source() {
                return Err(Error::InvalidGraph(format!(
                    "tensor {} is already produced by operator {}",
                    id, source
                )));
            }
        }

        let guid = OperatorId(self.next_operator);
        self.next_operator += 1;
        self.operators
            .insert(guid, Operator::new(guid, kind, inputs.clone(), outputs.clone()));
        self.order.push(guid);
        self.sorted = false;

        for input in inputs {
            self.connect_input(guid, input)?;
        }
        for output in outputs {
            self.connect_output(guid, output)?;
        }
        Ok(guid)
    }

    /// Register `op` as a consumer of `tensor` and link it to the producer
    fn connect_input(&mut self, op: OperatorId, tensor: TensorId) -> Result<()> {
        let tensor = self.tensor_mut(tensor)?;
        tensor.add_target(op);
        if let Some(pred) = tensor.source() {
            self.link(pred, op)?;
        }
        Ok(())
    }

    /// Make `op` the producer of `tensor` and link it to the existing consumers
    fn connect_output(&mut self, op: OperatorId, tensor: TensorId) -> Result<()> {
        let tensor = self.tensor_mut(tensor)?;
        tensor.source = Some(op);
        let targets = tensor.targets().to_vec();
        for succ in targets {
            self.link(op, succ)?;
        }
        Ok(())
    }

    /// Drop one consumer slot of `op` on `tensor`; unlink the producer if no
    /// other input of `op` still comes from it
    fn disconnect_input(&mut self, op: OperatorId, tensor: TensorId) -> Result<()> {
        let tensor = self.tensor_mut(tensor)?;
        tensor.remove_target(op);
        if let Some(pred) = tensor.source() {
            if !self.depends_on(op, pred) {
                self.unlink(pred, op);
            }
        }
        Ok(())
    }

    fn link(&mut self, pred: OperatorId, succ: OperatorId) -> Result<()> {
        self.operator_mut(pred)?.successors.insert(succ);
        self.operator_mut(succ)?.predecessors.insert(pred);
        Ok(())
    }

    fn unlink(&mut self, pred: OperatorId, succ: OperatorId) {
        if let Some(op) = self.operators.get_mut(&pred) {
            op.successors.remove(&succ);
        }
        if let Some(op) = self.operators.get_mut(&succ) {
            op.predecessors.remove(&pred);
        }
    }

    /// Whether any input of `op` is produced by `pred`
    fn depends_on(&self, op: OperatorId, pred: OperatorId) -> bool {
        self.operators.get(&op).map_or(false, |op| {
            op.inputs
                .iter()
                .any(|t| self.tensors.get(t).and_then(Tensor::source) == Some(pred))
        })
    }

    /// Point input slot `index` of `op` at `tensor`
    pub(crate) fn replace_input_at(&mut self, op: OperatorId, index: usize, tensor: TensorId) -> Result<()> {
        if !self.tensors.contains_key(&tensor) {
            return Err(Error::UnknownTensor(tensor));
        }
        let operator = self.operator_mut(op)?;
        let old = *operator.inputs.get(index).ok_or_else(|| {
            Error::InvalidOperator(format!("operator {} has no input {}", op, index))
        })?;
        operator.inputs[index] = tensor;

        self.disconnect_input(op, old)?;
        self.connect_input(op, tensor)?;
        self.sorted = false;
        Ok(())
    }

    /// Point every input slot of `op` reading `old` at `new`
    pub(crate) fn replace_input(&mut self, op: OperatorId, old: TensorId, new: TensorId) -> Result<()> {
        let slots: Vec<usize> = self
            .operator(op)
            .ok_or(Error::UnknownOperator(op))?
            .inputs
            .iter()
            .enumerate()
            .filter(|&(_, &t)| t == old)
            .map(|(i, _)| i)
            .collect();
        for index in slots {
            self.replace_input_at(op, index, new)?;
        }
        Ok(())
    }

    /// Remove an operator and every edge that mentions it
    pub(crate) fn remove_operator(&mut self, id: OperatorId) -> Result<Operator> {
        let operator = self.operators.remove(&id).ok_or(Error::UnknownOperator(id))?;
        self.order.retain(|&op| op != id);

        for t in &operator.inputs {
            if let Some(tensor) = self.tensors.get_mut(t) {
                tensor.remove_target(id);
            }
        }
        for t in &operator.outputs {
            if let Some(tensor) = self.tensors.get_mut(t) {
                if tensor.source == Some(id) {
                    tensor.source = None;
                }
            }
        }
        for pred in &operator.predecessors {
            if let Some(op) = self.operators.get_mut(pred) {
                op.successors.remove(&id);
            }
        }
        for succ in &operator.successors {
            if let Some(op) = self.operators.get_mut(succ) {
                op.predecessors.remove(&id);
            }
        }

        self.sorted = false;
        Ok(operator)
    }

    /// Remove a tensor that no operator references any more
    pub(crate) fn remove_tensor(&mut self, id: TensorId) -> Result<Tensor> {
        let tensor = self.tensor(id).ok_or(Error::UnknownTensor(id))?;
        if tensor.source().is_some() || !tensor.targets().is_empty() {
            return Err(Error::DanglingEdge(format!(
                "tensor {} is still connected (source {:?}, targets {:?})",
                id,
                tensor.source(),
                tensor.targets()
            )));
        }
        self.sorted = false;
        self.tensors.remove(&id).ok_or(Error::UnknownTensor(id))
    }

    /// Run the optimization passes selected by the planner options
    pub fn optimize(&mut self) -> Result<OptimizationStats> {
        let optimizer = GraphOptimizer::for_level(self.options.optimization_level);
        let validate = self.options.validate_after_passes;
        optimizer.run(self, validate)
    }

    /// Check the structural invariants of the graph.
    ///
    /// - no tensor is without both a source and targets
    /// - sources and targets are operators of this graph
    /// - operator inputs and outputs are tensors of this graph
    /// - predecessor/successor sets are symmetric and match tensor producers
    pub fn check_valid(&self) -> Result<()> {
        for (&id, tensor) in &self.tensors {
            if id != tensor.fuid() {
                return Err(Error::InvalidGraph(format!(
                    "tensor stored under {} reports fuid {}",
                    id,
                    tensor.fuid()
                )));
            }
            if tensor.source().is_none() && tensor.targets().is_empty() {
                return Err(Error::InvalidGraph(format!("tensor {} has no source and no targets", id)));
            }
            if let Some(source) = tensor.source() {
                let producer = self.operators.get(&source).ok_or_else(|| {
                    Error::DanglingEdge(format!("tensor {} has unknown source {}", id, source))
                })?;
                if !producer.outputs.contains(&id) {
                    return Err(Error::DanglingEdge(format!(
                        "tensor {} names {} as source, which does not output it",
                        id, source
                    )));
                }
            }
            for &target in tensor.targets() {
                let consumer = self.operators.get(&target).ok_or_else(|| {
                    Error::DanglingEdge(format!("tensor {} has unknown target {}", id, target))
                })?;
                let uses = consumer.inputs.iter().filter(|&&t| t == id).count();
                let slots = tensor.targets().iter().filter(|&&t| t == target).count();
                if uses != slots {
                    return Err(Error::DanglingEdge(format!(
                        "tensor {} lists {} slots for operator {}, which reads it {} times",
                        id, slots, target, uses
                    )));
                }
            }
        }

        let listed: HashSet<OperatorId> = self.order.iter().copied().collect();
        if listed.len() != self.order.len() || listed.len() != self.operators.len() {
            return Err(Error::InvalidGraph(
                "operator list does not match the operator set".to_string(),
            ));
        }

        for (&id, op) in &self.operators {
            for t in op.inputs.iter().chain(op.outputs.iter()) {
                if !self.tensors.contains_key(t) {
                    return Err(Error::DanglingEdge(format!("operator {} references unknown tensor {}", id, t)));
                }
            }
            for &output in &op.outputs {
                if self.tensors[&output].source() != Some(id) {
                    return Err(Error::DanglingEdge(format!(
                        "operator {} outputs tensor {} without being its source",
                        id, output
                    )));
                }
            }

            let expected_preds: HashSet<OperatorId> = op
                .inputs
                .iter()
                .filter_map(|t| self.tensors[t].source())
                .collect();
            let expected_succs: HashSet<OperatorId> = op
                .outputs
                .iter()
                .flat_map(|t| self.tensors[t].targets().iter().copied())
                .collect();
            if op.predecessors.iter().copied().collect::<HashSet<_>>() != expected_preds {
                return Err(Error::DanglingEdge(format!(
                    "operator {} predecessors {:?} do not match its input producers {:?}",
                    id, op.predecessors, expected_preds
                )));
            }
            if op.successors.iter().copied().collect::<HashSet<_>>() != expected_succs {
                return Err(Error::DanglingEdge(format!(
                    "operator {} successors {:?} do not match its output consumers {:?}",
                    id, op.successors, expected_succs
                )));
            }
            for pred in &op.predecessors {
                let symmetric = self.operators.get(pred).map_or(false, |p| p.successors.contains(&id));
                if !symmetric {
                    return Err(Error::DanglingEdge(format!("edge {} -> {} is not symmetric", pred, id)));
                }
            }
            for succ in &op.successors {
                let symmetric = self.operators.get(succ).map_or(false, |s| s.predecessors.contains(&id));
                if !symmetric {
                    return Err(Error::DanglingEdge(format!("edge {} -> {} is not symmetric", id, succ)));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph Tensors:")?;
        for tensor in self.tensors() {
            writeln!(f, "{}", tensor)?;
        }
        writeln!(f, "Graph operators:")?;
        for op in self.operators() {
            let preds: Vec<usize> = op.predecessors().map(|p| p.0).collect();
            let succs: Vec<usize> = op.successors().map(|s| s.0).collect();
            writeln!(f, "OP {}, pred {:?}, succ {:?}, {}", op.guid(), preds, succs, op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::CpuRuntime;

    fn graph() -> Graph {
        Graph::new(Box::new(CpuRuntime::default())).unwrap()
    }

    #[test]
    fn test_connect_links_both_directions() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3], DataType::Float32);
        let b = g.add_tensor(vec![3, 4], DataType::Float32);
        let mm = g.add_operator(OpKind::matmul(false, false), vec![a, b], None).unwrap();
        let c = g.operator(mm).unwrap().outputs()[0];
        let relu = g.add_operator(OpKind::Relu, vec![c], None).unwrap();

        assert_eq!(g.tensor(c).unwrap().dims(), &[2, 4]);
        assert_eq!(g.tensor(c).unwrap().source(), Some(mm));
        assert_eq!(g.tensor(c).unwrap().targets(), &[relu]);
        assert_eq!(g.operator(mm).unwrap().successors().collect::<Vec<_>>(), vec![relu]);
        assert_eq!(g.operator(relu).unwrap().predecessors().collect::<Vec<_>>(), vec![mm]);
        g.check_valid().unwrap();
    }

    #[test]
    fn test_consumer_added_before_producer() {
        let mut g = graph();
        let x = g.add_tensor(vec![4], DataType::Float32);
        let y = g.add_tensor(vec![4], DataType::Float32);
        let z = g.add_tensor(vec![4], DataType::Float32);
        let consumer = g.add_operator(OpKind::Relu, vec![y], Some(vec![z])).unwrap();
        let producer = g.add_operator(OpKind::Relu, vec![x], Some(vec![y])).unwrap();

        assert!(g.operator(producer).unwrap().successors.contains(&consumer));
        assert!(g.operator(consumer).unwrap().predecessors.contains(&producer));
        g.check_valid().unwrap();
    }

    #[test]
    fn test_add_operator_rejects_bad_outputs() {
        let mut g = graph();
        let x = g.add_tensor(vec![2, 3], DataType::Float32);
        let wrong = g.add_tensor(vec![2, 3], DataType::Float32);
        let result = g.add_operator(OpKind::transpose(vec![1, 0]), vec![x], Some(vec![wrong]));
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));

        let y = g.add_tensor(vec![3, 2], DataType::Float32);
        g.add_operator(OpKind::transpose(vec![1, 0]), vec![x], Some(vec![y])).unwrap();
        let again = g.add_operator(OpKind::transpose(vec![1, 0]), vec![x], Some(vec![y]));
        assert!(matches!(again, Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn test_replace_input_keeps_shared_producer_edge() {
        let mut g = graph();
        let x = g.add_tensor(vec![4], DataType::Float32);
        let y = g.add_tensor(vec![4], DataType::Float32);
        let split = g.add_operator(OpKind::Relu, vec![x], None).unwrap();
        let a = g.operator(split).unwrap().outputs()[0];
        let add = g.add_operator(OpKind::Add, vec![a, a], None).unwrap();

        // One slot moves away from `split`, the other still reads from it
        g.replace_input_at(add, 1, y).unwrap();
        assert!(g.operator(add).unwrap().predecessors.contains(&split));
        assert_eq!(g.tensor(a).unwrap().targets(), &[add]);

        g.replace_input_at(add, 0, y).unwrap();
        assert!(!g.operator(add).unwrap().predecessors.contains(&split));
        assert!(!g.operator(split).unwrap().successors.contains(&add));
    }

    #[test]
    fn test_remove_tensor_requires_detached() {
        let mut g = graph();
        let x = g.add_tensor(vec![4], DataType::Float32);
        let relu = g.add_operator(OpKind::Relu, vec![x], None).unwrap();
        assert!(matches!(g.remove_tensor(x), Err(Error::DanglingEdge(_))));

        g.remove_operator(relu).unwrap();
        assert!(g.remove_tensor(x).is_ok());
    }

    #[test]
    fn test_display_dump() {
        let mut g = graph();
        let x = g.add_tensor(vec![2, 2], DataType::Float32);
        g.add_operator(OpKind::Relu, vec![x], None).unwrap();
        let dump = g.to_string();
        assert!(dump.starts_with("Graph Tensors:\n"));
        assert!(dump.contains("Graph operators:\nOP 0, pred [], succ [], Relu(input=0,output=1)"));
    }
}
