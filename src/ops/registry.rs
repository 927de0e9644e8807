use std::collections::BTreeSet;
use std::fmt;

use strum::{AsRefStr, Display};

use crate::ops::elementwise;
use crate::ops::math::matmul::MatMulAttrs;
use crate::ops::tensor::{Shape, TensorId};
use crate::ops::transform::TransposeAttrs;

/// Unique operator identity (guid)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperatorId(pub usize);

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attribute-free operator tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum OpType {
    MatMul,
    Transpose,
    Relu,
    Add,
}

/// Operator kind together with its attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    MatMul(MatMulAttrs),
    Transpose(TransposeAttrs),
    Relu,
    Add,
}

impl OpKind {
    pub fn matmul(trans_a: bool, trans_b: bool) -> Self {
        OpKind::MatMul(MatMulAttrs::new(trans_a, trans_b))
    }

    pub fn transpose(permute: Vec<usize>) -> Self {
        OpKind::Transpose(TransposeAttrs::new(permute))
    }

    pub fn op_type(&self) -> OpType {
        match self {
            OpKind::MatMul(_) => OpType::MatMul,
            OpKind::Transpose(_) => OpType::Transpose,
            OpKind::Relu => OpType::Relu,
            OpKind::Add => OpType::Add,
        }
    }

    pub fn num_inputs(&self) -> usize {
        match self {
            OpKind::MatMul(_) | OpKind::Add => 2,
            OpKind::Transpose(_) | OpKind::Relu => 1,
        }
    }

    /// Output shapes for the given input shapes, or `None` if they are not valid
    pub fn infer_shape(&self, inputs: &[&[usize]]) -> Option<Vec<Shape>> {
        if inputs.len() != self.num_inputs() {
            return None;
        }
        let output = match self {
            OpKind::MatMul(attrs) => attrs.infer_shape(inputs[0], inputs[1]),
            OpKind::Transpose(attrs) => attrs.infer_shape(inputs[0]),
            OpKind::Relu => elementwise::unary_shape(inputs[0]),
            OpKind::Add => elementwise::binary_shape(inputs[0], inputs[1]),
        }?;
        Some(vec![output])
    }
}

/// An operator node of the computation graph.
///
/// `predecessors` and `successors` mirror the producer/consumer links of the
/// operator's tensors and are maintained by `Graph`.
#[derive(Debug, Clone)]
pub struct Operator {
    pub(crate) guid: OperatorId,
    pub(crate) kind: OpKind,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) outputs: Vec<TensorId>,
    pub(crate) predecessors: BTreeSet<OperatorId>,
    pub(crate) successors: BTreeSet<OperatorId>,
}

impl Operator {
    pub(crate) fn new(guid: OperatorId, kind: OpKind, inputs: Vec<TensorId>, outputs: Vec<TensorId>) -> Self {
        Self {
            guid,
            kind,
            inputs,
            outputs,
            predecessors: BTreeSet::new(),
            successors: BTreeSet::new(),
        }
    }

    pub fn guid(&self) -> OperatorId {
        self.guid
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn op_type(&self) -> OpType {
        self.kind.op_type()
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn predecessors(&self) -> impl Iterator<Item = OperatorId> + '_ {
        self.predecessors.iter().copied()
    }

    pub fn successors(&self) -> impl Iterator<Item = OperatorId> + '_ {
        self.successors.iter().copied()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let input = |i: usize| self.inputs.get(i).map_or(-1, |t| t.0 as i64);
        let output = |i: usize| self.outputs.get(i).map_or(-1, |t| t.0 as i64);
        match &self.kind {
            OpKind::MatMul(attrs) => write!(
                f,
                "Matmul([{},{}],A={},B={},C={})",
                if attrs.trans_a { "A^T" } else { "A" },
                if attrs.trans_b { "B^T" } else { "B" },
                input(0),
                input(1),
                output(0)
            ),
            OpKind::Transpose(attrs) => write!(
                f,
                "Transpose(perm={:?},input={},output={})",
                attrs.permute,
                input(0),
                output(0)
            ),
            OpKind::Relu => write!(f, "Relu(input={},output={})", input(0), output(0)),
            OpKind::Add => write!(f, "Add(A={},B={},C={})", input(0), input(1), output(0)),
        }
    }
}
