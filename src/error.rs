use thiserror::Error;

use crate::ops::registry::OperatorId;
use crate::ops::tensor::TensorId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid planner configuration: {0}")]
    ConfigError(#[from] serde_json::Error),

    #[error("Invalid alignment {0}: must be a non-zero power of two")]
    InvalidAlignment(usize),

    #[error("Allocator buffer is already materialized; the free-block map is frozen")]
    AllocatorMaterialized,

    #[error("Invalid free: {0}")]
    InvalidFree(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Unknown tensor {0}")]
    UnknownTensor(TensorId),

    #[error("Unknown operator {0}")]
    UnknownOperator(OperatorId),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Dangling edge: {0}")]
    DanglingEdge(String),

    #[error("Graph contains a cycle and cannot be topologically sorted")]
    CyclicGraph,

    #[error("Shape inference failed for operator {0}")]
    ShapeInference(OperatorId),

    #[error("Operator {op} inferred {inferred} output shapes but has {outputs} outputs")]
    ArityMismatch {
        op: OperatorId,
        inferred: usize,
        outputs: usize,
    },

    #[error("Shape mismatch for tensor {tensor}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        tensor: TensorId,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Invalid operator: {0}")]
    InvalidOperator(String),
}
