pub mod config;
pub mod error;
pub mod graph;
pub mod memory;
pub mod ops;
pub mod optimization;

// Re-export commonly used types
pub use config::{OptimizationLevel, PlannerOptions};
pub use error::{Error, Result};
pub use graph::Graph;
pub use memory::{Allocator, AllocatorReport, CpuRuntime, MemoryBlock, Runtime};
pub use ops::registry::{OpKind, OpType, Operator, OperatorId};
pub use ops::tensor::{DataBlob, DataType, Shape, Tensor, TensorId};
pub use optimization::graph_optimizer::{GraphOptimizer, OptimizationPass, OptimizationStats, PassResult};
pub use optimization::passes::fusion::{Rewrite, TransposeFusion};
