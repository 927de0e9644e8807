pub mod registry;
pub mod tensor;
pub mod transform;
pub mod elementwise;

pub use registry::{OpKind, OpType, Operator, OperatorId};
pub use tensor::{DataBlob, DataType, Shape, Tensor, TensorId};
pub use transform::TransposeAttrs;
pub use math::matmul::MatMulAttrs;

// Module files for math subdirectory
pub mod math {
    pub mod matmul;
}
