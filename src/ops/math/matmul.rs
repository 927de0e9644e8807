use crate::ops::tensor::Shape;

/// Attributes of a (batched) matrix multiplication `C = op(A) x op(B)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatMulAttrs {
    /// Treat A as transposed over its last two axes
    pub trans_a: bool,
    /// Treat B as transposed over its last two axes
    pub trans_b: bool,
}

impl MatMulAttrs {
    pub fn new(trans_a: bool, trans_b: bool) -> Self {
        Self { trans_a, trans_b }
    }

    /// Infer the output shape from the shapes of A and B.
    ///
    /// Both inputs must have the same rank (at least 2) and agree on the
    /// contracted dimension once the transpose flags are applied. The output
    /// keeps A's leading axes and row count and takes B's column count.
    pub fn infer_shape(&self, a: &[usize], b: &[usize]) -> Option<Shape> {
        let rank = a.len();
        if rank < 2 || b.len() != rank {
            return None;
        }

        let mut a_shape = a.to_vec();
        let mut b_shape = b.to_vec();
        if self.trans_a {
            a_shape.swap(rank - 1, rank - 2);
        }
        if self.trans_b {
            b_shape.swap(rank - 1, rank - 2);
        }

        if a_shape[rank - 1] != b_shape[rank - 2] {
            return None;
        }

        let mut output = a_shape;
        output[rank - 1] = b_shape[rank - 1];
        Some(output)
    }
}
