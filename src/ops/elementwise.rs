use crate::ops::tensor::Shape;

/// Unary element-wise ops keep their input shape
pub fn unary_shape(input: &[usize]) -> Option<Shape> {
    Some(input.to_vec())
}

/// Binary element-wise ops require identical shapes; no broadcasting
pub fn binary_shape(lhs: &[usize], rhs: &[usize]) -> Option<Shape> {
    if lhs == rhs {
        Some(lhs.to_vec())
    } else {
        None
    }
}
