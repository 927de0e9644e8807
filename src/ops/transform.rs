use crate::ops::tensor::Shape;

/// Attributes of a Transpose: output axis `i` reads input axis `permute[i]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransposeAttrs {
    pub permute: Vec<usize>,
}

impl TransposeAttrs {
    pub fn new(permute: Vec<usize>) -> Self {
        Self { permute }
    }

    /// Permutation swapping the last two axes of a rank-`rank` tensor
    pub fn swap_last_two(rank: usize) -> Self {
        let mut permute: Vec<usize> = (0..rank).collect();
        if rank >= 2 {
            permute.swap(rank - 1, rank - 2);
        }
        Self { permute }
    }

    pub fn rank(&self) -> usize {
        self.permute.len()
    }

    /// Whether `permute` is a bijection on `0..rank`
    pub fn is_permutation(&self) -> bool {
        let mut seen = vec![false; self.permute.len()];
        for &axis in &self.permute {
            match seen.get_mut(axis) {
                Some(slot) if !*slot => *slot = true,
                _ => return false,
            }
        }
        true
    }

    pub fn is_identity(&self) -> bool {
        self.permute.iter().enumerate().all(|(i, &axis)| i == axis)
    }

    /// Fixes every leading axis and swaps exactly the last two
    pub fn swaps_last_two_axes(&self) -> bool {
        let rank = self.permute.len();
        rank >= 2
            && self.permute[..rank - 2].iter().enumerate().all(|(i, &axis)| i == axis)
            && self.permute[rank - 2] == rank - 1
            && self.permute[rank - 1] == rank - 2
    }

    /// Permutation equivalent to applying `self` and then `outer`.
    ///
    /// `composed[i] = self[outer[i]]`. Returns `None` when the ranks differ.
    pub fn then(&self, outer: &TransposeAttrs) -> Option<TransposeAttrs> {
        if self.rank() != outer.rank() {
            return None;
        }
        let permute = outer
            .permute
            .iter()
            .map(|&axis| self.permute.get(axis).copied())
            .collect::<Option<Vec<usize>>>()?;
        Some(TransposeAttrs { permute })
    }

    pub fn infer_shape(&self, input: &[usize]) -> Option<Shape> {
        if input.len() != self.permute.len() || !self.is_permutation() {
            return None;
        }
        Some(self.permute.iter().map(|&axis| input[axis]).collect())
    }
}
