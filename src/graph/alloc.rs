use log::debug;

use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::ops::tensor::{DataBlob, Tensor};

impl Graph {
    /// Plan and bind storage for every tensor.
    ///
    /// Tensors are packed back to back, in creation order, into one
    /// allocation; the allocator's buffer is then materialized and each
    /// tensor is bound to its region. No lifetime-based reuse is attempted.
    pub fn data_malloc(&mut self) -> Result<()> {
        if !self.topo_sort() {
            return Err(Error::CyclicGraph);
        }

        let total = self
            .tensors
            .values()
            .map(Tensor::bytes)
            .try_fold(0usize, usize::checked_add)
            .ok_or_else(|| Error::OutOfMemory("total tensor footprint exceeds the address space".to_string()))?;
        let addr = self.allocator.alloc(total)?;
        let base = match self.allocator.get_ptr() {
            Ok(base) => base,
            Err(e) => {
                // Undo the reservation so a retry plans from the same state
                self.allocator.free(addr, total)?;
                return Err(e);
            }
        };

        let mut offset = addr;
        for tensor in self.tensors.values_mut() {
            debug!("tensor {} bound at offset {} ({} bytes)", tensor.fuid(), offset, tensor.bytes());
            tensor.set_data_blob(DataBlob::new(base, offset));
            offset += tensor.bytes();
        }

        self.allocator.info();
        Ok(())
    }
}
