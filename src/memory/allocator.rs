use std::collections::BTreeMap;
use std::ptr::NonNull;

use log::{info, trace};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::memory::runtime::{MemoryBlock, Runtime};

/// Lifecycle of the allocator's arena
#[derive(Debug)]
enum Phase {
    /// Offsets are being planned; no physical memory exists yet
    Planning,
    /// The buffer has been obtained from the runtime; the layout is frozen
    Materialized(MemoryBlock),
}

/// Snapshot of allocator state for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorReport {
    pub used: usize,
    pub peak: usize,
    pub alignment: usize,
    pub free_blocks: Vec<(usize, usize)>,
    pub materialized: bool,
}

/// Single-shot arena allocator.
///
/// Offsets are planned against a virtual arena using best-fit search over an
/// address-ordered free map with coalescing on free. The arena's high-water mark
/// (`peak`) is the size of the one real buffer requested from the runtime by
/// [`Allocator::get_ptr`]. After that call `alloc` and `free` are rejected.
#[derive(Debug)]
pub struct Allocator {
    runtime: Box<dyn Runtime>,
    /// Bytes held by live allocations
    used: usize,
    /// Current extent of the arena
    peak: usize,
    alignment: usize,
    /// Free block start address -> size. Entries never overlap or touch.
    free_blocks: BTreeMap<usize, usize>,
    phase: Phase,
}

impl Allocator {
    /// Create an allocator that will materialize its buffer from `runtime`
    pub fn new(runtime: Box<dyn Runtime>, alignment: usize) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment(alignment));
        }
        Ok(Self {
            runtime,
            used: 0,
            peak: 0,
            alignment,
            free_blocks: BTreeMap::new(),
            phase: Phase::Planning,
        })
    }

    fn ensure_planning(&self) -> Result<()> {
        match self.phase {
            Phase::Planning => Ok(()),
            Phase::Materialized(_) => Err(Error::AllocatorMaterialized),
        }
    }

    /// Reserve `size` bytes and return the offset of the reservation
    pub fn alloc(&mut self, size: usize) -> Result<usize> {
        self.ensure_planning()?;
        let size = self.aligned_size(size)?;
        if size == 0 {
            return Ok(self.peak);
        }

        let addr = if let Some((start, len)) = self.best_fit(size) {
            self.free_blocks.remove(&start);
            if len > size {
                self.free_blocks.insert(start + size, len - size);
            }
            start
        } else {
            // Extend the last free block past the current peak, or grow from it
            let start = self.trailing_block().unwrap_or(self.peak);
            if start.checked_add(size).is_none() {
                return Err(Error::OutOfMemory(format!(
                    "{} bytes at offset {} exceed the address space",
                    size, start
                )));
            }
            self.free_blocks.remove(&start);
            start
        };

        self.used += size;
        self.peak = self.peak.max(addr + size);
        trace!("alloc {} bytes at {} (used {}, peak {})", size, addr, self.used, self.peak);
        Ok(addr)
    }

    /// Smallest free block that can hold `size`; the lowest address wins ties
    fn best_fit(&self, size: usize) -> Option<(usize, usize)> {
        self.free_blocks
            .iter()
            .filter(|&(_, &len)| len >= size)
            .min_by_key(|&(_, &len)| len)
            .map(|(&start, &len)| (start, len))
    }

    /// Start of the highest free block if it ends exactly at `peak`
    fn trailing_block(&self) -> Option<usize> {
        self.free_blocks
            .iter()
            .next_back()
            .filter(|&(&start, &len)| start + len == self.peak)
            .map(|(&start, _)| start)
    }

    /// Return a reservation made by `alloc`
    pub fn free(&mut self, addr: usize, size: usize) -> Result<()> {
        self.ensure_planning()?;
        let size = self.aligned_size(size)?;
        if size == 0 {
            return Ok(());
        }
        if addr.checked_add(size).map_or(true, |end| end > self.peak) {
            return Err(Error::InvalidFree(format!(
                "range [{}, +{}) extends past the arena peak {}",
                addr, size, self.peak
            )));
        }
        if size > self.used {
            return Err(Error::InvalidFree(format!(
                "freeing {} bytes but only {} are in use",
                size, self.used
            )));
        }

        let mut start = addr;
        let mut len = self.free_blocks.remove(&addr).unwrap_or(0) + size;

        if let Some((&prev_start, &prev_len)) = self.free_blocks.range(..addr).next_back() {
            if prev_start + prev_len == addr {
                self.free_blocks.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free_blocks.remove(&(start + len)) {
            len += next_len;
        }

        if start + len == self.peak {
            // Trailing free space goes back to the arena instead of the free map
            self.peak = start;
        } else {
            self.free_blocks.insert(start, len);
        }

        self.used -= size;
        trace!("free {} bytes at {} (used {}, peak {})", size, addr, self.used, self.peak);
        Ok(())
    }

    /// Materialize the arena, requesting `peak` bytes from the runtime on the first call
    pub fn get_ptr(&mut self) -> Result<NonNull<u8>> {
        if let Phase::Materialized(block) = &self.phase {
            return Ok(block.ptr());
        }
        let block = self.runtime.allocate(self.peak)?;
        info!("Allocator really alloc: {:p} {} bytes", block.ptr().as_ptr(), self.peak);
        let ptr = block.ptr();
        self.phase = Phase::Materialized(block);
        Ok(ptr)
    }

    /// Least multiple of the alignment that is >= `size`
    pub fn aligned_size(&self, size: usize) -> Result<usize> {
        size.div_ceil(self.alignment)
            .checked_mul(self.alignment)
            .ok_or_else(|| Error::OutOfMemory(format!("request of {} bytes cannot be aligned", size)))
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.phase, Phase::Materialized(_))
    }

    /// Free blocks as `(start, size)` in address order
    pub fn free_blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free_blocks.iter().map(|(&start, &len)| (start, len))
    }

    /// Log current usage
    pub fn info(&self) {
        info!("Used memory: {}, peak memory: {}", self.used, self.peak);
    }

    pub fn report(&self) -> AllocatorReport {
        AllocatorReport {
            used: self.used,
            peak: self.peak,
            alignment: self.alignment,
            free_blocks: self.free_blocks().collect(),
            materialized: self.is_materialized(),
        }
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if let Phase::Materialized(block) = std::mem::replace(&mut self.phase, Phase::Planning) {
            self.runtime.release(block);
        }
    }
}
