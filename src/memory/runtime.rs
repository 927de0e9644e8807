use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt::Debug;
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// A physically backed memory region handed out by a `Runtime`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlock {
    /// Pointer to the start of the region
    ptr: NonNull<u8>,
    /// Size of the region in bytes
    size: usize,
    /// Alignment of the region
    alignment: usize,
}

impl MemoryBlock {
    /// Create a new memory block
    pub fn new(ptr: NonNull<u8>, size: usize, alignment: usize) -> Self {
        Self {
            ptr,
            size,
            alignment,
        }
    }

    /// Get a pointer to the memory block
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Get the size of the memory block
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the alignment of the memory block
    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

/// Device memory primitives the allocator materializes its buffer from
pub trait Runtime: Debug {
    /// Allocate `size` bytes of physical memory
    fn allocate(&mut self, size: usize) -> Result<MemoryBlock>;

    /// Return a block previously obtained from `allocate`
    fn release(&mut self, block: MemoryBlock);

    /// Bytes currently held by live blocks
    fn allocated_memory(&self) -> usize;
}

/// Host runtime backed by the Rust global allocator
#[derive(Debug)]
pub struct CpuRuntime {
    alignment: usize,
    memory_limit: Option<usize>,
    allocated: usize,
    allocations: HashMap<usize, Layout>,
}

impl CpuRuntime {
    /// Create a new CPU runtime
    pub fn new(alignment: usize, memory_limit: Option<usize>) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment(alignment));
        }
        Ok(Self {
            alignment,
            memory_limit,
            allocated: 0,
            allocations: HashMap::new(),
        })
    }

    fn release_all(&mut self) {
        for (ptr, layout) in self.allocations.drain() {
            unsafe {
                alloc::dealloc(ptr as *mut u8, layout);
            }
        }
        self.allocated = 0;
    }
}

impl Default for CpuRuntime {
    fn default() -> Self {
        Self {
            alignment: crate::config::DEFAULT_ALIGNMENT,
            memory_limit: None,
            allocated: 0,
            allocations: HashMap::new(),
        }
    }
}

impl Runtime for CpuRuntime {
    fn allocate(&mut self, size: usize) -> Result<MemoryBlock> {
        // Zero-sized layouts are not allowed by the global allocator
        let size = std::cmp::max(1, size);

        if let Some(limit) = self.memory_limit {
            if self.allocated.checked_add(size).map_or(true, |total| total > limit) {
                return Err(Error::OutOfMemory(format!(
                    "memory limit of {} bytes exceeded with allocation of {} bytes (current: {})",
                    limit, size, self.allocated
                )));
            }
        }

        let layout = Layout::from_size_align(size, self.alignment).map_err(|e| {
            Error::OutOfMemory(format!(
                "invalid memory layout: size={}, alignment={}, error={}",
                size, self.alignment, e
            ))
        })?;

        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::OutOfMemory(format!(
                "failed to allocate memory: size={}, alignment={}",
                size, self.alignment
            ))
        })?;

        self.allocated += size;
        self.allocations.insert(ptr.as_ptr() as usize, layout);

        Ok(MemoryBlock::new(ptr, size, self.alignment))
    }

    fn release(&mut self, block: MemoryBlock) {
        let key = block.ptr().as_ptr() as usize;
        if let Some(layout) = self.allocations.remove(&key) {
            unsafe {
                alloc::dealloc(block.ptr().as_ptr(), layout);
            }
            self.allocated -= layout.size();
        }
    }

    fn allocated_memory(&self) -> usize {
        self.allocated
    }
}

impl Drop for CpuRuntime {
    fn drop(&mut self) {
        self.release_all();
    }
}
