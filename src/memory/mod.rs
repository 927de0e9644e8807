pub mod allocator;
pub mod runtime;

pub use allocator::{Allocator, AllocatorReport};

pub use runtime::{
    CpuRuntime,
    MemoryBlock,
    Runtime,
};
