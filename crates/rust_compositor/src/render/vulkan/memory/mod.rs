//! GPU memory: type classification and allocation
//!
//! Memory types are chosen once per usage category at startup. Every buffer
//! and image then gets its own allocation of that type, except transient
//! frame buffers which may be packed into one shared block.

mod allocator;
mod classifier;

pub use allocator::{
    pack_offsets, GpuBuffer, GpuImage, MemoryAllocator, MemoryBlock, TransientBuffers, TransientSizes,
};
pub use classifier::{select_memory_type, MemoryType, MemoryTypes, MemoryUsage};
