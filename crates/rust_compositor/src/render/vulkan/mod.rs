//! Vulkan backend
//!
//! RAII wrappers over `ash`, the memory layer, the frame pool and the
//! presenter that ties them together.

pub mod commands;
pub mod context;
pub mod descriptors;
pub mod frame_pool;
pub mod memory;
pub mod pipeline;
pub mod presenter;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod uniform;

pub use commands::{ActiveRenderPass, CommandPool, CommandRecorder};
pub use context::{
    pick_transfer_family, LogicalDevice, PhysicalDeviceInfo, Queue, Surface, VulkanContext, VulkanError,
    VulkanInstance, VulkanResult,
};
pub use frame_pool::{FrameBackend, FrameContext, FrameFactory, FrameResourcePool, FrameState};
pub use memory::{GpuBuffer, GpuImage, MemoryAllocator, MemoryType, MemoryTypes, MemoryUsage};
pub use presenter::{RepaintOutcome, SurfacePresenter};
pub use swapchain::ResizeState;
pub use texture::{TextureDesc, TextureFormat};
pub use uniform::OrthoUniform;
