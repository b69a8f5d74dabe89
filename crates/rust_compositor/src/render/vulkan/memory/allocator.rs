//! Dedicated and packed GPU allocations
//!
//! Every resource owns its [`MemoryBlock`] outright. The one exception is a
//! packed set of transient frame buffers, which share a reference-counted
//! block and are bound at aligned offsets inside it.

use super::classifier::{MemoryType, MemoryTypes, MemoryUsage};
use crate::config::TransientAllocation;
use crate::render::vulkan::{VulkanContext, VulkanError, VulkanResult};
use ash::{vk, Device};
use std::ptr::NonNull;
use std::rc::Rc;

/// One device memory allocation, persistently mapped when host-visible
pub struct MemoryBlock {
    device: Device,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type: MemoryType,
    mapped: Option<NonNull<u8>>,
    atom_size: vk::DeviceSize,
}

impl MemoryBlock {
    fn allocate(
        device: &Device,
        size: vk::DeviceSize,
        memory_type: MemoryType,
        atom_size: vk::DeviceSize,
        map: bool,
    ) -> VulkanResult<Self> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type.index);

        let memory = unsafe {
            device
                .allocate_memory(&alloc_info, None)
                .map_err(VulkanError::Api)?
        };

        let mut block = Self {
            device: device.clone(),
            memory,
            size,
            memory_type,
            mapped: None,
            atom_size: atom_size.max(1),
        };

        if map && memory_type.is_host_visible() {
            let ptr = unsafe {
                device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .map_err(VulkanError::Api)?
            };
            block.mapped = NonNull::new(ptr.cast::<u8>());
        }

        Ok(block)
    }

    /// Device memory handle
    pub const fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Allocation size in bytes
    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Memory type the block was allocated from
    pub const fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// Whether the block has a persistent CPU mapping
    pub const fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Copy `data` into the mapping at `offset`, flushing if the memory is not coherent
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> VulkanResult<()> {
        let base = self.mapped_range_start(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.as_ptr(), data.len());
        }

        if !self.memory_type.is_host_coherent() {
            let range = self.atom_aligned_range(offset, data.len());
            unsafe {
                self.device
                    .flush_mapped_memory_ranges(&[range])
                    .map_err(VulkanError::Api)?;
            }
        }
        Ok(())
    }

    /// Copy `len` bytes out of the mapping at `offset`
    pub fn read(&self, offset: vk::DeviceSize, len: usize) -> VulkanResult<Vec<u8>> {
        let base = self.mapped_range_start(offset, len)?;

        if !self.memory_type.is_host_coherent() {
            let range = self.atom_aligned_range(offset, len);
            unsafe {
                self.device
                    .invalidate_mapped_memory_ranges(&[range])
                    .map_err(VulkanError::Api)?;
            }
        }

        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(base.as_ptr(), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    fn mapped_range_start(&self, offset: vk::DeviceSize, len: usize) -> VulkanResult<NonNull<u8>> {
        let mapped = self.mapped.ok_or_else(|| VulkanError::InvalidOperation {
            reason: "memory block is not host-visible".to_string(),
        })?;

        let end = offset.checked_add(len as vk::DeviceSize);
        if end.map_or(true, |end| end > self.size) {
            return Err(VulkanError::InvalidOperation {
                reason: format!("range {offset}+{len} exceeds block of {} bytes", self.size),
            });
        }

        // In bounds of the mapping, checked above
        Ok(unsafe { NonNull::new_unchecked(mapped.as_ptr().add(offset as usize)) })
    }

    fn atom_aligned_range(&self, offset: vk::DeviceSize, len: usize) -> vk::MappedMemoryRange {
        let start = offset / self.atom_size * self.atom_size;
        let end = align_up(offset + len as vk::DeviceSize, self.atom_size).min(self.size);
        vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(start)
            .size(end - start)
            .build()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.take().is_some() {
                self.device.unmap_memory(self.memory);
            }
            self.device.free_memory(self.memory, None);
        }
    }
}

enum Backing {
    Dedicated(MemoryBlock),
    Packed(Rc<MemoryBlock>),
}

impl Backing {
    fn block(&self) -> &MemoryBlock {
        match self {
            Self::Dedicated(block) => block,
            Self::Packed(block) => block.as_ref(),
        }
    }
}

/// A buffer bound to memory it owns or shares
pub struct GpuBuffer {
    device: Device,
    buffer: vk::Buffer,
    usage: MemoryUsage,
    size: vk::DeviceSize,
    offset: vk::DeviceSize,
    backing: Backing,
}

impl GpuBuffer {
    /// Buffer handle
    pub const fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Usage category
    pub const fn usage(&self) -> MemoryUsage {
        self.usage
    }

    /// Requested size in bytes
    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Offset of the buffer inside its memory block
    pub const fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    /// Whether the buffer can be written from the CPU
    pub fn is_mapped(&self) -> bool {
        self.backing.block().is_mapped()
    }

    /// Whether the backing block is shared with other buffers
    pub const fn is_packed(&self) -> bool {
        matches!(self.backing, Backing::Packed(_))
    }

    /// Write `data` at `offset` bytes into the buffer
    pub fn write_at(&self, offset: vk::DeviceSize, data: &[u8]) -> VulkanResult<()> {
        if offset + data.len() as vk::DeviceSize > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "write of {} bytes at {offset} overflows {:?} buffer of {} bytes",
                    data.len(),
                    self.usage,
                    self.size
                ),
            });
        }
        self.backing.block().write(self.offset + offset, data)
    }

    /// Write `data` at the start of the buffer
    pub fn write(&self, data: &[u8]) -> VulkanResult<()> {
        self.write_at(0, data)
    }

    /// Read back the first `len` bytes
    pub fn read(&self, len: usize) -> VulkanResult<Vec<u8>> {
        if len as vk::DeviceSize > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: format!("read of {len} bytes overflows buffer of {} bytes", self.size),
            });
        }
        self.backing.block().read(self.offset, len)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
        }
    }
}

/// A sampled image with its own unmapped allocation
pub struct GpuImage {
    device: Device,
    image: vk::Image,
    format: vk::Format,
    extent: vk::Extent2D,
    _memory: MemoryBlock,
}

impl GpuImage {
    /// Image handle
    pub const fn handle(&self) -> vk::Image {
        self.image
    }

    /// Pixel format
    pub const fn format(&self) -> vk::Format {
        self.format
    }

    /// Size in pixels
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image(self.image, None);
        }
    }
}

/// Buffer that is created but not yet bound; destroyed if binding never happens
struct UnboundBuffer {
    device: Device,
    buffer: vk::Buffer,
    usage: MemoryUsage,
    size: vk::DeviceSize,
    requirements: vk::MemoryRequirements,
}

impl UnboundBuffer {
    fn bind(mut self, backing: Backing, offset: vk::DeviceSize) -> VulkanResult<GpuBuffer> {
        unsafe {
            self.device
                .bind_buffer_memory(self.buffer, backing.block().handle(), offset)
                .map_err(VulkanError::Api)?;
        }

        let buffer = std::mem::replace(&mut self.buffer, vk::Buffer::null());
        Ok(GpuBuffer {
            device: self.device.clone(),
            buffer,
            usage: self.usage,
            size: self.size,
            offset,
            backing,
        })
    }
}

impl Drop for UnboundBuffer {
    fn drop(&mut self) {
        if self.buffer != vk::Buffer::null() {
            unsafe {
                self.device.destroy_buffer(self.buffer, None);
            }
        }
    }
}

/// Byte sizes of the three per-frame buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransientSizes {
    /// Vertex buffer size
    pub vertex: vk::DeviceSize,
    /// Index buffer size
    pub index: vk::DeviceSize,
    /// Uniform buffer size
    pub uniform: vk::DeviceSize,
}

/// Per-frame vertex, index and uniform buffers
pub struct TransientBuffers {
    /// Quad vertices
    pub vertex: GpuBuffer,
    /// Quad indices
    pub index: GpuBuffer,
    /// Orthographic transform
    pub uniform: GpuBuffer,
}

impl TransientBuffers {
    /// Whether all three buffers can be written directly
    pub fn is_host_visible(&self) -> bool {
        self.vertex.is_mapped() && self.index.is_mapped() && self.uniform.is_mapped()
    }
}

/// Lay out sub-allocations back to back, each at its required alignment
///
/// Returns the offset of every entry and the total block size.
///
/// # Panics
///
/// Panics if an alignment is not a power of two.
pub fn pack_offsets(requirements: &[vk::MemoryRequirements]) -> (Vec<vk::DeviceSize>, vk::DeviceSize) {
    let mut cursor: vk::DeviceSize = 0;
    let offsets = requirements
        .iter()
        .map(|req| {
            let alignment = req.alignment.max(1);
            assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
            let offset = align_up(cursor, alignment);
            cursor = offset + req.size;
            offset
        })
        .collect();
    (offsets, cursor)
}

const fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Creates buffers and images backed by classified memory types
pub struct MemoryAllocator {
    device: Device,
    types: MemoryTypes,
    atom_size: vk::DeviceSize,
    image_families: Vec<u32>,
}

impl MemoryAllocator {
    /// Probe memory types for the context's device
    pub fn new(context: &VulkanContext) -> VulkanResult<Self> {
        let device = context.raw_device();
        let types = MemoryTypes::probe(&device, &context.physical_device.memory_properties)?;

        let mut image_families = vec![context.graphics_queue().family];
        if context.transfer_queue().family != context.graphics_queue().family {
            image_families.push(context.transfer_queue().family);
        }

        Ok(Self {
            device,
            types,
            atom_size: context.physical_device.properties.limits.non_coherent_atom_size,
            image_families,
        })
    }

    /// Classified memory types
    pub const fn memory_types(&self) -> &MemoryTypes {
        &self.types
    }

    /// Device the allocations are made on
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Allocate a dedicated buffer of a usage category
    pub fn alloc_buffer(&self, usage: MemoryUsage, size: vk::DeviceSize) -> VulkanResult<GpuBuffer> {
        let unbound = self.create_unbound(usage, size)?;
        let memory_type = self.checked_type(usage, &unbound.requirements);
        let block = MemoryBlock::allocate(
            &self.device,
            unbound.requirements.size,
            memory_type,
            self.atom_size,
            true,
        )?;
        unbound.bind(Backing::Dedicated(block), 0)
    }

    /// Host-visible buffer used as a transfer source
    pub fn alloc_staging_buffer(&self, size: vk::DeviceSize) -> VulkanResult<GpuBuffer> {
        self.alloc_buffer(MemoryUsage::Staging, size)
    }

    /// Uniform buffer
    pub fn alloc_uniform_buffer(&self, size: vk::DeviceSize) -> VulkanResult<GpuBuffer> {
        self.alloc_buffer(MemoryUsage::Uniform, size)
    }

    /// Vertex buffer
    pub fn alloc_vertex_buffer(&self, size: vk::DeviceSize) -> VulkanResult<GpuBuffer> {
        self.alloc_buffer(MemoryUsage::Vertex, size)
    }

    /// Index buffer
    pub fn alloc_index_buffer(&self, size: vk::DeviceSize) -> VulkanResult<GpuBuffer> {
        self.alloc_buffer(MemoryUsage::Index, size)
    }

    /// Release a buffer and, unless it is packed with others, its memory
    pub fn free_buffer(&self, buffer: GpuBuffer) {
        log::trace!("Freeing {:?} buffer of {} bytes", buffer.usage(), buffer.size());
        drop(buffer);
    }

    /// Allocate an unmapped 2D image that can be filled by a transfer and sampled
    pub fn alloc_texture(&self, width: u32, height: u32, format: vk::Format) -> VulkanResult<GpuImage> {
        let sharing_mode = if self.image_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };
        let extent = vk::Extent2D { width, height };
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(sharing_mode)
            .queue_family_indices(&self.image_families)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            self.device
                .create_image(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory_type = self.checked_type(MemoryUsage::Texture, &requirements);

        let bound = MemoryBlock::allocate(&self.device, requirements.size, memory_type, self.atom_size, false)
            .and_then(|block| unsafe {
                self.device
                    .bind_image_memory(image, block.handle(), 0)
                    .map(|()| block)
                    .map_err(VulkanError::Api)
            });

        match bound {
            Ok(memory) => Ok(GpuImage {
                device: self.device.clone(),
                image,
                format,
                extent,
                _memory: memory,
            }),
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                Err(e)
            }
        }
    }

    /// Allocate the vertex, index and uniform buffers of one frame
    ///
    /// With [`TransientAllocation::Packed`] the three share one block when the
    /// device has a memory type all of them accept; otherwise each gets its own.
    pub fn alloc_transient(
        &self,
        strategy: TransientAllocation,
        sizes: TransientSizes,
    ) -> VulkanResult<TransientBuffers> {
        match (strategy, self.types.transient()) {
            (TransientAllocation::Packed, Some(memory_type)) => self.alloc_packed(memory_type, sizes),
            _ => Ok(TransientBuffers {
                vertex: self.alloc_vertex_buffer(sizes.vertex)?,
                index: self.alloc_index_buffer(sizes.index)?,
                uniform: self.alloc_uniform_buffer(sizes.uniform)?,
            }),
        }
    }

    fn alloc_packed(&self, memory_type: MemoryType, sizes: TransientSizes) -> VulkanResult<TransientBuffers> {
        let vertex = self.create_unbound(MemoryUsage::Vertex, sizes.vertex)?;
        let index = self.create_unbound(MemoryUsage::Index, sizes.index)?;
        let uniform = self.create_unbound(MemoryUsage::Uniform, sizes.uniform)?;

        let requirements = [vertex.requirements, index.requirements, uniform.requirements];
        for req in &requirements {
            assert!(
                req.memory_type_bits & (1 << memory_type.index) != 0,
                "transient buffer rejects packed memory type {}",
                memory_type.index
            );
        }

        let (offsets, total) = pack_offsets(&requirements);
        let block = Rc::new(MemoryBlock::allocate(&self.device, total, memory_type, self.atom_size, true)?);
        log::trace!("Packed transient block of {total} bytes at offsets {offsets:?}");

        Ok(TransientBuffers {
            vertex: vertex.bind(Backing::Packed(Rc::clone(&block)), offsets[0])?,
            index: index.bind(Backing::Packed(Rc::clone(&block)), offsets[1])?,
            uniform: uniform.bind(Backing::Packed(block), offsets[2])?,
        })
    }

    fn create_unbound(&self, usage: MemoryUsage, size: vk::DeviceSize) -> VulkanResult<UnboundBuffer> {
        let buffer_usage = usage.buffer_usage().ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("{usage:?} memory cannot back a buffer"),
        })?;

        // Zero-sized buffers are invalid; an empty scene still gets a valid binding
        let size = size.max(1);
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(buffer_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        Ok(UnboundBuffer {
            device: self.device.clone(),
            buffer,
            usage,
            size,
            requirements,
        })
    }

    /// Classified type for `usage`, checked against a real resource's requirements
    fn checked_type(&self, usage: MemoryUsage, requirements: &vk::MemoryRequirements) -> MemoryType {
        let memory_type = self.types.get(usage);
        assert!(
            requirements.memory_type_bits & (1 << memory_type.index) != 0,
            "{usage:?} resource rejects its classified memory type {}",
            memory_type.index
        );
        memory_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(size: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits: !0,
        }
    }

    #[test]
    fn test_pack_offsets_respects_alignment() {
        let (offsets, total) = pack_offsets(&[req(100, 16), req(36, 4), req(48, 256)]);
        assert_eq!(offsets, vec![0, 100, 256]);
        assert_eq!(total, 304);
    }

    #[test]
    fn test_pack_offsets_tight_when_aligned() {
        let (offsets, total) = pack_offsets(&[req(64, 64), req(64, 64), req(64, 64)]);
        assert_eq!(offsets, vec![0, 64, 128]);
        assert_eq!(total, 192);
    }

    #[test]
    fn test_pack_offsets_empty() {
        let (offsets, total) = pack_offsets(&[]);
        assert!(offsets.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn test_packed_ranges_never_overlap() {
        let requirements = [req(7, 8), req(1, 1), req(33, 32), req(5, 4)];
        let (offsets, total) = pack_offsets(&requirements);
        for (i, (&offset, r)) in offsets.iter().zip(&requirements).enumerate() {
            assert_eq!(offset % r.alignment, 0);
            if let Some(&next) = offsets.get(i + 1) {
                assert!(offset + r.size <= next);
            } else {
                assert_eq!(offset + r.size, total);
            }
        }
    }

    #[test]
    #[should_panic(expected = "not a power of two")]
    fn test_pack_offsets_rejects_odd_alignment() {
        let _ = pack_offsets(&[req(4, 3)]);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 4), 68);
    }
}
