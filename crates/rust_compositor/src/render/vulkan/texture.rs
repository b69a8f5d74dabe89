//! Sampled textures and the texture registry
//!
//! Textures are uploaded once through a staging buffer on the transfer
//! queue, which is waited on before the call returns. Destroyed textures are
//! parked until every frame that may still sample them has completed.

use super::commands::CommandPool;
use super::memory::{GpuImage, MemoryAllocator};
use super::sync::BarrierBuilder;
use super::{Queue, VulkanError, VulkanResult};
use crate::render::TextureId;
use ash::{vk, Device};
use slotmap::SlotMap;
use std::collections::HashMap;
use std::hash::Hash;

/// Pixel layout of texture data handed to the presenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    /// Single coverage channel, sampled as white with that alpha
    R8,
    /// Four 8-bit channels, straight alpha
    Rgba8,
}

impl TextureFormat {
    /// Matching Vulkan format
    pub const fn vk_format(self) -> vk::Format {
        match self {
            Self::R8 => vk::Format::R8_UNORM,
            Self::Rgba8 => vk::Format::R8G8B8A8_UNORM,
        }
    }

    /// Bytes of one pixel
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::R8 => 1,
            Self::Rgba8 => 4,
        }
    }

    fn components(self) -> vk::ComponentMapping {
        match self {
            Self::R8 => vk::ComponentMapping {
                r: vk::ComponentSwizzle::ONE,
                g: vk::ComponentSwizzle::ONE,
                b: vk::ComponentSwizzle::ONE,
                a: vk::ComponentSwizzle::R,
            },
            Self::Rgba8 => vk::ComponentMapping::default(),
        }
    }
}

/// Pixels to upload
#[derive(Debug, Clone, Copy)]
pub struct TextureDesc<'a> {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bytes between the starts of two rows
    pub stride: u32,
    /// Pixel layout
    pub format: TextureFormat,
    /// Row data, at least `stride * (height - 1) + width * bpp` bytes
    pub data: &'a [u8],
}

impl<'a> TextureDesc<'a> {
    /// Tightly packed rows
    pub const fn packed(width: u32, height: u32, format: TextureFormat, data: &'a [u8]) -> Self {
        Self {
            width,
            height,
            stride: width * format.bytes_per_pixel(),
            format,
            data,
        }
    }

    /// Bytes the upload reads from `data`
    pub const fn required_len(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        (self.stride as usize) * (self.height as usize - 1)
            + (self.width as usize) * (self.format.bytes_per_pixel() as usize)
    }

    /// Reject descriptions the copy cannot express
    pub fn validate(&self) -> VulkanResult<()> {
        let bpp = self.format.bytes_per_pixel();
        let invalid = |reason: String| Err(VulkanError::InvalidOperation { reason });

        if self.width == 0 || self.height == 0 {
            return invalid(format!("texture size {}x{} is empty", self.width, self.height));
        }
        if self.stride < self.width * bpp {
            return invalid(format!("stride {} shorter than a {}-pixel row", self.stride, self.width));
        }
        if self.stride % bpp != 0 {
            return invalid(format!("stride {} is not a whole number of pixels", self.stride));
        }
        if self.data.len() < self.required_len() {
            return invalid(format!(
                "texture data holds {} bytes, {} required",
                self.data.len(),
                self.required_len()
            ));
        }
        Ok(())
    }
}

/// Image, view and memory of one uploaded texture
pub struct Texture {
    view: vk::ImageView,
    image: GpuImage,
    device: Device,
}

impl Texture {
    /// Upload `desc` and block until the transfer queue is idle
    pub fn upload(
        allocator: &MemoryAllocator,
        pool: &CommandPool,
        queue: Queue,
        desc: &TextureDesc<'_>,
    ) -> VulkanResult<Self> {
        desc.validate()?;

        let data = &desc.data[..desc.required_len()];
        let staging = allocator.alloc_staging_buffer(data.len() as vk::DeviceSize)?;
        staging.write(data)?;

        let image = allocator.alloc_texture(desc.width, desc.height, desc.format.vk_format())?;

        let mut recorder = pool.begin_single_time()?;
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            &[],
            &[BarrierBuilder::undefined_to_transfer_dst(image.handle())],
        );
        recorder.copy_buffer_to_image(
            staging.handle(),
            image.handle(),
            vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: desc.stride / desc.format.bytes_per_pixel(),
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: 1,
                },
            },
        );
        // Transfer-only queues cannot name fragment stages; the wait below orders the read
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            &[],
            &[BarrierBuilder::transfer_dst_to_shader_read(image.handle())],
        );
        pool.submit_single_time(queue, recorder)?;
        allocator.free_buffer(staging);

        let device = allocator.device().clone();
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image.handle())
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format.vk_format())
            .components(desc.format.components())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe {
            device
                .create_image_view(&view_info, None)
                .map_err(VulkanError::Api)?
        };

        log::debug!("Uploaded {:?} texture {}x{}", desc.format, desc.width, desc.height);
        Ok(Self { view, image, device })
    }

    /// View bound into descriptor sets
    pub const fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Size in pixels
    pub const fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
        }
    }
}

/// Items released once the submission serial they were retired at completes
#[derive(Debug)]
pub struct RetireQueue<T> {
    entries: Vec<(u64, T)>,
}

impl<T> Default for RetireQueue<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> RetireQueue<T> {
    /// Park `item` until serial `serial` has completed
    pub fn push(&mut self, serial: u64, item: T) {
        self.entries.push((serial, item));
    }

    /// Release everything retired at or before `completed`; returns how many
    pub fn collect(&mut self, completed: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(serial, _)| *serial > completed);
        before - self.entries.len()
    }

    /// Items still waiting
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Live textures, a default white texture, and textures awaiting release
pub struct TextureRegistry {
    textures: SlotMap<TextureId, Texture>,
    retired: RetireQueue<Texture>,
    default: Texture,
}

impl TextureRegistry {
    /// Create the registry and upload the 1x1 white default
    pub fn new(allocator: &MemoryAllocator, pool: &CommandPool, queue: Queue) -> VulkanResult<Self> {
        let white = [0xff_u8; 4];
        let default = Texture::upload(
            allocator,
            pool,
            queue,
            &TextureDesc::packed(1, 1, TextureFormat::Rgba8, &white),
        )?;
        Ok(Self {
            textures: SlotMap::with_key(),
            retired: RetireQueue::default(),
            default,
        })
    }

    /// Upload a new texture
    pub fn create(
        &mut self,
        allocator: &MemoryAllocator,
        pool: &CommandPool,
        queue: Queue,
        desc: &TextureDesc<'_>,
    ) -> VulkanResult<TextureId> {
        let texture = Texture::upload(allocator, pool, queue, desc)?;
        Ok(self.textures.insert(texture))
    }

    /// Stop handing out `id`; its memory lives on until `serial` completes
    ///
    /// Returns false for an unknown id.
    pub fn retire(&mut self, id: TextureId, serial: u64) -> bool {
        match self.textures.remove(id) {
            Some(texture) => {
                self.retired.push(serial, texture);
                true
            }
            None => false,
        }
    }

    /// Free retired textures whose last possible use has completed
    pub fn collect(&mut self, completed: u64) {
        let freed = self.retired.collect(completed);
        if freed > 0 {
            log::debug!("Released {freed} retired textures");
        }
    }

    /// Whether `id` names a live texture
    pub fn contains(&self, id: TextureId) -> bool {
        self.textures.contains_key(id)
    }

    /// View of a live texture
    pub fn view(&self, id: TextureId) -> Option<vk::ImageView> {
        self.textures.get(id).map(Texture::view)
    }

    /// View of the default white texture
    pub const fn default_view(&self) -> vk::ImageView {
        self.default.view()
    }

    /// Number of live textures
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    /// Whether no texture was created
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Number of textures awaiting release
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }
}

/// Result of [`assign_slots`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment<K> {
    /// Ids in slot order; entry `i` occupies slot `i + 1`
    pub textures: Vec<K>,
    /// Slot of every view
    pub slots: Vec<u32>,
    /// Views whose texture did not fit and fell back to slot 0
    pub overflowed: usize,
}

/// Map per-view texture ids onto the slots of a sampled-image array
///
/// Slot 0 holds the default texture and serves views without one. Every
/// distinct id gets the next free slot in first-use order; once `capacity`
/// slots are used the remaining ids fall back to slot 0.
pub fn assign_slots<K: Copy + Eq + Hash>(ids: &[Option<K>], capacity: usize) -> SlotAssignment<K> {
    let mut textures = Vec::new();
    let mut slot_of = HashMap::new();
    let mut overflowed = 0_usize;

    let slots = ids
        .iter()
        .map(|id| {
            let Some(id) = *id else { return 0 };
            if let Some(&slot) = slot_of.get(&id) {
                return slot;
            }
            if textures.len() + 1 >= capacity {
                overflowed += 1;
                return 0;
            }
            textures.push(id);
            let slot = textures.len() as u32;
            slot_of.insert(id, slot);
            slot
        })
        .collect();

    SlotAssignment {
        textures,
        slots,
        overflowed,
    }
}

/// Reports slot overflow when it changes instead of on every repaint
#[derive(Debug, Default)]
pub struct OverflowMonitor {
    last: usize,
}

impl OverflowMonitor {
    /// Record this repaint's overflow count; returns whether it changed
    pub fn observe(&mut self, overflowed: usize, capacity: u32) -> bool {
        if overflowed == self.last {
            return false;
        }
        if overflowed > 0 {
            log::warn!("{overflowed} views exceed the {capacity} texture slots and use the default texture");
        } else {
            log::info!("All views fit in the {capacity} texture slots again");
        }
        self.last = overflowed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_validation() {
        let pixels = [0_u8; 64];
        assert!(TextureDesc::packed(4, 4, TextureFormat::Rgba8, &pixels).validate().is_ok());
        assert!(TextureDesc::packed(8, 8, TextureFormat::R8, &pixels).validate().is_ok());
        assert!(TextureDesc::packed(0, 4, TextureFormat::R8, &pixels).validate().is_err());
        assert!(TextureDesc::packed(5, 4, TextureFormat::Rgba8, &pixels).validate().is_err());

        let short_stride = TextureDesc {
            stride: 12,
            ..TextureDesc::packed(4, 4, TextureFormat::Rgba8, &pixels)
        };
        assert!(short_stride.validate().is_err());

        let ragged = TextureDesc {
            stride: 18,
            ..TextureDesc::packed(4, 2, TextureFormat::Rgba8, &pixels)
        };
        assert!(ragged.validate().is_err());
    }

    #[test]
    fn test_padded_rows_need_no_trailing_padding() {
        // Three rows of 2 RGBA pixels, rows 16 bytes apart, last row unpadded
        let data = [0_u8; 16 * 2 + 8];
        let desc = TextureDesc {
            width: 2,
            height: 3,
            stride: 16,
            format: TextureFormat::Rgba8,
            data: &data,
        };
        assert_eq!(desc.required_len(), 40);
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_format_properties() {
        assert_eq!(TextureFormat::R8.vk_format(), vk::Format::R8_UNORM);
        assert_eq!(TextureFormat::Rgba8.bytes_per_pixel(), 4);
        assert_eq!(TextureFormat::R8.components().a, vk::ComponentSwizzle::R);
        assert_eq!(TextureFormat::R8.components().r, vk::ComponentSwizzle::ONE);
    }

    #[test]
    fn test_retire_queue_waits_for_serial() {
        let mut queue = RetireQueue::default();
        queue.push(3, "a");
        queue.push(5, "b");
        assert_eq!(queue.collect(2), 0);
        assert_eq!(queue.collect(3), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.collect(10), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_assign_slots_dedupes_in_first_use_order() {
        let ids = [Some('b'), None, Some('a'), Some('b'), Some('c')];
        let assignment = assign_slots(&ids, 8);
        assert_eq!(assignment.textures, vec!['b', 'a', 'c']);
        assert_eq!(assignment.slots, vec![1, 0, 2, 1, 3]);
        assert_eq!(assignment.overflowed, 0);
    }

    #[test]
    fn test_assign_slots_overflow_uses_default() {
        let ids = [Some(1), Some(2), Some(3), Some(1), Some(4)];
        let assignment = assign_slots(&ids, 3);
        assert_eq!(assignment.textures, vec![1, 2]);
        assert_eq!(assignment.slots, vec![1, 2, 0, 1, 0]);
        assert_eq!(assignment.overflowed, 2);
    }

    #[test]
    fn test_single_slot_sends_everything_to_default() {
        let ids = [Some(7), None, Some(8)];
        let assignment = assign_slots(&ids, 1);
        assert!(assignment.textures.is_empty());
        assert_eq!(assignment.slots, vec![0, 0, 0]);
        assert_eq!(assignment.overflowed, 2);
    }

    #[test]
    fn test_overflow_reported_only_on_change() {
        let mut monitor = OverflowMonitor::default();
        let ids = [Some(1), Some(2)];

        let changes: Vec<bool> = (0..100)
            .map(|_| monitor.observe(assign_slots(&ids, 1).overflowed, 1))
            .collect();
        assert!(changes[0]);
        assert!(changes[1..].iter().all(|&changed| !changed));

        assert!(monitor.observe(0, 1));
        assert!(!monitor.observe(0, 1));
        assert!(monitor.observe(3, 1));
    }
}
