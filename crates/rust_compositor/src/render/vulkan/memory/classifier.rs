//! One-time memory type classification
//!
//! Drivers list memory types best first, so for each usage category we walk a
//! short list of required property sets (most desirable first) and take the
//! first compatible type that satisfies the current set.

use crate::render::vulkan::{VulkanError, VulkanResult};
use ash::{vk, Device};

const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
const DEVICE_LOCAL_HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::DEVICE_LOCAL.as_raw() | vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw(),
);
const ANY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::empty();

/// Written once by the CPU, read once by the GPU: avoid a copy if possible
const STREAM_REQUIREMENTS: [vk::MemoryPropertyFlags; 3] = [DEVICE_LOCAL_HOST_VISIBLE, HOST_VISIBLE, ANY];
/// At least one host-visible type always exists
const STAGING_REQUIREMENTS: [vk::MemoryPropertyFlags; 1] = [HOST_VISIBLE];
const TEXTURE_REQUIREMENTS: [vk::MemoryPropertyFlags; 1] = [ANY];

/// Resource usage categories, each with its own memory type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// CPU-written source of transfers
    Staging,
    /// Per-frame uniform data
    Uniform,
    /// Per-frame vertex data
    Vertex,
    /// Per-frame index data
    Index,
    /// Sampled images
    Texture,
}

impl MemoryUsage {
    /// Every category
    pub const ALL: [Self; 5] = [Self::Staging, Self::Uniform, Self::Vertex, Self::Index, Self::Texture];

    /// Buffer usage flags real resources of this category are created with
    ///
    /// `None` for textures, which are images.
    pub fn buffer_usage(self) -> Option<vk::BufferUsageFlags> {
        match self {
            Self::Staging => Some(vk::BufferUsageFlags::TRANSFER_SRC),
            Self::Uniform => Some(vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST),
            Self::Vertex => Some(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST),
            Self::Index => Some(vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST),
            Self::Texture => None,
        }
    }

    /// Required property sets, most desirable first
    pub const fn requirements(self) -> &'static [vk::MemoryPropertyFlags] {
        match self {
            Self::Staging => &STAGING_REQUIREMENTS,
            Self::Uniform | Self::Vertex | Self::Index => &STREAM_REQUIREMENTS,
            Self::Texture => &TEXTURE_REQUIREMENTS,
        }
    }
}

/// Pick the first type compatible with `type_bits` that meets a requirement set
///
/// Requirement sets are tried in order; within a set the device's own type
/// order decides.
pub fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    requirements: &[vk::MemoryPropertyFlags],
) -> Option<u32> {
    let count = props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    requirements.iter().find_map(|&required| {
        (0..count).find(|&index| {
            type_bits & (1 << index) != 0
                && props.memory_types[index as usize].property_flags.contains(required)
        })
    })
}

/// A classified memory type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// Index into the device's memory type table
    pub index: u32,
    /// Property flags of that type
    pub flags: vk::MemoryPropertyFlags,
}

impl MemoryType {
    /// CPU can map this memory
    pub fn is_host_visible(self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Mapped writes are visible without explicit flushes
    pub fn is_host_coherent(self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

/// The memory type chosen for each usage category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypes {
    staging: MemoryType,
    uniform: MemoryType,
    vertex: MemoryType,
    index: MemoryType,
    texture: MemoryType,
    transient: Option<MemoryType>,
}

impl MemoryTypes {
    /// Classify from a memory table and the compatible-type bitmask of each category
    ///
    /// # Panics
    ///
    /// Panics if a category has no acceptable type. The weakest requirement of
    /// every category is satisfiable on any conforming device.
    pub fn classify(props: &vk::PhysicalDeviceMemoryProperties, type_bits: impl Fn(MemoryUsage) -> u32) -> Self {
        let pick = |usage: MemoryUsage, bits: u32| {
            let index = select_memory_type(props, bits, usage.requirements())
                .unwrap_or_else(|| panic!("no memory type satisfies {usage:?} (compatible bits {bits:#b})"));
            MemoryType {
                index,
                flags: props.memory_types[index as usize].property_flags,
            }
        };

        let uniform_bits = type_bits(MemoryUsage::Uniform);
        let vertex_bits = type_bits(MemoryUsage::Vertex);
        let index_bits = type_bits(MemoryUsage::Index);

        // Packing needs one type every transient buffer can live in
        let transient = select_memory_type(props, uniform_bits & vertex_bits & index_bits, &STREAM_REQUIREMENTS)
            .map(|index| MemoryType {
                index,
                flags: props.memory_types[index as usize].property_flags,
            });

        Self {
            staging: pick(MemoryUsage::Staging, type_bits(MemoryUsage::Staging)),
            uniform: pick(MemoryUsage::Uniform, uniform_bits),
            vertex: pick(MemoryUsage::Vertex, vertex_bits),
            index: pick(MemoryUsage::Index, index_bits),
            texture: pick(MemoryUsage::Texture, type_bits(MemoryUsage::Texture)),
            transient,
        }
    }

    /// Probe the device with dummy resources created with the real usage flags
    ///
    /// Memory requirements are identical for every resource created with the
    /// same usage (and, for images, the same tiling), so a one-byte buffer or
    /// a 1x1 image answers for all later allocations.
    pub fn probe(device: &Device, props: &vk::PhysicalDeviceMemoryProperties) -> VulkanResult<Self> {
        let mut bits = [0u32; MemoryUsage::ALL.len()];
        for (slot, usage) in bits.iter_mut().zip(MemoryUsage::ALL) {
            *slot = match usage.buffer_usage() {
                Some(buffer_usage) => dummy_buffer_type_bits(device, buffer_usage)?,
                None => dummy_image_type_bits(device)?,
            };
        }

        let types = Self::classify(props, |usage| {
            MemoryUsage::ALL
                .iter()
                .position(|&u| u == usage)
                .map_or(0, |i| bits[i])
        });

        for usage in MemoryUsage::ALL {
            let chosen = types.get(usage);
            log::info!("[MEMORY] {:?} -> type {} ({:?})", usage, chosen.index, chosen.flags);
        }
        match types.transient {
            Some(chosen) => log::info!("[MEMORY] packed transient -> type {}", chosen.index),
            None => log::info!("[MEMORY] no shared type for packed transient buffers"),
        }

        Ok(types)
    }

    /// Memory type for a usage category
    pub const fn get(&self, usage: MemoryUsage) -> MemoryType {
        match usage {
            MemoryUsage::Staging => self.staging,
            MemoryUsage::Uniform => self.uniform,
            MemoryUsage::Vertex => self.vertex,
            MemoryUsage::Index => self.index,
            MemoryUsage::Texture => self.texture,
        }
    }

    /// Type shared by vertex, index and uniform buffers, if any
    pub const fn transient(&self) -> Option<MemoryType> {
        self.transient
    }
}

fn dummy_buffer_type_bits(device: &Device, usage: vk::BufferUsageFlags) -> VulkanResult<u32> {
    let create_info = vk::BufferCreateInfo::builder()
        .size(1)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    unsafe {
        let buffer = device
            .create_buffer(&create_info, None)
            .map_err(VulkanError::Api)?;
        let requirements = device.get_buffer_memory_requirements(buffer);
        device.destroy_buffer(buffer, None);
        Ok(requirements.memory_type_bits)
    }
}

fn dummy_image_type_bits(device: &Device) -> VulkanResult<u32> {
    let create_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::R8_UNORM)
        .extent(vk::Extent3D {
            width: 1,
            height: 1,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    unsafe {
        let image = device
            .create_image(&create_info, None)
            .map_err(VulkanError::Api)?;
        let requirements = device.get_image_memory_requirements(image);
        device.destroy_image(image, None);
        Ok(requirements.memory_type_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    fn memory_table(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    /// Discrete GPU without a device-local mappable type
    fn discrete_table() -> vk::PhysicalDeviceMemoryProperties {
        memory_table(&[DEVICE_LOCAL, HOST_VISIBLE | COHERENT, HOST_VISIBLE | COHERENT | vk::MemoryPropertyFlags::HOST_CACHED])
    }

    #[test]
    fn test_first_requirement_wins() {
        let props = memory_table(&[DEVICE_LOCAL, HOST_VISIBLE | COHERENT, DEVICE_LOCAL | HOST_VISIBLE | COHERENT]);
        assert_eq!(select_memory_type(&props, 0b111, &STREAM_REQUIREMENTS), Some(2));
    }

    #[test]
    fn test_falls_through_to_weaker_requirement() {
        assert_eq!(select_memory_type(&discrete_table(), 0b111, &STREAM_REQUIREMENTS), Some(1));
        // Only the device-local type is compatible
        assert_eq!(select_memory_type(&discrete_table(), 0b001, &STREAM_REQUIREMENTS), Some(0));
    }

    #[test]
    fn test_respects_compatibility_bits() {
        assert_eq!(select_memory_type(&discrete_table(), 0b100, &STAGING_REQUIREMENTS), Some(2));
        assert_eq!(select_memory_type(&discrete_table(), 0b001, &STAGING_REQUIREMENTS), None);
    }

    #[test]
    fn test_ignores_types_beyond_count() {
        let mut props = discrete_table();
        props.memory_types[5].property_flags = DEVICE_LOCAL_HOST_VISIBLE;
        assert_eq!(select_memory_type(&props, 1 << 5, &STREAM_REQUIREMENTS), None);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let props = discrete_table();
        let bits = |usage: MemoryUsage| match usage {
            MemoryUsage::Texture => 0b001,
            _ => 0b111,
        };

        let first = MemoryTypes::classify(&props, bits);
        for _ in 0..10 {
            assert_eq!(MemoryTypes::classify(&props, bits), first);
        }

        assert_eq!(first.get(MemoryUsage::Staging).index, 1);
        assert_eq!(first.get(MemoryUsage::Vertex).index, 1);
        assert_eq!(first.get(MemoryUsage::Texture).index, 0);
        assert!(first.get(MemoryUsage::Uniform).is_host_visible());
        assert!(!first.get(MemoryUsage::Texture).is_host_visible());
        assert_eq!(first.transient().map(|t| t.index), Some(1));
    }

    #[test]
    fn test_transient_absent_without_shared_type() {
        let props = discrete_table();
        let types = MemoryTypes::classify(&props, |usage| match usage {
            MemoryUsage::Vertex => 0b010,
            MemoryUsage::Index => 0b100,
            _ => 0b111,
        });
        assert_eq!(types.transient(), None);
        assert_eq!(types.get(MemoryUsage::Index).index, 2);
    }

    #[test]
    #[should_panic(expected = "no memory type satisfies Staging")]
    fn test_unsatisfiable_staging_panics() {
        let props = memory_table(&[DEVICE_LOCAL]);
        let _ = MemoryTypes::classify(&props, |_| 0b1);
    }
}
