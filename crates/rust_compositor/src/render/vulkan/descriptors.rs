//! Descriptor set layout and a growable descriptor allocator
//!
//! Frames each own one descriptor set for their whole life. Sets come from a
//! list of fixed-size pools; when the newest pool is exhausted another one is
//! created, so the frame pool can grow without a preset limit.

use super::{VulkanError, VulkanResult};
use ash::{vk, Device};

#[derive(Debug, Clone)]
enum BindingKind {
    ImmutableSampler(vk::Sampler),
    UniformBuffer,
    SampledImages(u32),
}

/// Descriptor set layout builder for creating reusable layouts
#[derive(Debug, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<(u32, BindingKind, vk::ShaderStageFlags)>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new descriptor set layout builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sampler baked into the layout
    #[must_use]
    pub fn add_immutable_sampler(mut self, binding: u32, sampler: vk::Sampler, stage_flags: vk::ShaderStageFlags) -> Self {
        self.bindings.push((binding, BindingKind::ImmutableSampler(sampler), stage_flags));
        self
    }

    /// Add a uniform buffer binding
    #[must_use]
    pub fn add_uniform_buffer(mut self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.bindings.push((binding, BindingKind::UniformBuffer, stage_flags));
        self
    }

    /// Add an array of sampled images
    #[must_use]
    pub fn add_sampled_images(mut self, binding: u32, count: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.bindings.push((binding, BindingKind::SampledImages(count), stage_flags));
        self
    }

    /// Build the descriptor set layout
    pub fn build(self, device: &Device) -> VulkanResult<DescriptorSetLayout> {
        let samplers: Vec<[vk::Sampler; 1]> = self
            .bindings
            .iter()
            .map(|(_, kind, _)| match kind {
                BindingKind::ImmutableSampler(sampler) => [*sampler],
                _ => [vk::Sampler::null()],
            })
            .collect();

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = self
            .bindings
            .iter()
            .zip(&samplers)
            .map(|((binding, kind, stages), sampler)| {
                let builder = vk::DescriptorSetLayoutBinding::builder()
                    .binding(*binding)
                    .stage_flags(*stages);
                match kind {
                    BindingKind::ImmutableSampler(_) => builder
                        .descriptor_type(vk::DescriptorType::SAMPLER)
                        .immutable_samplers(sampler)
                        .build(),
                    BindingKind::UniformBuffer => builder
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .descriptor_count(1)
                        .build(),
                    BindingKind::SampledImages(count) => builder
                        .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                        .descriptor_count(*count)
                        .build(),
                }
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = unsafe {
            device
                .create_descriptor_set_layout(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(DescriptorSetLayout {
            device: device.clone(),
            layout,
        })
    }
}

/// Descriptor set layout with RAII cleanup
pub struct DescriptorSetLayout {
    device: Device,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Get the layout handle
    pub const fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

struct PoolSlot {
    pool: vk::DescriptorPool,
    allocated: u32,
}

/// Allocates compositor descriptor sets from an expanding list of pools
pub struct DescriptorAllocator {
    device: Device,
    pools: Vec<PoolSlot>,
    sets_per_pool: u32,
    textures_per_set: u32,
}

impl DescriptorAllocator {
    /// Create an allocator; the first pool is made on first use
    pub fn new(device: Device, sets_per_pool: u32, textures_per_set: u32) -> Self {
        Self {
            device,
            pools: Vec::new(),
            sets_per_pool: sets_per_pool.max(1),
            textures_per_set,
        }
    }

    /// Number of pools created so far
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Allocate one set with `layout`
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> VulkanResult<vk::DescriptorSet> {
        let needs_pool = self
            .pools
            .last()
            .map_or(true, |slot| slot.allocated >= self.sets_per_pool);
        if needs_pool {
            let pool = self.create_pool()?;
            self.pools.push(PoolSlot { pool, allocated: 0 });
            log::debug!("Created descriptor pool #{}", self.pools.len());
        }

        let slot = self.pools.last_mut().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "descriptor pool list is empty".to_string(),
        })?;
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(slot.pool)
            .set_layouts(&layouts);

        let set = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(VulkanError::Api)?
        };
        slot.allocated += 1;

        set.into_iter().next().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "driver returned no descriptor set".to_string(),
        })
    }

    fn create_pool(&self) -> VulkanResult<vk::DescriptorPool> {
        let sets = self.sets_per_pool;
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: sets * self.textures_per_set,
            },
        ];

        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(sets)
            .pool_sizes(&pool_sizes);

        unsafe {
            self.device
                .create_descriptor_pool(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        for slot in self.pools.drain(..) {
            unsafe {
                self.device.destroy_descriptor_pool(slot.pool, None);
            }
        }
    }
}

/// Point a frame's set at its uniform buffer and texture views
///
/// `image_views` must hold exactly as many entries as the layout's texture array.
pub fn write_frame_descriptors(
    device: &Device,
    set: vk::DescriptorSet,
    uniform: vk::Buffer,
    uniform_size: vk::DeviceSize,
    image_views: &[vk::ImageView],
) {
    let buffer_info = [vk::DescriptorBufferInfo {
        buffer: uniform,
        offset: 0,
        range: uniform_size,
    }];
    let image_infos: Vec<vk::DescriptorImageInfo> = image_views
        .iter()
        .map(|&view| vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        })
        .collect();

    let writes = [
        vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(1)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info)
            .build(),
        vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(2)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(&image_infos)
            .build(),
    ];

    unsafe {
        device.update_descriptor_sets(&writes, &[]);
    }
}
