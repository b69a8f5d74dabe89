//! Surface presenter
//!
//! Owns the swapchain and drives one repaint at a time: resize if needed,
//! acquire an image, flatten the scene into a recycled frame, record a
//! single render pass, submit and present.

use super::commands::{CommandPool, CommandRecorder};
use super::descriptors::{write_frame_descriptors, DescriptorAllocator, DescriptorSetLayout, DescriptorSetLayoutBuilder};
use super::frame_pool::{FrameContext, FrameFactory, FrameResourcePool};
use super::memory::{GpuBuffer, MemoryAllocator, TransientBuffers, TransientSizes};
use super::pipeline::{GraphicsPipeline, RenderPass, Sampler};
use super::swapchain::{choose_surface_format, AcquiredImage, ResizeState, Swapchain};
use super::sync::BarrierBuilder;
use super::texture::{assign_slots, OverflowMonitor, TextureDesc, TextureRegistry};
use super::uniform::OrthoUniform;
use super::{Surface, VulkanContext, VulkanError, VulkanResult};
use crate::config::{PresentModePreference, RendererConfig, TransientAllocation};
use crate::render::TextureId;
use crate::scene::{SceneGeometry, SceneGraph, SceneId, INDICES_PER_VIEW};
use ash::vk;

/// What a call to [`SurfacePresenter::repaint`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepaintOutcome {
    /// A frame was submitted and queued for presentation
    Presented,
    /// Nothing was drawn: the surface is empty or the swapchain went out of date
    Skipped,
}

/// Byte images of one frame's transient buffers
struct FrameData<'a> {
    vertices: &'a [u8],
    indices: &'a [u8],
    uniform: OrthoUniform,
}

impl FrameData<'_> {
    fn sizes(&self) -> TransientSizes {
        TransientSizes {
            vertex: self.vertices.len() as vk::DeviceSize,
            index: self.indices.len() as vk::DeviceSize,
            uniform: std::mem::size_of::<OrthoUniform>() as vk::DeviceSize,
        }
    }
}

/// Composites a scene into a window surface
///
/// Fields drop in declaration order; everything created from the device
/// goes before the surface and the context.
pub struct SurfacePresenter {
    frames: FrameResourcePool<FrameFactory>,
    textures: TextureRegistry,
    pipeline: GraphicsPipeline,
    set_layout: DescriptorSetLayout,
    _sampler: Sampler,
    swapchain: Option<Swapchain>,
    render_pass: RenderPass,
    transfer_pool: CommandPool,
    allocator: MemoryAllocator,
    resize: ResizeState,
    surface_format: vk::SurfaceFormatKHR,
    clear_color: [f32; 4],
    max_textures: u32,
    slot_overflow: OverflowMonitor,
    transient_allocation: TransientAllocation,
    present_mode: PresentModePreference,
    serial: u64,
    surface: Surface,
    context: VulkanContext,
}

impl SurfacePresenter {
    /// Set up everything a repaint needs except the swapchain
    ///
    /// The swapchain is created by the first repaint at `width`x`height`.
    pub fn new(
        context: VulkanContext,
        surface: Surface,
        config: &RendererConfig,
        width: u32,
        height: u32,
    ) -> VulkanResult<Self> {
        config
            .validate()
            .map_err(|e| VulkanError::InitializationFailed(e.to_string()))?;

        let device = context.raw_device();
        let info = &context.physical_device;
        let max_textures = Self::texture_slots(config.max_textures, info);

        let surface_format = choose_surface_format(&surface.formats(info.device)?)
            .ok_or_else(|| VulkanError::InitializationFailed("surface reports no formats".to_string()))?;

        let render_pass = RenderPass::new_composite_pass(device.clone(), surface_format.format)?;
        let sampler = Sampler::new_linear_clamped(device.clone())?;
        let set_layout = DescriptorSetLayoutBuilder::new()
            .add_immutable_sampler(0, sampler.handle(), vk::ShaderStageFlags::FRAGMENT)
            .add_uniform_buffer(1, vk::ShaderStageFlags::VERTEX)
            .add_sampled_images(2, max_textures, vk::ShaderStageFlags::FRAGMENT)
            .build(&device)?;
        let pipeline = GraphicsPipeline::new_composite(
            device.clone(),
            render_pass.handle(),
            &set_layout,
            &config.shaders,
            max_textures,
        )?;

        let allocator = MemoryAllocator::new(&context)?;
        let transfer_pool = CommandPool::new(device.clone(), context.transfer_queue().family)?;
        let textures = TextureRegistry::new(&allocator, &transfer_pool, context.transfer_queue())?;

        let descriptors = DescriptorAllocator::new(device.clone(), config.descriptor_sets_per_pool, max_textures);
        let factory = FrameFactory::new(
            device,
            context.graphics_queue().family,
            set_layout.handle(),
            descriptors,
        )?;

        log::info!(
            "Presenter ready: {:?}, {} texture slots, {:?} transient buffers",
            surface_format.format,
            max_textures,
            config.transient_allocation
        );

        Ok(Self {
            frames: FrameResourcePool::new(factory),
            textures,
            pipeline,
            set_layout,
            _sampler: sampler,
            swapchain: None,
            render_pass,
            transfer_pool,
            allocator,
            resize: ResizeState::new(width, height),
            surface_format,
            clear_color: config.clear_color,
            max_textures,
            slot_overflow: OverflowMonitor::default(),
            transient_allocation: config.transient_allocation,
            present_mode: config.present_mode,
            serial: 0,
            surface,
            context,
        })
    }

    /// Clamp the configured slot count to what the device can bind
    fn texture_slots(requested: u32, info: &super::PhysicalDeviceInfo) -> u32 {
        if info.features.shader_sampled_image_array_dynamic_indexing != vk::TRUE {
            log::warn!("Device cannot index sampled-image arrays; every view uses the default texture");
            return 1;
        }
        let limits = &info.properties.limits;
        let device_max = limits
            .max_per_stage_descriptor_sampled_images
            .min(limits.max_descriptor_set_sampled_images);
        if requested > device_max {
            log::warn!("Clamping {requested} texture slots to the device limit of {device_max}");
        }
        requested.clamp(1, device_max.max(1))
    }

    /// Upload a texture; blocks until the upload finished
    pub fn create_texture(&mut self, desc: &TextureDesc<'_>) -> VulkanResult<TextureId> {
        self.textures
            .create(&self.allocator, &self.transfer_pool, self.context.transfer_queue(), desc)
    }

    /// Drop a texture once no submitted frame can still sample it
    ///
    /// Views still pointing at it draw with the default texture. Returns
    /// false for an unknown id.
    pub fn destroy_texture(&mut self, id: TextureId) -> bool {
        self.textures.retire(id, self.serial)
    }

    /// Request a new surface size; returns whether a recreation was scheduled
    ///
    /// Requesting the size the swapchain already has, or already will have,
    /// does nothing.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        let scheduled = self.resize.request(width, height);
        if scheduled {
            log::debug!("Resize to {width}x{height} scheduled");
        }
        scheduled
    }

    /// Draw `scene` and queue it for presentation
    ///
    /// Scene errors are returned before a swapchain image is acquired and
    /// leave the presenter usable. Vulkan errors leave it unusable; the caller
    /// is expected to exit.
    pub fn repaint(&mut self, graph: &SceneGraph, scene: SceneId) -> VulkanResult<RepaintOutcome> {
        if self.resize.is_pending() && !self.recreate_swapchain()? {
            return Ok(RepaintOutcome::Skipped);
        }
        let Some(swapchain) = self.swapchain.as_mut() else {
            return Ok(RepaintOutcome::Skipped);
        };
        let extent = swapchain.extent();
        if extent.width == 0 || extent.height == 0 {
            return Ok(RepaintOutcome::Skipped);
        }

        // Scene errors must surface before an image is held
        let geometry = graph.traverse_and_emit(scene)?;

        let image_index = match swapchain.acquire_next_image()? {
            AcquiredImage::Ready { index, suboptimal } => {
                if suboptimal {
                    self.resize.schedule_recreate();
                }
                index
            }
            AcquiredImage::OutOfDate => {
                log::debug!("Swapchain out of date on acquire");
                self.resize.schedule_recreate();
                return Ok(RepaintOutcome::Skipped);
            }
        };

        if let Some(completed) = self.frames.completed_serial(self.serial)? {
            self.textures.collect(completed);
        }

        let (texture_slots, image_views) =
            Self::bind_textures(&self.textures, self.max_textures, &mut self.slot_overflow, &geometry);
        let data = FrameData {
            vertices: bytemuck::cast_slice(&geometry.vertices),
            indices: bytemuck::cast_slice(&geometry.indices),
            uniform: OrthoUniform::for_surface(extent.width, extent.height),
        };

        let frame = self.frames.acquire()?;
        let (transient, staging) = Self::fill_transient(&self.allocator, self.transient_allocation, &data)?;
        let device = self.allocator.device();
        write_frame_descriptors(
            device,
            frame.descriptor_set,
            transient.uniform.handle(),
            transient.uniform.size(),
            &image_views,
        );

        let mut recorder = CommandRecorder::new(frame.command_buffer, device.clone());
        recorder.begin()?;
        if let Some(staging) = &staging {
            Self::record_staging_copies(&mut recorder, staging, &transient, &data);
        }

        let image = swapchain.image_mut(image_index)?;
        if image.needs_initial_transition {
            recorder.pipeline_barrier(
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                &[],
                &[BarrierBuilder::undefined_to_present(image.image)],
            );
            image.needs_initial_transition = false;
        }

        let area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        {
            let mut pass = recorder.begin_render_pass(self.render_pass.handle(), image.framebuffer, area)?;
            pass.clear_color(self.clear_color, area);
            pass.set_viewport(vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            });
            pass.set_scissor(area);

            if !texture_slots.is_empty() {
                pass.bind_pipeline(self.pipeline.handle());
                pass.bind_descriptor_set(self.pipeline.layout(), frame.descriptor_set);
                pass.bind_vertex_buffer(transient.vertex.handle());
                pass.bind_index_buffer(transient.index.handle());
                for (view, slot) in texture_slots.iter().enumerate() {
                    pass.push_constants(
                        self.pipeline.layout(),
                        vk::ShaderStageFlags::FRAGMENT,
                        bytemuck::bytes_of(slot),
                    );
                    pass.draw_indexed(INDICES_PER_VIEW as u32, (view * INDICES_PER_VIEW) as u32);
                }
            }
        }
        let command_buffer = recorder.end()?;

        frame.transient = Some(transient);
        frame.staging = staging;
        let graphics = self.context.graphics_queue();
        Self::submit(device, graphics.handle, frame, command_buffer, image)?;
        self.serial += 1;
        frame.mark_submitted(self.serial);
        log::trace!(
            "Submitted frame {} with {} views to image {image_index}",
            self.serial,
            texture_slots.len()
        );

        if swapchain.present(graphics, image_index)? {
            log::debug!("Swapchain suboptimal or out of date on present");
            self.resize.schedule_recreate();
        }
        Ok(RepaintOutcome::Presented)
    }

    /// Per-view texture slots and the image view of every array slot
    fn bind_textures(
        textures: &TextureRegistry,
        max_textures: u32,
        overflow: &mut OverflowMonitor,
        geometry: &SceneGeometry,
    ) -> (Vec<u32>, Vec<vk::ImageView>) {
        let live: Vec<Option<TextureId>> = geometry
            .textures
            .iter()
            .map(|texture| texture.filter(|&id| textures.contains(id)))
            .collect();
        let assignment = assign_slots(&live, max_textures as usize);
        overflow.observe(assignment.overflowed, max_textures);

        let default = textures.default_view();
        let mut views = vec![default; max_textures as usize];
        for (slot, id) in views.iter_mut().skip(1).zip(assignment.textures) {
            *slot = textures.view(id).unwrap_or(default);
        }
        (assignment.slots, views)
    }

    /// Allocate the frame's buffers and fill them, directly or through staging
    fn fill_transient(
        allocator: &MemoryAllocator,
        strategy: TransientAllocation,
        data: &FrameData<'_>,
    ) -> VulkanResult<(TransientBuffers, Option<GpuBuffer>)> {
        let sizes = data.sizes();
        let transient = allocator.alloc_transient(strategy, sizes)?;

        if transient.is_host_visible() {
            transient.vertex.write(data.vertices)?;
            transient.index.write(data.indices)?;
            transient.uniform.write(data.uniform.as_bytes())?;
            return Ok((transient, None));
        }

        let staging = allocator.alloc_staging_buffer(sizes.vertex + sizes.index + sizes.uniform)?;
        staging.write_at(0, data.vertices)?;
        staging.write_at(sizes.vertex, data.indices)?;
        staging.write_at(sizes.vertex + sizes.index, data.uniform.as_bytes())?;
        Ok((transient, Some(staging)))
    }

    fn record_staging_copies(
        recorder: &mut CommandRecorder,
        staging: &GpuBuffer,
        transient: &TransientBuffers,
        data: &FrameData<'_>,
    ) {
        let sizes = data.sizes();
        let copies = [
            (&transient.vertex, 0, sizes.vertex),
            (&transient.index, sizes.vertex, sizes.index),
            (&transient.uniform, sizes.vertex + sizes.index, sizes.uniform),
        ];
        for (dst, src_offset, size) in copies {
            if size == 0 {
                continue;
            }
            recorder.copy_buffer(
                staging.handle(),
                dst.handle(),
                &[vk::BufferCopy {
                    src_offset,
                    dst_offset: 0,
                    size,
                }],
            );
        }
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::VERTEX_INPUT | vk::PipelineStageFlags::VERTEX_SHADER,
            &[BarrierBuilder::transfer_to_vertex_input()],
            &[],
        );
    }

    fn submit(
        device: &ash::Device,
        queue: vk::Queue,
        frame: &FrameContext,
        command_buffer: vk::CommandBuffer,
        image: &super::swapchain::SwapchainImage,
    ) -> VulkanResult<()> {
        let wait_semaphores = [image.acquire.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [image.render_finished.handle()];
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device
                .queue_submit(queue, &[submit_info.build()], frame.fence.handle())
                .map_err(VulkanError::Api)
        }
    }

    /// Rebuild the swapchain at the scheduled size
    ///
    /// Returns false while the target size is empty (minimized window); the
    /// request stays pending until a usable size arrives.
    fn recreate_swapchain(&mut self) -> VulkanResult<bool> {
        let (width, height) = self.resize.target();
        if width == 0 || height == 0 {
            return Ok(false);
        }
        self.resize.take();

        unsafe {
            self.context
                .device()
                .device
                .queue_wait_idle(self.context.graphics_queue().handle)
                .map_err(VulkanError::Api)?;
        }

        let swapchain = Swapchain::new(
            &self.context,
            &self.surface,
            self.surface_format,
            self.render_pass.handle(),
            self.present_mode,
            vk::Extent2D { width, height },
            self.swapchain.as_ref(),
        )?;
        self.swapchain = Some(swapchain);
        Ok(true)
    }

    /// Block until the GPU finished every submitted frame
    pub fn wait_idle(&self) -> VulkanResult<()> {
        self.context.wait_idle()
    }

    /// Current swapchain size, zero before the first repaint
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map_or_else(vk::Extent2D::default, Swapchain::extent)
    }

    /// Number of frame contexts the pool has grown to
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of live textures
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Texture slots each frame binds
    pub const fn max_textures(&self) -> u32 {
        self.max_textures
    }

    /// Descriptor set layout every frame uses
    pub const fn set_layout(&self) -> &DescriptorSetLayout {
        &self.set_layout
    }

    /// Underlying Vulkan context
    pub const fn context(&self) -> &VulkanContext {
        &self.context
    }
}

impl Drop for SurfacePresenter {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            log::error!("Failed to wait for device idle during presenter shutdown: {e}");
        }
    }
}
