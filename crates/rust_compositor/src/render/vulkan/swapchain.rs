//! Vulkan swapchain management
//!
//! Handles swapchain creation and recreation, the per-image views,
//! framebuffers and semaphores, and resize bookkeeping.

use super::sync::Semaphore;
use super::{Queue, Surface, VulkanContext, VulkanError, VulkanResult};
use crate::config::PresentModePreference;
use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device};

/// Pick the surface format, preferring 8-bit BGRA in sRGB color space
///
/// Returns `None` only for an empty list.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|sf| sf.format == vk::Format::B8G8R8A8_UNORM && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

/// Honor the preference when offered, otherwise FIFO which every surface supports
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], preference: PresentModePreference) -> vk::PresentModeKHR {
    let wanted = match preference {
        PresentModePreference::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentModePreference::Fifo => vk::PresentModeKHR::FIFO,
        PresentModePreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
    };
    if modes.contains(&wanted) {
        wanted
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Use the surface's fixed extent, or clamp the requested one to its limits
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more image than the minimum, within the surface maximum (0 = unbounded)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

/// Views carry premultiplied alpha; fall back to opaque composition
pub fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&mode| supported.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// One presentable image and everything bound to it
pub struct SwapchainImage {
    /// Image owned by the swapchain
    pub image: vk::Image,
    /// Color view of the image
    pub view: vk::ImageView,
    /// Framebuffer wrapping the view
    pub framebuffer: vk::Framebuffer,
    /// Set until the first layout transition out of UNDEFINED was recorded
    pub needs_initial_transition: bool,
    /// Signaled when the image was acquired
    pub acquire: Semaphore,
    /// Signaled when rendering into the image finished
    pub render_finished: Semaphore,
}

/// Result of asking for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquiredImage {
    /// Image ready to render into
    Ready {
        /// Index into the swapchain images
        index: u32,
        /// The swapchain still works but should be recreated
        suboptimal: bool,
    },
    /// The swapchain no longer matches the surface
    OutOfDate,
}

/// Swapchain management wrapper with RAII cleanup
pub struct Swapchain {
    device: Device,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    images: Vec<SwapchainImage>,
    spare_acquire: Semaphore,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain, retiring `old` if given
    ///
    /// `format` must come from the surface's format list and match `render_pass`.
    pub fn new(
        context: &VulkanContext,
        surface: &Surface,
        format: vk::SurfaceFormatKHR,
        render_pass: vk::RenderPass,
        present_mode: PresentModePreference,
        requested: vk::Extent2D,
        old: Option<&Self>,
    ) -> VulkanResult<Self> {
        let physical_device = context.physical_device.device;
        let caps = surface.capabilities(physical_device)?;
        let present_mode = choose_present_mode(&surface.present_modes(physical_device)?, present_mode);
        let extent = choose_extent(&caps, requested);
        let image_count = choose_image_count(&caps);
        let device = context.raw_device();
        let loader = context.swapchain_loader()?.clone();

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(choose_composite_alpha(caps.supported_composite_alpha))
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |old| old.swapchain));

        let swapchain = unsafe {
            loader
                .create_swapchain(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let mut this = Self {
            spare_acquire: Semaphore::new(device.clone())?,
            device,
            loader,
            swapchain,
            images: Vec::new(),
            format,
            extent,
        };

        let images = unsafe {
            this.loader
                .get_swapchain_images(swapchain)
                .map_err(VulkanError::Api)?
        };
        for image in images {
            let image = this.wrap_image(image, render_pass)?;
            this.images.push(image);
        }

        log::debug!(
            "Created swapchain {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            this.images.len(),
            format.format,
            present_mode
        );
        Ok(this)
    }

    fn wrap_image(&self, image: vk::Image, render_pass: vk::RenderPass) -> VulkanResult<SwapchainImage> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe {
            self.device
                .create_image_view(&view_info, None)
                .map_err(VulkanError::Api)?
        };

        let attachments = [view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(self.extent.width)
            .height(self.extent.height)
            .layers(1);
        let framebuffer = match unsafe { self.device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                unsafe { self.device.destroy_image_view(view, None) };
                return Err(VulkanError::Api(e));
            }
        };

        let semaphores = Semaphore::new(self.device.clone())
            .and_then(|acquire| Ok((acquire, Semaphore::new(self.device.clone())?)));
        match semaphores {
            Ok((acquire, render_finished)) => Ok(SwapchainImage {
                image,
                view,
                framebuffer,
                needs_initial_transition: true,
                acquire,
                render_finished,
            }),
            Err(e) => {
                unsafe {
                    self.device.destroy_framebuffer(framebuffer, None);
                    self.device.destroy_image_view(view, None);
                }
                Err(e)
            }
        }
    }

    /// Wait for the next image
    ///
    /// On success the image's `acquire` semaphore is the one the presentation
    /// engine signals.
    pub fn acquire_next_image(&mut self) -> VulkanResult<AcquiredImage> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, self.spare_acquire.handle(), vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => {
                let image = self
                    .images
                    .get_mut(index as usize)
                    .ok_or_else(|| VulkanError::InvalidOperation {
                        reason: format!("acquired image index {index} out of range"),
                    })?;
                std::mem::swap(&mut image.acquire, &mut self.spare_acquire);
                Ok(AcquiredImage::Ready { index, suboptimal })
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquiredImage::OutOfDate),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    /// Queue `index` for presentation once its render-finished semaphore signals
    ///
    /// Returns true when the swapchain should be recreated.
    pub fn present(&self, queue: Queue, index: u32) -> VulkanResult<bool> {
        let image = self.image(index)?;
        let wait = [image.render_finished.handle()];
        let swapchains = [self.swapchain];
        let indices = [index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);

        match unsafe { self.loader.queue_present(queue.handle, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    /// Image at `index`
    pub fn image(&self, index: u32) -> VulkanResult<&SwapchainImage> {
        self.images
            .get(index as usize)
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: format!("swapchain image {index} out of range"),
            })
    }

    /// Mutable image at `index`
    pub fn image_mut(&mut self, index: u32) -> VulkanResult<&mut SwapchainImage> {
        self.images
            .get_mut(index as usize)
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: format!("swapchain image {index} out of range"),
            })
    }

    /// Get swapchain extent
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Get surface format
    pub const fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Number of presentable images
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for image in &self.images {
                self.device.destroy_framebuffer(image.framebuffer, None);
                self.device.destroy_image_view(image.view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Tracks the surface size the swapchain should have
///
/// A request only schedules recreation when it changes the target size, so
/// repeating the same size is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeState {
    current: (u32, u32),
    pending: Option<(u32, u32)>,
}

impl ResizeState {
    /// The swapchain must be created before the first repaint
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            current: (width, height),
            pending: Some((width, height)),
        }
    }

    /// Ask for a new surface size; returns whether recreation was scheduled
    pub fn request(&mut self, width: u32, height: u32) -> bool {
        if self.target() == (width, height) {
            return false;
        }
        self.pending = Some((width, height));
        true
    }

    /// Recreate at the current size, after a suboptimal or out-of-date result
    pub fn schedule_recreate(&mut self) {
        if self.pending.is_none() {
            self.pending = Some(self.current);
        }
    }

    /// Whether recreation is scheduled
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Size the swapchain should end up with
    pub fn target(&self) -> (u32, u32) {
        self.pending.unwrap_or(self.current)
    }

    /// Consume the scheduled size, which becomes current
    pub fn take(&mut self) -> Option<(u32, u32)> {
        let pending = self.pending.take()?;
        self.current = pending;
        Some(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_surface_format_preference() {
        let formats = [format(vk::Format::R8G8B8A8_UNORM), format(vk::Format::B8G8R8A8_UNORM)];
        assert_eq!(choose_surface_format(&formats), Some(formats[1]));
        assert_eq!(choose_surface_format(&formats[..1]), Some(formats[0]));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn test_present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&modes, PresentModePreference::Mailbox),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&modes, PresentModePreference::Immediate),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn test_extent_and_image_count() {
        let limits = caps(2, 3);
        let requested = vk::Extent2D {
            width: 8000,
            height: 0,
        };
        assert_eq!(choose_extent(&limits, requested), vk::Extent2D { width: 4096, height: 1 });
        assert_eq!(choose_image_count(&limits), 3);
        assert_eq!(choose_image_count(&caps(3, 0)), 4);
        assert_eq!(choose_image_count(&caps(2, 2)), 2);

        let mut fixed = limits;
        fixed.current_extent = vk::Extent2D { width: 640, height: 480 };
        assert_eq!(choose_extent(&fixed, requested), fixed.current_extent);
    }

    #[test]
    fn test_composite_alpha() {
        assert_eq!(
            choose_composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED),
            vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
        );
        assert_eq!(
            choose_composite_alpha(vk::CompositeAlphaFlagsKHR::INHERIT),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }

    #[test]
    fn test_initial_state_needs_swapchain() {
        let mut resize = ResizeState::new(800, 600);
        assert!(resize.is_pending());
        assert_eq!(resize.take(), Some((800, 600)));
        assert!(!resize.is_pending());
    }

    #[test]
    fn test_same_size_twice_recreates_once() {
        let mut resize = ResizeState::new(800, 600);
        resize.take();

        let mut recreations = 0;
        for _ in 0..2 {
            resize.request(1024, 768);
            if resize.take().is_some() {
                recreations += 1;
            }
        }
        assert_eq!(recreations, 1);
    }

    #[test]
    fn test_repeated_request_before_repaint() {
        let mut resize = ResizeState::new(800, 600);
        resize.take();

        assert!(!resize.request(800, 600));
        assert!(resize.request(1024, 768));
        assert!(!resize.request(1024, 768));
        assert_eq!(resize.target(), (1024, 768));
        assert_eq!(resize.take(), Some((1024, 768)));
        assert_eq!(resize.take(), None);
    }

    #[test]
    fn test_suboptimal_schedules_current_size() {
        let mut resize = ResizeState::new(800, 600);
        resize.take();
        resize.schedule_recreate();
        assert_eq!(resize.take(), Some((800, 600)));

        // A pending resize keeps its target
        resize.request(640, 480);
        resize.schedule_recreate();
        assert_eq!(resize.take(), Some((640, 480)));
    }
}
