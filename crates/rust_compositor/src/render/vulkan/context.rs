//! Vulkan context management
//!
//! Instance, surface, physical device selection and the logical device with
//! its graphics and transfer queues.

use crate::config::RendererConfig;
use crate::render::Window;
use crate::scene::SceneError;
use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface as SurfaceLoader, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};
use std::ffi::{CStr, CString};
use thiserror::Error;

const VALIDATION_LAYER: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Shader loading failed
    #[error("Shader error: {0}")]
    Shader(String),

    /// The scene handed to the presenter could not be traversed
    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create an instance with the given window-system extensions
    ///
    /// Pass an empty extension list for a headless instance. Validation is
    /// enabled according to the config and silently skipped when the layer
    /// is not installed.
    pub fn new(config: &RendererConfig, window_extensions: &[String]) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|e| VulkanError::InitializationFailed(format!("Invalid application name: {e}")))?;
        let engine_name = CString::new("RustCompositor")
            .map_err(|e| VulkanError::InitializationFailed(e.to_string()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        let validation = config.validation_enabled() && Self::has_validation_layer(&entry)?;
        if config.validation_enabled() && !validation {
            log::warn!("Validation requested but {VALIDATION_LAYER:?} is not installed");
        }

        let extension_names = window_extensions
            .iter()
            .map(|ext| CString::new(ext.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| VulkanError::InitializationFailed(format!("Invalid extension name: {e}")))?;
        let mut extensions: Vec<*const std::os::raw::c_char> =
            extension_names.iter().map(|ext| ext.as_ptr()).collect();
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layers: Vec<*const std::os::raw::c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let debug = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::info!(
            "Created Vulkan instance for '{}' (validation: {})",
            config.application_name,
            validation
        );

        Ok(Self {
            entry,
            instance,
            debug,
        })
    }

    fn has_validation_layer(entry: &Entry) -> VulkanResult<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .map_err(VulkanError::Api)?;
        Ok(layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER
        }))
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() || (*callback_data).p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*callback_data).p_message).to_string_lossy()
    };

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Window surface with RAII cleanup
///
/// Must be dropped before the instance it was created from.
pub struct Surface {
    loader: SurfaceLoader,
    handle: vk::SurfaceKHR,
}

impl Surface {
    /// Create a surface for a GLFW window
    pub fn from_window(instance: &VulkanInstance, window: &mut Window) -> VulkanResult<Self> {
        let handle = window
            .create_vulkan_surface(instance.instance.handle())
            .map_err(|e| VulkanError::InitializationFailed(format!("Surface creation: {e}")))?;

        Ok(Self {
            loader: SurfaceLoader::new(&instance.entry, &instance.instance),
            handle,
        })
    }

    /// Surface handle
    pub const fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Surface extension loader
    pub const fn loader(&self) -> &SurfaceLoader {
        &self.loader
    }

    /// Whether a queue family of `device` can present to this surface
    pub fn supports_family(&self, device: vk::PhysicalDevice, family: u32) -> VulkanResult<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(device, family, self.handle)
                .map_err(VulkanError::Api)
        }
    }

    /// Current capabilities for `device`
    pub fn capabilities(&self, device: vk::PhysicalDevice) -> VulkanResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(device, self.handle)
                .map_err(VulkanError::Api)
        }
    }

    /// Supported formats for `device`
    pub fn formats(&self, device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_formats(device, self.handle)
                .map_err(VulkanError::Api)
        }
    }

    /// Supported present modes for `device`
    pub fn present_modes(&self, device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_present_modes(device, self.handle)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heaps and types, best types first
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Index of the graphics (and present) queue family
    pub graphics_family: u32,
    /// Index of the queue family used for uploads
    pub transfer_family: u32,
}

impl PhysicalDeviceInfo {
    /// Select the first device with a graphics queue that can present to `surface`
    pub fn select_suitable_device(instance: &Instance, surface: Option<&Surface>) -> VulkanResult<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        for device in devices {
            match Self::evaluate_device(instance, device, surface) {
                Ok(info) => {
                    log::info!("Selected GPU: {}", info.name());
                    return Ok(info);
                }
                Err(e) => log::debug!("Skipping GPU {device:?}: {e}"),
            }
        }

        Err(VulkanError::InitializationFailed("No suitable GPU found".to_string()))
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: Option<&Surface>,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics_family = None;
        for (index, family) in (0u32..).zip(queue_families.iter()) {
            if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                continue;
            }
            let presents = match surface {
                Some(surface) => surface.supports_family(device, index)?,
                None => true,
            };
            if presents {
                graphics_family = Some(index);
                break;
            }
        }
        let graphics_family = graphics_family.ok_or_else(|| {
            VulkanError::InitializationFailed("No graphics queue family with present support".to_string())
        })?;

        if surface.is_some() && !Self::supports_swapchain(instance, device)? {
            return Err(VulkanError::InitializationFailed(
                "Required device extensions not supported".to_string(),
            ));
        }

        Ok(Self {
            device,
            properties,
            features,
            memory_properties,
            graphics_family,
            transfer_family: pick_transfer_family(&queue_families, graphics_family),
        })
    }

    fn supports_swapchain(instance: &Instance, device: vk::PhysicalDevice) -> VulkanResult<bool> {
        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        Ok(extensions.iter().any(|available| {
            let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
            name == SwapchainLoader::name()
        }))
    }

    /// Human readable device name
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Prefer a dedicated transfer family, then a compute family, then graphics
pub fn pick_transfer_family(families: &[vk::QueueFamilyProperties], graphics_family: u32) -> u32 {
    let find = |predicate: &dyn Fn(vk::QueueFlags) -> bool| {
        (0u32..)
            .zip(families.iter())
            .find(|(_, family)| family.queue_count > 0 && predicate(family.queue_flags))
            .map(|(index, _)| index)
    };

    find(&|flags| {
        flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    })
    .or_else(|| {
        find(&|flags| flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS))
    })
    .unwrap_or(graphics_family)
}

/// A device queue and the family it belongs to
#[derive(Debug, Clone, Copy)]
pub struct Queue {
    /// Queue family index
    pub family: u32,
    /// Queue handle
    pub handle: vk::Queue,
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics and presentation queue
    pub graphics_queue: Queue,
    /// Upload queue, may alias the graphics queue
    pub transfer_queue: Queue,
    /// Swapchain extension loader, absent on headless devices
    pub swapchain_loader: Option<SwapchainLoader>,
}

impl LogicalDevice {
    /// Create a new logical device with required queues
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
        with_swapchain: bool,
    ) -> VulkanResult<Self> {
        let mut families = vec![physical_device_info.graphics_family];
        if physical_device_info.transfer_family != physical_device_info.graphics_family {
            families.push(physical_device_info.transfer_family);
        }

        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extensions = if with_swapchain {
            vec![SwapchainLoader::name().as_ptr()]
        } else {
            Vec::new()
        };

        // Push constants index the texture array per draw
        let device_features = vk::PhysicalDeviceFeatures::builder()
            .shader_sampled_image_array_dynamic_indexing(
                physical_device_info.features.shader_sampled_image_array_dynamic_indexing == vk::TRUE,
            )
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&device_features);

        let device = unsafe {
            instance
                .create_device(physical_device_info.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue = Queue {
            family: physical_device_info.graphics_family,
            handle: unsafe { device.get_device_queue(physical_device_info.graphics_family, 0) },
        };
        let transfer_queue = Queue {
            family: physical_device_info.transfer_family,
            handle: unsafe { device.get_device_queue(physical_device_info.transfer_family, 0) },
        };

        let swapchain_loader = with_swapchain.then(|| SwapchainLoader::new(instance, &device));

        log::info!(
            "Created logical device (graphics family {}, transfer family {})",
            graphics_queue.family,
            transfer_queue.family
        );

        Ok(Self {
            device,
            graphics_queue,
            transfer_queue,
            swapchain_loader,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Main Vulkan context that owns the instance and device
///
/// Fields drop in declaration order, so the device goes before the instance.
pub struct VulkanContext {
    /// Selected physical device information
    pub physical_device: PhysicalDeviceInfo,
    device: LogicalDevice,
    instance: VulkanInstance,
}

impl VulkanContext {
    /// Pick a GPU and create the logical device
    ///
    /// With a surface, the chosen graphics queue must be able to present to it
    /// and the swapchain extension is enabled. Without one the context is
    /// headless.
    pub fn new(instance: VulkanInstance, surface: Option<&Surface>) -> VulkanResult<Self> {
        let physical_device = PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device, surface.is_some())?;

        Ok(Self {
            physical_device,
            device,
            instance,
        })
    }

    /// Get a reference to the Vulkan instance
    pub const fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Get the logical device
    pub const fn device(&self) -> &LogicalDevice {
        &self.device
    }

    /// Get the raw Device handle
    pub fn raw_device(&self) -> Device {
        self.device.device.clone()
    }

    /// Graphics and presentation queue
    pub const fn graphics_queue(&self) -> Queue {
        self.device.graphics_queue
    }

    /// Upload queue
    pub const fn transfer_queue(&self) -> Queue {
        self.device.transfer_queue
    }

    /// Swapchain extension loader
    pub fn swapchain_loader(&self) -> VulkanResult<&SwapchainLoader> {
        self.device
            .swapchain_loader
            .as_ref()
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: "headless context has no swapchain support".to_string(),
            })
    }

    /// Block until the device has finished all submitted work
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device.device.device_wait_idle().map_err(VulkanError::Api) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_transfer_family_prefers_dedicated() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(pick_transfer_family(&families, 0), 2);
    }

    #[test]
    fn test_transfer_family_falls_back_to_compute() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(pick_transfer_family(&families, 0), 1);
    }

    #[test]
    fn test_transfer_family_falls_back_to_graphics() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        assert_eq!(pick_transfer_family(&families, 0), 0);
    }
}
