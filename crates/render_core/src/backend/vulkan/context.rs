//! Instance, physical device selection and logical device creation.
//!
//! Ray tracing needs Vulkan 1.2 (buffer device address, timeline semaphores)
//! plus `VK_KHR_acceleration_structure`, `VK_KHR_ray_tracing_pipeline` and
//! `VK_KHR_deferred_host_operations`. A device missing any of them is skipped.

use crate::error::{GpuError, GpuResult};
use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{AccelerationStructure, RayTracingPipeline, Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};

/// Vulkan instance with optional validation messenger
pub struct VulkanInstance {
    /// Loaded entry points
    pub entry: Entry,
    /// Instance handle
    pub instance: Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create an instance. `display` adds the surface extensions a window needs.
    pub fn new(app_name: &str, display: Option<RawDisplayHandle>, enable_validation: bool) -> GpuResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| GpuError::InitializationFailed(format!("Failed to load Vulkan: {e}")))?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|_| GpuError::InitializationFailed("application name contains NUL".to_string()))?;
        let engine_name = static_cstr(b"render_core\0")?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions: Vec<*const c_char> = match display {
            Some(display) => ash_window::enumerate_required_extensions(display)?.to_vec(),
            None => Vec::new(),
        };
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let validation_layer = static_cstr(b"VK_LAYER_KHRONOS_validation\0")?;
        let layers: Vec<*const c_char> = if enable_validation {
            vec![validation_layer.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe { entry.create_instance(&create_info, None)? };

        let debug_utils = if enable_validation {
            let loader = DebugUtils::new(&entry, &instance);
            let messenger = Self::setup_debug_messenger(&loader)?;
            Some((loader, messenger))
        } else {
            None
        };

        log::info!("Vulkan instance created (validation: {enable_validation})");
        Ok(Self {
            entry,
            instance,
            debug_utils,
        })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> GpuResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        Ok(unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? })
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// NUL-terminated literal as a `CStr`
pub(super) fn static_cstr(bytes: &'static [u8]) -> GpuResult<&'static CStr> {
    CStr::from_bytes_with_nul(bytes)
        .map_err(|e| GpuError::InitializationFailed(format!("invalid C string literal: {e}")))
}

/// Forwards validation messages to `log`
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
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::debug!("[Vulkan] {message_type:?} - {message}");
    }

    vk::FALSE
}

/// Shader binding table rules of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Bytes per group handle
    pub shader_group_handle_size: u32,
    /// Record stride alignment
    pub shader_group_handle_alignment: u32,
    /// Table start alignment
    pub shader_group_base_alignment: u32,
    /// Deepest supported trace recursion
    pub max_ray_recursion_depth: u32,
}

/// A ray-tracing capable adapter and the queue family used for everything
pub struct PhysicalDeviceInfo {
    /// Adapter handle
    pub device: vk::PhysicalDevice,
    /// Core properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Shader group handle sizes and alignments
    pub ray_tracing: RayTracingProperties,
    /// Memory heaps and types
    pub memory: vk::PhysicalDeviceMemoryProperties,
    /// Family with graphics, compute and (if needed) present support
    pub queue_family: u32,
}

impl PhysicalDeviceInfo {
    /// Adapter name as reported by the driver
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Pick the first adapter supporting ray tracing (and presentation to `surface`)
    pub fn select_suitable_device(
        instance: &Instance,
        surface: Option<(&Surface, vk::SurfaceKHR)>,
    ) -> GpuResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices()? };

        for device in devices {
            match Self::evaluate_device(instance, device, surface) {
                Ok(info) => {
                    log::info!("Selected GPU: {}", info.name());
                    return Ok(info);
                }
                Err(reason) => log::debug!("Skipping adapter: {reason}"),
            }
        }

        Err(GpuError::InitializationFailed(
            "No GPU with ray-tracing support found".to_string(),
        ))
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: Option<(&Surface, vk::SurfaceKHR)>,
    ) -> GpuResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < vk::API_VERSION_1_2 {
            return Err(GpuError::InitializationFailed("Vulkan 1.2 not supported".to_string()));
        }

        let available = unsafe { instance.enumerate_device_extension_properties(device)? };
        let mut required = required_extensions();
        if surface.is_some() {
            required.push(SwapchainLoader::name());
        }
        for extension in required {
            if !supports_extension(&available, extension) {
                return Err(GpuError::InitializationFailed(format!(
                    "{} not supported",
                    extension.to_string_lossy()
                )));
            }
        }

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let mut queue_family = None;
        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;
            if !family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            {
                continue;
            }
            let presents = match surface {
                Some((loader, surface)) => unsafe {
                    loader.get_physical_device_surface_support(device, index, surface)?
                },
                None => true,
            };
            if presents {
                queue_family = Some(index);
                break;
            }
        }
        let queue_family = queue_family
            .ok_or_else(|| GpuError::InitializationFailed("No usable queue family found".to_string()))?;

        let properties_khr = unsafe { RayTracingPipeline::get_properties(instance, device) };
        let ray_tracing = RayTracingProperties {
            shader_group_handle_size: properties_khr.shader_group_handle_size,
            shader_group_handle_alignment: properties_khr.shader_group_handle_alignment,
            shader_group_base_alignment: properties_khr.shader_group_base_alignment,
            max_ray_recursion_depth: properties_khr.max_ray_recursion_depth,
        };
        let memory = unsafe { instance.get_physical_device_memory_properties(device) };

        Ok(Self {
            device,
            properties,
            ray_tracing,
            memory,
            queue_family,
        })
    }
}

fn supports_extension(available: &[vk::ExtensionProperties], extension: &CStr) -> bool {
    available.iter().any(|candidate| {
        // extension_name is a NUL-terminated fixed-size array filled by the driver
        let name = unsafe { CStr::from_ptr(candidate.extension_name.as_ptr()) };
        name == extension
    })
}

fn required_extensions() -> Vec<&'static CStr> {
    vec![
        AccelerationStructure::name(),
        RayTracingPipeline::name(),
        vk::KhrDeferredHostOperationsFn::name(),
    ]
}

/// Logical device, its single queue and extension loaders
pub struct LogicalDevice {
    /// Device handle
    pub device: Device,
    /// The only submission queue
    pub queue: vk::Queue,
    /// Queue family of `queue`
    pub queue_family: u32,
    /// `VK_KHR_acceleration_structure` entry points
    pub acceleration_structure: AccelerationStructure,
    /// `VK_KHR_ray_tracing_pipeline` entry points
    pub ray_tracing_pipeline: RayTracingPipeline,
    /// `VK_KHR_swapchain` entry points, when presenting to a window
    pub swapchain: Option<SwapchainLoader>,
}

impl LogicalDevice {
    /// Create the device with ray-tracing features enabled
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo, with_swapchain: bool) -> GpuResult<Self> {
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(physical.queue_family)
            .queue_priorities(&priorities)
            .build()];

        let mut extensions: Vec<*const c_char> =
            required_extensions().into_iter().map(CStr::as_ptr).collect();
        if with_swapchain {
            extensions.push(SwapchainLoader::name().as_ptr());
        }

        let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .timeline_semaphore(true);
        let mut acceleration_structure_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut ray_tracing_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut vulkan_12)
            .push_next(&mut acceleration_structure_features)
            .push_next(&mut ray_tracing_features);

        let device = unsafe { instance.create_device(physical.device, &create_info, None)? };
        let queue = unsafe { device.get_device_queue(physical.queue_family, 0) };

        Ok(Self {
            acceleration_structure: AccelerationStructure::new(instance, &device),
            ray_tracing_pipeline: RayTracingPipeline::new(instance, &device),
            swapchain: with_swapchain.then(|| SwapchainLoader::new(instance, &device)),
            device,
            queue,
            queue_family: physical.queue_family,
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

/// Everything needed to talk to one GPU
///
/// Field order is drop order: the device goes before the instance.
pub struct VulkanContext {
    /// Logical device and queue
    pub device: LogicalDevice,
    /// Selected adapter
    pub physical: PhysicalDeviceInfo,
    /// Surface loader, when presenting to a window
    pub surface_loader: Option<Surface>,
    /// Instance and messenger
    pub instance: VulkanInstance,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(name: &CStr) -> vk::ExtensionProperties {
        let mut properties = vk::ExtensionProperties::default();
        for (slot, byte) in properties.extension_name.iter_mut().zip(name.to_bytes()) {
            *slot = *byte as c_char;
        }
        properties
    }

    #[test]
    fn test_supports_extension_matches_full_name() {
        let available = [properties(AccelerationStructure::name()), properties(SwapchainLoader::name())];
        assert!(supports_extension(&available, AccelerationStructure::name()));
        assert!(supports_extension(&available, SwapchainLoader::name()));
        assert!(!supports_extension(&available, RayTracingPipeline::name()));
        assert!(!supports_extension(&[], AccelerationStructure::name()));
    }
}
