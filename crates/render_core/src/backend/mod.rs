//! Device implementations.

pub mod headless;
pub mod vulkan;

use crate::config::{BackendKind, RenderConfig};
use crate::device::GpuDevice;
use crate::error::GpuResult;
use headless::{HeadlessDevice, HeadlessDeviceDesc};
use std::sync::Arc;
use vulkan::{SurfaceTarget, VulkanDevice};

/// Create the device `config.backend` names
///
/// `surface` is only used by the Vulkan backend; without it the back buffers
/// are offscreen images.
pub fn create_device(config: &RenderConfig, surface: Option<SurfaceTarget>) -> GpuResult<Arc<dyn GpuDevice>> {
    match config.backend {
        BackendKind::Headless => {
            log::info!("Using headless backend ({}x{})", config.width, config.height);
            Ok(Arc::new(HeadlessDevice::new(HeadlessDeviceDesc::from_config(config))))
        }
        BackendKind::Vulkan => {
            log::info!("Using Vulkan backend");
            Ok(Arc::new(VulkanDevice::new(config, surface)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_backend_from_config() {
        let config = RenderConfig::new(8, 4).with_frame_count(2).with_backend(BackendKind::Headless);
        let device = create_device(&config, None).unwrap();

        assert_eq!(device.name(), "Headless");
        assert_eq!(device.limits().back_buffer_count, 2);
        assert!(device.as_any().downcast_ref::<HeadlessDevice>().is_some());
    }
}
