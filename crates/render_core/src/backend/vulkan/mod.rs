//! Vulkan backend.
//!
//! Requires Vulkan 1.2 with `VK_KHR_acceleration_structure` and
//! `VK_KHR_ray_tracing_pipeline`. Buffers are addressed by device address,
//! so programs take their root arguments as push-constant pointers.

pub mod context;
pub mod device;
pub mod display;
pub mod resources;

pub use device::{SurfaceTarget, VulkanDevice};
