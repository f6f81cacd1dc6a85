//! Back buffers: a window swapchain or an offscreen image ring.

use super::context::PhysicalDeviceInfo;
use super::resources::find_memory_type;
use crate::error::{GpuError, GpuResult};
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device};

/// Format of offscreen back buffers and the preferred swapchain format
pub const BACK_BUFFER_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Parameters shared by both display kinds
#[derive(Debug, Clone, Copy)]
pub struct DisplayDesc {
    /// Number of back buffers
    pub back_buffer_count: usize,
    /// Size in pixels
    pub extent: vk::Extent2D,
    /// Wait for vertical blank
    pub vsync: bool,
}

/// Swapchain bound to a window surface
pub struct SwapchainDisplay {
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    present_semaphores: Vec<vk::Semaphore>,
    acquire_fence: vk::Fence,
    extent: vk::Extent2D,
    current: u32,
}

/// Device-local images rotated round robin
pub struct OffscreenDisplay {
    images: Vec<(vk::Image, vk::DeviceMemory)>,
    extent: vk::Extent2D,
    current: usize,
}

/// Where presented frames go
pub enum Display {
    /// A window
    Swapchain(SwapchainDisplay),
    /// Nowhere; images stay on the GPU
    Offscreen(OffscreenDisplay),
}

impl Display {
    /// Create a swapchain for `surface` and acquire its first image
    pub fn swapchain(
        device: &Device,
        loader: &SwapchainLoader,
        surface_loader: &Surface,
        physical: &PhysicalDeviceInfo,
        surface: vk::SurfaceKHR,
        desc: DisplayDesc,
    ) -> GpuResult<Self> {
        let caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical.device, surface)?
        };
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(physical.device, surface)? };
        let format = formats
            .iter()
            .copied()
            .find(|candidate| candidate.format == BACK_BUFFER_FORMAT)
            .or_else(|| {
                let fallback = formats.first().copied();
                if let Some(fallback) = fallback {
                    log::warn!("Surface lacks {BACK_BUFFER_FORMAT:?}, presenting as {:?}", fallback.format);
                }
                fallback
            })
            .ok_or_else(|| GpuError::InitializationFailed("Surface reports no formats".to_string()))?;

        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical.device, surface)?
        };
        let present_mode = if desc.vsync {
            vk::PresentModeKHR::FIFO
        } else {
            present_modes
                .iter()
                .copied()
                .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
                .unwrap_or(vk::PresentModeKHR::FIFO)
        };

        let extent = if caps.current_extent.width == u32::MAX {
            vk::Extent2D {
                width: desc.extent.width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: desc.extent.height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        } else {
            caps.current_extent
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(desc.back_buffer_count as u32)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        let swapchain = unsafe { loader.create_swapchain(&create_info, None)? };

        let images = unsafe { loader.get_swapchain_images(swapchain)? };
        if images.len() != desc.back_buffer_count {
            unsafe { loader.destroy_swapchain(swapchain, None) };
            return Err(GpuError::InitializationFailed(format!(
                "Swapchain has {} images, {} requested",
                images.len(),
                desc.back_buffer_count
            )));
        }

        let mut present_semaphores = Vec::with_capacity(images.len());
        for _ in &images {
            let semaphore = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)? };
            present_semaphores.push(semaphore);
        }
        let acquire_fence = unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None)? };

        let mut display = SwapchainDisplay {
            surface,
            swapchain,
            images,
            present_semaphores,
            acquire_fence,
            extent,
            current: 0,
        };
        display.acquire(device, loader)?;
        log::info!(
            "Swapchain created: {}x{} {:?}, {} images, {present_mode:?}",
            extent.width,
            extent.height,
            format.format,
            display.images.len()
        );
        Ok(Self::Swapchain(display))
    }

    /// Create `desc.back_buffer_count` device-local images
    pub fn offscreen(device: &Device, physical: &PhysicalDeviceInfo, desc: DisplayDesc) -> GpuResult<Self> {
        let mut display = OffscreenDisplay {
            images: Vec::with_capacity(desc.back_buffer_count),
            extent: desc.extent,
            current: 0,
        };
        for _ in 0..desc.back_buffer_count {
            let image_info = vk::ImageCreateInfo::builder()
                .image_type(vk::ImageType::TYPE_2D)
                .format(BACK_BUFFER_FORMAT)
                .extent(vk::Extent3D {
                    width: desc.extent.width,
                    height: desc.extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);
            let image = unsafe { device.create_image(&image_info, None)? };

            let requirements = unsafe { device.get_image_memory_requirements(image) };
            let memory_type = find_memory_type(
                &physical.memory,
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            );
            let memory = memory_type.and_then(|index| {
                let alloc_info = vk::MemoryAllocateInfo::builder()
                    .allocation_size(requirements.size)
                    .memory_type_index(index);
                let memory = unsafe { device.allocate_memory(&alloc_info, None)? };
                if let Err(result) = unsafe { device.bind_image_memory(image, memory, 0) } {
                    unsafe { device.free_memory(memory, None) };
                    return Err(result.into());
                }
                Ok(memory)
            });
            match memory {
                Ok(memory) => display.images.push((image, memory)),
                Err(err) => {
                    unsafe { device.destroy_image(image, None) };
                    Self::Offscreen(display).destroy(device, None, None);
                    return Err(err);
                }
            }
        }
        log::info!(
            "Offscreen display: {} images of {}x{}",
            desc.back_buffer_count,
            desc.extent.width,
            desc.extent.height
        );
        Ok(Self::Offscreen(display))
    }

    /// Number of back buffers
    pub fn count(&self) -> usize {
        match self {
            Self::Swapchain(display) => display.images.len(),
            Self::Offscreen(display) => display.images.len(),
        }
    }

    /// Back buffer the next frame renders into
    pub fn current_index(&self) -> usize {
        match self {
            Self::Swapchain(display) => display.current as usize,
            Self::Offscreen(display) => display.current,
        }
    }

    /// Size of every back buffer
    pub const fn extent(&self) -> vk::Extent2D {
        match self {
            Self::Swapchain(display) => display.extent,
            Self::Offscreen(display) => display.extent,
        }
    }

    /// Image of back buffer `index`
    pub fn image(&self, index: usize) -> GpuResult<vk::Image> {
        let image = match self {
            Self::Swapchain(display) => display.images.get(index).copied(),
            Self::Offscreen(display) => display.images.get(index).map(|(image, _)| *image),
        };
        image.ok_or_else(|| GpuError::contract(format!("no back buffer {index}")))
    }

    /// Layout a back buffer is left in after being written
    pub const fn final_layout(&self) -> vk::ImageLayout {
        match self {
            Self::Swapchain(_) => vk::ImageLayout::PRESENT_SRC_KHR,
            Self::Offscreen(_) => vk::ImageLayout::GENERAL,
        }
    }

    /// Present the current image once the timeline reaches `after_value`, then
    /// acquire the next one
    pub fn present(
        &mut self,
        device: &Device,
        loader: Option<&SwapchainLoader>,
        queue: vk::Queue,
        timeline: vk::Semaphore,
        after_value: u64,
    ) -> GpuResult<()> {
        match self {
            Self::Offscreen(display) => {
                display.current = (display.current + 1) % display.images.len();
                Ok(())
            }
            Self::Swapchain(display) => {
                let loader = loader.ok_or_else(|| {
                    GpuError::InitializationFailed("swapchain display without swapchain loader".to_string())
                })?;
                let present_semaphore = display.present_semaphores[display.current as usize];

                // Bridge the timeline into the binary semaphore presentation needs
                let wait_semaphores = [timeline];
                let wait_values = [after_value];
                let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
                let signal_semaphores = [present_semaphore];
                let signal_values = [0];
                let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
                    .wait_semaphore_values(&wait_values)
                    .signal_semaphore_values(&signal_values);
                let submit = vk::SubmitInfo::builder()
                    .wait_semaphores(&wait_semaphores)
                    .wait_dst_stage_mask(&wait_stages)
                    .signal_semaphores(&signal_semaphores)
                    .push_next(&mut timeline_info);
                unsafe { device.queue_submit(queue, &[submit.build()], vk::Fence::null())? };

                let swapchains = [display.swapchain];
                let indices = [display.current];
                let present_info = vk::PresentInfoKHR::builder()
                    .wait_semaphores(&signal_semaphores)
                    .swapchains(&swapchains)
                    .image_indices(&indices);
                let suboptimal = unsafe { loader.queue_present(queue, &present_info)? };
                if suboptimal {
                    log::warn!("Swapchain is suboptimal for the surface");
                }

                display.acquire(device, loader)
            }
        }
    }

    /// Release images, semaphores and the swapchain
    pub fn destroy(&self, device: &Device, loader: Option<&SwapchainLoader>, surface_loader: Option<&Surface>) {
        match self {
            Self::Offscreen(display) => unsafe {
                for (image, memory) in &display.images {
                    device.destroy_image(*image, None);
                    device.free_memory(*memory, None);
                }
            },
            Self::Swapchain(display) => unsafe {
                for semaphore in &display.present_semaphores {
                    device.destroy_semaphore(*semaphore, None);
                }
                device.destroy_fence(display.acquire_fence, None);
                if let Some(loader) = loader {
                    loader.destroy_swapchain(display.swapchain, None);
                }
                if let Some(surface_loader) = surface_loader {
                    surface_loader.destroy_surface(display.surface, None);
                }
            },
        }
    }
}

impl SwapchainDisplay {
    fn acquire(&mut self, device: &Device, loader: &SwapchainLoader) -> GpuResult<()> {
        let (index, suboptimal) = unsafe {
            loader.acquire_next_image(self.swapchain, u64::MAX, vk::Semaphore::null(), self.acquire_fence)?
        };
        if suboptimal {
            log::warn!("Acquired a suboptimal swapchain image");
        }
        unsafe {
            device.wait_for_fences(&[self.acquire_fence], true, u64::MAX)?;
            device.reset_fences(&[self.acquire_fence])?;
        }
        self.current = index;
        Ok(())
    }
}
