//! [`GpuDevice`] on Vulkan 1.2 with the KHR ray-tracing extensions.
//!
//! The fence is a timeline semaphore. Every [`GpuCommand`] list becomes one
//! primary command buffer allocated from the allocator's pool. Programs read
//! their root arguments as 64-bit buffer device addresses from push constants.

use super::context::{LogicalDevice, PhysicalDeviceInfo, VulkanContext, VulkanInstance};
use super::display::{Display, DisplayDesc};
use super::resources::{state_access, Allocation, CommandMemory, UNSIGNALED};
use crate::buffer::{BufferDesc, BufferUsage, Residency, ResourceState};
use crate::config::RenderConfig;
use crate::device::{
    AccelerationStructureInputs, AccelerationStructureKind, AllocatorId, BufferId, BufferRange,
    DeviceLimits, DispatchRaysDesc, GpuCommand, GpuDevice, PipelineId, PrebuildInfo,
    ShaderIdentifier, ShaderTableRegion, SHADER_IDENTIFIER_SIZE,
};
use crate::error::{GpuError, GpuResult};
use crate::shader::{RaytracingPipelineDesc, ShaderProgram};
use ash::extensions::khr::Surface;
use ash::{vk, Device};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::any::Any;
use std::collections::HashMap;
use std::ffi::CString;
use std::io::Cursor;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;

/// Native window to present into
#[derive(Debug, Clone, Copy)]
pub struct SurfaceTarget {
    /// Display connection
    pub display: RawDisplayHandle,
    /// Window
    pub window: RawWindowHandle,
}

struct PipelineObjects {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    push_constant_size: u32,
    ray_generation: String,
    identifiers: HashMap<String, ShaderIdentifier>,
}

#[derive(Default)]
struct State {
    buffers: HashMap<BufferId, Allocation>,
    structures: HashMap<(BufferId, u64), vk::AccelerationStructureKHR>,
    allocators: HashMap<AllocatorId, CommandMemory>,
    pipelines: HashMap<PipelineId, PipelineObjects>,
    retired: Vec<(u64, BufferId)>,
    next_id: u64,
    last_signaled: u64,
    unsignaled_work: bool,
    lost: Option<String>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_lost(&self) -> GpuResult<()> {
        match &self.lost {
            Some(reason) => Err(GpuError::DeviceRemoved(reason.clone())),
            None => Ok(()),
        }
    }

    /// Remember device loss so every later call fails the same way
    fn track<T>(&mut self, result: GpuResult<T>) -> GpuResult<T> {
        if let Err(GpuError::DeviceRemoved(reason)) = &result {
            self.lost.get_or_insert_with(|| reason.clone());
        }
        result
    }

    fn allocation(&self, buffer: BufferId) -> GpuResult<&Allocation> {
        self.buffers
            .get(&buffer)
            .filter(|allocation| !allocation.pending_release)
            .ok_or(GpuError::UnknownResource { id: buffer.0 })
    }

    fn address(&self, range: BufferRange) -> GpuResult<u64> {
        Ok(self.allocation(range.buffer)?.address + range.offset)
    }

    fn region(&self, region: ShaderTableRegion) -> GpuResult<vk::StridedDeviceAddressRegionKHR> {
        Ok(vk::StridedDeviceAddressRegionKHR {
            device_address: self.address(region.range)?,
            stride: region.stride,
            size: region.range.size,
        })
    }

    fn destroy_buffer_now(&mut self, device: &LogicalDevice, buffer: BufferId) {
        let structures: Vec<_> = self
            .structures
            .keys()
            .filter(|(owner, _)| *owner == buffer)
            .copied()
            .collect();
        for key in structures {
            if let Some(structure) = self.structures.remove(&key) {
                unsafe { device.acceleration_structure.destroy_acceleration_structure(structure, None) };
            }
        }
        if let Some(allocation) = self.buffers.remove(&buffer) {
            allocation.destroy(&device.device);
        }
    }

    fn collect_garbage(&mut self, device: &LogicalDevice, completed: u64) {
        let (done, pending): (Vec<_>, Vec<_>) =
            self.retired.drain(..).partition(|(value, _)| *value <= completed);
        self.retired = pending;
        for (_, buffer) in done {
            self.destroy_buffer_now(device, buffer);
        }
    }
}

/// Vulkan implementation of [`GpuDevice`]
pub struct VulkanDevice {
    name: String,
    limits: DeviceLimits,
    timeline: vk::Semaphore,
    transfer: Mutex<CommandMemory>,
    state: Mutex<State>,
    display: Mutex<Display>,
    context: VulkanContext,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl VulkanDevice {
    /// Open the first ray-tracing capable GPU. Without a surface the back
    /// buffers are offscreen images.
    pub fn new(config: &RenderConfig, surface: Option<SurfaceTarget>) -> GpuResult<Self> {
        let instance = VulkanInstance::new(
            "render_core",
            surface.map(|target| target.display),
            config.validation_enabled(),
        )?;

        let (surface_loader, surface_handle) = match surface {
            Some(target) => {
                let loader = Surface::new(&instance.entry, &instance.instance);
                let handle = unsafe {
                    ash_window::create_surface(&instance.entry, &instance.instance, target.display, target.window, None)?
                };
                (Some(loader), Some(handle))
            }
            None => (None, None),
        };
        let destroy_surface = |loader: &Option<Surface>| {
            if let (Some(loader), Some(handle)) = (loader, surface_handle) {
                unsafe { loader.destroy_surface(handle, None) };
            }
        };

        let physical = match PhysicalDeviceInfo::select_suitable_device(
            &instance.instance,
            surface_loader.as_ref().zip(surface_handle),
        ) {
            Ok(physical) => physical,
            Err(err) => {
                destroy_surface(&surface_loader);
                return Err(err);
            }
        };
        let limits = match Self::limits_for(&physical, config.frame_count) {
            Ok(limits) => limits,
            Err(err) => {
                destroy_surface(&surface_loader);
                return Err(err);
            }
        };
        let device = match LogicalDevice::new(&instance.instance, &physical, surface.is_some()) {
            Ok(device) => device,
            Err(err) => {
                destroy_surface(&surface_loader);
                return Err(err);
            }
        };

        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let timeline = match unsafe { device.device.create_semaphore(&semaphore_info, None) } {
            Ok(timeline) => timeline,
            Err(result) => {
                destroy_surface(&surface_loader);
                return Err(result.into());
            }
        };

        let display_desc = DisplayDesc {
            back_buffer_count: config.frame_count,
            extent: vk::Extent2D {
                width: config.width,
                height: config.height,
            },
            vsync: config.vsync,
        };
        let display = match (&device.swapchain, &surface_loader, surface_handle) {
            (Some(loader), Some(surface_loader), Some(handle)) => {
                Display::swapchain(&device.device, loader, surface_loader, &physical, handle, display_desc)
            }
            _ => Display::offscreen(&device.device, &physical, display_desc),
        };
        let display = match display {
            Ok(display) => display,
            Err(err) => {
                unsafe { device.device.destroy_semaphore(timeline, None) };
                destroy_surface(&surface_loader);
                return Err(err);
            }
        };
        // From here on the display owns the surface
        let transfer = match CommandMemory::new(&device.device, device.queue_family) {
            Ok(transfer) => transfer,
            Err(err) => {
                display.destroy(&device.device, device.swapchain.as_ref(), surface_loader.as_ref());
                unsafe { device.device.destroy_semaphore(timeline, None) };
                return Err(err);
            }
        };

        let name = physical.name();
        log::info!(
            "Vulkan device ready: {name}, identifier {} bytes, record alignment {}",
            limits.shader_identifier_size,
            limits.shader_record_alignment
        );
        Ok(Self {
            name,
            limits,
            timeline,
            transfer: Mutex::new(transfer),
            state: Mutex::new(State::default()),
            display: Mutex::new(display),
            context: VulkanContext {
                device,
                physical,
                surface_loader,
                instance,
            },
        })
    }

    fn limits_for(physical: &PhysicalDeviceInfo, back_buffer_count: usize) -> GpuResult<DeviceLimits> {
        let rt = physical.ray_tracing;
        if rt.shader_group_handle_size as usize > SHADER_IDENTIFIER_SIZE {
            return Err(GpuError::InitializationFailed(format!(
                "shader group handles of {} bytes are not supported",
                rt.shader_group_handle_size
            )));
        }
        let base_alignment = u64::from(rt.shader_group_base_alignment.max(1));
        Ok(DeviceLimits {
            constant_buffer_alignment: physical
                .properties
                .limits
                .min_uniform_buffer_offset_alignment
                .max(256),
            acceleration_structure_alignment: ACCELERATION_STRUCTURE_ALIGNMENT,
            shader_identifier_size: u64::from(rt.shader_group_handle_size),
            shader_record_alignment: u64::from(rt.shader_group_handle_alignment).max(base_alignment),
            shader_table_alignment: base_alignment,
            back_buffer_count,
        })
    }

    fn raw(&self) -> &Device {
        &self.context.device.device
    }

    fn completed(&self) -> GpuResult<u64> {
        Ok(unsafe { self.raw().get_semaphore_counter_value(self.timeline)? })
    }

    /// Acceleration structure object living at `range`, created on first use
    fn structure_for(
        &self,
        state: &mut State,
        range: BufferRange,
        kind: AccelerationStructureKind,
    ) -> GpuResult<vk::AccelerationStructureKHR> {
        if let Some(structure) = state.structures.get(&(range.buffer, range.offset)) {
            return Ok(*structure);
        }
        if range.offset % ACCELERATION_STRUCTURE_ALIGNMENT != 0 {
            return Err(GpuError::contract(format!(
                "acceleration structure offset {} is not {ACCELERATION_STRUCTURE_ALIGNMENT}-byte aligned",
                range.offset
            )));
        }
        let allocation = state.allocation(range.buffer)?;
        let structure_type = match kind {
            AccelerationStructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            AccelerationStructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        };
        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(allocation.buffer)
            .offset(range.offset)
            .size(range.size)
            .ty(structure_type);
        let structure = unsafe {
            self.context
                .device
                .acceleration_structure
                .create_acceleration_structure(&create_info, None)?
        };
        state.structures.insert((range.buffer, range.offset), structure);
        Ok(structure)
    }

    /// Geometry descriptions for a build; addresses are zero when only sizing
    fn geometries(
        state: Option<&State>,
        inputs: &AccelerationStructureInputs,
    ) -> GpuResult<(Vec<vk::AccelerationStructureGeometryKHR>, Vec<u32>)> {
        let address = |range: BufferRange| state.map_or(Ok(0), |state| state.address(range));
        match inputs {
            AccelerationStructureInputs::BottomLevel { geometries } => {
                let mut described = Vec::with_capacity(geometries.len());
                let mut counts = Vec::with_capacity(geometries.len());
                for geometry in geometries {
                    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                        .vertex_format(vk::Format::R32G32B32_SFLOAT)
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: address(geometry.vertices)?,
                        })
                        .vertex_stride(geometry.vertex_stride)
                        .max_vertex(geometry.vertex_count.saturating_sub(1))
                        .index_type(vk::IndexType::UINT32)
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: address(geometry.indices)?,
                        })
                        .build();
                    let flags = if geometry.opaque {
                        vk::GeometryFlagsKHR::OPAQUE
                    } else {
                        vk::GeometryFlagsKHR::empty()
                    };
                    described.push(
                        vk::AccelerationStructureGeometryKHR::builder()
                            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                            .flags(flags)
                            .build(),
                    );
                    counts.push(geometry.triangle_count());
                }
                Ok((described, counts))
            }
            AccelerationStructureInputs::TopLevel {
                instances,
                instance_count,
            } => {
                let data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: address(*instances)?,
                    })
                    .build();
                let geometry = vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances: data })
                    .build();
                Ok((vec![geometry], vec![*instance_count]))
            }
        }
    }

    fn build_type(inputs: &AccelerationStructureInputs) -> vk::AccelerationStructureTypeKHR {
        match inputs.kind() {
            AccelerationStructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            AccelerationStructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }

    fn record(&self, state: &mut State, display: &Display, cmd: vk::CommandBuffer, commands: &[GpuCommand]) -> GpuResult<()> {
        let device = self.raw();
        for command in commands {
            match command {
                GpuCommand::CopyBuffer { source, destination } => {
                    if source.size != destination.size {
                        return Err(GpuError::contract("copy ranges differ in size"));
                    }
                    let region = vk::BufferCopy {
                        src_offset: source.offset,
                        dst_offset: destination.offset,
                        size: source.size,
                    };
                    let src = state.allocation(source.buffer)?.buffer;
                    let dst = state.allocation(destination.buffer)?.buffer;
                    unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
                }
                GpuCommand::Transition { buffer, before, after } => {
                    let allocation = state.allocation(*buffer)?;
                    let (src_access, src_stage) = state_access(*before);
                    let (dst_access, dst_stage) = state_access(*after);
                    let barrier = vk::BufferMemoryBarrier::builder()
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(allocation.buffer)
                        .offset(0)
                        .size(vk::WHOLE_SIZE)
                        .build();
                    unsafe {
                        device.cmd_pipeline_barrier(
                            cmd,
                            src_stage,
                            dst_stage,
                            vk::DependencyFlags::empty(),
                            &[],
                            &[barrier],
                            &[],
                        );
                    }
                }
                GpuCommand::UavBarrier { buffer } => {
                    state.allocation(*buffer)?;
                    let (access, stages) = state_access(ResourceState::UNORDERED_ACCESS | ResourceState::ACCELERATION_STRUCTURE);
                    let barrier = vk::MemoryBarrier::builder()
                        .src_access_mask(access)
                        .dst_access_mask(access)
                        .build();
                    unsafe {
                        device.cmd_pipeline_barrier(cmd, stages, stages, vk::DependencyFlags::empty(), &[barrier], &[], &[]);
                    }
                }
                GpuCommand::BuildAccelerationStructure {
                    inputs,
                    scratch,
                    destination,
                } => {
                    let structure = self.structure_for(state, *destination, inputs.kind())?;
                    let scratch_address = state.address(*scratch)?;
                    let (geometries, counts) = Self::geometries(Some(&*state), inputs)?;
                    let ranges: Vec<_> = counts
                        .iter()
                        .map(|&primitive_count| vk::AccelerationStructureBuildRangeInfoKHR {
                            primitive_count,
                            primitive_offset: 0,
                            first_vertex: 0,
                            transform_offset: 0,
                        })
                        .collect();
                    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                        .ty(Self::build_type(inputs))
                        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                        .dst_acceleration_structure(structure)
                        .geometries(&geometries)
                        .scratch_data(vk::DeviceOrHostAddressKHR {
                            device_address: scratch_address,
                        })
                        .build();
                    unsafe {
                        self.context
                            .device
                            .acceleration_structure
                            .cmd_build_acceleration_structures(cmd, &[build_info], &[ranges.as_slice()]);
                    }
                }
                GpuCommand::DispatchRays(desc) => self.record_dispatch(state, cmd, desc)?,
                GpuCommand::ClearBackBuffer { index, color } => {
                    let image = display.image(*index)?;
                    let range = color_range();
                    Self::image_barrier(device, cmd, image, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                    unsafe {
                        device.cmd_clear_color_image(
                            cmd,
                            image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &vk::ClearColorValue { float32: *color },
                            &[range],
                        );
                    }
                    Self::image_barrier(device, cmd, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, display.final_layout());
                }
                GpuCommand::CopyBufferToBackBuffer { source, index } => {
                    let image = display.image(*index)?;
                    let extent = display.extent();
                    let needed = u64::from(extent.width) * u64::from(extent.height) * 4;
                    if source.size < needed {
                        return Err(GpuError::contract(format!(
                            "{} bytes cannot fill a {}x{} back buffer",
                            source.size, extent.width, extent.height
                        )));
                    }
                    let buffer = state.allocation(source.buffer)?.buffer;
                    let region = vk::BufferImageCopy::builder()
                        .buffer_offset(source.offset)
                        .image_subresource(vk::ImageSubresourceLayers {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            mip_level: 0,
                            base_array_layer: 0,
                            layer_count: 1,
                        })
                        .image_extent(vk::Extent3D {
                            width: extent.width,
                            height: extent.height,
                            depth: 1,
                        })
                        .build();
                    Self::image_barrier(device, cmd, image, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                    unsafe {
                        device.cmd_copy_buffer_to_image(cmd, buffer, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
                    }
                    Self::image_barrier(device, cmd, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, display.final_layout());
                }
            }
        }
        Ok(())
    }

    fn record_dispatch(&self, state: &mut State, cmd: vk::CommandBuffer, desc: &DispatchRaysDesc) -> GpuResult<()> {
        let mut arguments = Vec::with_capacity(desc.bindings.len() * 8);
        for binding in &desc.bindings {
            let address = if binding.access.contains(ResourceState::ACCELERATION_STRUCTURE) {
                let structure = self.structure_for(state, binding.range, AccelerationStructureKind::TopLevel)?;
                let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(structure);
                unsafe {
                    self.context
                        .device
                        .acceleration_structure
                        .get_acceleration_structure_device_address(&info)
                }
            } else {
                state.address(binding.range)?
            };
            arguments.extend_from_slice(&address.to_le_bytes());
        }

        let pipeline = state
            .pipelines
            .get(&desc.pipeline)
            .ok_or(GpuError::UnknownResource { id: desc.pipeline.0 })?;
        if arguments.len() > pipeline.push_constant_size as usize {
            return Err(GpuError::contract(format!(
                "{} bindings exceed the pipeline's {} root arguments",
                desc.bindings.len(),
                pipeline.push_constant_size / 8
            )));
        }
        let raygen = state.region(desc.ray_generation)?;
        let miss = state.region(desc.miss)?;
        let hit = state.region(desc.hit_group)?;
        let callable = vk::StridedDeviceAddressRegionKHR::default();

        let device = self.raw();
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.pipeline);
            if !arguments.is_empty() {
                device.cmd_push_constants(cmd, pipeline.layout, program_stages(), 0, &arguments);
            }
            self.context.device.ray_tracing_pipeline.cmd_trace_rays(
                cmd,
                &raygen,
                &miss,
                &hit,
                &callable,
                desc.width,
                desc.height,
                1,
            );
        }
        Ok(())
    }

    fn image_barrier(
        device: &Device,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let (src_access, src_stage) = if old_layout == vk::ImageLayout::UNDEFINED {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE)
        } else {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        };
        let (dst_access, dst_stage) = if new_layout == vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        } else {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        };
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_range())
            .build();
        unsafe {
            device.cmd_pipeline_barrier(cmd, src_stage, dst_stage, vk::DependencyFlags::empty(), &[], &[], &[barrier]);
        }
    }

    /// Copy GPU-local bytes through a temporary upload buffer
    fn read_through_staging(&self, source: vk::Buffer, offset: u64, len: u64) -> GpuResult<Vec<u8>> {
        let device = self.raw();
        let staging = Allocation::new(
            device,
            &self.context.physical.memory,
            &BufferDesc::upload(len.max(4), BufferUsage::COPY_DEST, "readback"),
        )?;
        let result = (|| -> GpuResult<Vec<u8>> {
            let mut transfer = lock(&self.transfer);
            let cmd = transfer.begin(device)?;
            let region = vk::BufferCopy {
                src_offset: offset,
                dst_offset: 0,
                size: len,
            };
            let command_buffers = [cmd];
            let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            unsafe {
                device.cmd_copy_buffer(cmd, source, staging.buffer, &[region]);
                device.end_command_buffer(cmd)?;
                device.queue_submit(self.context.device.queue, &[submit.build()], vk::Fence::null())?;
                device.queue_wait_idle(self.context.device.queue)?;
            }
            transfer.reset(device)?;
            staging.read(device, 0, len)
        })();
        staging.destroy(device);
        result
    }

    fn shader_module(&self, program: &ShaderProgram) -> GpuResult<vk::ShaderModule> {
        let code = ash::util::read_spv(&mut Cursor::new(&program.bytecode))
            .map_err(|err| GpuError::MissingShader(format!("{}: {err}", program.export)))?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        Ok(unsafe { self.raw().create_shader_module(&create_info, None)? })
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn program_stages() -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::RAYGEN_KHR
        | vk::ShaderStageFlags::MISS_KHR
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR
        | vk::ShaderStageFlags::ANY_HIT_KHR
}

impl GpuDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<BufferId> {
        desc.validate(self.limits.constant_buffer_alignment)?;
        let allocation = Allocation::new(self.raw(), &self.context.physical.memory, desc)?;
        log::trace!("Allocated '{}' ({} bytes, {:?})", desc.label, desc.size, desc.residency);
        let mut state = lock(&self.state);
        let id = BufferId(state.next_id());
        state.buffers.insert(id, allocation);
        Ok(id)
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut state = lock(&self.state);
        let completed = self.completed().unwrap_or(0);
        let busy_until = if state.unsignaled_work {
            Some(UNSIGNALED)
        } else {
            (state.last_signaled > completed).then_some(state.last_signaled)
        };
        match busy_until {
            Some(value) => {
                let known = state
                    .buffers
                    .get_mut(&buffer)
                    .map(|allocation| allocation.pending_release = true)
                    .is_some();
                if known {
                    state.retired.push((value, buffer));
                }
            }
            None => state.destroy_buffer_now(&self.context.device, buffer),
        }
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()> {
        let state = lock(&self.state);
        state.allocation(buffer)?.write(self.raw(), offset, data)
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> GpuResult<Vec<u8>> {
        let (residency, handle, size) = {
            let state = lock(&self.state);
            let allocation = state.allocation(buffer)?;
            if allocation.residency == Residency::Upload {
                return allocation.read(self.raw(), offset, len);
            }
            (allocation.residency, allocation.buffer, allocation.size)
        };
        debug_assert_eq!(residency, Residency::Default);
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(GpuError::contract(format!("read past the end of buffer {}", buffer.0)));
        }
        self.read_through_staging(handle, offset, len)
    }

    fn buffer_address(&self, buffer: BufferId) -> GpuResult<u64> {
        Ok(lock(&self.state).allocation(buffer)?.address)
    }

    fn create_command_allocator(&self) -> GpuResult<AllocatorId> {
        let memory = CommandMemory::new(self.raw(), self.context.device.queue_family)?;
        let mut state = lock(&self.state);
        let id = AllocatorId(state.next_id());
        state.allocators.insert(id, memory);
        Ok(id)
    }

    fn reset_command_allocator(&self, allocator: AllocatorId) -> GpuResult<()> {
        let completed = self.completed()?;
        let mut state = lock(&self.state);
        let memory = state
            .allocators
            .get_mut(&allocator)
            .ok_or(GpuError::UnknownResource { id: allocator.0 })?;
        if let Some(busy_until) = memory.busy_until.filter(|&value| value > completed) {
            return Err(GpuError::contract(format!(
                "command allocator {} reset before fence value {busy_until} completed",
                allocator.0
            )));
        }
        memory.reset(&self.context.device.device)
    }

    fn destroy_command_allocator(&self, allocator: AllocatorId) {
        let mut state = lock(&self.state);
        if let Some(memory) = state.allocators.remove(&allocator) {
            if memory.busy_until.is_some() {
                // Pool may still be referenced by queued work
                let _ = unsafe { self.raw().queue_wait_idle(self.context.device.queue) };
            }
            memory.destroy(self.raw());
        }
    }

    fn execute(&self, allocator: AllocatorId, commands: &[GpuCommand]) -> GpuResult<()> {
        let mut state = lock(&self.state);
        state.check_lost()?;
        let device = self.raw();
        let cmd = state
            .allocators
            .get_mut(&allocator)
            .ok_or(GpuError::UnknownResource { id: allocator.0 })?
            .begin(device)?;

        let recorded = {
            let display = lock(&self.display);
            self.record(&mut state, &display, cmd, commands)
        };
        let ended = unsafe { device.end_command_buffer(cmd) };
        recorded?;
        state.track(ended.map_err(GpuError::from))?;

        let command_buffers = [cmd];
        let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        let submitted = unsafe { device.queue_submit(self.context.device.queue, &[submit.build()], vk::Fence::null()) };
        state.track(submitted.map_err(|result| match result {
            vk::Result::ERROR_DEVICE_LOST => GpuError::from(result),
            other => GpuError::SubmissionFailed(format!("{other:?}")),
        }))?;

        if let Some(memory) = state.allocators.get_mut(&allocator) {
            memory.busy_until = Some(UNSIGNALED);
        }
        state.unsignaled_work = true;
        log::trace!("Vulkan execute: {} commands", commands.len());
        Ok(())
    }

    fn signal(&self, value: u64) -> GpuResult<()> {
        let mut state = lock(&self.state);
        state.check_lost()?;
        if value <= state.last_signaled {
            return Err(GpuError::contract(format!(
                "fence value {value} does not increase {}",
                state.last_signaled
            )));
        }

        let signal_semaphores = [self.timeline];
        let signal_values = [value];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&signal_values);
        let submit = vk::SubmitInfo::builder()
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);
        let submitted = unsafe { self.raw().queue_submit(self.context.device.queue, &[submit.build()], vk::Fence::null()) };
        state.track(submitted.map_err(|result| match result {
            vk::Result::ERROR_DEVICE_LOST => GpuError::from(result),
            other => GpuError::SubmissionFailed(format!("{other:?}")),
        }))?;

        for memory in state.allocators.values_mut() {
            if memory.busy_until == Some(UNSIGNALED) {
                memory.busy_until = Some(value);
            }
        }
        for (busy_until, _) in &mut state.retired {
            if *busy_until == UNSIGNALED {
                *busy_until = value;
            }
        }
        state.unsignaled_work = false;
        state.last_signaled = value;
        Ok(())
    }

    fn completed_value(&self) -> GpuResult<u64> {
        let mut state = lock(&self.state);
        state.check_lost()?;
        let completed = state.track(self.completed())?;
        state.collect_garbage(&self.context.device, completed);
        Ok(completed)
    }

    fn wait_for_value(&self, value: u64, timeout: Duration) -> GpuResult<()> {
        lock(&self.state).check_lost()?;
        let semaphores = [self.timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder().semaphores(&semaphores).values(&values);
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let waited = unsafe { self.raw().wait_semaphores(&wait_info, timeout_ns) };

        let mut state = lock(&self.state);
        match waited {
            Ok(()) => {
                state.collect_garbage(&self.context.device, value);
                Ok(())
            }
            Err(vk::Result::TIMEOUT) => Err(GpuError::WaitTimeout {
                value,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Err(result) => state.track(Err(result.into())),
        }
    }

    fn acceleration_structure_prebuild(&self, inputs: &AccelerationStructureInputs) -> GpuResult<PrebuildInfo> {
        if inputs.primitive_count() == 0 {
            return Err(GpuError::contract("acceleration structure build with no primitives"));
        }
        let (geometries, counts) = Self::geometries(None, inputs)?;
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(Self::build_type(inputs))
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let sizes = unsafe {
            self.context.device.acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &counts,
            )
        };
        Ok(PrebuildInfo {
            result_size: sizes.acceleration_structure_size,
            scratch_size: sizes.build_scratch_size,
        })
    }

    fn acceleration_structure_address(
        &self,
        result: BufferRange,
        kind: AccelerationStructureKind,
    ) -> GpuResult<u64> {
        let mut state = lock(&self.state);
        if !state.buffers.contains_key(&result.buffer) {
            return Err(GpuError::UnknownResource { id: result.buffer.0 });
        }
        let structure = self.structure_for(&mut state, result, kind)?;
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(structure);
        Ok(unsafe {
            self.context
                .device
                .acceleration_structure
                .get_acceleration_structure_device_address(&info)
        })
    }

    fn create_raytracing_pipeline(&self, desc: &RaytracingPipelineDesc) -> GpuResult<PipelineId> {
        desc.validate()?;
        let device = self.raw();

        let mut modules = Vec::new();
        let mut entry_points = Vec::new();
        let mut stage_flags = Vec::new();
        let mut add_stage = |program: &ShaderProgram, stage: vk::ShaderStageFlags| -> GpuResult<u32> {
            let entry = CString::new(program.entry_point.as_str())
                .map_err(|_| GpuError::MissingShader(format!("{}: entry point contains NUL", program.export)))?;
            modules.push(self.shader_module(program)?);
            entry_points.push(entry);
            stage_flags.push(stage);
            Ok(modules.len() as u32 - 1)
        };

        let mut groups = Vec::new();
        let general = |index: u32| {
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(index)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build()
        };
        let staged = (|| -> GpuResult<()> {
            groups.push(general(add_stage(&desc.ray_generation, vk::ShaderStageFlags::RAYGEN_KHR)?));
            for miss in &desc.misses {
                groups.push(general(add_stage(miss, vk::ShaderStageFlags::MISS_KHR)?));
            }
            for group in &desc.hit_groups {
                let closest_hit = add_stage(&group.closest_hit, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?;
                let any_hit = match &group.any_hit {
                    Some(program) => add_stage(program, vk::ShaderStageFlags::ANY_HIT_KHR)?,
                    None => vk::SHADER_UNUSED_KHR,
                };
                groups.push(
                    vk::RayTracingShaderGroupCreateInfoKHR::builder()
                        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                        .general_shader(vk::SHADER_UNUSED_KHR)
                        .closest_hit_shader(closest_hit)
                        .any_hit_shader(any_hit)
                        .intersection_shader(vk::SHADER_UNUSED_KHR)
                        .build(),
                );
            }
            Ok(())
        })();
        let destroy_modules = |modules: &[vk::ShaderModule]| {
            for module in modules {
                unsafe { device.destroy_shader_module(*module, None) };
            }
        };
        if let Err(err) = staged {
            destroy_modules(&modules);
            return Err(err);
        }

        let stages: Vec<_> = modules
            .iter()
            .zip(&entry_points)
            .zip(&stage_flags)
            .map(|((module, entry), stage)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(*stage)
                    .module(*module)
                    .name(entry)
                    .build()
            })
            .collect();

        let push_constant_size = desc.root_argument_count * 8;
        let push_ranges = [vk::PushConstantRange {
            stage_flags: program_stages(),
            offset: 0,
            size: push_constant_size,
        }];
        let layout_info = if push_constant_size > 0 {
            vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(&push_ranges)
        } else {
            vk::PipelineLayoutCreateInfo::builder()
        };
        let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(result) => {
                destroy_modules(&modules);
                return Err(result.into());
            }
        };

        let recursion_depth = desc
            .max_recursion_depth
            .min(self.context.physical.ray_tracing.max_ray_recursion_depth);
        let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(recursion_depth)
            .layout(layout)
            .build();
        let created = unsafe {
            self.context.device.ray_tracing_pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
        };
        destroy_modules(&modules);
        let pipeline = match created {
            Ok(pipelines) if !pipelines.is_empty() => pipelines[0],
            other => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(GpuError::MissingShader(format!(
                    "ray-tracing pipeline creation failed: {:?}",
                    other.err()
                )));
            }
        };

        let handle_size = self.limits.shader_identifier_size as usize;
        let handles = unsafe {
            self.context.device.ray_tracing_pipeline.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                groups.len() as u32,
                groups.len() * handle_size,
            )
        };
        let handles = match handles {
            Ok(handles) => handles,
            Err(result) => {
                unsafe {
                    device.destroy_pipeline(pipeline, None);
                    device.destroy_pipeline_layout(layout, None);
                }
                return Err(result.into());
            }
        };
        let identifiers = desc
            .export_names()
            .zip(handles.chunks(handle_size))
            .map(|(name, handle)| {
                let mut identifier = [0u8; SHADER_IDENTIFIER_SIZE];
                identifier[..handle.len()].copy_from_slice(handle);
                (name.to_string(), ShaderIdentifier(identifier))
            })
            .collect();

        let mut state = lock(&self.state);
        let id = PipelineId(state.next_id());
        state.pipelines.insert(
            id,
            PipelineObjects {
                pipeline,
                layout,
                push_constant_size,
                ray_generation: desc.ray_generation.export.clone(),
                identifiers,
            },
        );
        log::debug!("Ray-tracing pipeline {} created with {} groups", id.0, groups.len());
        Ok(id)
    }

    fn destroy_raytracing_pipeline(&self, pipeline: PipelineId) {
        let objects = lock(&self.state).pipelines.remove(&pipeline);
        if let Some(objects) = objects {
            log::trace!("Destroying pipeline {} (ray generation '{}')", pipeline.0, objects.ray_generation);
            unsafe {
                // Pipelines are only dropped after the frames that used them
                let _ = self.raw().queue_wait_idle(self.context.device.queue);
                self.raw().destroy_pipeline(objects.pipeline, None);
                self.raw().destroy_pipeline_layout(objects.layout, None);
            }
        }
    }

    fn shader_identifier(&self, pipeline: PipelineId, export: &str) -> Option<ShaderIdentifier> {
        lock(&self.state)
            .pipelines
            .get(&pipeline)
            .and_then(|objects| objects.identifiers.get(export).copied())
    }

    fn present(&self) -> GpuResult<()> {
        let mut state = lock(&self.state);
        state.check_lost()?;
        let after_value = state.last_signaled;
        let mut display = lock(&self.display);
        let presented = display.present(
            self.raw(),
            self.context.device.swapchain.as_ref(),
            self.context.device.queue,
            self.timeline,
            after_value,
        );
        state.track(presented)
    }

    fn current_back_buffer_index(&self) -> usize {
        lock(&self.display).current_index()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            let _ = device.device.device_wait_idle();
        }

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, objects) in state.pipelines.drain() {
            unsafe {
                device.device.destroy_pipeline(objects.pipeline, None);
                device.device.destroy_pipeline_layout(objects.layout, None);
            }
        }
        for (_, structure) in state.structures.drain() {
            unsafe { device.acceleration_structure.destroy_acceleration_structure(structure, None) };
        }
        for (_, allocation) in state.buffers.drain() {
            allocation.destroy(&device.device);
        }
        for (_, memory) in state.allocators.drain() {
            memory.destroy(&device.device);
        }
        self.transfer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .destroy(&device.device);
        self.display
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .destroy(&device.device, device.swapchain.as_ref(), self.context.surface_loader.as_ref());
        unsafe { device.device.destroy_semaphore(self.timeline, None) };
        log::debug!("Vulkan device '{}' destroyed", self.name);
    }
}
