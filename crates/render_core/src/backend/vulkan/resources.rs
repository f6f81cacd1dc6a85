//! Buffer memory, command pools and state-to-barrier mapping.

use crate::buffer::{BufferDesc, BufferUsage, Residency, ResourceState};
use crate::error::{GpuError, GpuResult};
use ash::{vk, Device};

/// Find a memory type allowed by `type_filter` with all of `properties`
pub fn find_memory_type(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> GpuResult<u32> {
    (0..memory.memory_type_count)
        .find(|&i| {
            (type_filter & (1 << i)) != 0
                && memory.memory_types[i as usize].property_flags.contains(properties)
        })
        .ok_or(GpuError::NoSuitableMemoryType)
}

/// Vulkan usage for a buffer. Every buffer is addressable and copyable.
pub fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST;
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::CONSTANT) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::BUILD_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::SHADER_TABLE) {
        flags |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
    }
    flags
}

/// Access mask and pipeline stages a buffer in `state` is used with
pub fn state_access(state: ResourceState) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    let mut access = vk::AccessFlags::empty();
    let mut stages = vk::PipelineStageFlags::empty();
    let shader_stages = vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR;
    let build_stage = vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR;

    if state.contains(ResourceState::VERTEX_AND_CONSTANT_BUFFER) {
        access |= vk::AccessFlags::UNIFORM_READ | vk::AccessFlags::SHADER_READ;
        stages |= shader_stages | build_stage;
    }
    if state.contains(ResourceState::INDEX_BUFFER) {
        access |= vk::AccessFlags::SHADER_READ;
        stages |= shader_stages | build_stage;
    }
    if state.contains(ResourceState::SHADER_RESOURCE) {
        access |= vk::AccessFlags::SHADER_READ;
        stages |= shader_stages;
    }
    if state.contains(ResourceState::UNORDERED_ACCESS) {
        access |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
        stages |= shader_stages | build_stage;
    }
    if state.contains(ResourceState::COPY_DEST) {
        access |= vk::AccessFlags::TRANSFER_WRITE;
        stages |= vk::PipelineStageFlags::TRANSFER;
    }
    if state.contains(ResourceState::COPY_SOURCE) {
        access |= vk::AccessFlags::TRANSFER_READ;
        stages |= vk::PipelineStageFlags::TRANSFER;
    }
    if state.contains(ResourceState::ACCELERATION_STRUCTURE) {
        access |= vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
            | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR;
        stages |= shader_stages | build_stage;
    }
    if stages.is_empty() {
        stages = vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    (access, stages)
}

/// One buffer and its dedicated memory
pub struct Allocation {
    /// Buffer handle
    pub buffer: vk::Buffer,
    /// Backing memory
    pub memory: vk::DeviceMemory,
    /// Requested size
    pub size: u64,
    /// Pool the memory came from
    pub residency: Residency,
    /// Device address of byte 0
    pub address: u64,
    /// Set once the owner has let go; freed when the GPU is done
    pub pending_release: bool,
}

impl Allocation {
    /// Create a buffer with device-address-capable memory
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        desc: &BufferDesc,
    ) -> GpuResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(buffer_usage_flags(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let properties = match desc.residency {
            Residency::Upload => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            Residency::Default => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        };
        let memory_type_index =
            match find_memory_type(memory_properties, requirements.memory_type_bits, properties) {
                Ok(index) => index,
                Err(err) => {
                    unsafe { device.destroy_buffer(buffer, None) };
                    return Err(err);
                }
            };

        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut flags_info);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(result) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed {
                    requested: desc.size,
                    reason: format!("{result:?}"),
                });
            }
        };

        if let Err(result) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(result.into());
        }

        let address_info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        let address = unsafe { device.get_buffer_device_address(&address_info) };

        Ok(Self {
            buffer,
            memory,
            size: desc.size,
            residency: desc.residency,
            address,
            pending_release: false,
        })
    }

    /// Copy `data` into host-visible memory at `offset`
    pub fn write(&self, device: &Device, offset: u64, data: &[u8]) -> GpuResult<()> {
        self.check_host_range(offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            let mapped = device.map_memory(
                self.memory,
                offset,
                data.len() as u64,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.cast::<u8>(), data.len());
            device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Copy `len` bytes of host-visible memory starting at `offset`
    pub fn read(&self, device: &Device, offset: u64, len: u64) -> GpuResult<Vec<u8>> {
        self.check_host_range(offset, len)?;
        let mut bytes = vec![0u8; len as usize];
        if len == 0 {
            return Ok(bytes);
        }
        unsafe {
            let mapped = device.map_memory(self.memory, offset, len, vk::MemoryMapFlags::empty())?;
            std::ptr::copy_nonoverlapping(mapped.cast::<u8>(), bytes.as_mut_ptr(), bytes.len());
            device.unmap_memory(self.memory);
        }
        Ok(bytes)
    }

    fn check_host_range(&self, offset: u64, len: u64) -> GpuResult<()> {
        if self.residency != Residency::Upload {
            return Err(GpuError::contract("CPU access to GPU-local memory"));
        }
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(GpuError::contract(format!(
                "range {offset}+{len} exceeds buffer of {} bytes",
                self.size
            )));
        }
        Ok(())
    }

    /// Release the buffer and its memory
    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Tag for work that has been executed but not yet covered by a signal
pub const UNSIGNALED: u64 = u64::MAX;

/// A command pool and the command buffers recorded from it since the last reset
pub struct CommandMemory {
    /// Pool handle
    pub pool: vk::CommandPool,
    /// Buffers handed out since the last reset
    pub buffers: Vec<vk::CommandBuffer>,
    /// Fence value covering the latest execution, if any
    pub busy_until: Option<u64>,
}

impl CommandMemory {
    /// Create a pool on `queue_family`
    pub fn new(device: &Device, queue_family: u32) -> GpuResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.create_command_pool(&pool_info, None)? };
        Ok(Self {
            pool,
            buffers: Vec::new(),
            busy_until: None,
        })
    }

    /// Allocate a primary command buffer and begin recording
    pub fn begin(&mut self, device: &Device) -> GpuResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { device.allocate_command_buffers(&alloc_info)? }
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::SubmissionFailed("driver returned no command buffer".to_string()))?;
        self.buffers.push(buffer);

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(buffer, &begin_info)? };
        Ok(buffer)
    }

    /// Free every command buffer and recycle the pool
    pub fn reset(&mut self, device: &Device) -> GpuResult<()> {
        unsafe {
            if !self.buffers.is_empty() {
                device.free_command_buffers(self.pool, &self.buffers);
            }
            device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        }
        self.buffers.clear();
        self.busy_until = None;
        Ok(())
    }

    /// Release the pool
    pub fn destroy(&self, device: &Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_buffer_is_addressable() {
        let flags = buffer_usage_flags(BufferUsage::empty());
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_DST));

        let flags = buffer_usage_flags(BufferUsage::BUILD_INPUT | BufferUsage::SHADER_TABLE);
        assert!(flags.contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR));
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR));
    }

    #[test]
    fn test_state_access_mapping() {
        let (access, stages) = state_access(ResourceState::COPY_DEST);
        assert_eq!(access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(stages, vk::PipelineStageFlags::TRANSFER);

        let (access, _) = state_access(ResourceState::GENERIC_READ);
        assert!(access.contains(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::UNIFORM_READ));
        assert!(!access.contains(vk::AccessFlags::SHADER_WRITE));

        let (_, stages) = state_access(ResourceState::empty());
        assert_eq!(stages, vk::PipelineStageFlags::TOP_OF_PIPE);
    }

    #[test]
    fn test_memory_type_selection() {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            ..Default::default()
        };
        memory.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        memory.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&memory, 0b11, host).unwrap(), 1);
        assert_eq!(
            find_memory_type(&memory, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
        assert!(matches!(
            find_memory_type(&memory, 0b01, host),
            Err(GpuError::NoSuitableMemoryType)
        ));
    }
}
