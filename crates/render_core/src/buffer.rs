//! GPU buffers with explicit residency and access state.
//!
//! A [`GpuBuffer`] is an owned handle: dropping it releases the allocation on
//! the device. Its [`ResourceState`] only changes through
//! [`CommandRecorder::transition`](crate::command::CommandRecorder::transition),
//! so every state change is a recorded barrier.

use crate::device::{BufferId, BufferRange, GpuDevice};
use crate::error::{GpuError, GpuResult};
use bitflags::bitflags;
use std::collections::VecDeque;
use std::sync::Arc;

/// Minimum placement alignment for constant buffers
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Round `value` up to a multiple of `alignment` (a power of two)
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Allocation size for a constant buffer holding `size` bytes
pub const fn constant_buffer_size(size: u64) -> u64 {
    (size + 255) & !255
}

/// Which memory pool a buffer lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    /// CPU-writable, GPU-readable
    Upload,
    /// GPU-local, reachable from the CPU only through copies
    Default,
}

bitflags! {
    /// Access state of a buffer as tracked by the driver
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        /// Read as vertex data or constants
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        /// Read as index data
        const INDEX_BUFFER = 1 << 1;
        /// Read/write from shaders
        const UNORDERED_ACCESS = 1 << 2;
        /// Read from shaders
        const SHADER_RESOURCE = 1 << 3;
        /// Destination of a copy
        const COPY_DEST = 1 << 4;
        /// Source of a copy
        const COPY_SOURCE = 1 << 5;
        /// Holds a built acceleration structure
        const ACCELERATION_STRUCTURE = 1 << 6;
        /// Every read-only state; the only state upload memory may be in
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::SHADER_RESOURCE.bits()
            | Self::COPY_SOURCE.bits();
    }
}

impl ResourceState {
    /// Whether the GPU only reads the buffer in this state
    pub fn is_read_only(self) -> bool {
        !self.is_empty() && Self::GENERIC_READ.contains(self)
    }

    /// Whether an operation needing `access` may run in this state
    pub fn permits(self, access: Self) -> bool {
        self.contains(access)
    }
}

bitflags! {
    /// What a buffer will be used for
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Copy source
        const COPY_SOURCE = 1 << 0;
        /// Copy destination
        const COPY_DEST = 1 << 1;
        /// Vertex data
        const VERTEX = 1 << 2;
        /// Index data
        const INDEX = 1 << 3;
        /// Constant (uniform) data, placement-aligned
        const CONSTANT = 1 << 4;
        /// Shader read/write storage
        const STORAGE = 1 << 5;
        /// Acceleration structure result memory
        const ACCELERATION_STRUCTURE = 1 << 6;
        /// Read by an acceleration structure build
        const BUILD_INPUT = 1 << 7;
        /// Shader binding table records
        const SHADER_TABLE = 1 << 8;
    }
}

/// Parameters for a buffer allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// Memory pool
    pub residency: Residency,
    /// Intended uses
    pub usage: BufferUsage,
    /// State the buffer is created in
    pub initial_state: ResourceState,
    /// Debug name
    pub label: &'static str,
}

impl BufferDesc {
    /// CPU-writable buffer; always starts in `GENERIC_READ`
    pub const fn upload(size: u64, usage: BufferUsage, label: &'static str) -> Self {
        Self {
            size,
            residency: Residency::Upload,
            usage,
            initial_state: ResourceState::GENERIC_READ,
            label,
        }
    }

    /// GPU-local buffer in the given initial state
    pub const fn resident(
        size: u64,
        usage: BufferUsage,
        initial_state: ResourceState,
        label: &'static str,
    ) -> Self {
        Self {
            size,
            residency: Residency::Default,
            usage,
            initial_state,
            label,
        }
    }

    /// Check the allocation rules that do not depend on the device
    pub fn validate(&self, constant_alignment: u64) -> GpuResult<()> {
        if self.size == 0 {
            return Err(GpuError::contract(format!("buffer '{}' has zero size", self.label)));
        }
        if self.usage.contains(BufferUsage::CONSTANT) && self.size % constant_alignment != 0 {
            return Err(GpuError::contract(format!(
                "constant buffer '{}' size {} is not a multiple of {}",
                self.label, self.size, constant_alignment
            )));
        }
        if self.residency == Residency::Upload && self.initial_state != ResourceState::GENERIC_READ {
            return Err(GpuError::contract(format!(
                "upload buffer '{}' must be created in GENERIC_READ, not {:?}",
                self.label, self.initial_state
            )));
        }
        Ok(())
    }
}

/// Owned GPU buffer
pub struct GpuBuffer {
    device: Arc<dyn GpuDevice>,
    id: BufferId,
    size: u64,
    residency: Residency,
    usage: BufferUsage,
    state: ResourceState,
    address: u64,
    label: &'static str,
}

impl GpuBuffer {
    /// Allocate a buffer on `device`
    pub fn new(device: &Arc<dyn GpuDevice>, desc: &BufferDesc) -> GpuResult<Self> {
        desc.validate(device.limits().constant_buffer_alignment)?;

        let id = device.create_buffer(desc)?;
        let address = match device.buffer_address(id) {
            Ok(address) => address,
            Err(err) => {
                device.destroy_buffer(id);
                return Err(err);
            }
        };

        log::trace!("Created buffer '{}' ({} bytes, {:?})", desc.label, desc.size, desc.residency);

        Ok(Self {
            device: Arc::clone(device),
            id,
            size: desc.size,
            residency: desc.residency,
            usage: desc.usage,
            state: desc.initial_state,
            address,
            label: desc.label,
        })
    }

    /// Write CPU data into an upload buffer
    pub fn write(&self, offset: u64, data: &[u8]) -> GpuResult<()> {
        if self.residency != Residency::Upload {
            return Err(GpuError::contract(format!(
                "buffer '{}' is not CPU-writable",
                self.label
            )));
        }
        self.check_bounds(offset, data.len() as u64)?;
        self.device.write_buffer(self.id, offset, data)
    }

    /// Write plain-old-data values into an upload buffer
    pub fn write_pod<T: bytemuck::Pod>(&self, offset: u64, values: &[T]) -> GpuResult<()> {
        self.write(offset, bytemuck::cast_slice(values))
    }

    /// Read back buffer contents (test and readback harnesses)
    pub fn read(&self, offset: u64, len: u64) -> GpuResult<Vec<u8>> {
        self.check_bounds(offset, len)?;
        self.device.read_buffer(self.id, offset, len)
    }

    fn check_bounds(&self, offset: u64, len: u64) -> GpuResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(GpuError::contract(format!(
                "range {offset}+{len} exceeds buffer '{}' of {} bytes",
                self.label, self.size
            ))),
        }
    }

    /// Device handle
    pub const fn id(&self) -> BufferId {
        self.id
    }

    /// Size in bytes
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Memory pool
    pub const fn residency(&self) -> Residency {
        self.residency
    }

    /// Declared uses
    pub const fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Current access state
    pub const fn state(&self) -> ResourceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ResourceState) {
        self.state = state;
    }

    /// GPU virtual address of the first byte
    pub const fn gpu_address(&self) -> u64 {
        self.address
    }

    /// Debug name
    pub const fn label(&self) -> &'static str {
        self.label
    }

    /// The whole buffer as a range
    pub const fn range(&self) -> BufferRange {
        BufferRange {
            buffer: self.id,
            offset: 0,
            size: self.size,
        }
    }

    /// A sub-range of the buffer
    pub fn sub_range(&self, offset: u64, size: u64) -> GpuResult<BufferRange> {
        self.check_bounds(offset, size)?;
        Ok(BufferRange {
            buffer: self.id,
            offset,
            size,
        })
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("label", &self.label)
            .field("id", &self.id)
            .field("size", &self.size)
            .field("residency", &self.residency)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.id);
    }
}

/// Buffers the GPU may still be reading, held until their fence value completes
#[derive(Default)]
pub struct ReleaseQueue {
    unsubmitted: Vec<GpuBuffer>,
    in_flight: VecDeque<(u64, Vec<GpuBuffer>)>,
}

impl ReleaseQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `buffer` until the work that will be submitted next has completed
    pub fn retain(&mut self, buffer: GpuBuffer) {
        self.unsubmitted.push(buffer);
    }

    /// Tag everything retained since the last call with the fence value that covers it
    pub fn seal(&mut self, fence_value: u64) {
        if self.unsubmitted.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.unsubmitted);
        self.in_flight.push_back((fence_value, batch));
    }

    /// Drop every buffer whose fence value has completed; returns how many were released
    pub fn retire(&mut self, completed: u64) -> usize {
        let mut released = 0;
        while let Some((value, _)) = self.in_flight.front() {
            if *value > completed {
                break;
            }
            if let Some((_, batch)) = self.in_flight.pop_front() {
                released += batch.len();
            }
        }
        released
    }

    /// Buffers not yet released
    pub fn len(&self) -> usize {
        self.unsubmitted.len() + self.in_flight.iter().map(|(_, batch)| batch.len()).sum::<usize>()
    }

    /// Whether nothing is held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDevice;

    fn device() -> Arc<dyn GpuDevice> {
        Arc::new(HeadlessDevice::with_defaults(3, 4, 4))
    }

    #[test]
    fn test_constant_buffer_size_rounds_to_256() {
        for size in [1u64, 80, 255, 256, 257, 1000, 4096] {
            assert_eq!(constant_buffer_size(size), ((size + 255) & !255));
            assert_eq!(constant_buffer_size(size) % CONSTANT_BUFFER_ALIGNMENT, 0);
            assert!(constant_buffer_size(size) >= size);
        }
        assert_eq!(constant_buffer_size(80), 256);
        assert_eq!(constant_buffer_size(257), 512);
        assert_eq!(align_up(40, 32), 64);
        assert_eq!(align_up(64, 64), 64);
    }

    #[test]
    fn test_read_only_states() {
        assert!(ResourceState::GENERIC_READ.is_read_only());
        assert!(ResourceState::SHADER_RESOURCE.is_read_only());
        assert!(!ResourceState::COPY_DEST.is_read_only());
        assert!(!ResourceState::UNORDERED_ACCESS.is_read_only());
        assert!(ResourceState::GENERIC_READ.permits(ResourceState::COPY_SOURCE));
    }

    #[test]
    fn test_misaligned_constant_buffer_is_rejected() {
        let device = device();
        let desc = BufferDesc::upload(100, BufferUsage::CONSTANT, "view constants");
        let err = GpuBuffer::new(&device, &desc).unwrap_err();
        assert!(matches!(err, GpuError::ContractViolation(_)));

        let desc = BufferDesc::upload(constant_buffer_size(100), BufferUsage::CONSTANT, "view constants");
        assert_eq!(GpuBuffer::new(&device, &desc).unwrap().size(), 256);
    }

    #[test]
    fn test_upload_buffer_must_start_generic_read() {
        let device = device();
        let mut desc = BufferDesc::upload(64, BufferUsage::COPY_SOURCE, "staging");
        desc.initial_state = ResourceState::COPY_DEST;
        assert!(GpuBuffer::new(&device, &desc).is_err());
    }

    #[test]
    fn test_write_and_read_upload_buffer() {
        let device = device();
        let buffer = GpuBuffer::new(&device, &BufferDesc::upload(16, BufferUsage::COPY_SOURCE, "bytes")).unwrap();
        buffer.write(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(buffer.read(4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(buffer.write(14, &[0; 4]).is_err());
        assert_ne!(buffer.gpu_address(), 0);
    }

    #[test]
    fn test_default_buffer_is_not_cpu_writable() {
        let device = device();
        let desc = BufferDesc::resident(16, BufferUsage::VERTEX, ResourceState::COPY_DEST, "vertices");
        let buffer = GpuBuffer::new(&device, &desc).unwrap();
        assert!(buffer.write(0, &[0; 4]).is_err());
    }

    #[test]
    fn test_release_queue_retires_by_fence_value() {
        let device = device();
        let make = || GpuBuffer::new(&device, &BufferDesc::upload(8, BufferUsage::COPY_SOURCE, "staging")).unwrap();

        let mut queue = ReleaseQueue::new();
        queue.retain(make());
        queue.seal(1);
        queue.retain(make());
        queue.retain(make());
        queue.seal(2);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.retire(0), 0);
        assert_eq!(queue.retire(1), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.retire(5), 2);
        assert!(queue.is_empty());
    }
}
