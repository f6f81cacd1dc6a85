//! The device abstraction every component records and submits through.
//!
//! [`GpuDevice`] is deliberately small: buffers, command memory, one queue, one
//! monotonic fence, acceleration-structure sizing, ray-tracing pipelines and a
//! display. Work is described as a list of [`GpuCommand`] values recorded by a
//! [`CommandRecorder`](crate::command::CommandRecorder) and handed to
//! [`GpuDevice::execute`] when the list is closed.
//!
//! Two implementations exist: [`HeadlessDevice`](crate::backend::headless::HeadlessDevice),
//! a software timeline used by tests and CI, and
//! [`VulkanDevice`](crate::backend::vulkan::VulkanDevice).

use crate::buffer::{BufferDesc, ResourceState};
use crate::error::GpuResult;
use crate::shader::RaytracingPipelineDesc;
use std::any::Any;
use std::time::Duration;

/// Handle to a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Handle to device command memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocatorId(pub u64);

/// Handle to a compiled ray-tracing pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(pub u64);

/// Byte size of a program identifier
pub const SHADER_IDENTIFIER_SIZE: usize = 32;

/// Opaque driver-assigned program identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderIdentifier(pub [u8; SHADER_IDENTIFIER_SIZE]);

impl ShaderIdentifier {
    /// Raw bytes
    pub const fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Alignment rules and display parameters reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Constant buffer placement alignment
    pub constant_buffer_alignment: u64,
    /// Acceleration structure result/scratch alignment
    pub acceleration_structure_alignment: u64,
    /// Size of a program identifier at the start of each shader record
    pub shader_identifier_size: u64,
    /// Stride alignment of shader records
    pub shader_record_alignment: u64,
    /// Alignment of a whole shader table
    pub shader_table_alignment: u64,
    /// Number of back buffers the display rotates through
    pub back_buffer_count: usize,
}

impl DeviceLimits {
    /// The values desktop ray-tracing hardware reports
    pub const fn standard(back_buffer_count: usize) -> Self {
        Self {
            constant_buffer_alignment: 256,
            acceleration_structure_alignment: 256,
            shader_identifier_size: SHADER_IDENTIFIER_SIZE as u64,
            shader_record_alignment: 32,
            shader_table_alignment: 64,
            back_buffer_count,
        }
    }
}

/// A byte range inside a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRange {
    /// Buffer handle
    pub buffer: BufferId,
    /// Start offset in bytes
    pub offset: u64,
    /// Length in bytes
    pub size: u64,
}

impl BufferRange {
    /// Whether two ranges share any byte
    pub fn overlaps(&self, other: &Self) -> bool {
        self.buffer == other.buffer
            && self.offset < other.offset.saturating_add(other.size)
            && other.offset < self.offset.saturating_add(self.size)
    }
}

/// Triangle geometry input to a bottom-level build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    /// Vertex positions; the first three `f32`s of each vertex
    pub vertices: BufferRange,
    /// Number of vertices
    pub vertex_count: u32,
    /// Byte stride between vertices
    pub vertex_stride: u64,
    /// `u32` indices
    pub indices: BufferRange,
    /// Number of indices, a multiple of three
    pub index_count: u32,
    /// Skip any-hit invocation for this geometry
    pub opaque: bool,
}

impl TriangleGeometry {
    /// Number of triangles described
    pub const fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// Bottom or top level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureKind {
    /// Built over triangles
    BottomLevel,
    /// Built over instances of bottom-level structures
    TopLevel,
}

/// What an acceleration structure build consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccelerationStructureInputs {
    /// Triangle geometry
    BottomLevel {
        /// One entry per geometry
        geometries: Vec<TriangleGeometry>,
    },
    /// Packed instance descriptions
    TopLevel {
        /// Array of [`InstanceDesc`](crate::acceleration::InstanceDesc)
        instances: BufferRange,
        /// Number of instances in the array
        instance_count: u32,
    },
}

impl AccelerationStructureInputs {
    /// Level being built
    pub const fn kind(&self) -> AccelerationStructureKind {
        match self {
            Self::BottomLevel { .. } => AccelerationStructureKind::BottomLevel,
            Self::TopLevel { .. } => AccelerationStructureKind::TopLevel,
        }
    }

    /// Triangles for a bottom level, instances for a top level
    pub fn primitive_count(&self) -> u64 {
        match self {
            Self::BottomLevel { geometries } => {
                geometries.iter().map(|g| u64::from(g.triangle_count())).sum()
            }
            Self::TopLevel { instance_count, .. } => u64::from(*instance_count),
        }
    }
}

/// Device-reported memory needed by a build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrebuildInfo {
    /// Bytes for the finished structure
    pub result_size: u64,
    /// Bytes of transient build memory
    pub scratch_size: u64,
}

/// One contiguous sub-table of a shader table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderTableRegion {
    /// Records covered by this region
    pub range: BufferRange,
    /// Distance between records
    pub stride: u64,
}

/// A buffer handed to a dispatch and the access it needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    /// Bound bytes
    pub range: BufferRange,
    /// State the buffer must be in
    pub access: ResourceState,
}

/// Parameters of one ray-tracing dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRaysDesc {
    /// Pipeline to run
    pub pipeline: PipelineId,
    /// The single ray-generation record
    pub ray_generation: ShaderTableRegion,
    /// Miss records
    pub miss: ShaderTableRegion,
    /// Hit-group records
    pub hit_group: ShaderTableRegion,
    /// Grid width
    pub width: u32,
    /// Grid height
    pub height: u32,
    /// Root arguments, passed to programs by address in this order
    pub bindings: Vec<BufferBinding>,
}

/// A recorded GPU operation
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    /// Copy bytes between buffers; both ranges have the same size
    CopyBuffer {
        /// Bytes read
        source: BufferRange,
        /// Bytes written
        destination: BufferRange,
    },
    /// Explicit state transition barrier
    Transition {
        /// Buffer changing state
        buffer: BufferId,
        /// State before the barrier
        before: ResourceState,
        /// State after the barrier
        after: ResourceState,
    },
    /// Orders all reads and writes of an unordered-access buffer
    UavBarrier {
        /// Buffer being synchronized
        buffer: BufferId,
    },
    /// Build an acceleration structure
    BuildAccelerationStructure {
        /// Geometry or instances
        inputs: AccelerationStructureInputs,
        /// Transient build memory
        scratch: BufferRange,
        /// Result memory
        destination: BufferRange,
    },
    /// Ray-tracing dispatch
    DispatchRays(DispatchRaysDesc),
    /// Fill a back buffer with one color
    ClearBackBuffer {
        /// Back buffer index
        index: usize,
        /// RGBA color
        color: [f32; 4],
    },
    /// Copy tightly packed RGBA8 pixels into a back buffer
    CopyBufferToBackBuffer {
        /// Pixel data
        source: BufferRange,
        /// Back buffer index
        index: usize,
    },
}

/// GPU device with a single submission queue and one monotonic fence.
///
/// Implementations are shared as `Arc<dyn GpuDevice>` by every owned handle
/// (buffers, command allocators, pipelines) so that dropping a handle can
/// release its device object.
///
/// # Fence contract
///
/// `signal(v)` enqueues a signal behind all previously executed work; once the
/// GPU has finished that work, `completed_value()` reports at least `v`.
/// Signalled values must strictly increase.
pub trait GpuDevice: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Alignment rules and display parameters
    fn limits(&self) -> DeviceLimits;

    /// Allocate a buffer
    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<BufferId>;

    /// Release a buffer
    fn destroy_buffer(&self, buffer: BufferId);

    /// Write CPU data into upload memory
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()>;

    /// Read buffer contents back to the CPU
    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> GpuResult<Vec<u8>>;

    /// GPU virtual address of a buffer
    fn buffer_address(&self, buffer: BufferId) -> GpuResult<u64>;

    /// Allocate command memory
    fn create_command_allocator(&self) -> GpuResult<AllocatorId>;

    /// Reclaim command memory. The GPU must be finished with it.
    fn reset_command_allocator(&self, allocator: AllocatorId) -> GpuResult<()>;

    /// Release command memory
    fn destroy_command_allocator(&self, allocator: AllocatorId);

    /// Enqueue a closed command list on the queue
    fn execute(&self, allocator: AllocatorId, commands: &[GpuCommand]) -> GpuResult<()>;

    /// Enqueue a fence signal of `value` behind all executed work
    fn signal(&self, value: u64) -> GpuResult<()>;

    /// Highest fence value the GPU has reached
    fn completed_value(&self) -> GpuResult<u64>;

    /// Block until the fence reaches `value`
    fn wait_for_value(&self, value: u64, timeout: Duration) -> GpuResult<()>;

    /// Result and scratch sizes for a build, before any alignment
    fn acceleration_structure_prebuild(&self, inputs: &AccelerationStructureInputs) -> GpuResult<PrebuildInfo>;

    /// Address by which built structures are referenced from instances and shaders
    fn acceleration_structure_address(
        &self,
        result: BufferRange,
        kind: AccelerationStructureKind,
    ) -> GpuResult<u64>;

    /// Create a ray-tracing pipeline from compiled programs
    fn create_raytracing_pipeline(&self, desc: &RaytracingPipelineDesc) -> GpuResult<PipelineId>;

    /// Release a pipeline
    fn destroy_raytracing_pipeline(&self, pipeline: PipelineId);

    /// Look up the identifier of an exported program or hit group by name
    fn shader_identifier(&self, pipeline: PipelineId, export: &str) -> Option<ShaderIdentifier>;

    /// Queue the current back buffer for display
    fn present(&self) -> GpuResult<()>;

    /// Back buffer the next frame should render into
    fn current_back_buffer_index(&self) -> usize;

    /// Downcast support
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_overlap() {
        let a = BufferRange { buffer: BufferId(1), offset: 0, size: 256 };
        let b = BufferRange { buffer: BufferId(1), offset: 256, size: 256 };
        let c = BufferRange { buffer: BufferId(1), offset: 200, size: 100 };
        let d = BufferRange { buffer: BufferId(2), offset: 0, size: 256 };
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert!(!a.overlaps(&d));
    }

    #[test]
    fn test_primitive_count() {
        let range = BufferRange { buffer: BufferId(1), offset: 0, size: 0 };
        let geometry = TriangleGeometry {
            vertices: range,
            vertex_count: 24,
            vertex_stride: 20,
            indices: range,
            index_count: 36,
            opaque: true,
        };
        let inputs = AccelerationStructureInputs::BottomLevel { geometries: vec![geometry, geometry] };
        assert_eq!(inputs.primitive_count(), 24);
        assert_eq!(inputs.kind(), AccelerationStructureKind::BottomLevel);
    }
}
