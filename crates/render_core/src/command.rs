//! Command memory and command list recording.

use crate::buffer::{GpuBuffer, ResourceState};
use crate::device::{
    AccelerationStructureInputs, AllocatorId, BufferRange, DispatchRaysDesc, GpuCommand, GpuDevice,
};
use crate::error::{GpuError, GpuResult};
use std::sync::Arc;

/// Command memory with RAII cleanup
pub struct CommandAllocator {
    device: Arc<dyn GpuDevice>,
    id: AllocatorId,
}

impl CommandAllocator {
    /// Allocate command memory on `device`
    pub fn new(device: &Arc<dyn GpuDevice>) -> GpuResult<Self> {
        let id = device.create_command_allocator()?;
        Ok(Self {
            device: Arc::clone(device),
            id,
        })
    }

    /// Reclaim all memory. The GPU must have finished every list recorded from it.
    pub fn reset(&mut self) -> GpuResult<()> {
        self.device.reset_command_allocator(self.id)
    }

    /// Device handle
    pub const fn id(&self) -> AllocatorId {
        self.id
    }
}

impl Drop for CommandAllocator {
    fn drop(&mut self) {
        self.device.destroy_command_allocator(self.id);
    }
}

/// Whether a recorder accepts commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// Recording
    Open,
    /// Ready for submission
    Closed,
}

/// Command list recorder backed by its own allocator
///
/// Recording into a closed list is a programming error and panics.
pub struct CommandRecorder {
    allocator: CommandAllocator,
    commands: Vec<GpuCommand>,
    state: RecorderState,
}

impl CommandRecorder {
    /// Create an open recorder
    pub fn new(device: &Arc<dyn GpuDevice>) -> GpuResult<Self> {
        Ok(Self {
            allocator: CommandAllocator::new(device)?,
            commands: Vec::new(),
            state: RecorderState::Open,
        })
    }

    /// Current state
    pub const fn state(&self) -> RecorderState {
        self.state
    }

    /// Whether commands can be recorded
    pub fn is_open(&self) -> bool {
        self.state == RecorderState::Open
    }

    /// Recorded commands
    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    /// Allocator backing this list
    pub const fn allocator_id(&self) -> AllocatorId {
        self.allocator.id()
    }

    /// Finish recording
    pub fn close(&mut self) {
        assert!(self.is_open(), "command list closed twice");
        self.state = RecorderState::Closed;
    }

    /// Reset the allocator and reopen the list, discarding recorded commands
    pub fn reset(&mut self) -> GpuResult<()> {
        self.allocator.reset()?;
        self.commands.clear();
        self.state = RecorderState::Open;
        Ok(())
    }

    fn record(&mut self, command: GpuCommand) {
        assert!(self.is_open(), "recording into a closed command list: {command:?}");
        self.commands.push(command);
    }

    /// Copy `size` bytes between buffers
    pub fn copy_buffer(
        &mut self,
        source: &GpuBuffer,
        source_offset: u64,
        destination: &GpuBuffer,
        destination_offset: u64,
        size: u64,
    ) -> GpuResult<()> {
        let source = source.sub_range(source_offset, size)?;
        let destination = destination.sub_range(destination_offset, size)?;
        self.record(GpuCommand::CopyBuffer { source, destination });
        Ok(())
    }

    /// Record a barrier moving `buffer` into `after` and update its tracked state
    pub fn transition(&mut self, buffer: &mut GpuBuffer, after: ResourceState) {
        let before = buffer.state();
        if before == after {
            return;
        }
        self.record(GpuCommand::Transition {
            buffer: buffer.id(),
            before,
            after,
        });
        buffer.set_state(after);
    }

    /// Order every prior access of `buffer` before any later one
    pub fn uav_barrier(&mut self, buffer: &GpuBuffer) {
        self.record(GpuCommand::UavBarrier { buffer: buffer.id() });
    }

    /// Build an acceleration structure into `destination`
    pub fn build_acceleration_structure(
        &mut self,
        inputs: AccelerationStructureInputs,
        scratch: BufferRange,
        destination: BufferRange,
    ) {
        self.record(GpuCommand::BuildAccelerationStructure {
            inputs,
            scratch,
            destination,
        });
    }

    /// Dispatch rays
    pub fn dispatch_rays(&mut self, desc: DispatchRaysDesc) {
        self.record(GpuCommand::DispatchRays(desc));
    }

    /// Clear a back buffer
    pub fn clear_back_buffer(&mut self, index: usize, color: [f32; 4]) {
        self.record(GpuCommand::ClearBackBuffer { index, color });
    }

    /// Copy RGBA8 pixels from `source` into a back buffer
    pub fn copy_to_back_buffer(&mut self, source: &GpuBuffer, index: usize) -> GpuResult<()> {
        if !source.state().permits(ResourceState::COPY_SOURCE) {
            return Err(GpuError::contract(format!(
                "'{}' must be in COPY_SOURCE to be presented, is {:?}",
                source.label(),
                source.state()
            )));
        }
        self.record(GpuCommand::CopyBufferToBackBuffer {
            source: source.range(),
            index,
        });
        Ok(())
    }
}
