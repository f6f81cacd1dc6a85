//! Device, queue and fence bookkeeping passed explicitly to every component.

use crate::buffer::{constant_buffer_size, BufferDesc, BufferUsage, GpuBuffer};
use crate::command::{CommandRecorder, RecorderState};
use crate::device::{DeviceLimits, GpuDevice};
use crate::error::{GpuError, GpuResult};
use std::sync::Arc;
use std::time::Duration;

/// CPU view of the single monotonic fence.
///
/// `last_signaled` is the highest value handed to the queue.
/// `slot_targets[i]` is the value that, once reached, means the GPU has
/// finished the work most recently submitted from frame slot `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceTimeline {
    last_signaled: u64,
    slot_targets: Vec<u64>,
}

impl FenceTimeline {
    /// Timeline for `slot_count` frame slots, nothing signalled yet
    pub fn new(slot_count: usize) -> Self {
        Self {
            last_signaled: 0,
            slot_targets: vec![0; slot_count],
        }
    }

    /// Highest value signalled so far
    pub const fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    /// Completion target of a slot; zero if it never submitted
    pub fn slot_target(&self, slot: usize) -> u64 {
        self.slot_targets[slot]
    }

    /// Number of frame slots tracked
    pub fn slot_count(&self) -> usize {
        self.slot_targets.len()
    }

    /// Record that `slot`'s latest work completes at `value`
    ///
    /// # Panics
    ///
    /// If `value` does not increase the slot's previous target.
    pub fn set_slot_target(&mut self, slot: usize, value: u64) {
        let previous = self.slot_targets[slot];
        assert!(
            value > previous,
            "fence target for slot {slot} must increase: {previous} -> {value}"
        );
        self.slot_targets[slot] = value;
    }
}

/// Owns the device handle, its single queue and the fence timeline
pub struct DeviceContext {
    device: Arc<dyn GpuDevice>,
    limits: DeviceLimits,
    fence: FenceTimeline,
    wait_timeout: Duration,
}

impl DeviceContext {
    /// Wrap `device` for a ring of `slot_count` frames
    pub fn new(device: Arc<dyn GpuDevice>, slot_count: usize, wait_timeout: Duration) -> Self {
        let limits = device.limits();
        log::info!(
            "Device context on '{}': {} frame slots, {} back buffers",
            device.name(),
            slot_count,
            limits.back_buffer_count
        );
        Self {
            device,
            limits,
            fence: FenceTimeline::new(slot_count),
            wait_timeout,
        }
    }

    /// Shared device handle
    pub const fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Cached device limits
    pub const fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// Fence bookkeeping
    pub const fn fence(&self) -> &FenceTimeline {
        &self.fence
    }

    pub(crate) fn fence_mut(&mut self) -> &mut FenceTimeline {
        &mut self.fence
    }

    /// Allocate a buffer
    pub fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<GpuBuffer> {
        GpuBuffer::new(&self.device, desc)
    }

    /// Allocate a constant buffer, rounding `size` up to the placement alignment
    pub fn create_constant_buffer(&self, size: u64, label: &'static str) -> GpuResult<GpuBuffer> {
        let desc = BufferDesc::upload(constant_buffer_size(size), BufferUsage::CONSTANT, label);
        self.create_buffer(&desc)
    }

    /// Create an open command recorder with its own allocator
    pub fn create_recorder(&self) -> GpuResult<CommandRecorder> {
        CommandRecorder::new(&self.device)
    }

    /// Enqueue a closed command list
    pub fn execute(&self, recorder: &CommandRecorder) -> GpuResult<()> {
        if recorder.state() != RecorderState::Closed {
            return Err(GpuError::contract("only closed command lists can be executed"));
        }
        self.device.execute(recorder.allocator_id(), recorder.commands())
    }

    /// Signal the next fence value behind all executed work and return it
    pub fn signal_next(&mut self) -> GpuResult<u64> {
        let value = self.fence.last_signaled + 1;
        self.device.signal(value)?;
        self.fence.last_signaled = value;
        log::trace!("Signalled fence value {value}");
        Ok(value)
    }

    /// Highest completed fence value
    pub fn completed_value(&self) -> GpuResult<u64> {
        self.device.completed_value()
    }

    /// Block until the fence reaches `value`. Returns whether the call had to wait.
    pub fn wait_for(&self, value: u64) -> GpuResult<bool> {
        if value > self.fence.last_signaled {
            return Err(GpuError::contract(format!(
                "waiting for fence value {value} which was never signalled (last {})",
                self.fence.last_signaled
            )));
        }

        let completed = self.device.completed_value()?;
        if completed >= value {
            return Ok(false);
        }

        log::debug!("Waiting for fence value {value} (completed {completed})");
        self.device
            .wait_for_value(value, self.wait_timeout)
            .map_err(|err| match err {
                GpuError::WaitTimeout { .. } => GpuError::WaitTimeout {
                    value,
                    timeout_ms: u64::try_from(self.wait_timeout.as_millis()).unwrap_or(u64::MAX),
                },
                other => other,
            })?;
        Ok(true)
    }

    /// Signal and wait: every piece of work executed so far has completed on return
    pub fn flush(&mut self) -> GpuResult<u64> {
        let value = self.signal_next()?;
        self.wait_for(value)?;
        Ok(value)
    }

    /// Wait for the last signalled value without signalling again
    pub fn wait_idle(&self) -> GpuResult<()> {
        self.wait_for(self.fence.last_signaled)?;
        Ok(())
    }

    /// Queue the current back buffer for display
    pub fn present(&self) -> GpuResult<()> {
        self.device.present()
    }

    /// Back buffer the display wants drawn next
    pub fn current_back_buffer_index(&self) -> usize {
        self.device.current_back_buffer_index()
    }
}
