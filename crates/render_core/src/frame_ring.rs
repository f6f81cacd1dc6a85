//! Ring of in-flight frame slots.
//!
//! Each slot owns a command recorder (and therefore its own command memory).
//! Before a slot is recorded into again, [`FrameRing::acquire_slot`] waits on
//! the fence value stored for that slot when it was last submitted. This wait
//! is the only thing preventing the CPU from resetting command memory the GPU
//! is still reading, so it is never skipped.
//!
//! ```text
//! Idle --acquire--> Recording --submit--> Submitted --(fence reached)--> Idle
//! ```
//!
//! Any other transition is a programming error and panics.

use crate::command::CommandRecorder;
use crate::device_context::DeviceContext;
use crate::error::{GpuError, GpuResult};

/// Lifecycle of a frame slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Free to be reset and recorded
    Idle,
    /// Command list open
    Recording,
    /// Handed to the GPU; may still be executing
    Submitted,
}

/// One ring position
pub struct FrameSlot {
    index: usize,
    recorder: CommandRecorder,
    state: SlotState,
}

impl FrameSlot {
    fn new(index: usize, ctx: &DeviceContext) -> GpuResult<Self> {
        let mut recorder = ctx.create_recorder()?;
        recorder.close();
        Ok(Self {
            index,
            recorder,
            state: SlotState::Idle,
        })
    }

    /// Ring position
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Lifecycle state
    pub const fn state(&self) -> SlotState {
        self.state
    }

    /// Recorder for this frame's commands
    ///
    /// # Panics
    ///
    /// If the slot is not recording.
    pub fn recorder(&mut self) -> &mut CommandRecorder {
        assert_eq!(
            self.state,
            SlotState::Recording,
            "slot {} is not recording",
            self.index
        );
        &mut self.recorder
    }

    /// Reset command memory and start recording
    ///
    /// # Panics
    ///
    /// Unless the slot is `Idle`. A `Submitted` slot must first be waited on.
    pub fn begin_recording(&mut self) -> GpuResult<()> {
        assert_eq!(
            self.state,
            SlotState::Idle,
            "slot {} reset while {:?}; its command memory may still be in use",
            self.index,
            self.state
        );
        self.recorder.reset()?;
        self.state = SlotState::Recording;
        Ok(())
    }

    fn mark_submitted(&mut self) {
        assert_eq!(self.state, SlotState::Recording, "slot {} submitted twice", self.index);
        self.state = SlotState::Submitted;
    }

    fn mark_idle(&mut self) {
        assert_ne!(
            self.state,
            SlotState::Recording,
            "slot {} acquired while still recording",
            self.index
        );
        self.state = SlotState::Idle;
    }
}

/// What the most recent acquire waited on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastWait {
    /// Slot acquired
    pub slot: usize,
    /// Fence value required before reuse
    pub target: u64,
    /// Whether the CPU actually blocked
    pub waited: bool,
}

/// Fixed ring of frame slots
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    last_wait: Option<LastWait>,
}

impl FrameRing {
    /// Create one slot per back buffer
    pub fn new(ctx: &DeviceContext) -> GpuResult<Self> {
        let count = ctx.fence().slot_count();
        let back_buffers = ctx.limits().back_buffer_count;
        if count != back_buffers {
            return Err(GpuError::contract(format!(
                "{count} frame slots but the display has {back_buffers} back buffers"
            )));
        }

        let slots = (0..count)
            .map(|index| FrameSlot::new(index, ctx))
            .collect::<GpuResult<Vec<_>>>()?;

        log::debug!("Frame ring created with {count} slots");
        Ok(Self {
            slots,
            last_wait: None,
        })
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the ring has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Inspect a slot
    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    /// Mutable access to a slot
    pub fn slot_mut(&mut self, index: usize) -> &mut FrameSlot {
        &mut self.slots[index]
    }

    /// Diagnostics from the last acquire
    pub const fn last_wait(&self) -> Option<LastWait> {
        self.last_wait
    }

    /// Take the slot for the back buffer the display will show next.
    ///
    /// Blocks until the GPU has finished the work last submitted from that
    /// slot, then resets its command memory and opens it for recording.
    pub fn acquire_slot(&mut self, ctx: &mut DeviceContext) -> GpuResult<&mut FrameSlot> {
        let index = ctx.current_back_buffer_index();
        if index >= self.slots.len() {
            return Err(GpuError::DeviceRemoved(format!(
                "display reported back buffer {index} of {}",
                self.slots.len()
            )));
        }

        let target = ctx.fence().slot_target(index);
        let waited = ctx.wait_for(target)?;
        self.last_wait = Some(LastWait {
            slot: index,
            target,
            waited,
        });

        let slot = &mut self.slots[index];
        slot.mark_idle();
        slot.begin_recording()?;
        log::trace!("Acquired slot {index} (target {target}, waited {waited})");
        Ok(slot)
    }

    /// Close and execute the slot's commands, then signal a new fence value
    /// and store it as the slot's completion target
    pub fn submit(&mut self, ctx: &mut DeviceContext, index: usize) -> GpuResult<u64> {
        let slot = &mut self.slots[index];
        slot.recorder().close();
        slot.mark_submitted();

        ctx.execute(&slot.recorder)
            .map_err(|err| GpuError::SubmissionFailed(err.to_string()))?;
        let value = ctx.signal_next()?;
        ctx.fence_mut().set_slot_target(index, value);

        log::trace!("Submitted slot {index} with fence value {value}");
        Ok(value)
    }

    /// Block until every slot's work has completed
    pub fn wait_all(&mut self, ctx: &DeviceContext) -> GpuResult<()> {
        for slot in &mut self.slots {
            if slot.state == SlotState::Recording {
                continue;
            }
            ctx.wait_for(ctx.fence().slot_target(slot.index))?;
            slot.state = SlotState::Idle;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{CompletionMode, HeadlessDevice, HeadlessDeviceDesc};
    use crate::device::GpuDevice;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(mode: CompletionMode) -> (Arc<HeadlessDevice>, DeviceContext, FrameRing) {
        let headless = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc::new(3, 4, 4).with_mode(mode)));
        let device: Arc<dyn GpuDevice> = headless.clone();
        let ctx = DeviceContext::new(device, 3, Duration::from_secs(5));
        let ring = FrameRing::new(&ctx).unwrap();
        (headless, ctx, ring)
    }

    fn run_frame(ring: &mut FrameRing, ctx: &mut DeviceContext) -> (usize, u64) {
        let index = ring.acquire_slot(ctx).unwrap().index();
        ring.slot_mut(index).recorder().clear_back_buffer(index, [0.0, 0.0, 0.0, 1.0]);
        let value = ring.submit(ctx, index).unwrap();
        ctx.present().unwrap();
        (index, value)
    }

    #[test]
    fn test_first_acquire_does_not_wait() {
        let (_headless, mut ctx, mut ring) = setup(CompletionMode::Manual);
        let slot = ring.acquire_slot(&mut ctx).unwrap();
        assert_eq!(slot.index(), 0);
        assert_eq!(slot.state(), SlotState::Recording);
        assert_eq!(
            ring.last_wait(),
            Some(LastWait { slot: 0, target: 0, waited: false })
        );
    }

    #[test]
    fn test_submit_stores_slot_target() {
        let (_headless, mut ctx, mut ring) = setup(CompletionMode::immediate());
        let (slot, value) = run_frame(&mut ring, &mut ctx);
        assert_eq!((slot, value), (0, 1));
        assert_eq!(ctx.fence().slot_target(0), 1);
        assert_eq!(ring.slot(0).state(), SlotState::Submitted);
    }

    #[test]
    fn test_fourth_frame_waits_for_first_frame_only() {
        let (headless, mut ctx, mut ring) = setup(CompletionMode::Manual);

        let submitted: Vec<_> = (0..3).map(|_| run_frame(&mut ring, &mut ctx)).collect();
        assert_eq!(submitted, vec![(0, 1), (1, 2), (2, 3)]);
        assert_eq!(ctx.completed_value().unwrap(), 0);

        let releaser = {
            let headless = Arc::clone(&headless);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                headless.release_through(1);
            })
        };

        let slot = ring.acquire_slot(&mut ctx).unwrap().index();
        releaser.join().unwrap();

        assert_eq!(slot, 0);
        assert_eq!(
            ring.last_wait(),
            Some(LastWait { slot: 0, target: 1, waited: true })
        );
        // Frames 1 and 2 are still outstanding.
        assert_eq!(ctx.completed_value().unwrap(), 1);
        assert_eq!(ring.slot(1).state(), SlotState::Submitted);
        assert_eq!(ring.slot(2).state(), SlotState::Submitted);

        headless.release_through(3);
    }

    #[test]
    fn test_acquire_never_returns_before_target() {
        let (_headless, mut ctx, mut ring) = setup(CompletionMode::Auto {
            latency: Duration::from_millis(5),
        });

        for _ in 0..9 {
            let index = ring.acquire_slot(&mut ctx).unwrap().index();
            let target = ctx.fence().slot_target(index);
            assert!(ctx.completed_value().unwrap() >= target);
            ring.slot_mut(index).recorder().clear_back_buffer(index, [1.0; 4]);
            ring.submit(&mut ctx, index).unwrap();
            ctx.present().unwrap();
        }
        ring.wait_all(&ctx).unwrap();
        assert!(ctx.completed_value().unwrap() >= 9);
    }

    #[test]
    fn test_slot_targets_strictly_increase_on_reuse() {
        let (_headless, mut ctx, mut ring) = setup(CompletionMode::immediate());
        let mut previous = [0u64; 3];
        for _ in 0..6 {
            let (slot, value) = run_frame(&mut ring, &mut ctx);
            assert!(value > previous[slot]);
            previous[slot] = value;
        }
    }

    #[test]
    #[should_panic(expected = "may still be in use")]
    fn test_resetting_submitted_slot_panics() {
        let (_headless, mut ctx, mut ring) = setup(CompletionMode::Manual);
        run_frame(&mut ring, &mut ctx);
        ring.slot_mut(0).begin_recording().unwrap();
    }

    #[test]
    fn test_ring_size_must_match_back_buffers() {
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::with_defaults(2, 4, 4));
        let ctx = DeviceContext::new(device, 3, Duration::from_secs(1));
        assert!(matches!(FrameRing::new(&ctx), Err(GpuError::ContractViolation(_))));
    }
}
