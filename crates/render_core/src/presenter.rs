//! Per-tick frame driver: begin, submit, present.

use crate::device_context::DeviceContext;
use crate::error::GpuResult;
use crate::frame_ring::{FrameRing, FrameSlot};

/// Advances the frame ring and talks to the display
pub struct Presenter {
    ring: FrameRing,
    active: Option<usize>,
    pending_present: bool,
    frames_presented: u64,
}

impl Presenter {
    /// Create the frame ring for `ctx`
    pub fn new(ctx: &DeviceContext) -> GpuResult<Self> {
        Ok(Self {
            ring: FrameRing::new(ctx)?,
            active: None,
            pending_present: false,
            frames_presented: 0,
        })
    }

    /// Acquire the slot for the back buffer to draw next, waiting on its fence if needed
    ///
    /// # Panics
    ///
    /// If the previous frame was begun but never presented.
    pub fn begin_frame(&mut self, ctx: &mut DeviceContext) -> GpuResult<&mut FrameSlot> {
        assert!(
            self.active.is_none() && !self.pending_present,
            "begin_frame called before the previous frame was presented"
        );
        let slot = self.ring.acquire_slot(ctx)?;
        self.active = Some(slot.index());
        Ok(slot)
    }

    /// Submit the active slot; returns the fence value covering its work
    ///
    /// # Panics
    ///
    /// If no frame is active.
    pub fn submit(&mut self, ctx: &mut DeviceContext) -> GpuResult<u64> {
        let Some(index) = self.active.take() else {
            panic!("submit called without an active frame");
        };
        let value = self.ring.submit(ctx, index)?;
        self.pending_present = true;
        Ok(value)
    }

    /// Present and query which back buffer comes next. The next index is
    /// whatever the display reports; it is not assumed to be the previous
    /// index plus one.
    ///
    /// # Panics
    ///
    /// If the current frame has not been submitted.
    pub fn present(&mut self, ctx: &mut DeviceContext) -> GpuResult<usize> {
        assert!(self.pending_present, "present called before submit");
        ctx.present()?;
        self.pending_present = false;
        self.frames_presented += 1;
        Ok(ctx.current_back_buffer_index())
    }

    /// Frame ring
    pub const fn ring(&self) -> &FrameRing {
        &self.ring
    }

    /// Index of the slot currently recording
    pub const fn active_slot(&self) -> Option<usize> {
        self.active
    }

    /// Frames handed to the display so far
    pub const fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Wait for every slot to drain
    pub fn wait_all(&mut self, ctx: &DeviceContext) -> GpuResult<()> {
        self.ring.wait_all(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessDevice, HeadlessDeviceDesc};
    use crate::config::BackBufferOrder;
    use crate::device::GpuDevice;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(order: BackBufferOrder) -> (DeviceContext, Presenter) {
        let desc = HeadlessDeviceDesc::new(3, 2, 2).with_order(order);
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new(desc));
        let ctx = DeviceContext::new(device, 3, Duration::from_secs(5));
        let presenter = Presenter::new(&ctx).unwrap();
        (ctx, presenter)
    }

    fn tick(ctx: &mut DeviceContext, presenter: &mut Presenter) -> (usize, usize) {
        let slot = presenter.begin_frame(ctx).unwrap();
        let index = slot.index();
        slot.recorder().clear_back_buffer(index, [0.2, 0.4, 0.6, 1.0]);
        presenter.submit(ctx).unwrap();
        let next = presenter.present(ctx).unwrap();
        (index, next)
    }

    #[test]
    fn test_round_robin_rotation() {
        let (mut ctx, mut presenter) = setup(BackBufferOrder::RoundRobin);
        let order: Vec<_> = (0..4).map(|_| tick(&mut ctx, &mut presenter)).collect();
        assert_eq!(order, vec![(0, 1), (1, 2), (2, 0), (0, 1)]);
        assert_eq!(presenter.frames_presented(), 4);
    }

    #[test]
    fn test_next_slot_is_queried_not_assumed() {
        let (mut ctx, mut presenter) = setup(BackBufferOrder::Sequence(vec![2, 0, 1]));
        let slots: Vec<_> = (0..4).map(|_| tick(&mut ctx, &mut presenter).0).collect();
        assert_eq!(slots, vec![0, 2, 0, 1]);
        presenter.wait_all(&ctx).unwrap();
    }

    #[test]
    #[should_panic(expected = "before submit")]
    fn test_present_before_submit_panics() {
        let (mut ctx, mut presenter) = setup(BackBufferOrder::RoundRobin);
        presenter.begin_frame(&mut ctx).unwrap();
        let _ = presenter.present(&mut ctx);
    }
}
