//! One-shot CPU to GPU transfers through staging memory.
//!
//! Each upload writes into a fresh staging buffer, records a copy into the
//! destination and a transition into the destination's usage state. The
//! staging buffer is held in a [`ReleaseQueue`] until the fence value that
//! covers the copy has completed. Many uploads can share one recorder so
//! startup needs a single flush.

use crate::buffer::{
    constant_buffer_size, BufferDesc, BufferUsage, GpuBuffer, ReleaseQueue, Residency, ResourceState,
};
use crate::command::CommandRecorder;
use crate::device_context::DeviceContext;
use crate::error::{GpuError, GpuResult};

/// Staging uploads and the transient buffers they keep alive
#[derive(Default)]
pub struct UploadPipeline {
    retained: ReleaseQueue,
    bytes_uploaded: u64,
}

impl UploadPipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `data` and record its copy into `destination`, leaving the
    /// destination in `final_state`
    pub fn upload_once(
        &mut self,
        ctx: &DeviceContext,
        recorder: &mut CommandRecorder,
        data: &[u8],
        destination: &mut GpuBuffer,
        final_state: ResourceState,
    ) -> GpuResult<()> {
        let size = data.len() as u64;
        if size == 0 {
            return Err(GpuError::contract(format!(
                "empty upload into '{}'",
                destination.label()
            )));
        }
        if size > destination.size() {
            return Err(GpuError::contract(format!(
                "upload of {size} bytes does not fit '{}' ({} bytes)",
                destination.label(),
                destination.size()
            )));
        }
        if destination.residency() != Residency::Default {
            return Err(GpuError::contract(format!(
                "'{}' is upload memory; write it directly",
                destination.label()
            )));
        }

        let staging = ctx.create_buffer(&BufferDesc::upload(size, BufferUsage::COPY_SOURCE, "staging"))?;
        staging.write(0, data)?;

        recorder.transition(destination, ResourceState::COPY_DEST);
        recorder.copy_buffer(&staging, 0, destination, 0, size)?;
        recorder.transition(destination, final_state);

        log::debug!("Staged {size} bytes for '{}'", destination.label());
        self.retained.retain(staging);
        self.bytes_uploaded += size;
        Ok(())
    }

    /// Create a GPU-local buffer sized for `data` and upload into it
    pub fn create_resident(
        &mut self,
        ctx: &DeviceContext,
        recorder: &mut CommandRecorder,
        data: &[u8],
        usage: BufferUsage,
        final_state: ResourceState,
        label: &'static str,
    ) -> GpuResult<GpuBuffer> {
        let size = if usage.contains(BufferUsage::CONSTANT) {
            constant_buffer_size(data.len() as u64)
        } else {
            data.len() as u64
        };
        let desc = BufferDesc::resident(size, usage | BufferUsage::COPY_DEST, ResourceState::COPY_DEST, label);
        let mut buffer = ctx.create_buffer(&desc)?;
        self.upload_once(ctx, recorder, data, &mut buffer, final_state)?;
        Ok(buffer)
    }

    /// [`create_resident`](Self::create_resident) for plain-old-data slices
    pub fn create_resident_pod<T: bytemuck::Pod>(
        &mut self,
        ctx: &DeviceContext,
        recorder: &mut CommandRecorder,
        values: &[T],
        usage: BufferUsage,
        final_state: ResourceState,
        label: &'static str,
    ) -> GpuResult<GpuBuffer> {
        self.create_resident(ctx, recorder, bytemuck::cast_slice(values), usage, final_state, label)
    }

    /// Hold a transient buffer (staging, scratch) until the next submission completes
    pub fn retain_until_complete(&mut self, buffer: GpuBuffer) {
        self.retained.retain(buffer);
    }

    /// Everything retained so far is covered by `fence_value`
    pub fn on_submitted(&mut self, fence_value: u64) {
        self.retained.seal(fence_value);
    }

    /// Release transient buffers whose copies have executed
    pub fn retire(&mut self, completed: u64) -> usize {
        let released = self.retained.retire(completed);
        if released > 0 {
            log::debug!("Released {released} transient buffers (fence {completed})");
        }
        released
    }

    /// Transient buffers still held
    pub fn pending(&self) -> usize {
        self.retained.len()
    }

    /// Total bytes staged
    pub const fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HazardKind, HeadlessDevice};
    use crate::device::GpuDevice;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<HeadlessDevice>, DeviceContext) {
        let headless = Arc::new(HeadlessDevice::with_defaults(3, 4, 4));
        let device: Arc<dyn GpuDevice> = headless.clone();
        (headless, DeviceContext::new(device, 3, Duration::from_secs(5)))
    }

    fn submit(ctx: &mut DeviceContext, recorder: &mut CommandRecorder, upload: &mut UploadPipeline) -> u64 {
        recorder.close();
        ctx.execute(recorder).unwrap();
        let value = ctx.signal_next().unwrap();
        upload.on_submitted(value);
        value
    }

    #[test]
    fn test_upload_round_trip() {
        let (_headless, mut ctx) = setup();
        let mut upload = UploadPipeline::new();
        let mut recorder = ctx.create_recorder().unwrap();

        let bytes: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let buffer = upload
            .create_resident(
                &ctx,
                &mut recorder,
                &bytes,
                BufferUsage::STORAGE,
                ResourceState::SHADER_RESOURCE,
                "payload",
            )
            .unwrap();
        assert_eq!(buffer.state(), ResourceState::SHADER_RESOURCE);

        let value = submit(&mut ctx, &mut recorder, &mut upload);
        ctx.wait_for(value).unwrap();

        assert_eq!(buffer.read(0, bytes.len() as u64).unwrap(), bytes);
    }

    #[test]
    fn test_staging_kept_until_fence_passes() {
        let (headless, mut ctx) = setup();
        let mut upload = UploadPipeline::new();
        let mut recorder = ctx.create_recorder().unwrap();

        let _vertices = upload
            .create_resident(&ctx, &mut recorder, &[7u8; 64], BufferUsage::VERTEX, ResourceState::VERTEX_AND_CONSTANT_BUFFER, "vertices")
            .unwrap();
        let _indices = upload
            .create_resident(&ctx, &mut recorder, &[1u8; 12], BufferUsage::INDEX, ResourceState::INDEX_BUFFER, "indices")
            .unwrap();
        assert_eq!(upload.pending(), 2);

        let value = submit(&mut ctx, &mut recorder, &mut upload);
        assert_eq!(upload.retire(value - 1), 0);
        assert_eq!(upload.pending(), 2);

        ctx.wait_for(value).unwrap();
        assert_eq!(upload.retire(ctx.completed_value().unwrap()), 2);
        assert_eq!(upload.pending(), 0);
        assert!(headless
            .hazards()
            .iter()
            .all(|hazard| hazard.kind != HazardKind::BufferReleasedInFlight));
    }

    #[test]
    fn test_constant_buffer_upload_is_aligned() {
        let (_headless, ctx) = setup();
        let mut upload = UploadPipeline::new();
        let mut recorder = ctx.create_recorder().unwrap();

        let buffer = upload
            .create_resident(&ctx, &mut recorder, &[0u8; 16], BufferUsage::CONSTANT, ResourceState::VERTEX_AND_CONSTANT_BUFFER, "material constants")
            .unwrap();
        assert_eq!(buffer.size(), 256);
    }

    #[test]
    fn test_upload_larger_than_destination_is_rejected() {
        let (_headless, ctx) = setup();
        let mut upload = UploadPipeline::new();
        let mut recorder = ctx.create_recorder().unwrap();
        let mut small = ctx
            .create_buffer(&BufferDesc::resident(8, BufferUsage::VERTEX, ResourceState::COPY_DEST, "small"))
            .unwrap();

        let err = upload
            .upload_once(&ctx, &mut recorder, &[0u8; 16], &mut small, ResourceState::VERTEX_AND_CONSTANT_BUFFER)
            .unwrap_err();
        assert!(matches!(err, GpuError::ContractViolation(_)));
        assert!(recorder.commands().is_empty());
    }

    #[test]
    fn test_reupload_transitions_back_to_copy_dest() {
        let (_headless, mut ctx) = setup();
        let mut upload = UploadPipeline::new();
        let mut recorder = ctx.create_recorder().unwrap();

        let mut buffer = upload
            .create_resident(&ctx, &mut recorder, &[1u8; 32], BufferUsage::STORAGE, ResourceState::SHADER_RESOURCE, "twice")
            .unwrap();
        upload
            .upload_once(&ctx, &mut recorder, &[2u8; 32], &mut buffer, ResourceState::SHADER_RESOURCE)
            .unwrap();

        let value = submit(&mut ctx, &mut recorder, &mut upload);
        ctx.wait_for(value).unwrap();
        assert_eq!(buffer.read(0, 32).unwrap(), vec![2u8; 32]);
    }
}
