//! Bottom- and top-level acceleration structure builds.
//!
//! Every build follows the same sequence: ask the device for result and
//! scratch sizes, round both up to the structure alignment, allocate scratch
//! (unordered access) and result (acceleration structure state) memory,
//! record the build, then a UAV barrier on the result so later builds and
//! dispatches see finished data. Scratch memory is handed to the upload
//! pipeline and released once the build's fence value completes.
//!
//! Bottom-level structures live in an arena owned by the builder. A top-level
//! structure refers to them by [`BlasKey`] only and never keeps them alive.
//! It records the generation of each bottom level it was built against, so a
//! rebuilt or removed bottom level makes it stale. Structures are always
//! rebuilt from scratch; there is no refit path.

use crate::buffer::{align_up, BufferDesc, BufferUsage, GpuBuffer, ResourceState};
use crate::command::CommandRecorder;
use crate::device::{AccelerationStructureInputs, AccelerationStructureKind, PrebuildInfo, TriangleGeometry};
use crate::device_context::DeviceContext;
use crate::error::{GpuError, GpuResult};
use crate::upload::UploadPipeline;
use bytemuck::{Pod, Zeroable};
use nalgebra::Matrix4;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Non-owning reference to a bottom-level structure
    pub struct BlasKey;
}

/// Instance description consumed by a top-level build (64 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    /// Row-major 3x4 object-to-world transform
    pub transform: [f32; 12],
    /// Instance id in the low 24 bits, visibility mask in the high 8
    pub instance_id_and_mask: u32,
    /// Hit group offset in the low 24 bits, instance flags in the high 8
    pub hit_group_offset_and_flags: u32,
    /// Address of the referenced bottom-level structure
    pub acceleration_structure: u64,
}

impl InstanceDesc {
    /// Disable face culling
    pub const FLAG_TRIANGLE_CULL_DISABLE: u8 = 0x1;
    /// Treat all geometry as opaque
    pub const FLAG_FORCE_OPAQUE: u8 = 0x4;
    /// Treat all geometry as non-opaque
    pub const FLAG_FORCE_NON_OPAQUE: u8 = 0x8;

    /// Pack an instance description
    pub fn new(
        transform: &Matrix4<f32>,
        instance_id: u32,
        mask: u8,
        hit_group_offset: u32,
        flags: u8,
        acceleration_structure: u64,
    ) -> Self {
        let mut rows = [0.0f32; 12];
        for row in 0..3 {
            for column in 0..4 {
                rows[row * 4 + column] = transform[(row, column)];
            }
        }
        Self {
            transform: rows,
            instance_id_and_mask: (instance_id & 0x00FF_FFFF) | (u32::from(mask) << 24),
            hit_group_offset_and_flags: (hit_group_offset & 0x00FF_FFFF) | (u32::from(flags) << 24),
            acceleration_structure,
        }
    }

    /// Instance id
    pub const fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & 0x00FF_FFFF
    }

    /// Visibility mask
    pub const fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    /// Instance flags
    pub const fn flags(&self) -> u8 {
        (self.hit_group_offset_and_flags >> 24) as u8
    }
}

/// One placement of a bottom-level structure in a top-level build
#[derive(Debug, Clone, PartialEq)]
pub struct BlasInstance {
    /// Referenced bottom level
    pub blas: BlasKey,
    /// Object-to-world transform; the last row is ignored
    pub transform: Matrix4<f32>,
    /// Value returned by `InstanceID()` in hit programs
    pub instance_id: u32,
    /// Visibility mask
    pub mask: u8,
    /// Offset into the hit-group records
    pub hit_group_offset: u32,
    /// Force opaque (skip any-hit)
    pub opaque: bool,
}

impl BlasInstance {
    /// Identity-transformed, fully visible, opaque instance
    pub fn new(blas: BlasKey) -> Self {
        Self {
            blas,
            transform: Matrix4::identity(),
            instance_id: 0,
            mask: 0xFF,
            hit_group_offset: 0,
            opaque: true,
        }
    }

    /// Set the transform
    pub fn with_transform(mut self, transform: Matrix4<f32>) -> Self {
        self.transform = transform;
        self
    }

    /// Set the instance id
    pub const fn with_instance_id(mut self, instance_id: u32) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Set the visibility mask
    pub const fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }
}

/// A built structure and its persistent result memory
pub struct AccelerationStructure {
    kind: AccelerationStructureKind,
    result: GpuBuffer,
    address: u64,
    prebuild: PrebuildInfo,
    scratch_size: u64,
    primitive_count: u64,
}

impl AccelerationStructure {
    /// Bottom or top level
    pub const fn kind(&self) -> AccelerationStructureKind {
        self.kind
    }

    /// Result memory
    pub const fn result(&self) -> &GpuBuffer {
        &self.result
    }

    /// Allocated result size, alignment-rounded
    pub const fn result_size(&self) -> u64 {
        self.result.size()
    }

    /// Allocated scratch size, alignment-rounded
    pub const fn scratch_size(&self) -> u64 {
        self.scratch_size
    }

    /// Sizes as reported by the device
    pub const fn prebuild(&self) -> PrebuildInfo {
        self.prebuild
    }

    /// Address used by instances and shaders
    pub const fn gpu_address(&self) -> u64 {
        self.address
    }

    /// Triangles or instances
    pub const fn primitive_count(&self) -> u64 {
        self.primitive_count
    }
}

struct BottomLevelEntry {
    structure: AccelerationStructure,
    generation: u64,
}

/// A top-level structure and the instance array it was built from
pub struct TopLevelAccelerationStructure {
    structure: AccelerationStructure,
    instance_buffer: GpuBuffer,
    instances: Vec<BlasInstance>,
    built_against: Vec<(BlasKey, u64)>,
}

impl TopLevelAccelerationStructure {
    /// Built structure
    pub const fn structure(&self) -> &AccelerationStructure {
        &self.structure
    }

    /// Serialized instance descriptions
    pub const fn instance_buffer(&self) -> &GpuBuffer {
        &self.instance_buffer
    }

    /// Instances this structure was built from
    pub fn instances(&self) -> &[BlasInstance] {
        &self.instances
    }
}

/// Builds and owns bottom-level structures; builds top-level ones
#[derive(Default)]
pub struct AccelerationStructureBuilder {
    bottom_levels: SlotMap<BlasKey, BottomLevelEntry>,
    next_generation: u64,
}

impl AccelerationStructureBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Query, allocate, record and barrier one build
    fn build(
        ctx: &DeviceContext,
        upload: &mut UploadPipeline,
        recorder: &mut CommandRecorder,
        inputs: AccelerationStructureInputs,
    ) -> GpuResult<AccelerationStructure> {
        let kind = inputs.kind();
        let primitive_count = inputs.primitive_count();
        let prebuild = ctx.device().acceleration_structure_prebuild(&inputs)?;
        if prebuild.result_size == 0 {
            return Err(GpuError::AllocationFailed {
                requested: 0,
                reason: format!("device reported an empty {kind:?} result for {primitive_count} primitives"),
            });
        }

        let alignment = ctx.limits().acceleration_structure_alignment;
        let result_size = align_up(prebuild.result_size, alignment);
        let scratch_size = align_up(prebuild.scratch_size.max(1), alignment);

        let scratch = ctx.create_buffer(&BufferDesc::resident(
            scratch_size,
            BufferUsage::STORAGE,
            ResourceState::UNORDERED_ACCESS,
            "acceleration structure scratch",
        ))?;
        let label = match kind {
            AccelerationStructureKind::BottomLevel => "bottom-level acceleration structure",
            AccelerationStructureKind::TopLevel => "top-level acceleration structure",
        };
        let result = ctx.create_buffer(&BufferDesc::resident(
            result_size,
            BufferUsage::ACCELERATION_STRUCTURE,
            ResourceState::ACCELERATION_STRUCTURE,
            label,
        ))?;
        let address = ctx.device().acceleration_structure_address(result.range(), kind)?;

        recorder.build_acceleration_structure(inputs, scratch.range(), result.range());
        recorder.uav_barrier(&result);
        upload.retain_until_complete(scratch);

        log::debug!(
            "Recorded {kind:?} build: {primitive_count} primitives, result {result_size} bytes (reported {}), scratch {scratch_size} bytes",
            prebuild.result_size
        );

        Ok(AccelerationStructure {
            kind,
            result,
            address,
            prebuild,
            scratch_size,
            primitive_count,
        })
    }

    fn bottom_level_inputs(geometries: &[TriangleGeometry]) -> GpuResult<AccelerationStructureInputs> {
        if geometries.is_empty() {
            return Err(GpuError::contract("bottom-level build needs at least one geometry"));
        }
        if let Some(bad) = geometries.iter().find(|g| g.index_count == 0 || g.index_count % 3 != 0) {
            return Err(GpuError::contract(format!(
                "{} indices do not form whole triangles",
                bad.index_count
            )));
        }
        Ok(AccelerationStructureInputs::BottomLevel {
            geometries: geometries.to_vec(),
        })
    }

    /// Record a bottom-level build over triangle geometry
    pub fn build_bottom_level(
        &mut self,
        ctx: &DeviceContext,
        upload: &mut UploadPipeline,
        recorder: &mut CommandRecorder,
        geometries: &[TriangleGeometry],
    ) -> GpuResult<BlasKey> {
        let inputs = Self::bottom_level_inputs(geometries)?;
        let structure = Self::build(ctx, upload, recorder, inputs)?;
        let generation = self.bump_generation();
        Ok(self.bottom_levels.insert(BottomLevelEntry { structure, generation }))
    }

    /// Rebuild a bottom level in place. Top levels built against it become stale.
    pub fn rebuild_bottom_level(
        &mut self,
        key: BlasKey,
        ctx: &DeviceContext,
        upload: &mut UploadPipeline,
        recorder: &mut CommandRecorder,
        geometries: &[TriangleGeometry],
    ) -> GpuResult<()> {
        if !self.bottom_levels.contains_key(key) {
            return Err(GpuError::contract("rebuilding a released bottom-level structure"));
        }
        let inputs = Self::bottom_level_inputs(geometries)?;
        let structure = Self::build(ctx, upload, recorder, inputs)?;
        let generation = self.bump_generation();
        if let Some(entry) = self.bottom_levels.get_mut(key) {
            let previous = std::mem::replace(entry, BottomLevelEntry { structure, generation });
            upload.retain_until_complete(previous.structure.result);
        }
        Ok(())
    }

    /// Release a bottom level. Its memory is held until in-flight work completes.
    pub fn remove_bottom_level(&mut self, key: BlasKey, upload: &mut UploadPipeline) -> bool {
        match self.bottom_levels.remove(key) {
            Some(entry) => {
                upload.retain_until_complete(entry.structure.result);
                true
            }
            None => false,
        }
    }

    /// Look up a bottom level
    pub fn bottom_level(&self, key: BlasKey) -> Option<&AccelerationStructure> {
        self.bottom_levels.get(key).map(|entry| &entry.structure)
    }

    /// Number of live bottom levels
    pub fn bottom_level_count(&self) -> usize {
        self.bottom_levels.len()
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Serialize `instances` into upload memory and record a top-level build
    pub fn build_top_level(
        &self,
        ctx: &DeviceContext,
        upload: &mut UploadPipeline,
        recorder: &mut CommandRecorder,
        instances: &[BlasInstance],
    ) -> GpuResult<TopLevelAccelerationStructure> {
        if instances.is_empty() {
            return Err(GpuError::contract("top-level build needs at least one instance"));
        }

        let mut descs = Vec::with_capacity(instances.len());
        let mut built_against = Vec::with_capacity(instances.len());
        for (position, instance) in instances.iter().enumerate() {
            let entry = self.bottom_levels.get(instance.blas).ok_or_else(|| {
                GpuError::contract(format!(
                    "instance {position} references a released bottom-level structure"
                ))
            })?;
            let flags = if instance.opaque {
                InstanceDesc::FLAG_FORCE_OPAQUE
            } else {
                0
            };
            descs.push(InstanceDesc::new(
                &instance.transform,
                instance.instance_id,
                instance.mask,
                instance.hit_group_offset,
                flags,
                entry.structure.gpu_address(),
            ));
            built_against.push((instance.blas, entry.generation));
        }

        let instance_bytes = (descs.len() * std::mem::size_of::<InstanceDesc>()) as u64;
        let instance_buffer = ctx.create_buffer(&BufferDesc::upload(
            instance_bytes,
            BufferUsage::BUILD_INPUT,
            "instance descriptions",
        ))?;
        instance_buffer.write_pod(0, &descs)?;

        let inputs = AccelerationStructureInputs::TopLevel {
            instances: instance_buffer.range(),
            instance_count: u32::try_from(descs.len())
                .map_err(|_| GpuError::contract("too many instances"))?,
        };
        let structure = Self::build(ctx, upload, recorder, inputs)?;

        Ok(TopLevelAccelerationStructure {
            structure,
            instance_buffer,
            instances: instances.to_vec(),
            built_against,
        })
    }

    /// Full rebuild of `tlas` from its own instance list. The previous
    /// memory is held until in-flight work completes.
    pub fn rebuild_top_level(
        &self,
        ctx: &DeviceContext,
        upload: &mut UploadPipeline,
        recorder: &mut CommandRecorder,
        tlas: &mut TopLevelAccelerationStructure,
    ) -> GpuResult<()> {
        let rebuilt = self.build_top_level(ctx, upload, recorder, &tlas.instances)?;
        let previous = std::mem::replace(tlas, rebuilt);
        upload.retain_until_complete(previous.structure.result);
        upload.retain_until_complete(previous.instance_buffer);
        Ok(())
    }

    /// Whether any bottom level `tlas` references was rebuilt or released
    /// since `tlas` was built
    pub fn is_stale(&self, tlas: &TopLevelAccelerationStructure) -> bool {
        tlas.built_against.iter().any(|(key, generation)| {
            self.bottom_levels
                .get(*key)
                .map_or(true, |entry| entry.generation != *generation)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDevice;
    use crate::device::GpuDevice;
    use crate::geometry::{Geometry, MeshBuffers};
    use nalgebra::Vector3;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        headless: Arc<HeadlessDevice>,
        ctx: DeviceContext,
        upload: UploadPipeline,
        recorder: CommandRecorder,
        mesh: MeshBuffers,
    }

    fn fixture() -> Fixture {
        let headless = Arc::new(HeadlessDevice::with_defaults(3, 4, 4));
        let device: Arc<dyn GpuDevice> = headless.clone();
        let ctx = DeviceContext::new(device, 3, Duration::from_secs(5));
        let mut upload = UploadPipeline::new();
        let mut recorder = ctx.create_recorder().unwrap();
        let mesh = MeshBuffers::upload(&ctx, &mut upload, &mut recorder, &Geometry::unit_cube()).unwrap();
        Fixture {
            headless,
            ctx,
            upload,
            recorder,
            mesh,
        }
    }

    fn flush(f: &mut Fixture) {
        f.recorder.close();
        f.ctx.execute(&f.recorder).unwrap();
        let value = f.ctx.flush().unwrap();
        f.upload.on_submitted(value);
        f.upload.retire(f.ctx.completed_value().unwrap());
        f.recorder.reset().unwrap();
    }

    #[test]
    fn test_unit_cube_bottom_level() {
        let mut f = fixture();
        let mut builder = AccelerationStructureBuilder::new();
        let key = builder
            .build_bottom_level(&f.ctx, &mut f.upload, &mut f.recorder, &[f.mesh.triangles()])
            .unwrap();
        flush(&mut f);

        let blas = builder.bottom_level(key).unwrap();
        assert_eq!(blas.kind(), AccelerationStructureKind::BottomLevel);
        assert_eq!(blas.primitive_count(), 12);
        assert!(blas.result_size() > 0);
        assert_eq!(blas.result_size() % 256, 0);
        assert_eq!(blas.scratch_size() % 256, 0);
        assert!(blas.result_size() >= blas.prebuild().result_size);
        assert_eq!(blas.result().state(), ResourceState::ACCELERATION_STRUCTURE);
        assert!(f.headless.device_lost().is_none());
        assert_eq!(blas.result().read(0, 4).unwrap(), b"BLAS".to_vec());
        assert_eq!(f.upload.pending(), 0);
    }

    #[test]
    fn test_build_records_barrier_after_build() {
        let mut f = fixture();
        let mut builder = AccelerationStructureBuilder::new();
        builder
            .build_bottom_level(&f.ctx, &mut f.upload, &mut f.recorder, &[f.mesh.triangles()])
            .unwrap();

        let commands = f.recorder.commands();
        let build = commands
            .iter()
            .position(|c| matches!(c, crate::device::GpuCommand::BuildAccelerationStructure { .. }))
            .unwrap();
        assert!(matches!(commands[build + 1], crate::device::GpuCommand::UavBarrier { .. }));
    }

    #[test]
    fn test_top_level_size_is_deterministic() {
        let mut f = fixture();
        let mut builder = AccelerationStructureBuilder::new();
        let key = builder
            .build_bottom_level(&f.ctx, &mut f.upload, &mut f.recorder, &[f.mesh.triangles()])
            .unwrap();
        let instances = vec![
            BlasInstance::new(key),
            BlasInstance::new(key)
                .with_transform(Matrix4::new_translation(&Vector3::new(2.0, 0.0, 0.0)))
                .with_instance_id(1),
        ];

        let first = builder.build_top_level(&f.ctx, &mut f.upload, &mut f.recorder, &instances).unwrap();
        let second = builder.build_top_level(&f.ctx, &mut f.upload, &mut f.recorder, &instances).unwrap();
        flush(&mut f);

        assert_eq!(first.structure().result_size(), second.structure().result_size());
        assert_eq!(first.structure().result_size() % 256, 0);
        assert_eq!(first.structure().primitive_count(), 2);
        assert!(f.headless.device_lost().is_none());
    }

    #[test]
    fn test_instance_descriptions_are_serialized() {
        let mut f = fixture();
        let mut builder = AccelerationStructureBuilder::new();
        let key = builder
            .build_bottom_level(&f.ctx, &mut f.upload, &mut f.recorder, &[f.mesh.triangles()])
            .unwrap();
        let transform = Matrix4::new_translation(&Vector3::new(1.0, 2.0, 3.0));
        let instance = BlasInstance::new(key).with_transform(transform).with_instance_id(7).with_mask(0x0F);
        let tlas = builder.build_top_level(&f.ctx, &mut f.upload, &mut f.recorder, &[instance]).unwrap();

        let bytes = tlas.instance_buffer().read(0, 64).unwrap();
        let desc: InstanceDesc = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(desc.instance_id(), 7);
        assert_eq!(desc.mask(), 0x0F);
        assert_eq!(desc.flags(), InstanceDesc::FLAG_FORCE_OPAQUE);
        assert_eq!(desc.acceleration_structure, builder.bottom_level(key).unwrap().gpu_address());
        assert_eq!(&desc.transform[..4], &[1.0, 0.0, 0.0, 1.0]);
        assert_eq!(desc.transform[7], 2.0);
        assert_eq!(desc.transform[11], 3.0);
    }

    #[test]
    fn test_rebuilt_bottom_level_makes_top_level_stale() {
        let mut f = fixture();
        let mut builder = AccelerationStructureBuilder::new();
        let key = builder
            .build_bottom_level(&f.ctx, &mut f.upload, &mut f.recorder, &[f.mesh.triangles()])
            .unwrap();
        let mut tlas = builder
            .build_top_level(&f.ctx, &mut f.upload, &mut f.recorder, &[BlasInstance::new(key)])
            .unwrap();
        assert!(!builder.is_stale(&tlas));

        builder
            .rebuild_bottom_level(key, &f.ctx, &mut f.upload, &mut f.recorder, &[f.mesh.triangles()])
            .unwrap();
        assert!(builder.is_stale(&tlas));

        builder.rebuild_top_level(&f.ctx, &mut f.upload, &mut f.recorder, &mut tlas).unwrap();
        assert!(!builder.is_stale(&tlas));
        flush(&mut f);
        assert!(f.headless.device_lost().is_none());
    }

    #[test]
    fn test_released_bottom_level_is_rejected() {
        let mut f = fixture();
        let mut builder = AccelerationStructureBuilder::new();
        let key = builder
            .build_bottom_level(&f.ctx, &mut f.upload, &mut f.recorder, &[f.mesh.triangles()])
            .unwrap();
        let tlas = builder
            .build_top_level(&f.ctx, &mut f.upload, &mut f.recorder, &[BlasInstance::new(key)])
            .unwrap();

        assert!(builder.remove_bottom_level(key, &mut f.upload));
        assert!(builder.is_stale(&tlas));
        let err = builder
            .build_top_level(&f.ctx, &mut f.upload, &mut f.recorder, &[BlasInstance::new(key)])
            .err()
            .unwrap();
        assert!(matches!(err, GpuError::ContractViolation(_)));
    }

    #[test]
    fn test_empty_inputs_are_rejected() {
        let mut f = fixture();
        let mut builder = AccelerationStructureBuilder::new();
        assert!(builder.build_bottom_level(&f.ctx, &mut f.upload, &mut f.recorder, &[]).is_err());
        assert!(builder.build_top_level(&f.ctx, &mut f.upload, &mut f.recorder, &[]).is_err());
    }
}
