//! Shader binding table layout and construction.
//!
//! A table is a run of fixed-stride records. Each record starts with the
//! program identifier looked up from the compiled pipeline, followed by the
//! record's local arguments, zero-padded to the stride:
//!
//! ```text
//! | raygen | miss 0 | miss 1 | ... | hit group 0 | ... | padding to table alignment |
//! ```
//!
//! The order is fixed: exactly one ray-generation record, then the misses,
//! then the hit groups. Tables are immutable once built; a changed program
//! set means building a new table.

use crate::buffer::{align_up, BufferDesc, BufferUsage, GpuBuffer};
use crate::device::{BufferRange, DeviceLimits, ShaderTableRegion};
use crate::device_context::DeviceContext;
use crate::error::{GpuError, GpuResult};
use crate::shader::RaytracingPipeline;

/// Which sub-table a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProgramKind {
    /// Ray generation
    RayGeneration,
    /// Miss
    Miss,
    /// Hit group
    HitGroup,
}

/// A program export and its local arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderRecord {
    /// Export name looked up against the pipeline
    pub export: String,
    /// Sub-table
    pub kind: ProgramKind,
    /// Bytes copied after the identifier
    pub local_arguments: Vec<u8>,
}

impl ShaderRecord {
    /// Create a record
    pub fn new(kind: ProgramKind, export: impl Into<String>, local_arguments: Vec<u8>) -> Self {
        Self {
            export: export.into(),
            kind,
            local_arguments,
        }
    }
}

/// Computed sizes and record counts of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderTableLayout {
    /// Bytes between consecutive records
    pub record_stride: u64,
    /// Allocation size
    pub total_size: u64,
    /// Miss records
    pub miss_count: u64,
    /// Hit-group records
    pub hit_group_count: u64,
}

impl ShaderTableLayout {
    /// Records in the table
    pub const fn record_count(&self) -> u64 {
        1 + self.miss_count + self.hit_group_count
    }

    /// Byte offset of the first miss record
    pub const fn miss_offset(&self) -> u64 {
        self.record_stride
    }

    /// Byte offset of the first hit-group record
    pub const fn hit_group_offset(&self) -> u64 {
        self.record_stride * (1 + self.miss_count)
    }
}

/// Collects records in table order
#[derive(Debug, Clone, Default)]
pub struct ShaderTableBuilder {
    ray_generation: Vec<ShaderRecord>,
    misses: Vec<ShaderRecord>,
    hit_groups: Vec<ShaderRecord>,
}

impl ShaderTableBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept an already ordered record list
    pub fn from_records(records: impl IntoIterator<Item = ShaderRecord>) -> GpuResult<Self> {
        let mut builder = Self::new();
        let mut last = ProgramKind::RayGeneration;
        for (position, record) in records.into_iter().enumerate() {
            if record.kind < last {
                return Err(GpuError::contract(format!(
                    "record {position} ('{}', {:?}) follows a {last:?} record",
                    record.export, record.kind
                )));
            }
            last = record.kind;
            builder.push(record);
        }
        Ok(builder)
    }

    fn push(&mut self, record: ShaderRecord) {
        match record.kind {
            ProgramKind::RayGeneration => self.ray_generation.push(record),
            ProgramKind::Miss => self.misses.push(record),
            ProgramKind::HitGroup => self.hit_groups.push(record),
        }
    }

    /// Set the ray-generation record
    pub fn ray_generation(mut self, export: impl Into<String>, local_arguments: Vec<u8>) -> Self {
        self.push(ShaderRecord::new(ProgramKind::RayGeneration, export, local_arguments));
        self
    }

    /// Append a miss record
    pub fn miss(mut self, export: impl Into<String>, local_arguments: Vec<u8>) -> Self {
        self.push(ShaderRecord::new(ProgramKind::Miss, export, local_arguments));
        self
    }

    /// Append a hit-group record
    pub fn hit_group(mut self, export: impl Into<String>, local_arguments: Vec<u8>) -> Self {
        self.push(ShaderRecord::new(ProgramKind::HitGroup, export, local_arguments));
        self
    }

    /// Records in table order
    pub fn records(&self) -> impl Iterator<Item = &ShaderRecord> {
        self.ray_generation
            .iter()
            .chain(self.misses.iter())
            .chain(self.hit_groups.iter())
    }

    /// Compute stride and size under `limits`
    pub fn layout(&self, limits: &DeviceLimits) -> GpuResult<ShaderTableLayout> {
        if self.ray_generation.len() != 1 {
            return Err(GpuError::contract(format!(
                "shader table needs exactly one ray-generation record, has {}",
                self.ray_generation.len()
            )));
        }

        let max_arguments = self
            .records()
            .map(|record| record.local_arguments.len() as u64)
            .max()
            .unwrap_or(0);
        let record_stride = align_up(
            limits.shader_identifier_size + max_arguments,
            limits.shader_record_alignment,
        );
        let miss_count = self.misses.len() as u64;
        let hit_group_count = self.hit_groups.len() as u64;
        let total_size = align_up(
            record_stride * (1 + miss_count + hit_group_count),
            limits.shader_table_alignment,
        );

        Ok(ShaderTableLayout {
            record_stride,
            total_size,
            miss_count,
            hit_group_count,
        })
    }

    /// Look up every identifier in `pipeline` and write the table to upload memory
    pub fn build(&self, ctx: &DeviceContext, pipeline: &RaytracingPipeline) -> GpuResult<ShaderTable> {
        let layout = self.layout(ctx.limits())?;
        let identifier_size = ctx.limits().shader_identifier_size as usize;
        let stride = layout.record_stride as usize;

        let mut bytes = vec![0u8; layout.total_size as usize];
        for (position, record) in self.records().enumerate() {
            let identifier = pipeline.identifier(&record.export)?;
            let start = position * stride;
            let identifier_bytes = identifier.as_bytes();
            let copied = identifier_size.min(identifier_bytes.len());
            bytes[start..start + copied].copy_from_slice(&identifier_bytes[..copied]);
            let arguments = start + identifier_size;
            bytes[arguments..arguments + record.local_arguments.len()]
                .copy_from_slice(&record.local_arguments);
        }

        let buffer = ctx.create_buffer(&BufferDesc::upload(
            layout.total_size,
            BufferUsage::SHADER_TABLE,
            "shader table",
        ))?;
        buffer.write(0, &bytes)?;

        log::info!(
            "Built shader table: {} records, stride {}, {} bytes",
            layout.record_count(),
            layout.record_stride,
            layout.total_size
        );
        Ok(ShaderTable { buffer, layout })
    }
}

/// A built shader table
pub struct ShaderTable {
    buffer: GpuBuffer,
    layout: ShaderTableLayout,
}

impl ShaderTable {
    /// Backing upload buffer
    pub const fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    /// Stride and size
    pub const fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }

    fn region(&self, offset: u64, count: u64) -> ShaderTableRegion {
        ShaderTableRegion {
            range: BufferRange {
                buffer: self.buffer.id(),
                offset,
                size: self.layout.record_stride * count,
            },
            stride: self.layout.record_stride,
        }
    }

    /// The ray-generation record
    pub fn ray_generation_region(&self) -> ShaderTableRegion {
        self.region(0, 1)
    }

    /// The miss records
    pub fn miss_region(&self) -> ShaderTableRegion {
        self.region(self.layout.miss_offset(), self.layout.miss_count)
    }

    /// The hit-group records
    pub fn hit_group_region(&self) -> ShaderTableRegion {
        self.region(self.layout.hit_group_offset(), self.layout.hit_group_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDevice;
    use crate::device::GpuDevice;
    use crate::shader::tests::pipeline_desc;
    use std::sync::Arc;
    use std::time::Duration;

    fn three_records() -> ShaderTableBuilder {
        ShaderTableBuilder::new()
            .ray_generation("RayGen", vec![1; 8])
            .miss("Miss", vec![2; 8])
            .hit_group("HitGroup", vec![3; 8])
    }

    #[test]
    fn test_three_record_layout() {
        let limits = DeviceLimits::standard(3);
        let layout = three_records().layout(&limits).unwrap();
        assert_eq!(layout.record_stride, align_up(32 + 8, limits.shader_record_alignment));
        assert_eq!(layout.record_stride, 64);
        assert_eq!(layout.total_size, align_up(3 * layout.record_stride, limits.shader_table_alignment));
        assert_eq!(layout.total_size, 192);
    }

    #[test]
    fn test_stride_follows_largest_arguments() {
        let limits = DeviceLimits {
            shader_record_alignment: 64,
            shader_table_alignment: 256,
            ..DeviceLimits::standard(3)
        };
        let layout = ShaderTableBuilder::new()
            .ray_generation("RayGen", Vec::new())
            .miss("Miss", vec![0; 8])
            .miss("ShadowMiss", Vec::new())
            .hit_group("HitGroup", vec![0; 40])
            .layout(&limits)
            .unwrap();
        assert_eq!(layout.record_stride, 128);
        assert_eq!(layout.total_size, 512);
        assert_eq!(layout.miss_offset(), 128);
        assert_eq!(layout.hit_group_offset(), 384);
    }

    #[test]
    fn test_exactly_one_ray_generation_record() {
        let limits = DeviceLimits::standard(3);
        assert!(ShaderTableBuilder::new().miss("Miss", Vec::new()).layout(&limits).is_err());
        let two = three_records().ray_generation("Other", Vec::new());
        assert!(two.layout(&limits).is_err());
    }

    #[test]
    fn test_out_of_order_records_are_rejected() {
        let records = vec![
            ShaderRecord::new(ProgramKind::RayGeneration, "RayGen", Vec::new()),
            ShaderRecord::new(ProgramKind::HitGroup, "HitGroup", Vec::new()),
            ShaderRecord::new(ProgramKind::Miss, "Miss", Vec::new()),
        ];
        assert!(matches!(
            ShaderTableBuilder::from_records(records),
            Err(GpuError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_build_writes_identifiers_and_arguments() {
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::with_defaults(3, 4, 4));
        let ctx = DeviceContext::new(Arc::clone(&device), 3, Duration::from_secs(1));
        let pipeline = RaytracingPipeline::new(&device, &pipeline_desc()).unwrap();

        let table = three_records().build(&ctx, &pipeline).unwrap();
        let bytes = table.buffer().read(0, table.layout().total_size).unwrap();

        assert_eq!(&bytes[..32], pipeline.identifier("RayGen").unwrap().as_bytes());
        assert_eq!(&bytes[32..40], &[1; 8]);
        assert_eq!(&bytes[40..64], &[0; 24]);
        assert_eq!(&bytes[64..96], pipeline.identifier("Miss").unwrap().as_bytes());
        assert_eq!(&bytes[128..160], pipeline.identifier("HitGroup").unwrap().as_bytes());
        assert_eq!(&bytes[160..168], &[3; 8]);

        let hit = table.hit_group_region();
        assert_eq!((hit.range.offset, hit.range.size, hit.stride), (128, 64, 64));
        assert_eq!(table.miss_region().range.offset, 64);
        assert_eq!(table.ray_generation_region().range.size, 64);
    }

    #[test]
    fn test_unknown_export_fails_build() {
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::with_defaults(3, 4, 4));
        let ctx = DeviceContext::new(Arc::clone(&device), 3, Duration::from_secs(1));
        let pipeline = RaytracingPipeline::new(&device, &pipeline_desc()).unwrap();

        let err = ShaderTableBuilder::new()
            .ray_generation("RayGen", Vec::new())
            .miss("NoSuchMiss", Vec::new())
            .build(&ctx, &pipeline)
            .err()
            .unwrap();
        assert!(matches!(err, GpuError::UnknownExport(name) if name == "NoSuchMiss"));
    }
}
