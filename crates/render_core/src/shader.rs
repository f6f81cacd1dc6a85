//! Ray-tracing programs, the compiler seam and pipeline objects.
//!
//! Programs are compiled once at startup through a [`ShaderCompiler`]. The
//! compiled blobs are opaque to this crate; only the device interprets them.

use crate::device::{GpuDevice, PipelineId, ShaderIdentifier};
use crate::error::{GpuError, GpuResult};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Turns shader source into device bytecode
///
/// Errors are human-readable compiler messages.
pub trait ShaderCompiler {
    /// Compile `entry_point` from `source` for `profile`
    fn compile(&self, source: &str, entry_point: &str, profile: &str) -> Result<Vec<u8>, String>;
}

impl<F> ShaderCompiler for F
where
    F: Fn(&str, &str, &str) -> Result<Vec<u8>, String>,
{
    fn compile(&self, source: &str, entry_point: &str, profile: &str) -> Result<Vec<u8>, String> {
        self(source, entry_point, profile)
    }
}

/// Loads precompiled SPIR-V named `<entry_point>.spv`
///
/// The directory is tried as given, then under `target/shaders` and
/// `../target/shaders` so the binary runs from the workspace root or a member
/// directory.
#[derive(Debug, Clone)]
pub struct SpirvLoader {
    shader_dir: PathBuf,
}

impl SpirvLoader {
    /// Loader rooted at `shader_dir`
    pub fn new(shader_dir: impl Into<PathBuf>) -> Self {
        Self {
            shader_dir: shader_dir.into(),
        }
    }

    /// Where `<entry_point>.spv` would be read from
    pub fn resolve(&self, entry_point: &str) -> PathBuf {
        let file_name = format!("{entry_point}.spv");
        let candidates = [
            self.shader_dir.join(&file_name),
            Path::new("target/shaders").join(&file_name),
            Path::new("../target/shaders").join(&file_name),
        ];
        candidates
            .iter()
            .find(|path| path.exists())
            .cloned()
            .unwrap_or_else(|| self.shader_dir.join(file_name))
    }
}

impl ShaderCompiler for SpirvLoader {
    fn compile(&self, _source: &str, entry_point: &str, _profile: &str) -> Result<Vec<u8>, String> {
        let path = self.resolve(entry_point);
        let bytes = std::fs::read(&path).map_err(|err| format!("{}: {err}", path.display()))?;
        if bytes.len() % 4 != 0 {
            return Err(format!("{} is not SPIR-V ({} bytes)", path.display(), bytes.len()));
        }
        Ok(bytes)
    }
}

/// One compiled program and the name it is exported under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderProgram {
    /// Export name used for identifier lookups
    pub export: String,
    /// Entry point inside the bytecode
    pub entry_point: String,
    /// Compiled blob
    pub bytecode: Vec<u8>,
}

impl ShaderProgram {
    /// Compile `entry_point` and export it as `export`
    pub fn compile(
        compiler: &dyn ShaderCompiler,
        source: &str,
        export: &str,
        entry_point: &str,
        profile: &str,
    ) -> GpuResult<Self> {
        let bytecode = compiler
            .compile(source, entry_point, profile)
            .map_err(|message| GpuError::MissingShader(format!("{export}: {message}")))?;
        if bytecode.is_empty() {
            return Err(GpuError::MissingShader(format!("{export}: compiler returned no bytecode")));
        }
        log::debug!("Compiled '{export}' ({} bytes)", bytecode.len());
        Ok(Self {
            export: export.to_string(),
            entry_point: entry_point.to_string(),
            bytecode,
        })
    }
}

/// Closest-hit program plus an optional any-hit program under one name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitGroupProgram {
    /// Hit group export name
    pub name: String,
    /// Runs for the closest intersection
    pub closest_hit: ShaderProgram,
    /// Runs for every candidate intersection of non-opaque geometry
    pub any_hit: Option<ShaderProgram>,
}

/// Everything needed to create a ray-tracing pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaytracingPipelineDesc {
    /// The single ray-generation program
    pub ray_generation: ShaderProgram,
    /// Miss programs
    pub misses: Vec<ShaderProgram>,
    /// Hit groups
    pub hit_groups: Vec<HitGroupProgram>,
    /// Largest ray payload in bytes
    pub max_payload_size: u32,
    /// Largest intersection attribute block in bytes
    pub max_attribute_size: u32,
    /// Maximum trace recursion depth
    pub max_recursion_depth: u32,
    /// Number of 64-bit addresses passed to every program
    pub root_argument_count: u32,
}

impl RaytracingPipelineDesc {
    /// Every program blob
    pub fn programs(&self) -> impl Iterator<Item = &ShaderProgram> {
        std::iter::once(&self.ray_generation)
            .chain(self.misses.iter())
            .chain(self.hit_groups.iter().flat_map(|group| {
                std::iter::once(&group.closest_hit).chain(group.any_hit.iter())
            }))
    }

    /// Names identifiers can be looked up by: ray generation, misses, hit groups
    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.ray_generation.export.as_str())
            .chain(self.misses.iter().map(|miss| miss.export.as_str()))
            .chain(self.hit_groups.iter().map(|group| group.name.as_str()))
    }

    /// Reject empty programs and duplicate or empty export names
    pub fn validate(&self) -> GpuResult<()> {
        if let Some(program) = self.programs().find(|program| program.bytecode.is_empty()) {
            return Err(GpuError::MissingShader(program.export.clone()));
        }
        if self.misses.is_empty() {
            return Err(GpuError::contract("pipeline needs at least one miss program"));
        }
        let mut seen = HashSet::new();
        for name in self.export_names() {
            if name.is_empty() {
                return Err(GpuError::contract("export names must not be empty"));
            }
            if !seen.insert(name) {
                return Err(GpuError::contract(format!("export '{name}' defined twice")));
            }
        }
        Ok(())
    }
}

/// Compiled ray-tracing pipeline with RAII cleanup
pub struct RaytracingPipeline {
    device: Arc<dyn GpuDevice>,
    id: PipelineId,
}

impl RaytracingPipeline {
    /// Create the pipeline on `device`
    pub fn new(device: &Arc<dyn GpuDevice>, desc: &RaytracingPipelineDesc) -> GpuResult<Self> {
        desc.validate()?;
        let id = device.create_raytracing_pipeline(desc)?;
        log::info!(
            "Created ray-tracing pipeline: {} miss, {} hit group(s)",
            desc.misses.len(),
            desc.hit_groups.len()
        );
        Ok(Self {
            device: Arc::clone(device),
            id,
        })
    }

    /// Device handle
    pub const fn id(&self) -> PipelineId {
        self.id
    }

    /// Identifier of an exported program or hit group
    pub fn identifier(&self, export: &str) -> GpuResult<ShaderIdentifier> {
        self.device
            .shader_identifier(self.id, export)
            .ok_or_else(|| GpuError::UnknownExport(export.to_string()))
    }
}

impl Drop for RaytracingPipeline {
    fn drop(&mut self) {
        self.device.destroy_raytracing_pipeline(self.id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDevice;

    pub(crate) fn program(export: &str) -> ShaderProgram {
        ShaderProgram {
            export: export.to_string(),
            entry_point: export.to_string(),
            bytecode: vec![0x03, 0x02, 0x23, 0x07],
        }
    }

    pub(crate) fn pipeline_desc() -> RaytracingPipelineDesc {
        RaytracingPipelineDesc {
            ray_generation: program("RayGen"),
            misses: vec![program("Miss")],
            hit_groups: vec![HitGroupProgram {
                name: "HitGroup".to_string(),
                closest_hit: program("ClosestHit"),
                any_hit: None,
            }],
            max_payload_size: 16,
            max_attribute_size: 8,
            max_recursion_depth: 1,
            root_argument_count: 3,
        }
    }

    #[test]
    fn test_closure_compiler() {
        let compiler = |_: &str, entry: &str, _: &str| -> Result<Vec<u8>, String> {
            if entry == "RayGen" {
                Ok(vec![1, 2, 3, 4])
            } else {
                Err(format!("no entry point {entry}"))
            }
        };
        let program = ShaderProgram::compile(&compiler, "rt.hlsl", "RayGen", "RayGen", "lib_6_3").unwrap();
        assert_eq!(program.bytecode, vec![1, 2, 3, 4]);

        let err = ShaderProgram::compile(&compiler, "rt.hlsl", "Miss", "Miss", "lib_6_3").unwrap_err();
        assert!(matches!(err, GpuError::MissingShader(ref message) if message.contains("Miss")));
    }

    #[test]
    fn test_spirv_loader_reads_entry_point_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("RayGen.spv"), [0x03, 0x02, 0x23, 0x07]).unwrap();
        let loader = SpirvLoader::new(dir.path());

        assert_eq!(loader.compile("", "RayGen", "").unwrap().len(), 4);
        assert!(loader.compile("", "Miss", "").is_err());
    }

    #[test]
    fn test_desc_validation() {
        let desc = pipeline_desc();
        assert!(desc.validate().is_ok());
        assert_eq!(desc.export_names().collect::<Vec<_>>(), vec!["RayGen", "Miss", "HitGroup"]);

        let mut missing = pipeline_desc();
        missing.hit_groups[0].closest_hit.bytecode.clear();
        assert!(matches!(missing.validate(), Err(GpuError::MissingShader(name)) if name == "ClosestHit"));

        let mut duplicate = pipeline_desc();
        duplicate.misses.push(program("Miss"));
        assert!(matches!(duplicate.validate(), Err(GpuError::ContractViolation(_))));
    }

    #[test]
    fn test_identifier_lookup() {
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::with_defaults(3, 4, 4));
        let pipeline = RaytracingPipeline::new(&device, &pipeline_desc()).unwrap();

        let raygen = pipeline.identifier("RayGen").unwrap();
        let hit_group = pipeline.identifier("HitGroup").unwrap();
        assert_ne!(raygen, hit_group);
        assert_eq!(pipeline.identifier("RayGen").unwrap(), raygen);
        assert!(matches!(pipeline.identifier("ClosestHit"), Err(GpuError::UnknownExport(_))));
    }
}
