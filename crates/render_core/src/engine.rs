//! One-time initialization and the per-tick render loop.
//!
//! [`LightingEngine::initialize`] records every static upload into a single
//! recorder (mesh, texture, material constants, both acceleration structure
//! levels), flushes once, then hands the ring to the [`Presenter`]. Each
//! [`tick`](LightingEngine::tick) then writes the acquired slot's view
//! constants, traces the scene into the output buffer and copies it into the
//! back buffer the display reported.

use crate::acceleration::{
    AccelerationStructure, AccelerationStructureBuilder, BlasInstance, BlasKey, TopLevelAccelerationStructure,
};
use crate::assets::{format_rgba8, AssetError, Material, Model, ModelLoader, TextureInfo, TextureLoader};
use crate::buffer::{constant_buffer_size, BufferDesc, BufferUsage, GpuBuffer, ResourceState};
use crate::config::{ConfigError, RenderConfig};
use crate::device::{BufferBinding, DispatchRaysDesc, GpuDevice};
use crate::device_context::DeviceContext;
use crate::error::{GpuError, GpuResult};
use crate::geometry::{Geometry, MaterialConstants, MeshBuffers, ViewConstants};
use crate::presenter::Presenter;
use crate::shader::{HitGroupProgram, RaytracingPipeline, RaytracingPipelineDesc, ShaderCompiler, ShaderProgram};
use crate::shader_table::{ShaderTable, ShaderTableBuilder};
use crate::upload::UploadPipeline;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Shader source file compiled for every program
pub const SHADER_SOURCE: &str = "raytracing.hlsl";
/// Target profile handed to the shader compiler
pub const SHADER_PROFILE: &str = "lib_6_3";

const RAY_GENERATION_EXPORT: &str = "RayGen";
const MISS_EXPORT: &str = "Miss";
const HIT_GROUP_EXPORT: &str = "HitGroup";
const CLOSEST_HIT_ENTRY: &str = "ClosestHit";

const CAMERA_RADIUS: f32 = 3.0;
const CAMERA_FOV_Y: f32 = std::f32::consts::FRAC_PI_4;
const ORBIT_STEP: f32 = 0.01;
const CHECKER_CELL: u32 = 64;

/// Engine-level errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// GPU failure
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// Bad configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Model or texture could not be loaded
    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),
}

/// Whether the tick loop should keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Rendering normally
    Running,
    /// A fatal GPU error occurred; ticks do nothing
    Errored,
    /// Stopped on request
    Stopped,
}

/// Ray-traced textured model orbited by the camera
pub struct LightingEngine {
    config: RenderConfig,
    ctx: DeviceContext,
    presenter: Presenter,
    upload: UploadPipeline,
    acceleration: AccelerationStructureBuilder,
    mesh: MeshBuffers,
    blas: BlasKey,
    tlas: TopLevelAccelerationStructure,
    texture: GpuBuffer,
    material: GpuBuffer,
    view_constants: GpuBuffer,
    view_stride: u64,
    output: GpuBuffer,
    pipeline: RaytracingPipeline,
    shader_table: ShaderTable,
    status: EngineStatus,
    frames_rendered: u64,
}

impl LightingEngine {
    /// Build every static resource, flush, and prepare the frame ring
    ///
    /// Loaders are only consulted when `config` names a model or texture (or
    /// the model's material names one); otherwise the unit cube and a
    /// checkerboard are used.
    pub fn initialize(
        config: RenderConfig,
        device: Arc<dyn GpuDevice>,
        compiler: &dyn ShaderCompiler,
        models: &dyn ModelLoader,
        textures: &dyn TextureLoader,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(ConfigError::Invalid)?;
        log::info!(
            "Initializing lighting engine on {} ({}x{}, {} frames)",
            device.name(),
            config.width,
            config.height,
            config.frame_count
        );

        let model = load_model(&config, models)?;
        let texture = load_texture(&config, &model.material, textures)?;

        let mut ctx = DeviceContext::new(device, config.frame_count, config.fence_timeout());
        let mut recorder = ctx.create_recorder()?;
        let mut upload = UploadPipeline::new();

        let mesh = MeshBuffers::upload(&ctx, &mut upload, &mut recorder, &model.geometry)?;
        let texture_buffer = upload.create_resident(
            &ctx,
            &mut recorder,
            &texture.pixels,
            BufferUsage::STORAGE,
            ResourceState::SHADER_RESOURCE,
            "texture",
        )?;
        let material = upload.create_resident_pod(
            &ctx,
            &mut recorder,
            &[MaterialConstants::for_texture(texture.width, texture.height)],
            BufferUsage::CONSTANT,
            ResourceState::VERTEX_AND_CONSTANT_BUFFER,
            "material constants",
        )?;

        // One region per slot so the CPU never writes a region the GPU may be reading
        let view_stride = constant_buffer_size(std::mem::size_of::<ViewConstants>() as u64);
        let view_constants = ctx.create_buffer(&BufferDesc::upload(
            view_stride * config.frame_count as u64,
            BufferUsage::CONSTANT,
            "view constants",
        ))?;

        let mut acceleration = AccelerationStructureBuilder::new();
        let blas = acceleration.build_bottom_level(&ctx, &mut upload, &mut recorder, &[mesh.triangles()])?;
        let tlas = acceleration.build_top_level(&ctx, &mut upload, &mut recorder, &[BlasInstance::new(blas)])?;

        let output = ctx.create_buffer(&BufferDesc::resident(
            u64::from(config.width) * u64::from(config.height) * 4,
            BufferUsage::STORAGE | BufferUsage::COPY_SOURCE,
            ResourceState::UNORDERED_ACCESS,
            "ray-traced output",
        ))?;

        let pipeline = RaytracingPipeline::new(ctx.device(), &pipeline_desc(compiler)?)?;
        let mut hit_arguments = texture_buffer.gpu_address().to_le_bytes().to_vec();
        hit_arguments.extend_from_slice(&material.gpu_address().to_le_bytes());
        let shader_table = ShaderTableBuilder::new()
            .ray_generation(RAY_GENERATION_EXPORT, Vec::new())
            .miss(MISS_EXPORT, Vec::new())
            .hit_group(HIT_GROUP_EXPORT, hit_arguments)
            .build(&ctx, &pipeline)?;

        // Single synchronous flush for every static upload
        recorder.close();
        ctx.execute(&recorder)?;
        let value = ctx.flush()?;
        upload.on_submitted(value);
        upload.retire(ctx.completed_value()?);
        log::info!(
            "Static uploads complete: {} bytes staged, shader table stride {}",
            upload.bytes_uploaded(),
            shader_table.layout().record_stride
        );

        let presenter = Presenter::new(&ctx)?;

        Ok(Self {
            config,
            ctx,
            presenter,
            upload,
            acceleration,
            mesh,
            blas,
            tlas,
            texture: texture_buffer,
            material,
            view_constants,
            view_stride,
            output,
            pipeline,
            shader_table,
            status: EngineStatus::Running,
            frames_rendered: 0,
        })
    }

    /// Render one frame. Does nothing unless the engine is running.
    ///
    /// Any GPU failure marks the engine [`EngineStatus::Errored`].
    pub fn tick(&mut self) -> Result<(), EngineError> {
        if self.status != EngineStatus::Running {
            return Ok(());
        }
        match self.render_frame() {
            Ok(()) => {
                self.frames_rendered += 1;
                Ok(())
            }
            Err(err) => {
                log::error!("Frame {} failed, halting: {err}", self.frames_rendered);
                self.status = EngineStatus::Errored;
                Err(err.into())
            }
        }
    }

    /// Tick until `frames` have been rendered or the engine stops
    pub fn run(&mut self, frames: u64) -> Result<u64, EngineError> {
        while self.status == EngineStatus::Running && self.frames_rendered < frames {
            self.tick()?;
        }
        Ok(self.frames_rendered)
    }

    /// Stop rendering; later ticks do nothing
    pub fn stop(&mut self) {
        if self.status == EngineStatus::Running {
            self.status = EngineStatus::Stopped;
        }
    }

    /// Current status
    pub const fn status(&self) -> EngineStatus {
        self.status
    }

    /// Frames rendered successfully
    pub const fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Configuration the engine was built with
    pub const fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Device context
    pub const fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Frame driver
    pub const fn presenter(&self) -> &Presenter {
        &self.presenter
    }

    /// Top-level structure traced every frame
    pub const fn top_level(&self) -> &TopLevelAccelerationStructure {
        &self.tlas
    }

    /// Bottom-level structure over the mesh
    pub fn bottom_level(&self) -> Option<&AccelerationStructure> {
        self.acceleration.bottom_level(self.blas)
    }

    /// Shader table bound to every dispatch
    pub const fn shader_table(&self) -> &ShaderTable {
        &self.shader_table
    }

    /// Triangles in the bottom-level structure
    pub const fn mesh(&self) -> &MeshBuffers {
        &self.mesh
    }

    fn render_frame(&mut self) -> GpuResult<()> {
        if self.acceleration.is_stale(&self.tlas) {
            return Err(GpuError::contract(
                "top-level structure references a rebuilt bottom level",
            ));
        }
        self.upload.retire(self.ctx.completed_value()?);

        let (width, height) = (self.config.width, self.config.height);
        let angle = self.frames_rendered as f32 * ORBIT_STEP;

        let slot = self.presenter.begin_frame(&mut self.ctx)?;
        let offset = slot.index() as u64 * self.view_stride;
        self.view_constants.write_pod(
            offset,
            &[ViewConstants::orbit(angle, CAMERA_RADIUS, CAMERA_FOV_Y, width, height)],
        )?;
        let view_range = self
            .view_constants
            .sub_range(offset, std::mem::size_of::<ViewConstants>() as u64)?;

        let recorder = slot.recorder();
        recorder.dispatch_rays(DispatchRaysDesc {
            pipeline: self.pipeline.id(),
            ray_generation: self.shader_table.ray_generation_region(),
            miss: self.shader_table.miss_region(),
            hit_group: self.shader_table.hit_group_region(),
            width,
            height,
            bindings: vec![
                BufferBinding {
                    range: self.tlas.structure().result().range(),
                    access: ResourceState::ACCELERATION_STRUCTURE,
                },
                BufferBinding {
                    range: view_range,
                    access: ResourceState::VERTEX_AND_CONSTANT_BUFFER,
                },
                BufferBinding {
                    range: self.output.range(),
                    access: ResourceState::UNORDERED_ACCESS,
                },
            ],
        });
        recorder.transition(&mut self.output, ResourceState::COPY_SOURCE);
        recorder.copy_to_back_buffer(&self.output, self.ctx.current_back_buffer_index())?;
        recorder.transition(&mut self.output, ResourceState::UNORDERED_ACCESS);

        let value = self.presenter.submit(&mut self.ctx)?;
        self.upload.on_submitted(value);
        let next = self.presenter.present(&mut self.ctx)?;
        log::trace!("Frame {} submitted at fence {value}, next back buffer {next}", self.frames_rendered);
        Ok(())
    }
}

impl Drop for LightingEngine {
    fn drop(&mut self) {
        // Buffers are released after this returns; the GPU must be done with them
        if let Err(err) = self.presenter.wait_all(&self.ctx) {
            log::warn!("Failed to drain frame ring on shutdown: {err}");
        }
        if let Ok(completed) = self.ctx.completed_value() {
            self.upload.retire(completed);
        }
        log::info!(
            "Lighting engine shut down after {} frames ({:?}, texture {} bytes, material {} bytes)",
            self.frames_rendered,
            self.status,
            self.texture.size(),
            self.material.size()
        );
    }
}

fn load_model(config: &RenderConfig, models: &dyn ModelLoader) -> Result<Model, AssetError> {
    match &config.model {
        Some(path) => models.load_model(path),
        None => Ok(Model {
            geometry: Geometry::unit_cube(),
            material: Material::default(),
        }),
    }
}

fn load_texture(
    config: &RenderConfig,
    material: &Material,
    textures: &dyn TextureLoader,
) -> Result<TextureInfo, AssetError> {
    let path = config.texture.clone().or_else(|| {
        let relative = material.texture_path.as_ref()?;
        let base = config.model.as_deref().and_then(Path::parent).unwrap_or_else(|| Path::new("."));
        Some(base.join(relative))
    });
    let raw = match path {
        Some(path) => textures.load_texture(&path)?,
        None => TextureInfo::checkerboard(material.texture_resolution, CHECKER_CELL),
    };
    format_rgba8(&raw)
}

fn pipeline_desc(compiler: &dyn ShaderCompiler) -> GpuResult<RaytracingPipelineDesc> {
    let compile = |export: &str, entry_point: &str| {
        ShaderProgram::compile(compiler, SHADER_SOURCE, export, entry_point, SHADER_PROFILE)
    };
    Ok(RaytracingPipelineDesc {
        ray_generation: compile(RAY_GENERATION_EXPORT, RAY_GENERATION_EXPORT)?,
        misses: vec![compile(MISS_EXPORT, MISS_EXPORT)?],
        hit_groups: vec![HitGroupProgram {
            name: HIT_GROUP_EXPORT.to_string(),
            closest_hit: compile(CLOSEST_HIT_ENTRY, CLOSEST_HIT_ENTRY)?,
            any_hit: None,
        }],
        // float4 color
        max_payload_size: 16,
        // float2 barycentrics
        max_attribute_size: 8,
        max_recursion_depth: 1,
        // TLAS, view constants, output
        root_argument_count: 3,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{ImageLoader, ObjLoader};
    use crate::backend::headless::{HeadlessDevice, HeadlessDeviceDesc};
    use crate::config::BackBufferOrder;

    fn compiler(_source: &str, entry_point: &str, _profile: &str) -> Result<Vec<u8>, String> {
        Ok(entry_point.as_bytes().to_vec())
    }

    fn setup(config: &RenderConfig) -> (Arc<HeadlessDevice>, Result<LightingEngine, EngineError>) {
        let headless = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc::from_config(config)));
        let device: Arc<dyn GpuDevice> = headless.clone();
        let engine = LightingEngine::initialize(config.clone(), device, &compiler, &ObjLoader, &ImageLoader);
        (headless, engine)
    }

    #[test]
    fn test_renders_frames_without_hazards() {
        let config = RenderConfig::new(8, 4).with_frame_count(3);
        let (headless, engine) = setup(&config);
        let mut engine = engine.unwrap();

        assert_eq!(engine.run(7).unwrap(), 7);
        assert_eq!(engine.status(), EngineStatus::Running);
        assert_eq!(engine.presenter().frames_presented(), 7);
        assert_eq!(engine.mesh().index_count, 36);
        assert!(engine.bottom_level().unwrap().result_size() > 0);
        assert_eq!(engine.shader_table().layout().record_count(), 3);

        drop(engine);
        assert!(headless.hazards().is_empty(), "{:?}", headless.hazards());
        assert!(headless.device_lost().is_none());
    }

    #[test]
    fn test_back_buffers_receive_traced_output() {
        let config = RenderConfig::new(8, 4).with_frame_count(2);
        let (headless, engine) = setup(&config);
        let mut engine = engine.unwrap();
        engine.run(2).unwrap();
        engine.context().wait_idle().unwrap();

        for index in 0..2 {
            let pixels = headless.back_buffer_contents(index).unwrap();
            assert_eq!(pixels.len(), 8 * 4 * 4);
            // Gradient ends at full red on the right edge
            assert_eq!(pixels[7 * 4], 0xFF);
            assert!(pixels.chunks_exact(4).all(|pixel| pixel[3] == 0xFF));
        }
    }

    #[test]
    fn test_follows_reported_back_buffer_order() {
        let mut config = RenderConfig::new(4, 4).with_frame_count(3);
        config.headless.back_buffer_order = BackBufferOrder::Sequence(vec![2, 0, 1]);
        let (headless, engine) = setup(&config);
        let mut engine = engine.unwrap();

        engine.run(6).unwrap();
        drop(engine);
        assert!(headless.hazards().is_empty());
    }

    #[test]
    fn test_device_removal_marks_engine_errored() {
        let config = RenderConfig::new(4, 4).with_frame_count(2);
        let (headless, engine) = setup(&config);
        let mut engine = engine.unwrap();
        engine.tick().unwrap();

        headless.remove_device("driver reset");
        let err = engine.tick().unwrap_err();
        assert!(matches!(err, EngineError::Gpu(GpuError::DeviceRemoved(_))));
        assert_eq!(engine.status(), EngineStatus::Errored);

        // Errored engines stop rendering
        engine.tick().unwrap();
        assert_eq!(engine.frames_rendered(), 1);
    }

    #[test]
    fn test_missing_shader_aborts_startup() {
        let config = RenderConfig::new(4, 4).with_frame_count(2);
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc::from_config(&config)));
        let no_miss = |_: &str, entry: &str, _: &str| {
            if entry == "Miss" {
                Err("entry point not found".to_string())
            } else {
                Ok(vec![1, 2, 3, 4])
            }
        };

        let result = LightingEngine::initialize(config, device, &no_miss, &ObjLoader, &ImageLoader);
        assert!(matches!(result, Err(EngineError::Gpu(GpuError::MissingShader(_)))));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = RenderConfig::new(0, 4);
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::with_defaults(3, 1, 1));

        let result = LightingEngine::initialize(config, device, &compiler, &ObjLoader, &ImageLoader);
        assert!(matches!(result, Err(EngineError::Config(ConfigError::Invalid(_)))));
    }

    #[test]
    fn test_missing_model_file_is_an_asset_error() {
        let config = RenderConfig::new(4, 4).with_frame_count(2).with_model("does/not/exist.obj");
        let (_headless, engine) = setup(&config);
        assert!(matches!(engine, Err(EngineError::Asset(_))));
    }

    #[test]
    fn test_stale_top_level_halts_rendering() {
        let config = RenderConfig::new(4, 4).with_frame_count(2);
        let (_headless, engine) = setup(&config);
        let mut engine = engine.unwrap();

        let mut recorder = engine.ctx.create_recorder().unwrap();
        let triangles = engine.mesh.triangles();
        engine
            .acceleration
            .rebuild_bottom_level(engine.blas, &engine.ctx, &mut engine.upload, &mut recorder, &[triangles])
            .unwrap();
        recorder.close();
        engine.ctx.execute(&recorder).unwrap();
        let value = engine.ctx.flush().unwrap();
        engine.upload.on_submitted(value);

        let err = engine.tick().unwrap_err();
        assert!(matches!(err, EngineError::Gpu(GpuError::ContractViolation(_))));
        assert_eq!(engine.status(), EngineStatus::Errored);
    }

    #[test]
    fn test_stop_halts_ticks() {
        let config = RenderConfig::new(4, 4).with_frame_count(2);
        let (_headless, engine) = setup(&config);
        let mut engine = engine.unwrap();
        engine.stop();

        assert_eq!(engine.run(5).unwrap(), 0);
        assert_eq!(engine.status(), EngineStatus::Stopped);
    }
}
