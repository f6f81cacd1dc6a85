//! # Render Core
//!
//! Command submission and synchronization for a ray-traced renderer.
//!
//! ## Components
//!
//! - **DeviceContext**: the device, its single queue and the fence timeline
//! - **FrameRing / Presenter**: N in-flight frames, each waiting on its own fence target
//! - **UploadPipeline**: staging copies whose transient memory lives until the GPU is done
//! - **AccelerationStructureBuilder**: bottom and top levels, with stale tracking
//! - **ShaderTableBuilder**: fixed-stride records of identifier plus local arguments
//! - **LightingEngine**: one-time initialization and the per-tick loop
//!
//! Two backends implement [`GpuDevice`]: a headless software timeline for
//! tests and tools, and Vulkan (`VK_KHR_ray_tracing_pipeline`) through `ash`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_core::prelude::*;
//!
//! fn main() -> Result<(), EngineError> {
//!     let config = RenderConfig::new(640, 360);
//!     let device = render_core::backend::create_device(&config, None)?;
//!     let compiler = SpirvLoader::new(&config.shader_dir);
//!     let mut engine = LightingEngine::initialize(config, device, &compiler, &ObjLoader, &ImageLoader)?;
//!     engine.run(100)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss
)]

pub mod acceleration;
pub mod assets;
pub mod backend;
pub mod buffer;
pub mod command;
pub mod config;
pub mod device;
pub mod device_context;
pub mod engine;
pub mod error;
pub mod frame_ring;
pub mod geometry;
pub mod logging;
pub mod presenter;
pub mod shader;
pub mod shader_table;
pub mod upload;

pub use device::GpuDevice;
pub use engine::{EngineError, EngineStatus, LightingEngine};
pub use error::{GpuError, GpuResult};

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        acceleration::{AccelerationStructureBuilder, BlasInstance, BlasKey, TopLevelAccelerationStructure},
        assets::{ImageLoader, ModelLoader, ObjLoader, TextureLoader},
        buffer::{BufferDesc, BufferUsage, GpuBuffer, Residency, ResourceState},
        config::{BackendKind, Config, RenderConfig},
        device::GpuDevice,
        device_context::DeviceContext,
        engine::{EngineError, EngineStatus, LightingEngine},
        error::{GpuError, GpuResult},
        frame_ring::{FrameRing, FrameSlot, SlotState},
        presenter::Presenter,
        shader::{ShaderCompiler, SpirvLoader},
        shader_table::{ShaderTable, ShaderTableBuilder},
        upload::UploadPipeline,
    };
}
