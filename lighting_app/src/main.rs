//! Direct lighting demo
//!
//! Ray traces a textured model with an orbiting camera for a fixed number of
//! frames.
//!
//! Usage: `direct_lighting [config.toml | config.ron] [frames]`

use render_core::assets::{ImageLoader, ObjLoader};
use render_core::backend::create_device;
use render_core::config::{BackendKind, Config, RenderConfig};
use render_core::shader::{ShaderCompiler, SpirvLoader};
use render_core::LightingEngine;
use std::time::Instant;

const DEFAULT_FRAMES: u64 = 300;

/// Stand-in bytecode for the headless backend, which never executes shaders
fn headless_compiler(_source: &str, entry_point: &str, _profile: &str) -> Result<Vec<u8>, String> {
    Ok(entry_point.as_bytes().to_vec())
}

fn load_config(path: Option<&str>) -> Result<RenderConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            log::info!("Loading configuration from {path}");
            Ok(RenderConfig::load_from_file(path)?)
        }
        None => Ok(RenderConfig::default()),
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = load_config(args.first().map(String::as_str))?;
    let frames = match args.get(1) {
        Some(value) => value.parse::<u64>()?,
        None => DEFAULT_FRAMES,
    };

    let device = create_device(&config, None)?;
    let spirv = SpirvLoader::new(&config.shader_dir);
    let compiler: &dyn ShaderCompiler = match config.backend {
        BackendKind::Headless => &headless_compiler,
        BackendKind::Vulkan => &spirv,
    };

    let mut engine = LightingEngine::initialize(config, device, compiler, &ObjLoader, &ImageLoader)?;

    let start = Instant::now();
    let rendered = engine.run(frames)?;
    let elapsed = start.elapsed().as_secs_f64();
    log::info!(
        "Rendered {rendered} frames in {elapsed:.2}s ({:.1} fps)",
        rendered as f64 / elapsed.max(f64::EPSILON)
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up panic hook for better error reporting
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC occurred: {panic_info}");

        if let Some(location) = panic_info.location() {
            eprintln!("Panic location: {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting direct lighting demo");
    match run() {
        Ok(()) => {
            log::info!("Direct lighting demo completed successfully");
            Ok(())
        }
        Err(e) => {
            log::error!("Direct lighting demo failed: {e}");
            Err(e)
        }
    }
}
