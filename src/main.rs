//! Headless runner.
//!
//! Drives a registry of fluid instances against the loopback engine and an
//! in-memory host for a fixed number of frames, then tears everything down.
//!
//! ```text
//! liquid-bridge [CONFIG.json] [FRAMES]
//! ```
//!
//! Logging follows `RUST_LOG` (defaults to `info`).

use std::process::ExitCode;

use glam::{Mat4, Vec3};
use liquid_bridge::prelude::*;

const DEFAULT_FRAMES: u32 = 120;
const FRAME_DELTA: f32 = 1.0 / 60.0;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => match FluidConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                log::error!("failed to load {}: {}", path, err);
                return ExitCode::FAILURE;
            }
        },
        None => FluidConfig::default(),
    };
    let frames = match args.next().map(|raw| raw.parse::<u32>()) {
        Some(Ok(frames)) => frames,
        Some(Err(err)) => {
            log::error!("invalid frame count: {}", err);
            return ExitCode::FAILURE;
        }
        None => DEFAULT_FRAMES,
    };

    let mut host = HeadlessHost::new();
    let camera = CameraId::new(1);
    host.add_camera(CameraView {
        id: camera,
        size: PixelSize::new(1280, 720),
        render_path: RenderPath::Forward,
        view: Mat4::look_at_rh(Vec3::new(0.0, 4.0, 12.0), Vec3::ZERO, Vec3::Y),
        projection: Mat4::perspective_rh(60f32.to_radians(), 1280.0 / 720.0, 0.1, 100.0),
        position: Vec3::new(0.0, 4.0, 12.0),
    });

    let mut registry = FluidRegistry::new();
    let id = registry.insert(FluidInstance::new(LoopbackEngine::new(), config));

    for (failed, err) in registry.init_all(&mut host) {
        log::error!("{} failed to initialize: {}", failed, err);
    }
    if let Some(fluid) = registry.get(id) {
        log::info!("engine version {}", fluid.version());
        log::info!(
            "allocated {} particle bytes, {} grid bytes",
            fluid.particles().size_bytes(),
            fluid.grid().size_bytes()
        );
    }

    let mut stream = CommandStream::new("frame");
    for frame in 0..frames {
        let failures = registry.advance_all(FRAME_DELTA, &mut host);
        stream.clear();
        let failures = failures.len() + registry.render_all(camera, &mut stream, &mut host).len();
        if failures > 0 {
            log::warn!("frame {}: {} instances failed", frame, failures);
        }
    }

    if let Some(fluid) = registry.get(id) {
        log::info!(
            "{} frames: {} steps, {:.3} simulated time units, {} parameter blocks live",
            frames,
            fluid.step_count(),
            fluid.elapsed_time(),
            fluid.live_parameter_blocks()
        );
    }

    let report = registry.teardown_all(&mut host);
    log::info!(
        "teardown: {} buffers, {} cameras, {} blocks released, {} failures",
        report.buffers_released,
        report.cameras_released,
        report.blocks_freed,
        report.failures
    );
    if report.failures > 0 {
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
