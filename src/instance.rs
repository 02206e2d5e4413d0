//! The fluid instance orchestrator.
//!
//! A [`FluidInstance`] owns one engine instance, its particle and grid buffer
//! sets, the collider list, a render context per camera and the simulation
//! clock. The host drives it once per frame:
//!
//! ```ignore
//! let mut fluid = FluidInstance::new(LoopbackEngine::new(), config);
//! fluid.init(&mut host)?;
//!
//! // Every frame:
//! fluid.advance(frame_delta, &mut host)?;
//! for camera in host.camera_ids() {
//!     fluid.render(camera, &mut host)?;
//! }
//!
//! // On shutdown:
//! fluid.teardown(&mut host);
//! ```
//!
//! State machine:
//!
//! ```text
//! Uninitialized ──init ok──▶ Active ──teardown──▶ Disposed ──init ok──▶ Active
//!       │                      │                     ▲
//!    init err              step err                  │
//!       ▼                      ▼                     │
//!    Errored ──────────────teardown──────────────────┘
//! ```
//!
//! Init failures are fatal: the instance releases whatever it acquired, moves
//! to `Errored` and returns the error. An errored instance does no further
//! simulation or rendering until it is torn down and initialized again.

use std::collections::BTreeMap;

use glam::{Mat4, UVec3};

use crate::buffers::{self, BufferSet, GRID_LAYOUT, PARTICLE_LAYOUT};
use crate::camera::{CameraRenderContext, Delivery, FrameResources};
use crate::channel::{OneShot, ParameterChannel};
use crate::collider::{ColliderAggregationPipeline, ColliderSet, GridTargets};
use crate::command::CommandStream;
use crate::config::FluidConfig;
use crate::engine::abi::{ParticleInitParams, RenderParams, SolverParams, StepInputs, SurfaceUniforms};
use crate::engine::{BufferSetKind, ComputeEngine, EventCode, InstanceHandle, NativeHandle};
use crate::error::{ConfigurationError, FluidError, InvalidHandleError, Result};
use crate::host::{CameraId, CameraView, RenderHost};
use crate::time::SimulationClock;

/// Label of the stream steps and init are recorded into.
pub const SOLVER_STREAM_LABEL: &str = "liquid.solver";

/// Lifecycle state of a [`FluidInstance`].
#[derive(Clone, Debug, PartialEq)]
pub enum InstanceState {
    Uninitialized,
    Active,
    /// Terminal until teardown; holds the error that caused it.
    Errored(FluidError),
    Disposed,
}

impl InstanceState {
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceState::Active)
    }

    pub fn name(&self) -> &'static str {
        match self {
            InstanceState::Uninitialized => "uninitialized",
            InstanceState::Active => "active",
            InstanceState::Errored(_) => "errored",
            InstanceState::Disposed => "disposed",
        }
    }
}

/// What a teardown released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub engine_released: bool,
    pub buffers_released: usize,
    pub cameras_released: usize,
    pub blocks_freed: usize,
    /// Release calls that failed. Failures never stop the teardown.
    pub failures: usize,
}

impl std::ops::AddAssign for TeardownReport {
    fn add_assign(&mut self, other: Self) {
        self.engine_released |= other.engine_released;
        self.buffers_released += other.buffers_released;
        self.cameras_released += other.cameras_released;
        self.blocks_freed += other.blocks_freed;
        self.failures += other.failures;
    }
}

/// Resources fixed at init and referenced every frame.
#[derive(Clone, Copy, Debug)]
struct Layout {
    handle: InstanceHandle,
    grid_size: UVec3,
    node_count: u32,
    capacity: u32,
    particle_count: u32,
    grid: GridTargets,
    surface: OneShot<SurfaceUniforms>,
    grid_normal: NativeHandle,
}

/// One simulated fluid volume bound to one engine instance.
pub struct FluidInstance<E: ComputeEngine> {
    engine: E,
    config: FluidConfig,
    state: InstanceState,
    /// Set while an engine instance is held.
    handle: Option<InstanceHandle>,
    layout: Option<Layout>,
    particles: BufferSet,
    grid: BufferSet,
    channel: ParameterChannel,
    solver_params: SolverParams,
    solver_stream: CommandStream,
    colliders: ColliderSet,
    pipeline: ColliderAggregationPipeline,
    cameras: BTreeMap<CameraId, CameraRenderContext>,
    /// `color0`/`color1` the engine currently splats into.
    render_targets: Option<(NativeHandle, NativeHandle)>,
    clock: SimulationClock,
    transform: Mat4,
}

impl<E: ComputeEngine> std::fmt::Debug for FluidInstance<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FluidInstance")
            .field("state", &self.state)
            .field("handle", &self.handle)
            .field("particles", &self.particles.len())
            .field("grid", &self.grid.len())
            .field("cameras", &self.cameras.len())
            .field("steps", &self.clock.steps())
            .finish()
    }
}

impl<E: ComputeEngine> FluidInstance<E> {
    /// Create an uninitialized instance. Nothing is allocated until [`init`](Self::init).
    pub fn new(engine: E, config: FluidConfig) -> Self {
        let clock = SimulationClock::new(&config);
        Self {
            engine,
            config,
            state: InstanceState::Uninitialized,
            handle: None,
            layout: None,
            particles: BufferSet::new("particles"),
            grid: BufferSet::new("grid"),
            channel: ParameterChannel::new(),
            solver_params: SolverParams::default(),
            solver_stream: CommandStream::new(SOLVER_STREAM_LABEL),
            colliders: ColliderSet::new(),
            pipeline: ColliderAggregationPipeline::new(),
            cameras: BTreeMap::new(),
            render_targets: None,
            clock,
            transform: Mat4::IDENTITY,
        }
    }

    // --- Lifecycle ---

    /// Acquire an engine instance, allocate and register every buffer, and
    /// seed the particles.
    ///
    /// A no-op on an active instance. On an errored instance, returns the
    /// stored error; tear down first to retry.
    pub fn init(&mut self, host: &mut dyn RenderHost) -> Result<()> {
        match &self.state {
            InstanceState::Active => return Ok(()),
            InstanceState::Errored(err) => return Err(err.clone()),
            InstanceState::Uninitialized | InstanceState::Disposed => {}
        }

        match self.try_init(host) {
            Ok(layout) => {
                log::info!(
                    "fluid instance {} initialized: {} particles ({} slots), grid {}x{}x{} ({} nodes)",
                    layout.handle.raw(),
                    layout.particle_count,
                    layout.capacity,
                    layout.grid_size.x,
                    layout.grid_size.y,
                    layout.grid_size.z,
                    layout.node_count
                );
                self.layout = Some(layout);
                self.state = InstanceState::Active;
                Ok(())
            }
            Err(err) => {
                log::error!("fatal error, fluid instance not initialized: {}", err);
                let report = self.release_resources(host);
                if report.failures > 0 {
                    log::warn!("{} releases failed while unwinding init", report.failures);
                }
                self.state = InstanceState::Errored(err.clone());
                Err(err)
            }
        }
    }

    fn try_init(&mut self, host: &mut dyn RenderHost) -> Result<Layout> {
        self.config.validate()?;
        let grid_size = self.config.grid_dimensions();
        let node_count = buffers::grid_node_count(grid_size)?;
        let capacity = self.config.particle_capacity();
        let particle_count = self.config.active_particle_count();

        self.clock = SimulationClock::new(&self.config);

        let handle = self.engine.create_instance()?;
        self.handle = Some(handle);

        // Particles: allocate, register with the init block, seed.
        self.particles
            .allocate_layout(host, PARTICLE_LAYOUT, capacity, node_count)?;
        let init = ParticleInitParams::from_config(&self.config, particle_count);
        let (engine, channel) = (&mut self.engine, &mut self.channel);
        self.particles.register_with(|handles| {
            channel.push_transient(&init, |ptr| {
                engine.register_buffers(handle, BufferSetKind::Particles, ptr, handles)
            })
        })?;

        self.solver_stream.clear();
        let token = self.engine.schedule_event(EventCode::ParticleInit, handle);
        self.solver_stream.push_event(token, None);
        host.execute(&self.solver_stream)?;

        // Grid: allocate, register with an initial solver block.
        self.grid.allocate_layout(host, GRID_LAYOUT, capacity, node_count)?;
        self.solver_params.rebuild(
            &self.config,
            &StepInputs {
                grid_size,
                particle_count,
                node_count,
                dt: 0.0,
                simulation_time: 0.0,
                simulation_frame: 0,
            },
        );
        let params = self.solver_params;
        let (engine, channel) = (&mut self.engine, &mut self.channel);
        self.grid.register_with(|handles| {
            channel.push_transient(&params, |ptr| engine.register_buffers(handle, BufferSetKind::Grid, ptr, handles))
        })?;

        self.engine
            .set_colliders_count(handle, self.colliders.len() as u32)?;

        let missing = || ConfigurationError::Missing("grid buffer");
        let grid = GridTargets {
            positions: self.grid.handle("grid_node_positions").ok_or_else(missing)?,
            sdf: self.grid.handle("grid_sdf").ok_or_else(missing)?,
            ids: self.grid.handle("grid_id").ok_or_else(missing)?,
        };
        let grid_normal = self.grid.handle("grid_normal").ok_or_else(missing)?;

        let mut uniforms = SurfaceUniforms::default();
        uniforms.refresh(&self.config, grid_size);
        let surface = self.channel.push_one_shot(uniforms);

        Ok(Layout {
            handle,
            grid_size,
            node_count,
            capacity,
            particle_count,
            grid,
            surface,
            grid_normal,
        })
    }

    /// Release everything and move to `Disposed`.
    ///
    /// Never fails: each release is independent and failures are logged and
    /// counted. A no-op on an uninitialized or disposed instance.
    pub fn teardown(&mut self, host: &mut dyn RenderHost) -> TeardownReport {
        match self.state {
            InstanceState::Uninitialized | InstanceState::Disposed => return TeardownReport::default(),
            InstanceState::Active | InstanceState::Errored(_) => {}
        }

        let raw = self.handle.map(|h| h.raw());
        let report = self.release_resources(host);
        self.state = InstanceState::Disposed;
        match raw {
            Some(raw) => log::info!("fluid instance {} disposed ({} release failures)", raw, report.failures),
            None => log::info!("fluid instance disposed ({} release failures)", report.failures),
        }
        report
    }

    /// Cameras first, while the engine can still be told to drop their
    /// blocks, then the engine handle, buffers and remaining parameter blocks.
    fn release_resources(&mut self, host: &mut dyn RenderHost) -> TeardownReport {
        let mut report = TeardownReport::default();

        for (_, mut context) in std::mem::take(&mut self.cameras) {
            report.failures += context.release(&mut self.engine, self.handle, host, &mut self.channel);
            report.cameras_released += 1;
        }
        self.render_targets = None;

        if let Some(handle) = self.handle.take() {
            match self.engine.release_instance(handle) {
                Ok(()) => report.engine_released = true,
                Err(err) => {
                    log::warn!("failed to release engine instance {}: {}", handle.raw(), err);
                    report.failures += 1;
                }
            }
        }

        for set in [&mut self.particles, &mut self.grid] {
            let owned = set.len();
            let failed = set.release(host);
            report.buffers_released += owned - failed;
            report.failures += failed;
        }

        self.layout = None;
        report.blocks_freed = self.channel.free_all();
        report
    }

    // --- Simulation ---

    /// Advance by one host frame of `dt` seconds.
    ///
    /// Returns the number of solver steps enqueued. Non-positive or
    /// non-finite deltas, inactive instances and stopped simulations enqueue
    /// nothing. A failed step moves the instance to `Errored`.
    pub fn advance(&mut self, dt: f32, host: &mut dyn RenderHost) -> Result<u32> {
        if !self.state.is_active() {
            return Ok(0);
        }
        if !(dt.is_finite() && dt > 0.0) {
            log::trace!("skipping advance with delta {}", dt);
            return Ok(0);
        }

        self.clock.configure(&self.config);
        let plan = self.clock.plan(dt);
        if plan.is_empty() {
            return Ok(0);
        }

        for _ in 0..plan.iterations {
            if let Err(err) = self.step(plan.step, host) {
                log::error!("simulation step failed, fluid instance halted: {}", err);
                self.state = InstanceState::Errored(err.clone());
                return Err(err);
            }
        }
        Ok(plan.iterations)
    }

    /// Build and submit one solver step.
    fn step(&mut self, dt: f32, host: &mut dyn RenderHost) -> Result<()> {
        if dt <= 0.0 {
            return Ok(());
        }
        let layout = self.layout.ok_or(InvalidHandleError::NoInstance)?;
        let handle = layout.handle;

        self.solver_stream.clear();
        self.solver_params.rebuild(
            &self.config,
            &StepInputs {
                grid_size: layout.grid_size,
                particle_count: layout.particle_count,
                node_count: layout.node_count,
                dt,
                simulation_time: self.clock.elapsed() as f32,
                simulation_frame: self.clock.steps(),
            },
        );

        self.pipeline.aggregate(
            &mut self.engine,
            handle,
            self.colliders.as_slice(),
            &mut self.solver_stream,
            layout.grid,
            layout.node_count,
        )?;

        let params = self.solver_params;
        let engine = &mut self.engine;
        self.channel
            .push_transient(&params, |ptr| engine.set_parameters(handle, ptr))?;

        let token = self.engine.schedule_event(EventCode::SimulationStep, handle);
        self.solver_stream.push_event(token, None);
        host.execute(&self.solver_stream)?;

        self.clock.record_step(dt);
        Ok(())
    }

    /// Resume stepping.
    pub fn run(&mut self) {
        self.config.run_simulation = true;
        self.clock.resume();
    }

    /// Stop stepping. Rendering continues.
    pub fn stop(&mut self) {
        self.config.run_simulation = false;
        self.clock.pause();
    }

    /// Whether `advance` takes steps.
    pub fn is_running(&self) -> bool {
        !self.clock.is_paused()
    }

    // --- Rendering ---

    /// Render the fluid for `camera` through a sequence attached to it.
    ///
    /// Call this right before the host renders `camera`: the engine splats
    /// into whichever camera's targets were registered last, and this is
    /// where `camera`'s own targets get registered.
    ///
    /// A no-op unless the instance is active and rendering is enabled.
    pub fn render(&mut self, camera: CameraId, host: &mut dyn RenderHost) -> Result<()> {
        if !self.state.is_active() || !self.config.render_enabled {
            return Ok(());
        }
        let view = host
            .camera_view(camera)
            .ok_or(InvalidHandleError::UnknownCamera(camera))?;
        self.render_view(&view, Delivery::Attached, host)?;
        Ok(())
    }

    /// Render the fluid for `camera` by appending this frame's commands to
    /// `stream`, for hosts that build their own per-camera command streams.
    pub fn render_into(
        &mut self,
        camera: CameraId,
        stream: &mut CommandStream,
        host: &mut dyn RenderHost,
    ) -> Result<()> {
        if !self.state.is_active() || !self.config.render_enabled {
            return Ok(());
        }
        let view = host
            .camera_view(camera)
            .ok_or(InvalidHandleError::UnknownCamera(camera))?;
        let frame = self.render_view(&view, Delivery::External, host)?;
        let context = self
            .cameras
            .get(&camera)
            .ok_or(InvalidHandleError::UnknownCamera(camera))?;
        context.record(stream, &frame)
    }

    /// Per-frame camera update: material and render scalars, targets and
    /// sequence, then the camera block in place.
    fn render_view(
        &mut self,
        view: &CameraView,
        delivery: Delivery,
        host: &mut dyn RenderHost,
    ) -> Result<FrameResources> {
        let layout = self.layout.ok_or(InvalidHandleError::NoInstance)?;

        let mut uniforms = SurfaceUniforms::default();
        uniforms.refresh(&self.config, layout.grid_size);
        self.channel.update_one_shot(&layout.surface, &uniforms)?;

        let render = RenderParams::from_material(&self.config.material);
        let engine = &mut self.engine;
        self.channel
            .push_transient(&render, |ptr| engine.set_render_parameters(layout.handle, ptr))?;

        let frame = self.ensure_context(view, delivery, host)?.1;

        let diameter = self.config.particle_radius();
        let context = self
            .cameras
            .get(&view.id)
            .ok_or(InvalidHandleError::UnknownCamera(view.id))?;
        context.update_camera(&mut self.channel, view, diameter)?;
        Ok(frame)
    }

    /// Create or refresh the render context for `camera`.
    ///
    /// Returns `true` if its textures or sequence were (re)built. Calling this
    /// twice with unchanged camera dimensions is a no-op the second time.
    pub fn ensure_render_context(&mut self, camera: CameraId, host: &mut dyn RenderHost) -> Result<bool> {
        if !self.state.is_active() {
            return Err(InvalidHandleError::NoInstance.into());
        }
        let view = host
            .camera_view(camera)
            .ok_or(InvalidHandleError::UnknownCamera(camera))?;
        Ok(self.ensure_context(&view, Delivery::Attached, host)?.0)
    }

    fn ensure_context(
        &mut self,
        view: &CameraView,
        delivery: Delivery,
        host: &mut dyn RenderHost,
    ) -> Result<(bool, FrameResources)> {
        let layout = self.layout.ok_or(InvalidHandleError::NoInstance)?;
        let frame = FrameResources {
            camera_update: self.engine.schedule_event(EventCode::CameraUpdate, layout.handle),
            particle_render: self.engine.schedule_event(EventCode::ParticleRender, layout.handle),
            surface: layout.surface.ptr(),
            grid_normal: layout.grid_normal,
            transform: self.transform,
        };

        if !self.cameras.contains_key(&view.id) {
            let context = CameraRenderContext::create(
                view,
                delivery,
                self.config.particle_radius(),
                &mut self.engine,
                layout.handle,
                &mut self.channel,
            )?;
            self.cameras.insert(view.id, context);
        }

        let context = self
            .cameras
            .get_mut(&view.id)
            .ok_or(InvalidHandleError::UnknownCamera(view.id))?;
        if context.delivery() != delivery {
            return Err(ConfigurationError::DeliveryConflict {
                camera: view.id.raw(),
                existing: context.delivery().name(),
            }
            .into());
        }
        let ensured = context.ensure(view, host, &frame);
        let bound = match ensured {
            Ok(_) => self.bind_render_targets(view.id, layout.handle),
            Err(_) => Ok(()),
        };
        if ensured.is_err() || bound.is_err() {
            self.forget_released_targets(layout.handle);
        }
        let rebuilt = ensured?;
        bound?;
        Ok((rebuilt, frame))
    }

    /// Point the engine at `camera`'s targets unless they are already the
    /// registered pair.
    fn bind_render_targets(&mut self, camera: CameraId, instance: InstanceHandle) -> Result<()> {
        let Some(targets) = self.cameras.get(&camera).and_then(|c| c.targets()) else {
            return Ok(());
        };
        let pair = (targets.color0, targets.color1);
        if self.render_targets == Some(pair) {
            return Ok(());
        }
        self.engine.register_render_resources(instance, pair.0, pair.1)?;
        self.render_targets = Some(pair);
        log::trace!("camera {}: render targets registered", camera.raw());
        Ok(())
    }

    /// Drop the engine's target registration once no live context owns
    /// those textures.
    fn forget_released_targets(&mut self, instance: InstanceHandle) {
        let Some(pair) = self.render_targets else {
            return;
        };
        let owned = self
            .cameras
            .values()
            .filter_map(|c| c.targets())
            .any(|t| (t.color0, t.color1) == pair);
        if owned {
            return;
        }
        match self.engine.release_render_resources(instance) {
            Ok(()) => self.render_targets = None,
            Err(err) => log::warn!("failed to release engine render targets: {}", err),
        }
    }

    /// Detach and release the render context for `camera`.
    ///
    /// Returns `false` if the camera had no context.
    pub fn remove_camera(&mut self, camera: CameraId, host: &mut dyn RenderHost) -> bool {
        let Some(mut context) = self.cameras.remove(&camera) else {
            return false;
        };
        let failures = context.release(&mut self.engine, self.handle, host, &mut self.channel);
        if failures > 0 {
            log::warn!("camera {}: {} releases failed", camera.raw(), failures);
        }
        if let Some(handle) = self.handle {
            self.forget_released_targets(handle);
        }
        true
    }

    // --- Accessors ---

    /// `color0`/`color1` currently registered with the engine.
    pub fn registered_render_targets(&self) -> Option<(NativeHandle, NativeHandle)> {
        self.render_targets
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    /// The engine instance handle, while one is held.
    pub fn handle(&self) -> Option<InstanceHandle> {
        self.handle
    }

    /// The configuration the instance runs with.
    pub fn config(&self) -> &FluidConfig {
        &self.config
    }

    /// Mutable configuration. Material, solver and timing fields apply on
    /// the next frame; capacity and geometry fields apply on the next init.
    pub fn config_mut(&mut self) -> &mut FluidConfig {
        &mut self.config
    }

    /// The engine adapter.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Mutable engine adapter access.
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Engine build version.
    pub fn version(&self) -> String {
        self.engine.version()
    }

    /// Particle buffers.
    pub fn particles(&self) -> &BufferSet {
        &self.particles
    }

    /// Grid and solver scratch buffers.
    pub fn grid(&self) -> &BufferSet {
        &self.grid
    }

    /// Grid cells per axis, once initialized.
    pub fn grid_size(&self) -> Option<UVec3> {
        self.layout.map(|l| l.grid_size)
    }

    /// Grid node count, once initialized.
    pub fn node_count(&self) -> Option<u32> {
        self.layout.map(|l| l.node_count)
    }

    /// Particle buffer capacity, once initialized.
    pub fn particle_capacity(&self) -> Option<u32> {
        self.layout.map(|l| l.capacity)
    }

    /// Live particle count, once initialized.
    pub fn particle_count(&self) -> Option<u32> {
        self.layout.map(|l| l.particle_count)
    }

    /// Colliders aggregated into every step.
    pub fn colliders(&self) -> &ColliderSet {
        &self.colliders
    }

    /// Mutable collider list. Changes apply on the next step.
    pub fn colliders_mut(&mut self) -> &mut ColliderSet {
        &mut self.colliders
    }

    /// The render context for `camera`, if it has rendered.
    pub fn camera_context(&self, camera: CameraId) -> Option<&CameraRenderContext> {
        self.cameras.get(&camera)
    }

    /// Number of live camera contexts.
    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    /// Simulation time advanced since init.
    pub fn elapsed_time(&self) -> f64 {
        self.clock.elapsed()
    }

    /// Solver steps enqueued since init.
    pub fn step_count(&self) -> u64 {
        self.clock.steps()
    }

    /// The simulation clock.
    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    /// Parameter blocks currently held for the engine.
    pub fn live_parameter_blocks(&self) -> usize {
        self.channel.live_count()
    }

    /// The solver stream as of the last init or step.
    pub fn solver_stream(&self) -> &CommandStream {
        &self.solver_stream
    }

    /// Container local-to-world transform used by the surface draw.
    pub fn set_transform(&mut self, transform: Mat4) {
        self.transform = transform;
    }

    /// Container local-to-world transform.
    pub fn transform(&self) -> Mat4 {
        self.transform
    }
}

impl<E: ComputeEngine> Drop for FluidInstance<E> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            log::warn!(
                "fluid instance {} dropped without teardown; engine instance and buffers leaked",
                handle.raw()
            );
        }
    }
}
