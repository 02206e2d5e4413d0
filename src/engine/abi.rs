//! Fixed-layout parameter blocks mirrored on both sides of the engine boundary.
//!
//! Every block is `#[repr(C)]`, `Pod` and free of implicit padding so it can be
//! handed to the engine as a raw address. Vectors are plain `[f32; N]` arrays to
//! keep the layout independent of SIMD alignment in `glam`.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec3, Vec3};

use crate::config::{FluidConfig, MaterialParameters};

/// Seed values for the particle buffers, pushed with the particle registration.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ParticleInitParams {
    /// Emitter center in grid cell units.
    pub init_pos: [f32; 3],
    /// Reserved by the engine.
    pub length: i32,
    /// Initial particle velocity.
    pub init_vel: [f32; 3],
    /// Mass of each particle.
    pub init_mass: f32,
    /// Emitter extent in grid cell units.
    pub init_scale: [f32; 3],
    /// Number of live particles to seed.
    pub particles_count: i32,
}

impl ParticleInitParams {
    /// Build the init block for a configuration.
    pub fn from_config(config: &FluidConfig, particles_count: u32) -> Self {
        let cell = config.cell_size;
        let position = (config.emitter_pos + config.container_size * 0.5) / cell;
        let scale = config.emitter_size / cell;
        Self {
            init_pos: position.to_array(),
            length: 0,
            init_vel: config.fluid_initial_velocity.to_array(),
            init_mass: config.particle_mass,
            init_scale: scale.to_array(),
            particles_count: particles_count as i32,
        }
    }
}

/// Per-step solver parameters.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SolverParams {
    pub grid_size: [f32; 3],
    pub num_particles: i32,
    pub container_scale: [f32; 3],
    pub num_nodes: i32,
    pub container_pos: [f32; 3],
    pub group: i32,
    pub gravity: [f32; 3],
    pub simulation_frame: i32,
    pub node_delta: [f32; 3],
    /// Step size in simulation time units.
    pub dt: f32,
    pub direction: [f32; 3],
    pub simulation_time: f32,
    pub velocity_clamp: f32,
    pub affine_amount: f32,
    pub boundary_force: f32,
    pub boundary_friction: f32,
    pub dynamic_viscosity: f32,
    pub eos_stiffness: f32,
    pub eos_power: f32,
    pub rest_density: f32,
    pub elastic_mu: f32,
    pub elastic_lambda: f32,
    pub density_compensation: f32,
    pub deformation_decay: f32,
    pub normalization_constant: f32,
    pub soft_body: i32,
}

/// Inputs for one rebuild of [`SolverParams`].
#[derive(Clone, Copy, Debug)]
pub struct StepInputs {
    pub grid_size: UVec3,
    pub particle_count: u32,
    pub node_count: u32,
    pub dt: f32,
    pub simulation_time: f32,
    pub simulation_frame: u64,
}

impl SolverParams {
    /// Wall friction applied at the container boundary.
    pub const BOUNDARY_FRICTION: f32 = 0.1;

    /// Rebuild the block from the configuration and the current clock state.
    ///
    /// Gravity is scaled by 1/100 into solver units.
    pub fn rebuild(&mut self, config: &FluidConfig, inputs: &StepInputs) {
        let solver = &config.solver;
        *self = Self {
            grid_size: inputs.grid_size.as_vec3().to_array(),
            num_particles: inputs.particle_count as i32,
            container_scale: config.container_size.to_array(),
            num_nodes: inputs.node_count as i32,
            container_pos: config.container_pos.to_array(),
            group: 0,
            gravity: (solver.gravity / 100.0).to_array(),
            simulation_frame: inputs.simulation_frame.min(i32::MAX as u64) as i32,
            node_delta: [0.0; 3],
            dt: inputs.dt,
            direction: [0.0; 3],
            simulation_time: inputs.simulation_time,
            velocity_clamp: solver.velocity_limit,
            affine_amount: 4.0 * (1.0 - solver.viscosity),
            boundary_force: solver.boundary_force,
            boundary_friction: Self::BOUNDARY_FRICTION,
            dynamic_viscosity: 0.0,
            eos_stiffness: solver.fluid_stiffness,
            eos_power: solver.fluid_stiffness_power,
            rest_density: solver.particles_per_cell,
            elastic_mu: 0.0,
            elastic_lambda: 0.0,
            density_compensation: 0.0,
            deformation_decay: 0.0,
            normalization_constant: 0.0,
            soft_body: 0,
        };
    }
}

/// Per-camera parameters the engine reads on every camera-update event.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct CameraParams {
    pub view: [[f32; 4]; 4],
    pub view_projection: [[f32; 4]; 4],
    pub view_projection_inverse: [[f32; 4]; 4],
    pub world_space_camera_pos: [f32; 3],
    /// Particle splat diameter.
    pub diameter: f32,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, Mat4::IDENTITY, Vec3::ZERO, 0.0)
    }
}

impl CameraParams {
    /// Build camera parameters from a view and a GPU-adjusted projection.
    pub fn new(view: Mat4, projection: Mat4, position: Vec3, diameter: f32) -> Self {
        let view_projection = projection * view;
        Self {
            view: view.to_cols_array_2d(),
            view_projection: view_projection.to_cols_array_2d(),
            view_projection_inverse: view_projection.inverse().to_cols_array_2d(),
            world_space_camera_pos: position.to_array(),
            diameter,
        }
    }
}

/// Screen-space filter parameters for the particle render.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RenderParams {
    pub blur_radius: f32,
    pub bilateral_weight: f32,
}

impl RenderParams {
    pub fn from_material(material: &MaterialParameters) -> Self {
        Self {
            blur_radius: material.blur_radius,
            bilateral_weight: material.bilateral_weight,
        }
    }
}

/// Material block read by the host's fluid surface draw.
///
/// Not passed to the engine; it lives in a one-shot slot so an attached
/// command sequence can reference it by address.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SurfaceUniforms {
    pub refraction_color: [f32; 4],
    pub reflection_color: [f32; 4],
    pub container_scale: [f32; 3],
    pub opacity: f32,
    pub container_pos: [f32; 3],
    pub metal: f32,
    pub grid_size: [f32; 3],
    pub refraction_distort: f32,
    pub shadowing: f32,
    pub smoothness: f32,
    pub foam: f32,
    pub foam_density: f32,
    pub diameter: f32,
    pub _padding: [f32; 3],
}

impl SurfaceUniforms {
    /// Refresh every field from the current configuration.
    pub fn refresh(&mut self, config: &FluidConfig, grid_size: UVec3) {
        let material = &config.material;
        *self = Self {
            refraction_color: material.refraction_color.to_array(),
            reflection_color: material.reflection_color.to_array(),
            container_scale: config.container_size.to_array(),
            opacity: material.opacity,
            container_pos: config.container_pos.to_array(),
            metal: material.metal,
            grid_size: grid_size.as_vec3().to_array(),
            refraction_distort: material.refraction_distort,
            shadowing: material.shadowing,
            smoothness: material.smoothness,
            foam: material.foam,
            foam_density: material.foam_density * config.solver.particles_per_cell,
            diameter: config.particle_radius(),
            _padding: [0.0; 3],
        };
    }
}
