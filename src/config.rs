//! Configuration for a fluid instance.
//!
//! Configurations serialize to JSON so presets can be saved and loaded by the
//! runner.
//!
//! # Example
//!
//! ```ignore
//! let mut config = FluidConfig::default();
//! config.max_particle_number = 1000;
//! config.cell_size = 0.1;
//! config.validate()?;
//! config.save("small.json")?;
//! ```

use glam::{UVec3, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::buffers;
use crate::error::{ConfigError, ConfigurationError};

/// Physical parameters of the solver.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SolverParameters {
    /// Gravity in world units per second squared.
    pub gravity: Vec3,
    /// 0 = inviscid, 1 = fully damped affine transfer.
    pub viscosity: f32,
    pub fluid_stiffness: f32,
    pub fluid_stiffness_power: f32,
    /// Rest density, in particles per grid cell.
    pub particles_per_cell: f32,
    /// Particle speed clamp, in cells per time unit.
    pub velocity_limit: f32,
    pub boundary_force: f32,
}

impl Default for SolverParameters {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.81, 0.0),
            viscosity: 0.392,
            fluid_stiffness: 0.1,
            fluid_stiffness_power: 3.0,
            particles_per_cell: 10.0,
            velocity_limit: 3.0,
            boundary_force: 8.0,
        }
    }
}

/// Surface shading and screen-space filter parameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaterialParameters {
    pub opacity: f32,
    pub metal: f32,
    pub refraction_distort: f32,
    pub shadowing: f32,
    pub smoothness: f32,
    pub refraction_color: Vec4,
    pub reflection_color: Vec4,
    pub foam: f32,
    pub foam_density: f32,
    /// Splat size relative to the mean particle spacing.
    pub particle_scale: f32,
    pub blur_radius: f32,
    pub bilateral_weight: f32,
}

impl Default for MaterialParameters {
    fn default() -> Self {
        Self {
            opacity: 0.9,
            metal: 0.3,
            refraction_distort: 0.1,
            shadowing: 0.5,
            smoothness: 0.85,
            refraction_color: Vec4::new(0.2, 0.5, 0.9, 1.0),
            reflection_color: Vec4::new(0.9, 0.95, 1.0, 1.0),
            foam: 0.0,
            foam_density: 1.0,
            particle_scale: 1.5,
            blur_radius: 4.0,
            bilateral_weight: 2.5,
        }
    }
}

/// Complete configuration of one fluid instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FluidConfig {
    /// Upper bound on a single step, in simulation time units.
    pub time_step_max: f32,
    /// Simulation time units advanced per wall-clock second.
    pub sim_time_per_sec: f32,
    /// Upper bound on particles; buffers are sized from this.
    pub max_particle_number: u32,
    /// Fixed steps per frame.
    pub iterations_per_frame: u32,
    /// Whether `advance` steps the solver.
    pub run_simulation: bool,
    /// Whether `render` records any commands.
    pub render_enabled: bool,
    /// Grid cell edge in world units.
    pub cell_size: f32,
    pub emitter_density: f32,
    pub container_size: Vec3,
    pub container_pos: Vec3,
    pub emitter_size: Vec3,
    pub emitter_pos: Vec3,
    pub fluid_initial_velocity: Vec3,
    pub particle_mass: f32,
    pub solver: SolverParameters,
    pub material: MaterialParameters,
}

impl Default for FluidConfig {
    fn default() -> Self {
        Self {
            time_step_max: 1.0,
            sim_time_per_sec: 40.0,
            max_particle_number: 262_144,
            iterations_per_frame: 1,
            run_simulation: true,
            render_enabled: true,
            cell_size: 0.1,
            emitter_density: 1.0,
            container_size: Vec3::splat(10.0),
            container_pos: Vec3::ZERO,
            emitter_size: Vec3::splat(5.0),
            emitter_pos: Vec3::new(0.0, 5.0, 0.0),
            fluid_initial_velocity: Vec3::ZERO,
            particle_mass: 1.0,
            solver: SolverParameters::default(),
            material: MaterialParameters::default(),
        }
    }
}

fn positive(field: &'static str, value: f32) -> Result<(), ConfigurationError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigurationError::NonPositive {
            field,
            value: value as f64,
        })
    }
}

impl FluidConfig {
    /// Save the configuration to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load and validate a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Parse and validate a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value the instance depends on.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        positive("cell_size", self.cell_size)?;
        positive("time_step_max", self.time_step_max)?;
        positive("sim_time_per_sec", self.sim_time_per_sec)?;
        positive("container_size.x", self.container_size.x)?;
        positive("container_size.y", self.container_size.y)?;
        positive("container_size.z", self.container_size.z)?;
        positive("emitter_density", self.emitter_density)?;
        positive("solver.particles_per_cell", self.solver.particles_per_cell)?;
        if self.max_particle_number == 0 {
            return Err(ConfigurationError::NonPositive {
                field: "max_particle_number",
                value: 0.0,
            });
        }
        if self.iterations_per_frame == 0 {
            return Err(ConfigurationError::NonPositive {
                field: "iterations_per_frame",
                value: 0.0,
            });
        }
        Ok(())
    }

    /// Cells per axis: `ceil(container_size / cell_size)`.
    pub fn grid_dimensions(&self) -> UVec3 {
        buffers::grid_dimensions(self.container_size, self.cell_size)
    }

    /// Particle buffer capacity, rounded to the engine work-group size.
    pub fn particle_capacity(&self) -> u32 {
        buffers::particle_capacity(self.max_particle_number)
    }

    /// Particles the emitter seeds, capped at `max_particle_number`.
    pub fn active_particle_count(&self) -> u32 {
        let cells = self.emitter_size / self.cell_size;
        let density = self.solver.particles_per_cell * self.emitter_density;
        let count = (density * cells.x * cells.y * cells.z).max(0.0) as u64;
        count.min(self.max_particle_number as u64) as u32
    }

    /// Rendered particle radius in world units.
    pub fn particle_radius(&self) -> f32 {
        self.material.particle_scale * self.cell_size / self.solver.particles_per_cell.powf(0.333)
    }
}
