//! # Liquid Bridge
//!
//! Host-side orchestration for an opaque GPU liquid solver.
//!
//! The solver runs entirely on the GPU behind a small C-style calling
//! contract. This crate does everything around it: sizes and allocates the
//! particle and grid buffers, marshals fixed-layout parameter blocks across
//! the boundary, sequences collider passes, keeps per-camera render targets
//! and command sequences, and turns wall-clock frame deltas into bounded
//! solver steps.
//!
//! ## Quick Start
//!
//! ```ignore
//! use liquid_bridge::prelude::*;
//!
//! let mut host = HeadlessHost::new();
//! host.add_camera(view);
//!
//! let mut fluid = FluidInstance::new(LoopbackEngine::new(), FluidConfig::default());
//! fluid.init(&mut host)?;
//!
//! // Every frame:
//! fluid.advance(0.016, &mut host)?;
//! fluid.render(view.id, &mut host)?;
//!
//! fluid.teardown(&mut host);
//! ```
//!
//! ## Core Concepts
//!
//! ### Seams
//!
//! Two traits separate the bridge from the outside world:
//!
//! - [`ComputeEngine`] - the solver's calling contract. Adapters:
//!   [`LoopbackEngine`] (in-process, records every call) and
//!   `NativeEngine` (links the real library, feature `native`).
//! - [`RenderHost`] - the renderer that owns GPU memory, cameras and command
//!   execution. Adapters: [`HeadlessHost`] (in-memory) and `WgpuHost`
//!   (real device, feature `wgpu`).
//!
//! ### Parameter blocks
//!
//! Every block crossing the boundary is a `#[repr(C)]` struct in
//! [`engine::abi`]. The [`ParameterChannel`] hands them over either
//! transiently (valid for one call) or as one-shot slots whose address stays
//! fixed until freed, which the engine may read at any later event.
//!
//! ### Events
//!
//! The engine never runs synchronously. The bridge encodes
//! `(event, instance)` pairs into [`EventToken`]s and records them into
//! [`CommandStream`]s the host executes when it chooses.
//!
//! ## Module Overview
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`instance`] | [`FluidInstance`] lifecycle, stepping and rendering |
//! | [`registry`] | [`FluidRegistry`] driving several instances |
//! | [`buffers`] | [`BufferSet`] and the buffer layouts |
//! | [`channel`] | [`ParameterChannel`] one-shot and transient blocks |
//! | [`collider`] | [`ColliderAggregationPipeline`] and collider types |
//! | [`camera`] | [`CameraRenderContext`] per-camera cache |
//! | [`time`] | [`SimulationClock`] step planning |
//! | [`config`] | [`FluidConfig`] with JSON load and save |

pub mod buffers;
pub mod camera;
pub mod channel;
pub mod collider;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
#[cfg(feature = "wgpu")]
pub mod gpu;
pub mod headless;
pub mod host;
pub mod instance;
pub mod registry;
pub mod time;

pub use bytemuck;
pub use glam::{Mat4, UVec3, Vec3, Vec4};

pub use buffers::{BufferLayout, BufferSet, GRID_LAYOUT, PARTICLE_LAYOUT};
pub use camera::{CameraRenderContext, ContextState, Delivery};
pub use channel::{OneShot, ParameterChannel};
pub use collider::{AnalyticCollider, ColliderAggregationPipeline, ColliderSet, SdfCollider, SdfShape, MAX_COLLIDERS};
pub use command::{Command, CommandStream, RenderTarget};
pub use config::{FluidConfig, MaterialParameters, SolverParameters};
pub use engine::loopback::LoopbackEngine;
#[cfg(feature = "native")]
pub use engine::native::NativeEngine;
pub use engine::{ComputeEngine, EventCode, EventToken, HandleResolver, InstanceHandle, NativeHandle, ParamPtr};
pub use error::{
    AllocationError, ConfigError, ConfigurationError, EngineCallError, FluidError, InvalidHandleError, Result,
};
#[cfg(feature = "wgpu")]
pub use gpu::WgpuHost;
pub use headless::HeadlessHost;
pub use host::{CameraId, CameraView, InsertionPoint, PixelSize, RenderHost, RenderPath};
pub use instance::{FluidInstance, InstanceState, TeardownReport};
pub use registry::{FluidId, FluidRegistry};
pub use time::{SimulationClock, StepPlan};

/// Everything a host integration usually needs.
pub mod prelude {
    pub use crate::camera::Delivery;
    pub use crate::collider::{AnalyticCollider, ColliderSet, SdfCollider, SdfShape};
    pub use crate::command::CommandStream;
    pub use crate::config::FluidConfig;
    pub use crate::engine::loopback::LoopbackEngine;
    #[cfg(feature = "native")]
    pub use crate::engine::native::NativeEngine;
    pub use crate::engine::ComputeEngine;
    pub use crate::error::{FluidError, Result};
    #[cfg(feature = "wgpu")]
    pub use crate::gpu::WgpuHost;
    pub use crate::headless::HeadlessHost;
    pub use crate::host::{CameraId, CameraView, PixelSize, RenderHost, RenderPath};
    pub use crate::instance::{FluidInstance, InstanceState};
    pub use crate::registry::{FluidId, FluidRegistry};
    pub use crate::{Mat4, Vec3};
}
