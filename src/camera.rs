//! Per-camera render cache.
//!
//! A [`CameraRenderContext`] holds everything one camera needs to draw the
//! fluid: a one-shot camera parameter block the engine reads by address, three
//! render textures sized to the camera, and (for attached delivery) a command
//! sequence the host replays every frame.
//!
//! The engine splats into one registered pair of targets per instance, so the
//! owning [`FluidInstance`](crate::instance::FluidInstance) registers a
//! context's `color0`/`color1` before that camera's particle render runs.
//!
//! ```text
//!   Absent ──create──▶ Stale ──ensure──▶ Allocated ──resize──▶ Stale ──ensure──▶ Allocated
//!                                            │
//!                                         release
//!                                            ▼
//!                                         Released
//! ```
//!
//! `ensure` is a no-op while the camera's pixel size and insertion point are
//! unchanged. A size change reallocates the textures exactly once and
//! rebuilds the sequence exactly once.

use glam::Mat4;

use crate::channel::{OneShot, ParameterChannel};
use crate::command::{Command, CommandStream, RenderTarget};
use crate::engine::abi::CameraParams;
use crate::engine::{ComputeEngine, EventToken, InstanceHandle, NativeHandle, ParamPtr};
use crate::error::{AllocationError, ConfigurationError, FluidError, InvalidHandleError};
use crate::host::{CameraId, CameraView, InsertionPoint, PixelSize, RenderHost, SequenceId, TextureDesc, TextureFormat};

/// Label of the attached per-camera sequence.
pub const RENDER_SEQUENCE_LABEL: &str = "liquid.render";

/// Where a context's per-frame commands go.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// A sequence attached to the camera and replayed by the host.
    Attached,
    /// Commands appended every frame to a stream the host passes in.
    External,
}

impl Delivery {
    pub const fn name(self) -> &'static str {
        match self {
            Delivery::Attached => "an attached sequence",
            Delivery::External => "an external stream",
        }
    }
}

/// Lifecycle state of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Textures and sequence match the camera.
    Allocated,
    /// The sequence must be (re)built before the next frame.
    Stale,
    /// Everything has been released; the context is inert.
    Released,
}

/// The textures a context draws with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTargets {
    /// Copy of the camera color taken before the fluid draws.
    pub background: NativeHandle,
    /// Particle splat color and depth.
    pub color0: NativeHandle,
    /// Filter scratch.
    pub color1: NativeHandle,
    pub size: PixelSize,
}

/// Instance-wide resources every camera's commands reference.
#[derive(Clone, Copy, Debug)]
pub struct FrameResources {
    /// Scheduled by the engine for this instance.
    pub camera_update: EventToken,
    pub particle_render: EventToken,
    /// Address of the surface material block.
    pub surface: ParamPtr,
    pub grid_normal: NativeHandle,
    /// Container local to world.
    pub transform: Mat4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Attachment {
    sequence: SequenceId,
    /// The point used at attach time; detach always uses this one.
    point: InsertionPoint,
}

/// Cached render state for one camera.
#[derive(Debug)]
pub struct CameraRenderContext {
    camera: CameraId,
    delivery: Delivery,
    state: ContextState,
    params: OneShot<CameraParams>,
    targets: Option<RenderTargets>,
    attachment: Option<Attachment>,
    texture_allocations: u32,
    sequence_builds: u32,
}

impl CameraRenderContext {
    /// Allocate the camera parameter block and hand its address to the engine.
    ///
    /// The context starts [`ContextState::Stale`]; call [`ensure`](Self::ensure)
    /// to allocate textures and build the sequence.
    pub fn create<E: ComputeEngine + ?Sized>(
        view: &CameraView,
        delivery: Delivery,
        diameter: f32,
        engine: &mut E,
        instance: InstanceHandle,
        channel: &mut ParameterChannel,
    ) -> Result<Self, FluidError> {
        let params = channel.push_one_shot(CameraParams::new(view.view, view.projection, view.position, diameter));
        if let Err(err) = engine.set_camera_parameters(instance, params.ptr()) {
            // The engine never saw the address, so the slot can go right away.
            let _ = channel.free(params);
            return Err(err.into());
        }
        log::debug!("created render context for camera {}", view.id.raw());

        Ok(Self {
            camera: view.id,
            delivery,
            state: ContextState::Stale,
            params,
            targets: None,
            attachment: None,
            texture_allocations: 0,
            sequence_builds: 0,
        })
    }

    /// Bring textures and sequence in line with `view`.
    ///
    /// Returns `true` if the sequence was (re)built. Registering new targets
    /// with the engine is left to the caller.
    pub fn ensure(
        &mut self,
        view: &CameraView,
        host: &mut dyn RenderHost,
        frame: &FrameResources,
    ) -> Result<bool, FluidError> {
        if self.state == ContextState::Released {
            return Err(InvalidHandleError::UnknownCamera(self.camera).into());
        }

        let resized = self.targets.map_or(true, |t| t.size != view.size);
        let point = view.render_path.insertion_point();
        let moved = self.attachment.is_some_and(|a| a.point != point);

        if resized || moved {
            self.state = ContextState::Stale;
            self.detach(host)?;
        }

        if resized {
            self.release_targets(host);
            let targets = allocate_targets(host, self.camera, view.size)?;
            self.targets = Some(targets);
            self.texture_allocations += 1;
            log::debug!(
                "camera {}: render targets allocated at {}x{}",
                self.camera.raw(),
                view.size.width,
                view.size.height
            );
        }

        if self.state != ContextState::Stale {
            return Ok(false);
        }

        if self.delivery == Delivery::Attached {
            let mut stream = CommandStream::new(RENDER_SEQUENCE_LABEL);
            self.record(&mut stream, frame)?;
            let sequence = host.attach_sequence(self.camera, point, stream)?;
            self.attachment = Some(Attachment { sequence, point });
        }
        self.sequence_builds += 1;
        self.state = ContextState::Allocated;
        log::debug!("camera {}: render sequence built ({:?})", self.camera.raw(), point);
        Ok(true)
    }

    /// Write fresh camera parameters through the existing block address.
    pub fn update_camera(
        &self,
        channel: &mut ParameterChannel,
        view: &CameraView,
        diameter: f32,
    ) -> Result<(), InvalidHandleError> {
        let params = CameraParams::new(view.view, view.projection, view.position, diameter);
        channel.update_one_shot(&self.params, &params)
    }

    /// Append this camera's frame commands to `stream`.
    ///
    /// Order: camera update, background copy, particle render, surface draw.
    /// The surface draw samples both the background and the particle output.
    pub fn record(&self, stream: &mut CommandStream, frame: &FrameResources) -> Result<(), FluidError> {
        let targets = self
            .targets
            .ok_or(ConfigurationError::Missing("camera render targets"))?;
        stream.push_event(frame.camera_update, Some(self.params.ptr()));
        stream.push(Command::CopyTexture {
            source: RenderTarget::CameraColor,
            destination: RenderTarget::Texture(targets.background),
        });
        stream.push(Command::SetTarget(RenderTarget::Texture(targets.color0)));
        stream.push(Command::ClearTarget);
        stream.push_event(frame.particle_render, None);
        stream.push(Command::SetTarget(RenderTarget::CameraColor));
        stream.push(Command::DrawSurface {
            uniforms: frame.surface,
            background: targets.background,
            fluid_color: targets.color0,
            grid_normal: frame.grid_normal,
            transform: frame.transform,
        });
        Ok(())
    }

    /// Detach the sequence, release textures and free the parameter block.
    ///
    /// `instance` is the engine instance still holding the block's address, or
    /// `None` once that instance is gone. The block is only freed after the
    /// engine has let go of it; if it refuses, the slot stays live for the
    /// channel's final sweep.
    ///
    /// Best-effort and idempotent. Returns the number of failed releases.
    pub fn release<E: ComputeEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        instance: Option<InstanceHandle>,
        host: &mut dyn RenderHost,
        channel: &mut ParameterChannel,
    ) -> usize {
        if self.state == ContextState::Released {
            return 0;
        }
        let mut failures = 0;
        if let Err(err) = self.detach(host) {
            log::warn!("camera {}: failed to detach render sequence: {}", self.camera.raw(), err);
            failures += 1;
        }
        failures += self.release_targets(host);

        let unregistered = match instance {
            Some(instance) => engine.release_camera_parameters(instance, self.params.ptr()),
            None => Ok(()),
        };
        match unregistered {
            Ok(()) => {
                if let Err(err) = channel.free(self.params) {
                    log::warn!("camera {}: failed to free parameter block: {}", self.camera.raw(), err);
                    failures += 1;
                }
            }
            Err(err) => {
                log::warn!("camera {}: engine kept the parameter block: {}", self.camera.raw(), err);
                failures += 1;
            }
        }
        self.state = ContextState::Released;
        log::debug!("released render context for camera {}", self.camera.raw());
        failures
    }

    /// Forget the attachment only once the host has actually removed it.
    fn detach(&mut self, host: &mut dyn RenderHost) -> Result<(), InvalidHandleError> {
        if let Some(attachment) = self.attachment {
            host.detach_sequence(self.camera, attachment.point, attachment.sequence)?;
            self.attachment = None;
        }
        Ok(())
    }

    fn release_targets(&mut self, host: &mut dyn RenderHost) -> usize {
        let Some(targets) = self.targets.take() else {
            return 0;
        };
        [targets.background, targets.color0, targets.color1]
            .into_iter()
            .filter(|&texture| match host.release_texture(texture) {
                Ok(()) => false,
                Err(err) => {
                    log::warn!("camera {}: failed to release texture: {}", self.camera.raw(), err);
                    true
                }
            })
            .count()
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn targets(&self) -> Option<RenderTargets> {
        self.targets
    }

    /// Address of the camera parameter block the engine holds.
    pub fn params_ptr(&self) -> ParamPtr {
        self.params.ptr()
    }

    pub fn sequence(&self) -> Option<SequenceId> {
        self.attachment.map(|a| a.sequence)
    }

    pub fn insertion_point(&self) -> Option<InsertionPoint> {
        self.attachment.map(|a| a.point)
    }

    /// Times the textures have been allocated, including the first.
    pub fn texture_allocations(&self) -> u32 {
        self.texture_allocations
    }

    /// Times the sequence has been built, including the first.
    pub fn sequence_builds(&self) -> u32 {
        self.sequence_builds
    }
}

fn allocate_targets(host: &mut dyn RenderHost, camera: CameraId, size: PixelSize) -> Result<RenderTargets, AllocationError> {
    let descs = [
        ("background", TextureFormat::Rgba8Unorm, 0),
        ("color0", TextureFormat::Rgba32Float, 16),
        ("color1", TextureFormat::Rgba32Float, 0),
    ];
    let mut handles = Vec::with_capacity(descs.len());
    for (name, format, depth_bits) in descs {
        let label = format!("camera{}.{}", camera.raw(), name);
        match host.create_texture(&TextureDesc {
            label: &label,
            size,
            format,
            depth_bits,
        }) {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                for handle in handles {
                    if let Err(release) = host.release_texture(handle) {
                        log::warn!("failed to release partially allocated texture: {}", release);
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(RenderTargets {
        background: handles[0],
        color0: handles[1],
        color1: handles[2],
        size,
    })
}
