//! Binding to the engine's native C ABI.
//!
//! Links against `liquid_native`. The native exports take one pointer per
//! buffer, so the ordered handle slice from a [`BufferSet`](crate::buffers::BufferSet)
//! is resolved to GPU resource pointers through the [`HandleResolver`] the
//! application supplies, then unpacked positionally and checked against the
//! expected layout length.

use std::ffi::{c_char, c_void, CStr};

use super::{BufferSetKind, ComputeEngine, HandleResolver, InstanceHandle, NativeHandle, ParamPtr};
use crate::buffers::{GRID_LAYOUT, PARTICLE_LAYOUT};
use crate::error::EngineCallError;

type Ptr = *mut c_void;

#[link(name = "liquid_native")]
extern "C" {
    fn CreateFluidInstance() -> i32;
    fn RegisterParticlesBuffers(instance: i32, init: Ptr, position_mass: Ptr, affine0: Ptr, affine1: Ptr, drawable_grid: Ptr, position_radius: Ptr);
    #[allow(clippy::too_many_arguments)]
    fn RegisterSolverBuffers(
        instance: i32,
        params: Ptr,
        position_mass_copy: Ptr,
        particle_density: Ptr,
        grid_data: Ptr,
        index_grid: Ptr,
        grid_blur0: Ptr,
        grid_blur1: Ptr,
        grid_normal: Ptr,
        grid_sdf: Ptr,
        grid_node_positions: Ptr,
        node_particle_pairs: Ptr,
        grid_id: Ptr,
    );
    fn RegisterRenderResources(instance: i32, color0: Ptr, color1: Ptr);
    fn SetFluidParameters(instance: i32, params: Ptr);
    fn SetCameraParameters(instance: i32, params: Ptr) -> Ptr;
    fn SetRenderParameters(instance: i32, params: Ptr) -> Ptr;
    fn SetCollidersCount(instance: i32, count: i32);
    fn ReleaseResources(instance: i32);
    fn GetRenderEventFunc() -> Ptr;
    fn GetCameraUpdateFunction() -> Ptr;
    fn GetVersion() -> *const c_char;
}

fn expect_len(call: &'static str, buffers: &[NativeHandle], expected: usize) -> Result<(), EngineCallError> {
    if buffers.len() != expected {
        return Err(EngineCallError::new(
            call,
            format!("expected {} buffers, got {}", expected, buffers.len()),
        ));
    }
    Ok(())
}

/// Entry points the host's native render thread calls with an event token.
#[derive(Clone, Copy, Debug)]
pub struct HostCallbacks {
    /// Receives `(token)` for init, step and particle render events.
    pub render_event: Ptr,
    /// Receives `(token, camera params)` for camera update events.
    pub camera_update: Ptr,
}

/// [`ComputeEngine`] backed by the native library.
#[derive(Debug)]
pub struct NativeEngine {
    resolver: HandleResolver,
}

impl NativeEngine {
    /// `resolver` turns host handles into the native buffer and texture
    /// pointers the library reads from and writes to.
    pub fn new(resolver: HandleResolver) -> Self {
        Self { resolver }
    }

    /// Native callbacks a host wires its per-frame event dispatch to.
    pub fn callbacks(&self) -> HostCallbacks {
        // SAFETY: both exports take no arguments and return static function pointers.
        unsafe {
            HostCallbacks {
                render_event: GetRenderEventFunc(),
                camera_update: GetCameraUpdateFunction(),
            }
        }
    }
}

impl ComputeEngine for NativeEngine {
    fn create_instance(&mut self) -> Result<InstanceHandle, EngineCallError> {
        // SAFETY: no arguments.
        let id = unsafe { CreateFluidInstance() };
        if id < 0 {
            return Err(EngineCallError::new("create_instance", format!("engine returned {}", id)));
        }
        log::debug!("native engine created instance {}", id);
        Ok(InstanceHandle::from_raw(id))
    }

    fn register_buffers(
        &mut self,
        instance: InstanceHandle,
        kind: BufferSetKind,
        params: ParamPtr,
        buffers: &[NativeHandle],
    ) -> Result<(), EngineCallError> {
        const CALL: &str = "register_buffers";
        let id = instance.raw();
        let p = params.as_ptr();
        // SAFETY: `params` is valid for the duration of this call and each
        // resolved pointer is a live native buffer owned by the host.
        match kind {
            BufferSetKind::Particles => {
                expect_len(CALL, buffers, PARTICLE_LAYOUT.len())?;
                let b = self.resolver.resolve_all(CALL, buffers)?;
                unsafe { RegisterParticlesBuffers(id, p, b[0], b[1], b[2], b[3], b[4]) };
            }
            BufferSetKind::Grid => {
                expect_len(CALL, buffers, GRID_LAYOUT.len())?;
                let b = self.resolver.resolve_all(CALL, buffers)?;
                unsafe {
                    RegisterSolverBuffers(id, p, b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10])
                };
            }
        }
        Ok(())
    }

    fn register_render_resources(
        &mut self,
        instance: InstanceHandle,
        color0: NativeHandle,
        color1: NativeHandle,
    ) -> Result<(), EngineCallError> {
        const CALL: &str = "register_render_resources";
        let color0 = self.resolver.resolve(CALL, color0)?;
        let color1 = self.resolver.resolve(CALL, color1)?;
        // SAFETY: both pointers name live host textures.
        unsafe { RegisterRenderResources(instance.raw(), color0, color1) };
        Ok(())
    }

    fn release_render_resources(&mut self, _instance: InstanceHandle) -> Result<(), EngineCallError> {
        // No export; the library only touches the targets from a particle
        // render event, and every such event follows a fresh registration.
        Ok(())
    }

    fn set_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        // SAFETY: the engine copies the block before returning.
        unsafe { SetFluidParameters(instance.raw(), params.as_ptr()) };
        Ok(())
    }

    fn set_camera_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        // SAFETY: the block lives in a one-shot slot until the camera context is released.
        unsafe { SetCameraParameters(instance.raw(), params.as_ptr()) };
        Ok(())
    }

    fn release_camera_parameters(&mut self, _instance: InstanceHandle, _params: ParamPtr) -> Result<(), EngineCallError> {
        // No export; the library reads the block only when a camera update
        // event carries it, and the sequence carrying it is detached first.
        Ok(())
    }

    fn set_render_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        // SAFETY: the engine copies the block before returning.
        unsafe { SetRenderParameters(instance.raw(), params.as_ptr()) };
        Ok(())
    }

    fn set_colliders_count(&mut self, instance: InstanceHandle, count: u32) -> Result<(), EngineCallError> {
        let count = i32::try_from(count)
            .map_err(|_| EngineCallError::new("set_colliders_count", format!("{} colliders", count)))?;
        // SAFETY: plain integers.
        unsafe { SetCollidersCount(instance.raw(), count) };
        Ok(())
    }

    fn release_instance(&mut self, instance: InstanceHandle) -> Result<(), EngineCallError> {
        // SAFETY: the caller guarantees a single release per instance.
        unsafe { ReleaseResources(instance.raw()) };
        log::debug!("native engine released instance {}", instance.raw());
        Ok(())
    }

    fn version(&self) -> String {
        // SAFETY: the export returns a static NUL-terminated string or null.
        unsafe {
            let raw = GetVersion();
            if raw.is_null() {
                return String::from("unknown");
            }
            CStr::from_ptr(raw).to_string_lossy().into_owned()
        }
    }
}
