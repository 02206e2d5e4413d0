//! The compute engine boundary.
//!
//! The solver itself is an opaque GPU-resident library. The bridge only knows
//! its calling contract, captured by [`ComputeEngine`]. Work is never executed
//! synchronously: the bridge encodes `(event, instance)` pairs into
//! [`EventToken`]s and enqueues them into host command streams.
//!
//! Adapters:
//! - [`loopback::LoopbackEngine`] - in-process, records every call
//! - `native::NativeEngine` - binds the engine's C ABI (feature `native`)

pub mod abi;
pub mod loopback;
#[cfg(feature = "native")]
pub mod native;

use std::ffi::c_void;
use std::ptr::NonNull;

use bytemuck::Pod;

use crate::error::EngineCallError;

/// Parallel work-group granularity the engine requires for particle buffers.
pub const WORK_GROUP_SIZE: u32 = 256;

/// Opaque instance identifier issued by [`ComputeEngine::create_instance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceHandle(i32);

impl InstanceHandle {
    /// Wrap a raw engine instance id.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw id passed across the boundary.
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

/// Opaque native resource handle (buffer or texture) issued by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(u64);

impl NativeHandle {
    /// Wrap a raw host handle.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw handle value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Event codes understood by the engine's render-event entry point.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventCode {
    /// Re-read the camera parameter block attached to the event.
    CameraUpdate = 0,
    /// Seed the particle buffers from the registered init block.
    ParticleInit = 1,
    /// Advance the simulation by one step using the last pushed parameters.
    SimulationStep = 3,
    /// Splat particles into the fluid color target.
    ParticleRender = 4,
}

impl EventCode {
    /// Decode a raw event code.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(EventCode::CameraUpdate),
            1 => Some(EventCode::ParticleInit),
            3 => Some(EventCode::SimulationStep),
            4 => Some(EventCode::ParticleRender),
            _ => None,
        }
    }
}

/// An `(event, instance)` pair packed into one integer for the host stream.
///
/// The low 8 bits carry the event code, the remaining bits the instance id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventToken(i32);

impl EventToken {
    /// Wrap a token an adapter encoded itself.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Pack an event code and instance handle.
    pub const fn encode(code: EventCode, instance: InstanceHandle) -> Self {
        Self(code as i32 | (instance.raw() << 8))
    }

    /// The packed integer.
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// The event code, if it is one the bridge knows.
    pub fn code(self) -> Option<EventCode> {
        EventCode::from_raw(self.0 & 0xff)
    }

    /// The instance the event targets.
    pub const fn instance(self) -> InstanceHandle {
        InstanceHandle(self.0 >> 8)
    }
}

/// Address of a parameter block handed to the engine.
///
/// Produced only by [`crate::channel::ParameterChannel`], which ties the
/// address's validity to either one call (transient) or a slot lifetime
/// (one-shot).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParamPtr(NonNull<c_void>);

// SAFETY: a ParamPtr is an address, not a borrow. The channel that issued it
// owns the memory and the whole instance requires external serialization.
unsafe impl Send for ParamPtr {}
unsafe impl Sync for ParamPtr {}

impl ParamPtr {
    pub(crate) fn from_ref<T: Pod>(value: &T) -> Self {
        Self(NonNull::from(value).cast())
    }

    /// The raw address for FFI.
    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Copy the block behind the pointer.
    ///
    /// # Safety
    ///
    /// The pointer must still be inside its validity window (transient call or
    /// live one-shot slot) and must have been produced for a block of type `T`.
    pub unsafe fn read<T: Pod>(self) -> T {
        self.0.cast::<T>().as_ptr().read_unaligned()
    }
}

/// Maps host-issued [`NativeHandle`]s to the GPU resource pointers an engine
/// library dereferences.
///
/// Host handles are opaque ids (see [`crate::host::RenderHost::create_buffer`]),
/// so only the embedding application can say which native object one names.
pub struct HandleResolver {
    lookup: Box<dyn Fn(NativeHandle) -> Option<NonNull<c_void>>>,
}

impl HandleResolver {
    pub fn new(lookup: impl Fn(NativeHandle) -> Option<NonNull<c_void>> + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    /// The native pointer behind `handle`, or an error naming `call`.
    pub fn resolve(&self, call: &'static str, handle: NativeHandle) -> Result<*mut c_void, EngineCallError> {
        (self.lookup)(handle)
            .map(NonNull::as_ptr)
            .ok_or_else(|| EngineCallError::new(call, format!("no native resource for handle {:#x}", handle.raw())))
    }

    /// Resolve every handle in order, failing on the first unknown one.
    pub fn resolve_all(&self, call: &'static str, handles: &[NativeHandle]) -> Result<Vec<*mut c_void>, EngineCallError> {
        handles.iter().map(|&h| self.resolve(call, h)).collect()
    }
}

impl std::fmt::Debug for HandleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleResolver").finish_non_exhaustive()
    }
}

/// Which buffer set a registration call carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferSetKind {
    /// Particle buffers, registered with an [`abi::ParticleInitParams`] block.
    Particles,
    /// Grid and solver scratch buffers, registered with an [`abi::SolverParams`] block.
    Grid,
}

/// The calling contract of the opaque compute engine.
///
/// Every pointer argument is produced by the parameter channel. Transient
/// pointers are only valid for the duration of the call. Camera parameter
/// pointers stay valid until the owning camera context is released.
pub trait ComputeEngine {
    /// Acquire a new engine instance.
    fn create_instance(&mut self) -> Result<InstanceHandle, EngineCallError>;

    /// Register a buffer set with the engine. Called exactly once per set per
    /// instance lifetime. `buffers` is ordered by the set's layout.
    fn register_buffers(
        &mut self,
        instance: InstanceHandle,
        kind: BufferSetKind,
        params: ParamPtr,
        buffers: &[NativeHandle],
    ) -> Result<(), EngineCallError>;

    /// Register (or re-register after reallocation) the render targets the
    /// engine splats particles into.
    fn register_render_resources(
        &mut self,
        instance: InstanceHandle,
        color0: NativeHandle,
        color1: NativeHandle,
    ) -> Result<(), EngineCallError>;

    /// Forget the registered render targets. Called when the textures they
    /// name are released and no other camera's targets replace them.
    fn release_render_resources(&mut self, instance: InstanceHandle) -> Result<(), EngineCallError>;

    /// Push the per-step solver parameter block.
    fn set_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError>;

    /// Hand the engine a long-lived camera parameter block address.
    fn set_camera_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError>;

    /// Stop using a camera block handed over by
    /// [`set_camera_parameters`](Self::set_camera_parameters). The bridge frees
    /// the block right after this returns.
    fn release_camera_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError>;

    /// Push the per-frame render parameter block.
    fn set_render_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError>;

    /// Reserve memory for `count` collider ids before contributions run.
    fn set_colliders_count(&mut self, instance: InstanceHandle, count: u32) -> Result<(), EngineCallError>;

    /// Encode an event for enqueueing into a host command stream.
    fn schedule_event(&self, code: EventCode, instance: InstanceHandle) -> EventToken {
        EventToken::encode(code, instance)
    }

    /// Release the instance. Double release is undefined; the caller prevents it.
    fn release_instance(&mut self, instance: InstanceHandle) -> Result<(), EngineCallError>;

    /// Engine build version, if the adapter can report one.
    fn version(&self) -> String {
        String::from("unknown")
    }
}

impl<E: ComputeEngine + ?Sized> ComputeEngine for Box<E> {
    fn create_instance(&mut self) -> Result<InstanceHandle, EngineCallError> {
        (**self).create_instance()
    }

    fn register_buffers(
        &mut self,
        instance: InstanceHandle,
        kind: BufferSetKind,
        params: ParamPtr,
        buffers: &[NativeHandle],
    ) -> Result<(), EngineCallError> {
        (**self).register_buffers(instance, kind, params, buffers)
    }

    fn register_render_resources(
        &mut self,
        instance: InstanceHandle,
        color0: NativeHandle,
        color1: NativeHandle,
    ) -> Result<(), EngineCallError> {
        (**self).register_render_resources(instance, color0, color1)
    }

    fn release_render_resources(&mut self, instance: InstanceHandle) -> Result<(), EngineCallError> {
        (**self).release_render_resources(instance)
    }

    fn set_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        (**self).set_parameters(instance, params)
    }

    fn set_camera_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        (**self).set_camera_parameters(instance, params)
    }

    fn release_camera_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        (**self).release_camera_parameters(instance, params)
    }

    fn set_render_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        (**self).set_render_parameters(instance, params)
    }

    fn set_colliders_count(&mut self, instance: InstanceHandle, count: u32) -> Result<(), EngineCallError> {
        (**self).set_colliders_count(instance, count)
    }

    fn schedule_event(&self, code: EventCode, instance: InstanceHandle) -> EventToken {
        (**self).schedule_event(code, instance)
    }

    fn release_instance(&mut self, instance: InstanceHandle) -> Result<(), EngineCallError> {
        (**self).release_instance(instance)
    }

    fn version(&self) -> String {
        (**self).version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_token_packs_code_and_instance() {
        let token = EventToken::encode(EventCode::SimulationStep, InstanceHandle::from_raw(7));
        assert_eq!(token.raw(), 3 | (7 << 8));
        assert_eq!(token.code(), Some(EventCode::SimulationStep));
        assert_eq!(token.instance(), InstanceHandle::from_raw(7));
    }

    #[test]
    fn test_event_token_distinct_per_instance() {
        let a = EventToken::encode(EventCode::ParticleRender, InstanceHandle::from_raw(1));
        let b = EventToken::encode(EventCode::ParticleRender, InstanceHandle::from_raw(2));
        assert_ne!(a, b);
    }

    #[test]
    fn test_resolver_maps_known_handles() {
        let mut backing = [0u8; 2];
        let base = NonNull::from(&mut backing[0]).cast::<c_void>();
        let resolver = HandleResolver::new(move |h| (h.raw() == 0x1000).then_some(base));

        let resolved = resolver.resolve("register_buffers", NativeHandle::from_raw(0x1000)).unwrap();
        assert_eq!(resolved, base.as_ptr());

        let err = resolver
            .resolve_all(
                "register_buffers",
                &[NativeHandle::from_raw(0x1000), NativeHandle::from_raw(0x1001)],
            )
            .unwrap_err();
        assert_eq!(err.call, "register_buffers");
        assert!(err.reason.contains("0x1001"));
    }

    #[test]
    fn test_unknown_event_code() {
        assert_eq!(EventCode::from_raw(2), None);
        assert_eq!(EventCode::from_raw(0), Some(EventCode::CameraUpdate));
    }
}
