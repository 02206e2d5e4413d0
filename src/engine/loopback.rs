//! In-process compute engine.
//!
//! `LoopbackEngine` honours the full calling contract without running a
//! solver: it issues instance ids, checks that registrations happen once, and
//! copies every parameter block out of the address it is handed *during* the
//! call, which is the only moment the block is guaranteed valid. Camera block
//! addresses are kept until the bridge releases them, so a camera-update event
//! can be resolved against them the way the real engine does.

use std::collections::{HashMap, HashSet};

use super::abi::{CameraParams, ParticleInitParams, RenderParams, SolverParams};
use super::{BufferSetKind, ComputeEngine, EventCode, EventToken, InstanceHandle, NativeHandle, ParamPtr};
use crate::error::EngineCallError;

/// One boundary call, with the parameter block contents copied at call time.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineCall {
    CreateInstance(InstanceHandle),
    RegisterParticles {
        instance: InstanceHandle,
        init: ParticleInitParams,
        buffers: Vec<NativeHandle>,
    },
    RegisterGrid {
        instance: InstanceHandle,
        params: SolverParams,
        buffers: Vec<NativeHandle>,
    },
    RegisterRenderResources {
        instance: InstanceHandle,
        color0: NativeHandle,
        color1: NativeHandle,
    },
    ReleaseRenderResources(InstanceHandle),
    SetParameters {
        instance: InstanceHandle,
        params: SolverParams,
    },
    SetCameraParameters {
        instance: InstanceHandle,
        address: ParamPtr,
        params: CameraParams,
    },
    ReleaseCameraParameters {
        instance: InstanceHandle,
        address: ParamPtr,
    },
    SetRenderParameters {
        instance: InstanceHandle,
        params: RenderParams,
    },
    SetCollidersCount {
        instance: InstanceHandle,
        count: u32,
    },
    ReleaseInstance(InstanceHandle),
}

impl EngineCall {
    /// Boundary function name, as used for failure injection.
    pub fn name(&self) -> &'static str {
        match self {
            EngineCall::CreateInstance(_) => "create_instance",
            EngineCall::RegisterParticles { .. } | EngineCall::RegisterGrid { .. } => "register_buffers",
            EngineCall::RegisterRenderResources { .. } => "register_render_resources",
            EngineCall::ReleaseRenderResources(_) => "release_render_resources",
            EngineCall::SetParameters { .. } => "set_parameters",
            EngineCall::SetCameraParameters { .. } => "set_camera_parameters",
            EngineCall::ReleaseCameraParameters { .. } => "release_camera_parameters",
            EngineCall::SetRenderParameters { .. } => "set_render_parameters",
            EngineCall::SetCollidersCount { .. } => "set_colliders_count",
            EngineCall::ReleaseInstance(_) => "release_instance",
        }
    }
}

/// Per-instance state the loopback engine tracks.
#[derive(Clone, Debug, Default)]
pub struct LoopbackInstance {
    pub particles_registered: bool,
    pub grid_registered: bool,
    pub render_resources: Option<(NativeHandle, NativeHandle)>,
    pub camera_blocks: Vec<ParamPtr>,
    pub last_parameters: Option<SolverParams>,
    pub colliders_count: Option<u32>,
}

/// Engine that records calls instead of simulating.
#[derive(Debug)]
pub struct LoopbackEngine {
    next_id: i32,
    instances: HashMap<InstanceHandle, LoopbackInstance>,
    released: Vec<InstanceHandle>,
    calls: Vec<EngineCall>,
    fail_on: HashSet<&'static str>,
    version: String,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            instances: HashMap::new(),
            released: Vec::new(),
            calls: Vec::new(),
            fail_on: HashSet::new(),
            version: format!("loopback-{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Make every call named `call` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&mut self, call: &'static str) {
        self.fail_on.insert(call);
    }

    pub fn clear_failures(&mut self) {
        self.fail_on.clear();
    }

    fn check(&self, call: &'static str) -> Result<(), EngineCallError> {
        if self.fail_on.contains(call) {
            Err(EngineCallError::new(call, "injected failure"))
        } else {
            Ok(())
        }
    }

    fn instance_mut(
        &mut self,
        call: &'static str,
        instance: InstanceHandle,
    ) -> Result<&mut LoopbackInstance, EngineCallError> {
        self.instances
            .get_mut(&instance)
            .ok_or_else(|| EngineCallError::new(call, format!("unknown instance {}", instance.raw())))
    }

    /// Resolve an event the host replays, the way the engine's event entry
    /// point would. Camera updates read the block behind `data`, which must be
    /// an address previously handed over by `set_camera_parameters`.
    pub fn dispatch(&self, token: EventToken, data: Option<ParamPtr>) -> Result<Option<CameraParams>, EngineCallError> {
        let instance = self
            .instances
            .get(&token.instance())
            .ok_or_else(|| EngineCallError::new("dispatch", "event for unknown instance"))?;
        match token.code() {
            Some(EventCode::CameraUpdate) => {
                let ptr = data.ok_or_else(|| EngineCallError::new("dispatch", "camera update without data"))?;
                if !instance.camera_blocks.contains(&ptr) {
                    return Err(EngineCallError::new("dispatch", "camera block was never registered"));
                }
                // SAFETY: the address was registered through set_camera_parameters
                // and the bridge frees it only after release_camera_parameters
                // has removed it from `camera_blocks`.
                Ok(Some(unsafe { ptr.read::<CameraParams>() }))
            }
            Some(_) => Ok(None),
            None => Err(EngineCallError::new("dispatch", format!("unknown event code {}", token.raw() & 0xff))),
        }
    }

    pub fn calls(&self) -> &[EngineCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Calls named `name`, in order.
    pub fn calls_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a EngineCall> + 'a {
        self.calls.iter().filter(move |c| c.name() == name)
    }

    pub fn instance(&self, instance: InstanceHandle) -> Option<&LoopbackInstance> {
        self.instances.get(&instance)
    }

    pub fn live_instances(&self) -> usize {
        self.instances.len()
    }

    pub fn released(&self) -> &[InstanceHandle] {
        &self.released
    }
}

impl ComputeEngine for LoopbackEngine {
    fn create_instance(&mut self) -> Result<InstanceHandle, EngineCallError> {
        self.check("create_instance")?;
        let handle = InstanceHandle::from_raw(self.next_id);
        self.next_id += 1;
        self.instances.insert(handle, LoopbackInstance::default());
        self.calls.push(EngineCall::CreateInstance(handle));
        Ok(handle)
    }

    fn register_buffers(
        &mut self,
        instance: InstanceHandle,
        kind: BufferSetKind,
        params: ParamPtr,
        buffers: &[NativeHandle],
    ) -> Result<(), EngineCallError> {
        const CALL: &str = "register_buffers";
        self.check(CALL)?;
        let state = self.instance_mut(CALL, instance)?;
        let call = match kind {
            BufferSetKind::Particles => {
                if state.particles_registered {
                    return Err(EngineCallError::new(CALL, "particle buffers registered twice"));
                }
                state.particles_registered = true;
                EngineCall::RegisterParticles {
                    instance,
                    // SAFETY: transient block, valid for the duration of this call.
                    init: unsafe { params.read::<ParticleInitParams>() },
                    buffers: buffers.to_vec(),
                }
            }
            BufferSetKind::Grid => {
                if state.grid_registered {
                    return Err(EngineCallError::new(CALL, "grid buffers registered twice"));
                }
                state.grid_registered = true;
                EngineCall::RegisterGrid {
                    instance,
                    // SAFETY: transient block, valid for the duration of this call.
                    params: unsafe { params.read::<SolverParams>() },
                    buffers: buffers.to_vec(),
                }
            }
        };
        self.calls.push(call);
        Ok(())
    }

    fn register_render_resources(
        &mut self,
        instance: InstanceHandle,
        color0: NativeHandle,
        color1: NativeHandle,
    ) -> Result<(), EngineCallError> {
        const CALL: &str = "register_render_resources";
        self.check(CALL)?;
        self.instance_mut(CALL, instance)?.render_resources = Some((color0, color1));
        self.calls.push(EngineCall::RegisterRenderResources {
            instance,
            color0,
            color1,
        });
        Ok(())
    }

    fn release_render_resources(&mut self, instance: InstanceHandle) -> Result<(), EngineCallError> {
        const CALL: &str = "release_render_resources";
        self.check(CALL)?;
        self.instance_mut(CALL, instance)?.render_resources = None;
        self.calls.push(EngineCall::ReleaseRenderResources(instance));
        Ok(())
    }

    fn set_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        const CALL: &str = "set_parameters";
        self.check(CALL)?;
        // SAFETY: transient block, valid for the duration of this call.
        let params = unsafe { params.read::<SolverParams>() };
        self.instance_mut(CALL, instance)?.last_parameters = Some(params);
        self.calls.push(EngineCall::SetParameters { instance, params });
        Ok(())
    }

    fn set_camera_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        const CALL: &str = "set_camera_parameters";
        self.check(CALL)?;
        self.instance_mut(CALL, instance)?.camera_blocks.push(params);
        self.calls.push(EngineCall::SetCameraParameters {
            instance,
            address: params,
            // SAFETY: one-shot block owned by the bridge's parameter channel.
            params: unsafe { params.read::<CameraParams>() },
        });
        Ok(())
    }

    fn release_camera_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        const CALL: &str = "release_camera_parameters";
        self.check(CALL)?;
        let blocks = &mut self.instance_mut(CALL, instance)?.camera_blocks;
        let position = blocks
            .iter()
            .position(|&p| p == params)
            .ok_or_else(|| EngineCallError::new(CALL, "camera block was never registered"))?;
        blocks.swap_remove(position);
        self.calls.push(EngineCall::ReleaseCameraParameters {
            instance,
            address: params,
        });
        Ok(())
    }

    fn set_render_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        const CALL: &str = "set_render_parameters";
        self.check(CALL)?;
        self.instance_mut(CALL, instance)?;
        self.calls.push(EngineCall::SetRenderParameters {
            instance,
            // SAFETY: transient block, valid for the duration of this call.
            params: unsafe { params.read::<RenderParams>() },
        });
        Ok(())
    }

    fn set_colliders_count(&mut self, instance: InstanceHandle, count: u32) -> Result<(), EngineCallError> {
        const CALL: &str = "set_colliders_count";
        self.check(CALL)?;
        self.instance_mut(CALL, instance)?.colliders_count = Some(count);
        self.calls.push(EngineCall::SetCollidersCount { instance, count });
        Ok(())
    }

    fn release_instance(&mut self, instance: InstanceHandle) -> Result<(), EngineCallError> {
        const CALL: &str = "release_instance";
        self.check(CALL)?;
        if self.instances.remove(&instance).is_none() {
            return Err(EngineCallError::new(CALL, format!("unknown instance {}", instance.raw())));
        }
        self.released.push(instance);
        self.calls.push(EngineCall::ReleaseInstance(instance));
        Ok(())
    }

    fn version(&self) -> String {
        self.version.clone()
    }
}
