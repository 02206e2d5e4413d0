//! Integration tests for per-camera render contexts.

use liquid_bridge::prelude::*;
use liquid_bridge::engine::BufferSetKind;
use liquid_bridge::{
    Command, ConfigurationError, ContextState, EngineCallError, EventCode, EventToken, InsertionPoint,
    InstanceHandle, InvalidHandleError, NativeHandle, ParamPtr,
};

const CAMERA: CameraId = CameraId::new(7);

fn view(width: u32, height: u32) -> CameraView {
    CameraView {
        id: CAMERA,
        size: PixelSize::new(width, height),
        render_path: RenderPath::Forward,
        view: Mat4::look_at_rh(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO, Vec3::Y),
        projection: Mat4::perspective_rh(1.0, width as f32 / height as f32, 0.1, 50.0),
        position: Vec3::new(0.0, 2.0, 8.0),
    }
}

fn setup() -> (FluidInstance<LoopbackEngine>, HeadlessHost) {
    let mut host = HeadlessHost::new();
    host.add_camera(view(800, 600));
    let config = FluidConfig {
        max_particle_number: 1000,
        cell_size: 0.5,
        ..Default::default()
    };
    let mut fluid = FluidInstance::new(LoopbackEngine::new(), config);
    fluid.init(&mut host).unwrap();
    (fluid, host)
}

// ============================================================================
// Context caching
// ============================================================================

#[test]
fn test_ensure_twice_is_noop() {
    let (mut fluid, mut host) = setup();

    assert!(fluid.ensure_render_context(CAMERA, &mut host).unwrap());
    let textures = host.live_textures();
    let attaches = host.attach_count();
    let registrations = fluid.engine().calls_named("register_render_resources").count();

    assert!(!fluid.ensure_render_context(CAMERA, &mut host).unwrap());

    assert_eq!(host.live_textures(), textures);
    assert_eq!(host.attach_count(), attaches);
    assert_eq!(
        fluid.engine().calls_named("register_render_resources").count(),
        registrations
    );
    let context = fluid.camera_context(CAMERA).unwrap();
    assert_eq!(context.texture_allocations(), 1);
    assert_eq!(context.sequence_builds(), 1);
    assert_eq!(context.state(), ContextState::Allocated);
    fluid.teardown(&mut host);
}

#[test]
fn test_render_many_frames_allocates_once() {
    let (mut fluid, mut host) = setup();
    for _ in 0..10 {
        fluid.advance(0.016, &mut host).unwrap();
        fluid.render(CAMERA, &mut host).unwrap();
    }
    let context = fluid.camera_context(CAMERA).unwrap();
    assert_eq!(context.texture_allocations(), 1);
    assert_eq!(context.sequence_builds(), 1);
    assert_eq!(host.attach_count(), 1);
    assert_eq!(host.live_textures(), 3);
    fluid.teardown(&mut host);
}

#[test]
fn test_resize_rebuilds_exactly_once() {
    let (mut fluid, mut host) = setup();
    fluid.render(CAMERA, &mut host).unwrap();
    let old = fluid.camera_context(CAMERA).unwrap().targets().unwrap();

    host.resize_camera(CAMERA, PixelSize::new(1920, 1080));
    fluid.render(CAMERA, &mut host).unwrap();
    fluid.render(CAMERA, &mut host).unwrap();

    let context = fluid.camera_context(CAMERA).unwrap();
    assert_eq!(context.texture_allocations(), 2);
    assert_eq!(context.sequence_builds(), 2);
    assert_eq!(context.targets().unwrap().size, PixelSize::new(1920, 1080));

    // Old textures went before the new ones were registered.
    for texture in [old.background, old.color0, old.color1] {
        assert!(host.released().contains(&texture));
    }
    assert_eq!(host.live_textures(), 3);
    assert_eq!(host.attachments_for(CAMERA).count(), 1);
    assert_eq!(host.detach_count(), 1);
    assert_eq!(fluid.engine().calls_named("register_render_resources").count(), 2);
    fluid.teardown(&mut host);
}

#[test]
fn test_render_path_change_moves_sequence() {
    let (mut fluid, mut host) = setup();
    fluid.render(CAMERA, &mut host).unwrap();
    assert_eq!(
        host.attachments()[0].point,
        InsertionPoint::BeforeForwardAlpha
    );

    let mut deferred = view(800, 600);
    deferred.render_path = RenderPath::Deferred;
    host.add_camera(deferred);
    fluid.render(CAMERA, &mut host).unwrap();

    let context = fluid.camera_context(CAMERA).unwrap();
    assert_eq!(context.texture_allocations(), 1);
    assert_eq!(context.insertion_point(), Some(InsertionPoint::AfterLighting));
    assert_eq!(host.attachments().len(), 1);
    assert_eq!(host.attachments()[0].point, InsertionPoint::AfterLighting);

    // Detaching on teardown uses the point the sequence actually lives at.
    let report = fluid.teardown(&mut host);
    assert_eq!(report.failures, 0);
    assert!(host.attachments().is_empty());
}

// ============================================================================
// Command order and parameter blocks
// ============================================================================

#[test]
fn test_attached_sequence_order() {
    let (mut fluid, mut host) = setup();
    fluid.render(CAMERA, &mut host).unwrap();

    let stream = &host.attachments()[0].stream;
    let position = |pred: &dyn Fn(&Command) -> bool| stream.iter().position(pred).unwrap();

    let update = position(&|c| {
        matches!(c, Command::EngineEvent { token, .. } if token.code() == Some(EventCode::CameraUpdate))
    });
    let copy = position(&|c| matches!(c, Command::CopyTexture { .. }));
    let render = position(&|c| {
        matches!(c, Command::EngineEvent { token, .. } if token.code() == Some(EventCode::ParticleRender))
    });
    let draw = position(&|c| matches!(c, Command::DrawSurface { .. }));

    assert_eq!(update, 0);
    assert!(update < copy && copy < render && render < draw);
    fluid.teardown(&mut host);
}

#[test]
fn test_camera_block_updated_in_place() {
    let (mut fluid, mut host) = setup();
    fluid.render(CAMERA, &mut host).unwrap();
    let address = fluid.camera_context(CAMERA).unwrap().params_ptr();
    let blocks = fluid.live_parameter_blocks();

    let mut moved = view(800, 600);
    moved.position = Vec3::new(3.0, 1.0, -2.0);
    host.add_camera(moved);
    fluid.render(CAMERA, &mut host).unwrap();

    assert_eq!(fluid.camera_context(CAMERA).unwrap().params_ptr(), address);
    assert_eq!(fluid.live_parameter_blocks(), blocks);
    assert_eq!(fluid.engine().calls_named("set_camera_parameters").count(), 1);

    // Replaying the attached sequence resolves the camera block the engine holds.
    host.clear_event_log();
    host.render_camera(CAMERA);
    let (token, data) = host.event_log()[0];
    let params = fluid.engine().dispatch(token, data).unwrap().unwrap();
    assert_eq!(params.world_space_camera_pos, [3.0, 1.0, -2.0]);
    assert!((params.diameter - fluid.config().particle_radius()).abs() < 1e-6);
    fluid.teardown(&mut host);
}

#[test]
fn test_render_pushes_render_parameters() {
    let (mut fluid, mut host) = setup();
    fluid.config_mut().material.blur_radius = 9.0;
    fluid.render(CAMERA, &mut host).unwrap();
    fluid.render(CAMERA, &mut host).unwrap();

    assert_eq!(fluid.engine().calls_named("set_render_parameters").count(), 2);
    fluid.teardown(&mut host);
}

#[test]
fn test_render_into_appends_every_frame() {
    let (mut fluid, mut host) = setup();
    let mut stream = CommandStream::new("pipeline");

    fluid.render_into(CAMERA, &mut stream, &mut host).unwrap();
    let per_frame = stream.len();
    fluid.render_into(CAMERA, &mut stream, &mut host).unwrap();

    assert_eq!(stream.len(), per_frame * 2);
    assert_eq!(host.attach_count(), 0);
    assert_eq!(fluid.camera_context(CAMERA).unwrap().texture_allocations(), 1);

    let handle = fluid.handle().unwrap();
    let codes: Vec<_> = stream.events().filter_map(|t| t.code()).collect();
    assert_eq!(
        codes,
        vec![
            EventCode::CameraUpdate,
            EventCode::ParticleRender,
            EventCode::CameraUpdate,
            EventCode::ParticleRender,
        ]
    );
    assert!(stream.events().all(|t| t.instance() == handle));
    fluid.teardown(&mut host);
}

#[test]
fn test_mixed_delivery_rejected() {
    let (mut fluid, mut host) = setup();
    fluid.render(CAMERA, &mut host).unwrap();

    let mut stream = CommandStream::new("pipeline");
    let err = fluid.render_into(CAMERA, &mut stream, &mut host).unwrap_err();
    assert!(matches!(
        err,
        FluidError::Configuration(ConfigurationError::DeliveryConflict { camera: 7, .. })
    ));
    assert!(stream.is_empty());
    fluid.teardown(&mut host);
}

// ============================================================================
// Gating and release
// ============================================================================

#[test]
fn test_unknown_camera() {
    let (mut fluid, mut host) = setup();
    let err = fluid.render(CameraId::new(99), &mut host).unwrap_err();
    assert!(matches!(
        err,
        FluidError::InvalidHandle(InvalidHandleError::UnknownCamera(_))
    ));
    fluid.teardown(&mut host);
}

#[test]
fn test_render_gated_on_state() {
    let mut host = HeadlessHost::new();
    host.add_camera(view(800, 600));
    let mut fluid = FluidInstance::new(LoopbackEngine::new(), FluidConfig::default());

    // Uninitialized.
    fluid.render(CAMERA, &mut host).unwrap();
    assert_eq!(fluid.camera_count(), 0);

    // Errored.
    host.fail_allocation("drawable_grid");
    assert!(fluid.init(&mut host).is_err());
    fluid.render(CAMERA, &mut host).unwrap();
    assert_eq!(fluid.camera_count(), 0);
    assert_eq!(host.live_textures(), 0);
    assert!(fluid.ensure_render_context(CAMERA, &mut host).is_err());
}

#[test]
fn test_remove_camera_releases_context() {
    let (mut fluid, mut host) = setup();
    let blocks = fluid.live_parameter_blocks();
    fluid.render(CAMERA, &mut host).unwrap();
    assert_eq!(fluid.live_parameter_blocks(), blocks + 1);

    assert!(fluid.remove_camera(CAMERA, &mut host));
    assert!(!fluid.remove_camera(CAMERA, &mut host));

    assert_eq!(fluid.camera_count(), 0);
    assert_eq!(host.live_textures(), 0);
    assert!(host.attachments().is_empty());
    assert_eq!(fluid.live_parameter_blocks(), blocks);

    // Rendering again starts a fresh context.
    fluid.render(CAMERA, &mut host).unwrap();
    assert_eq!(fluid.camera_context(CAMERA).unwrap().texture_allocations(), 1);
    fluid.teardown(&mut host);
}

#[test]
fn test_teardown_releases_every_camera() {
    let (mut fluid, mut host) = setup();
    let second = CameraId::new(8);
    host.add_camera(CameraView { id: second, ..view(320, 240) });
    fluid.render(CAMERA, &mut host).unwrap();
    fluid.render(second, &mut host).unwrap();
    assert_eq!(host.live_textures(), 6);

    let report = fluid.teardown(&mut host);

    assert_eq!(report.cameras_released, 2);
    assert_eq!(report.failures, 0);
    assert_eq!(host.live_textures(), 0);
    assert!(host.attachments().is_empty());
    assert_eq!(fluid.camera_count(), 0);
    assert_eq!(fluid.live_parameter_blocks(), 0);
}

// ============================================================================
// Engine render targets across cameras
// ============================================================================

fn pair(fluid: &FluidInstance<LoopbackEngine>, camera: CameraId) -> (NativeHandle, NativeHandle) {
    let targets = fluid.camera_context(camera).unwrap().targets().unwrap();
    (targets.color0, targets.color1)
}

#[test]
fn test_each_camera_renders_into_its_own_targets() {
    let (mut fluid, mut host) = setup();
    let second = CameraId::new(8);
    host.add_camera(CameraView { id: second, ..view(640, 480) });

    for _ in 0..2 {
        fluid.render(CAMERA, &mut host).unwrap();
        assert_eq!(fluid.registered_render_targets(), Some(pair(&fluid, CAMERA)));
        fluid.render(second, &mut host).unwrap();
        assert_eq!(fluid.registered_render_targets(), Some(pair(&fluid, second)));
    }
    assert_ne!(pair(&fluid, CAMERA), pair(&fluid, second));
    assert_eq!(fluid.camera_context(CAMERA).unwrap().texture_allocations(), 1);
    assert_eq!(fluid.camera_context(second).unwrap().texture_allocations(), 1);
    fluid.teardown(&mut host);
}

#[test]
fn test_removing_registered_camera_never_leaves_stale_targets() {
    let (mut fluid, mut host) = setup();
    let second = CameraId::new(8);
    host.add_camera(CameraView { id: second, ..view(640, 480) });
    fluid.render(CAMERA, &mut host).unwrap();
    fluid.render(second, &mut host).unwrap();
    let removed = pair(&fluid, second);

    assert!(fluid.remove_camera(second, &mut host));

    assert!(host.released().contains(&removed.0));
    assert!(host.released().contains(&removed.1));
    assert_eq!(fluid.registered_render_targets(), None);
    assert_eq!(fluid.engine().calls_named("release_render_resources").count(), 1);

    // The surviving camera points the engine back at its own live textures.
    fluid.render(CAMERA, &mut host).unwrap();
    let (color0, color1) = pair(&fluid, CAMERA);
    assert_eq!(fluid.registered_render_targets(), Some((color0, color1)));
    assert!(host.texture(color0).is_some());
    assert!(host.texture(color1).is_some());
    fluid.teardown(&mut host);
}

#[test]
fn test_removing_unregistered_camera_keeps_registration() {
    let (mut fluid, mut host) = setup();
    let second = CameraId::new(8);
    host.add_camera(CameraView { id: second, ..view(640, 480) });
    fluid.render(second, &mut host).unwrap();
    fluid.render(CAMERA, &mut host).unwrap();

    assert!(fluid.remove_camera(second, &mut host));

    assert_eq!(fluid.registered_render_targets(), Some(pair(&fluid, CAMERA)));
    assert_eq!(fluid.engine().calls_named("release_render_resources").count(), 0);
    fluid.teardown(&mut host);
}

// ============================================================================
// Camera blocks after release
// ============================================================================

#[test]
fn test_recorded_camera_update_refused_after_remove() {
    let (mut fluid, mut host) = setup();
    let mut stream = CommandStream::new("pipeline");
    fluid.render_into(CAMERA, &mut stream, &mut host).unwrap();

    let (token, data) = stream
        .iter()
        .find_map(|c| match c {
            Command::EngineEvent { token, data } if token.code() == Some(EventCode::CameraUpdate) => {
                Some((*token, *data))
            }
            _ => None,
        })
        .unwrap();
    assert!(fluid.engine().dispatch(token, data).unwrap().is_some());

    assert!(fluid.remove_camera(CAMERA, &mut host));

    assert_eq!(fluid.engine().calls_named("release_camera_parameters").count(), 1);
    assert!(fluid.engine().dispatch(token, data).is_err());
    fluid.teardown(&mut host);
}

// ============================================================================
// Event tokens come from the engine
// ============================================================================

const TAG: i32 = 1 << 30;

/// Loopback engine whose tokens carry an extra tag bit.
struct TaggedEngine(LoopbackEngine);

impl ComputeEngine for TaggedEngine {
    fn create_instance(&mut self) -> Result<InstanceHandle, EngineCallError> {
        self.0.create_instance()
    }

    fn register_buffers(
        &mut self,
        instance: InstanceHandle,
        kind: BufferSetKind,
        params: ParamPtr,
        buffers: &[NativeHandle],
    ) -> Result<(), EngineCallError> {
        self.0.register_buffers(instance, kind, params, buffers)
    }

    fn register_render_resources(
        &mut self,
        instance: InstanceHandle,
        color0: NativeHandle,
        color1: NativeHandle,
    ) -> Result<(), EngineCallError> {
        self.0.register_render_resources(instance, color0, color1)
    }

    fn release_render_resources(&mut self, instance: InstanceHandle) -> Result<(), EngineCallError> {
        self.0.release_render_resources(instance)
    }

    fn set_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        self.0.set_parameters(instance, params)
    }

    fn set_camera_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        self.0.set_camera_parameters(instance, params)
    }

    fn release_camera_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        self.0.release_camera_parameters(instance, params)
    }

    fn set_render_parameters(&mut self, instance: InstanceHandle, params: ParamPtr) -> Result<(), EngineCallError> {
        self.0.set_render_parameters(instance, params)
    }

    fn set_colliders_count(&mut self, instance: InstanceHandle, count: u32) -> Result<(), EngineCallError> {
        self.0.set_colliders_count(instance, count)
    }

    fn schedule_event(&self, code: EventCode, instance: InstanceHandle) -> EventToken {
        EventToken::from_raw(EventToken::encode(code, instance).raw() | TAG)
    }

    fn release_instance(&mut self, instance: InstanceHandle) -> Result<(), EngineCallError> {
        self.0.release_instance(instance)
    }
}

#[test]
fn test_streams_carry_engine_scheduled_tokens() {
    let mut host = HeadlessHost::new();
    host.add_camera(view(800, 600));
    let config = FluidConfig {
        max_particle_number: 1000,
        cell_size: 0.5,
        ..Default::default()
    };
    let mut fluid = FluidInstance::new(TaggedEngine(LoopbackEngine::new()), config);
    fluid.init(&mut host).unwrap();
    assert!(fluid.solver_stream().events().all(|t| t.raw() & TAG != 0));

    fluid.advance(0.016, &mut host).unwrap();
    assert!(fluid.solver_stream().events().count() > 0);
    assert!(fluid.solver_stream().events().all(|t| t.raw() & TAG != 0));

    let mut stream = CommandStream::new("pipeline");
    fluid.render_into(CAMERA, &mut stream, &mut host).unwrap();
    assert_eq!(stream.events().count(), 2);
    assert!(stream.events().all(|t| t.raw() & TAG != 0));

    let second = CameraId::new(8);
    host.add_camera(CameraView { id: second, ..view(320, 240) });
    fluid.render(second, &mut host).unwrap();
    let attached = &host.attachments_for(second).next().unwrap().stream;
    assert!(attached.events().all(|t| t.raw() & TAG != 0));
    fluid.teardown(&mut host);
}
