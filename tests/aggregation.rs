//! Integration tests for collider aggregation inside simulation steps.

use liquid_bridge::collider::{GridTargets, SdfContribution};
use liquid_bridge::engine::loopback::EngineCall;
use liquid_bridge::prelude::*;
use liquid_bridge::{Command, ColliderAggregationPipeline, EngineCallError, EventCode, MAX_COLLIDERS};
use rand::Rng;

fn sphere(radius: f32) -> AnalyticCollider {
    AnalyticCollider::new(SdfShape::Sphere {
        center: Vec3::new(0.0, 1.0, 0.0),
        radius,
    })
}

fn disabled(radius: f32) -> AnalyticCollider {
    let mut collider = sphere(radius);
    collider.set_enabled(false);
    collider
}

fn collider_ids(stream: &CommandStream) -> Vec<(u32, f32)> {
    stream
        .iter()
        .filter_map(|c| match c {
            Command::ColliderSdf {
                collider_id,
                shape: SdfShape::Sphere { radius, .. },
                ..
            } => Some((*collider_id, *radius)),
            _ => None,
        })
        .collect()
}

fn fluid_with(colliders: Vec<AnalyticCollider>) -> (FluidInstance<LoopbackEngine>, HeadlessHost) {
    let mut host = HeadlessHost::new();
    let config = FluidConfig {
        max_particle_number: 512,
        cell_size: 0.5,
        ..Default::default()
    };
    let mut fluid = FluidInstance::new(LoopbackEngine::new(), config);
    for collider in colliders {
        assert!(fluid.colliders_mut().try_push(Box::new(collider)).is_ok());
    }
    fluid.init(&mut host).unwrap();
    (fluid, host)
}

#[test]
fn test_ids_follow_enabled_order() {
    let (mut fluid, mut host) = fluid_with(vec![
        disabled(1.0),
        sphere(2.0),
        disabled(3.0),
        sphere(4.0),
        sphere(5.0),
    ]);
    fluid.advance(0.016, &mut host).unwrap();

    let ids = collider_ids(fluid.solver_stream());
    assert_eq!(ids, vec![(0, 2.0), (1, 4.0), (2, 5.0)]);
    fluid.teardown(&mut host);
}

#[test]
fn test_contributions_precede_step_event() {
    let (mut fluid, mut host) = fluid_with(vec![sphere(1.0), sphere(2.0)]);
    fluid.advance(0.016, &mut host).unwrap();

    let stream = fluid.solver_stream();
    let last_collider = stream
        .iter()
        .rposition(|c| matches!(c, Command::ColliderSdf { .. }))
        .unwrap();
    let step = stream
        .iter()
        .position(|c| {
            matches!(c, Command::EngineEvent { token, .. } if token.code() == Some(EventCode::SimulationStep))
        })
        .unwrap();
    assert!(last_collider < step);
    assert_eq!(stream.events().count(), 1);
    fluid.teardown(&mut host);
}

#[test]
fn test_count_pushed_before_parameters() {
    let (mut fluid, mut host) = fluid_with(vec![sphere(1.0), disabled(2.0), sphere(3.0)]);
    fluid.engine_mut().clear_calls();
    fluid.advance(0.016, &mut host).unwrap();

    let handle = fluid.handle().unwrap();
    let calls = fluid.engine().calls();
    assert_eq!(calls[0], EngineCall::SetCollidersCount { instance: handle, count: 2 });
    assert!(matches!(calls[1], EngineCall::SetParameters { .. }));
    fluid.teardown(&mut host);
}

#[test]
fn test_ids_restart_each_step() {
    let config_iterations = 3;
    let (mut fluid, mut host) = fluid_with(vec![sphere(1.0), sphere(2.0)]);
    fluid.config_mut().iterations_per_frame = config_iterations;
    fluid.engine_mut().clear_calls();

    fluid.advance(0.016, &mut host).unwrap();

    // Only the last step's stream is kept; every pass pushed the same count.
    assert_eq!(collider_ids(fluid.solver_stream()), vec![(0, 1.0), (1, 2.0)]);
    let counts: Vec<_> = fluid
        .engine()
        .calls_named("set_colliders_count")
        .map(|c| match c {
            EngineCall::SetCollidersCount { count, .. } => *count,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(counts, vec![2; config_iterations as usize]);
    fluid.teardown(&mut host);
}

#[test]
fn test_random_enabled_subsets() {
    let mut rng = rand::thread_rng();
    let mut engine = LoopbackEngine::new();
    let instance = engine.create_instance().unwrap();
    let grid = GridTargets {
        positions: liquid_bridge::NativeHandle::from_raw(1),
        sdf: liquid_bridge::NativeHandle::from_raw(2),
        ids: liquid_bridge::NativeHandle::from_raw(3),
    };
    let mut pipeline = ColliderAggregationPipeline::new();

    for _ in 0..100 {
        let total = rng.gen_range(0..20);
        let mut expected = Vec::new();
        let colliders: Vec<Box<dyn SdfCollider>> = (0..total)
            .map(|i| {
                let radius = i as f32;
                let mut collider = sphere(radius);
                let enabled = rng.gen_bool(0.5);
                collider.set_enabled(enabled);
                if enabled {
                    expected.push(radius);
                }
                Box::new(collider) as Box<dyn SdfCollider>
            })
            .collect();

        let mut stream = CommandStream::new("solver");
        let count = pipeline
            .aggregate(&mut engine, instance, &colliders, &mut stream, grid, 64)
            .unwrap();

        let seen = collider_ids(&stream);
        assert_eq!(count as usize, expected.len());
        assert_eq!(seen.iter().map(|(id, _)| *id).collect::<Vec<_>>(), (0..count).collect::<Vec<_>>());
        assert_eq!(seen.iter().map(|(_, r)| *r).collect::<Vec<_>>(), expected);
    }
}

#[test]
fn test_collider_set_enforces_cap() {
    let mut fluid = FluidInstance::new(LoopbackEngine::new(), FluidConfig::default());
    for _ in 0..MAX_COLLIDERS {
        assert!(fluid.colliders_mut().try_push(Box::new(sphere(1.0))).is_ok());
    }
    assert!(fluid.colliders_mut().try_push(Box::new(sphere(1.0))).is_err());
    assert_eq!(fluid.colliders().len(), MAX_COLLIDERS);
}

struct FailingCollider;

impl SdfCollider for FailingCollider {
    fn is_enabled(&self) -> bool {
        true
    }

    fn contribute(&self, _contribution: SdfContribution<'_>) -> Result<(), EngineCallError> {
        Err(EngineCallError::new("collider_sdf", "voxel data missing"))
    }
}

#[test]
fn test_contribution_failure_halts_instance() {
    let (mut fluid, mut host) = fluid_with(vec![sphere(1.0)]);
    assert!(fluid.colliders_mut().try_push(Box::new(FailingCollider)).is_ok());

    let err = fluid.advance(0.016, &mut host).unwrap_err();
    assert!(matches!(err, FluidError::Engine(ref e) if e.call == "collider_sdf"));
    assert!(matches!(fluid.state(), InstanceState::Errored(_)));
    assert_eq!(fluid.step_count(), 0);

    let report = fluid.teardown(&mut host);
    assert!(report.engine_released);
}

#[test]
fn test_count_failure_halts_instance() {
    let (mut fluid, mut host) = fluid_with(vec![sphere(1.0)]);
    fluid.engine_mut().fail_on("set_colliders_count");

    assert!(fluid.advance(0.016, &mut host).is_err());
    assert!(collider_ids(fluid.solver_stream()).is_empty());
    assert!(matches!(fluid.state(), InstanceState::Errored(_)));
    fluid.engine_mut().clear_failures();
    fluid.teardown(&mut host);
}
