//! Collider aggregation.
//!
//! Every step, the enabled colliders union their signed distance fields into
//! the shared grid buffers. The pipeline only sequences the pass: it tells the
//! engine how many ids to expect, then hands each enabled collider a dense,
//! zero-based id in list order. Evaluating the field is the collider's job.
//!
//! # Example
//!
//! ```ignore
//! let mut colliders = ColliderSet::new();
//! colliders.try_push(Box::new(AnalyticCollider::new(SdfShape::Sphere {
//!     center: Vec3::new(0.0, 2.0, 0.0),
//!     radius: 1.0,
//! })))?;
//!
//! let count = pipeline.aggregate(&mut engine, instance, colliders.as_slice(), &mut stream, grid, nodes)?;
//! ```

use glam::Vec3;

use crate::command::{Command, CommandStream};
use crate::engine::{ComputeEngine, InstanceHandle, NativeHandle};
use crate::error::EngineCallError;

/// Colliders the collaborator-facing list accepts.
pub const MAX_COLLIDERS: usize = 5;

/// The grid buffers every contribution reads and writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridTargets {
    /// World-space node positions.
    pub positions: NativeHandle,
    /// Unioned signed distance per node.
    pub sdf: NativeHandle,
    /// Id of the nearest collider per node.
    pub ids: NativeHandle,
}

/// Arguments of one collider's contribution.
#[derive(Debug)]
pub struct SdfContribution<'a> {
    pub instance: InstanceHandle,
    pub stream: &'a mut CommandStream,
    pub grid: GridTargets,
    /// Dense id assigned for this pass.
    pub collider_id: u32,
    pub node_count: u32,
}

/// A collider that can union its field into the grid.
pub trait SdfCollider {
    /// Queried once per aggregation pass.
    fn is_enabled(&self) -> bool;

    /// Append the commands that write this collider's field and id.
    fn contribute(&self, contribution: SdfContribution<'_>) -> Result<(), EngineCallError>;
}

/// Sequences one aggregation pass per simulation step.
#[derive(Debug, Default)]
pub struct ColliderAggregationPipeline {
    /// Indices of this pass's participants. Reused across passes.
    participants: Vec<usize>,
    passes: u64,
}

impl ColliderAggregationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one pass over `colliders`, appending to `stream`.
    ///
    /// Returns the number of participating colliders.
    pub fn aggregate<E: ComputeEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        instance: InstanceHandle,
        colliders: &[Box<dyn SdfCollider>],
        stream: &mut CommandStream,
        grid: GridTargets,
        node_count: u32,
    ) -> Result<u32, EngineCallError> {
        self.participants.clear();
        self.participants.extend(
            colliders
                .iter()
                .enumerate()
                .filter(|(_, collider)| collider.is_enabled())
                .map(|(index, _)| index),
        );

        let count = self.participants.len() as u32;
        // Id memory must be valid before the first contribution runs.
        engine.set_colliders_count(instance, count)?;

        for (id, &index) in self.participants.iter().enumerate() {
            colliders[index].contribute(SdfContribution {
                instance,
                stream: &mut *stream,
                grid,
                collider_id: id as u32,
                node_count,
            })?;
        }

        self.passes += 1;
        log::trace!("collider pass {}: {} participants", self.passes, count);
        Ok(count)
    }

    /// Completed passes.
    pub fn passes(&self) -> u64 {
        self.passes
    }
}

/// Ordered collider list with the size cap the editing surface enforces.
#[derive(Default)]
pub struct ColliderSet {
    colliders: Vec<Box<dyn SdfCollider>>,
}

impl std::fmt::Debug for ColliderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColliderSet").field("len", &self.colliders.len()).finish()
    }
}

impl ColliderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a collider, or hand it back if the set is full.
    pub fn try_push(&mut self, collider: Box<dyn SdfCollider>) -> Result<usize, Box<dyn SdfCollider>> {
        if self.is_full() {
            return Err(collider);
        }
        self.colliders.push(collider);
        Ok(self.colliders.len() - 1)
    }

    pub fn remove(&mut self, index: usize) -> Option<Box<dyn SdfCollider>> {
        (index < self.colliders.len()).then(|| self.colliders.remove(index))
    }

    pub fn clear(&mut self) {
        self.colliders.clear();
    }

    pub fn as_slice(&self) -> &[Box<dyn SdfCollider>] {
        &self.colliders
    }

    pub fn len(&self) -> usize {
        self.colliders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colliders.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.colliders.len() >= MAX_COLLIDERS
    }
}

/// Closed-form shapes an [`AnalyticCollider`] can describe.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SdfShape {
    Sphere { center: Vec3, radius: f32 },
    Box { center: Vec3, half_extents: Vec3 },
    /// Half-space below `dot(normal, p) = offset`.
    Plane { normal: Vec3, offset: f32 },
}

impl SdfShape {
    /// Signed distance from `point` to the shape surface.
    pub fn distance(&self, point: Vec3) -> f32 {
        match *self {
            SdfShape::Sphere { center, radius } => (point - center).length() - radius,
            SdfShape::Box { center, half_extents } => {
                let q = (point - center).abs() - half_extents;
                q.max(Vec3::ZERO).length() + q.max_element().min(0.0)
            }
            SdfShape::Plane { normal, offset } => normal.normalize_or_zero().dot(point) - offset,
        }
    }
}

/// A collider whose field the engine evaluates from a closed-form shape.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalyticCollider {
    shape: SdfShape,
    enabled: bool,
}

impl AnalyticCollider {
    pub fn new(shape: SdfShape) -> Self {
        Self { shape, enabled: true }
    }

    pub fn shape(&self) -> SdfShape {
        self.shape
    }

    pub fn set_shape(&mut self, shape: SdfShape) {
        self.shape = shape;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

impl SdfCollider for AnalyticCollider {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn contribute(&self, contribution: SdfContribution<'_>) -> Result<(), EngineCallError> {
        contribution.stream.push(Command::ColliderSdf {
            collider_id: contribution.collider_id,
            node_count: contribution.node_count,
            grid: contribution.grid,
            shape: self.shape,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::{EngineCall, LoopbackEngine};

    fn grid() -> GridTargets {
        GridTargets {
            positions: NativeHandle::from_raw(1),
            sdf: NativeHandle::from_raw(2),
            ids: NativeHandle::from_raw(3),
        }
    }

    fn sphere(enabled: bool) -> Box<dyn SdfCollider> {
        let mut collider = AnalyticCollider::new(SdfShape::Sphere {
            center: Vec3::ZERO,
            radius: 1.0,
        });
        collider.set_enabled(enabled);
        Box::new(collider)
    }

    fn ids(stream: &CommandStream) -> Vec<u32> {
        stream
            .iter()
            .filter_map(|c| match c {
                Command::ColliderSdf { collider_id, .. } => Some(*collider_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ids_dense_over_enabled() {
        let mut engine = LoopbackEngine::new();
        let instance = engine.create_instance().unwrap();
        let colliders = vec![sphere(false), sphere(true), sphere(false), sphere(true), sphere(true)];
        let mut stream = CommandStream::new("solver");
        let mut pipeline = ColliderAggregationPipeline::new();

        let count = pipeline
            .aggregate(&mut engine, instance, &colliders, &mut stream, grid(), 64)
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(ids(&stream), vec![0, 1, 2]);
    }

    #[test]
    fn test_count_pushed_before_contributions() {
        let mut engine = LoopbackEngine::new();
        let instance = engine.create_instance().unwrap();
        let mut pipeline = ColliderAggregationPipeline::new();
        let mut stream = CommandStream::new("solver");

        pipeline
            .aggregate(&mut engine, instance, &[sphere(true)], &mut stream, grid(), 8)
            .unwrap();

        assert_eq!(
            engine.calls().last(),
            Some(&EngineCall::SetCollidersCount { instance, count: 1 })
        );
    }

    #[test]
    fn test_no_limit_in_pipeline() {
        let mut engine = LoopbackEngine::new();
        let instance = engine.create_instance().unwrap();
        let colliders: Vec<_> = (0..MAX_COLLIDERS * 3).map(|_| sphere(true)).collect();
        let mut stream = CommandStream::new("solver");
        let count = ColliderAggregationPipeline::new()
            .aggregate(&mut engine, instance, &colliders, &mut stream, grid(), 8)
            .unwrap();
        assert_eq!(count as usize, MAX_COLLIDERS * 3);
    }

    #[test]
    fn test_ids_restart_every_pass() {
        let mut engine = LoopbackEngine::new();
        let instance = engine.create_instance().unwrap();
        let colliders = vec![sphere(true), sphere(true)];
        let mut pipeline = ColliderAggregationPipeline::new();

        for _ in 0..3 {
            let mut stream = CommandStream::new("solver");
            pipeline
                .aggregate(&mut engine, instance, &colliders, &mut stream, grid(), 8)
                .unwrap();
            assert_eq!(ids(&stream), vec![0, 1]);
        }
        assert_eq!(pipeline.passes(), 3);
    }

    #[test]
    fn test_count_failure_skips_contributions() {
        let mut engine = LoopbackEngine::new();
        let instance = engine.create_instance().unwrap();
        engine.fail_on("set_colliders_count");
        let mut stream = CommandStream::new("solver");
        let result = ColliderAggregationPipeline::new().aggregate(
            &mut engine,
            instance,
            &[sphere(true)],
            &mut stream,
            grid(),
            8,
        );
        assert!(result.is_err());
        assert!(stream.is_empty());
    }

    #[test]
    fn test_collider_set_cap() {
        let mut set = ColliderSet::new();
        for i in 0..MAX_COLLIDERS {
            assert_eq!(set.try_push(sphere(true)).ok(), Some(i));
        }
        assert!(set.is_full());
        assert!(set.try_push(sphere(true)).is_err());
        assert!(set.remove(0).is_some());
        assert!(set.remove(MAX_COLLIDERS).is_none());
        assert_eq!(set.len(), MAX_COLLIDERS - 1);
    }

    #[test]
    fn test_shape_distances() {
        let sphere = SdfShape::Sphere {
            center: Vec3::ZERO,
            radius: 1.0,
        };
        assert!((sphere.distance(Vec3::new(2.0, 0.0, 0.0)) - 1.0).abs() < 1e-6);

        let cube = SdfShape::Box {
            center: Vec3::ZERO,
            half_extents: Vec3::ONE,
        };
        assert!((cube.distance(Vec3::ZERO) + 1.0).abs() < 1e-6);
        assert!((cube.distance(Vec3::new(3.0, 0.0, 0.0)) - 2.0).abs() < 1e-6);

        let floor = SdfShape::Plane {
            normal: Vec3::Y,
            offset: 0.0,
        };
        assert!((floor.distance(Vec3::new(5.0, -0.5, 1.0)) + 0.5).abs() < 1e-6);
    }
}
