//! Fluid instance registry.
//!
//! Hosts usually run several fluid volumes against one engine build. The
//! registry owns them, drives them together and keeps one instance's failure
//! from stopping the others.

use std::collections::BTreeMap;

use crate::command::CommandStream;
use crate::engine::ComputeEngine;
use crate::error::FluidError;
use crate::host::{CameraId, RenderHost};
use crate::instance::{FluidInstance, TeardownReport};

/// Registry-assigned identity of a fluid instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FluidId(u64);

impl FluidId {
    /// The raw id.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FluidId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fluid#{}", self.0)
    }
}

/// Owns fluid instances and drives them in insertion order.
pub struct FluidRegistry<E: ComputeEngine> {
    instances: BTreeMap<FluidId, FluidInstance<E>>,
    next_id: u64,
}

impl<E: ComputeEngine> Default for FluidRegistry<E> {
    fn default() -> Self {
        Self {
            instances: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl<E: ComputeEngine> FluidRegistry<E> {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `instance`. Ids are never reused.
    pub fn insert(&mut self, instance: FluidInstance<E>) -> FluidId {
        let id = FluidId(self.next_id);
        self.next_id += 1;
        self.instances.insert(id, instance);
        id
    }

    /// Hand an instance back to the caller, who becomes responsible for its teardown.
    pub fn remove(&mut self, id: FluidId) -> Option<FluidInstance<E>> {
        self.instances.remove(&id)
    }

    /// The instance registered as `id`.
    pub fn get(&self, id: FluidId) -> Option<&FluidInstance<E>> {
        self.instances.get(&id)
    }

    /// Mutable access to the instance registered as `id`.
    pub fn get_mut(&mut self, id: FluidId) -> Option<&mut FluidInstance<E>> {
        self.instances.get_mut(&id)
    }

    /// Number of registered instances, in any state.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instances in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (FluidId, &FluidInstance<E>)> {
        self.instances.iter().map(|(id, instance)| (*id, instance))
    }

    /// Initialize every instance. Returns the ones that failed.
    pub fn init_all(&mut self, host: &mut dyn RenderHost) -> Vec<(FluidId, FluidError)> {
        self.each(|instance| instance.init(host))
    }

    /// Advance every active instance by `dt`. Returns the ones that failed.
    pub fn advance_all(&mut self, dt: f32, host: &mut dyn RenderHost) -> Vec<(FluidId, FluidError)> {
        self.each(|instance| instance.advance(dt, host).map(|_| ()))
    }

    /// Render every instance for `camera` into `stream`.
    pub fn render_all(
        &mut self,
        camera: CameraId,
        stream: &mut CommandStream,
        host: &mut dyn RenderHost,
    ) -> Vec<(FluidId, FluidError)> {
        self.each(|instance| instance.render_into(camera, stream, host))
    }

    /// Tear down every instance and sum the reports. Instances stay registered
    /// in the `Disposed` state.
    pub fn teardown_all(&mut self, host: &mut dyn RenderHost) -> TeardownReport {
        let mut total = TeardownReport::default();
        for instance in self.instances.values_mut() {
            total += instance.teardown(host);
        }
        total
    }

    fn each<F>(&mut self, mut f: F) -> Vec<(FluidId, FluidError)>
    where
        F: FnMut(&mut FluidInstance<E>) -> Result<(), FluidError>,
    {
        let mut failures = Vec::new();
        for (id, instance) in self.instances.iter_mut() {
            if let Err(err) = f(instance) {
                log::warn!("{}: {}", id, err);
                failures.push((*id, err));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FluidConfig;
    use crate::engine::loopback::LoopbackEngine;
    use crate::headless::HeadlessHost;

    fn fluid() -> FluidInstance<LoopbackEngine> {
        FluidInstance::new(
            LoopbackEngine::new(),
            FluidConfig {
                max_particle_number: 512,
                cell_size: 1.0,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_ids_not_reused() {
        let mut registry = FluidRegistry::new();
        let a = registry.insert(fluid());
        assert!(registry.remove(a).is_some());
        let b = registry.insert(fluid());
        assert_ne!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_one_failure_does_not_stop_others() {
        let mut host = HeadlessHost::new();
        let mut registry = FluidRegistry::new();
        let good = registry.insert(fluid());
        let mut broken = fluid();
        broken.config_mut().cell_size = 0.0;
        let bad = registry.insert(broken);

        let failures = registry.init_all(&mut host);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, bad);
        assert!(registry.get(good).unwrap().state().is_active());

        let failures = registry.advance_all(0.016, &mut host);
        assert!(failures.is_empty());
        assert_eq!(registry.get(good).unwrap().step_count(), 1);

        let report = registry.teardown_all(&mut host);
        assert!(report.engine_released);
        assert_eq!(host.live_buffers(), 0);
    }
}
