//! Named groups of fixed-capacity GPU buffers.
//!
//! A [`BufferSet`] owns every buffer the engine reads for one concern
//! (particles or grid). Capacities are fixed at allocation; a capacity change
//! means releasing the set and allocating a new one, never resizing in place.
//!
//! Sizing rules:
//! - particle buffers hold `ceil(n / 256) * 256` elements
//! - grid buffers hold exactly `nx * ny * nz` elements

use glam::{UVec3, Vec3};

use crate::engine::{NativeHandle, WORK_GROUP_SIZE};
use crate::error::{AllocationError, EngineCallError, FluidError, InvalidHandleError};
use crate::host::{BufferDesc, RenderHost};

/// Round a requested particle count up to the engine work-group size.
pub fn particle_capacity(requested: u32) -> u32 {
    requested.div_ceil(WORK_GROUP_SIZE).saturating_mul(WORK_GROUP_SIZE)
}

/// Cells per axis covering `container` with cubes of edge `cell`.
pub fn grid_dimensions(container: Vec3, cell: f32) -> UVec3 {
    (container / cell).ceil().max(Vec3::ZERO).as_uvec3()
}

/// Exact node count of a grid.
pub fn grid_node_count(dims: UVec3) -> Result<u32, AllocationError> {
    if dims.min_element() == 0 {
        return Err(AllocationError::EmptyGrid {
            nx: dims.x,
            ny: dims.y,
            nz: dims.z,
        });
    }
    dims.x
        .checked_mul(dims.y)
        .and_then(|xy| xy.checked_mul(dims.z))
        .ok_or(AllocationError::GridTooLarge {
            nx: dims.x,
            ny: dims.y,
            nz: dims.z,
        })
}

/// What a buffer's element count scales with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extent {
    /// One element per particle slot.
    Particles,
    /// Four elements per particle slot (affine matrix rows).
    ParticlesX4,
    /// One element per grid node.
    GridNodes,
}

impl Extent {
    fn count(self, capacity: u32, nodes: u32) -> Option<u32> {
        match self {
            Extent::Particles => Some(capacity),
            Extent::ParticlesX4 => capacity.checked_mul(4),
            Extent::GridNodes => Some(nodes),
        }
    }
}

/// One row of a buffer set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    pub name: &'static str,
    pub extent: Extent,
    /// Bytes per element.
    pub stride: u32,
}

const fn row(name: &'static str, extent: Extent, stride: u32) -> BufferLayout {
    BufferLayout { name, extent, stride }
}

/// Particle set, in engine registration order.
pub const PARTICLE_LAYOUT: &[BufferLayout] = &[
    row("position_mass", Extent::Particles, 16),
    row("affine0", Extent::ParticlesX4, 8),
    row("affine1", Extent::ParticlesX4, 8),
    row("drawable_grid", Extent::GridNodes, 4),
    row("position_radius", Extent::Particles, 16),
];

/// Grid and solver scratch set, in engine registration order.
pub const GRID_LAYOUT: &[BufferLayout] = &[
    row("position_mass_copy", Extent::Particles, 16),
    row("particle_density", Extent::Particles, 4),
    row("grid_data", Extent::GridNodes, 8),
    row("index_grid", Extent::GridNodes, 8),
    row("grid_blur0", Extent::GridNodes, 8),
    row("grid_blur1", Extent::GridNodes, 8),
    row("grid_normal", Extent::GridNodes, 16),
    row("grid_sdf", Extent::GridNodes, 4),
    row("grid_node_positions", Extent::GridNodes, 16),
    row("node_particle_pairs", Extent::Particles, 8),
    row("grid_id", Extent::GridNodes, 4),
];

/// A buffer owned by a set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferEntry {
    pub count: u32,
    pub stride: u32,
    pub handle: NativeHandle,
}

/// A named, ordered group of buffers registered with the engine once.
#[derive(Debug)]
pub struct BufferSet {
    label: String,
    entries: Vec<(String, BufferEntry)>,
    registered: bool,
}

impl BufferSet {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: Vec::new(),
            registered: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Allocate one buffer through the host and take ownership of it.
    pub fn allocate(
        &mut self,
        host: &mut dyn RenderHost,
        name: &str,
        count: u32,
        stride: u32,
    ) -> Result<NativeHandle, AllocationError> {
        if count == 0 {
            return Err(AllocationError::EmptyBuffer { name: name.into() });
        }
        if stride == 0 {
            return Err(AllocationError::ZeroStride { name: name.into() });
        }
        if self.get(name).is_some() {
            return Err(AllocationError::DuplicateName {
                set: self.label.clone(),
                name: name.into(),
            });
        }

        let label = format!("{}.{}", self.label, name);
        let handle = host.create_buffer(&BufferDesc {
            label: &label,
            count,
            stride,
        })?;
        log::debug!("allocated buffer {label}: {count} x {stride}B");

        self.entries.push((name.to_owned(), BufferEntry { count, stride, handle }));
        Ok(handle)
    }

    /// Allocate every row of `layout`. Stops at the first failure.
    pub fn allocate_layout(
        &mut self,
        host: &mut dyn RenderHost,
        layout: &[BufferLayout],
        capacity: u32,
        nodes: u32,
    ) -> Result<(), AllocationError> {
        for row in layout {
            let count = row
                .extent
                .count(capacity, nodes)
                .ok_or_else(|| AllocationError::CapacityOverflow { name: row.name.into() })?;
            self.allocate(host, row.name, count, row.stride)?;
        }
        Ok(())
    }

    /// Hand the ordered native handles to `register` exactly once per allocation.
    pub fn register_with<F>(&mut self, register: F) -> Result<(), FluidError>
    where
        F: FnOnce(&[NativeHandle]) -> Result<(), EngineCallError>,
    {
        if self.registered {
            return Err(InvalidHandleError::AlreadyRegistered {
                set: self.label.clone(),
            }
            .into());
        }
        let handles = self.handles();
        register(&handles)?;
        self.registered = true;
        Ok(())
    }

    /// Release every buffer. Best-effort and idempotent.
    ///
    /// Returns the number of release calls that failed. Failed handles are
    /// still dropped from the set so they are never released twice.
    pub fn release(&mut self, host: &mut dyn RenderHost) -> usize {
        let mut failures = 0;
        for (name, entry) in self.entries.drain(..) {
            if let Err(err) = host.release_buffer(entry.handle) {
                log::warn!("failed to release buffer {}.{}: {}", self.label, name, err);
                failures += 1;
            }
        }
        self.registered = false;
        failures
    }

    pub fn get(&self, name: &str) -> Option<&BufferEntry> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    pub fn handle(&self, name: &str) -> Option<NativeHandle> {
        self.get(name).map(|e| e.handle)
    }

    /// Native handles in allocation order.
    pub fn handles(&self) -> Vec<NativeHandle> {
        self.entries.iter().map(|(_, e)| e.handle).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes owned by the set.
    pub fn size_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|(_, e)| e.count as u64 * e.stride as u64)
            .sum()
    }
}
