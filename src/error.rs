//! Error types for the liquid bridge.
//!
//! Errors are split by what went wrong rather than by where:
//! - [`AllocationError`] - buffer/texture sizing or allocation failure
//! - [`InvalidHandleError`] - a pointer or handle used outside its valid window
//! - [`EngineCallError`] - the compute engine reported a failure
//! - [`ConfigurationError`] - bad configuration or missing required state
//!
//! [`FluidError`] unifies them for operations that can fail in several ways.

use thiserror::Error;

use crate::engine::InstanceHandle;
use crate::host::{CameraId, InsertionPoint};

/// Errors that can occur while sizing or allocating GPU resources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// A buffer was requested with zero elements.
    #[error("buffer `{name}` requested with a non-positive element count")]
    EmptyBuffer {
        /// Logical buffer name.
        name: String,
    },
    /// A buffer was requested with a zero-byte element stride.
    #[error("buffer `{name}` requested with a zero element stride")]
    ZeroStride {
        /// Logical buffer name.
        name: String,
    },
    /// The set already owns a buffer under this name.
    #[error("buffer set `{set}` already holds a buffer named `{name}`")]
    DuplicateName {
        /// Buffer set label.
        set: String,
        /// Logical buffer name.
        name: String,
    },
    /// Grid dimensions overflow the addressable node count.
    #[error("grid of {nx}x{ny}x{nz} nodes exceeds the addressable node count")]
    GridTooLarge {
        /// Cells along x.
        nx: u32,
        /// Cells along y.
        ny: u32,
        /// Cells along z.
        nz: u32,
    },
    /// A buffer's byte size or element count overflows.
    #[error("buffer `{name}` is too large to address")]
    CapacityOverflow {
        /// Logical buffer name.
        name: String,
    },
    /// A grid axis resolved to zero cells.
    #[error("grid dimensions must be positive on every axis, got {nx}x{ny}x{nz}")]
    EmptyGrid {
        /// Cells along x.
        nx: u32,
        /// Cells along y.
        ny: u32,
        /// Cells along z.
        nz: u32,
    },
    /// A render texture was requested with a zero dimension.
    #[error("texture `{label}` requested with invalid size {width}x{height}")]
    InvalidTextureSize {
        /// Texture label.
        label: String,
        /// Requested width in pixels.
        width: u32,
        /// Requested height in pixels.
        height: u32,
    },
    /// The host refused the allocation.
    #[error("host failed to allocate `{label}`: {reason}")]
    Host {
        /// Resource label.
        label: String,
        /// Host-provided reason.
        reason: String,
    },
    /// The host does not know the handle being released.
    #[error("host does not own native handle {0:#x}")]
    UnknownHandle(u64),
}

/// Use of a pointer or handle outside the window in which it is valid.
///
/// These are programming errors, not recoverable runtime conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidHandleError {
    /// The one-shot handle was never produced by this channel.
    #[error("parameter slot {index} was never produced by this channel")]
    UnknownSlot {
        /// Slot index carried by the handle.
        index: u32,
    },
    /// The one-shot slot has been freed (or reused) since the handle was issued.
    #[error("parameter slot {index} was freed; handle generation {generation} is stale")]
    StaleSlot {
        /// Slot index carried by the handle.
        index: u32,
        /// Generation carried by the handle.
        generation: u32,
    },
    /// The slot holds a different parameter block type.
    #[error("parameter slot {index} holds a different block type")]
    TypeMismatch {
        /// Slot index carried by the handle.
        index: u32,
    },
    /// A buffer set was registered with the engine a second time.
    #[error("buffer set `{set}` is already registered with the engine")]
    AlreadyRegistered {
        /// Buffer set label.
        set: String,
    },
    /// The instance has no engine handle (not initialized or already released).
    #[error("fluid instance has no live engine handle")]
    NoInstance,
    /// The engine does not recognise this instance handle.
    #[error("engine does not recognise instance {0:?}")]
    UnknownInstance(InstanceHandle),
    /// The host has no camera with this id.
    #[error("host has no camera {0:?}")]
    UnknownCamera(CameraId),
    /// The sequence is not attached to this camera at this insertion point.
    #[error("sequence {sequence} is not attached to camera {camera:?} at {point:?}")]
    UnknownSequence {
        /// Camera the detach targeted.
        camera: CameraId,
        /// Insertion point the detach targeted.
        point: InsertionPoint,
        /// Raw sequence id.
        sequence: u64,
    },
}

/// The compute engine failed a call.
///
/// The bridge has no retry policy; retrying GPU submission is the host's concern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine call `{call}` failed: {reason}")]
pub struct EngineCallError {
    /// Name of the boundary call that failed.
    pub call: &'static str,
    /// Engine- or host-provided reason.
    pub reason: String,
}

impl EngineCallError {
    /// Create a new engine call error.
    pub fn new(call: &'static str, reason: impl Into<String>) -> Self {
        Self {
            call,
            reason: reason.into(),
        }
    }
}

/// Invalid configuration values or missing required state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// A value that must be strictly positive was not.
    #[error("`{field}` must be positive, got {value}")]
    NonPositive {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: f64,
    },
    /// A frame delta was NaN or infinite.
    #[error("frame delta must be finite, got {0}")]
    NonFiniteDelta(f32),
    /// Required state has not been set up.
    #[error("missing required state: {0}")]
    Missing(&'static str),
    /// A camera is already rendered through the other delivery path.
    #[error("camera {camera} is already rendered through {existing}")]
    DeliveryConflict {
        /// Raw camera id.
        camera: u64,
        /// The delivery path the camera was first rendered with.
        existing: &'static str,
    },
}

/// Errors that can occur when loading or saving a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or write the file.
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid configuration JSON.
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    /// The file parsed but holds invalid values.
    #[error("invalid config: {0}")]
    Invalid(#[from] ConfigurationError),
}

/// Any error surfaced by the fluid instance.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FluidError {
    /// Resource allocation failed.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// A handle or pointer was used outside its valid window.
    #[error(transparent)]
    InvalidHandle(#[from] InvalidHandleError),
    /// An engine call failed.
    #[error(transparent)]
    Engine(#[from] EngineCallError),
    /// Configuration was invalid.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Result alias defaulting to [`FluidError`].
pub type Result<T, E = FluidError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        let err = EngineCallError::new("create_instance", "device lost");
        assert_eq!(err.to_string(), "engine call `create_instance` failed: device lost");
    }

    #[test]
    fn test_fluid_error_is_transparent() {
        let err: FluidError = AllocationError::EmptyBuffer {
            name: "grid_sdf".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "buffer `grid_sdf` requested with a non-positive element count"
        );
    }

    #[test]
    fn test_config_error_wraps_invalid() {
        let err: ConfigError = ConfigurationError::NonPositive {
            field: "cell_size",
            value: 0.0,
        }
        .into();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
