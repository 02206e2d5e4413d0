//! The rendering host boundary.
//!
//! The host owns GPU memory, cameras and command execution. The bridge asks it
//! for buffers and textures, reads camera state from it, and hands it command
//! streams either to execute once or to attach to a camera at an insertion
//! point, where the host replays them every frame until detached.

use glam::{Mat4, Vec3};

use crate::command::CommandStream;
use crate::engine::NativeHandle;
use crate::error::{AllocationError, EngineCallError, InvalidHandleError};

/// Stable identity of a host camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraId(u64);

impl CameraId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// How the host renders a camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderPath {
    Forward,
    Deferred,
}

impl RenderPath {
    /// Where fluid commands go for this path.
    pub const fn insertion_point(self) -> InsertionPoint {
        match self {
            RenderPath::Forward => InsertionPoint::BeforeForwardAlpha,
            RenderPath::Deferred => InsertionPoint::AfterLighting,
        }
    }
}

/// A point in the host's per-camera frame where a sequence can be attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InsertionPoint {
    /// After opaque geometry, before forward transparent geometry.
    BeforeForwardAlpha,
    /// After deferred lighting resolves.
    AfterLighting,
}

/// Pixel dimensions of a camera target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either dimension is zero.
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Per-frame camera state read from the host.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraView {
    pub id: CameraId,
    pub size: PixelSize,
    pub render_path: RenderPath,
    /// World to camera.
    pub view: Mat4,
    /// GPU-adjusted projection.
    pub projection: Mat4,
    pub position: Vec3,
}

/// Texel formats the bridge requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba32Float,
}

impl TextureFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm => 4,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

/// Description of a render texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub size: PixelSize,
    pub format: TextureFormat,
    /// Depth attachment bits, 0 for none.
    pub depth_bits: u32,
}

/// Description of a structured GPU buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    /// Element count.
    pub count: u32,
    /// Bytes per element.
    pub stride: u32,
}

impl BufferDesc<'_> {
    pub const fn size_bytes(&self) -> u64 {
        self.count as u64 * self.stride as u64
    }
}

/// Identity of a sequence attached to a camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SequenceId(u64);

impl SequenceId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Services the bridge needs from the rendering host.
pub trait RenderHost {
    /// Allocate a structured buffer.
    ///
    /// The returned handle is an opaque host-issued id, not a GPU pointer.
    /// Engines that need the underlying native resource look it up through
    /// the application (see [`HandleResolver`](crate::engine::HandleResolver)).
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<NativeHandle, AllocationError>;

    fn release_buffer(&mut self, handle: NativeHandle) -> Result<(), AllocationError>;

    /// Allocate a render texture. The handle is opaque, as for
    /// [`create_buffer`](Self::create_buffer).
    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<NativeHandle, AllocationError>;

    fn release_texture(&mut self, handle: NativeHandle) -> Result<(), AllocationError>;

    /// Current state of a camera, or `None` if the host has no such camera.
    fn camera_view(&self, camera: CameraId) -> Option<CameraView>;

    /// Attach `stream` to `camera` at `point`. The host replays it every frame.
    fn attach_sequence(
        &mut self,
        camera: CameraId,
        point: InsertionPoint,
        stream: CommandStream,
    ) -> Result<SequenceId, InvalidHandleError>;

    /// Detach a sequence. `point` must be the point it was attached at.
    fn detach_sequence(
        &mut self,
        camera: CameraId,
        point: InsertionPoint,
        sequence: SequenceId,
    ) -> Result<(), InvalidHandleError>;

    /// Submit a stream for execution. Execution may complete after this returns.
    fn execute(&mut self, stream: &CommandStream) -> Result<(), EngineCallError>;
}

impl<H: RenderHost + ?Sized> RenderHost for &mut H {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<NativeHandle, AllocationError> {
        (**self).create_buffer(desc)
    }

    fn release_buffer(&mut self, handle: NativeHandle) -> Result<(), AllocationError> {
        (**self).release_buffer(handle)
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<NativeHandle, AllocationError> {
        (**self).create_texture(desc)
    }

    fn release_texture(&mut self, handle: NativeHandle) -> Result<(), AllocationError> {
        (**self).release_texture(handle)
    }

    fn camera_view(&self, camera: CameraId) -> Option<CameraView> {
        (**self).camera_view(camera)
    }

    fn attach_sequence(
        &mut self,
        camera: CameraId,
        point: InsertionPoint,
        stream: CommandStream,
    ) -> Result<SequenceId, InvalidHandleError> {
        (**self).attach_sequence(camera, point, stream)
    }

    fn detach_sequence(
        &mut self,
        camera: CameraId,
        point: InsertionPoint,
        sequence: SequenceId,
    ) -> Result<(), InvalidHandleError> {
        (**self).detach_sequence(camera, point, sequence)
    }

    fn execute(&mut self, stream: &CommandStream) -> Result<(), EngineCallError> {
        (**self).execute(stream)
    }
}
