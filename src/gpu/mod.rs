//! wgpu-backed render host.
//!
//! [`WgpuHost`] allocates real device buffers and textures for the bridge,
//! keeps a color and depth target per camera, and executes the commands it
//! can encode itself (copies and clears). Engine events are queued for the
//! caller to dispatch to the engine's entry point; surface draws and collider
//! passes run inside the engine and are queued alongside them.
//!
//! Handles issued here are host ids, not GPU pointers. To pair this host with
//! the native engine, build its [`HandleResolver`](crate::engine::HandleResolver)
//! from [`WgpuHost::buffer`] and [`WgpuHost::texture`] through wgpu's hal
//! interop for the active backend.
//!
//! ```ignore
//! let mut host = WgpuHost::new_blocking()?;
//! let camera = host.add_camera(view);
//! fluid.init(&mut host)?;
//!
//! fluid.advance(dt, &mut host)?;
//! fluid.render(camera, &mut host)?;
//! host.render_camera(camera)?;
//! for work in host.take_events() {
//!     // hand to the engine's render-event entry point
//! }
//! ```

use std::collections::HashMap;

use crate::command::{Command, CommandStream, RenderTarget};
use crate::engine::{EventToken, NativeHandle, ParamPtr};
use crate::error::{AllocationError, EngineCallError, InvalidHandleError};
use crate::host::{
    BufferDesc, CameraId, CameraView, InsertionPoint, PixelSize, RenderHost, SequenceId, TextureDesc, TextureFormat,
};

const CAMERA_COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
    }
}

fn depth_format(bits: u32) -> Option<wgpu::TextureFormat> {
    match bits {
        0 => None,
        1..=16 => Some(wgpu::TextureFormat::Depth16Unorm),
        _ => Some(DEPTH_FORMAT),
    }
}

fn extent(size: PixelSize) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

fn create_target(device: &wgpu::Device, label: &str, size: PixelSize, format: wgpu::TextureFormat) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: extent(size),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}

/// A color texture with an optional depth attachment.
struct Target {
    color: wgpu::Texture,
    depth: Option<wgpu::Texture>,
    size: PixelSize,
}

struct CameraSlot {
    view: CameraView,
    target: Target,
}

struct Sequence {
    id: SequenceId,
    camera: CameraId,
    point: InsertionPoint,
    stream: CommandStream,
}

/// A command the host queued for the engine instead of encoding itself.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineWork {
    Event { token: EventToken, data: Option<ParamPtr> },
    /// A surface draw or collider pass, forwarded as recorded.
    Command(Command),
}

/// Render host on a wgpu device.
pub struct WgpuHost {
    device: wgpu::Device,
    queue: wgpu::Queue,
    next_handle: u64,
    next_sequence: u64,
    buffers: HashMap<NativeHandle, wgpu::Buffer>,
    textures: HashMap<NativeHandle, Target>,
    cameras: HashMap<CameraId, CameraSlot>,
    sequences: Vec<Sequence>,
    pending: Vec<EngineWork>,
}

impl WgpuHost {
    /// Create a host on a new device from the default adapter.
    pub async fn new() -> Result<Self, EngineCallError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| EngineCallError::new("request_adapter", "no compatible adapter"))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Liquid Host Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|err| EngineCallError::new("request_device", err.to_string()))?;

        log::info!("wgpu host on {}", adapter.get_info().name);
        Ok(Self::from_device(device, queue))
    }

    /// [`new`](Self::new), blocking on the current thread.
    pub fn new_blocking() -> Result<Self, EngineCallError> {
        pollster::block_on(Self::new())
    }

    /// Wrap a device the caller already owns.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            next_handle: 1,
            next_sequence: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            cameras: HashMap::new(),
            sequences: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    fn issue_handle(&mut self) -> NativeHandle {
        let handle = NativeHandle::from_raw(self.next_handle);
        self.next_handle += 1;
        handle
    }

    // --- Cameras ---

    /// Register a camera and allocate its color and depth targets.
    pub fn add_camera(&mut self, view: CameraView) -> CameraId {
        let target = self.camera_target(view.id, view.size);
        self.cameras.insert(view.id, CameraSlot { view, target });
        view.id
    }

    /// Update a camera. Targets are reallocated when the size changes.
    pub fn update_camera(&mut self, view: CameraView) {
        let resized = self.cameras.get(&view.id).map_or(true, |slot| slot.view.size != view.size);
        if resized {
            self.add_camera(view);
        } else if let Some(slot) = self.cameras.get_mut(&view.id) {
            slot.view = view;
        }
    }

    /// Drop a camera along with every sequence attached to it.
    pub fn remove_camera(&mut self, camera: CameraId) -> bool {
        self.sequences.retain(|s| s.camera != camera);
        self.cameras.remove(&camera).is_some()
    }

    fn camera_target(&self, camera: CameraId, size: PixelSize) -> Target {
        let size = PixelSize::new(size.width.max(1), size.height.max(1));
        Target {
            color: create_target(&self.device, &format!("camera{}.color", camera.raw()), size, CAMERA_COLOR_FORMAT),
            depth: Some(create_target(
                &self.device,
                &format!("camera{}.depth", camera.raw()),
                size,
                DEPTH_FORMAT,
            )),
            size,
        }
    }

    /// The camera's color target, for presenting or reading back.
    pub fn camera_color(&self, camera: CameraId) -> Option<&wgpu::Texture> {
        self.cameras.get(&camera).map(|slot| &slot.target.color)
    }

    /// Execute every sequence attached to `camera`, in attach order.
    pub fn render_camera(&mut self, camera: CameraId) -> Result<usize, EngineCallError> {
        let streams: Vec<CommandStream> = self
            .sequences
            .iter()
            .filter(|s| s.camera == camera)
            .map(|s| s.stream.clone())
            .collect();
        for stream in &streams {
            self.encode(Some(camera), stream)?;
        }
        Ok(streams.len())
    }

    /// Drain the engine work queued by executed streams.
    pub fn take_events(&mut self) -> Vec<EngineWork> {
        std::mem::take(&mut self.pending)
    }

    /// The device buffer behind a handle this host issued.
    pub fn buffer(&self, handle: NativeHandle) -> Option<&wgpu::Buffer> {
        self.buffers.get(&handle)
    }

    /// The color texture behind a handle this host issued.
    pub fn texture(&self, handle: NativeHandle) -> Option<&wgpu::Texture> {
        self.textures.get(&handle).map(|t| &t.color)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    // --- Encoding ---

    fn resolve(&self, camera: Option<CameraId>, target: RenderTarget) -> Result<(&wgpu::Texture, PixelSize), EngineCallError> {
        let missing = |what: &str| EngineCallError::new("execute", format!("no {} to bind", what));
        match target {
            RenderTarget::Texture(handle) => self
                .textures
                .get(&handle)
                .map(|t| (&t.color, t.size))
                .ok_or_else(|| missing("texture")),
            RenderTarget::CameraColor | RenderTarget::CameraDepth => {
                let slot = camera
                    .and_then(|id| self.cameras.get(&id))
                    .ok_or_else(|| missing("camera"))?;
                match target {
                    RenderTarget::CameraDepth => slot
                        .target
                        .depth
                        .as_ref()
                        .map(|d| (d, slot.target.size))
                        .ok_or_else(|| missing("camera depth")),
                    _ => Ok((&slot.target.color, slot.target.size)),
                }
            }
        }
    }

    fn depth_of(&self, camera: Option<CameraId>, target: RenderTarget) -> Option<&wgpu::Texture> {
        match target {
            RenderTarget::Texture(handle) => self.textures.get(&handle).and_then(|t| t.depth.as_ref()),
            RenderTarget::CameraColor => camera
                .and_then(|id| self.cameras.get(&id))
                .and_then(|slot| slot.target.depth.as_ref()),
            RenderTarget::CameraDepth => None,
        }
    }

    fn encode(&mut self, camera: Option<CameraId>, stream: &CommandStream) -> Result<(), EngineCallError> {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(stream.label()),
        });
        let mut bound = RenderTarget::CameraColor;
        let mut queued = Vec::new();

        for command in stream {
            match command {
                Command::EngineEvent { token, data } => queued.push(EngineWork::Event {
                    token: *token,
                    data: *data,
                }),
                Command::CopyTexture { source, destination } => {
                    let (src, src_size) = self.resolve(camera, *source)?;
                    let (dst, dst_size) = self.resolve(camera, *destination)?;
                    if src.format() != dst.format() {
                        return Err(EngineCallError::new(
                            "execute",
                            format!("cannot copy {:?} into {:?}", src.format(), dst.format()),
                        ));
                    }
                    let size = PixelSize::new(src_size.width.min(dst_size.width), src_size.height.min(dst_size.height));
                    encoder.copy_texture_to_texture(src.as_image_copy(), dst.as_image_copy(), extent(size));
                }
                Command::SetTarget(target) => bound = *target,
                Command::ClearTarget => {
                    if bound == RenderTarget::CameraDepth {
                        return Err(EngineCallError::new("execute", "camera depth cannot be bound as a color target"));
                    }
                    let (color, _) = self.resolve(camera, bound)?;
                    let color_view = color.create_view(&wgpu::TextureViewDescriptor::default());
                    let depth_view = self
                        .depth_of(camera, bound)
                        .map(|d| d.create_view(&wgpu::TextureViewDescriptor::default()));
                    let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("Clear Pass"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: &color_view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: depth_view.as_ref().map(|view| {
                            wgpu::RenderPassDepthStencilAttachment {
                                view,
                                depth_ops: Some(wgpu::Operations {
                                    load: wgpu::LoadOp::Clear(1.0),
                                    store: wgpu::StoreOp::Store,
                                }),
                                stencil_ops: None,
                            }
                        }),
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                }
                other @ (Command::DrawSurface { .. } | Command::ColliderSdf { .. }) => {
                    queued.push(EngineWork::Command(other.clone()));
                }
            }
        }

        self.queue.submit(Some(encoder.finish()));
        self.pending.extend(queued);
        Ok(())
    }
}

impl RenderHost for WgpuHost {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<NativeHandle, AllocationError> {
        let size = desc.size_bytes();
        let limit = self.device.limits().max_buffer_size;
        if size > limit {
            return Err(AllocationError::Host {
                label: desc.label.to_owned(),
                reason: format!("{} bytes exceeds the device limit of {}", size, limit),
            });
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let handle = self.issue_handle();
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn release_buffer(&mut self, handle: NativeHandle) -> Result<(), AllocationError> {
        let buffer = self
            .buffers
            .remove(&handle)
            .ok_or(AllocationError::UnknownHandle(handle.raw()))?;
        buffer.destroy();
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<NativeHandle, AllocationError> {
        let max = self.device.limits().max_texture_dimension_2d;
        if desc.size.is_empty() || desc.size.width > max || desc.size.height > max {
            return Err(AllocationError::InvalidTextureSize {
                label: desc.label.to_owned(),
                width: desc.size.width,
                height: desc.size.height,
            });
        }
        let color = create_target(&self.device, desc.label, desc.size, texture_format(desc.format));
        let depth = depth_format(desc.depth_bits)
            .map(|format| create_target(&self.device, &format!("{}.depth", desc.label), desc.size, format));
        let handle = self.issue_handle();
        self.textures.insert(
            handle,
            Target {
                color,
                depth,
                size: desc.size,
            },
        );
        Ok(handle)
    }

    fn release_texture(&mut self, handle: NativeHandle) -> Result<(), AllocationError> {
        let target = self
            .textures
            .remove(&handle)
            .ok_or(AllocationError::UnknownHandle(handle.raw()))?;
        target.color.destroy();
        if let Some(depth) = target.depth {
            depth.destroy();
        }
        Ok(())
    }

    fn camera_view(&self, camera: CameraId) -> Option<CameraView> {
        self.cameras.get(&camera).map(|slot| slot.view)
    }

    fn attach_sequence(
        &mut self,
        camera: CameraId,
        point: InsertionPoint,
        stream: CommandStream,
    ) -> Result<SequenceId, InvalidHandleError> {
        if !self.cameras.contains_key(&camera) {
            return Err(InvalidHandleError::UnknownCamera(camera));
        }
        let id = SequenceId::new(self.next_sequence);
        self.next_sequence += 1;
        self.sequences.push(Sequence {
            id,
            camera,
            point,
            stream,
        });
        Ok(id)
    }

    fn detach_sequence(
        &mut self,
        camera: CameraId,
        point: InsertionPoint,
        sequence: SequenceId,
    ) -> Result<(), InvalidHandleError> {
        let position = self
            .sequences
            .iter()
            .position(|s| s.id == sequence && s.camera == camera && s.point == point)
            .ok_or(InvalidHandleError::UnknownSequence {
                camera,
                point,
                sequence: sequence.raw(),
            })?;
        self.sequences.remove(position);
        Ok(())
    }

    fn execute(&mut self, stream: &CommandStream) -> Result<(), EngineCallError> {
        self.encode(None, stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RenderPath;
    use glam::{Mat4, Vec3};

    fn host() -> Option<WgpuHost> {
        match WgpuHost::new_blocking() {
            Ok(host) => Some(host),
            Err(err) => {
                eprintln!("skipping wgpu test: {}", err);
                None
            }
        }
    }

    #[test]
    fn test_buffer_and_texture_lifecycle() {
        let Some(mut host) = host() else { return };
        let buffer = host
            .create_buffer(&BufferDesc {
                label: "grid.grid_sdf",
                count: 64,
                stride: 4,
            })
            .unwrap();
        let texture = host
            .create_texture(&TextureDesc {
                label: "camera1.color0",
                size: PixelSize::new(64, 32),
                format: TextureFormat::Rgba32Float,
                depth_bits: 16,
            })
            .unwrap();
        assert_eq!(host.live_buffers(), 1);
        assert_eq!(host.live_textures(), 1);
        assert_eq!(host.buffer(buffer).map(|b| b.size()), Some(256));
        assert!(host.texture(texture).is_some());

        host.release_buffer(buffer).unwrap();
        assert!(host.buffer(buffer).is_none());
        host.release_texture(texture).unwrap();
        assert!(host.release_texture(texture).is_err());
    }

    #[test]
    fn test_copy_and_clear_execute() {
        let Some(mut host) = host() else { return };
        let camera = host.add_camera(CameraView {
            id: CameraId::new(1),
            size: PixelSize::new(32, 32),
            render_path: RenderPath::Forward,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            position: Vec3::ZERO,
        });
        let background = host
            .create_texture(&TextureDesc {
                label: "camera1.background",
                size: PixelSize::new(32, 32),
                format: TextureFormat::Rgba8Unorm,
                depth_bits: 0,
            })
            .unwrap();

        let mut stream = CommandStream::new("liquid.render");
        stream.push(Command::CopyTexture {
            source: RenderTarget::CameraColor,
            destination: RenderTarget::Texture(background),
        });
        stream.push(Command::SetTarget(RenderTarget::Texture(background)));
        stream.push(Command::ClearTarget);
        let id = host
            .attach_sequence(camera, InsertionPoint::BeforeForwardAlpha, stream)
            .unwrap();

        assert_eq!(host.render_camera(camera).unwrap(), 1);
        assert!(host.take_events().is_empty());
        host.detach_sequence(camera, InsertionPoint::BeforeForwardAlpha, id)
            .unwrap();
        assert_eq!(host.render_camera(camera).unwrap(), 0);
    }
}
