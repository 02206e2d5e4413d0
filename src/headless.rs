//! An in-memory [`RenderHost`].
//!
//! `HeadlessHost` hands out fake native handles, keeps a ledger of every
//! allocation and release, and records the command streams it is given. It is
//! what the runner and the tests drive the bridge against.
//!
//! Failures can be injected per resource label or handle to exercise the
//! bridge's error paths.

use std::collections::{HashMap, HashSet};

use crate::command::{Command, CommandStream};
use crate::engine::{EventToken, NativeHandle, ParamPtr};
use crate::error::{AllocationError, EngineCallError, InvalidHandleError};
use crate::host::{
    BufferDesc, CameraId, CameraView, InsertionPoint, PixelSize, RenderHost, SequenceId, TextureDesc,
    TextureFormat,
};

/// A live buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferRecord {
    pub label: String,
    pub count: u32,
    pub stride: u32,
}

/// A live texture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureRecord {
    pub label: String,
    pub size: PixelSize,
    pub format: TextureFormat,
    pub depth_bits: u32,
}

/// A sequence attached to a camera.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub id: SequenceId,
    pub camera: CameraId,
    pub point: InsertionPoint,
    pub stream: CommandStream,
}

/// Host that keeps everything in memory.
#[derive(Debug, Default)]
pub struct HeadlessHost {
    next_handle: u64,
    next_sequence: u64,
    buffers: HashMap<NativeHandle, BufferRecord>,
    textures: HashMap<NativeHandle, TextureRecord>,
    released: Vec<NativeHandle>,
    release_attempts: usize,
    cameras: HashMap<CameraId, CameraView>,
    attachments: Vec<Attachment>,
    attach_count: usize,
    detach_count: usize,
    executed: usize,
    event_log: Vec<(EventToken, Option<ParamPtr>)>,
    fail_allocations: HashSet<String>,
    fail_releases: HashSet<NativeHandle>,
    fail_execute: bool,
    fail_detach: bool,
}

impl HeadlessHost {
    pub fn new() -> Self {
        Self {
            next_handle: 0x1000,
            next_sequence: 1,
            ..Default::default()
        }
    }

    fn issue_handle(&mut self) -> NativeHandle {
        let handle = NativeHandle::from_raw(self.next_handle);
        self.next_handle += 1;
        handle
    }

    // --- Cameras ---

    /// Add or replace a camera.
    pub fn add_camera(&mut self, view: CameraView) {
        self.cameras.insert(view.id, view);
    }

    /// Resize a camera's target. Returns false if the camera is unknown.
    pub fn resize_camera(&mut self, camera: CameraId, size: PixelSize) -> bool {
        match self.cameras.get_mut(&camera) {
            Some(view) => {
                view.size = size;
                true
            }
            None => false,
        }
    }

    pub fn remove_camera(&mut self, camera: CameraId) -> Option<CameraView> {
        self.cameras.remove(&camera)
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        let mut ids: Vec<_> = self.cameras.keys().copied().collect();
        ids.sort();
        ids
    }

    // --- Failure injection ---

    /// Fail any buffer or texture allocation whose label ends with `suffix`.
    pub fn fail_allocation(&mut self, suffix: impl Into<String>) {
        self.fail_allocations.insert(suffix.into());
    }

    /// Fail every release of `handle`.
    pub fn fail_release(&mut self, handle: NativeHandle) {
        self.fail_releases.insert(handle);
    }

    pub fn fail_execute(&mut self, fail: bool) {
        self.fail_execute = fail;
    }

    /// Reject every detach as if the sequence were not attached there.
    pub fn fail_detach(&mut self, fail: bool) {
        self.fail_detach = fail;
    }

    pub fn clear_failures(&mut self) {
        self.fail_allocations.clear();
        self.fail_releases.clear();
        self.fail_execute = false;
        self.fail_detach = false;
    }

    fn check_allocation(&self, label: &str) -> Result<(), AllocationError> {
        if self.fail_allocations.iter().any(|s| label.ends_with(s.as_str())) {
            return Err(AllocationError::Host {
                label: label.to_owned(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn check_release(&mut self, handle: NativeHandle) -> Result<(), AllocationError> {
        self.release_attempts += 1;
        if self.fail_releases.contains(&handle) {
            return Err(AllocationError::Host {
                label: format!("{:#x}", handle.raw()),
                reason: "injected release failure".into(),
            });
        }
        Ok(())
    }

    // --- Replay ---

    /// Replay every sequence attached to `camera`, as the host does once per
    /// rendered frame. Returns the number of commands replayed.
    pub fn render_camera(&mut self, camera: CameraId) -> usize {
        let mut replayed = 0;
        for attachment in self.attachments.iter().filter(|a| a.camera == camera) {
            for command in &attachment.stream {
                if let Command::EngineEvent { token, data } = command {
                    self.event_log.push((*token, *data));
                }
                replayed += 1;
            }
        }
        replayed
    }

    // --- Inspection ---

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn buffer(&self, handle: NativeHandle) -> Option<&BufferRecord> {
        self.buffers.get(&handle)
    }

    pub fn texture(&self, handle: NativeHandle) -> Option<&TextureRecord> {
        self.textures.get(&handle)
    }

    /// Every handle successfully released, in order.
    pub fn released(&self) -> &[NativeHandle] {
        &self.released
    }

    /// Every release call made, including failed ones.
    pub fn release_attempts(&self) -> usize {
        self.release_attempts
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn attachments_for(&self, camera: CameraId) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(move |a| a.camera == camera)
    }

    pub fn attach_count(&self) -> usize {
        self.attach_count
    }

    pub fn detach_count(&self) -> usize {
        self.detach_count
    }

    /// Streams submitted through [`RenderHost::execute`].
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// Engine events from executed streams and replayed sequences.
    pub fn event_log(&self) -> &[(EventToken, Option<ParamPtr>)] {
        &self.event_log
    }

    pub fn clear_event_log(&mut self) {
        self.event_log.clear();
    }
}

impl RenderHost for HeadlessHost {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<NativeHandle, AllocationError> {
        self.check_allocation(desc.label)?;
        let handle = self.issue_handle();
        self.buffers.insert(
            handle,
            BufferRecord {
                label: desc.label.to_owned(),
                count: desc.count,
                stride: desc.stride,
            },
        );
        Ok(handle)
    }

    fn release_buffer(&mut self, handle: NativeHandle) -> Result<(), AllocationError> {
        self.check_release(handle)?;
        self.buffers
            .remove(&handle)
            .ok_or(AllocationError::UnknownHandle(handle.raw()))?;
        self.released.push(handle);
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<NativeHandle, AllocationError> {
        if desc.size.is_empty() {
            return Err(AllocationError::InvalidTextureSize {
                label: desc.label.to_owned(),
                width: desc.size.width,
                height: desc.size.height,
            });
        }
        self.check_allocation(desc.label)?;
        let handle = self.issue_handle();
        self.textures.insert(
            handle,
            TextureRecord {
                label: desc.label.to_owned(),
                size: desc.size,
                format: desc.format,
                depth_bits: desc.depth_bits,
            },
        );
        Ok(handle)
    }

    fn release_texture(&mut self, handle: NativeHandle) -> Result<(), AllocationError> {
        self.check_release(handle)?;
        self.textures
            .remove(&handle)
            .ok_or(AllocationError::UnknownHandle(handle.raw()))?;
        self.released.push(handle);
        Ok(())
    }

    fn camera_view(&self, camera: CameraId) -> Option<CameraView> {
        self.cameras.get(&camera).copied()
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
        self.attachments.push(Attachment {
            id,
            camera,
            point,
            stream,
        });
        self.attach_count += 1;
        Ok(id)
    }

    fn detach_sequence(
        &mut self,
        camera: CameraId,
        point: InsertionPoint,
        sequence: SequenceId,
    ) -> Result<(), InvalidHandleError> {
        let position = self
            .attachments
            .iter()
            .position(|a| a.id == sequence && a.camera == camera && a.point == point)
            .filter(|_| !self.fail_detach)
            .ok_or(InvalidHandleError::UnknownSequence {
                camera,
                point,
                sequence: sequence.raw(),
            })?;
        self.attachments.remove(position);
        self.detach_count += 1;
        Ok(())
    }

    fn execute(&mut self, stream: &CommandStream) -> Result<(), EngineCallError> {
        if self.fail_execute {
            return Err(EngineCallError::new("execute", "injected execute failure"));
        }
        for command in stream {
            if let Command::EngineEvent { token, data } = command {
                self.event_log.push((*token, *data));
            }
        }
        self.executed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RenderPath;
    use glam::{Mat4, Vec3};

    fn camera(id: u64) -> CameraView {
        CameraView {
            id: CameraId::new(id),
            size: PixelSize::new(640, 480),
            render_path: RenderPath::Forward,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            position: Vec3::ZERO,
        }
    }

    #[test]
    fn test_release_unknown_handle() {
        let mut host = HeadlessHost::new();
        let result = host.release_buffer(NativeHandle::from_raw(7));
        assert_eq!(result, Err(AllocationError::UnknownHandle(7)));
    }

    #[test]
    fn test_injected_allocation_failure() {
        let mut host = HeadlessHost::new();
        host.fail_allocation("grid_sdf");
        let desc = BufferDesc {
            label: "grid.grid_sdf",
            count: 4,
            stride: 4,
        };
        assert!(matches!(host.create_buffer(&desc), Err(AllocationError::Host { .. })));
        assert_eq!(host.live_buffers(), 0);
    }

    #[test]
    fn test_detach_requires_matching_point() {
        let mut host = HeadlessHost::new();
        host.add_camera(camera(1));
        let id = host
            .attach_sequence(CameraId::new(1), InsertionPoint::BeforeForwardAlpha, CommandStream::new("a"))
            .unwrap();
        assert!(host
            .detach_sequence(CameraId::new(1), InsertionPoint::AfterLighting, id)
            .is_err());
        assert!(host
            .detach_sequence(CameraId::new(1), InsertionPoint::BeforeForwardAlpha, id)
            .is_ok());
        assert!(host.attachments().is_empty());
    }

    #[test]
    fn test_attach_unknown_camera() {
        let mut host = HeadlessHost::new();
        let result = host.attach_sequence(
            CameraId::new(9),
            InsertionPoint::AfterLighting,
            CommandStream::new("a"),
        );
        assert_eq!(result, Err(InvalidHandleError::UnknownCamera(CameraId::new(9))));
    }

    #[test]
    fn test_zero_sized_texture_rejected() {
        let mut host = HeadlessHost::new();
        let desc = TextureDesc {
            label: "color0",
            size: PixelSize::new(0, 0),
            format: TextureFormat::Rgba32Float,
            depth_bits: 16,
        };
        assert!(matches!(
            host.create_texture(&desc),
            Err(AllocationError::InvalidTextureSize { .. })
        ));
    }
}
