//! Host command streams.
//!
//! A [`CommandStream`] is an ordered list of opaque commands the host executes
//! later, at a point it controls. Commands earlier in a stream execute first;
//! ordering across streams is the host's business.

use glam::Mat4;

use crate::collider::{GridTargets, SdfShape};
use crate::engine::{EventToken, NativeHandle, ParamPtr};

/// A render target a command reads from or writes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderTarget {
    /// The camera's current color target.
    CameraColor,
    /// The camera's depth target.
    CameraDepth,
    /// A texture allocated through the host.
    Texture(NativeHandle),
}

/// One recorded command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Invoke the engine's event entry point with an encoded token and an
    /// optional parameter block address.
    EngineEvent {
        token: EventToken,
        data: Option<ParamPtr>,
    },
    /// Copy one target into another.
    CopyTexture {
        source: RenderTarget,
        destination: RenderTarget,
    },
    /// Bind the target subsequent draws write to.
    SetTarget(RenderTarget),
    /// Clear the bound target's color and depth.
    ClearTarget,
    /// Draw the fluid surface quad.
    DrawSurface {
        /// Address of the instance's surface material block.
        uniforms: ParamPtr,
        background: NativeHandle,
        fluid_color: NativeHandle,
        grid_normal: NativeHandle,
        /// Container local to world.
        transform: Mat4,
    },
    /// Union one collider's signed distance field into the grid.
    ColliderSdf {
        collider_id: u32,
        node_count: u32,
        grid: GridTargets,
        shape: SdfShape,
    },
}

/// An ordered command sequence.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandStream {
    label: String,
    commands: Vec<Command>,
}

impl CommandStream {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            commands: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Append an engine event.
    pub fn push_event(&mut self, token: EventToken, data: Option<ParamPtr>) {
        self.push(Command::EngineEvent { token, data });
    }

    /// Remove every command, keeping the allocation.
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Engine event tokens in stream order.
    pub fn events(&self) -> impl Iterator<Item = EventToken> + '_ {
        self.commands.iter().filter_map(|c| match c {
            Command::EngineEvent { token, .. } => Some(*token),
            _ => None,
        })
    }
}

impl<'a> IntoIterator for &'a CommandStream {
    type Item = &'a Command;
    type IntoIter = std::slice::Iter<'a, Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
