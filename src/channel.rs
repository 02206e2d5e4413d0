//! Marshaling of fixed-layout parameter blocks across the engine boundary.
//!
//! Two modes:
//! - **One-shot**: the block is moved into a heap slot whose address never
//!   changes until the slot is freed. The engine may hold that address and
//!   read it at any later event. Updates write through the same address.
//! - **Transient**: the block is pinned on the stack for the duration of one
//!   engine call and released when the call returns.
//!
//! One-shot slots are identified by a generational [`OneShot`] handle, so a
//! freed or foreign handle is rejected instead of writing through a dangling
//! address.
//!
//! # Example
//!
//! ```ignore
//! let mut channel = ParameterChannel::new();
//! let camera = channel.push_one_shot(CameraParams::default());
//! engine.set_camera_parameters(instance, camera.ptr())?;
//!
//! // Per frame, no allocation:
//! channel.update_one_shot(&camera, &fresh_params)?;
//!
//! // Per step:
//! channel.push_transient(&solver_params, |ptr| engine.set_parameters(instance, ptr))?;
//! ```

use std::any::Any;
use std::marker::PhantomData;

use bytemuck::Pod;

use crate::engine::ParamPtr;
use crate::error::InvalidHandleError;

/// Handle to a one-shot parameter block owned by a [`ParameterChannel`].
#[derive(Debug)]
pub struct OneShot<T> {
    index: u32,
    generation: u32,
    ptr: ParamPtr,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for OneShot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for OneShot<T> {}

impl<T> PartialEq for OneShot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> OneShot<T> {
    /// The stable address handed to the engine.
    #[inline]
    pub fn ptr(&self) -> ParamPtr {
        self.ptr
    }
}

struct Slot {
    generation: u32,
    block: Option<Box<dyn Any + Send>>,
}

/// Owner of every one-shot block of one fluid instance.
#[derive(Default)]
pub struct ParameterChannel {
    slots: Vec<Slot>,
    free: Vec<u32>,
    transient_calls: u64,
}

impl std::fmt::Debug for ParameterChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterChannel")
            .field("live", &self.live_count())
            .field("slots", &self.slots.len())
            .field("transient_calls", &self.transient_calls)
            .finish()
    }
}

impl ParameterChannel {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `block` into a slot with a fixed address for the rest of the slot's life.
    pub fn push_one_shot<T: Pod + Send>(&mut self, block: T) -> OneShot<T> {
        let boxed: Box<T> = Box::new(block);
        let ptr = ParamPtr::from_ref::<T>(&boxed);
        let block: Box<dyn Any + Send> = boxed;

        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.block = Some(block);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    block: Some(block),
                });
                (self.slots.len() - 1) as u32
            }
        };

        OneShot {
            index,
            generation: self.slots[index as usize].generation,
            ptr,
            _marker: PhantomData,
        }
    }

    /// Overwrite a one-shot block in place. Never allocates or moves the block.
    pub fn update_one_shot<T: Pod + Send>(
        &mut self,
        handle: &OneShot<T>,
        block: &T,
    ) -> Result<(), InvalidHandleError> {
        *self.slot_mut(handle)? = *block;
        Ok(())
    }

    /// Read back the current value of a one-shot block.
    pub fn get<T: Pod + Send>(&self, handle: &OneShot<T>) -> Result<&T, InvalidHandleError> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(InvalidHandleError::UnknownSlot { index: handle.index })?;
        let block = match (&slot.block, slot.generation == handle.generation) {
            (Some(block), true) => block,
            _ => {
                return Err(InvalidHandleError::StaleSlot {
                    index: handle.index,
                    generation: handle.generation,
                })
            }
        };
        block
            .downcast_ref::<T>()
            .ok_or(InvalidHandleError::TypeMismatch { index: handle.index })
    }

    fn slot_mut<T: Pod + Send>(&mut self, handle: &OneShot<T>) -> Result<&mut T, InvalidHandleError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(InvalidHandleError::UnknownSlot { index: handle.index })?;
        if slot.generation != handle.generation {
            return Err(InvalidHandleError::StaleSlot {
                index: handle.index,
                generation: handle.generation,
            });
        }
        let block = slot.block.as_mut().ok_or(InvalidHandleError::StaleSlot {
            index: handle.index,
            generation: handle.generation,
        })?;
        let block = block
            .downcast_mut::<T>()
            .ok_or(InvalidHandleError::TypeMismatch { index: handle.index })?;
        // The handle's address must still name this slot's allocation.
        if ParamPtr::from_ref::<T>(block) != handle.ptr {
            return Err(InvalidHandleError::UnknownSlot { index: handle.index });
        }
        Ok(block)
    }

    /// Free a one-shot slot. Its address must no longer be used by the engine.
    pub fn free<T>(&mut self, handle: OneShot<T>) -> Result<(), InvalidHandleError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(InvalidHandleError::UnknownSlot { index: handle.index })?;
        if slot.generation != handle.generation || slot.block.is_none() {
            return Err(InvalidHandleError::StaleSlot {
                index: handle.index,
                generation: handle.generation,
            });
        }
        slot.block = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(())
    }

    /// Free every live slot. Returns how many were freed.
    pub fn free_all(&mut self) -> usize {
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.block.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                freed += 1;
            }
        }
        freed
    }

    /// Pin `block` for the duration of `call` only.
    ///
    /// The address passed to `call` is invalid once this returns.
    pub fn push_transient<T: Pod, R>(&mut self, block: &T, call: impl FnOnce(ParamPtr) -> R) -> R {
        let pinned: T = *block;
        self.transient_calls += 1;
        call(ParamPtr::from_ref(&pinned))
    }

    /// Number of live one-shot slots.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.block.is_some()).count()
    }

    /// Total transient pushes made through this channel.
    pub fn transient_calls(&self) -> u64 {
        self.transient_calls
    }
}
