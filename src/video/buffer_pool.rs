//! Ownership bookkeeping for device-mapped capture buffers
//!
//! The pool is an index arena: each slot carries a tag saying whether the
//! device or the application currently owns it. The application can only
//! touch a slot through an [`AcquiredBuffer`], which only
//! [`FrameBufferPool::mark_dequeued`] creates and only
//! [`FrameBufferPool::mark_released`] / [`FrameBufferPool::retire`] consume.

use serde::Serialize;

use super::error::{CaptureError, CaptureResult};

/// Minimum number of buffers needed for double buffering
pub const MIN_BUFFER_COUNT: usize = 2;

/// Who currently owns a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferState {
    /// Enqueued, waiting to be filled by the device
    WithDevice,
    /// Dequeued (or never enqueued); the device will not write to it
    WithApplication,
    /// Lost after a failed re-enqueue; never reused
    Retired,
}

#[derive(Debug)]
struct Slot {
    length: usize,
    state: BufferState,
    /// An `AcquiredBuffer` handle exists for this slot
    held: bool,
}

/// Handle to a dequeued buffer.
///
/// Not `Clone`: releasing it moves it back into the pool, so a buffer can
/// be released at most once and never read after release.
#[derive(Debug)]
#[must_use = "an acquired buffer must be released back to the device"]
pub struct AcquiredBuffer {
    index: usize,
    bytes_used: usize,
    device_sequence: u32,
    generation: u64,
}

impl AcquiredBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of valid bytes the device wrote
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Driver-side sequence counter (may skip on dropped frames)
    pub fn device_sequence(&self) -> u32 {
        self.device_sequence
    }
}

/// Snapshot of pool ownership
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub size: usize,
    pub with_device: usize,
    pub with_application: usize,
    pub retired: usize,
    /// Buffers currently held through an `AcquiredBuffer`
    pub held: usize,
}

impl PoolCounts {
    /// Every slot is accounted for exactly once
    pub fn is_conserved(&self) -> bool {
        self.with_device + self.with_application + self.retired == self.size
            && self.held <= self.with_application
    }
}

#[derive(Debug)]
pub struct FrameBufferPool {
    slots: Vec<Slot>,
    generation: u64,
}

impl FrameBufferPool {
    /// Create a pool over buffers of the given lengths.
    ///
    /// `generation` distinguishes handles from earlier allocations on the
    /// same device.
    pub(crate) fn new(lengths: &[usize], generation: u64) -> CaptureResult<Self> {
        if lengths.len() < MIN_BUFFER_COUNT {
            return Err(CaptureError::AllocationFailed(format!(
                "device granted {} buffers, at least {} required",
                lengths.len(),
                MIN_BUFFER_COUNT
            )));
        }
        let slots = lengths
            .iter()
            .map(|&length| Slot {
                length,
                state: BufferState::WithApplication,
                held: false,
            })
            .collect();
        Ok(Self { slots, generation })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, index: usize) -> Option<BufferState> {
        self.slots.get(index).map(|s| s.state)
    }

    /// Number of slots that are not retired
    pub fn active(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != BufferState::Retired)
            .count()
    }

    /// Slots the application owns without a handle, i.e. ready to enqueue
    pub(crate) fn idle_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == BufferState::WithApplication && !s.held)
            .map(|(i, _)| i)
            .collect()
    }

    /// Record that an idle slot was handed to the device
    pub(crate) fn mark_queued(&mut self, index: usize) -> CaptureResult<()> {
        let slot = self.slot_mut(index)?;
        if slot.state != BufferState::WithApplication || slot.held {
            return Err(CaptureError::InvalidState(format!(
                "buffer {} cannot be enqueued from {:?}",
                index, slot.state
            )));
        }
        slot.state = BufferState::WithDevice;
        Ok(())
    }

    /// Record that the device returned a filled slot
    pub(crate) fn mark_dequeued(
        &mut self,
        index: usize,
        bytes_used: usize,
        device_sequence: u32,
    ) -> CaptureResult<AcquiredBuffer> {
        let generation = self.generation;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| CaptureError::AcquireFailed(format!("driver returned unknown buffer {}", index)))?;
        if slot.state != BufferState::WithDevice {
            return Err(CaptureError::AcquireFailed(format!(
                "driver returned buffer {} that was not queued ({:?})",
                index, slot.state
            )));
        }
        slot.state = BufferState::WithApplication;
        slot.held = true;
        Ok(AcquiredBuffer {
            index,
            bytes_used: bytes_used.min(slot.length),
            device_sequence,
            generation,
        })
    }

    /// Check that `buffer` belongs to this allocation and is still held
    pub(crate) fn check_handle(&self, buffer: &AcquiredBuffer) -> CaptureResult<()> {
        if buffer.generation != self.generation {
            return Err(CaptureError::InvalidState(format!(
                "buffer {} belongs to a previous allocation",
                buffer.index
            )));
        }
        match self.slots.get(buffer.index) {
            Some(slot) if slot.held && slot.state == BufferState::WithApplication => Ok(()),
            _ => Err(CaptureError::InvalidState(format!(
                "buffer {} is not held by the application",
                buffer.index
            ))),
        }
    }

    /// Hand a held slot back to the device
    pub(crate) fn mark_released(&mut self, buffer: AcquiredBuffer) -> CaptureResult<()> {
        self.check_handle(&buffer)?;
        let slot = &mut self.slots[buffer.index];
        slot.held = false;
        slot.state = BufferState::WithDevice;
        Ok(())
    }

    /// Return a held slot without queueing it (device not streaming)
    pub(crate) fn mark_idle(&mut self, buffer: AcquiredBuffer) {
        if let Some(slot) = self.slots.get_mut(buffer.index) {
            slot.held = false;
        }
    }

    /// Give up on a held slot whose re-enqueue failed
    pub(crate) fn retire(&mut self, buffer: AcquiredBuffer) {
        if let Some(slot) = self.slots.get_mut(buffer.index) {
            slot.held = false;
            slot.state = BufferState::Retired;
        }
    }

    /// After stream-off the driver owns nothing: every queued slot is back
    /// with the application.
    pub(crate) fn reclaim_all(&mut self) {
        for slot in &mut self.slots {
            if slot.state == BufferState::WithDevice {
                slot.state = BufferState::WithApplication;
            }
        }
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts {
            size: self.slots.len(),
            ..Default::default()
        };
        for slot in &self.slots {
            match slot.state {
                BufferState::WithDevice => counts.with_device += 1,
                BufferState::WithApplication => counts.with_application += 1,
                BufferState::Retired => counts.retired += 1,
            }
            if slot.held {
                counts.held += 1;
            }
        }
        counts
    }

    fn slot_mut(&mut self, index: usize) -> CaptureResult<&mut Slot> {
        self.slots
            .get_mut(index)
            .ok_or_else(|| CaptureError::InvalidState(format!("no buffer with index {}", index)))
    }
}
