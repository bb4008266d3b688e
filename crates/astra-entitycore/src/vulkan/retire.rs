//! Per-frame retirement.
//!
//! GPU objects released while frame slot `f` is being recorded may still be
//! read by the command buffers of that slot. They are parked in the ring
//! under `f` and handed back by `begin_frame(f)`, which the owner calls once
//! the fence of `f` has been waited the next time round.

use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

struct Slots<T> {
    current: usize,
    frames: Vec<Vec<T>>,
}

pub struct RetireRing<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> RetireRing<T> {
    pub fn new(frames: usize) -> Self {
        let frames = (0..frames.max(1)).map(|_| Vec::new()).collect();
        Self { slots: Mutex::new(Slots { current: 0, frames }) }
    }

    pub fn frames(&self) -> usize {
        self.slots.lock().frames.len()
    }

    /// Park `item` until the current frame slot comes round again.
    pub fn push(&self, item: T) {
        let mut slots = self.slots.lock();
        let current = slots.current;
        slots.frames[current].push(item);
    }

    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        let mut slots = self.slots.lock();
        let current = slots.current;
        slots.frames[current].extend(items);
    }

    /// `frame`'s fence has been waited: make it current and return what was
    /// parked under it.
    pub fn begin_frame(&self, frame: usize) -> Vec<T> {
        let mut slots = self.slots.lock();
        let index = frame % slots.frames.len();
        slots.current = index;
        std::mem::take(&mut slots.frames[index])
    }

    /// Everything parked, for every frame. The device must be idle.
    pub fn take_all(&self) -> Vec<T> {
        self.slots.lock().frames.iter_mut().flat_map(std::mem::take).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().frames.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns a value and parks it in a `RetireRing` when dropped, so whatever
/// the value frees on drop outlives the frames that may still use it.
pub struct Deferred<T> {
    value: ManuallyDrop<T>,
    ring: Arc<RetireRing<T>>,
}

impl<T> Deferred<T> {
    pub fn new(value: T, ring: &Arc<RetireRing<T>>) -> Self {
        Self { value: ManuallyDrop::new(value), ring: ring.clone() }
    }
}

impl<T> Deref for Deferred<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for Deferred<T> {
    fn drop(&mut self) {
        // SAFETY: `value` is taken exactly once, here, and never used again.
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        self.ring.push(value);
    }
}
