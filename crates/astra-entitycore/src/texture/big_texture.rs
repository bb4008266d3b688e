//! Shared big-texture slots.
//!
//! A slot is one GPU image of a given size that successive source images
//! take turns occupying. A slot is acquired every frame its occupant is
//! drawn; once it goes `lifetime` frames without being acquired it is free
//! for another image of the same size, and `release_unused` may evict it.

use std::collections::HashMap;

#[derive(Debug)]
pub struct BigTexRecap<I> {
    pub width: u32,
    pub height: u32,
    pub levels: u32,
    pub occupant: String,
    /// The occupant's pixels are on the GPU and owned by the graphics queue.
    pub ready: bool,
    /// Acquired since the last `end_frame`.
    pub acquired: bool,
    /// Frames left before the slot may be reused.
    pub lifetime: u32,
    /// An upload into this slot is in flight.
    pub loading: bool,
    pub image: I,
}

impl<I> BigTexRecap<I> {
    pub fn is_free(&self) -> bool {
        !self.acquired && !self.loading && self.lifetime == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The texture already occupies this slot.
    Hit(usize),
    /// A free slot of the right size was handed to the texture.
    Reuse(usize),
    /// No slot fits; the caller creates an image and `insert`s it.
    NeedsNew,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BigTextureStats {
    pub slots: usize,
    pub ready: usize,
    pub evictable: usize,
}

#[derive(Debug)]
pub struct BigTexturePool<I> {
    slots: Vec<BigTexRecap<I>>,
    lifetime: u32,
}

impl<I> BigTexturePool<I> {
    pub fn new(lifetime: u32) -> Self {
        Self { slots: Vec::new(), lifetime: lifetime.max(1) }
    }

    pub fn lifetime(&self) -> u32 {
        self.lifetime
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Option<&BigTexRecap<I>> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut BigTexRecap<I>> {
        self.slots.get_mut(index)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.occupant == name)
    }

    /// Mark `name` as used this frame. Only succeeds for a current occupant.
    pub fn touch(&mut self, name: &str) -> Option<usize> {
        let index = self.find(name)?;
        let slot = &mut self.slots[index];
        slot.acquired = true;
        slot.lifetime = self.lifetime;
        Some(index)
    }

    /// Find a home for `name` at `width`×`height` with `levels` mips.
    pub fn acquire(&mut self, name: &str, width: u32, height: u32, levels: u32) -> Acquire {
        if let Some(index) = self.find(name) {
            let slot = &self.slots[index];
            if slot.width == width && slot.height == height && slot.levels == levels {
                self.touch(name);
                return Acquire::Hit(index);
            }
            // The source changed size; the old slot just ages out.
            self.slots[index].occupant.clear();
            self.slots[index].ready = false;
        }

        let lifetime = self.lifetime;
        let free = self
            .slots
            .iter()
            .position(|s| s.is_free() && s.width == width && s.height == height && s.levels == levels);
        match free {
            Some(index) => {
                let slot = &mut self.slots[index];
                log::debug!("Big texture slot {}: {} replaces {}", index, name, slot.occupant);
                slot.occupant = name.to_string();
                slot.ready = false;
                slot.acquired = true;
                slot.lifetime = lifetime;
                Acquire::Reuse(index)
            }
            None => Acquire::NeedsNew,
        }
    }

    /// Add a slot for `name`, already acquired.
    pub fn insert(&mut self, name: &str, width: u32, height: u32, levels: u32, image: I) -> usize {
        self.slots.push(BigTexRecap {
            width,
            height,
            levels,
            occupant: name.to_string(),
            ready: false,
            acquired: true,
            lifetime: self.lifetime,
            loading: false,
            image,
        });
        self.slots.len() - 1
    }

    /// Age every slot that wasn't acquired this frame.
    pub fn end_frame(&mut self) {
        let lifetime = self.lifetime;
        for slot in &mut self.slots {
            if slot.acquired {
                slot.acquired = false;
                slot.lifetime = lifetime;
            } else {
                slot.lifetime = slot.lifetime.saturating_sub(1);
            }
        }
    }

    /// Remove every free slot and hand back its image. Slot indices of the
    /// remaining slots change.
    pub fn release_unused(&mut self) -> Vec<I> {
        let mut released = Vec::new();
        let mut kept = Vec::with_capacity(self.slots.len());
        for slot in self.slots.drain(..) {
            if slot.is_free() {
                released.push(slot.image);
            } else {
                kept.push(slot);
            }
        }
        self.slots = kept;
        released
    }

    pub fn stats(&self) -> BigTextureStats {
        BigTextureStats {
            slots: self.slots.len(),
            ready: self.slots.iter().filter(|s| s.ready).count(),
            evictable: self.slots.iter().filter(|s| s.is_free()).count(),
        }
    }
}

// ============================================================
// Failed loads
// ============================================================

/// Frames a failed load is held back before its first retry.
pub const RETRY_FRAMES: u32 = 60;
/// Longest hold, however often a load keeps failing.
pub const MAX_RETRY_FRAMES: u32 = RETRY_FRAMES << 6;

#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    remaining: u32,
}

/// Big-texture loads that failed. Each is held back for a number of frames
/// before it may be requested again; the hold doubles with every failure.
#[derive(Debug, Default)]
pub struct FailedLoads {
    entries: HashMap<String, Backoff>,
}

impl FailedLoads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str) {
        let entry = self.entries.entry(name.to_string()).or_insert(Backoff { failures: 0, remaining: 0 });
        entry.failures = entry.failures.saturating_add(1);
        let shift = (entry.failures - 1).min(6);
        entry.remaining = (RETRY_FRAMES << shift).min(MAX_RETRY_FRAMES);
    }

    /// True while `name` must not be requested.
    pub fn is_held(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|b| b.remaining > 0)
    }

    pub fn succeeded(&mut self, name: &str) {
        self.entries.remove(name);
    }

    pub fn end_frame(&mut self) {
        for backoff in self.entries.values_mut() {
            backoff.remaining = backoff.remaining.saturating_sub(1);
        }
    }

    pub fn held(&self) -> usize {
        self.entries.values().filter(|b| b.remaining > 0).count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> BigTexturePool<&'static str> {
        BigTexturePool::new(3)
    }

    #[test]
    fn test_second_acquire_hits() {
        let mut p = pool();
        assert_eq!(p.acquire("a", 64, 64, 7), Acquire::NeedsNew);
        let index = p.insert("a", 64, 64, 7, "image-a");
        assert_eq!(p.acquire("a", 64, 64, 7), Acquire::Hit(index));
        assert_eq!(p.touch("a"), Some(index));
        assert_eq!(p.touch("b"), None);
    }

    #[test]
    fn test_slot_recycled_after_lifetime_frames() {
        let mut p = pool();
        let a = p.insert("a", 64, 64, 7, "image");
        p.end_frame(); // frame 0: A drawn

        // A is absent; B can't take the slot until the lifetime runs out.
        for frame in 1..=3 {
            assert_eq!(p.acquire("b", 64, 64, 7), Acquire::NeedsNew, "frame {}", frame);
            p.end_frame();
        }
        assert_eq!(p.acquire("b", 64, 64, 7), Acquire::Reuse(a));
        let slot = p.slot(a).unwrap();
        assert_eq!(slot.occupant, "b");
        assert!(!slot.ready);
        assert!(slot.acquired);
    }

    #[test]
    fn test_acquired_slot_never_ages() {
        let mut p = pool();
        p.insert("a", 64, 64, 1, "image");
        for _ in 0..10 {
            p.touch("a");
            p.end_frame();
        }
        assert_eq!(p.slot(0).unwrap().lifetime, 3);
        assert_eq!(p.acquire("b", 64, 64, 1), Acquire::NeedsNew);
    }

    #[test]
    fn test_reuse_requires_same_size() {
        let mut p = pool();
        p.insert("a", 64, 64, 1, "image");
        for _ in 0..4 {
            p.end_frame();
        }
        assert_eq!(p.acquire("b", 32, 32, 1), Acquire::NeedsNew);
        assert_eq!(p.acquire("c", 64, 64, 1), Acquire::Reuse(0));
    }

    #[test]
    fn test_loading_slot_is_not_free() {
        let mut p = pool();
        p.insert("a", 8, 8, 1, "image");
        p.slot_mut(0).unwrap().loading = true;
        for _ in 0..4 {
            p.end_frame();
        }
        assert_eq!(p.acquire("b", 8, 8, 1), Acquire::NeedsNew);
        assert!(p.release_unused().is_empty());
    }

    #[test]
    fn test_release_unused_evicts_free_slots() {
        let mut p = pool();
        p.insert("a", 8, 8, 1, "old");
        p.end_frame();
        p.insert("b", 8, 8, 1, "new");
        for _ in 0..3 {
            p.touch("b");
            p.end_frame();
        }
        assert_eq!(p.stats(), BigTextureStats { slots: 2, ready: 0, evictable: 1 });
        assert_eq!(p.release_unused(), vec!["old"]);
        assert_eq!(p.len(), 1);
        assert_eq!(p.find("b"), Some(0));
    }

    #[test]
    fn test_resized_source_gets_new_slot() {
        let mut p = pool();
        p.insert("a", 8, 8, 1, "small");
        assert_eq!(p.acquire("a", 16, 16, 1), Acquire::NeedsNew);
        assert_eq!(p.find("a"), None);
    }

    // ============================================================
    // Failed loads
    // ============================================================

    #[test]
    fn test_failed_load_retried_after_backoff() {
        let mut failed = FailedLoads::new();
        failed.record("big.png");
        assert!(failed.is_held("big.png"));
        assert!(!failed.is_held("other.png"));

        for _ in 0..RETRY_FRAMES - 1 {
            failed.end_frame();
        }
        assert!(failed.is_held("big.png"));
        failed.end_frame();
        assert!(!failed.is_held("big.png"));
        assert_eq!(failed.held(), 0);
    }

    #[test]
    fn test_repeated_failures_back_off_further() {
        let mut failed = FailedLoads::new();
        failed.record("big.png");
        for _ in 0..RETRY_FRAMES {
            failed.end_frame();
        }
        failed.record("big.png");
        for _ in 0..RETRY_FRAMES {
            failed.end_frame();
        }
        assert!(failed.is_held("big.png"));
        for _ in 0..RETRY_FRAMES {
            failed.end_frame();
        }
        assert!(!failed.is_held("big.png"));

        for _ in 0..20 {
            failed.record("big.png");
        }
        for _ in 0..MAX_RETRY_FRAMES {
            failed.end_frame();
        }
        assert!(!failed.is_held("big.png"));
    }

    #[test]
    fn test_success_forgets_failures() {
        let mut failed = FailedLoads::new();
        failed.record("big.png");
        failed.record("big.png");
        failed.succeeded("big.png");
        assert!(!failed.is_held("big.png"));
        failed.record("big.png");
        for _ in 0..RETRY_FRAMES {
            failed.end_frame();
        }
        assert!(!failed.is_held("big.png"));
    }
}
