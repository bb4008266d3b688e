//! BufferMgr: one big persistent GPU buffer carved into `SubBuffer` leases.
//!
//! Acquisition takes the allocator mutex and never waits on the GPU; when
//! the pool is full it returns a null `SubBuffer` and logs, there is no
//! growth. Releases go through two stages:
//!
//! - `release_buffer` parks the region in the retirement list of the current
//!   frame. It only returns to the free list once that frame slot comes
//!   round again (`begin_frame`), i.e. after its fence was waited, so the
//!   GPU can still read it while the frame is in flight.
//! - returning to the free list happens synchronously when the allocator
//!   lock is free. Otherwise the region is pushed on a lock-free queue;
//!   once that queue crosses the configured threshold a background thread
//!   takes over draining and coalescing it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use ash::vk;
use crossbeam::channel::{self, Sender};
use crossbeam::queue::SegQueue;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use super::region::{Region, RegionAllocator};
use crate::error::CoreResult;
use crate::vulkan::memory::{GpuBuffer, MappedPtr, MemoryManager};
use crate::vulkan::RetireRing;

/// A lease on a byte range of a shared GPU buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubBuffer {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    /// Offset is aligned for use as a (dynamic) uniform buffer.
    pub uniform: bool,
}

impl Default for SubBuffer {
    fn default() -> Self {
        Self::null()
    }
}

impl SubBuffer {
    /// The "no space" result.
    pub const fn null() -> Self {
        Self { buffer: vk::Buffer::null(), offset: 0, size: 0, uniform: false }
    }

    pub fn is_null(&self) -> bool {
        self.buffer == vk::Buffer::null() || self.size == 0
    }

    pub fn region(&self) -> Region {
        Region { offset: self.offset, size: self.size }
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo { buffer: self.buffer, offset: self.offset, range: self.size }
    }

    /// True when `len` bytes at `offset` (relative to the lease) fit.
    pub fn fits(&self, offset: u64, len: u64) -> bool {
        !self.is_null() && offset.checked_add(len).is_some_and(|end| end <= self.size)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub capacity: u64,
    pub used: u64,
    pub free: u64,
    pub largest_free: u64,
    pub free_regions: usize,
    pub high_water: u64,
    /// Releases queued but not yet coalesced.
    pub pending: usize,
    /// Releases waiting for their frame to retire.
    pub retiring: usize,
}

// ============================================================
// SubAllocator: locking, release queue, release thread
// ============================================================

struct Shared {
    name: String,
    regions: Mutex<RegionAllocator>,
    pending: SegQueue<Region>,
    pending_len: AtomicUsize,
}

impl Shared {
    fn release_locked(&self, regions: &mut RegionAllocator, region: Region) {
        if let Err(e) = regions.release(region) {
            log::error!("{}: {}", self.name, e);
        }
    }

    fn drain_locked(&self, regions: &mut RegionAllocator) -> usize {
        let mut count = 0;
        while let Some(region) = self.pending.pop() {
            self.pending_len.fetch_sub(1, Ordering::AcqRel);
            self.release_locked(regions, region);
            count += 1;
        }
        count
    }

    fn push(&self, region: Region) -> usize {
        self.pending.push(region);
        self.pending_len.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Device-independent half of `BufferMgr`.
pub struct SubAllocator {
    shared: Arc<Shared>,
    buffer: vk::Buffer,
    threshold: usize,
    wake: OnceLock<Sender<()>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_running: AtomicBool,
    retired: RetireRing<Region>,
}

impl SubAllocator {
    pub fn new(
        name: &str,
        buffer: vk::Buffer,
        capacity: u64,
        uniform_alignment: u64,
        release_threshold: usize,
        frames: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                regions: Mutex::new(RegionAllocator::new(capacity, uniform_alignment)),
                pending: SegQueue::new(),
                pending_len: AtomicUsize::new(0),
            }),
            buffer,
            threshold: release_threshold.max(1),
            wake: OnceLock::new(),
            worker: Mutex::new(None),
            worker_running: AtomicBool::new(false),
            retired: RetireRing::new(frames),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn uniform_alignment(&self) -> u64 {
        self.shared.regions.lock().uniform_alignment()
    }

    /// Lease `size` bytes; a null `SubBuffer` (logged) when the pool is full.
    pub fn acquire_buffer(&self, size: u64, uniform: bool) -> SubBuffer {
        if size == 0 {
            log::error!("{}: zero-sized buffer request", self.shared.name);
            return SubBuffer::null();
        }

        let mut regions = self.shared.regions.lock();
        self.shared.drain_locked(&mut regions);
        match regions.acquire(size, uniform) {
            Some(region) => SubBuffer { buffer: self.buffer, offset: region.offset, size: region.size, uniform },
            None => {
                log::error!(
                    "{}: no space for {} bytes ({} of {} free, largest block {})",
                    self.shared.name,
                    size,
                    regions.free(),
                    regions.capacity(),
                    regions.largest_free()
                );
                SubBuffer::null()
            }
        }
    }

    /// Release once the current frame has retired on the GPU.
    pub fn release_buffer(&self, sub: SubBuffer) {
        if sub.is_null() {
            return;
        }
        self.retired.push(sub.region());
    }

    /// Release a lease the GPU never used (or has finished with).
    pub fn release_buffer_now(&self, sub: SubBuffer) {
        if sub.is_null() {
            return;
        }
        self.release_region(sub.region());
    }

    fn release_region(&self, region: Region) {
        if !self.worker_running.load(Ordering::Acquire) {
            if let Some(mut regions) = self.shared.regions.try_lock() {
                self.shared.drain_locked(&mut regions);
                self.shared.release_locked(&mut regions, region);
                return;
            }
        }

        let pending = self.shared.push(region);
        if let Some(wake) = self.wake.get() {
            let _ = wake.send(());
        } else if pending >= self.threshold {
            self.start_worker();
        }
    }

    fn start_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let (tx, rx) = channel::unbounded::<()>();
        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{} release", shared.name))
            .spawn(move || {
                while rx.recv().is_ok() {
                    while rx.try_recv().is_ok() {}
                    let mut regions = shared.regions.lock();
                    shared.drain_locked(&mut regions);
                }
                let mut regions = shared.regions.lock();
                shared.drain_locked(&mut regions);
            });

        match spawned {
            Ok(handle) => {
                log::debug!("{}: release thread started", self.shared.name);
                let _ = tx.send(());
                let _ = self.wake.set(tx);
                *worker = Some(handle);
                self.worker_running.store(true, Ordering::Release);
            }
            Err(e) => log::error!("{}: couldn't start release thread: {}", self.shared.name, e),
        }
    }

    pub fn is_worker_running(&self) -> bool {
        self.worker_running.load(Ordering::Acquire)
    }

    /// Frame slot `frame` is about to be reused: everything released while
    /// it was last recorded goes back to the free list.
    pub fn begin_frame(&self, frame: usize) {
        for region in self.retired.begin_frame(frame) {
            self.release_region(region);
        }
    }

    /// Coalesce every queued release now.
    pub fn flush(&self) {
        let mut regions = self.shared.regions.lock();
        self.shared.drain_locked(&mut regions);
    }

    /// Release everything parked for every frame (device idle).
    pub fn retire_all(&self) {
        for region in self.retired.take_all() {
            self.release_region(region);
        }
        self.flush();
    }

    pub fn high_water(&self) -> u64 {
        self.shared.regions.lock().high_water()
    }

    pub fn stats(&self) -> BufferStats {
        let regions = self.shared.regions.lock();
        BufferStats {
            capacity: regions.capacity(),
            used: regions.used(),
            free: regions.free(),
            largest_free: regions.largest_free(),
            free_regions: regions.free_region_count(),
            high_water: regions.high_water(),
            pending: self.shared.pending_len.load(Ordering::Acquire),
            retiring: self.retired.len(),
        }
    }
}

impl Drop for SubAllocator {
    fn drop(&mut self) {
        // Dropping the sender ends the release thread after a final drain.
        drop(self.wake.take());
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Copy of everything below the high water mark, the only bytes a lease
/// ever covered.
pub fn prefix_copy(high_water: u64) -> Option<vk::BufferCopy> {
    (high_water > 0).then_some(vk::BufferCopy { src_offset: 0, dst_offset: 0, size: high_water })
}

// ============================================================
// BufferMgr: SubAllocator over real GPU memory
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Host-coherent memory the GPU reads directly (uniforms, stream data).
    HostVisible,
    /// Device-local memory fed from a same-sized staging buffer by `update`.
    Staged,
}

pub struct BufferMgr {
    alloc: SubAllocator,
    kind: BufferKind,
    mapped: MappedPtr,
    staging: Option<GpuBuffer>,
    buffer: GpuBuffer,
}

impl BufferMgr {
    pub unsafe fn new(
        memory: &MemoryManager,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        kind: BufferKind,
        uniform_alignment: u64,
        release_threshold: usize,
        frames: usize,
    ) -> CoreResult<Self> {
        let (buffer, staging) = match kind {
            BufferKind::HostVisible => (memory.create_buffer(size, usage, MemoryLocation::CpuToGpu, name)?, None),
            BufferKind::Staged => {
                let buffer = memory.create_buffer(
                    size,
                    usage | vk::BufferUsageFlags::TRANSFER_DST,
                    MemoryLocation::GpuOnly,
                    name,
                )?;
                let staging = memory.create_staging_buffer(size, &format!("{} staging", name))?;
                (buffer, Some(staging))
            }
        };

        let mapped = staging
            .as_ref()
            .unwrap_or(&buffer)
            .mapped()
            .ok_or_else(|| crate::error::CoreError::Allocation {
                name: name.to_string(),
                message: "host memory is not mapped".into(),
            })?;

        log::debug!("{}: {} bytes, {:?}", name, size, kind);
        Ok(Self {
            alloc: SubAllocator::new(name, buffer.handle, size, uniform_alignment, release_threshold, frames),
            kind,
            mapped,
            staging,
            buffer,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn allocator(&self) -> &SubAllocator {
        &self.alloc
    }

    pub fn acquire_buffer(&self, size: u64, uniform: bool) -> SubBuffer {
        self.alloc.acquire_buffer(size, uniform)
    }

    pub fn release_buffer(&self, sub: SubBuffer) {
        self.alloc.release_buffer(sub)
    }

    pub fn release_buffer_now(&self, sub: SubBuffer) {
        self.alloc.release_buffer_now(sub)
    }

    pub fn begin_frame(&self, frame: usize) {
        self.alloc.begin_frame(frame)
    }

    /// Write into a lease. The bytes are host-visible at once; for a staged
    /// pool the GPU sees them after the next `update`.
    pub fn write(&self, sub: &SubBuffer, offset: u64, data: &[u8]) -> bool {
        if sub.buffer != self.buffer.handle || !sub.fits(offset, data.len() as u64) {
            log::error!(
                "{}: write of {} bytes at +{} outside lease {:?}",
                self.alloc.name(),
                data.len(),
                offset,
                sub
            );
            return false;
        }
        // SAFETY: the lease is exclusively owned by the caller and lies
        // inside the persistently mapped range.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mapped.0.as_ptr().add((sub.offset + offset) as usize),
                data.len(),
            );
        }
        true
    }

    pub fn write_pod<T: bytemuck::Pod>(&self, sub: &SubBuffer, offset: u64, value: &T) -> bool {
        self.write(sub, offset, bytemuck::bytes_of(value))
    }

    /// Record the staging-to-device copy of the dirty prefix. No-op for
    /// host-visible pools or when nothing is leased.
    pub unsafe fn update(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        let Some(staging) = &self.staging else {
            return;
        };
        let Some(region) = prefix_copy(self.alloc.high_water()) else {
            return;
        };
        let size = region.size;
        device.cmd_copy_buffer(cmd, staging.handle, self.buffer.handle, &[region]);

        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(
                vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::INDEX_READ
                    | vk::AccessFlags::INDIRECT_COMMAND_READ
                    | vk::AccessFlags::UNIFORM_READ
                    | vk::AccessFlags::SHADER_READ,
            )
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.buffer.handle)
            .offset(0)
            .size(size);
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::VERTEX_INPUT
                | vk::PipelineStageFlags::DRAW_INDIRECT
                | vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[barrier],
            &[],
        );
    }

    pub fn stats(&self) -> BufferStats {
        self.alloc.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::time::{Duration, Instant};

    fn pool(capacity: u64, threshold: usize, frames: usize) -> SubAllocator {
        SubAllocator::new("test pool", vk::Buffer::from_raw(0x1000), capacity, 256, threshold, frames)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    // ============================================================
    // SubBuffer
    // ============================================================

    #[test]
    fn test_null_sub_buffer() {
        let null = SubBuffer::null();
        assert!(null.is_null());
        assert_eq!(SubBuffer::default(), null);
        assert!(!null.fits(0, 0));
    }

    #[test]
    fn test_fits() {
        let sub = SubBuffer { buffer: vk::Buffer::from_raw(1), offset: 512, size: 64, uniform: false };
        assert!(sub.fits(0, 64));
        assert!(sub.fits(60, 4));
        assert!(!sub.fits(61, 4));
        assert!(!sub.fits(u64::MAX, 2));
        let info = sub.descriptor_info();
        assert_eq!((info.offset, info.range), (512, 64));
    }

    // ============================================================
    // Acquire / release
    // ============================================================

    #[test]
    fn test_acquire_and_immediate_release() {
        let alloc = pool(4096, 64, 2);
        let a = alloc.acquire_buffer(100, false);
        assert!(!a.is_null());
        assert_eq!(a.buffer, vk::Buffer::from_raw(0x1000));
        alloc.release_buffer_now(a);
        let stats = alloc.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.free_regions, 1);
        assert!(!alloc.is_worker_running());
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let n = 4;
        let alloc = pool(256 * n, 64, 2);
        let blocks: Vec<_> = (0..n).map(|_| alloc.acquire_buffer(200, true)).collect();
        assert!(blocks.iter().all(|b| !b.is_null() && b.offset % 256 == 0));
        assert!(alloc.acquire_buffer(200, true).is_null());
        assert!(alloc.acquire_buffer(0, false).is_null());
    }

    #[test]
    fn test_null_release_is_noop() {
        let alloc = pool(1024, 64, 2);
        alloc.release_buffer(SubBuffer::null());
        alloc.release_buffer_now(SubBuffer::null());
        let stats = alloc.stats();
        assert_eq!(stats.retiring, 0);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_deferred_release_waits_for_frame_reuse() {
        let alloc = pool(1024, 64, 2);
        alloc.begin_frame(0);
        let a = alloc.acquire_buffer(1024, false);
        assert!(!a.is_null());

        alloc.release_buffer(a);
        assert_eq!(alloc.stats().retiring, 1);
        // Frame 0 may still be on the GPU; the bytes stay leased.
        assert!(alloc.acquire_buffer(4, false).is_null());

        alloc.begin_frame(1);
        assert!(alloc.acquire_buffer(4, false).is_null());

        // Frame slot 0 comes round again: its fence has been waited.
        alloc.begin_frame(0);
        assert_eq!(alloc.stats().retiring, 0);
        assert_eq!(alloc.stats().used, 0);
    }

    #[test]
    fn test_retire_all() {
        let alloc = pool(1024, 64, 3);
        let a = alloc.acquire_buffer(10, false);
        alloc.begin_frame(2);
        let b = alloc.acquire_buffer(10, false);
        alloc.release_buffer(a);
        alloc.release_buffer(b);
        alloc.retire_all();
        assert_eq!(alloc.stats().used, 0);
    }

    #[test]
    fn test_huge_acquire_returns_null() {
        let alloc = pool(1024, 64, 2);
        assert!(alloc.acquire_buffer(u64::MAX - 2, false).is_null());
        assert!(alloc.acquire_buffer(u64::MAX, true).is_null());
        assert!(!alloc.acquire_buffer(16, false).is_null());
    }

    // ============================================================
    // Staged update
    // ============================================================

    #[test]
    fn test_update_copies_prefix_below_high_water() {
        let alloc = pool(4096, 64, 2);
        assert_eq!(alloc.high_water(), 0);
        assert!(prefix_copy(alloc.high_water()).is_none());

        let a = alloc.acquire_buffer(100, false);
        let b = alloc.acquire_buffer(64, false);
        let top = (a.offset + a.size).max(b.offset + b.size);
        let copy = prefix_copy(alloc.high_water()).unwrap();
        assert_eq!((copy.src_offset, copy.dst_offset), (0, 0));
        assert_eq!(copy.size, alloc.high_water());
        assert!(copy.size >= top);
        assert!(copy.size < 4096);
    }

    // ============================================================
    // Release queue and thread
    // ============================================================

    #[test]
    fn test_contended_release_is_queued_then_drained_by_acquire() {
        let alloc = pool(1024, 64, 1);
        let a = alloc.acquire_buffer(512, false);
        {
            let _held = alloc.shared.regions.lock();
            alloc.release_buffer_now(a);
        }
        assert_eq!(alloc.stats().pending, 1);
        assert!(!alloc.is_worker_running());
        // The next acquire coalesces the queued region first.
        let b = alloc.acquire_buffer(1024, false);
        assert!(!b.is_null());
        assert_eq!(alloc.stats().pending, 0);
    }

    #[test]
    fn test_release_thread_starts_at_threshold() {
        let alloc = pool(4096, 3, 1);
        let subs: Vec<_> = (0..4).map(|_| alloc.acquire_buffer(1024, false)).collect();
        {
            let _held = alloc.shared.regions.lock();
            for &s in &subs[..3] {
                alloc.release_buffer_now(s);
            }
            assert!(alloc.is_worker_running());
        }
        assert!(wait_until(|| alloc.stats().pending == 0));

        // With the thread running every release goes through the queue.
        alloc.release_buffer_now(subs[3]);
        assert!(wait_until(|| alloc.stats().used == 0));
        assert_eq!(alloc.stats().free_regions, 1);
    }

    #[test]
    fn test_concurrent_acquire_release_never_overlaps() {
        let alloc = Arc::new(pool(1 << 20, 8, 1));
        std::thread::scope(|scope| {
            for t in 0..4u64 {
                let alloc = alloc.clone();
                scope.spawn(move || {
                    let mut held = Vec::new();
                    for i in 0..500u64 {
                        let sub = alloc.acquire_buffer(16 + (i * 7 + t) % 500, i % 3 == 0);
                        assert!(!sub.is_null());
                        held.push(sub);
                        if held.len() > 8 {
                            alloc.release_buffer_now(held.remove(0));
                        }
                    }
                    for sub in held {
                        alloc.release_buffer_now(sub);
                    }
                });
            }
        });
        assert!(wait_until(|| {
            alloc.flush();
            alloc.stats().used == 0
        }));
        let stats = alloc.stats();
        assert_eq!(stats.free_regions, 1);
        assert_eq!(stats.largest_free, 1 << 20);
    }
}
