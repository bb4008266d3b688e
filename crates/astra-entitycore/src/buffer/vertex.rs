//! Typed vertex/index buffers.
//!
//! A `VertexArray` declares the interleaved layout (one binding per input
//! rate) and builds `VertexBuffer`s / `IndexBuffer`s for it. Storage depends
//! on the access pattern:
//!
//! | access    | storage                         | GPU copy              |
//! |-----------|---------------------------------|-----------------------|
//! | `Static`  | device-local + staging          | `update`, then detach |
//! | `Dynamic` | device-local + staging          | `update` when changed |
//! | `Stream`  | a `SubBuffer` of the stream pool| none                  |

use std::ops::Range;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::buffer_mgr::{BufferMgr, SubBuffer};
use crate::error::{CoreError, CoreResult};
use crate::vulkan::memory::{GpuBuffer, MemoryManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    Static,
    Dynamic,
    Stream,
}

/// One attribute of an interleaved vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    Float,
    Vec2,
    Vec3,
    Vec4,
    UInt,
    UVec2,
    UVec4,
    /// RGBA8, normalized to [0, 1] in the shader.
    Color,
}

impl BufferType {
    pub const fn size(self) -> u32 {
        match self {
            BufferType::Float | BufferType::UInt | BufferType::Color => 4,
            BufferType::Vec2 | BufferType::UVec2 => 8,
            BufferType::Vec3 => 12,
            BufferType::Vec4 | BufferType::UVec4 => 16,
        }
    }

    pub const fn format(self) -> vk::Format {
        match self {
            BufferType::Float => vk::Format::R32_SFLOAT,
            BufferType::Vec2 => vk::Format::R32G32_SFLOAT,
            BufferType::Vec3 => vk::Format::R32G32B32_SFLOAT,
            BufferType::Vec4 => vk::Format::R32G32B32A32_SFLOAT,
            BufferType::UInt => vk::Format::R32_UINT,
            BufferType::UVec2 => vk::Format::R32G32_UINT,
            BufferType::UVec4 => vk::Format::R32G32B32A32_UINT,
            BufferType::Color => vk::Format::R8G8B8A8_UNORM,
        }
    }
}

// ============================================================
// Layout
// ============================================================

/// Interleaved attributes of one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub rate: vk::VertexInputRate,
    attributes: Vec<BufferType>,
    offsets: Vec<u32>,
    stride: u32,
}

impl VertexLayout {
    pub fn new(rate: vk::VertexInputRate) -> Self {
        Self { rate, attributes: Vec::new(), offsets: Vec::new(), stride: 0 }
    }

    /// Append an attribute; returns its byte offset in the vertex.
    pub fn push(&mut self, ty: BufferType) -> u32 {
        let offset = self.stride;
        self.attributes.push(ty);
        self.offsets.push(offset);
        self.stride += ty.size();
        offset
    }

    pub fn with(mut self, ty: BufferType) -> Self {
        self.push(ty);
        self
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn attributes(&self) -> &[BufferType] {
        &self.attributes
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn binding_description(&self, binding: u32) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription { binding, stride: self.stride, input_rate: self.rate }
    }

    /// Attribute descriptions with consecutive locations from `first_location`.
    pub fn attribute_descriptions(&self, binding: u32, first_location: u32) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .zip(&self.offsets)
            .enumerate()
            .map(|(i, (ty, &offset))| vk::VertexInputAttributeDescription {
                location: first_location + i as u32,
                binding,
                format: ty.format(),
                offset,
            })
            .collect()
    }
}

/// Element range touched by writing `len` bytes at element `first`.
/// `None` when the bytes aren't a whole number of elements or overflow
/// `capacity` elements.
pub fn element_range(stride: u32, capacity: u32, first: u32, len: usize) -> Option<Range<u32>> {
    if stride == 0 || len % stride as usize != 0 {
        return None;
    }
    let count = u32::try_from(len / stride as usize).ok()?;
    let end = first.checked_add(count)?;
    (end <= capacity).then_some(first..end)
}

/// Add the base vertex of a shared buffer to every index. `None` when a
/// biased index doesn't fit a `u32`.
pub fn bias_indices(indices: &[u32], bias: u32) -> Option<Vec<u32>> {
    indices.iter().map(|&i| i.checked_add(bias)).collect()
}

fn merge_range(dirty: &mut Option<Range<u64>>, bytes: Range<u64>) {
    *dirty = Some(match dirty.take() {
        Some(d) => d.start.min(bytes.start)..d.end.max(bytes.end),
        None => bytes,
    });
}

// ============================================================
// Storage shared by vertex and index buffers
// ============================================================

/// Memory behind a vertex or index buffer.
trait Storage {
    /// Write into the host-visible half. False when the write failed.
    fn write(&mut self, offset: u64, bytes: &[u8]) -> bool;
    /// Writes reach the GPU only through a staging copy.
    fn is_staged(&self) -> bool;
    fn is_detached(&self) -> bool;
    /// Drop the staging half. False when there is none.
    fn drop_staging(&mut self) -> bool;
    /// Source and destination of the staging copy, if there is one.
    fn copy_handles(&self) -> Option<(vk::Buffer, vk::Buffer)>;
    fn handle_and_offset(&self) -> (vk::Buffer, u64);
}

enum GpuStorage {
    Owned { device: GpuBuffer, staging: Option<GpuBuffer> },
    Stream { pool: Arc<BufferMgr>, sub: SubBuffer },
}

impl Storage for GpuStorage {
    fn write(&mut self, offset: u64, bytes: &[u8]) -> bool {
        match self {
            GpuStorage::Stream { pool, sub } => pool.write(sub, offset, bytes),
            GpuStorage::Owned { staging: Some(staging), .. } => staging.write_bytes(offset, bytes),
            GpuStorage::Owned { staging: None, .. } => false,
        }
    }

    fn is_staged(&self) -> bool {
        matches!(self, GpuStorage::Owned { .. })
    }

    fn is_detached(&self) -> bool {
        matches!(self, GpuStorage::Owned { staging: None, .. })
    }

    fn drop_staging(&mut self) -> bool {
        match self {
            GpuStorage::Owned { staging, .. } => staging.take().is_some(),
            GpuStorage::Stream { .. } => false,
        }
    }

    fn copy_handles(&self) -> Option<(vk::Buffer, vk::Buffer)> {
        match self {
            GpuStorage::Owned { device, staging: Some(staging) } => Some((staging.handle, device.handle)),
            _ => None,
        }
    }

    fn handle_and_offset(&self) -> (vk::Buffer, u64) {
        match self {
            GpuStorage::Owned { device, .. } => (device.handle, 0),
            GpuStorage::Stream { sub, .. } => (sub.buffer, sub.offset),
        }
    }
}

impl Drop for GpuStorage {
    fn drop(&mut self) {
        if let GpuStorage::Stream { pool, sub } = self {
            pool.release_buffer(*sub);
        }
    }
}

struct RawBuffer<S: Storage = GpuStorage> {
    name: String,
    access: BufferAccess,
    stride: u32,
    capacity: u32,
    storage: S,
    /// Bytes written to staging and not yet copied.
    dirty: Option<Range<u64>>,
}

impl RawBuffer<GpuStorage> {
    unsafe fn new(
        memory: &MemoryManager,
        stream_pool: Option<&Arc<BufferMgr>>,
        name: &str,
        usage: vk::BufferUsageFlags,
        stride: u32,
        capacity: u32,
        access: BufferAccess,
    ) -> CoreResult<Self> {
        let size = stride as u64 * capacity as u64;
        let storage = match access {
            BufferAccess::Stream => {
                let pool = stream_pool.ok_or_else(|| CoreError::Misuse(format!("{}: no stream pool", name)))?;
                let sub = pool.acquire_buffer(size, false);
                if sub.is_null() {
                    return Err(CoreError::Allocation {
                        name: name.to_string(),
                        message: format!("stream pool exhausted ({} bytes)", size),
                    });
                }
                GpuStorage::Stream { pool: pool.clone(), sub }
            }
            BufferAccess::Static | BufferAccess::Dynamic => {
                let device = memory.create_buffer(
                    size,
                    usage | vk::BufferUsageFlags::TRANSFER_DST,
                    MemoryLocation::GpuOnly,
                    name,
                )?;
                let staging = memory.create_staging_buffer(size, &format!("{} staging", name))?;
                GpuStorage::Owned { device, staging: Some(staging) }
            }
        };
        Ok(RawBuffer::with_storage(name, access, stride, capacity, storage))
    }

    unsafe fn update(&mut self, device: &ash::Device, cmd: vk::CommandBuffer, dst_access: vk::AccessFlags) -> bool {
        let Some((src, dst, copy)) = self.take_copy() else {
            return false;
        };
        device.cmd_copy_buffer(cmd, src, dst, &[copy]);

        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(dst)
            .offset(copy.dst_offset)
            .size(copy.size);
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::DependencyFlags::empty(),
            &[],
            &[barrier],
            &[],
        );
        true
    }
}

impl<S: Storage> RawBuffer<S> {
    fn with_storage(name: &str, access: BufferAccess, stride: u32, capacity: u32, storage: S) -> Self {
        Self { name: name.to_string(), access, stride, capacity, storage, dirty: None }
    }

    fn fill_bytes(&mut self, first: u32, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        let Some(range) = element_range(self.stride, self.capacity, first, bytes.len()) else {
            log::error!(
                "{}: {} bytes at element {} don't fit {} x {} bytes",
                self.name,
                bytes.len(),
                first,
                self.capacity,
                self.stride
            );
            return false;
        };
        if self.storage.is_detached() {
            log::error!("{}: write to a detached static buffer ignored", self.name);
            return false;
        }
        let offset = range.start as u64 * self.stride as u64;
        if !self.storage.write(offset, bytes) {
            return false;
        }
        if self.storage.is_staged() {
            merge_range(&mut self.dirty, offset..offset + bytes.len() as u64);
        }
        true
    }

    fn fill_biased(&mut self, first: u32, indices: &[u32], bias: u32) -> bool {
        if bias == 0 {
            return self.fill_bytes(first, bytemuck::cast_slice(indices));
        }
        match bias_indices(indices, bias) {
            Some(biased) => self.fill_bytes(first, bytemuck::cast_slice(&biased)),
            None => {
                log::error!("{}: indices biased by {} overflow u32", self.name, bias);
                false
            }
        }
    }

    /// The staging copy `update` records; consumes the dirty range.
    fn take_copy(&mut self) -> Option<(vk::Buffer, vk::Buffer, vk::BufferCopy)> {
        let (src, dst) = self.storage.copy_handles()?;
        let dirty = self.dirty.take()?;
        if dirty.is_empty() {
            return None;
        }
        Some((src, dst, vk::BufferCopy { src_offset: dirty.start, dst_offset: dirty.start, size: dirty.end - dirty.start }))
    }

    fn detach(&mut self) -> bool {
        if self.access != BufferAccess::Static {
            log::warn!("{}: only static buffers can be detached", self.name);
            return false;
        }
        if self.dirty.is_some() {
            log::warn!("{}: detach with un-uploaded writes ignored", self.name);
            return false;
        }
        self.storage.drop_staging()
    }

    fn handle_and_offset(&self) -> (vk::Buffer, u64) {
        self.storage.handle_and_offset()
    }

    fn is_detached(&self) -> bool {
        self.storage.is_detached()
    }
}

// ============================================================
// Vertex / index buffers
// ============================================================

/// A sub-range of a shared vertex buffer handed to one logical object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexView {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub first_vertex: u32,
    pub vertex_count: u32,
}

pub struct VertexBuffer {
    layout: VertexLayout,
    raw: RawBuffer,
}

impl VertexBuffer {
    pub fn layout(&self) -> &VertexLayout {
        &self.layout
    }

    pub fn access(&self) -> BufferAccess {
        self.raw.access
    }

    pub fn capacity(&self) -> u32 {
        self.raw.capacity
    }

    /// Write whole vertices starting at vertex `first`.
    pub fn fill<T: bytemuck::Pod>(&mut self, first: u32, vertices: &[T]) -> bool {
        self.raw.fill_bytes(first, bytemuck::cast_slice(vertices))
    }

    pub fn fill_bytes(&mut self, first: u32, bytes: &[u8]) -> bool {
        self.raw.fill_bytes(first, bytes)
    }

    /// Record the staging copy of everything written since the last update.
    /// Returns false when there was nothing to copy.
    pub unsafe fn update(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) -> bool {
        self.raw.update(device, cmd, vk::AccessFlags::VERTEX_ATTRIBUTE_READ)
    }

    /// Drop the staging half of a static buffer for good.
    ///
    /// # Safety
    /// The command buffer holding the last `update` copy must have finished.
    pub unsafe fn detach(&mut self) -> bool {
        self.raw.detach()
    }

    pub fn is_detached(&self) -> bool {
        self.raw.is_detached()
    }

    /// Hand `count` vertices starting at `first` to a sub-object.
    pub fn assign(&self, first: u32, count: u32) -> Option<VertexView> {
        let end = first.checked_add(count)?;
        if end > self.raw.capacity {
            log::error!("{}: assign {}..{} past {} vertices", self.raw.name, first, end, self.raw.capacity);
            return None;
        }
        let (buffer, offset) = self.raw.handle_and_offset();
        Some(VertexView { buffer, offset, first_vertex: first, vertex_count: count })
    }

    /// Buffer handle and byte offset for `cmd_bind_vertex_buffers`.
    pub fn binding(&self) -> (vk::Buffer, u64) {
        self.raw.handle_and_offset()
    }
}

pub struct IndexBuffer {
    raw: RawBuffer,
}

impl IndexBuffer {
    pub const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT32;

    pub fn capacity(&self) -> u32 {
        self.raw.capacity
    }

    /// Write indices at index `first`, relative to vertex 0 of the buffer.
    pub fn fill(&mut self, first: u32, indices: &[u32]) -> bool {
        self.raw.fill_bytes(first, bytemuck::cast_slice(indices))
    }

    /// Write indices relative to an assigned sub-range; the view's first
    /// vertex is added to each index.
    pub fn fill_for(&mut self, view: &VertexView, first: u32, indices: &[u32]) -> bool {
        self.raw.fill_biased(first, indices, view.first_vertex)
    }

    pub unsafe fn update(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) -> bool {
        self.raw.update(device, cmd, vk::AccessFlags::INDEX_READ)
    }

    /// # Safety
    /// Same contract as [`VertexBuffer::detach`].
    pub unsafe fn detach(&mut self) -> bool {
        self.raw.detach()
    }

    pub fn binding(&self) -> (vk::Buffer, u64) {
        self.raw.handle_and_offset()
    }
}

// ============================================================
// VertexArray: layout declaration and buffer factory
// ============================================================

/// Binding 0 is per-vertex data, binding 1 per-instance data (if any).
#[derive(Debug, Clone)]
pub struct VertexArray {
    vertex: VertexLayout,
    instance: VertexLayout,
}

impl Default for VertexArray {
    fn default() -> Self {
        Self::new()
    }
}

impl VertexArray {
    pub const VERTEX_BINDING: u32 = 0;
    pub const INSTANCE_BINDING: u32 = 1;

    pub fn new() -> Self {
        Self {
            vertex: VertexLayout::new(vk::VertexInputRate::VERTEX),
            instance: VertexLayout::new(vk::VertexInputRate::INSTANCE),
        }
    }

    /// Declare the next attribute. Returns its shader location.
    pub fn register_vertex_buffer(&mut self, ty: BufferType, rate: vk::VertexInputRate) -> u32 {
        if rate == vk::VertexInputRate::INSTANCE {
            self.instance.push(ty);
            (self.vertex.attributes().len() + self.instance.attributes().len() - 1) as u32
        } else {
            if !self.instance.is_empty() {
                log::warn!("Vertex attribute declared after instance attributes; locations shift");
            }
            self.vertex.push(ty);
            (self.vertex.attributes().len() - 1) as u32
        }
    }

    pub fn vertex_layout(&self) -> &VertexLayout {
        &self.vertex
    }

    pub fn instance_layout(&self) -> &VertexLayout {
        &self.instance
    }

    pub fn binding_descriptions(&self) -> Vec<vk::VertexInputBindingDescription> {
        let mut out = Vec::with_capacity(2);
        if !self.vertex.is_empty() {
            out.push(self.vertex.binding_description(Self::VERTEX_BINDING));
        }
        if !self.instance.is_empty() {
            out.push(self.instance.binding_description(Self::INSTANCE_BINDING));
        }
        out
    }

    pub fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        let mut out = self.vertex.attribute_descriptions(Self::VERTEX_BINDING, 0);
        out.extend(
            self.instance
                .attribute_descriptions(Self::INSTANCE_BINDING, self.vertex.attributes().len() as u32),
        );
        out
    }

    pub unsafe fn create_buffer(
        &self,
        memory: &MemoryManager,
        stream_pool: Option<&Arc<BufferMgr>>,
        name: &str,
        rate: vk::VertexInputRate,
        capacity: u32,
        access: BufferAccess,
    ) -> CoreResult<VertexBuffer> {
        let layout = if rate == vk::VertexInputRate::INSTANCE { &self.instance } else { &self.vertex };
        if layout.is_empty() {
            return Err(CoreError::Misuse(format!("{}: no attributes registered for {:?}", name, rate)));
        }
        let raw = RawBuffer::new(
            memory,
            stream_pool,
            name,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            layout.stride(),
            capacity,
            access,
        )?;
        Ok(VertexBuffer { layout: layout.clone(), raw })
    }

    pub unsafe fn create_index_buffer(
        &self,
        memory: &MemoryManager,
        stream_pool: Option<&Arc<BufferMgr>>,
        name: &str,
        capacity: u32,
        access: BufferAccess,
    ) -> CoreResult<IndexBuffer> {
        let raw = RawBuffer::new(
            memory,
            stream_pool,
            name,
            vk::BufferUsageFlags::INDEX_BUFFER,
            std::mem::size_of::<u32>() as u32,
            capacity,
            access,
        )?;
        Ok(IndexBuffer { raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    // ============================================================
    // Layout
    // ============================================================

    #[test]
    fn test_layout_offsets_and_stride() {
        let layout = VertexLayout::new(vk::VertexInputRate::VERTEX)
            .with(BufferType::Vec3)
            .with(BufferType::Vec2)
            .with(BufferType::Color)
            .with(BufferType::Vec3);
        assert_eq!(layout.offsets(), &[0, 12, 20, 24]);
        assert_eq!(layout.stride(), 36);

        let attrs = layout.attribute_descriptions(0, 0);
        assert_eq!(attrs.len(), 4);
        assert_eq!(attrs[2].format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(attrs[3].location, 3);
        assert_eq!(attrs[3].offset, 24);
    }

    #[test]
    fn test_vertex_array_locations_span_bindings() {
        let mut va = VertexArray::new();
        assert_eq!(va.register_vertex_buffer(BufferType::Vec3, vk::VertexInputRate::VERTEX), 0);
        assert_eq!(va.register_vertex_buffer(BufferType::Vec2, vk::VertexInputRate::VERTEX), 1);
        assert_eq!(va.register_vertex_buffer(BufferType::Vec4, vk::VertexInputRate::INSTANCE), 2);
        assert_eq!(va.register_vertex_buffer(BufferType::Float, vk::VertexInputRate::INSTANCE), 3);

        let bindings = va.binding_descriptions();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].stride, 20);
        assert_eq!(bindings[1].stride, 20);
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);

        let attrs = va.attribute_descriptions();
        let locations: Vec<u32> = attrs.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1, 2, 3]);
        assert_eq!(attrs[2].binding, VertexArray::INSTANCE_BINDING);
        assert_eq!(attrs[3].offset, 16);
    }

    #[test]
    fn test_vertex_only_array_has_one_binding() {
        let mut va = VertexArray::new();
        va.register_vertex_buffer(BufferType::Vec2, vk::VertexInputRate::VERTEX);
        assert_eq!(va.binding_descriptions().len(), 1);
    }

    // ============================================================
    // Fill ranges and index bias
    // ============================================================

    #[test]
    fn test_element_range() {
        assert_eq!(element_range(12, 10, 0, 36), Some(0..3));
        assert_eq!(element_range(12, 10, 7, 36), Some(7..10));
        assert_eq!(element_range(12, 10, 8, 36), None);
        assert_eq!(element_range(12, 10, 0, 13), None);
        assert_eq!(element_range(0, 10, 0, 0), None);
        assert_eq!(element_range(4, 10, u32::MAX, 4), None);
    }

    #[test]
    fn test_bias_indices() {
        assert_eq!(bias_indices(&[0, 1, 2, 2, 3, 0], 100), Some(vec![100, 101, 102, 102, 103, 100]));
        assert_eq!(bias_indices(&[], 5), Some(vec![]));
    }

    #[test]
    fn test_bias_indices_overflow() {
        assert_eq!(bias_indices(&[u32::MAX], 1), None);
        assert_eq!(bias_indices(&[0, u32::MAX - 1], 1), Some(vec![1, u32::MAX]));
    }

    #[test]
    fn test_dirty_range_merges() {
        let mut dirty = None;
        merge_range(&mut dirty, 64..128);
        merge_range(&mut dirty, 0..16);
        merge_range(&mut dirty, 100..200);
        assert_eq!(dirty, Some(0..200));
    }

    // ============================================================
    // Fill and copy against in-memory storage
    // ============================================================

    /// Host bytes standing in for the staging buffer or a stream lease.
    struct MemStorage {
        bytes: Vec<u8>,
        stream: bool,
        staging: bool,
    }

    impl MemStorage {
        fn owned(size: usize) -> Self {
            Self { bytes: vec![0; size], stream: false, staging: true }
        }

        fn stream(size: usize) -> Self {
            Self { bytes: vec![0; size], stream: true, staging: false }
        }
    }

    impl Storage for MemStorage {
        fn write(&mut self, offset: u64, bytes: &[u8]) -> bool {
            if !self.stream && !self.staging {
                return false;
            }
            let start = offset as usize;
            self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
            true
        }

        fn is_staged(&self) -> bool {
            !self.stream
        }

        fn is_detached(&self) -> bool {
            !self.stream && !self.staging
        }

        fn drop_staging(&mut self) -> bool {
            !self.stream && std::mem::take(&mut self.staging)
        }

        fn copy_handles(&self) -> Option<(vk::Buffer, vk::Buffer)> {
            self.staging.then(|| (vk::Buffer::from_raw(1), vk::Buffer::from_raw(2)))
        }

        fn handle_and_offset(&self) -> (vk::Buffer, u64) {
            if self.stream {
                (vk::Buffer::from_raw(3), 256)
            } else {
                (vk::Buffer::from_raw(2), 0)
            }
        }
    }

    fn mem_buffer(access: BufferAccess, storage: MemStorage) -> RawBuffer<MemStorage> {
        RawBuffer::with_storage("test", access, 4, 16, storage)
    }

    #[test]
    fn test_staged_fill_copies_dirty_range() {
        let mut raw = mem_buffer(BufferAccess::Dynamic, MemStorage::owned(64));
        assert!(raw.fill_bytes(2, &[1; 8]));
        assert!(raw.fill_bytes(6, &[2; 4]));
        assert_eq!(&raw.storage.bytes[8..16], &[1; 8]);

        let (src, dst, copy) = raw.take_copy().unwrap();
        assert_eq!((src.as_raw(), dst.as_raw()), (1, 2));
        assert_eq!((copy.src_offset, copy.dst_offset, copy.size), (8, 8, 20));
        assert!(raw.take_copy().is_none());
    }

    #[test]
    fn test_empty_fill_records_no_copy() {
        let mut raw = mem_buffer(BufferAccess::Dynamic, MemStorage::owned(64));
        assert!(raw.fill_bytes(3, &[]));
        assert!(raw.dirty.is_none());
        assert!(raw.take_copy().is_none());

        // An empty range left behind never becomes a zero-size copy.
        raw.dirty = Some(16..16);
        assert!(raw.take_copy().is_none());
    }

    #[test]
    fn test_static_detach_after_upload() {
        let mut raw = mem_buffer(BufferAccess::Static, MemStorage::owned(64));
        assert!(raw.fill_bytes(0, &[7; 16]));

        // Pending writes must be copied before the staging half can go.
        assert!(!raw.detach());
        assert!(!raw.is_detached());
        assert!(raw.take_copy().is_some());
        assert!(raw.detach());
        assert!(raw.is_detached());
        assert!(!raw.detach());
    }

    #[test]
    fn test_fill_on_detached_static_buffer_is_ignored() {
        let mut raw = mem_buffer(BufferAccess::Static, MemStorage::owned(64));
        assert!(raw.detach());
        assert!(!raw.fill_bytes(0, &[9; 4]));
        assert!(raw.dirty.is_none());
        assert!(raw.take_copy().is_none());
        assert_eq!(&raw.storage.bytes[0..4], &[0; 4]);
    }

    #[test]
    fn test_only_static_buffers_detach() {
        let mut raw = mem_buffer(BufferAccess::Dynamic, MemStorage::owned(64));
        assert!(!raw.detach());
        let mut raw = mem_buffer(BufferAccess::Stream, MemStorage::stream(64));
        assert!(!raw.detach());
    }

    #[test]
    fn test_stream_writes_land_without_copy() {
        let mut raw = mem_buffer(BufferAccess::Stream, MemStorage::stream(64));
        assert!(raw.fill_bytes(1, &[5; 8]));
        assert_eq!(&raw.storage.bytes[4..12], &[5; 8]);
        assert!(raw.dirty.is_none());
        assert!(raw.take_copy().is_none());
        let (buffer, offset) = raw.handle_and_offset();
        assert_eq!((buffer.as_raw(), offset), (3, 256));
    }

    #[test]
    fn test_fill_past_capacity_is_refused() {
        let mut raw = mem_buffer(BufferAccess::Dynamic, MemStorage::owned(64));
        assert!(!raw.fill_bytes(15, &[1; 8]));
        assert!(!raw.fill_bytes(0, &[1; 3]));
        assert!(raw.dirty.is_none());
    }

    #[test]
    fn test_biased_fill() {
        let mut raw = mem_buffer(BufferAccess::Dynamic, MemStorage::owned(64));
        assert!(raw.fill_biased(0, &[0, 1, 2], 10));
        let expected: &[u8] = bytemuck::cast_slice(&[10u32, 11, 12]);
        assert_eq!(&raw.storage.bytes[0..12], expected);

        assert!(!raw.fill_biased(4, &[u32::MAX], 1));
        assert_eq!(&raw.storage.bytes[16..20], &[0; 4]);
    }
}
