//! Uniform blocks leased from the host-visible uniform pool.
//!
//! A plain uniform is one block. A virtual uniform packs `count` instances
//! at the device's dynamic-offset alignment in one lease; the instance is
//! picked at bind time with a dynamic offset. Frame-varying parameters use a
//! virtual uniform with one instance per frame in flight.

use std::sync::Arc;

use ash::vk;

use super::buffer_mgr::{BufferMgr, SubBuffer};
use super::region::align_up;
use crate::error::{CoreError, CoreResult};

pub struct Uniform {
    pool: Arc<BufferMgr>,
    sub: SubBuffer,
    block_size: u64,
    stride: u64,
    count: u32,
    dynamic: bool,
}

impl Uniform {
    pub fn new(pool: &Arc<BufferMgr>, block_size: u64) -> CoreResult<Self> {
        Self::with_instances(pool, block_size, 1, false)
    }

    pub fn new_virtual(pool: &Arc<BufferMgr>, block_size: u64, count: u32) -> CoreResult<Self> {
        Self::with_instances(pool, block_size, count, true)
    }

    fn with_instances(pool: &Arc<BufferMgr>, block_size: u64, count: u32, is_virtual: bool) -> CoreResult<Self> {
        if block_size == 0 || count == 0 {
            return Err(CoreError::Misuse(format!("uniform of {} x {} bytes", count, block_size)));
        }
        let alignment = pool.allocator().uniform_alignment();
        let stride = if is_virtual { align_up(block_size, alignment) } else { Some(block_size) };
        let Some((stride, size)) = stride.and_then(|stride| Some((stride, stride.checked_mul(count as u64)?))) else {
            return Err(CoreError::Misuse(format!("uniform of {} x {} bytes overflows", count, block_size)));
        };

        let sub = pool.acquire_buffer(size, true);
        if sub.is_null() {
            return Err(CoreError::Allocation {
                name: "uniform".into(),
                message: format!("uniform pool exhausted ({} bytes)", size),
            });
        }
        Ok(Self { pool: pool.clone(), sub, block_size, stride, count, dynamic: is_virtual })
    }

    pub fn is_virtual(&self) -> bool {
        self.dynamic
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn sub_buffer(&self) -> &SubBuffer {
        &self.sub
    }

    pub fn write<T: bytemuck::Pod>(&self, value: &T) -> bool {
        self.write_instance(0, value)
    }

    pub fn write_instance<T: bytemuck::Pod>(&self, instance: u32, value: &T) -> bool {
        self.write_bytes(instance, bytemuck::bytes_of(value))
    }

    pub fn write_bytes(&self, instance: u32, bytes: &[u8]) -> bool {
        if instance >= self.count || bytes.len() as u64 > self.block_size {
            log::error!(
                "Uniform write of {} bytes to instance {} (block {} x {})",
                bytes.len(),
                instance,
                self.count,
                self.block_size
            );
            return false;
        }
        self.pool.write(&self.sub, instance as u64 * self.stride, bytes)
    }

    /// Offset to pass at bind time for `instance`.
    pub fn dynamic_offset(&self, instance: u32) -> u32 {
        instance_offset(self.stride, instance % self.count.max(1))
    }

    /// One block; virtual uniforms are bound as dynamic buffers so the
    /// range covers a single instance.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo { buffer: self.sub.buffer, offset: self.sub.offset, range: self.block_size }
    }

    pub fn descriptor_type(&self) -> vk::DescriptorType {
        if self.is_virtual() {
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        } else {
            vk::DescriptorType::UNIFORM_BUFFER
        }
    }
}

impl Drop for Uniform {
    fn drop(&mut self) {
        // Frames in flight may still read it.
        self.pool.release_buffer(self.sub);
    }
}

pub fn instance_offset(stride: u64, instance: u32) -> u32 {
    (stride * instance as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_stride_is_aligned() {
        assert_eq!(align_up(80, 256), Some(256));
        assert_eq!(align_up(256, 256), Some(256));
        assert_eq!(align_up(300, 64), Some(320));
        assert_eq!(align_up(u64::MAX - 10, 256), None);
    }

    #[test]
    fn test_instance_offsets() {
        let stride = align_up(80, 256).unwrap();
        let offsets: Vec<u32> = (0..3).map(|i| instance_offset(stride, i)).collect();
        assert_eq!(offsets, vec![0, 256, 512]);
        assert!(offsets.iter().all(|o| o % 256 == 0));
    }
}
