//! Descriptor pool management.
//!
//! Sets are allocated from the newest pool. When it runs dry (out of pool
//! memory or fragmented) one more pool is created and the allocation retried
//! once; a second failure is returned to the caller. Freed sets are parked
//! per frame and only handed back to their pool when the frame slot is
//! reused, since in-flight command buffers may still reference them.

use ash::vk;
use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::vulkan::{RetireRing, Vulkan};

/// Descriptors reserved per set, per type, when sizing a pool.
const POOL_SIZES: [(vk::DescriptorType, u32); 5] = [
    (vk::DescriptorType::UNIFORM_BUFFER, 4),
    (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 2),
    (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4),
    (vk::DescriptorType::STORAGE_BUFFER, 1),
    (vk::DescriptorType::STORAGE_IMAGE, 1),
];

/// Run `try_alloc`; if the pool is exhausted, `extend` once and retry once.
pub fn allocate_with_extension<S, T>(
    state: &mut S,
    mut try_alloc: impl FnMut(&S) -> Result<T, vk::Result>,
    extend: impl FnOnce(&mut S) -> CoreResult<()>,
) -> CoreResult<T> {
    match try_alloc(state) {
        Ok(value) => Ok(value),
        Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
            extend(state)?;
            try_alloc(state).map_err(|e| {
                log::error!("Descriptor set allocation failed after pool extension: {:?}", e);
                CoreError::vk("Failed to allocate descriptor set", e)
            })
        }
        Err(e) => Err(CoreError::vk("Failed to allocate descriptor set", e)),
    }
}

pub struct SetMgr {
    pools: Mutex<Vec<vk::DescriptorPool>>,
    retired: RetireRing<(vk::DescriptorPool, vk::DescriptorSet)>,
    sets_per_pool: u32,
    device: ash::Device,
}

impl SetMgr {
    pub unsafe fn new(ctx: &Vulkan, sets_per_pool: u32, frames: usize) -> CoreResult<Self> {
        let sets_per_pool = sets_per_pool.max(1);
        let first = Self::create_pool(&ctx.device, sets_per_pool)?;
        Ok(Self {
            pools: Mutex::new(vec![first]),
            retired: RetireRing::new(frames),
            sets_per_pool,
            device: ctx.device.clone(),
        })
    }

    unsafe fn create_pool(device: &ash::Device, sets: u32) -> CoreResult<vk::DescriptorPool> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = POOL_SIZES
            .iter()
            .map(|&(ty, per_set)| vk::DescriptorPoolSize { ty, descriptor_count: per_set * sets })
            .collect();

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(sets)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        device
            .create_descriptor_pool(&pool_info, None)
            .map_err(|e| CoreError::vk("Failed to create descriptor pool", e))
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Allocate one set; returns the owning pool with it.
    pub unsafe fn allocate(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> CoreResult<(vk::DescriptorPool, vk::DescriptorSet)> {
        let mut pools = self.pools.lock();
        let layouts = [layout];

        allocate_with_extension(
            &mut *pools,
            |pools| {
                let pool = pools.last().copied().unwrap_or_default();
                let alloc_info = vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(&layouts);
                self.device.allocate_descriptor_sets(&alloc_info).map(|sets| (pool, sets[0]))
            },
            |pools| {
                let pool = Self::create_pool(&self.device, self.sets_per_pool)?;
                pools.push(pool);
                log::debug!("Descriptor pool {} created", pools.len());
                Ok(())
            },
        )
    }

    /// Free once the current frame slot has been waited.
    pub fn release(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        self.retired.push((pool, set));
    }

    pub unsafe fn begin_frame(&self, frame: usize) {
        let sets = self.retired.begin_frame(frame);
        self.free_now(&sets);
    }

    unsafe fn free_now(&self, sets: &[(vk::DescriptorPool, vk::DescriptorSet)]) {
        for &(pool, set) in sets {
            if let Err(e) = self.device.free_descriptor_sets(pool, &[set]) {
                log::error!("Failed to free descriptor set: {:?}", e);
            }
        }
    }

    /// Free every parked set. The device must be idle.
    pub unsafe fn retire_all(&self) {
        let all = self.retired.take_all();
        self.free_now(&all);
    }
}

impl Drop for SetMgr {
    fn drop(&mut self) {
        unsafe {
            for pool in self.pools.lock().drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_succeeds_without_extension() {
        let mut extensions = 0u32;
        let result = allocate_with_extension(
            &mut extensions,
            |_| Ok::<_, vk::Result>(7),
            |ext| {
                *ext += 1;
                Ok(())
            },
        );
        assert_eq!(result.ok(), Some(7));
        assert_eq!(extensions, 0);
    }

    #[test]
    fn test_exhausted_pool_extends_once_and_retries() {
        for exhausted in [vk::Result::ERROR_OUT_OF_POOL_MEMORY, vk::Result::ERROR_FRAGMENTED_POOL] {
            let mut extensions = 0u32;
            let mut attempts = 0u32;
            let result = allocate_with_extension(
                &mut extensions,
                |ext| {
                    attempts += 1;
                    if *ext == 0 { Err(exhausted) } else { Ok("set") }
                },
                |ext| {
                    *ext += 1;
                    Ok(())
                },
            );
            assert_eq!(result.ok(), Some("set"));
            assert_eq!(attempts, 2);
            assert_eq!(extensions, 1);
        }
    }

    #[test]
    fn test_second_failure_is_an_error() {
        let mut extensions = 0u32;
        let mut attempts = 0u32;
        let result: CoreResult<()> = allocate_with_extension(
            &mut extensions,
            |_| {
                attempts += 1;
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
            },
            |ext| {
                *ext += 1;
                Ok(())
            },
        );
        assert_eq!(attempts, 2);
        assert_eq!(extensions, 1);
        assert_eq!(result.err().and_then(|e| e.vk_result()), Some(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
    }

    #[test]
    fn test_other_errors_do_not_extend() {
        let mut extensions = 0u32;
        let result: CoreResult<()> = allocate_with_extension(
            &mut extensions,
            |_| Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            |ext| {
                *ext += 1;
                Ok(())
            },
        );
        assert!(result.is_err());
        assert_eq!(extensions, 0);
    }

    #[test]
    fn test_failed_extension_propagates() {
        let mut attempts = 0u32;
        let result: CoreResult<()> = allocate_with_extension(
            &mut (),
            |_| {
                attempts += 1;
                Err(vk::Result::ERROR_FRAGMENTED_POOL)
            },
            |_| Err(CoreError::vk("Failed to create descriptor pool", vk::Result::ERROR_OUT_OF_HOST_MEMORY)),
        );
        assert_eq!(attempts, 1);
        assert_eq!(result.err().and_then(|e| e.vk_result()), Some(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
    }
}
