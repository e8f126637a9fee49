use ash::vk;

use crate::error::GpuError;

/// Grow-on-demand descriptor pool set owned by the worker.
///
/// Sets are allocated per draw and never freed individually; whole pools
/// travel with a submission and are reset for reuse once its fence signals.
pub struct DescriptorHeap {
    device: ash::Device,
    /// Pools already filled by earlier draws of the current recording.
    retired: Vec<vk::DescriptorPool>,
    /// Reset pools ready for reuse.
    spare: Vec<vk::DescriptorPool>,
    current: Option<vk::DescriptorPool>,
}

const SETS_PER_POOL: u32 = 1024;

impl DescriptorHeap {
    pub fn new(device: ash::Device) -> Self {
        Self {
            device,
            retired: Vec::new(),
            spare: Vec::new(),
            current: None,
        }
    }

    /// Allocates one descriptor set with the given layout.
    pub fn alloc(&mut self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet, GpuError> {
        let pool = match self.current {
            Some(pool) => pool,
            None => {
                let pool = self.take_pool()?;
                self.current = Some(pool);
                pool
            }
        };

        match self.try_alloc(pool, layout) {
            Ok(set) => Ok(set),
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
            | Err(GpuError::Vulkan(vk::Result::ERROR_FRAGMENTED_POOL)) => {
                self.retired.push(pool);
                let fresh = self.take_pool()?;
                self.current = Some(fresh);
                self.try_alloc(fresh, layout)
            }
            Err(err) => Err(err),
        }
    }

    /// Hands off every pool touched since the last call, for attachment to
    /// the submission that references their sets.
    pub fn take_submitted(&mut self) -> Vec<vk::DescriptorPool> {
        let mut pools = std::mem::take(&mut self.retired);
        if let Some(current) = self.current.take() {
            pools.push(current);
        }
        pools
    }

    /// Returns pools whose submission has completed; their sets are dead.
    pub fn recycle(&mut self, pools: Vec<vk::DescriptorPool>) {
        for pool in pools {
            let _ = unsafe {
                self.device
                    .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
            };
            self.spare.push(pool);
        }
    }

    fn take_pool(&mut self) -> Result<vk::DescriptorPool, GpuError> {
        if let Some(pool) = self.spare.pop() {
            return Ok(pool);
        }

        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: SETS_PER_POOL * 8,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: SETS_PER_POOL * 16,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: SETS_PER_POOL * 16,
            },
        ];

        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&sizes);

        Ok(unsafe { self.device.create_descriptor_pool(&info, None) }?)
    }

    fn try_alloc(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, GpuError> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }?;
        Ok(sets[0])
    }
}

impl Drop for DescriptorHeap {
    fn drop(&mut self) {
        let pools = self
            .spare
            .drain(..)
            .chain(self.retired.drain(..))
            .chain(self.current.take());
        for pool in pools {
            unsafe { self.device.destroy_descriptor_pool(pool, None) };
        }
    }
}
