// Descriptor pools and set layouts
//
// Each frame slot owns one pool. The pool keeps its own tally of what has
// been handed out since the last reset, so asking for more than the declared
// maxima fails with DescriptorPoolExhausted instead of reaching the driver.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::handle::Owned;
use super::VulkanDevice;
use crate::error::BackendError;

/// Declared maxima of a pool and what has been allocated against them
#[derive(Debug, Clone)]
pub struct DescriptorBudget {
    max_sets: u32,
    sets_used: u32,
    limits: Vec<vk::DescriptorPoolSize>,
    used: Vec<u32>,
}

impl DescriptorBudget {
    pub fn new(max_sets: u32, limits: &[vk::DescriptorPoolSize]) -> Self {
        Self {
            max_sets,
            sets_used: 0,
            limits: limits.to_vec(),
            used: vec![0; limits.len()],
        }
    }

    /// Account for `sets` sets, each needing `per_set` descriptors
    ///
    /// Nothing is recorded unless the whole request fits.
    pub fn reserve(&mut self, sets: u32, per_set: &[vk::DescriptorPoolSize]) -> Result<(), BackendError> {
        let sets_after = self
            .sets_used
            .checked_add(sets)
            .filter(|total| *total <= self.max_sets)
            .ok_or_else(|| {
                BackendError::DescriptorPoolExhausted(format!(
                    "{} sets requested, {} of {} already used",
                    sets, self.sets_used, self.max_sets
                ))
            })?;

        let mut wanted = vec![0u32; self.limits.len()];
        for size in per_set {
            let slot = self
                .limits
                .iter()
                .position(|limit| limit.ty == size.ty)
                .ok_or_else(|| {
                    BackendError::DescriptorPoolExhausted(format!("pool declares no {:?} descriptors", size.ty))
                })?;
            wanted[slot] = size
                .descriptor_count
                .checked_mul(sets)
                .and_then(|count| wanted[slot].checked_add(count))
                .ok_or_else(|| {
                    BackendError::DescriptorPoolExhausted(format!("{:?}: request overflows the pool", size.ty))
                })?;
        }

        let mut used_after = Vec::with_capacity(self.limits.len());
        for (slot, limit) in self.limits.iter().enumerate() {
            match self.used[slot].checked_add(wanted[slot]) {
                Some(total) if total <= limit.descriptor_count => used_after.push(total),
                _ => {
                    return Err(BackendError::DescriptorPoolExhausted(format!(
                        "{:?}: {} requested, {} of {} already used",
                        limit.ty, wanted[slot], self.used[slot], limit.descriptor_count
                    )))
                }
            }
        }

        self.sets_used = sets_after;
        self.used = used_after;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.sets_used = 0;
        self.used.iter_mut().for_each(|used| *used = 0);
    }

    pub fn sets_used(&self) -> u32 {
        self.sets_used
    }

    pub fn used(&self, ty: vk::DescriptorType) -> u32 {
        self.limits
            .iter()
            .position(|limit| limit.ty == ty)
            .map_or(0, |slot| self.used[slot])
    }
}

pub struct DescriptorPool {
    pool: Owned<vk::DescriptorPool>,
    budget: DescriptorBudget,
}

impl DescriptorPool {
    pub fn new(device: &Arc<VulkanDevice>, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(sizes);

        let pool = unsafe { device.device.create_descriptor_pool(&create_info, None) }
            .context("Failed to create descriptor pool")?;

        Ok(Self {
            pool: Owned::new(device.clone(), pool),
            budget: DescriptorBudget::new(max_sets, sizes),
        })
    }

    /// Return every set allocated since the last reset to the pool
    pub fn reset(&mut self) -> Result<()> {
        unsafe {
            self.pool
                .owner()
                .device
                .reset_descriptor_pool(self.pool.handle(), vk::DescriptorPoolResetFlags::empty())
        }
        .context("Failed to reset descriptor pool")?;
        self.budget.reset();
        Ok(())
    }

    pub fn allocate(&mut self, layout: &DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        self.budget.reserve(1, layout.sizes())?;

        let layouts = [layout.handle()];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool.handle())
            .set_layouts(&layouts);

        let sets = unsafe { self.pool.owner().device.allocate_descriptor_sets(&allocate_info) }
            .context("Failed to allocate descriptor set")?;

        sets.into_iter().next().context("Driver returned no descriptor set")
    }

}

pub struct DescriptorSetLayout {
    layout: Owned<vk::DescriptorSetLayout>,
    sizes: Vec<vk::DescriptorPoolSize>,
}

impl DescriptorSetLayout {
    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout.handle()
    }

    /// Descriptors one set of this layout consumes, per type
    pub fn sizes(&self) -> &[vk::DescriptorPoolSize] {
        &self.sizes
    }
}

#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binding(mut self, binding: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(1)
                .stage_flags(stages)
                .build(),
        );
        self
    }

    /// Per-type totals of the bindings added so far
    pub fn sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            match sizes.iter_mut().find(|size| size.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += binding.descriptor_count,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: binding.descriptor_type,
                    descriptor_count: binding.descriptor_count,
                }),
            }
        }
        sizes
    }

    pub fn build(self, device: &Arc<VulkanDevice>) -> Result<DescriptorSetLayout> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);

        let layout = unsafe { device.device.create_descriptor_set_layout(&create_info, None) }
            .context("Failed to create descriptor set layout")?;

        Ok(DescriptorSetLayout {
            layout: Owned::new(device.clone(), layout),
            sizes: self.sizes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::constants::{DESCRIPTOR_POOL_SIZES, MAX_DESCRIPTOR_SETS};

    fn uniforms(count: u32) -> vk::DescriptorPoolSize {
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: count,
        }
    }

    #[test]
    fn test_reserve_within_limits() {
        let mut budget = DescriptorBudget::new(4, &[uniforms(8)]);
        budget.reserve(2, &[uniforms(2)]).unwrap();
        assert_eq!(budget.sets_used(), 2);
        assert_eq!(budget.used(vk::DescriptorType::UNIFORM_BUFFER), 4);
    }

    #[test]
    fn test_set_maximum_is_enforced() {
        let mut budget = DescriptorBudget::new(2, &[uniforms(100)]);
        budget.reserve(2, &[uniforms(1)]).unwrap();
        let err = budget.reserve(1, &[uniforms(1)]).unwrap_err();
        assert!(matches!(err, BackendError::DescriptorPoolExhausted(_)));
        assert_eq!(budget.sets_used(), 2);
    }

    #[test]
    fn test_per_type_maximum_is_enforced_without_partial_accounting() {
        let mut budget = DescriptorBudget::new(10, &[uniforms(3)]);
        budget.reserve(1, &[uniforms(2)]).unwrap();
        assert!(budget.reserve(1, &[uniforms(2)]).is_err());
        assert_eq!(budget.sets_used(), 1);
        assert_eq!(budget.used(vk::DescriptorType::UNIFORM_BUFFER), 2);
    }

    #[test]
    fn test_huge_requests_are_rejected_not_wrapped() {
        let mut budget = DescriptorBudget::new(MAX_DESCRIPTOR_SETS, DESCRIPTOR_POOL_SIZES);
        budget.reserve(1, &[uniforms(1)]).unwrap();

        let err = budget.reserve(u32::MAX, &[uniforms(1)]).unwrap_err();
        assert!(matches!(err, BackendError::DescriptorPoolExhausted(_)));

        // Set count fits, descriptor count does not
        let mut budget = DescriptorBudget::new(u32::MAX, &[uniforms(u32::MAX)]);
        budget.reserve(1, &[uniforms(1)]).unwrap();
        assert!(budget.reserve(2, &[uniforms(u32::MAX)]).is_err());
        assert!(budget.reserve(1, &[uniforms(u32::MAX)]).is_err());
        assert_eq!(budget.sets_used(), 1);
        assert_eq!(budget.used(vk::DescriptorType::UNIFORM_BUFFER), 1);
    }

    #[test]
    fn test_undeclared_type_is_rejected() {
        let mut budget = DescriptorBudget::new(10, &[uniforms(3)]);
        let samplers = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
        };
        assert!(budget.reserve(1, &[samplers]).is_err());
    }

    #[test]
    fn test_reset_restores_full_budget() {
        let mut budget = DescriptorBudget::new(MAX_DESCRIPTOR_SETS, DESCRIPTOR_POOL_SIZES);
        for _ in 0..MAX_DESCRIPTOR_SETS {
            budget.reserve(1, &[uniforms(1)]).unwrap();
        }
        assert!(budget.reserve(1, &[uniforms(1)]).is_err());

        budget.reset();
        assert_eq!(budget.sets_used(), 0);
        budget.reserve(1, &[uniforms(1)]).unwrap();
    }

    #[test]
    fn test_layout_builder_totals_per_type() {
        let builder = DescriptorSetLayoutBuilder::new()
            .binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
            .binding(1, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::FRAGMENT)
            .binding(2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT);
        let sizes = builder.sizes();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 2);
        assert_eq!(sizes[1].descriptor_count, 1);
    }
}
