// Owned Vulkan handles
//
// Every API object the backend creates lives inside an Owned<H>. The owner
// keeps the thing that can destroy it alive and runs the destroy call exactly
// once on drop, so a half-built component releases whatever it already made
// when a later `?` bails out.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Knows how to release one kind of handle
pub trait Destroy<H> {
    fn destroy(&self, handle: H);
}

/// Handle plus the owner responsible for destroying it
pub struct Owned<H: Copy, D: Destroy<H> = VulkanDevice> {
    handle: H,
    owner: Arc<D>,
}

impl<H: Copy, D: Destroy<H>> Owned<H, D> {
    pub fn new(owner: Arc<D>, handle: H) -> Self {
        Self { handle, owner }
    }

    #[inline]
    pub fn handle(&self) -> H {
        self.handle
    }

    #[inline]
    pub fn owner(&self) -> &Arc<D> {
        &self.owner
    }
}

impl<H: Copy, D: Destroy<H>> Drop for Owned<H, D> {
    fn drop(&mut self) {
        self.owner.destroy(self.handle);
    }
}

impl<H: Copy + std::fmt::Debug, D: Destroy<H>> std::fmt::Debug for Owned<H, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Owned").field(&self.handle).finish()
    }
}

macro_rules! device_destroyers {
    ($($handle:ty => $destroy:ident),* $(,)?) => {
        $(
            impl Destroy<$handle> for VulkanDevice {
                fn destroy(&self, handle: $handle) {
                    unsafe { self.device.$destroy(handle, None) };
                }
            }
        )*
    };
}

device_destroyers! {
    vk::Fence => destroy_fence,
    vk::Semaphore => destroy_semaphore,
    vk::CommandPool => destroy_command_pool,
    vk::DescriptorPool => destroy_descriptor_pool,
    vk::DescriptorSetLayout => destroy_descriptor_set_layout,
    vk::PipelineCache => destroy_pipeline_cache,
    vk::PipelineLayout => destroy_pipeline_layout,
    vk::Pipeline => destroy_pipeline,
    vk::RenderPass => destroy_render_pass,
    vk::Framebuffer => destroy_framebuffer,
    vk::ImageView => destroy_image_view,
    vk::ShaderModule => destroy_shader_module,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Ledger {
        destroyed: Mutex<Vec<u32>>,
    }

    impl Destroy<u32> for Ledger {
        fn destroy(&self, handle: u32) {
            self.destroyed.lock().push(handle);
        }
    }

    // Same shape as the backend: fields declared newest-first
    struct Stack {
        _third: Owned<u32, Ledger>,
        _second: Owned<u32, Ledger>,
        _first: Owned<u32, Ledger>,
    }

    fn build(ledger: &Arc<Ledger>, fail_at_third: bool) -> Result<Stack, &'static str> {
        let first = Owned::new(ledger.clone(), 1);
        let second = Owned::new(ledger.clone(), 2);
        if fail_at_third {
            return Err("third object failed");
        }
        let third = Owned::new(ledger.clone(), 3);
        Ok(Stack {
            _third: third,
            _second: second,
            _first: first,
        })
    }

    #[test]
    fn test_destroys_exactly_once_in_reverse_order() {
        let ledger = Arc::new(Ledger::default());
        let stack = build(&ledger, false).unwrap();
        assert!(ledger.destroyed.lock().is_empty());

        drop(stack);
        assert_eq!(*ledger.destroyed.lock(), vec![3, 2, 1]);
    }

    #[test]
    fn test_partial_construction_releases_what_was_made() {
        let ledger = Arc::new(Ledger::default());
        assert!(build(&ledger, true).is_err());
        assert_eq!(*ledger.destroyed.lock(), vec![2, 1]);
    }

    #[test]
    fn test_handle_accessor_does_not_release() {
        let ledger = Arc::new(Ledger::default());
        let owned = Owned::new(ledger.clone(), 7);
        assert_eq!(owned.handle(), 7);
        assert_eq!(owned.handle(), 7);
        drop(owned);
        assert_eq!(*ledger.destroyed.lock(), vec![7]);
    }
}
