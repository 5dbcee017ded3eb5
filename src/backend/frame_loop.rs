// Per-frame protocol, independent of the GPU
//
// FrameLoop decides what happens each frame: which slot is used, when the
// slot fence is waited on and reset, when the swapchain is rebuilt, and
// what order record / submit / present happen in. The GPU work itself is
// delegated to a FrameDriver, so the protocol can be exercised against a
// scripted driver in tests.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::constants::{MAX_ACQUIRE_ATTEMPTS, MAX_FRAMES_IN_FLIGHT};
use super::device::PresentOutcome;
use super::diagnostics::Diagnostics;
use super::swapchain::AcquireOutcome;
use crate::error::BackendError;
use crate::scene::Scene;

/// Result of `begin_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// An image is acquired; render_scene and end_frame must follow
    Ready,
    /// Nothing to draw into this time (minimized, or the surface kept going stale)
    NotReady,
}

/// GPU operations the frame loop sequences
pub trait FrameDriver {
    /// Block until the slot's previous submission has finished
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;
    /// Put the slot fence back to unsignaled
    fn reset_slot(&mut self, slot: usize) -> Result<()>;
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;
    /// Rebuild the swapchain and everything sized by it; returns the new extent
    ///
    /// A zero-area extent means the surface currently has no size and nothing
    /// was rebuilt.
    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> Result<vk::Extent2D>;
    fn record_frame(&mut self, slot: usize, image_index: u32, scene: &Scene) -> Result<()>;
    /// Submit the slot's commands, signaling its fence on completion
    fn submit_frame(&mut self, slot: usize) -> Result<()>;
    fn present_frame(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Acquired { slot: usize, image_index: u32 },
    Submitted { slot: usize, image_index: u32 },
}

pub struct FrameLoop {
    frame_index: usize,
    surface_extent: vk::Extent2D,
    swapchain_extent: vk::Extent2D,
    stale: bool,
    generation: u64,
    phase: Phase,
    diagnostics: Arc<Diagnostics>,
}

impl FrameLoop {
    /// `extent` is the size the swapchain was first created with
    pub fn new(diagnostics: Arc<Diagnostics>, extent: vk::Extent2D) -> Self {
        Self {
            frame_index: 0,
            surface_extent: extent,
            swapchain_extent: extent,
            stale: false,
            generation: 0,
            phase: Phase::Idle,
            diagnostics,
        }
    }

    /// Record the window's latest framebuffer size; (0, 0) while minimized
    pub fn set_surface_extent(&mut self, extent: vk::Extent2D) {
        if extent != self.surface_extent {
            log::debug!("Surface extent {}x{}", extent.width, extent.height);
            self.surface_extent = extent;
        }
    }

    /// Force a swapchain rebuild before the next acquire
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Slot the next (or current) frame uses
    pub fn current_slot(&self) -> usize {
        self.frame_index % MAX_FRAMES_IN_FLIGHT
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain_extent
    }

    /// Bumped on every swapchain rebuild
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Image index of the frame between begin_frame and end_frame
    pub fn current_image(&self) -> Option<u32> {
        match self.phase {
            Phase::Idle => None,
            Phase::Acquired { image_index, .. } | Phase::Submitted { image_index, .. } => Some(image_index),
        }
    }

    pub fn begin_frame<D: FrameDriver>(&mut self, driver: &mut D) -> Result<FrameStatus> {
        if self.phase != Phase::Idle {
            return Err(BackendError::FrameOrder("begin_frame called while a frame is in progress").into());
        }

        self.diagnostics.check()?;

        if self.surface_extent.width == 0 || self.surface_extent.height == 0 {
            return Ok(FrameStatus::NotReady);
        }

        let slot = self.current_slot();
        driver.wait_for_slot(slot)?;

        if (self.stale || self.swapchain_extent != self.surface_extent) && !self.recreate(driver)? {
            return Ok(FrameStatus::NotReady);
        }

        for attempt in 0..MAX_ACQUIRE_ATTEMPTS {
            match driver.acquire_image(slot)? {
                AcquireOutcome::Acquired { image_index, suboptimal } => {
                    if suboptimal {
                        // Still usable this frame
                        self.stale = true;
                    }
                    // Only now is a submission guaranteed to signal the fence again
                    driver.reset_slot(slot)?;
                    self.phase = Phase::Acquired { slot, image_index };
                    return Ok(FrameStatus::Ready);
                }
                AcquireOutcome::OutOfDate => {
                    log::debug!("Swapchain out of date on acquire (attempt {})", attempt + 1);
                    if !self.recreate(driver)? {
                        return Ok(FrameStatus::NotReady);
                    }
                }
            }
        }

        log::warn!(
            "Surface still out of date after {} acquire attempts, skipping frame",
            MAX_ACQUIRE_ATTEMPTS
        );
        self.stale = true;
        Ok(FrameStatus::NotReady)
    }

    /// Record and submit the acquired frame
    pub fn render_scene<D: FrameDriver>(
        &mut self,
        driver: &mut D,
        scene: &Scene,
        framebuffer_size: vk::Extent2D,
    ) -> Result<()> {
        let Phase::Acquired { slot, image_index } = self.phase else {
            return Err(BackendError::FrameOrder("render_scene called without a ready frame").into());
        };

        if framebuffer_size != self.swapchain_extent {
            // The image is already ours; draw into it and rebuild next frame
            self.set_surface_extent(framebuffer_size);
            self.stale = true;
        }

        driver.record_frame(slot, image_index, scene)?;
        driver.submit_frame(slot)?;
        self.phase = Phase::Submitted { slot, image_index };
        Ok(())
    }

    /// Present the submitted frame and advance to the next slot
    pub fn end_frame<D: FrameDriver>(&mut self, driver: &mut D) -> Result<()> {
        let Phase::Submitted { slot, image_index } = self.phase else {
            return Err(BackendError::FrameOrder("end_frame called without a submitted frame").into());
        };

        match driver.present_frame(slot, image_index)? {
            PresentOutcome::Presented => {}
            outcome => {
                log::debug!("Present returned {:?}, recreating next frame", outcome);
                self.stale = true;
            }
        }

        self.phase = Phase::Idle;
        self.frame_index = (self.frame_index + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(())
    }

    /// False when the surface turned out to have no area; the old swapchain is
    /// kept, still stale, until the window reports a usable size again
    fn recreate<D: FrameDriver>(&mut self, driver: &mut D) -> Result<bool> {
        let extent = driver.recreate_swapchain(self.surface_extent)?;
        if extent.width == 0 || extent.height == 0 {
            log::debug!("Surface has no area, suspending frames");
            self.surface_extent = extent;
            self.stale = true;
            return Ok(false);
        }
        log::info!("Swapchain recreated at {}x{}", extent.width, extent.height);

        // The surface may clamp the request; its answer is the new truth
        self.swapchain_extent = extent;
        self.surface_extent = extent;
        self.stale = false;
        self.generation += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::diagnostics::{Severity, ValidationPolicy};
    use crate::error::backend_error;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Reset(usize),
        Acquire { slot: usize, generation: u64 },
        Recreate(u32, u32),
        Record { slot: usize, image_index: u32 },
        Submit { slot: usize, generation: u64 },
        Present { slot: usize, image_index: u32 },
    }

    /// Scripted driver tracking fence state the way the GPU would
    struct MockDriver {
        calls: Vec<Call>,
        fence_signaled: [bool; MAX_FRAMES_IN_FLIGHT],
        acquires: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        generation: u64,
        next_image: u32,
        /// Extent the surface reports on recreate; None follows the request
        surface_reports: Option<vk::Extent2D>,
    }

    impl MockDriver {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                fence_signaled: [true; MAX_FRAMES_IN_FLIGHT],
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                generation: 0,
                next_image: 0,
                surface_reports: None,
            }
        }

        fn waits(&self) -> Vec<usize> {
            self.calls
                .iter()
                .filter_map(|call| match call {
                    Call::Wait(slot) => Some(*slot),
                    _ => None,
                })
                .collect()
        }
    }

    impl FrameDriver for MockDriver {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            // A wait on a fence nobody will signal would hang forever
            assert!(self.fence_signaled[slot], "deadlock: slot {} fence never signaled", slot);
            self.calls.push(Call::Wait(slot));
            Ok(())
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            self.fence_signaled[slot] = false;
            self.calls.push(Call::Reset(slot));
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire {
                slot,
                generation: self.generation,
            });
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let image_index = self.next_image;
                self.next_image = (self.next_image + 1) % 3;
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: false,
                }
            }))
        }

        fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> Result<vk::Extent2D> {
            self.calls.push(Call::Recreate(extent.width, extent.height));
            let reported = self.surface_reports.unwrap_or(extent);
            if reported.width != 0 && reported.height != 0 {
                self.generation += 1;
            }
            Ok(reported)
        }

        fn record_frame(&mut self, slot: usize, image_index: u32, _scene: &Scene) -> Result<()> {
            self.calls.push(Call::Record { slot, image_index });
            Ok(())
        }

        fn submit_frame(&mut self, slot: usize) -> Result<()> {
            assert!(!self.fence_signaled[slot], "submitted with a signaled fence");
            self.calls.push(Call::Submit {
                slot,
                generation: self.generation,
            });
            // The GPU finishes instantly
            self.fence_signaled[slot] = true;
            Ok(())
        }

        fn present_frame(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present { slot, image_index });
            Ok(self.presents.pop_front().unwrap_or(PresentOutcome::Presented))
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn frame_loop() -> FrameLoop {
        let diagnostics = Arc::new(Diagnostics::new(ValidationPolicy::Report));
        FrameLoop::new(diagnostics, extent(800, 600))
    }

    fn run_frame(frame_loop: &mut FrameLoop, driver: &mut MockDriver) -> FrameStatus {
        let status = frame_loop.begin_frame(driver).unwrap();
        if status == FrameStatus::Ready {
            let size = frame_loop.swapchain_extent();
            frame_loop.render_scene(driver, &Scene::default(), size).unwrap();
            frame_loop.end_frame(driver).unwrap();
        }
        status
    }

    #[test]
    fn test_slots_cycle_through_frames_in_flight() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();

        for _ in 0..5 {
            assert_eq!(run_frame(&mut frame_loop, &mut driver), FrameStatus::Ready);
        }

        assert_eq!(driver.waits(), vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_fence_is_waited_before_reset_and_reset_before_submit() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();
        run_frame(&mut frame_loop, &mut driver);

        let position = |wanted: &Call| driver.calls.iter().position(|call| call == wanted).unwrap();
        let wait = position(&Call::Wait(0));
        let reset = position(&Call::Reset(0));
        let submit = position(&Call::Submit { slot: 0, generation: 0 });
        assert!(wait < reset && reset < submit);
    }

    #[test]
    fn test_first_use_of_each_slot_does_not_block() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();

        // Fences start signaled; the mock panics on a wait that would hang
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            run_frame(&mut frame_loop, &mut driver);
        }
        assert_eq!(driver.waits(), (0..MAX_FRAMES_IN_FLIGHT).collect::<Vec<_>>());
    }

    #[test]
    fn test_stale_acquire_recreates_and_retries() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();
        run_frame(&mut frame_loop, &mut driver);
        run_frame(&mut frame_loop, &mut driver);

        // Frame 3: the first acquire reports a stale surface
        let calls_before = driver.calls.len();
        driver.acquires.push_back(AcquireOutcome::OutOfDate);
        driver.next_image = 1;

        assert_eq!(run_frame(&mut frame_loop, &mut driver), FrameStatus::Ready);

        let frame_calls = &driver.calls[calls_before..];
        assert_eq!(
            frame_calls,
            &[
                Call::Wait(0),
                Call::Acquire { slot: 0, generation: 0 },
                Call::Recreate(800, 600),
                Call::Acquire { slot: 0, generation: 1 },
                Call::Reset(0),
                Call::Record { slot: 0, image_index: 1 },
                Call::Submit { slot: 0, generation: 1 },
                Call::Present { slot: 0, image_index: 1 },
            ]
        );
        assert_eq!(frame_loop.generation(), 1);
    }

    #[test]
    fn test_resize_recreates_before_acquiring() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();
        run_frame(&mut frame_loop, &mut driver);

        frame_loop.set_surface_extent(extent(1280, 720));
        run_frame(&mut frame_loop, &mut driver);

        let recreate = driver.calls.iter().position(|c| *c == Call::Recreate(1280, 720)).unwrap();
        let acquire = driver
            .calls
            .iter()
            .position(|c| *c == Call::Acquire { slot: 1, generation: 1 })
            .unwrap();
        assert!(recreate < acquire);
        assert!(driver.calls.contains(&Call::Submit { slot: 1, generation: 1 }));
        assert_eq!(frame_loop.swapchain_extent(), extent(1280, 720));
    }

    #[test]
    fn test_no_submit_ever_targets_an_old_swapchain() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();
        driver.acquires.extend([AcquireOutcome::OutOfDate, AcquireOutcome::OutOfDate]);
        driver.presents.push_back(PresentOutcome::OutOfDate);

        for _ in 0..4 {
            run_frame(&mut frame_loop, &mut driver);
        }

        let mut generation = 0;
        for call in &driver.calls {
            match call {
                Call::Recreate(..) => generation += 1,
                Call::Submit { generation: submitted, .. } => assert_eq!(*submitted, generation),
                _ => {}
            }
        }
    }

    #[test]
    fn test_suboptimal_present_marks_stale_without_retrying() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();
        driver.presents.push_back(PresentOutcome::Suboptimal);

        run_frame(&mut frame_loop, &mut driver);
        assert!(frame_loop.is_stale());
        let presents = driver.calls.iter().filter(|c| matches!(c, Call::Present { .. })).count();
        assert_eq!(presents, 1);

        run_frame(&mut frame_loop, &mut driver);
        assert!(!frame_loop.is_stale());
        assert!(driver.calls.contains(&Call::Recreate(800, 600)));
    }

    #[test]
    fn test_suboptimal_acquire_still_renders() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();
        driver.acquires.push_back(AcquireOutcome::Acquired {
            image_index: 2,
            suboptimal: true,
        });

        assert_eq!(run_frame(&mut frame_loop, &mut driver), FrameStatus::Ready);
        assert!(driver.calls.contains(&Call::Present { slot: 0, image_index: 2 }));
        assert!(frame_loop.is_stale());
    }

    #[test]
    fn test_zero_extent_is_not_ready_and_touches_nothing() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();
        frame_loop.set_surface_extent(extent(0, 0));

        assert_eq!(frame_loop.begin_frame(&mut driver).unwrap(), FrameStatus::NotReady);
        assert!(driver.calls.is_empty());

        frame_loop.set_surface_extent(extent(0, 600));
        assert_eq!(frame_loop.begin_frame(&mut driver).unwrap(), FrameStatus::NotReady);
        assert!(driver.calls.is_empty());

        // Restored: recreate at the new size, then carry on from slot 0
        frame_loop.set_surface_extent(extent(640, 480));
        assert_eq!(run_frame(&mut frame_loop, &mut driver), FrameStatus::Ready);
        assert_eq!(driver.calls[0], Call::Wait(0));
        assert_eq!(driver.calls[1], Call::Recreate(640, 480));
        assert_eq!(frame_loop.swapchain_extent(), extent(640, 480));
    }

    #[test]
    fn test_surface_without_area_on_recreate_suspends_frames() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();
        run_frame(&mut frame_loop, &mut driver);

        // Minimized before the window event arrives
        driver.surface_reports = Some(extent(0, 0));
        frame_loop.mark_stale();
        let calls_before = driver.calls.len();

        assert_eq!(frame_loop.begin_frame(&mut driver).unwrap(), FrameStatus::NotReady);
        assert!(!driver.calls[calls_before..]
            .iter()
            .any(|c| matches!(c, Call::Acquire { .. } | Call::Reset(_))));
        assert!(frame_loop.is_stale());
        assert_eq!(frame_loop.swapchain_extent(), extent(800, 600));
        assert_eq!(frame_loop.generation(), 0);

        // Suspended until the window reports a size
        let calls_before = driver.calls.len();
        assert_eq!(frame_loop.begin_frame(&mut driver).unwrap(), FrameStatus::NotReady);
        assert_eq!(driver.calls.len(), calls_before);

        driver.surface_reports = None;
        frame_loop.set_surface_extent(extent(800, 600));
        assert_eq!(run_frame(&mut frame_loop, &mut driver), FrameStatus::Ready);
        assert!(!frame_loop.is_stale());
        assert_eq!(frame_loop.generation(), 1);
    }

    #[test]
    fn test_surface_without_area_after_stale_acquire_suspends_frames() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();
        driver.acquires.push_back(AcquireOutcome::OutOfDate);
        driver.surface_reports = Some(extent(0, 0));

        assert_eq!(frame_loop.begin_frame(&mut driver).unwrap(), FrameStatus::NotReady);
        let acquires = driver.calls.iter().filter(|c| matches!(c, Call::Acquire { .. })).count();
        assert_eq!(acquires, 1);
        assert!(!driver.calls.iter().any(|c| matches!(c, Call::Reset(_))));
        assert!(frame_loop.is_stale());
    }

    #[test]
    fn test_exhausted_acquires_leave_fence_signaled() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();
        driver
            .acquires
            .extend(std::iter::repeat(AcquireOutcome::OutOfDate).take(MAX_ACQUIRE_ATTEMPTS));

        assert_eq!(frame_loop.begin_frame(&mut driver).unwrap(), FrameStatus::NotReady);
        assert!(!driver.calls.iter().any(|c| matches!(c, Call::Reset(_))));
        assert!(frame_loop.is_stale());

        // Same slot again; would deadlock if its fence had been reset
        assert_eq!(run_frame(&mut frame_loop, &mut driver), FrameStatus::Ready);
        assert_eq!(driver.waits(), vec![0, 0]);
    }

    #[test]
    fn test_framebuffer_size_mismatch_recreates_next_frame() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();

        assert_eq!(frame_loop.begin_frame(&mut driver).unwrap(), FrameStatus::Ready);
        frame_loop
            .render_scene(&mut driver, &Scene::default(), extent(900, 700))
            .unwrap();
        frame_loop.end_frame(&mut driver).unwrap();
        assert!(driver.calls.contains(&Call::Submit { slot: 0, generation: 0 }));

        run_frame(&mut frame_loop, &mut driver);
        assert!(driver.calls.contains(&Call::Recreate(900, 700)));
        assert_eq!(frame_loop.swapchain_extent(), extent(900, 700));
    }

    #[test]
    fn test_out_of_order_calls_are_rejected() {
        let mut frame_loop = frame_loop();
        let mut driver = MockDriver::new();
        let size = extent(800, 600);

        let err = frame_loop.render_scene(&mut driver, &Scene::default(), size).unwrap_err();
        assert!(matches!(backend_error(&err), Some(BackendError::FrameOrder(_))));
        let err = frame_loop.end_frame(&mut driver).unwrap_err();
        assert!(matches!(backend_error(&err), Some(BackendError::FrameOrder(_))));

        frame_loop.begin_frame(&mut driver).unwrap();
        let err = frame_loop.begin_frame(&mut driver).unwrap_err();
        assert!(matches!(backend_error(&err), Some(BackendError::FrameOrder(_))));
        let err = frame_loop.end_frame(&mut driver).unwrap_err();
        assert!(matches!(backend_error(&err), Some(BackendError::FrameOrder(_))));

        // The frame in progress is still intact
        frame_loop.render_scene(&mut driver, &Scene::default(), size).unwrap();
        frame_loop.end_frame(&mut driver).unwrap();
    }

    #[test]
    fn test_reported_validation_error_stops_frames() {
        let diagnostics = Arc::new(Diagnostics::new(ValidationPolicy::Report));
        let mut frame_loop = FrameLoop::new(diagnostics.clone(), extent(800, 600));
        let mut driver = MockDriver::new();
        run_frame(&mut frame_loop, &mut driver);
        let calls_before = driver.calls.len();

        diagnostics.report(Severity::Error, "vkCmdDraw: bad pipeline");

        for _ in 0..3 {
            let err = frame_loop.begin_frame(&mut driver).unwrap_err();
            assert_eq!(
                backend_error(&err),
                Some(&BackendError::Validation("vkCmdDraw: bad pipeline".into()))
            );
        }
        assert_eq!(driver.calls.len(), calls_before);
    }

    #[test]
    fn test_abort_policy_terminates_once_and_stops_frames() {
        static TERMINATIONS: AtomicUsize = AtomicUsize::new(0);
        let diagnostics = Arc::new(Diagnostics::with_terminator(
            ValidationPolicy::Abort,
            Box::new(|| {
                TERMINATIONS.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        let mut frame_loop = FrameLoop::new(diagnostics.clone(), extent(800, 600));
        let mut driver = MockDriver::new();

        diagnostics.report(Severity::Error, "first");
        diagnostics.report(Severity::Error, "second");

        assert_eq!(TERMINATIONS.load(Ordering::SeqCst), 1);
        assert!(frame_loop.begin_frame(&mut driver).is_err());
        assert!(driver.calls.is_empty());
    }
}
