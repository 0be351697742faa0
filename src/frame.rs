// Frame pacing - how far the CPU may run ahead of the GPU
//
// Each frame slot owns one image-available semaphore, one render-finished
// semaphore and one in-flight fence. The slot index cycles through
// 0..max_frames_in_flight. Separately, every swapchain image remembers which
// slot last submitted work writing to it, so an image is never reused while a
// different slot's frame is still rendering into it.
//
// The protocol lives here, free of Vulkan calls. The renderer supplies the
// actual GPU operations through `FrameDriver`.

use anyhow::Result;
use thiserror::Error;

/// Result of asking the swapchain for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is available (possibly suboptimal, which is still usable).
    Ready { image_index: u32, suboptimal: bool },
    /// The surface changed and the swapchain must be rebuilt before use.
    OutOfDate,
}

/// Result of queueing an image for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// What `FrameScheduler::draw_frame` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Work for `image_index` was submitted and presented.
    Presented { image_index: u32 },
    /// A frame was presented, then the swapchain was rebuilt.
    PresentedAndRecreated { image_index: u32 },
    /// A frame was presented, but the swapchain could not be rebuilt
    /// because the window has no drawable area.
    PresentedAndDeferred { image_index: u32 },
    /// Acquisition reported out-of-date; the frame was abandoned and the
    /// swapchain rebuilt. The slot index did not advance.
    Recreated,
    /// The window has no drawable area; nothing was rendered.
    Deferred,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("swapchain returned image index {index} but only {count} images exist")]
    ImageIndexOutOfRange { index: u32, count: usize },
}

/// GPU operations the frame protocol is built from.
///
/// Every method blocks until the driver call returns. Errors are fatal.
pub trait FrameDriver {
    /// Block until the fence owned by `slot` is signaled.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Request the next swapchain image, signaling `slot`'s
    /// image-available semaphore once it is ready.
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Write per-frame data (uniforms) for `image_index`.
    fn update_frame_data(&mut self, image_index: u32) -> Result<()>;

    /// Reset `slot`'s fence and submit the command buffer of `image_index`,
    /// waiting on the image-available semaphore and signaling the
    /// render-finished semaphore and the fence.
    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()>;

    /// Queue `image_index` for presentation after `slot`'s render-finished
    /// semaphore is signaled.
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    /// Tear down and rebuild everything sized by the swapchain.
    ///
    /// Returns the new image count, or `None` when the window has no drawable
    /// area and recreation has to wait.
    fn recreate_swapchain(&mut self) -> Result<Option<usize>>;
}

/// CPU-side state of the frame protocol.
#[derive(Debug)]
pub struct FrameScheduler {
    max_frames_in_flight: usize,
    current_frame: usize,
    /// Indexed by swapchain image. Holds the slot whose fence guards the
    /// image; never owns the fence.
    images_in_flight: Vec<Option<usize>>,
    framebuffer_resized: bool,
    recreate_pending: bool,
}

impl FrameScheduler {
    pub fn new(max_frames_in_flight: usize, image_count: usize) -> Self {
        Self {
            max_frames_in_flight: max_frames_in_flight.max(1),
            current_frame: 0,
            images_in_flight: vec![None; image_count],
            framebuffer_resized: false,
            recreate_pending: false,
        }
    }

    #[cfg(test)]
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    #[cfg(test)]
    pub fn images_in_flight(&self) -> &[Option<usize>] {
        &self.images_in_flight
    }

    /// Called from the window's resize notification.
    pub fn notify_resized(&mut self) {
        self.framebuffer_resized = true;
    }

    /// Rebuild the swapchain before the next frame, e.g. when it could not
    /// be created at startup.
    pub fn request_recreate(&mut self) {
        self.recreate_pending = true;
    }

    #[cfg(test)]
    pub fn is_resize_pending(&self) -> bool {
        self.framebuffer_resized || self.recreate_pending
    }

    /// Run one iteration of the frame protocol.
    pub fn draw_frame<D: FrameDriver>(&mut self, driver: &mut D) -> Result<FrameStatus> {
        if self.recreate_pending && !self.recreate(driver)? {
            return Ok(FrameStatus::Deferred);
        }

        let slot = self.current_frame;

        // Throttle: the frame that last used this slot must be done
        driver.wait_for_slot(slot)?;

        let image_index = match driver.acquire_image(slot)? {
            AcquireOutcome::Ready { image_index, suboptimal } => {
                if suboptimal {
                    log::trace!("Acquired suboptimal image {}", image_index);
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire");
                return Ok(if self.recreate(driver)? {
                    FrameStatus::Recreated
                } else {
                    FrameStatus::Deferred
                });
            }
        };

        let image = image_index as usize;
        let owner = *self
            .images_in_flight
            .get(image)
            .ok_or(FrameError::ImageIndexOutOfRange {
                index: image_index,
                count: self.images_in_flight.len(),
            })?;

        // A frame from another slot may still be rendering into this image
        if let Some(owner) = owner.filter(|&owner| owner != slot) {
            driver.wait_for_slot(owner)?;
        }
        self.images_in_flight[image] = Some(slot);

        driver.update_frame_data(image_index)?;
        driver.submit(slot, image_index)?;

        let present = driver.present(slot, image_index)?;
        let resized = std::mem::take(&mut self.framebuffer_resized);
        let status = if present != PresentOutcome::Presented || resized {
            log::debug!("Recreating swapchain after present ({:?}, resized: {})", present, resized);
            if self.recreate(driver)? {
                FrameStatus::PresentedAndRecreated { image_index }
            } else {
                FrameStatus::PresentedAndDeferred { image_index }
            }
        } else {
            log::trace!("Slot {} presented image {}", slot, image_index);
            FrameStatus::Presented { image_index }
        };

        self.current_frame = (self.current_frame + 1) % self.max_frames_in_flight;
        Ok(status)
    }

    /// Returns false if recreation had to be postponed.
    fn recreate<D: FrameDriver>(&mut self, driver: &mut D) -> Result<bool> {
        self.framebuffer_resized = false;
        match driver.recreate_swapchain()? {
            Some(image_count) => {
                // Only forget the borrowed slot indices; the fences stay alive
                self.images_in_flight.clear();
                self.images_in_flight.resize(image_count, None);
                self.recreate_pending = false;
                Ok(true)
            }
            None => {
                self.recreate_pending = true;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Update(u32),
        Submit(usize, u32),
        Present(usize, u32),
        Recreate,
    }

    /// Pretends to be a GPU. Submitted work stays pending on its slot's fence
    /// until somebody waits on that fence.
    struct FakeGpu {
        image_count: usize,
        next_image: u32,
        /// Image each slot's unsignaled fence is still rendering to.
        pending: Vec<Option<u32>>,
        acquire_script: VecDeque<AcquireOutcome>,
        present_script: VecDeque<PresentOutcome>,
        recreate_script: VecDeque<Option<usize>>,
        calls: Vec<Call>,
        max_outstanding: usize,
    }

    impl FakeGpu {
        fn new(slots: usize, image_count: usize) -> Self {
            Self {
                image_count,
                next_image: 0,
                pending: vec![None; slots],
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                recreate_script: VecDeque::new(),
                calls: Vec::new(),
                max_outstanding: 0,
            }
        }

        fn throttle_waits(&self, slot: usize) -> usize {
            self.calls
                .windows(2)
                .filter(|w| w[0] == Call::Wait(slot) && w[1] == Call::Acquire(slot))
                .count()
        }

        fn count(&self, call: &Call) -> usize {
            self.calls.iter().filter(|c| *c == call).count()
        }
    }

    impl FrameDriver for FakeGpu {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            self.pending[slot] = None;
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            if let Some(outcome) = self.acquire_script.pop_front() {
                return Ok(outcome);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count as u32;
            Ok(AcquireOutcome::Ready { image_index, suboptimal: false })
        }

        fn update_frame_data(&mut self, image_index: u32) -> Result<()> {
            self.calls.push(Call::Update(image_index));
            Ok(())
        }

        fn submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
            self.calls.push(Call::Submit(slot, image_index));
            assert!(self.pending[slot].is_none(), "slot {slot} fence reset while still in flight");
            for (other, image) in self.pending.iter().enumerate() {
                assert_ne!(
                    *image,
                    Some(image_index),
                    "image {image_index} still being written by slot {other}"
                );
            }
            self.pending[slot] = Some(image_index);
            let outstanding = self.pending.iter().flatten().count();
            self.max_outstanding = self.max_outstanding.max(outstanding);
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn recreate_swapchain(&mut self) -> Result<Option<usize>> {
            self.calls.push(Call::Recreate);
            let result = self.recreate_script.pop_front().unwrap_or(Some(self.image_count));
            if let Some(count) = result {
                // Device idle: nothing is in flight any more
                self.pending.iter_mut().for_each(|p| *p = None);
                self.image_count = count;
                self.next_image = 0;
            }
            Ok(result)
        }
    }

    #[test]
    fn two_slots_three_images_four_frames() {
        let mut gpu = FakeGpu::new(2, 3);
        let mut frames = FrameScheduler::new(2, 3);

        for _ in 0..4 {
            assert!(matches!(frames.draw_frame(&mut gpu).unwrap(), FrameStatus::Presented { .. }));
        }

        assert_eq!(gpu.throttle_waits(0), 2);
        assert_eq!(gpu.throttle_waits(1), 2);
        // Frame 3 reacquires image 0, last written by slot 0, from slot 1
        let submit_image0_again = gpu
            .calls
            .iter()
            .position(|c| *c == Call::Submit(1, 0))
            .unwrap();
        assert!(gpu.calls[..submit_image0_again].ends_with(&[
            Call::Acquire(1),
            Call::Wait(0),
            Call::Update(0),
        ]));
        assert_eq!(frames.images_in_flight(), &[Some(1), Some(1), Some(0)]);
        assert_eq!(frames.current_frame(), 0);
    }

    #[test]
    fn never_more_than_max_frames_outstanding() {
        for (slots, images) in [(1, 3), (2, 2), (2, 3), (3, 2), (3, 5)] {
            let mut gpu = FakeGpu::new(slots, images);
            let mut frames = FrameScheduler::new(slots, images);
            for _ in 0..25 {
                frames.draw_frame(&mut gpu).unwrap();
            }
            assert!(gpu.max_outstanding <= slots);
            assert_eq!(gpu.count(&Call::Recreate), 0);
        }
    }

    #[test]
    fn out_of_date_on_acquire_recreates_without_advancing() {
        let mut gpu = FakeGpu::new(2, 3);
        let mut frames = FrameScheduler::new(2, 3);

        for _ in 0..4 {
            frames.draw_frame(&mut gpu).unwrap();
        }
        let slot_before = frames.current_frame();

        gpu.acquire_script.push_back(AcquireOutcome::OutOfDate);
        gpu.recreate_script.push_back(Some(4));
        assert_eq!(frames.draw_frame(&mut gpu).unwrap(), FrameStatus::Recreated);

        assert_eq!(frames.current_frame(), slot_before);
        assert_eq!(frames.images_in_flight(), &[None; 4]);
        assert_eq!(gpu.count(&Call::Recreate), 1);
        assert!(!gpu.calls.iter().any(|c| matches!(c, Call::Submit(_, 3))));

        // The next frame reuses the same slot against the fresh table
        let status = frames.draw_frame(&mut gpu).unwrap();
        assert_eq!(status, FrameStatus::Presented { image_index: 0 });
        assert_eq!(gpu.calls.last(), Some(&Call::Present(slot_before, 0)));
        assert_eq!(frames.images_in_flight(), &[Some(slot_before), None, None, None]);
    }

    #[test]
    fn suboptimal_acquire_still_renders() {
        let mut gpu = FakeGpu::new(2, 3);
        let mut frames = FrameScheduler::new(2, 3);
        gpu.acquire_script
            .push_back(AcquireOutcome::Ready { image_index: 2, suboptimal: true });

        assert_eq!(
            frames.draw_frame(&mut gpu).unwrap(),
            FrameStatus::Presented { image_index: 2 }
        );
        assert_eq!(gpu.count(&Call::Recreate), 0);
    }

    #[test]
    fn present_out_of_date_or_suboptimal_recreates_and_advances() {
        for outcome in [PresentOutcome::OutOfDate, PresentOutcome::Suboptimal] {
            let mut gpu = FakeGpu::new(2, 3);
            let mut frames = FrameScheduler::new(2, 3);
            gpu.present_script.push_back(outcome);

            assert_eq!(
                frames.draw_frame(&mut gpu).unwrap(),
                FrameStatus::PresentedAndRecreated { image_index: 0 }
            );
            assert_eq!(frames.current_frame(), 1);
            assert_eq!(frames.images_in_flight(), &[None; 3]);
        }
    }

    #[test]
    fn resize_flag_recreates_once_and_is_cleared() {
        let mut gpu = FakeGpu::new(2, 3);
        let mut frames = FrameScheduler::new(2, 3);

        frames.notify_resized();
        assert!(frames.is_resize_pending());
        frames.draw_frame(&mut gpu).unwrap();
        frames.draw_frame(&mut gpu).unwrap();

        assert_eq!(gpu.count(&Call::Recreate), 1);
        assert!(!frames.is_resize_pending());
    }

    #[test]
    fn minimized_window_defers_until_it_has_area() {
        let mut gpu = FakeGpu::new(2, 3);
        let mut frames = FrameScheduler::new(2, 3);
        gpu.acquire_script.push_back(AcquireOutcome::OutOfDate);
        gpu.recreate_script.extend([None, None, Some(2)]);

        assert_eq!(frames.draw_frame(&mut gpu).unwrap(), FrameStatus::Deferred);
        assert_eq!(frames.draw_frame(&mut gpu).unwrap(), FrameStatus::Deferred);
        assert!(frames.is_resize_pending());

        let waits_before = gpu.count(&Call::Wait(0));
        assert!(matches!(frames.draw_frame(&mut gpu).unwrap(), FrameStatus::Presented { .. }));
        assert_eq!(gpu.count(&Call::Wait(0)), waits_before + 1);
        assert_eq!(frames.images_in_flight().len(), 2);
        assert_eq!(gpu.count(&Call::Recreate), 3);
    }

    #[test]
    fn present_then_minimized_reports_deferred() {
        let mut gpu = FakeGpu::new(2, 3);
        let mut frames = FrameScheduler::new(2, 3);
        frames.notify_resized();
        gpu.recreate_script.extend([None, Some(3)]);

        assert_eq!(
            frames.draw_frame(&mut gpu).unwrap(),
            FrameStatus::PresentedAndDeferred { image_index: 0 }
        );
        // The presented frame still consumed its slot
        assert_eq!(frames.current_frame(), 1);
        assert!(frames.is_resize_pending());
        assert_eq!(frames.images_in_flight(), &[Some(0), None, None]);

        // Once the window has area again the rebuild runs before rendering
        assert_eq!(
            frames.draw_frame(&mut gpu).unwrap(),
            FrameStatus::Presented { image_index: 0 }
        );
        assert_eq!(gpu.count(&Call::Recreate), 2);
        assert!(!frames.is_resize_pending());
        assert_eq!(frames.images_in_flight(), &[Some(1), None, None]);
    }

    #[test]
    fn requested_recreate_runs_before_first_frame() {
        let mut gpu = FakeGpu::new(2, 3);
        let mut frames = FrameScheduler::new(2, 0);
        frames.request_recreate();
        gpu.recreate_script.extend([None, Some(3)]);

        assert_eq!(frames.draw_frame(&mut gpu).unwrap(), FrameStatus::Deferred);
        assert!(gpu.calls.iter().all(|c| *c == Call::Recreate));

        assert_eq!(
            frames.draw_frame(&mut gpu).unwrap(),
            FrameStatus::Presented { image_index: 0 }
        );
        assert_eq!(frames.images_in_flight(), &[Some(0), None, None]);
    }

    #[test]
    fn image_index_outside_table_is_an_error() {
        let mut gpu = FakeGpu::new(2, 3);
        let mut frames = FrameScheduler::new(2, 3);
        gpu.acquire_script
            .push_back(AcquireOutcome::Ready { image_index: 7, suboptimal: false });

        let err = frames.draw_frame(&mut gpu).unwrap_err();
        assert_eq!(
            err.downcast_ref::<FrameError>(),
            Some(&FrameError::ImageIndexOutOfRange { index: 7, count: 3 })
        );
    }

    #[test]
    fn same_slot_reacquiring_its_image_skips_extra_wait() {
        let mut gpu = FakeGpu::new(1, 1);
        let mut frames = FrameScheduler::new(1, 1);
        frames.draw_frame(&mut gpu).unwrap();
        frames.draw_frame(&mut gpu).unwrap();
        assert_eq!(gpu.count(&Call::Wait(0)), 2);
    }
}
