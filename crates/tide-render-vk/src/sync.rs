// SPDX-License-Identifier: CEPL-1.0
//! Frames-in-flight synchronization.
//!
//! STRICT PER-FRAME ORDER:
//! 1) wait the slot fence (CPU), so the slot's semaphores are free again
//! 2) acquire_next_image (signals the slot's image-acquired semaphore)
//! 3) wait the fence of whichever slot last used that image, then take it over
//! 4) reset the slot fence, submit (waits image-acquired, signals
//!    render-finished + the fence)
//! 5) present (waits render-finished)
//!
//! Slots rotate round robin. The CPU fence wait in step 1 is the only thing
//! bounding the number of frames in flight.
use ash::vk;
use tracing::debug;

use crate::error::{GpuError, GpuResult};

pub const DEFAULT_MAX_FRAMES_IN_FLIGHT: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquiring,
    Submitted,
}

/// Whether the loop blocks on present-queue idle after every present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FramePacing {
    /// Latency-costly but simple: the GPU is drained every frame.
    #[default]
    QueueIdle,
    /// Only the slot fences and the image ownership map pace the CPU.
    Pipelined,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Presented, but the swap chain no longer matches the surface exactly.
    Suboptimal,
    /// Nothing was presented; the swap chain must be rebuilt first.
    OutOfDate,
}

#[derive(Clone, Copy, Debug)]
pub struct FrameSlot {
    pub image_acquired: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
    state: SlotState,
    image: Option<u32>,
}

impl FrameSlot {
    pub fn new(image_acquired: vk::Semaphore, render_finished: vk::Semaphore, in_flight: vk::Fence) -> Self {
        Self {
            image_acquired,
            render_finished,
            in_flight,
            state: SlotState::Idle,
            image: None,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

/// The GPU-facing operations the synchronizer drives.
pub trait FrameDevice {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> GpuResult<()>;
    fn reset_fence(&mut self, fence: vk::Fence) -> GpuResult<()>;
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> GpuResult<AcquiredImage>;
    /// Records the slot's work against `image` and submits it.
    fn submit(
        &mut self,
        slot: usize,
        image: u32,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> GpuResult<()>;
    /// Returns `true` when the present was suboptimal.
    fn present(&mut self, image: u32, wait: vk::Semaphore) -> GpuResult<bool>;
    fn wait_present_idle(&mut self) -> GpuResult<()>;
}

pub struct FrameSynchronizer {
    slots: Vec<FrameSlot>,
    images_in_flight: Vec<Option<vk::Fence>>,
    current: usize,
}

impl FrameSynchronizer {
    pub fn new(slots: Vec<FrameSlot>, image_count: usize) -> GpuResult<Self> {
        if slots.is_empty() {
            return Err(GpuError::SynchronizationObject(
                vk::Result::ERROR_INITIALIZATION_FAILED,
            ));
        }
        Ok(Self {
            slots,
            images_in_flight: vec![None; image_count],
            current: 0,
        })
    }

    /// Creates `frames` slots: two semaphores and one fence each. Fences start
    /// signaled so the first wait on every slot returns at once.
    ///
    /// # Safety
    /// The objects must be released with [`FrameSynchronizer::destroy`] on the same device.
    pub unsafe fn create(device: &ash::Device, frames: usize, image_count: usize) -> GpuResult<Self> {
        let sem_ci = vk::SemaphoreCreateInfo::default();
        let fence_ci = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        let mut slots: Vec<FrameSlot> = Vec::with_capacity(frames);
        let mut created = || -> Result<(), vk::Result> {
            for _ in 0..frames {
                let acquired = unsafe { device.create_semaphore(&sem_ci, None) }?;
                let finished = match unsafe { device.create_semaphore(&sem_ci, None) } {
                    Ok(s) => s,
                    Err(e) => {
                        unsafe { device.destroy_semaphore(acquired, None) };
                        return Err(e);
                    }
                };
                let fence = match unsafe { device.create_fence(&fence_ci, None) } {
                    Ok(f) => f,
                    Err(e) => {
                        unsafe {
                            device.destroy_semaphore(acquired, None);
                            device.destroy_semaphore(finished, None);
                        }
                        return Err(e);
                    }
                };
                slots.push(FrameSlot::new(acquired, finished, fence));
            }
            Ok(())
        };

        if let Err(e) = created() {
            for slot in &slots {
                unsafe { destroy_slot(device, slot) };
            }
            return Err(GpuError::SynchronizationObject(e));
        }

        debug!("vk: {frames} frame slot(s) created");
        Self::new(slots, image_count)
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for slot in self.slots.drain(..) {
            unsafe { destroy_slot(device, &slot) };
        }
        self.images_in_flight.clear();
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    /// Slots currently between `begin_frame` and `end_frame`.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != SlotState::Idle)
            .count()
    }

    pub fn image_owner(&self, image: u32) -> Option<vk::Fence> {
        self.images_in_flight.get(image as usize).copied().flatten()
    }

    /// Forgets image ownership after the swap chain was rebuilt with `image_count` images.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight = vec![None; image_count];
        for slot in &mut self.slots {
            slot.state = SlotState::Idle;
            slot.image = None;
        }
    }

    /// Blocks until the current slot's previous submission has finished.
    pub fn begin_frame(&mut self, dev: &mut dyn FrameDevice) -> GpuResult<usize> {
        let slot = &mut self.slots[self.current];
        debug_assert_eq!(slot.state, SlotState::Idle);
        dev.wait_for_fence(slot.in_flight)?;
        slot.state = SlotState::Acquiring;
        Ok(self.current)
    }

    pub fn acquire_image(&mut self, dev: &mut dyn FrameDevice) -> GpuResult<AcquiredImage> {
        let current = self.current;
        let (acquire_sem, own_fence) = {
            let slot = &self.slots[current];
            debug_assert_eq!(slot.state, SlotState::Acquiring);
            (slot.image_acquired, slot.in_flight)
        };

        let acquired = match dev.acquire_next_image(acquire_sem) {
            Ok(acquired) => acquired,
            Err(e) => {
                self.slots[current].state = SlotState::Idle;
                return Err(e);
            }
        };

        let count = self.images_in_flight.len();
        let Some(&previous) = self.images_in_flight.get(acquired.index as usize) else {
            self.slots[current].state = SlotState::Idle;
            return Err(GpuError::UnknownImage {
                index: acquired.index,
                count,
            });
        };

        // Another slot may still be writing this image.
        if let Some(fence) = previous.filter(|&f| f != own_fence) {
            if let Err(e) = dev.wait_for_fence(fence) {
                self.slots[current].state = SlotState::Idle;
                return Err(e);
            }
        }
        self.images_in_flight[acquired.index as usize] = Some(own_fence);

        let slot = &mut self.slots[current];
        slot.image = Some(acquired.index);
        slot.state = SlotState::Submitted;
        Ok(acquired)
    }

    /// Submits the slot's work and presents. Returns `true` when the present
    /// was suboptimal.
    pub fn end_frame(&mut self, dev: &mut dyn FrameDevice) -> GpuResult<bool> {
        let current = self.current;
        let slot = self.slots[current];
        debug_assert_eq!(slot.state, SlotState::Submitted);
        let Some(image) = slot.image else {
            return Err(GpuError::Submit {
                what: "end_frame without an acquired image",
                result: vk::Result::ERROR_UNKNOWN,
            });
        };

        dev.reset_fence(slot.in_flight)?;
        let submitted = dev.submit(
            current,
            image,
            slot.image_acquired,
            slot.render_finished,
            slot.in_flight,
        );

        let s = &mut self.slots[current];
        s.state = SlotState::Idle;
        s.image = None;
        submitted?;

        dev.present(image, slot.render_finished)
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// One full iteration of the present loop for the current slot.
    pub fn run_frame(
        &mut self,
        dev: &mut dyn FrameDevice,
        pacing: FramePacing,
    ) -> GpuResult<FrameOutcome> {
        self.begin_frame(dev)?;

        let acquired = match self.acquire_image(dev) {
            Ok(acquired) => acquired,
            Err(e) if e.is_out_of_date() => return Ok(FrameOutcome::OutOfDate),
            Err(e) => return Err(e),
        };

        let presented = self.end_frame(dev);
        if pacing == FramePacing::QueueIdle {
            dev.wait_present_idle()?;
        }
        self.advance();

        match presented {
            Ok(suboptimal) if suboptimal || acquired.suboptimal => Ok(FrameOutcome::Suboptimal),
            Ok(_) => Ok(FrameOutcome::Presented),
            Err(e) if e.is_out_of_date() => Ok(FrameOutcome::OutOfDate),
            Err(e) => Err(e),
        }
    }
}

unsafe fn destroy_slot(device: &ash::Device, slot: &FrameSlot) {
    unsafe {
        device.destroy_semaphore(slot.image_acquired, None);
        device.destroy_semaphore(slot.render_finished, None);
        device.destroy_fence(slot.in_flight, None);
    }
}
