// SPDX-License-Identifier: CEPL-1.0
use ash::khr::{surface, swapchain};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tide_render::RenderSize;
use tracing::{debug, info, warn};

use crate::device::{create_logical_device, select_physical_device, LogicalDevice, VkProbe};
use crate::error::{GpuError, GpuResult};
use crate::frame::{staging_pixel, Commands, StagingBuffer, VkFrameDevice};
use crate::instance::{create_instance, required_instance_extensions, DebugMessenger};
use crate::swapchain::{negotiate_swapchain, Swapchain};
use crate::sync::{FrameOutcome, FramePacing, FrameSynchronizer, DEFAULT_MAX_FRAMES_IN_FLIGHT};
use crate::teardown::{Stage, Teardown};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VkConfig {
    /// Loads `VK_LAYER_KHRONOS_validation` and routes its output to `tracing`.
    pub enable_diagnostics: bool,
    pub max_frames_in_flight: usize,
    pub requested_extent: RenderSize,
    pub clear_color: [f32; 4],
    pub pacing: FramePacing,
}

impl Default for VkConfig {
    fn default() -> Self {
        Self {
            enable_diagnostics: false,
            max_frames_in_flight: DEFAULT_MAX_FRAMES_IN_FLIGHT,
            requested_extent: RenderSize::new(1280, 720),
            clear_color: [0.02, 0.02, 0.04, 1.0],
            pacing: FramePacing::QueueIdle,
        }
    }
}

fn record(ledger: &mut Teardown, stage: Stage) -> GpuResult<()> {
    if ledger.push(stage) {
        Ok(())
    } else {
        Err(GpuError::Initialization(format!("{stage:?} created out of order")))
    }
}

fn not_ready(what: &str) -> GpuError {
    GpuError::Initialization(format!("{what} is not available"))
}

/// Every Vulkan object of one presentation run.
///
/// Fields fill in creation order and the ledger tracks which exist, so a
/// failure halfway through `new` and a normal drop release through the same
/// path.
pub struct GraphicsContext {
    cfg: VkConfig,
    ledger: Teardown,

    entry: Entry,
    instance: Option<ash::Instance>,
    debug: Option<DebugMessenger>,
    surface_loader: Option<surface::Instance>,
    surface: vk::SurfaceKHR,
    physical: vk::PhysicalDevice,
    device_name: String,
    device: Option<LogicalDevice>,
    swapchain_loader: Option<swapchain::Device>,

    sync: Option<FrameSynchronizer>,
    commands: Option<Commands>,
    swapchain: Option<Swapchain>,
    staging: Option<StagingBuffer>,
}

impl GraphicsContext {
    /// Brings up instance, surface, device, sync objects and (for a non-empty
    /// `size`) the swap chain.
    ///
    /// # Safety
    /// The handles must stay valid until the context is dropped.
    pub unsafe fn new(
        window: RawWindowHandle,
        display: RawDisplayHandle,
        size: RenderSize,
        cfg: VkConfig,
    ) -> GpuResult<Self> {
        let mut ctx = Self {
            cfg,
            ledger: Teardown::new(),
            entry: Entry::linked(),
            instance: None,
            debug: None,
            surface_loader: None,
            surface: vk::SurfaceKHR::null(),
            physical: vk::PhysicalDevice::null(),
            device_name: String::new(),
            device: None,
            swapchain_loader: None,
            sync: None,
            commands: None,
            swapchain: None,
            staging: None,
        };
        // on error `ctx` drops here and releases whatever the ledger holds
        unsafe { ctx.build(window, display, size) }?;
        Ok(ctx)
    }

    unsafe fn build(
        &mut self,
        window: RawWindowHandle,
        display: RawDisplayHandle,
        size: RenderSize,
    ) -> GpuResult<()> {
        let diag = self.cfg.enable_diagnostics;

        let extensions = required_instance_extensions(display)?;
        let instance = unsafe { create_instance(&self.entry, &extensions, diag) }?;
        let instance: &ash::Instance = self.instance.insert(instance);
        record(&mut self.ledger, Stage::Instance)?;

        if diag {
            self.debug = Some(unsafe { DebugMessenger::new(&self.entry, instance) }?);
            record(&mut self.ledger, Stage::DebugMessenger)?;
        }

        self.surface =
            unsafe { ash_window::create_surface(&self.entry, instance, display, window, None) }
                .map_err(GpuError::Surface)?;
        let surface_loader: &surface::Instance = self
            .surface_loader
            .insert(surface::Instance::new(&self.entry, instance));
        record(&mut self.ledger, Stage::Surface)?;

        let probe = VkProbe {
            instance,
            surface_loader,
            surface: self.surface,
        };
        let selected = select_physical_device(&probe)?;
        self.physical = selected.physical;
        self.device_name = selected.name.clone();

        let logical = unsafe { create_logical_device(instance, &selected, diag) }?;
        self.swapchain_loader = Some(swapchain::Device::new(instance, &logical.device));
        let logical: &LogicalDevice = self.device.insert(logical);
        record(&mut self.ledger, Stage::Device)?;

        let frames = self.cfg.max_frames_in_flight;
        self.sync = Some(unsafe { FrameSynchronizer::create(&logical.device, frames, 0) }?);
        record(&mut self.ledger, Stage::SyncObjects)?;

        self.commands =
            Some(unsafe { Commands::create(&logical.device, logical.families.graphics, frames) }?);
        record(&mut self.ledger, Stage::Commands)?;

        if size.is_empty() {
            info!("vk: window has no area yet, swapchain deferred");
            return Ok(());
        }
        unsafe { self.build_swapchain(size, vk::SwapchainKHR::null()) }
    }

    /// Negotiates a swap chain, its views and the matching staging buffer.
    /// Leaves the swap chain absent when the surface has no area.
    unsafe fn build_swapchain(&mut self, want: RenderSize, old: vk::SwapchainKHR) -> GpuResult<()> {
        let (Some(instance), Some(surface_loader), Some(logical), Some(loader)) = (
            self.instance.as_ref(),
            self.surface_loader.as_ref(),
            self.device.as_ref(),
            self.swapchain_loader.as_ref(),
        ) else {
            return Err(not_ready("device"));
        };
        let probe = VkProbe {
            instance,
            surface_loader,
            surface: self.surface,
        };

        let negotiated = unsafe {
            negotiate_swapchain(
                &probe,
                self.physical,
                &logical.device,
                loader,
                self.surface,
                want,
                logical.families,
                old,
            )
        };
        let built = match negotiated {
            Ok(built) => built,
            Err(GpuError::NoDrawableArea) => {
                info!("vk: surface has no area, swapchain deferred");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let extent = built.extent();
        let image_count = built.image_count();
        let format = built.format();
        self.swapchain = Some(built);
        record(&mut self.ledger, Stage::Swapchain)?;
        record(&mut self.ledger, Stage::ImageViews)?;

        let pixel = staging_pixel(format, self.cfg.clear_color)?;

        let staging =
            unsafe { StagingBuffer::create(instance, self.physical, &logical.device, extent, pixel) }?;
        self.staging = Some(staging);
        record(&mut self.ledger, Stage::StagingBuffer)?;

        if let Some(sync) = self.sync.as_mut() {
            sync.reset_images(image_count);
        }
        Ok(())
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    fn wait_idle(&self) -> GpuResult<()> {
        match self.device.as_ref() {
            Some(logical) => unsafe { logical.device.device_wait_idle() }
                .map_err(GpuError::submit("vkDeviceWaitIdle")),
            None => Ok(()),
        }
    }

    /// Rebuilds the swap chain for `want`, recycling the old one.
    ///
    /// Only the stages above `Commands` are touched; sync objects and command
    /// buffers survive. A surface with no area leaves [`Self::swapchain`]
    /// empty until a later call succeeds.
    pub fn recreate_swapchain(&mut self, want: RenderSize) -> GpuResult<()> {
        self.wait_idle()?;

        for stage in self.ledger.unwind_to(Stage::Commands) {
            // the old swap chain is handed to the driver before it goes
            if stage != Stage::Swapchain {
                unsafe { self.release(stage) };
            }
        }
        let mut old = self.swapchain.take();
        let old_handle = old
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |sc| sc.handle);

        let built = unsafe { self.build_swapchain(want, old_handle) };

        if let (Some(old), Some(loader)) = (old.as_mut(), self.swapchain_loader.as_ref()) {
            unsafe { old.destroy(loader) };
        }
        built?;

        if let Some(sc) = self.swapchain.as_ref() {
            info!(
                "vk: swapchain recreated {}x{} ({} images)",
                sc.extent().width,
                sc.extent().height,
                sc.image_count()
            );
        }
        Ok(())
    }

    /// Runs one frame through the synchronizer.
    pub fn draw_frame(&mut self) -> GpuResult<FrameOutcome> {
        let pacing = self.cfg.pacing;
        let (Some(logical), Some(loader), Some(swapchain), Some(commands), Some(staging), Some(sync)) = (
            self.device.as_ref(),
            self.swapchain_loader.as_ref(),
            self.swapchain.as_ref(),
            self.commands.as_ref(),
            self.staging.as_ref(),
            self.sync.as_mut(),
        ) else {
            return Err(not_ready("swapchain"));
        };

        let mut dev = VkFrameDevice {
            device: &logical.device,
            swapchain_loader: loader,
            swapchain,
            graphics_queue: logical.graphics_queue,
            present_queue: logical.present_queue,
            commands,
            staging,
        };
        sync.run_frame(&mut dev, pacing)
    }

    unsafe fn release(&mut self, stage: Stage) {
        let device = self.device.as_ref().map(|l| &l.device);
        match stage {
            Stage::StagingBuffer => {
                if let (Some(mut staging), Some(d)) = (self.staging.take(), device) {
                    unsafe { staging.destroy(d) };
                }
            }
            Stage::ImageViews => {
                if let (Some(sc), Some(d)) = (self.swapchain.as_mut(), device) {
                    unsafe { sc.destroy_views(d) };
                }
            }
            Stage::Swapchain => {
                if let (Some(mut sc), Some(loader)) =
                    (self.swapchain.take(), self.swapchain_loader.as_ref())
                {
                    unsafe { sc.destroy(loader) };
                }
            }
            Stage::Commands => {
                if let (Some(mut commands), Some(d)) = (self.commands.take(), device) {
                    unsafe { commands.destroy(d) };
                }
            }
            Stage::SyncObjects => {
                if let (Some(mut sync), Some(d)) = (self.sync.take(), device) {
                    unsafe { sync.destroy(d) };
                }
            }
            Stage::Device => {
                self.swapchain_loader = None;
                if let Some(logical) = self.device.take() {
                    unsafe { logical.device.destroy_device(None) };
                }
            }
            Stage::Surface => {
                if let Some(loader) = self.surface_loader.take() {
                    unsafe { loader.destroy_surface(self.surface, None) };
                }
                self.surface = vk::SurfaceKHR::null();
            }
            Stage::DebugMessenger => {
                if let Some(messenger) = self.debug.take() {
                    unsafe { messenger.destroy() };
                }
            }
            Stage::Instance => {
                if let Some(instance) = self.instance.take() {
                    unsafe { instance.destroy_instance(None) };
                }
            }
        }
        debug!("vk: released {stage:?}");
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            warn!("vk: device_wait_idle before teardown failed: {e}");
        }
        for stage in self.ledger.drain() {
            unsafe { self.release(stage) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = VkConfig::default();
        assert!(!cfg.enable_diagnostics);
        assert_eq!(cfg.max_frames_in_flight, 3);
        assert_eq!(cfg.requested_extent, RenderSize::new(1280, 720));
        assert_eq!(cfg.pacing, FramePacing::QueueIdle);
    }

    #[test]
    fn out_of_order_creation_is_an_error() {
        let mut ledger = Teardown::new();
        record(&mut ledger, Stage::Instance).unwrap();
        record(&mut ledger, Stage::Device).unwrap();

        let err = record(&mut ledger, Stage::Surface).unwrap_err();
        assert!(matches!(err, GpuError::Initialization(ref m) if m.contains("Surface")));
        assert!(!ledger.contains(Stage::Surface));

        // a second device on top of the first is rejected as well
        assert!(record(&mut ledger, Stage::Device).is_err());
        assert_eq!(ledger.drain(), vec![Stage::Device, Stage::Instance]);
    }
}
