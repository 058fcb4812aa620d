// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Vulkan presentation core: instance, device, swap chain and the
//! frames-in-flight loop behind [`VkPresenter`].
use anyhow::{Context, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tide_render::{Presenter, RenderSize};
use tracing::{debug, info};

pub mod context;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod swapchain;
pub mod sync;
pub mod teardown;

pub use context::{GraphicsContext, VkConfig};
pub use error::{GpuError, GpuResult};
pub use sync::{FrameOutcome, FramePacing};

pub struct VkPresenter {
    ctx: GraphicsContext,
    size: RenderSize,
}

impl VkPresenter {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: VkConfig,
    ) -> Result<Self> {
        let wh = window
            .window_handle()
            .map_err(|e| anyhow::anyhow!("window handle: {e}"))?
            .as_raw();
        let dh = display
            .display_handle()
            .map_err(|e| anyhow::anyhow!("display handle: {e}"))?
            .as_raw();

        // SAFETY: the caller drops the presenter before the window.
        let ctx = unsafe { GraphicsContext::new(wh, dh, size, cfg) }
            .context("Vulkan bring-up failed")?;
        info!(
            "vk: presenting on '{}' with {} frame(s) in flight, pacing {:?}",
            ctx.device_name(),
            cfg.max_frames_in_flight,
            cfg.pacing
        );
        Ok(Self { ctx, size })
    }
}

impl Presenter for VkPresenter {
    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size.is_empty() {
            return Ok(());
        }
        self.size = size;
        self.ctx
            .recreate_swapchain(size)
            .context("swapchain recreation after resize")
    }

    fn render(&mut self) -> Result<()> {
        if self.ctx.swapchain().is_none() {
            if self.size.is_empty() {
                return Ok(());
            }
            self.ctx
                .recreate_swapchain(self.size)
                .context("deferred swapchain creation")?;
            if self.ctx.swapchain().is_none() {
                // surface still has no area
                return Ok(());
            }
        }

        match self.ctx.draw_frame().context("frame")? {
            FrameOutcome::Presented => Ok(()),
            outcome => {
                debug!("vk: {outcome:?}, rebuilding swapchain");
                self.ctx
                    .recreate_swapchain(self.size)
                    .context("swapchain recreation")
            }
        }
    }
}
