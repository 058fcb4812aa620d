// SPDX-License-Identifier: CEPL-1.0
//! `winit` window driven by pumping, so the present loop owns the frame
//! cadence instead of the event loop.
use std::time::Duration;

use anyhow::{bail, Context, Result};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use tide_render::{CapabilitySurface, RenderSize};
use tracing::{debug, error, info};

pub use winit;

use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowId},
};

struct WindowState {
    title: String,
    requested: RenderSize,
    window: Option<Window>,
    size: RenderSize,
    pending_resize: Option<RenderSize>,
    close_requested: bool,
    create_error: Option<String>,
}

impl WindowState {
    fn new(title: &str, requested: RenderSize) -> Self {
        Self {
            title: title.to_owned(),
            requested,
            window: None,
            size: RenderSize::new(0, 0),
            pending_resize: None,
            close_requested: false,
            create_error: None,
        }
    }

    /// Returns `true` when the loop should stop.
    fn apply(&mut self, event: WindowEvent) -> bool {
        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_requested = true;
                true
            }
            WindowEvent::Resized(new_size) => {
                let size = RenderSize::new(new_size.width, new_size.height);
                if size != self.size {
                    debug!("window resized → {}x{}", size.width, size.height);
                    self.size = size;
                    // only the latest size matters
                    self.pending_resize = Some(size);
                }
                false
            }
            _ => false,
        }
    }
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title(self.title.clone())
            .with_inner_size(PhysicalSize::new(
                self.requested.width,
                self.requested.height,
            ));
        match event_loop.create_window(attrs) {
            Ok(window) => {
                let inner = window.inner_size();
                self.size = RenderSize::new(inner.width, inner.height);
                info!(
                    "window '{}' created ({}x{})",
                    self.title, self.size.width, self.size.height
                );
                self.window = Some(window);
            }
            Err(e) => {
                error!("create_window failed: {e}");
                self.create_error = Some(e.to_string());
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if self.window.as_ref().is_some_and(|w| w.id() != window_id) {
            return;
        }
        if self.apply(event) {
            event_loop.exit();
        }
    }
}

/// The capability surface over a single `winit` window.
pub struct WinitSurface {
    // declared first so the window goes before the event loop
    state: WindowState,
    event_loop: EventLoop<()>,
    exited: bool,
}

impl WinitSurface {
    /// Creates the event loop and pumps it until the window exists.
    pub fn open(title: &str, size: RenderSize) -> Result<Self> {
        let event_loop = EventLoop::new().context("creating the event loop")?;
        let mut surface = Self {
            state: WindowState::new(title, size),
            event_loop,
            exited: false,
        };

        while surface.state.window.is_none() {
            surface.pump(Some(Duration::ZERO));
            if let Some(e) = surface.state.create_error.take() {
                bail!("window creation failed: {e}");
            }
            if surface.exited {
                bail!("event loop exited before the window was created");
            }
        }
        Ok(surface)
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        if let PumpStatus::Exit(code) = self.event_loop.pump_app_events(timeout, &mut self.state) {
            debug!("event loop exit ({code})");
            self.exited = true;
        }
    }
}

impl CapabilitySurface for WinitSurface {
    fn poll_events(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    fn wait_events(&mut self) {
        self.pump(None);
    }

    fn should_close(&self) -> bool {
        self.state.close_requested || self.exited
    }

    fn size(&self) -> RenderSize {
        self.state.size
    }

    fn take_resize(&mut self) -> Option<RenderSize> {
        self.state.pending_resize.take()
    }
}

impl HasWindowHandle for WinitSurface {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.state
            .window
            .as_ref()
            .ok_or(HandleError::Unavailable)?
            .window_handle()
    }
}

impl HasDisplayHandle for WinitSurface {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.event_loop.display_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_request_stops_the_loop() {
        let mut state = WindowState::new("t", RenderSize::new(640, 480));
        assert!(!state.apply(WindowEvent::Focused(true)));
        assert!(state.apply(WindowEvent::CloseRequested));
        assert!(state.close_requested);
    }

    #[test]
    fn resizes_coalesce_to_the_latest() {
        let mut state = WindowState::new("t", RenderSize::new(640, 480));
        state.apply(WindowEvent::Resized(PhysicalSize::new(800, 600)));
        state.apply(WindowEvent::Resized(PhysicalSize::new(0, 0)));
        assert_eq!(state.pending_resize.take(), Some(RenderSize::new(0, 0)));
        assert!(state.size.is_empty());
        assert_eq!(state.pending_resize, None);
    }

    #[test]
    fn unchanged_size_is_not_reported() {
        let mut state = WindowState::new("t", RenderSize::new(640, 480));
        state.size = RenderSize::new(640, 480);
        state.apply(WindowEvent::Resized(PhysicalSize::new(640, 480)));
        assert_eq!(state.pending_resize, None);
    }
}
