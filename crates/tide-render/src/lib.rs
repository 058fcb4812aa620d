// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use tide_core::FpsCounter;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A zero-area size means the window is minimised and nothing can be presented.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// The windowing side of the present loop: events, close and resize signals.
///
/// Native handles are not part of this trait; a backend takes them separately
/// through `raw-window-handle` when it builds its surface.
pub trait CapabilitySurface {
    fn poll_events(&mut self);

    /// Blocks until something happens. Used while presentation is paused.
    fn wait_events(&mut self) {
        self.poll_events();
    }

    fn should_close(&self) -> bool;

    /// Current pixel extent of the drawable area.
    fn size(&self) -> RenderSize;

    /// Returns the latest resize notification since the previous call, if any.
    fn take_resize(&mut self) -> Option<RenderSize>;
}

pub trait Presenter {
    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<()>;
}

/// Drives `presenter` once per poll cycle until the surface asks to close.
///
/// Returns the number of frames handed to the presenter. Any presenter error
/// ends the loop; the caller owns teardown.
pub fn run_present_loop(
    surface: &mut dyn CapabilitySurface,
    presenter: &mut dyn Presenter,
) -> Result<u64> {
    let mut paused = surface.size().is_empty();
    let mut fps = FpsCounter::default();
    let mut presented = 0u64;

    info!("present loop start (paused={paused})");

    while !surface.should_close() {
        if paused {
            surface.wait_events();
        } else {
            surface.poll_events();
        }

        if let Some(size) = surface.take_resize() {
            let now_paused = size.is_empty();
            if now_paused != paused {
                info!(
                    "resized → {}x{} (paused={})",
                    size.width, size.height, now_paused
                );
                paused = now_paused;
            } else {
                debug!("resized → {}x{}", size.width, size.height);
            }
            if !paused {
                presenter.resize(size).context("presenter resize")?;
            }
        }

        if paused {
            fps.reset();
            continue;
        }

        presenter.render().context("presenter render")?;
        presented += 1;

        if let Some(frames) = fps.frame() {
            info!("fps ~ {frames}");
        }
    }

    info!("present loop exit after {presented} frame(s)");
    Ok(presented)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::VecDeque;

    /// Each poll pops one scripted resize (or nothing); closes when the script runs out.
    struct ScriptedSurface {
        script: VecDeque<Option<RenderSize>>,
        pending: Option<RenderSize>,
        size: RenderSize,
        polls: u32,
        waits: u32,
        closed: bool,
    }

    impl ScriptedSurface {
        fn new(size: RenderSize, script: Vec<Option<RenderSize>>) -> Self {
            Self {
                script: script.into(),
                pending: None,
                size,
                polls: 0,
                waits: 0,
                closed: false,
            }
        }

        fn step(&mut self) {
            match self.script.pop_front() {
                Some(Some(size)) => {
                    self.size = size;
                    self.pending = Some(size);
                }
                Some(None) => {}
                None => self.closed = true,
            }
        }
    }

    impl CapabilitySurface for ScriptedSurface {
        fn poll_events(&mut self) {
            self.polls += 1;
            self.step();
        }

        fn wait_events(&mut self) {
            self.waits += 1;
            self.step();
        }

        fn should_close(&self) -> bool {
            self.closed
        }

        fn size(&self) -> RenderSize {
            self.size
        }

        fn take_resize(&mut self) -> Option<RenderSize> {
            self.pending.take()
        }
    }

    #[derive(Default)]
    struct CountingPresenter {
        renders: u32,
        resizes: Vec<RenderSize>,
        fail_on: Option<u32>,
    }

    impl Presenter for CountingPresenter {
        fn resize(&mut self, size: RenderSize) -> Result<()> {
            self.resizes.push(size);
            Ok(())
        }

        fn render(&mut self) -> Result<()> {
            self.renders += 1;
            if Some(self.renders) == self.fail_on {
                return Err(anyhow!("device lost"));
            }
            Ok(())
        }
    }

    #[test]
    fn runs_one_frame_per_poll_until_close() {
        let mut surface = ScriptedSurface::new(RenderSize::new(1280, 720), vec![None; 10]);
        let mut presenter = CountingPresenter::default();

        let frames = run_present_loop(&mut surface, &mut presenter).unwrap();

        // the closing poll still renders once before the condition is rechecked
        assert_eq!(frames, 11);
        assert_eq!(presenter.renders, 11);
        assert_eq!(surface.polls, 11);
        assert!(presenter.resizes.is_empty());
    }

    #[test]
    fn zero_area_resize_pauses_until_restored() {
        let script = vec![
            None,
            Some(RenderSize::new(0, 0)),
            None,
            None,
            Some(RenderSize::new(800, 600)),
            None,
        ];
        let mut surface = ScriptedSurface::new(RenderSize::new(1280, 720), script);
        let mut presenter = CountingPresenter::default();

        run_present_loop(&mut surface, &mut presenter).unwrap();

        assert_eq!(presenter.resizes, vec![RenderSize::new(800, 600)]);
        // poll 2 pauses, the next three cycles wait, the third of them resumes
        assert_eq!(surface.waits, 3);
        assert_eq!(presenter.renders, 4);
    }

    #[test]
    fn starts_paused_for_minimised_window() {
        let script = vec![None, Some(RenderSize::new(640, 480))];
        let mut surface = ScriptedSurface::new(RenderSize::new(0, 0), script);
        let mut presenter = CountingPresenter::default();

        run_present_loop(&mut surface, &mut presenter).unwrap();

        assert_eq!(surface.waits, 2);
        assert_eq!(presenter.resizes, vec![RenderSize::new(640, 480)]);
        // one frame after the resize, one on the closing poll
        assert_eq!(presenter.renders, 2);
    }

    #[test]
    fn render_error_ends_the_loop() {
        let mut surface = ScriptedSurface::new(RenderSize::new(1280, 720), vec![None; 10]);
        let mut presenter = CountingPresenter {
            fail_on: Some(3),
            ..Default::default()
        };

        let err = run_present_loop(&mut surface, &mut presenter).unwrap_err();

        assert!(format!("{err:#}").contains("device lost"));
        assert_eq!(presenter.renders, 3);
    }

    #[test]
    fn empty_size_detection() {
        assert!(RenderSize::new(0, 720).is_empty());
        assert!(RenderSize::new(1280, 0).is_empty());
        assert!(!RenderSize::new(1, 1).is_empty());
    }
}
