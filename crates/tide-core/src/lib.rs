// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::time::{Duration, Instant};

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

/// Counts presented frames and yields a total once per reporting window.
#[derive(Debug, Clone)]
pub struct FpsCounter {
    window: Duration,
    frames: u32,
    since: Instant,
}

impl FpsCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            frames: 0,
            since: Instant::now(),
        }
    }

    pub fn frame(&mut self) -> Option<u32> {
        self.frame_at(Instant::now())
    }

    pub fn frame_at(&mut self, now: Instant) -> Option<u32> {
        self.frames = self.frames.saturating_add(1);
        if now.saturating_duration_since(self.since) < self.window {
            return None;
        }
        let total = self.frames;
        self.frames = 0;
        self.since = now;
        Some(total)
    }

    /// Drops the partial count, e.g. while presentation is paused.
    pub fn reset(&mut self) {
        self.frames = 0;
        self.since = Instant::now();
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_once_the_window_has_elapsed() {
        let mut fps = FpsCounter::new(Duration::from_secs(1));
        let start = fps.since;
        assert_eq!(fps.frame_at(start + Duration::from_millis(100)), None);
        assert_eq!(fps.frame_at(start + Duration::from_millis(500)), None);
        assert_eq!(fps.frame_at(start + Duration::from_millis(1000)), Some(3));
        // counter restarts after a report
        assert_eq!(fps.frame_at(start + Duration::from_millis(1100)), None);
        assert_eq!(fps.frame_at(start + Duration::from_millis(2000)), Some(2));
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
