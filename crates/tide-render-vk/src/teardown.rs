// SPDX-License-Identifier: CEPL-1.0
//! Creation ledger for the Vulkan objects owned by a `GraphicsContext`.
//!
//! STRICT CREATION ORDER (release runs it backwards):
//! instance → debug messenger → surface → device → sync objects → commands
//! → swapchain → image views → staging buffer.
//!
//! Swapchain recreation only touches the three topmost stages, so the ledger
//! stays a plain stack.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Instance,
    DebugMessenger,
    Surface,
    Device,
    SyncObjects,
    Commands,
    Swapchain,
    ImageViews,
    StagingBuffer,
}

#[derive(Debug, Default)]
pub struct Teardown {
    created: Vec<Stage>,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `stage` as created. Returns `false` (and records nothing) when
    /// the stage would break the static order.
    #[must_use]
    pub fn push(&mut self, stage: Stage) -> bool {
        match self.created.last() {
            Some(&top) if top >= stage => false,
            _ => {
                self.created.push(stage);
                true
            }
        }
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.created.contains(&stage)
    }

    /// Pops every stage above `floor` (exclusive), newest first.
    pub fn unwind_to(&mut self, floor: Stage) -> Vec<Stage> {
        let mut popped = Vec::new();
        while let Some(&top) = self.created.last() {
            if top <= floor {
                break;
            }
            popped.push(top);
            self.created.pop();
        }
        popped
    }

    /// Pops everything, newest first.
    pub fn drain(&mut self) -> Vec<Stage> {
        let mut all = std::mem::take(&mut self.created);
        all.reverse();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> Teardown {
        let mut t = Teardown::new();
        for stage in [
            Stage::Instance,
            Stage::DebugMessenger,
            Stage::Surface,
            Stage::Device,
            Stage::SyncObjects,
            Stage::Commands,
            Stage::Swapchain,
            Stage::ImageViews,
            Stage::StagingBuffer,
        ] {
            assert!(t.push(stage));
        }
        t
    }

    #[test]
    fn release_is_reverse_creation_order() {
        let order = full().drain();
        let views = order.iter().position(|s| *s == Stage::ImageViews).unwrap();
        let swapchain = order.iter().position(|s| *s == Stage::Swapchain).unwrap();
        let device = order.iter().position(|s| *s == Stage::Device).unwrap();
        let surface = order.iter().position(|s| *s == Stage::Surface).unwrap();
        let instance = order.iter().position(|s| *s == Stage::Instance).unwrap();
        assert!(views < swapchain && swapchain < device);
        assert!(device < surface && surface < instance);
        assert_eq!(order.last(), Some(&Stage::Instance));
    }

    #[test]
    fn out_of_order_push_is_rejected() {
        let mut t = Teardown::new();
        assert!(t.push(Stage::Instance));
        assert!(t.push(Stage::Device));
        assert!(!t.push(Stage::Surface));
        assert!(!t.push(Stage::Device));
        assert!(!t.contains(Stage::Surface));
    }

    #[test]
    fn skipped_stages_are_allowed() {
        let mut t = Teardown::new();
        assert!(t.push(Stage::Instance));
        assert!(t.push(Stage::Surface));
        assert_eq!(t.drain(), vec![Stage::Surface, Stage::Instance]);
    }

    #[test]
    fn partial_construction_releases_only_what_exists() {
        let mut t = Teardown::new();
        assert!(t.push(Stage::Instance));
        assert!(t.push(Stage::Surface));
        assert!(t.push(Stage::Device));
        // swapchain creation failed here
        assert_eq!(
            t.drain(),
            vec![Stage::Device, Stage::Surface, Stage::Instance]
        );
    }

    #[test]
    fn recreation_unwinds_the_swapchain_stages_only() {
        let mut t = full();
        let popped = t.unwind_to(Stage::Commands);
        assert_eq!(
            popped,
            vec![Stage::StagingBuffer, Stage::ImageViews, Stage::Swapchain]
        );
        assert!(t.contains(Stage::Commands));
        assert!(t.push(Stage::Swapchain));
        assert!(t.push(Stage::ImageViews));
        assert!(t.push(Stage::StagingBuffer));
    }
}
