// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

/// Everything the Vulkan core can fail with.
///
/// Creation-phase variants are fatal. `Acquire` and `Present` are fatal too,
/// except when [`GpuError::is_out_of_date`] says the swap chain only needs to
/// be rebuilt.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("instance initialization failed: {0}")]
    Initialization(String),

    #[error("native surface creation failed: {0}")]
    Surface(vk::Result),

    #[error("no Vulkan physical device found")]
    NoDeviceFound,

    #[error("none of {0} physical device(s) can present to this surface")]
    NoSuitableDevice(usize),

    #[error("logical device creation failed: {0}")]
    DeviceCreation(vk::Result),

    /// The surface currently reports a zero-sized extent, e.g. while minimized.
    #[error("surface has no drawable area")]
    NoDrawableArea,

    #[error("swapchain creation failed: {0}")]
    SwapchainCreation(vk::Result),

    #[error("image view creation failed: {0}")]
    ImageViewCreation(vk::Result),

    #[error("synchronization object creation failed: {0}")]
    SynchronizationObject(vk::Result),

    #[error("acquire_next_image failed: {0}")]
    Acquire(vk::Result),

    #[error("queue_present failed: {0}")]
    Present(vk::Result),

    #[error("{what} failed: {result}")]
    Submit {
        what: &'static str,
        result: vk::Result,
    },

    #[error("presentation engine returned image {index} but the swapchain has {count}")]
    UnknownImage { index: u32, count: usize },
}

impl GpuError {
    /// The surface changed under the swap chain; recreate it and carry on.
    pub fn is_out_of_date(&self) -> bool {
        matches!(
            self,
            GpuError::Acquire(vk::Result::ERROR_OUT_OF_DATE_KHR)
                | GpuError::Present(vk::Result::ERROR_OUT_OF_DATE_KHR)
        )
    }

    pub(crate) fn submit(what: &'static str) -> impl FnOnce(vk::Result) -> GpuError {
        move |result| GpuError::Submit { what, result }
    }
}

pub type GpuResult<T> = Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_out_of_date_acquire_and_present_are_recoverable() {
        assert!(GpuError::Acquire(vk::Result::ERROR_OUT_OF_DATE_KHR).is_out_of_date());
        assert!(GpuError::Present(vk::Result::ERROR_OUT_OF_DATE_KHR).is_out_of_date());
        assert!(!GpuError::Acquire(vk::Result::ERROR_DEVICE_LOST).is_out_of_date());
        assert!(!GpuError::Present(vk::Result::ERROR_SURFACE_LOST_KHR).is_out_of_date());
        assert!(!GpuError::SwapchainCreation(vk::Result::ERROR_OUT_OF_DATE_KHR).is_out_of_date());
    }
}
