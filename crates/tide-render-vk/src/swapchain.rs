// SPDX-License-Identifier: CEPL-1.0
use ash::khr::swapchain;
use ash::vk;
use tide_render::RenderSize;
use tracing::{debug, info};

use crate::device::{DeviceProbe, QueueFamilies};
use crate::error::{GpuError, GpuResult};

/// The swap chain images are written by a transfer, then presented.
pub const IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
);

/// What a surface offers when paired with one physical device.
#[derive(Clone, Debug, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(probe: &dyn DeviceProbe, device: vk::PhysicalDevice) -> GpuResult<Self> {
        Ok(Self {
            capabilities: probe.surface_capabilities(device)?,
            formats: probe.surface_formats(device)?,
            present_modes: probe.present_modes(device)?,
        })
    }

    /// At least one format and one present mode.
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// BGRA8 + sRGB non-linear if offered, otherwise whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// A definite `current_extent` means the swap chain must match the window
/// exactly; `u32::MAX` means the window size is ours to pick within range.
pub fn choose_swap_extent(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, bounded by the maximum when the surface has one.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        want.min(caps.max_image_count)
    } else {
        want
    }
}

pub fn choose_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|&a| caps.supported_composite_alpha.contains(a))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Concurrent sharing across both families when they differ, so no ownership
/// transfer barriers are needed; exclusive otherwise.
pub fn choose_sharing(families: QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (
            vk::SharingMode::CONCURRENT,
            vec![families.graphics, families.present],
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
}

impl SwapchainConfig {
    /// Pure policy step; same inputs always give the same config.
    ///
    /// A zero-sized extent yields [`GpuError::NoDrawableArea`]; the caller
    /// retries once the surface has area again.
    pub fn negotiate(
        support: &SurfaceSupport,
        want: RenderSize,
        families: QueueFamilies,
    ) -> GpuResult<Self> {
        let surface_format = choose_surface_format(&support.formats)
            .ok_or(GpuError::SwapchainCreation(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))?;
        let caps = &support.capabilities;
        let extent = choose_swap_extent(caps, want);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::NoDrawableArea);
        }
        let (sharing_mode, queue_family_indices) = choose_sharing(families);

        Ok(Self {
            format: surface_format.format,
            color_space: surface_format.color_space,
            present_mode: choose_present_mode(&support.present_modes),
            extent,
            image_count: choose_image_count(caps),
            sharing_mode,
            queue_family_indices,
            pre_transform: caps.current_transform,
            composite_alpha: choose_composite_alpha(caps),
        })
    }
}

// Info only
fn fmt_name(f: vk::Format) -> &'static str {
    match f {
        vk::Format::B8G8R8A8_UNORM => "B8G8R8A8_UNORM",
        vk::Format::B8G8R8A8_SRGB => "B8G8R8A8_SRGB",
        vk::Format::R8G8B8A8_SRGB => "R8G8B8A8_SRGB",
        vk::Format::R8G8B8A8_UNORM => "R8G8B8A8_UNORM",
        _ => "OTHER",
    }
}
fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub config: SwapchainConfig,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
}

impl Swapchain {
    pub fn format(&self) -> vk::Format {
        self.config.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// # Safety
    /// No submitted work may still reference the views.
    pub unsafe fn destroy_views(&mut self, device: &ash::Device) {
        for view in self.views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }
    }

    /// # Safety
    /// Views must already be destroyed and the presentation engine idle.
    pub unsafe fn destroy(&mut self, loader: &swapchain::Device) {
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { loader.destroy_swapchain(self.handle, None) };
            self.handle = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }
}

/// Queries the surface for `physical`, negotiates a config and builds the
/// swap chain plus one view per image. Callable again on resize; pass the
/// previous handle as `old` so the driver can recycle it.
///
/// # Safety
/// `device` must be created from `physical`, and `surface` must outlive the result.
#[allow(clippy::too_many_arguments)]
pub unsafe fn negotiate_swapchain(
    probe: &dyn DeviceProbe,
    physical: vk::PhysicalDevice,
    device: &ash::Device,
    loader: &swapchain::Device,
    surface: vk::SurfaceKHR,
    want: RenderSize,
    families: QueueFamilies,
    old: vk::SwapchainKHR,
) -> GpuResult<Swapchain> {
    let support = SurfaceSupport::query(probe, physical)?;
    let config = SwapchainConfig::negotiate(&support, want, families)?;

    let info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(config.image_count)
        .image_format(config.format)
        .image_color_space(config.color_space)
        .image_extent(config.extent)
        .image_array_layers(1)
        .image_usage(IMAGE_USAGE)
        .image_sharing_mode(config.sharing_mode)
        .queue_family_indices(&config.queue_family_indices)
        .pre_transform(config.pre_transform)
        .composite_alpha(config.composite_alpha)
        .present_mode(config.present_mode)
        .clipped(true)
        .old_swapchain(old);

    let handle = unsafe { loader.create_swapchain(&info, None) }
        .map_err(GpuError::SwapchainCreation)?;
    let images = match unsafe { loader.get_swapchain_images(handle) } {
        Ok(images) => images,
        Err(e) => {
            unsafe { loader.destroy_swapchain(handle, None) };
            return Err(GpuError::SwapchainCreation(e));
        }
    };

    let mut swapchain = Swapchain {
        handle,
        config,
        images,
        views: Vec::new(),
    };

    for &image in &swapchain.images {
        match unsafe { create_image_view(device, image, swapchain.format()) } {
            Ok(view) => swapchain.views.push(view),
            Err(e) => {
                unsafe {
                    swapchain.destroy_views(device);
                    swapchain.destroy(loader);
                }
                return Err(GpuError::ImageViewCreation(e));
            }
        }
    }

    let c = &swapchain.config;
    info!(
        "vk: swapchain {}x{} fmt={} cs={:?} pm={} images={} sharing={:?}",
        c.extent.width,
        c.extent.height,
        fmt_name(c.format),
        c.color_space,
        pm_name(c.present_mode),
        swapchain.images.len(),
        c.sharing_mode,
    );
    debug!("vk: requested {} images (min+1 policy)", c.image_count);

    Ok(swapchain)
}

unsafe fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView, vk::Result> {
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );
    unsafe { device.create_image_view(&info, None) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn variable_caps() -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: extent(u32::MAX, u32::MAX),
            min_image_extent: extent(64, 64),
            max_image_extent: extent(1920, 1080),
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: IMAGE_USAGE,
            ..Default::default()
        }
    }

    fn support() -> SurfaceSupport {
        SurfaceSupport {
            capabilities: variable_caps(),
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::R8G8B8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    #[test]
    fn surface_format_prefers_bgra_srgb() {
        let chosen = choose_surface_format(&support().formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn surface_format_falls_back_to_first_listed() {
        let only = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };
        let pair = |f: Option<vk::SurfaceFormatKHR>| f.map(|f| (f.format, f.color_space));
        assert_eq!(pair(choose_surface_format(&[only])), pair(Some(only)));

        // right format, wrong colour space: still the fallback path
        let wrong_cs = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT,
        };
        assert_eq!(
            pair(choose_surface_format(&[only, wrong_cs])),
            pair(Some(only))
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_prefers_mailbox_then_fifo() {
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_uses_current_when_fixed() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(1280, 720),
            min_image_extent: extent(1, 1),
            max_image_extent: extent(800, 600),
            ..Default::default()
        };
        assert_eq!(
            choose_swap_extent(&caps, RenderSize::new(1920, 1080)),
            extent(1280, 720)
        );
    }

    #[test]
    fn extent_clamps_when_variable() {
        let caps = variable_caps();
        assert_eq!(
            choose_swap_extent(&caps, RenderSize::new(4000, 10)),
            extent(1920, 64)
        );
        assert_eq!(
            choose_swap_extent(&caps, RenderSize::new(1280, 720)),
            extent(1280, 720)
        );
    }

    #[test]
    fn extent_choice_is_idempotent_and_in_range() {
        let caps = variable_caps();
        for (w, h) in [(0, 0), (1, 5000), (640, 480), (u32::MAX - 1, 3)] {
            let first = choose_swap_extent(&caps, RenderSize::new(w, h));
            let again =
                choose_swap_extent(&caps, RenderSize::new(first.width, first.height));
            assert_eq!(first, again);
            assert!((64..=1920).contains(&first.width));
            assert!((64..=1080).contains(&first.height));
        }
    }

    #[test]
    fn image_count_is_min_plus_one_bounded_by_max() {
        let mut caps = variable_caps();
        assert_eq!(choose_image_count(&caps), 3);

        caps.max_image_count = 3;
        assert_eq!(choose_image_count(&caps), 3);

        caps.min_image_count = 3;
        caps.max_image_count = 3;
        assert_eq!(choose_image_count(&caps), 3);

        for (min, max) in [(1, 1), (1, 8), (2, 2), (4, 16)] {
            caps.min_image_count = min;
            caps.max_image_count = max;
            let n = choose_image_count(&caps);
            assert!(n >= min && n <= max);
        }
    }

    #[test]
    fn sharing_is_exclusive_for_one_family() {
        let shared = QueueFamilies {
            graphics: 0,
            present: 0,
        };
        assert_eq!(choose_sharing(shared), (vk::SharingMode::EXCLUSIVE, vec![]));

        let split = QueueFamilies {
            graphics: 0,
            present: 2,
        };
        assert_eq!(
            choose_sharing(split),
            (vk::SharingMode::CONCURRENT, vec![0, 2])
        );
    }

    #[test]
    fn negotiation_is_repeatable() {
        let families = QueueFamilies {
            graphics: 1,
            present: 1,
        };
        let a = SwapchainConfig::negotiate(&support(), RenderSize::new(1280, 720), families)
            .unwrap();
        let b = SwapchainConfig::negotiate(&support(), RenderSize::new(1280, 720), families)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(a.image_count, 3);
        assert_eq!(a.composite_alpha, vk::CompositeAlphaFlagsKHR::OPAQUE);
    }

    #[test]
    fn negotiation_without_formats_fails() {
        let mut s = support();
        s.formats.clear();
        let err = SwapchainConfig::negotiate(
            &s,
            RenderSize::new(1280, 720),
            QueueFamilies {
                graphics: 0,
                present: 0,
            },
        )
        .unwrap_err();
        assert!(matches!(err, GpuError::SwapchainCreation(_)));
    }

    #[test]
    fn minimized_surface_has_no_drawable_area() {
        let mut s = support();
        s.capabilities.current_extent = extent(0, 0);
        s.capabilities.min_image_extent = extent(0, 0);
        s.capabilities.max_image_extent = extent(0, 0);
        let families = QueueFamilies {
            graphics: 0,
            present: 0,
        };
        let err = SwapchainConfig::negotiate(&s, RenderSize::new(1280, 720), families).unwrap_err();
        assert!(matches!(err, GpuError::NoDrawableArea));

        // one axis collapsed is just as unusable
        s.capabilities.current_extent = extent(1280, 0);
        let err = SwapchainConfig::negotiate(&s, RenderSize::new(1280, 720), families).unwrap_err();
        assert!(matches!(err, GpuError::NoDrawableArea));

        s.capabilities.current_extent = extent(1280, 720);
        assert!(SwapchainConfig::negotiate(&s, RenderSize::new(1280, 720), families).is_ok());
    }

    #[test]
    fn image_usage_allows_transfer_writes() {
        assert!(IMAGE_USAGE.contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert!(IMAGE_USAGE.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
    }
}
