// SPDX-License-Identifier: CEPL-1.0
use std::ffi::{CStr, CString};

use ash::khr::{surface, swapchain};
use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{GpuError, GpuResult};
use crate::instance::VALIDATION_LAYER;
use crate::swapchain::SurfaceSupport;

/// Device extensions every candidate must expose.
pub const REQUIRED_DEVICE_EXTENSIONS: &[&CStr] = &[swapchain::NAME];

/// A queue family slot that is either still unset or names a family.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FamilyIndex {
    #[default]
    Unset,
    Index(u32),
}

impl FamilyIndex {
    pub fn is_set(self) -> bool {
        matches!(self, FamilyIndex::Index(_))
    }

    pub fn get(self) -> Option<u32> {
        match self {
            FamilyIndex::Unset => None,
            FamilyIndex::Index(i) => Some(i),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: FamilyIndex,
    pub present: FamilyIndex,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_set() && self.present.is_set()
    }

    /// Both indices, or `None` when the device is not viable.
    pub fn resolve(&self) -> Option<QueueFamilies> {
        Some(QueueFamilies {
            graphics: self.graphics.get()?,
            present: self.present.get()?,
        })
    }
}

/// The resolved families of the chosen device. They may be the same family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// One entry per distinct family; this is the queue-creation plan.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Capability queries made while picking a device.
///
/// Implemented over `ash` by [`VkProbe`]; tests supply canned answers.
pub trait DeviceProbe {
    fn physical_devices(&self) -> GpuResult<Vec<vk::PhysicalDevice>>;
    fn device_name(&self, device: vk::PhysicalDevice) -> String;
    fn queue_families(&self, device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties>;
    fn present_support(&self, device: vk::PhysicalDevice, family: u32) -> bool;
    fn device_extensions(&self, device: vk::PhysicalDevice) -> Vec<CString>;
    fn surface_capabilities(
        &self,
        device: vk::PhysicalDevice,
    ) -> GpuResult<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&self, device: vk::PhysicalDevice) -> GpuResult<Vec<vk::SurfaceFormatKHR>>;
    fn present_modes(&self, device: vk::PhysicalDevice) -> GpuResult<Vec<vk::PresentModeKHR>>;
}

/// A failed capability query counts as "not supported" for that device, so
/// selection moves on to the next candidate.
fn unsupported_on_error<T: Default>(
    what: &str,
    device: vk::PhysicalDevice,
    result: Result<T, vk::Result>,
) -> T {
    result.unwrap_or_else(|e| {
        warn!("vk: {what} failed on {device:?}: {e}, treating as unsupported");
        T::default()
    })
}

pub struct VkProbe<'a> {
    pub instance: &'a ash::Instance,
    pub surface_loader: &'a surface::Instance,
    pub surface: vk::SurfaceKHR,
}

impl DeviceProbe for VkProbe<'_> {
    fn physical_devices(&self) -> GpuResult<Vec<vk::PhysicalDevice>> {
        unsafe { self.instance.enumerate_physical_devices() }
            .map_err(|e| GpuError::Initialization(format!("enumerate_physical_devices: {e}")))
    }

    fn device_name(&self, device: vk::PhysicalDevice) -> String {
        let props = unsafe { self.instance.get_physical_device_properties(device) };
        props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown device".to_owned())
    }

    fn queue_families(&self, device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        unsafe { self.instance.get_physical_device_queue_family_properties(device) }
    }

    fn present_support(&self, device: vk::PhysicalDevice, family: u32) -> bool {
        unsupported_on_error(
            "vkGetPhysicalDeviceSurfaceSupportKHR",
            device,
            unsafe {
                self.surface_loader
                    .get_physical_device_surface_support(device, family, self.surface)
            },
        )
    }

    fn device_extensions(&self, device: vk::PhysicalDevice) -> Vec<CString> {
        unsupported_on_error(
            "vkEnumerateDeviceExtensionProperties",
            device,
            unsafe { self.instance.enumerate_device_extension_properties(device) },
        )
        .iter()
            .filter_map(|e| e.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect()
    }

    fn surface_capabilities(
        &self,
        device: vk::PhysicalDevice,
    ) -> GpuResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(device, self.surface)
        }
        .map_err(GpuError::Surface)
    }

    fn surface_formats(&self, device: vk::PhysicalDevice) -> GpuResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(device, self.surface)
        }
        .map_err(GpuError::Surface)
    }

    fn present_modes(&self, device: vk::PhysicalDevice) -> GpuResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(device, self.surface)
        }
        .map_err(GpuError::Surface)
    }
}

/// Scans queue families in index order; the first graphics family and the
/// first present family win, and the scan stops once both are set.
///
/// A family only counts as the present family when the surface also allows
/// `TRANSFER_DST` usage on this device, since frames are written by transfer.
/// The early stop can pick two different families even when a later family
/// would serve both; any complete pair is acceptable.
pub fn find_queue_families(probe: &dyn DeviceProbe, device: vk::PhysicalDevice) -> QueueFamilyIndices {
    let usage = probe
        .surface_capabilities(device)
        .map(|c| c.supported_usage_flags)
        .unwrap_or_default();
    let transfer_dst = usage.contains(vk::ImageUsageFlags::TRANSFER_DST);

    let mut indices = QueueFamilyIndices::default();
    for (i, family) in probe.queue_families(device).iter().enumerate() {
        let i = i as u32;
        if !indices.graphics.is_set() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = FamilyIndex::Index(i);
        }
        if !indices.present.is_set() && transfer_dst && probe.present_support(device, i) {
            indices.present = FamilyIndex::Index(i);
        }
        if indices.is_complete() {
            break;
        }
    }
    indices
}

pub fn missing_device_extensions(
    probe: &dyn DeviceProbe,
    device: vk::PhysicalDevice,
) -> Vec<&'static CStr> {
    let available = probe.device_extensions(device);
    REQUIRED_DEVICE_EXTENSIONS
        .iter()
        .copied()
        .filter(|req| !available.iter().any(|a| a.as_c_str() == *req))
        .collect()
}

/// Viability predicate: complete queue families, every required extension,
/// and at least one surface format and present mode.
pub fn check_device(probe: &dyn DeviceProbe, device: vk::PhysicalDevice) -> Option<QueueFamilies> {
    let name = probe.device_name(device);

    let indices = find_queue_families(probe, device);
    let Some(families) = indices.resolve() else {
        debug!(
            "vk: '{name}' skipped: graphics={:?} present={:?}",
            indices.graphics, indices.present
        );
        return None;
    };

    let missing = missing_device_extensions(probe, device);
    if !missing.is_empty() {
        debug!("vk: '{name}' skipped: missing extensions {missing:?}");
        return None;
    }

    match SurfaceSupport::query(probe, device) {
        Ok(support) if support.is_adequate() => Some(families),
        Ok(_) => {
            debug!("vk: '{name}' skipped: no surface formats or present modes");
            None
        }
        Err(e) => {
            debug!("vk: '{name}' skipped: surface query failed: {e}");
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct SelectedDevice {
    pub physical: vk::PhysicalDevice,
    pub name: String,
    pub families: QueueFamilies,
}

/// Returns the first viable device in enumeration order. No ranking.
pub fn select_physical_device(probe: &dyn DeviceProbe) -> GpuResult<SelectedDevice> {
    let devices = probe.physical_devices()?;
    if devices.is_empty() {
        warn!("vk: no physical devices enumerated");
        return Err(GpuError::NoDeviceFound);
    }
    info!("vk: found {} physical device(s)", devices.len());

    for &physical in &devices {
        if let Some(families) = check_device(probe, physical) {
            let name = probe.device_name(physical);
            info!(
                "vk: selected '{name}' (graphics family {}, present family {})",
                families.graphics, families.present
            );
            return Ok(SelectedDevice {
                physical,
                name,
                families,
            });
        }
    }

    Err(GpuError::NoSuitableDevice(devices.len()))
}

/// The opened device and its two queues. The queues are the same object when
/// the families coincide.
pub struct LogicalDevice {
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub families: QueueFamilies,
}

/// One queue request per distinct family.
pub fn queue_create_infos(
    families: QueueFamilies,
    priorities: &[f32],
) -> Vec<vk::DeviceQueueCreateInfo<'_>> {
    families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(priorities)
        })
        .collect()
}

/// # Safety
/// `selected.physical` must come from `instance`.
pub unsafe fn create_logical_device(
    instance: &ash::Instance,
    selected: &SelectedDevice,
    enable_validation: bool,
) -> GpuResult<LogicalDevice> {
    let priorities = [1.0_f32];
    let queue_infos = queue_create_infos(selected.families, &priorities);

    let ext_ptrs: Vec<*const std::ffi::c_char> =
        REQUIRED_DEVICE_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();
    let layer_ptrs: Vec<*const std::ffi::c_char> = if enable_validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    // Device layers are ignored by current loaders but older ones still read them.
    #[allow(deprecated)]
    let dinfo = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&ext_ptrs)
        .enabled_layer_names(&layer_ptrs);

    let device = unsafe { instance.create_device(selected.physical, &dinfo, None) }
        .map_err(GpuError::DeviceCreation)?;

    let families = selected.families;
    let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
    let present_queue = unsafe { device.get_device_queue(families.present, 0) };

    info!(
        "vk: logical device ready ({} queue family request(s))",
        queue_infos.len()
    );

    Ok(LogicalDevice {
        device,
        graphics_queue,
        present_queue,
        families,
    })
}
