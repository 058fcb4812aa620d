// SPDX-License-Identifier: CEPL-1.0
use std::ffi::{c_void, CStr};

use ash::ext::debug_utils;
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, error, info, warn};

use crate::error::{GpuError, GpuResult};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const APP_NAME: &CStr = c"tidewater";

/// Instance extensions the platform needs to present to a window on `display`.
pub fn required_instance_extensions(display: RawDisplayHandle) -> GpuResult<Vec<&'static CStr>> {
    let raw = ash_window::enumerate_required_extensions(display)
        .map_err(|e| GpuError::Initialization(format!("enumerate_required_extensions: {e}")))?;
    // SAFETY: ash_window hands out pointers to its static extension-name constants.
    Ok(raw.iter().map(|&p| unsafe { CStr::from_ptr(p) }).collect())
}

/// Builds the final extension list: every required name must be available,
/// diagnostics add `VK_EXT_debug_utils`. Duplicates are dropped.
pub fn negotiate_extensions<'a>(
    required: &[&'a CStr],
    available: &[&CStr],
    enable_diagnostics: bool,
) -> GpuResult<Vec<&'a CStr>> {
    let mut wanted: Vec<&'a CStr> = Vec::with_capacity(required.len() + 1);
    for &name in required {
        if !wanted.contains(&name) {
            wanted.push(name);
        }
    }
    if enable_diagnostics && !wanted.contains(&debug_utils::NAME) {
        wanted.push(debug_utils::NAME);
    }

    let is_available = |name: &CStr| available.iter().any(|a| a.to_bytes() == name.to_bytes());
    if let Some(missing) = wanted.iter().find(|w| !is_available(w)) {
        return Err(GpuError::Initialization(format!(
            "instance extension {} is not available",
            missing.to_string_lossy()
        )));
    }
    Ok(wanted)
}

/// Creates the one `VkInstance` for this run.
///
/// # Safety
/// `entry` must outlive the returned instance.
pub unsafe fn create_instance(
    entry: &Entry,
    required_extensions: &[&'static CStr],
    enable_diagnostics: bool,
) -> GpuResult<ash::Instance> {
    let ext_props = unsafe { entry.enumerate_instance_extension_properties(None) }
        .map_err(|e| GpuError::Initialization(format!("enumerate_instance_extension_properties: {e}")))?;
    let available: Vec<&CStr> = ext_props
        .iter()
        .filter_map(|e| e.extension_name_as_c_str().ok())
        .collect();
    let extensions = negotiate_extensions(required_extensions, &available, enable_diagnostics)?;

    let mut layers: Vec<&CStr> = Vec::new();
    if enable_diagnostics {
        let layer_props = unsafe { entry.enumerate_instance_layer_properties() }
            .map_err(|e| GpuError::Initialization(format!("enumerate_instance_layer_properties: {e}")))?;
        let has_validation = layer_props
            .iter()
            .any(|l| l.layer_name_as_c_str().ok() == Some(VALIDATION_LAYER));
        if !has_validation {
            return Err(GpuError::Initialization(format!(
                "diagnostics requested but {} is not installed",
                VALIDATION_LAYER.to_string_lossy()
            )));
        }
        layers.push(VALIDATION_LAYER);
    }

    let ext_ptrs: Vec<*const std::ffi::c_char> = extensions.iter().map(|e| e.as_ptr()).collect();
    let layer_ptrs: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    let app_info = vk::ApplicationInfo::default()
        .application_name(APP_NAME)
        .application_version(0)
        .engine_name(APP_NAME)
        .engine_version(0)
        .api_version(vk::API_VERSION_1_0);

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&ext_ptrs)
        .enabled_layer_names(&layer_ptrs);

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| GpuError::Initialization(format!("vkCreateInstance: {e}")))?;

    info!(
        "vk: instance ready ({} extension(s), diagnostics={})",
        extensions.len(),
        enable_diagnostics
    );
    for ext in &extensions {
        debug!("vk: instance extension {}", ext.to_string_lossy());
    }
    Ok(instance)
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader passes a valid callback-data struct for the duration of the call.
    let p_message = unsafe { (*data).p_message };
    if p_message.is_null() {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr(p_message) }.to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        info!("[vulkan] {msg}");
    } else {
        debug!("[vulkan] {msg}");
    }
    vk::FALSE
}

pub struct DebugMessenger {
    loader: debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// # Safety
    /// `instance` must have been created with `VK_EXT_debug_utils` enabled.
    pub unsafe fn new(entry: &Entry, instance: &ash::Instance) -> GpuResult<Self> {
        let loader = debug_utils::Instance::new(entry, instance);
        let ci = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        let handle = unsafe { loader.create_debug_utils_messenger(&ci, None) }
            .map_err(|e| GpuError::Initialization(format!("create_debug_utils_messenger: {e}")))?;
        Ok(Self { loader, handle })
    }

    /// # Safety
    /// Must run before the owning instance is destroyed.
    pub unsafe fn destroy(&self) {
        unsafe { self.loader.destroy_debug_utils_messenger(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::khr::surface;

    const XLIB: &CStr = c"VK_KHR_xlib_surface";

    #[test]
    fn required_extensions_pass_through() {
        let available = [surface::NAME, XLIB, debug_utils::NAME];
        let got = negotiate_extensions(&[surface::NAME, XLIB], &available, false).unwrap();
        assert_eq!(got, vec![surface::NAME, XLIB]);
    }

    #[test]
    fn diagnostics_add_debug_utils_once() {
        let available = [surface::NAME, debug_utils::NAME];
        let got =
            negotiate_extensions(&[surface::NAME, debug_utils::NAME, surface::NAME], &available, true)
                .unwrap();
        assert_eq!(got, vec![surface::NAME, debug_utils::NAME]);
    }

    #[test]
    fn missing_extension_is_an_initialization_error() {
        let available = [surface::NAME];
        let err = negotiate_extensions(&[surface::NAME, XLIB], &available, false).unwrap_err();
        assert!(matches!(err, GpuError::Initialization(ref m) if m.contains("VK_KHR_xlib_surface")));
    }

    #[test]
    fn diagnostics_need_debug_utils_available() {
        let available = [surface::NAME];
        assert!(negotiate_extensions(&[surface::NAME], &available, true).is_err());
        assert!(negotiate_extensions(&[surface::NAME], &available, false).is_ok());
    }
}
