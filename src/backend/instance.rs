// Vulkan instance - library loading, validation, debug messenger
//
// Responsibilities:
// - Verify requested instance extensions and layers exist (fatal otherwise)
// - Instance creation
// - Forward validation output to the `log` facade

use anyhow::{Context, Result};
use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use crate::error::GfxError;

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct Instance {
    pub instance: ash::Instance,
    pub entry: Entry,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    validation: bool,
}

impl Instance {
    /// Create the Vulkan instance
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `platform_extensions` - Surface extensions the window layer needs
    /// * `enable_validation` - Enable validation layers and the debug messenger
    pub fn new(
        app_name: &str,
        platform_extensions: &[*const c_char],
        enable_validation: bool,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let mut extensions = platform_extensions.to_vec();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }
        let layers: Vec<*const c_char> = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        Self::check_extensions(&entry, &extensions)?;
        Self::check_layers(&entry, &layers)?;

        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"frameloom";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::trace!("Created Vulkan instance");

        Ok(Arc::new(Self {
            instance,
            entry,
            debug_utils,
            validation: enable_validation,
        }))
    }

    pub fn validation_enabled(&self) -> bool {
        self.validation
    }

    fn check_extensions(entry: &Entry, requested: &[*const c_char]) -> Result<()> {
        let available = entry
            .enumerate_instance_extension_properties(None)
            .context("Failed to enumerate instance extensions")?;
        let available: Vec<&CStr> = available
            .iter()
            .map(|props| unsafe { CStr::from_ptr(props.extension_name.as_ptr()) })
            .collect();
        let requested: Vec<&CStr> = requested
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect();

        let missing = missing_names(&requested, &available);
        if !missing.is_empty() {
            return Err(GfxError::MissingExtensions(missing).into());
        }
        Ok(())
    }

    fn check_layers(entry: &Entry, requested: &[*const c_char]) -> Result<()> {
        if requested.is_empty() {
            return Ok(());
        }

        let available = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;
        let available: Vec<&CStr> = available
            .iter()
            .map(|props| unsafe { CStr::from_ptr(props.layer_name.as_ptr()) })
            .collect();
        let requested: Vec<&CStr> = requested
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect();

        let missing = missing_names(&requested, &available);
        if !missing.is_empty() {
            return Err(GfxError::MissingLayers(missing).into());
        }
        Ok(())
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(MESSENGER_SEVERITIES)
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        log::trace!("Validation messenger installed");

        Ok((debug_utils, messenger))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

const MESSENGER_SEVERITIES: vk::DebugUtilsMessageSeverityFlagsEXT = vk::DebugUtilsMessageSeverityFlagsEXT::from_raw(
    vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE.as_raw()
        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO.as_raw()
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING.as_raw()
        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR.as_raw(),
);

/// Log level for a validation message; verbose goes to trace
fn severity_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Info
    } else {
        log::Level::Trace
    }
}

/// Names from `required` that do not appear in `available`, in request order
pub fn missing_names(required: &[&CStr], available: &[&CStr]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !available.contains(name))
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    log::log!(severity_level(message_severity), "[Vulkan] {}", message.to_string_lossy());

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messenger_forwards_every_severity() {
        for severity in [
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        ] {
            assert!(MESSENGER_SEVERITIES.contains(severity), "{:?} not requested", severity);
        }
    }

    #[test]
    fn test_severity_levels() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        assert_eq!(severity_level(S::VERBOSE), log::Level::Trace);
        assert_eq!(severity_level(S::INFO), log::Level::Info);
        assert_eq!(severity_level(S::WARNING), log::Level::Warn);
        assert_eq!(severity_level(S::ERROR), log::Level::Error);
    }

    #[test]
    fn test_missing_names_empty_when_all_present() {
        let available = [c"VK_KHR_surface", c"VK_KHR_xcb_surface", c"VK_EXT_debug_utils"];
        let required = [c"VK_KHR_surface", c"VK_EXT_debug_utils"];
        assert!(missing_names(&required, &available).is_empty());
    }

    #[test]
    fn test_missing_names_reports_in_request_order() {
        let available = [c"VK_KHR_surface"];
        let required = [c"VK_KHR_wayland_surface", c"VK_KHR_surface", c"VK_EXT_debug_utils"];
        assert_eq!(
            missing_names(&required, &available),
            vec!["VK_KHR_wayland_surface", "VK_EXT_debug_utils"]
        );
    }

    #[test]
    fn test_missing_names_with_nothing_available() {
        let required = [VALIDATION_LAYER];
        assert_eq!(
            missing_names(&required, &[]),
            vec!["VK_LAYER_KHRONOS_validation"]
        );
    }
}
