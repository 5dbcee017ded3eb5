// API context - Vulkan entry, instance, and debug messenger
//
// Created first and destroyed last. Everything that needs the instance gets
// an Arc<ApiContext> passed in; nothing looks it up globally.

use anyhow::{Context, Result};
use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::constants::{API_VERSION, VALIDATION_LAYERS};
use super::diagnostics::{debug_callback, Diagnostics, ValidationPolicy};
use super::surface;

/// Bootstrap options for the API context
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub app_name: String,
    pub enable_validation: bool,
    pub validation_policy: ValidationPolicy,
}

pub struct ApiContext {
    pub entry: Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    diagnostics: Arc<Diagnostics>,
}

impl ApiContext {
    pub fn new(display_handle: RawDisplayHandle, options: &ContextOptions) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", options.app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let extensions = instance_extensions(display_handle, options.enable_validation)?;
        let instance = Self::create_instance(&entry, options, &extensions)?;

        let diagnostics = Arc::new(Diagnostics::new(options.validation_policy));

        // From here on the instance is released if the messenger fails
        let mut context = Self {
            entry,
            instance,
            debug_utils: None,
            diagnostics,
        };

        if options.enable_validation {
            log::debug!("Installing debug messenger ({:?} policy)", options.validation_policy);
            context.debug_utils = Some(context.setup_debug_messenger()?);
        }

        Ok(Arc::new(context))
    }

    fn create_instance(
        entry: &Entry,
        options: &ContextOptions,
        extensions: &[&'static CStr],
    ) -> Result<ash::Instance> {
        let app_name = CString::new(options.app_name.as_str())?;
        let engine_name = CString::new("Frame Backend")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(API_VERSION);

        let extension_ptrs: Vec<_> = extensions.iter().map(|ext| ext.as_ptr()).collect();

        let layer_ptrs: Vec<_> = if options.enable_validation {
            VALIDATION_LAYERS.iter().map(|layer| layer.as_ptr()).collect()
        } else {
            Vec::new()
        };

        let flags = if cfg!(target_os = "macos") {
            // Allow implementations that only provide a subset of the API
            vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
        } else {
            vk::InstanceCreateFlags::empty()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        for ext in extensions {
            log::debug!("Instance extension: {}", ext.to_string_lossy());
        }

        Ok(instance)
    }

    fn setup_debug_messenger(&self) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(&self.entry, &self.instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
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
            .pfn_user_callback(Some(debug_callback))
            // The Arc outlives the messenger: Drop destroys the messenger first
            .user_data(Arc::as_ptr(&self.diagnostics) as *mut std::ffi::c_void);

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }
}

impl Drop for ApiContext {
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

/// Presentation extensions for the display plus the debug/portability extras
fn instance_extensions(display_handle: RawDisplayHandle, enable_validation: bool) -> Result<Vec<&'static CStr>> {
    let mut extensions = surface::required_extensions(display_handle)?;

    if cfg!(target_os = "macos") {
        extensions.push(vk::KhrPortabilityEnumerationFn::name());
        extensions.push(vk::KhrGetPhysicalDeviceProperties2Fn::name());
    }

    if enable_validation {
        extensions.push(DebugUtils::name());
    }

    Ok(extensions)
}
