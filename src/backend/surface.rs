// Surface - the window's presentation target
//
// Built by hand from raw-window-handle 0.6 handles for each windowing system
// we support.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;

use super::ApiContext;
use crate::error::BackendError;

pub struct Surface {
    pub handle: vk::SurfaceKHR,
    pub loader: khr::Surface,
    context: Arc<ApiContext>,
}

impl Surface {
    pub fn new(
        context: Arc<ApiContext>,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Self> {
        let handle = unsafe { create_platform_surface(&context, display_handle, window_handle) }?;
        let loader = khr::Surface::new(&context.entry, &context.instance);

        log::info!("Created presentation surface");

        Ok(Self {
            handle,
            loader,
            context,
        })
    }

    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)
                .context("Failed to query surface capabilities")
        }
    }

    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.handle)
                .context("Failed to query surface formats")
        }
    }

    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)
                .context("Failed to query present modes")
        }
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> Result<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.handle)
                .context("Failed to query surface support")
        }
    }

    pub fn context(&self) -> &Arc<ApiContext> {
        &self.context
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        log::debug!("Destroying surface");
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

/// Instance extensions needed to present on this display
pub fn required_extensions(display_handle: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let platform = match display_handle {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        RawDisplayHandle::AppKit(_) | RawDisplayHandle::UiKit(_) => ash::extensions::ext::MetalSurface::name(),
        other => {
            return Err(BackendError::SurfaceUnavailable(format!("unsupported display handle {:?}", other)).into())
        }
    };

    Ok(vec![khr::Surface::name(), platform])
}

unsafe fn create_platform_surface(
    context: &ApiContext,
    display_handle: RawDisplayHandle,
    window_handle: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let entry = &context.entry;
    let instance = &context.instance;

    let surface = match (display_handle, window_handle) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let dpy = display
                .display
                .context("Xlib display handle has no display")?
                .as_ptr();
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy as *mut _)
                .window(window.window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let connection = display
                .connection
                .context("Xcb display handle has no connection")?
                .as_ptr();
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection)
                .window(window.window.get());
            khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(window.surface.as_ptr());
            khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)
        }
        (display, window) => {
            return Err(BackendError::SurfaceUnavailable(format!(
                "unsupported window handle {:?} / {:?}",
                display, window
            ))
            .into())
        }
    };

    surface.context("Failed to create presentation surface")
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{WaylandDisplayHandle, XlibDisplayHandle};
    use std::ptr::NonNull;

    #[test]
    fn test_xlib_needs_surface_and_xlib_extensions() {
        let display = RawDisplayHandle::Xlib(XlibDisplayHandle::new(None, 0));
        let extensions = required_extensions(display).unwrap();
        assert_eq!(extensions, vec![khr::Surface::name(), khr::XlibSurface::name()]);
    }

    #[test]
    fn test_wayland_needs_wayland_extension() {
        let mut dummy = 0u8;
        let ptr = NonNull::new(&mut dummy as *mut u8 as *mut std::ffi::c_void).unwrap();
        let display = RawDisplayHandle::Wayland(WaylandDisplayHandle::new(ptr));
        let extensions = required_extensions(display).unwrap();
        assert!(extensions.contains(&khr::WaylandSurface::name()));
        assert!(extensions.contains(&khr::Surface::name()));
    }

    #[test]
    fn test_unsupported_display_is_a_typed_error() {
        let display = RawDisplayHandle::Web(raw_window_handle::WebDisplayHandle::new());
        let err = required_extensions(display).unwrap_err();
        assert!(matches!(
            crate::error::backend_error(&err),
            Some(BackendError::SurfaceUnavailable(_))
        ));
    }
}
