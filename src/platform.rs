// Window-system seam
//
// The graphics stack only needs three things from the window layer: which
// instance extensions it requires, a way to make a surface, and the current
// drawable size in pixels.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::c_char;
use std::sync::Arc;
use winit::window::Window;

pub trait Platform {
    /// Instance extensions needed to create a surface for this window
    fn required_extensions(&self) -> Result<Vec<*const c_char>>;

    /// Create a presentation surface. The caller owns the returned handle.
    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance)
        -> Result<vk::SurfaceKHR>;

    /// Current drawable size in pixels. Zero in either axis means minimized.
    fn drawable_size(&self) -> (u32, u32);
}

/// [`Platform`] over a winit window
pub struct WinitPlatform {
    window: Arc<Window>,
}

impl WinitPlatform {
    pub fn new(window: Arc<Window>) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }
}

impl Platform for WinitPlatform {
    fn required_extensions(&self) -> Result<Vec<*const c_char>> {
        let extensions =
            ash_window::enumerate_required_extensions(self.window.raw_display_handle())
                .context("Failed to query surface extensions for this window system")?;
        Ok(extensions.to_vec())
    }

    fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR> {
        unsafe {
            ash_window::create_surface(
                entry,
                instance,
                self.window.raw_display_handle(),
                self.window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")
    }

    fn drawable_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }
}
