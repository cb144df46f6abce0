// Presentation surface and its per-adapter support queries

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::Instance;
use crate::platform::Platform;

/// What a surface offers on one adapter
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// At least one format and one present mode
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

pub struct Surface {
    pub loader: ash::extensions::khr::Surface,
    pub handle: vk::SurfaceKHR,
    _instance: Arc<Instance>,
}

impl Surface {
    pub fn new(instance: &Arc<Instance>, platform: &dyn Platform) -> Result<Self> {
        let loader = ash::extensions::khr::Surface::new(&instance.entry, &instance.instance);
        let handle = platform.create_surface(&instance.entry, &instance.instance)?;

        log::trace!("Created window surface");

        Ok(Self {
            loader,
            handle,
            _instance: instance.clone(),
        })
    }

    /// Can `queue_family` on `physical_device` present to this surface
    pub fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<bool> {
        unsafe {
            self.loader.get_physical_device_surface_support(
                physical_device,
                queue_family,
                self.handle,
            )
        }
        .context("Failed to query surface present support")
    }

    pub fn query_support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)
                .context("Failed to query surface capabilities")?;
            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.handle)
                .context("Failed to query surface formats")?;
            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)
                .context("Failed to query surface present modes")?;

            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_support_needs_formats_and_modes() {
        let mut support = SurfaceSupport::default();
        assert!(!support.is_adequate());

        support.formats.push(vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        });
        assert!(!support.is_adequate());

        support.present_modes.push(vk::PresentModeKHR::FIFO);
        assert!(support.is_adequate());
    }
}
