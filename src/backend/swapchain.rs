// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Negotiation (format, present mode, extent, image count) is split into
// pure functions over the surface support so it can be tested without a GPU.
//
// Rebuilds pass the previous handle as `old_swapchain` and destroy it right
// after the replacement exists. Subscribers of `on_recreate` get a snapshot
// of the new images once the swap is complete.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::surface::{Surface, SurfaceSupport};
use super::Device;
use crate::error::GfxError;
use crate::signal::Signal;

/// Outcome of an operation that can discover the surface changed under us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus<T> {
    Ready(T),
    /// The swapchain no longer matches the surface and must be rebuilt
    OutOfDate,
}

/// An image handed out by [`Swapchain::acquire_image`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// Still presentable, but the swapchain should be rebuilt afterwards
    pub suboptimal: bool,
}

/// Negotiated swapchain parameters
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

/// Snapshot of the current images, handed to recreation subscribers
#[derive(Debug, Clone)]
pub struct SwapchainInfo {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub views: Vec<vk::ImageView>,
}

impl SwapchainInfo {
    pub fn image_count(&self) -> u32 {
        self.views.len() as u32
    }
}

/// Prefer B8G8R8A8_SRGB with sRGB non-linear, else whatever comes first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Use `preferred` when offered, otherwise FIFO_RELAXED.
///
/// FIFO_RELAXED is returned even when the surface lists only FIFO.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO_RELAXED
    }
}

/// The surface's current extent, or the requested size clamped to its limits
/// when the surface leaves the choice to us
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        let min = capabilities.min_image_extent;
        let max = capabilities.max_image_extent;
        vk::Extent2D {
            width: requested.width.min(max.width).max(min.width),
            height: requested.height.min(max.height).max(min.height),
        }
    }
}

/// At least double buffering, capped by the surface maximum (0 = no cap)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count.max(2);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

pub fn choose_pre_transform(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if capabilities
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        capabilities.current_transform
    }
}

pub fn negotiate(
    support: &SurfaceSupport,
    requested: vk::Extent2D,
    preferred_mode: vk::PresentModeKHR,
) -> Result<SwapchainConfig> {
    let format = choose_surface_format(&support.formats).context("No suitable surface format")?;

    Ok(SwapchainConfig {
        format,
        present_mode: choose_present_mode(&support.present_modes, preferred_mode),
        extent: choose_extent(&support.capabilities, requested),
        image_count: choose_image_count(&support.capabilities),
        pre_transform: choose_pre_transform(&support.capabilities),
    })
}

/// A swapchain being replaced. Passed by value into the rebuild and
/// destroyed when it goes out of scope.
struct Retired<'a> {
    device: &'a Device,
    handle: vk::SwapchainKHR,
    views: Vec<vk::ImageView>,
}

impl Drop for Retired<'_> {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.views {
                self.device.device.destroy_image_view(view, None);
            }
            if self.handle != vk::SwapchainKHR::null() {
                self.device
                    .swapchain_loader
                    .destroy_swapchain(self.handle, None);
            }
        }
        log::trace!("Destroyed retired swapchain");
    }
}

struct Chain {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    config: SwapchainConfig,
}

pub struct Swapchain {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    config: SwapchainConfig,
    preferred_mode: vk::PresentModeKHR,
    /// Fired after every rebuild with the new images
    pub on_recreate: Signal<SwapchainInfo>,
    surface: Arc<Surface>,
    device: Arc<Device>,
}

impl Swapchain {
    pub fn new(
        device: Arc<Device>,
        surface: Arc<Surface>,
        requested: vk::Extent2D,
        preferred_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", requested.width, requested.height);

        let chain = Self::create_chain(&device, &surface, requested, preferred_mode, None)?;

        Ok(Self {
            handle: chain.handle,
            images: chain.images,
            views: chain.views,
            config: chain.config,
            preferred_mode,
            on_recreate: Signal::new(),
            surface,
            device,
        })
    }

    fn create_chain(
        device: &Device,
        surface: &Surface,
        requested: vk::Extent2D,
        preferred_mode: vk::PresentModeKHR,
        retired: Option<Retired<'_>>,
    ) -> Result<Chain> {
        let support = surface.query_support(device.physical_device)?;
        let config = negotiate(&support, requested, preferred_mode)?;

        log::info!("Present mode: {:?}", config.present_mode);

        let families = device.queue_families.unique();
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(config.image_count)
            .image_format(config.format.format)
            .image_color_space(config.format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(config.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(retired.as_ref().map_or(vk::SwapchainKHR::null(), |r| r.handle));
        let create_info = if families.len() > 1 {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let handle = unsafe { device.swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // The old chain is retired by the create call either way
        drop(retired);

        let images = match unsafe { device.swapchain_loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { device.swapchain_loader.destroy_swapchain(handle, None) };
                return Err(anyhow::Error::new(e).context("Failed to get swapchain images"));
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            match Self::create_view(device, image, config.format.format) {
                Ok(view) => views.push(view),
                Err(e) => {
                    // Hand the partial chain to a Retired so it is torn down
                    drop(Retired {
                        device,
                        handle,
                        views,
                    });
                    return Err(e);
                }
            }
        }

        Ok(Chain {
            handle,
            images,
            views,
            config,
        })
    }

    fn create_view(device: &Device, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { device.device.create_image_view(&create_info, None) }
            .context("Failed to create image view")
    }

    /// Rebuild for a new drawable size. Waits for the device to go idle,
    /// replaces the chain, then notifies subscribers.
    pub fn resize(&mut self, requested: vk::Extent2D) -> Result<()> {
        log::info!("Recreating swapchain: {}x{}", requested.width, requested.height);

        self.device.wait_idle()?;

        let retired = Retired {
            device: &self.device,
            handle: std::mem::replace(&mut self.handle, vk::SwapchainKHR::null()),
            views: std::mem::take(&mut self.views),
        };
        self.images.clear();

        let chain = Self::create_chain(
            &self.device,
            &self.surface,
            requested,
            self.preferred_mode,
            Some(retired),
        )?;

        self.handle = chain.handle;
        self.images = chain.images;
        self.views = chain.views;
        self.config = chain.config;

        self.on_recreate
            .emit(&self.info())
            .context("Swapchain recreation subscriber failed")
    }

    /// Acquire the next presentable image, signalling `semaphore` and/or
    /// `fence` when it is ready.
    pub fn acquire_image(
        &self,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
        timeout: u64,
    ) -> Result<SurfaceStatus<AcquiredImage>> {
        let result = unsafe {
            self.device
                .swapchain_loader
                .acquire_next_image(self.handle, timeout, semaphore, fence)
        };

        match result {
            Ok((index, suboptimal)) => {
                if index >= self.image_count() {
                    return Err(GfxError::ImageIndexOutOfRange {
                        index,
                        count: self.image_count(),
                    }
                    .into());
                }
                Ok(SurfaceStatus::Ready(AcquiredImage { index, suboptimal }))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SurfaceStatus::OutOfDate),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Err(GfxError::Timeout.into()),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to acquire swapchain image")),
        }
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn format(&self) -> vk::Format {
        self.config.format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.config.present_mode
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    pub fn info(&self) -> SwapchainInfo {
        SwapchainInfo {
            format: self.format(),
            extent: self.extent(),
            views: self.views.clone(),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.views {
                self.device.device.destroy_image_view(view, None);
            }
            self.device
                .swapchain_loader
                .destroy_swapchain(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn test_choose_surface_format_prefers_srgb() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn test_choose_surface_format_falls_back_to_first() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_choose_surface_format_wrong_color_space_is_not_preferred() {
        let formats = [
            format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R16G16B16A16_SFLOAT);
    }

    #[test]
    fn test_choose_surface_format_empty() {
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn test_choose_present_mode_uses_preference() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn test_choose_present_mode_fifo_only_gives_relaxed() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO_RELAXED
        );
    }

    #[test]
    fn test_choose_extent_uses_current_extent() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        );
        assert_eq!(extent.width, 1280);
        assert_eq!(extent.height, 720);
    }

    #[test]
    fn test_choose_extent_clamps_requested() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };

        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 4000,
                height: 50,
            },
        );
        assert_eq!(extent.width, 1920);
        assert_eq!(extent.height, 100);
    }

    #[test]
    fn test_choose_image_count() {
        let caps = |min, max| vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        };

        assert_eq!(choose_image_count(&caps(1, 3)), 2);
        assert_eq!(choose_image_count(&caps(3, 8)), 3);
        // max of 0 means unbounded
        assert_eq!(choose_image_count(&caps(2, 0)), 2);
        assert_eq!(choose_image_count(&caps(1, 1)), 1);
    }

    #[test]
    fn test_choose_pre_transform() {
        let caps = vk::SurfaceCapabilitiesKHR {
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY
                | vk::SurfaceTransformFlagsKHR::ROTATE_90,
            current_transform: vk::SurfaceTransformFlagsKHR::ROTATE_90,
            ..Default::default()
        };
        assert_eq!(choose_pre_transform(&caps), vk::SurfaceTransformFlagsKHR::IDENTITY);

        let caps = vk::SurfaceCapabilitiesKHR {
            supported_transforms: vk::SurfaceTransformFlagsKHR::ROTATE_90,
            current_transform: vk::SurfaceTransformFlagsKHR::ROTATE_90,
            ..Default::default()
        };
        assert_eq!(choose_pre_transform(&caps), vk::SurfaceTransformFlagsKHR::ROTATE_90);
    }

    #[test]
    fn test_negotiate() {
        let support = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 4,
                current_extent: vk::Extent2D {
                    width: 640,
                    height: 480,
                },
                supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE],
        };

        let config = negotiate(
            &support,
            vk::Extent2D {
                width: 1,
                height: 1,
            },
            vk::PresentModeKHR::IMMEDIATE,
        )
        .unwrap();

        assert_eq!(config.format.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(config.present_mode, vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(config.extent.width, 640);
        assert_eq!(config.image_count, 2);
        assert_eq!(config.pre_transform, vk::SurfaceTransformFlagsKHR::IDENTITY);
    }

    #[test]
    fn test_negotiate_without_formats_fails() {
        let support = SurfaceSupport {
            present_modes: vec![vk::PresentModeKHR::FIFO],
            ..Default::default()
        };
        assert!(negotiate(&support, vk::Extent2D::default(), vk::PresentModeKHR::FIFO).is_err());
    }

    #[test]
    fn test_info_image_count() {
        let info = SwapchainInfo {
            format: vk::Format::B8G8R8A8_SRGB,
            extent: vk::Extent2D {
                width: 8,
                height: 8,
            },
            views: vec![vk::ImageView::null(); 3],
        };
        assert_eq!(info.image_count(), 3);
    }
}
