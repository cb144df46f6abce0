// Synchronization primitives
//
// One fence per swapchain image (signaled at creation so the first wait on
// each image returns immediately), plus the acquire/render semaphore pair
// shared by every frame.

use anyhow::{Context, Result};
use ash::vk;

use crate::error::GfxError;

pub struct FrameSync {
    /// Signaled by acquire, waited on by the frame's submission
    pub image_available: vk::Semaphore,
    /// Signaled by the submission, waited on by present
    pub render_finished: vk::Semaphore,
    fences: Vec<vk::Fence>,
}

impl FrameSync {
    pub fn new(device: &ash::Device, image_count: u32) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        let image_available = unsafe { device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create acquire semaphore")?;
        let render_finished = match unsafe { device.create_semaphore(&semaphore_info, None) } {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.destroy_semaphore(image_available, None) };
                return Err(anyhow::Error::new(e).context("Failed to create render semaphore"));
            }
        };

        let mut sync = Self {
            image_available,
            render_finished,
            fences: Vec::new(),
        };
        if let Err(e) = sync.resize(device, image_count) {
            sync.destroy(device);
            return Err(e);
        }
        Ok(sync)
    }

    /// Replace every fence with `image_count` fresh signaled ones
    pub fn resize(&mut self, device: &ash::Device, image_count: u32) -> Result<()> {
        self.destroy_fences(device);

        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled
        for _ in 0..image_count {
            let fence = unsafe { device.create_fence(&fence_info, None) }
                .context("Failed to create frame fence")?;
            self.fences.push(fence);
        }
        Ok(())
    }

    pub fn fence_count(&self) -> u32 {
        self.fences.len() as u32
    }

    pub fn fence(&self, image: u32) -> Result<vk::Fence> {
        self.fences
            .get(image as usize)
            .copied()
            .ok_or_else(|| {
                GfxError::ImageIndexOutOfRange {
                    index: image,
                    count: self.fence_count(),
                }
                .into()
            })
    }

    pub fn wait(&self, device: &ash::Device, image: u32, timeout: u64) -> Result<()> {
        let fence = self.fence(image)?;
        wait_fences(device, &[fence], timeout)
    }

    pub fn reset(&self, device: &ash::Device, image: u32) -> Result<()> {
        let fence = self.fence(image)?;
        unsafe { device.reset_fences(&[fence]) }.context("Failed to reset frame fence")
    }

    pub fn wait_all(&self, device: &ash::Device, timeout: u64) -> Result<()> {
        if self.fences.is_empty() {
            return Ok(());
        }
        wait_fences(device, &self.fences, timeout)
    }

    fn destroy_fences(&mut self, device: &ash::Device) {
        for fence in self.fences.drain(..) {
            unsafe { device.destroy_fence(fence, None) };
        }
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        self.destroy_fences(device);
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
        }
    }
}

fn wait_fences(device: &ash::Device, fences: &[vk::Fence], timeout: u64) -> Result<()> {
    match unsafe { device.wait_for_fences(fences, true, timeout) } {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(GfxError::Timeout.into()),
        Err(e) => Err(anyhow::Error::new(e).context("Failed waiting for frame fence")),
    }
}
