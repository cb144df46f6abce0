// Vulkan side of the frame loop
//
// Owns the command pool task buffers come from, the per-image fences and
// the acquire/render semaphores. Acquire and present go through the shared
// swapchain so a resize elsewhere is picked up on the next frame.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use super::FrameBackend;
use crate::backend::{AcquiredImage, Device, DeviceRecorder, FrameSync, SurfaceStatus, Swapchain};
use crate::error::GfxError;

pub struct VulkanFrames {
    pool: vk::CommandPool,
    sync: FrameSync,
    timeout: u64,
    /// Image handed out by the last acquire and not yet presented
    acquired: Option<u32>,
    swapchain: Arc<Mutex<Swapchain>>,
    device: Arc<Device>,
}

impl VulkanFrames {
    pub fn new(device: Arc<Device>, swapchain: Arc<Mutex<Swapchain>>, timeout: u64) -> Result<Self> {
        let image_count = swapchain.lock().image_count();

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create frame command pool")?;

        let sync = match FrameSync::new(&device.device, image_count) {
            Ok(sync) => sync,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(e);
            }
        };

        log::debug!("Frame state ready for {} swapchain images", image_count);

        Ok(Self {
            pool,
            sync,
            timeout,
            acquired: None,
            swapchain,
            device,
        })
    }

    fn check_image(&self, image: u32) -> Result<()> {
        let count = self.sync.fence_count();
        if image >= count {
            return Err(GfxError::ImageIndexOutOfRange { index: image, count }.into());
        }
        Ok(())
    }
}

impl FrameBackend for VulkanFrames {
    type Commands = vk::CommandBuffer;
    type Recorder<'a> = DeviceRecorder<'a> where Self: 'a;

    fn image_count(&self) -> u32 {
        self.swapchain.lock().image_count()
    }

    fn allocate_commands(&mut self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    fn free_commands(&mut self, commands: Vec<vk::CommandBuffer>) {
        if commands.is_empty() {
            return;
        }
        unsafe { self.device.device.free_command_buffers(self.pool, &commands) };
    }

    fn resize_fences(&mut self, count: u32) -> Result<()> {
        self.sync.resize(&self.device.device, count)
    }

    fn wait_fence(&mut self, image: u32) -> Result<()> {
        self.sync.wait(&self.device.device, image, self.timeout)
    }

    fn reset_fence(&mut self, image: u32) -> Result<()> {
        self.sync.reset(&self.device.device, image)
    }

    fn wait_all(&mut self) -> Result<()> {
        self.sync.wait_all(&self.device.device, self.timeout)
    }

    fn acquire(&mut self) -> Result<SurfaceStatus<AcquiredImage>> {
        let status = self.swapchain.lock().acquire_image(
            self.sync.image_available,
            vk::Fence::null(),
            self.timeout,
        )?;
        if let SurfaceStatus::Ready(acquired) = status {
            self.check_image(acquired.index)?;
            self.acquired = Some(acquired.index);
        }
        Ok(status)
    }

    fn begin_commands(&mut self, commands: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.device.begin_command_buffer(commands, &begin_info) }
            .context("Failed to begin command buffer")
    }

    fn recorder(&self, commands: vk::CommandBuffer) -> DeviceRecorder<'_> {
        DeviceRecorder::new(&self.device.device, commands)
    }

    fn end_commands(&mut self, commands: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.device.end_command_buffer(commands) }
            .context("Failed to end command buffer")
    }

    fn submit(&mut self, commands: &[vk::CommandBuffer], image: u32) -> Result<()> {
        let fence = self.sync.fence(image)?;

        let wait_semaphores = [self.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::TRANSFER
            | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.sync.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(commands)
            .signal_semaphores(&signal_semaphores)
            .build();

        self.device.submit(&[submit_info], fence)
    }

    fn present(&mut self, image: u32) -> Result<SurfaceStatus<()>> {
        if self.acquired != Some(image) {
            return Err(GfxError::PresentWithoutAcquire { image }.into());
        }
        self.acquired = None;

        let wait_semaphores = [self.sync.render_finished];
        let swapchains = [self.swapchain.lock().handle()];
        let image_indices = [image];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        self.device.present(&present_info)
    }
}

impl Drop for VulkanFrames {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device wait failed while releasing frame state: {:#}", e);
        }
        self.sync.destroy(&self.device.device);
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}
