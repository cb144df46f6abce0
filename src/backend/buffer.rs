// GPU buffers for vertex and index data
//
// Memory comes from the device's gpu-allocator. Host-visible buffers are
// written through their persistent mapping; device-local buffers are filled
// through a staging copy on the graphics queue.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::Device;

pub struct Buffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    device: Arc<Device>,
}

impl Buffer {
    /// Helper to create a GPU buffer with specified usage and memory location
    pub fn new(
        device: Arc<Device>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(anyhow::Error::new(e).context(format!("Failed to allocate memory for {}", name)));
            }
        };

        // From here on Drop cleans up
        let buffer = Self {
            buffer,
            size,
            allocation: Some(allocation),
            device,
        };

        let (memory, offset) = buffer.memory()?;
        unsafe {
            buffer
                .device
                .device
                .bind_buffer_memory(buffer.buffer, memory, offset)
        }
        .context("Failed to bind buffer memory")?;

        Ok(buffer)
    }

    /// Create a CPU-writable buffer and fill it with data
    pub fn host_visible<T: Copy>(
        device: Arc<Device>,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let mut buffer = Self::new(
            device,
            name,
            std::mem::size_of_val(data) as vk::DeviceSize,
            usage,
            MemoryLocation::CpuToGpu,
        )?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Create a GPU-only buffer, uploading `data` through a staging buffer
    pub fn device_local<T: Copy>(
        device: Arc<Device>,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;

        let staging = Self::host_visible(
            device.clone(),
            &format!("{} (staging)", name),
            vk::BufferUsageFlags::TRANSFER_SRC,
            data,
        )?;
        let buffer = Self::new(
            device.clone(),
            name,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;

        device
            .one_shot(|raw, cmd| {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                };
                unsafe { raw.cmd_copy_buffer(cmd, staging.buffer, buffer.buffer, &[region]) };
            })
            .with_context(|| format!("Failed to upload {}", name))?;

        Ok(buffer)
    }

    /// Copy `data` into the start of a host-visible buffer
    pub fn write<T: Copy>(&mut self, data: &[T]) -> Result<()> {
        let byte_len = std::mem::size_of_val(data);
        anyhow::ensure!(
            byte_len as vk::DeviceSize <= self.size,
            "Write of {} bytes overflows buffer of {} bytes",
            byte_len,
            self.size
        );

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .context("Buffer is not host visible")?;

        // Safety: T is Copy (plain data) and the slice covers exactly `data`
        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, byte_len) };
        mapped[..byte_len].copy_from_slice(bytes);
        Ok(())
    }

    fn memory(&self) -> Result<(vk::DeviceMemory, vk::DeviceSize)> {
        let allocation = self.allocation.as_ref().context("Buffer has no allocation")?;
        Ok((unsafe { allocation.memory() }, allocation.offset()))
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
    }
}
