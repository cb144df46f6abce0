// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (prefer discrete GPU)
// - Logical device + graphics/present queue creation
// - Memory allocator setup
// - Queue submission, presentation and idle waits

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::instance::missing_names;
use super::surface::Surface;
use super::swapchain::SurfaceStatus;
use super::Instance;
use crate::error::GfxError;

/// Extensions the logical device must enable. Validation is an instance
/// layer and covers the device without being listed here.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub extensions: Vec<&'static CStr>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            extensions: vec![ash::extensions::khr::Swapchain::name()],
        }
    }
}

/// Queue family indices used by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Pick graphics and present families. A family that does both wins,
    /// otherwise the first graphics family pairs with the first present one.
    pub fn select(
        families: &[vk::QueueFamilyProperties],
        supports_present: impl Fn(u32) -> bool,
    ) -> Option<Self> {
        let mut graphics = None;
        let mut present = None;

        for (index, family) in families.iter().enumerate() {
            if family.queue_count == 0 {
                continue;
            }
            let index = index as u32;
            let has_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let has_present = supports_present(index);

            if has_graphics && has_present {
                return Some(Self {
                    graphics: index,
                    present: index,
                });
            }
            if has_graphics && graphics.is_none() {
                graphics = Some(index);
            }
            if has_present && present.is_none() {
                present = Some(index);
            }
        }

        Some(Self {
            graphics: graphics?,
            present: present?,
        })
    }

    /// Graphics and present share one family
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, graphics first
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Score each device (prefer discrete GPU)
pub fn adapter_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
        _ => 1,
    }
}

/// Nice-to-have features, enabled only where the adapter reports them
pub fn enabled_features(supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        fill_mode_non_solid: supported.fill_mode_non_solid,
        wide_lines: supported.wide_lines,
        sampler_anisotropy: supported.sampler_anisotropy,
        ..Default::default()
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct Device {
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub swapchain_loader: ash::extensions::khr::Swapchain,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilies,
    queue_lock: Mutex<()>,
    transfer_pool: Mutex<vk::CommandPool>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    pub instance: Arc<Instance>,
}

struct Candidate {
    physical_device: vk::PhysicalDevice,
    queue_families: QueueFamilies,
    score: u32,
}

impl Device {
    /// Create the logical device for the best adapter that can drive `surface`
    pub fn new(
        instance: Arc<Instance>,
        surface: &Surface,
        options: &DeviceOptions,
    ) -> Result<Arc<Self>> {
        // Step 1: Pick physical device (GPU)
        let candidate = Self::pick_physical_device(&instance, surface, options)?;
        let physical_device = candidate.physical_device;
        let queue_families = candidate.queue_families;

        // Step 2: Cache device properties
        let (properties, features, memory_properties) = unsafe {
            (
                instance.instance.get_physical_device_properties(physical_device),
                instance.instance.get_physical_device_features(physical_device),
                instance.instance.get_physical_device_memory_properties(physical_device),
            )
        };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 3: Create logical device
        let device = Self::create_logical_device(
            &instance.instance,
            physical_device,
            queue_families,
            &enabled_features(&features),
            options,
        )?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        log::debug!(
            "Queue families: graphics={}, present={}",
            queue_families.graphics,
            queue_families.present
        );

        // Step 4: Create memory allocator
        let allocator = match Self::create_allocator(&instance.instance, physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        // Step 5: Pool for one-shot transfer work
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let transfer_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                drop(allocator);
                unsafe { device.destroy_device(None) };
                return Err(anyhow::Error::new(e).context("Failed to create transfer command pool"));
            }
        };

        let swapchain_loader = ash::extensions::khr::Swapchain::new(&instance.instance, &device);

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            swapchain_loader,
            graphics_queue,
            present_queue,
            queue_families,
            queue_lock: Mutex::new(()),
            transfer_pool: Mutex::new(transfer_pool),
            properties,
            features,
            memory_properties,
            instance,
        }))
    }

    fn pick_physical_device(
        instance: &Instance,
        surface: &Surface,
        options: &DeviceOptions,
    ) -> Result<Candidate> {
        let devices = unsafe { instance.instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            return Err(GfxError::NoSuitableAdapter.into());
        }

        let mut best: Option<Candidate> = None;

        for physical_device in devices {
            let props = unsafe { instance.instance.get_physical_device_properties(physical_device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            // Find graphics + present queue families
            let families = unsafe {
                instance
                    .instance
                    .get_physical_device_queue_family_properties(physical_device)
            };
            let mut present_support = Vec::with_capacity(families.len());
            for index in 0..families.len() as u32 {
                present_support.push(surface.supports_present(physical_device, index)?);
            }
            let Some(queue_families) =
                QueueFamilies::select(&families, |i| present_support[i as usize])
            else {
                log::debug!("Skipping {}: no graphics/present queue", name);
                continue;
            };

            // Check required extensions
            let available = unsafe {
                instance
                    .instance
                    .enumerate_device_extension_properties(physical_device)
            }
            .context("Failed to enumerate device extensions")?;
            let available: Vec<&CStr> = available
                .iter()
                .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) })
                .collect();
            let missing = missing_names(&options.extensions, &available);
            if !missing.is_empty() {
                log::debug!("Skipping {}: missing {}", name, missing.join(", "));
                continue;
            }

            // Surface must offer something to present with
            if !surface.query_support(physical_device)?.is_adequate() {
                log::debug!("Skipping {}: no surface formats or present modes", name);
                continue;
            }

            let score = adapter_score(props.device_type);
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(Candidate {
                    physical_device,
                    queue_families,
                    score,
                });
            }
        }

        best.ok_or_else(|| GfxError::NoSuitableAdapter.into())
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilies,
        features: &vk::PhysicalDeviceFeatures,
        options: &DeviceOptions,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<_> = options.extensions.iter().map(|e| e.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(features);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Submit work to the graphics queue
    pub fn submit(&self, submits: &[vk::SubmitInfo], fence: vk::Fence) -> Result<()> {
        let _queue = self.queue_lock.lock();
        unsafe { self.device.queue_submit(self.graphics_queue, submits, fence) }
            .context("Failed to submit to graphics queue")
    }

    /// Present on the present queue. Suboptimal and out-of-date both mean the
    /// swapchain needs rebuilding.
    pub fn present(&self, info: &vk::PresentInfoKHR) -> Result<SurfaceStatus<()>> {
        let _queue = self.queue_lock.lock();
        match unsafe { self.swapchain_loader.queue_present(self.present_queue, info) } {
            Ok(false) => Ok(SurfaceStatus::Ready(())),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SurfaceStatus::OutOfDate),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to present swapchain image")),
        }
    }

    /// Block until both queues drain
    pub fn wait_idle(&self) -> Result<()> {
        let _queue = self.queue_lock.lock();
        for queue in self.distinct_queues() {
            unsafe { self.device.queue_wait_idle(queue) }.context("Failed to wait for queue idle")?;
        }
        Ok(())
    }

    fn distinct_queues(&self) -> Vec<vk::Queue> {
        if self.graphics_queue == self.present_queue {
            vec![self.graphics_queue]
        } else {
            vec![self.graphics_queue, self.present_queue]
        }
    }

    /// Record and run a command buffer on the graphics queue, blocking until
    /// it finishes
    pub fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let pool = self.transfer_pool.lock();

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate one-shot command buffer")?[0];
        let fence = match unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { self.device.free_command_buffers(*pool, &[cmd]) };
                return Err(anyhow::Error::new(e).context("Failed to create one-shot fence"));
            }
        };

        let run = || -> Result<()> {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(cmd, &begin_info) }?;
            record(&self.device, cmd);
            unsafe { self.device.end_command_buffer(cmd) }?;

            let command_buffers = [cmd];
            let submit = vk::SubmitInfo::builder()
                .command_buffers(&command_buffers)
                .build();
            self.submit(&[submit], fence)?;
            unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
                .context("Failed waiting for one-shot commands")?;
            Ok(())
        };
        let result = run();

        unsafe {
            self.device.destroy_fence(fence, None);
            self.device.free_command_buffers(*pool, &[cmd]);
        }

        result
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = self.wait_idle() {
            log::error!("Device wait failed during teardown: {:#}", e);
        }

        unsafe {
            self.device
                .destroy_command_pool(*self.transfer_pool.get_mut(), None);
            // Allocator must release its memory blocks before the device goes
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}
