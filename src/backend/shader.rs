// Shader module loading
//
// Vulkan consumes SPIR-V. Modules are owned and destroyed on drop; a
// pipeline only needs the module alive while it is being compiled.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::Device;

pub struct ShaderModule {
    handle: vk::ShaderModule,
    device: Arc<Device>,
}

impl ShaderModule {
    /// Create a module from SPIR-V bytes. Fails on a length that is not a
    /// multiple of four or a missing magic number.
    pub fn from_bytes(device: Arc<Device>, bytes: &[u8]) -> Result<Self> {
        let code = ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V")?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let handle = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self { handle, device })
    }

    /// Read and create a module from a SPIR-V file
    pub fn load(device: Arc<Device>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read shader: {:?}", path))?;

        log::debug!("Loading shader {:?} ({} bytes)", path, bytes.len());

        Self::from_bytes(device, &bytes).with_context(|| format!("Failed to load shader: {:?}", path))
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.handle, None) };
    }
}
