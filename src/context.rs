// GraphicsContext - one window's worth of rendering
//
// Brings up instance, surface, device, swapchain and the frame loop, and
// keeps them consistent across resizes. Render graphs built through the
// context rebuild their framebuffers automatically whenever the swapchain
// is recreated.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

use crate::backend::{CommandRecorder, Device, DeviceOptions, Instance, ShaderModule, Surface, Swapchain, SwapchainInfo};
use crate::config::Config;
use crate::graph::{rebuild_on_recreate, RenderGraphBuilder, SharedGraph, SubpassId};
use crate::mesh::{Mesh, MeshData, MeshKind};
use crate::platform::Platform;
use crate::renderer::{FrameInfo, FrameOutcome, Renderer, VulkanFrames};

pub struct GraphicsContext {
    // Field order is drop order: frames before the swapchain they present
    // to, everything before the device
    renderer: Renderer<VulkanFrames>,
    swapchain: Arc<Mutex<Swapchain>>,
    surface: Arc<Surface>,
    device: Arc<Device>,
    instance: Arc<Instance>,
    platform: Arc<dyn Platform>,
    clear_color: [f32; 4],
}

impl GraphicsContext {
    pub fn new(platform: Arc<dyn Platform>, config: &Config) -> Result<Self> {
        let validation = config.debug.validation_layers;

        // Step 1: Instance with the window system's surface extensions
        let extensions = platform.required_extensions()?;
        let instance = Instance::new(&config.window.title, &extensions, validation)?;

        // Step 2: Surface
        let surface = Arc::new(Surface::new(&instance, platform.as_ref())?);

        // Step 3: Device that can present to it
        let device = Device::new(instance.clone(), &surface, &DeviceOptions::default())?;

        // Step 4: Swapchain at the current drawable size
        let (width, height) = platform.drawable_size();
        let swapchain = Swapchain::new(
            device.clone(),
            surface.clone(),
            vk::Extent2D { width, height },
            config.preferred_present_mode(),
        )?;
        swapchain.on_recreate.connect(|info: &SwapchainInfo| {
            log::info!(
                "Swapchain recreated: {}x{}, {} images",
                info.extent.width,
                info.extent.height,
                info.image_count()
            );
            Ok(())
        });
        let swapchain = Arc::new(Mutex::new(swapchain));

        // Step 5: Frame loop
        let frames = VulkanFrames::new(device.clone(), swapchain.clone(), config.graphics.timeout_ns)?;
        let renderer = Renderer::new(frames);

        log::info!("Graphics context ready");

        Ok(Self {
            renderer,
            swapchain,
            surface,
            device,
            instance,
            platform,
            clear_color: config.graphics.clear_color,
        })
    }

    /// Render one frame, rebuilding the swapchain afterwards if it went stale
    pub fn render_one_frame(&mut self) -> Result<FrameOutcome> {
        let (width, height) = self.platform.drawable_size();
        if width == 0 || height == 0 {
            return Ok(FrameOutcome::Idle);
        }

        let outcome = self.renderer.render()?;
        if outcome == FrameOutcome::Stale {
            self.on_resize(width, height)?;
        }
        Ok(outcome)
    }

    /// Rebuild the swapchain for a new drawable size. Ignored while minimized.
    pub fn on_resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            log::debug!("Drawable is {}x{}, skipping swapchain rebuild", width, height);
            return Ok(());
        }

        self.swapchain
            .lock()
            .resize(vk::Extent2D { width, height })
            .context("Failed to recreate swapchain")?;
        self.renderer.reconcile()
    }

    /// Builder for a single subpass drawing straight to the swapchain, cleared
    /// to the configured color
    pub fn default_render_pass(&self) -> (RenderGraphBuilder, SubpassId) {
        RenderGraphBuilder::presenting(self.clear_color)
    }

    /// Compile a graph against the current swapchain and keep its
    /// framebuffers in step with future rebuilds
    pub fn build_graph(&self, builder: RenderGraphBuilder) -> Result<SharedGraph> {
        let swapchain = self.swapchain.lock();
        let graph = Arc::new(Mutex::new(builder.build(self.device.clone(), &swapchain.info())?));
        rebuild_on_recreate(&graph, &swapchain.on_recreate);
        drop(swapchain);

        Ok(graph)
    }

    /// Register a recording task with the frame loop
    pub fn add_task<F>(&mut self, record: F) -> Result<()>
    where
        F: FnMut(&mut dyn CommandRecorder, FrameInfo) -> Result<()> + Send + 'static,
    {
        self.renderer.add_task(record)
    }

    /// Convenience task that processes `graph` every frame
    pub fn add_graph_task(&mut self, graph: SharedGraph) -> Result<()> {
        self.add_task(move |recorder, frame| graph.lock().process(frame.image_index, recorder))
    }

    pub fn load_shader(&self, path: impl AsRef<Path>) -> Result<ShaderModule> {
        ShaderModule::load(self.device.clone(), path)
    }

    pub fn upload_mesh(&self, kind: MeshKind) -> Result<Mesh> {
        Mesh::upload(self.device.clone(), &MeshData::new(kind))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn surface(&self) -> &Arc<Surface> {
        &self.surface
    }

    pub fn swapchain_info(&self) -> SwapchainInfo {
        self.swapchain.lock().info()
    }

    pub fn renderer(&self) -> &Renderer<VulkanFrames> {
        &self.renderer
    }

    /// Block until all in-flight work has finished
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        log::info!("Shutting down graphics context...");
        if let Err(e) = self.renderer.wait() {
            log::error!("Failed waiting for in-flight frames: {:#}", e);
        }
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device wait failed during shutdown: {:#}", e);
        }
    }
}
