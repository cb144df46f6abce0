// =============================================================================
// FRAMELOOM DEMO - a colored quad through the full frame loop
// =============================================================================
//
// FRAME FLOW:
// 1. Acquire a swapchain image
// 2. Wait for the fence guarding that image
// 3. Record every task (here: one render graph with one pipeline)
// 4. Submit, then present
// 5. On resize or a stale surface, rebuild the swapchain and reconcile
//
// Keys: Escape quits.
//
// =============================================================================

use anyhow::{Context, Result};
use frameloom::graph::{alpha_blend, Pipeline, ViewportConvention};
use frameloom::mesh::{MeshKind, Vertex};
use frameloom::{Config, FrameOutcome, GraphicsContext, WinitPlatform};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    env_logger::Builder::from_default_env()
        .filter_level(config.log_level())
        .init();

    log::info!("Starting frameloom demo");
    log::info!(
        "Window: {}x{}, present mode preference: {}",
        config.window.width,
        config.window.height,
        config.graphics.present_mode
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    context: Option<GraphicsContext>,
    window: Option<Arc<winit::window::Window>>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            context: None,
            window: None,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    /// Bring up the context and register the quad's render graph
    fn init_graphics(&self, window: Arc<winit::window::Window>) -> Result<GraphicsContext> {
        let platform = Arc::new(WinitPlatform::new(window));
        let mut context = GraphicsContext::new(platform, &self.config)?;

        // Shader modules only need to live until the pipeline is compiled
        let vertex = context
            .load_shader(&self.config.shaders.vertex)
            .context("Failed to load vertex shader")?;
        let fragment = context
            .load_shader(&self.config.shaders.fragment)
            .context("Failed to load fragment shader")?;

        let mesh = Arc::new(context.upload_mesh(MeshKind::Quad)?);

        let convention = if self.config.graphics.flip_viewport_y {
            ViewportConvention::FlipY
        } else {
            ViewportConvention::Standard
        };

        let (bindings, attributes) = Vertex::layout();
        let pipeline = Pipeline::new()
            .vertex(vertex.handle(), "main")
            .fragment(fragment.handle(), "main")
            .vertex_layout(bindings, attributes)
            .blend(alpha_blend())
            .viewport_convention(convention)
            .on_draw(move |recorder, _ctx| {
                mesh.draw(recorder);
                Ok(())
            });

        let (mut builder, subpass) = context.default_render_pass();
        builder.add_pipeline(subpass, pipeline)?;
        let graph = context.build_graph(builder)?;
        context.add_graph_task(graph)?;

        Ok(context)
    }

    fn render(&mut self, event_loop: &ActiveEventLoop) {
        let Some(context) = self.context.as_mut() else {
            return;
        };

        match context.render_one_frame() {
            Ok(FrameOutcome::Presented) => self.update_fps(),
            Ok(FrameOutcome::Stale) => log::debug!("Surface went stale, swapchain rebuilt"),
            Ok(FrameOutcome::Idle) => {}
            Err(e) => {
                log::error!("Render error: {:#}", e);
                event_loop.exit();
            }
        }
    }

    fn update_fps(&mut self) {
        self.frame_count += 1;
        let elapsed = self.last_fps_update.elapsed().as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(window) = &self.window {
                window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
            }
            log::debug!("FPS: {:.1}", fps);
            self.frame_count = 0;
            self.last_fps_update = Instant::now();
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match self.init_graphics(window.clone()) {
            Ok(context) => self.context = Some(context),
            Err(e) => {
                log::error!("Failed to initialize graphics: {:#}", e);
                event_loop.exit();
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(context) = self.context.as_mut() {
                    if let Err(e) = context.on_resize(size.width, size.height) {
                        log::error!("Resize failed: {:#}", e);
                        event_loop.exit();
                    }
                }
            }

            WindowEvent::RedrawRequested => self.render(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        if let Some(context) = &self.context {
            if let Err(e) = context.wait_idle() {
                log::error!("Device wait failed during shutdown: {:#}", e);
            }
        }
        // The context goes before the window it renders into
        self.context = None;
        log::info!("Cleanup complete");
    }
}
