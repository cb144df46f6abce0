// frameloom - frame orchestration over Vulkan
//
// Layers, bottom up:
// - backend: instance, device, surface, swapchain, sync and resource wrappers
// - graph: declarative render passes compiled against the swapchain
// - renderer: the acquire / record / submit / present loop
// - context: ties them together for one window

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod mesh;
pub mod platform;
pub mod renderer;
pub mod signal;

pub use config::Config;
pub use context::GraphicsContext;
pub use error::GfxError;
pub use graph::{RenderGraph, RenderGraphBuilder, SharedGraph};
pub use platform::{Platform, WinitPlatform};
pub use renderer::{FrameInfo, FrameOutcome, Renderer};
