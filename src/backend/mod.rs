// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics.
// Every owner holds an Arc to what it was created from, so destruction
// order falls out of the reference graph.

pub mod buffer;
pub mod command;
pub mod device;
pub mod instance;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::Buffer;
pub use command::{CommandRecorder, DeviceRecorder};
pub use device::{Device, DeviceOptions, QueueFamilies};
pub use instance::Instance;
pub use shader::ShaderModule;
pub use surface::{Surface, SurfaceSupport};
pub use swapchain::{AcquiredImage, SurfaceStatus, Swapchain, SwapchainInfo};
pub use sync::FrameSync;
