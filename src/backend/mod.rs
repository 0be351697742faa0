// Backend module - Vulkan abstraction layer
//
// Design: Thin RAII wrappers around ash. Every object holds an
// Arc<VulkanDevice>, so the device outlives everything created from it.

pub mod buffer;
pub mod commands;
pub mod debug;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
