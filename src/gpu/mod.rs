//! GPU rendering load.
//!
//! This module keeps the GPU busy using wgpu for cross-platform support
//! (Vulkan, GL, Metal, DX12). A smooth-shaded triangle fan is rendered
//! offscreen in a tight loop so the GPU keeps reading and writing the
//! shared system memory while the memory tester runs.

pub mod buffers;
pub mod device;
pub mod renderer;
pub mod shaders;

pub use device::enumerate_gpus;
pub use renderer::{GpuLoad, RenderConfig};
