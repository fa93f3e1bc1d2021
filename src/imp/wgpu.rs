// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The wgpu backend: Vulkan and Metal devices.
//!
//! Device code is WGSL or SPIR-V; every device gets its own bound wgpu device and a thread
//! polling it.

mod bound_device;
mod buffer;
mod context;
mod error;
mod function;
mod image;
mod pixel_format;
mod program;
mod queue;
mod render;

pub use buffer::WgpuBuffer;
pub use context::WgpuContext;
pub use function::WgpuFunction;
pub use image::WgpuImage;
pub use program::WgpuProgram;
pub use queue::WgpuQueue;
pub use render::{WgpuGraphicsPipeline, WgpuRenderer};
