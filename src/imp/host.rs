// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The Host-Compute backend: runs device code on the CPU.

pub(crate) mod buffer;
mod context;
mod device;
mod elf;
mod exec_memory;
pub(crate) mod executor;
mod externs;
pub(crate) mod image;
mod loader;
mod program;
mod queue;

pub use buffer::HostBuffer;
pub use context::HostContext;
pub use elf::ElfError;
pub use image::HostImage;
pub use loader::IdBlock;
pub use program::{HostFunction, HostProgram, HostProgramBuilder, NativeKernel};
pub use queue::HostQueue;
