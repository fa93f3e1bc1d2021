// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Backend implementations.

pub mod host;
mod unsupported;
#[cfg(feature = "backend_wgpu")]
pub mod wgpu;

pub use unsupported::UnsupportedContext;
