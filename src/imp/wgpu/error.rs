// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Translation of wgpu failures into [crate::Error].

use crate::error::Error;

impl From<wgpu::RequestDeviceError> for Error {
    fn from(e: wgpu::RequestDeviceError) -> Self {
        Error::backend("RequestDeviceError", e.to_string())
    }
}

impl From<wgpu::BufferAsyncError> for Error {
    fn from(e: wgpu::BufferAsyncError) -> Self {
        Error::backend("BufferAsyncError", e.to_string())
    }
}

impl From<wgpu::PollError> for Error {
    fn from(e: wgpu::PollError) -> Self {
        Error::backend("PollError", e.to_string())
    }
}

/// Maps a captured validation or out-of-memory error.
pub(crate) fn translate(error: wgpu::Error) -> Error {
    match error {
        wgpu::Error::Validation { description, .. } => Error::backend("Validation", description),
        wgpu::Error::OutOfMemory { .. } => Error::backend("OutOfMemory", error.to_string()),
        other => Error::backend("wgpu", other.to_string()),
    }
}

/// Runs `create` inside validation and out-of-memory error scopes.
///
/// wgpu reports most creation failures asynchronously; the scopes turn them back into a
/// `Result` at the call site.
pub(crate) fn scoped<T>(device: &wgpu::Device, create: impl FnOnce() -> T) -> Result<T, Error> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = create();
    let validation = test_executors::sleep_on(device.pop_error_scope());
    let memory = test_executors::sleep_on(device.pop_error_scope());
    match validation.or(memory) {
        Some(error) => Err(translate(error)),
        None => Ok(value),
    }
}
