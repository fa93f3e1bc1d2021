// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Argument encoding.
//!
//! The binder walks a function's parameters next to the caller's arguments and emits the
//! backend's representation: a contiguous parameter blob ([param_blob]) for Host-Compute, or
//! bind-group entries laid out by [slots] for the wgpu backends.

pub mod param_blob;
pub mod slots;

pub use param_blob::{ADDRESS_SIZE, IMAGE_PARAMS_SIZE, ImageParams, ParamBlob, ParamBlobResolver, SAMPLER_COUNT};
pub use slots::{BindingLayout, BindingSlot};
