// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Render-pipeline primitives: graphics pipelines, draw calls and render passes.
//!
//! Only the primitives are provided.  A [Renderer] encodes the draws of one render pass and
//! submits them on commit.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use crate::args::{Arg, CapturedArg};
use crate::device::PlatformType;
use crate::error::Error;
use crate::fence::{SignalFence, WaitFence};
use crate::indirect::IndirectCommandPipeline;
use crate::memory::{Buffer, Image};
use crate::pipeline_description::RenderPipelineDescription;
use crate::queue::CompletionHandler;

pub trait GraphicsPipeline: Send + Sync + Debug {
    fn description(&self) -> &RenderPipelineDescription;
    fn platform_type(&self) -> PlatformType;
    fn as_any(&self) -> &dyn Any;
}

/// One draw; buffers are owned so the call can be recorded.
#[derive(Clone)]
pub enum DrawCall {
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_buffer: Arc<dyn Buffer>,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawPatches {
        control_point_buffers: Vec<Arc<dyn Buffer>>,
        tessellation_factors: Arc<dyn Buffer>,
        patch_control_point_count: u32,
        patch_count: u32,
        first_patch: u32,
        instance_count: u32,
        first_instance: u32,
    },
    DrawPatchesIndexed {
        control_point_buffers: Vec<Arc<dyn Buffer>>,
        control_point_index_buffer: Arc<dyn Buffer>,
        tessellation_factors: Arc<dyn Buffer>,
        patch_control_point_count: u32,
        patch_count: u32,
        first_index: u32,
        first_patch: u32,
        instance_count: u32,
        first_instance: u32,
    },
}

impl DrawCall {
    pub fn is_tessellated(&self) -> bool {
        matches!(
            self,
            DrawCall::DrawPatches { .. } | DrawCall::DrawPatchesIndexed { .. }
        )
    }
}

impl Debug for DrawCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrawCall::Draw {
                vertex_count,
                instance_count,
                ..
            } => write!(f, "Draw({vertex_count} vertices x {instance_count})"),
            DrawCall::DrawIndexed {
                index_count,
                instance_count,
                ..
            } => write!(f, "DrawIndexed({index_count} indices x {instance_count})"),
            DrawCall::DrawPatches { patch_count, .. } => write!(f, "DrawPatches({patch_count})"),
            DrawCall::DrawPatchesIndexed { patch_count, .. } => {
                write!(f, "DrawPatchesIndexed({patch_count})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp<T> {
    Load,
    Clear(T),
    DontCare,
}

#[derive(Debug, Clone)]
pub struct ColorAttachment {
    pub image: Arc<dyn Image>,
    pub load: LoadOp<[f64; 4]>,
    pub store: bool,
}

#[derive(Debug, Clone)]
pub struct DepthAttachment {
    pub image: Arc<dyn Image>,
    pub load: LoadOp<f32>,
    pub store: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RenderPassDescription {
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_attachment: Option<DepthAttachment>,
    pub debug_label: String,
}

/// Encodes the draws of one render pass.
pub trait Renderer: Send + Debug {
    fn draw(&mut self, call: DrawCall, vertex_args: &[Arg<'_>], fragment_args: &[Arg<'_>]) -> Result<(), Error>;

    /// Replays render commands `[offset, offset + count)` of `pipeline` into this pass.
    fn execute_indirect(
        &mut self,
        pipeline: &IndirectCommandPipeline,
        offset: u32,
        count: u32,
    ) -> Result<(), Error>;

    /// Submits the pass.
    fn commit(
        self: Box<Self>,
        wait_fences: &[WaitFence],
        signal_fences: &[SignalFence],
        completion: Option<CompletionHandler>,
    ) -> Result<(), Error>;
}

/// Converts recorded arguments back into borrowed ones.
pub(crate) fn borrow_args(args: &[CapturedArg]) -> Vec<Arg<'_>> {
    args.iter().map(CapturedArg::as_arg).collect()
}
