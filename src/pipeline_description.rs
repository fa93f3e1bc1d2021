// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Render-pipeline and indirect-command descriptions.
//!
//! Both are validated when a pipeline is created; an invalid description is the one place
//! creation fails with a dedicated error ([DescriptionError]) instead of a logged no-op.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::function_info::FunctionType;
use crate::image_type::ImageType;
use crate::program::Function;

/// Upper bound on per-stage buffer bindings recorded in one indirect command.
pub const MAX_INDIRECT_BUFFER_COUNT: u32 = 31;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DescriptionError {
    #[error("{stage} function \"{name}\" has the wrong function type")]
    WrongFunctionType { stage: &'static str, name: String },
    #[error("color attachment {0} has no color format")]
    InvalidColorFormat(usize),
    #[error("depth attachment format is not a depth format")]
    InvalidDepthFormat,
    #[error("sample count {0} is not a power of two in 1..=64")]
    InvalidSampleCount(u32),
    #[error("pipeline has no color or depth attachment")]
    NoAttachments,
    #[error("max_command_count must be at least 1")]
    NoCommands,
    #[error("{0} buffer count exceeds {MAX_INDIRECT_BUFFER_COUNT}")]
    TooManyBuffers(&'static str),
    #[error("a compute pipeline can not hold render commands")]
    RenderInComputePipeline,
    #[error("a render pipeline can not hold compute commands")]
    ComputeInRenderPipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Primitive {
    Point,
    Line,
    LineStrip,
    #[default]
    Triangle,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    #[default]
    None,
    Back,
    Front,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareFunction {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendComponent {
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub const ALPHA_BLENDING: BlendState = BlendState {
        color: BlendComponent {
            src: BlendFactor::SrcAlpha,
            dst: BlendFactor::OneMinusSrcAlpha,
            op: BlendOp::Add,
        },
        alpha: BlendComponent {
            src: BlendFactor::One,
            dst: BlendFactor::OneMinusSrcAlpha,
            op: BlendOp::Add,
        },
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorAttachmentDescription {
    pub format: ImageType,
    pub blend: Option<BlendState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthAttachmentDescription {
    pub format: ImageType,
    pub write: bool,
    pub compare: CompareFunction,
}

#[derive(Clone)]
pub struct RenderPipelineDescription {
    pub vertex_shader: Arc<dyn Function>,
    pub fragment_shader: Option<Arc<dyn Function>>,
    pub primitive: Primitive,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub color_attachments: Vec<ColorAttachmentDescription>,
    pub depth_attachment: Option<DepthAttachmentDescription>,
    pub sample_count: u32,
    pub support_indirect_rendering: bool,
    pub enable_multi_view: bool,
    pub debug_label: String,
}

impl Debug for RenderPipelineDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPipelineDescription")
            .field("vertex_shader", &self.vertex_shader.name())
            .field(
                "fragment_shader",
                &self.fragment_shader.as_ref().map(|f| f.name().to_string()),
            )
            .field("primitive", &self.primitive)
            .field("color_attachments", &self.color_attachments)
            .field("depth_attachment", &self.depth_attachment)
            .field("sample_count", &self.sample_count)
            .field("debug_label", &self.debug_label)
            .finish()
    }
}

impl RenderPipelineDescription {
    pub fn new(vertex_shader: Arc<dyn Function>, fragment_shader: Option<Arc<dyn Function>>) -> Self {
        RenderPipelineDescription {
            vertex_shader,
            fragment_shader,
            primitive: Primitive::default(),
            cull_mode: CullMode::default(),
            front_face: FrontFace::default(),
            color_attachments: Vec::new(),
            depth_attachment: None,
            sample_count: 1,
            support_indirect_rendering: false,
            enable_multi_view: false,
            debug_label: String::new(),
        }
    }

    pub fn validate(&self) -> Result<(), DescriptionError> {
        if self.vertex_shader.function_type() != FunctionType::Vertex {
            return Err(DescriptionError::WrongFunctionType {
                stage: "vertex",
                name: self.vertex_shader.name().to_string(),
            });
        }
        if let Some(fragment) = &self.fragment_shader
            && fragment.function_type() != FunctionType::Fragment
        {
            return Err(DescriptionError::WrongFunctionType {
                stage: "fragment",
                name: fragment.name().to_string(),
            });
        }
        if self.color_attachments.is_empty() && self.depth_attachment.is_none() {
            return Err(DescriptionError::NoAttachments);
        }
        for (index, attachment) in self.color_attachments.iter().enumerate() {
            if attachment.format.is_depth()
                || attachment.format.data_type().is_none()
                || attachment.format.format().is_none()
            {
                return Err(DescriptionError::InvalidColorFormat(index));
            }
        }
        if let Some(depth) = &self.depth_attachment
            && !depth.format.is_depth()
        {
            return Err(DescriptionError::InvalidDepthFormat);
        }
        if !self.sample_count.is_power_of_two() || self.sample_count > 64 {
            return Err(DescriptionError::InvalidSampleCount(self.sample_count));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectCommandType {
    Compute,
    Render,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectCommandDescription {
    pub command_type: IndirectCommandType,
    pub max_command_count: u32,
    pub max_kernel_buffer_count: u32,
    pub max_vertex_buffer_count: u32,
    pub max_fragment_buffer_count: u32,
    pub debug_label: String,
}

impl IndirectCommandDescription {
    pub fn new(command_type: IndirectCommandType, max_command_count: u32) -> Self {
        IndirectCommandDescription {
            command_type,
            max_command_count,
            max_kernel_buffer_count: 0,
            max_vertex_buffer_count: 0,
            max_fragment_buffer_count: 0,
            debug_label: String::new(),
        }
    }

    /// Derives the per-stage buffer counts from the functions that will be recorded.
    pub fn compute_buffer_counts_from_functions(
        &mut self,
        functions: &[&dyn Function],
    ) -> Result<(), DescriptionError> {
        for function in functions {
            let count = function.info().buffer_binding_count();
            match (self.command_type, function.function_type()) {
                (IndirectCommandType::Compute, FunctionType::Kernel) => {
                    self.max_kernel_buffer_count = self.max_kernel_buffer_count.max(count);
                }
                (IndirectCommandType::Compute, _) => {
                    return Err(DescriptionError::RenderInComputePipeline);
                }
                (IndirectCommandType::Render, FunctionType::Vertex)
                | (IndirectCommandType::Render, FunctionType::TessellationEvaluation) => {
                    self.max_vertex_buffer_count = self.max_vertex_buffer_count.max(count);
                }
                (IndirectCommandType::Render, FunctionType::Fragment) => {
                    self.max_fragment_buffer_count = self.max_fragment_buffer_count.max(count);
                }
                (IndirectCommandType::Render, _) => {
                    return Err(DescriptionError::ComputeInRenderPipeline);
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DescriptionError> {
        if self.max_command_count == 0 {
            return Err(DescriptionError::NoCommands);
        }
        match self.command_type {
            IndirectCommandType::Compute => {
                if self.max_vertex_buffer_count > 0 || self.max_fragment_buffer_count > 0 {
                    return Err(DescriptionError::RenderInComputePipeline);
                }
                if self.max_kernel_buffer_count > MAX_INDIRECT_BUFFER_COUNT {
                    return Err(DescriptionError::TooManyBuffers("kernel"));
                }
            }
            IndirectCommandType::Render => {
                if self.max_kernel_buffer_count > 0 {
                    return Err(DescriptionError::ComputeInRenderPipeline);
                }
                if self.max_vertex_buffer_count > MAX_INDIRECT_BUFFER_COUNT {
                    return Err(DescriptionError::TooManyBuffers("vertex"));
                }
                if self.max_fragment_buffer_count > MAX_INDIRECT_BUFFER_COUNT {
                    return Err(DescriptionError::TooManyBuffers("fragment"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indirect_validation() {
        let mut desc = IndirectCommandDescription::new(IndirectCommandType::Compute, 0);
        assert_eq!(desc.validate(), Err(DescriptionError::NoCommands));
        desc.max_command_count = 4;
        desc.max_kernel_buffer_count = 3;
        assert!(desc.validate().is_ok());
        desc.max_vertex_buffer_count = 1;
        assert_eq!(desc.validate(), Err(DescriptionError::RenderInComputePipeline));

        let mut render = IndirectCommandDescription::new(IndirectCommandType::Render, 1);
        render.max_kernel_buffer_count = 1;
        assert_eq!(render.validate(), Err(DescriptionError::ComputeInRenderPipeline));
        render.max_kernel_buffer_count = 0;
        render.max_fragment_buffer_count = 32;
        assert_eq!(render.validate(), Err(DescriptionError::TooManyBuffers("fragment")));
    }
}
