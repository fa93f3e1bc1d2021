// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Host-side description of a compiled device function.
//!
//! The device toolchain emits one [FunctionInfo] per entry point.  Backends use it to check
//! and encode argument lists, and the executor uses it to decide how work-groups are run.

use std::sync::Arc;

use crate::image_type::ImageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FunctionType {
    Kernel = 0,
    Vertex = 1,
    Fragment = 2,
    TessellationControl = 3,
    TessellationEvaluation = 4,
    ArgumentBufferStruct = 5,
}

impl FunctionType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => FunctionType::Kernel,
            1 => FunctionType::Vertex,
            2 => FunctionType::Fragment,
            3 => FunctionType::TessellationControl,
            4 => FunctionType::TessellationEvaluation,
            5 => FunctionType::ArgumentBufferStruct,
            _ => return None,
        })
    }

    pub fn is_graphics(self) -> bool {
        matches!(
            self,
            FunctionType::Vertex
                | FunctionType::Fragment
                | FunctionType::TessellationControl
                | FunctionType::TessellationEvaluation
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ArgKind {
    /// Plain data passed by value.
    Plain = 0,
    Buffer = 1,
    Image = 2,
    ImageArray = 3,
    BufferArray = 4,
    ArgumentBuffer = 5,
    /// Per-vertex / per-fragment stage input, supplied by the pipeline rather than the caller.
    StageInput = 6,
    /// Plain data the toolchain placed in an inline uniform block.
    InlineUniformBlock = 7,
    PushConstant = 8,
}

impl ArgKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => ArgKind::Plain,
            1 => ArgKind::Buffer,
            2 => ArgKind::Image,
            3 => ArgKind::ImageArray,
            4 => ArgKind::BufferArray,
            5 => ArgKind::ArgumentBuffer,
            6 => ArgKind::StageInput,
            7 => ArgKind::InlineUniformBlock,
            8 => ArgKind::PushConstant,
            _ => return None,
        })
    }

    /// Plain-data kinds: the caller supplies bytes.
    pub fn is_data(self) -> bool {
        matches!(
            self,
            ArgKind::Plain | ArgKind::InlineUniformBlock | ArgKind::PushConstant
        )
    }

    /// Whether the caller supplies a value for this argument.
    pub fn is_user_supplied(self) -> bool {
        self != ArgKind::StageInput
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum ArgAccess {
    #[default]
    ReadWrite = 0,
    Read = 1,
    Write = 2,
}

impl ArgAccess {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => ArgAccess::ReadWrite,
            1 => ArgAccess::Read,
            2 => ArgAccess::Write,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FunctionFlags: u32 {
        const USES_SOFT_PRINTF = 1 << 0;
        const COOPERATIVE = 1 << 1;
        const INDIRECT_CAPABLE = 1 << 2;
        /// Calls a work-group or sub-group barrier.
        const USES_BARRIERS = 1 << 3;
        /// Calls a grid-wide barrier; requires a cooperative launch.
        const USES_GLOBAL_BARRIER = 1 << 4;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgInfo {
    pub kind: ArgKind,
    /// Byte size of plain data; 0 for resources.
    pub size: u32,
    /// Element count for image/buffer arrays.
    pub array_extent: u32,
    pub access: ArgAccess,
    /// Image kind and access for image arguments.
    pub image_type: ImageType,
    /// Layout of the struct an argument-buffer argument points to.
    pub argument_buffer: Option<Arc<FunctionInfo>>,
}

impl ArgInfo {
    pub fn plain(size: u32) -> Self {
        ArgInfo {
            kind: ArgKind::Plain,
            size,
            array_extent: 0,
            access: ArgAccess::Read,
            image_type: ImageType::empty(),
            argument_buffer: None,
        }
    }
    pub fn buffer(access: ArgAccess) -> Self {
        ArgInfo {
            kind: ArgKind::Buffer,
            size: 0,
            array_extent: 0,
            access,
            image_type: ImageType::empty(),
            argument_buffer: None,
        }
    }
    pub fn buffer_array(access: ArgAccess, count: u32) -> Self {
        ArgInfo {
            kind: ArgKind::BufferArray,
            array_extent: count,
            ..ArgInfo::buffer(access)
        }
    }
    pub fn image(image_type: ImageType, access: ArgAccess) -> Self {
        ArgInfo {
            kind: ArgKind::Image,
            size: 0,
            array_extent: 0,
            access,
            image_type,
            argument_buffer: None,
        }
    }
    pub fn image_array(image_type: ImageType, access: ArgAccess, count: u32) -> Self {
        ArgInfo {
            kind: ArgKind::ImageArray,
            array_extent: count,
            ..ArgInfo::image(image_type, access)
        }
    }
    pub fn argument_buffer(layout: Arc<FunctionInfo>) -> Self {
        ArgInfo {
            kind: ArgKind::ArgumentBuffer,
            size: 0,
            array_extent: 0,
            access: ArgAccess::Read,
            image_type: ImageType::empty(),
            argument_buffer: Some(layout),
        }
    }
    pub fn stage_input(size: u32) -> Self {
        ArgInfo {
            kind: ArgKind::StageInput,
            ..ArgInfo::plain(size)
        }
    }
}

/// Everything the runtime knows about one device function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub function_type: FunctionType,
    pub flags: FunctionFlags,
    pub args: Vec<ArgInfo>,
    /// Overrides all other local-size choices when present.
    pub required_local_size: Option<[u32; 3]>,
    pub required_simd_width: Option<u32>,
}

impl FunctionInfo {
    pub fn kernel(name: impl Into<String>, args: Vec<ArgInfo>) -> Self {
        FunctionInfo {
            name: name.into(),
            function_type: FunctionType::Kernel,
            flags: FunctionFlags::empty(),
            args,
            required_local_size: None,
            required_simd_width: None,
        }
    }

    pub fn with_flags(mut self, flags: FunctionFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_required_local_size(mut self, local_size: [u32; 3]) -> Self {
        self.required_local_size = Some(local_size);
        self
    }

    pub fn with_function_type(mut self, function_type: FunctionType) -> Self {
        self.function_type = function_type;
        self
    }

    pub fn uses_images(&self) -> bool {
        self.args
            .iter()
            .any(|a| matches!(a.kind, ArgKind::Image | ArgKind::ImageArray))
            || self
                .args
                .iter()
                .filter_map(|a| a.argument_buffer.as_ref())
                .any(|ab| ab.uses_images())
    }

    pub fn uses_soft_printf(&self) -> bool {
        self.flags.contains(FunctionFlags::USES_SOFT_PRINTF)
    }

    pub fn argument_buffer_count(&self) -> usize {
        self.args
            .iter()
            .filter(|a| a.kind == ArgKind::ArgumentBuffer)
            .count()
    }

    /// Number of arguments the caller must supply.
    pub fn user_arg_count(&self) -> usize {
        self.args.iter().filter(|a| a.kind.is_user_supplied()).count()
    }

    /// Buffer-like bindings a command of this function occupies in an indirect pipeline.
    ///
    /// Every argument except stage inputs occupies one slot; arrays occupy one per element.
    pub fn buffer_binding_count(&self) -> u32 {
        self.args
            .iter()
            .map(|a| match a.kind {
                ArgKind::StageInput => 0,
                ArgKind::BufferArray | ArgKind::ImageArray => a.array_extent.max(1),
                _ => 1,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts() {
        let ab = Arc::new(
            FunctionInfo::kernel(
                "params",
                vec![ArgInfo::image(ImageType::IMAGE_2D | ImageType::RGBA8, ArgAccess::Read)],
            )
            .with_function_type(FunctionType::ArgumentBufferStruct),
        );
        let info = FunctionInfo::kernel(
            "k",
            vec![
                ArgInfo::buffer(ArgAccess::Read),
                ArgInfo::plain(4),
                ArgInfo::buffer_array(ArgAccess::Write, 3),
                ArgInfo::argument_buffer(ab),
                ArgInfo::stage_input(16),
            ],
        );
        assert!(info.uses_images());
        assert_eq!(info.argument_buffer_count(), 1);
        assert_eq!(info.user_arg_count(), 4);
        assert_eq!(info.buffer_binding_count(), 1 + 1 + 3 + 1);
    }

    #[test]
    fn enum_round_trip() {
        for v in 0..6 {
            assert_eq!(FunctionType::from_u32(v).map(|t| t as u32), Some(v));
        }
        assert!(FunctionType::from_u32(6).is_none());
        for v in 0..9 {
            assert_eq!(ArgKind::from_u32(v).map(|k| k as u32), Some(v));
        }
        assert!(FunctionType::Fragment.is_graphics());
        assert!(!FunctionType::Kernel.is_graphics());
    }
}
