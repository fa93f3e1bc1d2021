// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Bind-group layout of a function on the wgpu backends.
//!
//! Every parameter gets a [BindingSlot] in bind group 0, except:
//!
//! * plain data that fits the device's inline block goes into push constants,
//! * larger plain data is placed in the per-call constant block (a slot of the function's
//!   constant-buffer ring) and bound as a uniform buffer at an aligned offset,
//! * argument buffers get their own bind group (1, 2, ...) and don't consume a binding in
//!   group 0,
//! * stage inputs are supplied by the pipeline and take nothing.
//!
//! Inside an argument buffer all plain data is stored in the argument buffer's own memory.

use std::sync::Arc;

use crate::error::Error;
use crate::function_info::{ArgAccess, ArgKind, FunctionInfo};
use crate::image_type::ImageType;

/// Offset alignment of uniform bindings within the constant block.
pub const CONSTANT_ALIGNMENT: u32 = 256;

/// Constant-buffer ring slots per function.
pub const CONSTANT_RING_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum BindingSlot {
    PushConstant {
        offset: u32,
        size: u32,
    },
    /// A uniform binding over `[offset, offset + size)` of the constant block.
    Constant {
        binding: u32,
        offset: u32,
        size: u32,
    },
    StorageBuffer {
        binding: u32,
        count: u32,
        read_only: bool,
    },
    SampledImage {
        binding: u32,
        count: u32,
        image_type: ImageType,
    },
    StorageImage {
        binding: u32,
        count: u32,
        image_type: ImageType,
        access: ArgAccess,
    },
    ArgumentBuffer {
        group: u32,
        layout: Arc<BindingLayout>,
    },
    StageInput,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BindingLayout {
    /// Bind group the slots live in.
    pub group: u32,
    /// One slot per parameter, in declaration order.
    pub slots: Vec<BindingSlot>,
    pub push_constant_size: u32,
    /// Bytes of the constant block (aligned offsets included).
    pub constant_size: u32,
    /// Bindings used in `group`.
    pub binding_count: u32,
    /// Bind groups used including argument buffers' groups.
    pub group_count: u32,
}

impl BindingLayout {
    /// Lays out `info` in bind group `group`.
    ///
    /// `inline_max` is the push-constant budget in bytes; 0 disables push constants.
    pub fn new(info: &FunctionInfo, group: u32, inline_max: u32) -> Result<BindingLayout, Error> {
        let mut layout = BindingLayout {
            group,
            group_count: group + 1,
            ..Default::default()
        };
        let mut binding = 0u32;
        for (index, param) in info.args.iter().enumerate() {
            let slot = match param.kind {
                ArgKind::Plain | ArgKind::InlineUniformBlock | ArgKind::PushConstant => {
                    if param.size == 0 {
                        return Err(Error::invalid(format!(
                            "parameter #{index} of \"{}\" has no size",
                            info.name
                        )));
                    }
                    let push = param.kind == ArgKind::PushConstant
                        || (inline_max != 0 && param.size <= inline_max);
                    if push && layout.push_constant_size + param.size <= inline_max.max(param.size) {
                        let offset = layout.push_constant_size;
                        layout.push_constant_size += param.size.div_ceil(4) * 4;
                        BindingSlot::PushConstant {
                            offset,
                            size: param.size,
                        }
                    } else {
                        let offset = layout.constant_size.div_ceil(CONSTANT_ALIGNMENT) * CONSTANT_ALIGNMENT;
                        layout.constant_size = offset + param.size;
                        let slot = BindingSlot::Constant {
                            binding,
                            offset,
                            size: param.size,
                        };
                        binding += 1;
                        slot
                    }
                }
                ArgKind::Buffer | ArgKind::BufferArray => {
                    let count = if param.kind == ArgKind::Buffer {
                        1
                    } else {
                        param.array_extent.max(1)
                    };
                    let slot = BindingSlot::StorageBuffer {
                        binding,
                        count,
                        read_only: param.access == ArgAccess::Read,
                    };
                    binding += count;
                    slot
                }
                ArgKind::Image | ArgKind::ImageArray => {
                    let count = if param.kind == ArgKind::Image {
                        1
                    } else {
                        param.array_extent.max(1)
                    };
                    let slot = if param.access == ArgAccess::Read {
                        BindingSlot::SampledImage {
                            binding,
                            count,
                            image_type: param.image_type,
                        }
                    } else {
                        BindingSlot::StorageImage {
                            binding,
                            count,
                            image_type: param.image_type,
                            access: param.access,
                        }
                    };
                    binding += count;
                    slot
                }
                ArgKind::ArgumentBuffer => {
                    let structure = param.argument_buffer.as_ref().ok_or_else(|| {
                        Error::invalid(format!(
                            "argument buffer parameter #{index} of \"{}\" has no struct layout",
                            info.name
                        ))
                    })?;
                    let ab_group = layout.group_count;
                    let inner = BindingLayout::new(structure, ab_group, 0)?;
                    if inner.slots.iter().any(|s| matches!(s, BindingSlot::ArgumentBuffer { .. })) {
                        return Err(Error::unsupported("nested argument buffers"));
                    }
                    layout.group_count = inner.group_count;
                    BindingSlot::ArgumentBuffer {
                        group: ab_group,
                        layout: Arc::new(inner),
                    }
                }
                ArgKind::StageInput => BindingSlot::StageInput,
            };
            layout.slots.push(slot);
        }
        layout.binding_count = binding;
        Ok(layout)
    }

    /// Slots of the caller-supplied parameters, in argument order.
    pub fn user_slots(&self) -> impl Iterator<Item = &BindingSlot> {
        self.slots.iter().filter(|s| !matches!(s, BindingSlot::StageInput))
    }

    /// Whether the layout needs a constant block per call.
    pub fn uses_constant_block(&self) -> bool {
        self.constant_size > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function_info::{ArgInfo, FunctionType};

    #[test]
    fn inline_versus_constant_block() {
        let info = FunctionInfo::kernel(
            "k",
            vec![
                ArgInfo::plain(16),
                ArgInfo::buffer(ArgAccess::Read),
                ArgInfo::plain(512),
                ArgInfo::buffer(ArgAccess::ReadWrite),
                ArgInfo::plain(4),
            ],
        );
        let layout = BindingLayout::new(&info, 0, 64).unwrap();
        assert_eq!(
            layout.slots,
            vec![
                BindingSlot::PushConstant { offset: 0, size: 16 },
                BindingSlot::StorageBuffer { binding: 0, count: 1, read_only: true },
                BindingSlot::Constant { binding: 1, offset: 0, size: 512 },
                BindingSlot::StorageBuffer { binding: 2, count: 1, read_only: false },
                BindingSlot::PushConstant { offset: 16, size: 4 },
            ]
        );
        assert_eq!(layout.push_constant_size, 20);
        assert_eq!(layout.constant_size, 512);
        assert_eq!(layout.binding_count, 3);

        let no_inline = BindingLayout::new(&info, 0, 0).unwrap();
        assert_eq!(
            no_inline.slots[4],
            BindingSlot::Constant { binding: 4, offset: 768, size: 4 }
        );
        assert_eq!(no_inline.push_constant_size, 0);
    }

    #[test]
    fn argument_buffers_use_their_own_groups() {
        let structure = Arc::new(
            FunctionInfo::kernel(
                "params",
                vec![ArgInfo::plain(8), ArgInfo::buffer(ArgAccess::Read)],
            )
            .with_function_type(FunctionType::ArgumentBufferStruct),
        );
        let info = FunctionInfo::kernel(
            "k",
            vec![
                ArgInfo::argument_buffer(structure.clone()),
                ArgInfo::buffer(ArgAccess::Write),
                ArgInfo::argument_buffer(structure),
            ],
        );
        let layout = BindingLayout::new(&info, 0, 0).unwrap();
        assert_eq!(layout.group_count, 3);
        assert_eq!(layout.binding_count, 1);
        match &layout.slots[2] {
            BindingSlot::ArgumentBuffer { group, layout } => {
                assert_eq!(*group, 2);
                assert_eq!(layout.binding_count, 2);
                assert_eq!(layout.constant_size, 8);
            }
            other => panic!("unexpected slot {other:?}"),
        }
    }
}
