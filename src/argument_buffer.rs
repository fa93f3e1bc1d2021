// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Argument buffers: device-side structs of bindings passed to a function as one argument.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use crate::args::{Arg, check_args};
use crate::error::{Error, report};
use crate::function_info::{ArgKind, FunctionInfo};
use crate::memory::{Buffer, MemoryObject};
use crate::memory_flags::MemoryFlags;
use crate::program::FunctionEntry;
use crate::queue::Queue;

/// Backend half of an argument buffer: turns arguments into the backend's representation.
pub(crate) trait ArgumentEncoder: Send + Sync + Debug {
    /// Bytes of storage the struct layout needs.
    fn storage_size(&self, layout: &FunctionInfo) -> Result<usize, Error>;

    fn encode(
        &self,
        queue: &dyn Queue,
        storage: &dyn Buffer,
        layout: &FunctionInfo,
        args: &[Arg<'_>],
    ) -> Result<(), Error>;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug)]
pub struct ArgumentBuffer {
    storage: Arc<dyn Buffer>,
    layout: Arc<FunctionInfo>,
    encoder: Box<dyn ArgumentEncoder>,
}

impl ArgumentBuffer {
    /// The memory holding the encoded struct.
    pub fn storage(&self) -> &Arc<dyn Buffer> {
        &self.storage
    }

    /// The struct layout this buffer encodes.
    pub fn layout(&self) -> &Arc<FunctionInfo> {
        &self.layout
    }

    pub(crate) fn encoder(&self) -> &dyn ArgumentEncoder {
        self.encoder.as_ref()
    }

    /// Encodes `args` into the buffer, replacing previous contents.
    pub fn set_arguments(&self, queue: &dyn Queue, args: &[Arg<'_>]) -> Result<(), Error> {
        let platform = self.storage.platform_type();
        check_args(&self.layout, args).map_err(|e| report("argument_buffer::set_arguments", platform, e))?;
        self.encoder
            .encode(queue, self.storage.as_ref(), &self.layout, args)
            .map_err(|e| report("argument_buffer::set_arguments", platform, e))
    }
}

/// Shared argument-buffer creation.
///
/// `user_index` counts caller-supplied parameters of the entry's function; the parameter it
/// names must be an argument buffer.  `allocate` creates the storage on the backend.
pub(crate) fn create_argument_buffer_internal(
    queue: &dyn Queue,
    entry: &FunctionEntry,
    user_index: usize,
    extra_flags: MemoryFlags,
    zero_init: bool,
    encoder: Box<dyn ArgumentEncoder>,
    allocate: impl FnOnce(usize, MemoryFlags) -> Result<Arc<dyn Buffer>, Error>,
) -> Result<Arc<ArgumentBuffer>, Error> {
    let platform = queue.platform_type();
    let param = entry
        .info
        .args
        .iter()
        .filter(|a| a.kind.is_user_supplied())
        .nth(user_index)
        .ok_or_else(|| {
            report(
                "function::create_argument_buffer",
                platform,
                Error::invalid(format!(
                    "\"{}\" has no argument #{user_index}",
                    entry.info.name
                )),
            )
        })?;
    let layout = match (param.kind, &param.argument_buffer) {
        (ArgKind::ArgumentBuffer, Some(layout)) => layout.clone(),
        _ => {
            return Err(report(
                "function::create_argument_buffer",
                platform,
                Error::invalid(format!(
                    "argument #{user_index} of \"{}\" is not an argument buffer",
                    entry.info.name
                )),
            ));
        }
    };
    let size = encoder
        .storage_size(&layout)
        .map_err(|e| report("function::create_argument_buffer", platform, e))?;
    let flags = MemoryFlags::READ | MemoryFlags::HOST_WRITE | extra_flags;
    let storage = allocate(size, flags)?;
    storage.set_debug_label(&format!("{}.arg{user_index}", entry.info.name));
    if zero_init {
        storage.zero(queue)?;
    }
    Ok(Arc::new(ArgumentBuffer {
        storage,
        layout,
        encoder,
    }))
}
