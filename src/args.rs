// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Kernel and shader arguments.
//!
//! [Arg] is a borrowed view: the caller keeps every referenced object alive until the
//! submission (and its completion callback) has finished.  Indirect command recording outlives
//! the call that recorded it and therefore stores [CapturedArg]s, which own their objects.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::argument_buffer::ArgumentBuffer;
use crate::error::Error;
use crate::function_info::{ArgKind, FunctionInfo};
use crate::memory::{Buffer, Image};

#[derive(Clone)]
pub enum Arg<'a> {
    /// Plain data, passed by value.
    Data(&'a [u8]),
    Buffer(&'a dyn Buffer),
    BufferArray(Vec<&'a dyn Buffer>),
    Image(&'a dyn Image),
    ImageArray(Vec<&'a dyn Image>),
    ArgumentBuffer(&'a ArgumentBuffer),
}

impl<'a> Arg<'a> {
    /// Passes `value` by value.
    pub fn value<T: bytemuck::Pod>(value: &'a T) -> Self {
        Arg::Data(bytemuck::bytes_of(value))
    }

    /// Passes the elements of `values` by value, back to back.
    pub fn slice<T: bytemuck::Pod>(values: &'a [T]) -> Self {
        Arg::Data(bytemuck::cast_slice(values))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Arg::Data(_) => "data",
            Arg::Buffer(_) => "buffer",
            Arg::BufferArray(_) => "buffer array",
            Arg::Image(_) => "image",
            Arg::ImageArray(_) => "image array",
            Arg::ArgumentBuffer(_) => "argument buffer",
        }
    }

    /// Whether this argument can bind to a parameter of `kind`.
    pub fn matches(&self, kind: ArgKind) -> bool {
        matches!(
            (self, kind),
            (Arg::Data(_), ArgKind::Plain | ArgKind::InlineUniformBlock | ArgKind::PushConstant)
                | (Arg::Buffer(_), ArgKind::Buffer)
                | (Arg::BufferArray(_), ArgKind::BufferArray)
                | (Arg::Image(_), ArgKind::Image)
                | (Arg::ImageArray(_), ArgKind::ImageArray)
                | (Arg::ArgumentBuffer(_), ArgKind::ArgumentBuffer)
        )
    }
}

impl Debug for Arg<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::Data(bytes) => write!(f, "Data({} bytes)", bytes.len()),
            Arg::Buffer(b) => write!(f, "Buffer({:?})", b.debug_label()),
            Arg::BufferArray(v) => write!(f, "BufferArray({})", v.len()),
            Arg::Image(i) => write!(f, "Image({:?})", i.debug_label()),
            Arg::ImageArray(v) => write!(f, "ImageArray({})", v.len()),
            Arg::ArgumentBuffer(_) => f.write_str("ArgumentBuffer"),
        }
    }
}

impl<'a> From<&'a dyn Buffer> for Arg<'a> {
    fn from(buffer: &'a dyn Buffer) -> Self {
        Arg::Buffer(buffer)
    }
}

impl<'a> From<&'a Arc<dyn Buffer>> for Arg<'a> {
    fn from(buffer: &'a Arc<dyn Buffer>) -> Self {
        Arg::Buffer(buffer.as_ref())
    }
}

impl<'a> From<&'a [Arc<dyn Buffer>]> for Arg<'a> {
    fn from(buffers: &'a [Arc<dyn Buffer>]) -> Self {
        Arg::BufferArray(buffers.iter().map(|b| b.as_ref()).collect())
    }
}

impl<'a> From<&'a [&'a dyn Buffer]> for Arg<'a> {
    fn from(buffers: &'a [&'a dyn Buffer]) -> Self {
        Arg::BufferArray(buffers.to_vec())
    }
}

impl<'a> From<&'a dyn Image> for Arg<'a> {
    fn from(image: &'a dyn Image) -> Self {
        Arg::Image(image)
    }
}

impl<'a> From<&'a Arc<dyn Image>> for Arg<'a> {
    fn from(image: &'a Arc<dyn Image>) -> Self {
        Arg::Image(image.as_ref())
    }
}

impl<'a> From<&'a [Arc<dyn Image>]> for Arg<'a> {
    fn from(images: &'a [Arc<dyn Image>]) -> Self {
        Arg::ImageArray(images.iter().map(|i| i.as_ref()).collect())
    }
}

impl<'a> From<&'a [&'a dyn Image]> for Arg<'a> {
    fn from(images: &'a [&'a dyn Image]) -> Self {
        Arg::ImageArray(images.to_vec())
    }
}

impl<'a> From<&'a ArgumentBuffer> for Arg<'a> {
    fn from(argument_buffer: &'a ArgumentBuffer) -> Self {
        Arg::ArgumentBuffer(argument_buffer)
    }
}

impl<'a> From<&'a Arc<ArgumentBuffer>> for Arg<'a> {
    fn from(argument_buffer: &'a Arc<ArgumentBuffer>) -> Self {
        Arg::ArgumentBuffer(argument_buffer.as_ref())
    }
}

/// An argument that owns what it refers to.
#[derive(Clone)]
pub enum CapturedArg {
    Data(Vec<u8>),
    Buffer(Arc<dyn Buffer>),
    BufferArray(Vec<Arc<dyn Buffer>>),
    Image(Arc<dyn Image>),
    ImageArray(Vec<Arc<dyn Image>>),
    ArgumentBuffer(Arc<ArgumentBuffer>),
}

impl CapturedArg {
    pub fn value<T: bytemuck::Pod>(value: &T) -> Self {
        CapturedArg::Data(bytemuck::bytes_of(value).to_vec())
    }

    pub fn slice<T: bytemuck::Pod>(values: &[T]) -> Self {
        CapturedArg::Data(bytemuck::cast_slice(values).to_vec())
    }

    pub fn as_arg(&self) -> Arg<'_> {
        match self {
            CapturedArg::Data(bytes) => Arg::Data(bytes),
            CapturedArg::Buffer(b) => Arg::Buffer(b.as_ref()),
            CapturedArg::BufferArray(v) => Arg::BufferArray(v.iter().map(|b| b.as_ref()).collect()),
            CapturedArg::Image(i) => Arg::Image(i.as_ref()),
            CapturedArg::ImageArray(v) => Arg::ImageArray(v.iter().map(|i| i.as_ref()).collect()),
            CapturedArg::ArgumentBuffer(a) => Arg::ArgumentBuffer(a.as_ref()),
        }
    }
}

impl Debug for CapturedArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_arg().fmt(f)
    }
}

impl From<Arc<dyn Buffer>> for CapturedArg {
    fn from(buffer: Arc<dyn Buffer>) -> Self {
        CapturedArg::Buffer(buffer)
    }
}

impl From<&Arc<dyn Buffer>> for CapturedArg {
    fn from(buffer: &Arc<dyn Buffer>) -> Self {
        CapturedArg::Buffer(buffer.clone())
    }
}

impl From<Vec<Arc<dyn Buffer>>> for CapturedArg {
    fn from(buffers: Vec<Arc<dyn Buffer>>) -> Self {
        CapturedArg::BufferArray(buffers)
    }
}

impl From<Arc<dyn Image>> for CapturedArg {
    fn from(image: Arc<dyn Image>) -> Self {
        CapturedArg::Image(image)
    }
}

impl From<&Arc<dyn Image>> for CapturedArg {
    fn from(image: &Arc<dyn Image>) -> Self {
        CapturedArg::Image(image.clone())
    }
}

impl From<Vec<Arc<dyn Image>>> for CapturedArg {
    fn from(images: Vec<Arc<dyn Image>>) -> Self {
        CapturedArg::ImageArray(images)
    }
}

impl From<Arc<ArgumentBuffer>> for CapturedArg {
    fn from(argument_buffer: Arc<ArgumentBuffer>) -> Self {
        CapturedArg::ArgumentBuffer(argument_buffer)
    }
}

/// Walks the caller-supplied parameters of `info` next to `args` and checks each pair.
pub(crate) fn check_args(info: &FunctionInfo, args: &[Arg<'_>]) -> Result<(), Error> {
    let expected = info.user_arg_count();
    if expected != args.len() {
        return Err(Error::invalid(format!(
            "function \"{}\" takes {expected} arguments, {} were given",
            info.name,
            args.len()
        )));
    }
    let params = info.args.iter().filter(|a| a.kind.is_user_supplied());
    for (index, (param, arg)) in params.zip(args).enumerate() {
        if !arg.matches(param.kind) {
            return Err(Error::invalid(format!(
                "argument #{index} of \"{}\": expected {:?}, got {}",
                info.name,
                param.kind,
                arg.kind_name()
            )));
        }
        match arg {
            Arg::Data(bytes) if param.size != 0 && bytes.len() != param.size as usize => {
                return Err(Error::invalid(format!(
                    "argument #{index} of \"{}\": expected {} bytes of data, got {}",
                    info.name,
                    param.size,
                    bytes.len()
                )));
            }
            Arg::BufferArray(v) if param.array_extent != 0 && v.len() != param.array_extent as usize => {
                return Err(Error::invalid(format!(
                    "argument #{index} of \"{}\": expected {} buffers, got {}",
                    info.name,
                    param.array_extent,
                    v.len()
                )));
            }
            Arg::ImageArray(v) if param.array_extent != 0 && v.len() != param.array_extent as usize => {
                return Err(Error::invalid(format!(
                    "argument #{index} of \"{}\": expected {} images, got {}",
                    info.name,
                    param.array_extent,
                    v.len()
                )));
            }
            _ => {}
        }
    }
    Ok(())
}
