// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Contiguous parameter blobs.
//!
//! Parameters are packed back to back without padding:
//!
//! | parameter | bytes |
//! |---|---|
//! | plain data | its own bytes |
//! | buffer / argument buffer | 8-byte device address |
//! | buffer array | one 8-byte address per element |
//! | image | [ImageParams] (56 bytes) |
//! | image array | one [ImageParams] per element |
//!
//! Stage inputs take no space.  An argument buffer stores the same blob for its struct layout
//! in its own memory and is passed by address.

use bytemuck::{Pod, Zeroable};

use crate::args::{Arg, check_args};
use crate::argument_buffer::ArgumentBuffer;
use crate::error::Error;
use crate::function_info::{ArgInfo, ArgKind, FunctionInfo};
use crate::memory::{Buffer, Image};

/// Sampler descriptors carried by every image parameter.
pub const SAMPLER_COUNT: usize = 8;

pub const ADDRESS_SIZE: usize = 8;

/// The parameter of one image.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct ImageParams {
    pub samplers: [u32; SAMPLER_COUNT],
    /// Address of level 0.
    pub surface: u64,
    /// Address of the per-level offset table.
    pub lod_buffer: u64,
    /// Low 32 bits of the image type.
    pub runtime_image_type: u32,
    pub padding: u32,
}

pub const IMAGE_PARAMS_SIZE: usize = std::mem::size_of::<ImageParams>();

/// Supplies backend addresses while encoding.
pub trait ParamBlobResolver {
    fn buffer_address(&self, buffer: &dyn Buffer) -> Result<u64, Error>;
    fn image_params(&self, image: &dyn Image) -> Result<ImageParams, Error>;
    fn argument_buffer_address(&self, argument_buffer: &ArgumentBuffer) -> Result<u64, Error> {
        self.buffer_address(argument_buffer.storage().as_ref())
    }
}

/// An encoded parameter blob plus the offset of every caller-supplied parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamBlob {
    bytes: Vec<u8>,
    offsets: Vec<usize>,
}

impl ParamBlob {
    /// Static size of one parameter.
    pub fn param_size(param: &ArgInfo) -> usize {
        match param.kind {
            ArgKind::Plain | ArgKind::InlineUniformBlock | ArgKind::PushConstant => {
                param.size as usize
            }
            ArgKind::Buffer | ArgKind::ArgumentBuffer => ADDRESS_SIZE,
            ArgKind::BufferArray => ADDRESS_SIZE * param.array_extent as usize,
            ArgKind::Image => IMAGE_PARAMS_SIZE,
            ArgKind::ImageArray => IMAGE_PARAMS_SIZE * param.array_extent as usize,
            ArgKind::StageInput => 0,
        }
    }

    /// Bytes a blob for `info` occupies.
    pub fn size_of(info: &FunctionInfo) -> usize {
        info.args.iter().map(Self::param_size).sum()
    }

    /// Encodes `args` for `info`.
    ///
    /// Inside an argument buffer (`in_argument_buffer`), image arrays are rejected.
    pub fn encode(
        info: &FunctionInfo,
        args: &[Arg<'_>],
        resolver: &dyn ParamBlobResolver,
        in_argument_buffer: bool,
    ) -> Result<ParamBlob, Error> {
        check_args(info, args)?;
        let mut blob = ParamBlob {
            bytes: Vec::with_capacity(Self::size_of(info)),
            offsets: Vec::with_capacity(args.len()),
        };
        for arg in args {
            blob.offsets.push(blob.bytes.len());
            match arg {
                Arg::Data(bytes) => blob.bytes.extend_from_slice(bytes),
                Arg::Buffer(buffer) => blob.push_address(resolver.buffer_address(*buffer)?),
                Arg::BufferArray(buffers) => {
                    for buffer in buffers {
                        blob.push_address(resolver.buffer_address(*buffer)?);
                    }
                }
                Arg::Image(image) => blob.push_image(resolver.image_params(*image)?),
                Arg::ImageArray(images) => {
                    if in_argument_buffer {
                        return Err(Error::unsupported("image arrays inside argument buffers"));
                    }
                    for image in images {
                        blob.push_image(resolver.image_params(*image)?);
                    }
                }
                Arg::ArgumentBuffer(argument_buffer) => {
                    blob.push_address(resolver.argument_buffer_address(argument_buffer)?)
                }
            }
        }
        Ok(blob)
    }

    fn push_address(&mut self, address: u64) {
        self.bytes.extend_from_slice(&address.to_le_bytes());
    }

    fn push_image(&mut self, params: ImageParams) {
        self.bytes.extend_from_slice(bytemuck::bytes_of(&params));
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Byte offset of each caller-supplied parameter.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// The bytes of caller-supplied parameter `index`.
    pub fn param(&self, index: usize) -> Option<&[u8]> {
        let start = *self.offsets.get(index)?;
        let end = self.offsets.get(index + 1).copied().unwrap_or(self.bytes.len());
        self.bytes.get(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function_info::ArgAccess;
    use crate::image_type::ImageType;

    struct NoResources;

    impl ParamBlobResolver for NoResources {
        fn buffer_address(&self, _buffer: &dyn Buffer) -> Result<u64, Error> {
            Err(Error::invalid("no buffers"))
        }
        fn image_params(&self, _image: &dyn Image) -> Result<ImageParams, Error> {
            Err(Error::invalid("no images"))
        }
    }

    #[test]
    fn image_params_layout() {
        assert_eq!(IMAGE_PARAMS_SIZE, 56);
        let params = ImageParams {
            samplers: [1, 2, 3, 4, 5, 6, 7, 8],
            surface: 0x1122_3344_5566_7788,
            lod_buffer: 0x99,
            runtime_image_type: 0xabcd,
            padding: 0,
        };
        let bytes = bytemuck::bytes_of(&params);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[28..32], &8u32.to_le_bytes());
        assert_eq!(&bytes[32..40], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[40..48], &0x99u64.to_le_bytes());
        assert_eq!(&bytes[48..52], &0xabcdu32.to_le_bytes());
        assert_eq!(&bytes[52..56], &[0, 0, 0, 0]);
    }

    #[test]
    fn plain_data_is_packed_without_padding() {
        let info = FunctionInfo::kernel(
            "k",
            vec![ArgInfo::plain(1), ArgInfo::stage_input(16), ArgInfo::plain(8), ArgInfo::plain(2)],
        );
        let a = 0xaau8;
        let b = 0x0102_0304_0506_0708u64;
        let c = 0xbbccu16;
        let blob =
            ParamBlob::encode(&info, &[Arg::value(&a), Arg::value(&b), Arg::value(&c)], &NoResources, false)
                .unwrap();
        assert_eq!(blob.len(), 11);
        assert_eq!(blob.offsets(), &[0, 1, 9]);
        assert_eq!(blob.param(1).unwrap(), &b.to_le_bytes());
        assert_eq!(blob.param(2).unwrap(), &[0xcc, 0xbb]);
        assert_eq!(ParamBlob::size_of(&info), 11);
    }

    #[test]
    fn static_sizes() {
        let info = FunctionInfo::kernel(
            "k",
            vec![
                ArgInfo::buffer(ArgAccess::Read),
                ArgInfo::buffer_array(ArgAccess::Write, 3),
                ArgInfo::image(ImageType::IMAGE_2D | ImageType::RGBA8, ArgAccess::Read),
                ArgInfo::image_array(ImageType::IMAGE_2D | ImageType::R32F, ArgAccess::Read, 2),
                ArgInfo::plain(12),
            ],
        );
        assert_eq!(ParamBlob::size_of(&info), 8 + 24 + 56 + 112 + 12);
    }
}
