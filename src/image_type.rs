// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Image type bitset and the pixel arithmetic derived from it.
//!
//! An [ImageType] packs dimensionality, channel layout, storage format and usage bits into a
//! single `u64`.  Multi-bit fields (dimension count, channel count, data type, format, sample
//! count) are read through the accessor methods rather than `contains`.
//!
//! Host-side image memory always uses the same tightly packed layout: level 0 first, then each
//! smaller level; within a level, layers (and cube faces) are outermost, then depth slices, rows
//! and pixels.

use half::f16;

/// Default cap on the number of mip levels of one image.
pub const DEFAULT_MIP_LEVEL_LIMIT: u32 = 16;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageType: u64 {
        const DIM_MASK = 0b11;
        const DIM_1D = 1;
        const DIM_2D = 2;
        const DIM_3D = 3;
        const ARRAY = 1 << 2;
        const BUFFER = 1 << 3;
        const MSAA = 1 << 4;
        const CUBE = 1 << 5;
        const DEPTH = 1 << 6;
        const STENCIL = 1 << 7;

        /// channel count - 1
        const CHANNELS_MASK = 0b11 << 8;
        const CHANNELS_1 = 0 << 8;
        const CHANNELS_2 = 1 << 8;
        const CHANNELS_3 = 2 << 8;
        const CHANNELS_4 = 3 << 8;

        const DATA_TYPE_MASK = 0b11 << 10;
        const INT = 1 << 10;
        const UINT = 2 << 10;
        const FLOAT = 3 << 10;

        const FORMAT_MASK = 0b1111 << 12;
        const FORMAT_8 = 1 << 12;
        const FORMAT_16 = 2 << 12;
        const FORMAT_32 = 3 << 12;
        const FORMAT_64 = 4 << 12;
        const FORMAT_24 = 5 << 12;
        const FORMAT_24_8 = 6 << 12;
        const FORMAT_32_8 = 7 << 12;
        const FORMAT_2_10_10_10 = 8 << 12;
        const FORMAT_11_11_10 = 9 << 12;

        const NORMALIZED = 1 << 16;
        const SRGB = 1 << 17;
        const RENDER_TARGET = 1 << 18;
        const TRANSIENT = 1 << 19;
        const MIP_MAPPED = 1 << 20;
        /// Channels 0 and 2 are stored swapped.
        const BGRA = 1 << 21;

        /// log2 of the MSAA sample count
        const SAMPLE_COUNT_MASK = 0b111 << 22;

        /// Access qualifiers, only meaningful on function arguments.
        const READ = 1 << 25;
        const WRITE = 1 << 26;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();

        const IMAGE_1D = Self::DIM_1D.bits();
        const IMAGE_1D_ARRAY = Self::DIM_1D.bits() | Self::ARRAY.bits();
        const IMAGE_2D = Self::DIM_2D.bits();
        const IMAGE_2D_ARRAY = Self::DIM_2D.bits() | Self::ARRAY.bits();
        const IMAGE_3D = Self::DIM_3D.bits();
        const IMAGE_CUBE = Self::DIM_2D.bits() | Self::CUBE.bits();
        const IMAGE_CUBE_ARRAY = Self::DIM_2D.bits() | Self::CUBE.bits() | Self::ARRAY.bits();
        const IMAGE_DEPTH = Self::DIM_2D.bits() | Self::DEPTH.bits();

        const R8UI = Self::CHANNELS_1.bits() | Self::UINT.bits() | Self::FORMAT_8.bits();
        const R8 = Self::R8UI.bits() | Self::NORMALIZED.bits();
        const RG8 = Self::CHANNELS_2.bits() | Self::UINT.bits() | Self::FORMAT_8.bits()
            | Self::NORMALIZED.bits();
        const RGBA8UI = Self::CHANNELS_4.bits() | Self::UINT.bits() | Self::FORMAT_8.bits();
        const RGBA8 = Self::RGBA8UI.bits() | Self::NORMALIZED.bits();
        const RGBA8_SRGB = Self::RGBA8.bits() | Self::SRGB.bits();
        const BGRA8 = Self::RGBA8.bits() | Self::BGRA.bits();
        const RGBA8I = Self::CHANNELS_4.bits() | Self::INT.bits() | Self::FORMAT_8.bits();
        const R16F = Self::CHANNELS_1.bits() | Self::FLOAT.bits() | Self::FORMAT_16.bits();
        const RGBA16F = Self::CHANNELS_4.bits() | Self::FLOAT.bits() | Self::FORMAT_16.bits();
        const R32UI = Self::CHANNELS_1.bits() | Self::UINT.bits() | Self::FORMAT_32.bits();
        const R32I = Self::CHANNELS_1.bits() | Self::INT.bits() | Self::FORMAT_32.bits();
        const R32F = Self::CHANNELS_1.bits() | Self::FLOAT.bits() | Self::FORMAT_32.bits();
        const RG32F = Self::CHANNELS_2.bits() | Self::FLOAT.bits() | Self::FORMAT_32.bits();
        const RGBA32UI = Self::CHANNELS_4.bits() | Self::UINT.bits() | Self::FORMAT_32.bits();
        const RGBA32F = Self::CHANNELS_4.bits() | Self::FLOAT.bits() | Self::FORMAT_32.bits();
        const RGB10A2 = Self::CHANNELS_4.bits() | Self::UINT.bits()
            | Self::FORMAT_2_10_10_10.bits() | Self::NORMALIZED.bits();
        const D16 = Self::DEPTH.bits() | Self::CHANNELS_1.bits() | Self::UINT.bits()
            | Self::FORMAT_16.bits() | Self::NORMALIZED.bits();
        const D24 = Self::DEPTH.bits() | Self::CHANNELS_1.bits() | Self::UINT.bits()
            | Self::FORMAT_24.bits() | Self::NORMALIZED.bits();
        const D32F = Self::DEPTH.bits() | Self::CHANNELS_1.bits() | Self::FLOAT.bits()
            | Self::FORMAT_32.bits();
        const D24S8 = Self::DEPTH.bits() | Self::STENCIL.bits() | Self::CHANNELS_2.bits()
            | Self::UINT.bits() | Self::FORMAT_24_8.bits() | Self::NORMALIZED.bits();
        const D32FS8 = Self::DEPTH.bits() | Self::STENCIL.bits() | Self::CHANNELS_2.bits()
            | Self::FLOAT.bits() | Self::FORMAT_32_8.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int,
    Uint,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFormat {
    Bits8,
    Bits16,
    Bits32,
    Bits64,
    Depth24,
    Depth24Stencil8,
    Depth32Stencil8,
    Packed2_10_10_10,
    Packed11_11_10,
}

impl ImageType {
    pub fn dim_count(self) -> u32 {
        (self.bits() & Self::DIM_MASK.bits()) as u32
    }
    pub fn is_array(self) -> bool {
        self.contains(Self::ARRAY)
    }
    pub fn is_cube(self) -> bool {
        self.contains(Self::CUBE)
    }
    pub fn is_buffer(self) -> bool {
        self.contains(Self::BUFFER)
    }
    pub fn is_msaa(self) -> bool {
        self.contains(Self::MSAA)
    }
    pub fn is_depth(self) -> bool {
        self.contains(Self::DEPTH)
    }
    pub fn has_stencil(self) -> bool {
        self.contains(Self::STENCIL)
    }
    pub fn is_normalized(self) -> bool {
        self.contains(Self::NORMALIZED)
    }
    pub fn is_srgb(self) -> bool {
        self.contains(Self::SRGB)
    }
    pub fn is_render_target(self) -> bool {
        self.contains(Self::RENDER_TARGET)
    }
    pub fn is_transient(self) -> bool {
        self.contains(Self::TRANSIENT)
    }
    pub fn is_mip_mapped(self) -> bool {
        self.contains(Self::MIP_MAPPED)
    }
    pub fn is_bgra(self) -> bool {
        self.contains(Self::BGRA)
    }
    pub fn is_read(self) -> bool {
        self.contains(Self::READ)
    }
    pub fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn channel_count(self) -> u32 {
        ((self.bits() & Self::CHANNELS_MASK.bits()) >> 8) as u32 + 1
    }

    pub fn data_type(self) -> Option<DataType> {
        match (self.bits() & Self::DATA_TYPE_MASK.bits()) >> 10 {
            1 => Some(DataType::Int),
            2 => Some(DataType::Uint),
            3 => Some(DataType::Float),
            _ => None,
        }
    }

    pub fn format(self) -> Option<ChannelFormat> {
        match (self.bits() & Self::FORMAT_MASK.bits()) >> 12 {
            1 => Some(ChannelFormat::Bits8),
            2 => Some(ChannelFormat::Bits16),
            3 => Some(ChannelFormat::Bits32),
            4 => Some(ChannelFormat::Bits64),
            5 => Some(ChannelFormat::Depth24),
            6 => Some(ChannelFormat::Depth24Stencil8),
            7 => Some(ChannelFormat::Depth32Stencil8),
            8 => Some(ChannelFormat::Packed2_10_10_10),
            9 => Some(ChannelFormat::Packed11_11_10),
            _ => None,
        }
    }

    pub fn sample_count(self) -> u32 {
        if !self.is_msaa() {
            return 1;
        }
        1 << ((self.bits() & Self::SAMPLE_COUNT_MASK.bits()) >> 22)
    }

    /// Sets the MSAA flag and sample count; `samples` must be a power of two in 2..=64.
    pub fn with_sample_count(self, samples: u32) -> Self {
        let cleared = self.difference(Self::SAMPLE_COUNT_MASK | Self::MSAA);
        if samples <= 1 {
            return cleared;
        }
        let log2 = u64::from(samples.trailing_zeros().min(6));
        cleared | Self::MSAA | Self::from_bits_retain(log2 << 22)
    }

    /// The type with only the storage-relevant fields, used to compare formats.
    pub fn storage_format(self) -> Self {
        self.intersection(
            Self::CHANNELS_MASK
                | Self::DATA_TYPE_MASK
                | Self::FORMAT_MASK
                | Self::NORMALIZED
                | Self::SRGB
                | Self::BGRA
                | Self::DEPTH
                | Self::STENCIL,
        )
    }

    pub fn bits_per_pixel(self) -> u32 {
        let channels = self.channel_count();
        match self.format() {
            Some(ChannelFormat::Bits8) => 8 * channels,
            Some(ChannelFormat::Bits16) => 16 * channels,
            Some(ChannelFormat::Bits32) => 32 * channels,
            Some(ChannelFormat::Bits64) => 64 * channels,
            Some(ChannelFormat::Depth24)
            | Some(ChannelFormat::Depth24Stencil8)
            | Some(ChannelFormat::Packed2_10_10_10)
            | Some(ChannelFormat::Packed11_11_10) => 32,
            Some(ChannelFormat::Depth32Stencil8) => 64,
            None => 0,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        self.bits_per_pixel().div_ceil(8)
    }

    /// Layers including cube faces.
    pub fn layer_count(self, extent: [u32; 4]) -> u32 {
        let layers = if self.is_array() { extent[3].max(1) } else { 1 };
        if self.is_cube() { layers * 6 } else { layers }
    }

    /// Number of levels in a full chain for `extent`, capped at `limit`.
    pub fn full_mip_level_count(self, extent: [u32; 4], limit: u32) -> u32 {
        let dims = self.dim_count().clamp(1, 3) as usize;
        let max_dim = extent[..dims].iter().copied().max().unwrap_or(1).max(1);
        (32 - max_dim.leading_zeros()).min(limit.max(1))
    }

    /// Level count of an image of this type: the full chain when mip-mapped, otherwise 1.
    pub fn mip_level_count(self, extent: [u32; 4], limit: u32) -> u32 {
        if self.is_mip_mapped() {
            self.full_mip_level_count(extent, limit)
        } else {
            1
        }
    }

    /// Extent of mip `level`; layers are never reduced.
    pub fn level_extent(self, extent: [u32; 4], level: u32) -> [u32; 4] {
        let dims = self.dim_count().clamp(1, 3) as usize;
        let mut out = extent;
        for component in out.iter_mut().take(dims) {
            *component = (*component >> level).max(1);
        }
        out
    }

    /// Bytes of one mip level, all layers included.
    pub fn level_size(self, extent: [u32; 4], level: u32) -> usize {
        let e = self.level_extent(extent, level);
        e[0] as usize
            * e[1] as usize
            * e[2] as usize
            * self.layer_count(extent) as usize
            * self.bytes_per_pixel() as usize
    }

    /// Byte offset of mip `level` within the packed host layout.
    pub fn level_offset(self, extent: [u32; 4], level: u32) -> usize {
        (0..level).map(|l| self.level_size(extent, l)).sum()
    }

    /// Bytes of the packed host layout holding `levels` levels.
    pub fn image_size(self, extent: [u32; 4], levels: u32) -> usize {
        self.level_offset(extent, levels)
    }

    /// Checks the structural invariants and returns the normalized extent.
    ///
    /// Components beyond the dimensionality must be 0 or 1 and come back as 1.
    pub fn validate(self, extent: [u32; 4]) -> Result<[u32; 4], crate::Error> {
        let dims = self.dim_count();
        if dims == 0 {
            return Err(crate::Error::invalid("image type has no dimensionality"));
        }
        if self.is_cube() && dims != 2 {
            return Err(crate::Error::invalid("cube images must be two-dimensional"));
        }
        if self.data_type().is_none() || self.format().is_none() {
            return Err(crate::Error::invalid(
                "image type must specify a channel data type and format",
            ));
        }
        if self.is_msaa() && self.is_mip_mapped() {
            return Err(crate::Error::invalid(
                "MSAA and mip-mapping are mutually exclusive",
            ));
        }
        if self.is_depth() && self.channel_count() > 2 {
            return Err(crate::Error::invalid("depth images have at most two channels"));
        }
        let mut normalized = extent;
        for (i, component) in normalized.iter_mut().enumerate().take(3) {
            if (i as u32) < dims {
                if *component == 0 {
                    return Err(crate::Error::invalid("image extent must be non-zero"));
                }
            } else if *component > 1 {
                return Err(crate::Error::invalid(
                    "image extent beyond the dimensionality must be 1",
                ));
            } else {
                *component = 1;
            }
        }
        if self.is_cube() && normalized[0] != normalized[1] {
            return Err(crate::Error::invalid("cube faces must be square"));
        }
        if self.is_array() {
            if normalized[3] == 0 {
                return Err(crate::Error::invalid("image arrays need at least one layer"));
            }
        } else if normalized[3] > 1 {
            return Err(crate::Error::invalid(
                "layer count given for a non-array image",
            ));
        } else {
            normalized[3] = 1;
        }
        Ok(normalized)
    }

    /// Decodes one texel into normalized/float RGBA.
    ///
    /// Integer formats decode to their numeric value; normalized formats to [0,1] / [-1,1];
    /// sRGB formats are linearized.  Missing channels read as `(0, 0, 0, 1)`.
    pub fn decode_texel(self, bytes: &[u8]) -> Option<[f32; 4]> {
        let channels = self.channel_count() as usize;
        let data_type = self.data_type()?;
        let mut out = [0.0, 0.0, 0.0, 1.0];
        match self.format()? {
            ChannelFormat::Bits8 => {
                for (c, value) in out.iter_mut().enumerate().take(channels) {
                    let raw = *bytes.get(c)?;
                    *value = match data_type {
                        DataType::Uint if self.is_normalized() => raw as f32 / 255.0,
                        DataType::Int if self.is_normalized() => {
                            (raw as i8 as f32 / 127.0).max(-1.0)
                        }
                        DataType::Int => raw as i8 as f32,
                        _ => raw as f32,
                    };
                }
            }
            ChannelFormat::Bits16 => {
                for (c, value) in out.iter_mut().enumerate().take(channels) {
                    let raw = u16::from_le_bytes([*bytes.get(2 * c)?, *bytes.get(2 * c + 1)?]);
                    *value = match data_type {
                        DataType::Float => f16::from_bits(raw).to_f32(),
                        DataType::Uint if self.is_normalized() => raw as f32 / 65535.0,
                        DataType::Int if self.is_normalized() => {
                            (raw as i16 as f32 / 32767.0).max(-1.0)
                        }
                        DataType::Int => raw as i16 as f32,
                        DataType::Uint => raw as f32,
                    };
                }
            }
            ChannelFormat::Bits32 => {
                for (c, value) in out.iter_mut().enumerate().take(channels) {
                    let raw = u32::from_le_bytes(bytes.get(4 * c..4 * c + 4)?.try_into().ok()?);
                    *value = match data_type {
                        DataType::Float => f32::from_bits(raw),
                        DataType::Int => raw as i32 as f32,
                        DataType::Uint => raw as f32,
                    };
                }
            }
            ChannelFormat::Bits64 => {
                for (c, value) in out.iter_mut().enumerate().take(channels) {
                    let raw = u64::from_le_bytes(bytes.get(8 * c..8 * c + 8)?.try_into().ok()?);
                    *value = match data_type {
                        DataType::Float => f64::from_bits(raw) as f32,
                        DataType::Int => raw as i64 as f32,
                        DataType::Uint => raw as f32,
                    };
                }
            }
            ChannelFormat::Depth24 | ChannelFormat::Depth24Stencil8 => {
                let raw = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
                out[0] = (raw & 0x00ff_ffff) as f32 / 16_777_215.0;
                if channels > 1 {
                    out[1] = (raw >> 24) as f32;
                }
            }
            ChannelFormat::Depth32Stencil8 => {
                out[0] = f32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
                if channels > 1 {
                    out[1] = *bytes.get(4)? as f32;
                }
            }
            ChannelFormat::Packed2_10_10_10 => {
                let raw = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
                let scale = |v: u32, max: u32| {
                    if self.is_normalized() { v as f32 / max as f32 } else { v as f32 }
                };
                out = [
                    scale(raw & 0x3ff, 0x3ff),
                    scale((raw >> 10) & 0x3ff, 0x3ff),
                    scale((raw >> 20) & 0x3ff, 0x3ff),
                    scale(raw >> 30, 3),
                ];
            }
            ChannelFormat::Packed11_11_10 => return None,
        }
        if self.is_bgra() {
            out.swap(0, 2);
        }
        if self.is_srgb() {
            for value in out.iter_mut().take(3) {
                *value = srgb_to_linear(*value);
            }
        }
        Some(out)
    }

    /// Inverse of [ImageType::decode_texel]; values are clamped/rounded to the format.
    pub fn encode_texel(self, texel: [f32; 4], bytes: &mut [u8]) -> Option<()> {
        let channels = self.channel_count() as usize;
        let data_type = self.data_type()?;
        let mut texel = texel;
        if self.is_srgb() {
            for value in texel.iter_mut().take(3) {
                *value = linear_to_srgb(*value);
            }
        }
        if self.is_bgra() {
            texel.swap(0, 2);
        }
        match self.format()? {
            ChannelFormat::Bits8 => {
                for (c, value) in texel.iter().enumerate().take(channels) {
                    let raw = match data_type {
                        DataType::Uint if self.is_normalized() => {
                            (value.clamp(0.0, 1.0) * 255.0).round() as u8
                        }
                        DataType::Int if self.is_normalized() => {
                            (value.clamp(-1.0, 1.0) * 127.0).round() as i8 as u8
                        }
                        DataType::Int => value.round().clamp(-128.0, 127.0) as i8 as u8,
                        _ => value.round().clamp(0.0, 255.0) as u8,
                    };
                    *bytes.get_mut(c)? = raw;
                }
            }
            ChannelFormat::Bits16 => {
                for (c, value) in texel.iter().enumerate().take(channels) {
                    let raw = match data_type {
                        DataType::Float => f16::from_f32(*value).to_bits(),
                        DataType::Uint if self.is_normalized() => {
                            (value.clamp(0.0, 1.0) * 65535.0).round() as u16
                        }
                        DataType::Int if self.is_normalized() => {
                            (value.clamp(-1.0, 1.0) * 32767.0).round() as i16 as u16
                        }
                        DataType::Int => value.round().clamp(-32768.0, 32767.0) as i16 as u16,
                        DataType::Uint => value.round().clamp(0.0, 65535.0) as u16,
                    };
                    bytes.get_mut(2 * c..2 * c + 2)?.copy_from_slice(&raw.to_le_bytes());
                }
            }
            ChannelFormat::Bits32 => {
                for (c, value) in texel.iter().enumerate().take(channels) {
                    let raw = match data_type {
                        DataType::Float => value.to_bits(),
                        DataType::Int => value.round() as i32 as u32,
                        DataType::Uint => value.round().max(0.0) as u32,
                    };
                    bytes.get_mut(4 * c..4 * c + 4)?.copy_from_slice(&raw.to_le_bytes());
                }
            }
            ChannelFormat::Bits64 => {
                for (c, value) in texel.iter().enumerate().take(channels) {
                    let raw = match data_type {
                        DataType::Float => (*value as f64).to_bits(),
                        DataType::Int => value.round() as i64 as u64,
                        DataType::Uint => value.round().max(0.0) as u64,
                    };
                    bytes.get_mut(8 * c..8 * c + 8)?.copy_from_slice(&raw.to_le_bytes());
                }
            }
            ChannelFormat::Depth24 | ChannelFormat::Depth24Stencil8 => {
                let depth = (texel[0].clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
                let stencil = if channels > 1 {
                    texel[1].round().clamp(0.0, 255.0) as u32
                } else {
                    0
                };
                bytes
                    .get_mut(0..4)?
                    .copy_from_slice(&(depth | (stencil << 24)).to_le_bytes());
            }
            ChannelFormat::Depth32Stencil8 => {
                bytes.get_mut(0..4)?.copy_from_slice(&texel[0].to_le_bytes());
                if channels > 1 {
                    *bytes.get_mut(4)? = texel[1].round().clamp(0.0, 255.0) as u8;
                }
            }
            ChannelFormat::Packed2_10_10_10 => {
                let pack = |v: f32, max: u32| {
                    if self.is_normalized() {
                        (v.clamp(0.0, 1.0) * max as f32).round() as u32
                    } else {
                        (v.round().max(0.0) as u32).min(max)
                    }
                };
                let raw = pack(texel[0], 0x3ff)
                    | (pack(texel[1], 0x3ff) << 10)
                    | (pack(texel[2], 0x3ff) << 20)
                    | (pack(texel[3], 3) << 30);
                bytes.get_mut(0..4)?.copy_from_slice(&raw.to_le_bytes());
            }
            ChannelFormat::Packed11_11_10 => return None,
        }
        Some(())
    }
}

fn srgb_to_linear(value: f32) -> f32 {
    if value <= 0.04045 {
        value / 12.92
    } else {
        ((value + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(value: f32) -> f32 {
    let value = value.clamp(0.0, 1.0);
    if value <= 0.003_130_8 {
        value * 12.92
    } else {
        1.055 * value.powf(1.0 / 2.4) - 0.055
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields() {
        let t = ImageType::IMAGE_2D_ARRAY | ImageType::RGBA8 | ImageType::MIP_MAPPED;
        assert_eq!(t.dim_count(), 2);
        assert!(t.is_array());
        assert_eq!(t.channel_count(), 4);
        assert_eq!(t.data_type(), Some(DataType::Uint));
        assert_eq!(t.format(), Some(ChannelFormat::Bits8));
        assert!(t.is_normalized());
        assert_eq!(t.bytes_per_pixel(), 4);
        assert_eq!(ImageType::D24S8.bytes_per_pixel(), 4);
        assert_eq!(ImageType::D32FS8.bytes_per_pixel(), 8);
        assert_eq!(ImageType::RGBA16F.bytes_per_pixel(), 8);
    }

    #[test]
    fn sample_count() {
        let t = (ImageType::IMAGE_2D | ImageType::RGBA8).with_sample_count(4);
        assert!(t.is_msaa());
        assert_eq!(t.sample_count(), 4);
        assert_eq!(t.with_sample_count(1).sample_count(), 1);
        assert!(!t.with_sample_count(1).is_msaa());
    }

    #[test]
    fn mip_chain() {
        let t = ImageType::IMAGE_2D | ImageType::R32F | ImageType::MIP_MAPPED;
        let extent = [16, 4, 1, 1];
        assert_eq!(t.mip_level_count(extent, DEFAULT_MIP_LEVEL_LIMIT), 5);
        assert_eq!(t.mip_level_count(extent, 3), 3);
        assert_eq!(t.level_extent(extent, 3), [2, 1, 1, 1]);
        assert_eq!(t.level_extent(extent, 4), [1, 1, 1, 1]);
        assert_eq!(t.level_size(extent, 0), 16 * 4 * 4);
        assert_eq!(t.level_offset(extent, 2), 256 + 64);
        assert_eq!(t.image_size(extent, 5), 256 + 64 + 16 + 8 + 4);
        let flat = ImageType::IMAGE_2D | ImageType::R32F;
        assert_eq!(flat.mip_level_count(extent, DEFAULT_MIP_LEVEL_LIMIT), 1);
    }

    #[test]
    fn cube_layers() {
        let t = ImageType::IMAGE_CUBE_ARRAY | ImageType::RGBA8;
        assert_eq!(t.layer_count([8, 8, 1, 2]), 12);
        assert_eq!(t.level_size([8, 8, 1, 2], 0), 8 * 8 * 12 * 4);
    }

    #[test]
    fn validation() {
        let t = ImageType::IMAGE_2D | ImageType::RGBA8;
        assert_eq!(t.validate([4, 4, 0, 0]).ok(), Some([4, 4, 1, 1]));
        assert!(t.validate([4, 4, 2, 1]).is_err());
        assert!(t.validate([0, 4, 1, 1]).is_err());
        assert!((t | ImageType::MIP_MAPPED).with_sample_count(4).validate([4, 4, 1, 1]).is_err());
        assert!(ImageType::IMAGE_2D.validate([4, 4, 1, 1]).is_err());
        assert!((ImageType::IMAGE_CUBE | ImageType::RGBA8).validate([4, 8, 1, 1]).is_err());
        assert!((ImageType::IMAGE_2D_ARRAY | ImageType::RGBA8).validate([4, 4, 1, 3]).is_ok());
    }

    #[test]
    fn texel_conversion() {
        let mut bytes = [0u8; 4];
        ImageType::RGBA8.encode_texel([1.0, 0.5, 0.0, 1.0], &mut bytes).unwrap();
        assert_eq!(bytes, [255, 128, 0, 255]);
        ImageType::BGRA8.encode_texel([1.0, 0.5, 0.0, 1.0], &mut bytes).unwrap();
        assert_eq!(bytes, [0, 128, 255, 255]);
        let decoded = ImageType::BGRA8.decode_texel(&bytes).unwrap();
        assert_eq!(decoded[0], 1.0);
        assert_eq!(decoded[2], 0.0);

        let mut half_bytes = [0u8; 2];
        ImageType::R16F.encode_texel([0.25, 0.0, 0.0, 0.0], &mut half_bytes).unwrap();
        assert_eq!(ImageType::R16F.decode_texel(&half_bytes).unwrap()[0], 0.25);

        let mut depth = [0u8; 4];
        ImageType::D24S8.encode_texel([1.0, 7.0, 0.0, 0.0], &mut depth).unwrap();
        assert_eq!(u32::from_le_bytes(depth), 0x07ff_ffff);

        let unused = ImageType::R32UI.decode_texel(&42u32.to_le_bytes()).unwrap();
        assert_eq!(unused, [42.0, 0.0, 0.0, 1.0]);
    }
}
