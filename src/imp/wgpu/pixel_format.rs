// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Mapping of [ImageType]s onto wgpu texture formats and bindings.
//!
//! wgpu has no three-channel formats, so 8/16/32-bit RGB images are stored as RGBA on the
//! device; [DeviceFormat::storage] is the layout texels actually have in GPU memory and the
//! host-side packed layout is converted on every transfer.

use wgpu::TextureFormat as F;

use crate::error::Error;
use crate::function_info::ArgAccess;
use crate::image_type::{ChannelFormat, DataType, ImageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeviceFormat {
    pub format: F,
    /// Texel layout on the device.
    pub storage: ImageType,
}

impl DeviceFormat {
    pub(crate) fn of(image_type: ImageType) -> Result<DeviceFormat, Error> {
        let mut storage = image_type.storage_format();
        let widened = matches!(
            storage.format(),
            Some(ChannelFormat::Bits8 | ChannelFormat::Bits16 | ChannelFormat::Bits32)
        );
        if storage.channel_count() == 3 && widened && !storage.is_depth() {
            storage = storage.difference(ImageType::CHANNELS_MASK) | ImageType::CHANNELS_4;
        }
        let format = texture_format(storage)
            .ok_or_else(|| Error::unsupported(format!("image format {image_type:?} on wgpu")))?;
        Ok(DeviceFormat { format, storage })
    }

    /// Whether texel copies to and from buffers work for this format.
    pub(crate) fn is_copyable(&self) -> bool {
        !matches!(
            self.format,
            F::Depth24Plus | F::Depth24PlusStencil8 | F::Depth32FloatStencil8
        )
    }
}

fn texture_format(storage: ImageType) -> Option<F> {
    let data_type = storage.data_type()?;
    if storage.is_depth() {
        return match (storage.format()?, data_type) {
            (ChannelFormat::Bits16, DataType::Uint) => Some(F::Depth16Unorm),
            (ChannelFormat::Depth24, _) => Some(F::Depth24Plus),
            (ChannelFormat::Bits32, DataType::Float) => Some(F::Depth32Float),
            (ChannelFormat::Depth24Stencil8, _) => Some(F::Depth24PlusStencil8),
            (ChannelFormat::Depth32Stencil8, _) => Some(F::Depth32FloatStencil8),
            _ => None,
        };
    }
    let normalized = storage.is_normalized();
    if storage.is_bgra() {
        return match (storage.format()?, data_type, storage.channel_count(), normalized) {
            (ChannelFormat::Bits8, DataType::Uint, 4, true) if storage.is_srgb() => Some(F::Bgra8UnormSrgb),
            (ChannelFormat::Bits8, DataType::Uint, 4, true) => Some(F::Bgra8Unorm),
            _ => None,
        };
    }
    if storage.is_srgb() {
        return match (storage.format()?, data_type, storage.channel_count(), normalized) {
            (ChannelFormat::Bits8, DataType::Uint, 4, true) => Some(F::Rgba8UnormSrgb),
            _ => None,
        };
    }
    use ChannelFormat::*;
    use DataType::*;
    Some(match (storage.format()?, data_type, storage.channel_count(), normalized) {
        (Bits8, Uint, 1, true) => F::R8Unorm,
        (Bits8, Int, 1, true) => F::R8Snorm,
        (Bits8, Uint, 1, false) => F::R8Uint,
        (Bits8, Int, 1, false) => F::R8Sint,
        (Bits8, Uint, 2, true) => F::Rg8Unorm,
        (Bits8, Int, 2, true) => F::Rg8Snorm,
        (Bits8, Uint, 2, false) => F::Rg8Uint,
        (Bits8, Int, 2, false) => F::Rg8Sint,
        (Bits8, Uint, 4, true) => F::Rgba8Unorm,
        (Bits8, Int, 4, true) => F::Rgba8Snorm,
        (Bits8, Uint, 4, false) => F::Rgba8Uint,
        (Bits8, Int, 4, false) => F::Rgba8Sint,
        (Bits16, Uint, 1, true) => F::R16Unorm,
        (Bits16, Int, 1, true) => F::R16Snorm,
        (Bits16, Uint, 1, false) => F::R16Uint,
        (Bits16, Int, 1, false) => F::R16Sint,
        (Bits16, Float, 1, _) => F::R16Float,
        (Bits16, Uint, 2, true) => F::Rg16Unorm,
        (Bits16, Int, 2, true) => F::Rg16Snorm,
        (Bits16, Uint, 2, false) => F::Rg16Uint,
        (Bits16, Int, 2, false) => F::Rg16Sint,
        (Bits16, Float, 2, _) => F::Rg16Float,
        (Bits16, Uint, 4, true) => F::Rgba16Unorm,
        (Bits16, Int, 4, true) => F::Rgba16Snorm,
        (Bits16, Uint, 4, false) => F::Rgba16Uint,
        (Bits16, Int, 4, false) => F::Rgba16Sint,
        (Bits16, Float, 4, _) => F::Rgba16Float,
        (Bits32, Uint, 1, false) => F::R32Uint,
        (Bits32, Int, 1, false) => F::R32Sint,
        (Bits32, Float, 1, _) => F::R32Float,
        (Bits32, Uint, 2, false) => F::Rg32Uint,
        (Bits32, Int, 2, false) => F::Rg32Sint,
        (Bits32, Float, 2, _) => F::Rg32Float,
        (Bits32, Uint, 4, false) => F::Rgba32Uint,
        (Bits32, Int, 4, false) => F::Rgba32Sint,
        (Bits32, Float, 4, _) => F::Rgba32Float,
        (Packed2_10_10_10, Uint, 4, true) => F::Rgb10a2Unorm,
        (Packed2_10_10_10, Uint, 4, false) => F::Rgb10a2Uint,
        (Packed11_11_10, Float, 3, _) => F::Rg11b10Ufloat,
        _ => return None,
    })
}

/// WGSL name of `format` when it may be used as a storage texture without extra features.
pub(crate) fn wgsl_storage_format(format: F) -> Option<&'static str> {
    Some(match format {
        F::Rgba8Unorm => "rgba8unorm",
        F::Rgba8Snorm => "rgba8snorm",
        F::Rgba8Uint => "rgba8uint",
        F::Rgba8Sint => "rgba8sint",
        F::Rgba16Uint => "rgba16uint",
        F::Rgba16Sint => "rgba16sint",
        F::Rgba16Float => "rgba16float",
        F::R32Uint => "r32uint",
        F::R32Sint => "r32sint",
        F::R32Float => "r32float",
        F::Rg32Uint => "rg32uint",
        F::Rg32Sint => "rg32sint",
        F::Rg32Float => "rg32float",
        F::Rgba32Uint => "rgba32uint",
        F::Rgba32Sint => "rgba32sint",
        F::Rgba32Float => "rgba32float",
        _ => return None,
    })
}

pub(crate) fn texture_dimension(image_type: ImageType) -> wgpu::TextureDimension {
    match image_type.dim_count() {
        1 => wgpu::TextureDimension::D1,
        3 => wgpu::TextureDimension::D3,
        _ => wgpu::TextureDimension::D2,
    }
}

pub(crate) fn view_dimension(image_type: ImageType) -> wgpu::TextureViewDimension {
    match (image_type.dim_count(), image_type.is_cube(), image_type.is_array()) {
        (1, _, _) => wgpu::TextureViewDimension::D1,
        (3, _, _) => wgpu::TextureViewDimension::D3,
        (_, true, true) => wgpu::TextureViewDimension::CubeArray,
        (_, true, false) => wgpu::TextureViewDimension::Cube,
        (_, false, true) => wgpu::TextureViewDimension::D2Array,
        _ => wgpu::TextureViewDimension::D2,
    }
}

/// `[width, height, depth, layers]` as a wgpu copy extent; layers and depth share the last axis.
pub(crate) fn copy_extent(image_type: ImageType, level_extent: [u32; 4], layers: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: level_extent[0],
        height: level_extent[1],
        depth_or_array_layers: if image_type.dim_count() == 3 {
            level_extent[2]
        } else {
            layers
        },
    }
}

pub(crate) fn sample_type(image_type: ImageType) -> wgpu::TextureSampleType {
    if image_type.is_depth() {
        return wgpu::TextureSampleType::Depth;
    }
    match image_type.data_type() {
        Some(DataType::Int) if !image_type.is_normalized() => wgpu::TextureSampleType::Sint,
        Some(DataType::Uint) if !image_type.is_normalized() => wgpu::TextureSampleType::Uint,
        Some(DataType::Float) if image_type.format() == Some(ChannelFormat::Bits32) => {
            wgpu::TextureSampleType::Float { filterable: false }
        }
        _ => wgpu::TextureSampleType::Float { filterable: true },
    }
}

pub(crate) fn storage_access(access: ArgAccess) -> wgpu::StorageTextureAccess {
    match access {
        ArgAccess::Read => wgpu::StorageTextureAccess::ReadOnly,
        ArgAccess::Write => wgpu::StorageTextureAccess::WriteOnly,
        ArgAccess::ReadWrite => wgpu::StorageTextureAccess::ReadWrite,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_formats() {
        let rgba = DeviceFormat::of(ImageType::IMAGE_2D | ImageType::RGBA8).unwrap();
        assert_eq!(rgba.format, F::Rgba8Unorm);
        assert_eq!(rgba.storage, ImageType::RGBA8);
        assert_eq!(DeviceFormat::of(ImageType::BGRA8).unwrap().format, F::Bgra8Unorm);
        assert_eq!(DeviceFormat::of(ImageType::RGBA8_SRGB).unwrap().format, F::Rgba8UnormSrgb);
        assert_eq!(DeviceFormat::of(ImageType::R32F).unwrap().format, F::R32Float);
        assert_eq!(DeviceFormat::of(ImageType::D32F).unwrap().format, F::Depth32Float);
        assert!(!DeviceFormat::of(ImageType::D24S8).unwrap().is_copyable());
    }

    #[test]
    fn rgb_is_widened() {
        let rgb32f = ImageType::CHANNELS_3 | ImageType::FLOAT | ImageType::FORMAT_32;
        let format = DeviceFormat::of(rgb32f).unwrap();
        assert_eq!(format.format, F::Rgba32Float);
        assert_eq!(format.storage.channel_count(), 4);
        assert_eq!(format.storage.bytes_per_pixel(), 16);

        let packed = ImageType::CHANNELS_3 | ImageType::FLOAT | ImageType::FORMAT_11_11_10;
        assert_eq!(DeviceFormat::of(packed).unwrap().format, F::Rg11b10Ufloat);
    }

    #[test]
    fn unsupported_formats() {
        let rgba64 = ImageType::CHANNELS_4 | ImageType::UINT | ImageType::FORMAT_64;
        assert!(DeviceFormat::of(rgba64).is_err());
        let bgra32 = ImageType::RGBA32F | ImageType::BGRA;
        assert!(DeviceFormat::of(bgra32).is_err());
    }

    #[test]
    fn views_and_samples() {
        assert_eq!(view_dimension(ImageType::IMAGE_CUBE_ARRAY), wgpu::TextureViewDimension::CubeArray);
        assert_eq!(view_dimension(ImageType::IMAGE_2D_ARRAY), wgpu::TextureViewDimension::D2Array);
        assert_eq!(texture_dimension(ImageType::IMAGE_3D), wgpu::TextureDimension::D3);
        assert_eq!(sample_type(ImageType::RGBA8UI), wgpu::TextureSampleType::Uint);
        assert_eq!(sample_type(ImageType::D32F), wgpu::TextureSampleType::Depth);
        assert_eq!(
            sample_type(ImageType::RGBA8),
            wgpu::TextureSampleType::Float { filterable: true }
        );
        let extent = copy_extent(ImageType::IMAGE_2D_ARRAY, [8, 4, 1, 3], 3);
        assert_eq!(extent.depth_or_array_layers, 3);
        assert_eq!(wgsl_storage_format(F::Rgba8Unorm), Some("rgba8unorm"));
        assert_eq!(wgsl_storage_format(F::Rgba8UnormSrgb), None);
    }
}
