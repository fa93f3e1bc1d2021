// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The image interface shared by all backends.
//!
//! Host-visible image data always uses the packed layout described in [crate::image_type]:
//! all mip levels back to back, level 0 first.

use std::any::Any;
use std::sync::Arc;

use crate::device::Device;
use crate::error::Error;
use crate::fence::{SignalFence, WaitFence};
use crate::image_type::ImageType;
use crate::memory::{HostSpan, MappedMemory, MemoryCore, MemoryObject};
use crate::memory_flags::{MapFlags, MemoryFlags};
use crate::queue::Queue;

/// Image-specific state on top of [MemoryCore].
#[derive(Debug)]
pub struct ImageCore {
    memory: MemoryCore,
    extent: [u32; 4],
    image_type: ImageType,
    mip_levels: u32,
}

impl ImageCore {
    /// Validates the image description against the flags and the device.
    ///
    /// `GENERATE_MIP_MAPS` implies a mip-mapped image and `RENDER_TARGET` marks the type as a
    /// render target.
    pub(crate) fn new(
        device: Arc<Device>,
        image_type: ImageType,
        extent: [u32; 4],
        flags: MemoryFlags,
        host_span: Option<HostSpan>,
    ) -> Result<ImageCore, Error> {
        let mut image_type = image_type;
        if flags.contains(MemoryFlags::GENERATE_MIP_MAPS) {
            image_type |= ImageType::MIP_MAPPED;
        }
        if flags.contains(MemoryFlags::RENDER_TARGET) {
            image_type |= ImageType::RENDER_TARGET;
        }
        if image_type.is_render_target() && flags.contains(MemoryFlags::READ_WRITE) {
            return Err(Error::invalid(
                "render-target images must be either device READ or WRITE, not both",
            ));
        }
        let extent = image_type.validate(extent)?;
        let limits = ImageLimits::of(&device, image_type);
        if extent[..3].iter().zip(limits.iter()).any(|(e, max)| *max != 0 && e > max) {
            return Err(Error::invalid(format!(
                "image extent {extent:?} exceeds the device limit {limits:?}"
            )));
        }
        let mip_levels = image_type.mip_level_count(extent, device.image_mip_level_limit);
        let size = image_type.image_size(extent, mip_levels);
        if let Some(span) = host_span
            && span.len() < size
        {
            return Err(Error::OutOfBounds {
                offset: 0,
                size,
                capacity: span.len(),
            });
        }
        Ok(ImageCore {
            memory: MemoryCore::new(device, size, flags, host_span),
            extent,
            image_type,
            mip_levels,
        })
    }

    pub fn memory(&self) -> &MemoryCore {
        &self.memory
    }
    pub(crate) fn with_tracking(
        mut self,
        registry: &Arc<crate::context::ResourceRegistry>,
        tracked: crate::memory::TrackedResource,
    ) -> Self {
        self.memory = self.memory.with_tracking(registry, tracked);
        self
    }
    pub fn extent(&self) -> [u32; 4] {
        self.extent
    }
    pub fn image_type(&self) -> ImageType {
        self.image_type
    }
    pub fn mip_level_count(&self) -> u32 {
        self.mip_levels
    }
    pub fn level_extent(&self, level: u32) -> [u32; 4] {
        self.image_type.level_extent(self.extent, level)
    }

    /// Byte range of `level` within the packed layout.
    pub(crate) fn level_range(&self, level: u32) -> Result<std::ops::Range<usize>, Error> {
        if level >= self.mip_levels {
            return Err(Error::invalid(format!(
                "mip level {level} does not exist (image has {} levels)",
                self.mip_levels
            )));
        }
        let offset = self.image_type.level_offset(self.extent, level);
        Ok(offset..offset + self.image_type.level_size(self.extent, level))
    }

    /// Checks that `src` can be blitted into this image; returns the level count to copy.
    pub(crate) fn check_blit(&self, src: &ImageCore) -> Result<u32, Error> {
        if src.extent != self.extent
            || src.image_type.layer_count(src.extent) != self.image_type.layer_count(self.extent)
        {
            return Err(Error::invalid(format!(
                "blit source extent {:?} differs from destination extent {:?}",
                src.extent, self.extent
            )));
        }
        if src.image_type.is_depth() != self.image_type.is_depth() {
            return Err(Error::invalid("can not blit between depth and color images"));
        }
        if src.image_type.is_msaa() || self.image_type.is_msaa() {
            return Err(Error::unsupported("blit of multi-sampled images"));
        }
        Ok(src.mip_levels.min(self.mip_levels))
    }
}

/// Per-dimension maxima of the device for one image type; 0 = unlimited.
struct ImageLimits;

impl ImageLimits {
    fn of(device: &Device, image_type: ImageType) -> [u32; 3] {
        if image_type.is_cube() {
            return [device.max_image_cube_dim, device.max_image_cube_dim, 0];
        }
        match image_type.dim_count() {
            1 => [device.max_image_1d_dim, 0, 0],
            2 => [device.max_image_2d_dim[0], device.max_image_2d_dim[1], 0],
            _ => device.max_image_3d_dim,
        }
    }
}

/// A (possibly layered, mip-mapped, multi-sampled) device image.
pub trait Image: MemoryObject {
    fn image_core(&self) -> &ImageCore;

    fn extent(&self) -> [u32; 4] {
        self.image_core().extent()
    }
    fn image_type(&self) -> ImageType {
        self.image_core().image_type()
    }
    fn mip_level_count(&self) -> u32 {
        self.image_core().mip_level_count()
    }

    /// Reads the whole image (all levels) into `dst`, which must be exactly `size()` bytes.
    fn read_into(&self, queue: &dyn Queue, dst: &mut [u8]) -> Result<(), Error>;
    /// Writes the whole image from `src`, which must be exactly `size()` bytes.
    fn write_from(&self, queue: &dyn Queue, src: &[u8]) -> Result<(), Error>;
    fn read_level_into(&self, queue: &dyn Queue, level: u32, dst: &mut [u8]) -> Result<(), Error>;
    fn write_level_from(&self, queue: &dyn Queue, level: u32, src: &[u8]) -> Result<(), Error>;

    /// Reads the whole image into the host span bound at creation.
    fn read(&self, queue: &dyn Queue) -> Result<(), Error>;
    /// Writes the whole image from the host span bound at creation.
    fn write(&self, queue: &dyn Queue) -> Result<(), Error>;

    fn zero(&self, queue: &dyn Queue) -> Result<(), Error>;

    /// Copies `src` into this image, converting texel formats.
    fn blit(&self, queue: &dyn Queue, src: &dyn Image) -> Result<(), Error>;

    fn blit_async(
        &self,
        queue: &dyn Queue,
        src: &dyn Image,
        wait_fences: &[WaitFence],
        signal_fences: &[SignalFence],
    ) -> Result<(), Error>;

    /// Rebuilds levels 1.. from level 0 with the minify kernel.
    fn generate_mip_maps(&self, queue: &dyn Queue) -> Result<(), Error>;

    /// Maps the whole image in the packed host layout.
    fn map(&self, queue: &dyn Queue, flags: MapFlags) -> Result<MappedMemory, Error>;
    fn unmap(&self, queue: &dyn Queue, mapping: MappedMemory) -> Result<(), Error>;

    fn acquire_vulkan_image(&self, _queue: &dyn Queue) -> Result<(), Error> {
        Ok(())
    }
    fn release_vulkan_image(&self, _queue: &dyn Queue) -> Result<(), Error> {
        Ok(())
    }
    fn acquire_metal_image(&self, _queue: &dyn Queue) -> Result<(), Error> {
        Ok(())
    }
    fn release_metal_image(&self, _queue: &dyn Queue) -> Result<(), Error> {
        Ok(())
    }

    /// The render-side allocation of a shared image.
    fn shared_image(&self) -> Option<Arc<dyn Image>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Converts every texel of one level of `src` into `dst`'s format.
///
/// Both slices hold the same number of texels in their respective formats.
pub(crate) fn convert_texels(
    src_type: ImageType,
    src: &[u8],
    dst_type: ImageType,
    dst: &mut [u8],
) -> Result<(), Error> {
    if src_type.storage_format() == dst_type.storage_format() {
        dst.copy_from_slice(src);
        return Ok(());
    }
    let src_bpp = src_type.bytes_per_pixel() as usize;
    let dst_bpp = dst_type.bytes_per_pixel() as usize;
    for (s, d) in src.chunks_exact(src_bpp).zip(dst.chunks_exact_mut(dst_bpp)) {
        let texel = src_type
            .decode_texel(s)
            .ok_or_else(|| Error::unsupported(format!("texel decode of {src_type:?}")))?;
        dst_type
            .encode_texel(texel, d)
            .ok_or_else(|| Error::unsupported(format!("texel encode of {dst_type:?}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PlatformType;

    fn device() -> Arc<Device> {
        let mut device = Device::template(PlatformType::Host, 0);
        device.max_image_2d_dim = [64, 64];
        Arc::new(device)
    }

    #[test]
    fn core_layout() {
        let core = ImageCore::new(
            device(),
            ImageType::IMAGE_2D | ImageType::RGBA8,
            [8, 8, 0, 0],
            MemoryFlags::READ_WRITE | MemoryFlags::GENERATE_MIP_MAPS,
            None,
        )
        .unwrap();
        assert_eq!(core.mip_level_count(), 4);
        assert!(core.image_type().is_mip_mapped());
        assert_eq!(core.memory().size(), (64 + 16 + 4 + 1) * 4);
        assert_eq!(core.level_range(1).unwrap(), 256..320);
        assert!(core.level_range(4).is_err());
    }

    #[test]
    fn render_targets_need_one_direction() {
        let make = |flags| {
            ImageCore::new(
                device(),
                ImageType::IMAGE_2D | ImageType::RGBA8,
                [8, 8, 1, 1],
                flags | MemoryFlags::RENDER_TARGET,
                None,
            )
        };
        assert!(make(MemoryFlags::READ_WRITE).is_err());
        assert!(make(MemoryFlags::WRITE).is_ok());
    }

    #[test]
    fn device_limits() {
        let result = ImageCore::new(
            device(),
            ImageType::IMAGE_2D | ImageType::RGBA8,
            [128, 8, 1, 1],
            MemoryFlags::READ_WRITE,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn conversion() {
        let src = [255u8, 0, 0, 255];
        let mut dst = [0u8; 16];
        convert_texels(ImageType::RGBA8, &src, ImageType::RGBA32F, &mut dst).unwrap();
        assert_eq!(f32::from_le_bytes([dst[0], dst[1], dst[2], dst[3]]), 1.0);
        let mut bgra = [0u8; 4];
        convert_texels(ImageType::RGBA8, &src, ImageType::BGRA8, &mut bgra).unwrap();
        assert_eq!(bgra, [0, 0, 255, 255]);
    }
}
