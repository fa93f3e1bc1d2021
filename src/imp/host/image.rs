// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Host-Compute images.
//!
//! The whole mip chain lives in one allocation using the packed host layout, so reads, writes
//! and maps are plain copies.  Kernels find the levels through a [LodTable] the image owns.

use std::any::Any;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};

use crate::binding::{ImageParams, SAMPLER_COUNT};
use crate::context::ResourceRegistry;
use crate::device::{Device, PlatformType};
use crate::error::{Error, reported};
use crate::fence::{SignalFence, WaitFence, signal_all, wait_all};
use crate::image_type::{DEFAULT_MIP_LEVEL_LIMIT, ImageType};
use crate::imp::host::buffer::HostStorage;
use crate::imp::host::executor::{self, ItemProgram, Launch, LaunchShape, Schedule};
use crate::imp::host::queue::worker_count;
use crate::memory::image::convert_texels;
use crate::memory::sharing::{Owner, SharingBridge, SharingKind, SharingState};
use crate::memory::{HostSpan, Image, ImageCore, MapRecord, MappedMemory, MemoryCore, MemoryObject, TrackedResource};
use crate::memory_flags::{MapFlags, MemoryFlags};
use crate::queue::Queue;

const MAX_LEVELS: usize = DEFAULT_MIP_LEVEL_LIMIT as usize;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LodLevel {
    /// Byte offset from the surface.
    pub offset: u64,
    /// `[width, height, depth, layers]`, cube faces counted as layers.
    pub extent: [u32; 4],
}

/// Where each mip level of an image lives.
#[repr(C)]
#[derive(Debug, Clone)]
pub(crate) struct LodTable {
    pub level_count: u32,
    pub layer_count: u32,
    pub levels: [LodLevel; MAX_LEVELS],
}

impl LodTable {
    fn of(core: &ImageCore) -> Result<LodTable, Error> {
        let level_count = core.mip_level_count();
        if level_count as usize > MAX_LEVELS {
            return Err(Error::unsupported(format!("{level_count} mip levels")));
        }
        let image_type = core.image_type();
        let layer_count = image_type.layer_count(core.extent());
        let mut levels = [LodLevel::default(); MAX_LEVELS];
        for (level, lod) in levels.iter_mut().enumerate().take(level_count as usize) {
            let level = level as u32;
            let [w, h, d, _] = core.level_extent(level);
            *lod = LodLevel {
                offset: image_type.level_offset(core.extent(), level) as u64,
                extent: [w, h, d, layer_count],
            };
        }
        Ok(LodTable {
            level_count,
            layer_count,
            levels,
        })
    }

    /// Byte offset of the texel at `[x, y, z, layer]` in `level`.
    fn texel_offset(&self, level: u32, coord: [u32; 4], bytes_per_pixel: usize) -> usize {
        let lod = &self.levels[level as usize];
        let [w, h, d, _] = lod.extent;
        let index = ((coord[3] as usize * d as usize + coord[2] as usize) * h as usize + coord[1] as usize)
            * w as usize
            + coord[0] as usize;
        lod.offset as usize + index * bytes_per_pixel
    }
}

#[derive(Debug)]
pub struct HostImage {
    core: ImageCore,
    storage: HostStorage,
    lod: Box<LodTable>,
    samplers: [u32; SAMPLER_COUNT],
    sharing: Option<SharingState<dyn Image>>,
}

/// Everything needed to create an image.
pub(crate) struct ImageRequest<'a> {
    pub device: Arc<Device>,
    pub image_type: ImageType,
    pub extent: [u32; 4],
    pub flags: MemoryFlags,
    pub host: Option<HostSpan>,
    pub initial: Option<&'a [u8]>,
    pub samplers: [u32; SAMPLER_COUNT],
    pub registry: &'a Arc<ResourceRegistry>,
    pub allocated: &'a Arc<AtomicU64>,
    pub sharing: Option<SharingState<dyn Image>>,
}

impl HostImage {
    pub(crate) fn new(request: ImageRequest<'_>, queue: &dyn Queue) -> Result<Arc<HostImage>, Error> {
        let ImageRequest {
            device,
            image_type,
            extent,
            flags,
            host,
            initial,
            samplers,
            registry,
            allocated,
            sharing,
        } = request;
        if image_type.is_msaa() {
            return Err(Error::unsupported("multi-sampled images on Host-Compute"));
        }
        let core = ImageCore::new(device, image_type, extent, flags, host)?;
        let size = core.memory().size();
        let storage = match host {
            Some(span) if flags.contains(MemoryFlags::USE_HOST_MEMORY) => HostStorage::alias(span, allocated)?,
            _ => HostStorage::allocate(size, allocated)?,
        };
        let mut initialized = false;
        if !flags.contains(MemoryFlags::USE_HOST_MEMORY) && !flags.contains(MemoryFlags::NO_INITIAL_COPY) {
            // SAFETY: a host span is valid per the creation contract
            let source = initial.or_else(|| host.as_ref().map(|span| unsafe { span.slice(0, span.len().min(size)) }));
            if let Some(source) = source {
                if source.len() < size {
                    return Err(Error::OutOfBounds {
                        offset: 0,
                        size,
                        capacity: source.len(),
                    });
                }
                // SAFETY: the storage is not shared with anyone yet
                let bytes = unsafe { storage.bytes_mut() };
                bytes.copy_from_slice(&source[..size]);
                initialized = true;
            }
        }
        let lod = Box::new(LodTable::of(&core)?);
        let image = Arc::new_cyclic(|weak: &Weak<HostImage>| {
            let tracked: Weak<dyn Image> = weak.clone();
            HostImage {
                core: core.with_tracking(registry, TrackedResource::Image(tracked)),
                storage,
                lod,
                samplers,
                sharing,
            }
        });
        if initialized && flags.contains(MemoryFlags::GENERATE_MIP_MAPS) {
            image.generate_mip_maps(queue)?;
        }
        Ok(image)
    }

    /// The parameter kernels receive for this image.
    pub(crate) fn params(&self) -> ImageParams {
        ImageParams {
            samplers: self.samplers,
            surface: self.storage.as_ptr() as usize as u64,
            lod_buffer: std::ptr::from_ref::<LodTable>(&self.lod) as usize as u64,
            runtime_image_type: self.core.image_type().bits() as u32,
            padding: 0,
        }
    }

    pub(crate) fn check_access(&self, operation: &'static str) {
        if let Some(sharing) = &self.sharing {
            sharing.check_compute_access(operation, PlatformType::Host, &self.core.memory().debug_label());
        }
    }

    fn regenerate_if_requested(&self, queue: &dyn Queue) -> Result<(), Error> {
        if self.flags().contains(MemoryFlags::GENERATE_MIP_MAPS) && self.mip_level_count() > 1 {
            self.generate_mip_maps(queue)
        } else {
            Ok(())
        }
    }

    fn copy_in(&self, range: std::ops::Range<usize>, src: &[u8]) -> Result<(), Error> {
        if src.len() != range.len() {
            return Err(Error::invalid(format!(
                "expected {} bytes of image data, got {}",
                range.len(),
                src.len()
            )));
        }
        // SAFETY: range lies inside the allocation, object lock held by the caller
        let bytes = unsafe { self.storage.bytes_mut() };
        bytes[range].copy_from_slice(src);
        Ok(())
    }

    fn copy_out(&self, range: std::ops::Range<usize>, dst: &mut [u8]) -> Result<(), Error> {
        if dst.len() != range.len() {
            return Err(Error::invalid(format!(
                "expected a {} byte destination, got {}",
                range.len(),
                dst.len()
            )));
        }
        // SAFETY: as above
        dst.copy_from_slice(&unsafe { self.storage.bytes() }[range]);
        Ok(())
    }

    fn transition(&self, operation: &'static str, kind: SharingKind, to: Owner) -> Result<(), Error> {
        let Some(sharing) = &self.sharing else {
            return Ok(());
        };
        let _lock = self.core.memory().lock();
        self.core.memory().warn_if_mapped(operation);
        sharing.transition(operation, kind, to, |direction, secondary, queue| {
            // SAFETY: the object lock is held during the hand-over
            SharingBridge::sync_image(direction, unsafe { self.storage.bytes_mut() }, secondary, queue)
        })
    }
}

/// Box-filters one level of an image into the next.
struct Minify<'a> {
    surface: *mut u8,
    lod: &'a LodTable,
    image_type: ImageType,
    level: u32,
}

// SAFETY: items write disjoint texels of `level` and only read `level - 1`
unsafe impl Sync for Minify<'_> {}

impl Minify<'_> {
    fn item(&self, x: u32, y: u32, slice: u32) {
        let [w, h, d, _] = self.lod.levels[self.level as usize].extent;
        let (z, layer) = (slice % d, slice / d);
        if x >= w || y >= h {
            return;
        }
        let [pw, ph, pd, _] = self.lod.levels[self.level as usize - 1].extent;
        let dims = self.image_type.dim_count();
        let bpp = self.image_type.bytes_per_pixel() as usize;
        let span = |reduced: bool, c: u32, extent: u32| -> [u32; 2] {
            if reduced {
                [(2 * c).min(extent - 1), (2 * c + 1).min(extent - 1)]
            } else {
                [c, c]
            }
        };
        let xs = span(dims >= 1, x, pw);
        let ys = span(dims >= 2, y, ph);
        let zs = span(dims >= 3, z, pd);
        let mut sum = [0f32; 4];
        let mut count = 0f32;
        for sz in zs {
            for sy in ys {
                for sx in xs {
                    let offset = self.lod.texel_offset(self.level - 1, [sx, sy, sz, layer], bpp);
                    // SAFETY: the offset lies in the previous level, which nobody writes meanwhile
                    let texel = unsafe { std::slice::from_raw_parts(self.surface.add(offset), bpp) };
                    if let Some(value) = self.image_type.decode_texel(texel) {
                        for (s, v) in sum.iter_mut().zip(value) {
                            *s += v;
                        }
                        count += 1.0;
                    }
                }
            }
        }
        if count == 0.0 {
            return;
        }
        let offset = self.lod.texel_offset(self.level, [x, y, z, layer], bpp);
        // SAFETY: every item owns its own destination texel
        let dst = unsafe { std::slice::from_raw_parts_mut(self.surface.add(offset), bpp) };
        let _ = self.image_type.encode_texel(sum.map(|s| s / count), dst);
    }
}

impl ItemProgram for Minify<'_> {
    fn bind(&self, _slot: usize, _shape: &LaunchShape) -> Result<Box<dyn Fn() + '_>, Error> {
        Ok(Box::new(|| {
            executor::with_item(|view, item| {
                self.item(
                    item.global_id(&view.shape, 0),
                    item.global_id(&view.shape, 1),
                    item.global_id(&view.shape, 2),
                )
            });
        }))
    }
}

impl MemoryObject for HostImage {
    fn core(&self) -> &MemoryCore {
        self.core.memory()
    }
}

impl Image for HostImage {
    fn image_core(&self) -> &ImageCore {
        &self.core
    }

    fn read_into(&self, _queue: &dyn Queue, dst: &mut [u8]) -> Result<(), Error> {
        reported("image::read", PlatformType::Host, {
            let _lock = self.core.memory().lock();
            self.check_access("image::read");
            self.copy_out(0..self.size(), dst)
        })
    }

    fn write_from(&self, _queue: &dyn Queue, src: &[u8]) -> Result<(), Error> {
        reported("image::write", PlatformType::Host, {
            let _lock = self.core.memory().lock();
            self.check_access("image::write");
            self.copy_in(0..self.size(), src)
        })
    }

    fn read_level_into(&self, _queue: &dyn Queue, level: u32, dst: &mut [u8]) -> Result<(), Error> {
        reported("image::read", PlatformType::Host, {
            let _lock = self.core.memory().lock();
            self.check_access("image::read");
            self.core.level_range(level).and_then(|range| self.copy_out(range, dst))
        })
    }

    fn write_level_from(&self, queue: &dyn Queue, level: u32, src: &[u8]) -> Result<(), Error> {
        reported("image::write", PlatformType::Host, {
            let _lock = self.core.memory().lock();
            self.check_access("image::write");
            self.core.level_range(level).and_then(|range| self.copy_in(range, src))
        })?;
        if level == 0 {
            self.regenerate_if_requested(queue)?;
        }
        Ok(())
    }

    fn read(&self, queue: &dyn Queue) -> Result<(), Error> {
        if self.flags().contains(MemoryFlags::USE_HOST_MEMORY) {
            return Ok(());
        }
        let span = reported("image::read", PlatformType::Host, self.core.memory().host_span_range(self.size(), 0))?;
        // SAFETY: the span is valid per the creation contract
        self.read_into(queue, unsafe { span.slice_mut(0, span.len()) })
    }

    fn write(&self, queue: &dyn Queue) -> Result<(), Error> {
        if self.flags().contains(MemoryFlags::USE_HOST_MEMORY) {
            return self.regenerate_if_requested(queue);
        }
        let span = reported("image::write", PlatformType::Host, self.core.memory().host_span_range(self.size(), 0))?;
        // SAFETY: the span is valid per the creation contract
        self.write_from(queue, unsafe { span.slice(0, span.len()) })?;
        self.regenerate_if_requested(queue)
    }

    fn zero(&self, _queue: &dyn Queue) -> Result<(), Error> {
        let _lock = self.core.memory().lock();
        self.check_access("image::zero");
        // SAFETY: object lock held
        let bytes = unsafe { self.storage.bytes_mut() };
        bytes.fill(0);
        Ok(())
    }

    fn blit(&self, _queue: &dyn Queue, src: &dyn Image) -> Result<(), Error> {
        reported("image::blit", PlatformType::Host, {
            match src.as_any().downcast_ref::<HostImage>() {
                None => Err(Error::invalid("blit source is not a Host-Compute image")),
                Some(source) if std::ptr::eq(source, self) => Ok(()),
                Some(source) => self.core.check_blit(&source.core).and_then(|levels| {
                    let _locks = MemoryCore::lock_pair(self.core.memory(), source.core.memory());
                    self.check_access("image::blit");
                    source.check_access("image::blit");
                    (0..levels).try_for_each(|level| {
                        let src_range = source.core.level_range(level)?;
                        let dst_range = self.core.level_range(level)?;
                        // SAFETY: distinct objects, both locks held
                        let (from, to) = unsafe { (source.storage.bytes(), self.storage.bytes_mut()) };
                        convert_texels(
                            source.image_type(),
                            &from[src_range],
                            self.image_type(),
                            &mut to[dst_range],
                        )
                    })
                }),
            }
        })
    }

    fn blit_async(
        &self,
        queue: &dyn Queue,
        src: &dyn Image,
        wait_fences: &[WaitFence],
        signal_fences: &[SignalFence],
    ) -> Result<(), Error> {
        wait_all(wait_fences);
        self.blit(queue, src)?;
        signal_all(signal_fences);
        Ok(())
    }

    fn generate_mip_maps(&self, queue: &dyn Queue) -> Result<(), Error> {
        let levels = self.mip_level_count();
        if levels <= 1 {
            return Ok(());
        }
        let _lock = self.core.memory().lock();
        self.check_access("image::generate_mip_maps");
        let image_type = self.image_type();
        for level in 1..levels {
            let [w, h, d, layers] = self.lod.levels[level as usize].extent;
            let global = [w, h, d * layers];
            let launch = Launch {
                shape: LaunchShape {
                    dim: 3,
                    global,
                    local: [1, 1, 1],
                    groups: global,
                    simd_width: 1,
                },
                schedule: Schedule::Loop,
                workers: worker_count(queue),
                fiber_stack_size: 0,
                local_memory_size: 0,
                printf: None,
            };
            let minify = Minify {
                surface: self.storage.as_ptr(),
                lod: &self.lod,
                image_type,
                level,
            };
            reported("image::generate_mip_maps", PlatformType::Host, executor::run(&launch, &minify))?;
        }
        Ok(())
    }

    fn map(&self, _queue: &dyn Queue, flags: MapFlags) -> Result<MappedMemory, Error> {
        reported("image::map", PlatformType::Host, {
            let _lock = self.core.memory().lock();
            self.check_access("image::map");
            flags.validate(self.flags()).map(|()| {
                let ptr = NonNull::new(self.storage.as_ptr()).unwrap_or(NonNull::dangling());
                self.core.memory().begin_mapping(
                    ptr,
                    MapRecord {
                        flags,
                        offset: 0,
                        len: self.size(),
                        shadow: None,
                    },
                )
            })
        })
    }

    fn unmap(&self, queue: &dyn Queue, mapping: MappedMemory) -> Result<(), Error> {
        let record = reported("image::unmap", PlatformType::Host, {
            let _lock = self.core.memory().lock();
            self.core.memory().end_mapping(&mapping)
        })?;
        if record.flags.needs_write_back() {
            self.regenerate_if_requested(queue)?;
        }
        Ok(())
    }

    fn acquire_vulkan_image(&self, _queue: &dyn Queue) -> Result<(), Error> {
        self.transition("image::acquire_vulkan_image", SharingKind::Vulkan, Owner::Render)
    }

    fn release_vulkan_image(&self, _queue: &dyn Queue) -> Result<(), Error> {
        self.transition("image::release_vulkan_image", SharingKind::Vulkan, Owner::Compute)
    }

    fn acquire_metal_image(&self, _queue: &dyn Queue) -> Result<(), Error> {
        self.transition("image::acquire_metal_image", SharingKind::Metal, Owner::Render)
    }

    fn release_metal_image(&self, _queue: &dyn Queue) -> Result<(), Error> {
        self.transition("image::release_metal_image", SharingKind::Metal, Owner::Compute)
    }

    fn shared_image(&self) -> Option<Arc<dyn Image>> {
        self.sharing.as_ref().map(|s| s.secondary().clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lod_table_matches_packed_layout() {
        let mut device = Device::template(PlatformType::Host, 0);
        device.max_image_2d_dim = [64, 64];
        let core = ImageCore::new(
            Arc::new(device),
            ImageType::IMAGE_2D | ImageType::RGBA8 | ImageType::MIP_MAPPED,
            [8, 4, 0, 0],
            MemoryFlags::READ_WRITE,
            None,
        )
        .unwrap();
        let table = LodTable::of(&core).unwrap();
        assert_eq!(table.level_count, 4);
        assert_eq!(table.layer_count, 1);
        assert_eq!(table.levels[0].extent, [8, 4, 1, 1]);
        assert_eq!(table.levels[1].offset, 8 * 4 * 4);
        assert_eq!(table.levels[1].extent, [4, 2, 1, 1]);
        assert_eq!(table.levels[3].extent, [1, 1, 1, 1]);
        assert_eq!(table.texel_offset(1, [1, 1, 0, 0], 4), 128 + (4 + 1) * 4);
    }
}
