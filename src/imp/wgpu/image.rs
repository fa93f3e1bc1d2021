// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Images of the wgpu backend.
//!
//! Transfers go level by level through staging buffers.  Texels are converted between the
//! packed host layout and the device layout whenever the two differ (three-channel images).

use std::any::Any;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::context::ResourceRegistry;
use crate::device::Device;
use crate::error::{Error, reported};
use crate::fence::{SignalFence, WaitFence, signal_all, wait_all};
use crate::image_type::ImageType;
use crate::imp::wgpu::bound_device::BoundDevice;
use crate::imp::wgpu::error::scoped;
use crate::imp::wgpu::pixel_format::{
    DeviceFormat, copy_extent, sample_type, texture_dimension, view_dimension, wgsl_storage_format,
};
use crate::memory::image::convert_texels;
use crate::memory::{HostSpan, Image, ImageCore, MapRecord, MappedMemory, MemoryCore, MemoryObject, TrackedResource};
use crate::memory_flags::{MapFlags, MemoryFlags};
use crate::queue::Queue;

const ROW_ALIGN: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// Everything needed to create an image.
pub(crate) struct ImageRequest<'a> {
    pub bound: Arc<BoundDevice>,
    pub image_type: ImageType,
    pub extent: [u32; 4],
    pub flags: MemoryFlags,
    pub host: Option<HostSpan>,
    pub initial: Option<&'a [u8]>,
    pub registry: &'a Arc<ResourceRegistry>,
    pub allocated: &'a Arc<AtomicU64>,
}

#[derive(Debug)]
struct Views {
    /// All levels and layers, for sampling.
    sampled: wgpu::TextureView,
    /// Level 0, for storage bindings.
    storage: Option<wgpu::TextureView>,
    /// Level 0, for render passes.
    attachment: Option<wgpu::TextureView>,
}

#[derive(Debug)]
pub struct WgpuImage {
    core: ImageCore,
    bound: Arc<BoundDevice>,
    texture: wgpu::Texture,
    format: DeviceFormat,
    views: Views,
    allocated: Arc<AtomicU64>,
    allocation: u64,
}

fn usage(image_type: ImageType, format: &DeviceFormat) -> wgpu::TextureUsages {
    let mut usage = wgpu::TextureUsages::TEXTURE_BINDING;
    if image_type.is_msaa() {
        return usage | wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    usage |= wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
    if !image_type.is_depth() && wgsl_storage_format(format.format).is_some() {
        usage |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    if image_type.is_render_target() || image_type.is_depth() {
        usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    usage
}

/// Box-filters one level of packed texels into the next, layer by layer.
fn minify_level(
    image_type: ImageType,
    src_extent: [u32; 4],
    dst_extent: [u32; 4],
    layers: u32,
    src: &[u8],
    dst: &mut [u8],
) {
    let bpp = image_type.bytes_per_pixel() as usize;
    let dims = image_type.dim_count();
    let [sw, sh, sd, _] = src_extent;
    let [dw, dh, dd, _] = dst_extent;
    let taps = |reduced: bool, c: u32, extent: u32| -> [u32; 2] {
        if reduced {
            [(2 * c).min(extent - 1), (2 * c + 1).min(extent - 1)]
        } else {
            [c, c]
        }
    };
    let index = |w: u32, h: u32, d: u32, [x, y, z, layer]: [u32; 4]| -> usize {
        (((layer as usize * d as usize + z as usize) * h as usize + y as usize) * w as usize + x as usize) * bpp
    };
    for layer in 0..layers {
        for z in 0..dd {
            for y in 0..dh {
                for x in 0..dw {
                    let mut sum = [0f32; 4];
                    let mut count = 0f32;
                    for tz in taps(dims >= 3, z, sd) {
                        for ty in taps(dims >= 2, y, sh) {
                            for tx in taps(true, x, sw) {
                                let at = index(sw, sh, sd, [tx, ty, tz, layer]);
                                if let Some(texel) = image_type.decode_texel(&src[at..at + bpp]) {
                                    for (s, v) in sum.iter_mut().zip(texel) {
                                        *s += v;
                                    }
                                    count += 1.0;
                                }
                            }
                        }
                    }
                    if count > 0.0 {
                        let at = index(dw, dh, dd, [x, y, z, layer]);
                        let _ = image_type.encode_texel(sum.map(|s| s / count), &mut dst[at..at + bpp]);
                    }
                }
            }
        }
    }
}

const MINIFY_SOURCE: &str = r#"
@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(1) var dst: texture_storage_2d<FORMAT, write>;

@compute @workgroup_size(8, 8)
fn minify(@builtin(global_invocation_id) id: vec3<u32>) {
    let size = textureDimensions(dst);
    if (id.x >= size.x || id.y >= size.y) {
        return;
    }
    let last = vec2<i32>(textureDimensions(src)) - vec2<i32>(1);
    let base = vec2<i32>(id.xy) * 2;
    var sum = vec4<f32>(0.0);
    for (var y = 0; y < 2; y++) {
        for (var x = 0; x < 2; x++) {
            sum += textureLoad(src, min(base + vec2<i32>(x, y), last), 0);
        }
    }
    textureStore(dst, vec2<i32>(id.xy), sum * 0.25);
}
"#;

fn minify_pipeline(bound: &BoundDevice, format: wgpu::TextureFormat, name: &str) -> Result<wgpu::ComputePipeline, Error> {
    let device = bound.device();
    scoped(device, || {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("floor minify"),
            source: wgpu::ShaderSource::Wgsl(MINIFY_SOURCE.replace("FORMAT", name).into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("floor minify"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("floor minify"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("floor minify"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("minify"),
            compilation_options: Default::default(),
            cache: None,
        })
    })
}

impl WgpuImage {
    pub(crate) fn new(request: ImageRequest<'_>) -> Result<Arc<WgpuImage>, Error> {
        let ImageRequest {
            bound,
            image_type,
            extent,
            flags,
            host,
            initial,
            registry,
            allocated,
        } = request;
        let device: Arc<Device> = bound.info().clone();
        let core = ImageCore::new(device, image_type, extent, flags, host)?;
        let image_type = core.image_type();
        if image_type.dim_count() == 1 && (image_type.is_array() || core.mip_level_count() > 1) {
            return Err(Error::unsupported("1D image arrays and mip-mapped 1D images on wgpu"));
        }
        if image_type.is_msaa() && !image_type.is_render_target() {
            return Err(Error::unsupported("multi-sampled images that are not render targets on wgpu"));
        }
        let format = DeviceFormat::of(image_type)?;
        let usage = usage(image_type, &format);
        let layers = image_type.layer_count(core.extent());
        let texture = scoped(bound.device(), || {
            bound.device().create_texture(&wgpu::TextureDescriptor {
                label: None,
                size: copy_extent(image_type, core.level_extent(0), layers),
                mip_level_count: core.mip_level_count(),
                sample_count: image_type.sample_count(),
                dimension: texture_dimension(image_type),
                format: format.format,
                usage,
                view_formats: &[],
            })
        })?;
        let level_zero = |dimension| {
            texture.create_view(&wgpu::TextureViewDescriptor {
                dimension: Some(dimension),
                base_mip_level: 0,
                mip_level_count: Some(1),
                ..Default::default()
            })
        };
        let array_view = match view_dimension(image_type) {
            wgpu::TextureViewDimension::Cube | wgpu::TextureViewDimension::CubeArray => {
                wgpu::TextureViewDimension::D2Array
            }
            other => other,
        };
        let views = Views {
            sampled: texture.create_view(&wgpu::TextureViewDescriptor {
                dimension: Some(view_dimension(image_type)),
                ..Default::default()
            }),
            storage: usage
                .contains(wgpu::TextureUsages::STORAGE_BINDING)
                .then(|| level_zero(array_view)),
            attachment: usage
                .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
                .then(|| level_zero(array_view)),
        };
        let device_type = image_type.difference(image_type.storage_format()) | format.storage;
        let allocation =
            device_type.image_size(core.extent(), core.mip_level_count()) as u64 * u64::from(image_type.sample_count());
        allocated.fetch_add(allocation, Ordering::Relaxed);
        let size = core.memory().size();
        let image = Arc::new_cyclic(|weak: &Weak<WgpuImage>| {
            let tracked: Weak<dyn Image> = weak.clone();
            WgpuImage {
                core: core.with_tracking(registry, TrackedResource::Image(tracked)),
                bound,
                texture,
                format,
                views,
                allocated: allocated.clone(),
                allocation,
            }
        });
        if !flags.contains(MemoryFlags::NO_INITIAL_COPY) {
            // SAFETY: a host span is valid per the creation contract
            let source = initial.or_else(|| host.as_ref().map(|span| unsafe { span.slice(0, size) }));
            if let Some(source) = source {
                if source.len() < size {
                    return Err(Error::OutOfBounds {
                        offset: 0,
                        size,
                        capacity: source.len(),
                    });
                }
                image.write_all(&source[..size])?;
                if flags.contains(MemoryFlags::GENERATE_MIP_MAPS) {
                    image.regenerate()?;
                }
            }
        }
        Ok(image)
    }

    pub(crate) fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub(crate) fn bound(&self) -> &Arc<BoundDevice> {
        &self.bound
    }

    pub(crate) fn format(&self) -> wgpu::TextureFormat {
        self.format.format
    }

    pub(crate) fn view(&self) -> &wgpu::TextureView {
        &self.views.sampled
    }

    pub(crate) fn storage_view(&self) -> Option<&wgpu::TextureView> {
        self.views.storage.as_ref()
    }

    pub(crate) fn attachment_view(&self) -> Option<&wgpu::TextureView> {
        self.views.attachment.as_ref()
    }

    fn host_transfers(&self) -> Result<(), Error> {
        if self.image_type().is_msaa() {
            return Err(Error::unsupported("host access to multi-sampled images on wgpu"));
        }
        if !self.format.is_copyable() {
            return Err(Error::unsupported(format!("host access to {:?} images", self.format.format)));
        }
        Ok(())
    }

    /// `(copy extent, device bytes per row, rows per image)` of `level`.
    fn level_layout(&self, level: u32) -> (wgpu::Extent3d, u32, u32) {
        let image_type = self.image_type();
        let level_extent = self.core.level_extent(level);
        let extent = copy_extent(image_type, level_extent, image_type.layer_count(self.extent()));
        let row = extent.width * self.format.storage.bytes_per_pixel();
        (extent, row, extent.height)
    }

    fn device_level_len(&self, level: u32) -> usize {
        let (extent, row, rows) = self.level_layout(level);
        row as usize * rows as usize * extent.depth_or_array_layers as usize
    }

    fn read_level(&self, level: u32, dst: &mut [u8]) -> Result<(), Error> {
        self.host_transfers()?;
        let range = self.core.level_range(level)?;
        if dst.len() != range.len() {
            return Err(Error::invalid(format!(
                "expected a {} byte destination, got {}",
                range.len(),
                dst.len()
            )));
        }
        let (extent, row, rows) = self.level_layout(level);
        let padded = row.div_ceil(ROW_ALIGN) * ROW_ALIGN;
        let images = extent.depth_or_array_layers;
        let staging_size = u64::from(padded) * u64::from(rows) * u64::from(images);
        let staging = scoped(self.bound.device(), || {
            let staging = self.bound.device().create_buffer(&wgpu::BufferDescriptor {
                label: Some("floor image readback"),
                size: staging_size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self.bound.encoder("floor image readback");
            encoder.copy_texture_to_buffer(
                wgpu::TexelCopyTextureInfo {
                    texture: &self.texture,
                    mip_level: level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyBufferInfo {
                    buffer: &staging,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(padded),
                        rows_per_image: Some(rows),
                    },
                },
                extent,
            );
            self.bound.queue().submit([encoder.finish()]);
            staging
        })?;
        let bytes = self.bound.map_read(&staging, staging_size)?;
        let mut packed = Vec::with_capacity(self.device_level_len(level));
        for line in bytes.chunks_exact(padded as usize) {
            packed.extend_from_slice(&line[..row as usize]);
        }
        convert_texels(self.format.storage, &packed, self.image_type(), dst)
    }

    fn write_level(&self, level: u32, src: &[u8]) -> Result<(), Error> {
        self.host_transfers()?;
        if self.format.format == wgpu::TextureFormat::Depth32Float {
            return Err(Error::unsupported("host writes to 32-bit float depth images"));
        }
        let range = self.core.level_range(level)?;
        if src.len() != range.len() {
            return Err(Error::invalid(format!(
                "expected {} bytes of image data, got {}",
                range.len(),
                src.len()
            )));
        }
        let (extent, row, rows) = self.level_layout(level);
        let mut packed = vec![0u8; self.device_level_len(level)];
        convert_texels(self.image_type(), src, self.format.storage, &mut packed)?;
        scoped(self.bound.device(), || {
            self.bound.queue().write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &self.texture,
                    mip_level: level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &packed,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(row),
                    rows_per_image: Some(rows),
                },
                extent,
            );
            self.bound.queue().submit([]);
        })
    }

    fn read_all(&self, dst: &mut [u8]) -> Result<(), Error> {
        if dst.len() != self.size() {
            return Err(Error::invalid(format!(
                "expected a {} byte destination, got {}",
                self.size(),
                dst.len()
            )));
        }
        (0..self.mip_level_count()).try_for_each(|level| {
            let range = self.core.level_range(level)?;
            self.read_level(level, &mut dst[range])
        })
    }

    fn write_all(&self, src: &[u8]) -> Result<(), Error> {
        if src.len() != self.size() {
            return Err(Error::invalid(format!(
                "expected {} bytes of image data, got {}",
                self.size(),
                src.len()
            )));
        }
        (0..self.mip_level_count()).try_for_each(|level| {
            let range = self.core.level_range(level)?;
            self.write_level(level, &src[range])
        })
    }

    fn regenerate_if_requested(&self, queue: &dyn Queue) -> Result<(), Error> {
        if self.flags().contains(MemoryFlags::GENERATE_MIP_MAPS) && self.mip_level_count() > 1 {
            self.generate_mip_maps(queue)
        } else {
            Ok(())
        }
    }

    fn minify_on_device(&self) -> bool {
        let image_type = self.image_type();
        image_type.dim_count() == 2
            && !image_type.is_array()
            && !image_type.is_cube()
            && self.views.storage.is_some()
            && matches!(sample_type(self.format.storage), wgpu::TextureSampleType::Float { .. })
    }

    fn regenerate(&self) -> Result<(), Error> {
        if self.mip_level_count() <= 1 {
            return Ok(());
        }
        if let (true, Some(name)) = (self.minify_on_device(), wgsl_storage_format(self.format.format)) {
            return self.minify_gpu(name);
        }
        let image_type = self.image_type();
        let layers = image_type.layer_count(self.extent());
        let first = self.core.level_range(0)?;
        let mut previous = vec![0u8; first.len()];
        self.read_level(0, &mut previous)?;
        for level in 1..self.mip_level_count() {
            let mut next = vec![0u8; self.core.level_range(level)?.len()];
            minify_level(
                image_type,
                self.core.level_extent(level - 1),
                self.core.level_extent(level),
                layers,
                &previous,
                &mut next,
            );
            self.write_level(level, &next)?;
            previous = next;
        }
        Ok(())
    }

    fn minify_gpu(&self, name: &str) -> Result<(), Error> {
        let format = self.format.format;
        let pipeline = self
            .bound
            .minify
            .get_or_try_insert(format, || minify_pipeline(&self.bound, format, name))?;
        let single = |level: u32| {
            self.texture.create_view(&wgpu::TextureViewDescriptor {
                dimension: Some(wgpu::TextureViewDimension::D2),
                base_mip_level: level,
                mip_level_count: Some(1),
                ..Default::default()
            })
        };
        scoped(self.bound.device(), || {
            let mut encoder = self.bound.encoder("floor minify");
            for level in 1..self.mip_level_count() {
                let (src, dst) = (single(level - 1), single(level));
                let bind_group = self.bound.device().create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("floor minify"),
                    layout: &pipeline.get_bind_group_layout(0),
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&src),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(&dst),
                        },
                    ],
                });
                let [w, h, _, _] = self.core.level_extent(level);
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("floor minify"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(w.div_ceil(8), h.div_ceil(8), 1);
            }
            self.bound.queue().submit([encoder.finish()]);
        })
    }

    /// Clears depth images, which can not be written from buffers.
    fn clear_depth(&self) -> Result<(), Error> {
        let image_type = self.image_type();
        let layers = image_type.layer_count(self.extent());
        scoped(self.bound.device(), || {
            let mut encoder = self.bound.encoder("floor depth clear");
            for level in 0..self.mip_level_count() {
                for layer in 0..layers {
                    let view = self.texture.create_view(&wgpu::TextureViewDescriptor {
                        dimension: Some(wgpu::TextureViewDimension::D2),
                        base_mip_level: level,
                        mip_level_count: Some(1),
                        base_array_layer: layer,
                        array_layer_count: Some(1),
                        ..Default::default()
                    });
                    let clear = wgpu::Operations {
                        load: wgpu::LoadOp::Clear(0),
                        store: wgpu::StoreOp::Store,
                    };
                    drop(encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("floor depth clear"),
                        color_attachments: &[],
                        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                            view: &view,
                            depth_ops: Some(wgpu::Operations {
                                load: wgpu::LoadOp::Clear(0.0),
                                store: wgpu::StoreOp::Store,
                            }),
                            stencil_ops: image_type.has_stencil().then_some(clear),
                        }),
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    }));
                }
            }
            self.bound.queue().submit([encoder.finish()]);
        })
    }
}

impl Drop for WgpuImage {
    fn drop(&mut self) {
        self.allocated.fetch_sub(self.allocation, Ordering::Relaxed);
    }
}

impl MemoryObject for WgpuImage {
    fn core(&self) -> &MemoryCore {
        self.core.memory()
    }
}

impl Image for WgpuImage {
    fn image_core(&self) -> &ImageCore {
        &self.core
    }

    fn read_into(&self, _queue: &dyn Queue, dst: &mut [u8]) -> Result<(), Error> {
        reported("image::read", self.platform_type(), {
            let _lock = self.core.memory().lock();
            self.read_all(dst)
        })
    }

    fn write_from(&self, _queue: &dyn Queue, src: &[u8]) -> Result<(), Error> {
        reported("image::write", self.platform_type(), {
            let _lock = self.core.memory().lock();
            self.write_all(src)
        })
    }

    fn read_level_into(&self, _queue: &dyn Queue, level: u32, dst: &mut [u8]) -> Result<(), Error> {
        reported("image::read", self.platform_type(), {
            let _lock = self.core.memory().lock();
            self.read_level(level, dst)
        })
    }

    fn write_level_from(&self, queue: &dyn Queue, level: u32, src: &[u8]) -> Result<(), Error> {
        reported("image::write", self.platform_type(), {
            let _lock = self.core.memory().lock();
            self.write_level(level, src)
        })?;
        if level == 0 {
            self.regenerate_if_requested(queue)?;
        }
        Ok(())
    }

    fn read(&self, queue: &dyn Queue) -> Result<(), Error> {
        let span = reported(
            "image::read",
            self.platform_type(),
            self.core.memory().host_span_range(self.size(), 0),
        )?;
        // SAFETY: the span is valid per the creation contract
        self.read_into(queue, unsafe { span.slice_mut(0, span.len()) })
    }

    fn write(&self, queue: &dyn Queue) -> Result<(), Error> {
        let span = reported(
            "image::write",
            self.platform_type(),
            self.core.memory().host_span_range(self.size(), 0),
        )?;
        // SAFETY: the span is valid per the creation contract
        self.write_from(queue, unsafe { span.slice(0, span.len()) })?;
        self.regenerate_if_requested(queue)
    }

    fn zero(&self, _queue: &dyn Queue) -> Result<(), Error> {
        reported("image::zero", self.platform_type(), {
            let _lock = self.core.memory().lock();
            self.core.memory().warn_if_mapped("image::zero");
            if self.image_type().is_depth() {
                self.clear_depth()
            } else {
                self.write_all(&vec![0u8; self.size()])
            }
        })
    }

    fn blit(&self, _queue: &dyn Queue, src: &dyn Image) -> Result<(), Error> {
        reported("image::blit", self.platform_type(), {
            match src.as_any().downcast_ref::<WgpuImage>() {
                None => Err(Error::invalid("blit source is not a wgpu image")),
                Some(source) if std::ptr::eq(source, self) => Ok(()),
                Some(source) => self.core.check_blit(&source.core).and_then(|levels| {
                    let _locks = MemoryCore::lock_pair(self.core.memory(), source.core.memory());
                    if Arc::ptr_eq(&self.bound, &source.bound) && self.format == source.format {
                        scoped(self.bound.device(), || {
                            let mut encoder = self.bound.encoder("floor blit");
                            for level in 0..levels {
                                let (extent, _, _) = self.level_layout(level);
                                encoder.copy_texture_to_texture(
                                    wgpu::TexelCopyTextureInfo {
                                        texture: &source.texture,
                                        mip_level: level,
                                        origin: wgpu::Origin3d::ZERO,
                                        aspect: wgpu::TextureAspect::All,
                                    },
                                    wgpu::TexelCopyTextureInfo {
                                        texture: &self.texture,
                                        mip_level: level,
                                        origin: wgpu::Origin3d::ZERO,
                                        aspect: wgpu::TextureAspect::All,
                                    },
                                    extent,
                                );
                            }
                            self.bound.queue().submit([encoder.finish()]);
                        })
                    } else {
                        (0..levels).try_for_each(|level| {
                            let mut texels = vec![0u8; source.core.level_range(level)?.len()];
                            source.read_level(level, &mut texels)?;
                            let mut converted = vec![0u8; self.core.level_range(level)?.len()];
                            convert_texels(source.image_type(), &texels, self.image_type(), &mut converted)?;
                            self.write_level(level, &converted)
                        })
                    }
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
        let result = self.blit(queue, src);
        signal_all(signal_fences);
        result
    }

    fn generate_mip_maps(&self, _queue: &dyn Queue) -> Result<(), Error> {
        reported("image::generate_mip_maps", self.platform_type(), {
            let _lock = self.core.memory().lock();
            self.regenerate()
        })
    }

    fn map(&self, _queue: &dyn Queue, flags: MapFlags) -> Result<MappedMemory, Error> {
        reported("image::map", self.platform_type(), {
            let _lock = self.core.memory().lock();
            flags.validate(self.flags()).and_then(|()| {
                let len = self.size();
                let mut shadow = vec![0u8; len].into_boxed_slice();
                if flags.needs_read_back() {
                    self.read_all(&mut shadow)?;
                }
                let ptr = NonNull::new(shadow.as_mut_ptr()).ok_or(Error::Allocation(len))?;
                Ok(self.core.memory().begin_mapping(
                    ptr,
                    MapRecord {
                        flags,
                        offset: 0,
                        len,
                        shadow: Some(shadow),
                    },
                ))
            })
        })
    }

    fn unmap(&self, queue: &dyn Queue, mapping: MappedMemory) -> Result<(), Error> {
        let written = reported("image::unmap", self.platform_type(), {
            let _lock = self.core.memory().lock();
            self.core.memory().end_mapping(&mapping).and_then(|record| match record.shadow {
                Some(shadow) if record.flags.needs_write_back() => self.write_all(&shadow).map(|()| true),
                _ => Ok(false),
            })
        })?;
        if written {
            self.regenerate_if_requested(queue)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minify_averages_boxes() {
        let image_type = ImageType::IMAGE_2D | ImageType::R8;
        let src = [0u8, 255, 255, 255, 0, 0, 0, 0];
        let mut dst = [0u8; 2];
        minify_level(image_type, [4, 2, 1, 1], [2, 1, 1, 1], 1, &src, &mut dst);
        // (0 + 255 + 0 + 0) / 4 and (255 + 255 + 0 + 0) / 4
        assert!((63..=64).contains(&dst[0]));
        assert!((127..=128).contains(&dst[1]));
    }

    #[test]
    fn minify_keeps_layers_apart() {
        let image_type = ImageType::IMAGE_2D_ARRAY | ImageType::R8;
        let src = [0u8, 0, 0, 0, 255, 255, 255, 255];
        let mut dst = [0u8; 2];
        minify_level(image_type, [2, 2, 1, 2], [1, 1, 1, 2], 2, &src, &mut dst);
        assert_eq!(dst, [0, 255]);
    }

    #[test]
    fn usage_follows_format() {
        let rgba = DeviceFormat::of(ImageType::RGBA8).unwrap();
        let plain = usage(ImageType::IMAGE_2D | ImageType::RGBA8, &rgba);
        assert!(plain.contains(wgpu::TextureUsages::STORAGE_BINDING));
        assert!(!plain.contains(wgpu::TextureUsages::RENDER_ATTACHMENT));
        let target = usage(ImageType::IMAGE_2D | ImageType::RGBA8 | ImageType::RENDER_TARGET, &rgba);
        assert!(target.contains(wgpu::TextureUsages::RENDER_ATTACHMENT));
        let depth = DeviceFormat::of(ImageType::D32F).unwrap();
        let depth_usage = usage(ImageType::IMAGE_DEPTH | ImageType::D32F, &depth);
        assert!(!depth_usage.contains(wgpu::TextureUsages::STORAGE_BINDING));
        assert!(depth_usage.contains(wgpu::TextureUsages::RENDER_ATTACHMENT));
    }
}
