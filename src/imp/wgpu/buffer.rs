// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Buffers of the wgpu backend.
//!
//! wgpu only moves data in 4-byte units, so unaligned transfers widen to the surrounding
//! aligned range.  Host-side access goes through staging copies: mappings hand out a shadow
//! allocation that is read back on `map` and written back on `unmap`.

use std::any::Any;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::context::ResourceRegistry;
use crate::device::Device;
use crate::error::{Error, reported};
use crate::imp::wgpu::bound_device::BoundDevice;
use crate::imp::wgpu::error::scoped;
use crate::memory::buffer::{allocation_size, check_copy, check_fill, tile_pattern};
use crate::memory::{Buffer, HostSpan, MapRecord, MappedMemory, MemoryCore, MemoryObject, TrackedResource};
use crate::memory_flags::{MapFlags, MemoryFlags};
use crate::queue::Queue;

const ALIGN: usize = wgpu::COPY_BUFFER_ALIGNMENT as usize;

/// Everything needed to create a buffer.
pub(crate) struct BufferRequest<'a> {
    pub bound: Arc<BoundDevice>,
    pub size: usize,
    pub flags: MemoryFlags,
    pub host: Option<HostSpan>,
    pub initial: Option<&'a [u8]>,
    pub registry: &'a Arc<ResourceRegistry>,
    pub allocated: &'a Arc<AtomicU64>,
}

#[derive(Debug)]
pub struct WgpuBuffer {
    core: MemoryCore,
    bound: Arc<BoundDevice>,
    buffer: wgpu::Buffer,
    /// Persistent readback buffer of `HOST_READ_STAGING` buffers.
    staging: Option<wgpu::Buffer>,
    allocated: Arc<AtomicU64>,
    allocation: u64,
}

/// `[offset, offset + len)` widened to copy alignment.
fn aligned_range(offset: usize, len: usize) -> (usize, usize) {
    let start = offset - offset % ALIGN;
    let end = (offset + len).div_ceil(ALIGN) * ALIGN;
    (start, end - start)
}

fn usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE
        | wgpu::BufferUsages::UNIFORM
        | wgpu::BufferUsages::COPY_SRC
        | wgpu::BufferUsages::COPY_DST
        | wgpu::BufferUsages::INDEX
        | wgpu::BufferUsages::VERTEX
        | wgpu::BufferUsages::INDIRECT
}

impl WgpuBuffer {
    pub(crate) fn new(request: BufferRequest<'_>) -> Result<Arc<WgpuBuffer>, Error> {
        let BufferRequest {
            bound,
            size,
            flags,
            host,
            initial,
            registry,
            allocated,
        } = request;
        let device: Arc<Device> = bound.info().clone();
        let size = allocation_size(size);
        let allocation = size as u64;
        if allocation > device.max_mem_alloc {
            return Err(Error::Allocation(size));
        }
        if let Some(span) = host {
            if span.len() < size {
                return Err(Error::OutOfBounds {
                    offset: 0,
                    size,
                    capacity: span.len(),
                });
            }
        }
        if flags.contains(MemoryFlags::USE_HOST_MEMORY) {
            logwise::warn_sync!(
                "buffer [{platform}]: host memory can not be aliased, falling back to copies",
                platform = device.platform.to_string()
            );
        }
        let source = if flags.contains(MemoryFlags::NO_INITIAL_COPY) {
            None
        } else {
            // SAFETY: a host span is valid per the creation contract
            initial.or_else(|| host.as_ref().map(|span| unsafe { span.slice(0, span.len().min(size)) }))
        };
        let buffer = scoped(bound.device(), || {
            let buffer = bound.device().create_buffer(&wgpu::BufferDescriptor {
                label: None,
                size: allocation,
                usage: usage(),
                mapped_at_creation: source.is_some(),
            });
            if let Some(source) = source {
                {
                    let len = source.len().min(size);
                    let mut view = buffer.slice(..).get_mapped_range_mut();
                    view[..len].copy_from_slice(&source[..len]);
                }
                buffer.unmap();
            }
            buffer
        })?;
        let staging = if flags.contains(MemoryFlags::HOST_READ_STAGING) {
            Some(scoped(bound.device(), || {
                bound.device().create_buffer(&wgpu::BufferDescriptor {
                    label: Some("floor staging"),
                    size: allocation,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })?)
        } else {
            None
        };
        allocated.fetch_add(allocation, Ordering::Relaxed);
        let core = MemoryCore::new(device, size, flags, host);
        Ok(Arc::new_cyclic(|weak: &Weak<WgpuBuffer>| {
            let tracked: Weak<dyn Buffer> = weak.clone();
            WgpuBuffer {
                core: core.with_tracking(registry, TrackedResource::Buffer(tracked)),
                bound,
                buffer,
                staging,
                allocated: allocated.clone(),
                allocation,
            }
        }))
    }

    pub(crate) fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub(crate) fn bound(&self) -> &Arc<BoundDevice> {
        &self.bound
    }

    /// Size of the wgpu allocation, which is at least [MemoryObject::size].
    pub(crate) fn allocation(&self) -> u64 {
        self.allocation
    }

    fn read_range(&self, dst: &mut [u8], offset: usize) -> Result<(), Error> {
        Error::check_bounds(offset, dst.len(), self.size())?;
        if dst.is_empty() {
            return Ok(());
        }
        let (start, len) = aligned_range(offset, dst.len());
        let bytes = match &self.staging {
            Some(staging) => {
                let mut encoder = self.bound.encoder("floor staged readback");
                encoder.copy_buffer_to_buffer(&self.buffer, start as u64, staging, 0, len as u64);
                self.bound.queue().submit([encoder.finish()]);
                self.bound.map_read(staging, len as u64)?
            }
            None => self.bound.read_buffer(&self.buffer, start as u64, len as u64)?,
        };
        let skip = offset - start;
        dst.copy_from_slice(&bytes[skip..skip + dst.len()]);
        Ok(())
    }

    fn write_range(&self, src: &[u8], offset: usize) -> Result<(), Error> {
        Error::check_bounds(offset, src.len(), self.size())?;
        if src.is_empty() {
            return Ok(());
        }
        if offset % ALIGN == 0 && src.len() % ALIGN == 0 {
            self.bound.queue().write_buffer(&self.buffer, offset as u64, src);
        } else {
            let (start, len) = aligned_range(offset, src.len());
            let mut staged = self.bound.read_buffer(&self.buffer, start as u64, len as u64)?;
            let skip = offset - start;
            staged[skip..skip + src.len()].copy_from_slice(src);
            self.bound.queue().write_buffer(&self.buffer, start as u64, &staged);
        }
        // an empty submission flushes the staged write in queue order
        self.bound.queue().submit([]);
        Ok(())
    }

    fn run(&self, label: &str, record: impl FnOnce(&mut wgpu::CommandEncoder)) -> Result<(), Error> {
        scoped(self.bound.device(), || {
            let mut encoder = self.bound.encoder(label);
            record(&mut encoder);
            self.bound.queue().submit([encoder.finish()]);
        })
    }
}

impl Drop for WgpuBuffer {
    fn drop(&mut self) {
        self.allocated.fetch_sub(self.allocation, Ordering::Relaxed);
    }
}

impl MemoryObject for WgpuBuffer {
    fn core(&self) -> &MemoryCore {
        &self.core
    }
}

impl Buffer for WgpuBuffer {
    fn read_into(&self, _queue: &dyn Queue, dst: &mut [u8], offset: usize) -> Result<(), Error> {
        reported("buffer::read", self.platform_type(), {
            let _lock = self.core.lock();
            self.read_range(dst, offset)
        })
    }

    fn write_from(&self, _queue: &dyn Queue, src: &[u8], offset: usize) -> Result<(), Error> {
        reported("buffer::write", self.platform_type(), {
            let _lock = self.core.lock();
            self.write_range(src, offset)
        })
    }

    fn read(&self, queue: &dyn Queue, size: usize, offset: usize) -> Result<(), Error> {
        let span = reported("buffer::read", self.platform_type(), self.core.host_transfer_span(size, offset))?;
        // SAFETY: the span is valid per the creation contract
        self.read_into(queue, unsafe { span.slice_mut(0, span.len()) }, offset)
    }

    fn write(&self, queue: &dyn Queue, size: usize, offset: usize) -> Result<(), Error> {
        let span = reported("buffer::write", self.platform_type(), self.core.host_transfer_span(size, offset))?;
        // SAFETY: the span is valid per the creation contract
        self.write_from(queue, unsafe { span.slice(0, span.len()) }, offset)
    }

    fn copy(
        &self,
        _queue: &dyn Queue,
        src: &dyn Buffer,
        size: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> Result<(), Error> {
        reported("buffer::copy", self.platform_type(), {
            match src.as_any().downcast_ref::<WgpuBuffer>() {
                None => Err(Error::invalid("copy source is not a wgpu buffer")),
                Some(source) => check_copy(source.size(), self.size(), size, src_offset, dst_offset).and_then(|size| {
                    let _locks = MemoryCore::lock_pair(&self.core, &source.core);
                    self.core.warn_if_mapped("buffer::copy");
                    source.core.warn_if_mapped("buffer::copy");
                    let direct = Arc::ptr_eq(&self.bound, &source.bound)
                        && !std::ptr::eq(self, source)
                        && src_offset % ALIGN == 0
                        && dst_offset % ALIGN == 0
                        && size % ALIGN == 0;
                    if direct {
                        self.run("floor buffer copy", |encoder| {
                            encoder.copy_buffer_to_buffer(
                                &source.buffer,
                                src_offset as u64,
                                &self.buffer,
                                dst_offset as u64,
                                size as u64,
                            );
                        })
                    } else {
                        let mut staged = vec![0u8; size];
                        source.read_range(&mut staged, src_offset)?;
                        self.write_range(&staged, dst_offset)
                    }
                }),
            }
        })
    }

    fn fill(&self, _queue: &dyn Queue, pattern: &[u8], size: usize, offset: usize) -> Result<(), Error> {
        reported("buffer::fill", self.platform_type(), {
            let _lock = self.core.lock();
            self.core.warn_if_mapped("buffer::fill");
            check_fill(self.size(), pattern, size, offset).and_then(|size| {
                if pattern.iter().all(|b| *b == 0) && offset % ALIGN == 0 && size % ALIGN == 0 {
                    self.run("floor buffer fill", |encoder| {
                        encoder.clear_buffer(&self.buffer, offset as u64, Some(size as u64));
                    })
                } else {
                    let mut staged = vec![0u8; size];
                    tile_pattern(&mut staged, pattern);
                    self.write_range(&staged, offset)
                }
            })
        })
    }

    fn zero(&self, _queue: &dyn Queue) -> Result<(), Error> {
        reported("buffer::zero", self.platform_type(), {
            let _lock = self.core.lock();
            self.core.warn_if_mapped("buffer::zero");
            self.run("floor buffer zero", |encoder| encoder.clear_buffer(&self.buffer, 0, None))
        })
    }

    fn map(&self, _queue: &dyn Queue, flags: MapFlags, size: usize, offset: usize) -> Result<MappedMemory, Error> {
        reported("buffer::map", self.platform_type(), {
            let _lock = self.core.lock();
            flags
                .validate(self.flags())
                .and_then(|()| self.core.resolve_range(size, offset))
                .and_then(|len| {
                    let mut shadow = vec![0u8; len].into_boxed_slice();
                    if flags.needs_read_back() {
                        self.read_range(&mut shadow, offset)?;
                    }
                    let ptr = NonNull::new(shadow.as_mut_ptr()).ok_or(Error::Allocation(len))?;
                    Ok(self.core.begin_mapping(
                        ptr,
                        MapRecord {
                            flags,
                            offset,
                            len,
                            shadow: Some(shadow),
                        },
                    ))
                })
        })
    }

    fn unmap(&self, _queue: &dyn Queue, mapping: MappedMemory) -> Result<(), Error> {
        reported("buffer::unmap", self.platform_type(), {
            let _lock = self.core.lock();
            self.core.end_mapping(&mapping).and_then(|record| match record.shadow {
                Some(shadow) if record.flags.needs_write_back() => self.write_range(&shadow, record.offset),
                _ => Ok(()),
            })
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_widen_to_alignment() {
        assert_eq!(aligned_range(0, 4), (0, 4));
        assert_eq!(aligned_range(1, 2), (0, 4));
        assert_eq!(aligned_range(3, 2), (0, 8));
        assert_eq!(aligned_range(8, 5), (8, 8));
    }
}
