// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Host-Compute buffers: plain process memory.
//!
//! Every allocation is entered into a process-wide address map so that addresses stored in
//! argument buffers can be turned back into bounded views by kernel code.

use std::any::Any;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::context::ResourceRegistry;
use crate::device::{Device, PlatformType};
use crate::error::{Error, reported};
use crate::memory::buffer::{allocation_size, check_copy, check_fill, tile_pattern};
use crate::memory::sharing::{Owner, SharingBridge, SharingKind, SharingState};
use crate::memory::{Buffer, HostSpan, MapRecord, MappedMemory, MemoryCore, MemoryObject, TrackedResource};
use crate::memory_flags::{MapFlags, MemoryFlags};
use crate::queue::Queue;

/// Live storages keyed by `(start address, storage id)`; aliases of one host span get one entry each.
static ALLOCATIONS: parking_lot::Mutex<BTreeMap<(usize, u64), usize>> = parking_lot::const_mutex(BTreeMap::new());
static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Bytes from `address` to the end of the live allocation containing it.
pub(crate) fn lookup_allocation(address: usize) -> Option<usize> {
    let allocations = ALLOCATIONS.lock();
    allocations
        .range(..=(address, u64::MAX))
        .rev()
        .map(|(&(start, _), &len)| start + len)
        .find(|&end| address < end)
        .map(|end| end - address)
}

enum Backing {
    Owned(#[allow(dead_code)] Vec<u128>),
    Host,
}

/// The bytes behind a Host-Compute memory object.
///
/// Access is unsynchronized; callers hold the owning object's lock or are kernels following the
/// device memory model.
pub(crate) struct HostStorage {
    id: u64,
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
    allocated: Arc<AtomicU64>,
}

// SAFETY: the storage is plain memory owned (or borrowed for its lifetime) by this value
unsafe impl Send for HostStorage {}
unsafe impl Sync for HostStorage {}

impl std::fmt::Debug for HostStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStorage")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("host", &matches!(self.backing, Backing::Host))
            .finish()
    }
}

impl HostStorage {
    /// `len` zeroed bytes, 16-byte aligned.
    pub(crate) fn allocate(len: usize, allocated: &Arc<AtomicU64>) -> Result<HostStorage, Error> {
        let words = len.div_ceil(16).max(1);
        let mut memory: Vec<u128> = Vec::new();
        memory.try_reserve_exact(words).map_err(|_| Error::Allocation(len))?;
        memory.resize(words, 0);
        let ptr = NonNull::new(memory.as_mut_ptr().cast::<u8>()).ok_or(Error::Allocation(len))?;
        allocated.fetch_add(len as u64, Ordering::Relaxed);
        Ok(Self::register(ptr, len, Backing::Owned(memory), allocated))
    }

    /// Aliases caller memory.
    pub(crate) fn alias(span: HostSpan, allocated: &Arc<AtomicU64>) -> Result<HostStorage, Error> {
        let ptr = NonNull::new(span.as_ptr()).ok_or_else(|| Error::invalid("null host memory"))?;
        Ok(Self::register(ptr, span.len(), Backing::Host, allocated))
    }

    fn register(ptr: NonNull<u8>, len: usize, backing: Backing, allocated: &Arc<AtomicU64>) -> HostStorage {
        let id = NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed);
        ALLOCATIONS.lock().insert((ptr.as_ptr() as usize, id), len);
        HostStorage {
            id,
            ptr,
            len,
            backing,
            allocated: allocated.clone(),
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    /// Nothing else may access the bytes meanwhile.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self) -> &mut [u8] {
        // SAFETY: ptr/len describe the live allocation
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    /// No one may write the bytes meanwhile.
    pub(crate) unsafe fn bytes(&self) -> &[u8] {
        // SAFETY: ptr/len describe the live allocation
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HostStorage {
    fn drop(&mut self) {
        ALLOCATIONS.lock().remove(&(self.ptr.as_ptr() as usize, self.id));
        if matches!(self.backing, Backing::Owned(_)) {
            self.allocated.fetch_sub(self.len as u64, Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
pub struct HostBuffer {
    core: MemoryCore,
    storage: HostStorage,
    sharing: Option<SharingState<dyn Buffer>>,
}

/// Everything needed to create a buffer.
pub(crate) struct BufferRequest<'a> {
    pub device: Arc<Device>,
    pub size: usize,
    pub flags: MemoryFlags,
    pub host: Option<HostSpan>,
    pub initial: Option<&'a [u8]>,
    pub registry: &'a Arc<ResourceRegistry>,
    pub allocated: &'a Arc<AtomicU64>,
    pub sharing: Option<SharingState<dyn Buffer>>,
}

impl HostBuffer {
    pub(crate) fn new(request: BufferRequest<'_>) -> Result<Arc<HostBuffer>, Error> {
        let BufferRequest {
            device,
            size,
            flags,
            host,
            initial,
            registry,
            allocated,
            sharing,
        } = request;
        let size = allocation_size(size);
        let storage = match host {
            Some(span) if flags.contains(MemoryFlags::USE_HOST_MEMORY) => {
                if span.len() < size {
                    return Err(Error::OutOfBounds {
                        offset: 0,
                        size,
                        capacity: span.len(),
                    });
                }
                HostStorage::alias(span, allocated)?
            }
            _ => HostStorage::allocate(size, allocated)?,
        };
        if !flags.contains(MemoryFlags::USE_HOST_MEMORY) && !flags.contains(MemoryFlags::NO_INITIAL_COPY) {
            // SAFETY: a host span is valid per the creation contract
            let source = initial.or_else(|| host.as_ref().map(|span| unsafe { span.slice(0, span.len().min(size)) }));
            if let Some(source) = source {
                let len = source.len().min(size);
                // SAFETY: the storage is not shared with anyone yet
                let bytes = unsafe { storage.bytes_mut() };
                bytes[..len].copy_from_slice(&source[..len]);
            }
        }
        let core = MemoryCore::new(device, size, flags, host);
        Ok(Arc::new_cyclic(|weak: &Weak<HostBuffer>| {
            let tracked: Weak<dyn Buffer> = weak.clone();
            HostBuffer {
                core: core.with_tracking(registry, TrackedResource::Buffer(tracked)),
                storage,
                sharing,
            }
        }))
    }

    pub(crate) fn storage(&self) -> &HostStorage {
        &self.storage
    }

    /// Device address of the buffer, as stored in parameter blobs.
    pub(crate) fn address(&self) -> u64 {
        self.storage.as_ptr() as usize as u64
    }

    /// Logs compute-side use while a render backend owns the buffer.
    pub(crate) fn check_access(&self, operation: &'static str) {
        if let Some(sharing) = &self.sharing {
            sharing.check_compute_access(operation, PlatformType::Host, &self.core.debug_label());
        }
    }

    fn transition(&self, operation: &'static str, kind: SharingKind, to: Owner) -> Result<(), Error> {
        let Some(sharing) = &self.sharing else {
            return Ok(());
        };
        let _lock = self.core.lock();
        self.core.warn_if_mapped(operation);
        sharing.transition(operation, kind, to, |direction, secondary, queue| {
            // SAFETY: the object lock is held and the compute side doesn't run while handing over
            SharingBridge::sync_buffer(direction, unsafe { self.storage.bytes_mut() }, secondary, queue)
        })
    }
}

impl MemoryObject for HostBuffer {
    fn core(&self) -> &MemoryCore {
        &self.core
    }
}

impl Buffer for HostBuffer {
    fn read_into(&self, _queue: &dyn Queue, dst: &mut [u8], offset: usize) -> Result<(), Error> {
        reported("buffer::read", PlatformType::Host, {
            let _lock = self.core.lock();
            self.check_access("buffer::read");
            Error::check_bounds(offset, dst.len(), self.size()).map(|()| {
                // SAFETY: bounds checked, object lock held
                dst.copy_from_slice(&unsafe { self.storage.bytes() }[offset..offset + dst.len()]);
            })
        })
    }

    fn write_from(&self, _queue: &dyn Queue, src: &[u8], offset: usize) -> Result<(), Error> {
        reported("buffer::write", PlatformType::Host, {
            let _lock = self.core.lock();
            self.check_access("buffer::write");
            Error::check_bounds(offset, src.len(), self.size()).map(|()| {
                // SAFETY: bounds checked, object lock held
                let bytes = unsafe { self.storage.bytes_mut() };
                bytes[offset..offset + src.len()].copy_from_slice(src);
            })
        })
    }

    fn read(&self, queue: &dyn Queue, size: usize, offset: usize) -> Result<(), Error> {
        if self.flags().contains(MemoryFlags::USE_HOST_MEMORY) {
            return Ok(());
        }
        let span = reported("buffer::read", PlatformType::Host, self.core.host_transfer_span(size, offset))?;
        // SAFETY: the span is valid per the creation contract
        self.read_into(queue, unsafe { span.slice_mut(0, span.len()) }, offset)
    }

    fn write(&self, queue: &dyn Queue, size: usize, offset: usize) -> Result<(), Error> {
        if self.flags().contains(MemoryFlags::USE_HOST_MEMORY) {
            return Ok(());
        }
        let span = reported("buffer::write", PlatformType::Host, self.core.host_transfer_span(size, offset))?;
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
        reported("buffer::copy", PlatformType::Host, {
            match src.as_any().downcast_ref::<HostBuffer>() {
                None => Err(Error::invalid("copy source is not a Host-Compute buffer")),
                Some(source) => check_copy(source.size(), self.size(), size, src_offset, dst_offset).map(|size| {
                    let _locks = MemoryCore::lock_pair(&self.core, &source.core);
                    self.check_access("buffer::copy");
                    source.check_access("buffer::copy");
                    // SAFETY: both ranges are in bounds; ptr::copy allows overlap within one buffer
                    unsafe {
                        std::ptr::copy(
                            source.storage.as_ptr().add(src_offset),
                            self.storage.as_ptr().add(dst_offset),
                            size,
                        );
                    }
                }),
            }
        })
    }

    fn fill(&self, _queue: &dyn Queue, pattern: &[u8], size: usize, offset: usize) -> Result<(), Error> {
        reported("buffer::fill", PlatformType::Host, {
            let _lock = self.core.lock();
            self.check_access("buffer::fill");
            check_fill(self.size(), pattern, size, offset).map(|size| {
                // SAFETY: bounds checked, object lock held
                tile_pattern(&mut unsafe { self.storage.bytes_mut() }[offset..offset + size], pattern);
            })
        })
    }

    fn zero(&self, queue: &dyn Queue) -> Result<(), Error> {
        self.fill(queue, &[0], 0, 0)
    }

    fn map(&self, _queue: &dyn Queue, flags: MapFlags, size: usize, offset: usize) -> Result<MappedMemory, Error> {
        reported("buffer::map", PlatformType::Host, {
            let _lock = self.core.lock();
            self.check_access("buffer::map");
            flags
                .validate(self.flags())
                .and_then(|()| self.core.resolve_range(size, offset))
                .map(|len| {
                    // SAFETY: offset is within the allocation
                    let ptr = unsafe { NonNull::new_unchecked(self.storage.as_ptr().add(offset)) };
                    self.core.begin_mapping(
                        ptr,
                        MapRecord {
                            flags,
                            offset,
                            len,
                            shadow: None,
                        },
                    )
                })
        })
    }

    fn unmap(&self, _queue: &dyn Queue, mapping: MappedMemory) -> Result<(), Error> {
        reported("buffer::unmap", PlatformType::Host, {
            let _lock = self.core.lock();
            self.core.end_mapping(&mapping).map(|_| ())
        })
    }

    fn acquire_vulkan_buffer(&self, _queue: &dyn Queue) -> Result<(), Error> {
        self.transition("buffer::acquire_vulkan_buffer", SharingKind::Vulkan, Owner::Render)
    }

    fn release_vulkan_buffer(&self, _queue: &dyn Queue) -> Result<(), Error> {
        self.transition("buffer::release_vulkan_buffer", SharingKind::Vulkan, Owner::Compute)
    }

    fn acquire_metal_buffer(&self, _queue: &dyn Queue) -> Result<(), Error> {
        self.transition("buffer::acquire_metal_buffer", SharingKind::Metal, Owner::Render)
    }

    fn release_metal_buffer(&self, _queue: &dyn Queue) -> Result<(), Error> {
        self.transition("buffer::release_metal_buffer", SharingKind::Metal, Owner::Compute)
    }

    fn shared_buffer(&self) -> Option<Arc<dyn Buffer>> {
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
    fn allocations_are_registered() {
        let allocated = Arc::new(AtomicU64::new(0));
        let storage = HostStorage::allocate(100, &allocated).unwrap();
        let base = storage.as_ptr() as usize;
        assert_eq!(allocated.load(Ordering::Relaxed), 100);
        assert_eq!(lookup_allocation(base), Some(100));
        assert_eq!(lookup_allocation(base + 40), Some(60));
        assert_eq!(lookup_allocation(base + 100), None);
        assert_eq!(base % 16, 0);
        drop(storage);
        assert_eq!(lookup_allocation(base), None);
        assert_eq!(allocated.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn aliases_of_one_span_are_tracked_separately() {
        let allocated = Arc::new(AtomicU64::new(0));
        let mut memory = vec![0u8; 64];
        // SAFETY: `memory` outlives both storages
        let span = unsafe { HostSpan::from_slice(&mut memory) };
        let base = span.as_ptr() as usize;
        let first = HostStorage::alias(span, &allocated).unwrap();
        let second = HostStorage::alias(span, &allocated).unwrap();
        drop(first);
        assert_eq!(lookup_allocation(base + 8), Some(56));
        drop(second);
        assert_eq!(lookup_allocation(base + 8), None);
        assert_eq!(allocated.load(Ordering::Relaxed), 0);
    }
}
