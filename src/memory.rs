// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Memory objects: buffers and images.

Every backend implements [Buffer] and [Image] on top of a shared [MemoryCore], which holds
the state all backends agree on: the (normalized) flags, the byte size, the host span bound at
creation, the per-object recursive lock, the debug label and the bookkeeping for active
mappings.

Operations on the same object from several threads are serialized by the object lock.  The
lock is recursive because acquire/release of shared objects performs reads and writes on the
object itself.
*/

pub mod buffer;
pub mod image;
pub mod sharing;

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::context::ResourceRegistry;
use crate::device::{Device, PlatformType};
use crate::memory_flags::{MapFlags, MemoryFlags};

pub use buffer::Buffer;
pub use image::{Image, ImageCore};
pub use sharing::{SharingKind, SharingState};

/// Caller-owned memory bound to a memory object at creation.
///
/// With [MemoryFlags::USE_HOST_MEMORY] the object aliases these pages; otherwise the span is
/// the implicit source/destination of the pointer-less `read`/`write` calls.
#[derive(Debug, Clone, Copy)]
pub struct HostSpan {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the creator of a HostSpan promises the memory stays valid and is only accessed
// through the owning memory object, which serializes access.
unsafe impl Send for HostSpan {}
unsafe impl Sync for HostSpan {}

impl HostSpan {
    /// # Safety
    /// `ptr..ptr+len` must stay valid for reads and writes for the lifetime of every memory
    /// object created with this span, and must not be accessed by anything else meanwhile.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| HostSpan { ptr, len })
    }

    /// # Safety
    /// See [HostSpan::new].
    pub unsafe fn from_slice(slice: &mut [u8]) -> Self {
        HostSpan {
            ptr: NonNull::from(&mut *slice).cast(),
            len: slice.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// # Safety
    /// No other reference to the span may be live.
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        // SAFETY: bounds were checked by the caller against `self.len`
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    /// # Safety
    /// No other reference to the span may be live.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        // SAFETY: bounds were checked by the caller against `self.len`
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len) }
    }
}

/// A host-visible view returned by `map`; hand it back to `unmap`.
#[derive(Debug)]
#[must_use = "mappings must be passed to unmap"]
pub struct MappedMemory {
    ptr: NonNull<u8>,
    len: usize,
    id: u64,
}

// SAFETY: the mapping is exclusively owned by whoever holds this value until unmap.
unsafe impl Send for MappedMemory {}

impl MappedMemory {
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the memory stays mapped until this value is consumed by unmap
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and we hold the only handle
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

/// Backend data kept for an active mapping.
#[derive(Debug)]
pub(crate) struct MapRecord {
    pub flags: MapFlags,
    pub offset: usize,
    pub len: usize,
    /// Staging copy for backends without directly addressable memory.
    pub shadow: Option<Box<[u8]>>,
}

/// Registry handle of a memory object.
#[derive(Debug, Clone)]
pub enum TrackedResource {
    Buffer(Weak<dyn Buffer>),
    Image(Weak<dyn Image>),
}

impl TrackedResource {
    pub fn is_alive(&self) -> bool {
        match self {
            TrackedResource::Buffer(b) => b.strong_count() > 0,
            TrackedResource::Image(i) => i.strong_count() > 0,
        }
    }
    pub(crate) fn same_object(&self, other: &TrackedResource) -> bool {
        match (self, other) {
            (TrackedResource::Buffer(a), TrackedResource::Buffer(b)) => Weak::ptr_eq(a, b),
            (TrackedResource::Image(a), TrackedResource::Image(b)) => Weak::ptr_eq(a, b),
            _ => false,
        }
    }
}

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(1);

/// Held locks of [MemoryCore::lock_pair].
pub(crate) struct PairGuard<'a> {
    _first: ReentrantMutexGuard<'a, ()>,
    _second: Option<ReentrantMutexGuard<'a, ()>>,
}

/// State shared by all memory objects regardless of backend.
#[derive(Debug)]
pub struct MemoryCore {
    platform: PlatformType,
    device: Arc<Device>,
    size: usize,
    flags: MemoryFlags,
    host_span: Option<HostSpan>,
    lock: ReentrantMutex<()>,
    label: Mutex<String>,
    mappings: Mutex<HashMap<u64, MapRecord>>,
    registry: Option<Arc<ResourceRegistry>>,
    tracked: Option<TrackedResource>,
}

impl MemoryCore {
    pub(crate) fn new(
        device: Arc<Device>,
        size: usize,
        flags: MemoryFlags,
        host_span: Option<HostSpan>,
    ) -> Self {
        MemoryCore {
            platform: device.platform,
            device,
            size,
            flags,
            host_span,
            lock: ReentrantMutex::new(()),
            label: Mutex::new(String::new()),
            mappings: Mutex::new(HashMap::new()),
            registry: None,
            tracked: None,
        }
    }

    /// Registers the object with `registry` unless the flags opt out.
    pub(crate) fn with_tracking(
        mut self,
        registry: &Arc<ResourceRegistry>,
        tracked: TrackedResource,
    ) -> Self {
        if !self.flags.contains(MemoryFlags::NO_RESOURCE_TRACKING) {
            self.registry = Some(registry.clone());
            self.tracked = Some(tracked);
        }
        self
    }

    pub fn platform_type(&self) -> PlatformType {
        self.platform
    }
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }
    pub fn host_span(&self) -> Option<HostSpan> {
        self.host_span
    }
    pub fn debug_label(&self) -> String {
        self.label.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn set_debug_label(&self, label: &str) {
        let previous = {
            let mut current = self.label.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *current, label.to_string())
        };
        if let (Some(registry), Some(tracked)) = (&self.registry, &self.tracked) {
            registry.relabel(&previous, label, tracked.clone());
        }
    }

    /// Serializes user-visible operations on this object.
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Locks two objects in address order, so opposing transfers between the same pair can't
    /// deadlock.  The same object is locked once.
    pub(crate) fn lock_pair<'a>(a: &'a MemoryCore, b: &'a MemoryCore) -> PairGuard<'a> {
        if std::ptr::eq(a, b) {
            return PairGuard {
                _first: a.lock(),
                _second: None,
            };
        }
        let (first, second) = if (a as *const MemoryCore) < (b as *const MemoryCore) {
            (a, b)
        } else {
            (b, a)
        };
        let first = first.lock();
        PairGuard {
            _first: first,
            _second: Some(second.lock()),
        }
    }

    /// Validates a `[offset, offset + size)` range; `size == 0` means "to the end".
    pub(crate) fn resolve_range(&self, size: usize, offset: usize) -> Result<usize, crate::Error> {
        let size = if size == 0 {
            self.size.saturating_sub(offset)
        } else {
            size
        };
        crate::Error::check_bounds(offset, size, self.size)?;
        Ok(size)
    }

    /// The part of the bound host span a buffer `read`/`write` of `[offset, offset + size)` moves.
    ///
    /// `size == 0` stops at the end of the host span, which may be shorter than the word-rounded
    /// allocation.
    pub(crate) fn host_transfer_span(&self, size: usize, offset: usize) -> Result<HostSpan, crate::Error> {
        let size = match self.host_span {
            Some(span) if size == 0 => span.len().min(self.size).saturating_sub(offset),
            _ => self.resolve_range(size, offset)?,
        };
        self.host_span_range(size, offset)
    }

    pub(crate) fn host_span_range(&self, size: usize, offset: usize) -> Result<HostSpan, crate::Error> {
        let span = self
            .host_span
            .ok_or_else(|| crate::Error::invalid("no host memory was bound at creation"))?;
        crate::Error::check_bounds(offset, size, span.len())?;
        // SAFETY: within the bounds checked above
        Ok(unsafe { HostSpan::new(span.as_ptr().add(offset), size) }
            .unwrap_or(span))
    }

    pub(crate) fn has_active_mappings(&self) -> bool {
        !self
            .mappings
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty()
    }

    pub(crate) fn begin_mapping(&self, ptr: NonNull<u8>, record: MapRecord) -> MappedMemory {
        let id = NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed);
        let len = record.len;
        self.mappings
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, record);
        MappedMemory { ptr, len, id }
    }

    pub(crate) fn end_mapping(&self, mapping: &MappedMemory) -> Result<MapRecord, crate::Error> {
        self.mappings
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&mapping.id())
            .ok_or_else(|| crate::Error::invalid("pointer is not an active mapping of this object"))
    }

    /// Logs (without failing) device use of an object that is currently mapped.
    pub(crate) fn warn_if_mapped(&self, operation: &'static str) {
        if self.has_active_mappings() {
            logwise::error_sync!(
                "{operation} [{platform}]: memory object \"{label}\" is used by the device while mapped",
                operation = operation.to_string(),
                platform = self.platform.to_string(),
                label = self.debug_label()
            );
        }
    }
}

/// Operations common to buffers and images.
pub trait MemoryObject: Send + Sync + std::fmt::Debug {
    fn core(&self) -> &MemoryCore;

    fn size(&self) -> usize {
        self.core().size()
    }
    fn flags(&self) -> MemoryFlags {
        self.core().flags()
    }
    fn platform_type(&self) -> PlatformType {
        self.core().platform_type()
    }
    fn device(&self) -> &Arc<Device> {
        self.core().device()
    }
    fn debug_label(&self) -> String {
        self.core().debug_label()
    }
    /// Sets the label and updates the context's resource registry.
    fn set_debug_label(&self, label: &str) {
        self.core().set_debug_label(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(size: usize) -> MemoryCore {
        MemoryCore::new(
            Arc::new(Device::template(PlatformType::Host, 0)),
            size,
            MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE,
            None,
        )
    }

    #[test]
    fn ranges() {
        let core = core(64);
        assert_eq!(core.resolve_range(0, 0).unwrap(), 64);
        assert_eq!(core.resolve_range(0, 16).unwrap(), 48);
        assert_eq!(core.resolve_range(16, 48).unwrap(), 16);
        assert!(core.resolve_range(17, 48).is_err());
        assert!(core.host_span_range(4, 0).is_err());
    }

    #[test]
    fn transfers_stop_at_a_short_host_span() {
        let mut backing = [0u8; 6];
        // SAFETY: backing outlives the core
        let span = unsafe { HostSpan::from_slice(&mut backing) };
        let core = MemoryCore::new(
            Arc::new(Device::template(PlatformType::Host, 0)),
            8,
            MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE,
            Some(span),
        );
        assert_eq!(core.host_transfer_span(0, 0).unwrap().len(), 6);
        assert_eq!(core.host_transfer_span(0, 4).unwrap().len(), 2);
        assert_eq!(core.host_transfer_span(4, 2).unwrap().len(), 4);
        assert!(core.host_transfer_span(8, 0).is_err());
    }

    #[test]
    fn pairs_lock_once_per_object() {
        let a = core(4);
        let b = core(4);
        let _same = MemoryCore::lock_pair(&a, &a);
        let _both = MemoryCore::lock_pair(&b, &a);
        // reentrant on this thread
        let _again = MemoryCore::lock_pair(&a, &b);
    }

    #[test]
    fn mappings() {
        let core = core(16);
        let mut backing = [0u8; 16];
        let mapping = core.begin_mapping(
            NonNull::from(&mut backing).cast(),
            MapRecord {
                flags: MapFlags::READ,
                offset: 0,
                len: 16,
                shadow: None,
            },
        );
        assert!(core.has_active_mappings());
        let record = core.end_mapping(&mapping).unwrap();
        assert_eq!(record.len, 16);
        assert!(core.end_mapping(&mapping).is_err());
        assert!(!core.has_active_mappings());
    }
}
