// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Contexts: one backend, its devices, and the factory for everything else.

A context is created once per backend (see [crate::create_context]) and outlives every object it
creates.  Factory methods log and return an error when they fail; a context whose backend is
unavailable reports [Context::is_supported] `false` and every factory fails with
[Error::ContextUnsupported].
*/

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::{Device, PlatformType};
use crate::error::Error;
use crate::fence::Fence;
use crate::image_type::ImageType;
use crate::indirect::IndirectCommandPipeline;
use crate::memory::{Buffer, HostSpan, Image, TrackedResource};
use crate::memory_flags::MemoryFlags;
use crate::pipeline_description::{IndirectCommandDescription, RenderPipelineDescription};
use crate::program::{Program, ProgramSource};
use crate::queue::Queue;
use crate::render::{GraphicsPipeline, RenderPassDescription, Renderer};

/// Memory statistics of one device, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryUsage {
    pub global_used: u64,
    pub global_total: u64,
    /// Memory held by live objects created through this context.
    pub allocated: u64,
}

impl MemoryUsage {
    /// Used fraction of global memory in `[0, 1]`; 0 when the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.global_total == 0 {
            0.0
        } else {
            (self.global_used as f64 / self.global_total as f64).min(1.0)
        }
    }
}

/// Label → memory-object multimap of one context.
///
/// Objects are held weakly; dead entries are dropped on every update and by [ResourceRegistry::prune].
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    entries: Mutex<HashMap<String, Vec<TrackedResource>>>,
}

impl ResourceRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<TrackedResource>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Moves `resource` from `old` to `new`.  Empty labels are not registered.
    pub(crate) fn relabel(&self, old: &str, new: &str, resource: TrackedResource) {
        let mut entries = self.lock();
        if let Some(list) = entries.get_mut(old) {
            list.retain(|r| r.is_alive() && !r.same_object(&resource));
            if list.is_empty() {
                entries.remove(old);
            }
        }
        if !new.is_empty() {
            let list = entries.entry(new.to_string()).or_default();
            list.retain(TrackedResource::is_alive);
            list.push(resource);
        }
    }

    /// Every live object labeled `label`.
    pub fn find(&self, label: &str) -> Vec<TrackedResource> {
        self.lock()
            .get(label)
            .map(|list| list.iter().filter(|r| r.is_alive()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn find_buffers(&self, label: &str) -> Vec<Arc<dyn Buffer>> {
        self.find(label)
            .into_iter()
            .filter_map(|r| match r {
                TrackedResource::Buffer(weak) => weak.upgrade(),
                TrackedResource::Image(_) => None,
            })
            .collect()
    }

    pub fn find_images(&self, label: &str) -> Vec<Arc<dyn Image>> {
        self.find(label)
            .into_iter()
            .filter_map(|r| match r {
                TrackedResource::Image(weak) => weak.upgrade(),
                TrackedResource::Buffer(_) => None,
            })
            .collect()
    }

    /// Drops entries whose object no longer exists.
    pub fn prune(&self) {
        let mut entries = self.lock();
        entries.retain(|_, list| {
            list.retain(TrackedResource::is_alive);
            !list.is_empty()
        });
    }

    /// Sorted labels with at least one live object.
    pub fn labels(&self) -> Vec<String> {
        self.prune();
        let mut labels: Vec<String> = self.lock().keys().cloned().collect();
        labels.sort();
        labels
    }
}

pub trait Context: Send + Sync + Debug {
    fn platform_type(&self) -> PlatformType;

    /// Whether the backend initialized; factories of an unsupported context always fail.
    fn is_supported(&self) -> bool;

    fn devices(&self) -> &[Arc<Device>];

    fn device(&self, index: u32) -> Option<&Arc<Device>> {
        self.devices().iter().find(|d| d.index == index)
    }

    /// The device with the most compute units, preferring discrete GPUs.
    fn fastest_device(&self) -> Option<&Arc<Device>> {
        self.devices().iter().max_by_key(|d| {
            (
                d.device_type == crate::device::DeviceType::DiscreteGpu,
                u64::from(d.compute_units) * u64::from(d.simd_width.max(1)),
            )
        })
    }

    /// A queue for graphics, compute and transfer work.
    fn create_queue(&self, device: &Arc<Device>) -> Result<Arc<dyn Queue>, Error>;

    /// A compute-only queue; backends without one return a general queue.
    fn create_compute_queue(&self, device: &Arc<Device>) -> Result<Arc<dyn Queue>, Error> {
        self.create_queue(device)
    }

    fn create_buffer(&self, queue: &dyn Queue, size: usize, flags: MemoryFlags) -> Result<Arc<dyn Buffer>, Error>;

    /// A buffer initialized from `data` (unless `NO_INITIAL_COPY` is set).
    fn create_buffer_with_data(
        &self,
        queue: &dyn Queue,
        data: &[u8],
        flags: MemoryFlags,
    ) -> Result<Arc<dyn Buffer>, Error>;

    /// A buffer bound to caller-owned memory.
    ///
    /// With `USE_HOST_MEMORY` the buffer aliases the memory; otherwise the memory is the source of
    /// the initial upload and the target of [Buffer::read] / source of [Buffer::write].
    ///
    /// # Safety
    /// `host` must stay valid, and must not be accessed by the caller while the device may use
    /// it, for the lifetime of the buffer.
    unsafe fn create_buffer_with_host_memory(
        &self,
        queue: &dyn Queue,
        host: HostSpan,
        flags: MemoryFlags,
    ) -> Result<Arc<dyn Buffer>, Error>;

    /// `extent` is `[width, height, depth, layers]`; unused components may be 0.
    fn create_image(
        &self,
        queue: &dyn Queue,
        image_type: ImageType,
        extent: [u32; 4],
        flags: MemoryFlags,
    ) -> Result<Arc<dyn Image>, Error>;

    /// An image initialized from `data` in the packed host layout.
    fn create_image_with_data(
        &self,
        queue: &dyn Queue,
        image_type: ImageType,
        extent: [u32; 4],
        data: &[u8],
        flags: MemoryFlags,
    ) -> Result<Arc<dyn Image>, Error>;

    /// # Safety
    /// As for [Context::create_buffer_with_host_memory].
    unsafe fn create_image_with_host_memory(
        &self,
        queue: &dyn Queue,
        image_type: ImageType,
        extent: [u32; 4],
        host: HostSpan,
        flags: MemoryFlags,
    ) -> Result<Arc<dyn Image>, Error>;

    fn create_program(&self, source: ProgramSource) -> Result<Arc<dyn Program>, Error>;

    fn create_fence(&self, queue: &dyn Queue) -> Result<Arc<dyn Fence>, Error>;

    fn create_indirect_command_pipeline(
        &self,
        description: IndirectCommandDescription,
    ) -> Result<Arc<IndirectCommandPipeline>, Error> {
        if !self.is_supported() {
            return Err(Error::ContextUnsupported);
        }
        IndirectCommandPipeline::new(description, self.platform_type(), self.devices()).map(Arc::new)
    }

    fn create_graphics_pipeline(
        &self,
        description: RenderPipelineDescription,
    ) -> Result<Arc<dyn GraphicsPipeline>, Error>;

    /// Starts a render pass on `queue` drawing with `pipeline`.
    fn create_renderer(
        &self,
        queue: &dyn Queue,
        pipeline: &Arc<dyn GraphicsPipeline>,
        pass: RenderPassDescription,
    ) -> Result<Box<dyn Renderer>, Error>;

    fn memory_usage(&self, device: &Device) -> MemoryUsage;

    fn registry(&self) -> &Arc<ResourceRegistry>;

    /// Attaches the render context that shared memory objects get their second allocation from.
    fn attach_sharing_context(&self, context: Arc<dyn Context>, queue: Arc<dyn Queue>) -> Result<(), Error>;

    fn as_any(&self) -> &dyn Any;
}

/// Fails with [Error::ContextUnsupported] (logged) unless `context` is usable.
pub(crate) fn ensure_supported(context: &dyn Context, operation: &'static str) -> Result<(), Error> {
    if context.is_supported() {
        Ok(())
    } else {
        Err(crate::error::report(
            operation,
            context.platform_type(),
            Error::ContextUnsupported,
        ))
    }
}

/// Checks that `queue` belongs to `context`.
pub(crate) fn check_queue(context: &dyn Context, queue: &dyn Queue, operation: &'static str) -> Result<(), Error> {
    ensure_supported(context, operation)?;
    if queue.platform_type() != context.platform_type()
        || !context.devices().iter().any(|d| **d == **queue.device())
    {
        return Err(crate::error::report(
            operation,
            context.platform_type(),
            Error::invalid(format!(
                "queue of {} does not belong to this context",
                queue.device()
            )),
        ));
    }
    Ok(())
}
