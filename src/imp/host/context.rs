// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The Host-Compute context: the CPU as a compute device.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ContextConfig;
use crate::context::{Context, MemoryUsage, ResourceRegistry, check_queue, ensure_supported};
use crate::device::{Device, PlatformType};
use crate::error::{Error, report};
use crate::fence::{Fence, TimelineFence};
use crate::image_type::ImageType;
use crate::imp::host::buffer::{BufferRequest, HostBuffer};
use crate::imp::host::device::{discover, used_memory};
use crate::imp::host::image::{HostImage, ImageRequest};
use crate::imp::host::program::HostProgram;
use crate::imp::host::queue::HostQueue;
use crate::memory::sharing::{SharingKind, SharingState};
use crate::memory::{Buffer, HostSpan, Image};
use crate::memory_flags::MemoryFlags;
use crate::pipeline_description::RenderPipelineDescription;
use crate::program::{Program, ProgramSource};
use crate::queue::{Queue, QueueType};
use crate::render::{GraphicsPipeline, RenderPassDescription, Renderer};
use crate::runtime_state::{self, RuntimeState};

/// The render context shared objects get their second allocation from.
#[derive(Debug, Clone)]
struct SharingTarget {
    context: Arc<dyn Context>,
    queue: Arc<dyn Queue>,
}

#[derive(Debug)]
pub struct HostContext {
    config: Arc<ContextConfig>,
    devices: Vec<Arc<Device>>,
    runtime: Arc<RuntimeState>,
    registry: Arc<ResourceRegistry>,
    sharing: Mutex<Option<SharingTarget>>,
    allocated: Arc<AtomicU64>,
}

impl HostContext {
    pub fn new(config: ContextConfig) -> HostContext {
        let config = config.sanitized();
        let runtime = runtime_state::init();
        let device = discover(0);
        let whitelisted = config.device_whitelist.is_empty()
            || config.device_whitelist.iter().any(|entry| {
                let entry = entry.to_lowercase();
                device.name.to_lowercase().contains(&entry) || entry == "host" || entry == "cpu"
            });
        let devices = if whitelisted {
            logwise::info_sync!(
                "host: {device} with {units} threads",
                device = device.to_string(),
                units = device.compute_units
            );
            vec![Arc::new(device)]
        } else {
            logwise::warn_sync!(
                "host: {device} is not whitelisted",
                device = device.to_string()
            );
            Vec::new()
        };
        HostContext {
            config: Arc::new(config),
            devices,
            runtime,
            registry: Arc::new(ResourceRegistry::default()),
            sharing: Mutex::new(None),
            allocated: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub(crate) fn allocated(&self) -> &Arc<AtomicU64> {
        &self.allocated
    }

    fn normalize(&self, flags: MemoryFlags, operation: &'static str) -> MemoryFlags {
        let defaults = self.config.flags.flag_defaults(false);
        self.config
            .flags
            .restrict(flags.normalize_logged(defaults, operation, PlatformType::Host))
    }

    fn sharing_target(&self, flags: MemoryFlags) -> Result<Option<(SharingKind, SharingTarget)>, Error> {
        let Some(kind) = SharingKind::from_flags(flags) else {
            return Ok(None);
        };
        let target = self.sharing.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match target {
            Some(target) if target.context.platform_type() == kind.platform() => Ok(Some((kind, target))),
            _ => Err(Error::invalid(format!(
                "{kind:?} sharing needs an attached {platform} context",
                platform = kind.platform()
            ))),
        }
    }

    fn buffer(
        &self,
        queue: &dyn Queue,
        size: usize,
        flags: MemoryFlags,
        host: Option<HostSpan>,
        initial: Option<&[u8]>,
    ) -> Result<Arc<dyn Buffer>, Error> {
        const OP: &str = "context::create_buffer";
        check_queue(self, queue, OP)?;
        let flags = self.normalize(flags, OP);
        let result = (|| {
            if size == 0 {
                return Err(Error::invalid("buffer size must be non-zero"));
            }
            let sharing = match self.sharing_target(flags)? {
                None => None,
                Some((kind, target)) => {
                    let secondary = target.context.create_buffer(
                        target.queue.as_ref(),
                        size,
                        MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE,
                    )?;
                    Some(SharingState::new(kind, secondary, target.queue.clone(), flags))
                }
            };
            let buffer: Arc<dyn Buffer> = HostBuffer::new(BufferRequest {
                device: queue.device().clone(),
                size,
                flags,
                host,
                initial,
                registry: &self.registry,
                allocated: &self.allocated,
                sharing,
            })?;
            Ok(buffer)
        })();
        result.map_err(|e| report(OP, PlatformType::Host, e))
    }

    fn image(
        &self,
        queue: &dyn Queue,
        image_type: ImageType,
        extent: [u32; 4],
        flags: MemoryFlags,
        host: Option<HostSpan>,
        initial: Option<&[u8]>,
    ) -> Result<Arc<dyn Image>, Error> {
        const OP: &str = "context::create_image";
        check_queue(self, queue, OP)?;
        let flags = self.normalize(flags, OP);
        let result = (|| {
            let sharing = match self.sharing_target(flags)? {
                None => None,
                Some((kind, target)) => {
                    let secondary = target.context.create_image(
                        target.queue.as_ref(),
                        image_type,
                        extent,
                        MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE,
                    )?;
                    Some(SharingState::new(kind, secondary, target.queue.clone(), flags))
                }
            };
            let image: Arc<dyn Image> = HostImage::new(
                ImageRequest {
                    device: queue.device().clone(),
                    image_type,
                    extent,
                    flags,
                    host,
                    initial,
                    samplers: self.runtime.sampler_table(),
                    registry: &self.registry,
                    allocated: &self.allocated,
                    sharing,
                },
                queue,
            )?;
            Ok(image)
        })();
        result.map_err(|e| report(OP, PlatformType::Host, e))
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        runtime_state::teardown();
    }
}

impl Context for HostContext {
    fn platform_type(&self) -> PlatformType {
        PlatformType::Host
    }

    fn is_supported(&self) -> bool {
        !self.devices.is_empty()
    }

    fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    fn create_queue(&self, device: &Arc<Device>) -> Result<Arc<dyn Queue>, Error> {
        ensure_supported(self, "context::create_queue")?;
        if !self.devices.iter().any(|d| **d == **device) {
            return Err(report(
                "context::create_queue",
                PlatformType::Host,
                Error::invalid(format!("{device} does not belong to this context")),
            ));
        }
        Ok(Arc::new(HostQueue::new(device.clone(), QueueType::All, self.config.clone())))
    }

    fn create_compute_queue(&self, device: &Arc<Device>) -> Result<Arc<dyn Queue>, Error> {
        ensure_supported(self, "context::create_compute_queue")?;
        if !self.devices.iter().any(|d| **d == **device) {
            return Err(report(
                "context::create_compute_queue",
                PlatformType::Host,
                Error::invalid(format!("{device} does not belong to this context")),
            ));
        }
        Ok(Arc::new(HostQueue::new(device.clone(), QueueType::Compute, self.config.clone())))
    }

    fn create_buffer(&self, queue: &dyn Queue, size: usize, flags: MemoryFlags) -> Result<Arc<dyn Buffer>, Error> {
        self.buffer(queue, size, flags, None, None)
    }

    fn create_buffer_with_data(
        &self,
        queue: &dyn Queue,
        data: &[u8],
        flags: MemoryFlags,
    ) -> Result<Arc<dyn Buffer>, Error> {
        self.buffer(queue, data.len(), flags, None, Some(data))
    }

    unsafe fn create_buffer_with_host_memory(
        &self,
        queue: &dyn Queue,
        host: HostSpan,
        flags: MemoryFlags,
    ) -> Result<Arc<dyn Buffer>, Error> {
        self.buffer(queue, host.len(), flags, Some(host), None)
    }

    fn create_image(
        &self,
        queue: &dyn Queue,
        image_type: ImageType,
        extent: [u32; 4],
        flags: MemoryFlags,
    ) -> Result<Arc<dyn Image>, Error> {
        self.image(queue, image_type, extent, flags, None, None)
    }

    fn create_image_with_data(
        &self,
        queue: &dyn Queue,
        image_type: ImageType,
        extent: [u32; 4],
        data: &[u8],
        flags: MemoryFlags,
    ) -> Result<Arc<dyn Image>, Error> {
        self.image(queue, image_type, extent, flags, None, Some(data))
    }

    unsafe fn create_image_with_host_memory(
        &self,
        queue: &dyn Queue,
        image_type: ImageType,
        extent: [u32; 4],
        host: HostSpan,
        flags: MemoryFlags,
    ) -> Result<Arc<dyn Image>, Error> {
        self.image(queue, image_type, extent, flags, Some(host), None)
    }

    fn create_program(&self, source: ProgramSource) -> Result<Arc<dyn Program>, Error> {
        ensure_supported(self, "context::create_program")?;
        HostProgram::from_source(self, source)
            .map(|program| Arc::new(program) as Arc<dyn Program>)
            .map_err(|e| report("context::create_program", PlatformType::Host, e))
    }

    fn create_fence(&self, queue: &dyn Queue) -> Result<Arc<dyn Fence>, Error> {
        check_queue(self, queue, "context::create_fence")?;
        Ok(Arc::new(TimelineFence::new(PlatformType::Host)))
    }

    fn create_graphics_pipeline(
        &self,
        _description: RenderPipelineDescription,
    ) -> Result<Arc<dyn GraphicsPipeline>, Error> {
        ensure_supported(self, "context::create_graphics_pipeline")?;
        Err(report(
            "context::create_graphics_pipeline",
            PlatformType::Host,
            Error::unsupported("rendering on Host-Compute"),
        ))
    }

    fn create_renderer(
        &self,
        _queue: &dyn Queue,
        _pipeline: &Arc<dyn GraphicsPipeline>,
        _pass: RenderPassDescription,
    ) -> Result<Box<dyn Renderer>, Error> {
        ensure_supported(self, "context::create_renderer")?;
        Err(report(
            "context::create_renderer",
            PlatformType::Host,
            Error::unsupported("rendering on Host-Compute"),
        ))
    }

    fn memory_usage(&self, device: &Device) -> MemoryUsage {
        let allocated = self.allocated.load(Ordering::Relaxed);
        MemoryUsage {
            global_used: used_memory().unwrap_or(allocated).min(device.global_mem_size),
            global_total: device.global_mem_size,
            allocated,
        }
    }

    fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    fn attach_sharing_context(&self, context: Arc<dyn Context>, queue: Arc<dyn Queue>) -> Result<(), Error> {
        if !matches!(context.platform_type(), PlatformType::Vulkan | PlatformType::Metal) {
            return Err(report(
                "context::attach_sharing_context",
                PlatformType::Host,
                Error::invalid(format!("can not share memory with {}", context.platform_type())),
            ));
        }
        *self.sharing.lock().unwrap_or_else(|p| p.into_inner()) = Some(SharingTarget { context, queue });
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
