// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The wgpu context: Vulkan or Metal adapters as floor devices.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::ContextConfig;
use crate::context::{Context, MemoryUsage, ResourceRegistry, check_queue, ensure_supported};
use crate::device::{Device, DeviceFeatures, PlatformType};
use crate::error::{Error, report};
use crate::fence::{Fence, TimelineFence};
use crate::image_type::ImageType;
use crate::imp::wgpu::bound_device::{BoundDevice, describe};
use crate::imp::wgpu::buffer::{BufferRequest, WgpuBuffer};
use crate::imp::wgpu::function::Allocator;
use crate::imp::wgpu::image::{ImageRequest, WgpuImage};
use crate::imp::wgpu::program::WgpuProgram;
use crate::imp::wgpu::queue::WgpuQueue;
use crate::imp::wgpu::render::{WgpuGraphicsPipeline, WgpuRenderer};
use crate::memory::{Buffer, HostSpan, Image};
use crate::memory_flags::MemoryFlags;
use crate::pipeline_description::RenderPipelineDescription;
use crate::program::{Program, ProgramSource};
use crate::queue::{Queue, QueueType};
use crate::render::{GraphicsPipeline, RenderPassDescription, Renderer};

fn backends(platform: PlatformType) -> Option<wgpu::Backends> {
    match platform {
        PlatformType::Vulkan => Some(wgpu::Backends::VULKAN),
        PlatformType::Metal => Some(wgpu::Backends::METAL),
        _ => None,
    }
}

fn whitelisted(whitelist: &[String], device: &Device) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    let name = device.name.to_lowercase();
    let vendor = device.vendor_name.to_lowercase();
    whitelist.iter().any(|entry| {
        let entry = entry.to_lowercase();
        name.contains(&entry) || vendor.contains(&entry)
    })
}

#[derive(Debug)]
pub struct WgpuContext {
    platform: PlatformType,
    config: Arc<ContextConfig>,
    devices: Vec<Arc<Device>>,
    bound: Vec<Arc<BoundDevice>>,
    registry: Arc<ResourceRegistry>,
    allocated: Arc<AtomicU64>,
}

impl WgpuContext {
    /// Enumerates the adapters of `platform` (Vulkan or Metal).
    ///
    /// The context is unsupported when no adapter can be bound.
    pub fn new(platform: PlatformType, config: ContextConfig) -> WgpuContext {
        let config = config.sanitized();
        let mut devices = Vec::new();
        let mut bound = Vec::new();
        match backends(platform) {
            None => logwise::error_sync!(
                "wgpu: {platform} is not a wgpu backend",
                platform = platform.to_string()
            ),
            Some(backends) => {
                let mut descriptor = wgpu::InstanceDescriptor::from_env_or_default();
                descriptor.backends &= backends;
                let instance = wgpu::Instance::new(&descriptor);
                for adapter in instance.enumerate_adapters(backends) {
                    let info = describe(&adapter, platform, devices.len() as u32);
                    if !whitelisted(&config.device_whitelist, &info) {
                        logwise::info_sync!(
                            "wgpu: skipping {device}, not whitelisted",
                            device = info.to_string()
                        );
                        continue;
                    }
                    let info = Arc::new(info);
                    match BoundDevice::bind(adapter, info.clone()) {
                        Ok(device) => {
                            logwise::info_sync!(
                                "wgpu: {device} ({driver})",
                                device = info.to_string(),
                                driver = info.driver_version.clone()
                            );
                            devices.push(info);
                            bound.push(Arc::new(device));
                        }
                        Err(e) => logwise::warn_sync!(
                            "wgpu: could not open {device}: {error}",
                            device = info.to_string(),
                            error = e.to_string()
                        ),
                    }
                }
            }
        }
        if devices.is_empty() {
            logwise::warn_sync!("wgpu: no usable {platform} device", platform = platform.to_string());
        }
        WgpuContext {
            platform,
            config: Arc::new(config),
            devices,
            bound,
            registry: Arc::new(ResourceRegistry::default()),
            allocated: Arc::new(AtomicU64::new(0)),
        }
    }

    fn bound_for(&self, device: &Device) -> Option<&Arc<BoundDevice>> {
        self.bound.iter().find(|b| **b.info() == *device)
    }

    fn normalize(&self, device: &Device, flags: MemoryFlags, operation: &'static str) -> Result<MemoryFlags, Error> {
        let defaults = self
            .config
            .flags
            .flag_defaults(device.features.contains(DeviceFeatures::UNIFIED_MEMORY));
        let flags = self
            .config
            .flags
            .restrict(flags.normalize_logged(defaults, operation, self.platform));
        if flags.intersects(MemoryFlags::ANY_SHARING) {
            return Err(Error::invalid("memory sharing is only available to Host-Compute objects"));
        }
        Ok(flags)
    }

    fn queue(&self, device: &Arc<Device>, queue_type: QueueType, operation: &'static str) -> Result<Arc<dyn Queue>, Error> {
        ensure_supported(self, operation)?;
        let Some(bound) = self.bound_for(device) else {
            return Err(report(
                operation,
                self.platform,
                Error::invalid(format!("{device} does not belong to this context")),
            ));
        };
        Ok(Arc::new(WgpuQueue::new(bound.clone(), queue_type, self.config.clone())))
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
        let queue = WgpuQueue::downcast(queue, OP)?;
        let result = (|| {
            let flags = self.normalize(queue.device(), flags, OP)?;
            if size == 0 {
                return Err(Error::invalid("buffer size must be non-zero"));
            }
            let buffer: Arc<dyn Buffer> = WgpuBuffer::new(BufferRequest {
                bound: queue.bound().clone(),
                size,
                flags,
                host,
                initial,
                registry: &self.registry,
                allocated: &self.allocated,
            })?;
            Ok(buffer)
        })();
        result.map_err(|e| report(OP, self.platform, e))
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
        let queue = WgpuQueue::downcast(queue, OP)?;
        let result = (|| {
            let flags = self.normalize(queue.device(), flags, OP)?;
            let image: Arc<dyn Image> = WgpuImage::new(ImageRequest {
                bound: queue.bound().clone(),
                image_type,
                extent,
                flags,
                host,
                initial,
                registry: &self.registry,
                allocated: &self.allocated,
            })?;
            Ok(image)
        })();
        result.map_err(|e| report(OP, self.platform, e))
    }
}

impl Context for WgpuContext {
    fn platform_type(&self) -> PlatformType {
        self.platform
    }

    fn is_supported(&self) -> bool {
        !self.devices.is_empty()
    }

    fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    fn create_queue(&self, device: &Arc<Device>) -> Result<Arc<dyn Queue>, Error> {
        self.queue(device, QueueType::All, "context::create_queue")
    }

    fn create_compute_queue(&self, device: &Arc<Device>) -> Result<Arc<dyn Queue>, Error> {
        self.queue(device, QueueType::Compute, "context::create_compute_queue")
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
        const OP: &str = "context::create_program";
        ensure_supported(self, OP)?;
        let allocator = Allocator {
            registry: self.registry.clone(),
            allocated: self.allocated.clone(),
        };
        WgpuProgram::new(self.platform, &self.bound, source, allocator)
            .map(|program| Arc::new(program) as Arc<dyn Program>)
            .map_err(|e| report(OP, self.platform, e))
    }

    fn create_fence(&self, queue: &dyn Queue) -> Result<Arc<dyn Fence>, Error> {
        check_queue(self, queue, "context::create_fence")?;
        Ok(Arc::new(TimelineFence::new(self.platform)))
    }

    fn create_graphics_pipeline(
        &self,
        description: RenderPipelineDescription,
    ) -> Result<Arc<dyn GraphicsPipeline>, Error> {
        const OP: &str = "context::create_graphics_pipeline";
        ensure_supported(self, OP)?;
        WgpuGraphicsPipeline::new(self.platform, &self.bound, description)
            .map(|pipeline| Arc::new(pipeline) as Arc<dyn GraphicsPipeline>)
            .map_err(|e| report(OP, self.platform, e))
    }

    fn create_renderer(
        &self,
        queue: &dyn Queue,
        pipeline: &Arc<dyn GraphicsPipeline>,
        pass: RenderPassDescription,
    ) -> Result<Box<dyn Renderer>, Error> {
        const OP: &str = "context::create_renderer";
        check_queue(self, queue, OP)?;
        let queue = WgpuQueue::downcast(queue, OP)?;
        WgpuRenderer::new(
            queue.bound().clone(),
            pipeline.clone(),
            pass,
            queue.config().printf_buffer_size,
        )
        .map(|renderer| Box::new(renderer) as Box<dyn Renderer>)
        .map_err(|e| report(OP, self.platform, e))
    }

    fn memory_usage(&self, device: &Device) -> MemoryUsage {
        let allocated = self.allocated.load(Ordering::Relaxed);
        MemoryUsage {
            global_used: allocated.min(device.global_mem_size),
            global_total: device.global_mem_size,
            allocated,
        }
    }

    fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    fn attach_sharing_context(&self, context: Arc<dyn Context>, _queue: Arc<dyn Queue>) -> Result<(), Error> {
        Err(report(
            "context::attach_sharing_context",
            self.platform,
            Error::invalid(format!(
                "{} contexts are sharing targets, not sources ({} was offered)",
                self.platform,
                context.platform_type()
            )),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_matches_name_or_vendor() {
        let mut device = Device::template(PlatformType::Vulkan, 0);
        device.name = "AMD Radeon RX 7900".to_string();
        device.vendor_name = "Amd".to_string();
        assert!(whitelisted(&[], &device));
        assert!(whitelisted(&["radeon".to_string()], &device));
        assert!(whitelisted(&["AMD".to_string()], &device));
        assert!(!whitelisted(&["nvidia".to_string()], &device));
    }

    #[test]
    fn only_vulkan_and_metal() {
        assert_eq!(backends(PlatformType::Metal), Some(wgpu::Backends::METAL));
        assert_eq!(backends(PlatformType::Host), None);
    }
}
