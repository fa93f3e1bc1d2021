// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Contexts for platforms this build can not drive.

use std::any::Any;
use std::sync::Arc;

use crate::context::{Context, MemoryUsage, ResourceRegistry, ensure_supported};
use crate::device::{Device, PlatformType};
use crate::error::Error;
use crate::fence::Fence;
use crate::image_type::ImageType;
use crate::memory::{Buffer, HostSpan, Image};
use crate::memory_flags::MemoryFlags;
use crate::pipeline_description::RenderPipelineDescription;
use crate::program::{Program, ProgramSource};
use crate::queue::Queue;
use crate::render::{GraphicsPipeline, RenderPassDescription, Renderer};

/// A context without devices; every factory fails with [Error::ContextUnsupported].
#[derive(Debug)]
pub struct UnsupportedContext {
    platform: PlatformType,
    registry: Arc<ResourceRegistry>,
}

impl UnsupportedContext {
    pub fn new(platform: PlatformType) -> UnsupportedContext {
        logwise::warn_sync!(
            "{platform} is not available in this build",
            platform = platform.to_string()
        );
        UnsupportedContext {
            platform,
            registry: Arc::new(ResourceRegistry::default()),
        }
    }
}

impl Context for UnsupportedContext {
    fn platform_type(&self) -> PlatformType {
        self.platform
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn devices(&self) -> &[Arc<Device>] {
        &[]
    }

    fn create_queue(&self, _device: &Arc<Device>) -> Result<Arc<dyn Queue>, Error> {
        ensure_supported(self, "context::create_queue")?;
        Err(Error::ContextUnsupported)
    }

    fn create_buffer(&self, _queue: &dyn Queue, _size: usize, _flags: MemoryFlags) -> Result<Arc<dyn Buffer>, Error> {
        ensure_supported(self, "context::create_buffer")?;
        Err(Error::ContextUnsupported)
    }

    fn create_buffer_with_data(
        &self,
        _queue: &dyn Queue,
        _data: &[u8],
        _flags: MemoryFlags,
    ) -> Result<Arc<dyn Buffer>, Error> {
        ensure_supported(self, "context::create_buffer")?;
        Err(Error::ContextUnsupported)
    }

    unsafe fn create_buffer_with_host_memory(
        &self,
        _queue: &dyn Queue,
        _host: HostSpan,
        _flags: MemoryFlags,
    ) -> Result<Arc<dyn Buffer>, Error> {
        ensure_supported(self, "context::create_buffer")?;
        Err(Error::ContextUnsupported)
    }

    fn create_image(
        &self,
        _queue: &dyn Queue,
        _image_type: ImageType,
        _extent: [u32; 4],
        _flags: MemoryFlags,
    ) -> Result<Arc<dyn Image>, Error> {
        ensure_supported(self, "context::create_image")?;
        Err(Error::ContextUnsupported)
    }

    fn create_image_with_data(
        &self,
        _queue: &dyn Queue,
        _image_type: ImageType,
        _extent: [u32; 4],
        _data: &[u8],
        _flags: MemoryFlags,
    ) -> Result<Arc<dyn Image>, Error> {
        ensure_supported(self, "context::create_image")?;
        Err(Error::ContextUnsupported)
    }

    unsafe fn create_image_with_host_memory(
        &self,
        _queue: &dyn Queue,
        _image_type: ImageType,
        _extent: [u32; 4],
        _host: HostSpan,
        _flags: MemoryFlags,
    ) -> Result<Arc<dyn Image>, Error> {
        ensure_supported(self, "context::create_image")?;
        Err(Error::ContextUnsupported)
    }

    fn create_program(&self, _source: ProgramSource) -> Result<Arc<dyn Program>, Error> {
        ensure_supported(self, "context::create_program")?;
        Err(Error::ContextUnsupported)
    }

    fn create_fence(&self, _queue: &dyn Queue) -> Result<Arc<dyn Fence>, Error> {
        ensure_supported(self, "context::create_fence")?;
        Err(Error::ContextUnsupported)
    }

    fn create_graphics_pipeline(
        &self,
        _description: RenderPipelineDescription,
    ) -> Result<Arc<dyn GraphicsPipeline>, Error> {
        ensure_supported(self, "context::create_graphics_pipeline")?;
        Err(Error::ContextUnsupported)
    }

    fn create_renderer(
        &self,
        _queue: &dyn Queue,
        _pipeline: &Arc<dyn GraphicsPipeline>,
        _pass: RenderPassDescription,
    ) -> Result<Box<dyn Renderer>, Error> {
        ensure_supported(self, "context::create_renderer")?;
        Err(Error::ContextUnsupported)
    }

    fn memory_usage(&self, _device: &Device) -> MemoryUsage {
        MemoryUsage::default()
    }

    fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    fn attach_sharing_context(&self, _context: Arc<dyn Context>, _queue: Arc<dyn Queue>) -> Result<(), Error> {
        ensure_supported(self, "context::attach_sharing_context")?;
        Err(Error::ContextUnsupported)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
