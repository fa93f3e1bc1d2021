// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! One wgpu adapter bound to a logical device, plus the thread that polls it.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use wgpu::{PollType, Trace};

use crate::device::{Device, DeviceFeatures, DeviceType, PlatformType, Vendor};
use crate::error::Error;
use crate::fence::{SignalFence, WaitFence, signal_all, wait_all};
use crate::program::SpecializationCache;
use crate::queue::CompletionHandler;

/// Optional wgpu features we turn on whenever the adapter has them.
fn wanted_features() -> wgpu::Features {
    wgpu::Features::PUSH_CONSTANTS
        | wgpu::Features::SUBGROUP
        | wgpu::Features::SHADER_F64
        | wgpu::Features::BUFFER_BINDING_ARRAY
        | wgpu::Features::TEXTURE_BINDING_ARRAY
        | wgpu::Features::STORAGE_RESOURCE_BINDING_ARRAY
        | wgpu::Features::MULTIVIEW
        | wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES
}

/// Largest push-constant block used for inline parameters.
const MAX_INLINE_BLOCK: u32 = 128;

/// Describes `adapter` as device `index` of a `platform` context.
pub(crate) fn describe(adapter: &wgpu::Adapter, platform: PlatformType, index: u32) -> Device {
    let info = adapter.get_info();
    let limits = adapter.limits();
    let features = adapter.features();
    let mut device = Device::template(platform, index);
    device.device_type = match info.device_type {
        wgpu::DeviceType::IntegratedGpu => DeviceType::IntegratedGpu,
        wgpu::DeviceType::DiscreteGpu => DeviceType::DiscreteGpu,
        wgpu::DeviceType::VirtualGpu => DeviceType::Virtual,
        wgpu::DeviceType::Cpu => DeviceType::Cpu,
        wgpu::DeviceType::Other => DeviceType::Other,
    };
    device.vendor = Vendor::from_pci_id(info.vendor);
    device.name = info.name.clone();
    device.vendor_name = format!("{:?}", device.vendor);
    device.driver_version = format!("{} {}", info.driver, info.driver_info)
        .trim()
        .to_string();
    if limits.min_subgroup_size != 0 {
        device.simd_range = (limits.min_subgroup_size, limits.max_subgroup_size.max(limits.min_subgroup_size));
        device.simd_width = limits.min_subgroup_size;
    }
    device.global_mem_size = limits.max_buffer_size;
    device.max_mem_alloc = limits.max_buffer_size;
    device.local_mem_size = u64::from(limits.max_compute_workgroup_storage_size);
    device.constant_mem_size = u64::from(limits.max_uniform_buffer_binding_size);
    device.max_total_local_size = limits.max_compute_invocations_per_workgroup;
    device.max_local_size = [
        limits.max_compute_workgroup_size_x,
        limits.max_compute_workgroup_size_y,
        limits.max_compute_workgroup_size_z,
    ];
    device.max_work_groups = [limits.max_compute_workgroups_per_dimension; 3];
    device.max_image_1d_dim = limits.max_texture_dimension_1d;
    device.max_image_2d_dim = [limits.max_texture_dimension_2d; 2];
    device.max_image_3d_dim = [limits.max_texture_dimension_3d; 3];
    device.max_image_cube_dim = limits.max_texture_dimension_2d;
    if features.contains(wgpu::Features::PUSH_CONSTANTS) {
        device.max_inline_uniform_block_size = limits.max_push_constant_size.min(MAX_INLINE_BLOCK);
    }
    device.features = DeviceFeatures::IMAGES
        | DeviceFeatures::IMAGE_MIP_MAPS
        | DeviceFeatures::IMAGE_MIP_MAP_WRITE
        | DeviceFeatures::IMAGE_CUBE
        | DeviceFeatures::IMAGE_DEPTH
        | DeviceFeatures::IMAGE_MSAA
        | DeviceFeatures::RENDERING
        | DeviceFeatures::INDIRECT_COMPUTE
        | DeviceFeatures::INDIRECT_RENDER
        | DeviceFeatures::ARGUMENT_BUFFERS
        | DeviceFeatures::SOFT_PRINTF;
    if features.contains(wgpu::Features::SUBGROUP) {
        device.features |= DeviceFeatures::SUB_GROUPS;
    }
    if features.contains(wgpu::Features::SHADER_F64) {
        device.features |= DeviceFeatures::DOUBLE;
    }
    if matches!(device.device_type, DeviceType::IntegratedGpu | DeviceType::Cpu) {
        device.features |= DeviceFeatures::UNIFIED_MEMORY;
    }
    device
}

/// GPU resources of one device.
///
/// Readbacks and completion callbacks need the device to be polled; a dedicated thread does
/// that whenever [BoundDevice::set_needs_poll] is called.
#[derive(Debug)]
pub(crate) struct BoundDevice {
    info: Arc<Device>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    features: wgpu::Features,
    poll_thread: Option<JoinHandle<()>>,
    poll_trigger: Option<Sender<()>>,
    /// Minify pipelines for mip-map generation, per storage format.
    pub(crate) minify: SpecializationCache<wgpu::TextureFormat, wgpu::ComputePipeline>,
}

impl BoundDevice {
    pub(crate) fn bind(adapter: wgpu::Adapter, info: Arc<Device>) -> Result<Self, Error> {
        let features = adapter.features() & wanted_features();
        let descriptor = wgpu::DeviceDescriptor {
            label: Some(info.name.as_str()),
            required_features: features,
            required_limits: adapter.limits(),
            memory_hints: Default::default(),
            trace: Trace::Off,
        };
        let (device, queue) = test_executors::sleep_on(adapter.request_device(&descriptor))?;
        let platform = info.platform;
        device.on_uncaptured_error(Box::new(move |error| {
            logwise::error_sync!(
                "wgpu [{platform}]: uncaptured error: {error}",
                platform = platform.to_string(),
                error = error.to_string()
            );
        }));

        let poll_device = device.clone();
        let (poll_trigger, poll_receiver): (Sender<()>, Receiver<()>) = mpsc::channel();
        let poll_thread = thread::Builder::new()
            .name("floor_wgpu_poll".to_string())
            .spawn(move || {
                // exits once the sender is dropped
                while poll_receiver.recv().is_ok() {
                    while poll_receiver.try_recv().is_ok() {}
                    if let Err(e) = poll_device.poll(PollType::Wait) {
                        logwise::warn_sync!("wgpu poll failed: {error}", error = e.to_string());
                    }
                }
            })
            .map_err(Error::from)?;
        Ok(BoundDevice {
            info,
            device,
            queue,
            features,
            poll_thread: Some(poll_thread),
            poll_trigger: Some(poll_trigger),
            minify: SpecializationCache::default(),
        })
    }

    pub(crate) fn info(&self) -> &Arc<Device> {
        &self.info
    }

    pub(crate) fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub(crate) fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub(crate) fn has_feature(&self, feature: wgpu::Features) -> bool {
        self.features.contains(feature)
    }

    /// Signal the polling thread that GPU work may be ready
    pub(crate) fn set_needs_poll(&self) {
        if let Some(trigger) = &self.poll_trigger {
            let _ = trigger.send(());
        }
    }

    /// Blocks until the device is idle.
    pub(crate) fn wait_idle(&self) -> Result<(), Error> {
        let interval = logwise::perfwarn_begin!("floor::wgpu::wait_idle");
        self.device.poll(PollType::Wait)?;
        drop(interval);
        Ok(())
    }

    pub(crate) fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Submits `commands` behind `wait` and signals `signal` once the device finished them.
    ///
    /// Waits happen on the submitting thread: every fence of this crate is a host timeline.
    pub(crate) fn submit(
        &self,
        commands: wgpu::CommandBuffer,
        wait: &[WaitFence],
        signal: Vec<SignalFence>,
        completion: Option<CompletionHandler>,
        blocking: bool,
    ) {
        wait_all(wait);
        self.queue.submit([commands]);
        let (sender, done) = if blocking {
            let (s, r) = r#continue::continuation();
            (Some(s), Some(r))
        } else {
            (None, None)
        };
        if !signal.is_empty() || completion.is_some() || sender.is_some() {
            self.queue.on_submitted_work_done(move || {
                signal_all(&signal);
                if let Some(completion) = completion {
                    completion();
                }
                if let Some(sender) = sender {
                    sender.send(());
                }
            });
        }
        self.set_needs_poll();
        if let Some(done) = done {
            let interval = logwise::perfwarn_begin!("floor::wgpu::submit blocking");
            test_executors::sleep_on(done);
            drop(interval);
        }
    }

    /// A bare storage buffer holding `data`, for bindings the caller never sees.
    pub(crate) fn storage_with_data(&self, data: &[u8], label: &str) -> Result<wgpu::Buffer, Error> {
        let size = (data.len().max(4).div_ceil(4) * 4) as u64;
        crate::imp::wgpu::error::scoped(&self.device, || {
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: true,
            });
            buffer.slice(..).get_mapped_range_mut()[..data.len()].copy_from_slice(data);
            buffer.unmap();
            buffer
        })
    }

    /// Copies `[offset, offset + size)` of `source` to the host.
    ///
    /// `offset` and `size` must be multiples of [wgpu::COPY_BUFFER_ALIGNMENT].
    pub(crate) fn read_buffer(&self, source: &wgpu::Buffer, offset: u64, size: u64) -> Result<Vec<u8>, Error> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("floor readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.encoder("floor readback");
        encoder.copy_buffer_to_buffer(source, offset, &staging, 0, size);
        self.queue.submit([encoder.finish()]);
        self.map_read(&staging, size)
    }

    /// Maps `staging` (a `MAP_READ` buffer) and copies its first `size` bytes out.
    pub(crate) fn map_read(&self, staging: &wgpu::Buffer, size: u64) -> Result<Vec<u8>, Error> {
        let (sender, mapped) = r#continue::continuation();
        staging
            .slice(0..size)
            .map_async(wgpu::MapMode::Read, move |result| sender.send(result));
        self.set_needs_poll();
        let interval = logwise::perfwarn_begin!("floor::wgpu::map_read");
        test_executors::sleep_on(mapped)?;
        drop(interval);
        let bytes = staging.slice(0..size).get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }
}

impl Drop for BoundDevice {
    fn drop(&mut self) {
        // closing the channel stops the thread after its current poll
        self.poll_trigger.take();
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
    }
}
