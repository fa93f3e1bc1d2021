// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Functions of the wgpu backend: bind-group layouts, argument binding and compute launches.
//!
//! Kernels without a required local size must declare their work-group size as pipeline
//! overrides `@id(0)`, `@id(1)` and `@id(2)`; every chosen local size gets its own pipeline.

use std::any::Any;
use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::args::{Arg, check_args};
use crate::argument_buffer::{ArgumentBuffer, ArgumentEncoder, create_argument_buffer_internal};
use crate::binding::{BindingLayout, BindingSlot};
use crate::binding::slots::CONSTANT_RING_SIZE;
use crate::context::ResourceRegistry;
use crate::device::{Device, PlatformType};
use crate::error::{Error, report};
use crate::fence::signal_all;
use crate::function_info::{FunctionInfo, FunctionType};
use crate::imp::wgpu::bound_device::BoundDevice;
use crate::imp::wgpu::buffer::{BufferRequest, WgpuBuffer};
use crate::imp::wgpu::error::scoped;
use crate::imp::wgpu::image::WgpuImage;
use crate::imp::wgpu::pixel_format::{DeviceFormat, sample_type, storage_access, view_dimension};
use crate::imp::wgpu::queue::WgpuQueue;
use crate::memory::{Buffer, Image};
use crate::memory_flags::MemoryFlags;
use crate::program::{Function, FunctionEntry, SpecializationCache, SpecializationKey};
use crate::queue::{ExecutionParams, Queue, group_count, normalize_global, select_local_size};
use crate::soft_printf::{self, PrintfBuffer};

/// Uniform bindings are sized in whole 16-byte rows.
const UNIFORM_ROW: u32 = 16;

pub(crate) fn uniform_size(size: u32) -> u32 {
    size.div_ceil(UNIFORM_ROW).max(1) * UNIFORM_ROW
}

/// A bound resource, owned so bind groups can be built after argument resolution.
#[derive(Debug, Clone)]
pub(crate) enum Resource {
    Buffer {
        buffer: wgpu::Buffer,
        offset: u64,
        size: Option<NonZeroU64>,
    },
    View(wgpu::TextureView),
}

impl Resource {
    pub(crate) fn whole(buffer: &wgpu::Buffer) -> Resource {
        Resource::Buffer {
            buffer: buffer.clone(),
            offset: 0,
            size: None,
        }
    }

    fn uniform(buffer: &wgpu::Buffer, offset: u32, size: u32) -> Resource {
        Resource::Buffer {
            buffer: buffer.clone(),
            offset: u64::from(offset),
            size: NonZeroU64::new(u64::from(uniform_size(size))),
        }
    }

    fn binding(&self) -> wgpu::BindingResource<'_> {
        match self {
            Resource::Buffer { buffer, offset, size } => wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer,
                offset: *offset,
                size: *size,
            }),
            Resource::View(view) => wgpu::BindingResource::TextureView(view),
        }
    }
}

/// Bind-group entries per group, in binding order.
pub(crate) type GroupEntries = BTreeMap<u32, Vec<(u32, Resource)>>;

/// The wgpu buffer behind `buffer`, checked to live on `bound`.
fn device_buffer<'b>(buffer: &'b dyn Buffer, bound: &Arc<BoundDevice>) -> Result<&'b WgpuBuffer, Error> {
    let buffer = buffer
        .as_any()
        .downcast_ref::<WgpuBuffer>()
        .ok_or_else(|| Error::invalid("argument is not a wgpu buffer"))?;
    if !Arc::ptr_eq(buffer.bound(), bound) {
        return Err(Error::invalid("buffer belongs to another device"));
    }
    Ok(buffer)
}

fn device_image<'i>(image: &'i dyn Image, bound: &Arc<BoundDevice>) -> Result<&'i WgpuImage, Error> {
    let image = image
        .as_any()
        .downcast_ref::<WgpuImage>()
        .ok_or_else(|| Error::invalid("argument is not a wgpu image"))?;
    if !Arc::ptr_eq(image.bound(), bound) {
        return Err(Error::invalid("image belongs to another device"));
    }
    Ok(image)
}

/// Resolves a resource slot (buffers and images) into bind-group entries.
fn resolve_resource(
    slot: &BindingSlot,
    arg: &Arg<'_>,
    bound: &Arc<BoundDevice>,
    out: &mut Vec<(u32, Resource)>,
) -> Result<(), Error> {
    match (slot, arg) {
        (BindingSlot::StorageBuffer { binding, .. }, Arg::Buffer(buffer)) => {
            out.push((*binding, Resource::whole(device_buffer(*buffer, bound)?.raw())));
        }
        (BindingSlot::StorageBuffer { binding, .. }, Arg::BufferArray(buffers)) => {
            for (i, buffer) in buffers.iter().enumerate() {
                out.push((binding + i as u32, Resource::whole(device_buffer(*buffer, bound)?.raw())));
            }
        }
        (BindingSlot::SampledImage { binding, .. }, Arg::Image(image)) => {
            out.push((*binding, Resource::View(device_image(*image, bound)?.view().clone())));
        }
        (BindingSlot::SampledImage { binding, .. }, Arg::ImageArray(images)) => {
            for (i, image) in images.iter().enumerate() {
                out.push((binding + i as u32, Resource::View(device_image(*image, bound)?.view().clone())));
            }
        }
        (BindingSlot::StorageImage { binding, .. }, Arg::Image(image)) => {
            out.push((*binding, storage_view(*image, bound)?));
        }
        (BindingSlot::StorageImage { binding, .. }, Arg::ImageArray(images)) => {
            for (i, image) in images.iter().enumerate() {
                out.push((binding + i as u32, storage_view(*image, bound)?));
            }
        }
        (slot, arg) => {
            return Err(Error::invalid(format!(
                "can not bind a {} to {slot:?}",
                arg.kind_name()
            )));
        }
    }
    Ok(())
}

fn storage_view(image: &dyn Image, bound: &Arc<BoundDevice>) -> Result<Resource, Error> {
    let image = device_image(image, bound)?;
    image
        .storage_view()
        .map(|view| Resource::View(view.clone()))
        .ok_or_else(|| Error::unsupported(format!("{:?} images as writable kernel arguments", image.format())))
}

/// Layout entries of one binding layout's own group.
fn layout_entries(layout: &BindingLayout, visibility: wgpu::ShaderStages) -> Result<Vec<wgpu::BindGroupLayoutEntry>, Error> {
    let mut entries = Vec::new();
    let mut push = |binding: u32, ty: wgpu::BindingType| {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding,
            visibility,
            ty,
            count: None,
        });
    };
    for slot in &layout.slots {
        match slot {
            BindingSlot::Constant { binding, .. } => push(
                *binding,
                wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
            ),
            BindingSlot::StorageBuffer {
                binding,
                count,
                read_only,
            } => {
                for i in 0..*count {
                    push(
                        binding + i,
                        wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage { read_only: *read_only },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                    );
                }
            }
            BindingSlot::SampledImage {
                binding,
                count,
                image_type,
            } => {
                for i in 0..*count {
                    push(
                        binding + i,
                        wgpu::BindingType::Texture {
                            sample_type: sample_type(*image_type),
                            view_dimension: view_dimension(*image_type),
                            multisampled: image_type.is_msaa(),
                        },
                    );
                }
            }
            BindingSlot::StorageImage {
                binding,
                count,
                image_type,
                access,
            } => {
                let format = DeviceFormat::of(*image_type)?.format;
                let view_dimension = match view_dimension(*image_type) {
                    wgpu::TextureViewDimension::Cube | wgpu::TextureViewDimension::CubeArray => {
                        wgpu::TextureViewDimension::D2Array
                    }
                    other => other,
                };
                for i in 0..*count {
                    push(
                        binding + i,
                        wgpu::BindingType::StorageTexture {
                            access: storage_access(*access),
                            format,
                            view_dimension,
                        },
                    );
                }
            }
            BindingSlot::PushConstant { .. } | BindingSlot::ArgumentBuffer { .. } | BindingSlot::StageInput => {}
        }
    }
    Ok(entries)
}

fn printf_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// The bind groups one shader stage of a function uses.
#[derive(Debug)]
pub(crate) struct StageBindings {
    pub layout: BindingLayout,
    /// Layouts of groups `layout.group..layout.group_count`.
    pub group_layouts: Vec<wgpu::BindGroupLayout>,
    /// Binding of the printf buffer in the stage's first group.
    pub printf_binding: Option<u32>,
}

impl StageBindings {
    pub(crate) fn new(
        bound: &BoundDevice,
        info: &FunctionInfo,
        base_group: u32,
        inline_max: u32,
        visibility: wgpu::ShaderStages,
    ) -> Result<StageBindings, Error> {
        let layout = BindingLayout::new(info, base_group, inline_max)?;
        if layout.push_constant_size > 0 && !bound.has_feature(wgpu::Features::PUSH_CONSTANTS) {
            return Err(Error::unsupported(format!(
                "push constants of \"{}\" on a device without push constants",
                info.name
            )));
        }
        let printf_binding = info.uses_soft_printf().then_some(layout.binding_count);
        let mut groups: BTreeMap<u32, Vec<wgpu::BindGroupLayoutEntry>> = BTreeMap::new();
        let mut base = layout_entries(&layout, visibility)?;
        if let Some(binding) = printf_binding {
            base.push(printf_entry(binding, visibility));
        }
        groups.insert(base_group, base);
        for slot in &layout.slots {
            if let BindingSlot::ArgumentBuffer { group, layout } = slot {
                groups.insert(*group, layout_entries(layout, visibility)?);
            }
        }
        let group_layouts = scoped(bound.device(), || {
            (base_group..layout.group_count)
                .map(|group| {
                    let entries = groups.get(&group).map(Vec::as_slice).unwrap_or(&[]);
                    bound.device().create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: Some(info.name.as_str()),
                        entries,
                    })
                })
                .collect()
        })?;
        Ok(StageBindings {
            layout,
            group_layouts,
            printf_binding,
        })
    }

    /// Resolves `args` into push-constant bytes and bind-group entries.
    ///
    /// `constants` is the uniform buffer plain data beyond the inline budget goes to.
    pub(crate) fn resolve(
        &self,
        bound: &Arc<BoundDevice>,
        args: &[Arg<'_>],
        constants: Option<&wgpu::Buffer>,
    ) -> Result<ResolvedArgs, Error> {
        let mut resolved = ResolvedArgs {
            push: vec![0u8; self.layout.push_constant_size as usize],
            constants: vec![0u8; self.layout.constant_size as usize],
            groups: GroupEntries::new(),
        };
        for group in self.layout.group..self.layout.group_count {
            resolved.groups.insert(group, Vec::new());
        }
        for (slot, arg) in self.layout.user_slots().zip(args) {
            match (slot, arg) {
                (BindingSlot::PushConstant { offset, .. }, Arg::Data(bytes)) => {
                    let offset = *offset as usize;
                    resolved.push[offset..offset + bytes.len()].copy_from_slice(bytes);
                }
                (BindingSlot::Constant { binding, offset, size }, Arg::Data(bytes)) => {
                    let at = *offset as usize;
                    resolved.constants[at..at + bytes.len()].copy_from_slice(bytes);
                    let buffer = constants.ok_or_else(|| Error::invalid("no constant block for plain data"))?;
                    resolved
                        .group(self.layout.group)
                        .push((*binding, Resource::uniform(buffer, *offset, *size)));
                }
                (BindingSlot::ArgumentBuffer { group, .. }, Arg::ArgumentBuffer(argument_buffer)) => {
                    let entries = argument_entries(argument_buffer, bound)?;
                    resolved.group(*group).extend(entries);
                }
                (slot, arg) => resolve_resource(slot, arg, bound, resolved.group(self.layout.group))?,
            }
        }
        Ok(resolved)
    }

    /// Creates one bind group per layout group from `entries`.
    pub(crate) fn bind_groups(&self, bound: &BoundDevice, entries: &GroupEntries) -> Vec<wgpu::BindGroup> {
        (self.layout.group..self.layout.group_count)
            .zip(&self.group_layouts)
            .map(|(group, layout)| {
                let resources = entries.get(&group).map(Vec::as_slice).unwrap_or(&[]);
                let entries: Vec<wgpu::BindGroupEntry<'_>> = resources
                    .iter()
                    .map(|(binding, resource)| wgpu::BindGroupEntry {
                        binding: *binding,
                        resource: resource.binding(),
                    })
                    .collect();
                bound.device().create_bind_group(&wgpu::BindGroupDescriptor {
                    label: None,
                    layout,
                    entries: &entries,
                })
            })
            .collect()
    }
}

#[derive(Debug)]
pub(crate) struct ResolvedArgs {
    pub push: Vec<u8>,
    pub constants: Vec<u8>,
    pub groups: GroupEntries,
}

impl ResolvedArgs {
    fn group(&mut self, group: u32) -> &mut Vec<(u32, Resource)> {
        self.groups.entry(group).or_default()
    }
}

/// The bind-group entries an argument buffer currently encodes.
fn argument_entries(argument_buffer: &ArgumentBuffer, bound: &Arc<BoundDevice>) -> Result<Vec<(u32, Resource)>, Error> {
    let encoder = argument_buffer
        .encoder()
        .as_any()
        .downcast_ref::<WgpuArgumentEncoder>()
        .ok_or_else(|| Error::invalid("argument buffer was not created by a wgpu function"))?;
    let storage = device_buffer(argument_buffer.storage().as_ref(), bound)?;
    let mut entries: Vec<(u32, Resource)> = encoder
        .layout
        .slots
        .iter()
        .filter_map(|slot| match slot {
            BindingSlot::Constant { binding, offset, size } => {
                Some((*binding, Resource::uniform(storage.raw(), *offset, *size)))
            }
            _ => None,
        })
        .collect();
    entries.extend(encoder.resources.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned());
    Ok(entries)
}

/// Encodes argument buffers: plain data into the storage, resources into a captured list.
#[derive(Debug)]
pub(crate) struct WgpuArgumentEncoder {
    layout: Arc<BindingLayout>,
    bound: Arc<BoundDevice>,
    resources: Mutex<Vec<(u32, Resource)>>,
}

impl ArgumentEncoder for WgpuArgumentEncoder {
    fn storage_size(&self, _layout: &FunctionInfo) -> Result<usize, Error> {
        Ok(uniform_size(self.layout.constant_size) as usize)
    }

    fn encode(&self, queue: &dyn Queue, storage: &dyn Buffer, _layout: &FunctionInfo, args: &[Arg<'_>]) -> Result<(), Error> {
        let mut data = vec![0u8; self.layout.constant_size as usize];
        let mut resources = Vec::new();
        for (slot, arg) in self.layout.user_slots().zip(args) {
            match (slot, arg) {
                (BindingSlot::Constant { offset, .. }, Arg::Data(bytes)) => {
                    let at = *offset as usize;
                    data[at..at + bytes.len()].copy_from_slice(bytes);
                }
                (slot, arg) => resolve_resource(slot, arg, &self.bound, &mut resources)?,
            }
        }
        if !data.is_empty() {
            storage.write_from(queue, &data, 0)?;
        }
        *self.resources.lock().unwrap_or_else(|p| p.into_inner()) = resources;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Round-robin uniform buffers for the per-call constant block.
#[derive(Debug)]
struct ConstantRing {
    buffers: Vec<wgpu::Buffer>,
    next: AtomicUsize,
}

impl ConstantRing {
    fn new(bound: &BoundDevice, size: u32) -> Result<ConstantRing, Error> {
        let buffers = scoped(bound.device(), || {
            (0..CONSTANT_RING_SIZE)
                .map(|_| {
                    bound.device().create_buffer(&wgpu::BufferDescriptor {
                        label: Some("floor constants"),
                        size: u64::from(uniform_size(size)),
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                        mapped_at_creation: false,
                    })
                })
                .collect()
        })?;
        Ok(ConstantRing {
            buffers,
            next: AtomicUsize::new(0),
        })
    }

    fn take(&self) -> &wgpu::Buffer {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.buffers.len();
        &self.buffers[slot]
    }
}

#[derive(Debug)]
struct ComputeState {
    stage: StageBindings,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: SpecializationCache<SpecializationKey, wgpu::ComputePipeline>,
    ring: Option<ConstantRing>,
}

/// A function as compiled for one device.
#[derive(Debug)]
pub(crate) struct DeviceFunction {
    pub device_index: u32,
    pub entry: FunctionEntry,
    pub bound: Arc<BoundDevice>,
    pub module: wgpu::ShaderModule,
    compute: Option<ComputeState>,
}

impl DeviceFunction {
    pub(crate) fn new(bound: Arc<BoundDevice>, entry: FunctionEntry, module: wgpu::ShaderModule) -> Result<Self, Error> {
        let compute = if entry.info.function_type == FunctionType::Kernel {
            let inline_max = bound.info().max_inline_uniform_block_size;
            let stage = StageBindings::new(&bound, &entry.info, 0, inline_max, wgpu::ShaderStages::COMPUTE)?;
            let push_constant_ranges: Vec<wgpu::PushConstantRange> = (stage.layout.push_constant_size > 0)
                .then(|| wgpu::PushConstantRange {
                    stages: wgpu::ShaderStages::COMPUTE,
                    range: 0..stage.layout.push_constant_size,
                })
                .into_iter()
                .collect();
            let pipeline_layout = scoped(bound.device(), || {
                let layouts: Vec<&wgpu::BindGroupLayout> = stage.group_layouts.iter().collect();
                bound.device().create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(entry.info.name.as_str()),
                    bind_group_layouts: &layouts,
                    push_constant_ranges: &push_constant_ranges,
                })
            })?;
            let ring = if stage.layout.uses_constant_block() {
                Some(ConstantRing::new(&bound, stage.layout.constant_size)?)
            } else {
                None
            };
            Some(ComputeState {
                stage,
                pipeline_layout,
                pipelines: SpecializationCache::default(),
                ring,
            })
        } else {
            None
        };
        Ok(DeviceFunction {
            device_index: bound.info().index,
            entry,
            bound,
            module,
            compute,
        })
    }

    fn pipeline(&self, compute: &ComputeState, key: SpecializationKey) -> Result<wgpu::ComputePipeline, Error> {
        compute.pipelines.get_or_try_insert(key, || {
            let info = &self.entry.info;
            let local = key.local_size.map(f64::from);
            let overrides: Vec<(&str, f64)> = match info.required_local_size {
                Some(_) => Vec::new(),
                None => vec![("0", local[0]), ("1", local[1]), ("2", local[2])],
            };
            logwise::trace_sync!(
                "wgpu: specializing \"{name}\" for {local}",
                name = info.name.clone(),
                local = logwise::privacy::LogIt(&key.local_size)
            );
            scoped(self.bound.device(), || {
                self.bound.device().create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(info.name.as_str()),
                    layout: Some(&compute.pipeline_layout),
                    module: &self.module,
                    entry_point: Some(info.name.as_str()),
                    compilation_options: wgpu::PipelineCompilationOptions {
                        constants: &overrides,
                        zero_initialize_workgroup_memory: true,
                    },
                    cache: None,
                })
            })
        })
    }

    /// Records and submits one dispatch; fences and the completion move into the submission.
    fn launch(&self, queue: &WgpuQueue, params: &mut ExecutionParams<'_>) -> Result<(), Error> {
        let info = &self.entry.info;
        let compute = self
            .compute
            .as_ref()
            .ok_or_else(|| Error::invalid(format!("\"{}\" is not a kernel", info.name)))?;
        if params.cooperative {
            return Err(Error::unsupported("cooperative launches on wgpu"));
        }
        check_args(info, &params.args)?;
        let dim = params.execution_dim;
        let global = normalize_global(dim, params.global_work_size)?;
        let local = select_local_size(&self.entry, dim, global, params.local_work_size)?;
        let groups = group_count(global, local)?;
        let key = SpecializationKey {
            local_size: local,
            simd_width: self
                .entry
                .required_simd_width
                .unwrap_or(self.bound.info().simd_width)
                .max(1),
        };
        let pipeline = self.pipeline(compute, key)?;

        let constants = compute.ring.as_ref().map(ConstantRing::take);
        let mut resolved = compute.stage.resolve(&self.bound, &params.args, constants)?;
        if let Some(buffer) = constants {
            self.bound.queue().write_buffer(buffer, 0, &resolved.constants);
        }
        let printf = match compute.stage.printf_binding {
            Some(binding) => {
                let initial = PrintfBuffer::initial_contents(queue.config().printf_buffer_size);
                let buffer = self.bound.storage_with_data(&initial, "floor printf")?;
                resolved
                    .groups
                    .entry(compute.stage.layout.group)
                    .or_default()
                    .push((binding, Resource::whole(&buffer)));
                Some((buffer, initial.len()))
            }
            None => None,
        };
        logwise::trace_sync!(
            "function::execute: {name} global {global} local {local}",
            name = info.name.clone(),
            global = logwise::privacy::LogIt(&global),
            local = logwise::privacy::LogIt(&local)
        );

        let label = params.debug_label.clone().unwrap_or_else(|| info.name.clone());
        let commands = scoped(self.bound.device(), || {
            let bind_groups = compute.stage.bind_groups(&self.bound, &resolved.groups);
            let mut encoder = self.bound.encoder(&label);
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(label.as_str()),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline);
                for (index, group) in bind_groups.iter().enumerate() {
                    pass.set_bind_group(index as u32, group, &[]);
                }
                if !resolved.push.is_empty() {
                    pass.set_push_constants(0, &resolved.push);
                }
                pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
            }
            encoder.finish()
        })?;
        self.bound.submit(
            commands,
            &params.wait_fences,
            std::mem::take(&mut params.signal_fences),
            params.completion.take(),
            params.wait_until_completion,
        );
        if let Some((buffer, len)) = printf {
            let bytes = self.bound.read_buffer(&buffer, 0, len.div_ceil(4) as u64 * 4)?;
            soft_printf::print_buffer(&bytes)?;
        }
        Ok(())
    }
}

/// Allocation bookkeeping argument buffers are created with.
#[derive(Debug, Clone)]
pub(crate) struct Allocator {
    pub registry: Arc<ResourceRegistry>,
    pub allocated: Arc<AtomicU64>,
}

#[derive(Debug)]
pub struct WgpuFunction {
    info: Arc<FunctionInfo>,
    platform: PlatformType,
    devices: Vec<DeviceFunction>,
    allocator: Allocator,
}

impl WgpuFunction {
    pub(crate) fn new(
        info: Arc<FunctionInfo>,
        platform: PlatformType,
        devices: Vec<DeviceFunction>,
        allocator: Allocator,
    ) -> Self {
        WgpuFunction {
            info,
            platform,
            devices,
            allocator,
        }
    }

    pub(crate) fn device_function(&self, device: &Device) -> Option<&DeviceFunction> {
        self.devices.iter().find(|f| f.device_index == device.index)
    }

    fn unavailable(&self, operation: &'static str, device: &Device) -> Error {
        report(
            operation,
            self.platform,
            Error::invalid(format!("\"{}\" is not available on {device}", self.info.name)),
        )
    }
}

impl Function for WgpuFunction {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn function_type(&self) -> FunctionType {
        self.info.function_type
    }

    fn info(&self) -> &Arc<FunctionInfo> {
        &self.info
    }

    fn entry(&self, device: &Device) -> Option<&FunctionEntry> {
        self.device_function(device).map(|f| &f.entry)
    }

    fn platform_type(&self) -> PlatformType {
        self.platform
    }

    fn execute(&self, queue: &dyn Queue, mut params: ExecutionParams<'_>) -> Result<(), Error> {
        const OP: &str = "function::execute";
        let wgpu_queue = WgpuQueue::downcast(queue, OP)?;
        let function = self
            .device_function(queue.device())
            .ok_or_else(|| self.unavailable(OP, queue.device()))?;
        function.launch(wgpu_queue, &mut params).map_err(|e| {
            // whatever was not handed to the device is released here
            signal_all(&params.signal_fences);
            if let Some(completion) = params.completion.take() {
                completion();
            }
            report(OP, self.platform, e)
        })
    }

    fn create_argument_buffer(
        &self,
        queue: &dyn Queue,
        arg_index: usize,
        extra_flags: MemoryFlags,
        zero_init: bool,
    ) -> Result<Arc<ArgumentBuffer>, Error> {
        const OP: &str = "function::create_argument_buffer";
        let function = self
            .device_function(queue.device())
            .ok_or_else(|| self.unavailable(OP, queue.device()))?;
        let layout = function
            .compute
            .as_ref()
            .and_then(|compute| compute.stage.layout.user_slots().nth(arg_index))
            .and_then(|slot| match slot {
                BindingSlot::ArgumentBuffer { layout, .. } => Some(layout.clone()),
                _ => None,
            })
            .unwrap_or_default();
        let encoder = WgpuArgumentEncoder {
            layout,
            bound: function.bound.clone(),
            resources: Mutex::new(Vec::new()),
        };
        create_argument_buffer_internal(
            queue,
            &function.entry,
            arg_index,
            extra_flags,
            zero_init,
            Box::new(encoder),
            |size, flags| {
                let buffer: Arc<dyn Buffer> = WgpuBuffer::new(BufferRequest {
                    bound: function.bound.clone(),
                    size,
                    flags,
                    host: None,
                    initial: None,
                    registry: &self.allocator.registry,
                    allocated: &self.allocator.allocated,
                })
                .map_err(|e| report(OP, self.platform, e))?;
                Ok(buffer)
            },
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_rows() {
        assert_eq!(uniform_size(0), 16);
        assert_eq!(uniform_size(4), 16);
        assert_eq!(uniform_size(16), 16);
        assert_eq!(uniform_size(17), 32);
    }
}
