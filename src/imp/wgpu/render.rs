// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Graphics pipelines and render passes of the wgpu backend.
//!
//! Vertex-stage bindings start at bind group 0 and fragment-stage bindings follow them.  All
//! vertex data comes from storage buffers; pipelines have no vertex buffer layouts.

use std::any::Any;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::args::{Arg, check_args};
use crate::device::{Device, PlatformType};
use crate::error::{Error, report};
use crate::fence::{SignalFence, WaitFence, signal_all};
use crate::imp::wgpu::bound_device::BoundDevice;
use crate::imp::wgpu::error::scoped;
use crate::imp::wgpu::function::{DeviceFunction, Resource, StageBindings, WgpuFunction, uniform_size};
use crate::imp::wgpu::image::WgpuImage;
use crate::imp::wgpu::buffer::WgpuBuffer;
use crate::imp::wgpu::pixel_format::DeviceFormat;
use crate::indirect::IndirectCommandPipeline;
use crate::pipeline_description::{
    BlendComponent, BlendFactor, BlendOp, CompareFunction, CullMode, FrontFace, Primitive, RenderPipelineDescription,
};
use crate::program::Function;
use crate::queue::CompletionHandler;
use crate::render::{DrawCall, GraphicsPipeline, LoadOp, RenderPassDescription, Renderer};
use crate::soft_printf::{self, PrintfBuffer};

fn topology(primitive: Primitive) -> wgpu::PrimitiveTopology {
    match primitive {
        Primitive::Point => wgpu::PrimitiveTopology::PointList,
        Primitive::Line => wgpu::PrimitiveTopology::LineList,
        Primitive::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        Primitive::Triangle => wgpu::PrimitiveTopology::TriangleList,
        Primitive::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

fn compare(function: CompareFunction) -> wgpu::CompareFunction {
    match function {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
        CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::DstColor => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDstColor => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
    }
}

fn blend_component(component: BlendComponent) -> wgpu::BlendComponent {
    wgpu::BlendComponent {
        src_factor: blend_factor(component.src),
        dst_factor: blend_factor(component.dst),
        operation: match component.op {
            BlendOp::Add => wgpu::BlendOperation::Add,
            BlendOp::Subtract => wgpu::BlendOperation::Subtract,
            BlendOp::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOp::Min => wgpu::BlendOperation::Min,
            BlendOp::Max => wgpu::BlendOperation::Max,
        },
    }
}

fn primitive_state(description: &RenderPipelineDescription) -> wgpu::PrimitiveState {
    wgpu::PrimitiveState {
        topology: topology(description.primitive),
        strip_index_format: matches!(description.primitive, Primitive::LineStrip | Primitive::TriangleStrip)
            .then_some(wgpu::IndexFormat::Uint32),
        front_face: match description.front_face {
            FrontFace::CounterClockwise => wgpu::FrontFace::Ccw,
            FrontFace::Clockwise => wgpu::FrontFace::Cw,
        },
        cull_mode: match description.cull_mode {
            CullMode::None => None,
            CullMode::Back => Some(wgpu::Face::Back),
            CullMode::Front => Some(wgpu::Face::Front),
        },
        ..Default::default()
    }
}

fn downcast_function<'f>(function: &'f Arc<dyn Function>) -> Result<&'f WgpuFunction, Error> {
    function
        .as_any()
        .downcast_ref::<WgpuFunction>()
        .ok_or_else(|| Error::invalid(format!("\"{}\" is not a wgpu function", function.name())))
}

/// A pipeline as created on one device.
#[derive(Debug)]
struct DevicePipeline {
    device_index: u32,
    pipeline: wgpu::RenderPipeline,
    vertex: StageBindings,
    fragment: Option<StageBindings>,
}

impl DevicePipeline {
    fn new(
        bound: &Arc<BoundDevice>,
        description: &RenderPipelineDescription,
        vertex: &DeviceFunction,
        fragment: Option<&DeviceFunction>,
    ) -> Result<DevicePipeline, Error> {
        let vertex_stage = StageBindings::new(bound, &vertex.entry.info, 0, 0, wgpu::ShaderStages::VERTEX)?;
        let fragment_stage = fragment
            .map(|f| {
                StageBindings::new(
                    bound,
                    &f.entry.info,
                    vertex_stage.layout.group_count,
                    0,
                    wgpu::ShaderStages::FRAGMENT,
                )
            })
            .transpose()?;
        let multiview = if description.enable_multi_view {
            if !bound.has_feature(wgpu::Features::MULTIVIEW) {
                return Err(Error::unsupported("multi-view rendering on this device"));
            }
            NonZeroU32::new(2)
        } else {
            None
        };
        let targets: Vec<Option<wgpu::ColorTargetState>> = description
            .color_attachments
            .iter()
            .map(|attachment| {
                Ok::<_, Error>(Some(wgpu::ColorTargetState {
                    format: DeviceFormat::of(attachment.format)?.format,
                    blend: attachment.blend.map(|blend| wgpu::BlendState {
                        color: blend_component(blend.color),
                        alpha: blend_component(blend.alpha),
                    }),
                    write_mask: wgpu::ColorWrites::ALL,
                }))
            })
            .collect::<Result<_, Error>>()?;
        let depth_stencil = description
            .depth_attachment
            .as_ref()
            .map(|depth| {
                Ok::<_, Error>(wgpu::DepthStencilState {
                    format: DeviceFormat::of(depth.format)?.format,
                    depth_write_enabled: depth.write,
                    depth_compare: compare(depth.compare),
                    stencil: Default::default(),
                    bias: Default::default(),
                })
            })
            .transpose()?;
        let vertex_name = vertex.entry.info.name.clone();
        let fragment_name = fragment.map(|f| f.entry.info.name.clone());
        let pipeline = scoped(bound.device(), || {
            let layouts: Vec<&wgpu::BindGroupLayout> = vertex_stage
                .group_layouts
                .iter()
                .chain(fragment_stage.iter().flat_map(|s| s.group_layouts.iter()))
                .collect();
            let layout = bound.device().create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(description.debug_label.as_str()),
                bind_group_layouts: &layouts,
                push_constant_ranges: &[],
            });
            bound.device().create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(description.debug_label.as_str()),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &vertex.module,
                    entry_point: Some(vertex_name.as_str()),
                    compilation_options: Default::default(),
                    buffers: &[],
                },
                primitive: primitive_state(description),
                depth_stencil,
                multisample: wgpu::MultisampleState {
                    count: description.sample_count.max(1),
                    mask: !0,
                    alpha_to_coverage_enabled: false,
                },
                fragment: fragment.zip(fragment_name.as_deref()).map(|(f, name)| wgpu::FragmentState {
                    module: &f.module,
                    entry_point: Some(name),
                    compilation_options: Default::default(),
                    targets: &targets,
                }),
                multiview,
                cache: None,
            })
        })?;
        Ok(DevicePipeline {
            device_index: bound.info().index,
            pipeline,
            vertex: vertex_stage,
            fragment: fragment_stage,
        })
    }
}

#[derive(Debug)]
pub struct WgpuGraphicsPipeline {
    description: RenderPipelineDescription,
    platform: PlatformType,
    devices: Vec<DevicePipeline>,
}

impl WgpuGraphicsPipeline {
    pub(crate) fn new(
        platform: PlatformType,
        bound: &[Arc<BoundDevice>],
        description: RenderPipelineDescription,
    ) -> Result<WgpuGraphicsPipeline, Error> {
        description.validate()?;
        let vertex = downcast_function(&description.vertex_shader)?;
        let fragment = description.fragment_shader.as_ref().map(downcast_function).transpose()?;
        let mut devices = Vec::new();
        for device in bound {
            let Some(vertex_function) = vertex.device_function(device.info()) else {
                logwise::warn_sync!(
                    "wgpu: \"{name}\" is not available on {device}",
                    name = vertex.name().to_string(),
                    device = device.info().to_string()
                );
                continue;
            };
            let fragment_function = match fragment {
                None => None,
                Some(fragment) => match fragment.device_function(device.info()) {
                    Some(f) => Some(f),
                    None => continue,
                },
            };
            devices.push(DevicePipeline::new(device, &description, vertex_function, fragment_function)?);
        }
        if devices.is_empty() {
            return Err(Error::invalid("the pipeline's functions are not available on any device"));
        }
        Ok(WgpuGraphicsPipeline {
            description,
            platform,
            devices,
        })
    }

    fn device_pipeline(&self, device: &Device) -> Option<&DevicePipeline> {
        self.devices.iter().find(|p| p.device_index == device.index)
    }
}

impl GraphicsPipeline for WgpuGraphicsPipeline {
    fn description(&self) -> &RenderPipelineDescription {
        &self.description
    }

    fn platform_type(&self) -> PlatformType {
        self.platform
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
enum Geometry {
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    Indexed {
        index_buffer: wgpu::Buffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
}

#[derive(Debug)]
struct RecordedDraw {
    bind_groups: Vec<wgpu::BindGroup>,
    geometry: Geometry,
}

/// Records draws and encodes them into one render pass on commit.
#[derive(Debug)]
pub struct WgpuRenderer {
    bound: Arc<BoundDevice>,
    pipeline: Arc<dyn GraphicsPipeline>,
    pass: RenderPassDescription,
    draws: Vec<RecordedDraw>,
    printf: Vec<(wgpu::Buffer, usize)>,
    printf_size: usize,
}

impl WgpuRenderer {
    pub(crate) fn new(
        bound: Arc<BoundDevice>,
        pipeline: Arc<dyn GraphicsPipeline>,
        pass: RenderPassDescription,
        printf_size: usize,
    ) -> Result<WgpuRenderer, Error> {
        let wgpu_pipeline = pipeline
            .as_any()
            .downcast_ref::<WgpuGraphicsPipeline>()
            .ok_or_else(|| Error::invalid("pipeline is not a wgpu pipeline"))?;
        if wgpu_pipeline.device_pipeline(bound.info()).is_none() {
            return Err(Error::invalid(format!("pipeline was not created for {}", bound.info())));
        }
        if pass.color_attachments.len() != wgpu_pipeline.description.color_attachments.len() {
            return Err(Error::invalid(format!(
                "render pass has {} color attachments, the pipeline {}",
                pass.color_attachments.len(),
                wgpu_pipeline.description.color_attachments.len()
            )));
        }
        Ok(WgpuRenderer {
            bound,
            pipeline,
            pass,
            draws: Vec::new(),
            printf: Vec::new(),
            printf_size,
        })
    }

    fn device_pipeline(&self) -> Result<&DevicePipeline, Error> {
        self.pipeline
            .as_any()
            .downcast_ref::<WgpuGraphicsPipeline>()
            .and_then(|p| p.device_pipeline(self.bound.info()))
            .ok_or_else(|| Error::invalid("pipeline is not available on this device"))
    }

    /// Bind groups of one stage for one draw.
    fn stage_groups(&mut self, stage: &StageBindings, args: &[Arg<'_>]) -> Result<Vec<wgpu::BindGroup>, Error> {
        let constants = if stage.layout.uses_constant_block() {
            Some(scoped(self.bound.device(), || {
                self.bound.device().create_buffer(&wgpu::BufferDescriptor {
                    label: Some("floor draw constants"),
                    size: u64::from(uniform_size(stage.layout.constant_size)),
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })?)
        } else {
            None
        };
        let mut resolved = stage.resolve(&self.bound, args, constants.as_ref())?;
        if let Some(buffer) = &constants {
            self.bound.queue().write_buffer(buffer, 0, &resolved.constants);
        }
        if let Some(binding) = stage.printf_binding {
            let initial = PrintfBuffer::initial_contents(self.printf_size);
            let buffer = self.bound.storage_with_data(&initial, "floor printf")?;
            resolved
                .groups
                .entry(stage.layout.group)
                .or_default()
                .push((binding, Resource::whole(&buffer)));
            self.printf.push((buffer, initial.len()));
        }
        scoped(self.bound.device(), || stage.bind_groups(&self.bound, &resolved.groups))
    }

    fn encode(&self) -> Result<wgpu::CommandBuffer, Error> {
        let device_pipeline = self.device_pipeline()?;
        let color_views = self
            .pass
            .color_attachments
            .iter()
            .map(|attachment| attachment_view(attachment.image.as_ref(), &self.bound))
            .collect::<Result<Vec<_>, Error>>()?;
        let depth_view = self
            .pass
            .depth_attachment
            .as_ref()
            .map(|depth| attachment_view(depth.image.as_ref(), &self.bound))
            .transpose()?;
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = self
            .pass
            .color_attachments
            .iter()
            .zip(&color_views)
            .map(|(attachment, view)| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: match attachment.load {
                            LoadOp::Load => wgpu::LoadOp::Load,
                            LoadOp::Clear([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                            LoadOp::DontCare => wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        },
                        store: store_op(attachment.store),
                    },
                })
            })
            .collect();
        let depth_stencil_attachment = self
            .pass
            .depth_attachment
            .as_ref()
            .zip(depth_view.as_ref())
            .map(|(depth, view)| wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations {
                    load: match depth.load {
                        LoadOp::Load => wgpu::LoadOp::Load,
                        LoadOp::Clear(value) => wgpu::LoadOp::Clear(value),
                        LoadOp::DontCare => wgpu::LoadOp::Clear(1.0),
                    },
                    store: store_op(depth.store),
                }),
                stencil_ops: None,
            });
        let label = if self.pass.debug_label.is_empty() {
            "floor render pass"
        } else {
            self.pass.debug_label.as_str()
        };
        scoped(self.bound.device(), || {
            let mut encoder = self.bound.encoder(label);
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some(label),
                    color_attachments: &color_attachments,
                    depth_stencil_attachment,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(&device_pipeline.pipeline);
                for draw in &self.draws {
                    for (index, group) in draw.bind_groups.iter().enumerate() {
                        pass.set_bind_group(index as u32, group, &[]);
                    }
                    match &draw.geometry {
                        Geometry::Draw {
                            vertex_count,
                            instance_count,
                            first_vertex,
                            first_instance,
                        } => pass.draw(
                            *first_vertex..first_vertex + vertex_count,
                            *first_instance..first_instance + instance_count,
                        ),
                        Geometry::Indexed {
                            index_buffer,
                            index_count,
                            instance_count,
                            first_index,
                            vertex_offset,
                            first_instance,
                        } => {
                            pass.set_index_buffer(index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                            pass.draw_indexed(
                                *first_index..first_index + index_count,
                                *vertex_offset,
                                *first_instance..first_instance + instance_count,
                            );
                        }
                    }
                }
            }
            encoder.finish()
        })
    }
}

fn store_op(store: bool) -> wgpu::StoreOp {
    if store {
        wgpu::StoreOp::Store
    } else {
        wgpu::StoreOp::Discard
    }
}

fn attachment_view(image: &dyn crate::memory::Image, bound: &Arc<BoundDevice>) -> Result<wgpu::TextureView, Error> {
    let image = image
        .as_any()
        .downcast_ref::<WgpuImage>()
        .ok_or_else(|| Error::invalid("attachment is not a wgpu image"))?;
    if !Arc::ptr_eq(image.bound(), bound) {
        return Err(Error::invalid("attachment belongs to another device"));
    }
    image
        .attachment_view()
        .cloned()
        .ok_or_else(|| Error::invalid("attachment image is not a render target"))
}

impl Renderer for WgpuRenderer {
    fn draw(&mut self, call: DrawCall, vertex_args: &[Arg<'_>], fragment_args: &[Arg<'_>]) -> Result<(), Error> {
        const OP: &str = "renderer::draw";
        let platform = self.bound.info().platform;
        let result = (|| {
            if call.is_tessellated() {
                return Err(Error::unsupported("tessellation on wgpu"));
            }
            let pipeline = self.pipeline.clone();
            let device_pipeline = pipeline
                .as_any()
                .downcast_ref::<WgpuGraphicsPipeline>()
                .and_then(|p| p.device_pipeline(self.bound.info()))
                .ok_or_else(|| Error::invalid("pipeline is not available on this device"))?;
            let description = pipeline.description();
            check_args(description.vertex_shader.info(), vertex_args)?;
            let mut bind_groups = self.stage_groups(&device_pipeline.vertex, vertex_args)?;
            if let (Some(stage), Some(fragment)) = (&device_pipeline.fragment, &description.fragment_shader) {
                check_args(fragment.info(), fragment_args)?;
                bind_groups.extend(self.stage_groups(stage, fragment_args)?);
            }
            let geometry = match call {
                DrawCall::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => Geometry::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                },
                DrawCall::DrawIndexed {
                    index_buffer,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => {
                    let buffer = index_buffer
                        .as_any()
                        .downcast_ref::<WgpuBuffer>()
                        .ok_or_else(|| Error::invalid("index buffer is not a wgpu buffer"))?;
                    Geometry::Indexed {
                        index_buffer: buffer.raw().clone(),
                        index_count,
                        instance_count,
                        first_index,
                        vertex_offset,
                        first_instance,
                    }
                }
                DrawCall::DrawPatches { .. } | DrawCall::DrawPatchesIndexed { .. } => {
                    return Err(Error::unsupported("tessellation on wgpu"));
                }
            };
            self.draws.push(RecordedDraw { bind_groups, geometry });
            Ok(())
        })();
        result.map_err(|e| report(OP, platform, e))
    }

    fn execute_indirect(&mut self, pipeline: &IndirectCommandPipeline, offset: u32, count: u32) -> Result<(), Error> {
        let device = self.bound.info().clone();
        pipeline.replay_render(self, &device, offset, count)
    }

    fn commit(
        self: Box<Self>,
        wait_fences: &[WaitFence],
        signal_fences: &[SignalFence],
        completion: Option<CompletionHandler>,
    ) -> Result<(), Error> {
        const OP: &str = "renderer::commit";
        let platform = self.bound.info().platform;
        let commands = match self.encode() {
            Ok(commands) => commands,
            Err(e) => {
                signal_all(signal_fences);
                if let Some(completion) = completion {
                    completion();
                }
                return Err(report(OP, platform, e));
            }
        };
        self.bound
            .submit(commands, wait_fences, signal_fences.to_vec(), completion, false);
        for (buffer, len) in &self.printf {
            let bytes = self
                .bound
                .read_buffer(buffer, 0, len.div_ceil(4) as u64 * 4)
                .map_err(|e| report(OP, platform, e))?;
            soft_printf::print_buffer(&bytes).map_err(|e| report(OP, platform, e.into()))?;
        }
        Ok(())
    }
}
