// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Indirect command pipelines.

A pipeline records compute or render commands once per device and can then be replayed, in
whole or in part, any number of times.  Commands are recorded through encoders
([ComputeCommandEncoder], [RenderCommandEncoder]) that capture an owning copy of their
arguments, so recorded state stays valid after the caller's borrows end.

Replay is serial: the range `[offset, offset + count)` executes as the corresponding sequence
of launches on the queue.  Wait fences guard the commands up to (and including) the first one
recorded with a completion barrier; signal fences, the completion handler and blocking apply
to the last command of the range.
*/

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::args::{CapturedArg, check_args};
use crate::device::{Device, DeviceFeatures, PlatformType};
use crate::error::{Error, report};
use crate::fence::{SignalFence, signal_all};
use crate::function_info::FunctionType;
use crate::pipeline_description::{IndirectCommandDescription, IndirectCommandType};
use crate::program::Function;
use crate::queue::{CompletionHandler, ExecutionParams, IndirectExecutionParams, Queue};
use crate::render::{DrawCall, GraphicsPipeline, Renderer, borrow_args};

/// One recorded compute dispatch.
#[derive(Clone)]
pub struct ComputeCommand {
    pub function: Arc<dyn Function>,
    pub args: Vec<CapturedArg>,
    pub execution_dim: u32,
    pub global_work_size: [u32; 3],
    pub local_work_size: [u32; 3],
    /// Following commands start only after this one completed.
    pub wait_until_completion: bool,
}

impl Debug for ComputeCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeCommand")
            .field("function", &self.function.name())
            .field("args", &self.args.len())
            .field("global_work_size", &self.global_work_size)
            .field("local_work_size", &self.local_work_size)
            .field("wait_until_completion", &self.wait_until_completion)
            .finish()
    }
}

/// One recorded draw.
#[derive(Clone)]
pub struct RenderCommand {
    pub pipeline: Arc<dyn GraphicsPipeline>,
    pub multi_view: bool,
    pub vertex_args: Vec<CapturedArg>,
    pub fragment_args: Vec<CapturedArg>,
    pub draw: DrawCall,
}

impl Debug for RenderCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderCommand")
            .field("pipeline", &self.pipeline.description().debug_label)
            .field("multi_view", &self.multi_view)
            .field("draw", &self.draw)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum IndirectCommand {
    Compute(ComputeCommand),
    Render(RenderCommand),
}

#[derive(Debug, Default)]
struct DeviceCommands {
    commands: Vec<IndirectCommand>,
    complete: bool,
}

/// A recorded, re-playable bundle of commands.
pub struct IndirectCommandPipeline {
    description: IndirectCommandDescription,
    platform: PlatformType,
    devices: Vec<Arc<Device>>,
    per_device: Mutex<HashMap<u32, DeviceCommands>>,
}

impl Debug for IndirectCommandPipeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndirectCommandPipeline")
            .field("description", &self.description)
            .field("platform", &self.platform)
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

impl IndirectCommandPipeline {
    /// Creates an empty pipeline for `devices`.
    ///
    /// Fails when the description is invalid or a device lacks indirect support for the
    /// command type.
    pub fn new(
        description: IndirectCommandDescription,
        platform: PlatformType,
        devices: &[Arc<Device>],
    ) -> Result<IndirectCommandPipeline, Error> {
        description
            .validate()
            .map_err(|e| report("indirect::new", platform, e.into()))?;
        let needed = match description.command_type {
            IndirectCommandType::Compute => DeviceFeatures::INDIRECT_COMPUTE,
            IndirectCommandType::Render => DeviceFeatures::INDIRECT_RENDER,
        };
        let devices: Vec<Arc<Device>> = devices
            .iter()
            .filter(|d| {
                let supported = d.supports(needed);
                if !supported {
                    logwise::warn_sync!(
                        "indirect::new [{platform}]: device {device} has no {kind} indirect support and is skipped",
                        platform = platform.to_string(),
                        device = d.to_string(),
                        kind = logwise::privacy::LogIt(&description.command_type)
                    );
                }
                supported
            })
            .cloned()
            .collect();
        if devices.is_empty() {
            return Err(report(
                "indirect::new",
                platform,
                Error::unsupported("no device supports this kind of indirect command"),
            ));
        }
        let per_device = devices
            .iter()
            .map(|d| (d.index, DeviceCommands::default()))
            .collect();
        Ok(IndirectCommandPipeline {
            description,
            platform,
            devices,
            per_device: Mutex::new(per_device),
        })
    }

    pub fn description(&self) -> &IndirectCommandDescription {
        &self.description
    }

    pub fn platform_type(&self) -> PlatformType {
        self.platform
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    fn commands(&self) -> MutexGuard<'_, HashMap<u32, DeviceCommands>> {
        self.per_device.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_device(&self, op: &'static str, device: &Device) -> Result<(), Error> {
        if device.platform != self.platform
            || !self.devices.iter().any(|d| d.index == device.index)
        {
            return Err(report(
                op,
                self.platform,
                Error::invalid(format!("device {device} is not part of this pipeline")),
            ));
        }
        Ok(())
    }

    /// Starts recording a compute command for `device`.
    pub fn add_compute_command(
        &self,
        device: &Device,
        function: Arc<dyn Function>,
    ) -> Result<ComputeCommandEncoder<'_>, Error> {
        const OP: &str = "indirect::add_compute_command";
        self.check_device(OP, device)?;
        if self.description.command_type != IndirectCommandType::Compute {
            return Err(report(
                OP,
                self.platform,
                Error::invalid("compute commands need a compute pipeline"),
            ));
        }
        if function.function_type() != FunctionType::Kernel {
            return Err(report(
                OP,
                self.platform,
                Error::invalid(format!("\"{}\" is not a kernel", function.name())),
            ));
        }
        if function.entry(device).is_none() {
            return Err(report(
                OP,
                self.platform,
                Error::invalid(format!(
                    "\"{}\" is not available on {device}",
                    function.name()
                )),
            ));
        }
        let bindings = function.info().buffer_binding_count();
        if bindings > self.description.max_kernel_buffer_count {
            return Err(report(
                OP,
                self.platform,
                Error::invalid(format!(
                    "\"{}\" needs {bindings} buffers, the pipeline allows {}",
                    function.name(),
                    self.description.max_kernel_buffer_count
                )),
            ));
        }
        Ok(ComputeCommandEncoder {
            pipeline: self,
            device_index: device.index,
            function,
            args: Vec::new(),
            wait_until_completion: false,
        })
    }

    /// Starts recording a render command for `device`.
    pub fn add_render_command(
        &self,
        device: &Device,
        pipeline: Arc<dyn GraphicsPipeline>,
        multi_view: bool,
    ) -> Result<RenderCommandEncoder<'_>, Error> {
        const OP: &str = "indirect::add_render_command";
        self.check_device(OP, device)?;
        if self.description.command_type != IndirectCommandType::Render {
            return Err(report(
                OP,
                self.platform,
                Error::invalid("render commands need a render pipeline"),
            ));
        }
        let graphics = pipeline.description();
        if !graphics.support_indirect_rendering {
            return Err(report(
                OP,
                self.platform,
                Error::invalid(format!(
                    "graphics pipeline \"{}\" was not created with indirect rendering support",
                    graphics.debug_label
                )),
            ));
        }
        if multi_view && !graphics.enable_multi_view {
            return Err(report(
                OP,
                self.platform,
                Error::invalid("multi-view command on a pipeline without multi-view"),
            ));
        }
        let vertex = graphics.vertex_shader.info().buffer_binding_count();
        let fragment = graphics
            .fragment_shader
            .as_ref()
            .map(|f| f.info().buffer_binding_count())
            .unwrap_or(0);
        if vertex > self.description.max_vertex_buffer_count
            || fragment > self.description.max_fragment_buffer_count
        {
            return Err(report(
                OP,
                self.platform,
                Error::invalid(format!(
                    "graphics pipeline needs {vertex}/{fragment} vertex/fragment buffers, the pipeline allows {}/{}",
                    self.description.max_vertex_buffer_count,
                    self.description.max_fragment_buffer_count
                )),
            ));
        }
        Ok(RenderCommandEncoder {
            pipeline: self,
            device_index: device.index,
            graphics: pipeline,
            multi_view,
            vertex_args: Vec::new(),
            fragment_args: Vec::new(),
        })
    }

    fn push(&self, op: &'static str, device_index: u32, command: IndirectCommand) -> Result<(), Error> {
        let mut all = self.commands();
        let list = all.entry(device_index).or_default();
        if list.complete {
            return Err(report(
                op,
                self.platform,
                Error::invalid("the pipeline is complete; reset it before recording"),
            ));
        }
        if list.commands.len() >= self.description.max_command_count as usize {
            return Err(report(
                op,
                self.platform,
                Error::invalid(format!(
                    "the pipeline is full ({} commands)",
                    self.description.max_command_count
                )),
            ));
        }
        list.commands.push(command);
        Ok(())
    }

    /// Finalizes recording on `device`, or on every device when `None`.
    pub fn complete(&self, device: Option<&Device>) -> Result<(), Error> {
        if let Some(device) = device {
            self.check_device("indirect::complete", device)?;
        }
        let mut all = self.commands();
        for (index, list) in all.iter_mut() {
            if device.is_none_or(|d| d.index == *index) {
                list.complete = true;
            }
        }
        Ok(())
    }

    /// Drops every recorded command on every device.
    pub fn reset(&self) {
        for list in self.commands().values_mut() {
            list.commands.clear();
            list.complete = false;
        }
    }

    /// Commands recorded for `device`, or the maximum over all devices.
    pub fn command_count(&self, device: Option<&Device>) -> u32 {
        let all = self.commands();
        match device {
            Some(device) => all
                .get(&device.index)
                .map(|l| l.commands.len() as u32)
                .unwrap_or(0),
            None => all
                .values()
                .map(|l| l.commands.len() as u32)
                .max()
                .unwrap_or(0),
        }
    }

    /// Checks that `[offset, offset + count)` lies within the commands recorded for `device`.
    pub fn validate_range(&self, device: &Device, offset: u32, count: u32) -> Result<(), Error> {
        let recorded = self.command_count(Some(device));
        match offset.checked_add(count) {
            Some(end) if end <= recorded => Ok(()),
            _ => Err(Error::invalid(format!(
                "command range {offset}+{count} exceeds the {recorded} recorded commands"
            ))),
        }
    }

    /// A copy of the commands `[offset, offset + count)` recorded for `device`.
    pub fn commands_for(&self, device: &Device, offset: u32, count: u32) -> Result<Vec<IndirectCommand>, Error> {
        self.validate_range(device, offset, count)?;
        let all = self.commands();
        let list = all
            .get(&device.index)
            .ok_or_else(|| Error::invalid(format!("device {device} is not part of this pipeline")))?;
        if !list.complete {
            return Err(Error::invalid("the pipeline must be completed before execution"));
        }
        Ok(list.commands[offset as usize..(offset + count) as usize].to_vec())
    }

    /// Serial replay of compute commands `[offset, offset + count)` on `queue`.
    ///
    /// The signal fences and the completion handler run exactly once, whether the range is empty,
    /// invalid or fails part way.
    pub(crate) fn replay(
        &self,
        queue: &dyn Queue,
        params: IndirectExecutionParams,
        offset: u32,
        count: u32,
    ) -> Result<(), Error> {
        const OP: &str = "queue::execute_indirect";
        let platform = queue.platform_type();
        let IndirectExecutionParams {
            mut wait_fences,
            signal_fences,
            debug_label,
            wait_until_completion,
            completion,
        } = params;
        let mut pending = PendingCompletion {
            signal_fences,
            completion,
        };
        if self.description.command_type != IndirectCommandType::Compute {
            return Err(report(
                OP,
                platform,
                Error::invalid("render commands are executed through a renderer"),
            ));
        }
        let commands = self
            .commands_for(queue.device(), offset, count)
            .map_err(|e| report(OP, platform, e))?;
        let Some(last) = commands.len().checked_sub(1) else {
            return Ok(());
        };
        for (index, command) in commands.iter().enumerate() {
            let IndirectCommand::Compute(command) = command else {
                return Err(report(
                    OP,
                    platform,
                    Error::invalid("render command in a compute pipeline"),
                ));
            };
            let mut launch = ExecutionParams::new(
                command.execution_dim,
                command.global_work_size,
                command.local_work_size,
            )
            .with_args(borrow_args(&command.args));
            launch.wait_fences = wait_fences.clone();
            launch.wait_until_completion = command.wait_until_completion;
            launch.debug_label = debug_label
                .as_ref()
                .map(|label| format!("{label}[{}]", offset as usize + index));
            if command.wait_until_completion {
                wait_fences.clear();
            }
            if index == last {
                (launch.signal_fences, launch.completion) = pending.hand_off();
                launch.wait_until_completion |= wait_until_completion;
            }
            queue.execute(command.function.as_ref(), launch)?;
        }
        Ok(())
    }

    /// Replays render commands `[offset, offset + count)` into `renderer`.
    pub(crate) fn replay_render(
        &self,
        renderer: &mut dyn Renderer,
        device: &Device,
        offset: u32,
        count: u32,
    ) -> Result<(), Error> {
        const OP: &str = "renderer::execute_indirect";
        if self.description.command_type != IndirectCommandType::Render {
            return Err(report(
                OP,
                self.platform,
                Error::invalid("compute commands are executed on a queue"),
            ));
        }
        let commands = self
            .commands_for(device, offset, count)
            .map_err(|e| report(OP, self.platform, e))?;
        for command in commands {
            if let IndirectCommand::Render(command) = command {
                renderer.draw(
                    command.draw.clone(),
                    &borrow_args(&command.vertex_args),
                    &borrow_args(&command.fragment_args),
                )?;
            }
        }
        Ok(())
    }
}

/// Records one compute command.
///
/// Nothing is stored until [ComputeCommandEncoder::execute] is called.
pub struct ComputeCommandEncoder<'p> {
    pipeline: &'p IndirectCommandPipeline,
    device_index: u32,
    function: Arc<dyn Function>,
    args: Vec<CapturedArg>,
    wait_until_completion: bool,
}

impl Debug for ComputeCommandEncoder<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeCommandEncoder")
            .field("function", &self.function.name())
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl ComputeCommandEncoder<'_> {
    pub fn set_arguments(&mut self, args: Vec<CapturedArg>) -> Result<&mut Self, Error> {
        check_args(self.function.info(), &borrow_args(&args))
            .map_err(|e| report("indirect::set_arguments", self.pipeline.platform, e))?;
        self.args = args;
        Ok(self)
    }

    /// Following commands wait for this one to complete.
    pub fn barrier(&mut self) -> &mut Self {
        self.wait_until_completion = true;
        self
    }

    /// Stores the command with the given launch geometry.
    pub fn execute(self, execution_dim: u32, global_work_size: [u32; 3], local_work_size: [u32; 3]) -> Result<(), Error> {
        const OP: &str = "indirect::execute";
        let platform = self.pipeline.platform;
        crate::queue::normalize_global(execution_dim, global_work_size).map_err(|e| report(OP, platform, e))?;
        if self.args.len() != self.function.info().user_arg_count() {
            return Err(report(
                OP,
                platform,
                Error::invalid(format!(
                    "\"{}\" takes {} arguments, {} were set",
                    self.function.name(),
                    self.function.info().user_arg_count(),
                    self.args.len()
                )),
            ));
        }
        let command = IndirectCommand::Compute(ComputeCommand {
            function: self.function,
            args: self.args,
            execution_dim,
            global_work_size,
            local_work_size,
            wait_until_completion: self.wait_until_completion,
        });
        self.pipeline.push(OP, self.device_index, command)
    }
}

/// Records one render command.
pub struct RenderCommandEncoder<'p> {
    pipeline: &'p IndirectCommandPipeline,
    device_index: u32,
    graphics: Arc<dyn GraphicsPipeline>,
    multi_view: bool,
    vertex_args: Vec<CapturedArg>,
    fragment_args: Vec<CapturedArg>,
}

impl Debug for RenderCommandEncoder<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderCommandEncoder")
            .field("graphics", &self.graphics)
            .field("multi_view", &self.multi_view)
            .finish_non_exhaustive()
    }
}

impl RenderCommandEncoder<'_> {
    pub fn set_arguments(
        &mut self,
        vertex_args: Vec<CapturedArg>,
        fragment_args: Vec<CapturedArg>,
    ) -> Result<&mut Self, Error> {
        const OP: &str = "indirect::set_arguments";
        let description = self.graphics.description();
        check_args(description.vertex_shader.info(), &borrow_args(&vertex_args))
            .map_err(|e| report(OP, self.pipeline.platform, e))?;
        if let Some(fragment) = &description.fragment_shader {
            check_args(fragment.info(), &borrow_args(&fragment_args))
                .map_err(|e| report(OP, self.pipeline.platform, e))?;
        }
        self.vertex_args = vertex_args;
        self.fragment_args = fragment_args;
        Ok(self)
    }

    fn record(self, draw: DrawCall) -> Result<(), Error> {
        const OP: &str = "indirect::draw";
        if draw.is_tessellated() {
            let device = self
                .pipeline
                .devices
                .iter()
                .find(|d| d.index == self.device_index);
            if !device.is_some_and(|d| d.supports(DeviceFeatures::TESSELLATION)) {
                return Err(report(
                    OP,
                    self.pipeline.platform,
                    Error::unsupported("tessellation"),
                ));
            }
        }
        let command = IndirectCommand::Render(RenderCommand {
            pipeline: self.graphics,
            multi_view: self.multi_view,
            vertex_args: self.vertex_args,
            fragment_args: self.fragment_args,
            draw,
        });
        self.pipeline.push(OP, self.device_index, command)
    }

    pub fn draw(self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> Result<(), Error> {
        self.record(DrawCall::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        })
    }

    pub fn draw_indexed(
        self,
        index_buffer: Arc<dyn crate::memory::Buffer>,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), Error> {
        self.record(DrawCall::DrawIndexed {
            index_buffer,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_patches(
        self,
        control_point_buffers: Vec<Arc<dyn crate::memory::Buffer>>,
        tessellation_factors: Arc<dyn crate::memory::Buffer>,
        patch_control_point_count: u32,
        patch_count: u32,
        first_patch: u32,
        instance_count: u32,
        first_instance: u32,
    ) -> Result<(), Error> {
        self.record(DrawCall::DrawPatches {
            control_point_buffers,
            tessellation_factors,
            patch_control_point_count,
            patch_count,
            first_patch,
            instance_count,
            first_instance,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_patches_indexed(
        self,
        control_point_buffers: Vec<Arc<dyn crate::memory::Buffer>>,
        control_point_index_buffer: Arc<dyn crate::memory::Buffer>,
        tessellation_factors: Arc<dyn crate::memory::Buffer>,
        patch_control_point_count: u32,
        patch_count: u32,
        first_index: u32,
        first_patch: u32,
        instance_count: u32,
        first_instance: u32,
    ) -> Result<(), Error> {
        self.record(DrawCall::DrawPatchesIndexed {
            control_point_buffers,
            control_point_index_buffer,
            tessellation_factors,
            patch_control_point_count,
            patch_count,
            first_index,
            first_patch,
            instance_count,
            first_instance,
        })
    }
}

/// Signal fences and completion of a replay that no launch has taken over yet.
///
/// Dropping it signals the fences and runs the handler, so every exit path of a replay releases
/// whoever waits on them.
struct PendingCompletion {
    signal_fences: Vec<SignalFence>,
    completion: Option<CompletionHandler>,
}

impl PendingCompletion {
    fn hand_off(&mut self) -> (Vec<SignalFence>, Option<CompletionHandler>) {
        (std::mem::take(&mut self.signal_fences), self.completion.take())
    }
}

impl Drop for PendingCompletion {
    fn drop(&mut self) {
        signal_all(&self.signal_fences);
        if let Some(completion) = self.completion.take() {
            completion();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(index: u32, features: DeviceFeatures) -> Arc<Device> {
        let mut device = Device::template(PlatformType::Host, index);
        device.features = features;
        Arc::new(device)
    }

    #[test]
    fn devices_without_support_are_skipped() {
        let devices = [
            device(0, DeviceFeatures::INDIRECT_COMPUTE),
            device(1, DeviceFeatures::empty()),
        ];
        let pipeline = IndirectCommandPipeline::new(
            IndirectCommandDescription::new(IndirectCommandType::Compute, 4),
            PlatformType::Host,
            &devices,
        )
        .unwrap();
        assert_eq!(pipeline.devices().len(), 1);
        assert!(pipeline.complete(Some(&devices[1])).is_err());
        assert!(pipeline.complete(None).is_ok());

        assert!(
            IndirectCommandPipeline::new(
                IndirectCommandDescription::new(IndirectCommandType::Render, 4),
                PlatformType::Host,
                &devices,
            )
            .is_err()
        );
    }

    #[test]
    fn empty_ranges() {
        let devices = [device(0, DeviceFeatures::INDIRECT_COMPUTE)];
        let pipeline = IndirectCommandPipeline::new(
            IndirectCommandDescription::new(IndirectCommandType::Compute, 4),
            PlatformType::Host,
            &devices,
        )
        .unwrap();
        assert!(pipeline.validate_range(&devices[0], 0, 0).is_ok());
        assert!(pipeline.validate_range(&devices[0], 0, 1).is_err());
        assert!(pipeline.validate_range(&devices[0], u32::MAX, 2).is_err());
        // not completed yet
        assert!(pipeline.commands_for(&devices[0], 0, 0).is_err());
        pipeline.complete(None).unwrap();
        assert!(pipeline.commands_for(&devices[0], 0, 0).unwrap().is_empty());
        pipeline.reset();
        assert!(pipeline.commands_for(&devices[0], 0, 0).is_err());
    }
}
