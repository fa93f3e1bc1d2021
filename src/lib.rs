// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
floor is a compute and graphics runtime with one API over several backends.

A [Context] owns the devices of one backend and creates everything else: [Queue]s, memory
objects ([Buffer], [Image]), [Program]s and their [Function]s, [Fence]s, indirect command
pipelines and graphics pipelines.

| Platform      | Backend                         | Device code                           |
|---------------|---------------------------------|---------------------------------------|
| Host-Compute  | always built in                 | Rust kernels, or ELF objects          |
| Vulkan, Metal | `backend_wgpu` (default)        | WGSL source, SPIR-V universal binaries |
| CUDA, OpenCL  | not built; contexts unsupported | n/a                                   |

# Host-Compute

The Host-Compute backend runs kernels on the CPU.  Every work-group runs on a worker thread; every
work-item of a group is a fiber, so [kernel::barrier] is a real barrier.  Kernels are either native
Rust closures registered through [imp::host::HostProgramBuilder] or position-independent ELF
objects from a universal binary, linked at load time against the `floor_host_compute_*` entry
points.

```no_run
use floor::{ArgAccess, ArgInfo, ContextConfig, ExecutionParams, FunctionInfo, MemoryFlags};

let context = floor::create_context(ContextConfig::host());
let device = context.fastest_device().unwrap().clone();
let queue = context.create_queue(&device).unwrap();
let data = context
    .create_buffer_with_data(queue.as_ref(), bytemuck::cast_slice(&[1u32; 64]), MemoryFlags::READ_WRITE)
    .unwrap();
let program = floor::imp::host::HostProgramBuilder::new()
    .kernel(
        FunctionInfo::kernel("double", vec![ArgInfo::buffer(ArgAccess::ReadWrite)]),
        |args| {
            let data = args.buffer(0);
            let i = floor::kernel::global_id(0) as usize;
            data.set::<u32>(i, data.get::<u32>(i) * 2);
        },
    )
    .build(context.as_ref())
    .unwrap();
let function = program.function("double").unwrap();
function
    .execute(queue.as_ref(), ExecutionParams::linear(64, 0).arg(&data).blocking())
    .unwrap();
```

# Errors

Fallible operations return [Error].  Failures are also logged through `logwise` together with
the operation and the backend, so callers that only need to know *whether* something worked can
rely on the log for *why*.
*/

pub mod args;
pub mod argument_buffer;
pub mod binding;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod fence;
pub mod function_info;
pub mod image_type;
pub mod imp;
pub mod indirect;
pub mod kernel;
pub mod memory;
pub mod memory_flags;
pub mod pipeline_description;
pub mod program;
pub mod queue;
pub mod render;
pub mod runtime_state;
pub mod soft_printf;
pub mod universal_binary;

use std::sync::Arc;

pub use args::{Arg, CapturedArg};
pub use argument_buffer::ArgumentBuffer;
pub use config::{ContextConfig, ContextFlags};
pub use context::{Context, MemoryUsage, ResourceRegistry};
pub use device::{Device, DeviceFeatures, DeviceType, PlatformType, Vendor};
pub use error::Error;
pub use fence::{Fence, SignalFence, SyncStage, TimelineFence, WaitFence};
pub use function_info::{ArgAccess, ArgInfo, ArgKind, FunctionFlags, FunctionInfo, FunctionType};
pub use image_type::ImageType;
pub use imp::UnsupportedContext;
pub use imp::host::{HostContext, HostProgramBuilder, NativeKernel};
pub use indirect::IndirectCommandPipeline;
pub use memory::{Buffer, HostSpan, Image, MappedMemory, MemoryObject};
pub use memory_flags::{MapFlags, MemoryFlags};
pub use pipeline_description::{IndirectCommandDescription, RenderPipelineDescription};
pub use program::{Function, Program, ProgramSource};
pub use queue::{CompletionHandler, ExecutionParams, Queue, QueueType};
pub use render::{DrawCall, GraphicsPipeline, RenderPassDescription, Renderer};
pub use universal_binary::UniversalBinary;

fn backend_context(platform: PlatformType, config: ContextConfig) -> Arc<dyn Context> {
    match platform {
        PlatformType::Host => Arc::new(HostContext::new(config)),
        #[cfg(feature = "backend_wgpu")]
        PlatformType::Vulkan | PlatformType::Metal => Arc::new(imp::wgpu::WgpuContext::new(platform, config)),
        other => Arc::new(UnsupportedContext::new(other)),
    }
}

/// Creates a context for `config.platform`.
///
/// When that backend has no usable device the Host-Compute backend is used instead, so the
/// returned context is only unsupported if the host device itself was excluded by the whitelist.
pub fn create_context(config: ContextConfig) -> Arc<dyn Context> {
    let preferred = config.platform;
    let context = backend_context(preferred, config.clone());
    if context.is_supported() || preferred == PlatformType::Host {
        return context;
    }
    logwise::warn_sync!(
        "create_context: {platform} is unsupported, falling back to Host-Compute",
        platform = preferred.to_string()
    );
    drop(context);
    backend_context(PlatformType::Host, config)
}
