// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Host-Compute programs and functions.

A function body is either a relocatable ELF object compiled for the host (loaded from a file
or a universal binary) or a native Rust closure registered through [HostProgramBuilder].  Both
run on the same executor and observe the same [crate::kernel] state.

Loaded objects are instantiated once per worker thread so each worker has its own data
sections and ID block; instances are pooled across launches.
*/

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use crate::argument_buffer::{ArgumentBuffer, ArgumentEncoder, create_argument_buffer_internal};
use crate::args::Arg;
use crate::binding::{ImageParams, ParamBlob, ParamBlobResolver};
use crate::context::{Context, ResourceRegistry, ensure_supported};
use crate::device::{Device, PlatformType};
use crate::error::{Error, report};
use crate::fence::{signal_all, wait_all};
use crate::function_info::{FunctionInfo, FunctionType};
use crate::imp::host::buffer::{BufferRequest, HostBuffer};
use crate::imp::host::context::HostContext;
use crate::imp::host::executor::{self, ItemProgram, Launch, LaunchShape, PrintfTarget, Schedule};
use crate::imp::host::externs::host_externs;
use crate::imp::host::image::HostImage;
use crate::imp::host::loader::{ElfImage, ElfInstance, KernelFn};
use crate::imp::host::queue::HostQueue;
use crate::kernel::KernelArgs;
use crate::memory::{Buffer, Image, MemoryObject};
use crate::memory_flags::MemoryFlags;
use crate::program::{Function, FunctionEntry, Program, ProgramSource};
use crate::queue::{ExecutionParams, Queue, group_count, normalize_global, select_local_size};
use crate::soft_printf::{self, PrintfBuffer};

/// A Host-Compute function implemented in Rust.
pub type NativeKernel = Arc<dyn Fn(&KernelArgs) + Send + Sync>;

enum HostBody {
    Native(NativeKernel),
    Elf {
        image: Arc<ElfImage>,
        /// Shared by every function of the object.
        pool: Arc<Mutex<Vec<ElfInstance>>>,
    },
}

impl std::fmt::Debug for HostBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostBody::Native(_) => f.write_str("Native"),
            HostBody::Elf { pool, .. } => f
                .debug_struct("Elf")
                .field("pooled", &pool.lock().map_or(0, |p| p.len()))
                .finish(),
        }
    }
}

/// Memory bookkeeping of the owning context, for argument-buffer storage.
#[derive(Debug, Clone)]
struct Allocator {
    registry: Arc<ResourceRegistry>,
    allocated: Arc<AtomicU64>,
}

#[derive(Debug)]
pub struct HostFunction {
    info: Arc<FunctionInfo>,
    entries: Vec<(u32, FunctionEntry)>,
    body: HostBody,
    local_memory_size: usize,
    allocator: Allocator,
}

/// Resolves parameters to Host-Compute addresses.
struct HostResolver;

impl ParamBlobResolver for HostResolver {
    fn buffer_address(&self, buffer: &dyn Buffer) -> Result<u64, Error> {
        let host = buffer
            .as_any()
            .downcast_ref::<HostBuffer>()
            .ok_or_else(|| Error::invalid("buffer argument is not a Host-Compute buffer"))?;
        host.core().warn_if_mapped("function::execute");
        host.check_access("function::execute");
        Ok(host.address())
    }

    fn image_params(&self, image: &dyn Image) -> Result<ImageParams, Error> {
        let host = image
            .as_any()
            .downcast_ref::<HostImage>()
            .ok_or_else(|| Error::invalid("image argument is not a Host-Compute image"))?;
        host.core().warn_if_mapped("function::execute");
        host.check_access("function::execute");
        Ok(host.params())
    }
}

/// Encodes argument buffers as parameter blobs in their storage.
#[derive(Debug)]
struct HostArgumentEncoder;

impl ArgumentEncoder for HostArgumentEncoder {
    fn storage_size(&self, layout: &FunctionInfo) -> Result<usize, Error> {
        Ok(ParamBlob::size_of(layout).max(1))
    }

    fn encode(&self, queue: &dyn Queue, storage: &dyn Buffer, layout: &FunctionInfo, args: &[Arg<'_>]) -> Result<(), Error> {
        let blob = ParamBlob::encode(layout, args, &HostResolver, true)?;
        storage.write_from(queue, blob.bytes(), 0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Runs a native closure for every item.
struct NativeLaunch<'a> {
    body: &'a NativeKernel,
    args: KernelArgs,
}

impl ItemProgram for NativeLaunch<'_> {
    fn bind(&self, _slot: usize, _shape: &LaunchShape) -> Result<Box<dyn Fn() + '_>, Error> {
        Ok(Box::new(|| (self.body)(&self.args)))
    }
}

/// Runs a loaded function for every item.
struct ElfLaunch<'a> {
    image: &'a ElfImage,
    pool: &'a Mutex<Vec<ElfInstance>>,
    name: &'a str,
    /// One pointer per parameter, then the printf buffer when used.
    params: Vec<*const u8>,
}

// SAFETY: the parameter pointers refer to the launch's blob and printf buffer, which are only
// read by the items
unsafe impl Sync for ElfLaunch<'_> {}

/// A pooled instance lent to one worker; returned when the worker is done.
struct Lent<'a> {
    instance: Option<ElfInstance>,
    pool: &'a Mutex<Vec<ElfInstance>>,
}

impl Drop for Lent<'_> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.lock().unwrap_or_else(|p| p.into_inner()).push(instance);
        }
    }
}

impl ItemProgram for ElfLaunch<'_> {
    fn bind(&self, _slot: usize, shape: &LaunchShape) -> Result<Box<dyn Fn() + '_>, Error> {
        let pooled = self.pool.lock().unwrap_or_else(|p| p.into_inner()).pop();
        let mut instance = match pooled {
            Some(instance) => instance,
            None => self.image.instantiate(host_externs())?,
        };
        instance.reset(shape.global, shape.local, shape.groups, shape.dim);
        let function: KernelFn = instance.function(self.name)?;
        let lent = Lent {
            instance: Some(instance),
            pool: self.pool,
        };
        let params = self.params.as_ptr();
        Ok(Box::new(move || {
            let _keep = &lent;
            // SAFETY: the instance that holds `function` is kept alive by `lent`; params
            // follows the entry point ABI
            unsafe { function(params) };
        }))
    }
}

impl HostFunction {
    fn entry_for(&self, device: &Device) -> Option<&FunctionEntry> {
        self.entries.iter().find(|(index, _)| *index == device.index).map(|(_, e)| e)
    }

    fn launch(&self, queue: &HostQueue, entry: &FunctionEntry, params: &ExecutionParams<'_>) -> Result<(), Error> {
        if self.info.function_type.is_graphics() {
            return Err(Error::unsupported("graphics functions on Host-Compute"));
        }
        let dim = params.execution_dim;
        let global = normalize_global(dim, params.global_work_size)?;
        let local = select_local_size(entry, dim, global, params.local_work_size)?;
        let groups = group_count(global, local)?;
        let blob = ParamBlob::encode(&self.info, &params.args, &HostResolver, false)?;

        let config = queue.config();
        let mut printf_words: Vec<u32> = Vec::new();
        if self.info.uses_soft_printf() {
            let initial = PrintfBuffer::initial_contents(config.printf_buffer_size);
            printf_words = vec![0u32; initial.len().div_ceil(4)];
            bytemuck::cast_slice_mut::<u32, u8>(&mut printf_words)[..initial.len()].copy_from_slice(&initial);
        }
        let printf = std::ptr::NonNull::new(printf_words.as_mut_ptr().cast::<u8>())
            .filter(|_| !printf_words.is_empty())
            .map(PrintfTarget);

        let launch = Launch {
            shape: LaunchShape {
                dim,
                global,
                local,
                groups,
                simd_width: entry.required_simd_width.unwrap_or(queue.device().simd_width).max(1),
            },
            schedule: Schedule::select(self.info.flags, params.cooperative),
            workers: config.worker_count(),
            fiber_stack_size: config.fiber_stack_size,
            local_memory_size: self.local_memory_size,
            printf,
        };
        logwise::trace_sync!(
            "function::execute: {name} global {global} local {local} {schedule}",
            name = self.info.name.clone(),
            global = logwise::privacy::LogIt(&global),
            local = logwise::privacy::LogIt(&local),
            schedule = logwise::privacy::LogIt(&launch.schedule)
        );

        let result = match &self.body {
            HostBody::Native(body) => executor::run(
                &launch,
                &NativeLaunch {
                    body,
                    args: KernelArgs::from_blob(&self.info, &blob),
                },
            ),
            HostBody::Elf { image, pool } => {
                let mut pointers: Vec<*const u8> = blob
                    .offsets()
                    .iter()
                    .map(|offset| blob.bytes().as_ptr().wrapping_add(*offset))
                    .collect();
                if let Some(target) = printf {
                    pointers.push(target.0.as_ptr());
                }
                executor::run(
                    &launch,
                    &ElfLaunch {
                        image,
                        pool,
                        name: &self.info.name,
                        params: pointers,
                    },
                )
            }
        };
        if !printf_words.is_empty() {
            soft_printf::print_buffer(bytemuck::cast_slice(&printf_words))?;
        }
        result
    }
}

impl Function for HostFunction {
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
        self.entry_for(device)
    }

    fn platform_type(&self) -> PlatformType {
        PlatformType::Host
    }

    fn execute(&self, queue: &dyn Queue, mut params: ExecutionParams<'_>) -> Result<(), Error> {
        const OP: &str = "function::execute";
        let target = HostQueue::downcast(queue, OP).and_then(|host| {
            let entry = self.entry_for(queue.device()).ok_or_else(|| {
                report(
                    OP,
                    PlatformType::Host,
                    Error::invalid(format!("\"{}\" is not available on {}", self.info.name, queue.device())),
                )
            })?;
            Ok((host, entry))
        });
        let (host, entry) = match target {
            Ok(target) => target,
            Err(e) => {
                // nothing was submitted, release the waiters anyway
                signal_all(&params.signal_fences);
                if let Some(completion) = params.completion.take() {
                    completion();
                }
                return Err(e);
            }
        };
        host.submit(|| {
            wait_all(&params.wait_fences);
            let result = self.launch(host, entry, &params);
            signal_all(&params.signal_fences);
            if let Some(completion) = params.completion.take() {
                completion();
            }
            result.map_err(|e| report(OP, PlatformType::Host, e))
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
        let entry = self.entry_for(queue.device()).ok_or_else(|| {
            report(
                OP,
                PlatformType::Host,
                Error::invalid(format!("\"{}\" is not available on {}", self.info.name, queue.device())),
            )
        })?;
        create_argument_buffer_internal(
            queue,
            entry,
            arg_index,
            extra_flags,
            zero_init,
            Box::new(HostArgumentEncoder),
            |size, flags| {
                let buffer: Arc<dyn Buffer> = HostBuffer::new(BufferRequest {
                    device: queue.device().clone(),
                    size,
                    flags: flags | MemoryFlags::HOST_READ_WRITE,
                    host: None,
                    initial: None,
                    registry: &self.allocator.registry,
                    allocated: &self.allocator.allocated,
                    sharing: None,
                })
                .map_err(|e| report(OP, PlatformType::Host, e))?;
                Ok(buffer)
            },
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct HostProgram {
    functions: HashMap<String, Arc<HostFunction>>,
}

impl HostProgram {
    fn assemble(
        context: &HostContext,
        kernels: impl IntoIterator<Item = (FunctionInfo, HostBody)>,
        local_memory_size: Option<usize>,
    ) -> HostProgram {
        let allocator = Allocator {
            registry: context.registry().clone(),
            allocated: context.allocated().clone(),
        };
        let mut functions = HashMap::new();
        for (info, body) in kernels {
            let info = Arc::new(info);
            let entries: Vec<(u32, FunctionEntry)> = context
                .devices()
                .iter()
                .filter_map(|device| FunctionEntry::for_device(info.clone(), device).map(|e| (device.index, e)))
                .collect();
            if entries.is_empty() {
                logwise::warn_sync!(
                    "host: no device can run \"{name}\"",
                    name = info.name.clone()
                );
                continue;
            }
            let local_memory_size = local_memory_size.unwrap_or_else(|| {
                context
                    .devices()
                    .iter()
                    .map(|d| d.local_mem_size as usize)
                    .max()
                    .unwrap_or(0)
            });
            functions.insert(
                info.name.clone(),
                Arc::new(HostFunction {
                    info,
                    entries,
                    body,
                    local_memory_size,
                    allocator: allocator.clone(),
                }),
            );
        }
        HostProgram { functions }
    }

    fn from_object(context: &HostContext, code: Vec<u8>, functions: Vec<Arc<FunctionInfo>>) -> Result<HostProgram, Error> {
        let image = Arc::new(ElfImage::parse(code)?);
        // instantiate once up front so link errors surface at program creation
        let pool = Arc::new(Mutex::new(vec![image.instantiate(host_externs())?]));
        let kernels: Vec<(FunctionInfo, HostBody)> = functions
            .into_iter()
            .filter(|info| {
                let defined = image.defines(&info.name);
                if !defined {
                    logwise::warn_sync!(
                        "host: function \"{name}\" is not defined by the object",
                        name = info.name.clone()
                    );
                }
                defined
            })
            .map(|info| {
                let info = Arc::unwrap_or_clone(info);
                let body = HostBody::Elf {
                    image: image.clone(),
                    pool: pool.clone(),
                };
                (info, body)
            })
            .collect();
        Ok(Self::assemble(context, kernels, None))
    }

    pub(crate) fn from_source(context: &HostContext, source: ProgramSource) -> Result<HostProgram, Error> {
        match source {
            ProgramSource::Source { .. } => Err(Error::unsupported(
                "Host-Compute has no online compiler; load an ELF object or a universal binary",
            )),
            ProgramSource::Module { path, functions } => {
                let code = std::fs::read(&path)?;
                Self::from_object(context, code, functions.into_iter().map(Arc::new).collect())
            }
            ProgramSource::UniversalBinary(binary) => {
                let device = context
                    .devices()
                    .first()
                    .ok_or(Error::ContextUnsupported)?;
                let entry = binary
                    .best_entry_for(device)
                    .ok_or_else(|| Error::InvalidBinary("no Host-Compute entry for this machine".to_string()))?;
                if !entry.has_arg_info {
                    logwise::warn_sync!("host: universal binary carries no argument info; only argument-less functions can run");
                }
                Self::from_object(context, entry.code.clone(), entry.functions.clone())
            }
        }
    }
}

impl Program for HostProgram {
    fn function(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.functions.get(name).map(|f| f.clone() as Arc<dyn Function>)
    }

    fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    fn platform_type(&self) -> PlatformType {
        PlatformType::Host
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builds a Host-Compute program from Rust closures.
///
/// ```no_run
/// # use floor::{ContextConfig, Context, HostContext, HostProgramBuilder, FunctionInfo, ArgInfo, ArgAccess};
/// let context = HostContext::new(ContextConfig::host());
/// let program = HostProgramBuilder::new()
///     .kernel(
///         FunctionInfo::kernel("double", vec![ArgInfo::buffer(ArgAccess::ReadWrite)]),
///         |args| {
///             let data = args.buffer(0);
///             let i = floor::kernel::global_id(0) as usize;
///             data.set(i, data.get::<f32>(i) * 2.0);
///         },
///     )
///     .build(&context)
///     .unwrap();
/// assert!(program.function("double").is_some());
/// ```
#[derive(Default)]
pub struct HostProgramBuilder {
    kernels: Vec<(FunctionInfo, NativeKernel)>,
    local_memory_size: Option<usize>,
}

impl std::fmt::Debug for HostProgramBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProgramBuilder")
            .field("kernels", &self.kernels.iter().map(|(info, _)| &info.name).collect::<Vec<_>>())
            .field("local_memory_size", &self.local_memory_size)
            .finish()
    }
}

impl HostProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kernel(mut self, info: FunctionInfo, body: impl Fn(&KernelArgs) + Send + Sync + 'static) -> Self {
        self.kernels.push((info, Arc::new(body)));
        self
    }

    /// Local memory per work-group for every function of the program; defaults to the device
    /// maximum.
    pub fn local_memory(mut self, bytes: usize) -> Self {
        self.local_memory_size = Some(bytes);
        self
    }

    pub fn build(self, context: &dyn Context) -> Result<Arc<dyn Program>, Error> {
        ensure_supported(context, "host_program_builder::build")?;
        let host = context.as_any().downcast_ref::<HostContext>().ok_or_else(|| {
            report(
                "host_program_builder::build",
                context.platform_type(),
                Error::invalid("native kernels need a Host-Compute context"),
            )
        })?;
        let kernels = self
            .kernels
            .into_iter()
            .map(|(info, body)| (info, HostBody::Native(body)));
        let program = HostProgram::assemble(host, kernels, self.local_memory_size);
        Ok(Arc::new(program))
    }
}
