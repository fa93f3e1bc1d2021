// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use floor::kernel;
use floor::{
    Arg, ArgAccess, ArgInfo, Buffer, Context, ContextConfig, ExecutionParams, Function, FunctionFlags, FunctionInfo,
    HostContext, HostProgramBuilder, MemoryFlags, MemoryObject, PlatformType, Program, ProgramSource, Queue,
};

fn host() -> (HostContext, Arc<dyn Queue>) {
    let context = HostContext::new(ContextConfig::host());
    let device = context.fastest_device().expect("host device").clone();
    let queue = context.create_queue(&device).unwrap();
    (context, queue)
}

fn output(context: &HostContext, queue: &dyn Queue, count: usize) -> Arc<dyn Buffer> {
    context
        .create_buffer(queue, count * 4, MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ)
        .unwrap()
}

fn read_words(buffer: &dyn Buffer, queue: &dyn Queue) -> Vec<u32> {
    let mut bytes = vec![0u8; buffer.size()];
    buffer.read_into(queue, &mut bytes, 0).unwrap();
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

#[test]
fn work_item_ids() {
    let (context, queue) = host();
    let out = output(&context, queue.as_ref(), 8 * 4);
    let program = HostProgramBuilder::new()
        .kernel(
            FunctionInfo::kernel("ids", vec![ArgInfo::buffer(ArgAccess::Write)]),
            |args| {
                let out = args.buffer(0);
                let (x, y) = (kernel::global_id(0), kernel::global_id(1));
                let packed = kernel::local_id(0)
                    | kernel::local_id(1) << 4
                    | kernel::group_id(0) << 8
                    | kernel::group_id(1) << 12
                    | kernel::work_dim() << 16;
                assert_eq!(kernel::global_size(0), 8);
                assert_eq!(kernel::local_size(1), 2);
                assert_eq!(kernel::group_count(0), 2);
                out.set::<u32>((y * 8 + x) as usize, packed);
            },
        )
        .build(&context)
        .unwrap();
    let ids = program.function("ids").unwrap();
    ids.execute(
        queue.as_ref(),
        ExecutionParams::new(2, [8, 4, 0], [4, 2, 0]).arg(&out).blocking(),
    )
    .unwrap();

    let words = read_words(out.as_ref(), queue.as_ref());
    for y in 0..4u32 {
        for x in 0..8u32 {
            let expected = (x % 4) | (y % 2) << 4 | (x / 4) << 8 | (y / 2) << 12 | 2 << 16;
            assert_eq!(words[(y * 8 + x) as usize], expected, "item ({x}, {y})");
        }
    }
}

#[test]
fn plain_arguments_and_arity() {
    let (context, queue) = host();
    let out = output(&context, queue.as_ref(), 16);
    let program = HostProgramBuilder::new()
        .kernel(
            FunctionInfo::kernel(
                "scale",
                vec![ArgInfo::buffer(ArgAccess::Write), ArgInfo::plain(4), ArgInfo::plain(8)],
            ),
            |args| {
                let out = args.buffer(0);
                let factor: u32 = args.value(1);
                let offset: u64 = args.value(2);
                let i = kernel::global_id(0);
                out.set::<u32>(i as usize, i * factor + offset as u32);
            },
        )
        .build(&context)
        .unwrap();
    let scale = program.function("scale").unwrap();
    assert_eq!(scale.platform_type(), PlatformType::Host);
    scale
        .execute(
            queue.as_ref(),
            ExecutionParams::linear(16, 0)
                .arg(&out)
                .arg(Arg::value(&3u32))
                .arg(Arg::value(&100u64))
                .blocking(),
        )
        .unwrap();
    let expected: Vec<u32> = (0..16).map(|i| i * 3 + 100).collect();
    assert_eq!(read_words(out.as_ref(), queue.as_ref()), expected);

    // missing argument
    assert!(
        scale
            .execute(queue.as_ref(), ExecutionParams::linear(16, 0).arg(&out).arg(Arg::value(&3u32)))
            .is_err()
    );
    // wrong plain size
    assert!(
        scale
            .execute(
                queue.as_ref(),
                ExecutionParams::linear(16, 0)
                    .arg(&out)
                    .arg(Arg::value(&3u64))
                    .arg(Arg::value(&1u64)),
            )
            .is_err()
    );
    // global size is not a multiple of the local size
    assert!(
        scale
            .execute(
                queue.as_ref(),
                ExecutionParams::linear(10, 4)
                    .arg(&out)
                    .arg(Arg::value(&3u32))
                    .arg(Arg::value(&1u64)),
            )
            .is_err()
    );
}

#[test]
fn barriers_and_local_memory() {
    let (context, queue) = host();
    let out = output(&context, queue.as_ref(), 32);
    let program = HostProgramBuilder::new()
        .kernel(
            FunctionInfo::kernel("rotate", vec![ArgInfo::buffer(ArgAccess::Write)])
                .with_flags(FunctionFlags::USES_BARRIERS)
                .with_required_local_size([8, 1, 1]),
            |args| {
                let shared = kernel::local_memory();
                let lid = kernel::local_id(0) as usize;
                shared.set::<u32>(lid, kernel::global_id(0));
                kernel::barrier();
                let neighbor: u32 = shared.get((lid + 1) % 8);
                args.buffer(0).set::<u32>(kernel::global_id(0) as usize, neighbor);
            },
        )
        .local_memory(8 * 4)
        .build(&context)
        .unwrap();
    let rotate = program.function("rotate").unwrap();
    rotate
        .execute(queue.as_ref(), ExecutionParams::linear(32, 0).arg(&out).blocking())
        .unwrap();
    let words = read_words(out.as_ref(), queue.as_ref());
    for (i, value) in words.iter().enumerate() {
        let group = i / 8;
        let expected = group * 8 + (i % 8 + 1) % 8;
        assert_eq!(*value as usize, expected, "item {i}");
    }
}

#[test]
fn local_atomics() {
    let (context, queue) = host();
    let out = output(&context, queue.as_ref(), 4);
    let program = HostProgramBuilder::new()
        .kernel(
            FunctionInfo::kernel("count", vec![ArgInfo::buffer(ArgAccess::ReadWrite)])
                .with_flags(FunctionFlags::USES_BARRIERS),
            |args| {
                let shared = kernel::local_memory();
                shared.atomic_u32(0).fetch_add(1, Ordering::Relaxed);
                kernel::barrier();
                if kernel::local_id(0) == 0 {
                    let total = shared.atomic_u32(0).load(Ordering::Relaxed);
                    args.buffer(0).atomic_u32(kernel::group_id(0) as usize).store(total, Ordering::Relaxed);
                }
            },
        )
        .local_memory(16)
        .build(&context)
        .unwrap();
    program
        .function("count")
        .unwrap()
        .execute(queue.as_ref(), ExecutionParams::linear(64, 16).arg(&out).blocking())
        .unwrap();
    assert_eq!(read_words(out.as_ref(), queue.as_ref()), vec![16; 4]);
}

#[test]
fn every_barrier_starts_a_new_phase() {
    const BARRIERS: u32 = 3;
    let (context, queue) = host();
    let out = output(&context, queue.as_ref(), 32);
    let program = HostProgramBuilder::new()
        .kernel(
            FunctionInfo::kernel("phases", vec![ArgInfo::buffer(ArgAccess::Write)])
                .with_flags(FunctionFlags::USES_BARRIERS),
            |args| {
                let shared = kernel::local_memory();
                let mut phases = 0u32;
                for phase in 0..=BARRIERS {
                    // every member of the group increments once per phase
                    let seen = shared.atomic_u32(0).fetch_add(1, Ordering::Relaxed);
                    if seen / 8 == phase {
                        phases += 1;
                    }
                    if phase < BARRIERS {
                        kernel::barrier();
                    }
                }
                args.buffer(0).set::<u32>(kernel::global_id(0) as usize, phases);
            },
        )
        .local_memory(4)
        .build(&context)
        .unwrap();
    program
        .function("phases")
        .unwrap()
        .execute(queue.as_ref(), ExecutionParams::linear(32, 8).arg(&out).blocking())
        .unwrap();
    assert_eq!(read_words(out.as_ref(), queue.as_ref()), vec![BARRIERS + 1; 32]);
}

#[test]
fn cooperative_global_barrier() {
    let (context, queue) = host();
    let out = output(&context, queue.as_ref(), 16);
    let scratch = output(&context, queue.as_ref(), 16);
    let program = HostProgramBuilder::new()
        .kernel(
            FunctionInfo::kernel(
                "reverse",
                vec![ArgInfo::buffer(ArgAccess::ReadWrite), ArgInfo::buffer(ArgAccess::Write)],
            )
            .with_flags(FunctionFlags::USES_GLOBAL_BARRIER),
            |args| {
                let scratch = args.buffer(0);
                let i = kernel::global_id(0);
                scratch.set::<u32>(i as usize, i * 10);
                kernel::global_barrier();
                let mirrored: u32 = scratch.get((15 - i) as usize);
                args.buffer(1).set::<u32>(i as usize, mirrored);
            },
        )
        .build(&context)
        .unwrap();
    program
        .function("reverse")
        .unwrap()
        .execute(
            queue.as_ref(),
            ExecutionParams::linear(16, 4).arg(&scratch).arg(&out).cooperative().blocking(),
        )
        .unwrap();
    let expected: Vec<u32> = (0..16).rev().map(|i| i * 10).collect();
    assert_eq!(read_words(out.as_ref(), queue.as_ref()), expected);
}

#[test]
fn soft_printf() {
    let (context, queue) = host();
    let out = output(&context, queue.as_ref(), 2);
    let body = |args: &floor::kernel::KernelArgs| {
        let printed = kernel::printf("item %u of %u\n", &[kernel::global_id(0), kernel::global_size(0)]);
        args.buffer(0).set::<u32>(kernel::global_id(0) as usize, printed as u32);
    };
    let program = HostProgramBuilder::new()
        .kernel(
            FunctionInfo::kernel("printing", vec![ArgInfo::buffer(ArgAccess::Write)])
                .with_flags(FunctionFlags::USES_SOFT_PRINTF),
            body,
        )
        .kernel(FunctionInfo::kernel("silent", vec![ArgInfo::buffer(ArgAccess::Write)]), body)
        .build(&context)
        .unwrap();
    assert_eq!(program.function_names(), vec!["printing".to_string(), "silent".to_string()]);

    let params = || ExecutionParams::linear(2, 0).arg(&out).blocking();
    program.function("printing").unwrap().execute(queue.as_ref(), params()).unwrap();
    assert_eq!(read_words(out.as_ref(), queue.as_ref()), vec![1, 1]);
    program.function("silent").unwrap().execute(queue.as_ref(), params()).unwrap();
    assert_eq!(read_words(out.as_ref(), queue.as_ref()), vec![0, 0]);
}

#[test]
fn argument_buffers() {
    let (context, queue) = host();
    let out = output(&context, queue.as_ref(), 8);
    let layout = Arc::new(FunctionInfo::kernel(
        "params",
        vec![ArgInfo::plain(4), ArgInfo::buffer(ArgAccess::Write)],
    ));
    let program = HostProgramBuilder::new()
        .kernel(
            FunctionInfo::kernel(
                "through_struct",
                vec![ArgInfo::plain(4), ArgInfo::argument_buffer(layout.clone())],
            ),
            |args| {
                let bias: u32 = args.value(0);
                let params = args.argument_buffer(1);
                let base: u32 = params.value(0);
                let i = kernel::global_id(0);
                params.buffer(1).set::<u32>(i as usize, base + bias + i);
            },
        )
        .build(&context)
        .unwrap();
    let function = program.function("through_struct").unwrap();

    assert!(function.create_argument_buffer(queue.as_ref(), 0, MemoryFlags::empty(), true).is_err());
    let argument_buffer = function
        .create_argument_buffer(queue.as_ref(), 1, MemoryFlags::empty(), true)
        .unwrap();
    assert_eq!(argument_buffer.layout().name, "params");
    argument_buffer
        .set_arguments(queue.as_ref(), &[Arg::value(&1000u32), Arg::from(&out)])
        .unwrap();
    assert!(argument_buffer.set_arguments(queue.as_ref(), &[Arg::value(&1000u32)]).is_err());

    function
        .execute(
            queue.as_ref(),
            ExecutionParams::linear(8, 0)
                .arg(Arg::value(&5u32))
                .arg(&argument_buffer)
                .blocking(),
        )
        .unwrap();
    let expected: Vec<u32> = (0..8).map(|i| 1005 + i).collect();
    assert_eq!(read_words(out.as_ref(), queue.as_ref()), expected);
}

#[test]
fn completion_and_profiling() {
    let (context, queue) = host();
    let out = output(&context, queue.as_ref(), 64);
    let program = HostProgramBuilder::new()
        .kernel(
            FunctionInfo::kernel("touch", vec![ArgInfo::buffer(ArgAccess::Write)]),
            |args| args.buffer(0).set::<u32>(kernel::global_id(0) as usize, 1),
        )
        .build(&context)
        .unwrap();
    let touch = program.function("touch").unwrap();

    assert!(queue.stop_profiling().is_err());
    queue.start_profiling().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    for _ in 0..3 {
        let calls = calls.clone();
        queue
            .execute(
                touch.as_ref(),
                ExecutionParams::linear(64, 0).arg(&out).label("touch").on_completion(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
    }
    queue.finish().unwrap();
    queue.stop_profiling().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(read_words(out.as_ref(), queue.as_ref()), vec![1; 64]);

    queue.set_debug_label("main queue");
    assert_eq!(queue.debug_label(), "main queue");
}

#[test]
fn panicking_kernels_fail_the_launch() {
    let (context, queue) = host();
    let program = HostProgramBuilder::new()
        .kernel(FunctionInfo::kernel("boom", Vec::new()), |_| {
            if kernel::global_id(0) == 3 {
                panic!("item 3 failed");
            }
        })
        .build(&context)
        .unwrap();
    let boom = program.function("boom").unwrap();
    assert!(boom.execute(queue.as_ref(), ExecutionParams::linear(8, 0).blocking()).is_err());
}

#[test]
fn host_has_no_online_compiler() {
    let (context, _queue) = host();
    let source = ProgramSource::Source {
        code: "kernel void k() {}".to_string(),
        options: String::new(),
        functions: vec![FunctionInfo::kernel("k", Vec::new())],
    };
    assert!(context.create_program(source).is_err());
}

#[test]
fn unsupported_backends_fall_back_to_host() {
    let config = ContextConfig {
        platform: PlatformType::Cuda,
        ..ContextConfig::host()
    };
    let context = floor::create_context(config);
    assert!(context.is_supported());
    assert_eq!(context.platform_type(), PlatformType::Host);

    let unsupported = floor::UnsupportedContext::new(PlatformType::OpenCl);
    assert!(!unsupported.is_supported());
    assert!(unsupported.devices().is_empty());
}
