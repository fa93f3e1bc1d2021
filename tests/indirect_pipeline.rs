// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use floor::indirect::IndirectCommand;
use floor::pipeline_description::IndirectCommandType;
use floor::queue::IndirectExecutionParams;
use floor::{
    ArgAccess, ArgInfo, Buffer, CapturedArg, Context, ContextConfig, FunctionInfo, HostContext, HostProgramBuilder,
    Fence, IndirectCommandDescription, MemoryFlags, Program, Queue, SignalFence, SyncStage,
};

struct Fixture {
    context: HostContext,
    queue: Arc<dyn Queue>,
    program: Arc<dyn Program>,
    counters: Arc<dyn Buffer>,
}

/// `add(counters, index, amount)` adds `amount` to `counters[index]` once per work-item.
fn fixture() -> Fixture {
    let context = HostContext::new(ContextConfig::host());
    let device = context.fastest_device().expect("host device").clone();
    let queue = context.create_queue(&device).unwrap();
    let program = HostProgramBuilder::new()
        .kernel(
            FunctionInfo::kernel(
                "add",
                vec![ArgInfo::buffer(ArgAccess::ReadWrite), ArgInfo::plain(4), ArgInfo::plain(4)],
            ),
            |args| {
                let index: u32 = args.value(1);
                let amount: u32 = args.value(2);
                args.buffer(0).atomic_u32(index as usize).fetch_add(amount, Ordering::Relaxed);
            },
        )
        .kernel(
            FunctionInfo::kernel("many", (0..4).map(|_| ArgInfo::buffer(ArgAccess::Read)).collect()),
            |_| {},
        )
        .build(&context)
        .unwrap();
    let counters = context
        .create_buffer(queue.as_ref(), 4 * 4, MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ)
        .unwrap();
    Fixture {
        context,
        queue,
        program,
        counters,
    }
}

fn counters(fixture: &Fixture) -> Vec<u32> {
    let mut bytes = [0u8; 16];
    fixture.counters.read_into(fixture.queue.as_ref(), &mut bytes, 0).unwrap();
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

fn description(fixture: &Fixture, max_commands: u32) -> IndirectCommandDescription {
    let add = fixture.program.function("add").unwrap();
    let mut description = IndirectCommandDescription::new(IndirectCommandType::Compute, max_commands);
    description.compute_buffer_counts_from_functions(&[add.as_ref()]).unwrap();
    description.debug_label = "adds".to_string();
    description
}

#[test]
fn record_and_replay() {
    let fixture = fixture();
    let device = fixture.queue.device().clone();
    let add = fixture.program.function("add").unwrap();
    let pipeline = fixture
        .context
        .create_indirect_command_pipeline(description(&fixture, 8))
        .unwrap();
    assert_eq!(pipeline.description().max_kernel_buffer_count, 3);

    for (index, amount, items) in [(0u32, 1u32, 4u32), (1, 10, 2), (2, 100, 8)] {
        let mut encoder = pipeline.add_compute_command(&device, add.clone()).unwrap();
        encoder
            .set_arguments(vec![
                CapturedArg::from(&fixture.counters),
                CapturedArg::value(&index),
                CapturedArg::value(&amount),
            ])
            .unwrap();
        encoder.execute(1, [items, 1, 1], [0, 0, 0]).unwrap();
    }
    assert_eq!(pipeline.command_count(Some(&device)), 3);

    // execution requires a completed pipeline
    assert!(
        fixture
            .queue
            .execute_indirect(&pipeline, IndirectExecutionParams::default(), 0, 3)
            .is_err()
    );
    pipeline.complete(None).unwrap();
    assert!(pipeline.add_compute_command(&device, add.clone()).unwrap().execute(1, [1, 1, 1], [0, 0, 0]).is_err());

    fixture
        .queue
        .execute_indirect(&pipeline, IndirectExecutionParams::default(), 0, 3)
        .unwrap();
    assert_eq!(counters(&fixture), vec![4, 20, 800, 0]);

    // a sub-range replays only those commands
    fixture
        .queue
        .execute_indirect(&pipeline, IndirectExecutionParams::default(), 1, 1)
        .unwrap();
    assert_eq!(counters(&fixture), vec![4, 40, 800, 0]);
    assert!(
        fixture
            .queue
            .execute_indirect(&pipeline, IndirectExecutionParams::default(), 2, 2)
            .is_err()
    );

    let commands = pipeline.commands_for(&device, 0, 3).unwrap();
    assert!(matches!(&commands[2], IndirectCommand::Compute(c) if c.global_work_size == [8, 1, 1]));

    pipeline.reset();
    assert_eq!(pipeline.command_count(None), 0);
}

#[test]
fn replay_signals_and_completes_once() {
    let fixture = fixture();
    let device = fixture.queue.device().clone();
    let add = fixture.program.function("add").unwrap();
    let pipeline = fixture
        .context
        .create_indirect_command_pipeline(description(&fixture, 4))
        .unwrap();
    for _ in 0..2 {
        let mut encoder = pipeline.add_compute_command(&device, add.clone()).unwrap();
        encoder
            .set_arguments(vec![
                CapturedArg::from(&fixture.counters),
                CapturedArg::value(&3u32),
                CapturedArg::value(&1u32),
            ])
            .unwrap()
            .barrier();
        encoder.execute(1, [16, 1, 1], [4, 0, 0]).unwrap();
    }
    pipeline.complete(Some(&device)).unwrap();

    let fence = fixture.context.create_fence(fixture.queue.as_ref()).unwrap();
    let completions = Arc::new(AtomicU32::new(0));
    let counter = completions.clone();
    let params = IndirectExecutionParams {
        signal_fences: vec![SignalFence::new(&fence, 1, SyncStage::Compute)],
        debug_label: Some("replay".to_string()),
        wait_until_completion: true,
        completion: Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        ..IndirectExecutionParams::default()
    };
    fixture.queue.execute_indirect(&pipeline, params, 0, 2).unwrap();
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(fence.value(), 1);
    assert_eq!(counters(&fixture), vec![0, 0, 0, 32]);
}

#[test]
fn limits_are_enforced() {
    let fixture = fixture();
    let device = fixture.queue.device().clone();
    let add = fixture.program.function("add").unwrap();
    let many = fixture.program.function("many").unwrap();

    let pipeline = fixture
        .context
        .create_indirect_command_pipeline(description(&fixture, 1))
        .unwrap();
    // "many" binds four buffers, the pipeline was sized for three
    assert!(pipeline.add_compute_command(&device, many).is_err());

    let record = || -> Result<(), floor::Error> {
        let mut encoder = pipeline.add_compute_command(&device, add.clone())?;
        encoder.set_arguments(vec![
            CapturedArg::from(&fixture.counters),
            CapturedArg::value(&0u32),
            CapturedArg::value(&1u32),
        ])?;
        encoder.execute(1, [1, 1, 1], [0, 0, 0])
    };
    record().unwrap();
    assert!(record().is_err());

    let mut encoder = pipeline.add_compute_command(&device, add.clone()).unwrap();
    assert!(encoder.set_arguments(vec![CapturedArg::value(&0u32)]).is_err());

    assert!(
        fixture
            .context
            .create_indirect_command_pipeline(IndirectCommandDescription::new(IndirectCommandType::Compute, 0))
            .is_err()
    );
    // the Host-Compute device has no indirect render support
    assert!(
        fixture
            .context
            .create_indirect_command_pipeline(IndirectCommandDescription::new(IndirectCommandType::Render, 4))
            .is_err()
    );
}

fn record_add(
    fixture: &Fixture,
    pipeline: &floor::IndirectCommandPipeline,
    amount: u32,
    global: [u32; 3],
    local: [u32; 3],
) {
    let device = fixture.queue.device().clone();
    let add = fixture.program.function("add").unwrap();
    let mut encoder = pipeline.add_compute_command(&device, add).unwrap();
    encoder
        .set_arguments(vec![
            CapturedArg::from(&fixture.counters),
            CapturedArg::value(&0u32),
            CapturedArg::value(&amount),
        ])
        .unwrap();
    encoder.execute(1, global, local).unwrap();
}

fn signalling_params(fence: &Arc<dyn Fence>, completions: &Arc<AtomicU32>) -> IndirectExecutionParams {
    let counter = completions.clone();
    IndirectExecutionParams {
        signal_fences: vec![SignalFence::new(fence, 1, SyncStage::Compute)],
        completion: Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        ..IndirectExecutionParams::default()
    }
}

#[test]
fn sub_range_runs_only_its_commands() {
    let fixture = fixture();
    let pipeline = fixture
        .context
        .create_indirect_command_pipeline(description(&fixture, 4))
        .unwrap();
    for amount in [1, 2, 4] {
        record_add(&fixture, &pipeline, amount, [1, 1, 1], [0, 0, 0]);
    }
    pipeline.complete(None).unwrap();
    fixture
        .queue
        .execute_indirect(&pipeline, IndirectExecutionParams::default(), 1, 2)
        .unwrap();
    assert_eq!(counters(&fixture)[0], 6);
}

#[test]
fn failed_replay_still_signals_and_completes() {
    let fixture = fixture();
    let pipeline = fixture
        .context
        .create_indirect_command_pipeline(description(&fixture, 4))
        .unwrap();
    // 65 work-items can't be split into groups of 16
    record_add(&fixture, &pipeline, 1, [65, 1, 1], [16, 0, 0]);
    record_add(&fixture, &pipeline, 1, [1, 1, 1], [0, 0, 0]);
    pipeline.complete(None).unwrap();

    let fence = fixture.context.create_fence(fixture.queue.as_ref()).unwrap();
    let completions = Arc::new(AtomicU32::new(0));
    let result = fixture
        .queue
        .execute_indirect(&pipeline, signalling_params(&fence, &completions), 0, 2);
    assert!(result.is_err());
    assert_eq!(fence.value(), 1);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(counters(&fixture)[0], 0);
}

#[test]
fn empty_replay_still_signals_and_completes() {
    let fixture = fixture();
    let pipeline = fixture
        .context
        .create_indirect_command_pipeline(description(&fixture, 4))
        .unwrap();
    record_add(&fixture, &pipeline, 1, [1, 1, 1], [0, 0, 0]);
    pipeline.complete(None).unwrap();

    let fence = fixture.context.create_fence(fixture.queue.as_ref()).unwrap();
    let completions = Arc::new(AtomicU32::new(0));
    fixture
        .queue
        .execute_indirect(&pipeline, signalling_params(&fence, &completions), 1, 0)
        .unwrap();
    assert_eq!(fence.value(), 1);
    assert_eq!(completions.load(Ordering::SeqCst), 1);

    // an out-of-range replay fails but releases its waiters too
    let fence = fixture.context.create_fence(fixture.queue.as_ref()).unwrap();
    assert!(
        fixture
            .queue
            .execute_indirect(&pipeline, signalling_params(&fence, &completions), 1, 1)
            .is_err()
    );
    assert_eq!(fence.value(), 1);
    assert_eq!(completions.load(Ordering::SeqCst), 2);
}
