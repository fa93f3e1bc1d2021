// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use floor::{
    ArgAccess, ArgInfo, Buffer, Context, ContextConfig, ExecutionParams, Fence, Function, FunctionInfo, HostContext,
    HostProgramBuilder, MemoryFlags, PlatformType, Program, SignalFence, SyncStage, TimelineFence, WaitFence,
};

#[test]
fn signals_must_increase() {
    let fence = TimelineFence::new(PlatformType::Host);
    fence.set_debug_label("counter");
    assert_eq!(fence.value(), 0);
    fence.signal(3, SyncStage::Compute).unwrap();
    assert_eq!(fence.value(), 3);
    assert!(fence.signal(3, SyncStage::Compute).is_err());
    assert!(fence.signal(2, SyncStage::Host).is_err());
    assert_eq!(fence.value(), 3);
    assert_eq!(fence.debug_label(), "counter");
}

#[test]
fn earlier_stages_satisfy_later_waits() {
    let fence = TimelineFence::new(PlatformType::Host);
    fence.signal(1, SyncStage::Vertex).unwrap();
    assert!(fence.is_signaled(1, SyncStage::Vertex));
    assert!(fence.is_signaled(1, SyncStage::Fragment));
    assert!(fence.is_signaled(1, SyncStage::Host));
    assert!(!fence.is_signaled(1, SyncStage::TopOfPipe));
    assert!(!fence.is_signaled(2, SyncStage::Host));

    fence.signal(5, SyncStage::Transfer).unwrap();
    assert!(fence.is_signaled(5, SyncStage::BottomOfPipe));
    assert!(!fence.is_signaled(5, SyncStage::Compute));
    // the vertex-stage signal of 1 still counts at compute
    assert!(fence.is_signaled(1, SyncStage::Compute));
}

#[test]
fn wait_blocks_until_signaled_from_another_thread() {
    let fence: Arc<dyn Fence> = Arc::new(TimelineFence::new(PlatformType::Host));
    let signaler = {
        let fence = fence.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            fence.signal(1, SyncStage::Compute).unwrap();
            thread::sleep(Duration::from_millis(20));
            fence.signal(2, SyncStage::Compute).unwrap();
        })
    };
    fence.wait(2, SyncStage::Host);
    assert!(fence.value() >= 2);
    signaler.join().unwrap();
}

#[test]
fn context_fences_guard_launches() {
    let context = HostContext::new(ContextConfig::host());
    let device = context.fastest_device().unwrap().clone();
    let queue = context.create_queue(&device).unwrap();
    let gate = context.create_fence(queue.as_ref()).unwrap();
    let done = context.create_fence(queue.as_ref()).unwrap();
    assert_eq!(gate.platform_type(), PlatformType::Host);

    let out = context
        .create_buffer(queue.as_ref(), 16 * 4, MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ)
        .unwrap();
    let program = HostProgramBuilder::new()
        .kernel(
            FunctionInfo::kernel("mark", vec![ArgInfo::buffer(ArgAccess::Write)]),
            |args| {
                let out = args.buffer(0);
                let i = floor::kernel::global_id(0) as usize;
                out.set::<u32>(i, 7);
            },
        )
        .build(&context)
        .unwrap();
    let mark = program.function("mark").unwrap();

    let completions = Arc::new(AtomicU32::new(0));
    let opener = {
        let gate = gate.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            gate.signal(1, SyncStage::Compute).unwrap();
        })
    };
    let counter = completions.clone();
    mark.execute(
        queue.as_ref(),
        ExecutionParams::linear(16, 0)
            .arg(&out)
            .wait_for(WaitFence::new(&gate, 1, SyncStage::Compute))
            .signal(SignalFence::new(&done, 1, SyncStage::Compute))
            .on_completion(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .blocking(),
    )
    .unwrap();
    opener.join().unwrap();

    assert!(gate.is_signaled(1, SyncStage::Compute));
    assert!(done.is_signaled(1, SyncStage::Host));
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    let mut bytes = vec![0u8; 16 * 4];
    out.read_into(queue.as_ref(), &mut bytes, 0).unwrap();
    assert!(bytes.chunks_exact(4).all(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]) == 7));
}
