// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Runs a grid of work-items on the CPU.

Work-groups are distributed over worker threads.  Inside a worker every group is executed in one
of three ways:

* [Schedule::Loop]: functions without barriers run their items one after another.
* [Schedule::Fibers]: every item gets its own stackful coroutine.  A barrier suspends the
  coroutine; the scheduler resumes a group (or a sub-group) once all of its items reached the
  barrier.
* [Schedule::Cooperative]: like fibers, but every item of the whole grid is co-resident on a
  single scheduler, which additionally makes grid-wide barriers possible.

The item currently running on a thread is published through thread-locals, which is how
[crate::kernel] and the extern table find their ids.
*/

use std::cell::Cell;
use std::panic::AssertUnwindSafe;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use logwise::context::Context;

use crate::error::Error;
use crate::function_info::FunctionFlags;

/// Upper bound on the number of co-resident fibers of a cooperative launch.
pub(crate) const MAX_COOPERATIVE_FIBERS: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BarrierKind {
    Local,
    SubGroup,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LaunchShape {
    pub dim: u32,
    pub global: [u32; 3],
    pub local: [u32; 3],
    pub groups: [u32; 3],
    pub simd_width: u32,
}

fn unflatten(linear: u64, extent: [u32; 3]) -> [u32; 3] {
    let x = extent[0].max(1) as u64;
    let y = extent[1].max(1) as u64;
    [(linear % x) as u32, ((linear / x) % y) as u32, (linear / (x * y)) as u32]
}

impl LaunchShape {
    pub(crate) fn group_size(&self) -> usize {
        self.local.iter().map(|l| *l as usize).product()
    }

    pub(crate) fn group_total(&self) -> u64 {
        self.groups.iter().map(|g| *g as u64).product()
    }

    pub(crate) fn group_id(&self, linear: u64) -> [u32; 3] {
        unflatten(linear, self.groups)
    }

    pub(crate) fn local_id(&self, linear: u32) -> [u32; 3] {
        unflatten(linear as u64, self.local)
    }

    pub(crate) fn simd_width(&self) -> u32 {
        self.simd_width.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Schedule {
    Loop,
    Fibers,
    Cooperative,
}

impl Schedule {
    pub(crate) fn select(flags: FunctionFlags, cooperative: bool) -> Schedule {
        if cooperative || flags.contains(FunctionFlags::USES_GLOBAL_BARRIER) {
            Schedule::Cooperative
        } else if flags.contains(FunctionFlags::USES_BARRIERS) {
            Schedule::Fibers
        } else {
            Schedule::Loop
        }
    }
}

/// Start of an initialized soft-printf buffer the items may append to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PrintfTarget(pub NonNull<u8>);

// SAFETY: appends go through the buffer's atomic header
unsafe impl Send for PrintfTarget {}
unsafe impl Sync for PrintfTarget {}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Launch {
    pub shape: LaunchShape,
    pub schedule: Schedule,
    pub workers: usize,
    pub fiber_stack_size: usize,
    pub local_memory_size: usize,
    pub printf: Option<PrintfTarget>,
}

/// Something that can run one work-item.
///
/// `bind` is called once per worker thread (once in total for cooperative launches); the
/// returned closure is then invoked for every item that worker runs, possibly interleaved
/// on fibers.
pub(crate) trait ItemProgram: Sync {
    fn bind(&self, slot: usize, shape: &LaunchShape) -> Result<Box<dyn Fn() + '_>, Error>;
}

pub(crate) struct ItemState {
    pub local_id: [u32; 3],
    pub group_id: [u32; 3],
    pub linear_local: u32,
    yielder: Cell<*const Yielder<(), BarrierKind>>,
}

impl ItemState {
    fn new(shape: &LaunchShape, group_id: [u32; 3], linear_local: u32) -> ItemState {
        ItemState {
            local_id: shape.local_id(linear_local),
            group_id,
            linear_local,
            yielder: Cell::new(std::ptr::null()),
        }
    }

    pub(crate) fn global_id(&self, shape: &LaunchShape, dim: usize) -> u32 {
        self.group_id[dim] * shape.local[dim] + self.local_id[dim]
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LaunchView {
    pub shape: LaunchShape,
    pub cooperative: bool,
    pub printf: Option<PrintfTarget>,
}

thread_local! {
    static LAUNCH: Cell<Option<LaunchView>> = const { Cell::new(None) };
    static ITEM: Cell<*const ItemState> = const { Cell::new(std::ptr::null()) };
    static GROUP_MEMORY: Cell<(*mut u8, usize)> = const { Cell::new((std::ptr::null_mut(), 0)) };
    /// A barrier the running launch can't honor; fails the launch once the group is done.
    static UNSCHEDULED_BARRIER: Cell<Option<BarrierKind>> = const { Cell::new(None) };
}

/// Clears the thread-locals when a worker leaves the launch, also on unwind.
struct ThreadScope;

impl ThreadScope {
    fn enter(view: LaunchView) -> ThreadScope {
        LAUNCH.set(Some(view));
        ThreadScope
    }
}

impl Drop for ThreadScope {
    fn drop(&mut self) {
        LAUNCH.set(None);
        ITEM.set(std::ptr::null());
        GROUP_MEMORY.set((std::ptr::null_mut(), 0));
        UNSCHEDULED_BARRIER.set(None);
    }
}

/// Calls `f` with the launch and the item running on this thread, if any.
pub(crate) fn with_item<R>(f: impl FnOnce(&LaunchView, &ItemState) -> R) -> Option<R> {
    let view = LAUNCH.get()?;
    let item = ITEM.get();
    if item.is_null() {
        return None;
    }
    // SAFETY: ITEM points at an ItemState the scheduler keeps alive while the item runs
    Some(f(&view, unsafe { &*item }))
}

pub(crate) fn launch_view() -> Option<LaunchView> {
    LAUNCH.get()
}

/// The local memory arena of the running item's group.
pub(crate) fn group_memory() -> (*mut u8, usize) {
    GROUP_MEMORY.get()
}

/// Suspends the running item until the rest of its barrier scope arrives.
pub(crate) fn barrier(kind: BarrierKind) {
    let Some(view) = LAUNCH.get() else {
        logwise::error_sync!("barrier called outside of a Host-Compute launch");
        return;
    };
    if kind == BarrierKind::Global && !view.cooperative {
        logwise::error_sync!("global barrier in a non-cooperative launch");
        UNSCHEDULED_BARRIER.set(Some(kind));
        return;
    }
    let item = ITEM.get();
    if item.is_null() {
        return;
    }
    // SAFETY: see with_item
    let yielder = unsafe { &*item }.yielder.get();
    if yielder.is_null() {
        logwise::error_sync!(
            "barrier {kind} in a function not flagged as using barriers",
            kind = logwise::privacy::LogIt(&kind)
        );
        UNSCHEDULED_BARRIER.set(Some(kind));
        return;
    }
    // SAFETY: the yielder belongs to the coroutine currently executing on this thread
    let yielder = unsafe { &*yielder };
    yielder.suspend(kind);
}

/// Runs the whole grid, blocking until every item finished.
pub(crate) fn run(launch: &Launch, program: &dyn ItemProgram) -> Result<(), Error> {
    let shape = launch.shape;
    let total = shape.group_total();
    if total == 0 || shape.group_size() == 0 {
        return Ok(());
    }
    if launch.schedule == Schedule::Cooperative {
        let fibers = total as usize * shape.group_size();
        if fibers > MAX_COOPERATIVE_FIBERS {
            return Err(Error::invalid(format!(
                "cooperative launch of {fibers} items exceeds {MAX_COOPERATIVE_FIBERS} co-resident items"
            )));
        }
        return guarded(|| run_cooperative(launch, program));
    }

    let next = AtomicU64::new(0);
    let workers = launch.workers.clamp(1, total.min(usize::MAX as u64) as usize);
    if workers == 1 {
        return guarded(|| run_worker(0, launch, program, &next));
    }

    let thread_stack = launch.fiber_stack_size.max(2 * 1024 * 1024);
    let parent = Context::current();
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for slot in 0..workers {
            let next = &next;
            let parent = parent.clone();
            let handle = std::thread::Builder::new()
                .name(format!("floor-host-{slot}"))
                .stack_size(thread_stack)
                .spawn_scoped(scope, move || {
                    let context = Context::new_task(Some(parent), "host worker".to_string());
                    let id = context.context_id();
                    context.set_current();
                    let result = guarded(|| run_worker(slot, launch, program, next));
                    Context::pop(id);
                    result
                })
                .map_err(|e| Error::backend("thread spawn", e.to_string()))?;
            handles.push(handle);
        }
        let mut first_error = None;
        for handle in handles {
            let result = handle
                .join()
                .unwrap_or_else(|panic| Err(Error::backend("panic", panic_message(panic.as_ref()))));
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "work-item panicked".to_string()
    }
}

fn guarded(f: impl FnOnce() -> Result<(), Error>) -> Result<(), Error> {
    std::panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|panic| Err(Error::backend("panic", panic_message(panic.as_ref()))))
}

fn zeroed_arena(size: usize) -> Result<Vec<u128>, Error> {
    let words = size.div_ceil(16);
    let mut arena = Vec::new();
    arena.try_reserve_exact(words).map_err(|_| Error::Allocation(size))?;
    arena.resize(words, 0);
    Ok(arena)
}

fn run_worker(slot: usize, launch: &Launch, program: &dyn ItemProgram, next: &AtomicU64) -> Result<(), Error> {
    let shape = launch.shape;
    let body = program.bind(slot, &shape)?;
    let _scope = ThreadScope::enter(LaunchView {
        shape,
        cooperative: false,
        printf: launch.printf,
    });
    let mut arena = zeroed_arena(launch.local_memory_size)?;
    let mut stacks = StackPool::new(launch.fiber_stack_size);
    let total = shape.group_total();
    loop {
        let group = next.fetch_add(1, Ordering::Relaxed);
        if group >= total {
            return Ok(());
        }
        arena.fill(0);
        GROUP_MEMORY.set((arena.as_mut_ptr().cast(), launch.local_memory_size));
        let group_id = shape.group_id(group);
        match launch.schedule {
            Schedule::Loop => {
                for linear in 0..shape.group_size() as u32 {
                    let item = ItemState::new(&shape, group_id, linear);
                    ITEM.set(&item);
                    body();
                    ITEM.set(std::ptr::null());
                }
            }
            _ => {
                let mut batch = FiberBatch::default();
                for linear in 0..shape.group_size() as u32 {
                    batch.spawn(&mut stacks, &*body, ItemState::new(&shape, group_id, linear), 0, linear / shape.simd_width())?;
                }
                let arenas = [(arena.as_mut_ptr().cast::<u8>(), launch.local_memory_size)];
                batch.run(&arenas, &mut stacks)?;
            }
        }
        unscheduled_barrier()?;
    }
}

/// Fails when an item of the finished group reached a barrier its schedule can't wait on.
fn unscheduled_barrier() -> Result<(), Error> {
    match UNSCHEDULED_BARRIER.take() {
        None => Ok(()),
        Some(kind) => Err(Error::backend(
            "unscheduled barrier",
            format!("{kind:?} barrier reached, but the launch can't synchronize at it"),
        )),
    }
}

fn run_cooperative(launch: &Launch, program: &dyn ItemProgram) -> Result<(), Error> {
    let shape = launch.shape;
    let body = program.bind(0, &shape)?;
    let _scope = ThreadScope::enter(LaunchView {
        shape,
        cooperative: true,
        printf: launch.printf,
    });
    let total = shape.group_total() as usize;
    let mut arenas_storage = Vec::with_capacity(total);
    for _ in 0..total {
        arenas_storage.push(zeroed_arena(launch.local_memory_size)?);
    }
    let arenas: Vec<(*mut u8, usize)> = arenas_storage
        .iter_mut()
        .map(|a| (a.as_mut_ptr().cast::<u8>(), launch.local_memory_size))
        .collect();
    let mut stacks = StackPool::new(launch.fiber_stack_size);
    let mut batch = FiberBatch::default();
    for group in 0..total {
        let group_id = shape.group_id(group as u64);
        for linear in 0..shape.group_size() as u32 {
            batch.spawn(
                &mut stacks,
                &*body,
                ItemState::new(&shape, group_id, linear),
                group,
                linear / shape.simd_width(),
            )?;
        }
    }
    batch.run(&arenas, &mut stacks)?;
    unscheduled_barrier()
}

struct StackPool {
    size: usize,
    free: Vec<DefaultStack>,
}

impl StackPool {
    fn new(size: usize) -> StackPool {
        StackPool { size, free: Vec::new() }
    }

    fn take(&mut self) -> Result<DefaultStack, Error> {
        match self.free.pop() {
            Some(stack) => Ok(stack),
            None => DefaultStack::new(self.size).map_err(|_| Error::Allocation(self.size)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Runnable,
    Waiting(BarrierKind),
    Done,
}

/// A body reference with its lifetime erased so it can move into a coroutine.
#[derive(Clone, Copy)]
struct ErasedBody(*const (dyn Fn() + 'static));

struct Fiber {
    // declared first: the coroutine must go before the state it points into
    coroutine: Coroutine<(), BarrierKind, (), DefaultStack>,
    state: Box<ItemState>,
    status: Status,
    group: usize,
    sub_group: u32,
}

#[derive(Default)]
struct FiberBatch {
    fibers: Vec<Fiber>,
}

impl FiberBatch {
    fn spawn(
        &mut self,
        stacks: &mut StackPool,
        body: &(dyn Fn() + '_),
        state: ItemState,
        group: usize,
        sub_group: u32,
    ) -> Result<(), Error> {
        let state = Box::new(state);
        let state_ptr: *const ItemState = &*state;
        // SAFETY: every coroutine of the batch completes or is reset before `run` returns,
        // while `body` is borrowed for longer than that by the caller
        let body = ErasedBody(unsafe {
            std::mem::transmute::<*const (dyn Fn() + '_), *const (dyn Fn() + 'static)>(body)
        });
        let coroutine = Coroutine::with_stack(stacks.take()?, move |yielder: &Yielder<(), BarrierKind>, ()| {
            let body = body;
            // SAFETY: the state is boxed and owned by the fiber that owns this coroutine
            let state = unsafe { &*state_ptr };
            state.yielder.set(yielder);
            // SAFETY: see above
            unsafe { (*body.0)() };
        });
        self.fibers.push(Fiber {
            coroutine,
            state,
            status: Status::Runnable,
            group,
            sub_group,
        });
        Ok(())
    }

    fn run(mut self, arenas: &[(*mut u8, usize)], stacks: &mut StackPool) -> Result<(), Error> {
        let result = self.schedule(arenas);
        for fiber in self.fibers.drain(..) {
            let mut coroutine = fiber.coroutine;
            if !coroutine.done() {
                // SAFETY: abandons the suspended item without unwinding through foreign frames
                unsafe { coroutine.force_reset() };
            }
            stacks.free.push(coroutine.into_stack());
        }
        result
    }

    fn schedule(&mut self, arenas: &[(*mut u8, usize)]) -> Result<(), Error> {
        loop {
            for fiber in self.fibers.iter_mut().filter(|f| f.status == Status::Runnable) {
                ITEM.set(&*fiber.state);
                GROUP_MEMORY.set(arenas[fiber.group]);
                let resumed = std::panic::catch_unwind(AssertUnwindSafe(|| fiber.coroutine.resume(())));
                fiber.status = match resumed {
                    Ok(CoroutineResult::Yield(kind)) => Status::Waiting(kind),
                    Ok(CoroutineResult::Return(())) => Status::Done,
                    Err(panic) => {
                        ITEM.set(std::ptr::null());
                        return Err(Error::backend("panic", panic_message(panic.as_ref())));
                    }
                };
            }
            ITEM.set(std::ptr::null());

            if self.fibers.iter().all(|f| f.status == Status::Done) {
                return Ok(());
            }
            if !self.release() {
                return Err(Error::backend(
                    "divergent barrier",
                    "not every work-item of a barrier scope reached the same barrier",
                ));
            }
        }
    }

    /// Makes every complete barrier scope runnable again; false when none is complete.
    fn release(&mut self) -> bool {
        let all_global = self
            .fibers
            .iter()
            .all(|f| f.status == Status::Waiting(BarrierKind::Global));
        if all_global {
            self.fibers.iter_mut().for_each(|f| f.status = Status::Runnable);
            return true;
        }

        let mut released = false;
        let mut start = 0;
        while start < self.fibers.len() {
            let group = self.fibers[start].group;
            let end = start
                + self.fibers[start..]
                    .iter()
                    .take_while(|f| f.group == group)
                    .count();
            let members = &mut self.fibers[start..end];
            if members.iter().all(|f| f.status == Status::Waiting(BarrierKind::Local)) {
                members.iter_mut().for_each(|f| f.status = Status::Runnable);
                released = true;
            } else {
                let mut sub_start = 0;
                while sub_start < members.len() {
                    let sub_group = members[sub_start].sub_group;
                    let sub_end = sub_start
                        + members[sub_start..]
                            .iter()
                            .take_while(|f| f.sub_group == sub_group)
                            .count();
                    let subs = &mut members[sub_start..sub_end];
                    if subs.iter().all(|f| f.status == Status::Waiting(BarrierKind::SubGroup)) {
                        subs.iter_mut().for_each(|f| f.status = Status::Runnable);
                        released = true;
                    }
                    sub_start = sub_end;
                }
            }
            start = end;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    struct Closure<F>(F);

    impl<F: Fn() + Sync> ItemProgram for Closure<F> {
        fn bind(&self, _slot: usize, _shape: &LaunchShape) -> Result<Box<dyn Fn() + '_>, Error> {
            Ok(Box::new(|| (self.0)()))
        }
    }

    fn launch(schedule: Schedule, groups: u32, local: u32) -> Launch {
        Launch {
            shape: LaunchShape {
                dim: 1,
                global: [groups * local, 1, 1],
                local: [local, 1, 1],
                groups: [groups, 1, 1],
                simd_width: 4,
            },
            schedule,
            workers: 3,
            fiber_stack_size: 64 * 1024,
            local_memory_size: 64,
            printf: None,
        }
    }

    fn current_global_id() -> u32 {
        with_item(|view, item| item.global_id(&view.shape, 0)).unwrap()
    }

    #[test]
    fn loop_schedule_visits_every_item_once() {
        let seen = Mutex::new(vec![0u32; 40]);
        let program = Closure(|| seen.lock().unwrap()[current_global_id() as usize] += 1);
        run(&launch(Schedule::Loop, 5, 8), &program).unwrap();
        assert!(seen.lock().unwrap().iter().all(|c| *c == 1));
    }

    #[test]
    fn barriers_order_phases_within_a_group() {
        // phase 1 writes, phase 2 reads its neighbour's slot in local memory
        let mismatches = AtomicU32::new(0);
        let program = Closure(|| {
            let (arena, _) = group_memory();
            let (local, size) = with_item(|view, item| (item.linear_local as usize, view.shape.group_size())).unwrap();
            let slots = arena.cast::<u32>();
            // SAFETY: 16 u32 slots fit the 64-byte arena
            unsafe { *slots.add(local) = local as u32 + 1 };
            barrier(BarrierKind::Local);
            let neighbour = (local + 1) % size;
            if unsafe { *slots.add(neighbour) } != neighbour as u32 + 1 {
                mismatches.fetch_add(1, Ordering::Relaxed);
            }
        });
        run(&launch(Schedule::Fibers, 6, 16), &program).unwrap();
        assert_eq!(mismatches.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn cooperative_global_barrier() {
        let arrived = AtomicU32::new(0);
        let short = AtomicU32::new(0);
        let program = Closure(|| {
            arrived.fetch_add(1, Ordering::Relaxed);
            barrier(BarrierKind::Global);
            if arrived.load(Ordering::Relaxed) != 24 {
                short.fetch_add(1, Ordering::Relaxed);
            }
        });
        run(&launch(Schedule::Cooperative, 3, 8), &program).unwrap();
        assert_eq!(short.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn sub_group_barrier_releases_sub_groups_independently() {
        let order = Mutex::new(Vec::new());
        let program = Closure(|| {
            let local = with_item(|_, item| item.linear_local).unwrap();
            if local < 4 {
                barrier(BarrierKind::SubGroup);
            }
            order.lock().unwrap().push(local);
        });
        run(&launch(Schedule::Fibers, 1, 4), &program).unwrap();
        assert_eq!(order.lock().unwrap().len(), 4);
    }

    #[test]
    fn divergent_barrier_is_an_error() {
        let program = Closure(|| {
            let local = with_item(|_, item| item.linear_local).unwrap();
            if local == 0 {
                barrier(BarrierKind::Local);
            }
        });
        let result = run(&launch(Schedule::Fibers, 1, 4), &program);
        assert!(matches!(result, Err(Error::Backend { .. })));
    }

    #[test]
    fn barriers_without_fibers_fail_the_launch() {
        let after = AtomicU32::new(0);
        let program = Closure(|| {
            barrier(BarrierKind::Local);
            after.fetch_add(1, Ordering::Relaxed);
        });
        let result = run(&launch(Schedule::Loop, 2, 4), &program);
        assert!(matches!(result, Err(Error::Backend { .. })));

        let global = Closure(|| barrier(BarrierKind::Global));
        assert!(run(&launch(Schedule::Fibers, 2, 4), &global).is_err());
    }

    #[test]
    fn panics_become_errors() {
        let program = Closure(|| panic!("boom"));
        let result = run(&launch(Schedule::Loop, 4, 1), &program);
        assert!(matches!(result, Err(Error::Backend { ref message, .. }) if message == "boom"));
    }

    #[test]
    fn schedule_selection() {
        assert_eq!(Schedule::select(FunctionFlags::empty(), false), Schedule::Loop);
        assert_eq!(Schedule::select(FunctionFlags::USES_BARRIERS, false), Schedule::Fibers);
        assert_eq!(Schedule::select(FunctionFlags::USES_BARRIERS, true), Schedule::Cooperative);
        assert_eq!(
            Schedule::select(FunctionFlags::USES_GLOBAL_BARRIER, false),
            Schedule::Cooperative
        );
    }
}
