// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Per-device command queues.

Submissions to one queue execute in submission order.  Ordering across queues (or backends)
needs a fence: the submission waiting on a fence value starts only after the submission that
signals it has reached the named stage.
*/

use std::any::Any;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::args::Arg;
use crate::device::{Device, PlatformType};
use crate::error::{Error, report};
use crate::fence::{SignalFence, WaitFence};
use crate::indirect::IndirectCommandPipeline;
use crate::program::{Function, FunctionEntry};

/// Called once the device finished a submission.
pub type CompletionHandler = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    /// Graphics, compute and transfer.
    All,
    Compute,
}

/// Everything one kernel/shader launch needs.
///
/// A component of 0 in `local_work_size` lets the library choose it.
pub struct ExecutionParams<'a> {
    pub execution_dim: u32,
    pub global_work_size: [u32; 3],
    pub local_work_size: [u32; 3],
    pub args: Vec<Arg<'a>>,
    pub wait_fences: Vec<WaitFence>,
    pub signal_fences: Vec<SignalFence>,
    pub debug_label: Option<String>,
    /// All work-groups run concurrently so the kernel can use grid-wide barriers.
    pub cooperative: bool,
    /// Block the caller until the launch has completed.
    pub wait_until_completion: bool,
    pub completion: Option<CompletionHandler>,
}

impl<'a> ExecutionParams<'a> {
    pub fn new(execution_dim: u32, global_work_size: [u32; 3], local_work_size: [u32; 3]) -> Self {
        ExecutionParams {
            execution_dim,
            global_work_size,
            local_work_size,
            args: Vec::new(),
            wait_fences: Vec::new(),
            signal_fences: Vec::new(),
            debug_label: None,
            cooperative: false,
            wait_until_completion: false,
            completion: None,
        }
    }

    /// A one-dimensional launch.
    pub fn linear(global: u32, local: u32) -> Self {
        ExecutionParams::new(1, [global, 1, 1], [local, 1, 1])
    }

    pub fn with_args(mut self, args: Vec<Arg<'a>>) -> Self {
        self.args = args;
        self
    }

    pub fn arg(mut self, arg: impl Into<Arg<'a>>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn wait_for(mut self, fence: WaitFence) -> Self {
        self.wait_fences.push(fence);
        self
    }

    pub fn signal(mut self, fence: SignalFence) -> Self {
        self.signal_fences.push(fence);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.debug_label = Some(label.into());
        self
    }

    pub fn cooperative(mut self) -> Self {
        self.cooperative = true;
        self
    }

    pub fn blocking(mut self) -> Self {
        self.wait_until_completion = true;
        self
    }

    pub fn on_completion(mut self, handler: impl FnOnce() + Send + 'static) -> Self {
        self.completion = Some(Box::new(handler));
        self
    }
}

impl Debug for ExecutionParams<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionParams")
            .field("execution_dim", &self.execution_dim)
            .field("global_work_size", &self.global_work_size)
            .field("local_work_size", &self.local_work_size)
            .field("args", &self.args)
            .field("debug_label", &self.debug_label)
            .field("cooperative", &self.cooperative)
            .field("wait_until_completion", &self.wait_until_completion)
            .finish_non_exhaustive()
    }
}

/// Submission-level parameters of an indirect execution.
#[derive(Default)]
pub struct IndirectExecutionParams {
    pub wait_fences: Vec<WaitFence>,
    pub signal_fences: Vec<SignalFence>,
    pub debug_label: Option<String>,
    pub wait_until_completion: bool,
    pub completion: Option<CompletionHandler>,
}

impl Debug for IndirectExecutionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndirectExecutionParams")
            .field("wait_fences", &self.wait_fences.len())
            .field("signal_fences", &self.signal_fences.len())
            .field("debug_label", &self.debug_label)
            .field("wait_until_completion", &self.wait_until_completion)
            .finish_non_exhaustive()
    }
}

/// Anchor for [Queue::start_profiling] / [Queue::stop_profiling].
#[derive(Debug, Default)]
pub struct ProfilingTimer {
    anchor: Mutex<Option<Instant>>,
}

impl ProfilingTimer {
    pub(crate) fn start(&self) {
        *self.anchor.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
    }

    /// Microseconds since [ProfilingTimer::start], or `None` if it was never started.
    pub(crate) fn stop(&self) -> Option<u64> {
        self.anchor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .map(|start| start.elapsed().as_micros() as u64)
    }
}

pub trait Queue: Send + Sync + Debug {
    fn device(&self) -> &Arc<Device>;
    fn queue_type(&self) -> QueueType;
    fn platform_type(&self) -> PlatformType {
        self.device().platform
    }

    /// Blocks until every prior submission has retired.
    fn finish(&self) -> Result<(), Error>;

    /// Makes sure submitted work has reached the driver; may be a no-op.
    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    fn as_queue(&self) -> &dyn Queue;

    fn profiling_timer(&self) -> &ProfilingTimer;

    /// Submits a single launch of `function`.
    fn execute(&self, function: &dyn Function, params: ExecutionParams<'_>) -> Result<(), Error> {
        function.execute(self.as_queue(), params)
    }

    /// Replays commands `[offset, offset + count)` of `pipeline`.
    fn execute_indirect(
        &self,
        pipeline: &IndirectCommandPipeline,
        params: IndirectExecutionParams,
        offset: u32,
        count: u32,
    ) -> Result<(), Error> {
        pipeline.replay(self.as_queue(), params, offset, count)
    }

    /// Starts a profiling region; queued work is finished first so it is not measured.
    fn start_profiling(&self) -> Result<(), Error> {
        self.finish()?;
        self.profiling_timer().start();
        Ok(())
    }

    /// Ends the profiling region and returns its length in microseconds.
    fn stop_profiling(&self) -> Result<u64, Error> {
        self.finish()?;
        self.profiling_timer().stop().ok_or_else(|| {
            report(
                "queue::stop_profiling",
                self.platform_type(),
                Error::invalid("start_profiling was not called"),
            )
        })
    }

    fn set_debug_label(&self, label: &str);
    fn debug_label(&self) -> String;

    fn as_any(&self) -> &dyn Any;
}

/// Normalizes a global work size: components beyond `dim` become 1.
pub(crate) fn normalize_global(dim: u32, global: [u32; 3]) -> Result<[u32; 3], Error> {
    if !(1..=3).contains(&dim) {
        return Err(Error::invalid(format!("execution dimension {dim} is not 1, 2 or 3")));
    }
    let mut out = [1u32; 3];
    for d in 0..dim as usize {
        if global[d] == 0 {
            return Err(Error::invalid(format!(
                "global work size {global:?} has a zero component"
            )));
        }
        out[d] = global[d];
    }
    Ok(out)
}

/// Chooses the work-group size of a launch.
///
/// A function's required local size overrides everything.  Otherwise each zero component
/// becomes the largest divisor of the global size that still fits the device and function
/// limits, given the components already fixed.
pub fn select_local_size(
    entry: &FunctionEntry,
    dim: u32,
    global: [u32; 3],
    local: [u32; 3],
) -> Result<[u32; 3], Error> {
    let global = normalize_global(dim, global)?;
    if let Some(required) = entry.info.required_local_size {
        let mut chosen = [1u32; 3];
        for d in 0..dim as usize {
            chosen[d] = required[d].max(1);
        }
        if local[..dim as usize]
            .iter()
            .zip(chosen.iter())
            .any(|(l, c)| *l != 0 && l != c)
        {
            logwise::warn_sync!(
                "select_local_size: \"{name}\" requires local size {required}; the requested size is ignored",
                name = entry.info.name.clone(),
                required = logwise::privacy::LogIt(&chosen)
            );
        }
        return Ok(chosen);
    }

    let mut chosen = [1u32; 3];
    let mut fixed = 1u64;
    for d in 0..dim as usize {
        if local[d] != 0 {
            chosen[d] = local[d];
            fixed *= u64::from(local[d]);
        }
    }
    for d in 0..dim as usize {
        if local[d] != 0 {
            continue;
        }
        let remaining = (u64::from(entry.max_total_local_size) / fixed.max(1)).max(1);
        let limit = u64::from(entry.max_local_size[d].max(1))
            .min(remaining)
            .min(u64::from(global[d])) as u32;
        let divisor = (1..=limit).rev().find(|c| global[d] % c == 0).unwrap_or(1);
        chosen[d] = divisor;
        fixed *= u64::from(divisor);
    }

    let total: u64 = chosen.iter().map(|c| u64::from(*c)).product();
    if total > u64::from(entry.max_total_local_size) {
        return Err(Error::invalid(format!(
            "local size {chosen:?} exceeds the maximum of {} work-items",
            entry.max_total_local_size
        )));
    }
    for d in 0..3 {
        if chosen[d] > entry.max_local_size[d].max(1) {
            return Err(Error::invalid(format!(
                "local size {chosen:?} exceeds the per-dimension maximum {:?}",
                entry.max_local_size
            )));
        }
    }
    Ok(chosen)
}

/// Work-groups per dimension; the global size must be a multiple of the local size.
pub(crate) fn group_count(global: [u32; 3], local: [u32; 3]) -> Result<[u32; 3], Error> {
    let mut groups = [1u32; 3];
    for d in 0..3 {
        let l = local[d].max(1);
        if global[d] % l != 0 {
            return Err(Error::invalid(format!(
                "global work size {global:?} is not a multiple of local work size {local:?}"
            )));
        }
        groups[d] = global[d] / l;
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function_info::FunctionInfo;

    fn entry(max_total: u32, max_local: [u32; 3]) -> FunctionEntry {
        FunctionEntry {
            info: Arc::new(FunctionInfo::kernel("k", Vec::new())),
            max_total_local_size: max_total,
            max_local_size: max_local,
            required_simd_width: None,
        }
    }

    #[test]
    fn picks_largest_divisor() {
        let e = entry(256, [256, 256, 64]);
        assert_eq!(select_local_size(&e, 1, [1024, 0, 0], [0; 3]).unwrap(), [256, 1, 1]);
        assert_eq!(select_local_size(&e, 1, [1000, 0, 0], [0; 3]).unwrap(), [250, 1, 1]);
        assert_eq!(select_local_size(&e, 1, [7, 0, 0], [0; 3]).unwrap(), [7, 1, 1]);
        assert_eq!(select_local_size(&e, 1, [257, 0, 0], [0; 3]).unwrap(), [1, 1, 1]);
    }

    #[test]
    fn respects_fixed_components() {
        let e = entry(256, [256, 256, 64]);
        assert_eq!(
            select_local_size(&e, 2, [64, 64, 0], [32, 0, 0]).unwrap(),
            [32, 8, 1]
        );
        assert!(select_local_size(&e, 1, [1024, 1, 1], [512, 0, 0]).is_err());
    }

    #[test]
    fn required_local_size_wins() {
        let mut e = entry(256, [256, 256, 64]);
        e.info = Arc::new(FunctionInfo::kernel("k", Vec::new()).with_required_local_size([8, 4, 1]));
        assert_eq!(
            select_local_size(&e, 2, [64, 64, 1], [16, 16, 0]).unwrap(),
            [8, 4, 1]
        );
    }

    #[test]
    fn groups() {
        assert_eq!(group_count([64, 8, 1], [16, 4, 1]).unwrap(), [4, 2, 1]);
        assert!(group_count([65, 1, 1], [16, 1, 1]).is_err());
        assert!(normalize_global(0, [1, 1, 1]).is_err());
        assert_eq!(normalize_global(1, [5, 0, 0]).unwrap(), [5, 1, 1]);
    }
}
