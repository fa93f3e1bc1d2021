// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Timeline fences.
//!
//! A fence is a monotonically increasing 64-bit counter.  Submissions name fences to wait on
//! and fences to signal; the host can wait on or signal a fence directly as well.
//!
//! A signal of value `V` at stage `S` satisfies every later wait for a value `<= V` at a stage
//! `>= S`.  [TimelineFence] keeps one high-water mark per stage so that rule is checked exactly.

use std::any::Any;
use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex};

use crate::device::PlatformType;
use crate::error::{Error, report};

/// Pipeline stages, ordered from earliest to latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncStage {
    TopOfPipe = 0,
    Vertex = 1,
    Tessellation = 2,
    Fragment = 3,
    ColorAttachmentOutput = 4,
    Compute = 5,
    Transfer = 6,
    BottomOfPipe = 7,
    Host = 8,
}

const STAGE_COUNT: usize = 9;

pub trait Fence: Send + Sync + Debug {
    /// Raises the counter to `value`, which must exceed the current value.
    fn signal(&self, value: u64, stage: SyncStage) -> Result<(), Error>;
    /// Blocks until a signal of at least `value` at a stage `<= stage` happened.
    fn wait(&self, value: u64, stage: SyncStage);
    fn is_signaled(&self, value: u64, stage: SyncStage) -> bool;
    /// The most recently signaled value.
    fn value(&self) -> u64;
    fn set_debug_label(&self, label: &str);
    fn debug_label(&self) -> String;
    fn platform_type(&self) -> PlatformType;
    fn as_any(&self) -> &dyn Any;
}

/// A fence a submission waits on before it starts.
#[derive(Debug, Clone)]
pub struct WaitFence {
    pub fence: Arc<dyn Fence>,
    pub value: u64,
    pub stage: SyncStage,
}

/// A fence a submission signals once it completes.
#[derive(Debug, Clone)]
pub struct SignalFence {
    pub fence: Arc<dyn Fence>,
    pub value: u64,
    pub stage: SyncStage,
}

impl WaitFence {
    pub fn new(fence: &Arc<dyn Fence>, value: u64, stage: SyncStage) -> Self {
        WaitFence {
            fence: fence.clone(),
            value,
            stage,
        }
    }
}

impl SignalFence {
    pub fn new(fence: &Arc<dyn Fence>, value: u64, stage: SyncStage) -> Self {
        SignalFence {
            fence: fence.clone(),
            value,
            stage,
        }
    }
}

/// Blocks on every fence in `fences`.
pub(crate) fn wait_all(fences: &[WaitFence]) {
    if fences.is_empty() {
        return;
    }
    let interval = logwise::perfwarn_begin!("floor::fence::wait_all");
    for wait in fences {
        wait.fence.wait(wait.value, wait.stage);
    }
    drop(interval);
}

/// Signals every fence in `fences`; failures are already logged by the fence.
pub(crate) fn signal_all(fences: &[SignalFence]) {
    for signal in fences {
        let _ = signal.fence.signal(signal.value, signal.stage);
    }
}

#[derive(Debug)]
struct TimelineState {
    value: u64,
    /// Highest value signaled at this stage or any earlier one.
    reached: [u64; STAGE_COUNT],
}

/// The timeline fence used by every backend in this crate.
#[derive(Debug)]
pub struct TimelineFence {
    platform: PlatformType,
    state: Mutex<TimelineState>,
    changed: Condvar,
    label: Mutex<String>,
}

impl TimelineFence {
    pub fn new(platform: PlatformType) -> Self {
        TimelineFence {
            platform,
            state: Mutex::new(TimelineState {
                value: 0,
                reached: [0; STAGE_COUNT],
            }),
            changed: Condvar::new(),
            label: Mutex::new(String::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimelineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Fence for TimelineFence {
    fn signal(&self, value: u64, stage: SyncStage) -> Result<(), Error> {
        let mut state = self.lock();
        if value <= state.value {
            let current = state.value;
            drop(state);
            return Err(report(
                "fence::signal",
                self.platform,
                Error::invalid(format!(
                    "signal value {value} does not exceed current value {current} ({label})",
                    label = self.debug_label()
                )),
            ));
        }
        state.value = value;
        for reached in state.reached[stage as usize..].iter_mut() {
            *reached = (*reached).max(value);
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn wait(&self, value: u64, stage: SyncStage) {
        let mut state = self.lock();
        while state.reached[stage as usize] < value {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn is_signaled(&self, value: u64, stage: SyncStage) -> bool {
        self.lock().reached[stage as usize] >= value
    }

    fn value(&self) -> u64 {
        self.lock().value
    }

    fn set_debug_label(&self, label: &str) {
        *self.label.lock().unwrap_or_else(|p| p.into_inner()) = label.to_string();
    }

    fn debug_label(&self) -> String {
        self.label.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn platform_type(&self) -> PlatformType {
        self.platform
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ordering() {
        let fence = TimelineFence::new(PlatformType::Host);
        fence.signal(3, SyncStage::Fragment).unwrap();
        assert!(fence.is_signaled(3, SyncStage::Fragment));
        assert!(fence.is_signaled(2, SyncStage::Compute));
        assert!(fence.is_signaled(3, SyncStage::Host));
        // a vertex-stage wait needs a signal at the vertex stage or earlier
        assert!(!fence.is_signaled(1, SyncStage::Vertex));
        fence.signal(4, SyncStage::TopOfPipe).unwrap();
        assert!(fence.is_signaled(4, SyncStage::Vertex));
        assert_eq!(fence.value(), 4);
    }

    #[test]
    fn signals_strictly_increase() {
        let fence = TimelineFence::new(PlatformType::Host);
        fence.signal(5, SyncStage::Compute).unwrap();
        assert!(fence.signal(5, SyncStage::Compute).is_err());
        assert!(fence.signal(2, SyncStage::Compute).is_err());
        assert_eq!(fence.value(), 5);
    }
}
