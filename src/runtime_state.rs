// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Process-global runtime state.
//!
//! Contexts call [init] when they are created and [teardown] when they are dropped; the state
//! lives while at least one context does.  Teardown hooks run (in reverse registration order)
//! when the last context goes away.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::binding::SAMPLER_COUNT;

bitflags::bitflags! {
    /// A sampler descriptor as seen by Host-Compute image code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SamplerState: u32 {
        const LINEAR = 1 << 0;
        /// Repeat instead of clamp-to-edge.
        const REPEAT = 1 << 1;
        const COMPARE_LESS_EQUAL = 1 << 2;
    }
}

type Hook = Box<dyn FnOnce() + Send>;

pub struct RuntimeState {
    samplers: [SamplerState; SAMPLER_COUNT],
    hooks: Mutex<Vec<Hook>>,
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("samplers", &self.samplers)
            .finish_non_exhaustive()
    }
}

impl RuntimeState {
    fn new() -> Self {
        let mut samplers = [SamplerState::empty(); SAMPLER_COUNT];
        for (index, sampler) in samplers.iter_mut().enumerate() {
            *sampler = SamplerState::from_bits_truncate(index as u32);
        }
        RuntimeState {
            samplers,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// The sampler descriptors every image parameter carries, indexed by [SamplerState] bits.
    pub fn sampler_table(&self) -> [u32; SAMPLER_COUNT] {
        self.samplers.map(|s| s.bits())
    }

    /// Registers `hook` to run at teardown.
    pub fn on_teardown(&self, hook: impl FnOnce() + Send + 'static) {
        self.hooks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Box::new(hook));
    }
}

struct Slot {
    users: usize,
    state: Option<Arc<RuntimeState>>,
}

static STATE: Mutex<Slot> = Mutex::new(Slot {
    users: 0,
    state: None,
});

fn slot() -> MutexGuard<'static, Slot> {
    STATE.lock().unwrap_or_else(|p| p.into_inner())
}

/// Creates the state on first use and counts one more user.
pub fn init() -> Arc<RuntimeState> {
    let mut slot = slot();
    slot.users += 1;
    match &slot.state {
        Some(state) => state.clone(),
        None => {
            logwise::trace_sync!("runtime_state: init");
            let state = Arc::new(RuntimeState::new());
            slot.state = Some(state.clone());
            state
        }
    }
}

/// Drops one user; the last one runs the teardown hooks and releases the state.
pub fn teardown() {
    let state = {
        let mut slot = slot();
        if slot.users == 0 {
            logwise::warn_sync!("runtime_state: teardown without init");
            return;
        }
        slot.users -= 1;
        if slot.users > 0 {
            return;
        }
        slot.state.take()
    };
    if let Some(state) = state {
        logwise::trace_sync!("runtime_state: teardown");
        let hooks = std::mem::take(&mut *state.hooks.lock().unwrap_or_else(|p| p.into_inner()));
        for hook in hooks.into_iter().rev() {
            hook();
        }
    }
}

/// The live state, if any context exists.
pub fn current() -> Option<Arc<RuntimeState>> {
    slot().state.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_table_is_indexed_by_state() {
        let state = RuntimeState::new();
        let table = state.sampler_table();
        assert_eq!(table[0], 0);
        assert_eq!(table[(SamplerState::LINEAR | SamplerState::REPEAT).bits() as usize], 3);
        assert_eq!(table[7], 7);
    }

    #[test]
    fn hooks_run_in_reverse_order() {
        let state = RuntimeState::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            state.on_teardown(move || order.lock().unwrap().push(i));
        }
        let hooks = std::mem::take(&mut *state.hooks.lock().unwrap());
        for hook in hooks.into_iter().rev() {
            hook();
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }
}
