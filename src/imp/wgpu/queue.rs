// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Queues of the wgpu backend.
//!
//! wgpu exposes a single queue per device; every [WgpuQueue] of a device submits to it, which
//! keeps submissions of all of them in order.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::config::ContextConfig;
use crate::device::Device;
use crate::error::{Error, report};
use crate::imp::wgpu::bound_device::BoundDevice;
use crate::queue::{ProfilingTimer, Queue, QueueType};

#[derive(Debug)]
pub struct WgpuQueue {
    device: Arc<Device>,
    bound: Arc<BoundDevice>,
    queue_type: QueueType,
    config: Arc<ContextConfig>,
    label: Mutex<String>,
    profiling: ProfilingTimer,
}

impl WgpuQueue {
    pub(crate) fn new(bound: Arc<BoundDevice>, queue_type: QueueType, config: Arc<ContextConfig>) -> Self {
        WgpuQueue {
            device: bound.info().clone(),
            bound,
            queue_type,
            config,
            label: Mutex::new(String::new()),
            profiling: ProfilingTimer::default(),
        }
    }

    pub(crate) fn bound(&self) -> &Arc<BoundDevice> {
        &self.bound
    }

    pub(crate) fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// The wgpu queue behind `queue`, or a logged error.
    pub(crate) fn downcast<'q>(queue: &'q dyn Queue, operation: &'static str) -> Result<&'q WgpuQueue, Error> {
        queue.as_any().downcast_ref::<WgpuQueue>().ok_or_else(|| {
            report(
                operation,
                queue.platform_type(),
                Error::invalid("queue is not a wgpu queue"),
            )
        })
    }
}

impl Queue for WgpuQueue {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    fn finish(&self) -> Result<(), Error> {
        self.bound
            .wait_idle()
            .map_err(|e| report("queue::finish", self.device.platform, e))
    }

    fn flush(&self) -> Result<(), Error> {
        self.bound.set_needs_poll();
        Ok(())
    }

    fn as_queue(&self) -> &dyn Queue {
        self
    }

    fn profiling_timer(&self) -> &ProfilingTimer {
        &self.profiling
    }

    fn set_debug_label(&self, label: &str) {
        *self.label.lock().unwrap_or_else(|p| p.into_inner()) = label.to_string();
    }

    fn debug_label(&self) -> String {
        self.label.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
