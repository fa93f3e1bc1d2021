// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The Host-Compute queue.
//!
//! Submissions execute synchronously on the submitting thread (fanning out to the worker pool
//! of the launch), serialized by the queue lock, so every submission has completed when the
//! call returns.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::config::ContextConfig;
use crate::device::Device;
use crate::error::{Error, report};
use crate::queue::{ProfilingTimer, Queue, QueueType};

#[derive(Debug)]
pub struct HostQueue {
    device: Arc<Device>,
    queue_type: QueueType,
    config: Arc<ContextConfig>,
    submission: parking_lot::Mutex<()>,
    label: Mutex<String>,
    profiling: ProfilingTimer,
}

impl HostQueue {
    pub(crate) fn new(device: Arc<Device>, queue_type: QueueType, config: Arc<ContextConfig>) -> Self {
        HostQueue {
            device,
            queue_type,
            config,
            submission: parking_lot::Mutex::new(()),
            label: Mutex::new(String::new()),
            profiling: ProfilingTimer::default(),
        }
    }

    pub(crate) fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Runs `submission` in queue order.
    pub(crate) fn submit<R>(&self, submission: impl FnOnce() -> R) -> R {
        let _order = self.submission.lock();
        submission()
    }

    /// The Host-Compute queue behind `queue`, or a logged error.
    pub(crate) fn downcast<'q>(queue: &'q dyn Queue, operation: &'static str) -> Result<&'q HostQueue, Error> {
        queue.as_any().downcast_ref::<HostQueue>().ok_or_else(|| {
            report(
                operation,
                queue.platform_type(),
                Error::invalid("queue is not a Host-Compute queue"),
            )
        })
    }
}

/// Worker threads a launch on `queue` may use.
pub(crate) fn worker_count(queue: &dyn Queue) -> usize {
    match queue.as_any().downcast_ref::<HostQueue>() {
        Some(host) => host.config.worker_count(),
        None => std::thread::available_parallelism().map_or(1, |n| n.get()),
    }
}

impl Queue for HostQueue {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    fn finish(&self) -> Result<(), Error> {
        // everything before us has returned once we get the lock
        drop(self.submission.lock());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PlatformType;

    #[test]
    fn submissions_are_serialized() {
        let queue = Arc::new(HostQueue::new(
            Arc::new(Device::template(PlatformType::Host, 0)),
            QueueType::All,
            Arc::new(ContextConfig::host()),
        ));
        let log = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for n in 0..4 {
                let queue = &queue;
                let log = &log;
                scope.spawn(move || {
                    queue.submit(|| {
                        log.lock().unwrap().push(n);
                        std::thread::yield_now();
                        log.lock().unwrap().push(n);
                    })
                });
            }
        });
        let log = log.into_inner().unwrap();
        assert_eq!(log.len(), 8);
        for pair in log.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
        assert!(queue.finish().is_ok());
        queue.set_debug_label("main");
        assert_eq!(queue.debug_label(), "main");
        assert!(queue.stop_profiling().is_err());
    }
}
