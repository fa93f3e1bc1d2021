// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Context configuration.
//!
//! [ContextConfig::from_env] reads:
//!
//! | variable | meaning |
//! |---|---|
//! | `FLOOR_BACKEND` | preferred backend: `host`, `vulkan`, `metal`, `cuda`, `opencl` |
//! | `FLOOR_DEVICE_WHITELIST` | comma-separated device name substrings (case-insensitive) |
//! | `FLOOR_HOST_WORKERS` | Host-Compute worker threads; 0 or unset uses every logical CPU |
//! | `FLOOR_FIBER_STACK_SIZE` | per-work-item fiber stack in bytes |
//! | `FLOOR_PRINTF_BUFFER_SIZE` | soft-printf buffer in bytes |
//!
//! Unparsable values are logged and ignored.

use crate::device::PlatformType;
use crate::memory_flags::FlagDefaults;
use crate::soft_printf::DEFAULT_PRINTF_BUFFER_SIZE;

/// Default stack of one Host-Compute fiber.
pub const DEFAULT_FIBER_STACK_SIZE: usize = 256 * 1024;

/// Smallest accepted fiber stack.
pub const MIN_FIBER_STACK_SIZE: usize = 16 * 1024;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextFlags: u32 {
        /// Never allocate from a heap, regardless of per-object flags.
        const DISABLE_HEAP = 1 << 0;
        /// Only allocate from a heap when an object asks for it.
        const EXPLICIT_HEAP = 1 << 1;
        /// No object is entered into the resource registry.
        const NO_RESOURCE_TRACKING = 1 << 2;
    }
}

impl ContextFlags {
    /// Flag defaults applied by memory-flag normalization.
    pub fn flag_defaults(self, device_has_heap: bool) -> FlagDefaults {
        FlagDefaults {
            heap_by_default: device_has_heap
                && !self.intersects(ContextFlags::DISABLE_HEAP | ContextFlags::EXPLICIT_HEAP),
        }
    }

    /// Applies context-wide overrides to already normalized object flags.
    pub fn restrict(self, flags: crate::memory_flags::MemoryFlags) -> crate::memory_flags::MemoryFlags {
        use crate::memory_flags::MemoryFlags;
        let mut flags = flags;
        if self.contains(ContextFlags::DISABLE_HEAP) {
            flags.remove(MemoryFlags::HEAP_ALLOCATION);
        }
        if self.contains(ContextFlags::NO_RESOURCE_TRACKING) {
            flags |= MemoryFlags::NO_RESOURCE_TRACKING;
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// The backend to try first.
    pub platform: PlatformType,
    pub device_whitelist: Vec<String>,
    pub flags: ContextFlags,
    /// Host-Compute worker threads; 0 uses every logical CPU.
    pub host_worker_count: usize,
    pub fiber_stack_size: usize,
    pub printf_buffer_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            platform: if cfg!(feature = "backend_wgpu") {
                PlatformType::Vulkan
            } else {
                PlatformType::Host
            },
            device_whitelist: Vec::new(),
            flags: ContextFlags::empty(),
            host_worker_count: 0,
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
            printf_buffer_size: DEFAULT_PRINTF_BUFFER_SIZE,
        }
    }
}

impl ContextConfig {
    /// A configuration for the Host-Compute backend.
    pub fn host() -> Self {
        ContextConfig {
            platform: PlatformType::Host,
            ..ContextConfig::default()
        }
    }

    /// The defaults, overridden by the `FLOOR_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = ContextConfig::default();
        if let Some(backend) = lookup("FLOOR_BACKEND") {
            match PlatformType::from_name(&backend) {
                Some(platform) => config.platform = platform,
                None => logwise::warn_sync!(
                    "config: unknown FLOOR_BACKEND \"{backend}\"; using {default}",
                    backend = backend.clone(),
                    default = config.platform.to_string()
                ),
            }
        }
        if let Some(whitelist) = lookup("FLOOR_DEVICE_WHITELIST") {
            config.device_whitelist = whitelist
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(workers) = parse_number(&lookup, "FLOOR_HOST_WORKERS") {
            config.host_worker_count = workers;
        }
        if let Some(stack) = parse_number(&lookup, "FLOOR_FIBER_STACK_SIZE") {
            config.fiber_stack_size = stack;
        }
        if let Some(size) = parse_number(&lookup, "FLOOR_PRINTF_BUFFER_SIZE") {
            config.printf_buffer_size = size;
        }
        config.sanitized()
    }

    /// Clamps values the backends can't work with.
    pub fn sanitized(mut self) -> Self {
        if self.fiber_stack_size < MIN_FIBER_STACK_SIZE {
            logwise::warn_sync!(
                "config: fiber stack size {size} is too small; using {min}",
                size = self.fiber_stack_size,
                min = MIN_FIBER_STACK_SIZE
            );
            self.fiber_stack_size = MIN_FIBER_STACK_SIZE;
        }
        let min_printf = crate::soft_printf::HEADER_SIZE * 2;
        if self.printf_buffer_size < min_printf {
            self.printf_buffer_size = DEFAULT_PRINTF_BUFFER_SIZE;
        }
        self
    }

    /// Effective Host-Compute worker count.
    pub fn worker_count(&self) -> usize {
        if self.host_worker_count != 0 {
            self.host_worker_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

fn parse_number(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Option<usize> {
    let value = lookup(key)?;
    match value.trim().parse::<usize>() {
        Ok(n) => Some(n),
        Err(_) => {
            logwise::warn_sync!(
                "config: {key} must be a number, got \"{value}\"",
                key = key.to_string(),
                value = value.clone()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn environment_overrides() {
        let config = ContextConfig::from_lookup(lookup(&[
            ("FLOOR_BACKEND", "host"),
            ("FLOOR_DEVICE_WHITELIST", "ryzen, ,EPYC"),
            ("FLOOR_HOST_WORKERS", "3"),
            ("FLOOR_FIBER_STACK_SIZE", "1024"),
        ]));
        assert_eq!(config.platform, PlatformType::Host);
        assert_eq!(config.device_whitelist, vec!["ryzen".to_string(), "EPYC".to_string()]);
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.fiber_stack_size, MIN_FIBER_STACK_SIZE);
        assert_eq!(config.printf_buffer_size, DEFAULT_PRINTF_BUFFER_SIZE);
    }

    #[test]
    fn bad_values_are_ignored() {
        let config = ContextConfig::from_lookup(lookup(&[
            ("FLOOR_BACKEND", "glide"),
            ("FLOOR_HOST_WORKERS", "many"),
        ]));
        assert_eq!(config.platform, ContextConfig::default().platform);
        assert_eq!(config.host_worker_count, 0);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn heap_defaults() {
        assert!(ContextFlags::empty().flag_defaults(true).heap_by_default);
        assert!(!ContextFlags::EXPLICIT_HEAP.flag_defaults(true).heap_by_default);
        assert!(!ContextFlags::empty().flag_defaults(false).heap_by_default);
        use crate::memory_flags::MemoryFlags;
        let restricted = ContextFlags::DISABLE_HEAP
            .restrict(MemoryFlags::READ_WRITE | MemoryFlags::HEAP_ALLOCATION);
        assert_eq!(restricted, MemoryFlags::READ_WRITE);
    }
}
