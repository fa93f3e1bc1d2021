// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Memory-object and mapping flags.
//!
//! The numeric values of [MemoryFlags] are part of the on-disk and cross-process contract and
//! must not be renumbered.

use crate::device::PlatformType;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryFlags: u32 {
        /// Device may read.
        const READ = 1 << 0;
        /// Device may write.
        const WRITE = 1 << 1;
        const HOST_READ = 1 << 2;
        const HOST_WRITE = 1 << 3;
        /// Don't upload the host data at creation.
        const NO_INITIAL_COPY = 1 << 4;
        const HOST_READ_BACK_OPTIMIZE = 1 << 5;
        /// Read back through a lazily allocated host-cached staging buffer.
        const HOST_READ_STAGING = 1 << 6;
        /// Alias the caller's pages instead of allocating.
        const USE_HOST_MEMORY = 1 << 7;
        const RENDER_TARGET = 1 << 8;
        const GENERATE_MIP_MAPS = 1 << 9;
        const VULKAN_SHARING = 1 << 10;
        const METAL_SHARING = 1 << 11;
        const VULKAN_SHARING_SYNC_SHARED = 1 << 12;
        const METAL_SHARING_SYNC_SHARED = 1 << 13;
        const VULKAN_ALIASING = 1 << 14;
        const VULKAN_HOST_COHERENT = 1 << 15;
        const NO_RESOURCE_TRACKING = 1 << 16;
        const VULKAN_DESCRIPTOR_BUFFER = 1 << 17;
        const SHARING_SYNC = 1 << 18;
        const SHARING_RENDER_READ = 1 << 19;
        const SHARING_RENDER_WRITE = 1 << 20;
        const SHARING_COMPUTE_READ = 1 << 21;
        const SHARING_COMPUTE_WRITE = 1 << 22;
        const HEAP_ALLOCATION = 1 << 23;
        const NO_HEAP_ALLOCATION = 1 << 24;
        const VULKAN_MAY_USE_HOST_MEMORY = 1 << 25;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const HOST_READ_WRITE = Self::HOST_READ.bits() | Self::HOST_WRITE.bits();
        const SHARING_RENDER_READ_WRITE =
            Self::SHARING_RENDER_READ.bits() | Self::SHARING_RENDER_WRITE.bits();
        const SHARING_COMPUTE_READ_WRITE =
            Self::SHARING_COMPUTE_READ.bits() | Self::SHARING_COMPUTE_WRITE.bits();
        const ANY_SHARING = Self::VULKAN_SHARING.bits() | Self::METAL_SHARING.bits();
    }
}

impl Default for MemoryFlags {
    fn default() -> Self {
        MemoryFlags::READ_WRITE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    Warning,
    Error,
}

/// A flag conflict found (and repaired) during normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagIssue {
    pub severity: IssueSeverity,
    pub message: &'static str,
}

/// Context-level defaults consulted by normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagDefaults {
    /// The context allocates from a heap unless told otherwise.
    pub heap_by_default: bool,
}

impl MemoryFlags {
    /// Applies the defaulting and exclusion rules.
    ///
    /// Conflicts never fail: the offending flags are dropped or replaced with defaults and an
    /// issue is recorded for each repair.
    pub fn normalize(self, defaults: FlagDefaults) -> (MemoryFlags, Vec<FlagIssue>) {
        let mut flags = self;
        let mut issues = Vec::new();
        let mut issue = |severity, message| issues.push(FlagIssue { severity, message });

        if !flags.intersects(MemoryFlags::READ_WRITE) {
            flags |= MemoryFlags::READ_WRITE;
        }

        if flags.contains(MemoryFlags::USE_HOST_MEMORY) && flags.intersects(MemoryFlags::ANY_SHARING) {
            issue(
                IssueSeverity::Error,
                "USE_HOST_MEMORY can not be combined with VULKAN_SHARING/METAL_SHARING; sharing disabled",
            );
            flags.remove(MemoryFlags::ANY_SHARING);
        }
        if flags.contains(MemoryFlags::ANY_SHARING) {
            issue(
                IssueSeverity::Error,
                "VULKAN_SHARING and METAL_SHARING are mutually exclusive; METAL_SHARING dropped",
            );
            flags.remove(MemoryFlags::METAL_SHARING);
        }

        let sharing_flags = MemoryFlags::SHARING_SYNC
            | MemoryFlags::SHARING_RENDER_READ_WRITE
            | MemoryFlags::SHARING_COMPUTE_READ_WRITE
            | MemoryFlags::VULKAN_SHARING_SYNC_SHARED
            | MemoryFlags::METAL_SHARING_SYNC_SHARED;
        if !flags.intersects(MemoryFlags::ANY_SHARING) {
            if flags.contains(MemoryFlags::SHARING_SYNC) {
                issue(
                    IssueSeverity::Warning,
                    "SHARING_SYNC without VULKAN_SHARING or METAL_SHARING has no effect",
                );
            }
            flags.remove(sharing_flags);
        } else if flags.contains(MemoryFlags::SHARING_SYNC) {
            if !flags.intersects(MemoryFlags::SHARING_RENDER_READ_WRITE) {
                flags |= MemoryFlags::SHARING_RENDER_READ_WRITE;
            }
            if !flags.intersects(MemoryFlags::SHARING_COMPUTE_READ_WRITE) {
                flags |= MemoryFlags::SHARING_COMPUTE_READ_WRITE;
            }
            let render = flags & MemoryFlags::SHARING_RENDER_READ_WRITE;
            let compute = flags & MemoryFlags::SHARING_COMPUTE_READ_WRITE;
            if render == MemoryFlags::SHARING_RENDER_WRITE
                && compute == MemoryFlags::SHARING_COMPUTE_WRITE
            {
                issue(
                    IssueSeverity::Warning,
                    "shared memory is write-only on both the render and compute side",
                );
            }
            if render == MemoryFlags::SHARING_RENDER_READ
                && compute == MemoryFlags::SHARING_COMPUTE_READ
            {
                issue(
                    IssueSeverity::Warning,
                    "shared memory is read-only on both the render and compute side",
                );
            }
            if flags.contains(MemoryFlags::VULKAN_SHARING) {
                flags |= MemoryFlags::VULKAN_SHARING_SYNC_SHARED;
            } else {
                flags |= MemoryFlags::METAL_SHARING_SYNC_SHARED;
            }
        }

        if flags.contains(MemoryFlags::HOST_READ_STAGING) && !flags.contains(MemoryFlags::HOST_READ) {
            issue(
                IssueSeverity::Warning,
                "HOST_READ_STAGING requires HOST_READ; staging disabled",
            );
            flags.remove(MemoryFlags::HOST_READ_STAGING);
        }

        let heap = MemoryFlags::HEAP_ALLOCATION | MemoryFlags::NO_HEAP_ALLOCATION;
        if flags.contains(heap) {
            issue(
                IssueSeverity::Error,
                "HEAP_ALLOCATION and NO_HEAP_ALLOCATION are mutually exclusive; using the context default",
            );
            flags.remove(heap);
        }
        if !flags.intersects(heap) && defaults.heap_by_default {
            flags |= MemoryFlags::HEAP_ALLOCATION;
        }

        (flags, issues)
    }

    /// [MemoryFlags::normalize] followed by logging every issue against `operation`.
    pub(crate) fn normalize_logged(
        self,
        defaults: FlagDefaults,
        operation: &'static str,
        platform: PlatformType,
    ) -> MemoryFlags {
        let (flags, issues) = self.normalize(defaults);
        for issue in issues {
            match issue.severity {
                IssueSeverity::Warning => logwise::warn_sync!(
                    "{operation} [{platform}]: {message}",
                    operation = operation.to_string(),
                    platform = platform.to_string(),
                    message = issue.message.to_string()
                ),
                IssueSeverity::Error => logwise::error_sync!(
                    "{operation} [{platform}]: {message}",
                    operation = operation.to_string(),
                    platform = platform.to_string(),
                    message = issue.message.to_string()
                ),
            }
        }
        flags
    }

    pub fn is_shared(self) -> bool {
        self.intersects(MemoryFlags::ANY_SHARING)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Previous contents are discarded; nothing is read back.
        const WRITE_INVALIDATE = 1 << 2;
        /// Don't return until the mapping is coherent.
        const BLOCK = 1 << 3;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl MapFlags {
    /// Checks a map request against the host visibility of the object.
    pub fn validate(self, object: MemoryFlags) -> Result<(), crate::Error> {
        if !self.intersects(MapFlags::READ | MapFlags::WRITE | MapFlags::WRITE_INVALIDATE) {
            return Err(crate::Error::invalid(
                "map flags must contain READ, WRITE or WRITE_INVALIDATE",
            ));
        }
        if self.contains(MapFlags::WRITE_INVALIDATE) && self.contains(MapFlags::READ) {
            return Err(crate::Error::invalid(
                "WRITE_INVALIDATE discards the contents and can not be combined with READ",
            ));
        }
        if self.contains(MapFlags::READ) && !object.contains(MemoryFlags::HOST_READ) {
            return Err(crate::Error::invalid(
                "mapping for READ requires HOST_READ on the memory object",
            ));
        }
        if self.intersects(MapFlags::WRITE | MapFlags::WRITE_INVALIDATE)
            && !object.contains(MemoryFlags::HOST_WRITE)
        {
            return Err(crate::Error::invalid(
                "mapping for WRITE requires HOST_WRITE on the memory object",
            ));
        }
        Ok(())
    }

    /// Whether the current contents must be made visible in the mapping.
    pub fn needs_read_back(self) -> bool {
        self.contains(MapFlags::READ)
            || (self.contains(MapFlags::WRITE) && !self.contains(MapFlags::WRITE_INVALIDATE))
    }

    /// Whether the mapping must be written back on unmap.
    pub fn needs_write_back(self) -> bool {
        self.intersects(MapFlags::WRITE | MapFlags::WRITE_INVALIDATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions_are_stable() {
        assert_eq!(MemoryFlags::READ.bits(), 1);
        assert_eq!(MemoryFlags::USE_HOST_MEMORY.bits(), 1 << 7);
        assert_eq!(MemoryFlags::VULKAN_SHARING.bits(), 1 << 10);
        assert_eq!(MemoryFlags::SHARING_SYNC.bits(), 1 << 18);
        assert_eq!(MemoryFlags::SHARING_COMPUTE_WRITE.bits(), 1 << 22);
        assert_eq!(MemoryFlags::NO_HEAP_ALLOCATION.bits(), 1 << 24);
        assert_eq!(MemoryFlags::VULKAN_MAY_USE_HOST_MEMORY.bits(), 1 << 25);
    }

    #[test]
    fn device_visibility_defaults_to_read_write() {
        let (flags, issues) = MemoryFlags::HOST_READ.normalize(FlagDefaults::default());
        assert!(flags.contains(MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ));
        assert!(issues.is_empty());
        let (flags, _) = MemoryFlags::READ.normalize(FlagDefaults::default());
        assert!(!flags.contains(MemoryFlags::WRITE));
    }

    #[test]
    fn host_memory_excludes_sharing() {
        let (flags, issues) = (MemoryFlags::USE_HOST_MEMORY | MemoryFlags::VULKAN_SHARING)
            .normalize(FlagDefaults::default());
        assert!(!flags.is_shared());
        assert!(flags.contains(MemoryFlags::USE_HOST_MEMORY));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Error);
    }

    #[test]
    fn sharing_sync_defaults_and_warnings() {
        let (flags, issues) = (MemoryFlags::VULKAN_SHARING | MemoryFlags::SHARING_SYNC)
            .normalize(FlagDefaults::default());
        assert!(flags.contains(
            MemoryFlags::SHARING_RENDER_READ_WRITE
                | MemoryFlags::SHARING_COMPUTE_READ_WRITE
                | MemoryFlags::VULKAN_SHARING_SYNC_SHARED
        ));
        assert!(issues.is_empty());

        let (_, issues) = (MemoryFlags::VULKAN_SHARING
            | MemoryFlags::SHARING_SYNC
            | MemoryFlags::SHARING_RENDER_WRITE
            | MemoryFlags::SHARING_COMPUTE_WRITE)
            .normalize(FlagDefaults::default());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Warning);

        let (_, issues) = (MemoryFlags::METAL_SHARING
            | MemoryFlags::SHARING_SYNC
            | MemoryFlags::SHARING_RENDER_READ
            | MemoryFlags::SHARING_COMPUTE_READ)
            .normalize(FlagDefaults::default());
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn sync_without_sharing_is_dropped() {
        let (flags, issues) = MemoryFlags::SHARING_SYNC.normalize(FlagDefaults::default());
        assert!(!flags.contains(MemoryFlags::SHARING_SYNC));
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn heap_flags() {
        let defaults = FlagDefaults { heap_by_default: true };
        let (flags, issues) =
            (MemoryFlags::HEAP_ALLOCATION | MemoryFlags::NO_HEAP_ALLOCATION).normalize(defaults);
        assert!(flags.contains(MemoryFlags::HEAP_ALLOCATION));
        assert!(!flags.contains(MemoryFlags::NO_HEAP_ALLOCATION));
        assert_eq!(issues.len(), 1);

        let (flags, issues) = MemoryFlags::NO_HEAP_ALLOCATION.normalize(defaults);
        assert!(!flags.contains(MemoryFlags::HEAP_ALLOCATION));
        assert!(issues.is_empty());

        let (flags, _) = MemoryFlags::empty().normalize(FlagDefaults::default());
        assert!(!flags.contains(MemoryFlags::HEAP_ALLOCATION));
    }

    #[test]
    fn map_flags() {
        let host = MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE;
        assert!(MapFlags::READ_WRITE.validate(host).is_ok());
        assert!(MapFlags::READ.validate(MemoryFlags::HOST_WRITE).is_err());
        assert!(MapFlags::WRITE.validate(MemoryFlags::HOST_READ).is_err());
        assert!((MapFlags::WRITE_INVALIDATE | MapFlags::READ).validate(host).is_err());
        assert!(MapFlags::BLOCK.validate(host).is_err());
        assert!(MapFlags::WRITE.needs_read_back());
        assert!(!MapFlags::WRITE_INVALIDATE.needs_read_back());
        assert!(!MapFlags::READ.needs_write_back());
    }
}
