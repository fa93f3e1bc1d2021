// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Cross-backend sharing of memory objects.
//!
//! A shared object owns a second allocation on the render backend (Vulkan or Metal) next to its
//! own compute-side storage.  Exactly one side owns the object at any instant; `acquire_*` hands
//! it to the render side, `release_*` hands it back.  Contents move between the two allocations
//! on each hand-over, restricted by the per-side `SHARING_*_READ/WRITE` flags when
//! `SHARING_SYNC` is set.

use std::sync::{Arc, Mutex};

use crate::device::PlatformType;
use crate::error::{Error, report};
use crate::memory::{Buffer, Image};
use crate::memory_flags::MemoryFlags;
use crate::queue::Queue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingKind {
    Vulkan,
    Metal,
}

impl SharingKind {
    /// The sharing kind requested by normalized flags.
    pub fn from_flags(flags: MemoryFlags) -> Option<Self> {
        if flags.contains(MemoryFlags::VULKAN_SHARING) {
            Some(SharingKind::Vulkan)
        } else if flags.contains(MemoryFlags::METAL_SHARING) {
            Some(SharingKind::Metal)
        } else {
            None
        }
    }

    pub fn platform(self) -> PlatformType {
        match self {
            SharingKind::Vulkan => PlatformType::Vulkan,
            SharingKind::Metal => PlatformType::Metal,
        }
    }
}

/// Which side currently owns a shared object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Compute,
    Render,
}

/// Direction of a content synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncDirection {
    ComputeToRender,
    RenderToCompute,
}

/// Secondary allocation plus the owner bit of a shared memory object.
pub struct SharingState<T: ?Sized> {
    kind: SharingKind,
    secondary: Arc<T>,
    secondary_queue: Arc<dyn Queue>,
    flags: MemoryFlags,
    owner: Mutex<Owner>,
}

impl<T: ?Sized> std::fmt::Debug for SharingState<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharingState")
            .field("kind", &self.kind)
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized> SharingState<T> {
    pub(crate) fn new(
        kind: SharingKind,
        secondary: Arc<T>,
        secondary_queue: Arc<dyn Queue>,
        flags: MemoryFlags,
    ) -> Self {
        SharingState {
            kind,
            secondary,
            secondary_queue,
            flags,
            owner: Mutex::new(Owner::Compute),
        }
    }

    pub fn kind(&self) -> SharingKind {
        self.kind
    }

    /// The render-side allocation.
    pub fn secondary(&self) -> &Arc<T> {
        &self.secondary
    }

    pub fn owner(&self) -> Owner {
        *self.owner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Whether a hand-over in `direction` must move contents.
    ///
    /// Without `SHARING_SYNC` both sides are treated as read-write: the two allocations never
    /// alias, so every hand-over copies.
    pub(crate) fn needs_sync(&self, direction: SyncDirection) -> bool {
        if !self.flags.contains(MemoryFlags::SHARING_SYNC) {
            return true;
        }
        let (writer, reader) = match direction {
            SyncDirection::ComputeToRender => (
                MemoryFlags::SHARING_COMPUTE_WRITE,
                MemoryFlags::SHARING_RENDER_READ,
            ),
            SyncDirection::RenderToCompute => (
                MemoryFlags::SHARING_RENDER_WRITE,
                MemoryFlags::SHARING_COMPUTE_READ,
            ),
        };
        self.flags.contains(writer) && self.flags.contains(reader)
    }

    /// Moves ownership to `to`, running `sync` first when contents must follow.
    ///
    /// Requesting the side that already owns the object is a no-op.
    pub(crate) fn transition(
        &self,
        operation: &'static str,
        requested: SharingKind,
        to: Owner,
        sync: impl FnOnce(SyncDirection, &T, &dyn Queue) -> Result<(), Error>,
    ) -> Result<(), Error> {
        if requested != self.kind {
            return Err(report(
                operation,
                requested.platform(),
                Error::invalid(format!("object is shared with {:?}, not {requested:?}", self.kind)),
            ));
        }
        let mut owner = self.owner.lock().unwrap_or_else(|p| p.into_inner());
        if *owner == to {
            return Ok(());
        }
        let direction = match to {
            Owner::Render => SyncDirection::ComputeToRender,
            Owner::Compute => SyncDirection::RenderToCompute,
        };
        if self.needs_sync(direction) {
            sync(direction, &self.secondary, self.secondary_queue.as_ref())?;
        }
        *owner = to;
        logwise::trace_sync!(
            "{operation}: shared object now owned by {owner}",
            operation = operation.to_string(),
            owner = logwise::privacy::LogIt(&to)
        );
        Ok(())
    }

    /// Logs compute-side access while the render side holds the object.
    pub(crate) fn check_compute_access(&self, operation: &'static str, platform: PlatformType, label: &str) {
        if self.owner() == Owner::Render {
            logwise::error_sync!(
                "{operation} [{platform}]: \"{label}\" is used while acquired by {kind}; release it first",
                operation = operation.to_string(),
                platform = platform.to_string(),
                label = label.to_string(),
                kind = self.kind.platform().to_string()
            );
        }
    }
}

/// Content synchronization between the two allocations of a shared object.
///
/// The compute side is passed as raw bytes because the primary object performs the sync while
/// holding its own lock; the render side is driven through its public trait.
pub(crate) struct SharingBridge;

impl SharingBridge {
    pub(crate) fn sync_buffer(
        direction: SyncDirection,
        primary: &mut [u8],
        secondary: &dyn Buffer,
        secondary_queue: &dyn Queue,
    ) -> Result<(), Error> {
        match direction {
            SyncDirection::ComputeToRender => secondary.write_from(secondary_queue, primary, 0),
            SyncDirection::RenderToCompute => {
                let len = primary.len().min(secondary.size());
                secondary.read_into(secondary_queue, &mut primary[..len], 0)
            }
        }
    }

    pub(crate) fn sync_image(
        direction: SyncDirection,
        primary: &mut [u8],
        secondary: &dyn Image,
        secondary_queue: &dyn Queue,
    ) -> Result<(), Error> {
        match direction {
            SyncDirection::ComputeToRender => secondary.write_from(secondary_queue, primary),
            SyncDirection::RenderToCompute => secondary.read_into(secondary_queue, primary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(SharingKind::from_flags(MemoryFlags::METAL_SHARING), Some(SharingKind::Metal));
        assert_eq!(
            SharingKind::from_flags(MemoryFlags::VULKAN_SHARING | MemoryFlags::READ),
            Some(SharingKind::Vulkan)
        );
        assert_eq!(SharingKind::from_flags(MemoryFlags::READ), None);
        assert_eq!(SharingKind::Vulkan.platform(), PlatformType::Vulkan);
    }
}
