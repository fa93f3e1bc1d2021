// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The buffer interface shared by all backends.

use std::any::Any;
use std::sync::Arc;

use crate::error::Error;
use crate::memory::{MappedMemory, MemoryObject};
use crate::memory_flags::MapFlags;
use crate::queue::Queue;

/// Pattern sizes accepted by [Buffer::fill].
pub const FILL_PATTERN_SIZES: [usize; 5] = [1, 2, 4, 8, 16];

/// Rounds a requested allocation size to the size actually allocated.
///
/// Buffers are at least 4 bytes and always a multiple of 4.
pub fn allocation_size(requested: usize) -> usize {
    requested.max(4).div_ceil(4) * 4
}

/// A linear device allocation.
///
/// Offsets and sizes are in bytes; a size of 0 means "from `offset` to the end".  Failures are
/// logged at the detection site before the error is returned.
pub trait Buffer: MemoryObject {
    /// Copies `[offset, offset + dst.len())` into `dst`.
    fn read_into(&self, queue: &dyn Queue, dst: &mut [u8], offset: usize) -> Result<(), Error>;

    /// Copies `src` to `[offset, offset + src.len())`.
    fn write_from(&self, queue: &dyn Queue, src: &[u8], offset: usize) -> Result<(), Error>;

    /// Reads `[offset, offset + size)` into the host span bound at creation, at the same offset.
    fn read(&self, queue: &dyn Queue, size: usize, offset: usize) -> Result<(), Error>;

    /// Writes `[offset, offset + size)` from the host span bound at creation.
    ///
    /// With `USE_HOST_MEMORY` this is a no-op: the span is the allocation.
    fn write(&self, queue: &dyn Queue, size: usize, offset: usize) -> Result<(), Error>;

    /// Device-to-device copy; `size == 0` copies `min(src.size(), self.size())` bytes.
    fn copy(
        &self,
        queue: &dyn Queue,
        src: &dyn Buffer,
        size: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> Result<(), Error>;

    /// Fills `[offset, offset + size)` with the repeated `pattern`.
    ///
    /// `pattern.len()` must be one of [FILL_PATTERN_SIZES] and evenly divide `size`.
    fn fill(&self, queue: &dyn Queue, pattern: &[u8], size: usize, offset: usize) -> Result<(), Error>;

    fn zero(&self, queue: &dyn Queue) -> Result<(), Error>;

    fn map(&self, queue: &dyn Queue, flags: MapFlags, size: usize, offset: usize) -> Result<MappedMemory, Error>;

    fn unmap(&self, queue: &dyn Queue, mapping: MappedMemory) -> Result<(), Error>;

    /// Hands a Vulkan-shared buffer to the Vulkan side; a no-op for unshared buffers.
    fn acquire_vulkan_buffer(&self, _queue: &dyn Queue) -> Result<(), Error> {
        Ok(())
    }
    fn release_vulkan_buffer(&self, _queue: &dyn Queue) -> Result<(), Error> {
        Ok(())
    }
    fn acquire_metal_buffer(&self, _queue: &dyn Queue) -> Result<(), Error> {
        Ok(())
    }
    fn release_metal_buffer(&self, _queue: &dyn Queue) -> Result<(), Error> {
        Ok(())
    }

    /// The render-side allocation of a shared buffer.
    fn shared_buffer(&self) -> Option<Arc<dyn Buffer>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Validates a fill request and returns the resolved size.
pub(crate) fn check_fill(
    buffer_size: usize,
    pattern: &[u8],
    size: usize,
    offset: usize,
) -> Result<usize, Error> {
    if !FILL_PATTERN_SIZES.contains(&pattern.len()) {
        return Err(Error::invalid(format!(
            "fill pattern size {} is not one of {FILL_PATTERN_SIZES:?}",
            pattern.len()
        )));
    }
    let size = if size == 0 {
        buffer_size.saturating_sub(offset)
    } else {
        size
    };
    Error::check_bounds(offset, size, buffer_size)?;
    if size % pattern.len() != 0 {
        return Err(Error::invalid(format!(
            "fill size {size} is not a multiple of the pattern size {}",
            pattern.len()
        )));
    }
    Ok(size)
}

/// Validates a copy request and returns the resolved size.
pub(crate) fn check_copy(
    src_size: usize,
    dst_size: usize,
    size: usize,
    src_offset: usize,
    dst_offset: usize,
) -> Result<usize, Error> {
    let size = if size == 0 { src_size.min(dst_size) } else { size };
    Error::check_bounds(src_offset, size, src_size)?;
    Error::check_bounds(dst_offset, size, dst_size)?;
    Ok(size)
}

/// Writes `pattern` repeatedly over `dst`.
pub(crate) fn tile_pattern(dst: &mut [u8], pattern: &[u8]) {
    for chunk in dst.chunks_exact_mut(pattern.len()) {
        chunk.copy_from_slice(pattern);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_sizes() {
        assert_eq!(allocation_size(0), 4);
        assert_eq!(allocation_size(1), 4);
        assert_eq!(allocation_size(4), 4);
        assert_eq!(allocation_size(5), 8);
        assert_eq!(allocation_size(1023), 1024);
    }

    #[test]
    fn fill_checks() {
        assert_eq!(check_fill(16, &[0xde, 0xad, 0xbe, 0xef], 0, 0).unwrap(), 16);
        assert!(check_fill(16, &[0; 3], 0, 0).is_err());
        assert!(check_fill(16, &[0; 4], 6, 0).is_err());
        assert!(check_fill(16, &[0; 4], 8, 12).is_err());
        assert_eq!(check_fill(16, &[0; 8], 0, 8).unwrap(), 8);

        let mut dst = [0u8; 16];
        tile_pattern(&mut dst, &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&dst[12..], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn copy_checks() {
        assert_eq!(check_copy(64, 32, 0, 0, 0).unwrap(), 32);
        assert_eq!(check_copy(64, 32, 32, 16, 0).unwrap(), 32);
        assert!(check_copy(64, 32, 32, 16, 4).is_err());
        assert!(check_copy(64, 32, 0, 40, 0).is_err());
    }
}
