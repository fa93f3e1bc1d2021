// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Error types shared by every backend.
//!
//! Failures are classified the same way on every platform:
//!
//! * validation errors ([Error::OutOfBounds], [Error::InvalidArgument]),
//! * resource exhaustion ([Error::Allocation]),
//! * translated native failures ([Error::Backend]),
//! * use of a feature the device does not advertise ([Error::Unsupported]),
//! * fatal conditions that disable a context ([Error::ContextUnsupported], [Error::InvalidBinary]).
//!
//! Every failure is logged once at the site that detects it (see [report]), so callers
//! may simply test `is_ok()` when they don't care about the cause.

use crate::device::PlatformType;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("out of bounds: offset {offset} + size {size} exceeds {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        capacity: usize,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not supported: {0}")]
    Unsupported(String),
    #[error("allocation of {0} bytes failed")]
    Allocation(usize),
    #[error("backend error ({code}): {message}")]
    Backend { code: String, message: String },
    #[error("invalid binary: {0}")]
    InvalidBinary(String),
    #[error("context is not supported")]
    ContextUnsupported,
    #[error("invalid universal binary: {0}")]
    Archive(#[from] crate::universal_binary::ArchiveError),
    #[error("invalid description: {0}")]
    Description(#[from] crate::pipeline_description::DescriptionError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("soft printf: {0}")]
    Printf(#[from] crate::soft_printf::PrintfError),
    #[error("ELF loader: {0}")]
    Elf(#[from] crate::imp::host::ElfError),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }
    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Error::Unsupported(message.into())
    }
    pub(crate) fn backend(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            code: code.into(),
            message: message.into(),
        }
    }
    pub(crate) fn check_bounds(offset: usize, size: usize, capacity: usize) -> Result<(), Self> {
        match offset.checked_add(size) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                size,
                capacity,
            }),
        }
    }
}

/// Logs `error` with the failing operation and backend, then hands it back.
///
/// Intended for `return Err(report(...))` / `.map_err(|e| report(...))` at the detection site.
pub(crate) fn report(operation: &'static str, platform: PlatformType, error: Error) -> Error {
    logwise::error_sync!(
        "{operation} [{platform}]: {cause}",
        operation = operation.to_string(),
        platform = platform.to_string(),
        cause = error.to_string()
    );
    error
}

/// Like [report] for the operations whose result is a plain success flag.
pub(crate) fn reported<T>(
    operation: &'static str,
    platform: PlatformType,
    result: Result<T, Error>,
) -> Result<T, Error> {
    result.map_err(|e| report(operation, platform, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds() {
        assert!(Error::check_bounds(0, 16, 16).is_ok());
        assert!(Error::check_bounds(8, 8, 16).is_ok());
        assert!(matches!(
            Error::check_bounds(9, 8, 16),
            Err(Error::OutOfBounds {
                offset: 9,
                size: 8,
                capacity: 16
            })
        ));
        assert!(Error::check_bounds(usize::MAX, 2, 16).is_err());
    }
}
