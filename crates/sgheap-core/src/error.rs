//! Heap error taxonomy.
//!
//! Every failure is reported synchronously to the immediate caller. Before
//! an allocation error is returned, all chunks acquired for the request have
//! already been handed back, so callers never observe a partial buffer.

use std::fmt;

use thiserror::Error;

use crate::frame::FrameError;

/// Result alias used throughout the crate.
pub type Result<T, E = HeapError> = std::result::Result<T, E>;

/// Malformed request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("alignment {align} exceeds the {granularity}-byte granularity being satisfied")]
    Alignment { align: usize, granularity: usize },
    #[error("zero-length buffer request")]
    ZeroLength,
}

/// Why an allocation ran out of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomReason {
    /// No size class could supply a chunk for the remaining bytes.
    NoSizeClass,
    /// The scatter-gather table itself could not be allocated.
    TableMetadata,
    /// The frame allocator refused the block outright.
    Frames,
}

impl fmt::Display for OomReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoSizeClass => "no size class could supply a chunk",
            Self::TableMetadata => "scatter-gather table allocation failed",
            Self::Frames => "frame allocator refused the block",
        })
    }
}

/// Errors returned by heap operations.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] ArgumentError),
    #[error("request of {requested_pages} pages exceeds the admission limit of {limit_pages} pages")]
    AdmissionRejected {
        requested_pages: usize,
        limit_pages: usize,
    },
    #[error("out of memory for a {requested}-byte request: {reason}")]
    OutOfMemory { requested: usize, reason: OomReason },
    #[error("failed to create the order-{order} pool (cached: {cached})")]
    PoolCreationFailed {
        order: u32,
        cached: bool,
        #[source]
        source: FrameError,
    },
}

impl HeapError {
    /// Negative errno equivalent, for callers bridging to C-style returns.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => -libc::EINVAL,
            Self::AdmissionRejected { .. }
            | Self::OutOfMemory { .. }
            | Self::PoolCreationFailed { .. } => -libc::ENOMEM,
        }
    }

    /// True for every variant a retry at a smaller size might resolve.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::AdmissionRejected { .. } | Self::OutOfMemory { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        let invalid = HeapError::from(ArgumentError::Alignment {
            align: 8192,
            granularity: 4096,
        });
        assert_eq!(invalid.errno(), -libc::EINVAL);

        let rejected = HeapError::AdmissionRejected {
            requested_pages: 10,
            limit_pages: 4,
        };
        assert_eq!(rejected.errno(), -libc::ENOMEM);
        assert!(rejected.is_out_of_memory());

        let oom = HeapError::OutOfMemory {
            requested: 4096,
            reason: OomReason::NoSizeClass,
        };
        assert_eq!(oom.errno(), -libc::ENOMEM);
        assert!(!invalid.is_out_of_memory());
    }

    #[test]
    fn messages_carry_context() {
        let err = HeapError::PoolCreationFailed {
            order: 8,
            cached: true,
            source: FrameError::OrderUnsupported {
                order: 8,
                max_order: 4,
            },
        };
        assert_eq!(
            err.to_string(),
            "failed to create the order-8 pool (cached: true)"
        );
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(
            source.as_deref(),
            Some("order 8 exceeds the allocator maximum of 4")
        );

        let oom = HeapError::OutOfMemory {
            requested: 8192,
            reason: OomReason::TableMetadata,
        };
        assert!(oom.to_string().contains("scatter-gather table"));
    }
}
