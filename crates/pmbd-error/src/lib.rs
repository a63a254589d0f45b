#![forbid(unsafe_code)]
//! Error types for the PMBD emulator.
//!
//! Defines `PmbdError` and a `Result<T>` alias used throughout the
//! workspace. Fatal taxa (`WriteVerificationFailed`, `InternalInvariant`)
//! are never returned from the request path; the detecting site formats
//! the error and panics with it, so they exist here for construction,
//! classification, and reporting.

use thiserror::Error;

/// Unified error type for all PMBD operations.
#[derive(Debug, Error)]
pub enum PmbdError {
    #[error("bad config: {0}")]
    BadConfig(String),

    #[error(
        "request out of range: sector={sector} len_bytes={len_bytes} capacity_sectors={capacity_sectors}"
    )]
    OutOfRange {
        sector: u64,
        len_bytes: usize,
        capacity_sectors: u64,
    },

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("memory region busy: {0}")]
    Busy(String),

    #[error("write verification failed at block {pbn}: region bytes differ from source")]
    WriteVerificationFailed { pbn: u64 },

    #[error("checksum mismatch at block {pbn}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        pbn: u64,
        stored: u32,
        computed: u32,
    },

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl PmbdError {
    /// Whether this error is fatal for the process.
    ///
    /// Fatal errors indicate the backing memory can no longer be trusted;
    /// callers must not attempt to continue serving requests past one.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::WriteVerificationFailed { .. } | Self::InternalInvariant(_)
        )
    }
}

/// Result alias using `PmbdError`.
pub type Result<T> = std::result::Result<T, PmbdError>;
