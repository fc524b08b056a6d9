//! Engine error type and its mapping onto caller-facing kinds.

use std::io;
use std::path::PathBuf;

use config::ConfigError;
use sstable::SstError;
use thiserror::Error;
use wal::WalError;

use crate::EngineState;

/// Coarse classification of an [`EngineError`].
///
/// Outer surfaces (the HTTP gateway) map these onto status codes; a missing
/// key is not an error at all and comes back as `Ok(None)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller sent something the engine refuses (empty key, oversize value).
    InvalidRequest,
    /// Reading or writing the data directory failed.
    Io,
    /// A segment failed its checksums or structural checks.
    CorruptSegment,
    /// The engine is not in the `Serving` state.
    Unavailable,
    /// Anything else: bad manifest, exhausted sequence space, misconfiguration.
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Sst(#[from] SstError),

    #[error("engine is {0}")]
    Unavailable(EngineState),

    #[error("data directory {} is locked by another process", .0.display())]
    Locked(PathBuf),

    #[error("manifest: {0}")]
    Manifest(String),

    #[error("sequence numbers exhausted")]
    SeqOverflow,
}

impl EngineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidRequest,
            Self::Io(_) | Self::Wal(WalError::Io(_)) | Self::Sst(SstError::Io(_)) => ErrorKind::Io,
            Self::Sst(SstError::Corrupt { .. }) => ErrorKind::CorruptSegment,
            Self::Unavailable(_) | Self::Locked(_) => ErrorKind::Unavailable,
            Self::Config(_)
            | Self::Wal(_)
            | Self::Sst(_)
            | Self::Manifest(_)
            | Self::SeqOverflow => ErrorKind::Internal,
        }
    }

    /// Plain I/O failures are worth retrying; everything else is not.
    pub(crate) fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Io
    }
}
