use crate::block::codec::BlockCodecError;
use crate::block::keys::KeyTableError;
use crate::fec::FecError;
use crate::raf::RafError;
use thiserror::Error;

/// Umbrella error for the public storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Raf(#[from] RafError),
    #[error(transparent)]
    Keys(#[from] KeyTableError),
    #[error(transparent)]
    Codec(#[from] BlockCodecError),
    #[error(transparent)]
    Fec(#[from] FecError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("segment {segment} has not decoded yet")]
    SegmentIncomplete { segment: usize },
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// True if the error came from the backing file rather than from block
    /// contents; such errors poison the whole splitfile.
    pub fn is_disk_error(&self) -> bool {
        matches!(self, StoreError::Raf(_))
    }
}
