use std::io;

use ota_patch::PatchError;
use ota_schema::PatchId;

use crate::boot::BootError;
use crate::progress::ProgressError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum OtaError {
    /// The server no longer knows the patch or chunk.
    #[error("{0} not found on server")]
    NotFound(String),
    #[error("chunk {index} failed verification {attempts} times")]
    ChecksumMismatch { index: u32, attempts: u32 },
    #[error("downloaded patch does not match its hash")]
    PatchHashMismatch,
    #[error("applying patch failed: {0}")]
    ApplyFailure(#[from] PatchError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("flash: {0}")]
    Storage(#[from] io::Error),
    #[error("progress store: {0}")]
    Progress(#[from] ProgressError),
    #[error("boot control: {0}")]
    Boot(#[from] BootError),
    #[error("patch {0} abandoned after repeated failures")]
    Abandoned(PatchId),
}

impl OtaError {
    /// Whether a failed attempt must throw away what was downloaded.
    pub fn discards_download(&self) -> bool {
        matches!(self, OtaError::PatchHashMismatch | OtaError::ApplyFailure(_))
    }
}
