use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ota_schema::{chunk_checksum, OutcomeReport, PatchId, UpdateOffer};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Download state that must survive power loss. Rewritten after every
/// committed chunk, before the next chunk is requested.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PersistedProgress {
    pub patch_id: PatchId,
    pub target_version: String,
    pub chunk_count: u32,
    pub chunk_size: u32,
    pub patch_size: u64,
    pub patch_hash: String,
    pub next_expected_chunk_index: u32,
    pub candidate_partition_write_offset: u64,
    pub consecutive_failure_count: u32,
    pub abandoned: bool,
    /// Candidate written and marked, waiting for the reboot into it.
    pub installed: bool,
}

impl PersistedProgress {
    pub fn new(offer: &UpdateOffer) -> Self {
        Self {
            patch_id: offer.patch_id.clone(),
            target_version: offer.target_version.clone(),
            chunk_count: offer.chunk_count,
            chunk_size: offer.chunk_size,
            patch_size: offer.patch_size,
            patch_hash: offer.patch_hash.clone(),
            next_expected_chunk_index: 0,
            candidate_partition_write_offset: 0,
            consecutive_failure_count: 0,
            abandoned: false,
            installed: false,
        }
    }

    pub fn matches(&self, offer: &UpdateOffer) -> bool {
        self.patch_id == offer.patch_id
            && self.chunk_count == offer.chunk_count
            && self.chunk_size == offer.chunk_size
            && self.patch_size == offer.patch_size
            && self.patch_hash == offer.patch_hash
    }

    pub fn is_complete(&self) -> bool {
        self.next_expected_chunk_index >= self.chunk_count
    }

    /// Forgets downloaded data but keeps the failure history of the patch.
    pub fn restart(&mut self) {
        self.next_expected_chunk_index = 0;
        self.candidate_partition_write_offset = 0;
        self.installed = false;
    }

    /// Length of chunk `index`; the last one may be short.
    pub fn chunk_len(&self, index: u32) -> usize {
        let start = index as u64 * self.chunk_size as u64;
        core::cmp::min(self.chunk_size as u64, self.patch_size.saturating_sub(start)) as usize
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("progress record i/o")]
    Io(#[from] io::Error),
    #[error("encoding progress record")]
    Encoding(#[from] serde_cbor::Error),
    #[error("progress store lock poisoned")]
    Poisoned,
}

/// Durable home of the device's [`PersistedProgress`] and of the outcome
/// reports the service has not acknowledged yet. The two are kept apart:
/// clearing the progress record leaves queued reports in place.
pub trait ProgressStore: Send {
    /// `None` when nothing is stored or the stored record is damaged.
    fn load(&mut self) -> Result<Option<PersistedProgress>, ProgressError>;
    /// Returns only once the record is durable.
    fn save(&mut self, progress: &PersistedProgress) -> Result<(), ProgressError>;
    fn clear(&mut self) -> Result<(), ProgressError>;

    /// Unacknowledged reports, oldest first.
    fn load_reports(&mut self) -> Result<Vec<OutcomeReport>, ProgressError>;
    /// Replaces the queue; returns only once it is durable.
    fn save_reports(&mut self, reports: &[OutcomeReport]) -> Result<(), ProgressError>;
}

// Frame: crc32 (LE) of body, body length (LE), CBOR body
const FRAME_HEADER: usize = 8;

pub fn encode<T: Serialize + ?Sized>(record: &T) -> Result<Vec<u8>, ProgressError> {
    let body = serde_cbor::to_vec(&record)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + body.len());
    frame.extend_from_slice(&chunk_checksum(&body).to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Option<T> {
    if frame.len() < FRAME_HEADER {
        return None;
    }
    let crc = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    let body = frame.get(FRAME_HEADER..FRAME_HEADER + len)?;
    if chunk_checksum(body) != crc {
        return None;
    }
    serde_cbor::from_slice(body).ok()
}

pub struct FileProgressStore {
    path: PathBuf,
    reports: PathBuf,
}

impl FileProgressStore {
    /// Reports queue up next to the progress record, in `<path>.outbox`.
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            reports: path.with_extension("outbox"),
        }
    }
}

fn read_frame<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ProgressError> {
    let frame = match std::fs::read(path) {
        Ok(frame) => frame,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let record = decode(&frame);
    if record.is_none() {
        log::warn!("Discarding damaged record {:?}", path);
    }
    Ok(record)
}

fn write_frame<T: Serialize + ?Sized>(path: &Path, record: &T) -> Result<(), ProgressError> {
    let frame = encode(record)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(&frame)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}

fn remove(path: &Path) -> Result<(), ProgressError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl ProgressStore for FileProgressStore {
    fn load(&mut self) -> Result<Option<PersistedProgress>, ProgressError> {
        read_frame(&self.path)
    }

    fn save(&mut self, progress: &PersistedProgress) -> Result<(), ProgressError> {
        write_frame(&self.path, progress)
    }

    fn clear(&mut self) -> Result<(), ProgressError> {
        remove(&self.path)
    }

    fn load_reports(&mut self) -> Result<Vec<OutcomeReport>, ProgressError> {
        Ok(read_frame(&self.reports)?.unwrap_or_default())
    }

    fn save_reports(&mut self, reports: &[OutcomeReport]) -> Result<(), ProgressError> {
        if reports.is_empty() {
            remove(&self.reports)
        } else {
            write_frame(&self.reports, reports)
        }
    }
}

/// Keeps the encoded frame in memory. Clones share it, so it persists
/// across simulated resets and tests can damage it.
#[derive(Clone, Default)]
pub struct MemProgressStore {
    frame: Arc<Mutex<Option<Vec<u8>>>>,
    reports: Arc<Mutex<Vec<OutcomeReport>>>,
}

impl MemProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&self) -> Option<Vec<u8>> {
        self.frame.lock().ok().and_then(|f| f.clone())
    }

    pub fn set_frame(&self, frame: Option<Vec<u8>>) {
        if let Ok(mut f) = self.frame.lock() {
            *f = frame;
        }
    }

    pub fn pending_reports(&self) -> Vec<OutcomeReport> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ProgressStore for MemProgressStore {
    fn load(&mut self) -> Result<Option<PersistedProgress>, ProgressError> {
        let frame = self.frame.lock().map_err(|_| ProgressError::Poisoned)?;
        Ok(frame.as_deref().and_then(decode))
    }

    fn save(&mut self, progress: &PersistedProgress) -> Result<(), ProgressError> {
        let encoded = encode(progress)?;
        *self.frame.lock().map_err(|_| ProgressError::Poisoned)? = Some(encoded);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), ProgressError> {
        *self.frame.lock().map_err(|_| ProgressError::Poisoned)? = None;
        Ok(())
    }

    fn load_reports(&mut self) -> Result<Vec<OutcomeReport>, ProgressError> {
        Ok(self.reports.lock().map_err(|_| ProgressError::Poisoned)?.clone())
    }

    fn save_reports(&mut self, reports: &[OutcomeReport]) -> Result<(), ProgressError> {
        *self.reports.lock().map_err(|_| ProgressError::Poisoned)? = reports.to_vec();
        Ok(())
    }
}
