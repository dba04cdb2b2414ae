use chrono::{DateTime, Utc};
use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// Chunk size used when none is configured.
pub const DEFAULT_CHUNK_SIZE: u32 = 512;

const CHUNK_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 of a chunk payload, carried alongside every served chunk.
pub fn chunk_checksum(payload: &[u8]) -> u32 {
    CHUNK_CRC.checksum(payload)
}

/// SHA-256 of `data`, hex encoded.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Incremental form of [`content_hash`].
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

pub fn chunk_count(size: u64, chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    ((size + chunk_size as u64 - 1) / chunk_size as u64) as u32
}

/// Version strings end up in URLs and file names, so only a conservative
/// character set is accepted and ".." is reserved as the patch id separator.
pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= 64
        && !version.contains("..")
        && !version.starts_with('.')
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PatchId(String);

impl PatchId {
    pub fn new(from: &str, to: &str) -> Self {
        Self(format!("{}..{}", from, to))
    }

    pub fn versions(&self) -> Option<(&str, &str)> {
        let (from, to) = self.0.split_once("..")?;
        if is_valid_version(from) && is_valid_version(to) {
            Some((from, to))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPatchId(pub String);

impl fmt::Display for InvalidPatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid patch id '{}'", self.0)
    }
}

impl std::error::Error for InvalidPatchId {}

impl FromStr for PatchId {
    type Err = InvalidPatchId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = PatchId(s.to_string());
        if id.versions().is_some() {
            Ok(id)
        } else {
            Err(InvalidPatchId(s.to_string()))
        }
    }
}

/// A registered firmware build. Immutable once created, apart from the
/// `is_current` flag which the registry maintains.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FirmwareVersion {
    pub version: String,
    pub size: u64,
    pub hash: String,
    #[serde(default)]
    pub is_current: bool,
    pub registered: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    #[serde(rename = "zlib")]
    Zlib,
}

impl Default for Compression {
    fn default() -> Self {
        Self::Zlib
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PatchMetadata {
    pub id: PatchId,
    pub from_version: String,
    pub to_version: String,
    pub size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    #[serde(default)]
    pub compression: Compression,
    pub hash: String,
    pub created: DateTime<Utc>,
}

impl PatchMetadata {
    /// Byte range of chunk `index` within the patch, `None` when out of range.
    /// The last chunk may be short.
    pub fn chunk_range(&self, index: u32) -> Option<Range<usize>> {
        if index >= self.chunk_count {
            return None;
        }
        let start = index as u64 * self.chunk_size as u64;
        let end = core::cmp::min(start + self.chunk_size as u64, self.size);
        Some(start as usize..end as usize)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckRequest {
    pub current_version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckResponse {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_id: Option<PatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_hash: Option<String>,
}

impl CheckResponse {
    pub fn up_to_date() -> Self {
        Self {
            available: false,
            patch_id: None,
            target_version: None,
            chunk_count: None,
            chunk_size: None,
            patch_size: None,
            patch_hash: None,
        }
    }

    pub fn update(patch: &PatchMetadata) -> Self {
        Self {
            available: true,
            patch_id: Some(patch.id.clone()),
            target_version: Some(patch.to_version.clone()),
            chunk_count: Some(patch.chunk_count),
            chunk_size: Some(patch.chunk_size),
            patch_size: Some(patch.size),
            patch_hash: Some(patch.hash.clone()),
        }
    }

    /// The offered update, if the response carries a complete one.
    pub fn offer(&self) -> Option<UpdateOffer> {
        if !self.available {
            return None;
        }
        Some(UpdateOffer {
            patch_id: self.patch_id.clone()?,
            target_version: self.target_version.clone()?,
            chunk_count: self.chunk_count?,
            chunk_size: self.chunk_size?,
            patch_size: self.patch_size?,
            patch_hash: self.patch_hash.clone()?,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UpdateOffer {
    pub patch_id: PatchId,
    pub target_version: String,
    pub chunk_count: u32,
    pub chunk_size: u32,
    pub patch_size: u64,
    pub patch_hash: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChunkResponse {
    pub index: u32,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl ChunkResponse {
    pub fn new(index: u32, payload: Vec<u8>) -> Self {
        let checksum = chunk_checksum(&payload);
        Self {
            index,
            payload,
            checksum,
        }
    }

    pub fn is_valid(&self) -> bool {
        chunk_checksum(&self.payload) == self.checksum
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutcomeReport {
    pub patch_id: PatchId,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub version: String,
}

/// Server side view of a device/patch pair.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OtaState {
    None,
    Checking,
    Downloading,
    Applying,
    PendingConfirm,
    Confirmed,
    RolledBack,
}

impl OtaState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::RolledBack)
    }
}

impl Default for OtaState {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceOtaProgress {
    pub device_id: String,
    pub patch_id: PatchId,
    pub state: OtaState,
    pub next_expected_chunk_index: u32,
    pub bytes_written: u64,
    pub consecutive_failure_count: u32,
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct FleetStatus {
    pub devices: Vec<DeviceOtaProgress>,
    pub counts: std::collections::BTreeMap<OtaState, usize>,
}
