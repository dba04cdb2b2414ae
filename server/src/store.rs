use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ota_schema::{FirmwareVersion, PatchId, PatchMetadata};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// The single record naming the current firmware. `generation` grows by one
/// on every change so readers can tell records apart.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CurrentRecord {
    pub version: String,
    pub generation: u64,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage i/o")]
    Io(#[from] io::Error),
    #[error("corrupt metadata")]
    Encoding(#[from] serde_json::Error),
}

/// Persistence for firmware binaries, patches and the current record.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn load_firmware(&self) -> Result<Vec<FirmwareVersion>, StoreError>;

    async fn put_firmware(
        &self,
        metadata: &FirmwareVersion,
        binary: &[u8],
    ) -> Result<(), StoreError>;

    async fn fetch_firmware(&self, version: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn load_current(&self) -> Result<Option<CurrentRecord>, StoreError>;

    async fn store_current(&self, record: &CurrentRecord) -> Result<(), StoreError>;

    async fn load_patches(&self) -> Result<Vec<PatchMetadata>, StoreError>;

    async fn put_patch(&self, metadata: &PatchMetadata, patch: &[u8]) -> Result<(), StoreError>;

    async fn fetch_patch(&self, id: &PatchId) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Directory backed store:
///
/// ```text
/// <root>/current.json
/// <root>/firmware/<version>.json + <version>.bin
/// <root>/patches/<from>..<to>.json + <from>..<to>.bin
/// ```
///
/// Payloads are written before their metadata and every file goes through
/// a temporary name and a rename, so a crash never leaves metadata that
/// points at a missing or partial payload.
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub async fn open(root: &Path) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(root.join("firmware")).await?;
        tokio::fs::create_dir_all(root.join("patches")).await?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn firmware_path(&self, version: &str, ext: &str) -> PathBuf {
        self.root.join("firmware").join(format!("{}.{}", version, ext))
    }

    fn patch_path(&self, id: &PatchId, ext: &str) -> PathBuf {
        self.root.join("patches").join(format!("{}.{}", id, ext))
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        let file = tokio::fs::File::open(&tmp).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_json_dir<T: serde::de::DeserializeOwned>(
        dir: &Path,
    ) -> Result<Vec<T>, StoreError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            log::debug!("Loading metadata from {:?}", path);
            let data = tokio::fs::read(&path).await?;
            items.push(serde_json::from_slice(&data)?);
        }
        Ok(items)
    }
}

#[async_trait::async_trait]
impl ArtifactStore for DirectoryStore {
    async fn load_firmware(&self) -> Result<Vec<FirmwareVersion>, StoreError> {
        Self::load_json_dir(&self.root.join("firmware")).await
    }

    async fn put_firmware(
        &self,
        metadata: &FirmwareVersion,
        binary: &[u8],
    ) -> Result<(), StoreError> {
        Self::write_atomic(&self.firmware_path(&metadata.version, "bin"), binary).await?;
        let json = serde_json::to_vec_pretty(metadata)?;
        Self::write_atomic(&self.firmware_path(&metadata.version, "json"), &json).await
    }

    async fn fetch_firmware(&self, version: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Self::read_optional(&self.firmware_path(version, "bin")).await
    }

    async fn load_current(&self) -> Result<Option<CurrentRecord>, StoreError> {
        match Self::read_optional(&self.root.join("current.json")).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn store_current(&self, record: &CurrentRecord) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(record)?;
        Self::write_atomic(&self.root.join("current.json"), &json).await
    }

    async fn load_patches(&self) -> Result<Vec<PatchMetadata>, StoreError> {
        Self::load_json_dir(&self.root.join("patches")).await
    }

    async fn put_patch(&self, metadata: &PatchMetadata, patch: &[u8]) -> Result<(), StoreError> {
        Self::write_atomic(&self.patch_path(&metadata.id, "bin"), patch).await?;
        let json = serde_json::to_vec_pretty(metadata)?;
        Self::write_atomic(&self.patch_path(&metadata.id, "json"), &json).await
    }

    async fn fetch_patch(&self, id: &PatchId) -> Result<Option<Vec<u8>>, StoreError> {
        Self::read_optional(&self.patch_path(id, "bin")).await
    }
}

/// Volatile store for tests and simulations.
#[derive(Default)]
pub struct MemoryStore {
    firmware: Mutex<HashMap<String, (FirmwareVersion, Vec<u8>)>>,
    patches: Mutex<HashMap<PatchId, (PatchMetadata, Vec<u8>)>>,
    current: Mutex<Option<CurrentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for MemoryStore {
    async fn load_firmware(&self) -> Result<Vec<FirmwareVersion>, StoreError> {
        Ok(self
            .firmware
            .lock()
            .await
            .values()
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn put_firmware(
        &self,
        metadata: &FirmwareVersion,
        binary: &[u8],
    ) -> Result<(), StoreError> {
        self.firmware.lock().await.insert(
            metadata.version.clone(),
            (metadata.clone(), binary.to_vec()),
        );
        Ok(())
    }

    async fn fetch_firmware(&self, version: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .firmware
            .lock()
            .await
            .get(version)
            .map(|(_, b)| b.clone()))
    }

    async fn load_current(&self) -> Result<Option<CurrentRecord>, StoreError> {
        Ok(self.current.lock().await.clone())
    }

    async fn store_current(&self, record: &CurrentRecord) -> Result<(), StoreError> {
        *self.current.lock().await = Some(record.clone());
        Ok(())
    }

    async fn load_patches(&self) -> Result<Vec<PatchMetadata>, StoreError> {
        Ok(self
            .patches
            .lock()
            .await
            .values()
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn put_patch(&self, metadata: &PatchMetadata, patch: &[u8]) -> Result<(), StoreError> {
        self.patches
            .lock()
            .await
            .insert(metadata.id.clone(), (metadata.clone(), patch.to_vec()));
        Ok(())
    }

    async fn fetch_patch(&self, id: &PatchId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.patches.lock().await.get(id).map(|(_, p)| p.clone()))
    }
}
