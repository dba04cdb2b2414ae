use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use ota_schema::{content_hash, is_valid_version, FirmwareVersion};
use tokio::sync::RwLock;

use crate::store::{ArtifactStore, CurrentRecord, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("firmware version {0} not found")]
    NotFound(String),
    #[error("firmware version {0} already registered with different content")]
    DuplicateVersion(String),
    #[error("invalid firmware version '{0}'")]
    InvalidVersion(String),
    #[error("no current firmware version")]
    NoCurrentVersion,
    #[error("firmware {0} is registered but its binary is missing")]
    MissingBinary(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

struct Catalog {
    versions: BTreeMap<String, FirmwareVersion>,
    current: Option<CurrentRecord>,
}

/// Catalog of known firmware builds and the one devices should run.
///
/// The current version lives in one versioned record rather than in a flag
/// per build; `is_current` on returned values is derived from it, so at
/// most one build can ever be reported as current.
pub struct FirmwareRegistry {
    store: Arc<dyn ArtifactStore>,
    catalog: RwLock<Catalog>,
}

impl FirmwareRegistry {
    pub async fn open(store: Arc<dyn ArtifactStore>) -> Result<Self, RegistryError> {
        let mut versions = BTreeMap::new();
        for mut firmware in store.load_firmware().await? {
            firmware.is_current = false;
            versions.insert(firmware.version.clone(), firmware);
        }
        let current = store.load_current().await?;
        if let Some(current) = &current {
            if !versions.contains_key(&current.version) {
                log::warn!(
                    "Current record names unknown version {}, ignoring",
                    current.version
                );
            }
        }
        log::info!(
            "Firmware registry opened with {} versions, current {:?}",
            versions.len(),
            current.as_ref().map(|c| &c.version)
        );
        Ok(Self {
            store,
            catalog: RwLock::new(Catalog { versions, current }),
        })
    }

    /// Registers a build. Re-registering identical content is a no-op apart
    /// from `make_current`. The first build ever registered becomes current
    /// regardless of `make_current`.
    pub async fn register(
        &self,
        version: &str,
        binary: &[u8],
        make_current: bool,
    ) -> Result<FirmwareVersion, RegistryError> {
        if !is_valid_version(version) {
            return Err(RegistryError::InvalidVersion(version.to_string()));
        }
        let hash = content_hash(binary);

        let mut catalog = self.catalog.write().await;
        match catalog.versions.get(version) {
            Some(existing) if existing.hash != hash => {
                return Err(RegistryError::DuplicateVersion(version.to_string()));
            }
            Some(_) => {
                log::debug!("Firmware {} already registered", version);
            }
            None => {
                let firmware = FirmwareVersion {
                    version: version.to_string(),
                    size: binary.len() as u64,
                    hash,
                    is_current: false,
                    registered: Utc::now(),
                };
                self.store.put_firmware(&firmware, binary).await?;
                log::info!(
                    "Registered firmware {} ({} bytes, {})",
                    version,
                    firmware.size,
                    firmware.hash
                );
                catalog.versions.insert(version.to_string(), firmware);
            }
        }

        let needs_current = match &catalog.current {
            Some(current) => {
                (make_current && current.version != version)
                    || !catalog.versions.contains_key(&current.version)
            }
            None => true,
        };
        if needs_current {
            let record = CurrentRecord {
                version: version.to_string(),
                generation: catalog.current.as_ref().map(|c| c.generation).unwrap_or(0) + 1,
                updated: Utc::now(),
            };
            self.store.store_current(&record).await?;
            log::info!(
                "Current firmware is now {} (generation {})",
                record.version,
                record.generation
            );
            catalog.current = Some(record);
        }

        Self::view(&catalog, version)
    }

    pub async fn get(&self, version: &str) -> Result<FirmwareVersion, RegistryError> {
        Self::view(&*self.catalog.read().await, version)
    }

    pub async fn get_current(&self) -> Result<FirmwareVersion, RegistryError> {
        let catalog = self.catalog.read().await;
        let current = catalog
            .current
            .as_ref()
            .ok_or(RegistryError::NoCurrentVersion)?;
        Self::view(&catalog, &current.version).map_err(|_| RegistryError::NoCurrentVersion)
    }

    pub async fn current_record(&self) -> Option<CurrentRecord> {
        self.catalog.read().await.current.clone()
    }

    pub async fn list(&self) -> Vec<FirmwareVersion> {
        let catalog = self.catalog.read().await;
        catalog
            .versions
            .keys()
            .filter_map(|v| Self::view(&catalog, v).ok())
            .collect()
    }

    /// Binary of a registered version, checked against its registered hash.
    pub async fn binary(&self, version: &str) -> Result<Vec<u8>, RegistryError> {
        let firmware = self.get(version).await?;
        let binary = self
            .store
            .fetch_firmware(version)
            .await?
            .ok_or_else(|| RegistryError::MissingBinary(version.to_string()))?;
        if content_hash(&binary) != firmware.hash {
            log::warn!("Stored binary for {} does not match its hash", version);
            return Err(RegistryError::MissingBinary(version.to_string()));
        }
        Ok(binary)
    }

    fn view(catalog: &Catalog, version: &str) -> Result<FirmwareVersion, RegistryError> {
        let mut firmware = catalog
            .versions
            .get(version)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(version.to_string()))?;
        firmware.is_current = catalog
            .current
            .as_ref()
            .map(|c| c.version == version)
            .unwrap_or(false);
        Ok(firmware)
    }
}
