use std::collections::BTreeMap;
use std::sync::Arc;

use lru::LruCache;
use ota_schema::{content_hash, PatchId, PatchMetadata};
use tokio::sync::{Mutex, RwLock};

use crate::generator::{GeneratorError, PatchGenerator};
use crate::registry::{FirmwareRegistry, RegistryError};
use crate::store::{ArtifactStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("patch {0} not found")]
    NotFound(PatchId),
    #[error("stored patch {0} does not match its hash")]
    Corrupt(PatchId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("patch generation task failed")]
    Task(#[from] tokio::task::JoinError),
}

/// Known patches, generation on demand and a cache of patch bytes for the
/// chunk read path.
pub struct PatchCatalog {
    store: Arc<dyn ArtifactStore>,
    registry: Arc<FirmwareRegistry>,
    generator: PatchGenerator,
    patches: RwLock<BTreeMap<PatchId, PatchMetadata>>,
    // Cached by patch id, entries are immutable
    cache: Mutex<LruCache<PatchId, Arc<Vec<u8>>>>,
    // Serialises generation so concurrent checks produce one patch
    generating: Mutex<()>,
}

impl PatchCatalog {
    pub async fn open(
        store: Arc<dyn ArtifactStore>,
        registry: Arc<FirmwareRegistry>,
        generator: PatchGenerator,
        cache_size: usize,
    ) -> Result<Self, CatalogError> {
        let mut patches = BTreeMap::new();
        for patch in store.load_patches().await? {
            patches.insert(patch.id.clone(), patch);
        }
        log::info!("Patch catalog opened with {} patches", patches.len());
        Ok(Self {
            store,
            registry,
            generator,
            patches: RwLock::new(patches),
            cache: Mutex::new(LruCache::new(cache_size.max(1))),
            generating: Mutex::new(()),
        })
    }

    pub async fn metadata(&self, id: &PatchId) -> Option<PatchMetadata> {
        self.patches.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<PatchMetadata> {
        self.patches.read().await.values().cloned().collect()
    }

    /// Existing patch between the two versions, generated and stored first
    /// if needed.
    pub async fn find_or_generate(&self, from: &str, to: &str) -> Result<PatchMetadata, CatalogError> {
        let id = PatchId::new(from, to);
        if let Some(patch) = self.metadata(&id).await {
            return Ok(patch);
        }

        let _guard = self.generating.lock().await;
        if let Some(patch) = self.metadata(&id).await {
            return Ok(patch);
        }

        let from = self.registry.get(from).await?;
        let to = self.registry.get(to).await?;
        let from_binary = self.registry.binary(&from.version).await?;
        let to_binary = self.registry.binary(&to.version).await?;

        log::info!("Generating patch {}", id);
        let generator = self.generator.clone();
        let (metadata, bytes) = tokio::task::spawn_blocking(move || {
            generator.generate(&from, &from_binary, &to, &to_binary)
        })
        .await??;

        self.store.put_patch(&metadata, &bytes).await?;
        self.cache
            .lock()
            .await
            .put(metadata.id.clone(), Arc::new(bytes));
        self.patches
            .write()
            .await
            .insert(metadata.id.clone(), metadata.clone());
        Ok(metadata)
    }

    /// Complete patch bytes, served from the cache when possible.
    pub async fn bytes(&self, id: &PatchId) -> Result<Arc<Vec<u8>>, CatalogError> {
        if let Some(bytes) = self.cache.lock().await.get(id) {
            log::trace!("Found patch cache entry for {}", id);
            return Ok(bytes.clone());
        }

        let metadata = self
            .metadata(id)
            .await
            .ok_or_else(|| CatalogError::NotFound(id.clone()))?;
        log::debug!("Loading patch {} from storage", id);
        let bytes = self
            .store
            .fetch_patch(id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(id.clone()))?;
        if content_hash(&bytes) != metadata.hash {
            log::warn!("Stored patch {} does not match its hash", id);
            return Err(CatalogError::Corrupt(id.clone()));
        }
        let bytes = Arc::new(bytes);
        self.cache.lock().await.put(id.clone(), bytes.clone());
        Ok(bytes)
    }
}
