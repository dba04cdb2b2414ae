use std::sync::Arc;

use ota_schema::{ChunkResponse, PatchId, PatchMetadata};

use crate::patches::{CatalogError, PatchCatalog};

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("patch {0} not found")]
    NotFound(PatchId),
    #[error("chunk {index} out of range, patch has {chunk_count} chunks")]
    OutOfRange { index: u32, chunk_count: u32 },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Stateless read path: every call is answered from the patch id and the
/// index alone.
pub struct ChunkServer {
    catalog: Arc<PatchCatalog>,
}

impl ChunkServer {
    pub fn new(catalog: Arc<PatchCatalog>) -> Self {
        Self { catalog }
    }

    pub async fn get_chunk(
        &self,
        id: &PatchId,
        index: u32,
    ) -> Result<(PatchMetadata, ChunkResponse), ChunkError> {
        let metadata = self
            .catalog
            .metadata(id)
            .await
            .ok_or_else(|| ChunkError::NotFound(id.clone()))?;
        let range = metadata
            .chunk_range(index)
            .ok_or(ChunkError::OutOfRange {
                index,
                chunk_count: metadata.chunk_count,
            })?;

        let bytes = self.catalog.bytes(id).await?;
        let payload = bytes
            .get(range)
            .ok_or_else(|| CatalogError::Corrupt(id.clone()))?
            .to_vec();
        log::trace!(
            "Serving chunk {}/{} of {} ({} bytes)",
            index,
            metadata.chunk_count,
            id,
            payload.len()
        );
        Ok((metadata, ChunkResponse::new(index, payload)))
    }
}
