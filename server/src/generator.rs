use chrono::Utc;
use ota_patch::{PatchError, PatchOptions};
use ota_schema::{chunk_count, content_hash, Compression, FirmwareVersion, PatchId, PatchMetadata};

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("patch of {size} bytes exceeds the {limit} byte ceiling")]
    DiffTooLarge { size: u64, limit: u64 },
    #[error("binary for {0} does not match its registered hash")]
    CorruptInput(String),
    #[error("source and target are both {0}")]
    SameVersion(String),
    #[error("patch generation failed")]
    Patch(#[from] PatchError),
}

#[derive(Debug, Clone, Copy)]
pub struct GeneratorConfig {
    pub chunk_size: u32,
    pub max_patch_size: u64,
    pub options: PatchOptions,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            chunk_size: ota_schema::DEFAULT_CHUNK_SIZE,
            max_patch_size: 256 * 1024,
            options: PatchOptions::default(),
        }
    }
}

/// Turns two registered builds into a compressed delta patch.
#[derive(Debug, Clone)]
pub struct PatchGenerator {
    config: GeneratorConfig,
}

impl PatchGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Output bytes depend only on the two binaries and the configuration.
    /// Every patch is applied once before it is returned, so a patch that
    /// would not reproduce `to` is never published.
    pub fn generate(
        &self,
        from: &FirmwareVersion,
        from_binary: &[u8],
        to: &FirmwareVersion,
        to_binary: &[u8],
    ) -> Result<(PatchMetadata, Vec<u8>), GeneratorError> {
        if from.version == to.version {
            return Err(GeneratorError::SameVersion(from.version.clone()));
        }
        for (firmware, binary) in [(from, from_binary), (to, to_binary)] {
            if content_hash(binary) != firmware.hash {
                return Err(GeneratorError::CorruptInput(firmware.version.clone()));
            }
        }

        let patch = ota_patch::create_patch(from_binary, to_binary, &self.config.options)?;
        let size = patch.len() as u64;
        if size > self.config.max_patch_size {
            log::warn!(
                "Patch {} -> {} is {} bytes, above the {} byte ceiling",
                from.version,
                to.version,
                size,
                self.config.max_patch_size
            );
            return Err(GeneratorError::DiffTooLarge {
                size,
                limit: self.config.max_patch_size,
            });
        }

        let rebuilt = ota_patch::apply_patch(from_binary, &patch)?;
        if rebuilt != to_binary {
            return Err(GeneratorError::Patch(PatchError::TargetMismatch));
        }

        let metadata = PatchMetadata {
            id: PatchId::new(&from.version, &to.version),
            from_version: from.version.clone(),
            to_version: to.version.clone(),
            size,
            chunk_size: self.config.chunk_size,
            chunk_count: chunk_count(size, self.config.chunk_size),
            compression: Compression::Zlib,
            hash: content_hash(&patch),
            created: Utc::now(),
        };
        log::info!(
            "Generated patch {}: {} bytes in {} chunks ({} -> {} bytes)",
            metadata.id,
            metadata.size,
            metadata.chunk_count,
            from.size,
            to.size
        );
        Ok((metadata, patch))
    }
}
