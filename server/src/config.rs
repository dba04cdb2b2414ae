use std::path::PathBuf;

use ota_patch::PatchOptions;

use crate::coordinator::CoordinatorConfig;
use crate::generator::GeneratorConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub bind: String,
    pub port: u16,
    pub chunk_size: u32,
    pub max_patch_size: u64,
    pub compression_level: u32,
    pub confirm_grace_secs: i64,
    pub patch_cache_size: usize,
    pub admin_key: String,
    pub device_tokens: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let generator = GeneratorConfig::default();
        Self {
            data_dir: PathBuf::from("/var/lib/delta-ota"),
            bind: "0.0.0.0".to_string(),
            port: 8080,
            chunk_size: generator.chunk_size,
            max_patch_size: generator.max_patch_size,
            compression_level: generator.options.level,
            confirm_grace_secs: 86400,
            patch_cache_size: 16,
            admin_key: String::new(),
            device_tokens: None,
        }
    }
}

impl ServerConfig {
    pub fn generator(&self) -> GeneratorConfig {
        GeneratorConfig {
            chunk_size: self.chunk_size.max(1),
            max_patch_size: self.max_patch_size,
            options: PatchOptions {
                level: self.compression_level.min(9),
                ..PatchOptions::default()
            },
        }
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            confirm_grace: chrono::Duration::seconds(self.confirm_grace_secs.max(0)),
        }
    }
}
