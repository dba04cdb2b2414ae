use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use delta_ota_server::auth::DeviceAuthenticator;
use delta_ota_server::store::DirectoryStore;
use delta_ota_server::{configure, ServerConfig, State};

#[derive(Parser, Debug)]
struct Args {
    /// Directory holding firmware images and generated patches
    #[clap(long, default_value = "/var/lib/delta-ota")]
    data_dir: PathBuf,

    /// Address to bind the HTTP API to
    #[clap(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port for the HTTP API
    #[clap(long, default_value_t = 8080)]
    port: u16,

    /// Patch chunk size in bytes
    #[clap(long, default_value_t = 512)]
    chunk_size: u32,

    /// Largest compressed patch that will be offered, in bytes
    #[clap(long, default_value_t = 262144)]
    max_patch_size: u64,

    /// zlib compression level (0-9)
    #[clap(long, default_value_t = 9)]
    compression_level: u32,

    /// Seconds a device may take to confirm a new image before it is
    /// reported as rolled back
    #[clap(long, default_value_t = 86400)]
    confirm_grace_secs: i64,

    /// Number of patches held in memory
    #[clap(long, default_value_t = 16)]
    patch_cache_size: usize,

    /// Key required for admin endpoints
    #[clap(long)]
    admin_key: String,

    /// JSON file mapping device id to the hex SHA-256 of its token
    #[clap(long)]
    device_tokens: Option<PathBuf>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            data_dir: args.data_dir,
            bind: args.bind,
            port: args.port,
            chunk_size: args.chunk_size,
            max_patch_size: args.max_patch_size,
            compression_level: args.compression_level,
            confirm_grace_secs: args.confirm_grace_secs,
            patch_cache_size: args.patch_cache_size,
            admin_key: args.admin_key,
            device_tokens: args.device_tokens,
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config: ServerConfig = Args::parse().into();

    let devices = match &config.device_tokens {
        Some(path) => DeviceAuthenticator::load(path)?,
        None => {
            log::warn!("No device tokens configured, all device requests will be rejected");
            DeviceAuthenticator::default()
        }
    };

    let store = DirectoryStore::open(&config.data_dir)
        .await
        .with_context(|| format!("opening data directory {:?}", config.data_dir))?;
    let state = Arc::new(
        State::open(Arc::new(store), &config, devices)
            .await
            .context("loading firmware and patch catalog")?,
    );

    log::info!(
        "Delta OTA server listening on {}:{} (chunk size {}, patch ceiling {} bytes)",
        config.bind,
        config.port,
        config.chunk_size,
        config.max_patch_size
    );
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(configure)
    })
    .bind((config.bind.as_str(), config.port))?
    .run()
    .await?;
    Ok(())
}
