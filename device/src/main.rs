use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use delta_ota_device::{
    AgentConfig, FileBoot, FilePartition, FileProgressStore, HttpTransport, OtaAgent,
    PartitionHandle, SliceOutcome, SlotImage, Slots,
};

/// Simulated device: partitions, boot record and progress live in a state
/// directory, so killing the process is a power loss.
#[derive(Parser, Debug)]
struct Args {
    /// Base URL of the update server
    #[clap(long, default_value = "http://localhost:8080")]
    server: String,

    #[clap(long)]
    device_id: String,

    /// Bearer token identifying this device
    #[clap(long)]
    token: String,

    #[clap(long, default_value = "device-state")]
    state_dir: PathBuf,

    /// Image flashed into slot A when the state directory is new
    #[clap(long)]
    initial_image: Option<PathBuf>,

    #[clap(long, default_value = "1.0.0")]
    initial_version: String,

    #[clap(long, default_value_t = 30)]
    chunk_timeout_secs: u64,

    #[clap(long, default_value_t = 3)]
    max_chunk_retries: u32,

    #[clap(long, default_value_t = 3)]
    max_patch_failures: u32,

    /// Chunks fetched before the radio is handed back
    #[clap(long, default_value_t = 16)]
    chunks_per_slice: u32,

    /// Seconds between heartbeats while idle
    #[clap(long, default_value_t = 10)]
    interval_secs: u64,

    /// Size of each partition in bytes
    #[clap(long, default_value_t = 1024 * 1024)]
    partition_size: u64,
}

impl Args {
    fn agent_config(&self) -> AgentConfig {
        AgentConfig::default()
            .set_max_chunk_retries(self.max_chunk_retries)
            .set_max_patch_failures(self.max_patch_failures)
            .set_chunks_per_slice(self.chunks_per_slice)
            .set_chunk_timeout(Duration::from_secs(self.chunk_timeout_secs))
    }
}

fn partition(dir: &Path, name: &str, size: u64) -> anyhow::Result<PartitionHandle> {
    let path = dir.join(name);
    let partition =
        FilePartition::open(&path, size).with_context(|| format!("opening {:?}", path))?;
    Ok(PartitionHandle::new(partition))
}

/// Opens the boot record, provisioning slot A on first start.
fn provision(args: &Args, slots: &Slots) -> anyhow::Result<FileBoot> {
    let path = args.state_dir.join("boot.json");
    let mut initial = SlotImage {
        version: args.initial_version.clone(),
        len: 0,
    };
    if !path.exists() {
        let image_path = args
            .initial_image
            .as_ref()
            .context("--initial-image is required for a new state directory")?;
        let image = std::fs::read(image_path)
            .with_context(|| format!("reading initial image {:?}", image_path))?;
        slots.a.write_at(0, &image)?;
        slots.a.sync()?;
        initial.len = image.len() as u64;
        log::info!(
            "Provisioned slot A with {} ({} bytes)",
            initial.version,
            initial.len
        );
    }
    let (boot, _) = FileBoot::open(&path, initial)?;
    Ok(boot)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.state_dir)
        .with_context(|| format!("creating state directory {:?}", args.state_dir))?;
    let slots = Slots {
        a: partition(&args.state_dir, "slot-a.bin", args.partition_size)?,
        b: partition(&args.state_dir, "slot-b.bin", args.partition_size)?,
        staging: partition(&args.state_dir, "staging.bin", args.partition_size)?,
    };
    let boot = provision(&args, &slots)?;
    let transport = HttpTransport::new(
        &args.server,
        &args.device_id,
        &args.token,
        Duration::from_secs(args.chunk_timeout_secs),
    )?;
    let idle = Duration::from_secs(args.interval_secs);

    loop {
        let record = boot.power_on()?;
        log::info!("Booted slot {:?} ({:?})", record.active, record.mode());

        let mut agent = OtaAgent::start(
            transport.clone(),
            boot.clone(),
            FileProgressStore::new(&args.state_dir.join("progress.bin")),
            slots.clone(),
            args.agent_config(),
        )
        .await?;
        log::info!("Running firmware {}", agent.current_version()?);

        // The heartbeat answer doubles as the update check, and a running
        // download needs neither.
        let mut downloading = false;
        loop {
            if !downloading {
                if let Err(e) = agent.heartbeat().await {
                    log::warn!("Heartbeat failed: {}", e);
                }
            }
            downloading = false;
            match agent.run_slice().await {
                Ok(SliceOutcome::RebootRequired) => break,
                Ok(SliceOutcome::InProgress { next, chunk_count }) => {
                    log::info!("Downloaded {}/{} chunks", next, chunk_count);
                    downloading = true;
                    continue;
                }
                Ok(outcome) => log::debug!("Slice finished: {:?}", outcome),
                Err(e) => log::warn!("Update attempt failed: {}", e),
            }
            tokio::time::sleep(idle).await;
        }
        log::info!("Resetting into new firmware");
    }
}
