use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use signal_proto::ClientEvent;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use transfer_coordinator::{
    CoordinatorConfig, DirectorySink, DownloadReport, LocalHost, PostOutcome, TransferCoordinator,
    TransferMeta,
};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "transfer-cli")]
#[command(about = "Stream files through the transfer coordinator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream a local file into a download directory
    Send(SendArgs),
    /// Decode a signaling event and show how the relay would forward it
    Signal {
        /// Event JSON, e.g. {"type":"LEAVE_ROOM","payload":{"id":"p1"}}
        json: String,
    },
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// File to stream
    pub file: PathBuf,

    /// Directory downloads are written to
    #[arg(short, long, env = "TRANSFER_OUT_DIR", default_value = ".")]
    pub out_dir: PathBuf,

    /// Bytes per posted chunk
    #[arg(short, long, env = "TRANSFER_CHUNK_SIZE", default_value_t = 64 * 1024)]
    pub chunk_size: usize,

    /// Transfer id (random when omitted)
    #[arg(long)]
    pub id: Option<String>,

    /// File name announced to the download (defaults to the source name)
    #[arg(long)]
    pub name: Option<String>,

    /// Seconds to wait for the download to be persisted after close
    #[arg(long, default_value_t = 30)]
    pub wait_secs: u64,
}

pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size.max(1) as u64)
}

pub async fn run_send(args: SendArgs) -> Result<DownloadReport> {
    let mut file = File::open(&args.file)
        .await
        .with_context(|| format!("opening {}", args.file.display()))?;
    let size = file.metadata().await?.len();
    let chunk_size = args.chunk_size.max(1);
    let name = args
        .name
        .clone()
        .or_else(|| source_name(&args.file))
        .unwrap_or_else(|| "download".to_string());
    let id = args.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = LocalHost::new(Arc::new(DirectorySink::new(&args.out_dir)));
    let mut completions = host.completions();
    let mut failures = host.failures();
    let coordinator = TransferCoordinator::open(
        CoordinatorConfig::from_env(),
        Arc::new(host.clone()),
        Arc::new(host.clone()),
    );
    coordinator.register().await?;

    let meta = TransferMeta::new(&id, &name, size, chunk_count(size, chunk_size));
    info!(id = %id, file_name = %name, size, chunk_size, "sending file");
    coordinator.start(meta)?;

    if let Err(err) = pump(&coordinator, &id, &mut file, chunk_size).await {
        coordinator.close(&id);
        host.shutdown();
        return Err(err);
    }
    coordinator.close(&id);

    let outcome = timeout(Duration::from_secs(args.wait_secs), async {
        tokio::select! {
            report = completions.recv() => report.context("download host stopped"),
            failure = failures.recv() => match failure {
                Ok(failure) => Err(anyhow!("download of {} failed: {}", failure.id, failure.reason)),
                Err(err) => Err(anyhow!("download host stopped: {err}")),
            },
        }
    })
    .await
    .map_err(|_| anyhow!("download of {id} was not persisted within {}s", args.wait_secs));
    coordinator.shutdown();
    host.shutdown();
    outcome?
}

async fn pump(
    coordinator: &TransferCoordinator,
    id: &str,
    file: &mut File,
    chunk_size: usize,
) -> Result<()> {
    let mut buf = vec![0u8; chunk_size];
    let mut index = 0u64;
    loop {
        let filled = fill(file, &mut buf).await?;
        if filled == 0 {
            return Ok(());
        }
        match coordinator
            .post(id, Bytes::copy_from_slice(&buf[..filled]))
            .await?
        {
            PostOutcome::Delivered => debug!(id, index, bytes = filled, "chunk posted"),
            other => {
                warn!(id, index, outcome = ?other, "transfer ended before the file did");
                bail!("transfer {id} stopped at chunk {index}: {other:?}");
            }
        }
        index += 1;
    }
}

/// Reads until `buf` is full or the file ends.
async fn fill(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn source_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

pub fn run_signal(json: &str) -> Result<()> {
    let event = ClientEvent::from_json(json).context("not a client signaling event")?;
    println!("event:  {}", event.name());
    if let Some(target) = event.target() {
        println!("target: {target}");
    }
    match event.into_forward() {
        Some(forward) => println!("forward: {}", forward.to_json()?),
        None => println!("forward: (handled by the relay, not forwarded)"),
    }
    Ok(())
}
