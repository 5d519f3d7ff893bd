//! SegVault Backup Daemon
//!
//! Opens (or creates) the frame store, re-inventories replicas left on
//! storage by a previous process, and then drives the garbage-collection
//! queue. The RPC transport dispatches into the service from its own
//! threads; this binary owns everything that is not request-driven.

use anyhow::Result;
use clap::Parser;
use segvault_backup::BackupService;
use segvault_backup::cluster::{NullMasterClient, NullMembership};
use segvault_common::config::{BackendKind, BackupConfig};
use segvault_storage::{FileStore, FrameStore, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "segvault-backupd")]
#[command(about = "SegVault backup daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/segvault/backup.toml")]
    config: String,

    /// Cluster name (overrides the config file)
    #[arg(long)]
    cluster: Option<String>,

    /// Path of the storage file (overrides the config file)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Number of storage frames (overrides the config file)
    #[arg(long)]
    frames: Option<u32>,

    /// Segment size in bytes (overrides the config file)
    #[arg(long)]
    segment_size: Option<u32>,

    /// Hold replicas in memory instead of on stable storage
    #[arg(long)]
    in_memory: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config: BackupConfig = if std::path::Path::new(&args.config).exists() {
        let raw = std::fs::read_to_string(&args.config)?;
        toml::from_str(&raw)?
    } else {
        BackupConfig::default()
    };

    // CLI arguments win over the config file.
    if let Some(cluster) = args.cluster {
        config.cluster.name = cluster;
    }
    if let Some(file) = args.file {
        config.storage.file = file;
    }
    if let Some(frames) = args.frames {
        config.storage.frame_count = frames;
    }
    if let Some(segment_size) = args.segment_size {
        config.storage.segment_size = segment_size;
    }
    if args.in_memory {
        config.storage.backend = BackendKind::Memory;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting segvault backup daemon");
    info!(
        cluster = %config.cluster.name,
        segment_size = config.storage.segment_size,
        frames = config.storage.frame_count,
        sync = config.io.sync,
        gc = config.gc.enabled,
        "configuration"
    );

    let store: Arc<dyn FrameStore> = match config.storage.backend {
        BackendKind::File => {
            info!(file = %config.storage.file.display(), "opening file store");
            if let Some(parent) = config.storage.file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(FileStore::open(
                &config.storage.file,
                &config.cluster.name,
                config.storage.segment_size,
                config.storage.frame_count,
                config.io.sync,
            )?)
        }
        BackendKind::Memory => {
            info!("using in-memory store; replicas will not survive a restart");
            Arc::new(MemoryStore::new(
                &config.cluster.name,
                config.storage.segment_size,
                config.storage.frame_count,
            ))
        }
    };

    // TODO: replace the null cluster interfaces once the transport layer
    // wires up the coordinator's membership feed and master sessions.
    let service = Arc::new(BackupService::new(
        store,
        &config,
        Arc::new(NullMembership),
        Arc::new(NullMasterClient),
    ));

    let found = service.restart_from_storage()?;
    info!(replicas = found, "restart inventory complete");

    // Housekeeping loop: advance the GC queue one step at a time, backing
    // off while it is empty.
    loop {
        if !service.perform_gc_task() {
            std::thread::sleep(Duration::from_millis(200));
        }
    }
}
