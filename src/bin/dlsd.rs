//! `[ADD]` The daemon entry point.
//!
//! The wire protocol, connection handler, and listener are out of scope
//! (spec.md §1): this binary parses configuration, initializes logging,
//! opens the store, installs a shutdown-signal handler, and exercises a
//! tiny synchronous `put`/`get-range` demo surface so the crate is runnable
//! end to end without a network stack. Bootstrap shape follows the general
//! `clap` + `tracing-subscriber` idiom used throughout the retrieved pack.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dls::config::DlsConfigBuilder;
use dls::Dls;

/// DLS — a single-node append-only log store for time-keyed records.
#[derive(Parser, Debug)]
#[command(name = "dlsd", version, about)]
struct Args {
    /// Root directory under which all channels are stored.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Path to a TOML config file overriding the defaults below.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    file_buffer_size: Option<usize>,

    #[arg(long)]
    write_buffer_size: Option<usize>,

    #[arg(long)]
    checkpoint_commit_seconds: Option<u64>,

    #[arg(long)]
    number_of_thread_workers: Option<usize>,

    #[arg(long)]
    write_flush_ms: Option<u64>,

    #[arg(long)]
    max_batch: Option<usize>,

    /// Write one demo record and print back one ranged read, then exit,
    /// instead of idling (there is no wire protocol to serve requests with).
    #[arg(long)]
    demo: bool,
}

fn load_config(args: &Args) -> Result<dls::DlsConfig, Box<dyn std::error::Error>> {
    let mut builder = match &args.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            let parsed: dls::DlsConfig = toml::from_str(&contents)?;
            DlsConfigBuilder::from_path(parsed.data_dir)
                .file_buffer_size(parsed.file_buffer_size)
                .write_buffer_size(parsed.write_buffer_size)
                .checkpoint_commit_seconds(parsed.checkpoint_commit_seconds)
                .number_of_thread_workers(parsed.number_of_thread_workers)
                .write_flush_ms(parsed.write_flush_ms)
                .max_batch(parsed.max_batch)
                .writer_lru_capacity(parsed.writer_lru_capacity)
        }
        None => DlsConfigBuilder::from_path(&args.data_dir),
    };

    if let Some(v) = args.file_buffer_size {
        builder = builder.file_buffer_size(v);
    }
    if let Some(v) = args.write_buffer_size {
        builder = builder.write_buffer_size(v);
    }
    if let Some(v) = args.checkpoint_commit_seconds {
        builder = builder.checkpoint_commit_seconds(v);
    }
    if let Some(v) = args.number_of_thread_workers {
        builder = builder.number_of_thread_workers(v);
    }
    if let Some(v) = args.write_flush_ms {
        builder = builder.write_flush_ms(v);
    }
    if let Some(v) = args.max_batch {
        builder = builder.max_batch(v);
    }

    Ok(builder.build()?)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            _ = sigint.recv() => tracing::info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    tracing::info!(data_dir = %config.data_dir.display(), "starting dlsd");

    let store = Dls::open(config).await?;

    if args.demo {
        run_demo(&store).await?;
        store.shutdown().await?;
        return Ok(());
    }

    wait_for_shutdown_signal().await;
    tracing::info!("shutting down");
    store.shutdown().await?;
    Ok(())
}

/// A tiny stand-in for the out-of-scope wire protocol: write one record and
/// read it back over its key's natural range, demonstrating the core engine
/// end to end without a connection handler.
async fn run_demo(store: &Dls) -> Result<(), Box<dyn std::error::Error>> {
    let key = 0x570e13eb00000001u64;
    store.put("demo", key, b"hello from dlsd").await?;
    store.flush().await;

    let mut iter = store.get_range("demo", key & !0xffff_ffffu64, key | 0xffff_ffffu64).await?;
    while let Some((k, v)) = iter.next().await? {
        println!("{k:016x} {}", String::from_utf8_lossy(&v));
    }
    Ok(())
}
